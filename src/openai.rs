//! Minimal OpenAI-compatible client for reading disambiguation.
//!
//! We only call chat.completions in JSON-object mode and validate the reply
//! against a strict schema before anything reaches the records.
//! Calls log model names, latencies, and response sizes (not contents).
//!
//! NOTE: We never log the API key.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::{Credentials, LlmCfg, Prompts};
use crate::error::{Error, Result};
use crate::resolver::{CharReading, DisambiguationRequest, Disambiguator};
use crate::util::{fill_template, trunc_for_log};

#[derive(Clone)]
pub struct OpenAI {
  pub client: reqwest::Client,
  pub api_key: String,
  pub base_url: String,
  pub model: String,
  pub prompts: Prompts,
}

/// Top-level reply shape. Anything else is rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DisambiguationReply {
  readings: Vec<CharReading>,
}

impl OpenAI {
  /// Build the client; the API key is mandatory.
  pub fn from_env(cfg: &LlmCfg, prompts: &Prompts) -> Result<Self> {
    let api_key = Credentials::require(Credentials::LLM_VAR)?;
    let base_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| cfg.base_url.clone());
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(cfg.timeout_secs))
      .build()?;
    Ok(Self { client, api_key, base_url, model: cfg.model.clone(), prompts: prompts.clone() })
  }

  /// JSON-object chat completion returning the raw message text.
  #[instrument(level = "info", skip(self, system, user), fields(model = %self.model))]
  async fn chat_json_text(&self, system: &str, user: &str, temperature: f32) -> Result<String> {
    let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
    let req = ChatCompletionRequest {
      model: self.model.clone(),
      messages: vec![
        ChatMessageReq { role: "system".into(), content: system.into() },
        ChatMessageReq { role: "user".into(), content: user.into() },
      ],
      temperature,
      response_format: Some(ResponseFormat { r#type: "json_object".into() }),
    };

    let start = std::time::Instant::now();
    let res = self.client.post(&url)
      .header(USER_AGENT, "hanzi-audio-prep/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&req).send().await?;

    let status = res.status();
    if !status.is_success() {
      let body = res.text().await.unwrap_or_default();
      let msg = extract_openai_error(&body).unwrap_or(body);
      if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::RateLimited(msg));
      }
      return Err(Error::Service { service: "chat", status: status.as_u16(), message: msg });
    }

    let body = parse_completion(&res.text().await?)?;
    if let Some(usage) = &body.usage {
      info!(prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, elapsed = ?start.elapsed(), "Chat usage");
    }
    body.choices.into_iter().next()
      .and_then(|c| c.message.content)
      .ok_or_else(|| Error::Malformed("chat response has no message content".into()))
  }
}

#[async_trait]
impl Disambiguator for OpenAI {
  #[instrument(level = "info", skip(self, request), fields(record_id = request.record_id, chars = request.characters.len()))]
  async fn disambiguate(&self, request: &DisambiguationRequest) -> Result<Vec<CharReading>> {
    let characters: String = request.characters.iter()
      .map(|c| c.to_string())
      .collect::<Vec<_>>()
      .join("、");
    let user = fill_template(
      &self.prompts.disambiguation_user_template,
      &[("context", &request.context), ("characters", &characters)],
    );
    let text = self.chat_json_text(&self.prompts.disambiguation_system, &user, 0.2).await?;
    debug!(target: "resolver", reply = %trunc_for_log(&text, 200), "Disambiguation reply");
    parse_reply(&text)
  }
}

/// A 2xx body that is not a chat completion is a malformed reply, not a
/// transport error.
fn parse_completion(body: &str) -> Result<ChatCompletionResponse> {
  serde_json::from_str(body)
    .map_err(|e| Error::Malformed(format!("chat response: {e}; body: {}", trunc_for_log(body, 200))))
}

/// Strict parse: wrong top-level shape or extra keys fail closed.
pub fn parse_reply(text: &str) -> Result<Vec<CharReading>> {
  serde_json::from_str::<DisambiguationReply>(text)
    .map(|r| r.readings)
    .map_err(|e| Error::Malformed(format!("disambiguation reply: {e}")))
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_format: Option<ResponseFormat>,
}
#[derive(Serialize)]
struct ChatMessageReq { role: String, content: String }
#[derive(Serialize)]
struct ResponseFormat { #[serde(rename = "type")] r#type: String }

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp { content: Option<String> }
#[derive(Deserialize)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u32>,
  #[serde(default)] completion_tokens: Option<u32>,
  #[serde(default)] total_tokens: Option<u32>,
}

/// Try to extract a clean error message from an OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  serde_json::from_str::<EWrap>(body).ok().map(|w| w.error.message)
}
