//! Speech synthesis: the external capability, retry on throttling, and
//! finalizing artifacts (download, transcode, atomic write).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::{AudioCfg, Credentials, TtsCfg};
use crate::error::{Error, Result};
use crate::retry::{retry_rate_limited, RetryPolicy};
use crate::util::write_bytes_atomic;

/// What a synthesis call hands back, normalized at the boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SynthesisOutput {
  Bytes(Vec<u8>),
  /// Audio must be fetched from this URL.
  Remote(String),
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
  async fn synthesize(&self, text: &str) -> Result<SynthesisOutput>;
}

// --- DashScope (qwen-tts) ---

pub struct DashScopeTts {
  client: reqwest::Client,
  api_key: String,
  base_url: String,
  model: String,
  voice: String,
}

impl DashScopeTts {
  pub fn from_env(cfg: &TtsCfg) -> Result<Self> {
    let api_key = Credentials::require(Credentials::TTS_VAR)?;
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(cfg.timeout_secs))
      .build()?;
    Ok(Self {
      client,
      api_key,
      base_url: cfg.base_url.trim_end_matches('/').to_string(),
      model: cfg.model.clone(),
      voice: cfg.voice.clone(),
    })
  }
}

#[derive(Serialize)]
struct TtsRequest<'a> {
  model: &'a str,
  input: TtsInput<'a>,
}
#[derive(Serialize)]
struct TtsInput<'a> { text: &'a str, voice: &'a str }

#[derive(Debug, Deserialize)]
struct TtsResponse {
  #[serde(default)] output: Option<TtsOutput>,
  #[serde(default)] code: Option<String>,
  #[serde(default)] message: Option<String>,
}
#[derive(Debug, Deserialize)]
struct TtsOutput {
  #[serde(default)] audio: Option<AudioField>,
}
/// The service returns either a bare URL or an object with url/data.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AudioField {
  Url(String),
  Object {
    #[serde(default)] url: Option<String>,
    #[serde(default)] data: Option<String>,
  },
}

fn is_throttling(status: StatusCode, code: Option<&str>) -> bool {
  status == StatusCode::TOO_MANY_REQUESTS || code.map_or(false, |c| c.starts_with("Throttling"))
}

fn normalize_response(resp: TtsResponse) -> Result<SynthesisOutput> {
  let audio = resp.output.and_then(|o| o.audio).ok_or_else(|| {
    Error::Malformed(format!(
      "tts response has no output.audio (code={:?}, message={:?})",
      resp.code, resp.message
    ))
  })?;
  match audio {
    AudioField::Url(url) if !url.trim().is_empty() => Ok(SynthesisOutput::Remote(url)),
    AudioField::Object { data: Some(data), .. } if !data.is_empty() => {
      let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.as_bytes())
        .map_err(|e| Error::Malformed(format!("tts audio data is not base64: {e}")))?;
      Ok(SynthesisOutput::Bytes(bytes))
    }
    AudioField::Object { url: Some(url), .. } if !url.trim().is_empty() => Ok(SynthesisOutput::Remote(url)),
    _ => Err(Error::Malformed("tts audio has neither url nor data".into())),
  }
}

#[async_trait]
impl SpeechSynthesizer for DashScopeTts {
  #[instrument(level = "info", skip(self, text), fields(model = %self.model, voice = %self.voice, text_len = text.len()))]
  async fn synthesize(&self, text: &str) -> Result<SynthesisOutput> {
    let url = format!("{}/services/aigc/multimodal-generation/generation", self.base_url);
    let req = TtsRequest { model: &self.model, input: TtsInput { text, voice: &self.voice } };

    let res = self.client.post(&url)
      .header(USER_AGENT, "hanzi-audio-prep/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&req).send().await?;

    let status = res.status();
    let body = res.text().await?;
    let parsed = serde_json::from_str::<TtsResponse>(&body);

    if !status.is_success() {
      let (code, message) = match &parsed {
        Ok(r) => (r.code.clone(), r.message.clone().unwrap_or_else(|| body.clone())),
        Err(_) => (None, body.clone()),
      };
      if is_throttling(status, code.as_deref()) {
        return Err(Error::RateLimited(message));
      }
      return Err(Error::Service { service: "tts", status: status.as_u16(), message });
    }

    let resp = parsed.map_err(|e| Error::Malformed(format!("tts response: {e}")))?;
    if is_throttling(status, resp.code.as_deref()) {
      return Err(Error::RateLimited(resp.message.unwrap_or_default()));
    }
    normalize_response(resp)
  }
}

/// Retry only on rate limiting; every other error returns immediately.
pub async fn synthesize_with_retry(
  speech: &dyn SpeechSynthesizer,
  text: &str,
  policy: &RetryPolicy,
) -> Result<SynthesisOutput> {
  retry_rate_limited(policy, "tts", || speech.synthesize(text)).await
}

// --- Transcode ---

#[derive(Debug, PartialEq, Eq)]
pub enum Transcoded {
  Encoded(Vec<u8>),
  /// Encoder missing; raw bytes already were the target container.
  Passthrough(Vec<u8>),
}

impl Transcoded {
  pub fn bytes(&self) -> &[u8] {
    match self {
      Transcoded::Encoded(b) | Transcoded::Passthrough(b) => b,
    }
  }
}

/// Re-encodes audio with ffmpeg to a fixed mono bitrate.
#[derive(Clone, Debug)]
pub struct Transcoder {
  pub ffmpeg: PathBuf,
  pub bitrate: String,
  pub sample_rate: u32,
}

impl From<&AudioCfg> for Transcoder {
  fn from(cfg: &AudioCfg) -> Self {
    Self { ffmpeg: cfg.ffmpeg.clone(), bitrate: cfg.bitrate.clone(), sample_rate: cfg.sample_rate }
  }
}

/// Cheap container sniffing by magic bytes.
pub fn looks_like(bytes: &[u8], extension: &str) -> bool {
  match extension {
    "mp3" => bytes.starts_with(b"ID3") || (bytes.len() > 1 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0),
    "wav" => bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE",
    "ogg" | "opus" => bytes.starts_with(b"OggS"),
    _ => false,
  }
}

impl Transcoder {
  pub async fn transcode(&self, raw: &[u8], extension: &str) -> Result<Transcoded> {
    let work = tempfile::tempdir()?;
    let input = work.path().join("input.bin");
    let output = work.path().join(format!("output.{extension}"));
    tokio::fs::write(&input, raw).await?;

    let spawned = tokio::process::Command::new(&self.ffmpeg)
      .arg("-y").arg("-loglevel").arg("error")
      .arg("-i").arg(&input)
      .arg("-ac").arg("1")
      .arg("-ar").arg(self.sample_rate.to_string())
      .arg("-b:a").arg(&self.bitrate)
      .arg(&output)
      .stdin(Stdio::null())
      .output()
      .await;

    match spawned {
      Ok(out) if out.status.success() => Ok(Transcoded::Encoded(tokio::fs::read(&output).await?)),
      Ok(out) => Err(Error::Transcode(format!(
        "ffmpeg exited with {}: {}",
        out.status,
        String::from_utf8_lossy(&out.stderr).trim()
      ))),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        if looks_like(raw, extension) {
          warn!(target: "audio", ffmpeg = %self.ffmpeg.display(), "ffmpeg not found; storing raw audio unchanged");
          Ok(Transcoded::Passthrough(raw.to_vec()))
        } else {
          Err(Error::Transcode(format!(
            "ffmpeg not found at {} and raw audio is not .{extension}",
            self.ffmpeg.display()
          )))
        }
      }
      Err(e) => Err(Error::Io(e)),
    }
  }
}

// --- Finalizing artifacts ---

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Produced {
  pub raw_bytes: u64,
  pub final_bytes: u64,
  pub transcoded: bool,
}

/// Synthesis capability plus everything needed to land a finished file.
pub struct AudioSynthesizer {
  speech: Box<dyn SpeechSynthesizer>,
  http: reqwest::Client,
  retry: RetryPolicy,
  transcoder: Transcoder,
}

impl AudioSynthesizer {
  pub fn new(speech: Box<dyn SpeechSynthesizer>, retry: RetryPolicy, transcoder: Transcoder) -> Self {
    Self { speech, http: reqwest::Client::new(), retry, transcoder }
  }

  #[instrument(level = "debug", skip(self), fields(%url))]
  async fn download(&self, url: &str) -> Result<Vec<u8>> {
    let res = self.http.get(url).send().await?;
    let status = res.status();
    if !status.is_success() {
      return Err(Error::Service { service: "audio download", status: status.as_u16(), message: url.to_string() });
    }
    Ok(res.bytes().await?.to_vec())
  }

  /// Synthesize `text` and write the finished artifact to `target`.
  pub async fn produce(&self, text: &str, target: &Path, extension: &str) -> Result<Produced> {
    let raw = match synthesize_with_retry(self.speech.as_ref(), text, &self.retry).await? {
      SynthesisOutput::Bytes(b) => b,
      SynthesisOutput::Remote(url) => self.download(&url).await?,
    };
    if raw.is_empty() {
      return Err(Error::Malformed("synthesis returned empty audio".into()));
    }
    let done = self.transcoder.transcode(&raw, extension).await?;
    write_bytes_atomic(target, done.bytes())?;
    let produced = Produced {
      raw_bytes: raw.len() as u64,
      final_bytes: done.bytes().len() as u64,
      transcoded: matches!(done, Transcoded::Encoded(_)),
    };
    debug!(target: "audio", path = %target.display(), raw = produced.raw_bytes, stored = produced.final_bytes, "Artifact written");
    Ok(produced)
  }
}
