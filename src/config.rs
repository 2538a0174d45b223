//! Loading pipeline configuration (paths, batch sizing, services, prompts) from TOML.
//!
//! Every section has defaults, so running without a config file works.
//! Credentials never live in the file; see `Credentials`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
  pub paths: PathsCfg,
  pub batch: BatchCfg,
  pub llm: LlmCfg,
  pub tts: TtsCfg,
  pub audio: AudioCfg,
  pub prompts: Prompts,
  pub feedback: FeedbackCfg,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PathsCfg {
  pub records: PathBuf,
  pub dictionary: PathBuf,
  pub audio_dir: PathBuf,
}

impl Default for PathsCfg {
  fn default() -> Self {
    Self {
      records: "data/questions.json".into(),
      dictionary: "data/pinyin_dictionary.json".into(),
      audio_dir: "public/audio".into(),
    }
  }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BatchCfg {
  pub concurrency: usize,
  pub checkpoint_every: usize,
}

impl Default for BatchCfg {
  fn default() -> Self {
    Self { concurrency: 5, checkpoint_every: 10 }
  }
}

/// OpenAI-compatible chat endpoint used for reading disambiguation.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LlmCfg {
  pub base_url: String,
  pub model: String,
  pub timeout_secs: u64,
  pub max_retries: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for LlmCfg {
  fn default() -> Self {
    Self {
      base_url: "https://api.openai.com/v1".into(),
      model: "gpt-4o-mini".into(),
      timeout_secs: 60,
      max_retries: 3,
      base_delay_ms: 2000,
      max_delay_ms: 30_000,
    }
  }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TtsCfg {
  pub base_url: String,
  pub model: String,
  pub voice: String,
  pub timeout_secs: u64,
  pub max_retries: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for TtsCfg {
  fn default() -> Self {
    Self {
      base_url: "https://dashscope.aliyuncs.com/api/v1".into(),
      model: "qwen-tts".into(),
      voice: "Cherry".into(),
      timeout_secs: 60,
      max_retries: 3,
      base_delay_ms: 1000,
      max_delay_ms: 30_000,
    }
  }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AudioCfg {
  /// Extension (and container) of stored artifacts.
  pub extension: String,
  /// Prefix written into `audioFile` references, e.g. "/audio/".
  pub public_prefix: String,
  /// What gets spoken for a character. Keys: {phrase}, {character}, {reading}.
  pub speech_template: String,
  pub ffmpeg: PathBuf,
  pub bitrate: String,
  pub sample_rate: u32,
}

impl Default for AudioCfg {
  fn default() -> Self {
    Self {
      extension: "mp3".into(),
      public_prefix: "/audio/".into(),
      speech_template: "{phrase}".into(),
      ffmpeg: "ffmpeg".into(),
      bitrate: "48k".into(),
      sample_rate: 24_000,
    }
  }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FeedbackCfg {
  pub subdir: String,
  pub mapping_file: String,
  pub phrases: Vec<String>,
}

impl Default for FeedbackCfg {
  fn default() -> Self {
    Self {
      subdir: "feedback".into(),
      mapping_file: "feedback.json".into(),
      phrases: ["太棒了！", "答对了，真聪明！", "再想一想哦。", "没关系，我们再试一次！"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }
  }
}

/// Prompts used for disambiguation. Override in TOML to tune tone/structure.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  pub disambiguation_system: String,
  /// Keys: {context}, {characters}.
  pub disambiguation_user_template: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      disambiguation_system: "You annotate Chinese characters for young children learning to read. Respond ONLY with strict JSON.".into(),
      disambiguation_user_template: "Quiz question and options:\n{context}\n\nFor each of these characters: {characters}\nGive the Hanyu Pinyin reading (tone diacritics) that is correct IN THIS CONTEXT, and a short, common, child-friendly word or phrase that contains the character with that same reading.\nReturn JSON {\"readings\": [{\"character\": string, \"reading\": string, \"mnemonicPhrase\": string}]} with exactly one item per listed character and no other keys.".into(),
    }
  }
}

/// Read and parse a TOML config. No path means defaults.
pub fn load_pipeline_config(path: Option<&Path>) -> Result<PipelineConfig> {
  let Some(path) = path else {
    info!(target: "hanzi_audio_prep", "No config file given; using defaults");
    return Ok(PipelineConfig::default());
  };
  let text = std::fs::read_to_string(path)
    .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
  let cfg = toml::from_str::<PipelineConfig>(&text)?;
  info!(target: "hanzi_audio_prep", path = %path.display(), "Loaded pipeline config (TOML)");
  Ok(cfg)
}

/// API keys read from the process environment.
pub struct Credentials;

impl Credentials {
  pub const LLM_VAR: &'static str = "OPENAI_API_KEY";
  pub const TTS_VAR: &'static str = "DASHSCOPE_API_KEY";

  pub fn require(var: &'static str) -> Result<String> {
    match std::env::var(var) {
      Ok(v) if !v.trim().is_empty() => Ok(v),
      _ => Err(Error::MissingCredential(var)),
    }
  }
}
