//! Error type shared by every pipeline stage.
//!
//! Per-job failures are values (they end up in run summaries); only the
//! startup errors (config, credentials, record store) propagate to `main`.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
  /// Invalid or unreadable configuration.
  #[error("configuration error: {0}")]
  Config(String),

  /// A credential required by the selected command is absent from the environment.
  #[error("missing credential: set {0}")]
  MissingCredential(&'static str),

  /// The record store could not be read or parsed. Always fatal.
  #[error("record store {path}: {reason}")]
  RecordStore { path: PathBuf, reason: String },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("toml error: {0}")]
  Toml(#[from] toml::de::Error),

  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  /// The external service asked us to slow down. The only retryable error.
  #[error("rate limited: {0}")]
  RateLimited(String),

  /// Non-2xx answer that is not a rate limit.
  #[error("{service} HTTP {status}: {message}")]
  Service { service: &'static str, status: u16, message: String },

  /// Response did not match the expected schema.
  #[error("malformed response: {0}")]
  Malformed(String),

  #[error("transcode error: {0}")]
  Transcode(String),

  /// Two different texts truncate to the same content hash.
  #[error("content hash {hash} already bound to different text")]
  HashCollision { hash: String },
}

impl Error {
  pub fn is_rate_limited(&self) -> bool {
    matches!(self, Error::RateLimited(_))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn only_rate_limits_are_retryable() {
    assert!(Error::RateLimited("429".into()).is_rate_limited());
    assert!(!Error::Malformed("x".into()).is_rate_limited());
    assert!(!Error::Service { service: "tts", status: 500, message: "boom".into() }.is_rate_limited());
  }

  #[test]
  fn missing_credential_names_the_variable() {
    let msg = Error::MissingCredential("DASHSCOPE_API_KEY").to_string();
    assert!(msg.contains("DASHSCOPE_API_KEY"));
  }
}
