//! Domain models: quiz records, their options, and per-character readings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Character → reading for one record. A character appearing in both the
/// prompt and an option shares one entry.
pub type PronunciationMap = BTreeMap<char, ReadingEntry>;

/// A reading of one character plus the phrase that teaches it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingEntry {
  pub reading: String,
  #[serde(default)] pub mnemonic_phrase: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub audio_file: Option<String>,
}

impl ReadingEntry {
  pub fn new(reading: impl Into<String>, mnemonic_phrase: impl Into<String>) -> Self {
    Self { reading: reading.into(), mnemonic_phrase: mnemonic_phrase.into(), audio_file: None }
  }

  /// Settled entries are never overwritten by the resolver.
  pub fn is_settled(&self) -> bool {
    !self.mnemonic_phrase.trim().is_empty()
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizOption {
  pub id: String,
  pub text: String,
  #[serde(default)] pub is_correct: bool,
}

/// One quiz question as stored in the record file.
/// Fields this tool does not know about are carried through untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionRecord {
  pub id: u32,
  pub prompt: String,
  pub options: Vec<QuizOption>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pronunciations: Option<PronunciationMap>,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

impl QuestionRecord {
  /// Prompt followed by every option text, in order.
  pub fn texts(&self) -> impl Iterator<Item = &str> {
    std::iter::once(self.prompt.as_str()).chain(self.options.iter().map(|o| o.text.as_str()))
  }

  /// Prompt and options joined for use as disambiguation context.
  pub fn context_text(&self) -> String {
    let opts: Vec<String> = self.options.iter().map(|o| format!("{}. {}", o.id, o.text)).collect();
    format!("{}\n{}", self.prompt, opts.join("\n"))
  }

  pub fn correct_option_count(&self) -> usize {
    self.options.iter().filter(|o| o.is_correct).count()
  }
}

#[cfg(test)]
pub(crate) fn sample_record(id: u32, prompt: &str, options: &[&str]) -> QuestionRecord {
  QuestionRecord {
    id,
    prompt: prompt.to_string(),
    options: options
      .iter()
      .enumerate()
      .map(|(i, t)| QuizOption {
        id: ((b'A' + i as u8) as char).to_string(),
        text: t.to_string(),
        is_correct: i == 0,
      })
      .collect(),
    pronunciations: None,
    extra: serde_json::Map::new(),
  }
}
