//! Reading resolution for one quiz record.
//!
//! Characters already settled in the record are left alone, unambiguous
//! characters come from the dictionary for free, and everything else goes
//! to the external disambiguator in one request per record with the full
//! question as context. A failed or partial reply never aborts the run:
//! the record keeps what was resolved locally and is reported incomplete.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::dictionary::ReadingDictionary;
use crate::domain::{QuestionRecord, ReadingEntry};
use crate::error::Result;
use crate::extract::extract_chars_from;
use crate::retry::{retry_rate_limited, RetryPolicy};

/// What we ask the disambiguation service.
#[derive(Clone, Debug)]
pub struct DisambiguationRequest {
  pub record_id: u32,
  /// Prompt plus options.
  pub context: String,
  pub characters: Vec<char>,
}

/// One item of the service's reply.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CharReading {
  pub character: String,
  pub reading: String,
  pub mnemonic_phrase: String,
}

/// Picks the context-correct reading of characters.
#[async_trait]
pub trait Disambiguator: Send + Sync {
  async fn disambiguate(&self, request: &DisambiguationRequest) -> Result<Vec<CharReading>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
  /// No Han characters at all.
  NoCharacters,
  /// Every character was already settled in the record.
  AlreadySettled,
  /// Everything came from the dictionary; no external call.
  Local { filled: usize },
  External { local: usize, external: usize },
  /// External call failed or left characters unresolved.
  Incomplete { local: usize, external: usize, missing: usize },
}

/// Resolve the record's missing readings in place. Throttled requests are
/// retried under `retry` before the record is given up as incomplete.
#[instrument(level = "debug", skip_all, fields(record_id = record.id))]
pub async fn resolve_record(
  record: &mut QuestionRecord,
  dict: &Mutex<ReadingDictionary>,
  disambiguator: &dyn Disambiguator,
  retry: &RetryPolicy,
) -> Resolution {
  let chars = extract_chars_from(record.texts());
  let map = record.pronunciations.get_or_insert_with(Default::default);
  if chars.is_empty() {
    return Resolution::NoCharacters;
  }

  let pending: Vec<char> = chars.into_iter()
    .filter(|c| !map.get(c).map_or(false, ReadingEntry::is_settled))
    .collect();
  if pending.is_empty() {
    return Resolution::AlreadySettled;
  }

  let mut needs_external = Vec::new();
  let mut local = 0;
  {
    let dict = dict.lock().await;
    for ch in pending {
      if dict.is_ambiguous(ch) {
        debug!(target: "resolver", %ch, variants = dict.variants(ch).len(), "Ambiguous in dictionary");
        needs_external.push(ch);
        continue;
      }
      match dict.sole_reading(ch).filter(|e| e.is_settled()) {
        Some(entry) => {
          map.insert(ch, ReadingEntry::new(entry.reading.clone(), entry.mnemonic_phrase.clone()));
          local += 1;
        }
        None => needs_external.push(ch),
      }
    }
  }

  if needs_external.is_empty() {
    debug!(target: "resolver", filled = local, "Resolved from dictionary");
    return Resolution::Local { filled: local };
  }

  let request = DisambiguationRequest {
    record_id: record.id,
    context: record.context_text(),
    characters: needs_external.clone(),
  };
  let reply = match retry_rate_limited(retry, "llm", || disambiguator.disambiguate(&request)).await {
    Ok(items) => items,
    Err(e) => {
      warn!(target: "resolver", record_id = record.id, error = %e, pending = needs_external.len(), "Disambiguation failed; keeping local readings");
      return Resolution::Incomplete { local, external: 0, missing: needs_external.len() };
    }
  };

  let accepted = validate_reply(record.id, &needs_external, reply);
  let map = record.pronunciations.get_or_insert_with(Default::default);
  let mut dict = dict.lock().await;
  let mut external = 0;
  for ch in &needs_external {
    if let Some(entry) = accepted.get(ch) {
      dict.insert(*ch, entry);
      map.insert(*ch, entry.clone());
      external += 1;
    }
  }

  let missing = needs_external.len() - external;
  if missing > 0 {
    warn!(target: "resolver", record_id = record.id, missing, "Reply left characters unresolved");
    Resolution::Incomplete { local, external, missing }
  } else {
    Resolution::External { local, external }
  }
}

/// Keep only well-formed answers for characters we actually asked about.
fn validate_reply(record_id: u32, asked: &[char], reply: Vec<CharReading>) -> HashMap<char, ReadingEntry> {
  let mut out = HashMap::new();
  for item in reply {
    let mut it = item.character.trim().chars();
    let ch = match (it.next(), it.next()) {
      (Some(c), None) => c,
      _ => {
        warn!(target: "resolver", record_id, character = %item.character, "Reply item is not a single character");
        continue;
      }
    };
    if !asked.contains(&ch) {
      warn!(target: "resolver", record_id, %ch, "Reply item for a character we did not ask about");
      continue;
    }
    let reading = item.reading.trim();
    let phrase = item.mnemonic_phrase.trim();
    if reading.is_empty() || !phrase.contains(ch) {
      warn!(target: "resolver", record_id, %ch, %reading, %phrase, "Rejected reply item (empty reading or phrase lacks character)");
      continue;
    }
    out.entry(ch).or_insert_with(|| ReadingEntry::new(reading, phrase));
  }
  out
}

/// Per-run totals, counted per record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolveSummary {
  pub resolved_via_cache: usize,
  pub resolved_via_external: usize,
  pub skipped: usize,
  pub errored: usize,
  pub chars_from_cache: usize,
  pub chars_from_external: usize,
}

impl ResolveSummary {
  pub fn record(&mut self, r: Resolution) {
    match r {
      Resolution::NoCharacters | Resolution::AlreadySettled => self.skipped += 1,
      Resolution::Local { filled } => {
        self.resolved_via_cache += 1;
        self.chars_from_cache += filled;
      }
      Resolution::External { local, external } => {
        self.resolved_via_external += 1;
        self.chars_from_cache += local;
        self.chars_from_external += external;
      }
      Resolution::Incomplete { local, external, .. } => {
        self.errored += 1;
        self.chars_from_cache += local;
        self.chars_from_external += external;
      }
    }
  }
}

impl fmt::Display for ResolveSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "resolved via cache: {}, resolved via external call: {}, skipped: {}, errored: {} (characters: {} cached, {} external)",
      self.resolved_via_cache, self.resolved_via_external, self.skipped, self.errored,
      self.chars_from_cache, self.chars_from_external
    )
  }
}
