//! Persistent character → readings dictionary.
//!
//! A character with exactly one known reading resolves locally; two or more
//! readings make it ambiguous, and every occurrence must then be decided
//! in context. Readings are only ever appended.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use crate::domain::{QuestionRecord, ReadingEntry};
use crate::error::Result;
use crate::util::write_json_atomic;

#[derive(Debug, Default)]
pub struct ReadingDictionary {
  path: PathBuf,
  entries: BTreeMap<char, Vec<ReadingEntry>>,
}

impl ReadingDictionary {
  /// Load from `path`. Absent or unreadable files yield an empty dictionary.
  #[instrument(level = "info", skip_all, fields(path = %path.display()))]
  pub fn load(path: &Path) -> Self {
    let entries = match std::fs::read_to_string(path) {
      Ok(text) => match serde_json::from_str::<BTreeMap<char, Vec<ReadingEntry>>>(&text) {
        Ok(map) => map,
        Err(e) => {
          warn!(target: "dictionary", error = %e, "Dictionary file is not valid JSON; starting empty");
          BTreeMap::new()
        }
      },
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        info!(target: "dictionary", "No dictionary file yet (cold start)");
        BTreeMap::new()
      }
      Err(e) => {
        warn!(target: "dictionary", error = %e, "Failed to read dictionary; starting empty");
        BTreeMap::new()
      }
    };

    let mut dict = Self { path: path.to_path_buf(), entries: BTreeMap::new() };
    for (ch, variants) in entries {
      for v in variants {
        dict.insert(ch, &v);
      }
    }
    info!(target: "dictionary", characters = dict.len(), ambiguous = dict.ambiguous_count(), "Dictionary loaded");
    dict
  }

  /// Add `entry` as a reading of `ch` unless that exact reading is known.
  /// Returns true when a new reading was appended.
  pub fn insert(&mut self, ch: char, entry: &ReadingEntry) -> bool {
    let reading = entry.reading.trim();
    if reading.is_empty() {
      return false;
    }
    let variants = self.entries.entry(ch).or_default();
    if let Some(existing) = variants.iter_mut().find(|v| v.reading == reading) {
      if !existing.is_settled() && entry.is_settled() {
        existing.mnemonic_phrase = entry.mnemonic_phrase.clone();
      }
      return false;
    }
    variants.push(ReadingEntry::new(reading, entry.mnemonic_phrase.clone()));
    debug!(target: "dictionary", %ch, %reading, variants = variants.len(), "New reading");
    true
  }

  /// Seed from every pronunciation map already present in the records.
  pub fn ingest_from_records(&mut self, records: &[QuestionRecord]) -> usize {
    let mut added = 0;
    for rec in records {
      if let Some(map) = &rec.pronunciations {
        for (ch, entry) in map {
          if self.insert(*ch, entry) {
            added += 1;
          }
        }
      }
    }
    info!(target: "dictionary", added, characters = self.len(), "Ingested readings from records");
    added
  }

  pub fn is_ambiguous(&self, ch: char) -> bool {
    self.entries.get(&ch).map_or(false, |v| v.len() >= 2)
  }

  /// The reading of an unambiguous character. None when unknown or ambiguous.
  pub fn sole_reading(&self, ch: char) -> Option<&ReadingEntry> {
    match self.entries.get(&ch) {
      Some(v) if v.len() == 1 => v.first(),
      _ => None,
    }
  }

  pub fn variants(&self, ch: char) -> &[ReadingEntry] {
    self.entries.get(&ch).map(|v| v.as_slice()).unwrap_or(&[])
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn ambiguous_count(&self) -> usize {
    self.entries.values().filter(|v| v.len() >= 2).count()
  }

  /// Full overwrite of the dictionary file.
  pub fn save(&self) -> Result<()> {
    write_json_atomic(&self.path, &self.entries)?;
    debug!(target: "dictionary", path = %self.path.display(), characters = self.len(), "Dictionary saved");
    Ok(())
  }
}
