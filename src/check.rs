//! Consistency pass over the record store.
//!
//! Finds what an interrupted or partially failed run leaves behind
//! (missing readings, missing audio) plus data problems that no stage
//! repairs on its own.

use std::collections::HashSet;
use std::fmt;

use tracing::{info, warn};

use crate::audio_cache::AudioCache;
use crate::domain::{PronunciationMap, QuestionRecord};
use crate::extract::extract_chars_from;
use crate::pinyin::is_plausible_reading;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
  Error,
  Warning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finding {
  pub record_id: u32,
  pub severity: Severity,
  pub message: String,
}

impl fmt::Display for Finding {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let tag = match self.severity {
      Severity::Error => "error",
      Severity::Warning => "warning",
    };
    write!(f, "[{}] record {}: {}", tag, self.record_id, self.message)
  }
}

#[derive(Debug, Default)]
pub struct CheckReport {
  pub records: usize,
  pub findings: Vec<Finding>,
}

impl CheckReport {
  pub fn errors(&self) -> usize {
    self.findings.iter().filter(|f| f.severity == Severity::Error).count()
  }

  pub fn warnings(&self) -> usize {
    self.findings.len() - self.errors()
  }

  fn push(&mut self, record_id: u32, severity: Severity, message: String) {
    self.findings.push(Finding { record_id, severity, message });
  }
}

pub fn check_records(records: &[QuestionRecord], cache: &AudioCache) -> CheckReport {
  let mut report = CheckReport { records: records.len(), findings: Vec::new() };
  let mut ids = HashSet::new();

  for rec in records {
    if !ids.insert(rec.id) {
      report.push(rec.id, Severity::Error, "duplicate id".into());
    }
    let correct = rec.correct_option_count();
    if correct != 1 {
      report.push(rec.id, Severity::Error, format!("{correct} correct options (expected exactly 1)"));
    }

    let chars = extract_chars_from(rec.texts());
    let empty = PronunciationMap::new();
    let map = rec.pronunciations.as_ref().unwrap_or(&empty);

    for ch in &chars {
      let Some(entry) = map.get(ch) else {
        report.push(rec.id, Severity::Error, format!("'{ch}' has no reading"));
        continue;
      };
      if entry.reading.trim().is_empty() {
        report.push(rec.id, Severity::Error, format!("'{ch}' has an empty reading"));
      } else if !is_plausible_reading(*ch, &entry.reading) {
        report.push(rec.id, Severity::Warning, format!("'{ch}' reading '{}' is not in the offline table", entry.reading));
      }
      if !entry.is_settled() {
        report.push(rec.id, Severity::Error, format!("'{ch}' has no mnemonic phrase"));
      } else if !entry.mnemonic_phrase.contains(*ch) {
        report.push(rec.id, Severity::Error, format!("'{ch}' mnemonic '{}' does not contain it", entry.mnemonic_phrase));
      }
      match entry.audio_file.as_deref() {
        None if entry.is_settled() => report.push(rec.id, Severity::Warning, format!("'{ch}' has no audio yet")),
        None => {}
        Some(reference) => match cache.resolve_reference(reference) {
          Some(path) if path.is_file() => {}
          _ => report.push(rec.id, Severity::Error, format!("'{ch}' audio '{reference}' does not exist")),
        },
      }
    }

    for ch in map.keys().filter(|c| !chars.contains(*c)) {
      report.push(rec.id, Severity::Warning, format!("'{ch}' annotated but not in the text"));
    }
  }

  for f in &report.findings {
    match f.severity {
      Severity::Error => warn!(target: "store", "{}", f),
      Severity::Warning => info!(target: "store", "{}", f),
    }
  }
  info!(target: "store", records = report.records, errors = report.errors(), warnings = report.warnings(), "Consistency check finished");
  report
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::audio_cache::content_hash;
  use crate::domain::{sample_record, ReadingEntry};

  #[test]
  fn complete_record_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    let cache = AudioCache::open(dir.path(), "mp3", "/audio/");
    let hash = content_hash("大人");
    std::fs::write(cache.path_for(&hash), b"ID3").unwrap();

    let mut rec = sample_record(1, "大人", &["人"]);
    let mut map = PronunciationMap::new();
    for (c, r) in [('大', "dà"), ('人', "rén")] {
      let mut e = ReadingEntry::new(r, "大人");
      e.audio_file = Some(cache.reference(&hash));
      map.insert(c, e);
    }
    rec.pronunciations = Some(map);

    let report = check_records(&[rec], &cache);
    assert!(report.findings.is_empty(), "{:?}", report.findings);
  }

  #[test]
  fn problems_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let cache = AudioCache::open(dir.path(), "mp3", "/audio/");

    let mut a = sample_record(1, "长高", &["人"]);
    a.options[0].is_correct = false;
    let mut map = PronunciationMap::new();
    map.insert('长', ReadingEntry::new("dà", "高山"));
    let mut gone = ReadingEntry::new("gāo", "高山");
    gone.audio_file = Some("/audio/missing.mp3".into());
    map.insert('高', gone);
    map.insert('猫', ReadingEntry::new("māo", "小猫"));
    a.pronunciations = Some(map);
    let b = sample_record(1, "?", &["1"]);

    let report = check_records(&[a, b], &cache);
    let text: Vec<String> = report.findings.iter().map(|f| f.to_string()).collect();
    let has = |needle: &str| text.iter().any(|t| t.contains(needle));

    assert!(has("duplicate id"));
    assert!(has("0 correct options"));
    assert!(has("'人' has no reading"));
    assert!(has("'长' mnemonic '高山' does not contain it"));
    assert!(has("'长' reading 'dà' is not in the offline table"));
    assert!(has("'高' audio '/audio/missing.mp3' does not exist"));
    assert!(has("'猫' annotated but not in the text"));
    assert!(report.errors() >= 5);
    assert!(report.warnings() >= 2);
  }
}
