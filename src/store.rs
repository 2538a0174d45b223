//! Record store: the whole question file is read at start and rewritten in
//! full (pretty JSON, trailing newline) at every checkpoint.

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, info, instrument};

use crate::domain::QuestionRecord;
use crate::error::{Error, Result};
use crate::util::write_json_atomic;

/// Absence or a parse failure is fatal: there is nothing to process.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub fn load_records(path: &Path) -> Result<Vec<QuestionRecord>> {
  let text = std::fs::read_to_string(path)
    .map_err(|e| Error::RecordStore { path: path.to_path_buf(), reason: e.to_string() })?;
  let records: Vec<QuestionRecord> = serde_json::from_str(&text)
    .map_err(|e| Error::RecordStore { path: path.to_path_buf(), reason: e.to_string() })?;
  info!(target: "store", count = records.len(), "Records loaded");
  Ok(records)
}

pub fn save_records(path: &Path, records: &[QuestionRecord]) -> Result<()> {
  write_json_atomic(path, records)?;
  debug!(target: "store", path = %path.display(), count = records.len(), "Records saved");
  Ok(())
}

/// Drop records whose id is in `remove`, then renumber the rest 1..=n in
/// their original relative order.
pub fn filter_and_reindex(records: Vec<QuestionRecord>, remove: &HashSet<u32>) -> Vec<QuestionRecord> {
  let before = records.len();
  let kept: Vec<QuestionRecord> = records
    .into_iter()
    .filter(|r| !remove.contains(&r.id))
    .enumerate()
    .map(|(i, mut r)| {
      r.id = i as u32 + 1;
      r
    })
    .collect();
  info!(target: "store", before, after = kept.len(), requested = remove.len(), "Filtered and re-indexed records");
  kept
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::sample_record;

  #[test]
  fn removing_eighteen_of_113_leaves_dense_ids() {
    let records: Vec<QuestionRecord> = (1..=113)
      .map(|i| sample_record(i, &format!("第{i}题"), &["对", "错"]))
      .collect();
    let remove: HashSet<u32> = [3, 7, 12, 19, 25, 31, 40, 44, 52, 60, 61, 73, 80, 88, 95, 101, 108, 113]
      .into_iter()
      .collect();
    assert_eq!(remove.len(), 18);

    let out = filter_and_reindex(records, &remove);
    assert_eq!(out.len(), 95);
    assert_eq!(out.iter().map(|r| r.id).collect::<Vec<_>>(), (1..=95).collect::<Vec<_>>());
    // relative order preserved: original 1, 2, 4 keep their prompts
    assert_eq!(out[0].prompt, "第1题");
    assert_eq!(out[2].prompt, "第4题");
    assert_eq!(out[94].prompt, "第112题");
  }

  #[test]
  fn missing_store_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_records(&dir.path().join("none.json")).unwrap_err();
    assert!(matches!(err, Error::RecordStore { .. }));
  }

  #[test]
  fn save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("q.json");
    let records = vec![sample_record(1, "大人", &["人"])];
    save_records(&path, &records).unwrap();
    assert!(std::fs::read_to_string(&path).unwrap().ends_with("]\n"));
    assert_eq!(load_records(&path).unwrap(), records);
  }
}
