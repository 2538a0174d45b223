//! Content-addressed audio store and audio job planning.
//!
//! An artifact is named by a truncated SHA-256 of the exact text it speaks.
//! Once a file exists under that name it is never regenerated, and every
//! reading whose speech text hashes to it is wired to the same file.
//! `manifest.json` remembers which text each hash was made from so a
//! truncation collision is refused instead of silently reusing audio.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::domain::{QuestionRecord, ReadingEntry};
use crate::error::{Error, Result};
use crate::util::{fill_template, write_json_atomic};

/// Hex characters kept from the digest (64 bits).
pub const HASH_HEX_LEN: usize = 16;

const MANIFEST_FILE: &str = "manifest.json";

/// Normalized form of a speech text: surrounding whitespace removed.
pub fn normalize_text(text: &str) -> &str {
  text.trim()
}

pub fn content_hash(text: &str) -> String {
  let digest = Sha256::digest(normalize_text(text).as_bytes());
  let mut hex = hex::encode(digest);
  hex.truncate(HASH_HEX_LEN);
  hex
}

#[derive(Debug)]
pub struct AudioCache {
  dir: PathBuf,
  extension: String,
  public_prefix: String,
  manifest: BTreeMap<String, String>,
}

impl AudioCache {
  pub fn open(dir: &Path, extension: &str, public_prefix: &str) -> Self {
    let manifest_path = dir.join(MANIFEST_FILE);
    let manifest = match std::fs::read_to_string(&manifest_path) {
      Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
        warn!(target: "audio", path = %manifest_path.display(), error = %e, "Ignoring unreadable audio manifest");
        BTreeMap::new()
      }),
      Err(_) => BTreeMap::new(),
    };
    let mut public_prefix = public_prefix.to_string();
    if !public_prefix.ends_with('/') {
      public_prefix.push('/');
    }
    Self { dir: dir.to_path_buf(), extension: extension.to_string(), public_prefix, manifest }
  }

  /// A separate partition under `dir/<name>` with its own manifest.
  pub fn partition(&self, name: &str) -> Self {
    let prefix = format!("{}{}/", self.public_prefix, name);
    Self::open(&self.dir.join(name), &self.extension, &prefix)
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn extension(&self) -> &str {
    &self.extension
  }

  pub fn file_name(&self, hash: &str) -> String {
    format!("{}.{}", hash, self.extension)
  }

  pub fn path_for(&self, hash: &str) -> PathBuf {
    self.dir.join(self.file_name(hash))
  }

  pub fn exists(&self, hash: &str) -> bool {
    self.path_for(hash).is_file()
  }

  /// The string stored in a record's `audioFile`.
  pub fn reference(&self, hash: &str) -> String {
    format!("{}{}", self.public_prefix, self.file_name(hash))
  }

  /// Map a stored reference back to its artifact path, if it belongs to this store.
  pub fn resolve_reference(&self, reference: &str) -> Option<PathBuf> {
    reference.strip_prefix(&self.public_prefix)
      .filter(|name| !name.is_empty() && !name.contains('/'))
      .map(|name| self.dir.join(name))
  }

  /// Fails if `hash` was already produced from a different text.
  pub fn check_binding(&self, hash: &str, text: &str) -> Result<()> {
    match self.manifest.get(hash) {
      Some(bound) if bound != normalize_text(text) => Err(Error::HashCollision { hash: hash.to_string() }),
      _ => Ok(()),
    }
  }

  pub fn bind(&mut self, hash: &str, text: &str) -> Result<()> {
    self.check_binding(hash, text)?;
    self.manifest.insert(hash.to_string(), normalize_text(text).to_string());
    Ok(())
  }

  pub fn save_manifest(&self) -> Result<()> {
    write_json_atomic(&self.dir.join(MANIFEST_FILE), &self.manifest)
  }
}

/// Which record/character is waiting for a job's audio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobRef {
  pub record_index: usize,
  pub character: char,
}

/// One unit of synthesis. Identical texts collapse to one job.
#[derive(Clone, Debug)]
pub struct AudioJob {
  pub hash: String,
  pub text: String,
  pub refs: Vec<JobRef>,
}

#[derive(Debug, Default)]
pub struct JobPlan {
  pub jobs: Vec<AudioJob>,
  /// Already referencing an existing artifact.
  pub skipped: usize,
  /// Wired to an artifact that already existed.
  pub reused: usize,
  /// Stale references removed before re-queueing.
  pub cleared: usize,
  pub collisions: usize,
}

/// Text spoken for one character's reading.
pub fn speech_text(template: &str, ch: char, entry: &ReadingEntry) -> String {
  let character = ch.to_string();
  let text = fill_template(
    template,
    &[("phrase", &entry.mnemonic_phrase), ("character", &character), ("reading", &entry.reading)],
  );
  normalize_text(&text).to_string()
}

/// Walk every settled reading, wire those whose artifact exists, and group
/// the rest into deduplicated jobs (in first-seen order).
pub fn plan_character_jobs(records: &mut [QuestionRecord], cache: &AudioCache, template: &str) -> JobPlan {
  let mut plan = JobPlan::default();
  let mut by_hash: HashMap<String, usize> = HashMap::new();

  for (record_index, rec) in records.iter_mut().enumerate() {
    let Some(map) = rec.pronunciations.as_mut() else { continue };
    for (ch, entry) in map.iter_mut() {
      if !entry.is_settled() {
        continue;
      }
      let text = speech_text(template, *ch, entry);
      let hash = content_hash(&text);

      if let Err(e) = cache.check_binding(&hash, &text) {
        error!(target: "audio", record_id = rec.id, %ch, %text, error = %e, "Refusing to wire colliding audio");
        plan.collisions += 1;
        continue;
      }

      if cache.exists(&hash) {
        let reference = cache.reference(&hash);
        if entry.audio_file.as_deref() == Some(reference.as_str()) {
          plan.skipped += 1;
        } else {
          entry.audio_file = Some(reference);
          plan.reused += 1;
        }
        continue;
      }

      if entry.audio_file.take().is_some() {
        plan.cleared += 1;
      }
      let job_ref = JobRef { record_index, character: *ch };
      match by_hash.get(&hash) {
        Some(&i) if plan.jobs[i].text == text => plan.jobs[i].refs.push(job_ref),
        Some(_) => {
          error!(target: "audio", record_id = rec.id, %ch, %hash, "Two texts in this run share a content hash; skipping");
          plan.collisions += 1;
        }
        None => {
          by_hash.insert(hash.clone(), plan.jobs.len());
          plan.jobs.push(AudioJob { hash, text, refs: vec![job_ref] });
        }
      }
    }
  }

  let refs: usize = plan.jobs.iter().map(|j| j.refs.len()).sum();
  info!(target: "audio", jobs = plan.jobs.len(), waiting_refs = refs, skipped = plan.skipped, reused = plan.reused, cleared = plan.cleared, collisions = plan.collisions, "Planned audio jobs");
  debug!(target: "audio", dir = %cache.dir().display(), "Audio store");
  plan
}
