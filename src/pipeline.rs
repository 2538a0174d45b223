//! The two batch stages (reading annotation, character audio) and the
//! feedback phrase stage, each driven through `BatchRunner` with full-file
//! checkpoints. A job failure is counted and logged, never propagated.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::audio_cache::{content_hash, normalize_text, plan_character_jobs, AudioCache, AudioJob};
use crate::batch::BatchRunner;
use crate::dictionary::ReadingDictionary;
use crate::domain::QuestionRecord;
use crate::error::Result;
use crate::resolver::{resolve_record, Disambiguator, ResolveSummary};
use crate::retry::RetryPolicy;
use crate::store::save_records;
use crate::tts::{AudioSynthesizer, Produced};
use crate::util::write_json_atomic;

async fn persist_records(path: &Path, records: &Mutex<Vec<QuestionRecord>>) {
  let records = records.lock().await;
  if let Err(e) = save_records(path, &records) {
    error!(target: "pipeline", path = %path.display(), error = %e, "Checkpoint save of records failed");
  }
}

/// Resolve readings for every record, checkpointing records and dictionary.
#[instrument(level = "info", skip_all, fields(records = records.len()))]
pub async fn annotate_records(
  records_path: &Path,
  records: Vec<QuestionRecord>,
  mut dict: ReadingDictionary,
  disambiguator: &dyn Disambiguator,
  retry: &RetryPolicy,
  runner: BatchRunner,
) -> Result<(Vec<QuestionRecord>, ResolveSummary)> {
  dict.ingest_from_records(&records);
  dict.save()?;

  let indices: Vec<usize> = (0..records.len()).collect();
  let shared = Mutex::new(records);
  let dict = Mutex::new(dict);
  let (shared_ref, dict_ref) = (&shared, &dict);

  let outcomes = runner
    .run(
      &indices,
      move |_, &idx| async move {
        let mut rec = shared_ref.lock().await[idx].clone();
        let outcome = resolve_record(&mut rec, dict_ref, disambiguator, retry).await;
        shared_ref.lock().await[idx].pronunciations = rec.pronunciations;
        outcome
      },
      move |done| async move {
        persist_records(records_path, shared_ref).await;
        if let Err(e) = dict_ref.lock().await.save() {
          error!(target: "pipeline", done, error = %e, "Checkpoint save of dictionary failed");
        }
      },
    )
    .await;

  let mut summary = ResolveSummary::default();
  for outcome in outcomes {
    summary.record(outcome);
  }

  let records = shared.into_inner();
  save_records(records_path, &records)?;
  dict.into_inner().save()?;
  info!(target: "pipeline", %summary, "Annotation finished");
  Ok((records, summary))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AudioSummary {
  pub synthesized: usize,
  /// References wired to artifacts that already existed.
  pub reused: usize,
  pub skipped: usize,
  pub errored: usize,
  pub transcoded: usize,
  pub bytes_raw: u64,
  pub bytes_final: u64,
}

impl AudioSummary {
  fn record(&mut self, outcome: &Result<Produced>) {
    match outcome {
      Ok(p) => {
        self.synthesized += 1;
        self.bytes_raw += p.raw_bytes;
        self.bytes_final += p.final_bytes;
        if p.transcoded {
          self.transcoded += 1;
        }
      }
      Err(_) => self.errored += 1,
    }
  }
}

impl fmt::Display for AudioSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "synthesized: {}, reused: {}, skipped: {}, errored: {}, transcoded: {} ({} bytes -> {} bytes)",
      self.synthesized, self.reused, self.skipped, self.errored, self.transcoded, self.bytes_raw, self.bytes_final
    )
  }
}

async fn run_job(synth: &AudioSynthesizer, cache: &Mutex<AudioCache>, job: &AudioJob) -> Result<Produced> {
  let (path, ext) = {
    let cache = cache.lock().await;
    (cache.path_for(&job.hash), cache.extension().to_string())
  };
  let produced = synth.produce(&job.text, &path, &ext).await;
  match &produced {
    Ok(_) => {
      if let Err(e) = cache.lock().await.bind(&job.hash, &job.text) {
        warn!(target: "audio", hash = %job.hash, error = %e, "Manifest binding failed");
      }
    }
    Err(e) => error!(target: "audio", hash = %job.hash, text = %job.text, error = %e, "Audio job failed"),
  }
  produced
}

async fn persist_manifest(cache: &Mutex<AudioCache>) {
  if let Err(e) = cache.lock().await.save_manifest() {
    error!(target: "pipeline", error = %e, "Checkpoint save of audio manifest failed");
  }
}

/// Synthesize audio for every settled reading, wiring results into records.
#[instrument(level = "info", skip_all, fields(records = records.len()))]
pub async fn synthesize_character_audio(
  records_path: &Path,
  mut records: Vec<QuestionRecord>,
  cache: AudioCache,
  synth: &AudioSynthesizer,
  speech_template: &str,
  runner: BatchRunner,
) -> Result<(Vec<QuestionRecord>, AudioSummary)> {
  let plan = plan_character_jobs(&mut records, &cache, speech_template);
  let mut summary = AudioSummary {
    reused: plan.reused,
    skipped: plan.skipped,
    errored: plan.collisions,
    ..Default::default()
  };
  if plan.reused > 0 || plan.cleared > 0 {
    save_records(records_path, &records)?;
  }

  let shared = Mutex::new(records);
  let cache = Mutex::new(cache);
  let (shared_ref, cache_ref) = (&shared, &cache);

  let outcomes = runner
    .run(
      &plan.jobs,
      move |_, job| async move {
        let outcome = run_job(synth, cache_ref, job).await;
        if outcome.is_ok() {
          let reference = cache_ref.lock().await.reference(&job.hash);
          let mut records = shared_ref.lock().await;
          for r in &job.refs {
            let entry = records[r.record_index]
              .pronunciations
              .as_mut()
              .and_then(|m| m.get_mut(&r.character));
            if let Some(entry) = entry {
              entry.audio_file = Some(reference.clone());
            }
          }
        }
        outcome
      },
      move |_| async move {
        persist_records(records_path, shared_ref).await;
        persist_manifest(cache_ref).await;
      },
    )
    .await;

  for outcome in &outcomes {
    summary.record(outcome);
  }

  let records = shared.into_inner();
  save_records(records_path, &records)?;
  cache.into_inner().save_manifest()?;
  info!(target: "pipeline", %summary, "Character audio finished");
  Ok((records, summary))
}

/// Phrase text → artifact file name, stored next to the feedback audio.
pub type FeedbackMapping = BTreeMap<String, String>;

fn load_mapping(path: &Path) -> FeedbackMapping {
  match std::fs::read_to_string(path) {
    Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
      warn!(target: "audio", path = %path.display(), error = %e, "Ignoring unreadable feedback mapping");
      FeedbackMapping::new()
    }),
    Err(_) => FeedbackMapping::new(),
  }
}

/// Synthesize the fixed feedback phrases into their own partition.
#[instrument(level = "info", skip_all, fields(phrases = phrases.len()))]
pub async fn synthesize_feedback(
  phrases: &[String],
  cache: AudioCache,
  mapping_file: &str,
  synth: &AudioSynthesizer,
  runner: BatchRunner,
) -> Result<(FeedbackMapping, AudioSummary)> {
  let mapping_path: PathBuf = cache.dir().join(mapping_file);
  let mut mapping = load_mapping(&mapping_path);
  let mut summary = AudioSummary::default();
  let mut jobs: Vec<AudioJob> = Vec::new();

  for phrase in phrases {
    let text = normalize_text(phrase).to_string();
    if text.is_empty() || jobs.iter().any(|j| j.text == text) {
      continue;
    }
    let hash = content_hash(&text);
    if let Err(e) = cache.check_binding(&hash, &text) {
      error!(target: "audio", %text, error = %e, "Refusing colliding feedback phrase");
      summary.errored += 1;
      continue;
    }
    if cache.exists(&hash) {
      let name = cache.file_name(&hash);
      if mapping.get(&text) == Some(&name) {
        summary.skipped += 1;
      } else {
        mapping.insert(text, name);
        summary.reused += 1;
      }
      continue;
    }
    jobs.push(AudioJob { hash, text, refs: Vec::new() });
  }

  let cache = Mutex::new(cache);
  let mapping = Mutex::new(mapping);
  let (cache_ref, mapping_ref, mapping_path_ref) = (&cache, &mapping, &mapping_path);

  let outcomes = runner
    .run(
      &jobs,
      move |_, job| async move {
        let outcome = run_job(synth, cache_ref, job).await;
        if outcome.is_ok() {
          let name = cache_ref.lock().await.file_name(&job.hash);
          mapping_ref.lock().await.insert(job.text.clone(), name);
        }
        outcome
      },
      move |_| async move {
        persist_manifest(cache_ref).await;
        if let Err(e) = write_json_atomic(mapping_path_ref, &*mapping_ref.lock().await) {
          error!(target: "pipeline", error = %e, "Checkpoint save of feedback mapping failed");
        }
      },
    )
    .await;

  for outcome in &outcomes {
    summary.record(outcome);
  }

  let mapping = mapping.into_inner();
  write_json_atomic(&mapping_path, &mapping)?;
  cache.into_inner().save_manifest()?;
  info!(target: "pipeline", %summary, "Feedback audio finished");
  Ok((mapping, summary))
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  use async_trait::async_trait;

  use super::*;
  use crate::domain::{sample_record, PronunciationMap, ReadingEntry};
  use crate::error::Error;
  use crate::resolver::tests::TableDisambiguator;
  use crate::resolver::{CharReading, DisambiguationRequest};
  use crate::store::load_records;
  use crate::retry::tests::fast_retry;
  use crate::tts::tests::{fake_mp3, no_ffmpeg};
  use crate::tts::{SpeechSynthesizer, SynthesisOutput};

  /// Fails permanently for texts in `fail`, and for every call after
  /// `budget` successful ones.
  struct ScriptedTts {
    fail: HashSet<String>,
    budget: usize,
    calls: AtomicUsize,
  }

  impl ScriptedTts {
    fn new(fail: &[&str], budget: usize) -> Self {
      Self { fail: fail.iter().map(|s| s.to_string()).collect(), budget, calls: AtomicUsize::new(0) }
    }
  }

  #[async_trait]
  impl SpeechSynthesizer for ScriptedTts {
    async fn synthesize(&self, text: &str) -> crate::error::Result<SynthesisOutput> {
      if self.fail.contains(text) {
        return Err(Error::Service { service: "tts", status: 400, message: "rejected".into() });
      }
      if self.calls.fetch_add(1, Ordering::SeqCst) >= self.budget {
        return Err(Error::Service { service: "tts", status: 503, message: "killed".into() });
      }
      Ok(SynthesisOutput::Bytes(fake_mp3(text)))
    }
  }

  /// Answers the first `budget` calls; every later call never returns.
  struct StallingTts {
    budget: usize,
    calls: AtomicUsize,
  }

  #[async_trait]
  impl SpeechSynthesizer for StallingTts {
    async fn synthesize(&self, text: &str) -> crate::error::Result<SynthesisOutput> {
      if self.calls.fetch_add(1, Ordering::SeqCst) >= self.budget {
        futures::future::pending::<()>().await;
      }
      Ok(SynthesisOutput::Bytes(fake_mp3(text)))
    }
  }

  /// Same idea for the disambiguation service.
  struct StallingDisambiguator {
    budget: usize,
    served: AtomicUsize,
    inner: TableDisambiguator,
  }

  #[async_trait]
  impl Disambiguator for StallingDisambiguator {
    async fn disambiguate(&self, request: &DisambiguationRequest) -> crate::error::Result<Vec<CharReading>> {
      if self.served.fetch_add(1, Ordering::SeqCst) >= self.budget {
        futures::future::pending::<()>().await;
      }
      self.inner.disambiguate(request).await
    }
  }

  const CUT_OFF: Duration = Duration::from_millis(500);

  fn synth(tts: impl SpeechSynthesizer + 'static) -> AudioSynthesizer {
    AudioSynthesizer::new(Box::new(tts), fast_retry(), no_ffmpeg())
  }

  /// Twenty records, each with one character and a distinct phrase.
  fn twenty_records() -> Vec<QuestionRecord> {
    let chars: Vec<char> = "一二三四五六七八九十天地人山水火木金土日".chars().collect();
    chars
      .iter()
      .enumerate()
      .map(|(i, c)| {
        let mut rec = sample_record(i as u32 + 1, &c.to_string(), &[]);
        let mut map = PronunciationMap::new();
        map.insert(*c, ReadingEntry::new("x", format!("{c}字{i}")));
        rec.pronunciations = Some(map);
        rec
      })
      .collect()
  }

  fn audio_of(rec: &QuestionRecord) -> Option<String> {
    rec.pronunciations.as_ref()?.values().next()?.audio_file.clone()
  }

  #[tokio::test]
  async fn one_permanent_failure_out_of_twenty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("q.json");
    let records = twenty_records();
    let seventh = records[6].pronunciations.as_ref().unwrap().values().next().unwrap().mnemonic_phrase.clone();

    let cache = AudioCache::open(&dir.path().join("audio"), "mp3", "/audio/");
    let (records, summary) = synthesize_character_audio(
      &path, records, cache, &synth(ScriptedTts::new(&[seventh.as_str()], usize::MAX)), "{phrase}", BatchRunner::new(4, 5),
    )
    .await
    .unwrap();

    assert_eq!(summary.synthesized, 19);
    assert_eq!(summary.errored, 1);
    assert_eq!(audio_of(&records[6]), None);
    assert!(records.iter().enumerate().filter(|(i, _)| *i != 6).all(|(_, r)| audio_of(r).is_some()));

    let files = std::fs::read_dir(dir.path().join("audio")).unwrap()
      .filter_map(|e| e.ok())
      .filter(|e| e.path().extension().map_or(false, |x| x == "mp3"))
      .count();
    assert_eq!(files, 19);
    assert_eq!(load_records(&path).unwrap(), records);
  }

  #[tokio::test]
  async fn same_phrase_shares_one_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("q.json");
    let mut a = sample_record(1, "大", &[]);
    let mut b = sample_record(2, "人", &[]);
    a.pronunciations = Some([('大', ReadingEntry::new("dà", "大人"))].into_iter().collect());
    b.pronunciations = Some([('人', ReadingEntry::new("rén", "大人"))].into_iter().collect());

    let tts = ScriptedTts::new(&[], usize::MAX);
    let cache = AudioCache::open(&dir.path().join("audio"), "mp3", "/audio/");
    let s = synth(tts);
    let (records, summary) =
      synthesize_character_audio(&path, vec![a, b], cache, &s, "{phrase}", BatchRunner::new(2, 10)).await.unwrap();

    assert_eq!(summary.synthesized, 1);
    assert_eq!(audio_of(&records[0]), audio_of(&records[1]));
    assert_eq!(audio_of(&records[0]), Some(format!("/audio/{}.mp3", content_hash("大人"))));
  }

  #[tokio::test]
  async fn interrupted_run_converges_to_uninterrupted_result() {
    let clean = tempfile::tempdir().unwrap();
    let clean_path = clean.path().join("q.json");
    let (expected, _) = synthesize_character_audio(
      &clean_path, twenty_records(),
      AudioCache::open(&clean.path().join("audio"), "mp3", "/audio/"),
      &synth(ScriptedTts::new(&[], usize::MAX)), "{phrase}", BatchRunner::new(3, 4),
    )
    .await
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("q.json");
    let audio = dir.path().join("audio");
    let stalled = synth(StallingTts { budget: 8, calls: AtomicUsize::new(0) });
    let cut = tokio::time::timeout(
      CUT_OFF,
      synthesize_character_audio(
        &path, twenty_records(), AudioCache::open(&audio, "mp3", "/audio/"),
        &stalled, "{phrase}", BatchRunner::new(3, 4),
      ),
    )
    .await;
    assert!(cut.is_err(), "run should have been cut off");

    // Only the checkpoints reached the disk.
    let resumed = load_records(&path).unwrap();
    assert_eq!(resumed.iter().filter(|r| audio_of(r).is_some()).count(), 8);

    let (finished, second) = synthesize_character_audio(
      &path, resumed, AudioCache::open(&audio, "mp3", "/audio/"),
      &synth(ScriptedTts::new(&[], usize::MAX)), "{phrase}", BatchRunner::new(3, 4),
    )
    .await
    .unwrap();
    assert_eq!(second.synthesized, 12);
    assert_eq!(second.skipped, 8);
    assert_eq!(finished, expected);
    assert_eq!(
      std::fs::read_to_string(&path).unwrap(),
      std::fs::read_to_string(&clean_path).unwrap()
    );
  }

  fn three_records() -> Vec<QuestionRecord> {
    vec![
      sample_record(1, "大人", &[]),
      sample_record(2, "高山", &[]),
      sample_record(3, "日月", &[]),
    ]
  }

  fn three_table() -> TableDisambiguator {
    TableDisambiguator::new(&[
      ('大', "dà", "大人"),
      ('人', "rén", "大人"),
      ('高', "gāo", "高山"),
      ('山', "shān", "高山"),
      ('日', "rì", "日月"),
      ('月', "yuè", "日月"),
    ])
  }

  #[tokio::test]
  async fn interrupted_annotation_keeps_checkpointed_work() {
    let clean = tempfile::tempdir().unwrap();
    let (clean_path, clean_dict) = (clean.path().join("q.json"), clean.path().join("dict.json"));
    annotate_records(
      &clean_path, three_records(), ReadingDictionary::load(&clean_dict), &three_table(), &fast_retry(),
      BatchRunner::new(1, 2),
    )
    .await
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let (path, dict_path) = (dir.path().join("q.json"), dir.path().join("dict.json"));
    let stalled = StallingDisambiguator { budget: 2, served: AtomicUsize::new(0), inner: three_table() };
    let cut = tokio::time::timeout(
      CUT_OFF,
      annotate_records(
        &path, three_records(), ReadingDictionary::load(&dict_path), &stalled, &fast_retry(),
        BatchRunner::new(1, 2),
      ),
    )
    .await;
    assert!(cut.is_err(), "run should have been cut off");

    let dict = ReadingDictionary::load(&dict_path);
    assert_eq!(dict.len(), 4);
    assert!(dict.sole_reading('日').is_none());
    let on_disk = load_records(&path).unwrap();
    assert_eq!(on_disk[1].pronunciations.as_ref().unwrap()[&'山'].reading, "shān");
    assert!(on_disk[2].pronunciations.as_ref().map_or(true, |m| m.is_empty()));

    let svc = three_table();
    let (_, summary) = annotate_records(
      &path, on_disk, ReadingDictionary::load(&dict_path), &svc, &fast_retry(), BatchRunner::new(1, 2),
    )
    .await
    .unwrap();
    assert_eq!(svc.calls(), 1);
    assert_eq!((summary.skipped, summary.resolved_via_external), (2, 1));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), std::fs::read_to_string(&clean_path).unwrap());
    assert_eq!(std::fs::read_to_string(&dict_path).unwrap(), std::fs::read_to_string(&clean_dict).unwrap());
  }

  #[tokio::test]
  async fn annotation_then_rerun_makes_no_calls() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("q.json");
    let dict_path = dir.path().join("dict.json");
    let svc = TableDisambiguator::new(&[
      ('大', "dà", "大人"),
      ('人', "rén", "大人"),
      ('高', "gāo", "高山"),
      ('山', "shān", "高山"),
    ]);
    let records = vec![
      sample_record(1, "大人", &["高"]),
      sample_record(2, "高山", &["人"]),
      sample_record(3, "?", &["1"]),
    ];

    let (records, summary) = annotate_records(
      &path, records, ReadingDictionary::load(&dict_path), &svc, &fast_retry(), BatchRunner::new(1, 1),
    )
    .await
    .unwrap();
    assert_eq!(summary.resolved_via_external, 2);
    assert_eq!(summary.skipped, 1);
    let calls = svc.calls();
    let snapshot = std::fs::read_to_string(&path).unwrap();

    let (_, again) = annotate_records(
      &path, records, ReadingDictionary::load(&dict_path), &svc, &fast_retry(), BatchRunner::new(2, 1),
    )
    .await
    .unwrap();
    assert_eq!(svc.calls(), calls);
    assert_eq!(again.skipped, 3);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), snapshot);
    assert_eq!(ReadingDictionary::load(&dict_path).len(), 4);
  }

  #[tokio::test]
  async fn feedback_phrases_land_in_their_partition() {
    let dir = tempfile::tempdir().unwrap();
    let root = AudioCache::open(dir.path(), "mp3", "/audio/");
    let phrases = vec!["太棒了！".to_string(), "再想一想哦。".to_string(), "太棒了！".to_string()];

    let (mapping, summary) = synthesize_feedback(
      &phrases, root.partition("feedback"), "feedback.json",
      &synth(ScriptedTts::new(&[], usize::MAX)), BatchRunner::new(2, 1),
    )
    .await
    .unwrap();
    assert_eq!(summary.synthesized, 2);
    assert_eq!(mapping.len(), 2);
    let name = &mapping["太棒了！"];
    assert!(dir.path().join("feedback").join(name).is_file());

    let (_, again) = synthesize_feedback(
      &phrases, root.partition("feedback"), "feedback.json",
      &synth(ScriptedTts::new(&[], 0)), BatchRunner::new(2, 1),
    )
    .await
    .unwrap();
    assert_eq!(again.skipped, 2);
    assert_eq!(again.synthesized, 0);
    assert!(dir.path().join("feedback").join("feedback.json").is_file());
  }
}
