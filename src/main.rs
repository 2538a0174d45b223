//! Hanzi audio prep · offline question-bank builder
//!
//! - Annotates every Han character in the quiz records with a reading and a
//!   child-friendly mnemonic phrase (dictionary first, LLM for the rest)
//! - Synthesizes pronunciation audio into a content-addressed store
//! - Synthesizes the fixed feedback phrases into their own partition
//! - Filters/re-indexes and consistency-checks the record file
//!
//! Important env variables:
//!   OPENAI_API_KEY       : required by `annotate` / `run`
//!   OPENAI_BASE_URL      : overrides [llm].base_url
//!   DASHSCOPE_API_KEY    : required by `audio` / `feedback` / `run`
//!   PIPELINE_CONFIG_PATH : path to TOML config (paths, batch, services, prompts)
//!   CONCURRENCY          : worker count, overrides [batch].concurrency
//!   LOG_LEVEL            : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT           : "pretty" (default) or "json"

mod telemetry;
mod util;
mod error;
mod domain;
mod config;
mod extract;
mod dictionary;
mod resolver;
mod openai;
mod audio_cache;
mod retry;
mod tts;
mod batch;
mod store;
mod pipeline;
mod pinyin;
mod check;

use std::collections::HashSet;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, instrument};

use crate::audio_cache::AudioCache;
use crate::batch::BatchRunner;
use crate::config::{load_pipeline_config, PipelineConfig};
use crate::dictionary::ReadingDictionary;
use crate::openai::OpenAI;
use crate::retry::RetryPolicy;
use crate::tts::{AudioSynthesizer, DashScopeTts, Transcoder};

#[derive(Parser, Debug)]
#[command(name = "hanzi-audio-prep", version, about = "Build the quiz question bank's readings and pronunciation audio")]
struct Cli {
  /// TOML config file
  #[arg(long, env = "PIPELINE_CONFIG_PATH", global = true)]
  config: Option<PathBuf>,

  /// Record file (overrides [paths].records)
  #[arg(long, global = true)]
  records: Option<PathBuf>,

  /// Concurrent workers (overrides [batch].concurrency)
  #[arg(long, env = "CONCURRENCY", global = true)]
  concurrency: Option<usize>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Resolve readings and mnemonic phrases for every character
  Annotate,
  /// Synthesize pronunciation audio for every settled reading
  Audio,
  /// `annotate`, then `audio`
  Run,
  /// Synthesize the feedback phrases
  Feedback,
  /// Remove records by id and re-issue ids 1..n
  Filter {
    #[arg(long, value_delimiter = ',', required = true)]
    remove: Vec<u32>,
  },
  /// Report missing readings, broken audio references and data problems
  Check,
}

fn runner(cfg: &PipelineConfig) -> BatchRunner {
  BatchRunner::new(cfg.batch.concurrency, cfg.batch.checkpoint_every)
}

fn audio_synthesizer(cfg: &PipelineConfig) -> error::Result<AudioSynthesizer> {
  let speech = DashScopeTts::from_env(&cfg.tts)?;
  info!(target: "hanzi_audio_prep", model = %cfg.tts.model, voice = %cfg.tts.voice, "Speech synthesis enabled");
  Ok(AudioSynthesizer::new(Box::new(speech), RetryPolicy::from(&cfg.tts), Transcoder::from(&cfg.audio)))
}

fn audio_cache(cfg: &PipelineConfig) -> AudioCache {
  AudioCache::open(&cfg.paths.audio_dir, &cfg.audio.extension, &cfg.audio.public_prefix)
}

#[instrument(level = "info", skip_all, fields(command = ?cli.command))]
async fn execute(cli: Cli, cfg: PipelineConfig) -> Result<(), Box<dyn std::error::Error>> {
  let records_path = cfg.paths.records.clone();

  match cli.command {
    Command::Annotate => {
      let llm = OpenAI::from_env(&cfg.llm, &cfg.prompts)?;
      let records = store::load_records(&records_path)?;
      let dict = ReadingDictionary::load(&cfg.paths.dictionary);
      let (_, summary) = pipeline::annotate_records(&records_path, records, dict, &llm, &RetryPolicy::from(&cfg.llm), runner(&cfg)).await?;
      println!("annotate: {summary}");
    }
    Command::Audio => {
      let synth = audio_synthesizer(&cfg)?;
      let records = store::load_records(&records_path)?;
      let (_, summary) = pipeline::synthesize_character_audio(
        &records_path, records, audio_cache(&cfg), &synth, &cfg.audio.speech_template, runner(&cfg),
      )
      .await?;
      println!("audio: {summary}");
    }
    Command::Run => {
      let llm = OpenAI::from_env(&cfg.llm, &cfg.prompts)?;
      let synth = audio_synthesizer(&cfg)?;
      let records = store::load_records(&records_path)?;
      let dict = ReadingDictionary::load(&cfg.paths.dictionary);
      let (records, resolved) = pipeline::annotate_records(&records_path, records, dict, &llm, &RetryPolicy::from(&cfg.llm), runner(&cfg)).await?;
      let (_, audio) = pipeline::synthesize_character_audio(
        &records_path, records, audio_cache(&cfg), &synth, &cfg.audio.speech_template, runner(&cfg),
      )
      .await?;
      println!("annotate: {resolved}");
      println!("audio: {audio}");
    }
    Command::Feedback => {
      let synth = audio_synthesizer(&cfg)?;
      let cache = audio_cache(&cfg).partition(&cfg.feedback.subdir);
      let (mapping, summary) = pipeline::synthesize_feedback(
        &cfg.feedback.phrases, cache, &cfg.feedback.mapping_file, &synth, runner(&cfg),
      )
      .await?;
      println!("feedback: {summary} ({} phrases mapped)", mapping.len());
    }
    Command::Filter { remove } => {
      let records = store::load_records(&records_path)?;
      let remove: HashSet<u32> = remove.into_iter().collect();
      let kept = store::filter_and_reindex(records, &remove);
      store::save_records(&records_path, &kept)?;
      println!("filter: {} records remain", kept.len());
    }
    Command::Check => {
      let records = store::load_records(&records_path)?;
      let report = check::check_records(&records, &audio_cache(&cfg));
      for finding in &report.findings {
        println!("{finding}");
      }
      println!("check: {} records, {} errors, {} warnings", report.records, report.errors(), report.warnings());
      if report.errors() > 0 {
        return Err(format!("{} consistency errors", report.errors()).into());
      }
    }
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  let cli = Cli::parse();
  let mut cfg = load_pipeline_config(cli.config.as_deref())?;
  if let Some(path) = &cli.records {
    cfg.paths.records = path.clone();
  }
  if let Some(n) = cli.concurrency {
    cfg.batch.concurrency = n;
  }
  info!(
    target: "hanzi_audio_prep",
    records = %cfg.paths.records.display(),
    concurrency = cfg.batch.concurrency,
    checkpoint_every = cfg.batch.checkpoint_every,
    "Starting"
  );

  execute(cli, cfg).await
}
