//! Bounded-concurrency batch runner with periodic checkpoints.
//!
//! `concurrency` workers share one queue: each pulls the next unclaimed
//! index, runs it, stores the result at that index and goes back for more.
//! Workers are polled together on the current task, so they only overlap
//! while awaiting I/O. Every `checkpoint_every` completions (counted across
//! all workers) the checkpoint callback runs with the completion count.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::join_all;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchRunner {
  concurrency: usize,
  checkpoint_every: usize,
}

impl BatchRunner {
  /// Zero values are raised to one.
  pub fn new(concurrency: usize, checkpoint_every: usize) -> Self {
    Self { concurrency: concurrency.max(1), checkpoint_every: checkpoint_every.max(1) }
  }

  /// Run `work` over every job; results come back in input order.
  pub async fn run<'a, J, R, W, WF, C, CF>(&self, jobs: &'a [J], work: W, on_checkpoint: C) -> Vec<R>
  where
    W: Fn(usize, &'a J) -> WF,
    WF: Future<Output = R>,
    C: Fn(usize) -> CF,
    CF: Future<Output = ()>,
  {
    let total = jobs.len();
    let next = AtomicUsize::new(0);
    let completed = AtomicUsize::new(0);
    let results: Mutex<Vec<Option<R>>> = Mutex::new((0..total).map(|_| None).collect());
    let workers = self.concurrency.min(total.max(1));
    info!(target: "pipeline", total, workers, checkpoint_every = self.checkpoint_every, "Batch started");

    let worker = |worker_id: usize| {
      let (next, completed, results, work, on_checkpoint) = (&next, &completed, &results, &work, &on_checkpoint);
      async move {
        loop {
          let idx = next.fetch_add(1, Ordering::SeqCst);
          if idx >= total {
            break;
          }
          let out = work(idx, &jobs[idx]).await;
          if let Ok(mut slots) = results.lock() {
            slots[idx] = Some(out);
          }
          let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
          debug!(target: "pipeline", worker_id, idx, done, total, "Job finished");
          if done % self.checkpoint_every == 0 && done < total {
            info!(target: "pipeline", done, total, "Checkpoint");
            on_checkpoint(done).await;
          }
        }
      }
    };

    join_all((0..workers).map(worker)).await;

    info!(target: "pipeline", total, "Batch finished");
    results
      .into_inner()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .into_iter()
      .flatten()
      .collect()
  }
}
