//! Exponential backoff for throttled calls to external services.
//!
//! Only `Error::RateLimited` is retried. Every other error, and the last
//! throttling error once the budget is spent, goes straight back to the
//! caller, which counts it as a failed job.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::{LlmCfg, TtsCfg};
use crate::error::Result;

/// How many times a throttled call is retried and how long to wait.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub max_retries: u32,
  /// Doubles each attempt.
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self { max_retries: 3, base_delay: Duration::from_millis(1000), max_delay: Duration::from_secs(30) }
  }
}

impl RetryPolicy {
  fn from_millis(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
    Self {
      max_retries,
      base_delay: Duration::from_millis(base_delay_ms),
      max_delay: Duration::from_millis(max_delay_ms),
    }
  }
}

impl From<&TtsCfg> for RetryPolicy {
  fn from(cfg: &TtsCfg) -> Self {
    Self::from_millis(cfg.max_retries, cfg.base_delay_ms, cfg.max_delay_ms)
  }
}

impl From<&LlmCfg> for RetryPolicy {
  fn from(cfg: &LlmCfg) -> Self {
    Self::from_millis(cfg.max_retries, cfg.base_delay_ms, cfg.max_delay_ms)
  }
}

/// `min(base * 2^attempt + jitter, max)`, jitter 0-25% of the base.
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
  let base = policy.base_delay.saturating_mul(2u32.saturating_pow(attempt)).min(policy.max_delay);
  let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..0.25));
  (base + jitter).min(policy.max_delay)
}

/// Run `call` until it succeeds, fails with a non-throttling error, or the
/// retry budget is spent. `service` only labels the log line.
pub async fn retry_rate_limited<T, F, Fut>(policy: &RetryPolicy, service: &'static str, mut call: F) -> Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let mut attempt = 0;
  loop {
    match call().await {
      Err(e) if e.is_rate_limited() && attempt < policy.max_retries => {
        let delay = delay_for_attempt(policy, attempt);
        warn!(target: "pipeline", service, attempt = attempt + 1, max = policy.max_retries, ?delay, error = %e, "Throttled; backing off");
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      other => return other,
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;
  use crate::error::Error;

  pub(crate) fn fast_retry() -> RetryPolicy {
    RetryPolicy { max_retries: 3, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5) }
  }

  #[test]
  fn backoff_doubles_and_caps() {
    let policy = RetryPolicy { max_retries: 5, base_delay: Duration::from_millis(100), max_delay: Duration::from_secs(1) };
    let d0 = delay_for_attempt(&policy, 0);
    let d2 = delay_for_attempt(&policy, 2);
    assert!(d0 >= Duration::from_millis(100) && d0 <= Duration::from_millis(125), "{d0:?}");
    assert!(d2 >= Duration::from_millis(400) && d2 <= Duration::from_millis(500), "{d2:?}");
    assert_eq!(delay_for_attempt(&policy, 10), Duration::from_secs(1));
  }

  #[tokio::test]
  async fn gives_up_after_the_budget() {
    let counter = AtomicUsize::new(0);
    let calls = &counter;
    let out: Result<()> = retry_rate_limited(&fast_retry(), "test", move || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Err(Error::RateLimited("slow down".into()))
    })
    .await;
    assert!(out.unwrap_err().is_rate_limited());
    assert_eq!(counter.load(Ordering::SeqCst), 4);
  }

  #[tokio::test]
  async fn other_errors_return_at_once() {
    let counter = AtomicUsize::new(0);
    let calls = &counter;
    let out: Result<()> = retry_rate_limited(&fast_retry(), "test", move || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Err(Error::Malformed("nope".into()))
    })
    .await;
    assert!(matches!(out, Err(Error::Malformed(_))));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn llm_section_builds_its_own_policy() {
    let cfg = LlmCfg { max_retries: 5, base_delay_ms: 250, max_delay_ms: 4000, ..LlmCfg::default() };
    let p = RetryPolicy::from(&cfg);
    assert_eq!(p.max_retries, 5);
    assert_eq!(p.base_delay, Duration::from_millis(250));
    assert_eq!(p.max_delay, Duration::from_secs(4));
  }
}
