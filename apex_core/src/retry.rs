//! Bounded exponential backoff, shared by every subsystem that dispatches to
//! an upstream it does not control.
//!
//! The first-delay question (`backoff_factor^0` vs `backoff_factor^1`) is
//! not guessable from the distilled description alone, so both formulas are
//! implemented and selected explicitly via [`BackoffFormula`] rather than
//! silently picking one.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which exponent the retry attempt counter is plugged into.
///
/// `Literal` matches `gateway-service/app/core/retry.py`: `delay =
/// backoff_factor ** attempt` with `attempt` starting at 0, so the first
/// retry waits exactly `backoff_factor^0 = 1` second regardless of the
/// configured factor. `ShiftedByOne` instead starts the exponent at 1, so
/// the first retry already reflects the configured factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffFormula {
  #[default]
  Literal,
  ShiftedByOne,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub backoff_factor: f64,
  pub max_delay: Duration,
  pub formula: BackoffFormula,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      backoff_factor: 2.0,
      max_delay: Duration::from_secs(30),
      formula: BackoffFormula::default(),
    }
  }
}

impl RetryPolicy {
  /// Delay before the `attempt`-th retry (0-indexed: `attempt == 0` is the
  /// first retry after the original call failed).
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    let exponent = match self.formula {
      BackoffFormula::Literal => attempt,
      BackoffFormula::ShiftedByOne => attempt + 1,
    };
    let seconds = self.backoff_factor.powi(exponent as i32);
    let capped = seconds.min(self.max_delay.as_secs_f64()).max(0.0);
    Duration::from_secs_f64(capped)
  }

  pub fn should_retry(&self, attempt: u32) -> bool {
    attempt < self.max_retries
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn literal_formula_first_delay_is_one_second() {
    let policy = RetryPolicy {
      max_retries: 4,
      backoff_factor: 2.0,
      max_delay: Duration::from_secs(30),
      formula: BackoffFormula::Literal,
    };
    assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
    assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
  }

  #[test]
  fn shifted_formula_first_delay_reflects_factor() {
    let policy = RetryPolicy {
      max_retries: 4,
      backoff_factor: 2.0,
      max_delay: Duration::from_secs(30),
      formula: BackoffFormula::ShiftedByOne,
    };
    assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
    assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
  }

  #[test]
  fn delay_is_capped_at_max_delay() {
    let policy = RetryPolicy {
      max_retries: 10,
      backoff_factor: 2.0,
      max_delay: Duration::from_secs(10),
      formula: BackoffFormula::Literal,
    };
    assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(10));
  }

  #[test]
  fn should_retry_respects_max_retries() {
    let policy = RetryPolicy {
      max_retries: 2,
      ..RetryPolicy::default()
    };
    assert!(policy.should_retry(0));
    assert!(policy.should_retry(1));
    assert!(!policy.should_retry(2));
  }
}
