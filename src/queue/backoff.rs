//! Retry delay for transient send failures.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with equal jitter: attempt `n` waits between half and all of
/// `min(cap, base * 2^(n-1))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
  pub base: Duration,
  pub cap: Duration,
  pub jitter: bool,
}

impl Default for Backoff {
  fn default() -> Self {
    Self {
      base: Duration::from_secs(1),
      cap: Duration::from_secs(30),
      jitter: true,
    }
  }
}

impl Backoff {
  /// Upper bound of the delay before retry number `attempt` (1-based).
  pub fn ceiling(&self, attempt: u32) -> Duration {
    let exp = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    self.base.saturating_mul(exp).min(self.cap)
  }

  pub fn delay(&self, attempt: u32) -> Duration {
    let ceiling = self.ceiling(attempt);
    if !self.jitter || ceiling.is_zero() {
      return ceiling;
    }

    let half = ceiling / 2;
    let spread = u64::try_from(half.as_millis()).unwrap_or(u64::MAX);
    half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ceiling_doubles_until_cap() {
    let backoff = Backoff::default();
    assert_eq!(backoff.ceiling(1), Duration::from_secs(1));
    assert_eq!(backoff.ceiling(2), Duration::from_secs(2));
    assert_eq!(backoff.ceiling(5), Duration::from_secs(16));
    assert_eq!(backoff.ceiling(6), Duration::from_secs(30));
    assert_eq!(backoff.ceiling(40), Duration::from_secs(30));
  }

  #[test]
  fn test_jitter_stays_within_bounds() {
    let backoff = Backoff::default();
    for attempt in 1..10 {
      let ceiling = backoff.ceiling(attempt);
      let delay = backoff.delay(attempt);
      assert!(delay >= ceiling / 2, "attempt {attempt}: {delay:?} below half of {ceiling:?}");
      assert!(delay <= ceiling, "attempt {attempt}: {delay:?} above {ceiling:?}");
    }
  }

  #[test]
  fn test_without_jitter_is_exact() {
    let backoff = Backoff {
      jitter: false,
      ..Backoff::default()
    };
    assert_eq!(backoff.delay(3), Duration::from_secs(4));
  }
}
