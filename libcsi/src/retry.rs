//! Exponential retry policy shared by the driver connection, the readiness
//! probe and the attacher's work queues.

use std::time::Duration;

pub use ::backoff::backoff::Backoff;
pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::{Error as BackoffError, ExponentialBackoff};

/// Doubling from `initial` up to `max`, without jitter and without giving up.
pub fn retry_policy(initial: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: max,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_then_holds_at_max() {
        let mut policy = retry_policy(Duration::from_secs(1), Duration::from_secs(10));
        let waits: Vec<_> = (0..6).map(|_| policy.next_backoff()).collect();
        assert_eq!(
            waits,
            [1, 2, 4, 8, 10, 10].map(|s| Some(Duration::from_secs(s)))
        );

        policy.reset();
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(1)));
    }
}
