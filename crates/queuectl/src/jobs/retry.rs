use std::time::Duration;

/// Longest delay the policy will ever produce.
pub const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Dead,
}

/// `attempts` is the post-increment failure count returned by `fail`.
pub fn decide(attempts: i32, max_retries: i32, backoff_base: f64) -> RetryDecision {
    if attempts < max_retries {
        RetryDecision::Retry {
            delay: backoff_delay(attempts, backoff_base),
        }
    } else {
        RetryDecision::Dead
    }
}

/// `backoff_base ^ attempts` seconds, capped at [`MAX_DELAY`].
pub fn backoff_delay(attempts: i32, backoff_base: f64) -> Duration {
    let exp = attempts.max(0);
    let secs = backoff_base.max(1.0).powi(exp);

    if !secs.is_finite() || secs >= MAX_DELAY.as_secs_f64() {
        return MAX_DELAY;
    }
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially_with_attempts() {
        assert_eq!(backoff_delay(1, 2.0), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, 2.0), Duration::from_secs(4));
        assert_eq!(backoff_delay(3, 2.0), Duration::from_secs(8));
        assert_eq!(backoff_delay(2, 3.0), Duration::from_secs(9));
    }

    #[test]
    fn retries_until_ceiling_then_dead() {
        assert_eq!(
            decide(1, 3, 2.0),
            RetryDecision::Retry {
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            decide(2, 3, 2.0),
            RetryDecision::Retry {
                delay: Duration::from_secs(4)
            }
        );
        assert_eq!(decide(3, 3, 2.0), RetryDecision::Dead);
        assert_eq!(decide(7, 3, 2.0), RetryDecision::Dead);
    }

    #[test]
    fn single_attempt_budget_dies_on_first_failure() {
        assert_eq!(decide(1, 1, 2.0), RetryDecision::Dead);
    }

    #[test]
    fn huge_exponents_are_capped() {
        assert_eq!(backoff_delay(10_000, 2.0), MAX_DELAY);
        assert_eq!(backoff_delay(40, 10.0), MAX_DELAY);
    }

    #[test]
    fn base_one_means_constant_one_second() {
        assert_eq!(backoff_delay(5, 1.0), Duration::from_secs(1));
    }

    #[test]
    fn decision_is_deterministic() {
        let a = decide(2, 3, 1.5);
        let b = decide(2, 3, 1.5);
        assert_eq!(a, b);
    }
}
