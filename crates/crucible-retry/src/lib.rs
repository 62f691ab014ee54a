//! Shared exponential-backoff-with-jitter used by the dispatcher, queue
//! consumers, and HTTP clients.
//!
//! `next_delay` is a pure function of `(attempt, policy)` when jitter is
//! disabled, which is what the deterministic tests rely on. With jitter on,
//! a uniform `[0, 0.25·delay]` fudge is added to spread thundering herds.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// First-attempt delay.
    pub base: Duration,
    /// Multiplier applied per attempt.
    pub exponential_base: f64,
    /// Hard cap on any single delay.
    pub max_delay: Duration,
    /// Attempts after the first delivery before the envelope dead-letters.
    pub max_retries: u32,
    /// Uniform `[0, 0.25·delay]` jitter. Off = deterministic.
    pub jitter: bool,
}

/// Balanced policy for ordinary transient failures.
pub fn default_policy() -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_secs(2),
        exponential_base: 2.0,
        max_delay: Duration::from_secs(300),
        max_retries: 5,
        jitter: true,
    }
}

/// Fast-recovery policy for 429-class transient errors (orchestrator API
/// pressure). More attempts, gentler growth.
pub fn aggressive() -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_secs(1),
        exponential_base: 1.5,
        max_delay: Duration::from_secs(600),
        max_retries: 10,
        jitter: true,
    }
}

/// Few, widely spaced, deterministic attempts. Used where retrying is itself
/// expensive (cleanup watch reconnects).
pub fn conservative() -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_secs(5),
        exponential_base: 2.0,
        max_delay: Duration::from_secs(300),
        max_retries: 3,
        jitter: false,
    }
}

// ---------------------------------------------------------------------------
// next_delay
// ---------------------------------------------------------------------------

/// Delay before retry number `attempt` (0-based: attempt 0 is the first
/// retry after the initial failure).
///
/// `delay = min(max_delay, base · exponential_base^attempt)`, plus jitter
/// when enabled.
pub fn next_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exp = policy.exponential_base.powi(attempt.min(64) as i32);
    let raw = policy.base.as_secs_f64() * exp;
    let capped = raw.min(policy.max_delay.as_secs_f64());

    let jittered = if policy.jitter {
        capped + rand::thread_rng().gen_range(0.0..=capped * 0.25)
    } else {
        capped
    };

    Duration::from_secs_f64(jittered)
}

/// True while `attempt` (0-based) is still within the policy's budget.
pub fn should_retry(attempt: u32, policy: &RetryPolicy) -> bool {
    attempt < policy.max_retries
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Whether a failed HTTP call to an executor driver is worth retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection errors, timeouts, 408, 429, 5xx.
    Retryable,
    /// Everything else (4xx minus 408/429): retrying cannot help.
    Fatal,
}

/// Classify an HTTP status code received from an executor driver.
pub fn classify_http(status: u16) -> ErrorClass {
    match status {
        408 | 429 => ErrorClass::Retryable,
        500..=599 => ErrorClass::Retryable,
        400..=499 => ErrorClass::Fatal,
        // Informational/redirect codes do not surface as errors in practice;
        // treat them as retryable noise rather than a permanent failure.
        _ => ErrorClass::Retryable,
    }
}

/// Transport-level failures (no status line at all) are always retryable.
pub fn classify_transport() -> ErrorClass {
    ErrorClass::Retryable
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(mut p: RetryPolicy) -> RetryPolicy {
        p.jitter = false;
        p
    }

    #[test]
    fn default_policy_delays_grow_exponentially_to_the_cap() {
        let p = no_jitter(default_policy());
        assert_eq!(next_delay(0, &p), Duration::from_secs(2));
        assert_eq!(next_delay(1, &p), Duration::from_secs(4));
        assert_eq!(next_delay(2, &p), Duration::from_secs(8));
        // 2 * 2^10 = 2048s, capped at 300s.
        assert_eq!(next_delay(10, &p), Duration::from_secs(300));
    }

    #[test]
    fn conservative_policy_is_deterministic_as_shipped() {
        let p = conservative();
        assert!(!p.jitter);
        assert_eq!(next_delay(0, &p), Duration::from_secs(5));
        assert_eq!(next_delay(1, &p), Duration::from_secs(10));
        assert_eq!(next_delay(2, &p), Duration::from_secs(20));
    }

    #[test]
    fn jitter_stays_within_a_quarter_of_the_delay() {
        let p = default_policy();
        for attempt in 0..6 {
            let base = next_delay(attempt, &no_jitter(p.clone()));
            for _ in 0..50 {
                let d = next_delay(attempt, &p);
                assert!(d >= base, "jitter must only add");
                assert!(d <= base + base.mul_f64(0.25) + Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn retry_budget_is_exclusive_of_max() {
        let p = conservative();
        assert!(should_retry(0, &p));
        assert!(should_retry(2, &p));
        assert!(!should_retry(3, &p));
    }

    #[test]
    fn classification_matches_the_dispatch_table() {
        assert_eq!(classify_http(408), ErrorClass::Retryable);
        assert_eq!(classify_http(429), ErrorClass::Retryable);
        assert_eq!(classify_http(500), ErrorClass::Retryable);
        assert_eq!(classify_http(503), ErrorClass::Retryable);
        assert_eq!(classify_http(400), ErrorClass::Fatal);
        assert_eq!(classify_http(404), ErrorClass::Fatal);
        assert_eq!(classify_http(422), ErrorClass::Fatal);
        assert_eq!(classify_transport(), ErrorClass::Retryable);
    }
}
