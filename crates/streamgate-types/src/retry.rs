//! Canonical and public retry-policy shapes, and the normalizer between them.
//!
//! The canonical shape is what gets stored on a `streams` row:
//! `max_retry_attempts`, `backoff_coefficient`, `maximum_interval_seconds`.
//! The public shape is what producers write in a publish call or in a
//! message envelope's `policies` section; it accepts a duration string or a
//! plain number of seconds for the interval.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default values baked into the `streams` table DDL (see `spec.md` §6).
pub const DEFAULT_MAX_RETRY_ATTEMPTS: i32 = 3;
pub const DEFAULT_BACKOFF_COEFFICIENT: f64 = 10.0;
pub const DEFAULT_MAXIMUM_INTERVAL_SECONDS: i32 = 120;

/// Alternate "sentinel" max-attempts value seen on rows inserted before an
/// explicit policy was attached to a message. `spec.md` §4.2 documents both
/// 3 and 5 as sentinel values for `max_retry_attempts`; anything else means
/// an explicit policy was supplied and must be re-injected into the envelope
/// on fetch.
const ALT_SENTINEL_MAX_RETRY_ATTEMPTS: i32 = 5;

/// Canonical, storage-shape retry policy: one row per message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retry_attempts: i32,
    pub backoff_coefficient: f64,
    pub maximum_interval_seconds: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            backoff_coefficient: DEFAULT_BACKOFF_COEFFICIENT,
            maximum_interval_seconds: DEFAULT_MAXIMUM_INTERVAL_SECONDS,
        }
    }
}

impl RetryPolicy {
    /// True when this policy is indistinguishable from "no explicit policy
    /// was supplied" — i.e. matches one of the two sentinel defaults the
    /// database would produce on its own. Used to decide whether
    /// `_streamRetryConfig` needs to be re-injected into a fetched envelope
    /// (`spec.md` §4.2, §9 "Retry config leakage").
    pub fn is_sentinel_default(&self) -> bool {
        (self.max_retry_attempts == DEFAULT_MAX_RETRY_ATTEMPTS
            || self.max_retry_attempts == ALT_SENTINEL_MAX_RETRY_ATTEMPTS)
            && self.backoff_coefficient == DEFAULT_BACKOFF_COEFFICIENT
            && self.maximum_interval_seconds == DEFAULT_MAXIMUM_INTERVAL_SECONDS
    }

    /// The visibility delay for the next retry attempt, per `spec.md` §4.5:
    /// `now + min(backoffCoefficient ^ attempt, maximumInterval)` seconds.
    pub fn next_visibility_delay(&self, attempt: i32) -> Duration {
        let raw = self.backoff_coefficient.powi(attempt.max(0));
        let capped = raw.min(self.maximum_interval_seconds as f64).max(0.0);
        Duration::from_secs_f64(capped)
    }

    /// Whether another attempt is permitted given the current attempt count.
    pub fn allows_attempt(&self, attempt: i32) -> bool {
        attempt < self.max_retry_attempts
    }
}

/// A `maximumInterval` as accepted from producers: either a bare number of
/// seconds or a duration string like `"300s"` / `"5m"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaximumInterval {
    Seconds(i64),
    Duration(String),
}

impl MaximumInterval {
    fn to_seconds(&self) -> Result<i32, String> {
        match self {
            MaximumInterval::Seconds(s) => Ok(*s as i32),
            MaximumInterval::Duration(s) => parse_duration_seconds(s),
        }
    }
}

/// Parses `"300s"`, `"5m"`, `"2h"` into whole seconds. Bare digits are
/// treated as seconds.
fn parse_duration_seconds(s: &str) -> Result<i32, String> {
    let s = s.trim();
    if let Ok(n) = s.parse::<i64>() {
        return Ok(n as i32);
    }
    let (num, unit) = s.split_at(s.len().saturating_sub(1));
    let n: i64 = num
        .parse()
        .map_err(|_| format!("invalid duration literal: {s:?}"))?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        other => return Err(format!("unsupported duration unit: {other:?}")),
    };
    Ok(secs as i32)
}

/// The public, producer-facing retry-policy shape. Any field left unset
/// falls back to the canonical default on normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryPolicyInput {
    #[serde(default, alias = "maxRetryAttempts")]
    pub maximum_attempts: Option<i32>,
    #[serde(default)]
    pub backoff_coefficient: Option<f64>,
    #[serde(default)]
    pub maximum_interval: Option<MaximumInterval>,
}

impl RetryPolicyInput {
    /// Whether the producer supplied anything at all. A batch where every
    /// message has an empty input (and no visibility delay) omits retry
    /// columns entirely so the row-level `DEFAULT`s apply (`spec.md` §4.2).
    pub fn is_empty(&self) -> bool {
        self.maximum_attempts.is_none()
            && self.backoff_coefficient.is_none()
            && self.maximum_interval.is_none()
    }

    /// Normalizes into the canonical, storage-shape policy, applying
    /// defaults for any field left unset.
    pub fn normalize(&self) -> Result<RetryPolicy, String> {
        let defaults = RetryPolicy::default();
        let maximum_interval_seconds = match &self.maximum_interval {
            Some(mi) => mi.to_seconds()?,
            None => defaults.maximum_interval_seconds,
        };
        Ok(RetryPolicy {
            max_retry_attempts: self
                .maximum_attempts
                .unwrap_or(defaults.max_retry_attempts),
            backoff_coefficient: self
                .backoff_coefficient
                .unwrap_or(defaults.backoff_coefficient),
            maximum_interval_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_sentinel() {
        assert!(RetryPolicy::default().is_sentinel_default());
    }

    #[test]
    fn alt_sentinel_is_recognized() {
        let p = RetryPolicy {
            max_retry_attempts: 5,
            ..RetryPolicy::default()
        };
        assert!(p.is_sentinel_default());
    }

    #[test]
    fn explicit_policy_is_not_sentinel() {
        let p = RetryPolicy {
            max_retry_attempts: 7,
            backoff_coefficient: 3.0,
            maximum_interval_seconds: 600,
        };
        assert!(!p.is_sentinel_default());
    }

    #[test]
    fn normalizes_seconds_literal() {
        let input = RetryPolicyInput {
            maximum_attempts: Some(7),
            backoff_coefficient: Some(3.0),
            maximum_interval: Some(MaximumInterval::Seconds(600)),
        };
        let p = input.normalize().unwrap();
        assert_eq!(p.max_retry_attempts, 7);
        assert_eq!(p.backoff_coefficient, 3.0);
        assert_eq!(p.maximum_interval_seconds, 600);
    }

    #[test]
    fn normalizes_duration_strings() {
        let cases = [("300s", 300), ("5m", 300), ("2h", 7200)];
        for (literal, expected) in cases {
            let input = RetryPolicyInput {
                maximum_interval: Some(MaximumInterval::Duration(literal.to_string())),
                ..Default::default()
            };
            assert_eq!(input.normalize().unwrap().maximum_interval_seconds, expected);
        }
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let input = RetryPolicyInput::default();
        assert!(input.is_empty());
        assert_eq!(input.normalize().unwrap(), RetryPolicy::default());
    }

    #[test]
    fn next_visibility_delay_caps_at_maximum_interval() {
        let p = RetryPolicy {
            max_retry_attempts: 10,
            backoff_coefficient: 2.0,
            maximum_interval_seconds: 30,
        };
        assert_eq!(p.next_visibility_delay(1).as_secs(), 2);
        assert_eq!(p.next_visibility_delay(3).as_secs(), 8);
        assert_eq!(p.next_visibility_delay(10).as_secs(), 30);
    }

    #[test]
    fn allows_attempt_respects_max() {
        let p = RetryPolicy {
            max_retry_attempts: 4,
            ..RetryPolicy::default()
        };
        assert!(p.allows_attempt(3));
        assert!(!p.allows_attempt(4));
    }
}
