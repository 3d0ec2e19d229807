//! Retry policy evaluation.
//!
//! A [`RetryPolicy`] is a pure value: given an attempt number it produces the
//! next backoff interval, and given the failure context it decides whether
//! retrying should stop. The executor consumes it for history pagination and
//! hands it to activity and child-workflow attributes unchanged.

use serde::{Deserialize, Serialize};

const DEFAULT_BACKOFF_COEFFICIENT: f64 = 2.0;
const DEFAULT_MAXIMUM_MULTIPLIER: i64 = 100;
const DEFAULT_INITIAL_INTERVAL_MS: i64 = 1_000;

/// Retry behavior for a retryable operation.
///
/// Unset numeric fields are zero, unset intervals are `None`; callers that
/// need fully resolved values go through [`RetryPolicy::validate_with_defaults`].
/// A `None` non-retryable list means "not configured" (a merge keeps looking
/// at lower-precedence sources), while an empty list means "retry nothing is
/// excluded" - every error type is retryable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Interval before the first retry, in milliseconds. Required once
    /// validated; defaults to one second.
    pub initial_interval_ms: Option<i64>,

    /// Multiplier applied to the previous interval for each further retry.
    /// Zero means unset; the default is 2.0. Must be >= 1.0 when set.
    pub backoff_coefficient: f64,

    /// Cap on the number of attempts. Zero means unlimited.
    pub maximum_attempts: i32,

    /// Cap on the computed interval. When unset the cap is 100x the initial
    /// interval.
    pub maximum_interval_ms: Option<i64>,

    /// Error types that are never retried.
    pub non_retryable_types: Option<Vec<String>>,
}

impl RetryPolicy {
    /// Create an empty (fully unset) policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interval before the first retry.
    pub fn with_initial_interval_ms(mut self, millis: i64) -> Self {
        self.initial_interval_ms = Some(millis);
        self
    }

    /// Set the backoff coefficient.
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the maximum number of attempts.
    pub fn with_maximum_attempts(mut self, attempts: i32) -> Self {
        self.maximum_attempts = attempts;
        self
    }

    /// Set the cap on the computed interval.
    pub fn with_maximum_interval_ms(mut self, millis: i64) -> Self {
        self.maximum_interval_ms = Some(millis);
        self
    }

    /// Set the error types that are never retried.
    pub fn with_non_retryable_types(mut self, types: Vec<String>) -> Self {
        self.non_retryable_types = Some(types);
        self
    }

    /// Check every configured field against its validity rule.
    pub fn validate(&self) -> crate::error::Result<()> {
        if let Some(initial) = self.initial_interval_ms {
            if initial <= 0 {
                return Err(crate::error::WorkerError::InvalidConfiguration(format!(
                    "invalid initial interval: {initial}ms"
                )));
            }
        }
        if self.backoff_coefficient != 0.0 && self.backoff_coefficient < 1.0 {
            return Err(crate::error::WorkerError::InvalidConfiguration(format!(
                "backoff coefficient less than 1.0: {}",
                self.backoff_coefficient
            )));
        }
        if self.maximum_attempts < 0 {
            return Err(crate::error::WorkerError::InvalidConfiguration(format!(
                "invalid maximum attempts: {}",
                self.maximum_attempts
            )));
        }
        if let Some(maximum) = self.maximum_interval_ms {
            if maximum <= 0 {
                return Err(crate::error::WorkerError::InvalidConfiguration(format!(
                    "invalid maximum interval: {maximum}ms"
                )));
            }
        }
        Ok(())
    }

    /// Validate and resolve defaults: one second initial interval, 2.0
    /// coefficient, empty non-retryable list.
    pub fn validate_with_defaults(&self) -> crate::error::Result<RetryPolicy> {
        self.validate()?;
        Ok(RetryPolicy {
            initial_interval_ms: Some(
                self.initial_interval_ms
                    .filter(|ms| *ms > 0)
                    .unwrap_or(DEFAULT_INITIAL_INTERVAL_MS),
            ),
            backoff_coefficient: if self.backoff_coefficient == 0.0 {
                DEFAULT_BACKOFF_COEFFICIENT
            } else {
                self.backoff_coefficient
            },
            maximum_attempts: self.maximum_attempts,
            maximum_interval_ms: self.maximum_interval_ms,
            non_retryable_types: Some(self.non_retryable_types.clone().unwrap_or_default()),
        })
    }

    /// Merge a definition-level default policy with explicitly supplied
    /// options. Explicit non-default values win; for the non-retryable list,
    /// an explicit non-`None` list wins even when empty.
    pub fn merge(defaults: Option<&RetryPolicy>, explicit: Option<&RetryPolicy>) -> Option<RetryPolicy> {
        let defaults = match defaults {
            Some(d) => d,
            None => return explicit.cloned(),
        };
        let explicit = match explicit {
            Some(e) => e,
            None => return Some(defaults.clone()),
        };
        Some(RetryPolicy {
            initial_interval_ms: explicit.initial_interval_ms.or(defaults.initial_interval_ms),
            backoff_coefficient: if explicit.backoff_coefficient != 0.0 {
                explicit.backoff_coefficient
            } else {
                defaults.backoff_coefficient
            },
            maximum_attempts: if explicit.maximum_attempts != 0 {
                explicit.maximum_attempts
            } else {
                defaults.maximum_attempts
            },
            maximum_interval_ms: explicit.maximum_interval_ms.or(defaults.maximum_interval_ms),
            non_retryable_types: explicit
                .non_retryable_types
                .clone()
                .or_else(|| defaults.non_retryable_types.clone()),
        })
    }

    /// Backoff before the given 1-based attempt, in milliseconds.
    ///
    /// `initial * coefficient^(attempt-1)`, capped at the maximum interval,
    /// or at 100x the initial interval when no maximum is configured.
    pub fn sleep_time_ms(&self, attempt: i64) -> i64 {
        let coefficient = if self.backoff_coefficient == 0.0 {
            DEFAULT_BACKOFF_COEFFICIENT
        } else {
            self.backoff_coefficient
        };
        let initial = self.initial_interval_ms.unwrap_or(DEFAULT_INITIAL_INTERVAL_MS);
        let raw = coefficient.powi((attempt - 1) as i32) * initial as f64;
        match self.maximum_interval_ms {
            None => (raw.min((initial * DEFAULT_MAXIMUM_MULTIPLIER) as f64)) as i64,
            Some(maximum) => (raw as i64).min(maximum),
        }
    }

    /// Whether retrying should stop after a failure of `error_type` on the
    /// given 1-based attempt, with `elapsed_ms` spent so far and
    /// `sleep_time_ms` about to be slept. `expiration_ms`, when set, is an
    /// absolute budget on elapsed + sleep.
    pub fn should_stop(
        &self,
        error_type: &str,
        attempt: i64,
        elapsed_ms: i64,
        sleep_time_ms: i64,
        expiration_ms: Option<i64>,
    ) -> bool {
        if let Some(types) = &self.non_retryable_types {
            if types.iter().any(|t| t == error_type) {
                return true;
            }
        }
        if self.maximum_attempts != 0 && attempt >= self.maximum_attempts as i64 {
            return true;
        }
        match expiration_ms {
            Some(expiration) => elapsed_ms + sleep_time_ms >= expiration,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new()
            .with_initial_interval_ms(1_000)
            .with_backoff_coefficient(2.0)
            .with_maximum_interval_ms(10_000)
            .with_maximum_attempts(5)
            .with_non_retryable_types(vec!["X".to_string()])
    }

    #[test]
    fn test_sleep_time_exponential_with_cap() {
        let p = policy();
        let observed: Vec<i64> = (1..=6).map(|a| p.sleep_time_ms(a)).collect();
        assert_eq!(observed, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
    }

    #[test]
    fn test_sleep_time_default_cap_is_100x_initial() {
        let p = RetryPolicy::new()
            .with_initial_interval_ms(100)
            .with_backoff_coefficient(10.0);
        // 100 * 10^3 = 100_000 > 100 * 100 cap
        assert_eq!(p.sleep_time_ms(4), 10_000);
    }

    #[test]
    fn test_sleep_time_unset_coefficient_defaults_to_two() {
        let p = RetryPolicy::new().with_initial_interval_ms(500);
        assert_eq!(p.sleep_time_ms(1), 500);
        assert_eq!(p.sleep_time_ms(2), 1_000);
        assert_eq!(p.sleep_time_ms(3), 2_000);
    }

    #[test]
    fn test_should_stop_on_non_retryable_type() {
        let p = policy();
        assert!(p.should_stop("X", 1, 0, 1_000, None));
        assert!(!p.should_stop("Y", 1, 0, 1_000, None));
    }

    #[test]
    fn test_should_stop_on_attempt_limit() {
        let p = policy();
        assert!(p.should_stop("Y", 5, 99_999, 10_000, None));
        assert!(!p.should_stop("Y", 4, 0, 0, None));
    }

    #[test]
    fn test_should_stop_on_expiration() {
        let p = RetryPolicy::new().with_initial_interval_ms(1_000);
        assert!(p.should_stop("Y", 1, 4_000, 1_000, Some(5_000)));
        assert!(!p.should_stop("Y", 1, 3_999, 1_000, Some(5_001)));
    }

    #[test]
    fn test_unlimited_attempts_when_unset() {
        let p = RetryPolicy::new().with_initial_interval_ms(1_000);
        assert!(!p.should_stop("Y", 1_000_000, 0, 0, None));
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        assert!(RetryPolicy::new()
            .with_initial_interval_ms(0)
            .validate()
            .is_err());
        assert!(RetryPolicy::new()
            .with_backoff_coefficient(0.5)
            .validate()
            .is_err());
        assert!(RetryPolicy::new()
            .with_maximum_interval_ms(-1)
            .validate()
            .is_err());
        assert!(policy().validate().is_ok());
    }

    #[test]
    fn test_validate_with_defaults_fills_unset_fields() {
        let resolved = RetryPolicy::new().validate_with_defaults().unwrap();
        assert_eq!(resolved.initial_interval_ms, Some(1_000));
        assert_eq!(resolved.backoff_coefficient, 2.0);
        assert_eq!(resolved.maximum_attempts, 0);
        assert_eq!(resolved.non_retryable_types, Some(vec![]));
    }

    #[test]
    fn test_merge_explicit_wins() {
        let defaults = RetryPolicy::new()
            .with_initial_interval_ms(1_000)
            .with_maximum_attempts(3)
            .with_non_retryable_types(vec!["A".to_string()]);
        let explicit = RetryPolicy::new().with_initial_interval_ms(2_000);
        let merged = RetryPolicy::merge(Some(&defaults), Some(&explicit)).unwrap();
        assert_eq!(merged.initial_interval_ms, Some(2_000));
        assert_eq!(merged.maximum_attempts, 3);
        assert_eq!(merged.non_retryable_types, Some(vec!["A".to_string()]));
    }

    #[test]
    fn test_merge_empty_list_means_retry_everything() {
        let defaults = RetryPolicy::new().with_non_retryable_types(vec!["A".to_string()]);
        let explicit = RetryPolicy::new().with_non_retryable_types(vec![]);
        let merged = RetryPolicy::merge(Some(&defaults), Some(&explicit)).unwrap();
        assert_eq!(merged.non_retryable_types, Some(vec![]));
        assert!(!merged.should_stop("A", 1, 0, 0, None));
    }

    #[test]
    fn test_merge_with_missing_sides() {
        let p = policy();
        assert_eq!(RetryPolicy::merge(None, Some(&p)), Some(p.clone()));
        assert_eq!(RetryPolicy::merge(Some(&p), None), Some(p.clone()));
        assert_eq!(RetryPolicy::merge(None, None), None);
    }

    proptest! {
        #[test]
        fn prop_sleep_time_monotone_until_capped(
            initial in 1i64..10_000,
            coefficient in 1.0f64..4.0,
            maximum in 1i64..1_000_000,
        ) {
            let p = RetryPolicy::new()
                .with_initial_interval_ms(initial)
                .with_backoff_coefficient(coefficient)
                .with_maximum_interval_ms(maximum);
            let mut previous = 0;
            for attempt in 1..30 {
                let sleep = p.sleep_time_ms(attempt);
                prop_assert!(sleep >= previous);
                prop_assert!(sleep <= maximum);
                previous = sleep;
            }
        }
    }
}
