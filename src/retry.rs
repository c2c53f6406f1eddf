//! # Retry Engine
//!
//! Error classification and exponential backoff for unreliable agent
//! invocations.
//!
//! ## Overview
//!
//! Agent failures arrive as free-form text (subprocess stderr, API error
//! bodies), so classification is substring-based and case-insensitive, checked
//! in precedence order: rate limiting, then timeouts, then transient
//! network/infrastructure markers, then permanent client-side markers, and
//! finally [`ErrorKind::Unknown`]. Retryable kinds back off exponentially with
//! ±20% uniform jitter so parallel tasks that failed together do not retry in
//! lockstep.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ensemble_core::retry::{RetryEngine, RetryPolicy};
//!
//! async fn demo() {
//!     let engine = RetryEngine::new(RetryPolicy::default());
//!     let outcome = engine
//!         .retry("flaky_op", || async {
//!             Err::<(), String>("connection reset by peer".to_string())
//!         })
//!         .await;
//!     assert!(!outcome.is_success());
//! }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Primary failure categories, ordered here by classification precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rate limiting - retry after backing off
    RateLimit,

    /// The operation ran out of time - retryable
    Timeout,

    /// Infrastructure hiccup that may clear on its own - retryable
    Transient,

    /// Will never succeed if retried - surface immediately
    Permanent,

    /// Nothing matched - treated as non-retryable by the default policy
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "429", "too many requests"];

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "etimedout", "deadline"];

const TRANSIENT_MARKERS: &[&str] = &[
    "network",
    "connection",
    "econnrefused",
    "econnreset",
    "socket",
    "temporarily unavailable",
    "service unavailable",
    "bad gateway",
    "502",
    "503",
    "504",
];

const PERMANENT_MARKERS: &[&str] = &[
    "not found",
    "404",
    "unauthorized",
    "401",
    "forbidden",
    "403",
    "invalid",
];

/// Classify an error message by substring matching, case-insensitive.
///
/// Precedence matters: "gateway timeout" is a [`ErrorKind::Timeout`], not a
/// transient 504, because timeout markers are checked first.
pub fn classify_error(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();

    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::RateLimit
    } else if TIMEOUT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::Timeout
    } else if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::Transient
    } else if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::Permanent
    } else {
        ErrorKind::Unknown
    }
}

/// Retry behavior knobs. Defaults match the engine-wide configuration
/// defaults: three additional attempts, 1s initial delay doubling up to 60s,
/// jitter on.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// ±20% uniform jitter on each computed delay.
    pub jitter: bool,
    pub retryable: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
            retryable: [ErrorKind::Transient, ErrorKind::RateLimit, ErrorKind::Timeout]
                .into_iter()
                .collect(),
        }
    }
}

const JITTER_FACTOR: f64 = 0.2;

/// The terminal error of a retry sequence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct RetryError {
    pub kind: ErrorKind,
    pub message: String,
}

/// What a retry sequence produced: the final result plus how much work it
/// took to get there.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: std::result::Result<T, RetryError>,
    /// Total attempts made, including the first.
    pub attempts: u32,
    /// Time actually spent sleeping between attempts.
    pub total_delay: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> std::result::Result<T, RetryError> {
        self.result
    }
}

/// Executes operations under a [`RetryPolicy`]. Stateless between calls;
/// cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct RetryEngine {
    policy: RetryPolicy,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay before retry number `retry_index` (0-based): exponential growth
    /// from the initial delay, capped, then jittered. Jitter keeps the result
    /// within [0.8d, 1.2d] of the capped ideal delay d.
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let ideal = self.policy.initial_delay.as_millis() as f64
            * self.policy.backoff_multiplier.powi(retry_index as i32);
        let capped = ideal.min(self.policy.max_delay.as_millis() as f64);

        let final_ms = if self.policy.jitter {
            let jitter = capped * JITTER_FACTOR * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
            (capped + jitter).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(final_ms as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or exhausts the retry
    /// budget. Errors are stringified and classified with [`classify_error`].
    pub async fn retry<T, E, F, Fut>(&self, operation: &str, op: F) -> RetryOutcome<T>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.retry_with(operation, op, |e: &E| classify_error(&e.to_string()))
            .await
    }

    /// Like [`RetryEngine::retry`] but with a caller-supplied classifier, for
    /// error types that carry structure worth more than substring matching.
    pub async fn retry_with<T, E, F, Fut, C>(
        &self,
        operation: &str,
        mut op: F,
        classifier: C,
    ) -> RetryOutcome<T>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        C: Fn(&E) -> ErrorKind,
    {
        let mut attempts: u32 = 0;
        let mut total_delay = Duration::ZERO;

        loop {
            attempts += 1;
            match op().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(
                            operation = %operation,
                            attempts = attempts,
                            "🔄 RETRY ENGINE: succeeded after retry"
                        );
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        total_delay,
                    };
                }
                Err(error) => {
                    let kind = classifier(&error);
                    let message = error.to_string();
                    let retries_used = attempts - 1;

                    if !self.policy.retryable.contains(&kind) {
                        debug!(
                            operation = %operation,
                            error_kind = %kind,
                            error = %message,
                            "🔄 RETRY ENGINE: non-retryable error, giving up"
                        );
                        return RetryOutcome {
                            result: Err(RetryError { kind, message }),
                            attempts,
                            total_delay,
                        };
                    }

                    if retries_used >= self.policy.max_retries {
                        warn!(
                            operation = %operation,
                            attempts = attempts,
                            error_kind = %kind,
                            error = %message,
                            "🔄 RETRY ENGINE: retries exhausted"
                        );
                        return RetryOutcome {
                            result: Err(RetryError { kind, message }),
                            attempts,
                            total_delay,
                        };
                    }

                    let delay = self.backoff_delay(retries_used);
                    warn!(
                        operation = %operation,
                        attempt = attempts,
                        error_kind = %kind,
                        delay_ms = delay.as_millis() as u64,
                        "🔄 RETRY ENGINE: attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    total_delay += delay;
                }
            }
        }
    }

    /// Retry a batch of named operations concurrently. Each operation gets an
    /// independent retry sequence; results come back in input order.
    pub async fn retry_all<T, E, F, Fut>(
        &self,
        operations: Vec<(String, F)>,
    ) -> Vec<(String, RetryOutcome<T>)>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let futures = operations.into_iter().map(|(name, op)| async move {
            let outcome = self.retry(&name, op).await;
            (name, outcome)
        });
        futures::future::join_all(futures).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_classify_rate_limit_first() {
        assert_eq!(classify_error("HTTP 429 Too Many Requests"), ErrorKind::RateLimit);
        assert_eq!(classify_error("Rate LIMIT exceeded"), ErrorKind::RateLimit);
        // A rate-limit marker wins even when timeout words are present.
        assert_eq!(
            classify_error("rate limit hit, request timed out"),
            ErrorKind::RateLimit
        );
    }

    #[test]
    fn test_classify_timeout_before_transient() {
        assert_eq!(classify_error("operation timed out"), ErrorKind::Timeout);
        assert_eq!(classify_error("ETIMEDOUT"), ErrorKind::Timeout);
        assert_eq!(classify_error("504 Gateway Timeout"), ErrorKind::Timeout);
    }

    #[test]
    fn test_classify_transient() {
        assert_eq!(classify_error("connection refused"), ErrorKind::Transient);
        assert_eq!(classify_error("503 Service Unavailable"), ErrorKind::Transient);
        assert_eq!(classify_error("network is unreachable"), ErrorKind::Transient);
        assert_eq!(classify_error("bare 502 from proxy"), ErrorKind::Transient);
    }

    #[test]
    fn test_classify_permanent() {
        assert_eq!(classify_error("404 not found"), ErrorKind::Permanent);
        assert_eq!(classify_error("401 Unauthorized"), ErrorKind::Permanent);
        assert_eq!(classify_error("invalid request body"), ErrorKind::Permanent);
        assert_eq!(classify_error("403 Forbidden"), ErrorKind::Permanent);
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(classify_error("something odd happened"), ErrorKind::Unknown);
        assert_eq!(classify_error(""), ErrorKind::Unknown);
    }

    #[test]
    fn test_default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(1000));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert!(policy.jitter);
        assert!(policy.retryable.contains(&ErrorKind::Transient));
        assert!(policy.retryable.contains(&ErrorKind::RateLimit));
        assert!(policy.retryable.contains(&ErrorKind::Timeout));
        assert!(!policy.retryable.contains(&ErrorKind::Permanent));
        assert!(!policy.retryable.contains(&ErrorKind::Unknown));
    }

    #[test]
    fn test_backoff_growth_and_cap_without_jitter() {
        let engine = RetryEngine::new(RetryPolicy {
            jitter: false,
            ..Default::default()
        });
        assert_eq!(engine.backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(engine.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(engine.backoff_delay(2), Duration::from_millis(4000));
        // 1s * 2^10 = 1024s, capped at 60s.
        assert_eq!(engine.backoff_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_jittered_delay_stays_in_bounds() {
        let engine = RetryEngine::new(RetryPolicy::default());
        for _ in 0..200 {
            let delay = engine.backoff_delay(1).as_millis() as f64;
            assert!((1600.0..=2400.0).contains(&delay), "delay out of bounds: {delay}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_exhausts_after_four_attempts() {
        let engine = RetryEngine::new(RetryPolicy::default());
        let calls = AtomicU32::new(0);

        let outcome = engine
            .retry("always_failing", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), String>("connection reset".to_string()) }
            })
            .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(outcome.total_delay > Duration::ZERO);
        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_fast() {
        let engine = RetryEngine::new(RetryPolicy::default());
        let calls = AtomicU32::new(0);

        let outcome = engine
            .retry("doomed", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), String>("404 not found".to_string()) }
            })
            .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.total_delay, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_two_transient_failures() {
        let engine = RetryEngine::new(RetryPolicy::default());
        let calls = AtomicU32::new(0);

        let outcome = engine
            .retry("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("socket hang up".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.into_result().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_custom_classifier_overrides_default() {
        let engine = RetryEngine::new(RetryPolicy::default());

        // The message says "connection" (transient) but the classifier knows
        // better.
        let outcome = engine
            .retry_with(
                "custom",
                || async { Err::<(), String>("connection rejected: bad credentials".to_string()) },
                |_| ErrorKind::Permanent,
            )
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.into_result().unwrap_err().kind, ErrorKind::Permanent);
    }

    /// Uniform operation factory so a batch of closures shares one type.
    fn scripted<'a>(
        calls: &'a AtomicU32,
        result: std::result::Result<&'static str, &'static str>,
    ) -> impl FnMut() -> std::future::Ready<std::result::Result<&'static str, String>> + 'a {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(result.map_err(|e| e.to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_all_preserves_order() {
        let engine = RetryEngine::new(RetryPolicy::default());
        let calls = AtomicU32::new(0);

        let operations = vec![
            ("first".to_string(), scripted(&calls, Ok("one"))),
            ("second".to_string(), scripted(&calls, Ok("two"))),
        ];

        let results = engine.retry_all(operations).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "first");
        assert_eq!(results[1].0, "second");
        assert!(results.iter().all(|(_, o)| o.is_success()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_all_isolates_failures() {
        let engine = RetryEngine::new(RetryPolicy::default());
        let calls = AtomicU32::new(0);

        let operations = vec![
            ("ok".to_string(), scripted(&calls, Ok("fine"))),
            ("doomed".to_string(), scripted(&calls, Err("invalid input"))),
        ];

        let results = engine.retry_all(operations).await;
        assert!(results[0].1.is_success());
        assert!(!results[1].1.is_success());
        // One call each: the success needed no retry, the permanent failure
        // got none.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    proptest! {
        #[test]
        fn prop_jittered_delay_within_twenty_percent(
            retry_index in 0u32..10,
            initial_ms in 1u64..5000,
        ) {
            let engine = RetryEngine::new(RetryPolicy {
                initial_delay: Duration::from_millis(initial_ms),
                ..Default::default()
            });
            let ideal = (initial_ms as f64 * 2.0f64.powi(retry_index as i32))
                .min(60_000.0);
            let delay = engine.backoff_delay(retry_index).as_millis() as f64;
            prop_assert!(delay >= (ideal * 0.8 - 1.0).max(0.0));
            prop_assert!(delay <= ideal * 1.2 + 1.0);
        }

        #[test]
        fn prop_classifier_total(message in ".*") {
            // Never panics, always lands in a category.
            let _ = classify_error(&message);
        }
    }
}
