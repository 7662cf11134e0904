use rand::Rng;
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Message fragments that mark an error as transient network trouble.
pub const NETWORK_ERRORS: &[&str] = &[
    "Failed to fetch",
    "NetworkError",
    "Network request failed",
    "Network Error",
    "rate limit",
    "socket hang up",
    "connection refused",
    "network timeout",
];

/// SQLite contention surfaces as these messages while another process holds the file.
pub const STORE_BUSY_ERRORS: &[&str] = &["database is locked", "database is busy"];

pub const CONNECTION_MESSAGE: &str =
    "Connection error. Please check your internet connection and try again.";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
    pub retryable: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            jitter: Duration::from_millis(100),
            retryable: NETWORK_ERRORS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RetryPolicy {
    pub fn with_patterns(mut self, patterns: &[&str]) -> Self {
        self.retryable = patterns.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn is_retryable(&self, message: &str) -> bool {
        contains_any(message, self.retryable.iter().map(|s| s.as_str()))
    }

    /// `min(prev * 1.5 + jitter, max_delay)`; never shorter than `prev` unless capped.
    pub fn next_delay(&self, prev: Duration, jitter: Duration) -> Duration {
        let grown = prev.mul_f64(1.5) + jitter;
        grown.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("{0}")]
    Fatal(E),
    #[error("Operation failed after multiple retries. Please check your connection and try again.")]
    Exhausted { attempts: u32, last: E },
}

pub fn retry_operation<T, E, F>(policy: &RetryPolicy, op: F) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Result<T, E>,
{
    retry_with_sleep(policy, op, std::thread::sleep)
}

/// Same as [`retry_operation`] with the wait injected.
pub fn retry_with_sleep<T, E, F, S>(
    policy: &RetryPolicy,
    mut op: F,
    mut sleep: S,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Result<T, E>,
    S: FnMut(Duration),
{
    let attempts = policy.max_retries.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;
    loop {
        let err = match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        let message = err.to_string();
        if !policy.is_retryable(&message) {
            return Err(RetryError::Fatal(err));
        }
        if attempt + 1 >= attempts {
            warn!(attempts, error = %message, "all retry attempts failed");
            return Err(RetryError::Exhausted {
                attempts,
                last: err,
            });
        }

        let jitter_ms = policy.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        delay = policy.next_delay(delay, jitter);
        debug!(
            attempt = attempt + 1,
            of = attempts,
            delay_ms = delay.as_millis() as u64,
            "retrying operation"
        );
        sleep(delay);
        attempt += 1;
    }
}

fn contains_any<'a>(message: &str, patterns: impl IntoIterator<Item = &'a str>) -> bool {
    let lower = message.to_lowercase();
    patterns
        .into_iter()
        .any(|p| lower.contains(&p.to_lowercase()))
}

pub fn is_network_error(message: &str) -> bool {
    contains_any(message, NETWORK_ERRORS.iter().copied())
}

/// User-facing text for an error message.
pub fn format_error_message(message: &str) -> String {
    if is_network_error(message) {
        return CONNECTION_MESSAGE.to_string();
    }
    let mut s = message;
    if s.get(..6).is_some_and(|p| p.eq_ignore_ascii_case("error:")) {
        s = &s[6..];
    }
    let word_len = s
        .char_indices()
        .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if word_len > 0 && s[word_len..].starts_with(':') {
        s = &s[word_len + 1..];
    }
    s.trim().to_string()
}
