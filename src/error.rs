//! Crate-wide error taxonomy.
//!
//! Every fallible public operation returns [`GatewayError`], which carries an
//! [`ErrorKind`] (the disposition the caller should act on) plus the causal
//! chain. Components never downgrade one kind into another; they wrap.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The kind of failure, independent of which component raised it.
///
/// See the error handling design in the specification for the disposition of
/// each kind (retry, surface, exit, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Caller supplied malformed input.
    Invalid,
    /// Target entity absent.
    NotFound,
    /// Entity already exists.
    Duplicate,
    /// Caller deadline expired.
    DeadlineExceeded,
    /// Caller-initiated cancellation.
    Canceled,
    /// Pool saturated or rate limit hit.
    Exhausted,
    /// Network-layer failure.
    Transport,
    /// API misuse (e.g. send before start).
    IllegalState,
    /// Cannot continue; process should exit.
    Fatal,
}

/// The crate-wide error type. Always carries a [`kind`](Self::kind) plus a
/// human-readable message, and optionally a boxed source error for the chain.
#[derive(Error, Debug)]
pub struct GatewayError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), source: None }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self { kind, message: message.into(), source: Some(Box::new(source)) }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Duplicate, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exhausted, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IllegalState, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// True if this error kind is worth retrying per the bounded-retry policy.
    pub fn retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Transport)
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Bounded retry policy applied only to [`ErrorKind::Transport`] failures, per
/// `bridge.defaultRetryCount` / `bridge.defaultRetryDelay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), delay }
    }

    /// Runs `op` up to `max_attempts` times, retrying only on
    /// [`ErrorKind::Transport`] errors with a jittered delay between tries.
    pub async fn run<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.retryable() && attempt < self.max_attempts => {
                    let jitter =
                        Duration::from_millis(rand::random::<u64>() % 50);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "transport error, retrying"
                    );
                    tokio::time::sleep(self.delay + jitter).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind() {
        let err = GatewayError::not_found("service svc-1");
        assert_eq!(err.to_string(), "[not_found] service svc-1");
    }

    #[test]
    fn only_transport_is_retryable() {
        assert!(GatewayError::transport("boom").retryable());
        assert!(!GatewayError::invalid("boom").retryable());
        assert!(!GatewayError::exhausted("boom").retryable());
    }

    #[tokio::test]
    async fn retry_policy_stops_after_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<()> = policy
            .run(|| {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(GatewayError::transport("down")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_policy_does_not_retry_non_transport() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<()> = policy
            .run(|| {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(GatewayError::invalid("bad")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
