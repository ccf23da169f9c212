//! Bounded retry for transient failures.
//!
//! Used by the dial path to ride out flaky DNS; the session's reconnect
//! loop applies the same delay-and-check-cancellation discipline at its
//! own layer.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{TransportError, TransportResult};

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Clamped to at least 1.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// A policy with explicit parameters.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(250),
        }
    }
}

/// Run `op` until it succeeds, the policy is exhausted, or `cancel` fires.
///
/// Cancellation is observed before each attempt and during the delay.
/// Exhaustion surfaces the last error; cancellation surfaces
/// [`TransportError::Disconnected`].
pub async fn with_retries<T, F, Fut>(
    what: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> TransportResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut last: Option<std::io::Error> = None;

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(TransportError::Disconnected);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                tracing::debug!(what, attempt, %error, "transient failure");
                last = Some(error);
            }
        }
        if attempt < attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Disconnected),
                _ = tokio::time::sleep(policy.delay) => {}
            }
        }
    }

    match last {
        Some(error) => Err(TransportError::Io(error)),
        None => Err(TransportError::Disconnected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let value = with_retries("probe", &fast_policy(5), &cancel, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::new(ErrorKind::Other, "flaky"))
            } else {
                Ok(42u32)
            }
        })
        .await
        .expect("third attempt succeeds");

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: TransportResult<()> = with_retries("probe", &fast_policy(3), &cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::new(ErrorKind::Other, "always down"))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn cancellation_stops_retrying() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: TransportResult<()> = with_retries("probe", &fast_policy(3), &cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::new(ErrorKind::Other, "unreached"))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(result, Err(TransportError::Disconnected)));
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let cancel = CancellationToken::new();
        let value = with_retries("probe", &fast_policy(0), &cancel, || async { Ok(1u8) })
            .await
            .expect("one attempt");
        assert_eq!(value, 1);
    }
}
