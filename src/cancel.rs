//! Cancellation context shared between the caller, the pipeline, and sinks.
//!
//! A [`CancelToken`] is a cheap, cloneable flag. Cancelling any clone wakes
//! every task waiting on [`CancelToken::cancelled`]. The pipeline races each
//! suspension point (engine read, sink creation, sink write, engine wait)
//! against it, so a cancelled call never blocks on an engine that will not
//! produce more output.

use crate::error::ThumbnailError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Cloneable cancellation flag backed by a `watch` channel.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancel this token and every clone of it. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the token is cancelled. Resolves immediately if it
    /// already is.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so `wait_for` only returns
        // once the flag flips.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// A call's interruption sources: the caller's token plus an optional
/// deadline. Every suspension point in the pipeline is raced against it.
#[derive(Debug, Clone)]
pub(crate) struct Interrupt {
    token: CancelToken,
    deadline: Option<(Instant, Duration)>,
}

impl Interrupt {
    pub(crate) fn new(token: &CancelToken, timeout: Option<Duration>) -> Self {
        Self {
            token: token.clone(),
            deadline: timeout.map(|t| (Instant::now() + t, t)),
        }
    }

    pub(crate) fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Resolve with the interruption error once the token fires or the
    /// deadline passes.
    pub(crate) async fn fired(&self) -> ThumbnailError {
        match self.deadline {
            Some((at, timeout)) => tokio::select! {
                biased;
                _ = self.token.cancelled() => ThumbnailError::Cancelled,
                _ = tokio::time::sleep_until(at) => ThumbnailError::Timeout {
                    elapsed_ms: timeout.as_millis() as u64,
                },
            },
            None => {
                self.token.cancelled().await;
                ThumbnailError::Cancelled
            }
        }
    }

    /// Run `fut` unless interrupted first.
    pub(crate) async fn guard<T>(
        &self,
        fut: impl Future<Output = Result<T, ThumbnailError>>,
    ) -> Result<T, ThumbnailError> {
        tokio::select! {
            biased;
            e = self.fired() => Err(e),
            r = fut => r,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_token_is_not_cancelled() {
        assert!(!CancelToken::new().is_cancelled());
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let a = CancelToken::new();
        let b = a.clone();
        b.cancel();
        assert!(a.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("should resolve immediately");
    }

    #[tokio::test]
    async fn guard_passes_through_when_not_interrupted() {
        let interrupt = Interrupt::new(&CancelToken::new(), None);
        let v = interrupt.guard(async { Ok::<_, ThumbnailError>(7) }).await.unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn guard_reports_cancellation() {
        let token = CancelToken::new();
        token.cancel();
        let interrupt = Interrupt::new(&token, None);
        let err = interrupt
            .guard(std::future::pending::<Result<(), ThumbnailError>>())
            .await
            .unwrap_err();
        assert!(matches!(err, ThumbnailError::Cancelled));
    }

    #[tokio::test]
    async fn guard_reports_timeout() {
        let interrupt = Interrupt::new(&CancelToken::new(), Some(Duration::from_millis(20)));
        let err = interrupt
            .guard(std::future::pending::<Result<(), ThumbnailError>>())
            .await
            .unwrap_err();
        assert!(matches!(err, ThumbnailError::Timeout { elapsed_ms: 20 }));
    }

    #[tokio::test]
    async fn cancelled_wakes_waiting_task() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter should not panic");
    }
}
