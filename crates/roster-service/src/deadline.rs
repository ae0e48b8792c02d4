//! The time budget of a single request.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::FetchError;

/// A request-scoped cancellation token combined with a fixed expiry instant.
///
/// Whichever fires first ends the scope: cancelling the token yields
/// [`FetchError::Canceled`], reaching the expiry yields [`FetchError::Timeout`].
#[derive(Clone, Debug)]
pub struct Deadline {
    token: CancellationToken,
    expires_at: Instant,
    budget: Duration,
}

impl Deadline {
    /// Creates a scope that is cancelled together with `parent` and expires after `budget`.
    pub fn new(parent: &CancellationToken, budget: Duration) -> Self {
        Self {
            token: parent.child_token(),
            expires_at: Instant::now() + budget,
            budget,
        }
    }

    /// Creates a scope with the same expiry as this one that is not cancelled by its parent.
    ///
    /// Work that other requests may depend on runs under such a scope, so it survives the
    /// request that started it going away.
    pub fn detached(&self) -> Self {
        Self {
            token: CancellationToken::new(),
            expires_at: self.expires_at,
            budget: self.budget,
        }
    }

    /// Creates a nested scope that can be cancelled without affecting this one.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            expires_at: self.expires_at,
            budget: self.budget,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancels this scope and all scopes derived with [`child`](Self::child).
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the scope has ended, with the reason it ended.
    pub async fn expired(&self) -> FetchError {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => FetchError::Canceled,
            _ = tokio::time::sleep_until(self.expires_at) => FetchError::Timeout(self.budget),
        }
    }

    /// Drives `future` to completion unless the scope ends first.
    ///
    /// On expiry or cancellation the future is dropped.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, FetchError> {
        tokio::select! {
            biased;
            err = self.expired() => Err(err),
            output = future => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_completes_within_budget() {
        let deadline = Deadline::new(&CancellationToken::new(), Duration::from_millis(500));
        let result = deadline
            .run(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                42
            })
            .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_timeout() {
        let deadline = Deadline::new(&CancellationToken::new(), Duration::from_millis(500));
        let started = Instant::now();
        let result = deadline.run(std::future::pending::<()>()).await;

        assert_eq!(result, Err(FetchError::Timeout(Duration::from_millis(500))));
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_is_canceled() {
        let parent = CancellationToken::new();
        let deadline = Deadline::new(&parent, Duration::from_millis(500));

        let handle = tokio::spawn({
            let deadline = deadline.clone();
            async move { deadline.run(std::future::pending::<()>()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        parent.cancel();

        assert_eq!(handle.await.unwrap(), Err(FetchError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_survives_parent_but_keeps_expiry() {
        let parent = CancellationToken::new();
        let deadline = Deadline::new(&parent, Duration::from_millis(500));
        let detached = deadline.detached();
        parent.cancel();

        assert!(deadline.is_canceled());
        assert!(!detached.is_canceled());
        assert_eq!(
            detached.run(std::future::pending::<()>()).await,
            Err(FetchError::Timeout(Duration::from_millis(500)))
        );
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_propagate_up() {
        let deadline = Deadline::new(&CancellationToken::new(), Duration::from_secs(1));
        let child = deadline.child();
        child.cancel();
        assert!(child.is_canceled());
        assert!(!deadline.is_canceled());

        deadline.cancel();
        assert!(deadline.child().is_canceled());
    }
}
