//! Deadlines and cancellation carried by every outbound call.
//!
//! A [`Scope`] pairs an absolute deadline with a cancellation token. Child
//! scopes inherit cancellation from their parent and never outlive its
//! deadline; [`Scope::child_with_cushion`] subtracts a small margin so an
//! inner call times out before its caller does.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Margin subtracted from a caller's deadline for outbound calls.
pub const DEFAULT_CUSHION: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct Scope {
    deadline: Instant,
    token: CancellationToken,
}

/// Why [`Scope::run`] did not produce the future's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    Cancelled,
    DeadlineExceeded,
}

impl Scope {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            token: CancellationToken::new(),
        }
    }

    pub fn with_token(timeout: Duration, token: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            token,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Child scope sharing the parent's deadline.
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            token: self.token.child_token(),
        }
    }

    /// Child scope whose deadline is the earlier of the parent's deadline
    /// and `now + timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self {
            deadline: self.deadline.min(Instant::now() + timeout),
            token: self.token.child_token(),
        }
    }

    /// Child scope ending `cushion` before the parent's deadline.
    pub fn child_with_cushion(&self, cushion: Duration) -> Self {
        let now = Instant::now();
        let deadline = self
            .deadline
            .checked_sub(cushion)
            .map(|d| d.max(now))
            .unwrap_or(now);
        Self {
            deadline,
            token: self.token.child_token(),
        }
    }

    /// Drive `fut` until it completes, the scope is cancelled, or the
    /// deadline passes, whichever comes first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupted::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(Interrupted::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_before_deadline() {
        let scope = Scope::new(Duration::from_secs(5));
        let out = scope
            .run(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                7
            })
            .await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_hits_deadline() {
        let scope = Scope::new(Duration::from_secs(1));
        let out = scope
            .run(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert_eq!(out, Err(Interrupted::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let parent = Scope::new(Duration::from_secs(30));
        let child = parent.child();
        let grandchild = child.child_with_timeout(Duration::from_secs(1));
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert_eq!(
            grandchild.run(std::future::pending::<()>()).await,
            Err(Interrupted::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_reach_parent() {
        let parent = Scope::new(Duration::from_secs(30));
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cushion_and_timeout_never_extend_deadline() {
        let parent = Scope::new(Duration::from_secs(2));
        let cushioned = parent.child_with_cushion(Duration::from_millis(500));
        assert_eq!(
            cushioned.deadline(),
            parent.deadline() - Duration::from_millis(500)
        );
        let longer = parent.child_with_timeout(Duration::from_secs(60));
        assert_eq!(longer.deadline(), parent.deadline());

        let tiny = Scope::new(Duration::from_millis(10));
        let child = tiny.child_with_cushion(Duration::from_secs(1));
        assert!(child.is_expired());
    }
}
