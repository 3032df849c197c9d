//! Run context: one deadline and one cancellation token for the whole run

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a run stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The token was cancelled (Ctrl-C, caller shutdown)
    Cancelled,
    /// The run deadline passed
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Cancelled => f.write_str("run cancelled"),
            CancelReason::DeadlineExceeded => f.write_str("run deadline exceeded"),
        }
    }
}

/// Shared by every stage of a run
///
/// Cloning is cheap; clones observe the same token and deadline.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RunContext {
    /// No deadline, fresh token
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadline `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::default().deadline_at(Instant::now() + timeout)
    }

    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel the run
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// `Some(reason)` once the run must stop
    pub fn check(&self) -> Option<CancelReason> {
        if self.token.is_cancelled() {
            Some(CancelReason::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(CancelReason::DeadlineExceeded)
        } else {
            None
        }
    }

    pub fn is_done(&self) -> bool {
        self.check().is_some()
    }

    /// Time left before the deadline, if there is one
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Resolves when the token fires or the deadline passes
    pub async fn done(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => CancelReason::Cancelled,
                _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                CancelReason::Cancelled
            }
        }
    }

    /// Run `fut` unless the context finishes first
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, CancelReason> {
        if let Some(reason) = self.check() {
            return Err(reason);
        }

        tokio::select! {
            reason = self.done() => Err(reason),
            output = fut => Ok(output),
        }
    }
}
