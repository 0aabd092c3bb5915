//! Cooperative cancellation signal shared by every step of a run.
//!
//! A [`CancelSignal`] flips once from "running" to "cancelled" and never
//! resets. The first reason recorded wins; later calls to
//! [`CancelSignal::cancel`] are no-ops.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Why a run was asked to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// Operator interrupt (SIGINT / SIGTERM).
    Interrupted,
    /// Second interrupt while cleanups were already running.
    CleanupAborted,
    /// Cancelled programmatically, with a free-form explanation.
    Requested(String),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Interrupted => write!(f, "interrupted by operator"),
            CancelReason::CleanupAborted => write!(f, "cleanup aborted by operator"),
            CancelReason::Requested(why) => write!(f, "{why}"),
        }
    }
}

/// One-way cancellation token with a reason.
///
/// Clones share state: cancelling any clone cancels them all.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Returns `true` only for the call that actually
    /// flipped it.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason recorded by the first `cancel`, if any.
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().cloned()
    }

    /// Resolves once the signal has been raised.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}
