use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cancel::{CancelReason, CancelSignal};

/// What one operator interrupt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// First interrupt: the running step is killed, cleanups still run.
    ForwardCancelled,
    /// Second interrupt: cleanups are killed too.
    CleanupAborted,
    /// Nothing left to cancel.
    Ignored,
}

/// Turns SIGINT/SIGTERM into cancellation of a run's signals.
#[derive(Debug, Clone)]
pub struct InterruptCoordinator {
    forward: CancelSignal,
    cleanup: CancelSignal,
}

impl InterruptCoordinator {
    pub fn new(forward: CancelSignal, cleanup: CancelSignal) -> Self {
        Self { forward, cleanup }
    }

    /// Apply one interrupt. The first cancels the forward signal, the
    /// second the cleanup signal.
    pub fn on_interrupt(&self) -> InterruptOutcome {
        if self.forward.cancel(CancelReason::Interrupted) {
            warn!("interrupt received, stopping current step; cleanups will still run (interrupt again to abort them)");
            InterruptOutcome::ForwardCancelled
        } else if self.cleanup.cancel(CancelReason::CleanupAborted) {
            error!("second interrupt received, aborting cleanups");
            InterruptOutcome::CleanupAborted
        } else {
            InterruptOutcome::Ignored
        }
    }

    /// Install signal handlers and listen in the background until both
    /// signals have been cancelled.
    pub fn install(self) -> Result<JoinHandle<()>> {
        let mut interrupts = signal(SignalKind::interrupt())?;
        let mut terminations = signal(SignalKind::terminate())?;
        info!("interrupt handlers installed");

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(()) = interrupts.recv() => {}
                    Some(()) = terminations.recv() => {}
                    else => break,
                }
                if self.on_interrupt() == InterruptOutcome::CleanupAborted {
                    break;
                }
            }
        }))
    }
}
