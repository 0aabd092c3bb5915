// Top-level drivers: one composed task, or a flat list of steps

use tracing::{info, info_span, Instrument};

use super::types::{Cleanup, CleanupQueue, Task};
use crate::cancel::CancelSignal;
use crate::error::{MultiError, TaskError};
use crate::telemetry::generate_correlation_id;

/// Drives a run: forward phase under `signal`, then every queued cleanup
/// under `cleanup_signal`.
///
/// Cleanups get their own signal so that the interrupt which stopped the
/// forward phase does not also kill the commands that undo it.
#[derive(Debug, Clone, Default)]
pub struct Runner {
    signal: CancelSignal,
    cleanup_signal: CancelSignal,
}

impl Runner {
    pub fn new(signal: CancelSignal) -> Self {
        Self {
            signal,
            cleanup_signal: CancelSignal::new(),
        }
    }

    pub fn with_cleanup_signal(mut self, cleanup_signal: CancelSignal) -> Self {
        self.cleanup_signal = cleanup_signal;
        self
    }

    pub fn signal(&self) -> &CancelSignal {
        &self.signal
    }

    pub fn cleanup_signal(&self) -> &CancelSignal {
        &self.cleanup_signal
    }

    /// Run one composed task, then its queued cleanups in queued order.
    ///
    /// Cleanups run even when the forward phase failed. The forward error
    /// is then returned; otherwise the aggregated cleanup result is.
    pub async fn run(&self, task: &Task) -> Result<(), TaskError> {
        let span = info_span!("run", correlation_id = %generate_correlation_id(), task = %task.name());
        async {
            let queue = CleanupQueue::new();
            let forward = task.forward(&self.signal, &queue).await;

            let mut cleanup_errors = Vec::new();
            for cleanup in queue.drain() {
                if let Err(err) = cleanup.run(&self.cleanup_signal).await {
                    cleanup_errors.push(err);
                }
            }
            forward.and(MultiError::collapse(cleanup_errors))
        }
        .instrument(span)
        .await
    }

    /// Run independent steps in order, stopping at the first failure, then
    /// unwind the queued cleanups last-in first-out.
    ///
    /// Cleanup failures are logged where they happen and never stop the
    /// unwind or change the result: only a forward failure is returned.
    pub async fn run_steps(&self, steps: &[Task]) -> Result<(), TaskError> {
        let span = info_span!("run", correlation_id = %generate_correlation_id(), steps = steps.len());
        async {
            let mut pending: Vec<Cleanup> = Vec::new();
            let mut forward = Ok(());
            for step in steps {
                let queue = CleanupQueue::new();
                let result = step.forward(&self.signal, &queue).await;
                pending.extend(queue.drain());
                if let Err(err) = result {
                    forward = Err(err);
                    break;
                }
            }

            if !pending.is_empty() {
                info!(cleanups = pending.len(), "unwinding");
            }
            let mut failed_cleanups = 0usize;
            for cleanup in pending.into_iter().rev() {
                if let Err(err) = cleanup.run(&self.cleanup_signal).await {
                    failed_cleanups += err.leaves().len();
                }
            }
            if failed_cleanups > 0 {
                info!(failed = failed_cleanups, "unwind finished with cleanup failures");
            }
            forward
        }
        .instrument(span)
        .await
    }
}
