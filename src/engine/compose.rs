// Serial and parallel composition: forward phase and cleanup phase

use futures::future::{BoxFuture, FutureExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::types::{Cleanup, CleanupQueue, Step, Task};
use crate::cancel::CancelSignal;
use crate::error::{MultiError, TaskError};

type Worker = (String, JoinHandle<Result<(), TaskError>>);

impl Task {
    /// Run the forward phase.
    ///
    /// The cleanup of every step whose action was attempted is pushed onto
    /// `queue`, whether the action succeeded, failed or panicked. Composites push one
    /// node holding the cleanups of their children.
    pub fn forward<'a>(
        &'a self,
        signal: &'a CancelSignal,
        queue: &'a CleanupQueue,
    ) -> BoxFuture<'a, Result<(), TaskError>> {
        let span = info_span!("task", name = %self.name());
        async move {
            match self {
                Task::Step(step) => forward_step(step, signal, queue).await,
                Task::Serial { name, tasks } => forward_serial(name, tasks, signal, queue).await,
                Task::Parallel { name, tasks } => {
                    forward_parallel(name, tasks, signal, queue).await
                }
            }
        }
        .instrument(span)
        .boxed()
    }
}

async fn forward_step(
    step: &Step,
    signal: &CancelSignal,
    queue: &CleanupQueue,
) -> Result<(), TaskError> {
    // Queued before the action runs so a panicking action still leaves its
    // cleanup behind.
    if let Some(cleanup) = &step.cleanup {
        queue.push(Cleanup::Step {
            name: step.name.clone(),
            action: cleanup.clone(),
        });
    }

    let result = match &step.action {
        Some(action) => {
            info!("starting");
            action(signal.clone())
                .await
                .map_err(|err| TaskError::failed(&step.name, err))
        }
        None => {
            debug!("no action, skipping");
            Ok(())
        }
    };

    match &result {
        Ok(()) => info!("finished"),
        Err(err) => warn!(error = %err, "failed"),
    }
    result
}

async fn forward_serial(
    name: &str,
    tasks: &[Task],
    signal: &CancelSignal,
    queue: &CleanupQueue,
) -> Result<(), TaskError> {
    let local = CleanupQueue::new();
    let mut result = Ok(());
    for task in tasks {
        if let Err(err) = task.forward(signal, &local).await {
            result = Err(err);
            break;
        }
    }

    let pending = local.drain();
    if !pending.is_empty() {
        queue.push(Cleanup::Serial {
            name: name.to_string(),
            pending,
        });
    }
    result
}

async fn forward_parallel(
    name: &str,
    tasks: &[Task],
    signal: &CancelSignal,
    queue: &CleanupQueue,
) -> Result<(), TaskError> {
    let local = CleanupQueue::new();
    let workers: Vec<Worker> = tasks
        .iter()
        .cloned()
        .map(|task| {
            let signal = signal.clone();
            let local = local.clone();
            let task_name = task.name().to_string();
            let handle =
                tokio::spawn(async move { task.forward(&signal, &local).await }.in_current_span());
            (task_name, handle)
        })
        .collect();

    let errors = join_workers(workers).await;

    let pending = local.drain();
    if !pending.is_empty() {
        queue.push(Cleanup::Parallel {
            name: name.to_string(),
            pending,
        });
    }
    MultiError::collapse(errors)
}

/// Wait for every worker, keeping each failure.
async fn join_workers(workers: Vec<Worker>) -> Vec<TaskError> {
    let mut errors = Vec::new();
    for (name, handle) in workers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => errors.push(err),
            Err(join_err) => errors.push(TaskError::invariant(
                name,
                format!("worker did not complete: {join_err}"),
            )),
        }
    }
    errors
}

impl Cleanup {
    /// Run this cleanup and everything under it. Never stops early: every
    /// queued cleanup runs and each failure is kept.
    pub fn run(self, signal: &CancelSignal) -> BoxFuture<'_, Result<(), TaskError>> {
        let span = info_span!("cleanup", name = %self.name());
        async move {
            match self {
                Cleanup::Step { name, action } => {
                    info!("running cleanup");
                    let result = action(signal.clone())
                        .await
                        .map_err(|err| TaskError::failed(name, err));
                    if let Err(err) = &result {
                        warn!(error = %err, "cleanup failed");
                    }
                    result
                }
                Cleanup::Serial { pending, .. } => {
                    let mut errors = Vec::new();
                    for cleanup in pending {
                        if let Err(err) = cleanup.run(signal).await {
                            errors.push(err);
                        }
                    }
                    MultiError::collapse(errors)
                }
                Cleanup::Parallel { pending, .. } => {
                    let workers: Vec<Worker> = pending
                        .into_iter()
                        .map(|cleanup| {
                            let signal = signal.clone();
                            let cleanup_name = cleanup.name().to_string();
                            let handle = tokio::spawn(
                                async move { cleanup.run(&signal).await }.in_current_span(),
                            );
                            (cleanup_name, handle)
                        })
                        .collect();
                    MultiError::collapse(join_workers(workers).await)
                }
            }
        }
        .instrument(span)
        .boxed()
    }
}
