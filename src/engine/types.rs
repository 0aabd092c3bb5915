// Task model: leaf steps, serial/parallel composites, and queued cleanups

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt};

use crate::cancel::CancelSignal;

/// A forward action or a cleanup action. Receives its own handle on the
/// run's cancellation signal.
pub type Action = Arc<dyn Fn(CancelSignal) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

fn boxed_action<F, Fut>(f: F) -> Action
where
    F: Fn(CancelSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |signal| f(signal).boxed())
}

/// Named pair of a forward action and an optional cleanup.
///
/// A step without an action is a no-op and is skipped; its cleanup, if
/// any, is still queued.
#[derive(Clone)]
pub struct Step {
    pub(crate) name: String,
    pub(crate) action: Option<Action>,
    pub(crate) cleanup: Option<Action>,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: None,
            cleanup: None,
        }
    }

    /// Set the forward action.
    pub fn action<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CancelSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.action = Some(boxed_action(f));
        self
    }

    /// Set the cleanup that undoes the forward action.
    pub fn cleanup<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CancelSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.cleanup = Some(boxed_action(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_action(&self) -> bool {
        self.action.is_some()
    }

    pub fn has_cleanup(&self) -> bool {
        self.cleanup.is_some()
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("action", &self.action.is_some())
            .field("cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// A unit of work. Composites nest arbitrarily.
#[derive(Debug, Clone)]
pub enum Task {
    Step(Step),
    /// Children run one after another; the first failure stops the rest.
    Serial { name: String, tasks: Vec<Task> },
    /// Children run concurrently; every child runs to completion.
    Parallel { name: String, tasks: Vec<Task> },
}

impl Task {
    pub fn serial(name: impl Into<String>, tasks: impl IntoIterator<Item = Task>) -> Self {
        Task::Serial {
            name: name.into(),
            tasks: tasks.into_iter().collect(),
        }
    }

    pub fn parallel(name: impl Into<String>, tasks: impl IntoIterator<Item = Task>) -> Self {
        Task::Parallel {
            name: name.into(),
            tasks: tasks.into_iter().collect(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Task::Step(step) => &step.name,
            Task::Serial { name, .. } | Task::Parallel { name, .. } => name,
        }
    }
}

impl From<Step> for Task {
    fn from(step: Step) -> Self {
        Task::Step(step)
    }
}

/// Cleanup work queued by a forward phase, shaped like the tasks that
/// queued it.
#[derive(Clone)]
pub enum Cleanup {
    Step { name: String, action: Action },
    /// Runs in queued order.
    Serial { name: String, pending: Vec<Cleanup> },
    /// Runs concurrently.
    Parallel { name: String, pending: Vec<Cleanup> },
}

impl Cleanup {
    pub fn name(&self) -> &str {
        match self {
            Cleanup::Step { name, .. }
            | Cleanup::Serial { name, .. }
            | Cleanup::Parallel { name, .. } => name,
        }
    }

    /// Number of leaf cleanups under this node.
    pub fn len(&self) -> usize {
        match self {
            Cleanup::Step { .. } => 1,
            Cleanup::Serial { pending, .. } | Cleanup::Parallel { pending, .. } => {
                pending.iter().map(Cleanup::len).sum()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cleanup::Step { name, .. } => f.debug_tuple("Step").field(name).finish(),
            Cleanup::Serial { name, pending } => f
                .debug_struct("Serial")
                .field("name", name)
                .field("pending", pending)
                .finish(),
            Cleanup::Parallel { name, pending } => f
                .debug_struct("Parallel")
                .field("name", name)
                .field("pending", pending)
                .finish(),
        }
    }
}

/// Append-only list of pending cleanups, owned by one run (or one
/// composite within it). Safe to append to from concurrent workers.
#[derive(Debug, Clone, Default)]
pub struct CleanupQueue {
    pending: Arc<Mutex<Vec<Cleanup>>>,
}

impl CleanupQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, cleanup: Cleanup) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cleanup);
    }

    /// Take everything queued so far, in the order it was queued.
    pub fn drain(&self) -> Vec<Cleanup> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
