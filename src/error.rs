//! Engine error types.

use std::fmt;

use thiserror::Error;

/// Failure of a task, a composite, or a cleanup phase.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{task}: {source}")]
    Failed {
        task: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Multiple(#[from] MultiError),
    /// A state that should be unreachable, such as a panicked worker.
    #[error("{task}: invariant violated: {detail}")]
    Invariant { task: String, detail: String },
}

impl TaskError {
    pub fn failed(task: impl Into<String>, source: anyhow::Error) -> Self {
        TaskError::Failed {
            task: task.into(),
            source,
        }
    }

    pub fn invariant(task: impl Into<String>, detail: impl Into<String>) -> Self {
        TaskError::Invariant {
            task: task.into(),
            detail: detail.into(),
        }
    }

    /// Name of the task the error originated in, for single errors.
    pub fn task(&self) -> Option<&str> {
        match self {
            TaskError::Failed { task, .. } | TaskError::Invariant { task, .. } => Some(task),
            TaskError::Multiple(_) => None,
        }
    }

    /// The underlying error of a `Failed` task, if it has type `E`.
    pub fn source_as<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            TaskError::Failed { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub fn is_invariant(&self) -> bool {
        matches!(self, TaskError::Invariant { .. })
    }

    /// Every leaf error, flattening nested aggregates.
    pub fn leaves(&self) -> Vec<&TaskError> {
        match self {
            TaskError::Multiple(multi) => multi.errors.iter().flat_map(|e| e.leaves()).collect(),
            other => vec![other],
        }
    }
}

/// Errors collected from one join phase, kept in the order they were joined.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<TaskError>,
}

impl MultiError {
    /// Zero errors is success, one error is returned as itself, more are
    /// kept together.
    pub fn collapse(mut errors: Vec<TaskError>) -> Result<(), TaskError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(TaskError::Multiple(MultiError { errors })),
        }
    }

    pub fn errors(&self) -> &[TaskError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n\t* {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
