use std::io;
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{command}: {stream} is already bound; the wrapper captures output itself")]
    OutputAlreadyBound {
        command: String,
        stream: &'static str,
    },
    #[error("{command}: failed to start: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command}: failed to wait for exit: {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command}: {status}{}", output_suffix(.output))]
    Failed {
        command: String,
        status: ExitStatus,
        output: String,
    },
    #[error("{command}: killed ({reason}){}", output_suffix(.output))]
    Cancelled {
        command: String,
        reason: String,
        output: String,
    },
    #[error("invalid command line {line:?}: {detail}")]
    Parse { line: String, detail: String },
}

impl ExecError {
    /// Combined stdout/stderr captured before the failure, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            ExecError::Failed { output, .. } | ExecError::Cancelled { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled { .. })
    }
}

fn output_suffix(output: &str) -> String {
    let trimmed = output.trim_end();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("\n{trimmed}")
    }
}
