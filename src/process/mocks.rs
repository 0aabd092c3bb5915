// Recording command runner for tests

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Mutex;

use async_trait::async_trait;

use super::error::ExecError;
use super::executor::CommandRunner;
use super::invocation::Invocation;
use super::wrapper::ProcessOutput;
use crate::cancel::CancelSignal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub command_line: String,
    pub input: Option<String>,
    pub attached: bool,
}

/// Records every command and answers from a script keyed by command-line
/// prefix. Unscripted commands succeed with empty output.
#[derive(Default)]
pub struct RecordingRunner {
    recorded: Mutex<Vec<Recorded>>,
    outputs: Mutex<HashMap<String, String>>,
    failures: Mutex<Vec<String>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands starting with `prefix` succeed and print `output`.
    pub fn respond(self, prefix: &str, output: &str) -> Self {
        self.outputs
            .lock()
            .unwrap()
            .insert(prefix.to_string(), output.to_string());
        self
    }

    /// Commands starting with `prefix` exit with status 1.
    pub fn fail(self, prefix: &str) -> Self {
        self.failures.lock().unwrap().push(prefix.to_string());
        self
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.recorded()
            .into_iter()
            .map(|r| r.command_line)
            .collect()
    }

    fn answer(&self, invocation: &Invocation, attached: bool) -> Result<ProcessOutput, ExecError> {
        let command_line = invocation.command_line();
        self.recorded.lock().unwrap().push(Recorded {
            command_line: command_line.clone(),
            input: invocation
                .stdin_input()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
            attached,
        });

        if self
            .failures
            .lock()
            .unwrap()
            .iter()
            .any(|prefix| command_line.starts_with(prefix.as_str()))
        {
            return Err(ExecError::Failed {
                command: command_line,
                status: ExitStatus::from_raw(1 << 8),
                output: "scripted failure".to_string(),
            });
        }

        let output = self
            .outputs
            .lock()
            .unwrap()
            .iter()
            .filter(|(prefix, _)| command_line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, output)| output.clone())
            .unwrap_or_default();
        Ok(ProcessOutput {
            status: ExitStatus::from_raw(0),
            output,
        })
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        _signal: &CancelSignal,
    ) -> Result<ProcessOutput, ExecError> {
        self.answer(invocation, false)
    }

    async fn run_attached(
        &self,
        invocation: &Invocation,
        _signal: &CancelSignal,
    ) -> Result<ProcessOutput, ExecError> {
        self.answer(invocation, true)
    }
}
