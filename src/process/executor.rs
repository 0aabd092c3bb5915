//! Command execution seam.
//!
//! Domain steps run their commands through [`CommandRunner`] so tests can
//! swap in a recorder instead of touching real disks.

use async_trait::async_trait;

use super::error::ExecError;
use super::invocation::Invocation;
use super::wrapper::{self, ProcessOutput};
use crate::cancel::CancelSignal;

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run with output captured (see [`wrapper::run`]).
    async fn run(
        &self,
        invocation: &Invocation,
        signal: &CancelSignal,
    ) -> Result<ProcessOutput, ExecError>;

    /// Run attached to the terminal (see [`wrapper::run_attached`]).
    async fn run_attached(
        &self,
        invocation: &Invocation,
        signal: &CancelSignal,
    ) -> Result<ProcessOutput, ExecError>;
}

/// Runs real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        signal: &CancelSignal,
    ) -> Result<ProcessOutput, ExecError> {
        wrapper::run(invocation, signal).await
    }

    async fn run_attached(
        &self,
        invocation: &Invocation,
        signal: &CancelSignal,
    ) -> Result<ProcessOutput, ExecError> {
        wrapper::run_attached(invocation, signal).await
    }
}
