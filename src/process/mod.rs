//! External process execution.
//!
//! [`wrapper`] holds the leaf every step eventually calls to talk to the
//! OS: it runs one command, captures its combined output, and kills and
//! reaps the child when the run's cancellation signal fires.

pub mod error;
pub mod executor;
pub mod invocation;
pub mod wrapper;

#[cfg(test)]
pub mod mocks;

pub use error::ExecError;
pub use executor::{CommandRunner, ProcessRunner};
pub use invocation::{Invocation, OutputBinding};
pub use wrapper::{run, run_attached, ProcessOutput};
