// Summon Library - task engine and the disk provisioning built on it
// This exposes the core components for testing and integration

pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod interrupt;
pub mod plan;
pub mod process;
pub mod system;
pub mod telemetry;

// Re-export key types for easy access
pub use cancel::{CancelReason, CancelSignal};
pub use config::{LoggingConfig, SummonConfig, SystemSettings};
pub use engine::{Cleanup, CleanupQueue, Runner, Step, Task};
pub use error::{MultiError, TaskError};
pub use interrupt::{InterruptCoordinator, InterruptOutcome};
pub use process::{CommandRunner, ExecError, Invocation, OutputBinding, ProcessOutput, ProcessRunner};
pub use system::{FsType, System};
pub use telemetry::{generate_correlation_id, init_telemetry};
