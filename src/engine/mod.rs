// Task Engine - composable units of work with paired cleanups
//
// Steps are composed serially or in parallel, driven by a Runner, and all
// share one cancellation signal per run.

pub mod types;
pub mod compose;
pub mod runner;


pub use types::{Action, Cleanup, CleanupQueue, Step, Task};
pub use runner::Runner;
