//! Task liveness: outstanding remote tasks and the per-connection testers
//! that fail them when the connection dies.

pub mod task;
pub mod tester;

pub use task::{PendingTask, RemoteTask, TaskStatus};
pub use tester::{ProbeOutcome, TaskConnectionTester, TaskConnectionTesters};
