//! Remote service state as reported by a liveness read.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Run state of the remote management service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Service is up and answering
    Running,
    /// Service has been asked to stop or is stopping
    Stopping,
    /// Service is stopped
    Stopped,
    /// Service is paused
    Paused,
    /// State could not be determined
    Unknown,
}

impl ServiceState {
    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::Running)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Paused => "paused",
            ServiceState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}
