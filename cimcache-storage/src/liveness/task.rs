//! Outstanding remote operations.

use cimcache_core::{CimCacheError, CimCacheResult, ConnectionId, TaskError, TaskId};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// Lifecycle status of a remote task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Running,
    CompletedSuccessfully,
    CompletedWithErrors,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Running => "running",
            TaskStatus::CompletedSuccessfully => "completed",
            TaskStatus::CompletedWithErrors => "failed",
            TaskStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// What the liveness prober needs from an outstanding task.
pub trait RemoteTask: Send + Sync {
    fn id(&self) -> TaskId;

    fn is_completed(&self) -> bool;

    /// Force the task to complete with `error`. Called when the connection
    /// it runs on is confirmed unreachable.
    fn inform_disconnected(&self, error: CimCacheError);
}

#[derive(Debug, Clone)]
struct TaskState {
    status: TaskStatus,
    error: Option<CimCacheError>,
}

/// A remote operation whose completion callers can wait on.
///
/// The first completion wins. Later completions, including a disconnect
/// arriving after the real result, are ignored.
#[derive(Debug)]
pub struct PendingTask {
    id: TaskId,
    connection: ConnectionId,
    state: watch::Sender<TaskState>,
}

impl PendingTask {
    pub fn new(connection: ConnectionId) -> Self {
        let (state, _) = watch::channel(TaskState {
            status: TaskStatus::Running,
            error: None,
        });
        Self {
            id: TaskId::now_v7(),
            connection,
            state,
        }
    }

    /// A task for an operation that already finished synchronously.
    pub fn completed(connection: ConnectionId, status: TaskStatus, error: Option<CimCacheError>) -> Self {
        let task = Self::new(connection);
        let status = if status.is_terminal() {
            status
        } else {
            TaskStatus::CompletedSuccessfully
        };
        task.complete(status, error);
        task
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    pub fn status(&self) -> TaskStatus {
        self.state.borrow().status
    }

    pub fn error(&self) -> Option<CimCacheError> {
        self.state.borrow().error.clone()
    }

    /// Record the final status. Returns `false` if the task had already
    /// completed or `status` is not terminal.
    pub fn complete(&self, status: TaskStatus, error: Option<CimCacheError>) -> bool {
        if !status.is_terminal() {
            return false;
        }
        let completed = self.state.send_if_modified(|state| {
            if state.status.is_terminal() {
                return false;
            }
            state.status = status;
            state.error = error;
            true
        });
        if completed {
            tracing::debug!(task = %self.id, connection = %self.connection, status = %status, "Task completed");
        }
        completed
    }

    pub fn succeed(&self) -> bool {
        self.complete(TaskStatus::CompletedSuccessfully, None)
    }

    pub fn fail(&self, error: CimCacheError) -> bool {
        self.complete(TaskStatus::CompletedWithErrors, Some(error))
    }

    pub fn cancel(&self) -> bool {
        self.complete(TaskStatus::Canceled, None)
    }

    /// Wait until the task completes, optionally bounded by `timeout`.
    ///
    /// A task that completed with errors yields its error.
    pub async fn wait_for_completion(&self, timeout: Option<Duration>) -> CimCacheResult<TaskStatus> {
        let mut rx = self.state.subscribe();
        let wait = async {
            // The sender lives in `self`, so the channel cannot close here.
            let state = rx.wait_for(|s| s.status.is_terminal()).await;
            state.map(|s| (*s).clone()).ok()
        };

        let state = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| TaskError::WaitTimedOut { timeout: limit })?,
            None => wait.await,
        };

        let state = match state {
            Some(state) => state,
            None => self.state.borrow().clone(),
        };
        match state.status {
            TaskStatus::CompletedWithErrors => Err(state.error.unwrap_or_else(|| {
                TaskError::Failed {
                    code: -1,
                    message: "task completed with errors".to_string(),
                }
                .into()
            })),
            status => Ok(status),
        }
    }
}

impl RemoteTask for PendingTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn is_completed(&self) -> bool {
        self.status().is_terminal()
    }

    fn inform_disconnected(&self, error: CimCacheError) {
        self.fail(error);
    }
}
