//! Per-connection liveness probing.
//!
//! While a connection has outstanding tasks, its [`TaskConnectionTester`]
//! reads the remote service state every probe interval. If the read fails,
//! times out or reports the service as not running, every outstanding task
//! is force-completed with a disconnect error and the tester tears itself
//! down. When the last task completes or is unregistered the tester is
//! disposed and removed from the registry; the next registration creates a
//! fresh one.
//!
//! A waiter on a task therefore never blocks longer than one probe interval
//! plus one probe timeout after the connection dies.

use super::task::RemoteTask;
use crate::remote::LivenessProbe;
use cimcache_core::{
    CacheConfig, CimCacheError, CimCacheResult, ConnectionId, StorageError, TaskError, TaskId,
    UsageError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Result of one probe cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Service answered and is running; probing continues.
    Healthy,
    /// No outstanding tasks were left; the tester disposed itself.
    Idle,
    /// Connectivity was lost; this many tasks were force-completed.
    Disconnected(usize),
}

#[derive(Default)]
struct TesterState {
    tasks: HashMap<TaskId, Arc<dyn RemoteTask>>,
    disposed: bool,
}

enum Registration {
    First,
    Added,
    Disposed,
}

/// Liveness prober for one connection.
pub struct TaskConnectionTester {
    connection: ConnectionId,
    probe: Arc<dyn LivenessProbe>,
    state: Mutex<TesterState>,
    probe_loop: Mutex<Option<JoinHandle<()>>>,
}

impl TaskConnectionTester {
    fn new(connection: ConnectionId, probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            connection,
            probe,
            state: Mutex::new(TesterState::default()),
            probe_loop: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, TesterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!(connection = %self.connection, "Tester lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    pub fn is_disposed(&self) -> bool {
        self.state().disposed
    }

    pub fn task_count(&self) -> usize {
        self.state().tasks.len()
    }

    fn add_task(&self, task: Arc<dyn RemoteTask>) -> Registration {
        let mut state = self.state();
        if state.disposed {
            return Registration::Disposed;
        }
        state.tasks.insert(task.id(), task);
        if state.tasks.len() == 1 {
            Registration::First
        } else {
            Registration::Added
        }
    }

    /// Remove a task. Returns whether it was registered and how many remain.
    fn remove_task(&self, id: TaskId) -> (bool, usize) {
        let mut state = self.state();
        let removed = state.tasks.remove(&id).is_some();
        (removed, state.tasks.len())
    }

    fn start_probing(
        self: &Arc<Self>,
        runtime: &Handle,
        table: Weak<TesterTable>,
        interval: Duration,
        timeout: Duration,
    ) {
        let tester = Arc::downgrade(self);
        let handle = runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(tester) = tester.upgrade() else {
                    break;
                };
                if tester.probe_once(timeout).await == ProbeOutcome::Healthy {
                    continue;
                }
                if let Some(table) = table.upgrade() {
                    table.remove_if_same(&tester);
                }
                break;
            }
        });

        tracing::debug!(connection = %self.connection, "Started liveness probing");
        let mut probe_loop = self.probe_loop.lock().unwrap_or_else(|p| p.into_inner());
        if self.is_disposed() {
            handle.abort();
        } else {
            *probe_loop = Some(handle);
        }
    }

    /// Run one probe cycle.
    pub async fn probe_once(&self, timeout: Duration) -> ProbeOutcome {
        let outstanding = {
            let mut state = self.state();
            state.tasks.retain(|_, task| !task.is_completed());
            if state.tasks.is_empty() {
                state.disposed = true;
                drop(state);
                tracing::debug!(connection = %self.connection, "No outstanding tasks, stopping probe");
                return ProbeOutcome::Idle;
            }
            state.tasks.len()
        };

        tracing::debug!(connection = %self.connection, tasks = outstanding, "Probing service state");
        let failure = match tokio::time::timeout(timeout, self.probe.read_service_state(timeout)).await {
            Ok(Ok(state)) if state.is_running() => return ProbeOutcome::Healthy,
            Ok(Ok(state)) => {
                tracing::warn!(connection = %self.connection, state = %state, "Management service is not running");
                TaskError::ServiceNotRunning {
                    connection: self.connection.clone(),
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(connection = %self.connection, error = %e, "Liveness probe failed");
                TaskError::Disconnected {
                    connection: self.connection.clone(),
                }
            }
            Err(_) => {
                tracing::warn!(
                    connection = %self.connection,
                    timeout_ms = timeout.as_millis() as u64,
                    "Liveness probe timed out"
                );
                TaskError::Disconnected {
                    connection: self.connection.clone(),
                }
            }
        };

        let failed = self.fail_all(failure.into());
        ProbeOutcome::Disconnected(failed)
    }

    /// Dispose and force-complete every outstanding task with `error`.
    fn fail_all(&self, error: CimCacheError) -> usize {
        let tasks: Vec<Arc<dyn RemoteTask>> = {
            let mut state = self.state();
            state.disposed = true;
            state.tasks.drain().map(|(_, task)| task).collect()
        };
        for task in &tasks {
            tracing::error!(
                connection = %self.connection,
                task = %task.id(),
                error = %error,
                "Failing outstanding task"
            );
            task.inform_disconnected(error.clone());
        }
        tasks.len()
    }

    /// Stop probing. Outstanding tasks are left as they are.
    fn dispose(&self) {
        self.state().disposed = true;
        let handle = self
            .probe_loop
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        tracing::debug!(connection = %self.connection, "Disposed connection tester");
    }
}

impl std::fmt::Debug for TaskConnectionTester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskConnectionTester")
            .field("connection", &self.connection)
            .field("tasks", &self.task_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

struct TesterTable {
    testers: Mutex<HashMap<ConnectionId, Arc<TaskConnectionTester>>>,
    probe_interval: Duration,
    probe_timeout: Duration,
}

impl TesterTable {
    fn testers(&self) -> CimCacheResult<MutexGuard<'_, HashMap<ConnectionId, Arc<TaskConnectionTester>>>> {
        self.testers
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn get_or_create(
        &self,
        connection: &ConnectionId,
        probe: &Arc<dyn LivenessProbe>,
    ) -> CimCacheResult<Arc<TaskConnectionTester>> {
        let mut testers = self.testers()?;
        if let Some(tester) = testers.get(connection) {
            if !tester.is_disposed() {
                return Ok(tester.clone());
            }
        }
        let tester = Arc::new(TaskConnectionTester::new(connection.clone(), probe.clone()));
        testers.insert(connection.clone(), tester.clone());
        Ok(tester)
    }

    fn remove_if_same(&self, tester: &Arc<TaskConnectionTester>) {
        let Ok(mut testers) = self.testers() else {
            return;
        };
        if testers
            .get(tester.connection())
            .is_some_and(|current| Arc::ptr_eq(current, tester))
        {
            testers.remove(tester.connection());
            tracing::debug!(connection = %tester.connection(), "Removed connection tester");
        }
    }
}

/// Registry of connection testers, one per connection with outstanding
/// tasks.
#[derive(Clone)]
pub struct TaskConnectionTesters {
    table: Arc<TesterTable>,
}

impl TaskConnectionTesters {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            table: Arc::new(TesterTable {
                testers: Mutex::new(HashMap::new()),
                probe_interval: config.probe_interval,
                probe_timeout: config.probe_timeout,
            }),
        }
    }

    /// Track `task` on `connection` until it completes.
    ///
    /// The first outstanding task on a connection starts the probe loop,
    /// which requires a tokio runtime. Tasks that already completed are not
    /// tracked.
    pub fn register_task(
        &self,
        connection: &ConnectionId,
        probe: Arc<dyn LivenessProbe>,
        task: Arc<dyn RemoteTask>,
    ) -> CimCacheResult<()> {
        if task.is_completed() {
            return Ok(());
        }
        let runtime = Handle::try_current().map_err(|_| UsageError::InvalidArgument {
            name: "runtime".to_string(),
            reason: "task registration requires a tokio runtime".to_string(),
        })?;

        loop {
            let tester = self.table.get_or_create(connection, &probe)?;
            match tester.add_task(task.clone()) {
                Registration::First => {
                    tester.start_probing(
                        &runtime,
                        Arc::downgrade(&self.table),
                        self.table.probe_interval,
                        self.table.probe_timeout,
                    );
                    return Ok(());
                }
                Registration::Added => return Ok(()),
                // Torn down between lookup and insert; retry with a new one.
                Registration::Disposed => self.table.remove_if_same(&tester),
            }
        }
    }

    /// Stop tracking a task. Disposes the tester when it was the last one.
    pub fn unregister_task(&self, connection: &ConnectionId, id: TaskId) -> CimCacheResult<bool> {
        let mut testers = self.table.testers()?;
        let Some(tester) = testers.get(connection).cloned() else {
            return Ok(false);
        };
        let (removed, remaining) = tester.remove_task(id);
        if remaining == 0 {
            tester.dispose();
            testers.remove(connection);
        }
        Ok(removed)
    }

    pub fn tester(&self, connection: &ConnectionId) -> CimCacheResult<Option<Arc<TaskConnectionTester>>> {
        Ok(self.table.testers()?.get(connection).cloned())
    }

    pub fn tester_count(&self) -> usize {
        self.table.testers().map(|t| t.len()).unwrap_or(0)
    }

    /// Tear down the tester of a connection that is going away, failing its
    /// outstanding tasks. Returns how many tasks were failed.
    pub fn remove_connection(&self, connection: &ConnectionId) -> CimCacheResult<usize> {
        let tester = self.table.testers()?.remove(connection);
        Ok(tester.map_or(0, |tester| Self::shut_down(&tester)))
    }

    /// Tear down every tester, failing all outstanding tasks.
    pub fn teardown_all(&self) -> CimCacheResult<usize> {
        let testers: Vec<_> = self.table.testers()?.drain().map(|(_, t)| t).collect();
        Ok(testers.iter().map(Self::shut_down).sum())
    }

    fn shut_down(tester: &Arc<TaskConnectionTester>) -> usize {
        tester.dispose();
        tester.fail_all(
            TaskError::Disconnected {
                connection: tester.connection().clone(),
            }
            .into(),
        )
    }
}

impl std::fmt::Debug for TaskConnectionTesters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskConnectionTesters")
            .field("testers", &self.tester_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::task::{PendingTask, TaskStatus};
    use crate::MockRemoteService;
    use cimcache_core::ServiceState;

    fn testers() -> TaskConnectionTesters {
        TaskConnectionTesters::new(&CacheConfig::default())
    }

    fn setup() -> (ConnectionId, Arc<MockRemoteService>) {
        let id = ConnectionId::new("host01");
        (id.clone(), Arc::new(MockRemoteService::new(id)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_probe_keeps_tasks() {
        let (id, mock) = setup();
        let testers = testers();
        let task = Arc::new(PendingTask::new(id.clone()));
        testers.register_task(&id, mock.clone(), task.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(mock.probe_calls(), 1);
        assert!(!task.is_completed());
        assert_eq!(testers.tester_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_service_fails_tasks() {
        let (id, mock) = setup();
        let testers = testers();
        let task = Arc::new(PendingTask::new(id.clone()));
        testers.register_task(&id, mock.clone(), task.clone()).unwrap();
        mock.set_service_state(ServiceState::Stopped);

        let err = task.wait_for_completion(None).await.unwrap_err();
        assert_eq!(
            err,
            CimCacheError::from(TaskError::ServiceNotRunning { connection: id.clone() })
        );
        assert_eq!(task.status(), TaskStatus::CompletedWithErrors);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_times_out() {
        let (id, mock) = setup();
        let testers = testers();
        let task = Arc::new(PendingTask::new(id.clone()));
        testers.register_task(&id, mock.clone(), task.clone()).unwrap();
        mock.hang_probe();

        let started = tokio::time::Instant::now();
        let err = task.wait_for_completion(None).await.unwrap_err();
        assert!(err.is_connectivity());
        assert!(started.elapsed() <= Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_completion_disposes_tester() {
        let (id, mock) = setup();
        let testers = testers();
        let task = Arc::new(PendingTask::new(id.clone()));
        testers.register_task(&id, mock.clone(), task.clone()).unwrap();
        let tester = testers.tester(&id).unwrap().unwrap();

        task.succeed();
        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert!(tester.is_disposed());
        assert_eq!(testers.tester_count(), 0);
        assert_eq!(mock.probe_calls(), 0);
    }

    #[tokio::test]
    async fn test_unregister_last_task_disposes() {
        let (id, mock) = setup();
        let testers = testers();
        let a = Arc::new(PendingTask::new(id.clone()));
        let b = Arc::new(PendingTask::new(id.clone()));
        testers.register_task(&id, mock.clone(), a.clone()).unwrap();
        testers.register_task(&id, mock.clone(), b.clone()).unwrap();
        let tester = testers.tester(&id).unwrap().unwrap();
        assert_eq!(tester.task_count(), 2);

        assert!(testers.unregister_task(&id, a.id()).unwrap());
        assert!(!tester.is_disposed());
        assert!(testers.unregister_task(&id, b.id()).unwrap());
        assert!(tester.is_disposed());
        assert_eq!(testers.tester_count(), 0);

        // A fresh tester replaces the disposed one.
        let c = Arc::new(PendingTask::new(id.clone()));
        testers.register_task(&id, mock, c).unwrap();
        let fresh = testers.tester(&id).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&tester, &fresh));
    }

    #[tokio::test]
    async fn test_completed_task_is_not_tracked() {
        let (id, mock) = setup();
        let testers = testers();
        let task = Arc::new(PendingTask::completed(id.clone(), TaskStatus::CompletedSuccessfully, None));
        testers.register_task(&id, mock, task).unwrap();
        assert_eq!(testers.tester_count(), 0);
    }

    #[test]
    fn test_register_outside_runtime_is_rejected() {
        let (id, mock) = setup();
        let task = Arc::new(PendingTask::new(id.clone()));
        let err = testers().register_task(&id, mock, task).unwrap_err();
        assert!(err.is_usage());
    }
}
