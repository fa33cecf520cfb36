use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use error_stack::{Report, ResultExt};
use kiln_worker::{protocol::ManagerMessage, TaskId};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{event, instrument, Level};

use crate::{
    artifact::ArtifactHandle,
    config::ManagerConfig,
    error::{DeclarationError, ManagerError, TransferError},
    monitor,
    registry::Outgoing,
    scheduler, server,
    state::{ManagerState, SharedState},
    task::{CompletedTask, Task},
};

/// A snapshot of the manager's queue and worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub tasks_waiting: usize,
    pub tasks_running: usize,
    /// Tasks that reached a terminal state, including cancelled ones.
    pub tasks_done: u64,
    pub workers_connected: usize,
    pub cores_total: u32,
    pub cores_committed: u32,
    /// Artifact transfers sent to workers.
    pub transfers: u64,
}

/// Accepts workers on a TCP port and runs submitted tasks on them.
///
/// Everything except [Manager::wait] returns immediately. Dispatch happens in the background
/// as workers connect and report results, and again whenever `wait` is called.
///
/// ```ignore
/// let manager = Manager::bind(ManagerConfig::default().with_port(0)).await?;
/// let input = manager.declare_buffer("hello");
/// let output = manager.declare_buffer("");
///
/// let mut task = Task::new("cp in.txt out.txt");
/// task.add_input(&input, "in.txt").add_output(&output, "out.txt", true);
/// manager.submit(task)?;
///
/// while !manager.empty() {
///     if let Some(done) = manager.wait(Duration::from_secs(5)).await {
///         println!("{} {}", done.id(), done.result());
///     }
/// }
/// ```
pub struct Manager {
    state: SharedState,
    completed: flume::Receiver<CompletedTask>,
    local_addr: SocketAddr,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    /// Start listening for workers.
    #[instrument(level = "debug", skip(config), fields(name = %config.name, bind = %config.bind))]
    pub async fn bind(config: ManagerConfig) -> Result<Manager, Report<ManagerError>> {
        let listener = TcpListener::bind(config.bind)
            .await
            .change_context(ManagerError::Bind)
            .attach_printable_lazy(|| format!("Binding {}", config.bind))?;
        let local_addr = listener.local_addr().change_context(ManagerError::Bind)?;

        let liveness_interval = config.liveness_check_interval;
        let worker_timeout = config.worker_timeout;
        event!(Level::INFO, name = %config.name, %local_addr, "manager listening");

        let (completed_tx, completed) = flume::unbounded();
        let state: SharedState = Arc::new(Mutex::new(ManagerState::new(config, completed_tx)));
        let hash_jobs = state.lock().artifacts.hash_jobs();

        let background = vec![
            tokio::spawn(server::hash_loop(state.clone(), hash_jobs)),
            tokio::spawn(server::accept_loop(listener, state.clone())),
            tokio::spawn(server::liveness_loop(
                state.clone(),
                liveness_interval,
                worker_timeout,
            )),
        ];

        Ok(Manager {
            state,
            completed,
            local_addr,
            background: Mutex::new(background),
        })
    }

    /// The port workers should connect to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn name(&self) -> String {
        self.state.lock().config.name.clone()
    }

    /// Rename the manager. Workers that connect afterwards are greeted with the new name.
    pub fn set_name(&self, name: impl Into<String>) {
        self.state.lock().config.name = name.into();
    }

    /// Declare a local file or directory. Nothing is read until a task needs it, and then it is
    /// hashed in the background while the task waits.
    pub fn declare_file(
        &self,
        path: impl Into<PathBuf>,
    ) -> Result<ArtifactHandle, Report<DeclarationError>> {
        self.state.lock().artifacts.declare_path(path, false)
    }

    /// Declare an archive that workers extract on arrival. Tasks see the extracted tree under
    /// the input's remote name.
    pub fn declare_untar(
        &self,
        path: impl Into<PathBuf>,
    ) -> Result<ArtifactHandle, Report<DeclarationError>> {
        self.state.lock().artifacts.declare_path(path, true)
    }

    /// Declare an in-memory artifact.
    pub fn declare_buffer(&self, bytes: impl Into<Vec<u8>>) -> ArtifactHandle {
        self.state.lock().artifacts.declare_buffer(bytes.into())
    }

    /// Queue a task. Bad bindings are rejected here and the task is never queued.
    pub fn submit(&self, task: Task) -> Result<TaskId, Report<DeclarationError>> {
        let mut state = self.state.lock();
        let task_id = state.submit(task)?;
        scheduler::dispatch(&mut state);
        Ok(task_id)
    }

    /// Return the next task to reach a terminal state, waiting up to `timeout` for one.
    /// Each task is returned exactly once.
    pub async fn wait(&self, timeout: Duration) -> Option<CompletedTask> {
        {
            let mut state = self.state.lock();
            scheduler::dispatch(&mut state);
        }

        if let Ok(completed) = self.completed.try_recv() {
            return Some(completed);
        }
        if timeout.is_zero() {
            return None;
        }

        tokio::time::timeout(timeout, self.completed.recv_async())
            .await
            .ok()
            .and_then(Result::ok)
    }

    /// True when no task is waiting, running, or finished but not yet returned by
    /// [Manager::wait].
    pub fn empty(&self) -> bool {
        self.state.lock().tasks.is_empty() && self.completed.is_empty()
    }

    /// Withdraw a task. Running tasks are killed on their worker if possible. The cancelled
    /// task is returned here and will not come back from [Manager::wait].
    pub fn cancel(&self, task_id: TaskId) -> Result<CompletedTask, Report<DeclarationError>> {
        let mut state = self.state.lock();
        let completed = monitor::cancel(&mut state, task_id)?;
        scheduler::dispatch(&mut state);
        Ok(completed)
    }

    /// Read the current contents of a file or buffer artifact, including data stored by
    /// task outputs.
    pub fn contents(&self, handle: ArtifactHandle) -> Result<Vec<u8>, Report<TransferError>> {
        let source = self
            .state
            .lock()
            .artifacts
            .contents_source(handle)
            .ok_or_else(|| Report::new(TransferError::Load))
            .attach_printable_lazy(|| format!("Unknown artifact {handle}"))?;
        source.read()
    }

    pub fn stats(&self) -> ManagerStats {
        let state = self.state.lock();
        let (cores_total, cores_committed) = state
            .workers
            .iter()
            .fold((0, 0), |(total, committed), w| {
                (total + w.capacity.cores, committed + w.committed.cores)
            });

        ManagerStats {
            tasks_waiting: state.waiting.len(),
            tasks_running: state.running(),
            tasks_done: state.finished,
            workers_connected: state.workers.len(),
            cores_total,
            cores_committed,
            transfers: state.artifacts.transfers(),
        }
    }

    /// Stop accepting workers and tell every connected worker to exit. Tasks still queued
    /// are abandoned.
    pub fn shutdown(&self) {
        let background = std::mem::take(&mut *self.background.lock());
        if background.is_empty() {
            return;
        }
        for handle in background {
            handle.abort();
        }

        let workers = self.state.lock().workers.drain();
        event!(Level::INFO, workers = workers.len(), "shutting down manager");
        for worker in workers {
            worker.send(Outgoing::Message(ManagerMessage::Shutdown));
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
