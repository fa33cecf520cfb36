use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::Arc,
};

use error_stack::{Report, ResultExt};
use kiln_worker::{bundle::is_safe_relative, TaskId};
use parking_lot::Mutex;
use tracing::{event, Level};

use crate::{
    artifact::{ArtifactHandle, ArtifactStore},
    config::ManagerConfig,
    error::DeclarationError,
    registry::WorkerRegistry,
    task::{CompletedTask, Task, TaskRecord, TaskResult, TaskState},
};

pub(crate) type SharedState = Arc<Mutex<ManagerState>>;

/// Everything the manager knows. Only touched with the lock held, and the lock is never held
/// across an await.
pub(crate) struct ManagerState {
    pub config: ManagerConfig,
    pub artifacts: ArtifactStore,
    pub workers: WorkerRegistry,
    /// Tasks that have been submitted and have not reached a terminal state.
    pub tasks: BTreeMap<TaskId, TaskRecord>,
    /// The subset of `tasks` waiting to be dispatched, in submission order.
    pub waiting: BTreeSet<TaskId>,
    pub finished: u64,
    next_task: u64,
    completed_tx: flume::Sender<CompletedTask>,
}

impl ManagerState {
    pub fn new(config: ManagerConfig, completed_tx: flume::Sender<CompletedTask>) -> Self {
        Self {
            config,
            artifacts: ArtifactStore::default(),
            workers: WorkerRegistry::default(),
            tasks: BTreeMap::new(),
            waiting: BTreeSet::new(),
            finished: 0,
            next_task: 0,
            completed_tx,
        }
    }

    /// Check a task's bindings and queue it.
    pub fn submit(&mut self, task: Task) -> Result<TaskId, Report<DeclarationError>> {
        if task.command().trim().is_empty() {
            return Err(Report::new(DeclarationError::EmptyCommand));
        }

        let mut names = HashSet::new();
        for input in task.inputs() {
            if !self.artifacts.contains(input.artifact) {
                return Err(Report::new(DeclarationError::UnknownArtifact))
                    .attach_printable_lazy(|| format!("Input {}", input.artifact));
            }
            check_remote_name(&input.remote_name)?;
            if !names.insert(input.remote_name.as_str()) {
                return Err(Report::new(DeclarationError::DuplicateRemoteName))
                    .attach_printable_lazy(|| input.remote_name.clone());
            }
        }

        for output in task.outputs() {
            match self.artifacts.is_unpack(output.artifact) {
                None => {
                    return Err(Report::new(DeclarationError::UnknownArtifact))
                        .attach_printable_lazy(|| format!("Output {}", output.artifact));
                }
                Some(true) => {
                    return Err(Report::new(DeclarationError::InvalidOutput))
                        .attach_printable_lazy(|| {
                            format!("{} is an archive declared for unpacking", output.artifact)
                        });
                }
                Some(false) => {}
            }
            check_remote_name(&output.remote_path)?;
        }

        self.next_task += 1;
        let id = TaskId(self.next_task);
        let resources = task.resources(self.config.default_resources);
        event!(Level::DEBUG, task_id = %id, command = %task.command(), %resources, "task submitted");

        self.tasks.insert(id, TaskRecord::new(id, task, resources));
        self.waiting.insert(id);
        Ok(id)
    }

    pub fn running(&self) -> usize {
        self.tasks.len() - self.waiting.len()
    }

    /// Hand a terminal task to [crate::Manager::wait].
    pub fn deliver(&mut self, completed: CompletedTask) {
        self.finished += 1;
        event!(
            Level::INFO,
            task_id = %completed.id,
            result = %completed.result,
            exit_code = ?completed.exit_code,
            tries = completed.tries,
            "task finished"
        );
        self.completed_tx.send(completed).ok();
    }

    /// Remove a task and deliver it as failed without having run.
    pub fn fail(&mut self, task_id: TaskId, error: String) {
        let Some(record) = self.tasks.remove(&task_id) else {
            return;
        };
        self.waiting.remove(&task_id);
        debug_assert!(
            record.state == TaskState::Waiting,
            "only waiting tasks fail without a worker"
        );

        let mut completed = record.into_completed(TaskResult::FailedInfrastructure);
        completed.error = Some(error);
        self.deliver(completed);
    }

    /// Fail every waiting task that reads `handle`.
    pub fn fail_waiting_on(&mut self, handle: ArtifactHandle, error: &str) {
        let affected = self
            .waiting
            .iter()
            .copied()
            .filter(|id| {
                self.tasks
                    .get(id)
                    .is_some_and(|r| r.task.inputs().iter().any(|i| i.artifact == handle))
            })
            .collect::<Vec<_>>();

        for task_id in affected {
            event!(Level::WARN, %task_id, %handle, "task input could not be hashed");
            self.fail(task_id, error.to_string());
        }
    }
}

fn check_remote_name(name: &str) -> Result<(), Report<DeclarationError>> {
    if is_safe_relative(name) {
        Ok(())
    } else {
        Err(Report::new(DeclarationError::InvalidRemoteName))
            .attach_printable_lazy(|| format!("{name:?}"))
    }
}
