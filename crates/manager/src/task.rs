use std::fmt;

use kiln_worker::{Bundle, Resources, Statistics, TaskId, WorkerId};
use time::OffsetDateTime;

use crate::artifact::ArtifactHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBinding {
    pub artifact: ArtifactHandle,
    pub remote_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBinding {
    pub artifact: ArtifactHandle,
    pub remote_path: String,
    /// The output must exist after the command exits for the task to succeed.
    pub watch: bool,
}

/// A shell command along with the artifacts it reads and writes.
///
/// ```ignore
/// let mut task = Task::new("fastqc reads.fastq -o out");
/// task.add_input(&reads, "reads.fastq")
///     .add_output(&report, "out/report.html", true)
///     .set_cores(2);
/// ```
#[derive(Debug, Clone)]
pub struct Task {
    command: String,
    inputs: Vec<InputBinding>,
    outputs: Vec<OutputBinding>,
    cores: Option<u32>,
    memory: Option<u64>,
    disk: Option<u64>,
    tag: Option<String>,
}

impl Task {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            cores: None,
            memory: None,
            disk: None,
            tag: None,
        }
    }

    /// Make `artifact` available to the command as `remote_name`, relative to its working
    /// directory.
    pub fn add_input(&mut self, artifact: &ArtifactHandle, remote_name: impl Into<String>) -> &mut Self {
        self.inputs.push(InputBinding {
            artifact: *artifact,
            remote_name: remote_name.into(),
        });
        self
    }

    /// Store `remote_path` into `artifact` when the task succeeds.
    pub fn add_output(
        &mut self,
        artifact: &ArtifactHandle,
        remote_path: impl Into<String>,
        watch: bool,
    ) -> &mut Self {
        self.outputs.push(OutputBinding {
            artifact: *artifact,
            remote_path: remote_path.into(),
            watch,
        });
        self
    }

    pub fn set_cores(&mut self, cores: u32) -> &mut Self {
        self.cores = Some(cores);
        self
    }

    /// Memory request in megabytes.
    pub fn set_memory(&mut self, memory: u64) -> &mut Self {
        self.memory = Some(memory);
        self
    }

    /// Disk request in megabytes.
    pub fn set_disk(&mut self, disk: u64) -> &mut Self {
        self.disk = Some(disk);
        self
    }

    /// A label carried through to the [CompletedTask].
    pub fn set_tag(&mut self, tag: impl Into<String>) -> &mut Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn inputs(&self) -> &[InputBinding] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputBinding] {
        &self.outputs
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The resources this task asks for, with anything unset taken from `defaults`.
    pub fn resources(&self, defaults: Resources) -> Resources {
        Resources::new(
            self.cores.unwrap_or(defaults.cores),
            self.memory.unwrap_or(defaults.memory),
            self.disk.unwrap_or(defaults.disk),
        )
    }
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    /// The command exited with 0 and every watched output was present.
    Succeeded,
    /// The command ran but exited non-zero, or a watched output never appeared.
    FailedExecution,
    /// The task could not be run: its inputs could not be transferred, the command could not
    /// be launched, its outputs could not be stored, or it ran out of retries after losing
    /// workers.
    FailedInfrastructure,
    /// Withdrawn with [crate::Manager::cancel]. Only that call returns it; a cancelled task is
    /// never delivered by [crate::Manager::wait].
    Cancelled,
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskResult::Succeeded => "succeeded",
            TaskResult::FailedExecution => "failed execution",
            TaskResult::FailedInfrastructure => "failed infrastructure",
            TaskResult::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A task in a terminal state.
#[derive(Debug, Clone)]
pub struct CompletedTask {
    pub(crate) id: TaskId,
    pub(crate) task: Task,
    pub(crate) result: TaskResult,
    pub(crate) exit_code: Option<i32>,
    pub(crate) stdout: String,
    pub(crate) error: Option<String>,
    pub(crate) missing_outputs: Vec<String>,
    pub(crate) worker: Option<WorkerId>,
    pub(crate) tries: u32,
    pub(crate) submitted_at: OffsetDateTime,
    pub(crate) finished_at: OffsetDateTime,
    pub(crate) stats: Option<Statistics>,
}

impl CompletedTask {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn command(&self) -> &str {
        self.task.command()
    }

    pub fn tag(&self) -> Option<&str> {
        self.task.tag()
    }

    pub fn result(&self) -> TaskResult {
        self.result
    }

    pub fn successful(&self) -> bool {
        self.result == TaskResult::Succeeded
    }

    /// True if the command ran to completion, whether or not it succeeded.
    pub fn completed(&self) -> bool {
        matches!(
            self.result,
            TaskResult::Succeeded | TaskResult::FailedExecution
        )
    }

    /// The command's exit code, if it ran to completion.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn std_output(&self) -> &str {
        &self.stdout
    }

    /// What went wrong, for infrastructure failures.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Watched outputs that were not present when the command exited.
    pub fn missing_outputs(&self) -> &[String] {
        &self.missing_outputs
    }

    /// The worker that ran the last attempt.
    pub fn worker(&self) -> Option<WorkerId> {
        self.worker
    }

    /// How many times the task was dispatched.
    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn submitted_at(&self) -> OffsetDateTime {
        self.submitted_at
    }

    pub fn finished_at(&self) -> OffsetDateTime {
        self.finished_at
    }

    pub fn stats(&self) -> Option<&Statistics> {
        self.stats.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Waiting,
    Running { worker: WorkerId },
    /// The worker reported a result and outputs are being stored.
    Finishing { worker: WorkerId },
}

/// A submitted task that has not reached a terminal state.
#[derive(Debug)]
pub(crate) struct TaskRecord {
    pub id: TaskId,
    pub task: Task,
    pub resources: Resources,
    pub state: TaskState,
    pub tries: u32,
    pub submitted_at: OffsetDateTime,
    /// Input fingerprints of the current attempt, pinned on its worker.
    pub pinned: Vec<kiln_worker::Fingerprint>,
    /// Outputs retrieved during the current attempt, by binding index.
    pub retrieved: Vec<Option<Bundle>>,
    pub last_worker: Option<WorkerId>,
}

impl TaskRecord {
    pub fn new(id: TaskId, task: Task, resources: Resources) -> Self {
        let outputs = task.outputs().len();
        Self {
            id,
            task,
            resources,
            state: TaskState::Waiting,
            tries: 0,
            submitted_at: OffsetDateTime::now_utc(),
            pinned: Vec::new(),
            retrieved: (0..outputs).map(|_| None).collect(),
            last_worker: None,
        }
    }

    pub fn worker(&self) -> Option<WorkerId> {
        match self.state {
            TaskState::Waiting => None,
            TaskState::Running { worker } | TaskState::Finishing { worker } => Some(worker),
        }
    }

    /// Build the terminal record for this task.
    pub fn into_completed(self, result: TaskResult) -> CompletedTask {
        CompletedTask {
            id: self.id,
            task: self.task,
            result,
            exit_code: None,
            stdout: String::new(),
            error: None,
            missing_outputs: Vec::new(),
            worker: self.last_worker,
            tries: self.tries,
            submitted_at: self.submitted_at,
            finished_at: OffsetDateTime::now_utc(),
            stats: None,
        }
    }
}
