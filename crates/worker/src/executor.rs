//! Run dispatched commands and classify how they ended.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use error_stack::{Report, ResultExt};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{event, instrument, Level};

use crate::{
    bundle::Bundle,
    error::WorkerError,
    protocol::{DispatchSpec, Outcome, TaskId},
    sandbox::Sandbox,
    stats::Statistics,
};

/// How a launched command exited.
#[derive(Debug)]
pub struct CommandExit {
    pub exit_code: i32,
    pub stdout: String,
}

/// Starts commands. The default [ShellLauncher] runs them with `sh -c`.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(
        &self,
        workdir: &Path,
        command: &str,
    ) -> Result<Box<dyn SpawnedCommand>, Report<WorkerError>>;
}

#[async_trait]
pub trait SpawnedCommand: Send {
    /// The OS process id, if the command is still running.
    fn runtime_id(&self) -> Option<u32>;
    /// Resolve when the command exits.
    async fn wait(&mut self) -> Result<CommandExit, Report<WorkerError>>;
    /// Attempt to kill the command before it finishes.
    async fn kill(&mut self) -> Result<(), Report<WorkerError>>;
}

/// Run commands through the system shell, capturing up to `max_output` bytes of stdout.
#[derive(Debug, Clone)]
pub struct ShellLauncher {
    pub max_output: usize,
}

impl Default for ShellLauncher {
    fn default() -> Self {
        Self {
            max_output: 1024 * 1024,
        }
    }
}

#[async_trait]
impl Launcher for ShellLauncher {
    async fn launch(
        &self,
        workdir: &Path,
        command: &str,
    ) -> Result<Box<dyn SpawnedCommand>, Report<WorkerError>> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .change_context(WorkerError::Launch)
            .attach_printable_lazy(|| format!("Spawning sh in {}", workdir.display()))?;

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(capture(out, self.max_output)));

        if let Some(stderr) = child.stderr.take() {
            let pid = child.id();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    event!(Level::DEBUG, ?pid, "stderr: {line}");
                }
            });
        }

        Ok(Box::new(ShellCommand { child, stdout }))
    }
}

struct ShellCommand {
    child: tokio::process::Child,
    stdout: Option<JoinHandle<String>>,
}

#[async_trait]
impl SpawnedCommand for ShellCommand {
    fn runtime_id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<CommandExit, Report<WorkerError>> {
        let status = self
            .child
            .wait()
            .await
            .change_context(WorkerError::Launch)
            .attach_printable("Waiting for command")?;

        let stdout = match self.stdout.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        Ok(CommandExit {
            exit_code: status.code().unwrap_or(-1),
            stdout,
        })
    }

    async fn kill(&mut self) -> Result<(), Report<WorkerError>> {
        self.child
            .kill()
            .await
            .change_context(WorkerError::Launch)
    }
}

/// Read a stream to the end, keeping at most `limit` bytes.
async fn capture(stream: impl AsyncRead + Unpin, limit: usize) -> String {
    let mut kept = Vec::new();
    let mut reader = BufReader::new(stream);
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

/// Everything the worker reports back about a finished task.
#[derive(Debug)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub outcome: Outcome,
    pub stdout: String,
    /// `(binding index, contents)` for each output that was collected.
    pub outputs: Vec<(usize, Bundle)>,
    pub stats: Option<Statistics>,
}

impl TaskReport {
    fn infrastructure(task_id: TaskId, error: Report<WorkerError>) -> TaskReport {
        TaskReport {
            task_id,
            outcome: Outcome::InfrastructureFailed {
                error: format!("{error:?}"),
            },
            stdout: String::new(),
            outputs: Vec::new(),
            stats: None,
        }
    }
}

/// Run one dispatched task to completion. `inputs` pairs each cached input location with its
/// remote name. Returns `None` if the task was cancelled before it finished.
#[instrument(level = "debug", skip_all, fields(task_id = %spec.task_id))]
pub async fn run_task(
    spec: DispatchSpec,
    inputs: Vec<(PathBuf, String)>,
    tasks_root: PathBuf,
    launcher: Arc<dyn Launcher>,
    mut cancel: oneshot::Receiver<()>,
) -> Option<TaskReport> {
    let task_id = spec.task_id;

    let sandbox = {
        let root = tasks_root.clone();
        let created =
            tokio::task::spawn_blocking(move || Sandbox::create(&root, task_id, &inputs)).await;
        match created {
            Ok(Ok(sandbox)) => sandbox,
            Ok(Err(e)) => return Some(TaskReport::infrastructure(task_id, e)),
            Err(e) => {
                return Some(TaskReport::infrastructure(
                    task_id,
                    Report::new(e).change_context(WorkerError::Sandbox),
                ))
            }
        }
    };

    #[cfg(feature = "stats")]
    let tracker = crate::stats::track_system_stats(Duration::from_secs(1));

    let mut command = match launcher.launch(sandbox.path(), &spec.command).await {
        Ok(command) => command,
        Err(e) => {
            sandbox.remove().await;
            return Some(TaskReport::infrastructure(task_id, e));
        }
    };
    event!(Level::INFO, %task_id, pid = ?command.runtime_id(), "started task");

    let exit = tokio::select! {
        exit = command.wait() => exit,
        _ = &mut cancel => {
            event!(Level::INFO, %task_id, "cancelling task");
            command.kill().await.ok();
            sandbox.remove().await;
            return None;
        }
    };

    #[cfg(feature = "stats")]
    let stats = tracker.finish().await;
    #[cfg(not(feature = "stats"))]
    let stats = None;

    let exit = match exit {
        Ok(exit) => exit,
        Err(e) => {
            sandbox.remove().await;
            return Some(TaskReport::infrastructure(task_id, e));
        }
    };

    let report = collect(&spec, &sandbox, exit, stats).await;
    sandbox.remove().await;
    Some(report)
}

async fn collect(
    spec: &DispatchSpec,
    sandbox: &Sandbox,
    exit: CommandExit,
    stats: Option<Statistics>,
) -> TaskReport {
    let task_id = spec.task_id;
    let CommandExit { exit_code, stdout } = exit;
    let mut report = TaskReport {
        task_id,
        outcome: Outcome::Succeeded,
        stdout,
        outputs: Vec::new(),
        stats,
    };

    if exit_code != 0 {
        event!(Level::INFO, %task_id, exit_code, "task exited with an error");
        report.outcome = Outcome::ExecutionFailed {
            exit_code,
            missing_outputs: Vec::new(),
        };
        return report;
    }

    let watched = spec
        .outputs
        .iter()
        .filter(|o| o.watch)
        .map(|o| o.remote_path.as_str())
        .collect::<Vec<_>>();
    let missing = sandbox
        .wait_for_outputs(&watched, Duration::from_millis(spec.watch_timeout_ms))
        .await;
    if !missing.is_empty() {
        event!(Level::INFO, %task_id, ?missing, "watched outputs never appeared");
        report.outcome = Outcome::ExecutionFailed {
            exit_code,
            missing_outputs: missing,
        };
        return report;
    }

    for (binding, output) in spec.outputs.iter().enumerate() {
        match sandbox.read_output(&output.remote_path).await {
            Ok(Some(bundle)) => report.outputs.push((binding, bundle)),
            Ok(None) => {
                event!(Level::WARN, %task_id, path = %output.remote_path, "unwatched output is missing");
            }
            Err(e) => {
                report.outputs.clear();
                report.outcome = Outcome::InfrastructureFailed {
                    error: format!("{e:?}"),
                };
                return report;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{protocol::OutputSpec, resources::Resources};

    fn spec(command: &str, outputs: Vec<OutputSpec>) -> DispatchSpec {
        DispatchSpec {
            task_id: TaskId(1),
            command: command.to_string(),
            inputs: Vec::new(),
            outputs,
            resources: Resources::new(1, 0, 0),
            watch_timeout_ms: 100,
        }
    }

    async fn run(
        spec: DispatchSpec,
        inputs: Vec<(PathBuf, String)>,
    ) -> (TaskReport, tempfile::TempDir) {
        let tasks = tempfile::tempdir().expect("tasks dir");
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let report = run_task(
            spec,
            inputs,
            tasks.path().to_path_buf(),
            Arc::new(ShellLauncher::default()),
            cancel_rx,
        )
        .await
        .expect("task was not cancelled");
        (report, tasks)
    }

    #[tokio::test]
    async fn successful_task_returns_outputs() {
        let inputs = tempfile::tempdir().expect("input dir");
        let input = inputs.path().join("cached");
        std::fs::write(&input, b"sample reads").unwrap();

        let (report, tasks) = run(
            spec(
                "cp in.txt out.txt && echo copied",
                vec![OutputSpec {
                    remote_path: "out.txt".to_string(),
                    watch: true,
                }],
            ),
            vec![(input, "in.txt".to_string())],
        )
        .await;

        assert_eq!(report.outcome, Outcome::Succeeded);
        assert_eq!(report.stdout, "copied\n");
        assert_eq!(report.outputs.len(), 1);
        assert_eq!(report.outputs[0].1.body, b"sample reads");
        assert_eq!(
            std::fs::read_dir(tasks.path()).unwrap().count(),
            0,
            "sandbox is removed"
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_execution_failure() {
        let (report, _tasks) = run(spec("echo partial; exit 3", Vec::new()), Vec::new()).await;
        assert_eq!(
            report.outcome,
            Outcome::ExecutionFailed {
                exit_code: 3,
                missing_outputs: Vec::new()
            }
        );
        assert_eq!(report.stdout, "partial\n");
    }

    #[tokio::test]
    async fn missing_watched_output_is_an_execution_failure() {
        let (report, _tasks) = run(
            spec(
                "true",
                vec![OutputSpec {
                    remote_path: "never.txt".to_string(),
                    watch: true,
                }],
            ),
            Vec::new(),
        )
        .await;
        assert_eq!(
            report.outcome,
            Outcome::ExecutionFailed {
                exit_code: 0,
                missing_outputs: vec!["never.txt".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn missing_unwatched_output_is_skipped() {
        let (report, _tasks) = run(
            spec(
                "true",
                vec![OutputSpec {
                    remote_path: "optional.log".to_string(),
                    watch: false,
                }],
            ),
            Vec::new(),
        )
        .await;
        assert_eq!(report.outcome, Outcome::Succeeded);
        assert!(report.outputs.is_empty());
    }

    #[tokio::test]
    async fn output_is_truncated_at_limit() {
        let tasks = tempfile::tempdir().expect("tasks dir");
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let report = run_task(
            spec("printf 0123456789", Vec::new()),
            Vec::new(),
            tasks.path().to_path_buf(),
            Arc::new(ShellLauncher { max_output: 4 }),
            cancel_rx,
        )
        .await
        .unwrap();
        assert_eq!(report.stdout, "0123");
    }

    #[tokio::test]
    async fn cancel_kills_the_command() {
        let tasks = tempfile::tempdir().expect("tasks dir");
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(run_task(
            spec("sleep 30", Vec::new()),
            Vec::new(),
            tasks.path().to_path_buf(),
            Arc::new(ShellLauncher::default()),
            cancel_rx,
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("cancel finishes quickly")
            .expect("task does not panic");
        assert!(result.is_none());
    }
}
