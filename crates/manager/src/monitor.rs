//! Follow dispatched tasks to a terminal state.

use error_stack::Report;
use kiln_worker::{
    protocol::{ManagerMessage, Outcome},
    Bundle, Fingerprint, Statistics, TaskId, WorkerId,
};
use tracing::{event, Level};

use crate::{
    artifact::{OutputWrite, StoredOutput},
    error::{DeclarationError, TransferError},
    registry::Outgoing,
    state::ManagerState,
    task::{CompletedTask, TaskResult, TaskState},
};

/// A task whose worker has reported a result. Its outputs are written outside the manager
/// lock before [complete] finishes it.
#[derive(Debug)]
pub(crate) struct FinishedRun {
    pub task_id: TaskId,
    pub worker: WorkerId,
    pub outcome: Outcome,
    pub stdout: String,
    pub stats: Option<Statistics>,
    pub writes: Vec<OutputWrite>,
}

/// Hold on to an output retrieved from a worker until its task's result arrives.
pub(crate) fn handle_output(
    state: &mut ManagerState,
    worker: WorkerId,
    task_id: TaskId,
    binding: usize,
    bundle: Bundle,
) {
    let Some(record) = state.tasks.get_mut(&task_id) else {
        return;
    };
    if record.state != (TaskState::Running { worker }) {
        event!(Level::DEBUG, %task_id, %worker, "ignoring output for a task not running there");
        return;
    }

    match record.retrieved.get_mut(binding) {
        Some(slot) => *slot = Some(bundle),
        None => event!(Level::WARN, %task_id, binding, "output for unknown binding"),
    }
}

/// Record a worker's result for a task and release its resources. Returns `None` for results
/// that arrive after the task was cancelled or moved elsewhere.
pub(crate) fn take_result(
    state: &mut ManagerState,
    worker: WorkerId,
    task_id: TaskId,
    outcome: Outcome,
    stdout: String,
    stats: Option<Statistics>,
) -> Option<FinishedRun> {
    let record = state.tasks.get_mut(&task_id)?;
    if record.state != (TaskState::Running { worker }) {
        event!(Level::DEBUG, %task_id, %worker, "ignoring late result");
        return None;
    }

    state
        .workers
        .release(worker, task_id, record.resources, &record.pinned);
    record.state = TaskState::Finishing { worker };

    let mut writes = Vec::new();
    if outcome == Outcome::Succeeded {
        for (binding, retrieved) in record.task.outputs().iter().zip(record.retrieved.iter_mut()) {
            let Some(bundle) = retrieved.take() else {
                continue;
            };
            let Some(target) = state.artifacts.output_target(binding.artifact) else {
                continue;
            };
            writes.push(OutputWrite {
                handle: binding.artifact,
                target,
                bundle,
            });
        }
    }

    Some(FinishedRun {
        task_id,
        worker,
        outcome,
        stdout,
        stats,
        writes,
    })
}

/// Deliver a task once its outputs have been stored.
pub(crate) fn complete(
    state: &mut ManagerState,
    run: FinishedRun,
    stored: Result<Vec<StoredOutput>, Report<TransferError>>,
) {
    let Some(record) = state.tasks.remove(&run.task_id) else {
        event!(Level::DEBUG, task_id = %run.task_id, "task was cancelled while storing outputs");
        return;
    };

    let mut completed = record.into_completed(TaskResult::Succeeded);
    completed.stdout = run.stdout;
    completed.stats = run.stats;

    match run.outcome {
        Outcome::Succeeded => {
            completed.exit_code = Some(0);
            match stored {
                Ok(stored) => state.artifacts.apply_stored(stored),
                Err(e) => {
                    event!(Level::WARN, task_id = %run.task_id, error = ?e, "failed to store outputs");
                    completed.result = TaskResult::FailedInfrastructure;
                    completed.error = Some(format!("{e:?}"));
                }
            }
        }
        Outcome::ExecutionFailed {
            exit_code,
            missing_outputs,
        } => {
            completed.result = TaskResult::FailedExecution;
            completed.exit_code = Some(exit_code);
            completed.missing_outputs = missing_outputs;
        }
        Outcome::InfrastructureFailed { error } => {
            completed.result = TaskResult::FailedInfrastructure;
            completed.error = Some(error);
        }
    }

    state.deliver(completed);
}

/// Forget a worker and requeue whatever it was running. Tasks that have already been tried
/// too many times fail instead.
pub(crate) fn worker_lost(state: &mut ManagerState, worker_id: WorkerId, reason: &str) {
    let Some(worker) = state.workers.deregister(worker_id) else {
        return;
    };
    event!(
        Level::WARN,
        %worker_id,
        worker = %worker.name,
        reason,
        running = worker.running.len(),
        "worker removed"
    );

    let max_retries = state.config.max_retries;
    for task_id in worker.running {
        let Some(record) = state.tasks.get_mut(&task_id) else {
            continue;
        };
        if record.state != (TaskState::Running { worker: worker_id }) {
            continue;
        }

        record.pinned.clear();
        record.retrieved.iter_mut().for_each(|o| *o = None);

        if record.tries > max_retries {
            let tries = record.tries;
            if let Some(record) = state.tasks.remove(&task_id) {
                let mut completed = record.into_completed(TaskResult::FailedInfrastructure);
                completed.error = Some(format!(
                    "Lost worker {worker_id} ({reason}) on try {tries}, out of retries"
                ));
                state.deliver(completed);
            }
        } else {
            event!(Level::INFO, %task_id, tries = record.tries, "requeueing task from lost worker");
            record.state = TaskState::Waiting;
            state.waiting.insert(task_id);
        }
    }
}

/// An artifact could not be sent to or stored by a worker. Every task on that worker that
/// needed it fails, and the artifact is loaded again the next time a task needs it.
pub(crate) fn transfer_failed(
    state: &mut ManagerState,
    worker_id: WorkerId,
    fingerprint: &Fingerprint,
    error: Report<TransferError>,
) {
    let error = error.attach_printable(format!("Transfer of {fingerprint} to worker {worker_id}"));
    let message = format!("{error:?}");
    event!(Level::WARN, %worker_id, %fingerprint, error = ?error, "artifact transfer failed");
    state.artifacts.mark_unavailable(fingerprint, &message);

    let affected = match state.workers.get_mut(worker_id) {
        Some(worker) => {
            worker.cache.remove(fingerprint);
            worker
                .running
                .iter()
                .copied()
                .filter(|id| {
                    state
                        .tasks
                        .get(id)
                        .is_some_and(|r| r.pinned.contains(fingerprint))
                })
                .collect::<Vec<_>>()
        }
        None => Vec::new(),
    };

    for task_id in affected {
        let Some(record) = state.tasks.remove(&task_id) else {
            continue;
        };
        state
            .workers
            .release(worker_id, task_id, record.resources, &record.pinned);
        if let Some(worker) = state.workers.get(worker_id) {
            worker.send(Outgoing::Message(ManagerMessage::Cancel { task_id }));
        }

        let mut completed = record.into_completed(TaskResult::FailedInfrastructure);
        completed.error = Some(message.clone());
        state.deliver(completed);
    }
}

/// Withdraw a task. Waiting tasks are simply dropped; running ones are killed on their worker.
pub(crate) fn cancel(
    state: &mut ManagerState,
    task_id: TaskId,
) -> Result<CompletedTask, Report<DeclarationError>> {
    let record = state
        .tasks
        .remove(&task_id)
        .ok_or_else(|| Report::new(DeclarationError::UnknownTask))?;

    match record.state {
        TaskState::Waiting => {
            state.waiting.remove(&task_id);
        }
        TaskState::Running { worker } => {
            state
                .workers
                .release(worker, task_id, record.resources, &record.pinned);
            if let Some(w) = state.workers.get(worker) {
                w.send(Outgoing::Message(ManagerMessage::Cancel { task_id }));
            }
        }
        TaskState::Finishing { .. } => {}
    }

    event!(Level::INFO, %task_id, "task cancelled");
    state.finished += 1;
    Ok(record.into_completed(TaskResult::Cancelled))
}

#[cfg(test)]
mod tests {
    use kiln_worker::Resources;

    use super::*;
    use crate::{artifact::store_outputs, scheduler::dispatch, task::Task, ManagerConfig};

    struct Harness {
        state: ManagerState,
        completed: flume::Receiver<CompletedTask>,
    }

    impl Harness {
        fn new(config: ManagerConfig) -> Self {
            let (tx, rx) = flume::unbounded();
            Harness {
                state: ManagerState::new(config, tx),
                completed: rx,
            }
        }

        fn worker(&mut self) -> (WorkerId, flume::Receiver<Outgoing>) {
            let (tx, rx) = flume::unbounded();
            let id = self.state.workers.register(
                "w".to_string(),
                Resources::new(1, 1024, 1024),
                None,
                &[],
                tx,
            );
            (id, rx)
        }

        fn finish(&mut self, worker: WorkerId, task_id: TaskId, outcome: Outcome) {
            let mut run = take_result(&mut self.state, worker, task_id, outcome, String::new(), None)
                .expect("result accepted");
            let writes = run.writes.drain(..).collect::<Vec<_>>();
            let stored = store_outputs(writes);
            complete(&mut self.state, run, stored);
        }
    }

    #[test]
    fn lost_worker_requeues_then_gives_up() {
        let mut h = Harness::new(ManagerConfig::default().with_max_retries(1));
        let id = h.state.submit(Task::new("sleep 10")).unwrap();

        let (first, _rx1) = h.worker();
        dispatch(&mut h.state);
        worker_lost(&mut h.state, first, "connection closed");
        assert!(h.state.waiting.contains(&id), "requeued after the first loss");
        assert!(h.completed.try_recv().is_err(), "not surfaced as terminal");

        let (second, _rx2) = h.worker();
        dispatch(&mut h.state);
        assert_eq!(h.state.tasks[&id].tries, 2);
        worker_lost(&mut h.state, second, "heartbeat timeout");

        let done = h.completed.try_recv().expect("out of retries");
        assert_eq!(done.result(), TaskResult::FailedInfrastructure);
        assert_eq!(done.tries(), 2);
    }

    #[test]
    fn execution_failure_is_not_retried() {
        let mut h = Harness::new(ManagerConfig::default());
        let (worker, _rx) = h.worker();
        let id = h.state.submit(Task::new("exit 3")).unwrap();
        dispatch(&mut h.state);

        h.finish(
            worker,
            id,
            Outcome::ExecutionFailed {
                exit_code: 3,
                missing_outputs: Vec::new(),
            },
        );

        let done = h.completed.try_recv().expect("delivered");
        assert_eq!(done.result(), TaskResult::FailedExecution);
        assert_eq!(done.exit_code(), Some(3));
        assert!(h.state.tasks.is_empty());
        assert_eq!(
            h.state.workers.get(worker).unwrap().committed,
            Resources::default()
        );
    }

    #[test]
    fn outputs_are_stored_on_success() {
        let mut h = Harness::new(ManagerConfig::default());
        let (worker, _rx) = h.worker();
        let summary = h.state.artifacts.declare_buffer(Vec::new());
        let mut task = Task::new("echo ok > summary.txt");
        task.add_output(&summary, "summary.txt", true);
        let id = h.state.submit(task).unwrap();
        dispatch(&mut h.state);

        handle_output(&mut h.state, worker, id, 0, Bundle::from_bytes(b"ok\n".to_vec()));
        h.finish(worker, id, Outcome::Succeeded);

        assert!(h.completed.try_recv().unwrap().successful());
        let contents = h.state.artifacts.contents_source(summary).unwrap().read().unwrap();
        assert_eq!(contents, b"ok\n");
    }

    #[test]
    fn results_after_cancel_are_ignored() {
        let mut h = Harness::new(ManagerConfig::default());
        let (worker, rx) = h.worker();
        let id = h.state.submit(Task::new("sleep 10")).unwrap();
        dispatch(&mut h.state);

        let cancelled = cancel(&mut h.state, id).expect("cancelling");
        assert_eq!(cancelled.result(), TaskResult::Cancelled);
        assert!(rx
            .try_iter()
            .any(|m| matches!(m, Outgoing::Message(ManagerMessage::Cancel { .. }))));

        assert!(take_result(&mut h.state, worker, id, Outcome::Succeeded, String::new(), None).is_none());
        assert!(h.completed.try_recv().is_err(), "cancel is not surfaced through wait");

        let err = cancel(&mut h.state, id).expect_err("already gone");
        assert_eq!(err.current_context(), &DeclarationError::UnknownTask);
    }

    #[test]
    fn failed_transfer_fails_dependent_tasks() {
        let mut h = Harness::new(ManagerConfig::default());
        let (worker, _rx) = h.worker();
        let db = h.state.artifacts.declare_buffer(b"kraken db".to_vec());
        let fingerprint = h.state.artifacts.fingerprint(db).unwrap().clone();
        let mut task = Task::new("kraken2 --db db");
        task.add_input(&db, "db");
        h.state.submit(task).unwrap();
        dispatch(&mut h.state);

        let reported = Report::new(TransferError::Worker).attach_printable("disk full");
        transfer_failed(&mut h.state, worker, &fingerprint, reported);

        let done = h.completed.try_recv().expect("delivered");
        assert_eq!(done.result(), TaskResult::FailedInfrastructure);
        let error = done.error().unwrap();
        assert!(error.contains("disk full"));
        assert!(error.contains(&TransferError::Worker.to_string()));
        let record = h.state.workers.get(worker).unwrap();
        assert!(!record.cache.contains(&fingerprint));
        assert!(record.running.is_empty());
        assert!(h.state.artifacts.unavailable(db).is_some());
    }
}
