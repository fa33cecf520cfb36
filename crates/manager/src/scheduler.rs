//! Match waiting tasks to workers and send them off.

use std::cmp::Reverse;

use kiln_worker::{
    protocol::{DispatchSpec, InputSpec, ManagerMessage, OutputSpec},
    Fingerprint, Resources, TaskId, WorkerId,
};
use tracing::{event, instrument, Level};

use crate::{
    artifact::{Resolution, Resolved},
    registry::{Outgoing, WorkerRecord},
    state::ManagerState,
    task::TaskState,
};

/// Pick the worker for a task: among the workers with room for `request`, prefer the one
/// already holding the most of `inputs`, then the one running the fewest tasks, then the
/// oldest.
pub(crate) fn select_worker<'a>(
    workers: impl IntoIterator<Item = &'a WorkerRecord>,
    request: &Resources,
    inputs: &[Fingerprint],
) -> Option<WorkerId> {
    workers
        .into_iter()
        .filter(|w| request.fits_within(&w.available()))
        .max_by_key(|w| {
            (
                w.cache.count_present(inputs),
                Reverse(w.running.len()),
                Reverse(w.id),
            )
        })
        .map(|w| w.id)
}

/// Dispatch as many waiting tasks as the connected workers can take. Tasks that don't fit
/// anywhere, or whose inputs are still being hashed, stay waiting.
#[instrument(level = "trace", skip_all)]
pub(crate) fn dispatch(state: &mut ManagerState) {
    if state.waiting.is_empty() || state.workers.is_empty() {
        return;
    }

    let queue = state.waiting.iter().copied().collect::<Vec<_>>();
    for task_id in queue {
        let Some(record) = state.tasks.get(&task_id) else {
            state.waiting.remove(&task_id);
            continue;
        };

        let request = record.resources;
        if !state.workers.any_fits(&request) {
            continue;
        }

        let handles = record
            .task
            .inputs()
            .iter()
            .map(|input| input.artifact)
            .collect::<Vec<_>>();

        // Every input is resolved even after one turns out pending, so their hashes run
        // side by side.
        let mut resolved = Vec::with_capacity(handles.len());
        let mut pending = false;
        let mut failure = None;
        for handle in handles {
            match state.artifacts.resolve(handle) {
                Ok(Resolution::Ready(r)) => resolved.push(r),
                Ok(Resolution::Pending) => pending = true,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            event!(Level::WARN, %task_id, error = ?e, "task input is unavailable");
            state.fail(task_id, format!("{e:?}"));
            continue;
        }
        if pending {
            continue;
        }

        let fingerprints = resolved
            .iter()
            .map(|r| r.fingerprint.clone())
            .collect::<Vec<_>>();
        let Some(worker_id) = select_worker(state.workers.iter(), &request, &fingerprints) else {
            continue;
        };

        state.waiting.remove(&task_id);
        assign(state, task_id, worker_id, resolved);
    }
}

/// Reserve the worker's resources, queue any inputs it doesn't have, and send the task.
fn assign(state: &mut ManagerState, task_id: TaskId, worker_id: WorkerId, resolved: Vec<Resolved>) {
    let policy = state.config.eviction_policy;
    let watch_timeout_ms = state.config.watch_timeout.as_millis() as u64;

    let Some(record) = state.tasks.get_mut(&task_id) else {
        return;
    };
    let fingerprints = resolved
        .iter()
        .map(|r| r.fingerprint.clone())
        .collect::<Vec<_>>();
    state
        .workers
        .reserve(worker_id, task_id, record.resources, &fingerprints);
    let Some(worker) = state.workers.get_mut(worker_id) else {
        return;
    };

    for r in &resolved {
        if worker.cache.contains(&r.fingerprint) {
            worker.cache.touch(&r.fingerprint);
            continue;
        }

        worker.make_room(r.size, policy);
        worker.cache.insert(r.fingerprint.clone(), r.size);
        worker.send(Outgoing::Put {
            fingerprint: r.fingerprint.clone(),
            unpack: r.unpack,
            payload: r.payload.clone(),
        });
        state.artifacts.note_transfer();
        event!(Level::DEBUG, %worker_id, fingerprint = %r.fingerprint, size = r.size, "queued transfer");
    }

    let spec = DispatchSpec {
        task_id,
        command: record.task.command().to_string(),
        inputs: record
            .task
            .inputs()
            .iter()
            .zip(&resolved)
            .map(|(binding, r)| InputSpec {
                fingerprint: r.fingerprint.clone(),
                remote_name: binding.remote_name.clone(),
            })
            .collect(),
        outputs: record
            .task
            .outputs()
            .iter()
            .map(|binding| OutputSpec {
                remote_path: binding.remote_path.clone(),
                watch: binding.watch,
            })
            .collect(),
        resources: record.resources,
        watch_timeout_ms,
    };
    worker.send(Outgoing::Message(ManagerMessage::Dispatch(spec)));

    record.state = TaskState::Running { worker: worker_id };
    record.tries += 1;
    record.pinned = fingerprints;
    record.last_worker = Some(worker_id);
    record.retrieved.iter_mut().for_each(|o| *o = None);

    event!(
        Level::INFO,
        %task_id,
        %worker_id,
        worker = %worker.name,
        tries = record.tries,
        "dispatched task"
    );
}

#[cfg(test)]
mod tests {
    use kiln_worker::CachedArtifact;

    use super::*;
    use crate::{state::ManagerState, task::Task, test_util::setup_test_tracing, ManagerConfig};

    struct Harness {
        state: ManagerState,
        completed: flume::Receiver<crate::CompletedTask>,
    }

    impl Harness {
        fn new() -> Self {
            setup_test_tracing();
            let (tx, rx) = flume::unbounded();
            Harness {
                state: ManagerState::new(ManagerConfig::default(), tx),
                completed: rx,
            }
        }

        /// Run the hash jobs dispatch queued, as the manager's background hasher would.
        fn finish_hashing(&mut self) {
            let jobs = self.state.artifacts.hash_jobs();
            while let Ok(job) = jobs.try_recv() {
                let handle = job.handle;
                if let Err(e) = self.state.artifacts.finish_hash(job.run()) {
                    self.state.fail_waiting_on(handle, &format!("{e:?}"));
                }
            }
            dispatch(&mut self.state);
        }

        fn worker(
            &mut self,
            cores: u32,
            cached: &[CachedArtifact],
        ) -> (WorkerId, flume::Receiver<Outgoing>) {
            let (tx, rx) = flume::unbounded();
            let id = self.state.workers.register(
                format!("w{cores}"),
                Resources::new(cores, 1024, 1024),
                None,
                cached,
                tx,
            );
            (id, rx)
        }
    }

    fn drain(rx: &flume::Receiver<Outgoing>) -> Vec<Outgoing> {
        rx.try_iter().collect()
    }

    #[test]
    fn oversized_task_stays_waiting() {
        let mut h = Harness::new();
        let (_w, rx) = h.worker(2, &[]);

        let mut task = Task::new("true");
        task.set_cores(8);
        let id = h.state.submit(task).unwrap();
        dispatch(&mut h.state);

        assert!(h.state.waiting.contains(&id));
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn shared_input_is_sent_once() {
        let mut h = Harness::new();
        let (worker, rx) = h.worker(4, &[]);
        let reads = h.state.artifacts.declare_buffer(b"@r1\nACGT\n".to_vec());

        for name in ["a.fastq", "b.fastq"] {
            let mut task = Task::new(format!("cat {name}"));
            task.add_input(&reads, name);
            h.state.submit(task).unwrap();
        }
        dispatch(&mut h.state);

        let sent = drain(&rx);
        assert_eq!(sent.len(), 3, "one put and two dispatches");
        assert!(matches!(sent[0], Outgoing::Put { .. }), "put precedes dispatch");
        assert!(sent[1..]
            .iter()
            .all(|m| matches!(m, Outgoing::Message(ManagerMessage::Dispatch(_)))));
        assert_eq!(h.state.artifacts.transfers(), 1);
        assert_eq!(h.state.workers.get(worker).unwrap().committed.cores, 2);
        assert_eq!(h.state.running(), 2);
    }

    #[test]
    fn prefers_worker_with_cached_inputs() {
        let mut h = Harness::new();
        let reference = h.state.artifacts.declare_buffer(b"GRCh38".to_vec());
        let fingerprint = h.state.artifacts.fingerprint(reference).unwrap().clone();

        let (_cold, cold_rx) = h.worker(4, &[]);
        let (warm, warm_rx) = h.worker(
            4,
            &[CachedArtifact {
                fingerprint,
                size: 6,
            }],
        );

        let mut task = Task::new("bowtie2 -x ref");
        task.add_input(&reference, "ref");
        let id = h.state.submit(task).unwrap();
        dispatch(&mut h.state);

        assert_eq!(
            h.state.tasks[&id].state,
            TaskState::Running { worker: warm }
        );
        assert!(drain(&cold_rx).is_empty());
        let sent = drain(&warm_rx);
        assert_eq!(sent.len(), 1, "no transfer for a cached input");
        assert_eq!(h.state.artifacts.transfers(), 0);
    }

    #[test]
    fn ties_go_to_least_loaded_then_oldest() {
        let mut h = Harness::new();
        let (first, _rx1) = h.worker(2, &[]);
        let (second, _rx2) = h.worker(2, &[]);

        let a = h.state.submit(Task::new("true")).unwrap();
        dispatch(&mut h.state);
        assert_eq!(h.state.tasks[&a].state, TaskState::Running { worker: first });

        let b = h.state.submit(Task::new("true")).unwrap();
        dispatch(&mut h.state);
        assert_eq!(h.state.tasks[&b].state, TaskState::Running { worker: second });
    }

    #[test]
    fn missing_input_fails_the_task() {
        let mut h = Harness::new();
        let (_w, rx) = h.worker(1, &[]);
        let dir = tempfile::tempdir().unwrap();
        let missing = h
            .state
            .artifacts
            .declare_path(dir.path().join("absent.fastq"), false)
            .unwrap();

        let mut task = Task::new("cat in");
        task.add_input(&missing, "in");
        let id = h.state.submit(task).unwrap();
        dispatch(&mut h.state);

        assert!(!h.state.tasks.contains_key(&id));
        assert!(drain(&rx).is_empty());
        let done = h.completed.try_recv().expect("failure delivered");
        assert_eq!(done.result(), crate::TaskResult::FailedInfrastructure);
        assert!(h.state.artifacts.unavailable(missing).is_some());
    }

    #[test]
    fn tasks_wait_while_inputs_are_hashed() {
        let mut h = Harness::new();
        let (worker, rx) = h.worker(2, &[]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genome.fa");
        std::fs::write(&path, b">chr1\nACGT\n").unwrap();
        let genome = h.state.artifacts.declare_path(&path, false).unwrap();

        let mut align = Task::new("bwa mem genome.fa");
        align.add_input(&genome, "genome.fa");
        let align = h.state.submit(align).unwrap();
        let echo = h.state.submit(Task::new("echo ready")).unwrap();
        dispatch(&mut h.state);

        assert!(h.state.waiting.contains(&align), "input is still being hashed");
        assert_eq!(h.state.tasks[&echo].state, TaskState::Running { worker });
        assert_eq!(drain(&rx).len(), 1, "only the task without inputs went out");

        h.finish_hashing();
        assert_eq!(h.state.tasks[&align].state, TaskState::Running { worker });
        let sent = drain(&rx);
        assert!(matches!(sent[0], Outgoing::Put { payload: crate::artifact::Payload::Path(_), .. }));
        assert!(matches!(sent[1], Outgoing::Message(ManagerMessage::Dispatch(_))));
    }

    #[test]
    fn failed_hash_fails_waiting_tasks() {
        let mut h = Harness::new();
        let (_w, rx) = h.worker(2, &[]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reads.fastq");
        std::fs::write(&path, b"@r1\nACGT\n").unwrap();
        let reads = h.state.artifacts.declare_path(&path, false).unwrap();

        let mut ids = Vec::new();
        for name in ["a.fastq", "b.fastq"] {
            let mut task = Task::new(format!("cat {name}"));
            task.add_input(&reads, name);
            ids.push(h.state.submit(task).unwrap());
        }
        dispatch(&mut h.state);
        std::fs::remove_file(&path).unwrap();
        h.finish_hashing();

        let failed = h.completed.try_iter().collect::<Vec<_>>();
        assert_eq!(failed.iter().map(|t| t.id()).collect::<Vec<_>>(), ids);
        assert!(failed
            .iter()
            .all(|t| t.result() == crate::TaskResult::FailedInfrastructure));
        assert!(h.state.tasks.is_empty());
        assert!(drain(&rx).is_empty());
    }
}
