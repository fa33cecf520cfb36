//! The worker process: connect to a manager, keep the artifact cache, and run dispatched tasks.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use error_stack::{Report, ResultExt};
use tokio::{
    net::{tcp::OwnedWriteHalf, TcpStream},
    sync::{mpsc, oneshot},
    task::JoinSet,
    time::MissedTickBehavior,
};
use tracing::{event, instrument, Level};

use crate::{
    bundle::Bundle,
    cache::{Cache, CacheCounters, Staged, DEFAULT_UNPACK_COMMAND},
    error::WorkerError,
    executor::{run_task, Launcher, ShellLauncher, TaskReport},
    fingerprint::Fingerprint,
    protocol::{
        DispatchSpec, FrameReader, FrameWriter, ManagerMessage, Outcome, ProtocolError, TaskId,
        WorkerId, WorkerMessage,
    },
    resources::Resources,
};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Address of the manager, as `host:port`.
    pub manager: String,
    /// Directory holding the cache and the task sandboxes.
    pub workdir: PathBuf,
    /// Name reported to the manager. Defaults to one derived from the process id.
    pub name: Option<String>,
    /// Resources to advertise. Detected from the host when not set.
    pub resources: Option<Resources>,
    /// Maximum number of bytes the manager should keep in this worker's cache.
    pub cache_capacity: Option<u64>,
    pub heartbeat_interval: Duration,
    /// Standard output beyond this many bytes is discarded.
    pub max_output: usize,
    /// How many times to retry connecting to the manager before giving up.
    pub connect_retries: usize,
    /// Shell command that extracts an archive, given as `$1`, into the current directory.
    pub unpack_command: String,
}

impl WorkerConfig {
    pub fn new(manager: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            manager: manager.into(),
            workdir: workdir.into(),
            name: None,
            resources: None,
            cache_capacity: None,
            heartbeat_interval: Duration::from_secs(5),
            max_output: 1024 * 1024,
            connect_retries: 5,
            unpack_command: DEFAULT_UNPACK_COMMAND.to_string(),
        }
    }
}

struct RunningTask {
    /// Dropping this cancels the task.
    _cancel: oneshot::Sender<()>,
    pins: Vec<Fingerprint>,
}

type OutgoingFrame = (WorkerMessage, Vec<u8>);
type StoreResult = (Fingerprint, Result<Staged, Report<WorkerError>>);

/// State that lives as long as a single connection to the manager.
struct Session {
    worker_id: WorkerId,
    outbox: mpsc::UnboundedSender<OutgoingFrame>,
    running: HashMap<TaskId, RunningTask>,
    tasks: JoinSet<Option<TaskReport>>,
    /// Artifacts still being written into the cache, and whether the manager asked for them
    /// to be evicted in the meantime.
    storing: HashMap<Fingerprint, bool>,
    stores: JoinSet<StoreResult>,
    /// Dispatched tasks whose inputs are still in `storing`, in arrival order.
    parked: Vec<DispatchSpec>,
}

impl Session {
    /// Queue a frame for the connection writer.
    fn send(&self, message: WorkerMessage, body: Vec<u8>) -> Result<(), Report<WorkerError>> {
        self.outbox.send((message, body)).map_err(|_| {
            Report::new(WorkerError::ConnectionLost).attach_printable("Connection writer stopped")
        })
    }

    fn is_pinned(&self, fingerprint: &Fingerprint) -> bool {
        self.running
            .values()
            .any(|task| task.pins.contains(fingerprint))
            || self
                .parked
                .iter()
                .any(|spec| spec.inputs.iter().any(|i| &i.fingerprint == fingerprint))
    }

    fn waits_on_store(&self, spec: &DispatchSpec) -> bool {
        spec.inputs
            .iter()
            .any(|input| self.storing.contains_key(&input.fingerprint))
    }
}

enum Flow {
    Continue,
    Stop,
}

pub struct Worker {
    name: String,
    manager: String,
    resources: Resources,
    cache_capacity: Option<u64>,
    heartbeat_interval: Duration,
    connect_retries: usize,
    tasks_root: PathBuf,
    cache: Cache,
    launcher: Arc<dyn Launcher>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Result<Worker, Report<WorkerError>> {
        let tasks_root = config.workdir.join("tasks");
        if tasks_root.exists() {
            std::fs::remove_dir_all(&tasks_root)
                .change_context(WorkerError::Initializing)
                .attach_printable_lazy(|| format!("Clearing {}", tasks_root.display()))?;
        }
        std::fs::create_dir_all(&tasks_root)
            .change_context(WorkerError::Initializing)
            .attach_printable_lazy(|| format!("Creating {}", tasks_root.display()))?;

        let cache = Cache::open(config.workdir.join("cache"))
            .change_context(WorkerError::Initializing)?
            .with_unpack_command(config.unpack_command);

        let resources = config
            .resources
            .unwrap_or_else(|| Resources::detect(&config.workdir));

        Ok(Worker {
            name: config
                .name
                .unwrap_or_else(|| format!("worker-{}", std::process::id())),
            manager: config.manager,
            resources,
            cache_capacity: config.cache_capacity,
            heartbeat_interval: config.heartbeat_interval,
            connect_retries: config.connect_retries,
            tasks_root,
            cache,
            launcher: Arc::new(ShellLauncher {
                max_output: config.max_output,
            }),
        })
    }

    /// Run commands with a different [Launcher].
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resources(&self) -> Resources {
        self.resources
    }

    pub fn counters(&self) -> Arc<CacheCounters> {
        self.cache.counters()
    }

    /// Serve the manager until it tells this worker to shut down. A lost connection is
    /// reestablished; running tasks are abandoned and the manager requeues them.
    pub async fn run(mut self) -> Result<(), Report<WorkerError>> {
        loop {
            let stream = self.connect().await?;
            match self.serve(stream).await {
                Ok(()) => return Ok(()),
                Err(e) if e.current_context().retryable() => {
                    event!(Level::WARN, error = ?e, "lost connection to manager, reconnecting");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn connect(&self) -> Result<TcpStream, Report<WorkerError>> {
        let addr = self.manager.as_str();
        (move || TcpStream::connect(addr))
            .retry(&ExponentialBuilder::default().with_max_times(self.connect_retries))
            .await
            .change_context(WorkerError::Connect)
            .attach_printable_lazy(|| format!("Connecting to {addr}"))
    }

    #[instrument(level = "debug", skip_all, fields(worker = %self.name))]
    async fn serve(&mut self, stream: TcpStream) -> Result<(), Report<WorkerError>> {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        writer
            .send(
                &WorkerMessage::Register {
                    name: self.name.clone(),
                    resources: self.resources,
                    cache_capacity: self.cache_capacity,
                    cached: self.cache.snapshot(),
                },
                &[],
            )
            .await
            .change_context(WorkerError::ConnectionLost)?;

        let worker_id = match reader
            .recv::<ManagerMessage>()
            .await
            .change_context(WorkerError::ConnectionLost)?
        {
            Some((ManagerMessage::Welcome {
                worker_id,
                manager_name,
            }, _)) => {
                event!(Level::INFO, %worker_id, %manager_name, resources = %self.resources, "registered with manager");
                worker_id
            }
            Some((other, _)) => {
                return Err(Report::new(WorkerError::UnexpectedMessage))
                    .attach_printable_lazy(|| format!("Expected welcome, got {other:?}"));
            }
            None => {
                return Err(Report::new(WorkerError::ConnectionLost))
                    .attach_printable("Manager closed the connection during registration");
            }
        };

        // Frame reads are not cancel-safe, so they get their own task.
        let (frames_tx, mut frames_rx) = mpsc::channel(16);
        let reader_task = tokio::spawn(async move {
            loop {
                let frame = reader.recv::<ManagerMessage>().await;
                let last = !matches!(frame, Ok(Some(_)));
                if frames_tx.send(frame).await.is_err() || last {
                    break;
                }
            }
        });

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let mut writer_task = tokio::spawn(write_frames(writer, outbox_rx));

        let mut session = Session {
            worker_id,
            outbox,
            running: HashMap::new(),
            tasks: JoinSet::new(),
            storing: HashMap::new(),
            stores: JoinSet::new(),
            parked: Vec::new(),
        };

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                frame = frames_rx.recv() => {
                    let step = match frame {
                        Some(Ok(Some((message, body)))) => {
                            self.handle_message(message, body, &mut session).await
                        }
                        Some(Ok(None)) | None => Err(Report::new(WorkerError::ConnectionLost)
                            .attach_printable("Manager closed the connection")),
                        Some(Err(e)) => Err(protocol_failure(e)),
                    };

                    match step {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                Some(joined) = session.tasks.join_next(), if !session.tasks.is_empty() => {
                    match joined {
                        Ok(Some(report)) => {
                            if let Err(e) = self.send_report(report, &mut session) {
                                break Err(e);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => event!(Level::ERROR, error = %e, "task runner failed"),
                    }
                }
                Some(stored) = session.stores.join_next(), if !session.stores.is_empty() => {
                    let step = match stored {
                        Ok((fingerprint, staged)) => {
                            self.finish_store(fingerprint, staged, &mut session).await
                        }
                        Err(e) => Err(Report::new(e)
                            .change_context(WorkerError::Cache)
                            .attach_printable("Artifact store task failed")),
                    };
                    if let Err(e) = step {
                        break Err(e);
                    }
                }
                _ = heartbeat.tick() => {
                    let mut running = session
                        .running
                        .keys()
                        .copied()
                        .chain(session.parked.iter().map(|spec| spec.task_id))
                        .collect::<Vec<_>>();
                    running.sort();
                    let message = WorkerMessage::Heartbeat {
                        cached: self.cache.snapshot(),
                        running,
                    };
                    if let Err(e) = session.send(message, Vec::new()) {
                        break Err(e);
                    }
                }
                written = &mut writer_task => {
                    break Err(match written {
                        Ok(Err(e)) => e,
                        Ok(Ok(())) => Report::new(WorkerError::ConnectionLost)
                            .attach_printable("Connection writer stopped"),
                        Err(e) => Report::new(e).change_context(WorkerError::ConnectionLost),
                    });
                }
            }
        };

        reader_task.abort();
        if !session.running.is_empty() || !session.parked.is_empty() {
            event!(
                Level::INFO,
                count = session.running.len() + session.parked.len(),
                "abandoning running tasks"
            );
        }
        session.running.clear();
        session.tasks.shutdown().await;
        session.stores.shutdown().await;

        if result.is_err() {
            writer_task.abort();
            return result;
        }

        let worker_id = session.worker_id;
        session.send(WorkerMessage::Disconnect, Vec::new()).ok();
        // Dropping the session closes the outbox, so the writer finishes once it is drained.
        drop(session);
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => event!(Level::WARN, error = ?e, "failed to say goodbye to manager"),
            Err(e) => event!(Level::WARN, error = %e, "connection writer failed"),
        }
        event!(Level::INFO, %worker_id, "worker shut down");
        Ok(())
    }

    async fn handle_message(
        &mut self,
        message: ManagerMessage,
        body: Vec<u8>,
        session: &mut Session,
    ) -> Result<Flow, Report<WorkerError>> {
        match message {
            ManagerMessage::Put {
                fingerprint,
                unpack,
                entries,
            } => {
                if let Some(evict) = session.storing.get_mut(&fingerprint) {
                    *evict = false;
                } else if self.cache.contains(&fingerprint) {
                    event!(Level::DEBUG, %fingerprint, "already cached");
                } else {
                    let stager = self.cache.stager();
                    session.storing.insert(fingerprint.clone(), false);
                    session.stores.spawn(async move {
                        let staged = stager
                            .stage(fingerprint.clone(), unpack, Bundle { entries, body })
                            .await;
                        (fingerprint, staged)
                    });
                }
            }
            ManagerMessage::Evict { fingerprint } => {
                if session.is_pinned(&fingerprint) {
                    event!(Level::DEBUG, %fingerprint, "not evicting artifact in use");
                } else if let Some(evict) = session.storing.get_mut(&fingerprint) {
                    *evict = true;
                } else {
                    self.evict(&fingerprint).await;
                }
            }
            ManagerMessage::Dispatch(spec) => {
                if session.waits_on_store(&spec) {
                    event!(Level::DEBUG, task_id = %spec.task_id, "waiting for inputs to be stored");
                    session.parked.push(spec);
                } else {
                    self.start_task(spec, session)?;
                }
            }
            ManagerMessage::Cancel { task_id } => {
                let parked = session.parked.len();
                session.parked.retain(|spec| spec.task_id != task_id);
                if session.running.remove(&task_id).is_some() || session.parked.len() != parked {
                    event!(Level::INFO, %task_id, "task cancelled by manager");
                }
            }
            ManagerMessage::Shutdown => {
                event!(Level::INFO, "manager requested shutdown");
                return Ok(Flow::Stop);
            }
            ManagerMessage::Welcome { .. } => {
                return Err(Report::new(WorkerError::UnexpectedMessage))
                    .attach_printable("Received a second welcome");
            }
        }

        Ok(Flow::Continue)
    }

    async fn evict(&mut self, fingerprint: &Fingerprint) {
        if let Err(e) = self.cache.evict(fingerprint).await {
            event!(Level::WARN, %fingerprint, error = ?e, "eviction failed");
        }
    }

    /// Record a finished store, then start any parked task that no longer waits on one.
    async fn finish_store(
        &mut self,
        fingerprint: Fingerprint,
        staged: Result<Staged, Report<WorkerError>>,
        session: &mut Session,
    ) -> Result<(), Report<WorkerError>> {
        let evict = session.storing.remove(&fingerprint).unwrap_or(false);
        match staged {
            Ok(staged) => {
                self.cache.commit(staged);
                if evict && !session.is_pinned(&fingerprint) {
                    self.evict(&fingerprint).await;
                }
            }
            Err(e) => {
                event!(Level::WARN, %fingerprint, error = ?e, "transfer failed");
                session.send(
                    WorkerMessage::TransferFailed {
                        fingerprint,
                        error: format!("{e:?}"),
                    },
                    Vec::new(),
                )?;
            }
        }

        for spec in std::mem::take(&mut session.parked) {
            if session.waits_on_store(&spec) {
                session.parked.push(spec);
            } else {
                self.start_task(spec, session)?;
            }
        }
        Ok(())
    }

    fn start_task(
        &mut self,
        spec: DispatchSpec,
        session: &mut Session,
    ) -> Result<(), Report<WorkerError>> {
        let task_id = spec.task_id;
        let mut inputs = Vec::with_capacity(spec.inputs.len());
        let mut missing = Vec::new();
        for input in &spec.inputs {
            if self.cache.contains(&input.fingerprint) {
                inputs.push((
                    self.cache.path(&input.fingerprint),
                    input.remote_name.clone(),
                ));
            } else {
                missing.push(input.fingerprint.to_string());
            }
        }

        if !missing.is_empty() {
            event!(Level::WARN, %task_id, ?missing, "dispatched task is missing inputs");
            let message = WorkerMessage::Result {
                task_id,
                outcome: Outcome::InfrastructureFailed {
                    error: format!("Inputs not in cache: {}", missing.join(", ")),
                },
                stdout: String::new(),
                stats: None,
            };
            return session.send(message, Vec::new());
        }

        event!(Level::DEBUG, %task_id, command = %spec.command, "starting task");
        let (cancel_tx, cancel_rx) = oneshot::channel();
        session.running.insert(
            task_id,
            RunningTask {
                _cancel: cancel_tx,
                pins: spec.inputs.iter().map(|i| i.fingerprint.clone()).collect(),
            },
        );
        session.tasks.spawn(run_task(
            spec,
            inputs,
            self.tasks_root.clone(),
            self.launcher.clone(),
            cancel_rx,
        ));

        Ok(())
    }

    fn send_report(
        &mut self,
        report: TaskReport,
        session: &mut Session,
    ) -> Result<(), Report<WorkerError>> {
        let task_id = report.task_id;
        if session.running.remove(&task_id).is_none() {
            event!(Level::DEBUG, %task_id, "dropping result of cancelled task");
            return Ok(());
        }

        for (binding, bundle) in report.outputs {
            session.send(
                WorkerMessage::Output {
                    task_id,
                    binding,
                    entries: bundle.entries,
                },
                bundle.body,
            )?;
        }

        event!(Level::INFO, %task_id, outcome = ?report.outcome, "task finished");
        session.send(
            WorkerMessage::Result {
                task_id,
                outcome: report.outcome,
                stdout: report.stdout,
                stats: report.stats,
            },
            Vec::new(),
        )
    }
}

/// Drain queued frames onto the connection, so the loop in [Worker::serve] never waits on the
/// socket.
async fn write_frames(
    mut writer: FrameWriter<OwnedWriteHalf>,
    mut outbox: mpsc::UnboundedReceiver<OutgoingFrame>,
) -> Result<(), Report<WorkerError>> {
    while let Some((message, body)) = outbox.recv().await {
        writer
            .send(&message, &body)
            .await
            .change_context(WorkerError::ConnectionLost)?;
    }
    writer.shutdown().await;
    Ok(())
}

fn protocol_failure(e: Report<ProtocolError>) -> Report<WorkerError> {
    match e.current_context() {
        ProtocolError::Malformed => e.change_context(WorkerError::UnexpectedMessage),
        _ => e.change_context(WorkerError::ConnectionLost),
    }
}
