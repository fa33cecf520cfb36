//! Run kiln workers inside the current process. This is mostly useful for testing and
//! development, where a real pool of execution hosts isn't available.

use std::{path::PathBuf, sync::Arc};

use error_stack::{Report, ResultExt};
use kiln_worker::{cache::CacheCounters, Resources, Worker, WorkerConfig, WorkerError};
use tokio::task::JoinHandle;
use tracing::{event, Level};

struct LocalWorker {
    workdir: PathBuf,
    counters: Arc<CacheCounters>,
    handle: JoinHandle<Result<(), Report<WorkerError>>>,
}

/// A set of workers that each run in their own temporary directory and connect to the same
/// manager. Every worker is stopped when the pool is dropped.
pub struct LocalWorkers {
    manager: String,
    root: tempfile::TempDir,
    workers: Vec<LocalWorker>,
}

impl LocalWorkers {
    /// Create an empty pool whose workers will connect to `manager`, given as `host:port`.
    pub fn new(manager: impl Into<String>) -> Result<Self, Report<WorkerError>> {
        let root = tempfile::Builder::new()
            .prefix("kiln-local-")
            .tempdir()
            .change_context(WorkerError::Initializing)?;

        Ok(Self {
            manager: manager.into(),
            root,
            workers: Vec::new(),
        })
    }

    /// Start a worker advertising `resources` and return its index in the pool.
    pub fn spawn(&mut self, resources: Resources) -> Result<usize, Report<WorkerError>> {
        self.spawn_with(|config| config.resources = Some(resources))
    }

    /// Start a worker after adjusting its configuration.
    pub fn spawn_with(
        &mut self,
        configure: impl FnOnce(&mut WorkerConfig),
    ) -> Result<usize, Report<WorkerError>> {
        let index = self.workers.len();
        let workdir = self.root.path().join(format!("w{index}"));

        let mut config = WorkerConfig::new(self.manager.clone(), &workdir);
        config.name = Some(format!("local-{index}"));
        configure(&mut config);

        let worker = Worker::new(config)?;
        let counters = worker.counters();
        event!(Level::DEBUG, index, name = %worker.name(), resources = %worker.resources(), "starting local worker");

        self.workers.push(LocalWorker {
            workdir,
            counters,
            handle: tokio::spawn(worker.run()),
        });
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Cache counters of the worker at `index`.
    pub fn counters(&self, index: usize) -> Option<Arc<CacheCounters>> {
        self.workers.get(index).map(|w| w.counters.clone())
    }

    pub fn workdir(&self, index: usize) -> Option<&std::path::Path> {
        self.workers.get(index).map(|w| w.workdir.as_path())
    }

    /// Stop a worker abruptly, as if its host went away. Its running commands are killed and
    /// its connection is dropped without saying goodbye.
    pub fn kill(&self, index: usize) {
        if let Some(worker) = self.workers.get(index) {
            event!(Level::DEBUG, index, "killing local worker");
            worker.handle.abort();
        }
    }

    /// Whether the worker at `index` has stopped, either on its own or from [LocalWorkers::kill].
    pub fn is_finished(&self, index: usize) -> bool {
        self.workers
            .get(index)
            .map(|w| w.handle.is_finished())
            .unwrap_or(true)
    }

    /// Wait for every worker to exit, which they do once the manager shuts down. Workers that
    /// were killed are skipped.
    pub async fn join(mut self) -> Result<(), Report<WorkerError>> {
        for worker in self.workers.drain(..) {
            match worker.handle.await {
                Ok(result) => result?,
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    return Err(Report::new(e).change_context(WorkerError::Initializing))
                        .attach_printable("Local worker panicked")
                }
            }
        }
        Ok(())
    }
}

impl Drop for LocalWorkers {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.handle.abort();
        }
    }
}
