//! The manager's namespace of declared artifacts.
//!
//! Declaring an artifact only records where its data lives. Files are fingerprinted the first
//! time a task needs them on a worker, and the fingerprint is reused until the file's size or
//! modification time changes. Hashing happens in a [HashJob] that runs without the manager
//! lock, and the connection writer streams the bytes from disk when a worker needs a copy.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use ahash::HashMap;
use error_stack::{Report, ResultExt};
use kiln_worker::{bundle::body_len, ArtifactKind, Bundle, Fingerprint};
use tracing::{event, instrument, Level};

use crate::error::{DeclarationError, TransferError};

/// Refers to an artifact declared with the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactHandle(u64);

impl fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl Stamp {
    fn read(path: &Path) -> io::Result<Stamp> {
        let metadata = fs::metadata(path)?;
        Ok(Stamp {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Current {
    fingerprint: Fingerprint,
    size: u64,
    stamp: Option<Stamp>,
}

#[derive(Debug)]
enum Source {
    Path(PathBuf),
    Buffer(Arc<Bundle>),
}

#[derive(Debug)]
struct ArtifactRecord {
    source: Source,
    unpack: bool,
    current: Option<Current>,
    /// The last load or transfer failure. Cleared by the next successful resolve.
    unavailable: Option<String>,
    /// A [HashJob] for this artifact is in flight.
    resolving: bool,
    /// Bumped whenever a hash is started or `current` is replaced, so that a hash of older
    /// content is discarded.
    generation: u64,
}

impl ArtifactRecord {
    fn new(source: Source, unpack: bool, current: Option<Current>) -> Self {
        ArtifactRecord {
            source,
            unpack,
            current,
            unavailable: None,
            resolving: false,
            generation: 0,
        }
    }
}

/// Where the bytes for a transfer come from. Paths are streamed from disk by the connection
/// writer.
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Loaded(Arc<Bundle>),
    Path(PathBuf),
}

/// Whether an artifact's fingerprint is known yet.
pub(crate) enum Resolution {
    Ready(Resolved),
    /// The artifact is being hashed. Tasks that need it stay waiting.
    Pending,
}

/// Fingerprints a path artifact. Run it with [tokio::task::spawn_blocking] and hand the outcome
/// to [ArtifactStore::finish_hash].
#[derive(Debug)]
pub(crate) struct HashJob {
    pub handle: ArtifactHandle,
    pub generation: u64,
    path: PathBuf,
    unpack: bool,
}

#[derive(Debug)]
pub(crate) struct HashOutcome {
    pub handle: ArtifactHandle,
    pub generation: u64,
    pub result: Result<Current, Report<TransferError>>,
}

impl HashJob {
    pub(crate) fn run(self) -> HashOutcome {
        let result = hash_path(&self.path, self.unpack);
        HashOutcome {
            handle: self.handle,
            generation: self.generation,
            result,
        }
    }
}

fn hash_path(path: &Path, unpack: bool) -> Result<Current, Report<TransferError>> {
    // Taken first, so a change made while hashing is noticed on the next resolve.
    let stamp = Stamp::read(path)
        .change_context(TransferError::Load)
        .attach_printable_lazy(|| format!("Reading {}", path.display()))?;
    let (fingerprint, entries) = Fingerprint::of_path(unpack, path)
        .change_context(TransferError::Load)
        .attach_printable_lazy(|| format!("Reading {}", path.display()))?;
    if unpack && fingerprint.kind() != Some(ArtifactKind::File) {
        return Err(Report::new(TransferError::Load))
            .attach_printable_lazy(|| format!("{} is not an archive", path.display()));
    }

    Ok(Current {
        fingerprint,
        size: body_len(&entries),
        stamp: Some(stamp),
    })
}

/// An artifact's current identity, ready to be placed on a worker.
#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    pub fingerprint: Fingerprint,
    pub unpack: bool,
    pub size: u64,
    pub payload: Payload,
}

fn path_fingerprint(unpack: bool, bundle: &Bundle) -> Fingerprint {
    let kind = if bundle.is_single_file() {
        ArtifactKind::File
    } else {
        ArtifactKind::Directory
    };
    Fingerprint::of(kind, unpack, bundle)
}

#[derive(Debug, Clone)]
pub(crate) enum OutputTarget {
    Path(PathBuf),
    Buffer,
}

/// Retrieved task output on its way into an artifact.
#[derive(Debug)]
pub(crate) struct OutputWrite {
    pub handle: ArtifactHandle,
    pub target: OutputTarget,
    pub bundle: Bundle,
}

#[derive(Debug)]
pub(crate) struct StoredOutput {
    handle: ArtifactHandle,
    current: Current,
    buffer: Option<Arc<Bundle>>,
}

/// Write retrieved outputs to their artifacts' locations. Buffers are only fingerprinted here
/// and replaced in the store by [ArtifactStore::apply_stored].
pub(crate) fn store_outputs(
    writes: Vec<OutputWrite>,
) -> Result<Vec<StoredOutput>, Report<TransferError>> {
    writes.into_iter().map(store_output).collect()
}

fn store_output(write: OutputWrite) -> Result<StoredOutput, Report<TransferError>> {
    let OutputWrite {
        handle,
        target,
        bundle,
    } = write;

    match target {
        OutputTarget::Path(path) => {
            replace_path(&path, &bundle)
                .change_context(TransferError::Store)
                .attach_printable_lazy(|| format!("Writing {handle} to {}", path.display()))?;
            let stamp = Stamp::read(&path).change_context(TransferError::Store)?;
            Ok(StoredOutput {
                handle,
                current: Current {
                    fingerprint: path_fingerprint(false, &bundle),
                    size: bundle.size(),
                    stamp: Some(stamp),
                },
                buffer: None,
            })
        }
        OutputTarget::Buffer => {
            if !bundle.is_single_file() {
                return Err(Report::new(TransferError::Store))
                    .attach_printable_lazy(|| format!("Output for buffer {handle} is a directory"));
            }
            Ok(StoredOutput {
                handle,
                current: Current {
                    fingerprint: Fingerprint::of(ArtifactKind::Buffer, false, &bundle),
                    size: bundle.size(),
                    stamp: None,
                },
                buffer: Some(Arc::new(bundle)),
            })
        }
    }
}

fn replace_path(path: &Path, bundle: &Bundle) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    bundle.write_to(path)
}

/// How [crate::Manager::contents] reads an artifact without holding the manager lock.
#[derive(Debug)]
pub(crate) enum ContentsSource {
    Path(PathBuf),
    Buffer(Arc<Bundle>),
}

impl ContentsSource {
    pub(crate) fn read(self) -> Result<Vec<u8>, Report<TransferError>> {
        match self {
            ContentsSource::Buffer(bundle) => Ok(bundle.body.clone()),
            ContentsSource::Path(path) => fs::read(&path)
                .change_context(TransferError::Load)
                .attach_printable_lazy(|| format!("Reading {}", path.display())),
        }
    }
}

#[derive(Debug)]
pub struct ArtifactStore {
    records: HashMap<ArtifactHandle, ArtifactRecord>,
    next_handle: u64,
    transfers: u64,
    jobs: flume::Sender<HashJob>,
    jobs_rx: flume::Receiver<HashJob>,
}

impl Default for ArtifactStore {
    fn default() -> Self {
        let (jobs, jobs_rx) = flume::unbounded();
        ArtifactStore {
            records: HashMap::default(),
            next_handle: 0,
            transfers: 0,
            jobs,
            jobs_rx,
        }
    }
}

impl ArtifactStore {
    fn insert(&mut self, record: ArtifactRecord) -> ArtifactHandle {
        self.next_handle += 1;
        let handle = ArtifactHandle(self.next_handle);
        self.records.insert(handle, record);
        handle
    }

    /// Declare a file or directory. The path does not need to exist yet if the artifact will
    /// receive a task's output. With `unpack`, the path must be an archive that `tar` can
    /// extract.
    pub fn declare_path(
        &mut self,
        path: impl Into<PathBuf>,
        unpack: bool,
    ) -> Result<ArtifactHandle, Report<DeclarationError>> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(Report::new(DeclarationError::InvalidSource))
                .attach_printable("Empty artifact path");
        }

        if unpack && path.is_dir() {
            return Err(Report::new(DeclarationError::InvalidSource))
                .attach_printable_lazy(|| format!("{} is a directory, not an archive", path.display()));
        }

        let handle = self.insert(ArtifactRecord::new(Source::Path(path), unpack, None));
        event!(Level::DEBUG, %handle, unpack, "declared path artifact");
        Ok(handle)
    }

    pub fn declare_buffer(&mut self, bytes: Vec<u8>) -> ArtifactHandle {
        let bundle = Bundle::from_bytes(bytes);
        let current = Current {
            fingerprint: Fingerprint::of(ArtifactKind::Buffer, false, &bundle),
            size: bundle.size(),
            stamp: None,
        };
        self.insert(ArtifactRecord::new(
            Source::Buffer(Arc::new(bundle)),
            false,
            Some(current),
        ))
    }

    pub fn contains(&self, handle: ArtifactHandle) -> bool {
        self.records.contains_key(&handle)
    }

    /// Whether the artifact is extracted on arrival. Unknown handles return `None`.
    pub fn is_unpack(&self, handle: ArtifactHandle) -> Option<bool> {
        self.records.get(&handle).map(|r| r.unpack)
    }

    /// The reason the artifact could not be loaded the last time it was needed, if any.
    pub fn unavailable(&self, handle: ArtifactHandle) -> Option<&str> {
        self.records
            .get(&handle)
            .and_then(|r| r.unavailable.as_deref())
    }

    /// The fingerprint the artifact was last seen with.
    pub fn fingerprint(&self, handle: ArtifactHandle) -> Option<&Fingerprint> {
        self.records
            .get(&handle)
            .and_then(|r| r.current.as_ref())
            .map(|c| &c.fingerprint)
    }

    pub fn transfers(&self) -> u64 {
        self.transfers
    }

    pub(crate) fn note_transfer(&mut self) {
        self.transfers += 1;
    }

    /// The queue that [ArtifactStore::resolve] places hash jobs on.
    pub(crate) fn hash_jobs(&self) -> flume::Receiver<HashJob> {
        self.jobs_rx.clone()
    }

    /// Determine the artifact's current fingerprint without reading its contents. A path whose
    /// metadata changed since it was last hashed gets a [HashJob] and stays pending until
    /// [ArtifactStore::finish_hash] records the result.
    #[instrument(level = "trace", skip_all, fields(%handle))]
    pub(crate) fn resolve(
        &mut self,
        handle: ArtifactHandle,
    ) -> Result<Resolution, Report<TransferError>> {
        let record = self
            .records
            .get_mut(&handle)
            .ok_or_else(|| Report::new(TransferError::Load))
            .attach_printable_lazy(|| format!("Unknown artifact {handle}"))?;

        let path = match &record.source {
            Source::Buffer(bundle) => {
                let current = record
                    .current
                    .as_ref()
                    .ok_or_else(|| Report::new(TransferError::Load))?;
                let resolved = Resolved {
                    fingerprint: current.fingerprint.clone(),
                    unpack: false,
                    size: current.size,
                    payload: Payload::Loaded(bundle.clone()),
                };
                record.unavailable = None;
                return Ok(Resolution::Ready(resolved));
            }
            Source::Path(path) => path.clone(),
        };

        if record.resolving {
            return Ok(Resolution::Pending);
        }

        let stamp = match Stamp::read(&path) {
            Ok(stamp) => stamp,
            Err(e) => {
                let report = Report::new(e)
                    .change_context(TransferError::Load)
                    .attach_printable(format!("Reading {}", path.display()));
                record.current = None;
                record.unavailable = Some(format!("{report}"));
                return Err(report.attach_printable(format!("Artifact {handle}")));
            }
        };

        if let Some(current) = &record.current {
            if current.stamp == Some(stamp) {
                let resolved = Resolved {
                    fingerprint: current.fingerprint.clone(),
                    unpack: record.unpack,
                    size: current.size,
                    payload: Payload::Path(path),
                };
                record.unavailable = None;
                return Ok(Resolution::Ready(resolved));
            }
        }

        record.resolving = true;
        record.generation += 1;
        event!(Level::DEBUG, %handle, path = %path.display(), "hashing artifact");
        self.jobs
            .send(HashJob {
                handle,
                generation: record.generation,
                path,
                unpack: record.unpack,
            })
            .ok();
        Ok(Resolution::Pending)
    }

    /// Record the result of a [HashJob]. Results for content that has been replaced since the
    /// job started are dropped. A failure is returned so that the tasks waiting on the
    /// artifact can be failed.
    pub(crate) fn finish_hash(&mut self, outcome: HashOutcome) -> Result<(), Report<TransferError>> {
        let HashOutcome {
            handle,
            generation,
            result,
        } = outcome;
        let Some(record) = self.records.get_mut(&handle) else {
            return Ok(());
        };
        if record.generation != generation {
            event!(Level::DEBUG, %handle, "discarding outdated hash");
            return Ok(());
        }

        record.resolving = false;
        match result {
            Ok(current) => {
                event!(Level::DEBUG, %handle, fingerprint = %current.fingerprint, size = current.size, "hashed artifact");
                record.current = Some(current);
                record.unavailable = None;
                Ok(())
            }
            Err(e) => {
                record.current = None;
                record.unavailable = Some(format!("{e}"));
                Err(e.attach_printable(format!("Artifact {handle}")))
            }
        }
    }

    /// Record that a transfer of `fingerprint` failed. Path artifacts with that fingerprint are
    /// read again the next time they are needed.
    pub(crate) fn mark_unavailable(&mut self, fingerprint: &Fingerprint, error: &str) {
        for record in self.records.values_mut() {
            if record.current.as_ref().map(|c| &c.fingerprint) != Some(fingerprint) {
                continue;
            }

            record.unavailable = Some(error.to_string());
            if matches!(record.source, Source::Path(_)) {
                record.current = None;
            }
        }
    }

    /// Where output bound to `handle` should be written. Archives declared for unpacking can
    /// not receive output.
    pub(crate) fn output_target(&self, handle: ArtifactHandle) -> Option<OutputTarget> {
        let record = self.records.get(&handle)?;
        if record.unpack {
            return None;
        }

        Some(match &record.source {
            Source::Path(path) => OutputTarget::Path(path.clone()),
            Source::Buffer(_) => OutputTarget::Buffer,
        })
    }

    pub(crate) fn apply_stored(&mut self, stored: Vec<StoredOutput>) {
        for output in stored {
            let Some(record) = self.records.get_mut(&output.handle) else {
                continue;
            };

            if let Some(buffer) = output.buffer {
                record.source = Source::Buffer(buffer);
            }
            event!(Level::DEBUG, handle = %output.handle, fingerprint = %output.current.fingerprint, "stored task output");
            record.current = Some(output.current);
            record.unavailable = None;
            record.resolving = false;
            record.generation += 1;
        }
    }

    pub(crate) fn contents_source(&self, handle: ArtifactHandle) -> Option<ContentsSource> {
        self.records.get(&handle).map(|record| match &record.source {
            Source::Path(path) => ContentsSource::Path(path.clone()),
            Source::Buffer(bundle) => ContentsSource::Buffer(bundle.clone()),
        })
    }
}
