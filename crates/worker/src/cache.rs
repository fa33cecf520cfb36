//! The worker's content-addressed artifact cache.
//!
//! Every artifact lives at `<root>/<fingerprint>`. Transfers are written under
//! `<root>/.staging/` and renamed into place once complete, so a partially written artifact is
//! never visible to a task. Archives sent with the unpack flag are extracted with `tar` and the
//! fingerprint path holds the extracted tree instead of the archive.
//!
//! Staging is done by a [Stager], which holds no cache state and can run as a task of its own.
//! The finished artifact only becomes part of the cache once it is committed.

use std::{
    collections::HashMap,
    fs,
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use error_stack::{Report, ResultExt};
use tracing::{event, instrument, Level};

use crate::{
    bundle::Bundle,
    error::WorkerError,
    fingerprint::{CachedArtifact, Fingerprint},
};

const STAGING_DIR: &str = ".staging";

/// Extracts the archive passed as `$1` into the current directory.
pub const DEFAULT_UNPACK_COMMAND: &str = "tar -xf \"$1\"";

/// Counts of physical cache operations. Clones share the same counters.
#[derive(Debug, Default)]
pub struct CacheCounters {
    fetches: AtomicU64,
    unpacks: AtomicU64,
    evictions: AtomicU64,
}

impl CacheCounters {
    /// Number of artifacts written into the cache from a transfer.
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Number of archives extracted.
    pub fn unpacks(&self) -> u64 {
        self.unpacks.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct Cache {
    root: PathBuf,
    stager: Stager,
    entries: HashMap<Fingerprint, u64>,
    counters: Arc<CacheCounters>,
}

/// Writes transferred artifacts into the cache directory without touching the cache's
/// bookkeeping.
#[derive(Debug, Clone)]
pub struct Stager {
    root: PathBuf,
    staging: PathBuf,
    unpack_command: String,
}

/// An artifact that is in place on disk but not yet recorded by [Cache::commit].
#[derive(Debug)]
pub struct Staged {
    fingerprint: Fingerprint,
    size: u64,
    unpack: bool,
}

impl Staged {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl Cache {
    /// Open the cache at `root`, creating it if needed. Artifacts left by a previous run are
    /// kept and reported; leftover staging data is discarded.
    pub fn open(root: impl Into<PathBuf>) -> Result<Cache, Report<WorkerError>> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);

        if staging.exists() {
            fs::remove_dir_all(&staging)
                .change_context(WorkerError::Cache)
                .attach_printable_lazy(|| format!("Clearing {}", staging.display()))?;
        }
        fs::create_dir_all(&staging)
            .change_context(WorkerError::Cache)
            .attach_printable_lazy(|| format!("Creating {}", staging.display()))?;

        let mut entries = HashMap::new();
        let listing = fs::read_dir(&root)
            .change_context(WorkerError::Cache)
            .attach_printable_lazy(|| format!("Listing {}", root.display()))?;
        for item in listing {
            let item = item.change_context(WorkerError::Cache)?;
            let name = item.file_name();
            let Some(fingerprint) = Fingerprint::parse(&name.to_string_lossy()) else {
                continue;
            };

            let size = disk_usage(&item.path()).change_context(WorkerError::Cache)?;
            entries.insert(fingerprint, size);
        }

        event!(Level::DEBUG, root = %root.display(), existing = entries.len(), "opened cache");

        Ok(Cache {
            stager: Stager {
                root: root.clone(),
                staging,
                unpack_command: DEFAULT_UNPACK_COMMAND.to_string(),
            },
            root,
            entries,
            counters: Arc::new(CacheCounters::default()),
        })
    }

    /// Extract archives with a different shell command. It runs in the destination directory
    /// with the archive path as `$1`.
    pub fn with_unpack_command(mut self, command: impl Into<String>) -> Self {
        self.stager.unpack_command = command.into();
        self
    }

    pub fn stager(&self) -> Stager {
        self.stager.clone()
    }

    pub fn counters(&self) -> Arc<CacheCounters> {
        self.counters.clone()
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.contains_key(fingerprint)
    }

    /// The materialized location of a cached artifact.
    pub fn path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(fingerprint.as_str())
    }

    pub fn snapshot(&self) -> Vec<CachedArtifact> {
        let mut cached = self
            .entries
            .iter()
            .map(|(fingerprint, size)| CachedArtifact {
                fingerprint: fingerprint.clone(),
                size: *size,
            })
            .collect::<Vec<_>>();
        cached.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        cached
    }

    /// Write a transferred artifact into the cache and return its location. Storing a
    /// fingerprint that is already present does nothing.
    pub async fn store(
        &mut self,
        fingerprint: &Fingerprint,
        unpack: bool,
        bundle: Bundle,
    ) -> Result<PathBuf, Report<WorkerError>> {
        if self.contains(fingerprint) {
            event!(Level::DEBUG, %fingerprint, "already cached");
            return Ok(self.path(fingerprint));
        }

        let staged = self.stager.stage(fingerprint.clone(), unpack, bundle).await?;
        Ok(self.commit(staged))
    }

    /// Record a staged artifact as present and return its location.
    pub fn commit(&mut self, staged: Staged) -> PathBuf {
        let Staged {
            fingerprint,
            size,
            unpack,
        } = staged;

        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        if unpack {
            self.counters.unpacks.fetch_add(1, Ordering::Relaxed);
        }
        event!(Level::INFO, %fingerprint, size, unpack, "cached artifact");

        let path = self.path(&fingerprint);
        self.entries.insert(fingerprint, size);
        path
    }

    /// Remove an artifact from the cache. Returns false if it was not present.
    #[instrument(level = "debug", skip(self))]
    pub async fn evict(&mut self, fingerprint: &Fingerprint) -> Result<bool, Report<WorkerError>> {
        if self.entries.remove(fingerprint).is_none() {
            return Ok(false);
        }

        let path = self.path(fingerprint);
        tokio::task::spawn_blocking(move || remove_path(&path))
            .await
            .change_context(WorkerError::Cache)?
            .change_context(WorkerError::Cache)
            .attach_printable_lazy(|| format!("Removing {fingerprint}"))?;

        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }
}

impl Stager {
    /// Check a transferred bundle against its fingerprint and move it into place under the
    /// cache root.
    #[instrument(level = "debug", skip(self, bundle), fields(size = bundle.size()))]
    pub async fn stage(
        &self,
        fingerprint: Fingerprint,
        unpack: bool,
        bundle: Bundle,
    ) -> Result<Staged, Report<WorkerError>> {
        bundle
            .validate()
            .map_err(|e| Report::new(WorkerError::Cache).attach_printable(e))?;
        let bundle = verify(fingerprint.clone(), unpack, bundle).await?;

        let target = self.root.join(fingerprint.as_str());
        let staged = self.staging.join(fingerprint.as_str());
        let result = if unpack {
            self.stage_unpacked(&staged, bundle).await
        } else {
            let dest = staged.clone();
            tokio::task::spawn_blocking(move || {
                remove_path(&dest)?;
                bundle.write_to(&dest)
            })
            .await
            .change_context(WorkerError::Cache)?
            .change_context(WorkerError::Cache)
            .attach_printable("Writing artifact to staging")
        };

        if let Err(e) = result {
            tokio::fs::remove_dir_all(&staged).await.ok();
            tokio::fs::remove_file(&staged).await.ok();
            return Err(e.attach_printable(format!("Artifact {fingerprint}")));
        }

        tokio::fs::rename(&staged, &target)
            .await
            .change_context(WorkerError::Cache)
            .attach_printable_lazy(|| format!("Moving {fingerprint} into the cache"))?;

        let size = tokio::task::spawn_blocking(move || disk_usage(&target))
            .await
            .change_context(WorkerError::Cache)?
            .change_context(WorkerError::Cache)?;

        Ok(Staged {
            fingerprint,
            size,
            unpack,
        })
    }

    async fn stage_unpacked(&self, staged: &Path, bundle: Bundle) -> Result<(), Report<WorkerError>> {
        if !bundle.is_single_file() {
            return Err(Report::new(WorkerError::Cache))
                .attach_printable("Only single-file archives can be unpacked");
        }

        let archive = staged.with_extension("archive");
        let (dest, archive_path) = (staged.to_path_buf(), archive.clone());
        tokio::task::spawn_blocking(move || {
            remove_path(&dest)?;
            fs::create_dir_all(&dest)?;
            fs::write(&archive_path, &bundle.body)
        })
        .await
        .change_context(WorkerError::Cache)?
        .change_context(WorkerError::Cache)
        .attach_printable("Writing archive to staging")?;

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.unpack_command)
            .arg("kiln-unpack")
            .arg(&archive)
            .current_dir(staged)
            .stdin(Stdio::null())
            .output()
            .await
            .change_context(WorkerError::Cache)
            .attach_printable_lazy(|| format!("Running {}", self.unpack_command))?;

        tokio::fs::remove_file(&archive).await.ok();

        if !output.status.success() {
            return Err(Report::new(WorkerError::Cache)).attach_printable(format!(
                "{} exited with {}: {}",
                self.unpack_command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(())
    }
}

/// Hash a received bundle off the runtime and hand it back if it matches `fingerprint`.
async fn verify(
    fingerprint: Fingerprint,
    unpack: bool,
    bundle: Bundle,
) -> Result<Bundle, Report<WorkerError>> {
    let kind = fingerprint
        .kind()
        .ok_or_else(|| Report::new(WorkerError::Cache))
        .attach_printable_lazy(|| format!("{fingerprint} has no artifact kind"))?;

    tokio::task::spawn_blocking(move || {
        let actual = Fingerprint::of(kind, unpack, &bundle);
        if actual == fingerprint {
            Ok(bundle)
        } else {
            Err(Report::new(WorkerError::Cache)).attach_printable(format!(
                "Received content hashes to {actual}, expected {fingerprint}"
            ))
        }
    })
    .await
    .change_context(WorkerError::Cache)?
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn disk_usage(path: &Path) -> io::Result<u64> {
    let metadata = fs::symlink_metadata(path)?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }

    let mut total = 0;
    for child in fs::read_dir(path)? {
        total += disk_usage(&child?.path())?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::ArtifactKind;

    #[tokio::test]
    async fn store_is_idempotent() {
        let dir = tempfile::tempdir().expect("creating temp dir");
        let mut cache = Cache::open(dir.path()).expect("opening cache");

        let bundle = Bundle::from_bytes(b"reads".to_vec());
        let fingerprint = Fingerprint::of(ArtifactKind::Buffer, false, &bundle);

        let first = cache
            .store(&fingerprint, false, bundle.clone())
            .await
            .expect("first store");
        let second = cache
            .store(&fingerprint, false, bundle)
            .await
            .expect("second store");

        assert_eq!(first, second);
        assert_eq!(fs::read(&first).unwrap(), b"reads");
        assert_eq!(cache.counters().fetches(), 1, "only one physical write");
    }

    #[tokio::test]
    async fn reopening_reports_existing_artifacts() {
        let dir = tempfile::tempdir().expect("creating temp dir");
        let bundle = Bundle::from_bytes(b"persistent".to_vec());
        let fingerprint = Fingerprint::of(ArtifactKind::File, false, &bundle);

        {
            let mut cache = Cache::open(dir.path()).expect("opening cache");
            cache.store(&fingerprint, false, bundle).await.expect("store");
        }

        fs::write(dir.path().join(STAGING_DIR).join("leftover"), b"x").unwrap();

        let cache = Cache::open(dir.path()).expect("reopening cache");
        assert!(cache.contains(&fingerprint));
        assert_eq!(
            cache.snapshot(),
            vec![CachedArtifact {
                fingerprint,
                size: 10
            }]
        );
        assert!(!dir.path().join(STAGING_DIR).join("leftover").exists());
    }

    #[tokio::test]
    async fn unpacks_archives() {
        let src = tempfile::tempdir().expect("creating source dir");
        fs::create_dir(src.path().join("bbmap")).unwrap();
        fs::write(src.path().join("bbmap/bbduk.sh"), b"#!/bin/sh\n").unwrap();
        let archive = src.path().join("bbmap.tar.gz");
        let status = std::process::Command::new("tar")
            .arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(src.path())
            .arg("bbmap")
            .status()
            .expect("running tar");
        assert!(status.success());

        let dir = tempfile::tempdir().expect("creating cache dir");
        let mut cache = Cache::open(dir.path()).expect("opening cache");
        let bundle = Bundle::read_path(&archive).expect("reading archive");
        let fingerprint = Fingerprint::of(ArtifactKind::File, true, &bundle);

        let path = cache
            .store(&fingerprint, true, bundle)
            .await
            .expect("storing archive");

        assert!(path.is_dir(), "the extracted tree replaces the archive");
        assert_eq!(
            fs::read(path.join("bbmap/bbduk.sh")).unwrap(),
            b"#!/bin/sh\n"
        );
        assert_eq!(cache.counters().unpacks(), 1);
    }

    #[tokio::test]
    async fn failed_unpack_leaves_nothing_behind() {
        let dir = tempfile::tempdir().expect("creating cache dir");
        let mut cache = Cache::open(dir.path()).expect("opening cache");
        let bundle = Bundle::from_bytes(b"definitely not a tarball".to_vec());
        let fingerprint = Fingerprint::of(ArtifactKind::File, true, &bundle);

        cache
            .store(&fingerprint, true, bundle)
            .await
            .expect_err("extraction fails");
        assert!(!cache.contains(&fingerprint));
        assert!(!cache.path(&fingerprint).exists());
        assert_eq!(cache.counters().fetches(), 0);
    }

    #[tokio::test]
    async fn content_must_match_its_fingerprint() {
        let dir = tempfile::tempdir().expect("creating temp dir");
        let mut cache = Cache::open(dir.path()).expect("opening cache");
        let fingerprint =
            Fingerprint::of(ArtifactKind::File, false, &Bundle::from_bytes(b"expected".to_vec()));

        let err = cache
            .store(&fingerprint, false, Bundle::from_bytes(b"tampered".to_vec()))
            .await
            .expect_err("content does not match");
        assert_eq!(err.current_context(), &WorkerError::Cache);
        assert!(!cache.contains(&fingerprint));
        assert!(!cache.path(&fingerprint).exists());
    }

    #[tokio::test]
    async fn staging_leaves_the_cache_untouched_until_commit() {
        let dir = tempfile::tempdir().expect("creating temp dir");
        let mut cache = Cache::open(dir.path()).expect("opening cache");
        let bundle = Bundle::from_bytes(b"reference".to_vec());
        let fingerprint = Fingerprint::of(ArtifactKind::File, false, &bundle);

        let staged = cache
            .stager()
            .stage(fingerprint.clone(), false, bundle)
            .await
            .expect("staging");
        assert_eq!(staged.fingerprint(), &fingerprint);
        assert!(!cache.contains(&fingerprint));
        assert_eq!(cache.counters().fetches(), 0);

        let path = cache.commit(staged);
        assert!(cache.contains(&fingerprint));
        assert_eq!(fs::read(path).unwrap(), b"reference");
        assert_eq!(cache.counters().fetches(), 1);
    }

    #[tokio::test]
    async fn evict_removes_files() {
        let dir = tempfile::tempdir().expect("creating temp dir");
        let mut cache = Cache::open(dir.path()).expect("opening cache");
        let bundle = Bundle::from_bytes(b"old".to_vec());
        let fingerprint = Fingerprint::of(ArtifactKind::Buffer, false, &bundle);
        let path = cache.store(&fingerprint, false, bundle).await.unwrap();

        assert!(cache.evict(&fingerprint).await.unwrap());
        assert!(!path.exists());
        assert!(!cache.evict(&fingerprint).await.unwrap());
        assert_eq!(cache.counters().evictions(), 1);
    }
}
