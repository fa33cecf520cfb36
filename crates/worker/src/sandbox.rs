use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use error_stack::{Report, ResultExt};
use tracing::{event, Level};

use crate::{bundle::Bundle, error::WorkerError, protocol::TaskId};

/// How often a watched output is checked for while waiting for it to appear.
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The private working directory of one task. Inputs appear under their remote names and the
/// command runs with this directory as its working directory.
#[derive(Debug)]
pub struct Sandbox {
    path: PathBuf,
}

impl Sandbox {
    /// Create the sandbox for `task_id` and link each `(cache path, remote name)` pair into it.
    ///
    /// Files are symlinked to the cache. Directories are recreated as real directories whose files
    /// are symlinks, so a command that writes into an input directory (a tool writing its report
    /// next to itself, say) changes the sandbox and never the shared cached copy.
    pub fn create(
        tasks_root: &Path,
        task_id: TaskId,
        inputs: &[(PathBuf, String)],
    ) -> Result<Sandbox, Report<WorkerError>> {
        let path = tasks_root.join(format!("t.{task_id}"));
        if path.exists() {
            fs::remove_dir_all(&path)
                .change_context(WorkerError::Sandbox)
                .attach_printable_lazy(|| format!("Clearing stale sandbox {}", path.display()))?;
        }
        fs::create_dir_all(&path)
            .change_context(WorkerError::Sandbox)
            .attach_printable_lazy(|| format!("Creating sandbox {}", path.display()))?;

        let sandbox = Sandbox { path };
        for (source, remote_name) in inputs {
            let target = sandbox.path.join(remote_name);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).change_context(WorkerError::Sandbox)?;
            }

            link_tree(source, &target)
                .change_context(WorkerError::Sandbox)
                .attach_printable_lazy(|| {
                    format!("Linking {} as {remote_name}", source.display())
                })?;
        }

        Ok(sandbox)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every one of `paths` exists in the sandbox, checking at a fixed interval for at
    /// most `timeout`. Returns the paths that never appeared.
    pub async fn wait_for_outputs(&self, paths: &[&str], timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let missing = paths
                .iter()
                .filter(|p| !self.path.join(p).exists())
                .map(|p| p.to_string())
                .collect::<Vec<_>>();

            if missing.is_empty() || tokio::time::Instant::now() >= deadline {
                return missing;
            }

            tokio::time::sleep(WATCH_POLL_INTERVAL).await;
        }
    }

    /// Read an output back out of the sandbox. Returns `Ok(None)` if it does not exist.
    pub async fn read_output(&self, remote_path: &str) -> Result<Option<Bundle>, Report<WorkerError>> {
        let path = self.path.join(remote_path);
        tokio::task::spawn_blocking(move || match Bundle::read_path(&path) {
            Ok(bundle) => Ok(Some(bundle)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })
        .await
        .change_context(WorkerError::CollectOutput)?
        .change_context(WorkerError::CollectOutput)
        .attach_printable_lazy(|| format!("Reading output {remote_path}"))
    }

    pub async fn remove(self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            event!(Level::WARN, path = %self.path.display(), error = %e, "failed to remove sandbox");
        }
    }
}

fn link_tree(source: &Path, target: &Path) -> io::Result<()> {
    if !fs::metadata(source)?.is_dir() {
        return std::os::unix::fs::symlink(source, target);
    }

    fs::create_dir_all(target)?;
    for child in fs::read_dir(source)? {
        let child = child?;
        link_tree(&child.path(), &target.join(child.file_name()))?;
    }
    Ok(())
}
