//! Terminal runs persisted as one JSON file per run.
//!
//! Files are written to a temporary name and renamed into place, so readers
//! only ever see complete snapshots.

use std::path::{Path, PathBuf};

use tracing::debug;

use cde_core::{RunId, WorkflowRun};

use crate::error::ArchiveError;

/// Directory of archived run snapshots, named `<run_id>.json`.
#[derive(Debug, Clone)]
pub struct RunArchive {
    dir: PathBuf,
}

impl RunArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the snapshot, replacing any earlier one for the same run.
    pub async fn store(&self, run: &WorkflowRun) -> Result<PathBuf, ArchiveError> {
        let path = self.path_for(&run.id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| io_error(&self.dir, source))?;

        let json = serde_json::to_vec_pretty(run)?;
        let tmp = self.dir.join(format!(".{}.json.tmp", run.id));
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|source| io_error(&tmp, source))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| io_error(&path, source))?;

        debug!(run_id = %run.id, path = %path.display(), "Run archived");
        Ok(path)
    }

    /// Read an archived run. `Ok(None)` if the run was never archived.
    pub async fn load(&self, run_id: &RunId) -> Result<Option<WorkflowRun>, ArchiveError> {
        let path = self.path_for(run_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(io_error(&path, source)),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn path_for(&self, run_id: &RunId) -> Result<PathBuf, ArchiveError> {
        let id = run_id.as_str();
        let safe = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(ArchiveError::InvalidRunId(run_id.clone()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ArchiveError {
    ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}
