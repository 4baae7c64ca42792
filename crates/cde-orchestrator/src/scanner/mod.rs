//! Project scanner.
//!
//! Walks a project tree on a bounded worker pool, classifies every node,
//! extracts metadata and records governance violations. Scans are bounded by
//! a total deadline and can be cancelled; either way partial results are
//! discarded.

mod extract;
mod walk;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cde_core::ScanReport;

use crate::error::ScanError;
use walk::Walker;

fn default_excluded_dirs() -> Vec<String> {
    [".git", "target", "node_modules", "__pycache__", ".venv", "dist", "build"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Scanner configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Maximum depth below the root (top-level entries are depth 1).
    pub max_depth: Option<usize>,

    /// Glob patterns matched against '/'-separated relative paths.
    pub exclude_patterns: Vec<String>,

    /// Directory names skipped wherever they appear.
    pub excluded_dirs: Vec<String>,

    /// Worker pool size; defaults to the detected hardware parallelism.
    pub concurrency: Option<usize>,

    /// Total scan deadline in milliseconds.
    pub timeout_ms: u64,

    /// Flag Markdown documents without front-matter.
    pub require_frontmatter: bool,

    /// Front-matter fields every document must declare.
    pub required_fields: Vec<String>,

    /// Check that internal Markdown links resolve.
    pub check_links: bool,

    /// Documents larger than this are classified but not parsed.
    pub max_file_bytes: u64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_depth: None,
            exclude_patterns: Vec::new(),
            excluded_dirs: default_excluded_dirs(),
            concurrency: None,
            timeout_ms: 60_000,
            require_frontmatter: true,
            required_fields: vec!["title".to_string()],
            check_links: true,
            max_file_bytes: 1024 * 1024,
        }
    }
}

impl ScanOptions {
    /// Total scan deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Effective worker pool size, never zero.
    pub fn worker_count(&self) -> usize {
        self.concurrency
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
            })
            .max(1)
    }
}

/// Concurrent project scanner.
///
/// Cheap to share: clone the `Arc` handed out by the orchestrator. Each
/// [`Scanner::scan`] call owns its own accumulator.
pub struct Scanner {
    options: ScanOptions,
    walker: Arc<Walker>,
}

impl Scanner {
    /// Build a scanner, compiling exclude patterns and the worker pool.
    pub fn new(options: ScanOptions) -> Result<Self, ScanError> {
        let walker = Arc::new(Walker::new(&options)?);
        Ok(Self { options, walker })
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Scan `root` and return the merged report.
    ///
    /// Fails with `PathNotFound`/`NotADirectory`/`Io` when the root is
    /// inaccessible, `Timeout` when the total deadline elapses and
    /// `Cancelled` when `cancel` fires first.
    pub async fn scan(
        &self,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<ScanReport, ScanError> {
        check_root(root).await?;

        let started = Instant::now();
        let stop = Arc::new(AtomicBool::new(false));
        let walker = Arc::clone(&self.walker);
        let root_buf = root.to_path_buf();
        let worker_stop = Arc::clone(&stop);
        let mut handle =
            tokio::task::spawn_blocking(move || walker.walk(&root_buf, &worker_stop));

        let timeout = self.options.timeout();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                stop.store(true, Ordering::Relaxed);
                debug!(root = %root.display(), "Scan cancelled");
                return Err(ScanError::Cancelled);
            }
            _ = tokio::time::sleep(timeout) => {
                stop.store(true, Ordering::Relaxed);
                warn!(
                    root = %root.display(),
                    timeout_ms = self.options.timeout_ms,
                    "Scan timed out"
                );
                return Err(ScanError::Timeout(timeout));
            }
            joined = &mut handle => {
                joined.map_err(|e| ScanError::Worker(e.to_string()))?
            }
        };

        let report = result?;
        info!(
            root = %root.display(),
            files = report.summary.files,
            directories = report.summary.directories,
            excluded = report.summary.excluded,
            violations = report.summary.violations,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scan complete"
        );
        Ok(report)
    }
}

fn root_error(root: &Path, source: std::io::Error) -> ScanError {
    if source.kind() == std::io::ErrorKind::NotFound {
        ScanError::PathNotFound(root.to_path_buf())
    } else {
        ScanError::Io {
            path: root.to_path_buf(),
            source,
        }
    }
}

async fn check_root(root: &Path) -> Result<(), ScanError> {
    let meta = tokio::fs::metadata(root)
        .await
        .map_err(|e| root_error(root, e))?;
    if !meta.is_dir() {
        return Err(ScanError::NotADirectory(root.to_path_buf()));
    }
    Ok(())
}
