//! Parallel tree walk, partitioned by top-level subtree.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::debug;
use walkdir::WalkDir;

use cde_core::{ScanNode, ScanReport};

use super::extract::Extractor;
use super::ScanOptions;
use crate::error::ScanError;

/// Output of one worker for one top-level subtree.
struct Partial {
    nodes: Vec<ScanNode>,
    excluded: usize,
}

/// Blocking half of the scanner. Runs on the scan worker pool.
pub(crate) struct Walker {
    pool: ThreadPool,
    excluded_dirs: Vec<String>,
    excludes: GlobSet,
    max_depth: Option<usize>,
    extractor: Extractor,
}

impl Walker {
    pub(crate) fn new(options: &ScanOptions) -> Result<Self, ScanError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &options.exclude_patterns {
            let glob = Glob::new(pattern).map_err(|source| ScanError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        let excludes = builder.build().map_err(|source| ScanError::InvalidPattern {
            pattern: options.exclude_patterns.join(", "),
            source,
        })?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.worker_count())
            .thread_name(|idx| format!("cde-scan-{idx}"))
            .build()
            .map_err(|e| ScanError::Worker(e.to_string()))?;

        Ok(Self {
            pool,
            excluded_dirs: options.excluded_dirs.clone(),
            excludes,
            max_depth: options.max_depth,
            extractor: Extractor::new(options)?,
        })
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn is_excluded(&self, rel_path: &str, name: &str, is_dir: bool) -> bool {
        (is_dir && self.excluded_dirs.iter().any(|d| d == name))
            || self.excludes.is_match(rel_path)
    }

    /// Walk `root` and build the merged report. `stop` aborts workers early;
    /// whatever they produced is then thrown away by the caller.
    pub(crate) fn walk(&self, root: &Path, stop: &AtomicBool) -> Result<ScanReport, ScanError> {
        if self.max_depth == Some(0) {
            return Ok(ScanReport::from_nodes(root.display().to_string(), Vec::new(), 0));
        }

        let entries = fs::read_dir(root).map_err(|source| ScanError::Io {
            path: root.to_path_buf(),
            source,
        })?;

        let mut top_level: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ScanError::Io {
                path: root.to_path_buf(),
                source,
            })?;
            top_level.push(entry.path());
        }
        top_level.sort();

        debug!(
            root = %root.display(),
            subtrees = top_level.len(),
            workers = self.worker_count(),
            "Partitioned scan"
        );

        let partials: Vec<Partial> = self.pool.install(|| {
            top_level
                .par_iter()
                .map(|path| self.walk_subtree(root, path, stop))
                .collect()
        });

        let mut nodes = Vec::new();
        let mut excluded = 0;
        for partial in partials {
            nodes.extend(partial.nodes);
            excluded += partial.excluded;
        }
        Ok(ScanReport::from_nodes(root.display().to_string(), nodes, excluded))
    }

    fn walk_subtree(&self, root: &Path, top: &Path, stop: &AtomicBool) -> Partial {
        let mut nodes = Vec::new();
        let mut excluded = 0usize;

        let mut walker = WalkDir::new(top).follow_links(false).sort_by_file_name();
        if let Some(max_depth) = self.max_depth {
            walker = walker.max_depth(max_depth.saturating_sub(1));
        }

        let entries = walker.into_iter().filter_entry(|entry| {
            let rel = relative_path(root, entry.path());
            let name = entry.file_name().to_string_lossy();
            let skip = self.is_excluded(&rel, &name, entry.file_type().is_dir());
            if skip {
                excluded += 1;
            }
            !skip
        });

        for entry in entries {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match entry {
                Ok(entry) => {
                    let rel = relative_path(root, entry.path());
                    nodes.push(self.extractor.node(
                        root,
                        entry.path(),
                        rel,
                        entry.depth() + 1,
                        entry.file_type().is_dir(),
                    ));
                }
                Err(err) => {
                    let path = err.path().unwrap_or(top);
                    let rel = relative_path(root, path);
                    nodes.push(Extractor::unreadable(rel, err.depth() + 1, err));
                }
            }
        }

        Partial { nodes, excluded }
    }
}

/// '/'-separated path of `path` relative to `root`.
fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_uses_forward_slashes() {
        let root = Path::new("/repo");
        assert_eq!(relative_path(root, &root.join("src").join("lib.rs")), "src/lib.rs");
    }

    #[test]
    fn test_excluded_dirs_and_globs() {
        let options = ScanOptions {
            exclude_patterns: vec!["*.log".to_string()],
            ..ScanOptions::default()
        };
        let walker = Walker::new(&options).unwrap();
        assert!(walker.is_excluded("node_modules", "node_modules", true));
        assert!(!walker.is_excluded("node_modules", "node_modules", false));
        assert!(walker.is_excluded("logs/app.log", "app.log", false));
        assert!(!walker.is_excluded("src/main.rs", "main.rs", false));
    }

    #[test]
    fn test_invalid_exclude_pattern() {
        let options = ScanOptions {
            exclude_patterns: vec!["src/[".to_string()],
            ..ScanOptions::default()
        };
        assert!(matches!(
            Walker::new(&options),
            Err(ScanError::InvalidPattern { .. })
        ));
    }
}
