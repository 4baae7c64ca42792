//! Scan report types produced by the project scanner.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Violation code for a node that could not be read.
pub const UNREADABLE: &str = "unreadable";
/// Violation code for a Markdown document without front-matter.
pub const MISSING_FRONTMATTER: &str = "missing-frontmatter";
/// Violation code prefix for a required front-matter field that is absent.
pub const MISSING_FIELD: &str = "missing-field";
/// Violation code for front-matter that is not a YAML mapping.
pub const INVALID_FRONTMATTER: &str = "invalid-frontmatter";
/// Violation code for an internal link whose target does not exist.
pub const BROKEN_LINK: &str = "broken-link";

/// Structural classification of a scanned node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Directory,
    /// Markdown documentation.
    Document,
    Source,
    /// Dependency manifest (Cargo.toml, package.json, ...).
    Manifest,
    Test,
    Other,
}

/// A governance predicate that failed for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Stable machine-readable code (e.g. "missing-field:title").
    pub code: String,
    /// Human-readable explanation.
    pub message: String,
}

impl Violation {
    /// Create a new violation.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unreadable(error: impl std::fmt::Display) -> Self {
        Self::new(UNREADABLE, format!("failed to read: {error}"))
    }

    pub fn missing_frontmatter() -> Self {
        Self::new(MISSING_FRONTMATTER, "document has no front-matter block")
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            format!("{MISSING_FIELD}:{field}"),
            format!("front-matter is missing required field '{field}'"),
        )
    }

    pub fn invalid_frontmatter(error: impl std::fmt::Display) -> Self {
        Self::new(INVALID_FRONTMATTER, format!("front-matter is not a YAML mapping: {error}"))
    }

    pub fn broken_link(target: &str) -> Self {
        Self::new(BROKEN_LINK, format!("link target '{target}' does not exist"))
    }
}

/// One file or directory in the scanned tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanNode {
    /// Path relative to the scan root, '/'-separated.
    pub path: String,

    /// Structural kind.
    pub kind: NodeKind,

    /// Depth below the root (top-level entries are depth 1).
    pub depth: usize,

    /// Extracted metadata (front-matter fields use the "fm." prefix).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    /// Governance violations found on this node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

impl ScanNode {
    /// Create a node with no metadata or violations.
    pub fn new(path: impl Into<String>, kind: NodeKind, depth: usize) -> Self {
        Self {
            path: path.into(),
            kind,
            depth,
            metadata: BTreeMap::new(),
            violations: Vec::new(),
        }
    }

    /// Builder method to add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Builder method to add a violation.
    pub fn with_violation(mut self, violation: Violation) -> Self {
        self.violations.push(violation);
        self
    }

    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Aggregate counts over a report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub files: usize,
    pub directories: usize,
    pub documents: usize,
    pub tests: usize,
    /// Entries skipped by exclusion rules.
    pub excluded: usize,
    pub violations: usize,
    /// Language name -> number of files.
    pub languages: BTreeMap<String, usize>,
    /// Paths of dependency manifests, in report order.
    pub manifests: Vec<String>,
}

/// The merged, ordered output of one scan.
///
/// Nodes are sorted component-wise by path, which is a pre-order walk of
/// the tree. Two scans of an unchanged tree serialize identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// The root that was scanned, as given by the caller.
    pub root: String,
    pub nodes: Vec<ScanNode>,
    pub summary: ScanSummary,
}

/// Compare '/'-separated relative paths component by component.
pub fn compare_paths(a: &str, b: &str) -> Ordering {
    a.split('/').cmp(b.split('/'))
}

impl ScanReport {
    /// Build a report from unordered nodes.
    pub fn from_nodes(root: impl Into<String>, mut nodes: Vec<ScanNode>, excluded: usize) -> Self {
        nodes.sort_by(|a, b| compare_paths(&a.path, &b.path));

        let mut summary = ScanSummary {
            excluded,
            ..ScanSummary::default()
        };
        for node in &nodes {
            match node.kind {
                NodeKind::Directory => summary.directories += 1,
                kind => {
                    summary.files += 1;
                    match kind {
                        NodeKind::Document => summary.documents += 1,
                        NodeKind::Test => summary.tests += 1,
                        NodeKind::Manifest => summary.manifests.push(node.path.clone()),
                        _ => {}
                    }
                }
            }
            if let Some(language) = node.metadata.get("language") {
                *summary.languages.entry(language.clone()).or_insert(0) += 1;
            }
            summary.violations += node.violations.len();
        }

        Self {
            root: root.into(),
            nodes,
            summary,
        }
    }

    /// Look up a node by its relative path.
    pub fn node(&self, path: &str) -> Option<&ScanNode> {
        self.nodes
            .binary_search_by(|n| compare_paths(&n.path, path))
            .ok()
            .map(|idx| &self.nodes[idx])
    }

    /// Returns true if any node has the given kind.
    pub fn has_kind(&self, kind: NodeKind) -> bool {
        self.nodes.iter().any(|n| n.kind == kind)
    }

    pub fn has_tests(&self) -> bool {
        self.has_kind(NodeKind::Test)
    }

    pub fn has_docs(&self) -> bool {
        self.has_kind(NodeKind::Document)
    }

    /// Returns true if a manifest with this file name exists anywhere in the tree.
    pub fn has_manifest(&self, name: &str) -> bool {
        self.nodes
            .iter()
            .any(|n| n.kind == NodeKind::Manifest && n.file_name() == name)
    }

    /// Every violation paired with the node it belongs to.
    pub fn violations(&self) -> impl Iterator<Item = (&ScanNode, &Violation)> {
        self.nodes
            .iter()
            .flat_map(|n| n.violations.iter().map(move |v| (n, v)))
    }

    pub fn is_clean(&self) -> bool {
        self.summary.violations == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ScanReport {
        let nodes = vec![
            ScanNode::new("src/lib.rs", NodeKind::Source, 2).with_metadata("language", "rust"),
            ScanNode::new("src-gen", NodeKind::Directory, 1),
            ScanNode::new("Cargo.toml", NodeKind::Manifest, 1),
            ScanNode::new("src", NodeKind::Directory, 1),
            ScanNode::new("README.md", NodeKind::Document, 1)
                .with_violation(Violation::missing_frontmatter()),
        ];
        ScanReport::from_nodes("/repo", nodes, 3)
    }

    #[test]
    fn test_nodes_sorted_in_preorder() {
        let report = sample();
        let paths: Vec<&str> = report.nodes.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["Cargo.toml", "README.md", "src", "src/lib.rs", "src-gen"]
        );
    }

    #[test]
    fn test_summary_counts() {
        let report = sample();
        assert_eq!(report.summary.files, 3);
        assert_eq!(report.summary.directories, 2);
        assert_eq!(report.summary.excluded, 3);
        assert_eq!(report.summary.violations, 1);
        assert_eq!(report.summary.languages.get("rust"), Some(&1));
        assert_eq!(report.summary.manifests, vec!["Cargo.toml".to_string()]);
    }

    #[test]
    fn test_lookup_and_manifests() {
        let report = sample();
        assert!(report.node("src/lib.rs").is_some());
        assert!(report.node("missing.rs").is_none());
        assert!(report.has_manifest("Cargo.toml"));
        assert!(!report.has_manifest("lib.rs"));
        assert!(!report.has_tests());
    }
}
