//! Per-node classification and metadata extraction.

use std::fs;
use std::path::Path;

use regex::Regex;

use cde_core::{NodeKind, ScanNode, Violation};

use crate::error::ScanError;
use crate::scanner::ScanOptions;

/// Dependency manifests recognised by file name.
const MANIFESTS: &[&str] = &[
    "Cargo.toml",
    "package.json",
    "pyproject.toml",
    "requirements.txt",
    "pom.xml",
    "build.gradle",
    "go.mod",
];

/// Directory names whose contents are tests.
const TEST_DIRS: &[&str] = &["tests", "test", "__tests__", "spec"];

/// Map a file extension to a language tag.
fn language_for(extension: &str) -> Option<&'static str> {
    let lang = match extension {
        "rs" => "rust",
        "py" | "pyi" => "python",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "rb" => "ruby",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "swift" => "swift",
        "php" => "php",
        "sh" | "bash" => "shell",
        "md" | "markdown" => "markdown",
        _ => return None,
    };
    Some(lang)
}

fn is_markdown(extension: &str) -> bool {
    matches!(extension, "md" | "markdown")
}

/// Test file naming conventions: `test_x.py`, `x_test.go`, `x.test.ts`, `x.spec.js`.
fn is_test_file(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    name.starts_with("test_")
        || stem.ends_with("_test")
        || stem.ends_with("_spec")
        || name.contains(".test.")
        || name.contains(".spec.")
}

/// Classify a file by its '/'-separated relative path.
pub(crate) fn classify(rel_path: &str) -> NodeKind {
    let mut components: Vec<&str> = rel_path.split('/').collect();
    let name = components.pop().unwrap_or(rel_path);
    let extension = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");

    if MANIFESTS.contains(&name) {
        NodeKind::Manifest
    } else if is_markdown(extension) {
        NodeKind::Document
    } else if language_for(extension).is_some()
        && (is_test_file(name) || components.iter().any(|c| TEST_DIRS.contains(c)))
    {
        NodeKind::Test
    } else if language_for(extension).is_some() {
        NodeKind::Source
    } else {
        NodeKind::Other
    }
}

/// Builds [`ScanNode`]s for files and directories.
///
/// Owned by one scan; holds compiled matchers and the governance options.
pub(crate) struct Extractor {
    require_frontmatter: bool,
    required_fields: Vec<String>,
    check_links: bool,
    max_file_bytes: u64,
    header_re: Regex,
    link_re: Regex,
}

impl Extractor {
    pub(crate) fn new(options: &ScanOptions) -> Result<Self, ScanError> {
        Ok(Self {
            require_frontmatter: options.require_frontmatter,
            required_fields: options.required_fields.clone(),
            check_links: options.check_links,
            max_file_bytes: options.max_file_bytes,
            header_re: Regex::new(r"^(#{1,6})\s+(.+?)\s*#*\s*$")?,
            link_re: Regex::new(r"\[([^\]]*)\]\(\s*<?([^)\s>]+)>?(?:\s+[^)]*)?\)")?,
        })
    }

    /// Build the node for one filesystem entry.
    pub(crate) fn node(
        &self,
        root: &Path,
        path: &Path,
        rel_path: String,
        depth: usize,
        is_dir: bool,
    ) -> ScanNode {
        if is_dir {
            return ScanNode::new(rel_path, NodeKind::Directory, depth);
        }

        let kind = classify(&rel_path);
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let mut node = ScanNode::new(rel_path, kind, depth);
        if let Some(language) = language_for(extension) {
            node = node.with_metadata("language", language);
        }

        if kind == NodeKind::Document {
            self.inspect_document(root, path, &mut node);
        }
        node
    }

    /// Node for an entry the walker could not read.
    pub(crate) fn unreadable(
        rel_path: String,
        depth: usize,
        error: impl std::fmt::Display,
    ) -> ScanNode {
        ScanNode::new(rel_path, NodeKind::Other, depth)
            .with_violation(Violation::unreadable(error))
    }

    fn inspect_document(&self, root: &Path, path: &Path, node: &mut ScanNode) {
        match fs::metadata(path) {
            Ok(meta) if meta.len() > self.max_file_bytes => {
                node.metadata.insert("skipped".to_string(), "too-large".to_string());
                return;
            }
            Ok(_) => {}
            Err(e) => {
                node.violations.push(Violation::unreadable(e));
                return;
            }
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                node.violations.push(Violation::unreadable(e));
                return;
            }
        };

        let (frontmatter, body) = split_frontmatter(&content);
        match frontmatter {
            Some(raw) => self.check_frontmatter(raw, node),
            None if self.require_frontmatter => {
                node.violations.push(Violation::missing_frontmatter())
            }
            None => {}
        }

        let mut headers = 0usize;
        let mut in_fence = false;
        for line in body.lines() {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                continue;
            }
            if in_fence {
                continue;
            }
            if let Some(caps) = self.header_re.captures(line) {
                headers += 1;
                if headers == 1 {
                    node.metadata.insert("heading".to_string(), caps[2].to_string());
                }
            }
        }

        let mut internal = 0usize;
        let mut external = 0usize;
        let doc_dir = path.parent().unwrap_or(root);
        for caps in self.link_re.captures_iter(body) {
            let target = &caps[2];
            if is_external(target) {
                external += 1;
                continue;
            }
            internal += 1;
            if self.check_links {
                if let Some(file) = link_file(target) {
                    let resolved = match file.strip_prefix('/') {
                        Some(from_root) => root.join(from_root),
                        None => doc_dir.join(file),
                    };
                    if !resolved.exists() {
                        node.violations.push(Violation::broken_link(target));
                    }
                }
            }
        }

        let meta = &mut node.metadata;
        meta.insert("headers".to_string(), headers.to_string());
        meta.insert("links.internal".to_string(), internal.to_string());
        meta.insert("links.external".to_string(), external.to_string());
        meta.insert("words".to_string(), body.split_whitespace().count().to_string());
    }

    fn check_frontmatter(&self, raw: &str, node: &mut ScanNode) {
        let mapping = match serde_yaml::from_str::<serde_yaml::Value>(raw) {
            Ok(serde_yaml::Value::Mapping(mapping)) => mapping,
            Ok(serde_yaml::Value::Null) => serde_yaml::Mapping::new(),
            Ok(_) => {
                node.violations
                    .push(Violation::invalid_frontmatter("expected a mapping"));
                return;
            }
            Err(e) => {
                node.violations.push(Violation::invalid_frontmatter(e));
                return;
            }
        };

        for (key, value) in &mapping {
            let Some(key) = scalar_to_string(key) else {
                continue;
            };
            if let Some(value) = value_to_string(value) {
                node.metadata.insert(format!("fm.{key}"), value);
            }
        }

        for field in &self.required_fields {
            if !node.metadata.contains_key(&format!("fm.{field}")) {
                node.violations.push(Violation::missing_field(field));
            }
        }
    }
}

/// Split `---`-delimited front-matter from the document body.
///
/// Returns `(None, content)` when the document does not open with a
/// front-matter fence or the fence is never closed.
fn split_frontmatter(content: &str) -> (Option<&str>, &str) {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let Some(rest) = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))
    else {
        return (None, content);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let body = &rest[offset + line.len()..];
            return (Some(&rest[..offset]), body);
        }
        offset += line.len();
    }
    (None, content)
}

fn is_external(target: &str) -> bool {
    target.starts_with("http://")
        || target.starts_with("https://")
        || target.starts_with("mailto:")
        || target.starts_with("//")
}

/// File part of an internal link, without fragment or query.
fn link_file(target: &str) -> Option<&str> {
    let end = target.find(['#', '?']).unwrap_or(target.len());
    let file = &target[..end];
    (!file.is_empty()).then_some(file)
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Flatten a front-matter value; sequences of scalars are comma-joined.
fn value_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Sequence(items) => Some(
            items
                .iter()
                .filter_map(scalar_to_string)
                .collect::<Vec<_>>()
                .join(", "),
        ),
        serde_yaml::Value::Null => Some(String::new()),
        other => scalar_to_string(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> Extractor {
        Extractor::new(&ScanOptions::default()).unwrap()
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("Cargo.toml"), NodeKind::Manifest);
        assert_eq!(classify("web/package.json"), NodeKind::Manifest);
        assert_eq!(classify("docs/guide.md"), NodeKind::Document);
        assert_eq!(classify("src/lib.rs"), NodeKind::Source);
        assert_eq!(classify("tests/api.rs"), NodeKind::Test);
        assert_eq!(classify("pkg/test_models.py"), NodeKind::Test);
        assert_eq!(classify("src/button.test.tsx"), NodeKind::Test);
        assert_eq!(classify("server/handler_test.go"), NodeKind::Test);
        assert_eq!(classify("tests/fixtures/data.json"), NodeKind::Other);
        assert_eq!(classify("LICENSE"), NodeKind::Other);
    }

    #[test]
    fn test_split_frontmatter() {
        let (fm, body) = split_frontmatter("---\ntitle: Guide\n---\n# Guide\n");
        assert_eq!(fm, Some("title: Guide\n"));
        assert_eq!(body, "# Guide\n");

        let (fm, body) = split_frontmatter("# No front-matter\n");
        assert!(fm.is_none());
        assert_eq!(body, "# No front-matter\n");

        let (fm, _) = split_frontmatter("---\ntitle: unterminated\n");
        assert!(fm.is_none());
    }

    #[test]
    fn test_document_metadata_and_violations() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("other.md"), "---\ntitle: Other\n---\n").unwrap();
        let doc = root.join("guide.md");
        fs::write(
            &doc,
            "---\ntags: [a, b]\n---\n# Guide\n\nSee [other](other.md), [gone](gone.md#x) and [site](https://example.com).\n\n```\n# not a header\n```\n",
        )
        .unwrap();

        let node = extractor().node(root, &doc, "guide.md".to_string(), 1, false);

        assert_eq!(node.kind, NodeKind::Document);
        assert_eq!(node.metadata.get("fm.tags").map(String::as_str), Some("a, b"));
        assert_eq!(node.metadata.get("heading").map(String::as_str), Some("Guide"));
        assert_eq!(node.metadata.get("headers").map(String::as_str), Some("1"));
        assert_eq!(node.metadata.get("links.internal").map(String::as_str), Some("2"));
        assert_eq!(node.metadata.get("links.external").map(String::as_str), Some("1"));

        let codes: Vec<&str> = node.violations.iter().map(|v| v.code.as_str()).collect();
        assert_eq!(codes, vec!["missing-field:title", "broken-link"]);
    }

    #[test]
    fn test_missing_and_invalid_frontmatter() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let plain = root.join("plain.md");
        fs::write(&plain, "just text\n").unwrap();
        let list = root.join("list.md");
        fs::write(&list, "---\n- one\n- two\n---\nbody\n").unwrap();

        let ex = extractor();
        let node = ex.node(root, &plain, "plain.md".to_string(), 1, false);
        assert_eq!(node.violations[0].code, "missing-frontmatter");

        let node = ex.node(root, &list, "list.md".to_string(), 1, false);
        assert_eq!(node.violations[0].code, "invalid-frontmatter");
    }
}
