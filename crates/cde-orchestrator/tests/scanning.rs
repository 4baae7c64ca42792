//! Scanner and selector behavior over real directory trees.

mod common;

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use cde_core::{AgentDescriptor, NodeKind};
use cde_orchestrator::{
    AgentClient, AgentRegistry, AgentSelector, HealthPolicy, RecipeSelector, ScanError,
    ScanOptions, Scanner,
};

use common::{project, Script, ScriptedAgent};

fn caps(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_repeated_scans_serialize_identically() {
    let dir = project();
    let root = dir.path();
    for i in 0..20 {
        let sub = root.join(format!("pkg{i}/src"));
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("main.py"), "print('hi')\n").unwrap();
    }

    let scanner = Scanner::new(ScanOptions {
        concurrency: Some(4),
        ..ScanOptions::default()
    })
    .unwrap();
    let cancel = CancellationToken::new();

    let first = scanner.scan(root, &cancel).await.unwrap();
    let second = scanner.scan(root, &cancel).await.unwrap();

    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
    assert_eq!(first.summary.languages.get("python"), Some(&20));
}

#[tokio::test]
async fn test_governance_violations_reported_per_node() {
    let dir = project();
    let root = dir.path();
    fs::write(root.join("docs/notes.md"), "# Notes\n\n[missing](./gone.md)\n").unwrap();
    fs::write(root.join("docs/draft.md"), "---\nauthor: me\n---\nDraft\n").unwrap();

    let scanner = Scanner::new(ScanOptions::default()).unwrap();
    let report = scanner.scan(root, &CancellationToken::new()).await.unwrap();

    let notes = report.node("docs/notes.md").unwrap();
    assert_eq!(notes.kind, NodeKind::Document);
    let codes: Vec<&str> = notes.violations.iter().map(|v| v.code.as_str()).collect();
    assert!(codes.contains(&"missing-frontmatter"));
    assert!(codes.contains(&"broken-link"));

    let draft = report.node("docs/draft.md").unwrap();
    assert!(draft.violations.iter().any(|v| v.code.starts_with("missing-field")));

    let guide = report.node("docs/guide.md").unwrap();
    assert!(guide.violations.is_empty(), "{:?}", guide.violations);
    assert_eq!(guide.metadata.get("fm.title").map(String::as_str), Some("Guide"));
}

#[tokio::test]
async fn test_excluded_directories_are_counted_not_walked() {
    let dir = project();
    let root = dir.path();
    fs::create_dir_all(root.join("target/debug")).unwrap();
    fs::write(root.join("target/debug/app.rs"), "").unwrap();
    fs::write(root.join("build.log"), "noise").unwrap();

    let scanner = Scanner::new(ScanOptions {
        exclude_patterns: vec!["*.log".to_string()],
        ..ScanOptions::default()
    })
    .unwrap();
    let report = scanner.scan(root, &CancellationToken::new()).await.unwrap();

    assert!(report.node("target").is_none());
    assert!(report.node("build.log").is_none());
    assert!(report.summary.excluded >= 2);
    assert_eq!(report.summary.manifests, vec!["Cargo.toml".to_string()]);
}

#[tokio::test]
async fn test_missing_root_is_path_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let scanner = Scanner::new(ScanOptions::default()).unwrap();
    let err = scanner
        .scan(&dir.path().join("nope"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::PathNotFound(_)));
}

#[tokio::test]
async fn test_selection_ranks_by_cost() {
    let mut registry = AgentRegistry::new(HealthPolicy::default());
    for (id, cost) in [("slow", 5), ("fast", 1)] {
        registry
            .register(
                AgentDescriptor::new(id).with_capability("code").with_cost(cost),
                ScriptedAgent::new(Script::Succeed) as Arc<dyn AgentClient>,
            )
            .unwrap();
    }
    let selector = AgentSelector::new(Arc::new(registry));

    let ranked = selector.select_agents(&caps(&["code"]), &caps(&[])).await;
    let ids: Vec<&str> = ranked.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["fast", "slow"]);

    assert!(selector.select_agents(&caps(&["docs"]), &caps(&[])).await.is_empty());
}

#[tokio::test]
async fn test_recipe_follows_scan_signals() {
    let dir = project();
    let scanner = Scanner::new(ScanOptions::default()).unwrap();
    let report = scanner.scan(dir.path(), &CancellationToken::new()).await.unwrap();
    let selector = RecipeSelector::builtin().unwrap();

    assert_eq!(selector.select_recipe("Explain the guide", &report).name, "documentation");
    assert_eq!(selector.select_recipe("Tidy things", &report).name, "generic");
}
