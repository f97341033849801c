use std::fs;
use std::time::Duration;

use autobuild::config::EngineConfig;
use autobuild::engine::Engine;
use autobuild::error::EngineError;
use autobuild::graph::{PersistenceMode, RecordState};
use autobuild::interface::{BuildInterface, CancelToken};
use autobuild::rule::{Rule, RuleBuilder, RuleSet};
use autobuild::state::OutcomeCounts;

fn interface(rules: Vec<Rule>) -> (tempfile::TempDir, BuildInterface) {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::new(dir.path()).unwrap();
    let engine = Engine::new(config, RuleSet::new(rules).unwrap(), PersistenceMode::InMemory).unwrap();
    (dir, BuildInterface::new(engine))
}

fn sleeper() -> Rule {
    RuleBuilder::new("sleeper").target("{Name:.*}.slow").shell("sleep 30").build().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_a_build_stops_its_jobs() {
    let (_dir, interface) = interface(vec![sleeper()]);
    let handle = interface.submit(vec!["a.slow".to_string()]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(interface.cancel(handle.id));
    let report = handle.join().await.unwrap();
    assert!(matches!(report.error("a.slow"), Some(EngineError::Cancelled { .. })));
    assert_eq!(report.counts, OutcomeCounts { failed: 1, ..Default::default() });
    let record = interface.engine().graph().job("a.slow").unwrap().unwrap();
    assert_eq!(record.state, RecordState::Error);
    assert!(record.deps.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_does_not_wait_for_the_command() {
    let (_dir, interface) = interface(vec![sleeper()]);
    let handle = interface.submit(vec!["b.slow".to_string()]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.cancel();
    let started = std::time::Instant::now();
    let report = handle.join().await.unwrap();
    assert!(!report.ok());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_builds_cannot_be_cancelled() {
    let rule = RuleBuilder::new("quick").target("quick.txt").shell("echo quick").build().unwrap();
    let (dir, interface) = interface(vec![rule]);
    let handle = interface.submit(vec!["quick.txt".to_string()]);
    let id = handle.id;
    let report = handle.join().await.unwrap();
    assert!(report.ok(), "{:?}", report.targets);
    assert!(!interface.cancel(id));
    assert_eq!(fs::read_to_string(dir.path().join("quick.txt")).unwrap(), "quick\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_all_reaches_every_build() {
    let (_dir, interface) = interface(vec![sleeper()]);
    let first = interface.submit(vec!["one.slow".to_string()]);
    let second = interface.submit(vec!["two.slow".to_string()]);
    assert_ne!(first.id, second.id);
    tokio::time::sleep(Duration::from_millis(200)).await;
    interface.cancel_all();
    let first = first.join().await.unwrap();
    let second = second.join().await.unwrap();
    assert!(matches!(first.error("one.slow"), Some(EngineError::Cancelled { .. })));
    assert!(matches!(second.error("two.slow"), Some(EngineError::Cancelled { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn jobs_past_their_timeout_are_cancelled() {
    let rule = RuleBuilder::new("bounded")
        .target("bounded.txt")
        .timeout(Duration::from_millis(200))
        .shell("sleep 30")
        .build()
        .unwrap();
    let (_dir, interface) = interface(vec![rule]);
    let handle = interface.submit(vec!["bounded.txt".to_string()]);
    let report = handle.join().await.unwrap();
    match report.error("bounded.txt") {
        Some(EngineError::Cancelled { reason, .. }) => assert!(reason.contains("timed out"), "{}", reason),
        other => panic!("expected a timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn cancelled_tokens_cancel_their_children() {
    let parent = CancelToken::new();
    let child = parent.child();
    let grandchild = child.child();
    let sibling = parent.child();
    child.cancel();
    assert!(child.is_cancelled());
    assert!(grandchild.is_cancelled());
    assert!(!parent.is_cancelled());
    assert!(!sibling.is_cancelled());

    parent.cancel();
    assert!(sibling.is_cancelled());
    // a child of a cancelled token starts cancelled
    assert!(parent.child().is_cancelled());
    tokio::time::timeout(Duration::from_secs(1), sibling.cancelled()).await.unwrap();
}

#[tokio::test]
async fn a_cancelled_build_runs_nothing() {
    let rule = RuleBuilder::new("never").target("never.txt").shell("echo ran").build().unwrap();
    let (dir, interface) = interface(vec![rule]);
    let cancel = CancelToken::new();
    cancel.cancel();
    let report = interface.engine().make(&["never.txt".to_string()], cancel).await;
    assert!(matches!(report.error("never.txt"), Some(EngineError::Cancelled { .. })));
    assert!(!dir.path().join("never.txt").exists());
}
