use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use autobuild::backend::{LocalExecutor, Worker};
use autobuild::config::{BackendConfig, EngineConfig};
use autobuild::context::JobContext;
use autobuild::engine::Engine;
use autobuild::error::EngineError;
use autobuild::graph::{PersistenceMode, RecordState};
use autobuild::interface::{BuildInterface, CancelToken};
use autobuild::rule::{CallbackRegistry, Rule, RuleBuilder, RuleSet};
use autobuild::state::OutcomeCounts;

struct Cluster {
    _dir: tempfile::TempDir,
    root: PathBuf,
    spool: PathBuf,
    engine: Engine,
}

fn cluster(rules: Vec<Rule>, spool_exists: bool, submit_retries: u32) -> Cluster {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap().join("repo");
    fs::create_dir(&root).unwrap();
    let spool = dir.path().canonicalize().unwrap().join("spool");
    if spool_exists {
        fs::create_dir(&spool).unwrap();
    }
    let mut config = EngineConfig::new(&root).unwrap();
    config.backends.insert(
        "cluster".into(),
        BackendConfig::Spool { spool: spool.clone(), poll_ms: 10, submit_retries, retry_backoff_ms: 20 },
    );
    let engine = Engine::new(config, RuleSet::new(rules).unwrap(), PersistenceMode::InMemory).unwrap();
    Cluster { _dir: dir, root, spool, engine }
}

// a worker on "another host", sharing the repository and the spool
fn start_worker(cluster: &Cluster, callbacks: CallbackRegistry) -> CancelToken {
    let executor = LocalExecutor::new(&cluster.engine.config().tmp_root(), None, None, callbacks).unwrap();
    let worker = Worker::new(&cluster.spool, executor, Duration::from_millis(10)).unwrap();
    let shutdown = CancelToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move { worker.run(stop).await });
    shutdown
}

fn queued(spool: &Path) -> usize {
    fs::read_dir(spool.join("queue")).map(|entries| entries.count()).unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread")]
async fn shell_jobs_run_on_a_worker() {
    let rule = RuleBuilder::new("remote")
        .target("{Name:.*}.remote")
        .dep("SRC", "{Name}.txt")
        .backend("cluster")
        .shell("tr a-z A-Z < {SRC}")
        .build()
        .unwrap();
    let cluster = cluster(vec![rule], true, 3);
    let shutdown = start_worker(&cluster, CallbackRegistry::new());
    fs::write(cluster.root.join("job.txt"), "far away\n").unwrap();

    let report = cluster.engine.make(&["job.remote".to_string()], CancelToken::new()).await;
    shutdown.cancel();
    assert!(report.ok(), "{:?}", report.targets);
    assert_eq!(report.counts, OutcomeCounts { new: 1, done: 1, ..Default::default() });
    assert_eq!(fs::read_to_string(cluster.root.join("job.remote")).unwrap(), "FAR AWAY\n");
    assert_eq!(queued(&cluster.spool), 0);
}

fn double(ctx: &mut JobContext) -> autobuild::error::Result<()> {
    let input = ctx.read_to_string("in.txt")?;
    ctx.write("out.txt", input.repeat(2))
}

#[tokio::test(flavor = "multi_thread")]
async fn callbacks_run_on_a_worker_that_knows_them() {
    let rule = RuleBuilder::new("remote")
        .target("out.txt")
        .backend("cluster")
        .callback("double", double)
        .build()
        .unwrap();
    let mut callbacks = CallbackRegistry::new();
    callbacks.register("double", Arc::new(double));
    let cluster = cluster(vec![rule], true, 3);
    let shutdown = start_worker(&cluster, callbacks);
    fs::write(cluster.root.join("in.txt"), "ab").unwrap();

    let report = cluster.engine.make(&["out.txt".to_string()], CancelToken::new()).await;
    shutdown.cancel();
    assert!(report.ok(), "{:?}", report.targets);
    assert_eq!(fs::read_to_string(cluster.root.join("out.txt")).unwrap(), "abab");
    // accesses made on the worker come back as dependencies
    let record = cluster.engine.graph().job("out.txt").unwrap().unwrap();
    assert_eq!(record.deps.len(), 1);
    assert_eq!(record.deps[0].path, "in.txt");
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_failures_come_back_as_job_errors() {
    let rule = RuleBuilder::new("remote")
        .target("out.txt")
        .backend("cluster")
        .callback("unknown_to_the_worker", |ctx| ctx.write("out.txt", "x"))
        .build()
        .unwrap();
    let cluster = cluster(vec![rule], true, 3);
    let shutdown = start_worker(&cluster, CallbackRegistry::new());
    let report = cluster.engine.make(&["out.txt".to_string()], CancelToken::new()).await;
    shutdown.cancel();
    match report.error("out.txt") {
        Some(EngineError::Execution { reason, .. }) => assert!(reason.contains("unknown callback"), "{}", reason),
        other => panic!("expected an execution error, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_spool_fails_fast() {
    let rule = RuleBuilder::new("remote")
        .target("out.txt")
        .backend("cluster")
        .shell("echo never")
        .build()
        .unwrap();
    let cluster = cluster(vec![rule], false, 3);
    let report = cluster.engine.make(&["out.txt".to_string()], CancelToken::new()).await;
    assert!(matches!(report.error("out.txt"), Some(EngineError::BackendUnavailable { .. })));
    assert_eq!(report.counts, OutcomeCounts { failed: 1, ..Default::default() });
    assert!(!cluster.root.join("out.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_submission_failures_are_retried() {
    let rule = RuleBuilder::new("remote")
        .target("out.txt")
        .backend("cluster")
        .shell("echo eventually")
        .build()
        .unwrap();
    // the spool exists but its queue does not, until the worker comes up
    let cluster = cluster(vec![rule], true, 6);
    let executor = LocalExecutor::new(&cluster.engine.config().tmp_root(), None, None, CallbackRegistry::new()).unwrap();
    let spool = cluster.spool.clone();
    let shutdown = CancelToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        let worker = Worker::new(&spool, executor, Duration::from_millis(10)).unwrap();
        worker.run(stop).await
    });
    let report = cluster.engine.make(&["out.txt".to_string()], CancelToken::new()).await;
    shutdown.cancel();
    assert!(report.ok(), "{:?}", report.targets);
    assert_eq!(fs::read_to_string(cluster.root.join("out.txt")).unwrap(), "eventually\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn persistent_submission_failures_make_the_backend_unavailable() {
    let rule = RuleBuilder::new("remote")
        .target("out.txt")
        .backend("cluster")
        .shell("echo never")
        .build()
        .unwrap();
    let cluster = cluster(vec![rule], true, 1);
    let report = cluster.engine.make(&["out.txt".to_string()], CancelToken::new()).await;
    match report.error("out.txt") {
        Some(EngineError::BackendUnavailable { reason, .. }) => assert!(reason.contains("2 attempts"), "{}", reason),
        other => panic!("expected an unavailable backend, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_remote_job_leaves_an_error_record() {
    let rule = RuleBuilder::new("remote")
        .target("slow.txt")
        .backend("cluster")
        .shell("sleep 30")
        .build()
        .unwrap();
    let cluster = cluster(vec![rule], true, 3);
    fs::create_dir_all(cluster.spool.join("queue")).unwrap();
    fs::create_dir_all(cluster.spool.join("cancel")).unwrap();
    let spool = cluster.spool.clone();
    let interface = BuildInterface::new(cluster.engine.clone());

    // no worker: the job waits in the queue until cancelled
    let handle = interface.submit(vec!["slow.txt".to_string()]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queued(&spool), 1);
    handle.cancel();
    let report = handle.join().await.unwrap();

    assert!(matches!(report.error("slow.txt"), Some(EngineError::Cancelled { .. })));
    assert_eq!(report.counts, OutcomeCounts { failed: 1, ..Default::default() });
    let record = interface.engine().graph().job("slow.txt").unwrap().unwrap();
    assert_eq!(record.state, RecordState::Error);
    assert!(record.deps.is_empty());
    assert!(record.reason.as_deref().unwrap_or_default().contains("cancelled"));
    assert_eq!(queued(&spool), 0);
    // withdrawn before any worker saw it, so no worker is asked to kill it
    assert_eq!(fs::read_dir(spool.join("cancel")).unwrap().count(), 0);
}
