use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use autobuild::config::EngineConfig;
use autobuild::engine::Engine;
use autobuild::error::EngineError;
use autobuild::graph::{PersistenceMode, RecordState};
use autobuild::interface::CancelToken;
use autobuild::rule::{Rule, RuleBuilder, RuleSet};
use autobuild::state::{JobState, OutcomeCounts};

fn setup(rules: Vec<Rule>) -> (tempfile::TempDir, PathBuf, Engine) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let config = EngineConfig::new(&root).unwrap();
    let engine = Engine::new(config, RuleSet::new(rules).unwrap(), PersistenceMode::InMemory).unwrap();
    (dir, root, engine)
}

async fn make(engine: &Engine, targets: &[&str]) -> autobuild::engine::BuildReport {
    let targets: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
    engine.make(&targets, CancelToken::new()).await
}

fn upper_rule() -> Rule {
    RuleBuilder::new("upper")
        .target("{File:.*}.upper")
        .dep("SRC", "{File}.txt")
        .shell("tr a-z A-Z < {SRC}")
        .build()
        .unwrap()
}

#[tokio::test]
async fn first_build_is_new_and_second_is_a_no_op() {
    let (_dir, root, engine) = setup(vec![upper_rule()]);
    fs::write(root.join("hello.txt"), "hello\n").unwrap();

    let report = make(&engine, &["hello.upper"]).await;
    assert!(report.ok(), "{:?}", report.targets);
    assert_eq!(report.state("hello.upper"), Some(JobState::New));
    assert_eq!(report.counts, OutcomeCounts { new: 1, done: 1, ..Default::default() });
    assert_eq!(fs::read_to_string(root.join("hello.upper")).unwrap(), "HELLO\n");

    let report = make(&engine, &["hello.upper"]).await;
    assert_eq!(report.state("hello.upper"), Some(JobState::Done));
    assert_eq!(report.counts, OutcomeCounts::default());
}

#[tokio::test]
async fn changed_dependency_executes_again() {
    let (_dir, root, engine) = setup(vec![upper_rule()]);
    fs::write(root.join("hello.txt"), "hello\n").unwrap();
    make(&engine, &["hello.upper"]).await;

    fs::write(root.join("hello.txt"), "world\n").unwrap();
    let report = make(&engine, &["hello.upper"]).await;
    assert_eq!(report.state("hello.upper"), Some(JobState::Done));
    assert_eq!(report.counts, OutcomeCounts { done: 1, ..Default::default() });
    assert_eq!(fs::read_to_string(root.join("hello.upper")).unwrap(), "WORLD\n");
}

#[tokio::test]
async fn modified_target_executes_again() {
    let (_dir, root, engine) = setup(vec![upper_rule()]);
    fs::write(root.join("hello.txt"), "hello\n").unwrap();
    make(&engine, &["hello.upper"]).await;

    fs::write(root.join("hello.upper"), "tampered").unwrap();
    let report = make(&engine, &["hello.upper"]).await;
    assert_eq!(report.counts, OutcomeCounts { done: 1, ..Default::default() });
    assert_eq!(fs::read_to_string(root.join("hello.upper")).unwrap(), "HELLO\n");
}

#[tokio::test]
async fn same_output_is_steady() {
    let rule = RuleBuilder::new("constant")
        .target("out.txt")
        .callback("constant", |ctx| {
            ctx.read("input.txt")?;
            let target = ctx.target("TARGET")?.to_string();
            ctx.write(target, "always the same")
        })
        .build()
        .unwrap();
    let (_dir, root, engine) = setup(vec![rule]);
    fs::write(root.join("input.txt"), "one").unwrap();
    assert_eq!(make(&engine, &["out.txt"]).await.state("out.txt"), Some(JobState::New));

    fs::write(root.join("input.txt"), "two").unwrap();
    let report = make(&engine, &["out.txt"]).await;
    assert_eq!(report.state("out.txt"), Some(JobState::Steady));
    assert_eq!(report.counts, OutcomeCounts { steady: 1, ..Default::default() });
    let record = engine.graph().job("out.txt").unwrap().unwrap();
    assert_eq!(record.state, RecordState::Steady);
}

#[tokio::test]
async fn every_new_job_is_counted() {
    let rule = RuleBuilder::new("numbers")
        .target("{N:[0-9]+}.num")
        .callback("numbers", |ctx| {
            let n = ctx.stem("N")?.to_string();
            let target = ctx.target("TARGET")?.to_string();
            ctx.write(target, n)
        })
        .build()
        .unwrap();
    let (_dir, root, engine) = setup(vec![rule]);
    let report = make(&engine, &["1.num", "2.num", "3.num"]).await;
    assert_eq!(report.counts, OutcomeCounts { new: 3, done: 3, ..Default::default() });
    assert_eq!(fs::read_to_string(root.join("2.num")).unwrap(), "2");
}

#[tokio::test]
async fn undeclared_buildable_dependency_may_rerun() {
    let generator = RuleBuilder::new("generator")
        .target("gen.txt")
        .callback("generator", |ctx| ctx.write("gen.txt", "generated"))
        .build()
        .unwrap();
    let consumer = RuleBuilder::new("consumer")
        .target("out.txt")
        .callback("consumer", |ctx| {
            let text = if ctx.exists("gen.txt") { ctx.read_to_string("gen.txt")? } else { String::new() };
            ctx.write("out.txt", format!("got {}", text))
        })
        .build()
        .unwrap();
    let (_dir, root, engine) = setup(vec![generator, consumer]);

    let report = make(&engine, &["out.txt"]).await;
    assert!(report.ok(), "{:?}", report.targets);
    assert_eq!(report.counts, OutcomeCounts { new: 2, done: 2, may_rerun: 1, ..Default::default() });
    assert_eq!(fs::read_to_string(root.join("out.txt")).unwrap(), "got generated");

    let report = make(&engine, &["out.txt"]).await;
    assert_eq!(report.counts, OutcomeCounts::default());
}

#[tokio::test]
async fn dependency_modified_while_running_is_unstable() {
    let rule = RuleBuilder::new("restless")
        .target("out.txt")
        .callback("restless", |ctx| {
            // something else keeps rewriting the input
            std::thread::sleep(Duration::from_millis(50));
            fs::write(ctx.root_dir().join("input.txt"), "rewritten")?;
            let text = ctx.read_to_string("input.txt")?;
            ctx.write("out.txt", text)
        })
        .build()
        .unwrap();
    let (_dir, root, engine) = setup(vec![rule]);
    fs::write(root.join("input.txt"), "initial").unwrap();

    let report = make(&engine, &["out.txt"]).await;
    assert_eq!(report.state("out.txt"), Some(JobState::Error));
    assert!(matches!(report.error("out.txt"), Some(EngineError::Instability { .. })));
    assert_eq!(report.counts, OutcomeCounts { may_rerun: 1, rerun: 1, ..Default::default() });
    let record = engine.graph().job("out.txt").unwrap().unwrap();
    assert_eq!(record.state, RecordState::Error);
}

#[tokio::test]
async fn dependency_cycles_are_reported() {
    let a = RuleBuilder::new("a")
        .target("a.txt")
        .dep("B", "b.txt")
        .callback("a", |ctx| ctx.write("a.txt", "a"))
        .build()
        .unwrap();
    let b = RuleBuilder::new("b")
        .target("b.txt")
        .dep("A", "a.txt")
        .callback("b", |ctx| ctx.write("b.txt", "b"))
        .build()
        .unwrap();
    let (_dir, root, engine) = setup(vec![a, b]);
    let report = make(&engine, &["a.txt"]).await;
    match report.error("a.txt") {
        Some(EngineError::Cycle { path, .. }) => assert_eq!(path, &vec!["a.txt", "b.txt", "a.txt"]),
        other => panic!("expected a cycle, got {:?}", other),
    }
    assert!(!root.join("a.txt").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_on_a_cycle_do_not_wait_forever() {
    let slow = |name: &'static str| {
        move |ctx: &mut autobuild::context::JobContext| {
            std::thread::sleep(Duration::from_millis(20));
            ctx.write(format!("{}.txt", name), name)
        }
    };
    let a = RuleBuilder::new("a").target("a.txt").dep("B", "b.txt").callback("a", slow("a")).build().unwrap();
    let b = RuleBuilder::new("b").target("b.txt").dep("A", "a.txt").callback("b", slow("b")).build().unwrap();
    let c = RuleBuilder::new("c").target("c.txt").callback("c", slow("c")).build().unwrap();
    let (_dir, root, engine) = setup(vec![a, b, c]);
    for _ in 0..10 {
        let report = tokio::time::timeout(Duration::from_secs(10), make(&engine, &["a.txt", "b.txt", "c.txt"]))
            .await
            .expect("cyclic requests finished");
        for target in ["a.txt", "b.txt"] {
            match report.error(target) {
                Some(EngineError::Cycle { path, .. }) => {
                    assert_eq!(path.first(), path.last());
                    assert!(path.len() >= 3, "{:?}", path);
                }
                other => panic!("expected a cycle for {}, got {:?}", target, other),
            }
        }
        assert_eq!(report.error("b.txt").map(|e| e.kind()), Some("cycle"));
        // the rest of the build is unaffected
        assert!(report.error("c.txt").is_none());
        assert!(root.join("c.txt").exists());
        assert!(!root.join("a.txt").exists());
    }
}

#[tokio::test]
async fn failing_command_is_an_error_and_retried() {
    let rule = RuleBuilder::new("fails")
        .target("out.txt")
        .shell("echo broken >&2; exit 3")
        .build()
        .unwrap();
    let (_dir, _root, engine) = setup(vec![rule]);
    let report = make(&engine, &["out.txt"]).await;
    match report.error("out.txt") {
        Some(EngineError::Execution { reason, .. }) => {
            assert!(reason.contains("exit code 3"), "{}", reason);
            assert!(reason.contains("broken"), "{}", reason);
        }
        other => panic!("expected an execution error, got {:?}", other),
    }
    assert_eq!(report.counts, OutcomeCounts { failed: 1, ..Default::default() });
    let record = engine.graph().job("out.txt").unwrap().unwrap();
    assert_eq!(record.state, RecordState::Error);
    assert!(record.deps.is_empty());

    // errors are never trusted
    let report = make(&engine, &["out.txt"]).await;
    assert_eq!(report.counts, OutcomeCounts { failed: 1, ..Default::default() });
}

#[tokio::test]
async fn missing_target_is_an_error() {
    let rule = RuleBuilder::new("lazy")
        .target("out.txt")
        .callback("lazy", |ctx| {
            ctx.print("nothing written");
            Ok(())
        })
        .build()
        .unwrap();
    let (_dir, _root, engine) = setup(vec![rule]);
    let report = make(&engine, &["out.txt"]).await;
    match report.error("out.txt") {
        Some(EngineError::Execution { reason, .. }) => assert!(reason.contains("did not produce out.txt")),
        other => panic!("expected an execution error, got {:?}", other),
    }
}

#[tokio::test]
async fn missing_source_fails_the_dependent() {
    let rule = RuleBuilder::new("copy")
        .target("copy.txt")
        .dep("SRC", "nowhere.txt")
        .shell("cat {SRC}")
        .build()
        .unwrap();
    let (_dir, _root, engine) = setup(vec![rule]);
    let report = make(&engine, &["copy.txt", "unknown.bin"]).await;
    assert!(matches!(report.error("copy.txt"), Some(EngineError::Dependency { dep, .. }) if dep == "nowhere.txt"));
    assert!(matches!(report.error("unknown.bin"), Some(EngineError::NoRule(_))));
    assert!(!report.ok());
}

#[tokio::test]
async fn targets_of_one_job_execute_once() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let rule = RuleBuilder::new("pair")
        .targets("A", "{X:.*}.a")
        .targets("B", "{X}.b")
        .callback("pair", move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            let (a, b) = (ctx.target("A")?.to_string(), ctx.target("B")?.to_string());
            ctx.write(a, "a")?;
            ctx.write(b, "b")
        })
        .build()
        .unwrap();
    let (_dir, root, engine) = setup(vec![rule]);
    let report = make(&engine, &["x.a", "x.b"]).await;
    assert!(report.ok());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(report.counts, OutcomeCounts { new: 1, done: 1, ..Default::default() });
    assert!(root.join("x.b").exists());
    assert_eq!(engine.graph().producer("x.b").unwrap().as_deref(), Some("x.a"));
}

#[tokio::test]
async fn writing_another_rules_target_is_an_error() {
    let other = RuleBuilder::new("other")
        .target("other.txt")
        .callback("other", |ctx| ctx.write("other.txt", "mine"))
        .build()
        .unwrap();
    let intruder = RuleBuilder::new("intruder")
        .target("out.txt")
        .callback("intruder", |ctx| {
            ctx.write("other.txt", "not yours")?;
            ctx.write("out.txt", "out")
        })
        .build()
        .unwrap();
    let (_dir, _root, engine) = setup(vec![other, intruder]);
    let report = make(&engine, &["out.txt"]).await;
    match report.error("out.txt") {
        Some(EngineError::Execution { reason, .. }) => assert!(reason.contains("other.txt"), "{}", reason),
        other => panic!("expected an execution error, got {:?}", other),
    }
}

#[tokio::test]
async fn job_written_target_is_not_replaced_by_stdout() {
    let rule = RuleBuilder::new("direct")
        .target("{Name:.*}.out")
        .shell("echo noise; echo content > {TARGET}")
        .build()
        .unwrap();
    let (_dir, root, engine) = setup(vec![rule]);
    let report = make(&engine, &["x.out"]).await;
    assert!(report.ok(), "{:?}", report.targets);
    assert_eq!(fs::read_to_string(root.join("x.out")).unwrap(), "content\n");
}

#[tokio::test]
async fn absolute_requests_name_the_same_job() {
    let (_dir, root, engine) = setup(vec![upper_rule()]);
    fs::write(root.join("a.txt"), "a").unwrap();
    let absolute = root.join("a.upper");
    let report = make(&engine, &[absolute.to_str().unwrap(), "a.upper"]).await;
    assert!(report.ok());
    assert_eq!(report.counts.new, 1);
    assert!(absolute.exists());
}
