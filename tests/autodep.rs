use std::fs;
use std::path::{Path, PathBuf};

use autobuild::autodep::{Strategy, check_available};
use autobuild::config::EngineConfig;
use autobuild::engine::{BuildReport, Engine};
use autobuild::graph::{DepKind, PersistenceMode};
use autobuild::interface::CancelToken;
use autobuild::rule::{Rule, RuleBuilder, RuleSet};
use autobuild::state::OutcomeCounts;
use autobuild::tmp::TmpMode;

// `cargo test --workspace` leaves the library next to the test binaries
fn interposer() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let profile = exe.parent()?.parent()?;
    [profile.join("libautobuild_interpose.so"), profile.join("deps/libautobuild_interpose.so")]
        .into_iter()
        .find(|path| path.exists())
}

// the capturing strategies that work on this host
fn strategies() -> Vec<(Strategy, Option<PathBuf>)> {
    let library = interposer();
    let mut usable = Vec::new();
    for strategy in [Strategy::Trace, Strategy::Audit, Strategy::Preload] {
        match check_available(strategy, library.as_deref()) {
            Ok(()) => usable.push((strategy, library.clone())),
            Err(e) => eprintln!("skipping {}: {}", strategy, e),
        }
    }
    usable
}

fn setup(strategy: Strategy, library: Option<&Path>, rules: Vec<Rule>) -> (tempfile::TempDir, PathBuf, Engine) {
    // away from /tmp, which some jobs use as their view
    let dir = tempfile::tempdir_in(env!("CARGO_TARGET_TMPDIR")).unwrap();
    let root = dir.path().canonicalize().unwrap();
    let mut config = EngineConfig::new(&root).unwrap();
    config.autodep = strategy;
    config.interposer = library.map(Path::to_path_buf);
    config.runtime = Some(PathBuf::from(env!("CARGO_BIN_EXE_autobuild")));
    let engine = Engine::new(config, RuleSet::new(rules).unwrap(), PersistenceMode::InMemory).unwrap();
    (dir, root, engine)
}

async fn make(engine: &Engine, target: &str) -> BuildReport {
    engine.make(&[target.to_string()], CancelToken::new()).await
}

fn dep_kind(engine: &Engine, job: &str, path: &str) -> Option<DepKind> {
    let record = engine.graph().job(job).unwrap()?;
    record.deps.iter().find(|d| d.path == path).map(|d| d.kind)
}

fn copy_rule() -> Rule {
    RuleBuilder::new("copy").target("{File:.*}.cpy").shell("cat {File}").build().unwrap()
}

#[tokio::test]
async fn shell_reads_are_discovered() {
    for (strategy, library) in strategies() {
        let (_dir, root, engine) = setup(strategy, library.as_deref(), vec![copy_rule()]);
        fs::write(root.join("src.txt"), "one").unwrap();

        let report = make(&engine, "src.txt.cpy").await;
        assert!(report.ok(), "{}: {:?}", strategy, report.targets);
        assert_eq!(dep_kind(&engine, "src.txt.cpy", "src.txt"), Some(DepKind::Discovered), "{}", strategy);
        assert_eq!(make(&engine, "src.txt.cpy").await.counts, OutcomeCounts::default(), "{}", strategy);

        fs::write(root.join("src.txt"), "two").unwrap();
        let report = make(&engine, "src.txt.cpy").await;
        assert_eq!(report.counts, OutcomeCounts { done: 1, ..Default::default() }, "{}", strategy);
        assert_eq!(fs::read_to_string(root.join("src.txt.cpy")).unwrap(), "two");
    }
}

#[tokio::test]
async fn declared_missing_paths_survive_capture() {
    for (strategy, library) in strategies() {
        let rule = RuleBuilder::new("declare")
            .target("declare.txt")
            .shell("\"$AUTOBUILD\" depend absent.conf && echo yes")
            .build()
            .unwrap();
        let (_dir, root, engine) = setup(strategy, library.as_deref(), vec![rule]);

        let report = make(&engine, "declare.txt").await;
        assert!(report.ok(), "{}: {:?}", strategy, report.targets);
        assert_eq!(dep_kind(&engine, "declare.txt", "absent.conf"), Some(DepKind::Explicit), "{}", strategy);
        assert_eq!(make(&engine, "declare.txt").await.counts, OutcomeCounts::default(), "{}", strategy);

        fs::write(root.join("absent.conf"), "here now").unwrap();
        assert_eq!(make(&engine, "declare.txt").await.counts.steady, 1, "{}", strategy);
    }
}

#[tokio::test]
async fn grandchildren_are_followed() {
    for (strategy, library) in strategies() {
        let rule = RuleBuilder::new("deep")
            .target("deep.out")
            .shell("sh -c 'sh -c \"cat deep.txt\"'")
            .build()
            .unwrap();
        let (_dir, root, engine) = setup(strategy, library.as_deref(), vec![rule]);
        fs::write(root.join("deep.txt"), "nested").unwrap();

        let report = make(&engine, "deep.out").await;
        assert!(report.ok(), "{}: {:?}", strategy, report.targets);
        assert_eq!(fs::read_to_string(root.join("deep.out")).unwrap(), "nested");
        assert_eq!(dep_kind(&engine, "deep.out", "deep.txt"), Some(DepKind::Discovered), "{}", strategy);
    }
}

// The job sees /tmp as its own scratch directory, with links crossing from
// the repository into the view and back.
#[tokio::test]
async fn links_between_repository_and_view_resolve_in_scratch() {
    for (strategy, library) in strategies() {
        if !strategy.supports_view() {
            continue;
        }
        let rule = RuleBuilder::new("alias")
            .stem("N", "[0-9]")
            .target("dut{N}")
            .side_target("LNK", "lnk{N}")
            .tmp(TmpMode::View(PathBuf::from("/tmp")))
            .shell(
                "ln -s /tmp/a {LNK}\n\
                 ln -s \"$ROOT_DIR/{LNK}\" /tmp/b\n\
                 cd \"$TMPDIR\"\n\
                 echo \"$TMPDIR\"\n\
                 echo {N} > a\n\
                 cat a\n\
                 cd \"$ROOT_DIR\"\n\
                 cat {LNK}\n\
                 cat /tmp/b",
            )
            .build()
            .unwrap();
        let (_dir, root, engine) = setup(strategy, library.as_deref(), vec![rule]);
        if root.starts_with("/tmp") {
            eprintln!("skipping the /tmp view, the repository lives there");
            return;
        }

        let report = make(&engine, "dut1").await;
        assert!(report.ok(), "{}: {:?}", strategy, report.targets);
        assert_eq!(fs::read_to_string(root.join("dut1")).unwrap(), "/tmp\n1\n1\n1\n", "{}", strategy);
        assert_eq!(fs::read_link(root.join("lnk1")).unwrap(), PathBuf::from("/tmp/a"));
        // nothing in the view is a dependency
        let record = engine.graph().job("dut1").unwrap().unwrap();
        assert!(record.deps.iter().all(|d| !d.path.starts_with("/tmp")), "{:?}", record.deps);
        assert_eq!(make(&engine, "dut1").await.counts, OutcomeCounts::default(), "{}", strategy);
    }
}

#[tokio::test]
async fn reading_an_unbuilt_target_may_rerun() {
    for (strategy, library) in strategies() {
        let hello = RuleBuilder::new("hello").target("hello").shell("echo hello").build().unwrap();
        let (_dir, root, engine) = setup(strategy, library.as_deref(), vec![hello, copy_rule()]);

        // cat fails on the missing file, then succeeds once hello is built
        let report = make(&engine, "hello.cpy").await;
        assert!(report.ok(), "{}: {:?}", strategy, report.targets);
        assert_eq!(
            report.counts,
            OutcomeCounts { new: 2, done: 2, may_rerun: 1, ..Default::default() },
            "{}",
            strategy
        );
        assert_eq!(fs::read_to_string(root.join("hello.cpy")).unwrap(), "hello\n");
        assert_eq!(make(&engine, "hello.cpy").await.counts, OutcomeCounts::default(), "{}", strategy);
    }
}
