use autobuild::config::EngineConfig;
use autobuild::error::EngineError;
use autobuild::pattern::{Pattern, Stems, substitute};
use autobuild::rule::{RuleBase, RuleBuilder, RuleSet};

fn noop(name: &str, target: &str) -> RuleBuilder {
    RuleBuilder::new(name).target(target).shell("true")
}

#[test]
fn longest_fixed_prefix_wins() {
    let rules = RuleSet::new(vec![
        noop("any", "{File:.*}.o").build().unwrap(),
        noop("obj", "obj/{File:.*}.o").build().unwrap(),
    ])
    .unwrap();
    let found = rules.match_target("obj/main.o").expect("match");
    assert_eq!(found.rule.name(), "obj");
    assert_eq!(found.stems.get("File").map(String::as_str), Some("main"));
    let found = rules.match_target("src/main.o").expect("match");
    assert_eq!(found.rule.name(), "any");
    assert_eq!(found.stems.get("File").map(String::as_str), Some("src/main"));
}

#[test]
fn priority_beats_specificity() {
    let rules = RuleSet::new(vec![
        noop("obj", "obj/{File:.*}.o").build().unwrap(),
        noop("any", "{File:.*}.o").priority(5).build().unwrap(),
    ])
    .unwrap();
    assert_eq!(rules.match_target("obj/main.o").unwrap().rule.name(), "any");
}

#[test]
fn identical_patterns_are_ambiguous() {
    let rules = RuleSet::new(vec![
        noop("first", "{File:.*}.o").build().unwrap(),
        noop("second", "{Name:.*}.o").build().unwrap(),
    ]);
    assert!(matches!(rules, Err(EngineError::Config(_))));
    // a different priority tells them apart
    let rules = RuleSet::new(vec![
        noop("first", "{File:.*}.o").build().unwrap(),
        noop("second", "{Name:.*}.o").priority(1).build().unwrap(),
    ]);
    assert!(rules.is_ok());
}

#[test]
fn overlapping_patterns_are_ambiguous() {
    // "x-y.c-z" matches both, with nothing to rank one over the other
    let rules = RuleSet::new(vec![
        noop("dash", "{A:.*}-{B:.*}.c").build().unwrap(),
        noop("dot", "{X:.*}.c-{Y:.*}").build().unwrap(),
    ]);
    match rules {
        Err(EngineError::Config(message)) => assert!(message.contains("dash") && message.contains("dot"), "{}", message),
        other => panic!("expected an ambiguity error, got {:?}", other.map(|_| ())),
    }
    // same rank but no common path
    let rules = RuleSet::new(vec![
        noop("digits", "{N:[0-9]+}.num").build().unwrap(),
        noop("letters", "{W:[a-z]+}.num").build().unwrap(),
        noop("a", "a.txt").build().unwrap(),
        noop("b", "b.txt").build().unwrap(),
    ])
    .unwrap();
    assert_eq!(rules.match_target("42.num").unwrap().rule.name(), "digits");
    assert_eq!(rules.match_target("abc.num").unwrap().rule.name(), "letters");
    assert!(rules.match_target("4b.num").is_none());
}

#[test]
fn unmatched_paths_are_sources() {
    let rules = RuleSet::new(vec![noop("obj", "{File:.*}.o").build().unwrap()]).unwrap();
    assert!(rules.match_target("main.c").is_none());
    assert!(!rules.is_buildable("main.c"));
    assert!(rules.is_buildable("main.o"));
}

#[test]
fn repeated_stems_bind_the_same_value() {
    let rules = RuleSet::new(vec![noop("same", "{D:[a-z]+}/{D}.txt").build().unwrap()]).unwrap();
    assert!(rules.is_buildable("abc/abc.txt"));
    assert!(!rules.is_buildable("abc/xyz.txt"));
}

#[test]
fn star_stems_stay_out_of_the_job_identity() {
    let rule = RuleBuilder::new("archive")
        .targets("MAIN", "{File:.*}.tar")
        .targets("LOG", "{File}.{*:[0-9]+}.log")
        .shell("true")
        .build()
        .unwrap();
    let rules = RuleSet::new(vec![rule]).unwrap();
    let found = rules.match_target("pkg.3.log").expect("match");
    assert_eq!(found.job_name().unwrap(), "pkg.tar");
    assert!(found.rule.produces(&found.stems, "pkg.17.log"));
    assert!(!found.rule.produces(&found.stems, "other.17.log"));
    // the star target cannot be named in advance
    let targets = found.rule.static_targets(&found.stems).unwrap();
    assert_eq!(targets, vec![("MAIN".to_string(), "pkg.tar".to_string())]);
}

#[test]
fn side_targets_run_the_primary_job() {
    let rule = RuleBuilder::new("gen")
        .target("{Name:.*}.c")
        .side_target("HEADER", "{Name}.h")
        .shell("true")
        .build()
        .unwrap();
    let rules = RuleSet::new(vec![rule]).unwrap();
    let found = rules.match_target("parser.h").expect("match");
    assert_eq!(found.job_name().unwrap(), "parser.c");
    assert!(found.rule.stdout_to_target());
}

#[test]
fn static_dependencies_expand_stems() {
    let rule = RuleBuilder::new("compile")
        .stem("File", ".*")
        .target("{File}.o")
        .dep("SRC", "{File}.c")
        .dep("CONF", "build.conf")
        .shell("cc -c {SRC}")
        .build()
        .unwrap();
    let mut stems = Stems::new();
    stems.insert("File".into(), "lib/util".into());
    let deps = rule.static_deps(&stems).unwrap();
    assert_eq!(
        deps,
        vec![("SRC".to_string(), "lib/util.c".to_string()), ("CONF".to_string(), "build.conf".to_string())]
    );
    assert_eq!(rule.job_name(&stems).unwrap(), "lib/util.o");
}

#[test]
fn malformed_rules_are_rejected() {
    // stem without a definition
    assert!(noop("bad", "{File}.o").build().is_err());
    // dependency on a stem the target does not bind
    let built = RuleBuilder::new("bad")
        .target("{File:.*}.o")
        .dep("SRC", "{Other}.c")
        .shell("true")
        .build();
    assert!(matches!(built, Err(EngineError::Config(_))));
    // no command
    assert!(RuleBuilder::new("bad").target("x").build().is_err());
    // conflicting inline definitions
    let built = RuleBuilder::new("bad")
        .targets("A", "{File:[a-z]+}.a")
        .targets("B", "{File:[0-9]+}.b")
        .shell("true")
        .build();
    assert!(built.is_err());
}

#[test]
fn rule_fingerprint_follows_the_command() {
    let first = noop("gen", "out.txt").build().unwrap();
    let same = noop("gen", "out.txt").build().unwrap();
    let other = RuleBuilder::new("gen").target("out.txt").shell("false").build().unwrap();
    assert_eq!(first.fingerprint(), same.fingerprint());
    assert_ne!(first.fingerprint(), other.fingerprint());
}

#[test]
fn builder_settings_override_the_base() {
    let mut base = RuleBase::default();
    base.stems.insert("File".into(), ".*".into());
    base.priority = Some(3);
    base.deps.push(("CONF".into(), "base.conf".into()));
    let rule = RuleBuilder::new("compile")
        .dep("CONF", "own.conf")
        .base(&base)
        .target("{File}.o")
        .shell("true")
        .build()
        .unwrap();
    assert_eq!(rule.priority(), 3);
    let deps = rule.static_deps(&Stems::from([("File".to_string(), "a".to_string())])).unwrap();
    assert_eq!(deps, vec![("CONF".to_string(), "own.conf".to_string())]);
}

#[test]
fn patterns_escape_braces() {
    let pattern = Pattern::parse("{{lit}}-{N:[0-9]+}").unwrap();
    let compiled = pattern.compile(&Default::default()).unwrap();
    assert_eq!(compiled.captures("{lit}-42").and_then(|s| s.get("N").cloned()), Some("42".to_string()));
    assert!(!compiled.is_match("lit-42"));
}

#[test]
fn substitution_leaves_shell_variables_alone() {
    let text = substitute("cc {SRC} -o ${HOME}/{{x}}", |key| (key == "SRC").then_some("a.c"));
    assert_eq!(text, "cc a.c -o ${HOME}/{x}");
}

#[test]
fn rules_load_from_configuration() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("autobuild.toml"),
        r#"
max_jobs = 2

[bases.c]
stems = { file = ".*" }

[[rules]]
name = "compile"
base = "c"
target = "{file}.o"
deps = { src = "{file}.c" }
cmd = "cc -c -o {TARGET} {src}"
"#,
    )
    .unwrap();
    let config = EngineConfig::load(None, dir.path()).unwrap();
    assert_eq!(config.max_jobs, 2);
    let rules = config.rule_set().unwrap();
    let found = rules.match_target("main.o").expect("match");
    assert_eq!(found.rule.name(), "compile");
    assert_eq!(
        found.rule.static_deps(&found.stems).unwrap(),
        vec![("src".to_string(), "main.c".to_string())]
    );
}

#[test]
fn unknown_base_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("autobuild.toml"),
        r#"
[[rules]]
name = "compile"
base = "missing"
target = "out.o"
cmd = "true"
"#,
    )
    .unwrap();
    let config = EngineConfig::load(None, dir.path()).unwrap();
    assert!(matches!(config.rule_set(), Err(EngineError::Config(_))));
}
