use std::fs;
use std::hint::black_box;
use std::path::Path;

use criterion::{criterion_group, criterion_main, Criterion};

use autobuild::access::{AccessKind, AccessRecord, read_report};
use autobuild::fingerprint::Fingerprint;
use autobuild::rule::{Rule, RuleBuilder, RuleSet};

fn rules(n: usize) -> RuleSet {
    let mut rules: Vec<Rule> = (0..n)
        .map(|i| {
            RuleBuilder::new(&format!("compile{}", i))
                .target(&format!("dir{}/{{File:.*}}.o", i))
                .dep("SRC", &format!("dir{}/{{File}}.c", i))
                .shell("cc -c -o {TARGET} {SRC}")
                .build()
                .unwrap()
        })
        .collect();
    rules.push(
        RuleBuilder::new("link")
            .target("{Name:[a-z]+}.{*:[0-9]+}.so")
            .shell("cc -shared -o {TARGET}")
            .build()
            .unwrap(),
    );
    RuleSet::new(rules).unwrap()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    for n in [1, 100, 1000] {
        let set = rules(n);
        let hit = format!("dir{}/deep/path/main.o", n - 1);
        c.bench_function(&format!("match {} rules", n), |b| b.iter(|| set.match_target(black_box(&hit))));
        c.bench_function(&format!("miss {} rules", n), |b| b.iter(|| set.match_target(black_box("README.md"))));
    }

    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("report");
    let lines: String = (0..10_000)
        .map(|i| AccessRecord::new(AccessKind::Read, format!("/repo/src/file{}.h", i), true).to_line())
        .collect();
    fs::write(&report, lines).unwrap();
    c.bench_function("read report 10k", |b| b.iter(|| read_report(black_box(&report)).unwrap()));

    for (name, size) in [("1k", 1 << 10), ("1M", 1 << 20), ("64M", 1 << 26)] {
        let path = dir.path().join(name);
        fs::write(&path, vec![7u8; size]).unwrap();
        let path: &Path = &path;
        c.bench_function(&format!("fingerprint {}", name), |b| b.iter(|| Fingerprint::of(black_box(path))));
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
