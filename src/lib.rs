//! Autobuild – an incremental build engine with automatic dependency discovery.
//!
//! Rules map targets to the commands producing them. Nobody has to declare
//! what a command reads: the engine watches the command run and records
//! every file it accessed, then decides on the next request whether the
//! recorded picture still holds.
//!
//! * A [`rule::Rule`] has target patterns with named stems (e.g.
//!   `{File}.o`), static dependencies, a command (a shell line or a
//!   registered callback) and settings for dependency capture, execution
//!   backend, link support and scratch directory.
//! * A job is one rule applied to one binding of its stems. It is named by
//!   its primary target and owns the targets it produces.
//! * The [`graph::DependencyGraph`] keeps, for every job, its targets and
//!   the ordered list of dependencies it consumed, with fingerprints.
//!
//! ## Modules
//! * [`pattern`] – The target pattern language (grammar in `pattern.pest`).
//! * [`rule`] – Rules, the builder composing them from base records, and the
//!   matcher mapping a requested path to the rule producing it.
//! * [`access`] – Access records and the report protocol shared with jobs.
//! * [`autodep`] – Capture strategies: `none`, `trace`, `audit`, `preload`.
//! * [`links`] – Solving symbolic links under the `none|file|full` modes.
//! * [`tmp`] – Job-private scratch directories.
//! * [`context`] – What a callback command sees while it runs.
//! * [`backend`] – Local execution and the spool backend handing jobs to
//!   workers on other hosts.
//! * [`graph`] – SQLite persistence of the dependency graph.
//! * [`state`] – Job states and outcome counters.
//! * [`engine`] – Orchestration: assessment, execution, hazard detection.
//! * [`interface`] – Asynchronous build handles with cancellation.
//! * [`config`] – Engine configuration and declarative rules.
//!
//! ## Job States
//! Every build reports how many jobs ended `new`, `done`, `steady`,
//! `may_rerun` and `rerun`, see [`state::OutcomeCounts`]. A job whose
//! dependencies turn out to be built after it read them, or modified while
//! it ran, is executed again; a job that does not settle is reported as
//! unstable rather than failed.
//!
//! ## Quick Start
//! ```no_run
//! use autobuild::{config::EngineConfig, engine::Engine, graph::PersistenceMode};
//! use autobuild::interface::CancelToken;
//! use autobuild::rule::{RuleBuilder, RuleSet};
//!
//! # async fn run() -> autobuild::error::Result<()> {
//! let config = EngineConfig::new(std::path::Path::new("."))?;
//! let rules = RuleSet::new(vec![
//!     RuleBuilder::new("upper")
//!         .target("{File:.*}.upper")
//!         .dep("SRC", "{File}.txt")
//!         .shell("tr a-z A-Z < {SRC}")
//!         .build()?,
//! ])?;
//! let engine = Engine::new(config, rules, PersistenceMode::InMemory)?;
//! let report = engine.make(&["hello.upper".to_string()], CancelToken::new()).await;
//! println!("{}", report.counts);
//! # Ok(())
//! # }
//! ```
//!
//! Jobs running shell commands can declare dependencies they never open
//! with `"$AUTOBUILD" depend <path>...`; callbacks use
//! [`context::JobContext::depend`].

pub mod access;
pub mod autodep;
pub mod backend;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod interface;
pub mod links;
pub mod pattern;
pub mod rule;
pub mod state;
pub mod tmp;
