//! Orchestration of builds.
//!
//! A request for a target goes to the rule producing it, then to the job
//! identified by the rule and its stems. At most one instance of a job is
//! in flight at any time: a second request attaches to the running one.
//! A job is executed when its record in the [`DependencyGraph`] cannot be
//! trusted, and re-executed while its discovered dependencies are not
//! trustworthy yet (see [`HazardPolicy`](crate::config::HazardPolicy)).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::hash::BuildHasherDefault;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt, Shared, join_all};
use seahash::SeaHasher;
use tracing::{debug, info, warn};

use crate::access::AccessKind;
use crate::autodep::check_available;
use crate::backend::{ExecutionBackend, JobOutput, JobSpec, LocalBackend, LocalExecutor, SpoolBackend};
use crate::config::{BackendConfig, EngineConfig};
use crate::error::{EngineError, Result};
use crate::fingerprint::Fingerprint;
use crate::graph::{DepKind, DepRecord, DependencyGraph, JobRecord, PersistenceMode, RecordState};
use crate::interface::CancelToken;
use crate::rule::{Command, Rule, RuleMatch, RuleSet};
use crate::state::{JobState, OutcomeCounts, classify, is_hot, stale_reason};

type SeaMap<V> = HashMap<String, V, BuildHasherDefault<SeaHasher>>;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ------------- Outcomes -------------
#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub state: JobState,
    pub error: Option<Arc<EngineError>>,
}

impl TargetOutcome {
    fn ok(state: JobState) -> Self {
        Self { state, error: None }
    }
    fn failed(error: impl Into<Arc<EngineError>>) -> Self {
        Self { state: JobState::Error, error: Some(error.into()) }
    }
}

#[derive(Debug, Clone)]
pub struct TargetReport {
    pub target: String,
    pub state: JobState,
    pub error: Option<Arc<EngineError>>,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub counts: OutcomeCounts,
    pub targets: Vec<TargetReport>,
}

impl BuildReport {
    pub fn ok(&self) -> bool {
        self.targets.iter().all(|t| t.error.is_none())
    }
    pub fn state(&self, target: &str) -> Option<JobState> {
        self.targets.iter().find(|t| t.target == target).map(|t| t.state)
    }
    pub fn error(&self, target: &str) -> Option<&EngineError> {
        self.targets
            .iter()
            .find(|t| t.target == target)
            .and_then(|t| t.error.as_deref())
    }
}

// What one call to make() has seen so far.
struct Session {
    cancel: CancelToken,
    counts: Mutex<OutcomeCounts>,
    verified: Mutex<SeaMap<Instant>>,
    memo: Mutex<SeaMap<TargetOutcome>>,
}

impl Session {
    fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            counts: Mutex::new(OutcomeCounts::default()),
            verified: Mutex::new(SeaMap::default()),
            memo: Mutex::new(SeaMap::default()),
        }
    }
    fn count(&self, state: JobState) {
        guard(&self.counts).record(state);
    }
    fn verify(&self, path: &str) {
        guard(&self.verified).entry(path.to_string()).or_insert_with(Instant::now);
    }
    fn verified_before(&self, path: &str, instant: Instant) -> bool {
        guard(&self.verified).get(path).is_some_and(|at| *at <= instant)
    }
    fn remembered(&self, job: &str) -> Option<TargetOutcome> {
        guard(&self.memo).get(job).cloned()
    }
    fn remember(&self, job: &str, outcome: &TargetOutcome) {
        guard(&self.memo).insert(job.to_string(), outcome.clone());
    }
}

// ------------- Engine -------------
struct EngineInner {
    config: EngineConfig,
    rules: RuleSet,
    graph: DependencyGraph,
    backends: HashMap<String, Arc<dyn ExecutionBackend>>,
    in_flight: Mutex<Flights>,
}

// Running jobs, and which jobs each of them is waiting on. Both change
// under the same lock, so two jobs cannot start waiting on each other.
#[derive(Default)]
struct Flights {
    running: SeaMap<Shared<BoxFuture<'static, TargetOutcome>>>,
    waits: SeaMap<Vec<String>>,
}

impl Flights {
    // Jobs from `job` to the first member of `chain` it transitively
    // waits on, both ends included.
    fn waits_for(&self, job: &str, chain: &[String]) -> Option<Vec<String>> {
        let mut parent: HashMap<&str, &str> = HashMap::new();
        let mut queue = VecDeque::from([job]);
        while let Some(current) = queue.pop_front() {
            for next in self.waits.get(current).into_iter().flatten() {
                let next = next.as_str();
                if next == job || parent.contains_key(next) {
                    continue;
                }
                parent.insert(next, current);
                if chain.iter().any(|j| j == next) {
                    let mut path = vec![next.to_string()];
                    let mut at = next;
                    while let Some(previous) = parent.get(at).copied() {
                        path.push(previous.to_string());
                        at = previous;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }
    fn wait(&mut self, waiter: &str, job: &str) {
        self.waits.entry(waiter.to_string()).or_default().push(job.to_string());
    }
    fn done_waiting(&mut self, waiter: &str, job: &str) {
        if let Some(jobs) = self.waits.get_mut(waiter) {
            if let Some(at) = jobs.iter().position(|j| j == job) {
                jobs.swap_remove(at);
            }
            if jobs.is_empty() {
                self.waits.remove(waiter);
            }
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Everything that can be checked before running jobs is checked here:
    /// backend names, autodep strategies and their support on this host.
    pub fn new(config: EngineConfig, rules: RuleSet, mode: PersistenceMode) -> Result<Self> {
        let executor = LocalExecutor::new(
            &config.tmp_root(),
            config.interposer.clone(),
            config.runtime.clone(),
            rules.callbacks(),
        )?;
        let local: Arc<dyn ExecutionBackend> = Arc::new(LocalBackend::new(executor, config.max_jobs));
        let mut backends: HashMap<String, Arc<dyn ExecutionBackend>> = HashMap::new();
        backends.insert("local".to_string(), Arc::clone(&local));
        for (name, backend) in &config.backends {
            let backend: Arc<dyn ExecutionBackend> = match backend {
                BackendConfig::Local => Arc::clone(&local),
                BackendConfig::Spool { spool, poll_ms, submit_retries, retry_backoff_ms } => {
                    Arc::new(SpoolBackend::new(name, spool, *poll_ms, *submit_retries, *retry_backoff_ms))
                }
            };
            if let Err(e) = backend.check_available() {
                warn!(backend = %name, error = %e, "Backend unavailable, its jobs will fail");
            }
            backends.insert(name.clone(), backend);
        }
        for rule in rules.rules() {
            if !backends.contains_key(rule.backend()) {
                return Err(EngineError::Config(format!(
                    "rule {} uses unknown backend {}",
                    rule.name(),
                    rule.backend()
                )));
            }
            if let Command::Shell(_) = rule.command() {
                let strategy = rule.autodep().unwrap_or(config.autodep);
                if rule.tmp().view().is_some() && !strategy.supports_view() {
                    return Err(EngineError::Config(format!(
                        "rule {} maps a tmp view, which autodep strategy {} cannot do",
                        rule.name(),
                        strategy
                    )));
                }
                check_available(strategy, config.interposer.as_deref())?;
            }
        }
        let graph = DependencyGraph::new(mode)?;
        info!(rules = rules.rules().len(), backends = backends.len(), root = %config.root.display(), "Engine ready");
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                rules,
                graph,
                backends,
                in_flight: Mutex::new(Flights::default()),
            }),
        })
    }
    /// An engine keeping its graph in the configured database file.
    pub fn open(config: EngineConfig, rules: RuleSet) -> Result<Self> {
        let path = config.database_path();
        Self::new(config, rules, PersistenceMode::File(path))
    }
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
    pub fn rules(&self) -> &RuleSet {
        &self.inner.rules
    }
    pub fn graph(&self) -> &DependencyGraph {
        &self.inner.graph
    }

    /// Bring `targets` up to date.
    pub async fn make(&self, targets: &[String], cancel: CancelToken) -> BuildReport {
        let session = Arc::new(Session::new(cancel));
        let requested: Vec<String> = targets.iter().map(|t| self.relative(t)).collect();
        let outcomes = join_all(
            requested
                .iter()
                .map(|target| self.make_target(target.clone(), Vec::new(), Arc::clone(&session))),
        )
        .await;
        let counts = *guard(&session.counts);
        info!(%counts, "Build finished");
        BuildReport {
            counts,
            targets: requested
                .into_iter()
                .zip(outcomes)
                .map(|(target, outcome)| TargetReport { target, state: outcome.state, error: outcome.error })
                .collect(),
        }
    }

    fn relative(&self, target: &str) -> String {
        let path = Path::new(target);
        let path = path.strip_prefix(&self.inner.config.root).unwrap_or(path);
        let path = path.strip_prefix(".").unwrap_or(path);
        path.to_string_lossy().into_owned()
    }
    fn absolute(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() { path.to_path_buf() } else { self.inner.config.root.join(path) }
    }
    fn fingerprints(&self, paths: &[String]) -> Vec<(String, Fingerprint)> {
        paths.iter().map(|p| (p.clone(), Fingerprint::of(&self.absolute(p)))).collect()
    }

    // `chain` holds the jobs waiting on this request, innermost last
    fn make_target(&self, path: String, chain: Vec<String>, session: Arc<Session>) -> BoxFuture<'static, TargetOutcome> {
        let engine = self.clone();
        Box::pin(async move {
            let outcome = engine.resolve(&path, chain, &session).await;
            session.verify(&path);
            outcome
        })
    }

    async fn resolve(&self, path: &str, chain: Vec<String>, session: &Arc<Session>) -> TargetOutcome {
        let Some(found) = self.inner.rules.match_target(path) else {
            return if self.absolute(path).symlink_metadata().is_ok() {
                TargetOutcome::ok(JobState::Done)
            } else {
                TargetOutcome::failed(EngineError::NoRule(path.to_string()))
            };
        };
        let job = match found.job_name() {
            Ok(job) => job,
            Err(e) => return TargetOutcome::failed(e),
        };
        if chain.contains(&job) {
            let mut cycle = chain;
            cycle.push(job);
            return TargetOutcome::failed(EngineError::Cycle { target: path.to_string(), path: cycle });
        }
        if let Some(outcome) = session.remembered(&job) {
            return outcome;
        }
        let waiter = chain.last().cloned();
        let running = {
            let mut flights = guard(&self.inner.in_flight);
            let running = if let Some(running) = flights.running.get(&job).cloned() {
                // attaching to a job that already waits on us would never end
                if let Some(waiting) = flights.waits_for(&job, &chain) {
                    let closing = waiting.last().cloned().unwrap_or_default();
                    let start = chain.iter().position(|j| *j == closing).unwrap_or(0);
                    let mut cycle = chain[start..].to_vec();
                    cycle.extend(waiting);
                    return TargetOutcome::failed(EngineError::Cycle { target: path.to_string(), path: cycle });
                }
                running
            } else {
                let engine = self.clone();
                let session = Arc::clone(session);
                let name = job.clone();
                let task = tokio::spawn(async move {
                    let outcome = engine.run_job(found, &name, chain, &session).await;
                    let mut flights = guard(&engine.inner.in_flight);
                    flights.running.remove(&name);
                    flights.waits.remove(&name);
                    outcome
                });
                let running = async move {
                    task.await.unwrap_or_else(|e| {
                        TargetOutcome::failed(EngineError::Invariant(format!("job task failed: {}", e)))
                    })
                }
                .boxed()
                .shared();
                flights.running.insert(job.clone(), running.clone());
                running
            };
            if let Some(waiter) = &waiter {
                flights.wait(waiter, &job);
            }
            running
        };
        let outcome = running.await;
        if let Some(waiter) = &waiter {
            guard(&self.inner.in_flight).done_waiting(waiter, &job);
        }
        session.remember(&job, &outcome);
        outcome
    }

    async fn run_job(&self, found: RuleMatch, job: &str, mut chain: Vec<String>, session: &Arc<Session>) -> TargetOutcome {
        chain.push(job.to_string());
        match self.build_job(&found, job, &chain, session).await {
            Ok(state) => TargetOutcome::ok(state),
            Err(error) => {
                debug!(job, kind = error.kind(), error = %error, "Job failed");
                TargetOutcome { state: JobState::Error, error: Some(error) }
            }
        }
    }

    async fn build_job(
        &self,
        found: &RuleMatch,
        job: &str,
        chain: &[String],
        session: &Arc<Session>,
    ) -> std::result::Result<JobState, Arc<EngineError>> {
        let rule = &found.rule;
        let stems = &found.stems;
        if session.cancel.is_cancelled() {
            return Err(EngineError::Cancelled { job: job.to_string(), reason: "build cancelled".into() }.into());
        }
        let static_targets = rule.static_targets(stems)?;
        let static_deps = rule.static_deps(stems)?;
        let made = join_all(
            static_deps
                .iter()
                .map(|(_, dep)| self.make_target(dep.clone(), chain.to_vec(), Arc::clone(session))),
        )
        .await;
        for ((_, dep), outcome) in static_deps.iter().zip(made) {
            if let Some(error) = outcome.error {
                return Err(dependency_failure(job, dep, error));
            }
        }

        let record = self.inner.graph.job(job)?;
        let Some(reason) = self.assess(job, rule, &static_targets, record.as_ref(), chain, session).await? else {
            debug!(job, "Job up to date");
            return Ok(JobState::Done);
        };
        info!(job, %reason, "Job needs execution");
        let had_record = matches!(&record, Some(r) if r.state != RecordState::Error);
        let target_paths: Vec<String> = static_targets.iter().map(|(_, path)| path.clone()).collect();
        let mut watched = target_paths.clone();
        if let Some(record) = record.as_ref().filter(|_| had_record) {
            watched.extend(record.targets.iter().map(|(path, _)| path.clone()));
        }
        watched.sort();
        watched.dedup();

        let backend = self.inner.backends.get(rule.backend()).cloned().ok_or_else(|| {
            EngineError::Config(format!("rule {} uses unknown backend {}", rule.name(), rule.backend()))
        })?;
        let spec = JobSpec::new(
            job,
            rule,
            stems,
            static_targets.iter().cloned().collect(),
            static_deps.iter().cloned().collect(),
            self.inner.config.root.clone(),
            self.inner.config.admin_dir(),
            rule.autodep().unwrap_or(self.inner.config.autodep),
            rule.link_support().unwrap_or(self.inner.config.link_support),
        );
        let policy = &self.inner.config.hazard;
        let before = self.fingerprints(&watched);
        let mut reruns = 0;
        let mut rounds = 0;
        loop {
            let started_at = Instant::now();
            let started = SystemTime::now();
            let output = match self.execute(Arc::clone(&backend), spec.clone(), rule.timeout(), session).await {
                Ok(output) => output,
                Err(error) => return Err(self.fail(job, rule, &target_paths, error, session)),
            };
            let written: HashSet<String> = output
                .accesses
                .iter()
                .filter(|a| a.ok && a.kind == AccessKind::Write)
                .map(|a| a.path.clone())
                .collect();
            let removed: Vec<String> = output
                .accesses
                .iter()
                .filter(|a| a.ok && a.kind == AccessKind::Unlink)
                .map(|a| a.path.clone())
                .collect();
            let mut targets = target_paths.clone();
            targets.extend(written.iter().filter(|path| rule.produces(stems, path)).cloned());
            targets.sort();
            targets.dedup();
            let deps = self.dependencies(&static_deps, &output, &targets, &written);

            // built by some rule, but not before the job looked at it
            let stale: Vec<String> = deps
                .iter()
                .filter(|d| d.kind == DepKind::Discovered)
                .filter(|d| self.inner.rules.is_buildable(&d.path) && !session.verified_before(&d.path, started_at))
                .map(|d| d.path.clone())
                .collect();
            if !stale.is_empty() {
                rounds += 1;
                if rounds > policy.max_discovery_rounds {
                    let error = EngineError::Instability { job: job.to_string(), deps: stale };
                    return Err(self.fail(job, rule, &target_paths, error, session));
                }
                warn!(job, deps = ?stale, "Dependencies read before being built, job may rerun");
                session.count(JobState::MayRerun);
                let made = join_all(
                    stale
                        .iter()
                        .map(|dep| self.make_target(dep.clone(), chain.to_vec(), Arc::clone(session))),
                )
                .await;
                for (dep, outcome) in stale.iter().zip(made) {
                    if let Some(error) = outcome.error {
                        let error = dependency_failure(job, dep, error);
                        return Err(self.fail(job, rule, &target_paths, error, session));
                    }
                }
                continue;
            }

            if !output.success() {
                let error = EngineError::Execution { job: job.to_string(), reason: output.failure() };
                return Err(self.fail(job, rule, &target_paths, error, session));
            }
            if let Err(error) = self.write_stdout(rule, &target_paths, &written, &before, &output) {
                return Err(self.fail(job, rule, &target_paths, error, session));
            }
            if let Err(error) = self.check_writes(job, found, written.iter().chain(removed.iter())) {
                return Err(self.fail(job, rule, &target_paths, error, session));
            }
            if let Some(missing) = target_paths.iter().find(|t| self.absolute(t).symlink_metadata().is_err()) {
                let error = EngineError::Execution { job: job.to_string(), reason: format!("did not produce {}", missing) };
                return Err(self.fail(job, rule, &target_paths, error, session));
            }

            // still being written while the job ran
            let hot: Vec<String> = deps
                .iter()
                .filter(|d| matches!(d.fingerprint, Fingerprint::File(_) | Fingerprint::Link(_)))
                .filter(|d| is_hot(&self.absolute(&d.path), started, policy.hot_window()))
                .map(|d| d.path.clone())
                .collect();
            if !hot.is_empty() {
                if reruns >= policy.max_reruns {
                    let error = EngineError::Instability { job: job.to_string(), deps: hot };
                    return Err(self.fail(job, rule, &target_paths, error, session));
                }
                reruns += 1;
                warn!(job, deps = ?hot, reruns, "Dependencies modified while the job ran, job may rerun");
                session.count(JobState::MayRerun);
                continue;
            }

            let after = self.fingerprints(&targets);
            let state = classify(&before, &after, had_record);
            let record = JobRecord {
                job: job.to_string(),
                rule: rule.name().to_string(),
                rule_fingerprint: rule.fingerprint().to_string(),
                state: if state == JobState::Steady { RecordState::Steady } else { RecordState::Done },
                reason: None,
                targets: after,
                deps,
                ended: Utc::now(),
            };
            if let Err(error) = self.inner.graph.commit(&record) {
                return Err(self.fail(job, rule, &target_paths, error, session));
            }
            if !had_record {
                session.count(JobState::New);
            }
            session.count(state);
            info!(job, %state, "Job built");
            return Ok(if had_record { state } else { JobState::New });
        }
    }

    // Some(reason) when the job has to be executed
    async fn assess(
        &self,
        job: &str,
        rule: &Rule,
        static_targets: &[(String, String)],
        record: Option<&JobRecord>,
        chain: &[String],
        session: &Arc<Session>,
    ) -> std::result::Result<Option<String>, Arc<EngineError>> {
        if let Some(reason) = stale_reason(record, rule.fingerprint()) {
            return Ok(Some(reason));
        }
        let Some(record) = record else {
            return Ok(Some("never built".into()));
        };
        for (_, target) in static_targets {
            if !record.targets.iter().any(|(path, _)| path == target) {
                return Ok(Some(format!("{} never produced", target)));
            }
        }
        for (target, fingerprint) in &record.targets {
            if Fingerprint::of(&self.absolute(target)) != *fingerprint {
                return Ok(Some(format!("{} modified", target)));
            }
        }
        for dep in &record.deps {
            if dep.kind != DepKind::Static && self.inner.rules.is_buildable(&dep.path) {
                let outcome = self.make_target(dep.path.clone(), chain.to_vec(), Arc::clone(session)).await;
                if let Some(error) = outcome.error {
                    return Err(dependency_failure(job, &dep.path, error));
                }
            }
            if Fingerprint::of(&self.absolute(&dep.path)) != dep.fingerprint {
                return Ok(Some(format!("{} changed", dep.path)));
            }
        }
        Ok(None)
    }

    async fn execute(
        &self,
        backend: Arc<dyn ExecutionBackend>,
        spec: JobSpec,
        timeout: Option<Duration>,
        session: &Session,
    ) -> Result<JobOutput> {
        let token = session.cancel.child();
        let name = spec.name.clone();
        let mut run = backend.submit(spec, token.clone());
        match timeout {
            None => run.await,
            Some(limit) => tokio::select! {
                output = &mut run => output,
                _ = tokio::time::sleep(limit) => {
                    token.cancel();
                    let _ = run.await;
                    Err(EngineError::Cancelled { job: name, reason: format!("timed out after {} ms", limit.as_millis()) })
                }
            },
        }
    }

    // Marks the job in error and counts the failure.
    fn fail(
        &self,
        job: &str,
        rule: &Rule,
        targets: &[String],
        error: impl Into<Arc<EngineError>>,
        session: &Session,
    ) -> Arc<EngineError> {
        let error = error.into();
        let reason = error.to_string();
        if let Err(e) = self
            .inner
            .graph
            .mark_error(job, rule.name(), rule.fingerprint(), targets, &reason)
        {
            warn!(job, error = %e, "Cannot record job error");
        }
        match error.as_ref() {
            EngineError::Instability { .. } => session.count(JobState::Rerun),
            _ => session.count(JobState::Error),
        }
        error
    }

    // Single-target shell rules get standard output in the target, unless
    // the job wrote the target itself.
    fn write_stdout(
        &self,
        rule: &Rule,
        targets: &[String],
        written: &HashSet<String>,
        before: &[(String, Fingerprint)],
        output: &JobOutput,
    ) -> Result<()> {
        if !rule.stdout_to_target() {
            return Ok(());
        }
        let Some(target) = targets.first() else { return Ok(()) };
        if written.contains(target) {
            return Ok(());
        }
        let path = self.absolute(target);
        let current = Fingerprint::of(&path);
        let untouched = match before.iter().find(|(t, _)| t == target) {
            Some((_, previous)) => *previous == current,
            None => !current.exists(),
        };
        if untouched && (!output.stdout.is_empty() || !current.exists()) {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &output.stdout)?;
        }
        Ok(())
    }

    fn check_writes<'a>(&self, job: &str, found: &RuleMatch, paths: impl Iterator<Item = &'a String>) -> Result<()> {
        for path in paths {
            if found.rule.produces(&found.stems, path) {
                continue;
            }
            if let Some(other) = self.inner.rules.match_target(path) {
                if other.job_name().ok().as_deref() != Some(job) {
                    return Err(EngineError::Execution {
                        job: job.to_string(),
                        reason: format!("unexpected write to {}, a target of rule {}", path, other.rule.name()),
                    });
                }
                continue;
            }
            if self.inner.graph.is_dependency(path)? && self.inner.graph.producer(path)?.is_none() {
                return Err(EngineError::Execution {
                    job: job.to_string(),
                    reason: format!("unexpected write to source {}", path),
                });
            }
            warn!(job, path = %path, "Unexpected write");
        }
        Ok(())
    }

    // static dependencies first, then what the job accessed, in order
    fn dependencies(
        &self,
        static_deps: &[(String, String)],
        output: &JobOutput,
        targets: &[String],
        written: &HashSet<String>,
    ) -> Vec<DepRecord> {
        let mut position: BTreeMap<String, usize> = BTreeMap::new();
        let mut deps: Vec<DepRecord> = Vec::new();
        for (_, path) in static_deps {
            if !position.contains_key(path) {
                position.insert(path.clone(), deps.len());
                deps.push(DepRecord {
                    path: path.clone(),
                    kind: DepKind::Static,
                    fingerprint: Fingerprint::of(&self.absolute(path)),
                });
            }
        }
        for access in &output.accesses {
            let kind = match access.kind {
                AccessKind::Write | AccessKind::Unlink => continue,
                AccessKind::Explicit => DepKind::Explicit,
                _ => DepKind::Discovered,
            };
            if targets.contains(&access.path) || written.contains(&access.path) {
                continue;
            }
            match position.get(&access.path) {
                Some(index) => {
                    if kind == DepKind::Explicit && deps[*index].kind == DepKind::Discovered {
                        deps[*index].kind = DepKind::Explicit;
                    }
                }
                None => {
                    position.insert(access.path.clone(), deps.len());
                    deps.push(DepRecord {
                        path: access.path.clone(),
                        kind,
                        fingerprint: Fingerprint::of(&self.absolute(&access.path)),
                    });
                }
            }
        }
        deps
    }
}

// Cycles and cancellations keep their identity when they travel up.
fn dependency_failure(job: &str, dep: &str, error: Arc<EngineError>) -> Arc<EngineError> {
    match error.as_ref() {
        EngineError::Cycle { .. } | EngineError::Cancelled { .. } => error,
        _ => Arc::new(EngineError::Dependency { job: job.to_string(), dep: dep.to_string(), reason: error.to_string() }),
    }
}
