use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{ExecutionBackend, JobCommand, JobOutput, JobSpec};
use crate::access::REPORT_ENV;
use crate::autodep::{ExitState, Launch, capture_for};
use crate::context::JobContext;
use crate::error::{EngineError, Result};
use crate::interface::CancelToken;
use crate::links::PathSolver;
use crate::rule::CallbackRegistry;
use crate::tmp::{ScratchAllocator, ScratchDir};

// variables of an enclosing job must not leak into ours
const SCRUBBED: [&str; 2] = ["LD_PRELOAD", "LD_AUDIT"];

/// Runs jobs as children of the current process. Shared by the local
/// backend and by spool workers.
pub struct LocalExecutor {
    scratch: ScratchAllocator,
    interposer: Option<PathBuf>,
    runtime: Option<PathBuf>,
    callbacks: CallbackRegistry,
}

impl LocalExecutor {
    pub fn new(
        tmp_root: &Path,
        interposer: Option<PathBuf>,
        runtime: Option<PathBuf>,
        callbacks: CallbackRegistry,
    ) -> Result<Self> {
        Ok(Self { scratch: ScratchAllocator::new(tmp_root)?, interposer, runtime, callbacks })
    }

    fn environment(&self, spec: &JobSpec, scratch: &ScratchDir) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = std::env::vars()
            .filter(|(key, _)| !key.starts_with("AUTOBUILD") && !SCRUBBED.contains(&key.as_str()))
            .collect();
        env.extend(spec.env.clone());
        let root = spec.root.to_string_lossy().into_owned();
        env.insert("ROOT_DIR".into(), root.clone());
        env.insert("AUTOBUILD_ROOT".into(), root);
        env.insert("TMPDIR".into(), spec.tmp.tmpdir(scratch.dir()).to_string_lossy().into_owned());
        env.insert("AUTOBUILD_TMP_DIR".into(), scratch.dir().to_string_lossy().into_owned());
        if let Some(view) = spec.tmp.view() {
            env.insert("AUTOBUILD_TMP_VIEW".into(), view.to_string_lossy().into_owned());
        }
        env.insert(REPORT_ENV.into(), scratch.report().to_string_lossy().into_owned());
        if let Some(runtime) = &self.runtime {
            env.insert("AUTOBUILD".into(), runtime.to_string_lossy().into_owned());
        }
        env
    }

    /// Run a job to completion. Cancellation shows in the status, not as
    /// an error.
    pub async fn execute(&self, spec: &JobSpec, cancel: CancelToken) -> Result<JobOutput> {
        let started = Utc::now();
        let scratch = self.scratch.allocate()?;
        let solver = PathSolver::new(&spec.root, &spec.admin, spec.link_support).with_scratch(scratch.dir(), spec.tmp.view());
        debug!(job = %spec.name, scratch = %scratch.dir().display(), "Executing job");
        let (status, stdout, stderr, raw, error) = match &spec.command {
            JobCommand::Shell(text) => {
                let capture = capture_for(spec.autodep, self.interposer.as_deref())?;
                let launch = Launch::shell(text, &spec.root, self.environment(spec, &scratch), scratch.report());
                let captured = capture.run(launch, cancel).await?;
                (captured.status, captured.stdout, captured.stderr, captured.accesses, None)
            }
            JobCommand::Callback(name) => {
                let func = self
                    .callbacks
                    .get(name)
                    .ok_or_else(|| EngineError::Config(format!("job {} uses unknown callback {}", spec.name, name)))?;
                let mut context = JobContext::new(
                    &spec.name,
                    spec.stems.clone(),
                    spec.targets.clone(),
                    spec.deps.clone(),
                    spec.tmp.tmpdir(scratch.dir()),
                    solver.clone(),
                    cancel.clone(),
                );
                let task = tokio::task::spawn_blocking(move || {
                    let outcome = func(&mut context);
                    (outcome, context.finish())
                });
                tokio::select! {
                    joined = task => {
                        let (outcome, (raw, stdout, stderr)) = joined
                            .map_err(|e| EngineError::Invariant(format!("callback task failed: {}", e)))?;
                        match outcome {
                            Ok(()) => (ExitState::Exited(0), stdout, stderr, raw, None),
                            Err(e) => (ExitState::Exited(1), stdout, stderr, raw, Some(e.to_string())),
                        }
                    }
                    // a callback cannot be killed, its late accesses are of no interest
                    _ = cancel.cancelled() => (ExitState::Cancelled, Vec::new(), Vec::new(), Vec::new(), None),
                }
            }
        };
        let accesses = solver.normalize(&raw);
        drop(scratch);
        let ended = Utc::now();
        info!(job = %spec.name, %status, accesses = accesses.len(), "Job ended");
        Ok(JobOutput { status, stdout, stderr, accesses, error, started, ended })
    }
}

/// Jobs run on this host, at most `max_jobs` at a time.
pub struct LocalBackend {
    executor: Arc<LocalExecutor>,
    slots: Arc<Semaphore>,
}

impl LocalBackend {
    pub fn new(executor: LocalExecutor, max_jobs: usize) -> Self {
        Self { executor: Arc::new(executor), slots: Arc::new(Semaphore::new(max_jobs)) }
    }
}

impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }
    fn check_available(&self) -> Result<()> {
        Ok(())
    }
    fn submit(&self, spec: JobSpec, cancel: CancelToken) -> BoxFuture<'static, Result<JobOutput>> {
        let executor = Arc::clone(&self.executor);
        let slots = Arc::clone(&self.slots);
        Box::pin(async move {
            let cancelled = || EngineError::Cancelled { job: spec.name.clone(), reason: "cancelled".into() };
            let _slot = tokio::select! {
                slot = slots.acquire_owned() => slot.map_err(|e| EngineError::Invariant(e.to_string()))?,
                _ = cancel.cancelled() => return Err(cancelled()),
            };
            let output = executor.execute(&spec, cancel.clone()).await?;
            if output.status == ExitState::Cancelled {
                warn!(job = %spec.name, "Job killed on cancellation");
                return Err(cancelled());
            }
            Ok(output)
        })
    }
}
