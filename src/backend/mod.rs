//! Where jobs run.
//!
//! An [`ExecutionBackend`] takes a self-contained [`JobSpec`] and
//! eventually yields a [`JobOutput`] carrying the exit status, the standard
//! streams and the normalized accesses of the job. Both travel as JSON
//! between processes, so the engine does not care whether the job ran in
//! a child process of its own or on a cluster node.

mod local;
mod remote;
mod worker;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::access::AccessRecord;
use crate::autodep::{ExitState, Strategy};
use crate::error::Result;
use crate::interface::CancelToken;
use crate::links::LinkSupport;
use crate::pattern::{Stems, substitute};
use crate::rule::{Command, Rule};
use crate::tmp::TmpMode;

pub use local::{LocalBackend, LocalExecutor};
pub use remote::SpoolBackend;
pub use worker::Worker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobCommand {
    /// Command line with stems and keys already substituted.
    Shell(String),
    /// Name of a callback registered by the rule.
    Callback(String),
}

/// Everything needed to run one job, anywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub rule: String,
    pub command: JobCommand,
    pub root: PathBuf,
    pub admin: PathBuf,
    pub stems: Stems,
    pub targets: BTreeMap<String, String>,
    pub deps: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub autodep: Strategy,
    pub link_support: LinkSupport,
    pub tmp: TmpMode,
}

impl JobSpec {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        rule: &Rule,
        stems: &Stems,
        targets: BTreeMap<String, String>,
        deps: BTreeMap<String, String>,
        root: PathBuf,
        admin: PathBuf,
        autodep: Strategy,
        link_support: LinkSupport,
    ) -> Self {
        let command = match rule.command() {
            Command::Shell(text) => JobCommand::Shell(substitute(text, |key| {
                stems
                    .get(key)
                    .or_else(|| targets.get(key))
                    .or_else(|| deps.get(key))
                    .map(String::as_str)
            })),
            Command::Callback { name, .. } => JobCommand::Callback(name.clone()),
        };
        Self {
            name: name.to_string(),
            rule: rule.name().to_string(),
            command,
            root,
            admin,
            stems: stems.clone(),
            targets,
            deps,
            env: rule.environment().clone(),
            autodep,
            link_support,
            tmp: rule.tmp().clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutput {
    pub status: ExitState,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Normalized on the host that ran the job.
    pub accesses: Vec<AccessRecord>,
    /// Set when the job could not even be started, or a callback failed.
    pub error: Option<String>,
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
}

impl JobOutput {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.status.success()
    }
    /// Why the job failed, for error messages.
    pub fn failure(&self) -> String {
        match &self.error {
            Some(error) => error.clone(),
            None => {
                let stderr = String::from_utf8_lossy(&self.stderr);
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    self.status.to_string()
                } else {
                    format!("{}: {}", self.status, stderr)
                }
            }
        }
    }
}

pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;
    /// Fails when jobs cannot be handed to this backend at all.
    fn check_available(&self) -> Result<()>;
    /// Run a job. A cancelled job yields a cancellation error.
    fn submit(&self, spec: JobSpec, cancel: CancelToken) -> BoxFuture<'static, Result<JobOutput>>;
}
