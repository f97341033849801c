//! Automatic dependency capture.
//!
//! A [`Capture`] launches a shell command and reports what it touched.
//! Strategies differ only in how they observe the job:
//!
//! * [`NoCapture`] – nothing but explicit declarations.
//! * [`TraceCapture`] – the job runs under `ptrace`, every relevant system
//!   call is decoded before the job sees its result.
//! * [`AuditCapture`] – the interposition library is given to the dynamic
//!   linker as an auditor (`LD_AUDIT`) and rebinds libc symbols.
//! * [`PreloadCapture`] – the interposition library is preloaded
//!   (`LD_PRELOAD`) and wraps libc symbols.
//!
//! All of them hand back the same [`AccessRecord`] list. Support for a
//! strategy is checked once per process with [`check_available`].

mod inject;
mod trace;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::access::AccessRecord;
use crate::error::{EngineError, Result};
use crate::interface::CancelToken;

pub use inject::{AuditCapture, NoCapture, PreloadCapture};
pub use trace::TraceCapture;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    None,
    Trace,
    Audit,
    Preload,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Trace => "trace",
            Self::Audit => "audit",
            Self::Preload => "preload",
        };
        write!(f, "{}", name)
    }
}

impl Strategy {
    /// Whether the strategy can redirect paths into a scratch view.
    pub fn supports_view(self) -> bool {
        !matches!(self, Self::Trace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitState {
    Exited(i32),
    Signaled(i32),
    Cancelled,
}

impl ExitState {
    pub fn success(self) -> bool {
        self == Self::Exited(0)
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {}", code),
            Self::Signaled(signal) => write!(f, "signal {}", signal),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A process to start.
#[derive(Debug, Clone)]
pub struct Launch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Report file the job's own tools append to.
    pub report: PathBuf,
}

impl Launch {
    pub fn shell(text: &str, cwd: &Path, env: BTreeMap<String, String>, report: &Path) -> Self {
        Self {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), text.to_string()],
            cwd: cwd.to_path_buf(),
            env,
            report: report.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Captured {
    pub status: ExitState,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Raw accesses, absolute paths as the job named them.
    pub accesses: Vec<AccessRecord>,
}

pub trait Capture: Send + Sync {
    fn strategy(&self) -> Strategy;
    fn run(&self, launch: Launch, cancel: CancelToken) -> BoxFuture<'static, Result<Captured>>;
}

/// The capture for a strategy, without checking that it works here.
pub fn capture_for(strategy: Strategy, interposer: Option<&Path>) -> Result<Arc<dyn Capture>> {
    let library = || {
        interposer.map(Path::to_path_buf).ok_or_else(|| {
            EngineError::Config(format!("autodep strategy {} needs the interposer library", strategy))
        })
    };
    Ok(match strategy {
        Strategy::None => Arc::new(NoCapture),
        Strategy::Trace => Arc::new(TraceCapture),
        Strategy::Audit => Arc::new(AuditCapture::new(library()?)),
        Strategy::Preload => Arc::new(PreloadCapture::new(library()?)),
    })
}

lazy_static! {
    static ref CHECKS: Mutex<HashMap<(Strategy, Option<PathBuf>), std::result::Result<(), String>>> =
        Mutex::new(HashMap::new());
}

/// Fails with a configuration error when `strategy` cannot work on this
/// host. The answer is computed once and remembered.
pub fn check_available(strategy: Strategy, interposer: Option<&Path>) -> Result<()> {
    let key = (strategy, interposer.map(Path::to_path_buf));
    let mut checks = CHECKS
        .lock()
        .map_err(|e| EngineError::Invariant(format!("availability cache poisoned: {}", e)))?;
    let outcome = checks
        .entry(key)
        .or_insert_with(|| {
            let outcome = match strategy {
                Strategy::None => Ok(()),
                Strategy::Trace => trace::self_check(),
                Strategy::Audit | Strategy::Preload => match interposer {
                    Some(library) => inject::self_check(strategy, library),
                    None => Err("no interposer library configured".to_string()),
                },
            };
            match &outcome {
                Ok(()) => info!(%strategy, "Autodep strategy available"),
                Err(reason) => warn!(%strategy, %reason, "Autodep strategy unavailable"),
            }
            outcome
        })
        .clone();
    outcome.map_err(|reason| EngineError::Config(format!("autodep strategy {} unsupported: {}", strategy, reason)))
}
