// Strategies that launch the job as a plain child process, optionally with
// the interposition library injected through the dynamic linker.
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use futures_util::future::BoxFuture;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use super::{Capture, Captured, ExitState, Launch, Strategy};
use crate::access::{REPORT_ENV, read_report};
use crate::error::Result;
use crate::interface::CancelToken;

pub struct NoCapture;

impl Capture for NoCapture {
    fn strategy(&self) -> Strategy {
        Strategy::None
    }
    fn run(&self, launch: Launch, cancel: CancelToken) -> BoxFuture<'static, Result<Captured>> {
        Box::pin(spawn_job(launch, cancel, None))
    }
}

pub struct PreloadCapture {
    library: PathBuf,
}
impl PreloadCapture {
    pub fn new(library: PathBuf) -> Self {
        Self { library }
    }
}

impl Capture for PreloadCapture {
    fn strategy(&self) -> Strategy {
        Strategy::Preload
    }
    fn run(&self, launch: Launch, cancel: CancelToken) -> BoxFuture<'static, Result<Captured>> {
        Box::pin(spawn_job(launch, cancel, Some(("LD_PRELOAD", self.library.clone()))))
    }
}

pub struct AuditCapture {
    library: PathBuf,
}
impl AuditCapture {
    pub fn new(library: PathBuf) -> Self {
        Self { library }
    }
}

impl Capture for AuditCapture {
    fn strategy(&self) -> Strategy {
        Strategy::Audit
    }
    fn run(&self, launch: Launch, cancel: CancelToken) -> BoxFuture<'static, Result<Captured>> {
        Box::pin(spawn_job(launch, cancel, Some(("LD_AUDIT", self.library.clone()))))
    }
}

async fn spawn_job(launch: Launch, cancel: CancelToken, inject: Option<(&'static str, PathBuf)>) -> Result<Captured> {
    let mut command = Command::new(&launch.program);
    command
        .args(&launch.args)
        .current_dir(&launch.cwd)
        .env_clear()
        .envs(&launch.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some((var, library)) = &inject {
        command.env(var, library);
    }
    let mut child = command.spawn()?;
    let pid = child.id();
    debug!(pid = ?pid, program = %launch.program.display(), "Job process started");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout = tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = stdout {
            let _ = pipe.read_to_end(&mut buffer).await;
        }
        buffer
    });
    let stderr = tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = stderr {
            let _ = pipe.read_to_end(&mut buffer).await;
        }
        buffer
    });

    let status = tokio::select! {
        status = child.wait() => exit_state(status?),
        _ = cancel.cancelled() => {
            kill_group(pid.map(|p| p as i32));
            let _ = child.wait().await;
            ExitState::Cancelled
        }
    };
    // nothing the job started may outlive it
    kill_group(pid.map(|p| p as i32));
    let stdout = stdout.await.unwrap_or_default();
    let stderr = stderr.await.unwrap_or_default();
    let accesses = read_report(&launch.report)?;
    Ok(Captured { status, stdout, stderr, accesses })
}

pub(super) fn exit_state(status: ExitStatus) -> ExitState {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitState::Exited(code),
        (None, Some(signal)) => ExitState::Signaled(signal),
        (None, None) => ExitState::Exited(-1),
    }
}

pub(super) fn kill_group(pid: Option<i32>) {
    if let Some(pid) = pid.filter(|p| *p > 0) {
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

/// Run `cat /dev/null` with the library injected and expect it to report the open.
pub(super) fn self_check(strategy: Strategy, library: &Path) -> std::result::Result<(), String> {
    let var = match strategy {
        Strategy::Audit => "LD_AUDIT",
        Strategy::Preload => "LD_PRELOAD",
        other => return Err(format!("{} does not inject a library", other)),
    };
    if !library.is_file() {
        return Err(format!("interposer {} not found", library.display()));
    }
    let report = std::env::temp_dir().join(format!("autobuild-check-{}-{}.report", std::process::id(), strategy));
    let _ = fs::remove_file(&report);
    let mut env = BTreeMap::new();
    if let Ok(path) = std::env::var("PATH") {
        env.insert("PATH".to_string(), path);
    }
    let status = std::process::Command::new("/bin/sh")
        .args(["-c", "cat /dev/null"])
        .env_clear()
        .envs(&env)
        .env(var, library)
        .env(REPORT_ENV, &report)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| e.to_string())?;
    let records = read_report(&report).map_err(|e| e.to_string());
    let _ = fs::remove_file(&report);
    if !status.success() {
        return Err(format!("self-check job failed with {}", status));
    }
    if records?.iter().any(|r| r.path == "/dev/null") {
        Ok(())
    } else {
        Err("the dynamic linker did not load the interposer".to_string())
    }
}
