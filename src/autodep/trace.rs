// ptrace based capture. Every tracee stops at system call entry and exit;
// paths are read from the tracee's memory at entry and recorded with the
// outcome seen at exit. Forked children are traced automatically.
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinError;

use super::inject::kill_group;
use super::{Capture, Captured, ExitState, Launch, Strategy};
use crate::access::read_report;
use crate::error::{EngineError, Result};
use crate::interface::CancelToken;

pub struct TraceCapture;

impl Capture for TraceCapture {
    fn strategy(&self) -> Strategy {
        Strategy::Trace
    }
    fn run(&self, launch: Launch, cancel: CancelToken) -> BoxFuture<'static, Result<Captured>> {
        Box::pin(async move {
            let leader = Arc::new(AtomicI32::new(0));
            // the tracer must be the thread that forked the job
            let mut job = tokio::task::spawn_blocking({
                let leader = Arc::clone(&leader);
                let launch = launch.clone();
                move || imp::run(&launch, &leader)
            });
            tokio::select! {
                joined = &mut job => return finish(joined, &launch, false),
                _ = cancel.cancelled() => {}
            }
            loop {
                let pid = leader.load(Ordering::SeqCst);
                if pid != 0 {
                    kill_group(Some(pid));
                    break;
                }
                if job.is_finished() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            finish(job.await, &launch, true)
        })
    }
}

fn finish(joined: std::result::Result<Result<Captured>, JoinError>, launch: &Launch, cancelled: bool) -> Result<Captured> {
    let mut captured = joined.map_err(|e| EngineError::Invariant(format!("tracer failed: {}", e)))??;
    // explicit declarations still travel through the report file
    captured.accesses.extend(read_report(&launch.report)?);
    if cancelled {
        captured.status = ExitState::Cancelled;
    }
    Ok(captured)
}

pub(super) fn self_check() -> std::result::Result<(), String> {
    imp::self_check()
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod imp {
    use std::collections::{HashMap, HashSet};
    use std::fs::File;
    use std::io::{self, Read};
    use std::os::unix::fs::FileExt;
    use std::os::unix::process::CommandExt;
    use std::path::PathBuf;
    use std::process::{Command, Stdio};
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::thread;

    use nix::errno::Errno;
    use nix::libc;
    use nix::sys::ptrace::{self, Options};
    use nix::sys::signal::{Signal, killpg};
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
    use nix::unistd::Pid;
    use tracing::debug;

    use crate::access::{AccessKind, AccessRecord};
    use crate::autodep::{Captured, ExitState, Launch};
    use crate::error::{EngineError, Result};

    const MAX_PATH: usize = 4096;

    pub fn run(launch: &Launch, leader: &AtomicI32) -> Result<Captured> {
        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .current_dir(&launch.cwd)
            .env_clear()
            .envs(&launch.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        // SAFETY: only an async-signal-safe system call runs between fork and exec
        unsafe {
            command.pre_exec(|| ptrace::traceme().map_err(io::Error::from));
        }
        let mut child = command.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);
        leader.store(pid.as_raw(), Ordering::SeqCst);
        debug!(pid = pid.as_raw(), "Traced job started");

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let mut tracer = Tracer::new(pid);
        let status = match tracer.follow() {
            Ok(status) => status,
            Err(e) => {
                let _ = killpg(pid, Signal::SIGKILL);
                return Err(e);
            }
        };
        Ok(Captured {
            status,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
            accesses: tracer.records,
        })
    }

    pub fn self_check() -> std::result::Result<(), String> {
        let launch = Launch {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), ":".to_string()],
            cwd: PathBuf::from("/"),
            env: Default::default(),
            report: PathBuf::from("/dev/null"),
        };
        match run(&launch, &AtomicI32::new(0)) {
            Ok(captured) if captured.status.success() => Ok(()),
            Ok(captured) => Err(format!("traced self-check ended with {}", captured.status)),
            Err(e) => Err(e.to_string()),
        }
    }

    fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            if let Some(mut pipe) = pipe {
                let _ = pipe.read_to_end(&mut buffer);
            }
            buffer
        })
    }

    #[derive(Default)]
    struct Pending {
        accesses: Vec<(AccessKind, String, bool)>,
    }

    impl Pending {
        fn push(&mut self, kind: AccessKind, path: Option<String>, follow: bool) {
            if let Some(path) = path {
                self.accesses.push((kind, path, follow));
            }
        }
        fn open(&mut self, path: Option<String>, flags: i32) {
            let follow = flags & libc::O_NOFOLLOW == 0;
            let mode = flags & libc::O_ACCMODE;
            if flags & libc::O_DIRECTORY != 0 {
                self.push(AccessKind::Stat, path, follow);
            } else if mode == libc::O_RDONLY && flags & (libc::O_CREAT | libc::O_TRUNC) == 0 {
                self.push(AccessKind::Read, path, follow);
            } else {
                if mode == libc::O_RDWR && flags & libc::O_TRUNC == 0 {
                    self.push(AccessKind::Read, path.clone(), follow);
                }
                self.push(AccessKind::Write, path, follow);
            }
        }
    }

    struct Tracer {
        leader: Pid,
        // None between system calls, Some while stopped inside one
        tracees: HashMap<Pid, Option<Pending>>,
        starting: HashSet<Pid>,
        early: HashSet<Pid>,
        records: Vec<AccessRecord>,
    }

    impl Tracer {
        fn new(leader: Pid) -> Self {
            Self {
                leader,
                tracees: HashMap::new(),
                starting: HashSet::new(),
                early: HashSet::new(),
                records: Vec::new(),
            }
        }

        fn follow(&mut self) -> Result<ExitState> {
            match waitpid(self.leader, Some(WaitPidFlag::__WALL))? {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
                WaitStatus::Exited(_, code) => return Ok(ExitState::Exited(code)),
                WaitStatus::Signaled(_, signal, _) => return Ok(ExitState::Signaled(signal as i32)),
                other => return Err(EngineError::Invariant(format!("unexpected first stop {:?}", other))),
            }
            let options = Options::PTRACE_O_TRACESYSGOOD
                | Options::PTRACE_O_TRACEFORK
                | Options::PTRACE_O_TRACEVFORK
                | Options::PTRACE_O_TRACECLONE
                | Options::PTRACE_O_TRACEEXEC
                | Options::PTRACE_O_EXITKILL;
            ptrace::setoptions(self.leader, options)?;
            self.tracees.insert(self.leader, None);
            ptrace::syscall(self.leader, None)?;

            let mut status = None;
            loop {
                let event = match waitpid(None::<Pid>, Some(WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD)) {
                    Ok(event) => event,
                    Err(Errno::EINTR) => continue,
                    Err(Errno::ECHILD) => break,
                    Err(e) => return Err(e.into()),
                };
                match event {
                    WaitStatus::PtraceSyscall(pid) => {
                        self.on_syscall(pid);
                        resume(pid, None);
                    }
                    WaitStatus::PtraceEvent(pid, _, event) => {
                        let forked = [libc::PTRACE_EVENT_FORK, libc::PTRACE_EVENT_VFORK, libc::PTRACE_EVENT_CLONE];
                        if forked.contains(&event) {
                            if let Ok(child) = ptrace::getevent(pid) {
                                let child = Pid::from_raw(child as i32);
                                if !self.early.remove(&child) {
                                    self.starting.insert(child);
                                }
                            }
                        }
                        resume(pid, None);
                    }
                    WaitStatus::Stopped(pid, signal) => {
                        let known = self.tracees.contains_key(&pid);
                        let expected = signal == Signal::SIGSTOP && self.starting.remove(&pid);
                        if expected || (signal == Signal::SIGSTOP && !known) {
                            // stopped before its parent reported the fork
                            if !expected {
                                self.early.insert(pid);
                            }
                            self.tracees.insert(pid, None);
                            resume(pid, None);
                        } else {
                            resume(pid, Some(signal));
                        }
                    }
                    WaitStatus::Exited(pid, code) => {
                        self.tracees.remove(&pid);
                        if pid == self.leader {
                            status = Some(ExitState::Exited(code));
                        }
                    }
                    WaitStatus::Signaled(pid, signal, _) => {
                        self.tracees.remove(&pid);
                        if pid == self.leader {
                            status = Some(ExitState::Signaled(signal as i32));
                        }
                    }
                    _ => {}
                }
            }
            status.ok_or_else(|| EngineError::Invariant("traced job vanished".into()))
        }

        fn on_syscall(&mut self, pid: Pid) {
            let Ok(regs) = ptrace::getregs(pid) else { return };
            let state = self.tracees.entry(pid).or_insert(None);
            match state.take() {
                None => *state = Some(decode(pid, &regs)),
                Some(pending) => {
                    let ok = (regs.rax as i64) >= 0;
                    for (kind, path, follow) in pending.accesses {
                        let record = AccessRecord::new(kind, path, ok);
                        self.records.push(if follow { record } else { record.no_follow() });
                    }
                }
            }
        }
    }

    fn resume(pid: Pid, signal: Option<Signal>) {
        // the tracee may have been killed meanwhile
        let _ = ptrace::syscall(pid, signal);
    }

    fn decode(pid: Pid, regs: &libc::user_regs_struct) -> Pending {
        let a = [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9];
        let cwd = libc::AT_FDCWD;
        let mut pending = Pending::default();
        match regs.orig_rax as libc::c_long {
            libc::SYS_open => pending.open(path_at(pid, cwd, a[0]), a[1] as i32),
            libc::SYS_openat => pending.open(path_at(pid, a[0] as i32, a[1]), a[2] as i32),
            libc::SYS_creat => pending.push(AccessKind::Write, path_at(pid, cwd, a[0]), true),
            libc::SYS_truncate => pending.push(AccessKind::Write, path_at(pid, cwd, a[0]), true),
            libc::SYS_stat | libc::SYS_access => pending.push(AccessKind::Stat, path_at(pid, cwd, a[0]), true),
            libc::SYS_lstat => pending.push(AccessKind::Stat, path_at(pid, cwd, a[0]), false),
            libc::SYS_newfstatat => {
                let follow = (a[3] as i32) & libc::AT_SYMLINK_NOFOLLOW == 0;
                pending.push(AccessKind::Stat, path_at(pid, a[0] as i32, a[1]), follow);
            }
            libc::SYS_statx => {
                let follow = (a[2] as i32) & libc::AT_SYMLINK_NOFOLLOW == 0;
                pending.push(AccessKind::Stat, path_at(pid, a[0] as i32, a[1]), follow);
            }
            libc::SYS_faccessat | libc::SYS_faccessat2 => {
                pending.push(AccessKind::Stat, path_at(pid, a[0] as i32, a[1]), true)
            }
            libc::SYS_readlink => pending.push(AccessKind::Link, path_at(pid, cwd, a[0]), false),
            libc::SYS_readlinkat => pending.push(AccessKind::Link, path_at(pid, a[0] as i32, a[1]), false),
            libc::SYS_execve => pending.push(AccessKind::Read, path_at(pid, cwd, a[0]), true),
            libc::SYS_execveat => pending.push(AccessKind::Read, path_at(pid, a[0] as i32, a[1]), true),
            libc::SYS_unlink => pending.push(AccessKind::Unlink, path_at(pid, cwd, a[0]), false),
            libc::SYS_unlinkat => pending.push(AccessKind::Unlink, path_at(pid, a[0] as i32, a[1]), false),
            libc::SYS_rename => {
                pending.push(AccessKind::Unlink, path_at(pid, cwd, a[0]), false);
                pending.push(AccessKind::Write, path_at(pid, cwd, a[1]), false);
            }
            libc::SYS_renameat | libc::SYS_renameat2 => {
                pending.push(AccessKind::Unlink, path_at(pid, a[0] as i32, a[1]), false);
                pending.push(AccessKind::Write, path_at(pid, a[2] as i32, a[3]), false);
            }
            libc::SYS_link => {
                pending.push(AccessKind::Read, path_at(pid, cwd, a[0]), false);
                pending.push(AccessKind::Write, path_at(pid, cwd, a[1]), false);
            }
            libc::SYS_symlink => pending.push(AccessKind::Write, path_at(pid, cwd, a[1]), false),
            libc::SYS_symlinkat => pending.push(AccessKind::Write, path_at(pid, a[1] as i32, a[2]), false),
            _ => {}
        }
        pending
    }

    // absolute path of a path argument, relative ones being taken from the
    // directory file descriptor or the tracee's working directory
    fn path_at(pid: Pid, dirfd: i32, address: u64) -> Option<String> {
        let path = read_string(pid, address)?;
        if path.is_empty() {
            return None;
        }
        if path.starts_with('/') {
            return Some(path);
        }
        let base = if dirfd == libc::AT_FDCWD {
            format!("/proc/{}/cwd", pid)
        } else {
            format!("/proc/{}/fd/{}", pid, dirfd)
        };
        let base = std::fs::read_link(base).ok()?;
        Some(base.join(path).to_string_lossy().into_owned())
    }

    fn read_string(pid: Pid, address: u64) -> Option<String> {
        if address == 0 {
            return None;
        }
        let memory = File::open(format!("/proc/{}/mem", pid)).ok()?;
        let mut bytes = Vec::new();
        let mut chunk = [0u8; 256];
        let mut offset = address;
        while bytes.len() < MAX_PATH {
            let read = memory.read_at(&mut chunk, offset).ok()?;
            if read == 0 {
                return None;
            }
            if let Some(end) = chunk[..read].iter().position(|b| *b == 0) {
                bytes.extend_from_slice(&chunk[..end]);
                return Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.extend_from_slice(&chunk[..read]);
            offset += read as u64;
        }
        None
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
mod imp {
    use std::sync::atomic::AtomicI32;

    use crate::autodep::{Captured, Launch};
    use crate::error::{EngineError, Result};

    pub fn run(_launch: &Launch, _leader: &AtomicI32) -> Result<Captured> {
        Err(EngineError::Config("the trace strategy needs Linux on x86_64".into()))
    }

    pub fn self_check() -> std::result::Result<(), String> {
        Err("the trace strategy needs Linux on x86_64".into())
    }
}
