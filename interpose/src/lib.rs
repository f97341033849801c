//! File access interposition for autobuild jobs.
//!
//! Loaded into every process of a job, either preloaded (`LD_PRELOAD`), in
//! which case the wrappers below take precedence over libc, or as a
//! dynamic linker auditor (`LD_AUDIT`), in which case `la_symbind64`
//! redirects the bindings of the interesting libc symbols to them.
//!
//! Each wrapper calls the real function and appends one record per access
//! to the report file named by `AUTOBUILD_REPORT`:
//!
//! ```text
//! R+\t/abs/path
//! ```
//!
//! When `AUTOBUILD_TMP_VIEW` is set, paths under the view are redirected
//! into `AUTOBUILD_TMP_DIR`, following symbolic links in user land so that
//! links between the repository and the view resolve the same way for
//! every process of the job.

#![allow(clippy::missing_safety_doc)]

use std::cell::Cell;
use std::ffi::CStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{FILE, c_char, c_int, c_uint, mode_t, size_t, ssize_t};

const MAX_LINK_HOPS: usize = 40;

// ------------- Real functions -------------
#[derive(Clone, Copy)]
enum Sym {
    Open,
    Open64,
    Openat,
    Openat64,
    Creat,
    Creat64,
    Open2,
    Open64_2,
    Openat2,
    Openat64_2,
    Fopen,
    Fopen64,
    Access,
    Readlink,
    Execve,
    Unlink,
    Unlinkat,
    Rename,
    Renameat,
    Symlink,
    Symlinkat,
    Chdir,
}

const SYMS: [(Sym, &CStr); 22] = [
    (Sym::Open, c"open"),
    (Sym::Open64, c"open64"),
    (Sym::Openat, c"openat"),
    (Sym::Openat64, c"openat64"),
    (Sym::Creat, c"creat"),
    (Sym::Creat64, c"creat64"),
    (Sym::Open2, c"__open_2"),
    (Sym::Open64_2, c"__open64_2"),
    (Sym::Openat2, c"__openat_2"),
    (Sym::Openat64_2, c"__openat64_2"),
    (Sym::Fopen, c"fopen"),
    (Sym::Fopen64, c"fopen64"),
    (Sym::Access, c"access"),
    (Sym::Readlink, c"readlink"),
    (Sym::Execve, c"execve"),
    (Sym::Unlink, c"unlink"),
    (Sym::Unlinkat, c"unlinkat"),
    (Sym::Rename, c"rename"),
    (Sym::Renameat, c"renameat"),
    (Sym::Symlink, c"symlink"),
    (Sym::Symlinkat, c"symlinkat"),
    (Sym::Chdir, c"chdir"),
];

static REAL: [AtomicUsize; 22] = [const { AtomicUsize::new(0) }; 22];

// the address of the libc function, stored by la_symbind64 when auditing
fn real(sym: Sym) -> usize {
    let slot = &REAL[sym as usize];
    let mut address = slot.load(Ordering::Acquire);
    if address == 0 {
        address = unsafe { libc::dlsym(libc::RTLD_NEXT, SYMS[sym as usize].1.as_ptr()) } as usize;
        slot.store(address, Ordering::Release);
    }
    address
}

macro_rules! call_real {
    ($sym:expr, $ty:ty, $fail:expr, $($arg:expr),*) => {{
        let address = real($sym);
        if address == 0 {
            set_errno(libc::ENOSYS);
            $fail
        } else {
            let func: $ty = unsafe { std::mem::transmute::<usize, $ty>(address) };
            unsafe { func($($arg),*) }
        }
    }};
}

type OpenFn = unsafe extern "C" fn(*const c_char, c_int, mode_t) -> c_int;
type OpenatFn = unsafe extern "C" fn(c_int, *const c_char, c_int, mode_t) -> c_int;
type CreatFn = unsafe extern "C" fn(*const c_char, mode_t) -> c_int;
type Open2Fn = unsafe extern "C" fn(*const c_char, c_int) -> c_int;
type Openat2Fn = unsafe extern "C" fn(c_int, *const c_char, c_int) -> c_int;
type FopenFn = unsafe extern "C" fn(*const c_char, *const c_char) -> *mut FILE;
type AccessFn = unsafe extern "C" fn(*const c_char, c_int) -> c_int;
type ReadlinkFn = unsafe extern "C" fn(*const c_char, *mut c_char, size_t) -> ssize_t;
type ExecveFn = unsafe extern "C" fn(*const c_char, *const *const c_char, *const *const c_char) -> c_int;
type PathFn = unsafe extern "C" fn(*const c_char) -> c_int;
type UnlinkatFn = unsafe extern "C" fn(c_int, *const c_char, c_int) -> c_int;
type RenameFn = unsafe extern "C" fn(*const c_char, *const c_char) -> c_int;
type RenameatFn = unsafe extern "C" fn(c_int, *const c_char, c_int, *const c_char) -> c_int;
type SymlinkatFn = unsafe extern "C" fn(*const c_char, c_int, *const c_char) -> c_int;

fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}
fn set_errno(value: c_int) {
    unsafe { *libc::__errno_location() = value }
}

// ------------- Environment -------------
struct Settings {
    report: Option<Vec<u8>>,
    view: Option<Vec<u8>>,
    scratch: Option<Vec<u8>>,
}

fn var(name: &CStr) -> Option<Vec<u8>> {
    let value = unsafe { libc::getenv(name.as_ptr()) };
    if value.is_null() {
        return None;
    }
    let bytes = unsafe { CStr::from_ptr(value) }.to_bytes();
    (!bytes.is_empty()).then(|| bytes.to_vec())
}

fn settings() -> &'static Settings {
    static SETTINGS: OnceLock<Settings> = OnceLock::new();
    SETTINGS.get_or_init(|| Settings {
        report: var(c"AUTOBUILD_REPORT"),
        view: var(c"AUTOBUILD_TMP_VIEW"),
        scratch: var(c"AUTOBUILD_TMP_DIR"),
    })
}

thread_local! {
    static BUSY: Cell<bool> = const { Cell::new(false) };
}

// Runs `f` unless this thread is already inside a wrapper. Calls made
// while recording, or by libc on behalf of a wrapped call, go straight
// through.
fn guarded<R>(f: impl FnOnce() -> R, bypass: impl FnOnce() -> R) -> R {
    let entered = BUSY.try_with(|busy| !busy.replace(true)).unwrap_or(false);
    if !entered {
        return bypass();
    }
    let result = f();
    let _ = BUSY.try_with(|busy| busy.set(false));
    result
}

// ------------- Paths -------------
fn bytes_of(path: *const c_char) -> Option<Vec<u8>> {
    if path.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(path) }.to_bytes().to_vec())
}

fn cwd() -> Vec<u8> {
    let mut buffer = vec![0u8; libc::PATH_MAX as usize];
    let found = unsafe { libc::getcwd(buffer.as_mut_ptr() as *mut c_char, buffer.len()) };
    if found.is_null() {
        return b"/".to_vec();
    }
    let len = buffer.iter().position(|b| *b == 0).unwrap_or(buffer.len());
    buffer.truncate(len);
    buffer
}

fn read_link(path: &[u8]) -> Option<Vec<u8>> {
    let mut c_path = path.to_vec();
    c_path.push(0);
    let mut buffer = vec![0u8; libc::PATH_MAX as usize];
    let len = unsafe {
        libc::syscall(
            libc::SYS_readlinkat,
            libc::AT_FDCWD,
            c_path.as_ptr() as *const c_char,
            buffer.as_mut_ptr() as *mut c_char,
            buffer.len(),
        )
    };
    if len < 0 {
        return None;
    }
    buffer.truncate(len as usize);
    Some(buffer)
}

// Absolute form of `path` relative to `dirfd`.
fn absolute(dirfd: c_int, path: &[u8]) -> Vec<u8> {
    if path.first() == Some(&b'/') {
        return path.to_vec();
    }
    let mut base = if dirfd == libc::AT_FDCWD {
        cwd()
    } else {
        read_link(format!("/proc/self/fd/{}", dirfd).as_bytes()).unwrap_or_else(cwd)
    };
    if base.last() != Some(&b'/') {
        base.push(b'/');
    }
    base.extend_from_slice(path);
    base
}

fn under(path: &[u8], prefix: &[u8]) -> bool {
    path.starts_with(prefix) && (path.len() == prefix.len() || path[prefix.len()] == b'/')
}

fn remap(path: &[u8], view: &[u8], scratch: &[u8]) -> Vec<u8> {
    if under(path, view) {
        let mut mapped = scratch.to_vec();
        mapped.extend_from_slice(&path[view.len()..]);
        mapped
    } else {
        path.to_vec()
    }
}

// Where an absolute path really is once the view is redirected, solving
// links component by component. With `no_follow` the last component is
// kept as is.
fn solve(path: &[u8], no_follow: bool, view: &[u8], scratch: &[u8]) -> Vec<u8> {
    let mut todo: Vec<Vec<u8>> = path
        .split(|b| *b == b'/')
        .filter(|c| !c.is_empty() && *c != b".")
        .rev()
        .map(<[u8]>::to_vec)
        .collect();
    let mut real: Vec<u8> = Vec::new();
    let mut hops = 0;
    while let Some(component) = todo.pop() {
        if component == b".." {
            if let Some(slash) = real.iter().rposition(|b| *b == b'/') {
                real.truncate(slash);
            }
            continue;
        }
        real.push(b'/');
        real.extend_from_slice(&component);
        if todo.is_empty() && no_follow {
            break;
        }
        if hops >= MAX_LINK_HOPS {
            continue;
        }
        let Some(target) = read_link(&remap(&real, view, scratch)) else { continue };
        hops += 1;
        if let Some(slash) = real.iter().rposition(|b| *b == b'/') {
            real.truncate(slash);
        }
        if target.first() == Some(&b'/') {
            real.clear();
        }
        todo.extend(target.split(|b| *b == b'/').filter(|c| !c.is_empty() && *c != b".").rev().map(<[u8]>::to_vec));
    }
    if real.is_empty() {
        real.push(b'/');
    }
    remap(&real, view, scratch)
}

/// A path argument as the job named it (absolute) and, when the scratch
/// view redirects it, the path to use instead.
struct Arg {
    named: Vec<u8>,
    redirected: Option<Vec<u8>>,
}

impl Arg {
    fn new(dirfd: c_int, path: *const c_char, no_follow: bool) -> Option<Self> {
        let raw = bytes_of(path)?;
        let named = absolute(dirfd, &raw);
        let settings = settings();
        let redirected = match (&settings.view, &settings.scratch) {
            (Some(view), Some(scratch)) => {
                let solved = solve(&named, no_follow, view, scratch);
                let mut plain = named.clone();
                while plain.len() > 1 && plain.last() == Some(&b'/') {
                    plain.pop();
                }
                (solved != plain).then(|| {
                    let mut solved = solved;
                    solved.push(0);
                    solved
                })
            }
            _ => None,
        };
        Some(Self { named, redirected })
    }
    // the pointer to hand to libc
    fn pointer(&self, original: *const c_char) -> *const c_char {
        match &self.redirected {
            Some(path) => path.as_ptr() as *const c_char,
            None => original,
        }
    }
    fn dirfd(&self, original: c_int) -> c_int {
        if self.redirected.is_some() { libc::AT_FDCWD } else { original }
    }
}

// ------------- Report -------------
fn report(records: &[(u8, bool, &[u8])]) {
    let Some(report) = &settings().report else { return };
    let mut line = Vec::new();
    for (code, ok, path) in records {
        if path.contains(&b'\n') {
            continue;
        }
        line.push(*code);
        line.push(if *ok { b'+' } else { b'-' });
        line.push(b'\t');
        line.extend_from_slice(path);
        line.push(b'\n');
    }
    if line.is_empty() {
        return;
    }
    let mut c_report = report.clone();
    c_report.push(0);
    unsafe {
        let fd = libc::syscall(
            libc::SYS_openat,
            libc::AT_FDCWD,
            c_report.as_ptr() as *const c_char,
            libc::O_WRONLY | libc::O_APPEND | libc::O_CREAT | libc::O_CLOEXEC,
            0o644 as mode_t,
        ) as c_int;
        if fd >= 0 {
            libc::syscall(libc::SYS_write, fd, line.as_ptr(), line.len());
            libc::syscall(libc::SYS_close, fd);
        }
    }
}

fn open_codes(flags: c_int) -> &'static [u8] {
    let follow = flags & libc::O_NOFOLLOW == 0;
    let mode = flags & libc::O_ACCMODE;
    match () {
        _ if flags & libc::O_DIRECTORY != 0 => if follow { b"S" } else { b"s" },
        _ if mode == libc::O_RDONLY && flags & (libc::O_CREAT | libc::O_TRUNC) == 0 => if follow { b"R" } else { b"r" },
        _ if mode == libc::O_RDWR && flags & libc::O_TRUNC == 0 => if follow { b"RW" } else { b"rw" },
        _ => if follow { b"W" } else { b"w" },
    }
}

fn fopen_codes(mode: *const c_char) -> &'static [u8] {
    let mode = bytes_of(mode).unwrap_or_default();
    match (mode.first(), mode.contains(&b'+')) {
        (Some(b'r'), false) => b"R",
        (Some(b'r'), true) => b"RW",
        _ => b"W",
    }
}

// Record `codes` for `arg` with the outcome `ok`, keeping errno intact.
fn record(codes: &[u8], arg: &Option<Arg>, ok: bool) {
    let Some(arg) = arg else { return };
    let saved = errno();
    let records: Vec<(u8, bool, &[u8])> = codes.iter().map(|c| (*c, ok, arg.named.as_slice())).collect();
    report(&records);
    set_errno(saved);
}

fn pointer(arg: &Option<Arg>, original: *const c_char) -> *const c_char {
    arg.as_ref().map_or(original, |a| a.pointer(original))
}
fn dirfd(arg: &Option<Arg>, original: c_int) -> c_int {
    arg.as_ref().map_or(original, |a| a.dirfd(original))
}

// ------------- Wrappers -------------
fn wrap_open(sym: Sym, dirfd_in: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    guarded(
        || {
            let arg = Arg::new(dirfd_in, path, flags & libc::O_NOFOLLOW != 0);
            let fd = match sym {
                Sym::Openat | Sym::Openat64 => {
                    call_real!(sym, OpenatFn, -1, dirfd(&arg, dirfd_in), pointer(&arg, path), flags, mode)
                }
                Sym::Openat2 | Sym::Openat64_2 => {
                    call_real!(sym, Openat2Fn, -1, dirfd(&arg, dirfd_in), pointer(&arg, path), flags)
                }
                Sym::Open2 | Sym::Open64_2 => call_real!(sym, Open2Fn, -1, pointer(&arg, path), flags),
                _ => call_real!(sym, OpenFn, -1, pointer(&arg, path), flags, mode),
            };
            record(open_codes(flags), &arg, fd >= 0);
            fd
        },
        || match sym {
            Sym::Openat | Sym::Openat64 => call_real!(sym, OpenatFn, -1, dirfd_in, path, flags, mode),
            Sym::Openat2 | Sym::Openat64_2 => call_real!(sym, Openat2Fn, -1, dirfd_in, path, flags),
            Sym::Open2 | Sym::Open64_2 => call_real!(sym, Open2Fn, -1, path, flags),
            _ => call_real!(sym, OpenFn, -1, path, flags, mode),
        },
    )
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    wrap_open(Sym::Open, libc::AT_FDCWD, path, flags, mode)
}
#[unsafe(no_mangle)]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    wrap_open(Sym::Open64, libc::AT_FDCWD, path, flags, mode)
}
#[unsafe(no_mangle)]
pub unsafe extern "C" fn openat(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    wrap_open(Sym::Openat, dirfd, path, flags, mode)
}
#[unsafe(no_mangle)]
pub unsafe extern "C" fn openat64(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    wrap_open(Sym::Openat64, dirfd, path, flags, mode)
}
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __open_2(path: *const c_char, flags: c_int) -> c_int {
    wrap_open(Sym::Open2, libc::AT_FDCWD, path, flags, 0)
}
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __open64_2(path: *const c_char, flags: c_int) -> c_int {
    wrap_open(Sym::Open64_2, libc::AT_FDCWD, path, flags, 0)
}
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __openat_2(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int {
    wrap_open(Sym::Openat2, dirfd, path, flags, 0)
}
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __openat64_2(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int {
    wrap_open(Sym::Openat64_2, dirfd, path, flags, 0)
}

fn wrap_creat(sym: Sym, path: *const c_char, mode: mode_t) -> c_int {
    guarded(
        || {
            let arg = Arg::new(libc::AT_FDCWD, path, false);
            let fd = call_real!(sym, CreatFn, -1, pointer(&arg, path), mode);
            record(b"W", &arg, fd >= 0);
            fd
        },
        || call_real!(sym, CreatFn, -1, path, mode),
    )
}
#[unsafe(no_mangle)]
pub unsafe extern "C" fn creat(path: *const c_char, mode: mode_t) -> c_int {
    wrap_creat(Sym::Creat, path, mode)
}
#[unsafe(no_mangle)]
pub unsafe extern "C" fn creat64(path: *const c_char, mode: mode_t) -> c_int {
    wrap_creat(Sym::Creat64, path, mode)
}

fn wrap_fopen(sym: Sym, path: *const c_char, mode: *const c_char) -> *mut FILE {
    guarded(
        || {
            let arg = Arg::new(libc::AT_FDCWD, path, false);
            let file = call_real!(sym, FopenFn, std::ptr::null_mut(), pointer(&arg, path), mode);
            record(fopen_codes(mode), &arg, !file.is_null());
            file
        },
        || call_real!(sym, FopenFn, std::ptr::null_mut(), path, mode),
    )
}
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fopen(path: *const c_char, mode: *const c_char) -> *mut FILE {
    wrap_fopen(Sym::Fopen, path, mode)
}
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fopen64(path: *const c_char, mode: *const c_char) -> *mut FILE {
    wrap_fopen(Sym::Fopen64, path, mode)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn access(path: *const c_char, amode: c_int) -> c_int {
    guarded(
        || {
            let arg = Arg::new(libc::AT_FDCWD, path, false);
            let result = call_real!(Sym::Access, AccessFn, -1, pointer(&arg, path), amode);
            record(b"S", &arg, result == 0);
            result
        },
        || call_real!(Sym::Access, AccessFn, -1, path, amode),
    )
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn readlink(path: *const c_char, buf: *mut c_char, size: size_t) -> ssize_t {
    guarded(
        || {
            let arg = Arg::new(libc::AT_FDCWD, path, true);
            let result = call_real!(Sym::Readlink, ReadlinkFn, -1, pointer(&arg, path), buf, size);
            record(b"l", &arg, result >= 0);
            result
        },
        || call_real!(Sym::Readlink, ReadlinkFn, -1, path, buf, size),
    )
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn execve(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    guarded(
        || {
            let arg = Arg::new(libc::AT_FDCWD, path, false);
            let target = pointer(&arg, path);
            // on success nothing comes back, so record before
            let found = unsafe { libc::syscall(libc::SYS_faccessat, libc::AT_FDCWD, target, libc::F_OK, 0) } == 0;
            record(b"R", &arg, found);
            call_real!(Sym::Execve, ExecveFn, -1, target, argv, envp)
        },
        || call_real!(Sym::Execve, ExecveFn, -1, path, argv, envp),
    )
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn unlink(path: *const c_char) -> c_int {
    guarded(
        || {
            let arg = Arg::new(libc::AT_FDCWD, path, true);
            let result = call_real!(Sym::Unlink, PathFn, -1, pointer(&arg, path));
            record(b"u", &arg, result == 0);
            result
        },
        || call_real!(Sym::Unlink, PathFn, -1, path),
    )
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn unlinkat(dirfd_in: c_int, path: *const c_char, flags: c_int) -> c_int {
    guarded(
        || {
            let arg = Arg::new(dirfd_in, path, true);
            let result = call_real!(Sym::Unlinkat, UnlinkatFn, -1, dirfd(&arg, dirfd_in), pointer(&arg, path), flags);
            // removing a directory is no access to a file
            if flags & libc::AT_REMOVEDIR == 0 {
                record(b"u", &arg, result == 0);
            }
            result
        },
        || call_real!(Sym::Unlinkat, UnlinkatFn, -1, dirfd_in, path, flags),
    )
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn rename(old: *const c_char, new: *const c_char) -> c_int {
    guarded(
        || {
            let from = Arg::new(libc::AT_FDCWD, old, true);
            let to = Arg::new(libc::AT_FDCWD, new, true);
            let result = call_real!(Sym::Rename, RenameFn, -1, pointer(&from, old), pointer(&to, new));
            record(b"u", &from, result == 0);
            record(b"w", &to, result == 0);
            result
        },
        || call_real!(Sym::Rename, RenameFn, -1, old, new),
    )
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn renameat(olddirfd: c_int, old: *const c_char, newdirfd: c_int, new: *const c_char) -> c_int {
    guarded(
        || {
            let from = Arg::new(olddirfd, old, true);
            let to = Arg::new(newdirfd, new, true);
            let result = call_real!(
                Sym::Renameat,
                RenameatFn,
                -1,
                dirfd(&from, olddirfd),
                pointer(&from, old),
                dirfd(&to, newdirfd),
                pointer(&to, new)
            );
            record(b"u", &from, result == 0);
            record(b"w", &to, result == 0);
            result
        },
        || call_real!(Sym::Renameat, RenameatFn, -1, olddirfd, old, newdirfd, new),
    )
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn symlink(target: *const c_char, link: *const c_char) -> c_int {
    guarded(
        || {
            let arg = Arg::new(libc::AT_FDCWD, link, true);
            let result = call_real!(Sym::Symlink, RenameFn, -1, target, pointer(&arg, link));
            record(b"w", &arg, result == 0);
            result
        },
        || call_real!(Sym::Symlink, RenameFn, -1, target, link),
    )
}

// what coreutils ln calls
#[unsafe(no_mangle)]
pub unsafe extern "C" fn symlinkat(target: *const c_char, newdirfd: c_int, link: *const c_char) -> c_int {
    guarded(
        || {
            let arg = Arg::new(newdirfd, link, true);
            let result = call_real!(Sym::Symlinkat, SymlinkatFn, -1, target, dirfd(&arg, newdirfd), pointer(&arg, link));
            record(b"w", &arg, result == 0);
            result
        },
        || call_real!(Sym::Symlinkat, SymlinkatFn, -1, target, newdirfd, link),
    )
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn chdir(path: *const c_char) -> c_int {
    guarded(
        || {
            let arg = Arg::new(libc::AT_FDCWD, path, false);
            call_real!(Sym::Chdir, PathFn, -1, pointer(&arg, path))
        },
        || call_real!(Sym::Chdir, PathFn, -1, path),
    )
}

// ------------- Auditing -------------
const LAV_CURRENT: c_uint = 1;
const LA_FLG_BINDTO: c_uint = 0x01;
const LA_FLG_BINDFROM: c_uint = 0x02;

#[repr(C)]
pub struct Elf64Sym {
    st_name: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
    st_value: u64,
    st_size: u64,
}

// leading fields of the dynamic linker's struct link_map
#[repr(C)]
pub struct LinkMap {
    l_addr: usize,
    l_name: *const c_char,
    l_ld: *mut libc::c_void,
    l_next: *mut LinkMap,
    l_prev: *mut LinkMap,
}

#[unsafe(no_mangle)]
pub extern "C" fn la_version(version: c_uint) -> c_uint {
    if version == 0 { 0 } else { LAV_CURRENT }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn la_objopen(map: *mut LinkMap, _lmid: libc::c_long, _cookie: *mut usize) -> c_uint {
    if !map.is_null() {
        let name = unsafe { (*map).l_name };
        if let Some(path) = bytes_of(name).filter(|p| p.first() == Some(&b'/')) {
            let saved = errno();
            report(&[(b'R', true, path.as_slice())]);
            set_errno(saved);
        }
    }
    LA_FLG_BINDTO | LA_FLG_BINDFROM
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn la_symbind64(
    sym: *mut Elf64Sym,
    _ndx: c_uint,
    _refcook: *mut usize,
    _defcook: *mut usize,
    _flags: *mut c_uint,
    symname: *const c_char,
) -> usize {
    let original = unsafe { (*sym).st_value } as usize;
    if symname.is_null() {
        return original;
    }
    let name = unsafe { CStr::from_ptr(symname) };
    let Some((sym_id, _)) = SYMS.iter().find(|(_, n)| *n == name) else {
        return original;
    };
    REAL[*sym_id as usize].store(original, Ordering::Release);
    wrapper(*sym_id)
}

fn wrapper(sym: Sym) -> usize {
    match sym {
        Sym::Open => open as usize,
        Sym::Open64 => open64 as usize,
        Sym::Openat => openat as usize,
        Sym::Openat64 => openat64 as usize,
        Sym::Creat => creat as usize,
        Sym::Creat64 => creat64 as usize,
        Sym::Open2 => __open_2 as usize,
        Sym::Open64_2 => __open64_2 as usize,
        Sym::Openat2 => __openat_2 as usize,
        Sym::Openat64_2 => __openat64_2 as usize,
        Sym::Fopen => fopen as usize,
        Sym::Fopen64 => fopen64 as usize,
        Sym::Access => access as usize,
        Sym::Readlink => readlink as usize,
        Sym::Execve => execve as usize,
        Sym::Unlink => unlink as usize,
        Sym::Unlinkat => unlinkat as usize,
        Sym::Rename => rename as usize,
        Sym::Renameat => renameat as usize,
        Sym::Symlink => symlink as usize,
        Sym::Symlinkat => symlinkat as usize,
        Sym::Chdir => chdir as usize,
    }
}
