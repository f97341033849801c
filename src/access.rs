//! File accesses observed while a job runs.
//!
//! Every capture strategy ends up with the same list of [`AccessRecord`]s.
//! Processes outside the engine (the interposition library, the `depend`
//! command) hand them over through a report file named by
//! [`REPORT_ENV`], one record per line:
//!
//! ```text
//! R+\t/abs/path     read that succeeded
//! w+\t/abs/path     write that does not follow a final link
//! ```
//!
//! The first character is the [`AccessKind`] code, lower case when the
//! final path component is not followed. The second is `+` for success and
//! `-` for failure.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EngineError, Result};

pub const REPORT_ENV: &str = "AUTOBUILD_REPORT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKind {
    Read,
    Stat,
    Link,
    Write,
    Unlink,
    Explicit,
}

impl AccessKind {
    pub fn code(self) -> char {
        match self {
            Self::Read => 'R',
            Self::Stat => 'S',
            Self::Link => 'L',
            Self::Write => 'W',
            Self::Unlink => 'U',
            Self::Explicit => 'E',
        }
    }
    pub fn from_code(code: char) -> Option<Self> {
        match code.to_ascii_uppercase() {
            'R' => Some(Self::Read),
            'S' => Some(Self::Stat),
            'L' => Some(Self::Link),
            'W' => Some(Self::Write),
            'U' => Some(Self::Unlink),
            'E' => Some(Self::Explicit),
            _ => None,
        }
    }
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::Unlink)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub kind: AccessKind,
    pub path: String,
    pub ok: bool,
    #[serde(default = "follows")]
    pub follow: bool,
}
fn follows() -> bool {
    true
}

impl AccessRecord {
    pub fn new(kind: AccessKind, path: impl Into<String>, ok: bool) -> Self {
        let follow = !matches!(kind, AccessKind::Link | AccessKind::Unlink);
        Self { kind, path: path.into(), ok, follow }
    }
    pub fn no_follow(mut self) -> Self {
        self.follow = false;
        self
    }
    pub fn to_line(&self) -> String {
        let code = if self.follow { self.kind.code() } else { self.kind.code().to_ascii_lowercase() };
        format!("{}{}\t{}\n", code, if self.ok { '+' } else { '-' }, self.path)
    }
    pub fn parse_line(line: &str) -> Result<Self> {
        let bad = || EngineError::Protocol(format!("bad access record '{}'", line));
        let (head, path) = line.split_once('\t').ok_or_else(bad)?;
        let mut chars = head.chars();
        let code = chars.next().ok_or_else(bad)?;
        let kind = AccessKind::from_code(code).ok_or_else(bad)?;
        let ok = match chars.next() {
            Some('+') => true,
            Some('-') => false,
            _ => return Err(bad()),
        };
        Ok(Self { kind, path: path.to_string(), ok, follow: code.is_ascii_uppercase() })
    }
}

/// Records in a report file, in the order they were appended. A missing
/// file means nothing was reported. A torn last line is skipped, and so is
/// a line whose path is not valid UTF-8.
pub fn read_report(path: &Path) -> Result<Vec<AccessRecord>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let complete = match bytes.iter().rposition(|b| *b == b'\n') {
        Some(end) => &bytes[..end],
        None => &[][..],
    };
    let mut records = Vec::new();
    for line in complete.split(|b| *b == b'\n').filter(|line| !line.is_empty()) {
        match std::str::from_utf8(line) {
            Ok(line) => records.push(AccessRecord::parse_line(line)?),
            Err(_) => warn!(
                report = %path.display(),
                line = %String::from_utf8_lossy(line),
                "Access to a path that is not UTF-8, ignored"
            ),
        }
    }
    Ok(records)
}

/// Append records in one write, so lines from concurrent processes do not interleave.
pub fn append_report(path: &Path, records: &[AccessRecord]) -> Result<()> {
    let mut buffer = String::new();
    for record in records {
        if record.path.contains('\n') {
            continue;
        }
        buffer.push_str(&record.to_line());
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(buffer.as_bytes())?;
    Ok(())
}

/// Declare dependencies from inside a running job. Relative paths are
/// taken from the current directory. The paths need not exist.
pub fn declare_dependencies(paths: &[PathBuf]) -> Result<()> {
    let report = std::env::var_os(REPORT_ENV)
        .ok_or_else(|| EngineError::Config(format!("{} is not set, not running inside a job", REPORT_ENV)))?;
    let cwd = std::env::current_dir()?;
    let records: Vec<AccessRecord> = paths
        .iter()
        .map(|p| {
            let abs = if p.is_absolute() { p.clone() } else { cwd.join(p) };
            let ok = fs::symlink_metadata(&abs).is_ok();
            AccessRecord::new(AccessKind::Explicit, abs.to_string_lossy(), ok)
        })
        .collect();
    append_report(Path::new(&report), &records)
}
