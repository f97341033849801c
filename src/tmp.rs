//! Job-private scratch directories.
//!
//! Every running job gets a fresh directory from the [`ScratchAllocator`].
//! Names combine the process id with a sequence number so that engines and
//! workers sharing a scratch root never collide, and the directory is
//! created with `create_dir` so an existing one is never reused. The
//! directory and the job's report file go away when the [`ScratchDir`] is
//! dropped, whatever the outcome of the job.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// How a job sees its scratch directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TmpMode {
    /// `$TMPDIR` is the private directory itself.
    Private,
    /// `$TMPDIR` is this fixed path, redirected into the private directory.
    View(PathBuf),
}

impl TmpMode {
    pub fn view(&self) -> Option<&Path> {
        match self {
            Self::Private => None,
            Self::View(path) => Some(path),
        }
    }
    /// What the job gets in `$TMPDIR`.
    pub fn tmpdir(&self, scratch: &Path) -> PathBuf {
        match self {
            Self::Private => scratch.to_path_buf(),
            Self::View(path) => path.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ScratchAllocator {
    root: PathBuf,
    sequence: AtomicU64,
}

impl ScratchAllocator {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self { root: root.to_path_buf(), sequence: AtomicU64::new(0) })
    }
    pub fn root(&self) -> &Path {
        &self.root
    }
    pub fn allocate(&self) -> Result<ScratchDir> {
        loop {
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
            let name = format!("{}-{}", std::process::id(), sequence);
            let dir = self.root.join(&name);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    let report = self.root.join(format!("{}.report", name));
                    let _ = fs::remove_file(&report);
                    debug!(dir = %dir.display(), "Scratch directory allocated");
                    return Ok(ScratchDir { dir, report });
                }
                // left behind by an earlier process with the same pid
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[derive(Debug)]
pub struct ScratchDir {
    dir: PathBuf,
    report: PathBuf,
}

impl ScratchDir {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
    /// Report file the capture layer appends access records to.
    pub fn report(&self) -> &Path {
        &self.report
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "Cannot discard scratch directory");
            }
        }
        let _ = fs::remove_file(&self.report);
    }
}
