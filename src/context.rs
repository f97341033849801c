//! What a callback rule sees while it runs.
//!
//! Callbacks run inside the engine process, so no capture strategy can
//! observe them. Instead every file operation goes through the
//! [`JobContext`], which records it the way the interposition library would
//! and redirects the scratch view like it does.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::access::{AccessKind, AccessRecord};
use crate::error::{EngineError, Result};
use crate::interface::CancelToken;
use crate::links::PathSolver;
use crate::pattern::Stems;

pub struct JobContext {
    name: String,
    stems: Stems,
    targets: BTreeMap<String, String>,
    deps: BTreeMap<String, String>,
    tmpdir: PathBuf,
    solver: PathSolver,
    records: Vec<AccessRecord>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    cancel: CancelToken,
}

impl JobContext {
    pub(crate) fn new(
        name: &str,
        stems: Stems,
        targets: BTreeMap<String, String>,
        deps: BTreeMap<String, String>,
        tmpdir: PathBuf,
        solver: PathSolver,
        cancel: CancelToken,
    ) -> Self {
        Self {
            name: name.to_string(),
            stems,
            targets,
            deps,
            tmpdir,
            solver,
            records: Vec::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            cancel,
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn stem(&self, name: &str) -> Result<&str> {
        self.stems
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| EngineError::Invariant(format!("job {} has no stem {}", self.name, name)))
    }
    pub fn target(&self, key: &str) -> Result<&str> {
        self.targets
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| EngineError::Invariant(format!("job {} has no target {}", self.name, key)))
    }
    pub fn dep(&self, key: &str) -> Result<&str> {
        self.deps
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| EngineError::Invariant(format!("job {} has no dependency {}", self.name, key)))
    }
    pub fn root_dir(&self) -> &Path {
        self.solver.root()
    }
    /// The job's `$TMPDIR`: its scratch directory or the view standing for it.
    pub fn tmp_dir(&self) -> &Path {
        &self.tmpdir
    }

    // the path the job names, absolute, relative ones taken from the root
    fn absolute(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() { path.to_path_buf() } else { self.solver.root().join(path) }
    }
    fn record(&mut self, kind: AccessKind, path: &Path, ok: bool) {
        self.records.push(AccessRecord::new(kind, path.to_string_lossy(), ok));
    }

    pub fn read(&mut self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = self.absolute(path);
        let outcome = fs::read(self.solver.map(&path));
        self.record(AccessKind::Read, &path, outcome.is_ok());
        Ok(outcome?)
    }
    pub fn read_to_string(&mut self, path: impl AsRef<Path>) -> Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes).map_err(|e| EngineError::Io(e.to_string()))
    }
    /// Write a file, creating missing parent directories.
    pub fn write(&mut self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
        let path = self.absolute(path);
        let disk = self.solver.map(&path);
        let outcome = match disk.parent() {
            Some(parent) => fs::create_dir_all(parent).and_then(|_| fs::write(&disk, contents)),
            None => fs::write(&disk, contents),
        };
        self.record(AccessKind::Write, &path, outcome.is_ok());
        Ok(outcome?)
    }
    /// Create `link` pointing at `target`. The link itself is what gets written.
    pub fn symlink(&mut self, target: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
        let link = self.absolute(link);
        let parent = link.parent().map(|p| self.solver.map(p));
        let disk = match (&parent, link.file_name()) {
            (Some(parent), Some(name)) => parent.join(name),
            _ => link.clone(),
        };
        let _ = fs::remove_file(&disk);
        let outcome = std::os::unix::fs::symlink(target.as_ref(), &disk);
        self.records.push(AccessRecord::new(AccessKind::Write, link.to_string_lossy(), outcome.is_ok()).no_follow());
        Ok(outcome?)
    }
    pub fn exists(&mut self, path: impl AsRef<Path>) -> bool {
        let path = self.absolute(path);
        let found = self.solver.map(&path).exists();
        self.record(AccessKind::Stat, &path, found);
        found
    }
    pub fn remove(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = self.absolute(path);
        let parent = path.parent().map(|p| self.solver.map(p));
        let disk = match (&parent, path.file_name()) {
            (Some(parent), Some(name)) => parent.join(name),
            _ => path.clone(),
        };
        let outcome = fs::remove_file(&disk);
        self.record(AccessKind::Unlink, &path, outcome.is_ok());
        Ok(outcome?)
    }
    /// Declare dependencies without reading them.
    pub fn depend(&mut self, paths: &[&str]) {
        for path in paths {
            let path = self.absolute(path);
            let ok = self.solver.map(&path).exists();
            self.record(AccessKind::Explicit, &path, ok);
        }
    }
    pub fn print(&mut self, text: &str) {
        self.stdout.extend_from_slice(text.as_bytes());
    }
    pub fn eprint(&mut self, text: &str) {
        self.stderr.extend_from_slice(text.as_bytes());
    }
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
    /// Raw accesses, standard output and standard error.
    pub(crate) fn finish(self) -> (Vec<AccessRecord>, Vec<u8>, Vec<u8>) {
        (self.records, self.stdout, self.stderr)
    }
}
