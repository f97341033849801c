//! Symbolic links and where accessed paths really live.
//!
//! Raw accesses name paths the way the job saw them. [`PathSolver`] walks
//! them component by component on the host that ran the job, while its
//! scratch directory still exists, follows every link to find the final
//! path and keeps the repository links the [`LinkSupport`] mode asks for:
//!
//! * `none` – only the final path.
//! * `file` – the link in the last component as well.
//! * `full` – every link component, directories included.
//!
//! Paths under the scratch view (e.g. `/tmp` when a rule asks for it) are
//! read through the job's private scratch directory.

use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::access::{AccessKind, AccessRecord};

const MAX_LINK_HOPS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkSupport {
    None,
    File,
    #[default]
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Scratch,
    Admin,
    Repo,
    View,
    System,
    External,
}

#[derive(Debug, Clone)]
pub struct Solved {
    pub real: PathBuf,
    pub links: Vec<PathBuf>,
    pub domain: Domain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSolver {
    root: PathBuf,
    admin: PathBuf,
    scratch: Option<PathBuf>,
    view: Option<PathBuf>,
    mode: LinkSupport,
}

impl PathSolver {
    pub fn new(root: &Path, admin: &Path, mode: LinkSupport) -> Self {
        Self {
            root: root.to_path_buf(),
            admin: admin.to_path_buf(),
            scratch: None,
            view: None,
            mode,
        }
    }
    pub fn with_scratch(mut self, scratch: &Path, view: Option<&Path>) -> Self {
        self.scratch = Some(scratch.to_path_buf());
        self.view = view.map(Path::to_path_buf);
        self
    }
    pub fn root(&self) -> &Path {
        &self.root
    }
    pub fn mode(&self) -> LinkSupport {
        self.mode
    }
    pub fn domain(&self, path: &Path) -> Domain {
        if self.scratch.as_deref().is_some_and(|s| path.starts_with(s)) {
            Domain::Scratch
        } else if path.starts_with(&self.admin) {
            Domain::Admin
        } else if path.starts_with(&self.root) {
            Domain::Repo
        } else if self.view.as_deref().is_some_and(|v| path.starts_with(v)) {
            Domain::View
        } else if ["/proc", "/dev", "/sys"].iter().any(|p| path.starts_with(p)) {
            Domain::System
        } else {
            Domain::External
        }
    }
    /// Where a path lives on disk, taking the scratch view into account.
    /// Does not follow links.
    pub fn disk_path(&self, path: &Path) -> PathBuf {
        if let (Domain::View, Some(view), Some(scratch)) = (self.domain(path), &self.view, &self.scratch) {
            if let Ok(rest) = path.strip_prefix(view) {
                return scratch.join(rest);
            }
        }
        path.to_path_buf()
    }
    /// Follow every link in `path`. With `no_follow` the last component is
    /// taken as is.
    pub fn solve(&self, path: &Path, no_follow: bool) -> Solved {
        let mut real = PathBuf::from("/");
        let mut todo: Vec<OsString> = components(path);
        let mut links = Vec::new();
        let mut hops = 0;
        while let Some(component) = todo.pop() {
            if component == ".." {
                real.pop();
                continue;
            }
            real.push(&component);
            let last = todo.is_empty();
            if last && no_follow {
                break;
            }
            let domain = self.domain(&real);
            if domain == Domain::System {
                continue;
            }
            let Ok(target) = fs::read_link(self.disk_path(&real)) else { continue };
            hops += 1;
            if hops > MAX_LINK_HOPS {
                break;
            }
            if domain == Domain::Repo && (self.mode == LinkSupport::Full || (self.mode == LinkSupport::File && last)) {
                links.push(real.clone());
            }
            real.pop();
            if target.is_absolute() {
                real = PathBuf::from("/");
            }
            todo.extend(components(&target));
        }
        let domain = self.domain(&real);
        Solved { real, links, domain }
    }
    /// The on-disk path a job means when it names `path`.
    pub fn map(&self, path: &Path) -> PathBuf {
        let abs = if path.is_absolute() { path.to_path_buf() } else { self.root.join(path) };
        let solved = self.solve(&abs, false);
        self.disk_path(&solved.real)
    }
    /// Repository accesses become paths relative to the root. Explicit
    /// accesses outside the repository keep their absolute path. Everything
    /// else is dropped.
    pub fn normalize(&self, raw: &[AccessRecord]) -> Vec<AccessRecord> {
        let mut normalized = Vec::new();
        for record in raw {
            let path = Path::new(&record.path);
            let abs = if path.is_absolute() { path.to_path_buf() } else { self.root.join(path) };
            let solved = self.solve(&abs, !record.follow);
            for link in &solved.links {
                if let Some(relative) = self.relative(link) {
                    normalized.push(AccessRecord::new(AccessKind::Link, relative, true));
                }
            }
            match solved.domain {
                Domain::Repo => {
                    if let Some(relative) = self.relative(&solved.real) {
                        normalized.push(AccessRecord { kind: record.kind, path: relative, ok: record.ok, follow: true });
                    }
                }
                Domain::External | Domain::System if record.kind == AccessKind::Explicit => {
                    normalized.push(AccessRecord::new(
                        AccessKind::Explicit,
                        solved.real.to_string_lossy(),
                        record.ok,
                    ));
                }
                _ => {}
            }
        }
        normalized
    }
    fn relative(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        if relative.as_os_str().is_empty() {
            return None;
        }
        Some(relative.to_string_lossy().into_owned())
    }
}

// pending components, last one first so that pop() yields them in order
fn components(path: &Path) -> Vec<OsString> {
    let mut parts: Vec<OsString> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            _ => None,
        })
        .collect();
    parts.reverse();
    parts
}
