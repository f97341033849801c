// content hashing of targets and dependencies
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;
use std::time::SystemTime;

use tracing::warn;

use crate::error::EngineError;

/// What a path held when it was last looked at. Links are fingerprinted by
/// the text they point to, never by what they resolve to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    None,
    File(String),
    Link(String),
    Dir,
}

impl Fingerprint {
    pub fn of(path: &Path) -> Self {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Self::None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot stat for fingerprint");
                return Self::None;
            }
        };
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            match fs::read_link(path) {
                Ok(target) => {
                    let hash = blake3::hash(target.as_os_str().as_encoded_bytes());
                    Self::Link(hash.to_hex().to_string())
                }
                Err(_) => Self::None,
            }
        } else if file_type.is_dir() {
            Self::Dir
        } else {
            let mut hasher = blake3::Hasher::new();
            match fs::File::open(path).and_then(|file| hasher.update_reader(file).map(|_| ())) {
                Ok(()) => Self::File(hasher.finalize().to_hex().to_string()),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot read for fingerprint");
                    Self::None
                }
            }
        }
    }
    pub fn exists(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::File(hex) => write!(f, "file:{}", hex),
            Self::Link(hex) => write!(f, "link:{}", hex),
            Self::Dir => write!(f, "dir"),
        }
    }
}

impl FromStr for Fingerprint {
    type Err = EngineError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "none" => Ok(Self::None),
            None if s == "dir" => Ok(Self::Dir),
            Some(("file", hex)) => Ok(Self::File(hex.to_string())),
            Some(("link", hex)) => Ok(Self::Link(hex.to_string())),
            _ => Err(EngineError::Persistence(format!("bad fingerprint '{}'", s))),
        }
    }
}

/// Last modification time without following a final link.
pub fn modified(path: &Path) -> Option<SystemTime> {
    fs::symlink_metadata(path).and_then(|m| m.modified()).ok()
}
