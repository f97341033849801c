//! Job states and the rules deciding between them.
//!
//! | state       | meaning                                                      |
//! |-------------|--------------------------------------------------------------|
//! | `new`       | executed for the first time                                  |
//! | `done`      | up to date, or executed and produced different content       |
//! | `steady`    | executed and produced exactly what was there before          |
//! | `may_rerun` | executed while a dependency was not trustworthy yet          |
//! | `rerun`     | still not trustworthy after re-executing, given up           |
//! | `error`     | failed, cancelled, or would close a dependency cycle         |

use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::fingerprint::{Fingerprint, modified};
use crate::graph::{JobRecord, RecordState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    New,
    Done,
    Steady,
    MayRerun,
    Rerun,
    Error,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Done => "done",
            Self::Steady => "steady",
            Self::MayRerun => "may_rerun",
            Self::Rerun => "rerun",
            Self::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Outcome counters of a build, one count per event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub new: usize,
    pub done: usize,
    pub steady: usize,
    pub may_rerun: usize,
    pub rerun: usize,
    pub failed: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, state: JobState) {
        match state {
            JobState::New => self.new += 1,
            JobState::Done => self.done += 1,
            JobState::Steady => self.steady += 1,
            JobState::MayRerun => self.may_rerun += 1,
            JobState::Rerun => self.rerun += 1,
            JobState::Error => self.failed += 1,
        }
    }
    /// Jobs that ran to a trusted result.
    pub fn executed(&self) -> usize {
        self.done + self.steady
    }
}

impl fmt::Display for OutcomeCounts {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} new, {} done, {} steady, {} may_rerun, {} rerun, {} failed",
            self.new, self.done, self.steady, self.may_rerun, self.rerun, self.failed
        )
    }
}

/// Content of the targets before and after an execution.
pub fn classify(previous: &[(String, Fingerprint)], current: &[(String, Fingerprint)], had_record: bool) -> JobState {
    if had_record && previous == current && current.iter().all(|(_, f)| f.exists()) {
        JobState::Steady
    } else {
        JobState::Done
    }
}

/// Why a recorded job cannot be trusted without executing it, if it can.
pub fn stale_reason(record: Option<&JobRecord>, rule_fingerprint: &str) -> Option<String> {
    match record {
        None => Some("never built".into()),
        Some(record) if record.state == RecordState::Error => {
            Some(format!("previous attempt failed: {}", record.reason.as_deref().unwrap_or("unknown")))
        }
        Some(record) if record.rule_fingerprint != rule_fingerprint => Some("rule changed".into()),
        Some(_) => None,
    }
}

/// A file modified so recently that it may still be being written.
pub fn is_hot(path: &Path, started: SystemTime, window: Duration) -> bool {
    let Some(modified) = modified(path) else { return false };
    let threshold = started.checked_sub(window).unwrap_or(started);
    modified >= threshold
}
