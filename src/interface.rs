//! Asynchronous interface for submitting and controlling builds.
//!
//! Every build runs as its own tokio task and can be cancelled by id. A
//! cancelled build stops its running jobs, which end in the error state.
//!
//! Cancellation is cooperative and hierarchical: a [`CancelToken`] hands out
//! children, cancelling a token cancels everything below it, and cancelling
//! a child leaves its parent alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

use crate::engine::{BuildReport, Engine};
use crate::error::{EngineError, Result};

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<CancelState>>>,
}

impl CancelState {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();
        let children = match self.children.lock() {
            Ok(mut children) => std::mem::take(&mut *children),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// Cancellation token shared with running jobs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<CancelState>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    /// A token cancelled together with this one.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let mut children = match self.0.children.lock() {
            Ok(children) => children,
            Err(poisoned) => poisoned.into_inner(),
        };
        // checked under the lock, so a concurrent cancel cannot miss the child
        if self.is_cancelled() {
            child.cancel();
        } else {
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child.0));
        }
        child
    }
    pub fn cancel(&self) {
        self.0.cancel();
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }
    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        let notified = self.0.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Opaque build identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuildId(u64);

/// Handle to a running or completed build.
pub struct BuildHandle {
    pub id: BuildId,
    cancel: CancelToken,
    started: Instant,
    join: JoinHandle<BuildReport>,
}

impl BuildHandle {
    /// Request cancellation. Running jobs are killed and end in error.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
    /// Wait for the build to finish.
    pub async fn join(self) -> Result<BuildReport> {
        self.join
            .await
            .map_err(|e| EngineError::Invariant(format!("build task failed: {}", e)))
    }
    /// Elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Registry managing build lifecycles.
pub struct BuildInterface {
    engine: Engine,
    next_id: AtomicU64,
    active: Arc<Mutex<HashMap<BuildId, CancelToken>>>,
}

impl BuildInterface {
    pub fn new(engine: Engine) -> Self {
        Self { engine, next_id: AtomicU64::new(0), active: Arc::new(Mutex::new(HashMap::new())) }
    }
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
    fn allocate_id(&self) -> BuildId {
        BuildId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Start building `targets` on a background task.
    pub fn submit(&self, targets: Vec<String>) -> BuildHandle {
        let id = self.allocate_id();
        let cancel = CancelToken::new();
        if let Ok(mut active) = self.active.lock() {
            active.insert(id, cancel.clone());
        }
        let engine = self.engine.clone();
        let active = Arc::clone(&self.active);
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let report = engine.make(&targets, token).await;
            if let Ok(mut active) = active.lock() {
                active.remove(&id);
            }
            report
        });
        info!(build = id.0, "Build submitted");
        BuildHandle { id, cancel, started: Instant::now(), join }
    }

    /// Cancel a build by id.
    pub fn cancel(&self, id: BuildId) -> bool {
        match self.active.lock().ok().and_then(|active| active.get(&id).cloned()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
    pub fn cancel_all(&self) {
        if let Ok(active) = self.active.lock() {
            for token in active.values() {
                token.cancel();
            }
        }
    }
}
