// Hands jobs to workers through a shared spool directory, the way a batch
// scheduler queue would:
//
//   queue/<id>.json    submitted, waiting for a worker
//   claimed/<id>.json  taken by a worker (renamed from queue/)
//   done/<id>.json     the JobOutput, published by the worker
//   cancel/<id>        asks the worker to kill the job
//
// Every file is written under a temporary name and renamed into place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::fs;
use tracing::{debug, info, warn};

use super::{ExecutionBackend, JobOutput, JobSpec};
use crate::error::{EngineError, Result};
use crate::interface::CancelToken;

pub(super) const QUEUE: &str = "queue";
pub(super) const CLAIMED: &str = "claimed";
pub(super) const DONE: &str = "done";
pub(super) const CANCEL: &str = "cancel";

/// Write `contents` to `path` so that readers never see a partial file.
pub(super) async fn publish(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut name = path.as_os_str().to_os_string();
    name.push(".part");
    let partial = PathBuf::from(name);
    fs::write(&partial, contents).await?;
    fs::rename(&partial, path).await
}

pub struct SpoolBackend {
    name: String,
    spool: PathBuf,
    poll: Duration,
    submit_retries: u32,
    retry_backoff: Duration,
    sequence: Arc<AtomicU64>,
}

impl SpoolBackend {
    pub fn new(name: &str, spool: &Path, poll_ms: u64, submit_retries: u32, retry_backoff_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            spool: spool.to_path_buf(),
            poll: Duration::from_millis(poll_ms.max(1)),
            submit_retries,
            retry_backoff: Duration::from_millis(retry_backoff_ms),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }
    fn unavailable(&self, reason: impl Into<String>) -> EngineError {
        EngineError::BackendUnavailable { backend: self.name.clone(), reason: reason.into() }
    }
}

impl ExecutionBackend for SpoolBackend {
    fn name(&self) -> &str {
        &self.name
    }
    fn check_available(&self) -> Result<()> {
        if self.spool.is_dir() {
            Ok(())
        } else {
            Err(self.unavailable(format!("spool {} does not exist", self.spool.display())))
        }
    }
    fn submit(&self, spec: JobSpec, cancel: CancelToken) -> BoxFuture<'static, Result<JobOutput>> {
        let id = format!(
            "{}-{}-{}",
            std::process::id(),
            self.sequence.fetch_add(1, Ordering::SeqCst),
            chrono::Utc::now().timestamp_micros()
        );
        let spool = self.spool.clone();
        let poll = self.poll;
        let retries = self.submit_retries;
        let mut backoff = self.retry_backoff;
        let available = self.check_available();
        let backend = self.name.clone();
        Box::pin(async move {
            // gone entirely: no retry, no fallback
            available?;
            let payload = serde_json::to_vec(&spec)?;
            let queued = spool.join(QUEUE).join(format!("{}.json", id));
            let mut attempt = 0;
            loop {
                match publish(&queued, &payload).await {
                    Ok(()) => break,
                    Err(e) if attempt < retries => {
                        attempt += 1;
                        warn!(backend = %backend, job = %spec.name, attempt, error = %e, "Submission failed, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = cancel.cancelled() => {
                                return Err(EngineError::Cancelled { job: spec.name.clone(), reason: "cancelled".into() });
                            }
                        }
                        backoff *= 2;
                    }
                    Err(e) => {
                        return Err(EngineError::BackendUnavailable {
                            backend,
                            reason: format!("submission failed after {} attempts: {}", attempt + 1, e),
                        });
                    }
                }
            }
            info!(backend = %backend, job = %spec.name, %id, "Job submitted");

            let done = spool.join(DONE).join(format!("{}.json", id));
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = cancel.cancelled() => {
                        // still queued means never claimed: nothing to kill
                        if fs::remove_file(&queued).await.is_err() {
                            let _ = publish(&spool.join(CANCEL).join(&id), b"cancelled").await;
                        }
                        info!(backend = %backend, job = %spec.name, %id, "Cancellation requested");
                        return Err(EngineError::Cancelled { job: spec.name.clone(), reason: "cancelled".into() });
                    }
                }
                match fs::read(&done).await {
                    Ok(bytes) => {
                        let output: JobOutput = serde_json::from_slice(&bytes)
                            .map_err(|e| EngineError::Protocol(format!("job {} output: {}", id, e)))?;
                        let _ = fs::remove_file(&done).await;
                        debug!(backend = %backend, job = %spec.name, %id, status = %output.status, "Job completed");
                        return Ok(output);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        })
    }
}
