use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tracing::{debug, info, warn};

use super::remote::{CANCEL, CLAIMED, DONE, QUEUE, publish};
use super::{JobOutput, JobSpec, LocalExecutor};
use crate::autodep::ExitState;
use crate::error::{EngineError, Result};
use crate::interface::CancelToken;

/// Executes jobs found in a spool directory.
pub struct Worker {
    spool: PathBuf,
    executor: LocalExecutor,
    poll: Duration,
}

impl Worker {
    pub fn new(spool: &Path, executor: LocalExecutor, poll: Duration) -> Result<Self> {
        for dir in [QUEUE, CLAIMED, DONE, CANCEL] {
            std::fs::create_dir_all(spool.join(dir))?;
        }
        Ok(Self { spool: spool.to_path_buf(), executor, poll })
    }

    /// Work until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancelToken) -> Result<()> {
        info!(spool = %self.spool.display(), "Worker started");
        while !shutdown.is_cancelled() {
            if self.run_once().await? {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll) => {}
                _ = shutdown.cancelled() => {}
            }
        }
        info!(spool = %self.spool.display(), "Worker stopped");
        Ok(())
    }

    /// Claim and execute one queued job. False when the queue was empty.
    pub async fn run_once(&self) -> Result<bool> {
        let Some((id, claimed)) = self.claim().await? else {
            return Ok(false);
        };
        let spec: JobSpec = match fs::read(&claimed).await.map(|bytes| serde_json::from_slice(&bytes)) {
            Ok(Ok(spec)) => spec,
            Ok(Err(e)) => {
                warn!(%id, error = %e, "Discarding malformed job");
                let _ = fs::remove_file(&claimed).await;
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        };
        let marker = self.spool.join(CANCEL).join(&id);
        let cancel = CancelToken::new();
        let watch = {
            let cancel = cancel.clone();
            let marker = marker.clone();
            let poll = self.poll;
            tokio::spawn(async move {
                while !cancel.is_cancelled() {
                    if fs::try_exists(&marker).await.unwrap_or(false) {
                        cancel.cancel();
                    }
                    tokio::time::sleep(poll).await;
                }
            })
        };
        debug!(%id, job = %spec.name, "Job claimed");
        let output = self.executor.execute(&spec, cancel.clone()).await;
        watch.abort();
        let _ = fs::remove_file(&claimed).await;
        if cancel.is_cancelled() || fs::try_exists(&marker).await.unwrap_or(false) {
            let _ = fs::remove_file(&marker).await;
            info!(%id, job = %spec.name, "Job cancelled, output discarded");
            return Ok(true);
        }
        let output = match output {
            Ok(output) => output,
            // reported to the submitter rather than lost with the worker
            Err(e) => JobOutput {
                status: ExitState::Exited(-1),
                stdout: Vec::new(),
                stderr: Vec::new(),
                accesses: Vec::new(),
                error: Some(e.to_string()),
                started: chrono::Utc::now(),
                ended: chrono::Utc::now(),
            },
        };
        let payload = serde_json::to_vec(&output)?;
        publish(&self.spool.join(DONE).join(format!("{}.json", id)), &payload).await?;
        debug!(%id, job = %spec.name, status = %output.status, "Job published");
        Ok(true)
    }

    // oldest queued job, taken by renaming it so that no other worker gets it
    async fn claim(&self) -> Result<Option<(String, PathBuf)>> {
        let mut entries = fs::read_dir(self.spool.join(QUEUE)).await?;
        let mut queued = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(".json") {
                let modified = entry.metadata().await.and_then(|m| m.modified()).ok();
                queued.push((modified, id.to_string()));
            }
        }
        queued.sort();
        for (_, id) in queued {
            let from = self.spool.join(QUEUE).join(format!("{}.json", id));
            let to = self.spool.join(CLAIMED).join(format!("{}.json", id));
            match fs::rename(&from, &to).await {
                Ok(()) => return Ok(Some((id, to))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(EngineError::from(e)),
            }
        }
        Ok(None)
    }
}
