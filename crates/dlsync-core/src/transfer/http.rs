//! Resumable HTTP transfer
//!
//! Streams into `<name>.part` next to the final file and resumes from its
//! length with an open-ended `Range` request. The stored validation tag
//! (ETag, else Last-Modified) is checked with a HEAD request before resuming
//! and sent as `If-Range` with the ranged request itself. When either shows
//! the content changed, the partial file is discarded and the fetch restarts
//! from zero.

use crate::bus::{Intent, UpdateBus};
use crate::error::DlsyncError;
use crate::scheduler::{CancelReason, JobControl};
use crate::transfer::ProgressReporter;
use dlsync_types::{CoreConfig, TaskRecord, TaskState};
use futures::StreamExt;
use reqwest::header::{HeaderMap, ETAG, IF_RANGE, LAST_MODIFIED, RANGE};
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, info, warn};

/// HTTP transfer engine, shared by every HTTP job
#[derive(Clone)]
pub struct HttpTransfer {
    client: Client,
    config: Arc<CoreConfig>,
}

impl HttpTransfer {
    pub fn new(config: Arc<CoreConfig>) -> Result<Self, DlsyncError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self { client, config })
    }

    /// Run one attempt of a task inside its job
    ///
    /// Failures are reported as a state change before being returned.
    pub async fn run(
        &self,
        task: TaskRecord,
        bus: UpdateBus,
        control: JobControl,
    ) -> Result<(), DlsyncError> {
        let id = task.id;
        bus.submit(Intent::UpdateState {
            id,
            state: TaskState::Downloading,
            job_id: Some(control.job_id().clone()),
            error: None,
        });
        info!("Starting download {} -> {:?}", task.source_locator, task.final_path());

        match self.run_with_retries(&task, &bus, &control).await {
            Ok(total) => {
                bus.submit(Intent::UpdateProgress {
                    id,
                    downloaded: total,
                    speed: 0,
                });
                bus.submit(Intent::UpdateState {
                    id,
                    state: TaskState::Completed,
                    job_id: None,
                    error: None,
                });
                info!("Download {} completed ({} bytes)", id, total);
                Ok(())
            }
            Err(DlsyncError::Cancelled(reason)) => {
                if reason == CancelReason::Delete {
                    if let Err(e) = discard(&task.temp_path()).await {
                        warn!("Failed to remove partial file of {}: {}", id, e);
                    }
                }
                info!("Download {} stopped ({})", id, reason);
                Err(DlsyncError::Cancelled(reason))
            }
            Err(e) => {
                // A broken length or rename leaves the partial file resumable
                let state = match e {
                    DlsyncError::Integrity(_) => TaskState::Paused,
                    _ => TaskState::Failed,
                };
                error!("Download {} failed: {}", id, e);
                bus.submit(Intent::UpdateState {
                    id,
                    state,
                    job_id: None,
                    error: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    async fn run_with_retries(
        &self,
        task: &TaskRecord,
        bus: &UpdateBus,
        control: &JobControl,
    ) -> Result<u64, DlsyncError> {
        let mut known_tag = task.validation_tag.clone();
        let mut attempt = 0;

        loop {
            match self.fetch(task, bus, control, &mut known_tag).await {
                Ok(total) => return Ok(total),
                Err(e)
                    if e.is_retryable()
                        && attempt < self.config.max_retries
                        && !control.is_cancelled() =>
                {
                    attempt += 1;
                    warn!(
                        "Download {} failed (attempt {}/{}), retrying in {:?}: {}",
                        task.id,
                        attempt,
                        self.config.max_retries,
                        self.config.retry_delay(),
                        e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_delay()) => {}
                        _ = control.cancelled() => {
                            return Err(DlsyncError::Cancelled(control.cancel_reason()));
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch the remaining bytes and move the file into place; returns the total size
    async fn fetch(
        &self,
        task: &TaskRecord,
        bus: &UpdateBus,
        control: &JobControl,
        known_tag: &mut Option<String>,
    ) -> Result<u64, DlsyncError> {
        let id = task.id;
        let url = task.source_locator.as_str();
        let temp_path = task.temp_path();

        tokio::fs::create_dir_all(&task.destination).await?;

        let mut range_start = match tokio::fs::metadata(&temp_path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };

        if range_start > 0 {
            if let Some(stored) = known_tag.as_deref() {
                match self.head_tag(url, control).await {
                    Ok(Some(remote)) if remote != stored => {
                        info!(
                            "Content of {} changed ({} -> {}), discarding partial file",
                            id, stored, remote
                        );
                        discard(&temp_path).await?;
                        range_start = 0;
                    }
                    Ok(_) => {}
                    Err(DlsyncError::Cancelled(reason)) => return Err(DlsyncError::Cancelled(reason)),
                    Err(e) => warn!("Could not validate partial file of {}: {}", id, e),
                }
            }
        }

        let mut range_rejected = false;
        let response = loop {
            let mut request = self.client.get(url);
            if range_start > 0 {
                debug!("Resuming {} from byte {}", id, range_start);
                request = request.header(RANGE, format!("bytes={}-", range_start));
                if let Some(stored) = known_tag.as_deref() {
                    request = request.header(IF_RANGE, stored);
                }
            }

            let response = tokio::select! {
                response = request.send() => response?,
                _ = control.cancelled() => {
                    return Err(DlsyncError::Cancelled(control.cancel_reason()));
                }
            };

            let status = response.status();
            if status == StatusCode::RANGE_NOT_SATISFIABLE && range_start > 0 && !range_rejected {
                info!("Range not satisfiable for {}, restarting from zero", id);
                discard(&temp_path).await?;
                range_start = 0;
                range_rejected = true;
                continue;
            }

            if !status.is_success() {
                return Err(DlsyncError::ServerError {
                    status: status.as_u16(),
                    message: status.canonical_reason().unwrap_or("request failed").to_string(),
                });
            }

            if range_start > 0 && status != StatusCode::PARTIAL_CONTENT {
                debug!("Server ignored range for {}, restarting from zero", id);
                range_start = 0;
            }

            if range_start > 0 {
                let remote = validation_tag(response.headers());
                if let (Some(stored), Some(remote)) = (known_tag.as_deref(), remote.as_deref()) {
                    if stored != remote {
                        info!(
                            "Content of {} changed ({} -> {}), discarding partial file",
                            id, stored, remote
                        );
                        discard(&temp_path).await?;
                        range_start = 0;
                        continue;
                    }
                }
            }

            break response;
        };

        let length = response
            .content_length()
            .filter(|length| *length > 0)
            .ok_or_else(|| {
                DlsyncError::Integrity(format!("no usable content length declared for {}", url))
            })?;
        let total = length + range_start;

        let tag = validation_tag(response.headers());
        bus.submit(Intent::UpdateSize { id, size: total });
        if tag != *known_tag {
            bus.submit(Intent::UpdateValidationTag {
                id,
                tag: tag.clone(),
            });
            *known_tag = tag;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(range_start > 0)
            .truncate(range_start == 0)
            .open(&temp_path)
            .await?;
        let mut writer = BufWriter::with_capacity(self.config.chunk_size, file);

        let progress = ProgressReporter::spawn(
            id,
            range_start,
            bus.clone(),
            self.config.progress_interval(),
        );
        let mut stream = response.bytes_stream();

        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        writer.write_all(&bytes).await?;
                        progress.add(bytes.len() as u64);
                    }
                    Some(Err(e)) => {
                        writer.flush().await?;
                        return Err(e.into());
                    }
                    None => break,
                },
                _ = control.cancelled() => {
                    writer.flush().await?;
                    bus.submit(Intent::UpdateProgress {
                        id,
                        downloaded: progress.current(),
                        speed: 0,
                    });
                    return Err(DlsyncError::Cancelled(control.cancel_reason()));
                }
            }
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        let received = progress.current();
        if received != total {
            return Err(DlsyncError::Integrity(format!(
                "expected {} bytes for {}, received {}",
                total, url, received
            )));
        }

        let final_path = task.final_path();
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| {
                DlsyncError::Integrity(format!("could not move {:?} into place: {}", final_path, e))
            })?;

        Ok(total)
    }

    async fn head_tag(
        &self,
        url: &str,
        control: &JobControl,
    ) -> Result<Option<String>, DlsyncError> {
        let response = tokio::select! {
            response = self.client.head(url).send() => response?,
            _ = control.cancelled() => {
                return Err(DlsyncError::Cancelled(control.cancel_reason()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DlsyncError::ServerError {
                status: status.as_u16(),
                message: "validation request failed".to_string(),
            });
        }

        Ok(validation_tag(response.headers()))
    }
}

fn validation_tag(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ETAG)
        .or_else(|| headers.get(LAST_MODIFIED))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

/// Remove a partial file; a missing file is fine
async fn discard(path: &Path) -> Result<(), DlsyncError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
