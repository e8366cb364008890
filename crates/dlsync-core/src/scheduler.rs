//! Job scheduler adapter
//!
//! A transfer runs as a cancellable unit of work owned by a [`JobScheduler`].
//! The bundled [`LocalJobScheduler`] runs units as tokio tasks behind a
//! semaphore and records every job in its own SQLite file, so a job id read
//! back from the task store after a restart can still be answered.

use crate::error::DlsyncError;
use async_trait::async_trait;
use chrono::Utc;
use dlsync_types::{JobId, TaskId};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a job was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Pause,
    /// The task is being deleted; partial data may be discarded
    Delete,
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CancelReason::Pause => "pause",
            CancelReason::Delete => "delete",
            CancelReason::Shutdown => "shutdown",
        })
    }
}

/// Whether a job is still running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Finished,
    Unknown,
}

/// What to do when a job already exists for the same task key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UniquenessPolicy {
    /// Replace a job still waiting for a slot, keep a running one
    #[default]
    ReplaceQueued,
    KeepExisting,
    /// Cancel whatever exists and run the new unit
    ReplaceExisting,
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Succeeded,
    Failed(String),
    Cancelled(CancelReason),
    /// The job belonged to a process that is gone, or was never known
    Lost,
}

/// Handle passed to a running unit of work
#[derive(Clone)]
pub struct JobControl {
    job_id: JobId,
    token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

impl JobControl {
    fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Resolves once the job is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason given to the first `cancel` call, `Shutdown` if none was recorded
    pub fn cancel_reason(&self) -> CancelReason {
        (*self.reason.lock()).unwrap_or(CancelReason::Shutdown)
    }

    fn cancel(&self, reason: CancelReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    /// Standalone control for driving a unit outside a scheduler
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::new(JobId::generate())
    }

    #[cfg(test)]
    pub(crate) fn trigger(&self, reason: CancelReason) {
        self.cancel(reason);
    }
}

pub type WorkFuture = BoxFuture<'static, Result<(), DlsyncError>>;

/// A unit of work, started once the scheduler grants it a slot
pub type WorkUnit = Box<dyn FnOnce(JobControl) -> WorkFuture + Send>;

/// External facility that runs transfers as cancellable jobs
#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn enqueue(
        &self,
        task_key: TaskId,
        work: WorkUnit,
        policy: UniquenessPolicy,
    ) -> Result<JobId, DlsyncError>;

    /// Cancel a job; cancelling a finished or unknown job is a no-op
    async fn cancel(&self, job_id: &JobId, reason: CancelReason) -> Result<(), DlsyncError>;

    async fn query_liveness(&self, job_id: &JobId) -> Result<Liveness, DlsyncError>;

    /// Wait for the single terminal event of a job
    async fn observe_terminal(&self, job_id: &JobId) -> Result<TerminalEvent, DlsyncError>;

    /// Cancel every job with [`CancelReason::Shutdown`] and wait for them to end
    async fn shutdown(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JobStatus {
    Queued,
    Running,
    Done(TerminalEvent),
}

struct JobEntry {
    control: JobControl,
    status: watch::Sender<JobStatus>,
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<JobId, JobEntry>,
    by_key: HashMap<TaskId, JobId>,
}

/// In-process scheduler persisting job rows to `jobs.db`
pub struct LocalJobScheduler {
    pool: SqlitePool,
    boot_id: String,
    permits: Arc<Semaphore>,
    table: Arc<Mutex<JobTable>>,
    enqueue_lock: tokio::sync::Mutex<()>,
}

impl LocalJobScheduler {
    pub async fn open<P: AsRef<Path>>(db_path: P, max_concurrent: usize) -> Result<Self, DlsyncError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DlsyncError::SchedulerUnavailable(e.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| DlsyncError::SchedulerUnavailable(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                task_key TEXT NOT NULL,
                boot_id TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_task_key ON jobs(task_key);
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| DlsyncError::SchedulerUnavailable(e.to_string()))?;

        let boot_id = Uuid::new_v4().to_string();
        info!("Job scheduler ready (boot {}, {} slots)", boot_id, max_concurrent);

        Ok(Self {
            pool,
            boot_id,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            table: Arc::new(Mutex::new(JobTable::default())),
            enqueue_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn spawn_job(&self, job_id: JobId, task_key: TaskId, work: WorkUnit) {
        let control = JobControl::new(job_id.clone());
        let (status_tx, _) = watch::channel(JobStatus::Queued);

        {
            let mut table = self.table.lock();
            table.jobs.insert(
                job_id.clone(),
                JobEntry {
                    control: control.clone(),
                    status: status_tx,
                },
            );
            table.by_key.insert(task_key, job_id.clone());
        }

        let permits = self.permits.clone();
        let table = self.table.clone();
        let pool = self.pool.clone();
        let id = job_id;

        tokio::spawn(async move {
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                _ = control.cancelled() => None,
            };

            let started = permit.is_some() && {
                // Checked under the table lock so a replace never races the start
                let table = table.lock();
                match table.jobs.get(&id) {
                    Some(entry) if !control.is_cancelled() => {
                        entry.status.send_replace(JobStatus::Running);
                        true
                    }
                    _ => false,
                }
            };

            let event = if started {
                write_status(&pool, &id, "running", None).await;
                debug!("Job {} started for task {}", id, task_key);

                match work(control.clone()).await {
                    Ok(()) => TerminalEvent::Succeeded,
                    Err(DlsyncError::Cancelled(reason)) => TerminalEvent::Cancelled(reason),
                    Err(e) if control.is_cancelled() => {
                        debug!("Job {} ended with {} after cancellation", id, e);
                        TerminalEvent::Cancelled(control.cancel_reason())
                    }
                    Err(e) => TerminalEvent::Failed(e.to_string()),
                }
            } else {
                TerminalEvent::Cancelled(control.cancel_reason())
            };
            drop(permit);

            let (status, detail) = match &event {
                TerminalEvent::Succeeded => ("succeeded", None),
                TerminalEvent::Failed(message) => ("failed", Some(message.clone())),
                TerminalEvent::Cancelled(reason) => ("cancelled", Some(reason.to_string())),
                TerminalEvent::Lost => ("lost", None),
            };
            write_status(&pool, &id, status, detail.as_deref()).await;

            let mut table = table.lock();
            if let Some(entry) = table.jobs.remove(&id) {
                entry.status.send_replace(JobStatus::Done(event));
            }
            if table.by_key.get(&task_key) == Some(&id) {
                table.by_key.remove(&task_key);
            }
        });
    }

    async fn insert_row(&self, job_id: &JobId, task_key: TaskId) -> Result<(), DlsyncError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, task_key, boot_id, status, updated_at)
            VALUES (?, ?, ?, 'queued', ?)
            "#,
        )
        .bind(job_id.as_str())
        .bind(task_key.to_string())
        .bind(&self.boot_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| DlsyncError::SchedulerUnavailable(e.to_string()))?;

        Ok(())
    }

    /// Look up a job that is not tracked in memory
    async fn stored_terminal(&self, job_id: &JobId) -> Result<Option<TerminalEvent>, DlsyncError> {
        let row = sqlx::query("SELECT status, detail FROM jobs WHERE id = ?")
            .bind(job_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DlsyncError::SchedulerUnavailable(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.get("status");
        let detail: Option<String> = row.get("detail");
        let event = match status.as_str() {
            "succeeded" => TerminalEvent::Succeeded,
            "failed" => TerminalEvent::Failed(detail.unwrap_or_default()),
            "cancelled" => TerminalEvent::Cancelled(match detail.as_deref() {
                Some("pause") => CancelReason::Pause,
                Some("delete") => CancelReason::Delete,
                _ => CancelReason::Shutdown,
            }),
            // still queued or running when its process went away
            _ => TerminalEvent::Lost,
        };

        Ok(Some(event))
    }

    async fn wait_done(mut rx: watch::Receiver<JobStatus>) -> TerminalEvent {
        loop {
            if let JobStatus::Done(event) = &*rx.borrow_and_update() {
                return event.clone();
            }
            if rx.changed().await.is_err() {
                // Sender dropped: the final value is still readable
                return match &*rx.borrow() {
                    JobStatus::Done(event) => event.clone(),
                    _ => TerminalEvent::Lost,
                };
            }
        }
    }
}

async fn write_status(pool: &SqlitePool, job_id: &JobId, status: &str, detail: Option<&str>) {
    let result = sqlx::query("UPDATE jobs SET status = ?, detail = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(detail)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id.as_str())
        .execute(pool)
        .await;

    if let Err(e) = result {
        warn!("Failed to record job {} as {}: {}", job_id, status, e);
    }
}

#[async_trait]
impl JobScheduler for LocalJobScheduler {
    async fn enqueue(
        &self,
        task_key: TaskId,
        work: WorkUnit,
        policy: UniquenessPolicy,
    ) -> Result<JobId, DlsyncError> {
        let _serial = self.enqueue_lock.lock().await;

        let replaced = {
            let table = self.table.lock();
            let existing = table
                .by_key
                .get(&task_key)
                .and_then(|id| table.jobs.get(id).map(|entry| (id.clone(), entry)));

            match existing {
                None => None,
                Some((id, entry)) => {
                    let queued = *entry.status.borrow() == JobStatus::Queued;
                    match policy {
                        UniquenessPolicy::KeepExisting => return Ok(id),
                        UniquenessPolicy::ReplaceQueued if !queued => return Ok(id),
                        UniquenessPolicy::ReplaceQueued | UniquenessPolicy::ReplaceExisting => {
                            entry.control.cancel(CancelReason::Pause);
                            Some((id, entry.status.subscribe()))
                        }
                    }
                }
            }
        };

        if let Some((old_id, rx)) = replaced {
            debug!("Replacing job {} for task {}", old_id, task_key);
            Self::wait_done(rx).await;
        }

        let job_id = JobId::generate();
        self.insert_row(&job_id, task_key).await?;
        self.spawn_job(job_id.clone(), task_key, work);

        Ok(job_id)
    }

    async fn cancel(&self, job_id: &JobId, reason: CancelReason) -> Result<(), DlsyncError> {
        let table = self.table.lock();
        if let Some(entry) = table.jobs.get(job_id) {
            debug!("Cancelling job {} ({})", job_id, reason);
            entry.control.cancel(reason);
        }
        Ok(())
    }

    async fn query_liveness(&self, job_id: &JobId) -> Result<Liveness, DlsyncError> {
        if self.table.lock().jobs.contains_key(job_id) {
            return Ok(Liveness::Alive);
        }

        Ok(match self.stored_terminal(job_id).await? {
            Some(_) => Liveness::Finished,
            None => Liveness::Unknown,
        })
    }

    async fn observe_terminal(&self, job_id: &JobId) -> Result<TerminalEvent, DlsyncError> {
        let rx = self
            .table
            .lock()
            .jobs
            .get(job_id)
            .map(|entry| entry.status.subscribe());

        match rx {
            Some(rx) => Ok(Self::wait_done(rx).await),
            None => Ok(self
                .stored_terminal(job_id)
                .await?
                .unwrap_or(TerminalEvent::Lost)),
        }
    }

    async fn shutdown(&self) {
        let receivers: Vec<_> = {
            let table = self.table.lock();
            table
                .jobs
                .values()
                .map(|entry| {
                    entry.control.cancel(CancelReason::Shutdown);
                    entry.status.subscribe()
                })
                .collect()
        };

        info!("Shutting down job scheduler ({} jobs)", receivers.len());
        for rx in receivers {
            Self::wait_done(rx).await;
        }
    }
}
