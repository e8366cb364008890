//! dlsync Core - Download Task Orchestration
//!
//! This crate runs resumable HTTP downloads and delegated torrent downloads
//! as cancellable jobs, keeping a durable record of every task that survives
//! restarts. All state changes flow through a single update bus into the
//! SQLite task store and its in-memory mirror.

mod bus;
mod cache;
pub mod config;
mod error;
mod scheduler;
mod session;
mod store;
mod transfer;

pub use bus::*;
pub use cache::*;
pub use error::*;
pub use scheduler::*;
pub use session::*;
pub use store::*;
pub use transfer::*;

use dlsync_types::{CoreConfig, CoreEvent, JobId, TaskId, TaskKind, TaskRecord, TaskState};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

/// The download service
///
/// Construct one per process with [`DownloadService::builder`] and hand
/// clones to whoever needs it; clones share all state.
#[derive(Clone)]
pub struct DownloadService {
    config: Arc<CoreConfig>,
    cache: Arc<LiveCache>,
    bus: UpdateBus,
    scheduler: Arc<dyn JobScheduler>,
    http: HttpTransfer,
    delegated: Option<DelegatedTransfer>,
    event_tx: broadcast::Sender<CoreEvent>,
    /// Jobs enqueued by this process, including ones still waiting for a slot
    active_jobs: Arc<RwLock<HashMap<TaskId, JobId>>>,
}

pub struct DownloadServiceBuilder {
    config: CoreConfig,
    torrent_engine: Option<Arc<dyn TorrentEngine>>,
    scheduler: Option<Arc<dyn JobScheduler>>,
}

impl DownloadServiceBuilder {
    /// Enable torrent tasks
    pub fn torrent_engine(mut self, engine: Arc<dyn TorrentEngine>) -> Self {
        self.torrent_engine = Some(engine);
        self
    }

    /// Use an external scheduler instead of the local one
    pub fn scheduler(mut self, scheduler: Arc<dyn JobScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub async fn build(self) -> Result<DownloadService, DlsyncError> {
        let config = Arc::new(self.config);
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let store = TaskStore::open(config.data_dir.join("tasks.db")).await?;

        let scheduler: Arc<dyn JobScheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(
                LocalJobScheduler::open(config.data_dir.join("jobs.db"), config.max_concurrent_jobs)
                    .await?,
            ),
        };

        let (event_tx, _) = broadcast::channel(1000);
        let cache = Arc::new(LiveCache::new(store.clone(), scheduler.clone()));
        let bus = UpdateBus::spawn(
            store.clone(),
            cache.clone(),
            event_tx.clone(),
            ThrottleWindows::from(config.as_ref()),
        );

        let http = HttpTransfer::new(config.clone())?;
        let delegated = self
            .torrent_engine
            .map(|engine| DelegatedTransfer::new(engine, SessionStore::new(store.clone())));

        info!("Download service ready (data dir {:?})", config.data_dir);

        Ok(DownloadService {
            config,
            cache,
            bus,
            scheduler,
            http,
            delegated,
            event_tx,
            active_jobs: Arc::new(RwLock::new(HashMap::new())),
        })
    }
}

impl DownloadService {
    pub fn builder(config: CoreConfig) -> DownloadServiceBuilder {
        DownloadServiceBuilder {
            config,
            torrent_engine: None,
            scheduler: None,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    // ========================================================================
    // Task Operations
    // ========================================================================

    /// Create the task for `locator` if it does not exist, then run it
    ///
    /// Repeating a request for the same locator and destination returns the
    /// existing task; an already running job is kept.
    pub async fn start(
        &self,
        locator: &str,
        destination: Option<PathBuf>,
    ) -> Result<TaskRecord, DlsyncError> {
        let kind = TaskKind::detect(locator);
        validate_locator(locator, kind)?;
        if kind == TaskKind::Torrent && self.delegated.is_none() {
            return Err(DlsyncError::InvalidOperation(
                "no torrent engine is configured".to_string(),
            ));
        }

        let destination =
            destination.unwrap_or_else(|| self.config.default_destination.clone());
        let candidate = TaskRecord::new(locator, destination, kind);
        let id = candidate.id;

        if self.cache.get(id).await?.is_none() {
            debug!("Creating task {} for {}", id, locator);
            self.bus.submit(Intent::Insert(candidate));
            self.bus.flush().await?;
        }

        let task = self.require(id).await?;
        if kind == TaskKind::Http && task.state == TaskState::Completed {
            return Ok(task);
        }

        self.launch(task).await
    }

    /// Run an existing task again
    pub async fn resume(&self, id: TaskId) -> Result<TaskRecord, DlsyncError> {
        let task = self.require(id).await?;
        self.launch(task).await
    }

    /// Stop the task's job and park it in its paused state
    pub async fn pause(&self, id: TaskId) -> Result<TaskRecord, DlsyncError> {
        let task = self.require(id).await?;
        let job_id = self.job_for(&task).ok_or_else(|| {
            DlsyncError::InvalidOperation(format!("task {} is not running", id))
        })?;

        self.scheduler.cancel(&job_id, CancelReason::Pause).await?;
        let outcome = self.scheduler.observe_terminal(&job_id).await?;
        debug!("Job {} of task {} ended: {:?}", job_id, id, outcome);
        self.bus.flush().await?;

        let current = self.require(id).await?;
        if let Some(paused) = current.state.paused_counterpart() {
            self.bus.submit(Intent::UpdateState {
                id,
                state: paused,
                job_id: None,
                error: None,
            });
            self.bus.flush().await?;
        }

        info!("Paused task {}", id);
        self.require(id).await
    }

    /// Stop the task, forget it and remove its files
    pub async fn delete(&self, id: TaskId) -> Result<(), DlsyncError> {
        let task = self.require(id).await?;

        let job_id = self
            .active_jobs
            .write()
            .remove(&id)
            .or_else(|| task.external_job_id.clone());
        if let Some(job_id) = job_id {
            self.scheduler.cancel(&job_id, CancelReason::Delete).await?;
            self.scheduler.observe_terminal(&job_id).await?;
        }

        self.bus.submit(Intent::Remove { id });
        self.bus.flush().await?;

        remove_artifact(&task.destination, &task.final_path()).await;
        remove_artifact(&task.destination, &task.temp_path()).await;

        info!("Deleted task {}", id);
        Ok(())
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, DlsyncError> {
        self.cache.get(id).await
    }

    /// All tasks, newest first
    pub async fn list(&self) -> Result<Vec<TaskRecord>, DlsyncError> {
        self.cache.snapshot().await
    }

    /// Stream of full task snapshots
    pub async fn observe_all(&self) -> Result<WatchStream<Snapshot>, DlsyncError> {
        self.cache.observe_all().await
    }

    /// Wait for the task's current job to end and return the settled record
    ///
    /// A seeding job only ends when it is paused or cancelled.
    pub async fn wait_terminal(&self, id: TaskId) -> Result<TaskRecord, DlsyncError> {
        let task = self.require(id).await?;

        if let Some(job_id) = self.job_for(&task) {
            let outcome = self.scheduler.observe_terminal(&job_id).await?;
            debug!("Job {} of task {} ended: {:?}", job_id, id, outcome);
        }

        self.bus.flush().await?;
        self.require(id).await
    }

    /// Stop every job and write out pending updates
    ///
    /// Interrupted tasks keep their active state on disk; the next start-up
    /// demotes them when it finds their jobs gone.
    pub async fn shutdown(&self) -> Result<(), DlsyncError> {
        info!("Shutting down download service");
        self.scheduler.shutdown().await;
        self.active_jobs.write().clear();
        self.bus.flush().await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn require(&self, id: TaskId) -> Result<TaskRecord, DlsyncError> {
        self.cache.get(id).await?.ok_or(DlsyncError::NotFound(id))
    }

    fn job_for(&self, task: &TaskRecord) -> Option<JobId> {
        self.active_jobs
            .read()
            .get(&task.id)
            .cloned()
            .or_else(|| task.external_job_id.clone())
    }

    async fn launch(&self, task: TaskRecord) -> Result<TaskRecord, DlsyncError> {
        let id = task.id;

        let work: WorkUnit = match task.kind {
            TaskKind::Http => {
                if !matches!(
                    task.state,
                    TaskState::Init | TaskState::Downloading | TaskState::Paused | TaskState::Failed
                ) {
                    return Err(DlsyncError::InvalidOperation(format!(
                        "task {} cannot start from {}",
                        id, task.state
                    )));
                }
                let http = self.http.clone();
                let bus = self.bus.clone();
                let task = task.clone();
                Box::new(move |control: JobControl| -> WorkFuture {
                    Box::pin(async move { http.run(task, bus, control).await })
                })
            }
            TaskKind::Torrent => {
                let delegated = self.delegated.clone().ok_or_else(|| {
                    DlsyncError::InvalidOperation("no torrent engine is configured".to_string())
                })?;
                let bus = self.bus.clone();
                let task = task.clone();
                Box::new(move |control: JobControl| -> WorkFuture {
                    Box::pin(async move { delegated.run(task, bus, control).await })
                })
            }
        };

        let job_id = self
            .scheduler
            .enqueue(id, self.tracked(id, work), UniquenessPolicy::default())
            .await?;
        self.active_jobs.write().insert(id, job_id.clone());

        // A stale link from an earlier job is pointed at the live one
        if task.state.is_active() && task.external_job_id.as_ref() != Some(&job_id) {
            self.bus.submit(Intent::UpdateRequestId {
                id,
                job_id: job_id.clone(),
            });
        }

        info!("Task {} scheduled as job {}", id, job_id);
        Ok(task)
    }

    /// Forget the job once its unit returns
    fn tracked(&self, id: TaskId, work: WorkUnit) -> WorkUnit {
        let jobs = self.active_jobs.clone();
        Box::new(move |control: JobControl| -> WorkFuture {
            let job_id = control.job_id().clone();
            let run = work(control);
            Box::pin(async move {
                let result = run.await;
                let mut jobs = jobs.write();
                if jobs.get(&id) == Some(&job_id) {
                    jobs.remove(&id);
                }
                result
            })
        })
    }
}

fn validate_locator(locator: &str, kind: TaskKind) -> Result<(), DlsyncError> {
    let parsed =
        url::Url::parse(locator).map_err(|_| DlsyncError::InvalidUrl(locator.to_string()))?;

    let supported = match kind {
        TaskKind::Http => matches!(parsed.scheme(), "http" | "https"),
        TaskKind::Torrent => matches!(parsed.scheme(), "magnet" | "http" | "https" | "file"),
    };
    if !supported {
        return Err(DlsyncError::InvalidUrl(locator.to_string()));
    }

    Ok(())
}

/// Whether `path` names an entry strictly inside `destination`
fn is_inside(destination: &Path, path: &Path) -> bool {
    match path.strip_prefix(destination) {
        Ok(rest) => {
            let mut components = rest.components().peekable();
            components.peek().is_some()
                && components.all(|c| matches!(c, std::path::Component::Normal(_)))
        }
        Err(_) => false,
    }
}

/// Best-effort removal of a downloaded file or directory
async fn remove_artifact(destination: &Path, path: &Path) {
    if !is_inside(destination, path) {
        warn!("Refusing to remove {:?}: not inside {:?}", path, destination);
        return;
    }

    let result = match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };

    if let Err(e) = result {
        warn!("Failed to remove {:?}: {}", path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::testing::{show_files, ScriptedEngine};
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(dir: &TempDir) -> CoreConfig {
        let mut config = CoreConfig::with_data_dir(dir.path().join("data"));
        config.default_destination = dir.path().join("out");
        config.max_retries = 0;
        config.progress_interval_ms = 20;
        config
    }

    async fn service(dir: &TempDir) -> DownloadService {
        DownloadService::builder(test_config(dir)).build().await.unwrap()
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn wait_for_state(service: &DownloadService, id: TaskId, state: TaskState) -> TaskRecord {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                service.bus.flush().await.unwrap();
                let task = service.get(id).await.unwrap().unwrap();
                if task.state == state {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("task {} never reached {}", id, state))
    }

    #[tokio::test]
    async fn test_start_downloads_to_completion() {
        let server = MockServer::start().await;
        let content = body(2048);
        Mock::given(method("GET"))
            .and(path("/y.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let mut events = service.subscribe();

        let url = format!("{}/y.bin", server.uri());
        let task = service.start(&url, None).await.unwrap();
        assert_eq!(task.state, TaskState::Init);

        let done = service.wait_terminal(task.id).await.unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.size_bytes, Some(2048));
        assert_eq!(done.downloaded_bytes, 2048);
        assert_eq!(done.progress(), 1.0);
        assert_eq!(tokio::fs::read(done.final_path()).await.unwrap(), content);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CoreEvent::TaskStateChanged { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(states, vec![TaskState::Downloading, TaskState::Completed]);

        // Same locator and destination land on the same finished task
        let again = service.start(&url, None).await.unwrap();
        assert_eq!(again.id, task.id);
        assert_eq!(again.state, TaskState::Completed);
        assert_eq!(service.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pause_then_resume_continues_from_partial() {
        let server = MockServer::start().await;
        let content = body(1000);
        Mock::given(method("GET"))
            .and(path("/y.bin"))
            .respond_with(ResponseTemplate::new(206).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let url = format!("{}/y.bin", server.uri());

        // 40% already on disk from an earlier run
        let id = TaskId::derive(&url, &service.config().default_destination);
        let partial = TaskRecord::new(url.as_str(), service.config().default_destination.clone(), TaskKind::Http);
        tokio::fs::create_dir_all(&partial.destination).await.unwrap();
        tokio::fs::write(partial.temp_path(), &content[..400]).await.unwrap();

        service.start(&url, None).await.unwrap();
        wait_for_state(&service, id, TaskState::Downloading).await;

        let paused = service.pause(id).await.unwrap();
        assert_eq!(paused.state, TaskState::Paused);
        assert_eq!(paused.external_job_id, None);
        assert!(partial.temp_path().exists());

        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/y.bin"))
            .and(header("range", "bytes=400-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(content[400..].to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        service.resume(id).await.unwrap();
        let done = service.wait_terminal(id).await.unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.downloaded_bytes, 1000);
        assert_eq!(tokio::fs::read(done.final_path()).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_delete_removes_record_and_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/done.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body(100)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/slow.bin"))
            .respond_with(ResponseTemplate::new(206).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;

        let done = service
            .start(&format!("{}/done.bin", server.uri()), None)
            .await
            .unwrap();
        let done = service.wait_terminal(done.id).await.unwrap();
        assert!(done.final_path().exists());

        service.delete(done.id).await.unwrap();
        assert!(service.get(done.id).await.unwrap().is_none());
        assert!(!done.final_path().exists());

        let slow_url = format!("{}/slow.bin", server.uri());
        let slow = TaskRecord::new(slow_url.as_str(), service.config().default_destination.clone(), TaskKind::Http);
        tokio::fs::write(slow.temp_path(), body(10)).await.unwrap();
        service.start(&slow_url, None).await.unwrap();
        wait_for_state(&service, slow.id, TaskState::Downloading).await;

        service.delete(slow.id).await.unwrap();
        assert!(service.get(slow.id).await.unwrap().is_none());
        assert!(!slow.temp_path().exists());
        assert!(service.list().await.unwrap().is_empty());

        assert!(matches!(
            service.delete(slow.id).await,
            Err(DlsyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_demotes_interrupted_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let first = service(&dir).await;
        let task = first
            .start(&format!("{}/big.iso", server.uri()), None)
            .await
            .unwrap();
        wait_for_state(&first, task.id, TaskState::Downloading).await;
        first.shutdown().await.unwrap();

        let second = service(&dir).await;
        let task = second.get(task.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Paused);
        assert_eq!(task.external_job_id, None);
    }

    #[tokio::test]
    async fn test_rejects_unusable_locators() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;

        assert!(matches!(
            service.start("ftp://x/y.bin", None).await,
            Err(DlsyncError::InvalidUrl(_))
        ));
        assert!(matches!(
            service.start("magnet:?xt=urn:btih:abc", None).await,
            Err(DlsyncError::InvalidOperation(_))
        ));
        assert!(matches!(
            service.pause(TaskId::derive("https://x/none", Path::new("/d"))).await,
            Err(DlsyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_torrent_seeds_and_resumes_with_saved_session() {
        let engine = ScriptedEngine::new(vec![
            EngineEvent::Metadata {
                name: "show".to_string(),
                files: show_files(),
            },
            EngineEvent::Progress {
                downloaded: 100,
                total: 100,
                speed: 50,
            },
            EngineEvent::Finished,
        ]);

        let dir = TempDir::new().unwrap();
        let service = DownloadService::builder(test_config(&dir))
            .torrent_engine(engine.clone())
            .build()
            .await
            .unwrap();

        let task = service.start("magnet:?xt=urn:btih:abc&dn=show", None).await.unwrap();
        let seeding = wait_for_state(&service, task.id, TaskState::Seeding).await;
        assert_eq!(seeding.files.len(), 2);
        assert!(seeding.external_job_id.is_some());

        let paused = service.pause(task.id).await.unwrap();
        assert_eq!(paused.state, TaskState::SeedingPaused);
        assert!(paused.has_session);
        assert_eq!(paused.external_job_id, None);

        service.resume(task.id).await.unwrap();
        wait_for_state(&service, task.id, TaskState::Seeding).await;

        let starts = engine.starts.lock().clone();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[0], None);
        assert!(starts[1].is_some());

        service.delete(task.id).await.unwrap();
        assert!(service.get(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_torrent_engine_error_reaches_caller() {
        let engine = ScriptedEngine::new(vec![EngineEvent::Error("no peers".to_string())]);

        let dir = TempDir::new().unwrap();
        let service = DownloadService::builder(test_config(&dir))
            .torrent_engine(engine)
            .build()
            .await
            .unwrap();

        let task = service.start("magnet:?xt=urn:btih:def", None).await.unwrap();
        let settled = service.wait_terminal(task.id).await.unwrap();
        assert_eq!(settled.state, TaskState::Paused);
        assert_eq!(settled.error.as_deref(), Some("no peers"));
    }

    #[tokio::test]
    async fn test_delete_stays_inside_destination() {
        let engine = ScriptedEngine::new(vec![EngineEvent::Metadata {
            name: "..".to_string(),
            files: show_files(),
        }]);

        let dir = TempDir::new().unwrap();
        let service = DownloadService::builder(test_config(&dir))
            .torrent_engine(engine)
            .build()
            .await
            .unwrap();

        let sibling = dir.path().join("keep.txt");
        tokio::fs::write(&sibling, b"unrelated").await.unwrap();
        let neighbour = service.config().default_destination.join("other.bin");
        tokio::fs::create_dir_all(&service.config().default_destination)
            .await
            .unwrap();
        tokio::fs::write(&neighbour, b"another task").await.unwrap();

        let task = service.start("magnet:?xt=urn:btih:abc", None).await.unwrap();
        wait_for_state(&service, task.id, TaskState::Downloading).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        service.bus.flush().await.unwrap();
        let running = service.get(task.id).await.unwrap().unwrap();
        assert_eq!(running.display_name, "download");

        service.delete(task.id).await.unwrap();
        assert!(sibling.exists());
        assert!(neighbour.exists());
        assert!(service.config().default_destination.exists());
    }

    #[test]
    fn test_artifact_paths_must_sit_under_destination() {
        let destination = Path::new("/srv/downloads");
        assert!(is_inside(destination, &destination.join("show")));
        assert!(is_inside(destination, &destination.join("show/e01.mkv")));
        assert!(!is_inside(destination, &destination.join("..")));
        assert!(!is_inside(destination, &destination.join("")));
        assert!(!is_inside(destination, destination));
        assert!(!is_inside(destination, Path::new("/srv/other/show")));
        assert!(!is_inside(destination, &destination.join("a/../../x")));
    }
}
