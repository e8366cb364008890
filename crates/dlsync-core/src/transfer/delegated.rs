//! Delegated transfer through an external BitTorrent-style engine
//!
//! The engine is a black box behind [`TorrentEngine`]. One session is
//! started per job attempt and fed the stored resumption blob; its events
//! are translated into bus intents. Pausing saves the session state before
//! tearing the session down.

use crate::bus::{Intent, UpdateBus};
use crate::error::DlsyncError;
use crate::scheduler::{CancelReason, JobControl};
use crate::session::SessionStore;
use async_trait::async_trait;
use dlsync_types::{sanitize_file_name, FileEntry, TaskRecord, TaskState};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Something the engine reports about a running session
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Metadata {
        name: String,
        files: Vec<FileEntry>,
    },
    Progress {
        downloaded: u64,
        total: u64,
        speed: u64,
    },
    /// Every piece is present
    Finished,
    /// Free-form status line shown as the task description
    Status(String),
    Error(String),
}

/// One live engine session
#[async_trait]
pub trait TorrentSession: Send {
    /// Next event, or `None` once the session has stopped on its own
    async fn next_event(&mut self) -> Option<EngineEvent>;

    /// Opaque state to hand back to [`TorrentEngine::start`] later
    async fn save_state(&mut self) -> Result<Vec<u8>, DlsyncError>;

    async fn shutdown(self: Box<Self>);
}

#[async_trait]
pub trait TorrentEngine: Send + Sync {
    async fn start(
        &self,
        locator: &str,
        destination: &Path,
        session: Option<Vec<u8>>,
    ) -> Result<Box<dyn TorrentSession>, DlsyncError>;
}

#[derive(Clone)]
pub struct DelegatedTransfer {
    engine: Arc<dyn TorrentEngine>,
    sessions: SessionStore,
}

impl DelegatedTransfer {
    pub fn new(engine: Arc<dyn TorrentEngine>, sessions: SessionStore) -> Self {
        Self { engine, sessions }
    }

    /// States from which `run` continues as a seeder instead of downloading
    pub fn seeds_from(state: TaskState) -> bool {
        matches!(
            state,
            TaskState::Completed | TaskState::Seeding | TaskState::SeedingPaused
        )
    }

    pub async fn run(
        &self,
        task: TaskRecord,
        bus: UpdateBus,
        control: JobControl,
    ) -> Result<(), DlsyncError> {
        let id = task.id;
        let mut seeding = Self::seeds_from(task.state);
        let entry_state = if seeding {
            TaskState::Seeding
        } else {
            TaskState::Downloading
        };

        bus.submit(Intent::UpdateState {
            id,
            state: entry_state,
            job_id: Some(control.job_id().clone()),
            error: None,
        });

        let blob = match self.sessions.load(id).await {
            Ok(blob) => blob,
            Err(e) => return Err(self.fail(&bus, &task, entry_state, e.to_string())),
        };
        info!(
            "Starting engine session for {} ({}, resume data: {})",
            id,
            entry_state,
            blob.is_some()
        );

        if let Err(e) = tokio::fs::create_dir_all(&task.destination).await {
            let message = format!("could not create {:?}: {}", task.destination, e);
            return Err(self.fail(&bus, &task, entry_state, message));
        }

        let mut session = match self.start_session(&task, blob).await {
            Ok(session) => session,
            Err(e) => return Err(self.fail(&bus, &task, entry_state, e.to_string())),
        };

        let mut size = task.size_bytes;

        loop {
            let event = tokio::select! {
                event = session.next_event() => event,
                _ = control.cancelled() => {
                    let reason = control.cancel_reason();
                    if reason != CancelReason::Delete {
                        Self::persist_state(&bus, &task, session.as_mut()).await;
                    }
                    session.shutdown().await;
                    info!("Engine session for {} stopped ({})", id, reason);
                    return Err(DlsyncError::Cancelled(reason));
                }
            };

            match event {
                Some(EngineEvent::Metadata { name, files }) => {
                    debug!("Metadata for {}: {} ({} files)", id, name, files.len());
                    let total: u64 = files.iter().map(|f| f.size_bytes).sum();
                    if total > 0 && size != Some(total) {
                        size = Some(total);
                        bus.submit(Intent::UpdateSize { id, size: total });
                    }
                    bus.submit(Intent::UpdateName {
                        id,
                        name: sanitize_file_name(&name),
                    });
                    bus.submit(Intent::UpdateFileManifest { id, files });
                }
                Some(EngineEvent::Progress {
                    downloaded,
                    total,
                    speed,
                }) => {
                    if total > 0 && size != Some(total) {
                        size = Some(total);
                        bus.submit(Intent::UpdateSize { id, size: total });
                    }
                    bus.submit(Intent::UpdateProgress {
                        id,
                        downloaded,
                        speed,
                    });
                }
                Some(EngineEvent::Finished) if !seeding => {
                    info!("Download {} finished, seeding", id);
                    bus.submit(Intent::UpdateState {
                        id,
                        state: TaskState::Completed,
                        job_id: None,
                        error: None,
                    });
                    bus.submit(Intent::UpdateState {
                        id,
                        state: TaskState::Seeding,
                        job_id: Some(control.job_id().clone()),
                        error: None,
                    });
                    Self::persist_state(&bus, &task, session.as_mut()).await;
                    seeding = true;
                }
                Some(EngineEvent::Finished) => {}
                Some(EngineEvent::Status(status)) => {
                    bus.submit(Intent::UpdateDescription {
                        id,
                        description: Some(status),
                    });
                }
                Some(EngineEvent::Error(message)) => {
                    Self::persist_state(&bus, &task, session.as_mut()).await;
                    session.shutdown().await;
                    let current = if seeding {
                        TaskState::Seeding
                    } else {
                        TaskState::Downloading
                    };
                    return Err(self.fail(&bus, &task, current, message));
                }
                None => {
                    // The engine stopped by itself; park the task where it can be restarted
                    let current = if seeding {
                        TaskState::Seeding
                    } else {
                        TaskState::Downloading
                    };
                    if let Some(paused) = current.paused_counterpart() {
                        bus.submit(Intent::UpdateState {
                            id,
                            state: paused,
                            job_id: None,
                            error: None,
                        });
                    }
                    warn!("Engine session for {} ended without a stop request", id);
                    return Ok(());
                }
            }
        }
    }

    /// Start the engine, falling back to a fresh session when it rejects
    /// the stored resumption blob
    async fn start_session(
        &self,
        task: &TaskRecord,
        blob: Option<Vec<u8>>,
    ) -> Result<Box<dyn TorrentSession>, DlsyncError> {
        let resumed = blob.is_some();
        match self
            .engine
            .start(&task.source_locator, &task.destination, blob)
            .await
        {
            Err(e) if resumed => {
                warn!("Engine rejected saved state of {}, starting over: {}", task.id, e);
                self.sessions.delete(task.id).await?;
                self.engine
                    .start(&task.source_locator, &task.destination, None)
                    .await
            }
            result => result,
        }
    }

    async fn persist_state(bus: &UpdateBus, task: &TaskRecord, session: &mut dyn TorrentSession) {
        match session.save_state().await {
            Ok(blob) => bus.submit(Intent::UpdateSessionParams { id: task.id, blob }),
            Err(e) => warn!("Could not save engine state for {}: {}", task.id, e),
        }
    }

    /// Pause the task with the engine's message attached
    fn fail(
        &self,
        bus: &UpdateBus,
        task: &TaskRecord,
        current: TaskState,
        message: String,
    ) -> DlsyncError {
        error!("Engine error for {}: {}", task.id, message);
        if let Some(paused) = current.paused_counterpart() {
            bus.submit(Intent::UpdateState {
                id: task.id,
                state: paused,
                job_id: None,
                error: Some(message.clone()),
            });
        }
        DlsyncError::Engine(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ThrottleWindows;
    use crate::cache::LiveCache;
    use crate::scheduler::LocalJobScheduler;
    use crate::store::TaskStore;
    use crate::transfer::testing::{show_files, ScriptedEngine};
    use dlsync_types::{CoreConfig, CoreEvent, TaskKind};
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    struct Fixture {
        _dir: TempDir,
        cache: Arc<LiveCache>,
        store: TaskStore,
        bus: UpdateBus,
        events: broadcast::Receiver<CoreEvent>,
        task: TaskRecord,
    }

    async fn fixture(dir: TempDir) -> Fixture {
        let destination = dir.path().join("out");
        fixture_in(dir, destination).await
    }

    async fn fixture_in(dir: TempDir, destination: PathBuf) -> Fixture {
        let config = CoreConfig::with_data_dir(dir.path());
        let store = TaskStore::open(dir.path().join("tasks.db")).await.unwrap();
        let scheduler = LocalJobScheduler::open(dir.path().join("jobs.db"), 1).await.unwrap();
        let cache = Arc::new(LiveCache::new(store.clone(), Arc::new(scheduler)));
        let (sender, events) = broadcast::channel(64);
        let bus = UpdateBus::spawn(store.clone(), cache.clone(), sender, ThrottleWindows::from(&config));

        let task = TaskRecord::new("magnet:?xt=urn:btih:abc", destination, TaskKind::Torrent);
        bus.submit(Intent::Insert(task.clone()));
        bus.flush().await.unwrap();

        Fixture {
            _dir: dir,
            cache,
            store,
            bus,
            events,
            task,
        }
    }

    fn error_messages(events: &mut broadcast::Receiver<CoreEvent>) -> Vec<String> {
        let mut messages = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CoreEvent::Error { message, .. } = event {
                messages.push(message);
            }
        }
        messages
    }

    #[tokio::test]
    async fn test_events_become_intents_and_pause_saves_state() {
        let fx = fixture(TempDir::new().unwrap()).await;
        let engine = ScriptedEngine::new(vec![
            EngineEvent::Metadata {
                name: "show".to_string(),
                files: show_files(),
            },
            EngineEvent::Progress {
                downloaded: 50,
                total: 100,
                speed: 10,
            },
            EngineEvent::Status("3 peers".to_string()),
            EngineEvent::Progress {
                downloaded: 100,
                total: 100,
                speed: 10,
            },
            EngineEvent::Finished,
        ]);
        let transfer = DelegatedTransfer::new(engine.clone(), SessionStore::new(fx.store.clone()));

        let control = JobControl::detached();
        let job = {
            let (transfer, task, bus, control) =
                (transfer.clone(), fx.task.clone(), fx.bus.clone(), control.clone());
            tokio::spawn(async move { transfer.run(task, bus, control).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        control.trigger(CancelReason::Pause);
        let result = job.await.unwrap();
        assert!(matches!(result, Err(DlsyncError::Cancelled(CancelReason::Pause))));
        fx.bus.flush().await.unwrap();

        let task = fx.cache.get(fx.task.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Seeding);
        assert_eq!(task.display_name, "show");
        assert_eq!(task.files, show_files());
        assert_eq!(task.size_bytes, Some(100));
        assert_eq!(task.downloaded_bytes, 100);
        assert_eq!(task.description.as_deref(), Some("3 peers"));
        assert!(task.has_session);
        assert!(task.completed_at.is_some());

        // Once after finishing, once on pause
        assert_eq!(
            fx.store.load_session(fx.task.id).await.unwrap(),
            Some(b"state-2".to_vec())
        );
        assert_eq!(*engine.starts.lock(), vec![None]);
    }

    #[tokio::test]
    async fn test_engine_error_pauses_with_message() {
        let fx = fixture(TempDir::new().unwrap()).await;
        let engine = ScriptedEngine::new(vec![
            EngineEvent::Progress {
                downloaded: 10,
                total: 100,
                speed: 1,
            },
            EngineEvent::Error("tracker unreachable".to_string()),
        ]);
        let transfer = DelegatedTransfer::new(engine, SessionStore::new(fx.store.clone()));

        let err = transfer
            .run(fx.task.clone(), fx.bus.clone(), JobControl::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, DlsyncError::Engine(ref m) if m == "tracker unreachable"));
        fx.bus.flush().await.unwrap();

        let task = fx.cache.get(fx.task.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Paused);
        assert_eq!(task.error.as_deref(), Some("tracker unreachable"));
        assert_eq!(task.downloaded_bytes, 10);
        assert!(task.has_session);
    }

    #[tokio::test]
    async fn test_unusable_destination_pauses_with_message() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut fx = fixture_in(dir, blocker.join("out")).await;
        let engine = ScriptedEngine::new(Vec::new());
        let transfer = DelegatedTransfer::new(engine.clone(), SessionStore::new(fx.store.clone()));

        let err = transfer
            .run(fx.task.clone(), fx.bus.clone(), JobControl::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, DlsyncError::Engine(_)));
        fx.bus.flush().await.unwrap();

        let task = fx.cache.get(fx.task.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Paused);
        assert_eq!(task.external_job_id, None);
        assert!(task.error.as_deref().unwrap().contains("could not create"));
        assert_eq!(error_messages(&mut fx.events).len(), 1);
        assert!(engine.starts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_engine_names_cannot_escape_destination() {
        let fx = fixture(TempDir::new().unwrap()).await;
        let engine = ScriptedEngine::new(vec![EngineEvent::Metadata {
            name: "..".to_string(),
            files: show_files(),
        }]);
        let transfer = DelegatedTransfer::new(engine, SessionStore::new(fx.store.clone()));

        let control = JobControl::detached();
        let job = {
            let (transfer, task, bus, control) =
                (transfer.clone(), fx.task.clone(), fx.bus.clone(), control.clone());
            tokio::spawn(async move { transfer.run(task, bus, control).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        control.trigger(CancelReason::Pause);
        let _ = job.await.unwrap();
        fx.bus.flush().await.unwrap();

        let task = fx.cache.get(fx.task.id).await.unwrap().unwrap();
        assert_eq!(task.display_name, "download");
        assert_eq!(task.final_path(), fx.task.destination.join("download"));
    }

    #[tokio::test]
    async fn test_rejected_resume_data_starts_fresh() {
        let fx = fixture(TempDir::new().unwrap()).await;
        fx.store.save_session(fx.task.id, b"stale").await.unwrap();
        let engine = ScriptedEngine::rejecting_saved(vec![EngineEvent::Progress {
            downloaded: 5,
            total: 100,
            speed: 1,
        }]);
        let transfer = DelegatedTransfer::new(engine.clone(), SessionStore::new(fx.store.clone()));

        let control = JobControl::detached();
        let job = {
            let (transfer, task, bus, control) =
                (transfer.clone(), fx.task.clone(), fx.bus.clone(), control.clone());
            tokio::spawn(async move { transfer.run(task, bus, control).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        control.trigger(CancelReason::Pause);
        let result = job.await.unwrap();
        assert!(matches!(result, Err(DlsyncError::Cancelled(CancelReason::Pause))));
        fx.bus.flush().await.unwrap();

        assert_eq!(*engine.starts.lock(), vec![Some(b"stale".to_vec()), None]);
        // The stale blob is gone and the fresh session's state replaced it
        assert_eq!(
            fx.store.load_session(fx.task.id).await.unwrap(),
            Some(b"state-1".to_vec())
        );
        let task = fx.cache.get(fx.task.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Downloading);
        assert_eq!(task.error, None);
    }

    #[test]
    fn test_seeding_state_selection() {
        assert!(!DelegatedTransfer::seeds_from(TaskState::Init));
        assert!(!DelegatedTransfer::seeds_from(TaskState::Paused));
        assert!(!DelegatedTransfer::seeds_from(TaskState::Failed));
        assert!(DelegatedTransfer::seeds_from(TaskState::Completed));
        assert!(DelegatedTransfer::seeds_from(TaskState::SeedingPaused));
    }
}
