//! Update bus: the single writer of task state
//!
//! Producers submit typed intents from anywhere; one consumer task applies
//! them in order. Progress, description and name updates pass through a
//! per-task throttle gate that keeps only the latest value inside a window.
//! Every applier writes the store first and touches the cache only when the
//! write affected a row.

use crate::cache::LiveCache;
use crate::error::DlsyncError;
use crate::store::TaskStore;
use dlsync_types::{CoreConfig, CoreEvent, FileEntry, JobId, TaskId, TaskRecord, TaskState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

/// A requested mutation of one task
#[derive(Debug, Clone)]
pub enum Intent {
    Insert(TaskRecord),
    UpdateProgress {
        id: TaskId,
        downloaded: u64,
        /// Bytes per second
        speed: u64,
    },
    UpdateState {
        id: TaskId,
        state: TaskState,
        job_id: Option<JobId>,
        error: Option<String>,
    },
    UpdateSize {
        id: TaskId,
        size: u64,
    },
    UpdateName {
        id: TaskId,
        name: String,
    },
    UpdateDescription {
        id: TaskId,
        description: Option<String>,
    },
    UpdateSessionParams {
        id: TaskId,
        blob: Vec<u8>,
    },
    UpdateRequestId {
        id: TaskId,
        job_id: JobId,
    },
    UpdateValidationTag {
        id: TaskId,
        tag: Option<String>,
    },
    UpdateFileManifest {
        id: TaskId,
        files: Vec<FileEntry>,
    },
    Remove {
        id: TaskId,
    },
}

impl Intent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Intent::Insert(task) => task.id,
            Intent::UpdateProgress { id, .. }
            | Intent::UpdateState { id, .. }
            | Intent::UpdateSize { id, .. }
            | Intent::UpdateName { id, .. }
            | Intent::UpdateDescription { id, .. }
            | Intent::UpdateSessionParams { id, .. }
            | Intent::UpdateRequestId { id, .. }
            | Intent::UpdateValidationTag { id, .. }
            | Intent::UpdateFileManifest { id, .. }
            | Intent::Remove { id } => *id,
        }
    }

    fn throttle_kind(&self) -> Option<ThrottleKind> {
        match self {
            Intent::UpdateProgress { .. } => Some(ThrottleKind::Progress),
            Intent::UpdateDescription { .. } => Some(ThrottleKind::Description),
            Intent::UpdateName { .. } => Some(ThrottleKind::Name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ThrottleKind {
    Progress,
    Description,
    Name,
}

/// Rate-limit windows of the throttled intent kinds
#[derive(Debug, Clone, Copy)]
pub struct ThrottleWindows {
    pub progress: Duration,
    pub description: Duration,
    pub name: Duration,
}

impl ThrottleWindows {
    fn window(&self, kind: ThrottleKind) -> Duration {
        match kind {
            ThrottleKind::Progress => self.progress,
            ThrottleKind::Description => self.description,
            ThrottleKind::Name => self.name,
        }
    }
}

impl From<&CoreConfig> for ThrottleWindows {
    fn from(config: &CoreConfig) -> Self {
        Self {
            progress: Duration::from_millis(config.progress_window_ms),
            description: Duration::from_millis(config.description_window_ms),
            name: Duration::from_millis(config.rename_window_ms),
        }
    }
}

impl Default for ThrottleWindows {
    fn default() -> Self {
        Self::from(&CoreConfig::default())
    }
}

enum Message {
    Intent(Intent),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Gate {
    last_emit: Option<Instant>,
    pending: Option<Intent>,
}

/// Handle for submitting intents
#[derive(Clone)]
pub struct UpdateBus {
    tx: mpsc::UnboundedSender<Message>,
}

impl UpdateBus {
    /// Start the consumer task
    pub fn spawn(
        store: TaskStore,
        cache: Arc<LiveCache>,
        events: broadcast::Sender<CoreEvent>,
        windows: ThrottleWindows,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = BusWorker {
            applier: Applier {
                store,
                cache,
                events,
            },
            windows,
            gates: HashMap::new(),
        };
        tokio::spawn(worker.run(rx));
        Self { tx }
    }

    /// Queue an intent; never blocks
    pub fn submit(&self, intent: Intent) {
        if self.tx.send(Message::Intent(intent)).is_err() {
            warn!("Update bus is closed, dropping intent");
        }
    }

    /// Apply every pending throttled value now and wait until everything
    /// submitted before this call has been applied
    pub async fn flush(&self) -> Result<(), DlsyncError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Message::Flush(done_tx))
            .map_err(|_| DlsyncError::Applier("update bus is closed".to_string()))?;
        done_rx
            .await
            .map_err(|_| DlsyncError::Applier("update bus stopped during flush".to_string()))
    }
}

struct BusWorker {
    applier: Applier,
    windows: ThrottleWindows,
    gates: HashMap<(ThrottleKind, TaskId), Gate>,
}

impl BusWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                message = rx.recv() => match message {
                    Some(Message::Intent(intent)) => self.accept(intent).await,
                    Some(Message::Flush(done)) => {
                        self.fire_pending(|_| true).await;
                        let _ = done.send(());
                    }
                    None => {
                        self.fire_pending(|_| true).await;
                        debug!("Update bus stopped");
                        break;
                    }
                },
                _ = sleep_until(deadline), if deadline.is_some() => {
                    let now = Instant::now();
                    let windows = self.windows;
                    self.fire_pending(|((kind, _), gate)| {
                        gate.last_emit
                            .map(|last| now >= last + windows.window(*kind))
                            .unwrap_or(true)
                    })
                    .await;
                }
            }
        }
    }

    async fn accept(&mut self, intent: Intent) {
        let id = intent.task_id();

        let Some(kind) = intent.throttle_kind() else {
            // Keep per-task order: anything held back for this task lands first
            if matches!(intent, Intent::Remove { .. }) {
                self.gates.retain(|(_, task), _| *task != id);
            } else {
                self.fire_pending(|((_, task), _)| *task == id).await;
            }
            let settles = matches!(&intent, Intent::UpdateState { state, .. } if !state.is_active());
            self.applier.apply(intent).await;
            if settles {
                // Nothing drives a settled task; a restart opens fresh gates
                self.gates.retain(|(_, task), _| *task != id);
            }
            return;
        };

        let window = self.windows.window(kind);
        let now = Instant::now();
        let gate = self.gates.entry((kind, id)).or_default();

        let open = gate
            .last_emit
            .map(|last| now.duration_since(last) >= window)
            .unwrap_or(true);

        if open {
            gate.last_emit = Some(now);
            gate.pending = None;
            self.applier.apply(intent).await;
        } else {
            gate.pending = Some(intent);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.gates
            .iter()
            .filter(|(_, gate)| gate.pending.is_some())
            .filter_map(|((kind, _), gate)| gate.last_emit.map(|last| last + self.windows.window(*kind)))
            .min()
    }

    async fn fire_pending<F>(&mut self, mut due: F)
    where
        F: FnMut((&(ThrottleKind, TaskId), &Gate)) -> bool,
    {
        let now = Instant::now();
        let mut ready = Vec::new();
        for (key, gate) in self.gates.iter_mut() {
            if gate.pending.is_some() && due((key, &*gate)) {
                if let Some(intent) = gate.pending.take() {
                    gate.last_emit = Some(now);
                    ready.push(intent);
                }
            }
        }

        for intent in ready {
            self.applier.apply(intent).await;
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Applier {
    store: TaskStore,
    cache: Arc<LiveCache>,
    events: broadcast::Sender<CoreEvent>,
}

impl Applier {
    async fn apply(&self, intent: Intent) {
        // Make sure a later cache load cannot overwrite what we apply now.
        // An unloaded cache stays unpublished until a load succeeds.
        let mirror = match self.cache.initialize().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Task cache unavailable, applying to store only: {}", e);
                false
            }
        };

        match self.apply_inner(&intent, mirror).await {
            Ok(events) => {
                for event in events {
                    let _ = self.events.send(event);
                }
            }
            Err(e) => warn!("Skipping intent for task {}: {}", intent.task_id(), e),
        }
    }

    async fn apply_inner(&self, intent: &Intent, mirror: bool) -> Result<Vec<CoreEvent>, DlsyncError> {
        let id = intent.task_id();

        let rows = match intent {
            Intent::Insert(task) => {
                if !self.store.insert_if_absent(task).await? {
                    return Ok(Vec::new());
                }
                let task = self.reload(id, mirror).await?;
                return Ok(vec![CoreEvent::TaskAdded { task }]);
            }
            Intent::UpdateProgress {
                downloaded, speed, ..
            } => {
                if self.store.update_progress(id, *downloaded).await? == 0 {
                    return Ok(Vec::new());
                }
                let mut total = None;
                let mut applied = *downloaded;
                if mirror {
                    self.cache.update(id, |task| {
                        applied = task.size_bytes.map_or(*downloaded, |size| (*downloaded).min(size));
                        task.downloaded_bytes = applied;
                        total = task.size_bytes;
                    });
                }
                return Ok(vec![CoreEvent::TaskProgress {
                    id,
                    downloaded: applied,
                    total,
                    speed: *speed,
                }]);
            }
            Intent::UpdateState {
                state,
                job_id,
                error,
                ..
            } => {
                let rows = self
                    .store
                    .update_state(id, *state, job_id.as_ref(), error.as_deref())
                    .await?;
                if rows == 0 {
                    debug!("Rejected transition of task {} to {}", id, state);
                    return Ok(Vec::new());
                }
                self.reload(id, mirror).await?;

                let mut events = vec![CoreEvent::TaskStateChanged {
                    id,
                    state: *state,
                    error: error.clone(),
                }];
                if let Some(message) = error {
                    events.push(CoreEvent::Error {
                        message: message.clone(),
                        context: Some(id.to_string()),
                    });
                }
                return Ok(events);
            }
            Intent::UpdateSize { size, .. } => self.store.update_size(id, *size).await?,
            Intent::UpdateName { name, .. } => self.store.update_name(id, name).await?,
            Intent::UpdateDescription { description, .. } => {
                self.store
                    .update_description(id, description.as_deref())
                    .await?
            }
            Intent::UpdateSessionParams { blob, .. } => self.store.save_session(id, blob).await?,
            Intent::UpdateRequestId { job_id, .. } => {
                self.store.update_request_id(id, job_id).await?
            }
            Intent::UpdateValidationTag { tag, .. } => {
                self.store
                    .update_validation_tag(id, tag.as_deref())
                    .await?
            }
            Intent::UpdateFileManifest { files, .. } => {
                self.store.replace_file_manifest(id, files).await?
            }
            Intent::Remove { .. } => {
                if self.store.delete(id).await? == 0 {
                    return Ok(Vec::new());
                }
                if mirror {
                    self.cache.remove(id);
                }
                return Ok(vec![CoreEvent::TaskRemoved { id }]);
            }
        };

        if rows == 0 {
            return Ok(Vec::new());
        }
        let task = self.reload(id, mirror).await?;
        Ok(vec![CoreEvent::TaskUpdated { task }])
    }

    /// Read back the stored record, mirroring it into the cache if asked
    async fn reload(&self, id: TaskId, mirror: bool) -> Result<TaskRecord, DlsyncError> {
        let task = self
            .store
            .get(id)
            .await?
            .ok_or(DlsyncError::NotFound(id))?;
        if mirror {
            self.cache.put(task.clone());
        }
        Ok(task)
    }
}
