//! In-memory mirror of the task store
//!
//! The cache is loaded lazily on first access and reconciled against the job
//! scheduler: a record claiming to be active whose job is gone is demoted to
//! its paused counterpart before anything is published. After that, only the
//! update bus mutates it, and every mutation republishes the full snapshot.

use crate::error::DlsyncError;
use crate::scheduler::{JobScheduler, Liveness};
use crate::store::TaskStore;
use dlsync_types::{TaskId, TaskRecord};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info};

pub type Snapshot = Arc<Vec<TaskRecord>>;

pub struct LiveCache {
    store: TaskStore,
    scheduler: Arc<dyn JobScheduler>,
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    initialized: Mutex<bool>,
    snapshots: watch::Sender<Snapshot>,
}

impl LiveCache {
    pub fn new(store: TaskStore, scheduler: Arc<dyn JobScheduler>) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            store,
            scheduler,
            tasks: RwLock::new(HashMap::new()),
            initialized: Mutex::new(false),
            snapshots,
        }
    }

    /// Load and reconcile every record; runs at most once
    ///
    /// A failure leaves the cache unpublished and the next call retries.
    pub async fn initialize(&self) -> Result<(), DlsyncError> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        let mut tasks = self.store.load_all().await?;
        let mut demoted = 0;

        for task in tasks.iter_mut() {
            let Some(paused) = task.state.paused_counterpart() else {
                continue;
            };

            let liveness = match &task.external_job_id {
                Some(job_id) => self.scheduler.query_liveness(job_id).await?,
                None => Liveness::Unknown,
            };
            if liveness == Liveness::Alive {
                continue;
            }

            debug!(
                "Task {} claims {} but its job is {:?}; demoting to {}",
                task.id, task.state, liveness, paused
            );
            self.store.demote(task.id, task.state, paused).await?;
            task.state = paused;
            task.external_job_id = None;
            demoted += 1;
        }

        {
            let mut map = self.tasks.write();
            *map = tasks.into_iter().map(|task| (task.id, task)).collect();
        }
        *initialized = true;
        info!(
            "Task cache initialized with {} tasks ({} demoted)",
            self.tasks.read().len(),
            demoted
        );

        self.publish();
        Ok(())
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, DlsyncError> {
        self.initialize().await?;
        Ok(self.tasks.read().get(&id).cloned())
    }

    /// Every task, newest first
    pub async fn snapshot(&self) -> Result<Vec<TaskRecord>, DlsyncError> {
        self.initialize().await?;
        Ok(self.snapshots.borrow().as_ref().clone())
    }

    /// Stream of full snapshots, starting with the current one
    pub async fn observe_all(&self) -> Result<WatchStream<Snapshot>, DlsyncError> {
        self.initialize().await?;
        Ok(WatchStream::new(self.snapshots.subscribe()))
    }

    pub(crate) fn put(&self, task: TaskRecord) {
        self.tasks.write().insert(task.id, task);
        self.publish();
    }

    /// Apply `f` to a cached record; returns false if it is not cached
    pub(crate) fn update<F>(&self, id: TaskId, f: F) -> bool
    where
        F: FnOnce(&mut TaskRecord),
    {
        let found = match self.tasks.write().get_mut(&id) {
            Some(task) => {
                f(task);
                true
            }
            None => false,
        };
        if found {
            self.publish();
        }
        found
    }

    pub(crate) fn remove(&self, id: TaskId) -> Option<TaskRecord> {
        let removed = self.tasks.write().remove(&id);
        if removed.is_some() {
            self.publish();
        }
        removed
    }

    /// Last snapshot handed to observers, without loading anything
    #[cfg(test)]
    pub(crate) fn published(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    fn publish(&self) {
        let mut list: Vec<TaskRecord> = self.tasks.read().values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.snapshots.send_replace(Arc::new(list));
    }
}
