//! Session resumption blobs for delegated transfers
//!
//! The blob is whatever the external engine hands back from `save_state`.
//! It is stored and returned byte for byte and never interpreted here.
//! Writes go through the update bus as `UpdateSessionParams`.

use crate::error::DlsyncError;
use crate::store::TaskStore;
use dlsync_types::TaskId;

#[derive(Clone, Debug)]
pub struct SessionStore {
    store: TaskStore,
}

impl SessionStore {
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }

    pub async fn load(&self, id: TaskId) -> Result<Option<Vec<u8>>, DlsyncError> {
        self.store.load_session(id).await
    }

    /// Drop the blob so the next start begins a fresh engine session
    pub async fn delete(&self, id: TaskId) -> Result<bool, DlsyncError> {
        Ok(self.store.delete_session(id).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlsync_types::{TaskKind, TaskRecord};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_blob_is_returned_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::open(dir.path().join("tasks.db")).await.unwrap();
        let task = TaskRecord::new("magnet:?xt=urn:btih:abc", "/d", TaskKind::Torrent);
        store.insert_if_absent(&task).await.unwrap();

        let sessions = SessionStore::new(store.clone());
        assert_eq!(sessions.load(task.id).await.unwrap(), None);

        let blob = vec![0u8, 255, 7, 0, 42];
        store.save_session(task.id, &blob).await.unwrap();
        assert_eq!(sessions.load(task.id).await.unwrap(), Some(blob));

        assert!(sessions.delete(task.id).await.unwrap());
        assert_eq!(sessions.load(task.id).await.unwrap(), None);
        assert!(!sessions.delete(task.id).await.unwrap());
    }
}
