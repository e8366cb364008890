//! Scripted engine used by tests of the delegated transfer

use crate::error::DlsyncError;
use crate::transfer::{EngineEvent, TorrentEngine, TorrentSession};
use async_trait::async_trait;
use dlsync_types::FileEntry;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Engine that replays a fixed script, then idles until shut down
pub(crate) struct ScriptedEngine {
    script: Vec<EngineEvent>,
    /// Resumption blob handed to each `start`
    pub(crate) starts: Mutex<Vec<Option<Vec<u8>>>>,
    saves: Arc<Mutex<u32>>,
    rejects_saved: bool,
}

impl ScriptedEngine {
    pub(crate) fn new(script: Vec<EngineEvent>) -> Arc<Self> {
        Arc::new(Self {
            script,
            starts: Mutex::new(Vec::new()),
            saves: Arc::new(Mutex::new(0)),
            rejects_saved: false,
        })
    }

    /// Engine that refuses to start from any resumption blob
    pub(crate) fn rejecting_saved(script: Vec<EngineEvent>) -> Arc<Self> {
        Arc::new(Self {
            script,
            starts: Mutex::new(Vec::new()),
            saves: Arc::new(Mutex::new(0)),
            rejects_saved: true,
        })
    }
}

struct ScriptedSession {
    events: std::vec::IntoIter<EngineEvent>,
    saves: Arc<Mutex<u32>>,
}

#[async_trait]
impl TorrentEngine for ScriptedEngine {
    async fn start(
        &self,
        _locator: &str,
        _destination: &Path,
        session: Option<Vec<u8>>,
    ) -> Result<Box<dyn TorrentSession>, DlsyncError> {
        let resumed = session.is_some();
        self.starts.lock().push(session);
        if resumed && self.rejects_saved {
            return Err(DlsyncError::Engine("corrupt resume data".to_string()));
        }
        Ok(Box::new(ScriptedSession {
            events: self.script.clone().into_iter(),
            saves: self.saves.clone(),
        }))
    }
}

#[async_trait]
impl TorrentSession for ScriptedSession {
    async fn next_event(&mut self) -> Option<EngineEvent> {
        match self.events.next() {
            Some(event) => Some(event),
            None => std::future::pending().await,
        }
    }

    async fn save_state(&mut self) -> Result<Vec<u8>, DlsyncError> {
        let count = {
            let mut saves = self.saves.lock();
            *saves += 1;
            *saves
        };
        Ok(format!("state-{}", count).into_bytes())
    }

    async fn shutdown(self: Box<Self>) {}
}

pub(crate) fn show_files() -> Vec<FileEntry> {
    vec![
        FileEntry {
            index: 0,
            path: PathBuf::from("show/e01.mkv"),
            size_bytes: 60,
            downloaded_bytes: 0,
        },
        FileEntry {
            index: 1,
            path: PathBuf::from("show/e02.mkv"),
            size_bytes: 40,
            downloaded_bytes: 0,
        },
    ]
}
