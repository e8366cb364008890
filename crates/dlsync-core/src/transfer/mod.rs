//! Transfer engines
//!
//! A transfer runs inside a scheduler job and reports everything it learns
//! as bus intents. It never writes the store or the cache itself.

mod delegated;
mod http;
#[cfg(test)]
pub(crate) mod testing;

pub use delegated::{DelegatedTransfer, EngineEvent, TorrentEngine, TorrentSession};
pub use http::HttpTransfer;

use crate::bus::{Intent, UpdateBus};
use dlsync_types::TaskId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Periodically publishes a byte counter as `UpdateProgress`
///
/// Ticks on a fixed wall-clock cadence regardless of chunk arrival. The
/// background task stops when the reporter is dropped.
pub(crate) struct ProgressReporter {
    downloaded: Arc<AtomicU64>,
    _stop: DropGuard,
}

impl ProgressReporter {
    pub(crate) fn spawn(id: TaskId, start: u64, bus: UpdateBus, interval: Duration) -> Self {
        let downloaded = Arc::new(AtomicU64::new(start));
        let stop = CancellationToken::new();

        let counter = downloaded.clone();
        let token = stop.clone();
        tokio::spawn(async move {
            let mut last_downloaded = start;
            let mut last_time = Instant::now();

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let now = Instant::now();
                let downloaded = counter.load(Ordering::Acquire);
                let elapsed_ms = now.duration_since(last_time).as_millis() as u64;
                let speed = if elapsed_ms > 0 {
                    downloaded.saturating_sub(last_downloaded) * 1000 / elapsed_ms
                } else {
                    0
                };

                bus.submit(Intent::UpdateProgress {
                    id,
                    downloaded,
                    speed,
                });

                last_downloaded = downloaded;
                last_time = now;
            }
        });

        Self {
            downloaded,
            _stop: stop.drop_guard(),
        }
    }

    pub(crate) fn add(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn current(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }
}
