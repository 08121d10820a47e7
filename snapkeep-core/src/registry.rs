/*!
Process-wide registry of download sessions.

Every entry carries its own expiry task. Removing an entry early aborts the
task; a task that fires after its entry is gone finds nothing to remove.
*/

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::stream::SnapshotStream;
use crate::{Result, SnapkeepError};

/// Lifetime of a registry entry, measured from registration
pub const DEFAULT_DOWNLOAD_LIFETIME: Duration = Duration::from_secs(15 * 60);

struct Entry {
    stream: Arc<SnapshotStream>,
    expiry: Option<AbortHandle>,
}

/// Mapping from session ID to [`SnapshotStream`]
///
/// A single lock guards the map; no operation performs I/O while holding it.
#[derive(Default)]
pub struct DownloadRegistry {
    downloads: Mutex<HashMap<String, Entry>>,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.downloads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a stream under its ID without automatic expiry.
    pub fn insert(&self, stream: Arc<SnapshotStream>) {
        self.insert_entry(stream, None);
    }

    /// Register a stream and remove it again after `lifetime`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn insert_with_expiry(
        self: &Arc<Self>,
        stream: Arc<SnapshotStream>,
        lifetime: Duration,
    ) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            SnapkeepError::validation("download expiry requires a running tokio runtime")
        })?;

        let id = stream.id().to_string();
        let registry: Weak<Self> = Arc::downgrade(self);
        let task = handle.spawn(async move {
            tokio::time::sleep(lifetime).await;
            if let Some(registry) = registry.upgrade() {
                registry.expire(&id);
            }
        });

        self.insert_entry(stream, Some(task.abort_handle()));
        Ok(())
    }

    fn insert_entry(&self, stream: Arc<SnapshotStream>, expiry: Option<AbortHandle>) {
        let id = stream.id().to_string();
        let mut downloads = self.lock();
        if let Some(old) = downloads.insert(id, Entry { stream, expiry }) {
            if let Some(expiry) = old.expiry {
                expiry.abort();
            }
        }

        #[cfg(feature = "metrics")]
        crate::observability::SnapkeepMetrics::global().set_tracked_downloads(downloads.len());
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<SnapshotStream>> {
        self.lock().get(id).map(|e| Arc::clone(&e.stream))
    }

    /// Remove an entry and cancel its pending expiry. Absent IDs are ignored.
    pub fn remove(&self, id: &str) {
        if let Some(entry) = self.remove_entry(id) {
            if let Some(expiry) = entry.expiry {
                expiry.abort();
            }
            debug!(download_id = %id, "Download removed");
        }
    }

    fn expire(&self, id: &str) {
        if self.remove_entry(id).is_some() {
            info!(download_id = %id, "Download has expired");
        }
    }

    fn remove_entry(&self, id: &str) -> Option<Entry> {
        let mut downloads = self.lock();
        let entry = downloads.remove(id);

        #[cfg(feature = "metrics")]
        crate::observability::SnapkeepMetrics::global().set_tracked_downloads(downloads.len());

        entry
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// ID of a live session streaming the named snapshot, if any.
    pub fn active_session_for(&self, snapshot_name: &str) -> Option<String> {
        self.lock()
            .values()
            .find(|e| e.stream.name() == snapshot_name)
            .map(|e| e.stream.id().to_string())
    }

    pub fn has_active_session_for(&self, snapshot_name: &str) -> bool {
        self.active_session_for(snapshot_name).is_some()
    }

    /// All registered streams in unspecified order
    pub fn streams(&self) -> Vec<Arc<SnapshotStream>> {
        self.lock().values().map(|e| Arc::clone(&e.stream)).collect()
    }
}

impl Drop for DownloadRegistry {
    fn drop(&mut self) {
        let downloads = self
            .downloads
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for entry in downloads.values() {
            if let Some(expiry) = &entry.expiry {
                expiry.abort();
            }
        }
    }
}
