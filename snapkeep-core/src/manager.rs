/*!
Coordinator tying download sessions to snapshot pruning.

The manager owns the snapshot root and the download registry. Downloads are
registered for a fixed lifetime; pruning consults the registry so that a
snapshot is never removed while a session references it.
*/

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use tracing::info;

use crate::config::SnapkeepConfig;
use crate::format::ArchiveFormat;
use crate::pruner::{self, PruneOptions, SnapshotInfo};
use crate::registry::{DownloadRegistry, DEFAULT_DOWNLOAD_LIFETIME};
use crate::stream::{DownloadStatus, SnapshotStream, StreamOptions};
use crate::{Result, SnapkeepError};

/// Check a snapshot name before it is joined onto the snapshot root.
///
/// Accepted names are two ASCII alphanumeric runs separated by one dash,
/// which rules out path separators and `..`.
pub fn validate_snapshot_name(name: &str) -> Result<()> {
    let valid = name
        .split_once('-')
        .map(|(a, b)| {
            let alnum = |s: &str| !s.is_empty() && s.bytes().all(|c| c.is_ascii_alphanumeric());
            alnum(a) && alnum(b)
        })
        .unwrap_or(false);

    if !valid {
        return Err(SnapkeepError::invalid_name(format!("{name:?}")));
    }
    Ok(())
}

/// ID and snapshot of a tracked download
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadSummary {
    pub id: String,
    pub name: String,
}

pub struct SnapshotManager {
    snapshot_dir: PathBuf,
    download_lifetime: Duration,
    registry: Arc<DownloadRegistry>,
}

impl SnapshotManager {
    pub fn new<P: Into<PathBuf>>(snapshot_dir: P) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            download_lifetime: DEFAULT_DOWNLOAD_LIFETIME,
            registry: Arc::new(DownloadRegistry::new()),
        }
    }

    pub fn from_config(config: &SnapkeepConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(&config.snapshot_dir).with_download_lifetime(config.download_lifetime_std()?))
    }

    pub fn with_download_lifetime(mut self, lifetime: Duration) -> Self {
        self.download_lifetime = lifetime;
        self
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    pub fn registry(&self) -> &Arc<DownloadRegistry> {
        &self.registry
    }

    /// Prepare and register a download of the named snapshot.
    ///
    /// The format is given by its wire name. The session stays registered
    /// for the download lifetime; the caller streams the archive with
    /// [`SnapshotStream::write_archive`].
    ///
    /// # Errors
    /// * `SnapkeepError::InvalidName` - If the name is malformed
    /// * `SnapkeepError::UnknownFormat` - If the format is not supported
    /// * `SnapkeepError::NotFound` / `SnapkeepError::Invalid` - If the
    ///   snapshot directory is missing or not a directory
    pub fn start_download(&self, name: &str, format: &str) -> Result<Arc<SnapshotStream>> {
        validate_snapshot_name(name)?;
        let format: ArchiveFormat = format.parse()?;

        let stream = Arc::new(SnapshotStream::new(StreamOptions {
            name: name.to_string(),
            root: self.snapshot_dir.join(name),
            format,
        })?);

        self.registry
            .insert_with_expiry(Arc::clone(&stream), self.download_lifetime)?;

        info!(download_id = %stream.id(), snapshot = %name, format = %format, "Download registered");
        Ok(stream)
    }

    pub fn download_status(&self, id: &str) -> Result<DownloadStatus> {
        self.registry
            .lookup(id)
            .map(|s| s.status())
            .ok_or_else(|| SnapkeepError::DownloadNotFound(id.to_string()))
    }

    /// Tracked downloads, newest first
    pub fn active_downloads(&self) -> Vec<DownloadSummary> {
        let mut downloads: Vec<_> = self
            .registry
            .streams()
            .iter()
            .map(|s| DownloadSummary {
                id: s.id().to_string(),
                name: s.name().to_string(),
            })
            .collect();
        downloads.sort_by(|a, b| b.id.cmp(&a.id));
        downloads
    }

    /// Veto hook for pruning: fails while a session streams `name`.
    pub fn check_snapshot_before_remove(&self, name: &str) -> Result<()> {
        check_registry(&self.registry, name)
    }

    /// Prune options for the snapshot root, wired to the download registry
    pub fn prune_options(&self, keep_within: ChronoDuration) -> PruneOptions {
        let registry = Arc::clone(&self.registry);
        PruneOptions::new(&self.snapshot_dir)
            .with_keep_within(keep_within)
            .with_pre_remove_check(move |name| check_registry(&registry, name))
    }

    /// Parsed snapshots below the root and names that did not parse
    pub fn list_snapshots(&self) -> Result<(Vec<SnapshotInfo>, Vec<String>)> {
        pruner::list_snapshots(&self.snapshot_dir)
    }
}

fn check_registry(registry: &DownloadRegistry, name: &str) -> Result<()> {
    match registry.active_session_for(name) {
        Some(id) => Err(SnapkeepError::SnapshotInUse {
            name: name.to_string(),
            id,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pruner::prune;
    use std::fs;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const SNAP_A: &str = "20200101T000000Z-a";
    const SNAP_B: &str = "20200102T000000Z-b";

    fn manager_with(names: &[&str]) -> (TempDir, SnapshotManager) {
        let temp_dir = TempDir::new().unwrap();
        for name in names {
            fs::create_dir(temp_dir.path().join(name)).unwrap();
        }
        let manager = SnapshotManager::new(temp_dir.path());
        (temp_dir, manager)
    }

    #[test]
    fn test_validate_snapshot_name() {
        assert!(validate_snapshot_name("20221115T232711Z-7ef1661077569104").is_ok());
        assert!(validate_snapshot_name("ABC-def").is_ok());

        for bad in ["", "abc", "-abc", "abc-", "a-b-c", "../etc-x", "a/b-c", "a b-c"] {
            assert!(validate_snapshot_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn test_start_download_errors() {
        let (temp_dir, manager) = manager_with(&[SNAP_A]);
        fs::write(temp_dir.path().join("20200103T000000Z-file"), b"x").unwrap();

        let err = manager.start_download("../x", "tar").unwrap_err();
        assert!(matches!(err, SnapkeepError::InvalidName(_)));

        let err = manager.start_download(SNAP_A, "zip").unwrap_err();
        assert!(matches!(err, SnapkeepError::UnknownFormat(_)));

        let err = manager.start_download(SNAP_B, "tar").unwrap_err();
        assert!(matches!(err, SnapkeepError::NotFound(_)));

        let err = manager.start_download("20200103T000000Z-file", "tar").unwrap_err();
        assert!(matches!(err, SnapkeepError::Invalid(_)));

        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_download_status_lifecycle() {
        let (_tmp, manager) = manager_with(&[SNAP_A]);

        let stream = manager.start_download(SNAP_A, "tgz").unwrap();
        assert_eq!(stream.filename(), format!("{SNAP_A}.tar.gz"));

        let status = manager.download_status(stream.id()).unwrap();
        assert_eq!(status.snapshot_name, SNAP_A);
        assert!(status.finished.is_none());

        let mut buf = Vec::new();
        stream.write_archive(&mut buf, &CancellationToken::new()).unwrap();

        let status = manager.download_status(stream.id()).unwrap();
        assert!(status.finished.unwrap().success);

        let err = manager.download_status("unknown").unwrap_err();
        assert!(matches!(err, SnapkeepError::DownloadNotFound(_)));
    }

    #[tokio::test]
    async fn test_active_downloads_newest_first() {
        let (_tmp, manager) = manager_with(&[SNAP_A, SNAP_B]);

        let first = manager.start_download(SNAP_A, "tar").unwrap();
        let second = manager.start_download(SNAP_B, "tar").unwrap();

        let downloads = manager.active_downloads();
        assert_eq!(
            downloads,
            vec![
                DownloadSummary {
                    id: second.id().to_string(),
                    name: SNAP_B.to_string()
                },
                DownloadSummary {
                    id: first.id().to_string(),
                    name: SNAP_A.to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_prune_skips_snapshot_in_use() {
        let (temp_dir, manager) = manager_with(&[SNAP_A, SNAP_B]);

        let stream = manager.start_download(SNAP_A, "tar").unwrap();
        let err = manager.check_snapshot_before_remove(SNAP_A).unwrap_err();
        assert!(err.to_string().contains(stream.id()));
        assert!(manager.check_snapshot_before_remove(SNAP_B).is_ok());

        let options = manager.prune_options(ChronoDuration::zero());
        let report = tokio::task::spawn_blocking(move || prune(&options, &CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.vetoed, vec![SNAP_A]);
        assert_eq!(report.deleted, vec![SNAP_B]);
        assert!(temp_dir.path().join(SNAP_A).exists());
        assert!(!temp_dir.path().join(SNAP_B).exists());

        manager.registry().remove(stream.id());
        let options = manager.prune_options(ChronoDuration::zero());
        let report = prune(&options, &CancellationToken::new()).unwrap();
        assert_eq!(report.deleted, vec![SNAP_A]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_expires() {
        let (_tmp, manager) = manager_with(&[SNAP_A]);
        let manager = manager.with_download_lifetime(Duration::from_secs(60));

        let stream = manager.start_download(SNAP_A, "tar").unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(manager.download_status(stream.id()).is_err());
        assert!(manager.check_snapshot_before_remove(SNAP_A).is_ok());
    }

    #[test]
    fn test_from_config() {
        let mut config = SnapkeepConfig::new("/data/snapshots");
        config.download_lifetime = ChronoDuration::minutes(5);
        let manager = SnapshotManager::from_config(&config).unwrap();
        assert_eq!(manager.snapshot_dir(), Path::new("/data/snapshots"));
        assert_eq!(manager.download_lifetime, Duration::from_secs(300));

        assert!(SnapshotManager::from_config(&SnapkeepConfig::new("")).is_err());
    }
}
