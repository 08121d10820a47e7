/*!
# Snapkeep Core

Streaming archives of snapshot directories and retention pruning.

A snapshot is a directory below a common root named `<timestamp>-<suffix>`.
This crate provides:

- On-the-fly `tar`, `tar.gz` and `tar.zst` archives of a snapshot, hashed
  with SHA-256 while they are written
- A registry of download sessions that expire after a fixed lifetime
- Retention pruning that never deletes a snapshot an active session is reading
- A periodic autopruner with jittered scheduling

## Usage

```no_run
use snapkeep_core::{SnapshotManager, Result};
use tokio_util::sync::CancellationToken;

# async fn run() -> Result<()> {
let manager = SnapshotManager::new("/var/lib/snapshots");

let stream = manager.start_download("20221115T232711Z-7ef1661077569104", "tgz")?;
let file = std::fs::File::create(stream.filename())?;
stream.write_archive(file, &CancellationToken::new())?;

let status = manager.download_status(stream.id())?;
println!("{}", serde_json::to_string(&status)?);
# Ok(())
# }
```
*/

pub mod archive;
pub mod autoprune;
pub mod config;
pub mod error;
pub mod format;
pub mod id;
pub mod manager;
pub mod observability;
pub mod pruner;
pub mod registry;
pub mod stream;
pub mod walk;

pub use archive::ArchiveBuilder;
pub use autoprune::Autopruner;
pub use config::{AutopruneConfig, SnapkeepConfig};
pub use error::{ErrorList, Result, SnapkeepError};
pub use format::ArchiveFormat;
pub use manager::{validate_snapshot_name, DownloadSummary, SnapshotManager};
pub use observability::{init_default_observability, init_observability};
pub use pruner::{prune, Clock, FixedClock, PruneOptions, PruneReport, SnapshotInfo, SystemClock};
pub use registry::DownloadRegistry;
pub use stream::{DownloadFinished, DownloadStatus, SnapshotStream, StreamOptions};
pub use walk::{DirectoryWalker, EntryKind, WalkEntry};

#[cfg(feature = "metrics")]
pub use observability::SnapkeepMetrics;
