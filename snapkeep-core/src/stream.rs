/*!
Per-download snapshot streams.

A [`SnapshotStream`] turns one snapshot directory into one archive byte
stream, hashing everything it writes and recording the outcome in a status
record that other callers may poll while the write is in progress.
*/

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use flate2::{Compression, GzBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::ArchiveBuilder;
use crate::format::ArchiveFormat;
use crate::id::new_id;
use crate::{Result, SnapkeepError};

/// Response header relaying the session ID alongside the archive body
pub const DOWNLOAD_ID_HEADER: &str = "X-Snapkeep-Download-Id";

/// zstd level 0 selects the library default
const ZSTD_LEVEL: i32 = 0;

/// Status of an ongoing or recent download
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DownloadStatus {
    /// Unique download ID
    pub id: String,

    /// Requested snapshot name
    pub snapshot_name: String,

    /// Set once the archive pass has ended
    pub finished: Option<DownloadFinished>,
}

/// Outcome of a finished download
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DownloadFinished {
    /// True if the archive was produced without any error
    pub success: bool,

    /// Descriptive message when `success` is false
    pub error_text: Option<String>,

    /// SHA-256 over the archive bytes, empty on failure
    pub sha256_hex: String,
}

impl DownloadStatus {
    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }
}

/// Options for creating a [`SnapshotStream`]
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Snapshot name; the archive's top-level directory is its base name
    pub name: String,
    /// Directory holding the snapshot contents
    pub root: PathBuf,
    pub format: ArchiveFormat,
}

/// A single archive download session
pub struct SnapshotStream {
    id: String,
    name: String,
    root: PathBuf,
    format: ArchiveFormat,
    content_type: &'static str,
    filename: String,
    status: Mutex<DownloadStatus>,
}

impl SnapshotStream {
    /// Validate the options and prepare a stream.
    ///
    /// # Errors
    /// * `SnapkeepError::Validation` - If the name is empty
    /// * `SnapkeepError::NotFound` - If the root does not exist
    /// * `SnapkeepError::Invalid` - If the root is not a directory
    pub fn new(opts: StreamOptions) -> Result<Self> {
        if opts.name.is_empty() {
            return Err(SnapkeepError::validation("snapshot name is required"));
        }

        match std::fs::metadata(&opts.root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(SnapkeepError::Invalid(opts.name)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SnapkeepError::NotFound(opts.name))
            }
            Err(e) => return Err(e.into()),
        }

        let id = new_id();
        let filename = format!("{}{}", base_name(&opts.name), opts.format.file_extension());
        let status = DownloadStatus {
            id: id.clone(),
            snapshot_name: opts.name.clone(),
            finished: None,
        };

        Ok(Self {
            id,
            name: opts.name,
            root: opts.root,
            format: opts.format,
            content_type: opts.format.content_type(),
            filename,
            status: Mutex::new(status),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    /// Suggested attachment filename, `basename(name)` plus the format extension
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Value for a `Content-Disposition` response header
    pub fn content_disposition(&self) -> String {
        let escaped = self.filename.replace('\\', "\\\\").replace('"', "\\\"");
        format!("attachment; filename=\"{escaped}\"")
    }

    /// Copy of the current status record.
    pub fn status(&self) -> DownloadStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stream the archive into `dst`.
    ///
    /// Performs exactly one pass and must be called at most once per stream.
    /// Every write observes `cancel`. On return the status is finished with
    /// either the SHA-256 of all written bytes or the error text. Per-entry
    /// errors (e.g. unsupported file types) are reported here even though
    /// the bytes already written form a valid archive.
    pub fn write_archive<W: Write>(&self, dst: W, cancel: &CancellationToken) -> Result<()> {
        debug!(download_id = %self.id, snapshot = %self.name, format = %self.format, "Starting archive");

        let mut writer = HashingWriter::new(CancelWriter::new(dst, cancel));
        let mut result = self.write_to(&mut writer);

        if result.is_err() && cancel.is_cancelled() {
            result = Err(SnapkeepError::Canceled);
        }

        let written = writer.written;
        let digest = writer.finalize();

        let finished = match &result {
            Ok(()) => DownloadFinished {
                success: true,
                error_text: None,
                sha256_hex: digest,
            },
            Err(err) => DownloadFinished {
                success: false,
                error_text: Some(err.to_string()),
                sha256_hex: String::new(),
            },
        };

        match &result {
            Ok(()) => info!(download_id = %self.id, bytes = written, sha256 = %finished.sha256_hex, "Download finished"),
            Err(err) => warn!(download_id = %self.id, bytes = written, error = %err, "Download failed"),
        }

        #[cfg(feature = "metrics")]
        crate::observability::SnapkeepMetrics::global().record_download(written, result.is_ok());

        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finished = Some(finished);

        result
    }

    fn write_to<W: Write>(&self, w: W) -> Result<()> {
        let base = PathBuf::from(base_name(&self.name));

        let errors = match self.format {
            ArchiveFormat::Tar => {
                let (errors, _) = build_archive(ArchiveBuilder::new(w), &self.root, &base);
                errors
            }

            ArchiveFormat::TarGzip => {
                let encoder = GzBuilder::new()
                    .filename(gzip_member_name(&self.filename))
                    .comment(format!("Snapshot {}", self.name))
                    .mtime(Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32)
                    .write(w, Compression::default());

                let (mut errors, encoder) =
                    build_archive(ArchiveBuilder::with_compression_flush(encoder), &self.root, &base);
                if let Some(encoder) = encoder {
                    if let Err(e) = encoder.finish() {
                        errors.push(SnapkeepError::compression(format!(
                            "Failed to finish gzip stream: {e}"
                        )));
                    }
                }
                errors
            }

            ArchiveFormat::TarZstd => {
                let encoder = zstd::stream::write::Encoder::new(w, ZSTD_LEVEL).map_err(|e| {
                    SnapkeepError::compression(format!("Failed to create zstd stream: {e}"))
                })?;

                let (mut errors, encoder) =
                    build_archive(ArchiveBuilder::with_compression_flush(encoder), &self.root, &base);
                if let Some(encoder) = encoder {
                    if let Err(e) = encoder.finish() {
                        errors.push(SnapkeepError::compression(format!(
                            "Failed to finish zstd stream: {e}"
                        )));
                    }
                }
                errors
            }
        };

        match SnapkeepError::combine(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SnapshotStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStream")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("format", &self.format)
            .finish()
    }
}

/// Walk the tree, then close the tar container regardless of the walk's
/// outcome. Errors are returned in order: fatal walk error, per-entry
/// errors, close error.
fn build_archive<W: Write>(
    mut builder: ArchiveBuilder<W>,
    root: &Path,
    base: &Path,
) -> (Vec<SnapkeepError>, Option<W>) {
    let mut errors = Vec::new();

    if let Err(e) = builder.append_dir_all(root, base) {
        errors.push(e);
    }
    if let Some(e) = builder.take_file_errors() {
        errors.push(e);
    }

    match builder.finish() {
        Ok(w) => (errors, Some(w)),
        Err(e) => {
            errors.push(e);
            (errors, None)
        }
    }
}

fn base_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

/// `snap.tar.gz` becomes `snap.tar`
fn gzip_member_name(filename: &str) -> String {
    let name = match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => filename,
    };
    name.replace('\0', "")
}

/// Tees everything written into a SHA-256 digest.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finalize(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Fails every write once the token is canceled.
struct CancelWriter<'a, W> {
    inner: W,
    cancel: &'a CancellationToken,
}

impl<'a, W: Write> CancelWriter<'a, W> {
    fn new(inner: W, cancel: &'a CancellationToken) -> Self {
        Self { inner, cancel }
    }

    fn check(&self) -> io::Result<()> {
        if self.cancel.is_cancelled() {
            // Not `Interrupted`: write_all would retry that forever.
            return Err(io::Error::new(io::ErrorKind::Other, "operation canceled"));
        }
        Ok(())
    }
}

impl<W: Write> Write for CancelWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check()?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check()?;
        self.inner.flush()
    }
}
