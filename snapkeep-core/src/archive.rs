/*!
Tar archive builder for snapshot directories.

The builder writes a tar container to any [`Write`] sink, usually a
compression encoder. Only directories and regular files are archived; other
entry kinds are recorded as per-entry errors and skipped so that the rest of
the snapshot still gets streamed.
*/

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tar::{EntryType, Header};
use tracing::debug;

use crate::walk::{DirectoryWalker, EntryKind, WalkEntry};
use crate::{Result, SnapkeepError};

/// Flush the underlying writer (usually compression) before writing a file
/// larger than this size in bytes.
pub const FLUSH_MIN_SIZE: u64 = 1024 * 1024;

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// Streaming tar builder with a compression-boundary flush policy
///
/// Two error channels are kept apart: [`append`](Self::append) returns
/// errors that must abort the archive (unreadable file content, failed
/// writes), while per-entry problems accumulate and are retrieved with
/// [`take_file_errors`](Self::take_file_errors).
///
/// When built with [`with_compression_flush`](Self::with_compression_flush)
/// the sink is flushed right before the header of every regular file larger
/// than [`FLUSH_MIN_SIZE`]. Realigning the compression stream there makes
/// unchanged large files compress to the same bytes across runs, which
/// deduplicating backup storage relies on.
pub struct ArchiveBuilder<W: Write> {
    tar: tar::Builder<W>,
    flush_before_large: bool,
    forced_flushes: usize,
    file_errors: Vec<SnapkeepError>,
}

impl<W: Write> ArchiveBuilder<W> {
    /// Builder for a plain, uncompressed sink
    pub fn new(writer: W) -> Self {
        Self {
            tar: tar::Builder::new(writer),
            flush_before_large: false,
            forced_flushes: 0,
            file_errors: Vec::new(),
        }
    }

    /// Builder for a compression sink that gets flushed before large files
    pub fn with_compression_flush(writer: W) -> Self {
        Self {
            flush_before_large: true,
            ..Self::new(writer)
        }
    }

    /// Number of flushes forced by the large-file policy so far
    pub fn forced_flushes(&self) -> usize {
        self.forced_flushes
    }

    pub fn get_ref(&self) -> &W {
        self.tar.get_ref()
    }

    /// Archive every entry below `root`, naming them relative to `base`.
    ///
    /// Stops at the first fatal error. Per-entry errors stay collected.
    pub fn append_dir_all<P: AsRef<Path>, B: AsRef<Path>>(&mut self, root: P, base: B) -> Result<()> {
        let walker = DirectoryWalker::new(root.as_ref(), base.as_ref());
        for entry in walker.entries() {
            self.append(&entry?)?;
        }
        Ok(())
    }

    /// Write header and content of a single entry.
    pub fn append(&mut self, entry: &WalkEntry) -> Result<()> {
        let name = entry.archive_name();

        let entry_type = match entry.kind() {
            EntryKind::Directory => EntryType::Directory,
            EntryKind::File => EntryType::Regular,
            EntryKind::Other(kind) => {
                self.file_errors.push(SnapkeepError::UnsupportedType {
                    path: name.to_path_buf(),
                    kind: kind.clone(),
                });
                return Ok(());
            }
        };

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                self.file_errors.push(err);
                return Ok(());
            }
        };

        let mut header = Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mtime(unix_mtime(metadata.modified().ok()));

        if entry_type == EntryType::Directory {
            header.set_mode(DIR_MODE);
            header.set_size(0);
            self.tar.append_data(&mut header, name, io::empty())?;
            return Ok(());
        }

        let size = metadata.len();
        header.set_mode(FILE_MODE);
        header.set_size(size);

        if self.flush_before_large && size > FLUSH_MIN_SIZE {
            debug!(path = %name.display(), size, "Flushing compression stream before large file");
            self.tar.get_mut().flush()?;
            self.forced_flushes += 1;
        }

        let file = File::open(entry.path())?;
        self.tar
            .append_data(&mut header, name, ExactReader::new(file, size))?;

        Ok(())
    }

    /// Remove and return the per-entry errors collected so far, merged into
    /// one error.
    pub fn take_file_errors(&mut self) -> Option<SnapkeepError> {
        SnapkeepError::combine(std::mem::take(&mut self.file_errors))
    }

    /// Write the end-of-archive marker and hand back the sink.
    pub fn finish(self) -> Result<W> {
        Ok(self.tar.into_inner()?)
    }
}

fn unix_mtime(modified: Option<SystemTime>) -> u64 {
    modified
        .map(|t| DateTime::<Utc>::from(t).timestamp().max(0) as u64)
        .unwrap_or(0)
}

/// Reader yielding exactly `remaining` bytes of a file whose size was
/// declared in the tar header. A file that shrank in the meantime is an
/// error; bytes appended after the header was written are ignored.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, remaining: u64) -> Self {
        Self { inner, remaining }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank while archiving, {} bytes missing", self.remaining),
            ));
        }

        self.remaining -= n as u64;
        Ok(n)
    }
}
