/*!
Archive container and compression formats offered for snapshot downloads.
*/

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Result, SnapkeepError};

/// Content type used for names outside the supported set.
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// File extension used for names outside the supported set.
pub const FALLBACK_FILE_EXTENSION: &str = ".bin";

/// Supported archive formats
///
/// The wire name (`tar`, `tgz`, `tzst`) is what clients pass when requesting
/// a download and what serde reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchiveFormat {
    /// Uncompressed tar container
    #[serde(rename = "tar")]
    Tar,
    /// Tar container in a gzip stream
    #[serde(rename = "tgz")]
    TarGzip,
    /// Tar container in a zstd stream
    #[serde(rename = "tzst")]
    TarZstd,
}

impl ArchiveFormat {
    /// All supported formats in presentation order.
    pub const ALL: [ArchiveFormat; 3] = [
        ArchiveFormat::Tar,
        ArchiveFormat::TarGzip,
        ArchiveFormat::TarZstd,
    ];

    /// Wire name of the format
    pub fn name(&self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGzip => "tgz",
            ArchiveFormat::TarZstd => "tzst",
        }
    }

    /// MIME type relayed in the download response
    pub fn content_type(&self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "application/x-tar",
            // RFC 6713
            ArchiveFormat::TarGzip => "application/gzip",
            // RFC 8878
            ArchiveFormat::TarZstd => "application/zstd",
        }
    }

    /// Suffix appended to the snapshot name for the suggested filename
    pub fn file_extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Tar => ".tar",
            ArchiveFormat::TarGzip => ".tar.gz",
            ArchiveFormat::TarZstd => ".tar.zst",
        }
    }

    /// True if the container is wrapped in a compression stream
    pub fn is_compressed(&self) -> bool {
        match self {
            ArchiveFormat::Tar => false,
            ArchiveFormat::TarGzip | ArchiveFormat::TarZstd => true,
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ArchiveFormat {
    type Err = SnapkeepError;

    fn from_str(s: &str) -> Result<Self> {
        ArchiveFormat::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| SnapkeepError::UnknownFormat(s.to_string()))
    }
}

/// Content type for a raw format name, falling back to a generic binary type.
///
/// Display helper only; streaming code must parse into [`ArchiveFormat`].
pub fn content_type_for_name(name: &str) -> &'static str {
    name.parse::<ArchiveFormat>()
        .map(|f| f.content_type())
        .unwrap_or(FALLBACK_CONTENT_TYPE)
}

/// File extension for a raw format name, falling back to `.bin`.
pub fn file_extension_for_name(name: &str) -> &'static str {
    name.parse::<ArchiveFormat>()
        .map(|f| f.file_extension())
        .unwrap_or(FALLBACK_FILE_EXTENSION)
}
