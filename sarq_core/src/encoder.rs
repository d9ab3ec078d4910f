//! The archive-encoding contract consumed by the streaming writer.

use crate::error::{Error, Result};
use std::path::PathBuf;

/// Mode bits recorded for every archived entry.
pub(crate) const ENTRY_MODE: u32 = 0o660;

/// Owner recorded for every archived entry.
pub(crate) const ENTRY_UID: u64 = 1000;

/// Group recorded for every archived entry.
pub(crate) const ENTRY_GID: u64 = 1000;

/// Supported archive containers.
///
/// The container is chosen at open time, so both formats are exercisable from
/// a single binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// pax/ustar tar framing compressed with an LZ4 frame stream.
    TarLz4,
    /// ZIP with deflate-compressed entries.
    Zip,
}

impl ArchiveKind {
    /// Returns the string representation of the kind (for CLI/config values).
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveKind::TarLz4 => "tar-lz4",
            ArchiveKind::Zip => "zip",
        }
    }

    /// Parse an archive kind from a string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "tar-lz4" => Ok(ArchiveKind::TarLz4),
            "zip" => Ok(ArchiveKind::Zip),
            _ => Err(Error::set_format_failed(format!(
                "unknown archive kind: {}",
                s
            ))),
        }
    }

    /// File extension appended to a file sink's name.
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveKind::TarLz4 => "tar.lz4",
            ArchiveKind::Zip => "zip",
        }
    }
}

/// Metadata for one archive entry, captured when the file was enqueued.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    /// Path recorded in the archive (leading `/` is stripped on write).
    pub path: PathBuf,
    /// Uncompressed size the entry declares.
    pub size: u64,
    /// Modification time as seconds since the Unix epoch.
    pub mtime: u64,
}

/// One entry's header/data/finish protocol plus archive-level finalization.
///
/// The writer drives an encoder strictly in the order `write_header`,
/// `write_data` (zero or more times, exactly `size` bytes total),
/// `finish_entry`, repeated per entry, with a single `finish` at the end.
pub trait Encoder {
    /// Emit the header that opens a new entry.
    fn write_header(&mut self, meta: &EntryMeta) -> Result<()>;

    /// Append entry content, returning how many bytes were accepted.
    ///
    /// The accepted count may be less than `data.len()`; the caller re-offers
    /// the remainder.
    fn write_data(&mut self, data: &[u8]) -> Result<usize>;

    /// Close the entry opened by the last `write_header`.
    fn finish_entry(&mut self) -> Result<()>;

    /// Write the archive's trailing structures and flush the sink.
    fn finish(self: Box<Self>) -> Result<()>;
}
