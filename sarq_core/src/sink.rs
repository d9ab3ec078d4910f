//! Archive output destinations.

use crate::encoder::ArchiveKind;
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Where encoded archive bytes go.
///
/// The file case appends the format extension to the given name, so
/// `Sink::file("backup")` opened as tar+LZ4 creates `backup.tar.lz4`. The
/// stream case hands the bytes to any `Write` implementation; opening,
/// closing and releasing the destination are the implementation's
/// construction and `Drop`.
pub enum Sink {
    /// Create a file at the given path plus the format extension.
    File(PathBuf),
    /// Write into the given stream.
    Stream(Box<dyn Write + Send>),
}

impl Sink {
    /// Sink that creates `<path>.<extension>`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Sink::File(path.into())
    }

    /// Sink that writes into `stream`.
    pub fn stream(stream: impl Write + Send + 'static) -> Self {
        Sink::Stream(Box::new(stream))
    }

    /// Open the destination for the given archive kind.
    pub(crate) fn open(self, kind: ArchiveKind) -> Result<Box<dyn Write + Send>> {
        match self {
            Sink::File(path) => {
                let mut name = path.into_os_string();
                name.push(".");
                name.push(kind.extension());
                let path = PathBuf::from(name);
                let file = File::create(&path).map_err(|e| Error::open_failed(&path, e))?;
                Ok(Box::new(BufWriter::new(file)))
            }
            Sink::Stream(stream) => Ok(stream),
        }
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sink::File(path) => f.debug_tuple("File").field(path).finish(),
            Sink::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}
