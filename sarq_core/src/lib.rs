//! # Sarq Core
//!
//! An incremental streaming archiver.
//!
//! This library compresses a queue of files into a single archive (tar+LZ4
//! or ZIP), reading file contents through a fixed-size buffer so the work
//! can be driven to completion in one blocking call or one small step at a
//! time — for example from a UI event loop that cannot afford to block on
//! file I/O.
//!
//! ## Features
//!
//! - FIFO file queue: entries land in the archive in enqueue order
//! - Bounded steps: each non-blocking `write` does one fill/flush/finish pass
//! - Two containers behind one API: pax tar in an LZ4 frame, or ZIP/deflate
//! - File or arbitrary-stream output sinks
//! - Detection of files that shrank between enqueue and archiving
//!
//! ## Example
//!
//! ```no_run
//! use sarq_core::{ArchiveKind, Mode, Sink, State, Writer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Create `backup.tar.lz4` with a 512-byte read buffer.
//! let mut writer = Writer::open(ArchiveKind::TarLz4, Sink::file("backup"), 512)?;
//!
//! writer.add_file("notes.txt");
//! writer.add_file("report.pdf");
//!
//! // Drive the archive one bounded step at a time.
//! while writer.write(Mode::NonBlock)? == State::InProgress {
//!     // ... keep the rest of the application responsive ...
//! }
//!
//! writer.close();
//! # Ok(())
//! # }
//! ```

mod buffer;
mod encoder;
mod error;
mod sink;
mod tar_lz4;
mod writer;
mod zip;

pub use encoder::{ArchiveKind, Encoder, EntryMeta};
pub use error::{Error, Result};
pub use sink::Sink;
pub use tar_lz4::TarLz4Encoder;
pub use writer::{Mode, State, Writer};
pub use self::zip::ZipEncoder;
