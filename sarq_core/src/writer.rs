//! The streaming archive writer and its step-at-a-time state machine.

use crate::buffer::Buffer;
use crate::encoder::{ArchiveKind, Encoder, EntryMeta};
use crate::error::{Error, Result};
use crate::sink::Sink;
use crate::tar_lz4::TarLz4Encoder;
use crate::zip::ZipEncoder;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, trace, warn};

/// How much work a single `write` call performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Perform exactly one bounded step, then return control to the caller.
    NonBlock,
    /// Repeat steps internally until the queue is drained.
    Block,
}

/// Whether the writer still has queued or partially transferred data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    InProgress,
    Finished,
}

/// A path recorded by `add_file`, with the stat taken at enqueue time.
///
/// The enqueue-time size is what the entry header declares; a file that
/// shrinks afterwards is caught as `FileChanged` when its source runs dry.
#[derive(Debug)]
struct QueuedFile {
    path: PathBuf,
    size: u64,
    mtime: u64,
}

/// The file currently being streamed into the archive.
struct CurrentEntry {
    path: PathBuf,
    source: File,
    total: u64,
    /// Bytes not yet handed to the encoder; 0 means the entry is complete.
    remaining: u64,
    /// The source returned a zero-byte read.
    eof: bool,
}

/// Incrementally compresses a queue of files into a single archive.
///
/// Files are enqueued with [`add_file`](Writer::add_file) and drained by
/// [`write`](Writer::write), which either blocks until everything is written
/// or performs one bounded unit of work per call so archiving can be
/// interleaved with other work. At most one file is in flight at any time;
/// its bytes move through a fixed-size buffer into the archive encoder.
///
/// The writer is single-threaded and non-reentrant; `&mut self` is the whole
/// locking story. After any error the writer should be closed, not resumed.
pub struct Writer {
    encoder: Option<Box<dyn Encoder + Send>>,
    queue: VecDeque<QueuedFile>,
    current: Option<CurrentEntry>,
    buffer: Buffer,
}

impl Writer {
    /// Open a new archive of the given kind over the given sink.
    ///
    /// `buffer_size` fixes both the read-buffer capacity and the encoder's
    /// compression block size. A zero buffer size is rejected with
    /// `SetCompressionFailed`.
    pub fn open(kind: ArchiveKind, sink: Sink, buffer_size: usize) -> Result<Self> {
        if buffer_size == 0 {
            return Err(Error::set_compression_failed("block size of zero rejected"));
        }

        let out = sink.open(kind)?;
        let encoder: Box<dyn Encoder + Send> = match kind {
            ArchiveKind::TarLz4 => Box::new(TarLz4Encoder::new(out, buffer_size)),
            ArchiveKind::Zip => Box::new(ZipEncoder::new(out)),
        };
        let buffer = Buffer::new(buffer_size);
        debug!(kind = kind.as_str(), buffer_size = buffer.capacity(), "archive opened");

        Ok(Self {
            encoder: Some(encoder),
            queue: VecDeque::new(),
            current: None,
            buffer,
        })
    }

    /// Append a path to the queue of files to archive.
    ///
    /// Stats the path without opening it; content is streamed lazily by
    /// [`write`](Writer::write). Returns `false`, leaving the queue
    /// untouched, when the path cannot be stat'd or is not a regular file.
    pub fn add_file(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_file() => meta,
            _ => {
                trace!(path = %path.display(), "rejected: not an accessible regular file");
                return false;
            }
        };

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.queue.push_back(QueuedFile {
            path: path.to_path_buf(),
            size: meta.len(),
            mtime,
        });
        trace!(path = %path.display(), size = meta.len(), "queued");
        true
    }

    /// Number of queued files not yet dequeued for archiving.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Compress queued files into the archive.
    ///
    /// In [`Mode::NonBlock`] exactly one step is performed: open the next
    /// file if none is open, fill the buffer from it, flush the buffer into
    /// the encoder, and finish the entry once its bytes are through. The
    /// call then returns [`State::InProgress`] if work remains. In
    /// [`Mode::Block`] steps repeat internally and the call returns only
    /// when everything queued has been written.
    ///
    /// Calling an idle (or closed) writer is a no-op returning
    /// [`State::Finished`].
    pub fn write(&mut self, mode: Mode) -> Result<State> {
        if self.encoder.is_none() || (self.current.is_none() && self.queue.is_empty()) {
            return Ok(State::Finished);
        }

        loop {
            self.step()?;
            if mode == Mode::NonBlock || self.compute_state() == State::Finished {
                break;
            }
        }
        Ok(self.compute_state())
    }

    /// The single predicate both modes and the returned state derive from.
    fn compute_state(&self) -> State {
        let entry_active = self
            .current
            .as_ref()
            .is_some_and(|entry| !entry.eof || !self.buffer.is_empty());
        if !self.queue.is_empty() || entry_active {
            State::InProgress
        } else {
            State::Finished
        }
    }

    /// One bounded unit of work: acquire / fill / flush / maybe finish.
    fn step(&mut self) -> Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };

        // Open the next queued file if none is in flight.
        if self.current.is_none() {
            let Some(queued) = self.queue.pop_front() else {
                return Ok(());
            };

            let source =
                File::open(&queued.path).map_err(|e| Error::open_failed(&queued.path, e))?;
            // Catches a file deleted between enqueue and processing when the
            // open itself did not (e.g. replaced by something unreadable).
            source
                .metadata()
                .map_err(|e| Error::stat_failed(&queued.path, e))?;

            encoder.write_header(&EntryMeta {
                path: queued.path.clone(),
                size: queued.size,
                mtime: queued.mtime,
            })?;
            debug!(path = %queued.path.display(), size = queued.size, "entry started");

            self.current = Some(CurrentEntry {
                path: queued.path,
                source,
                total: queued.size,
                remaining: queued.size,
                eof: false,
            });
        }
        let Some(entry) = self.current.as_mut() else {
            return Ok(());
        };

        // Fill: read whatever is immediately available into the free tail.
        if !self.buffer.is_full() && !entry.eof {
            let n = self.buffer.fill(&mut entry.source).map_err(|e| {
                Error::write_failed(format!("reading {}: {}", entry.path.display(), e))
            })?;
            entry.eof = n == 0;
        }

        // Flush: hand pending bytes to the encoder, capped at the declared
        // size so a file that grew after enqueue cannot overrun its entry.
        if !self.buffer.is_empty() && entry.remaining > 0 {
            let pending = self.buffer.pending();
            let offer = pending.len().min(entry.remaining as usize);
            let accepted = encoder.write_data(&pending[..offer])?;
            self.buffer.consume(accepted);
            entry.remaining -= accepted as u64;
        }

        // The source ran dry with bytes still owed: the file shrank after
        // it was enqueued.
        if entry.eof && entry.remaining > self.buffer.len() as u64 {
            return Err(Error::file_changed(
                &entry.path,
                entry.total,
                entry.total - entry.remaining,
            ));
        }

        // Entry complete: all declared bytes written, or the source is
        // exhausted and fully drained.
        if entry.remaining == 0 || (entry.eof && self.buffer.is_empty()) {
            encoder.finish_entry()?;
            debug!(path = %entry.path.display(), size = entry.total, "entry finished");
            self.buffer.clear();
            self.current = None;
        }
        Ok(())
    }

    /// Close the archive, releasing the encoder and every queued resource.
    ///
    /// Forces the trailing structures of the chosen format out to the sink.
    /// Queued-but-unprocessed paths are discarded without error; an entry in
    /// flight is abandoned where it stands. Idempotent.
    pub fn close(&mut self) {
        self.queue.clear();
        self.current = None;
        self.buffer.clear();
        if let Some(encoder) = self.encoder.take() {
            if let Err(e) = encoder.finish() {
                warn!("archive finalization failed: {}", e);
            } else {
                debug!("archive closed");
            }
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lz4_flex::frame::FrameDecoder;
    use std::io::{Cursor, Read, Write as _};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// A `Write` sink whose bytes stay observable after the writer consumes it.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl std::io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn write_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn tar_lz4_entries(archive: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut reader = tar::Archive::new(FrameDecoder::new(archive));
        let mut entries = Vec::new();
        for entry in reader.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            entries.push((name, content));
        }
        entries
    }

    fn zip_entries(archive: Vec<u8>) -> Vec<(String, Vec<u8>)> {
        let mut reader = ::zip::ZipArchive::new(Cursor::new(archive)).unwrap();
        let mut entries = Vec::new();
        for i in 0..reader.len() {
            let mut entry = reader.by_index(i).unwrap();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            entries.push((entry.name().to_string(), content));
        }
        entries
    }

    #[test]
    fn test_open_rejects_zero_buffer() {
        let result = Writer::open(ArchiveKind::TarLz4, Sink::stream(Vec::new()), 0);
        assert!(matches!(result, Err(Error::SetCompressionFailed { .. })));
    }

    #[test]
    fn test_add_file_missing_path_rejected() {
        let mut writer =
            Writer::open(ArchiveKind::TarLz4, Sink::stream(Vec::new()), 512).unwrap();

        assert!(!writer.add_file("/nonexistent/path"));
        assert_eq!(writer.queued(), 0);
    }

    #[test]
    fn test_add_file_directory_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer =
            Writer::open(ArchiveKind::TarLz4, Sink::stream(Vec::new()), 512).unwrap();

        assert!(!writer.add_file(temp_dir.path()));
        assert_eq!(writer.queued(), 0);
    }

    #[test]
    fn test_write_on_empty_queue_is_finished() {
        let mut writer =
            Writer::open(ArchiveKind::TarLz4, Sink::stream(Vec::new()), 512).unwrap();

        assert_eq!(writer.write(Mode::NonBlock).unwrap(), State::Finished);
        assert_eq!(writer.write(Mode::Block).unwrap(), State::Finished);
    }

    #[test]
    fn test_finished_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_file(&temp_dir, "a.txt", b"hello");
        let sink = SharedBuf::default();
        let mut writer =
            Writer::open(ArchiveKind::TarLz4, Sink::stream(sink.clone()), 512).unwrap();

        assert!(writer.add_file(&path));
        assert_eq!(writer.write(Mode::Block).unwrap(), State::Finished);
        let after_first = sink.contents().len();

        // Further calls are no-ops with no side effects on the stream.
        assert_eq!(writer.write(Mode::NonBlock).unwrap(), State::Finished);
        assert_eq!(writer.write(Mode::Block).unwrap(), State::Finished);
        assert_eq!(sink.contents().len(), after_first);
    }

    #[test]
    fn test_entries_appear_in_queue_order() {
        let temp_dir = TempDir::new().unwrap();
        let a = write_file(&temp_dir, "a.txt", b"first");
        let b = write_file(&temp_dir, "b.txt", b"second");
        let sink = SharedBuf::default();
        let mut writer =
            Writer::open(ArchiveKind::TarLz4, Sink::stream(sink.clone()), 512).unwrap();

        assert!(writer.add_file(&a));
        assert!(writer.add_file(&b));
        assert_eq!(writer.write(Mode::Block).unwrap(), State::Finished);
        writer.close();

        let entries = tar_lz4_entries(&sink.contents());
        assert_eq!(entries.len(), 2);
        assert!(entries[0].0.ends_with("a.txt"));
        assert_eq!(entries[0].1, b"first");
        assert!(entries[1].0.ends_with("b.txt"));
        assert_eq!(entries[1].1, b"second");
    }

    #[test]
    fn test_round_trip_tar_lz4_small_buffer() {
        let temp_dir = TempDir::new().unwrap();
        let a = write_file(&temp_dir, "a.txt", b"hello");
        let b = write_file(&temp_dir, "b.txt", b"world");
        let sink = SharedBuf::default();
        let mut writer =
            Writer::open(ArchiveKind::TarLz4, Sink::stream(sink.clone()), 4).unwrap();

        assert!(writer.add_file(&a));
        assert!(writer.add_file(&b));
        assert_eq!(writer.write(Mode::Block).unwrap(), State::Finished);
        writer.close();

        let entries = tar_lz4_entries(&sink.contents());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1, b"hello");
        assert_eq!(entries[1].1, b"world");
    }

    #[test]
    fn test_round_trip_zip_small_buffer() {
        let temp_dir = TempDir::new().unwrap();
        let a = write_file(&temp_dir, "a.txt", b"hello");
        let b = write_file(&temp_dir, "b.txt", b"world");
        let sink = SharedBuf::default();
        let mut writer = Writer::open(ArchiveKind::Zip, Sink::stream(sink.clone()), 4).unwrap();

        assert!(writer.add_file(&a));
        assert!(writer.add_file(&b));
        assert_eq!(writer.write(Mode::Block).unwrap(), State::Finished);
        writer.close();

        let entries = zip_entries(sink.contents());
        assert_eq!(entries.len(), 2);
        assert!(entries[0].0.ends_with("a.txt"));
        assert_eq!(entries[0].1, b"hello");
        assert!(entries[1].0.ends_with("b.txt"));
        assert_eq!(entries[1].1, b"world");
    }

    #[test]
    fn test_nonblock_loop_matches_single_block_call() {
        for kind in [ArchiveKind::TarLz4, ArchiveKind::Zip] {
            let temp_dir = TempDir::new().unwrap();
            let a = write_file(&temp_dir, "a.bin", &[0xA5; 3000]);
            let b = write_file(&temp_dir, "b.bin", &[0x5A; 17]);

            let stepped = SharedBuf::default();
            let mut writer = Writer::open(kind, Sink::stream(stepped.clone()), 64).unwrap();
            assert!(writer.add_file(&a));
            assert!(writer.add_file(&b));
            let mut steps = 0;
            while writer.write(Mode::NonBlock).unwrap() == State::InProgress {
                steps += 1;
            }
            writer.close();
            // 3000 bytes through a 64-byte buffer cannot finish in one step.
            assert!(steps > 1);

            let blocking = SharedBuf::default();
            let mut writer = Writer::open(kind, Sink::stream(blocking.clone()), 64).unwrap();
            assert!(writer.add_file(&a));
            assert!(writer.add_file(&b));
            assert_eq!(writer.write(Mode::Block).unwrap(), State::Finished);
            writer.close();

            assert_eq!(stepped.contents(), blocking.contents());
        }
    }

    #[test]
    fn test_zero_length_file_completes_in_one_step() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_file(&temp_dir, "empty", b"");
        let sink = SharedBuf::default();
        let mut writer =
            Writer::open(ArchiveKind::TarLz4, Sink::stream(sink.clone()), 512).unwrap();

        assert!(writer.add_file(&path));
        assert_eq!(writer.write(Mode::NonBlock).unwrap(), State::Finished);
        writer.close();

        let entries = tar_lz4_entries(&sink.contents());
        assert_eq!(entries.len(), 1);
        assert!(entries[0].1.is_empty());
    }

    #[test]
    fn test_truncated_file_detected() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_file(&temp_dir, "shrinking", &[1u8; 4096]);
        let mut writer =
            Writer::open(ArchiveKind::TarLz4, Sink::stream(Vec::new()), 512).unwrap();

        assert!(writer.add_file(&path));

        // Truncate between enqueue and processing.
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(100)
            .unwrap();

        let result = writer.write(Mode::Block);
        match result {
            Err(Error::FileChanged {
                expected,
                transferred,
                ..
            }) => {
                assert_eq!(expected, 4096);
                assert_eq!(transferred, 100);
            }
            other => panic!("expected FileChanged, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_grown_file_archives_declared_size() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_file(&temp_dir, "growing", &[2u8; 100]);
        let sink = SharedBuf::default();
        let mut writer =
            Writer::open(ArchiveKind::TarLz4, Sink::stream(sink.clone()), 512).unwrap();

        assert!(writer.add_file(&path));

        // Append after enqueue; the entry still declares 100 bytes.
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&[3u8; 50])
            .unwrap();

        assert_eq!(writer.write(Mode::Block).unwrap(), State::Finished);
        writer.close();

        let entries = tar_lz4_entries(&sink.contents());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, vec![2u8; 100]);
    }

    #[test]
    fn test_deleted_file_fails_open() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_file(&temp_dir, "vanishing", b"gone soon");
        let mut writer =
            Writer::open(ArchiveKind::TarLz4, Sink::stream(Vec::new()), 512).unwrap();

        assert!(writer.add_file(&path));
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            writer.write(Mode::Block),
            Err(Error::OpenFailed { .. })
        ));
    }

    #[test]
    fn test_close_discards_queue_keeps_finished_entries() {
        let temp_dir = TempDir::new().unwrap();
        let a = write_file(&temp_dir, "a.txt", b"kept");
        let b = write_file(&temp_dir, "b.txt", b"dropped");
        let c = write_file(&temp_dir, "c.txt", b"dropped too");
        let sink = SharedBuf::default();
        let mut writer =
            Writer::open(ArchiveKind::TarLz4, Sink::stream(sink.clone()), 512).unwrap();

        assert!(writer.add_file(&a));
        assert!(writer.add_file(&b));
        assert!(writer.add_file(&c));

        // One step finishes the first (small) file and no more.
        assert_eq!(writer.write(Mode::NonBlock).unwrap(), State::InProgress);
        writer.close();

        let entries = tar_lz4_entries(&sink.contents());
        assert_eq!(entries.len(), 1);
        assert!(entries[0].0.ends_with("a.txt"));
        assert_eq!(entries[0].1, b"kept");

        // Close is idempotent, and a closed writer reports Finished.
        writer.close();
        assert_eq!(writer.write(Mode::Block).unwrap(), State::Finished);
    }

    #[test]
    fn test_file_sink_writes_named_archive() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_file(&temp_dir, "a.txt", b"hello");
        let base = temp_dir.path().join("backup");
        let mut writer =
            Writer::open(ArchiveKind::Zip, Sink::file(&base), 512).unwrap();

        assert!(writer.add_file(&path));
        assert_eq!(writer.write(Mode::Block).unwrap(), State::Finished);
        writer.close();

        let archive = std::fs::read(temp_dir.path().join("backup.zip")).unwrap();
        let entries = zip_entries(archive);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, b"hello");
    }

    #[test]
    fn test_drop_finalizes_archive() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_file(&temp_dir, "a.txt", b"hello");
        let sink = SharedBuf::default();
        {
            let mut writer =
                Writer::open(ArchiveKind::Zip, Sink::stream(sink.clone()), 512).unwrap();
            assert!(writer.add_file(&path));
            assert_eq!(writer.write(Mode::Block).unwrap(), State::Finished);
            // No explicit close; Drop must finalize the archive.
        }

        let entries = zip_entries(sink.contents());
        assert_eq!(entries.len(), 1);
    }

    // Property-based tests
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 24,
            ..ProptestConfig::default()
        })]

        /// Driving NonBlock to completion produces the same bytes as one
        /// Block call, for arbitrary contents and buffer sizes.
        #[test]
        fn prop_nonblock_equivalent_to_block(
            contents in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..600), 1..4),
            buffer_size in 1usize..128,
        ) {
            let temp_dir = TempDir::new().unwrap();
            let paths: Vec<PathBuf> = contents
                .iter()
                .enumerate()
                .map(|(i, data)| write_file(&temp_dir, &format!("f{}", i), data))
                .collect();

            let stepped = SharedBuf::default();
            let mut writer =
                Writer::open(ArchiveKind::TarLz4, Sink::stream(stepped.clone()), buffer_size)?;
            for path in &paths {
                prop_assert!(writer.add_file(path));
            }
            while writer.write(Mode::NonBlock)? == State::InProgress {}
            writer.close();

            let blocking = SharedBuf::default();
            let mut writer =
                Writer::open(ArchiveKind::TarLz4, Sink::stream(blocking.clone()), buffer_size)?;
            for path in &paths {
                prop_assert!(writer.add_file(path));
            }
            prop_assert_eq!(writer.write(Mode::Block)?, State::Finished);
            writer.close();

            prop_assert_eq!(stepped.contents(), blocking.contents());

            // And the archive holds exactly the queued contents, in order.
            let entries = tar_lz4_entries(&stepped.contents());
            prop_assert_eq!(entries.len(), contents.len());
            for (entry, data) in entries.iter().zip(&contents) {
                prop_assert_eq!(&entry.1, data);
            }
        }
    }
}
