//! Streaming tar framing over an LZ4 frame stream.

use crate::encoder::{ENTRY_GID, ENTRY_MODE, ENTRY_UID, Encoder, EntryMeta};
use crate::error::{Error, Result};
use lz4_flex::frame::{BlockSize, FrameEncoder, FrameInfo};
use std::io::Write;

/// tar block granularity: headers and entry payloads are 512-byte aligned.
const BLOCK_SIZE: usize = 512;

const ZERO_BLOCK: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

/// Encoder producing a `.tar.lz4` stream.
///
/// Entry headers are ustar-framed via the `tar` crate, entry data is padded
/// to the 512-byte block, and the whole stream runs through an LZ4 frame
/// encoder whose block size is bucketed from the writer's buffer size. The
/// end-of-archive marker is the usual pair of zero blocks, written by
/// [`finish`](Encoder::finish) before the frame is closed.
pub struct TarLz4Encoder<W: Write> {
    out: FrameEncoder<W>,
    /// Bytes of the open entry's content written so far, for padding.
    entry_written: Option<u64>,
}

impl<W: Write> TarLz4Encoder<W> {
    /// Wrap `out` in an LZ4 frame sized for `block_size`-byte writes.
    pub fn new(out: W, block_size: usize) -> Self {
        let info = FrameInfo::new().block_size(frame_block_size(block_size));
        Self {
            out: FrameEncoder::with_frame_info(info, out),
            entry_written: None,
        }
    }
}

/// Bucket an arbitrary buffer size into the nearest LZ4 frame block size.
fn frame_block_size(bytes: usize) -> BlockSize {
    if bytes <= 64 * 1024 {
        BlockSize::Max64KB
    } else if bytes <= 256 * 1024 {
        BlockSize::Max256KB
    } else if bytes <= 1024 * 1024 {
        BlockSize::Max1MB
    } else {
        BlockSize::Max4MB
    }
}

impl<W: Write> Encoder for TarLz4Encoder<W> {
    fn write_header(&mut self, meta: &EntryMeta) -> Result<()> {
        // Archive member names are relative, as tar itself insists.
        let name = meta.path.strip_prefix("/").unwrap_or(&meta.path);

        let mut header = tar::Header::new_ustar();
        header
            .set_path(name)
            .map_err(|e| Error::write_failed(format!("entry name {}: {}", meta.path.display(), e)))?;
        header.set_size(meta.size);
        header.set_mode(ENTRY_MODE);
        header.set_uid(ENTRY_UID);
        header.set_gid(ENTRY_GID);
        header.set_mtime(meta.mtime);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();

        self.out
            .write_all(header.as_bytes())
            .map_err(|e| Error::write_failed(format!("entry header: {}", e)))?;
        self.entry_written = Some(0);
        Ok(())
    }

    fn write_data(&mut self, data: &[u8]) -> Result<usize> {
        let n = self
            .out
            .write(data)
            .map_err(|e| Error::write_failed(format!("entry data: {}", e)))?;
        if let Some(written) = self.entry_written.as_mut() {
            *written += n as u64;
        }
        Ok(n)
    }

    fn finish_entry(&mut self) -> Result<()> {
        if let Some(written) = self.entry_written.take() {
            let partial = (written % BLOCK_SIZE as u64) as usize;
            if partial != 0 {
                self.out
                    .write_all(&ZERO_BLOCK[..BLOCK_SIZE - partial])
                    .map_err(|e| Error::write_failed(format!("entry padding: {}", e)))?;
            }
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let mut out = self.out;

        // End-of-archive marker: two zero blocks.
        for _ in 0..2 {
            out.write_all(&ZERO_BLOCK)
                .map_err(|e| Error::write_failed(format!("end-of-archive blocks: {}", e)))?;
        }

        let mut inner = out
            .finish()
            .map_err(|e| Error::write_failed(format!("closing LZ4 frame: {}", e)))?;
        inner
            .flush()
            .map_err(|e| Error::write_failed(format!("flushing sink: {}", e)))?;
        Ok(())
    }
}
