//! Streaming ZIP framing with deflate-compressed entries.
//!
//! Entries are written in streaming form: the local file header carries the
//! data-descriptor flag and zero sizes, the deflated body follows, and the
//! real CRC/sizes land in a data descriptor after the body. The central
//! directory and end record are emitted on finish. No zip64: entries are
//! bounded to < 4 GiB and archives to 65535 entries.

use crate::encoder::{ENTRY_MODE, Encoder, EntryMeta};
use crate::error::{Error, Result};
use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::io::Write;

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const END_OF_DIRECTORY_SIG: u32 = 0x0605_4b50;

/// Deflate, version 2.0.
const VERSION_NEEDED: u16 = 20;
/// Made by a Unix host, so external attributes carry the file mode.
const VERSION_MADE_BY: u16 = (3 << 8) | VERSION_NEEDED;
/// Bit 3: sizes in the data descriptor. Bit 11: UTF-8 names.
const GP_FLAGS: u16 = (1 << 3) | (1 << 11);
const METHOD_DEFLATE: u16 = 8;

/// Encoder producing a `.zip` stream over any `Write` sink (no seeking).
pub struct ZipEncoder<W: Write> {
    state: State<W>,
    directory: Vec<CentralRecord>,
}

enum State<W: Write> {
    /// Between entries; owns the counted sink.
    Idle(CountWriter<W>),
    /// Inside an entry; the sink is owned by the deflate stream.
    Entry(OpenEntry<W>),
    /// Transient placeholder while moving between the two.
    Poisoned,
}

struct OpenEntry<W: Write> {
    deflate: DeflateEncoder<CountWriter<W>>,
    name: String,
    dos_time: u16,
    dos_date: u16,
    /// Offset of the local header, for the central directory.
    header_offset: u64,
    /// Sink position where the deflated body starts.
    body_start: u64,
    crc: crc32fast::Hasher,
    uncompressed: u64,
}

struct CentralRecord {
    name: String,
    dos_time: u16,
    dos_date: u16,
    crc: u32,
    compressed: u32,
    uncompressed: u32,
    header_offset: u32,
}

impl<W: Write> ZipEncoder<W> {
    pub fn new(out: W) -> Self {
        Self {
            state: State::Idle(CountWriter::new(out)),
            directory: Vec::new(),
        }
    }
}

impl<W: Write> Encoder for ZipEncoder<W> {
    fn write_header(&mut self, meta: &EntryMeta) -> Result<()> {
        let mut out = match std::mem::replace(&mut self.state, State::Poisoned) {
            State::Idle(out) => out,
            state => {
                self.state = state;
                return Err(Error::write_failed("entry header while an entry is open"));
            }
        };

        if self.directory.len() >= u16::MAX as usize {
            self.state = State::Idle(out);
            return Err(Error::write_failed("archive exceeds 65535 entries"));
        }

        let name = zip_entry_name(meta);
        let (dos_time, dos_date) = dos_datetime(meta.mtime);
        let header_offset = out.count();

        let mut header = Vec::with_capacity(30 + name.len());
        put_u32(&mut header, LOCAL_HEADER_SIG);
        put_u16(&mut header, VERSION_NEEDED);
        put_u16(&mut header, GP_FLAGS);
        put_u16(&mut header, METHOD_DEFLATE);
        put_u16(&mut header, dos_time);
        put_u16(&mut header, dos_date);
        put_u32(&mut header, 0); // crc, deferred to the data descriptor
        put_u32(&mut header, 0); // compressed size, deferred
        put_u32(&mut header, 0); // uncompressed size, deferred
        put_u16(&mut header, name.len() as u16);
        put_u16(&mut header, 0); // extra field length
        header.extend_from_slice(name.as_bytes());

        if let Err(e) = out.write_all(&header) {
            return Err(Error::write_failed(format!("entry header: {}", e)));
        }

        let body_start = out.count();
        self.state = State::Entry(OpenEntry {
            deflate: DeflateEncoder::new(out, Compression::default()),
            name,
            dos_time,
            dos_date,
            header_offset,
            body_start,
            crc: crc32fast::Hasher::new(),
            uncompressed: 0,
        });
        Ok(())
    }

    fn write_data(&mut self, data: &[u8]) -> Result<usize> {
        let entry = match &mut self.state {
            State::Entry(entry) => entry,
            _ => return Err(Error::write_failed("entry data without an open entry")),
        };

        let n = entry
            .deflate
            .write(data)
            .map_err(|e| Error::write_failed(format!("entry data: {}", e)))?;
        entry.crc.update(&data[..n]);
        entry.uncompressed += n as u64;
        if entry.uncompressed >= u32::MAX as u64 {
            return Err(Error::write_failed(format!(
                "entry {} exceeds 4 GiB",
                entry.name
            )));
        }
        Ok(n)
    }

    fn finish_entry(&mut self) -> Result<()> {
        let entry = match std::mem::replace(&mut self.state, State::Poisoned) {
            State::Entry(entry) => entry,
            state => {
                self.state = state;
                return Err(Error::write_failed("entry finish without an open entry"));
            }
        };

        let mut out = entry
            .deflate
            .finish()
            .map_err(|e| Error::write_failed(format!("closing entry body: {}", e)))?;
        let compressed = out.count() - entry.body_start;
        if compressed >= u32::MAX as u64 || entry.header_offset >= u32::MAX as u64 {
            return Err(Error::write_failed(format!(
                "entry {} exceeds the 4 GiB zip bound",
                entry.name
            )));
        }
        let crc = entry.crc.finalize();

        let mut descriptor = Vec::with_capacity(16);
        put_u32(&mut descriptor, DATA_DESCRIPTOR_SIG);
        put_u32(&mut descriptor, crc);
        put_u32(&mut descriptor, compressed as u32);
        put_u32(&mut descriptor, entry.uncompressed as u32);
        out.write_all(&descriptor)
            .map_err(|e| Error::write_failed(format!("data descriptor: {}", e)))?;

        self.directory.push(CentralRecord {
            name: entry.name,
            dos_time: entry.dos_time,
            dos_date: entry.dos_date,
            crc,
            compressed: compressed as u32,
            uncompressed: entry.uncompressed as u32,
            header_offset: entry.header_offset as u32,
        });
        self.state = State::Idle(out);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut out = match this.state {
            State::Idle(out) => out,
            _ => return Err(Error::write_failed("archive finish while an entry is open")),
        };

        let directory_offset = out.count();
        let mut trailer = Vec::new();
        for record in &this.directory {
            put_u32(&mut trailer, CENTRAL_HEADER_SIG);
            put_u16(&mut trailer, VERSION_MADE_BY);
            put_u16(&mut trailer, VERSION_NEEDED);
            put_u16(&mut trailer, GP_FLAGS);
            put_u16(&mut trailer, METHOD_DEFLATE);
            put_u16(&mut trailer, record.dos_time);
            put_u16(&mut trailer, record.dos_date);
            put_u32(&mut trailer, record.crc);
            put_u32(&mut trailer, record.compressed);
            put_u32(&mut trailer, record.uncompressed);
            put_u16(&mut trailer, record.name.len() as u16);
            put_u16(&mut trailer, 0); // extra field length
            put_u16(&mut trailer, 0); // comment length
            put_u16(&mut trailer, 0); // disk number start
            put_u16(&mut trailer, 0); // internal attributes
            put_u32(&mut trailer, (0o100000 | ENTRY_MODE) << 16); // unix regular file + mode
            put_u32(&mut trailer, record.header_offset);
            trailer.extend_from_slice(record.name.as_bytes());
        }
        let directory_size = trailer.len() as u64;
        if directory_offset + directory_size >= u32::MAX as u64 {
            return Err(Error::write_failed("archive exceeds the 4 GiB zip bound"));
        }

        put_u32(&mut trailer, END_OF_DIRECTORY_SIG);
        put_u16(&mut trailer, 0); // this disk
        put_u16(&mut trailer, 0); // directory disk
        put_u16(&mut trailer, this.directory.len() as u16);
        put_u16(&mut trailer, this.directory.len() as u16);
        put_u32(&mut trailer, directory_size as u32);
        put_u32(&mut trailer, directory_offset as u32);
        put_u16(&mut trailer, 0); // comment length

        out.write_all(&trailer)
            .map_err(|e| Error::write_failed(format!("central directory: {}", e)))?;
        out.flush()
            .map_err(|e| Error::write_failed(format!("flushing sink: {}", e)))?;
        Ok(())
    }
}

/// Archive member name: forward slashes, no leading `/`.
fn zip_entry_name(meta: &EntryMeta) -> String {
    meta.path
        .to_string_lossy()
        .replace('\\', "/")
        .trim_start_matches('/')
        .to_string()
}

/// Convert Unix seconds to MS-DOS time/date fields.
///
/// Times before 1980 clamp to the DOS epoch; DOS time has 2-second
/// resolution.
fn dos_datetime(unix_secs: u64) -> (u16, u16) {
    const SECS_PER_DAY: u64 = 86_400;
    let leap = |year: u64| year % 4 == 0 && (year % 100 != 0 || year % 400 == 0);

    let secs = unix_secs % SECS_PER_DAY;
    let (hour, minute, second) = (secs / 3600, (secs / 60) % 60, secs % 60);

    let mut days = unix_secs / SECS_PER_DAY;
    let mut year = 1970u64;
    loop {
        let year_days = if leap(year) { 366 } else { 365 };
        if days < year_days || year == 2107 {
            break;
        }
        days -= year_days;
        year += 1;
    }
    if year < 1980 {
        return (0, 1 << 5 | 1); // 1980-01-01 00:00:00
    }
    // DOS dates end at 2107; anything later clamps to its last day.
    let mut days = days.min(if leap(year) { 365 } else { 364 });

    let month_days = [
        31,
        if leap(year) { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut month = 0usize;
    while days >= month_days[month] {
        days -= month_days[month];
        month += 1;
    }

    let time = (hour << 11 | minute << 5 | second / 2) as u16;
    let date = ((year - 1980) << 9 | (month as u64 + 1) << 5 | (days + 1)) as u16;
    (time, date)
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// `Write` adapter tracking the absolute sink position.
struct CountWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> CountWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    fn count(&self) -> u64 {
        self.count
    }
}

impl<W: Write> Write for CountWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
