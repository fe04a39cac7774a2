//! Forward-only zip writer
//!
//! Every entry sets general purpose bit 3: the CRC and sizes follow the
//! compressed data in a data descriptor, so the output is never seeked and
//! can go straight to a socket. The central directory is only written by
//! [`ZipStreamWriter::finish`]. A writer dropped before that leaves a byte
//! stream without an end of central directory record, which no reader will
//! open as a complete archive.

use std::io::{self, Read, Write};
use std::time::SystemTime;

use chrono::{DateTime, Datelike, Timelike, Utc};
use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;

const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
const FLAG_UTF8: u16 = 1 << 11;
const METHOD_DEFLATE: u16 = 8;

const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;
/// Host Unix, format version 4.5
const VERSION_MADE_BY: u16 = (3 << 8) | 45;

const ZIP64_EXTRA_ID: u16 = 0x0001;
/// Regular file, rw-r--r--
const UNIX_FILE_ATTRS: u32 = 0o100644 << 16;

const U32_LIMIT: u64 = u32::MAX as u64;
const U16_LIMIT: u64 = u16::MAX as u64;

/// 1980-01-01 00:00:00, the earliest DOS timestamp
const DOS_EPOCH: (u16, u16) = (0, (1 << 5) | 1);

const COPY_BUFFER_SIZE: usize = 64 * 1024;

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct CentralRecord {
    name: Vec<u8>,
    dos_time: u16,
    dos_date: u16,
    crc: u32,
    compressed: u64,
    uncompressed: u64,
    offset: u64,
    zip64_local: bool,
}

pub struct ZipStreamWriter<W: Write> {
    out: CountingWriter<W>,
    records: Vec<CentralRecord>,
}

impl<W: Write> ZipStreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            out: CountingWriter { inner, written: 0 },
            records: Vec::new(),
        }
    }

    /// Deflate everything `source` yields into a new entry named `name`.
    ///
    /// `size_hint` decides up front whether the local header announces
    /// zip64 sizes. Returns the number of uncompressed bytes archived.
    pub fn add_file<R: Read>(
        &mut self,
        name: &str,
        modified: Option<SystemTime>,
        size_hint: u64,
        source: &mut R,
    ) -> io::Result<u64> {
        let offset = self.out.written;
        let (dos_time, dos_date) = modified.map(dos_timestamp).unwrap_or(DOS_EPOCH);
        let zip64_local = size_hint >= U32_LIMIT;
        let name = name.as_bytes().to_vec();
        let name_len = u16::try_from(name.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry name too long"))?;

        let mut header = Vec::with_capacity(30 + name.len() + 20);
        put_u32(&mut header, LOCAL_HEADER_SIG);
        put_u16(&mut header, if zip64_local { VERSION_ZIP64 } else { VERSION_DEFAULT });
        put_u16(&mut header, FLAG_DATA_DESCRIPTOR | FLAG_UTF8);
        put_u16(&mut header, METHOD_DEFLATE);
        put_u16(&mut header, dos_time);
        put_u16(&mut header, dos_date);
        put_u32(&mut header, 0);
        if zip64_local {
            put_u32(&mut header, u32::MAX);
            put_u32(&mut header, u32::MAX);
        } else {
            put_u32(&mut header, 0);
            put_u32(&mut header, 0);
        }
        put_u16(&mut header, name_len);
        put_u16(&mut header, if zip64_local { 20 } else { 0 });
        header.extend_from_slice(&name);
        if zip64_local {
            put_u16(&mut header, ZIP64_EXTRA_ID);
            put_u16(&mut header, 16);
            put_u64(&mut header, 0);
            put_u64(&mut header, 0);
        }
        self.out.write_all(&header)?;

        let data_start = self.out.written;
        let mut crc = Crc::new();
        let mut uncompressed = 0u64;
        let mut encoder = DeflateEncoder::new(&mut self.out, Compression::default());
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            crc.update(&buffer[..n]);
            encoder.write_all(&buffer[..n])?;
            uncompressed += n as u64;
        }
        encoder.finish()?;
        let compressed = self.out.written - data_start;

        if !zip64_local && (compressed >= U32_LIMIT || uncompressed >= U32_LIMIT) {
            return Err(io::Error::other(format!(
                "{} grew past 4 GiB while being archived",
                String::from_utf8_lossy(&name)
            )));
        }

        let mut descriptor = Vec::with_capacity(24);
        put_u32(&mut descriptor, DATA_DESCRIPTOR_SIG);
        put_u32(&mut descriptor, crc.sum());
        if zip64_local {
            put_u64(&mut descriptor, compressed);
            put_u64(&mut descriptor, uncompressed);
        } else {
            put_u32(&mut descriptor, compressed as u32);
            put_u32(&mut descriptor, uncompressed as u32);
        }
        self.out.write_all(&descriptor)?;

        self.records.push(CentralRecord {
            name,
            dos_time,
            dos_date,
            crc: crc.sum(),
            compressed,
            uncompressed,
            offset,
            zip64_local,
        });

        Ok(uncompressed)
    }

    /// Write the central directory and hand back the sink
    pub fn finish(mut self) -> io::Result<W> {
        let cd_start = self.out.written;
        for record in &self.records {
            let central = central_header(record);
            self.out.write_all(&central)?;
        }
        let cd_size = self.out.written - cd_start;
        let count = self.records.len() as u64;

        let mut tail = Vec::with_capacity(98);
        if count >= U16_LIMIT || cd_start >= U32_LIMIT || cd_size >= U32_LIMIT {
            let zip64_eocd_offset = self.out.written;
            put_u32(&mut tail, ZIP64_EOCD_SIG);
            put_u64(&mut tail, 44);
            put_u16(&mut tail, VERSION_MADE_BY);
            put_u16(&mut tail, VERSION_ZIP64);
            put_u32(&mut tail, 0);
            put_u32(&mut tail, 0);
            put_u64(&mut tail, count);
            put_u64(&mut tail, count);
            put_u64(&mut tail, cd_size);
            put_u64(&mut tail, cd_start);

            put_u32(&mut tail, ZIP64_LOCATOR_SIG);
            put_u32(&mut tail, 0);
            put_u64(&mut tail, zip64_eocd_offset);
            put_u32(&mut tail, 1);
        }

        let count16 = count.min(U16_LIMIT) as u16;
        put_u32(&mut tail, EOCD_SIG);
        put_u16(&mut tail, 0);
        put_u16(&mut tail, 0);
        put_u16(&mut tail, count16);
        put_u16(&mut tail, count16);
        put_u32(&mut tail, clamp_u32(cd_size));
        put_u32(&mut tail, clamp_u32(cd_start));
        put_u16(&mut tail, 0);
        self.out.write_all(&tail)?;

        self.out.flush()?;
        Ok(self.out.inner)
    }
}

fn central_header(record: &CentralRecord) -> Vec<u8> {
    let mut zip64 = Vec::new();
    if record.uncompressed >= U32_LIMIT {
        put_u64(&mut zip64, record.uncompressed);
    }
    if record.compressed >= U32_LIMIT {
        put_u64(&mut zip64, record.compressed);
    }
    if record.offset >= U32_LIMIT {
        put_u64(&mut zip64, record.offset);
    }
    let extra_len = if zip64.is_empty() { 0 } else { 4 + zip64.len() };
    let needs_zip64 = record.zip64_local || !zip64.is_empty();

    let mut out = Vec::with_capacity(46 + record.name.len() + extra_len);
    put_u32(&mut out, CENTRAL_HEADER_SIG);
    put_u16(&mut out, VERSION_MADE_BY);
    put_u16(&mut out, if needs_zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT });
    put_u16(&mut out, FLAG_DATA_DESCRIPTOR | FLAG_UTF8);
    put_u16(&mut out, METHOD_DEFLATE);
    put_u16(&mut out, record.dos_time);
    put_u16(&mut out, record.dos_date);
    put_u32(&mut out, record.crc);
    put_u32(&mut out, clamp_u32(record.compressed));
    put_u32(&mut out, clamp_u32(record.uncompressed));
    put_u16(&mut out, record.name.len() as u16);
    put_u16(&mut out, extra_len as u16);
    put_u16(&mut out, 0);
    put_u16(&mut out, 0);
    put_u16(&mut out, 0);
    put_u32(&mut out, UNIX_FILE_ATTRS);
    put_u32(&mut out, clamp_u32(record.offset));
    out.extend_from_slice(&record.name);
    if !zip64.is_empty() {
        put_u16(&mut out, ZIP64_EXTRA_ID);
        put_u16(&mut out, zip64.len() as u16);
        out.extend_from_slice(&zip64);
    }
    out
}

/// DOS (time, date) pair. No time zone, two-second resolution, clamped to
/// the 1980..=2107 range the format can express.
fn dos_timestamp(time: SystemTime) -> (u16, u16) {
    let time: DateTime<Utc> = time.into();
    if time.year() < 1980 {
        return DOS_EPOCH;
    }
    if time.year() > 2107 {
        return (
            (23 << 11) | (59 << 5) | 29,
            (127 << 9) | (12 << 5) | 31,
        );
    }

    let date = (((time.year() - 1980) as u16) << 9) | ((time.month() as u16) << 5) | time.day() as u16;
    let clock = ((time.hour() as u16) << 11) | ((time.minute() as u16) << 5) | (time.second() as u16 / 2);
    (clock, date)
}

fn clamp_u32(value: u64) -> u32 {
    if value >= U32_LIMIT {
        u32::MAX
    } else {
        value as u32
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// True if `bytes` contains an end of central directory record
#[cfg(test)]
pub fn has_end_record(bytes: &[u8]) -> bool {
    let sig = EOCD_SIG.to_le_bytes();
    bytes.windows(sig.len()).any(|w| w == sig)
}
