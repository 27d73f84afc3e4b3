//! On-disk record formats.
//!
//! ## Data record layout
//!
//! All integers are big-endian. The CRC covers every byte after the CRC
//! field itself, through the end of the value.
//!
//! ```text
//! +--------+-----------+----------+------------+----------+------------+
//! | crc u32| ts u32    | ksz u16  | vsz u32    | key      | value      |
//! +--------+-----------+----------+------------+----------+------------+
//! ```
//!
//! A record with `vsz == 0` is a tombstone. Total record length is
//! `HEADER_SIZE + ksz + vsz`.
//!
//! ## Hint record layout
//!
//! A hint record carries the same header fields minus the payload, plus the
//! position of the data record in its file:
//!
//! ```text
//! +-----------+----------+------------+----------+----------+
//! | ts u32    | ksz u16  | vsz u32    | pos u32  | key      |
//! +-----------+----------+------------+----------+----------+
//! ```

use crate::errcorrupt;
use crate::error::{Error, Result};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};

use std::io::{Read, Write};

/// Fixed data record header size: crc(4) + ts(4) + ksz(2) + vsz(4).
pub const HEADER_SIZE: usize = 14;

/// Fixed hint record header size: ts(4) + ksz(2) + vsz(4) + pos(4).
pub const HINT_HEADER_SIZE: usize = 14;

/// Keys are nonempty and bounded to 2^16 - 1 bytes.
pub const MAX_KEY_SIZE: usize = u16::MAX as usize;

/// Values are bounded to 2^31 - 1 bytes.
pub const MAX_VALUE_SIZE: usize = i32::MAX as usize;

/// CRC-32 with the zlib/IEEE polynomial.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A decoded data record. `key` holds the on-disk key bytes; in prefixed
/// mode the first byte is the filter prefix, not part of the logical key.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub ts: u32,
}

impl Record {
    /// A tombstone is a record with an empty value.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }

    /// Full encoded length of this record, header included.
    pub fn encoded_len(&self) -> u32 {
        (HEADER_SIZE + self.key.len() + self.value.len()) as u32
    }
}

/// Encodes a record into a fresh buffer, CRC included.
pub fn encode_record(key: &[u8], value: &[u8], ts: u32) -> Vec<u8> {
    let len = HEADER_SIZE + key.len() + value.len();
    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(&[0u8; 4]); // crc backfilled below
    buf.extend_from_slice(&ts.to_be_bytes());
    buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    let crc = CRC32.checksum(&buf[4..]);
    BigEndian::write_u32(&mut buf[..4], crc);
    buf
}

/// Decodes and CRC-verifies a complete record buffer, as read back through
/// the index. The buffer must hold exactly one record.
pub fn decode_record(buf: &[u8]) -> Result<Record> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::Truncated(format!(
            "record shorter than header: {} bytes",
            buf.len()
        )));
    }
    let crc = BigEndian::read_u32(&buf[0..4]);
    let ts = BigEndian::read_u32(&buf[4..8]);
    let ksz = BigEndian::read_u16(&buf[8..10]) as usize;
    let vsz = BigEndian::read_u32(&buf[10..14]) as usize;
    let total = HEADER_SIZE + ksz + vsz;
    if buf.len() < total {
        return Err(Error::Truncated(format!(
            "record payload cut short: {} of {} bytes",
            buf.len(),
            total
        )));
    }
    let actual = CRC32.checksum(&buf[4..total]);
    if actual != crc {
        return errcorrupt!("crc mismatch: stored {crc:#010x}, computed {actual:#010x}");
    }
    Ok(Record {
        key: buf[HEADER_SIZE..HEADER_SIZE + ksz].to_vec(),
        value: buf[HEADER_SIZE + ksz..total].to_vec(),
        ts,
    })
}

/// Reads one record from a stream. Returns `Ok(None)` on a clean end of
/// file at a record boundary. A partial header or payload is `Truncated`;
/// with `verify_crc` a checksum failure is `Corrupt`. Recovery scans pass
/// `verify_crc = false` so a flipped byte surfaces on the indexed read
/// instead of silently dropping the key; merge scans verify, since a
/// rewritten record gets a fresh checksum.
pub fn read_record<R: Read>(reader: &mut R, verify_crc: bool) -> Result<Option<(Record, u32)>> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header) {
        Ok(_) => (),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            // Distinguish a clean boundary from a torn header.
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }

    let crc = BigEndian::read_u32(&header[0..4]);
    let ts = BigEndian::read_u32(&header[4..8]);
    let ksz = BigEndian::read_u16(&header[8..10]) as usize;
    let vsz = BigEndian::read_u32(&header[10..14]) as usize;

    // A corrupt header could claim a payload no writer produces; reject it
    // before allocating for it.
    if vsz > MAX_VALUE_SIZE {
        return errcorrupt!("implausible value size {vsz} in record header");
    }

    let mut payload = vec![0u8; ksz + vsz];
    match reader.read_exact(&mut payload) {
        Ok(_) => (),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::Truncated(format!(
                "payload cut short reading {} byte record",
                HEADER_SIZE + ksz + vsz
            )));
        }
        Err(e) => return Err(e.into()),
    }

    if verify_crc {
        let mut digest = CRC32.digest();
        digest.update(&header[4..]);
        digest.update(&payload);
        let actual = digest.finalize();
        if actual != crc {
            return errcorrupt!("crc mismatch: stored {crc:#010x}, computed {actual:#010x}");
        }
    }

    let value = payload.split_off(ksz);
    let record = Record {
        key: payload,
        value,
        ts,
    };
    let len = record.encoded_len();
    Ok(Some((record, len)))
}

/// An index entry persisted in a hint file: everything recovery needs to
/// reinstall a key without touching the data record's value bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct HintEntry {
    pub ts: u32,
    pub value_size: u32,
    pub pos: u32,
    pub key: Vec<u8>,
}

impl HintEntry {
    /// Length of the data record this hint describes.
    pub fn record_len(&self) -> u32 {
        (HEADER_SIZE + self.key.len()) as u32 + self.value_size
    }
}

/// Appends one hint record to a writer.
pub fn write_hint<W: Write>(writer: &mut W, hint: &HintEntry) -> Result<()> {
    writer.write_u32::<BigEndian>(hint.ts)?;
    writer.write_u16::<BigEndian>(hint.key.len() as u16)?;
    writer.write_u32::<BigEndian>(hint.value_size)?;
    writer.write_u32::<BigEndian>(hint.pos)?;
    writer.write_all(&hint.key)?;
    Ok(())
}

/// Reads one hint record. Returns `Ok(None)` on a clean end of file; a
/// partial record is `Truncated`.
pub fn read_hint<R: Read>(reader: &mut R) -> Result<Option<HintEntry>> {
    let mut header = [0u8; HINT_HEADER_SIZE];
    match reader.read_exact(&mut header) {
        Ok(_) => (),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let ts = BigEndian::read_u32(&header[0..4]);
    let ksz = BigEndian::read_u16(&header[4..6]) as usize;
    let value_size = BigEndian::read_u32(&header[6..10]);
    let pos = BigEndian::read_u32(&header[10..14]);

    let mut key = vec![0u8; ksz];
    match reader.read_exact(&mut key) {
        Ok(_) => (),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::Truncated("hint record cut short".to_string()));
        }
        Err(e) => return Err(e.into()),
    }
    Ok(Some(HintEntry {
        ts,
        value_size,
        pos,
        key,
    }))
}

/// Filter byte for the prefixed on-disk key layout: an XOR fold of the
/// logical key. Deterministic, and reversible by stripping.
pub fn key_prefix(key: &[u8]) -> u8 {
    key.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Maps a logical key to its on-disk form under the prefixed layout.
pub fn prefix_key(key: &[u8]) -> Vec<u8> {
    let mut disk = Vec::with_capacity(key.len() + 1);
    disk.push(key_prefix(key));
    disk.extend_from_slice(key);
    disk
}

/// Recovers the logical key from a prefixed on-disk key.
pub fn strip_prefix(disk_key: &[u8]) -> &[u8] {
    &disk_key[1..]
}
