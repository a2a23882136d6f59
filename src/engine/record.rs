//! TICKVAULT - Record Codec
//! Encodes and decodes the self-describing records of the append-only log.

use std::fs::File;
use std::io;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, TickError};
use crate::types::{Mark, Record};

/// `[mark: 1][key_len: 4]`
const HEAD_LEN: usize = 1 + 4;
/// `[val_len: 4]`
const VAL_LEN_LEN: usize = 4;
/// `[crc: 4]`
const CRC_LEN: usize = 4;

/// Fixed per-record overhead in bytes.
pub const RECORD_OVERHEAD: u64 = (HEAD_LEN + VAL_LEN_LEN + CRC_LEN) as u64;

/// Encode a record into its on-disk form.
///
/// ## Binary Format
/// ```text
/// [mark: 1 byte][key_len: 4 bytes (LE)][key: N bytes][val_len: 4 bytes (LE)][value: M bytes][crc: 4 bytes]
/// ```
/// The checksum covers every byte before it. A `Del` record has `val_len = 0`.
pub fn encode(record: &Record) -> BytesMut {
    let value = record.value.as_deref().unwrap_or_default();
    let mut buf = BytesMut::with_capacity(encoded_len(record) as usize);
    buf.put_u8(record.mark as u8);
    buf.put_u32_le(record.key.len() as u32);
    buf.put_slice(&record.key);
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf
}

/// Size of `record` once encoded.
pub fn encoded_len(record: &Record) -> u64 {
    let value_len = record.value.as_ref().map_or(0, |v| v.len());
    RECORD_OVERHEAD + record.key.len() as u64 + value_len as u64
}

/// Read the record starting at `offset`, never looking at bytes at or past
/// `end` (the logical end of the log).
///
/// Returns the record and its encoded size, which is where the next
/// record starts. Running out of bytes is `EndOfData`, a bad checksum or
/// mark is `Corruption`.
pub fn read_at(file: &File, offset: u64, end: u64) -> Result<(Record, u64)> {
    let eod = TickError::EndOfData { offset };

    let mut head = [0u8; HEAD_LEN];
    read_bounded(file, &mut head, offset, end).map_err(|e| eod_or(e, offset))?;
    let mut cursor = &head[..];
    let mark_byte = cursor.get_u8();
    let key_len = cursor.get_u32_le() as u64;

    // key + val_len, bounded before allocating
    let key_end = offset + HEAD_LEN as u64 + key_len + VAL_LEN_LEN as u64;
    if key_end > end {
        return Err(eod);
    }
    let mut key_and_len = vec![0u8; key_len as usize + VAL_LEN_LEN];
    read_bounded(file, &mut key_and_len, offset + HEAD_LEN as u64, end)
        .map_err(|e| eod_or(e, offset))?;
    let value_len = (&key_and_len[key_len as usize..]).get_u32_le() as u64;

    let total = RECORD_OVERHEAD + key_len + value_len;
    if offset + total > end {
        return Err(eod);
    }
    let mut tail = vec![0u8; value_len as usize + CRC_LEN];
    read_bounded(file, &mut tail, key_end, end).map_err(|e| eod_or(e, offset))?;
    let stored_crc = (&tail[value_len as usize..]).get_u32_le();

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&head);
    hasher.update(&key_and_len);
    hasher.update(&tail[..value_len as usize]);
    if hasher.finalize() != stored_crc {
        return Err(TickError::Corruption(format!(
            "checksum mismatch in record at offset {}",
            offset
        )));
    }

    let mark = Mark::from_byte(mark_byte).ok_or_else(|| {
        TickError::Corruption(format!("unknown mark {} at offset {}", mark_byte, offset))
    })?;
    key_and_len.truncate(key_len as usize);
    tail.truncate(value_len as usize);
    let record = match mark {
        Mark::Put => Record::put(key_and_len, tail),
        Mark::Del => Record::delete(key_and_len),
    };
    Ok((record, total))
}

/// Encoded size the record header at `offset` claims, when both length
/// fields lie before `end`. Used to tell a damaged final record apart from
/// damage in the middle of the log.
pub fn claimed_len(file: &File, offset: u64, end: u64) -> Option<u64> {
    let mut head = [0u8; HEAD_LEN];
    read_bounded(file, &mut head, offset, end).ok()?;
    let key_len = (&head[1..]).get_u32_le() as u64;
    let mut value_len = [0u8; VAL_LEN_LEN];
    read_bounded(file, &mut value_len, offset + HEAD_LEN as u64 + key_len, end).ok()?;
    Some(RECORD_OVERHEAD + key_len + u32::from_le_bytes(value_len) as u64)
}

fn eod_or(err: io::Error, offset: u64) -> TickError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        TickError::EndOfData { offset }
    } else {
        TickError::Io(err)
    }
}

fn read_bounded(file: &File, buf: &mut [u8], offset: u64, end: u64) -> io::Result<()> {
    if offset + buf.len() as u64 > end {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    read_exact_at(file, buf, offset)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
