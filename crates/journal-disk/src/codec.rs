//! Binary record layout
//!
//! ```text
//! length:u32 | status:i32 | time:u64 | sequence:u32 | checksum:u32 |
//! gtrid_len:u16 gtrid | count:u32 (name_len:u16 name)* | end_marker:u32
//! ```
//!
//! All integers are big-endian. `length` counts the bytes that follow it.

use std::collections::BTreeSet;
use tandem_journal::JournalRecord;
use tandem_uid::Uid;
use tandem_xa::Status;

/// Trailer of every record.
pub const RECORD_END_MARKER: u32 = 0x454E_4421;

/// Smallest possible value of the length field.
const MIN_BODY_LEN: usize = 4 + 8 + 4 + 4 + 2 + 4 + 4;

/// Checksum over everything but the length, checksum and end marker fields.
pub fn checksum(record: &JournalRecord) -> u32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&record.status.code().to_be_bytes());
    hasher.update(&record.time.to_be_bytes());
    hasher.update(&record.sequence.to_be_bytes());
    hasher.update(record.gtrid.as_bytes());
    for name in &record.unique_names {
        hasher.update(&(name.len() as u16).to_be_bytes());
        hasher.update(name.as_bytes());
    }
    let hash = hasher.finalize();
    let bytes = hash.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Serialize a record, length prefix included.
pub fn encode_record(record: &JournalRecord) -> Result<Vec<u8>, String> {
    let gtrid = record.gtrid.as_bytes();
    if gtrid.len() > u16::MAX as usize {
        return Err(format!("gtrid of {} bytes is too long", gtrid.len()));
    }

    let names_len: usize = record.unique_names.iter().map(|n| 2 + n.len()).sum();
    let body_len = MIN_BODY_LEN + gtrid.len() + names_len;
    let mut buf = Vec::with_capacity(4 + body_len);

    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.extend_from_slice(&record.status.code().to_be_bytes());
    buf.extend_from_slice(&record.time.to_be_bytes());
    buf.extend_from_slice(&record.sequence.to_be_bytes());
    buf.extend_from_slice(&checksum(record).to_be_bytes());
    buf.extend_from_slice(&(gtrid.len() as u16).to_be_bytes());
    buf.extend_from_slice(gtrid);
    buf.extend_from_slice(&(record.unique_names.len() as u32).to_be_bytes());
    for name in &record.unique_names {
        if name.len() > u16::MAX as usize {
            return Err(format!("resource name '{}' is too long", name));
        }
        buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
        buf.extend_from_slice(name.as_bytes());
    }
    buf.extend_from_slice(&RECORD_END_MARKER.to_be_bytes());

    Ok(buf)
}

/// Parse the record at the start of `buf`, returning it and its encoded size.
pub fn decode_record(buf: &[u8]) -> Result<(JournalRecord, usize), String> {
    let mut reader = Reader::new(buf);

    let body_len = reader.u32()? as usize;
    if body_len < MIN_BODY_LEN {
        return Err(format!("record length {} is too small", body_len));
    }
    if body_len > buf.len() - 4 {
        return Err(format!(
            "record length {} exceeds the {} remaining bytes",
            body_len,
            buf.len() - 4
        ));
    }

    let mut body = Reader::new(&buf[4..4 + body_len]);
    let code = body.i32()?;
    let status = Status::from_code(code).ok_or_else(|| format!("unknown status code {}", code))?;
    let time = body.u64()?;
    let sequence = body.u32()?;
    let stored_checksum = body.u32()?;
    let gtrid_len = body.u16()? as usize;
    let gtrid = Uid::new(body.bytes(gtrid_len)?.to_vec());

    let count = body.u32()?;
    let mut unique_names = BTreeSet::new();
    for _ in 0..count {
        let len = body.u16()? as usize;
        let name = std::str::from_utf8(body.bytes(len)?)
            .map_err(|e| format!("resource name is not UTF-8: {}", e))?;
        unique_names.insert(name.to_string());
    }

    let marker = body.u32()?;
    if marker != RECORD_END_MARKER {
        return Err(format!("bad end marker {:#010x}", marker));
    }
    if !body.is_empty() {
        return Err("trailing bytes after end marker".to_string());
    }

    let record = JournalRecord::new(status, gtrid, unique_names, time, sequence);
    let computed = checksum(&record);
    if computed != stored_checksum {
        return Err(format!(
            "checksum mismatch: stored {:#010x}, computed {:#010x}",
            stored_checksum, computed
        ));
    }

    Ok((record, 4 + body_len))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| format!("unexpected end of record at offset {}", self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], String> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, String> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, String> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, String> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, String> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> JournalRecord {
        JournalRecord::new(
            Status::Committing,
            Uid::from_parts(b"node-a", 1_700_000_000_000, 7),
            ["db1".to_string(), "queue".to_string()].into(),
            1_700_000_000_123,
            42,
        )
    }

    #[test]
    fn test_decode_encoded_record() {
        let record = sample();
        let bytes = encode_record(&record).unwrap();
        let (decoded, size) = decode_record(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(size, bytes.len());
    }

    #[test]
    fn test_flipped_byte_is_detected() {
        let bytes = encode_record(&sample()).unwrap();
        // Flip a byte inside the gtrid
        let mut corrupted = bytes.clone();
        corrupted[30] ^= 0xFF;
        assert!(decode_record(&corrupted).unwrap_err().contains("checksum"));
    }

    #[test]
    fn test_truncated_record_is_rejected() {
        let bytes = encode_record(&sample()).unwrap();
        assert!(decode_record(&bytes[..bytes.len() - 3]).is_err());
        assert!(decode_record(&[0, 0]).is_err());
        assert!(decode_record(&[0, 0, 0, 0]).is_err());
    }
}
