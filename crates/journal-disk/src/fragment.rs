//! One of the two journal files
//!
//! Header layout: `magic:u32 | timestamp:u64 | state:u8 | position:u64`.
//! `position` is the offset right after the last record written.

use crate::codec::decode_record;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tandem_journal::{JournalError, JournalRecord, Result};

pub const MAGIC: u32 = 0x544E_444A;
pub const HEADER_LEN: u64 = 4 + 8 + 1 + 8;

/// Header state of a fragment closed properly.
pub const CLEAN_STATE: u8 = 0;
/// Header state of a fragment in use (or left by a crash).
pub const UNCLEAN_STATE: u8 = 0xFF;

pub struct Fragment {
    path: PathBuf,
    file: Arc<File>,
    timestamp: u64,
    state: u8,
    position: u64,
}

impl Fragment {
    /// Open a fragment, initializing it if the file is new or empty.
    pub fn open(path: &Path, preallocate: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| JournalError::io(path, e))?;
        let len = file
            .metadata()
            .map_err(|e| JournalError::io(path, e))?
            .len();

        let mut fragment = Self {
            path: path.to_path_buf(),
            file: Arc::new(file),
            timestamp: 0,
            state: CLEAN_STATE,
            position: HEADER_LEN,
        };

        if len == 0 {
            tracing::debug!("initializing journal fragment {}", path.display());
            fragment
                .file
                .set_len(preallocate.max(HEADER_LEN))
                .map_err(|e| JournalError::io(path, e))?;
            fragment.write_header()?;
            fragment.sync()?;
        } else {
            fragment.read_header(len)?;
        }

        Ok(fragment)
    }

    fn read_header(&mut self, file_len: u64) -> Result<()> {
        if file_len < HEADER_LEN {
            return Err(self.invalid(format!("file of {} bytes has no header", file_len)));
        }

        let mut header = [0u8; HEADER_LEN as usize];
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_exact(&mut header))
            .map_err(|e| JournalError::io(&self.path, e))?;

        let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if magic != MAGIC {
            return Err(self.invalid(format!("bad magic {:#010x}", magic)));
        }
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&header[4..12]);
        let mut position = [0u8; 8];
        position.copy_from_slice(&header[13..21]);

        self.timestamp = u64::from_be_bytes(timestamp);
        self.state = header[12];
        self.position = u64::from_be_bytes(position);

        if self.position < HEADER_LEN || self.position > file_len {
            return Err(self.invalid(format!(
                "write position {} outside of file of {} bytes",
                self.position, file_len
            )));
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> JournalError {
        JournalError::InvalidFragment {
            path: self.path.clone(),
            reason,
        }
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(&MAGIC.to_be_bytes());
        header.extend_from_slice(&self.timestamp.to_be_bytes());
        header.push(self.state);
        header.extend_from_slice(&self.position.to_be_bytes());

        let mut file = &*self.file;
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&header))
            .map_err(|e| JournalError::io(&self.path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn state(&self) -> u8 {
        self.state
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn handle(&self) -> Arc<File> {
        self.file.clone()
    }

    pub fn set_state(&mut self, state: u8) -> Result<()> {
        self.state = state;
        self.write_header()
    }

    pub fn set_timestamp(&mut self, timestamp: u64) -> Result<()> {
        self.timestamp = timestamp;
        self.write_header()
    }

    /// Replace every record with `bytes` and stamp the fragment with a new
    /// timestamp.
    ///
    /// The records are synced before the header is written, so a crash in
    /// between leaves the previous timestamp in place.
    pub fn rewrite(&mut self, timestamp: u64, bytes: &[u8]) -> Result<()> {
        self.write_body(bytes)?;
        self.sync()?;
        self.timestamp = timestamp;
        self.position = HEADER_LEN + bytes.len() as u64;
        self.state = UNCLEAN_STATE;
        self.write_header()?;
        self.sync()
    }

    fn write_body(&self, bytes: &[u8]) -> Result<()> {
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(HEADER_LEN))
            .and_then(|_| file.write_all(bytes))
            .map_err(|e| JournalError::io(&self.path, e))
    }

    /// Write encoded records at the current position and advance it.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(self.position))
            .and_then(|_| file.write_all(bytes))
            .map_err(|e| JournalError::io(&self.path, e))?;
        self.position += bytes.len() as u64;
        self.write_header()
    }

    /// Read every record between the header and the write position.
    ///
    /// With `skip_corrupted`, reading stops at the first unreadable record and
    /// the write position is moved back to it.
    pub fn read_records(&mut self, skip_corrupted: bool) -> Result<Vec<JournalRecord>> {
        let len = (self.position - HEADER_LEN) as usize;
        let mut buf = vec![0u8; len];
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(HEADER_LEN))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(|e| JournalError::io(&self.path, e))?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < buf.len() {
            match decode_record(&buf[offset..]) {
                Ok((record, size)) => {
                    records.push(record);
                    offset += size;
                }
                Err(reason) => {
                    let position = HEADER_LEN + offset as u64;
                    if !skip_corrupted {
                        return Err(JournalError::Corrupted {
                            path: self.path.clone(),
                            position,
                            reason,
                        });
                    }
                    tracing::warn!(
                        "skipping corrupted journal records in {} from position {}: {}",
                        self.path.display(),
                        position,
                        reason
                    );
                    self.position = position;
                    self.write_header()?;
                    break;
                }
            }
        }

        Ok(records)
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| JournalError::io(&self.path, e))
    }
}
