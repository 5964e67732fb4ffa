//! Filestore metadata records and their binary encoding.
//!
//! Records are stored with a 56-byte header followed by variable-length
//! sections:
//!
//! ```text
//! 0x00  4   "SREC" magic
//! 0x04  1   version (u8) = 1
//! 0x05  3   reserved (must be 0)
//! 0x08  4   flags (u32 LE)
//! 0x0C  4   path_len (u32 LE)
//! 0x10  8   offset (u64 LE)
//! 0x18  8   size (u64 LE)
//! 0x20  8   mod_time (i64 LE, unix nanoseconds)
//! 0x28  8   data_len (u64 LE, MAX = absent)
//! 0x30  8   alt_len (u64 LE, MAX = absent)
//! 0x38  ... path bytes, data bytes, alt bytes
//! ```

use crate::error::{Error, Result};
use crate::key::Key;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::SystemTime;

/// Magic bytes at the start of every record.
pub const MAGIC: &[u8; 4] = b"SREC";

/// Current record format version.
pub const VERSION: u8 = 1;

/// Size of the record header in bytes.
pub const HEADER_SIZE: usize = 56;

/// Sentinel length meaning "section absent".
const ABSENT: u64 = u64::MAX;

/// Record flags.
pub mod flags {
    /// Record spans an entire file.
    pub const WHOLE_FILE: u32 = 1 << 0;
    /// Record is the top-level block of a file-backed DAG.
    pub const FILE_ROOT: u32 = 1 << 1;
    /// No content bytes are stored in the record; block content is derived
    /// from the backing file range, and node bytes (if any) must be fetched
    /// from a companion block store.
    pub const NO_BLOCK_DATA: u32 = 1 << 2;
}

/// Outcome of checking a record's backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// File matches the record.
    Intact,
    /// File grew past the recorded range but the range content is intact.
    Appended,
}

/// The persisted description of one file-backed (or inline) block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataObj {
    /// Flag set, see [`flags`].
    pub flags: u32,
    /// Path of the backing file. Empty for purely inline records.
    pub file_path: String,
    /// Byte offset of the content within the backing file.
    pub offset: u64,
    /// Byte size of the content.
    pub size: u64,
    /// Modification time of the backing file when recorded
    /// (unix nanoseconds).
    pub mod_time: i64,
    /// Inline block bytes.
    pub data: Option<Vec<u8>>,
    /// Alternate inline bytes overriding the file-derived content.
    pub alt_data: Option<Vec<u8>>,
}

impl DataObj {
    /// Record spans an entire file.
    pub fn whole_file(&self) -> bool {
        self.flags & flags::WHOLE_FILE != 0
    }

    /// Record is the top-level block of a file-backed DAG.
    pub fn file_root(&self) -> bool {
        self.flags & flags::FILE_ROOT != 0
    }

    /// Record stores no content bytes of its own.
    pub fn no_block_data(&self) -> bool {
        self.flags & flags::NO_BLOCK_DATA != 0
    }

    /// Listing label: whole-file records are roots, others leaves.
    pub fn what(&self) -> &'static str {
        if self.whole_file() { "root" } else { "leaf" }
    }

    /// Space-separated metadata summary for listing output.
    pub fn format(&self) -> String {
        format!(
            "{} {} {} {}",
            self.what(),
            self.file_path,
            self.offset,
            self.size
        )
    }

    /// Encode the record.
    ///
    /// Enforces the flag invariant: a record with `NO_BLOCK_DATA` set never
    /// carries inline bytes, one with it unset always does.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.no_block_data() {
            if self.data.is_some() || self.alt_data.is_some() {
                return Err(Error::invalid_arg(
                    "record with NoBlockData must not carry inline bytes",
                ));
            }
        } else if self.data.is_none() && self.alt_data.is_none() {
            return Err(Error::invalid_arg(
                "record without NoBlockData must carry inline bytes",
            ));
        }

        let path = self.file_path.as_bytes();
        let data_len = self.data.as_ref().map_or(ABSENT, |d| d.len() as u64);
        let alt_len = self.alt_data.as_ref().map_or(ABSENT, |d| d.len() as u64);

        let mut buf = Vec::with_capacity(
            HEADER_SIZE
                + path.len()
                + self.data.as_ref().map_or(0, Vec::len)
                + self.alt_data.as_ref().map_or(0, Vec::len),
        );
        buf.extend_from_slice(MAGIC);
        buf.push(VERSION);
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&(path.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.mod_time.to_le_bytes());
        buf.extend_from_slice(&data_len.to_le_bytes());
        buf.extend_from_slice(&alt_len.to_le_bytes());
        buf.extend_from_slice(path);
        if let Some(data) = &self.data {
            buf.extend_from_slice(data);
        }
        if let Some(alt) = &self.alt_data {
            buf.extend_from_slice(alt);
        }
        Ok(buf)
    }

    /// Decode a full record.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (mut obj, path_end, data_len, alt_len) = Self::decode_header(buf)?;

        let mut at = path_end;
        if data_len != ABSENT {
            let end = at + data_len as usize;
            if buf.len() < end {
                return Err(Error::invalid_arg("record truncated in data section"));
            }
            obj.data = Some(buf[at..end].to_vec());
            at = end;
        }
        if alt_len != ABSENT {
            let end = at + alt_len as usize;
            if buf.len() < end {
                return Err(Error::invalid_arg("record truncated in alt section"));
            }
            obj.alt_data = Some(buf[at..end].to_vec());
        }
        Ok(obj)
    }

    /// Decode only the structural fields, skipping inline bytes.
    ///
    /// Cheaper than [`DataObj::decode`] for fast scans; the returned record
    /// reports `data`/`alt_data` as `None` regardless of what is stored.
    pub fn decode_light(buf: &[u8]) -> Result<Self> {
        let (obj, _, _, _) = Self::decode_header(buf)?;
        Ok(obj)
    }

    fn decode_header(buf: &[u8]) -> Result<(Self, usize, u64, u64)> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::invalid_arg(format!(
                "record too short: {} bytes (expected at least {})",
                buf.len(),
                HEADER_SIZE
            )));
        }
        if &buf[0..4] != MAGIC {
            return Err(Error::invalid_arg(format!(
                "invalid record magic: {:?}",
                &buf[0..4]
            )));
        }
        if buf[4] != VERSION {
            return Err(Error::invalid_arg(format!(
                "unsupported record version: {}",
                buf[4]
            )));
        }

        let flags = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let path_len = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize;
        let offset = le_u64(&buf[16..24]);
        let size = le_u64(&buf[24..32]);
        let mod_time = le_u64(&buf[32..40]) as i64;
        let data_len = le_u64(&buf[40..48]);
        let alt_len = le_u64(&buf[48..56]);

        let path_end = HEADER_SIZE + path_len;
        if buf.len() < path_end {
            return Err(Error::invalid_arg("record truncated in path section"));
        }
        let file_path = std::str::from_utf8(&buf[HEADER_SIZE..path_end])
            .map_err(|e| Error::invalid_arg(format!("record path is not utf-8: {}", e)))?
            .to_string();

        let obj = Self {
            flags,
            file_path,
            offset,
            size,
            mod_time,
            data: None,
            alt_data: None,
        };
        Ok((obj, path_end, data_len, alt_len))
    }

    /// Read the file range this record describes.
    fn read_range(&self) -> Result<Vec<u8>> {
        let path = Path::new(&self.file_path);
        let mut file = match fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::file_missing(path));
            }
            Err(err) => return Err(err.into()),
        };
        file.seek(SeekFrom::Start(self.offset))?;
        let mut content = vec![0u8; self.size as usize];
        match file.read_exact(&mut content) {
            Ok(()) => Ok(content),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(Error::file_changed(path, "short read"))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Check the backing file against the record.
    ///
    /// Verifies existence, a readable range, the content hash (for records
    /// whose content is the file range itself), and the recorded
    /// modification time. A whole-file record whose file grew but whose
    /// recorded range still matches reports [`FileState::Appended`].
    pub fn verify_backing(&self, key: &Key) -> Result<FileState> {
        let path = Path::new(&self.file_path);
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::file_missing(path));
            }
            Err(err) => return Err(err.into()),
        };

        let content = self.read_range()?;
        if self.no_block_data() && Key::hash_bytes(&content) != *key {
            return Err(Error::file_changed(path, "content hash mismatch"));
        }

        let mod_time = mod_time_of(&meta)?;
        if mod_time != self.mod_time {
            if self.whole_file() && meta.len() > self.offset + self.size {
                return Ok(FileState::Appended);
            }
            return Err(Error::file_changed(path, "modification time changed"));
        }
        Ok(FileState::Intact)
    }

    /// Content bytes for this record.
    ///
    /// Alternate bytes override inline bytes, which override the
    /// file-derived range. With `verify`, file-derived content is checked
    /// against the key.
    pub fn content(&self, key: &Key, verify: bool) -> Result<Vec<u8>> {
        if let Some(alt) = &self.alt_data {
            return Ok(alt.clone());
        }
        if let Some(data) = &self.data {
            return Ok(data.clone());
        }
        let content = self.read_range()?;
        if verify && Key::hash_bytes(&content) != *key {
            return Err(Error::file_changed(
                Path::new(&self.file_path),
                "content hash mismatch",
            ));
        }
        Ok(content)
    }
}

fn le_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(buf);
    u64::from_le_bytes(bytes)
}

/// Modification time of a file as unix nanoseconds.
pub fn mod_time_of(meta: &fs::Metadata) -> Result<i64> {
    let modified = meta.modified()?;
    Ok(unix_nanos(modified))
}

/// Convert a system time to unix nanoseconds.
pub fn unix_nanos(t: SystemTime) -> i64 {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}
