//! Append-only change log file.

use crate::error::{Result, StoreError};
use crate::types::Change;
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for change frames.
const FRAME_MAGIC: &[u8; 4] = b"CHG\0";

/// Current frame format version.
const FRAME_VERSION: u8 = 1;

/// Frame header size: magic + version + body length.
const FRAME_HEADER_SIZE: usize = 4 + 1 + 4;

/// Trailing checksum size.
const FRAME_CHECKSUM_SIZE: usize = 4;

/// Append-only change log.
///
/// Each frame is `magic | version | len (u32 LE) | MessagePack(Change) | crc32 (u32 LE)`.
pub struct ChangeLog {
    /// Path to the log file.
    path: PathBuf,

    /// Log file handle.
    file: File,

    /// Current file size (next append offset).
    size: u64,

    /// Appends since last sync.
    writes_since_sync: u64,

    /// Sync every N appends (0 behaves like 1).
    sync_interval: u64,
}

impl ChangeLog {
    /// Default sync interval.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a change log.
    pub fn open(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            file,
            size,
            writes_since_sync: 0,
            sync_interval: sync_interval.max(1),
        })
    }

    /// Read every change in the log.
    ///
    /// A torn frame at the tail (from a crash mid-append) is cut off. A bad
    /// frame followed by more data is reported as corruption.
    pub fn read_all(&mut self) -> Result<Vec<Change>> {
        if self.size == 0 {
            return Ok(Vec::new());
        }

        // SAFETY: the store holds an exclusive lock on its directory, so the file
        // is not modified by another process while mapped.
        let map = unsafe { Mmap::map(&self.file)? };
        let data = &map[..];

        let mut changes = Vec::new();
        let mut offset = 0usize;

        while offset < data.len() {
            match decode_frame(&data[offset..]) {
                Ok((change, frame_len)) => {
                    changes.push(change);
                    offset += frame_len;
                }
                Err(FrameError::Truncated) => break,
                Err(FrameError::Invalid(reason)) => {
                    let rest = data.len() - offset;
                    if rest > frame_span(&data[offset..]).unwrap_or(rest) {
                        return Err(StoreError::Corruption(format!(
                            "change log frame at offset {} is invalid: {}",
                            offset, reason
                        )));
                    }
                    break;
                }
            }
        }

        drop(map);

        if (offset as u64) < self.size {
            warn!(
                path = %self.path.display(),
                valid = offset,
                size = self.size,
                "truncating torn tail of change log"
            );
            self.truncate(offset as u64)?;
        }

        debug!(changes = changes.len(), "read change log");
        Ok(changes)
    }

    /// Append changes and return the offset of the first frame.
    pub fn append(&mut self, changes: &[Change]) -> Result<u64> {
        let offset = self.size;
        if changes.is_empty() {
            return Ok(offset);
        }

        let mut buf = Vec::new();
        for change in changes {
            encode_frame(change, &mut buf)?;
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf)?;
        self.size += buf.len() as u64;

        self.writes_since_sync += changes.len() as u64;
        if self.writes_since_sync >= self.sync_interval {
            self.sync()?;
        }

        Ok(offset)
    }

    /// Cut the log back to `len` bytes.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.file.sync_all()?;
        self.size = len;
        Ok(())
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        self.writes_since_sync = 0;
        Ok(())
    }

    /// Current log size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

enum FrameError {
    Truncated,
    Invalid(String),
}

fn encode_frame(change: &Change, buf: &mut Vec<u8>) -> Result<()> {
    let body = rmp_serde::to_vec(change)?;

    buf.extend_from_slice(FRAME_MAGIC);
    buf.push(FRAME_VERSION);
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());

    Ok(())
}

/// Total length a frame claims to occupy, if its header is readable.
fn frame_span(data: &[u8]) -> Option<usize> {
    if data.len() < FRAME_HEADER_SIZE {
        return None;
    }
    let len = u32::from_le_bytes([data[5], data[6], data[7], data[8]]) as usize;
    Some(FRAME_HEADER_SIZE + len + FRAME_CHECKSUM_SIZE)
}

fn decode_frame(data: &[u8]) -> std::result::Result<(Change, usize), FrameError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err(FrameError::Truncated);
    }
    if &data[0..4] != FRAME_MAGIC {
        return Err(FrameError::Invalid("bad magic".into()));
    }
    if data[4] != FRAME_VERSION {
        return Err(FrameError::Invalid(format!("unsupported version {}", data[4])));
    }

    let span = frame_span(data).ok_or(FrameError::Truncated)?;
    if data.len() < span {
        return Err(FrameError::Truncated);
    }

    let body = &data[FRAME_HEADER_SIZE..span - FRAME_CHECKSUM_SIZE];
    let stored = u32::from_le_bytes([
        data[span - 4],
        data[span - 3],
        data[span - 2],
        data[span - 1],
    ]);
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(FrameError::Invalid(format!(
            "checksum mismatch: expected {}, got {}",
            stored, computed
        )));
    }

    let change: Change =
        rmp_serde::from_slice(body).map_err(|e| FrameError::Invalid(e.to_string()))?;
    Ok((change, span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeId, SnapshotId, Timestamp};
    use std::fs;
    use tempfile::TempDir;

    fn change(id: u64) -> Change {
        Change {
            id: ChangeId(id),
            entity_id: format!("e{}", id),
            schema_key: "note".into(),
            schema_version: "1.0".into(),
            file_id: "f".into(),
            plugin_key: "json".into(),
            snapshot_id: SnapshotId::from_bytes(format!("{}", id).as_bytes()),
            created_at: Timestamp(id as i64),
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let mut log = ChangeLog::open(dir.path().join("changes.log"), 1).unwrap();

        let offset = log.append(&[change(1), change(2)]).unwrap();
        assert_eq!(offset, 0);

        let read = log.read_all().unwrap();
        assert_eq!(read, vec![change(1), change(2)]);
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("changes.log");

        {
            let mut log = ChangeLog::open(&path, 100).unwrap();
            for i in 1..=5 {
                log.append(&[change(i)]).unwrap();
            }
            log.sync().unwrap();
        }

        let mut log = ChangeLog::open(&path, 100).unwrap();
        assert_eq!(log.read_all().unwrap().len(), 5);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("changes.log");

        let full_size = {
            let mut log = ChangeLog::open(&path, 1).unwrap();
            log.append(&[change(1), change(2)]).unwrap();
            log.size()
        };

        // Chop a few bytes off the last frame.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_size - 3).unwrap();
        drop(file);

        let mut log = ChangeLog::open(&path, 1).unwrap();
        let read = log.read_all().unwrap();
        assert_eq!(read, vec![change(1)]);
        assert!(log.size() < full_size - 3);
        assert_eq!(fs::metadata(&path).unwrap().len(), log.size());
    }

    #[test]
    fn test_corrupt_middle_frame_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("changes.log");

        {
            let mut log = ChangeLog::open(&path, 1).unwrap();
            log.append(&[change(1), change(2), change(3)]).unwrap();
        }

        let mut bytes = fs::read(&path).unwrap();
        bytes[FRAME_HEADER_SIZE + 2] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let mut log = ChangeLog::open(&path, 1).unwrap();
        assert!(matches!(log.read_all(), Err(StoreError::Corruption(_))));
    }

    #[test]
    fn test_truncate() {
        let dir = TempDir::new().unwrap();
        let mut log = ChangeLog::open(dir.path().join("changes.log"), 1).unwrap();

        log.append(&[change(1)]).unwrap();
        let mark = log.size();
        log.append(&[change(2)]).unwrap();
        log.truncate(mark).unwrap();

        assert_eq!(log.read_all().unwrap(), vec![change(1)]);
    }
}
