//! Write-ahead log for transaction commits.
//!
//! A transaction is durable once its WAL entry is synced. The entry holds
//! everything needed to redo the commit: the change rows, the snapshot
//! bytes they reference and the untracked overlay. Entries are marked
//! applied once the change log and snapshot files are written; anything
//! still pending on open is rolled forward by the store.

use crate::error::{Result, StoreError};
use crate::types::{Change, SnapshotId, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const WAL_MAGIC: &[u8; 4] = b"BWAL";

const WAL_VERSION: u8 = 1;

const HEADER_LEN: u64 = 5;

/// Entries larger than this are treated as corruption.
const MAX_ENTRY_LEN: usize = 256 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntryStatus {
    /// Synced but not yet applied to the change log.
    Pending,
    /// Marker: the entry with the same sequence number was applied.
    Applied,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalEntry {
    pub seq: u64,
    pub status: WalEntryStatus,
    pub operation: WalOperation,
    pub timestamp: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WalOperation {
    /// A committed transaction.
    Commit {
        /// Change log size before the transaction's rows are appended.
        log_offset: u64,
        changes: Vec<Change>,
        /// Canonical bytes of every snapshot first written by the transaction.
        snapshots: Vec<(SnapshotId, Vec<u8>)>,
        /// Serialized untracked overlay after the transaction.
        untracked: Vec<u8>,
    },
    /// Written alongside an `Applied` marker.
    Marker,
}

pub struct WriteAheadLog {
    path: PathBuf,
    next_seq: Mutex<u64>,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl WriteAheadLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let next_seq = if path.exists() {
            let mut reader = Self::reader(&path)?;
            let mut max_seq = 0u64;
            while let Ok(entry) = Self::read_entry(&mut reader) {
                max_seq = max_seq.max(entry.seq);
            }
            max_seq + 1
        } else {
            Self::write_header(&path)?;
            1
        };

        let writer = BufWriter::new(OpenOptions::new().append(true).open(&path)?);
        debug!(path = %path.display(), next_seq, "opened write-ahead log");

        Ok(Self {
            path,
            next_seq: Mutex::new(next_seq),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Append and sync an entry. Returns its sequence number.
    pub fn log(&self, operation: WalOperation) -> Result<u64> {
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;

        self.write(&WalEntry {
            seq,
            status: WalEntryStatus::Pending,
            operation,
            timestamp: Timestamp::now(),
        })?;

        *next_seq += 1;
        Ok(seq)
    }

    /// Record that the entry `seq` reached the change log.
    pub fn mark_applied(&self, seq: u64) -> Result<()> {
        self.write(&WalEntry {
            seq,
            status: WalEntryStatus::Applied,
            operation: WalOperation::Marker,
            timestamp: Timestamp::now(),
        })
    }

    /// Entries without an applied marker, in sequence order.
    ///
    /// Reading stops at the first torn or corrupt entry.
    pub fn pending_entries(&self) -> Result<Vec<WalEntry>> {
        let mut reader = Self::reader(&self.path)?;
        let mut pending = BTreeMap::new();
        let mut applied = HashSet::new();

        loop {
            match Self::read_entry(&mut reader) {
                Ok(entry) => match entry.status {
                    WalEntryStatus::Applied => {
                        applied.insert(entry.seq);
                    }
                    WalEntryStatus::Pending => {
                        pending.insert(entry.seq, entry);
                    }
                },
                Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "ignoring unreadable WAL tail");
                    break;
                }
            }
        }

        Ok(pending
            .into_iter()
            .filter(|(seq, _)| !applied.contains(seq))
            .map(|(_, entry)| entry)
            .collect())
    }

    pub fn has_pending(&self) -> Result<bool> {
        Ok(!self.pending_entries()?.is_empty())
    }

    /// Truncate the log back to its header.
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        *writer = None;

        Self::write_header(&self.path)?;
        *writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(&self.path)?,
        ));
        *self.next_seq.lock() = 1;

        Ok(())
    }

    fn write(&self, entry: &WalEntry) -> Result<()> {
        let mut writer = self.writer.lock();
        let w = writer
            .as_mut()
            .ok_or_else(|| StoreError::Transaction("write-ahead log is closed".into()))?;

        Self::write_entry(w, entry)?;
        w.flush()?;
        w.get_ref().sync_all()?;
        Ok(())
    }

    fn write_header(path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(WAL_MAGIC)?;
        file.write_all(&[WAL_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn reader(path: &Path) -> Result<BufReader<File>> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != WAL_MAGIC {
            return Err(StoreError::InvalidFormat("invalid WAL magic".into()));
        }
        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != WAL_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "unsupported WAL version: {}",
                version[0]
            )));
        }

        file.seek(SeekFrom::Start(HEADER_LEN))?;
        Ok(BufReader::new(file))
    }

    fn write_entry(writer: &mut BufWriter<File>, entry: &WalEntry) -> Result<()> {
        let encoded = rmp_serde::to_vec(entry)?;

        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        Ok(())
    }

    fn read_entry(reader: &mut BufReader<File>) -> Result<WalEntry> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_ENTRY_LEN {
            return Err(StoreError::Corruption("WAL entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(StoreError::ChecksumMismatch { expected, got });
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }
}
