//! Append-only ledger log.
//!
//! Every mutation of the ledger is one frame:
//!
//! ```text
//! magic(4) | version(1) | kind(1) | payload_len(4, LE) | payload | crc32(4, LE)
//! ```
//!
//! The payload is a MessagePack-encoded [`LogEntry`]; the checksum covers the
//! payload. A frame is written with a single `write_all`, and a failed append
//! truncates the file back to where it started.

use crate::error::{LedgerError, Result};
use crate::retry::{with_retries, RetryPolicy};
use crate::types::{InteractionRecord, RevisionKind, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(test)]
use std::sync::atomic::AtomicU32;

/// Magic bytes for ledger frames.
const LOG_MAGIC: &[u8; 4] = b"ILG\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// magic + version + kind + payload length
const FRAME_HEADER_SIZE: u64 = 4 + 1 + 1 + 4;

const FRAME_TRAILER_SIZE: u64 = 4;

/// Sanity bound on a single entry.
const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// One durable change to a hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub kind: RevisionKind,
    pub revision: u32,
    /// Facts after this change (for invalidations, the facts being withdrawn).
    pub record: InteractionRecord,
    /// Offset of the previous entry for the same hash.
    pub prev_offset: Option<u64>,
    pub source: Option<String>,
    pub timestamp: Timestamp,
}

impl LogEntry {
    pub fn commit(record: InteractionRecord) -> Self {
        Self {
            kind: RevisionKind::Committed,
            revision: 0,
            record,
            prev_offset: None,
            source: None,
            timestamp: Timestamp::now(),
        }
    }
}

fn kind_byte(kind: RevisionKind) -> u8 {
    match kind {
        RevisionKind::Committed => 1,
        RevisionKind::Superseded => 2,
        RevisionKind::Invalidated => 3,
    }
}

/// Why a frame could not be read.
enum FrameError {
    /// File ends inside the frame.
    Truncated,
    /// Checksum failed; `end` is where the frame claims to stop.
    Checksum { expected: u32, got: u32, end: u64 },
    Other(LedgerError),
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Other(LedgerError::Io(e))
        }
    }
}

impl From<FrameError> for LedgerError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Truncated => LedgerError::Corruption("truncated log frame".into()),
            FrameError::Checksum { expected, got, .. } => {
                LedgerError::ChecksumMismatch { expected, got }
            }
            FrameError::Other(e) => e,
        }
    }
}

/// Injected I/O failures, counted down one per attempt.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct Faults {
    /// Frame writes that fail with `TimedOut`.
    pub(crate) writes: AtomicU32,
    /// Periodic syncs that fail.
    pub(crate) syncs: AtomicU32,
}

#[cfg(test)]
impl Faults {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn write(&self) -> io::Result<()> {
        if Self::take(&self.writes) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "injected write failure"));
        }
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        if Self::take(&self.syncs) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected sync failure"));
        }
        Ok(())
    }
}

struct LogWriter {
    file: File,
    /// Number of writes since last sync.
    writes_since_sync: u64,
}

/// Append-only ledger log.
pub struct LedgerLog {
    path: PathBuf,

    writer: Mutex<LogWriter>,

    /// Separate handle so reads never wait on an in-flight append.
    reader: Mutex<File>,

    /// End of the last fully written frame.
    size: AtomicU64,

    /// Sync every N writes.
    sync_interval: u64,

    retry: RetryPolicy,

    #[cfg(test)]
    pub(crate) faults: Faults,
}

impl LedgerLog {
    /// Default sync interval.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a log with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, Self::DEFAULT_SYNC_INTERVAL, RetryPolicy::default())
    }

    /// Open or create a log.
    ///
    /// A torn frame at the tail (left by a crash mid-append) is truncated.
    /// A bad frame followed by more data is reported as corruption.
    pub fn open_with(
        path: impl AsRef<Path>,
        sync_interval: u64,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let valid_end = Self::recover(&file, file_size)?;

        if valid_end < file_size {
            tracing::warn!(
                path = %path.display(),
                valid_end,
                file_size,
                "truncating torn tail of ledger log"
            );
            file.set_len(valid_end)?;
            file.sync_all()?;
        }

        let reader = File::open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(LogWriter {
                file,
                writes_since_sync: 0,
            }),
            reader: Mutex::new(reader),
            size: AtomicU64::new(valid_end),
            sync_interval: sync_interval.max(1),
            retry,
            #[cfg(test)]
            faults: Faults::default(),
        })
    }

    /// Append an entry, returning the offset it was written at.
    ///
    /// The frame becomes part of the log only if this returns `Ok`. When the
    /// periodic sync that falls on this append fails, the frame is cut off
    /// again and the error returned; earlier unsynced frames stay pending.
    pub fn append(&self, entry: &LogEntry) -> Result<u64> {
        let frame = encode_frame(entry)?;

        let mut writer = self.writer.lock();
        let offset = self.size.load(Ordering::Acquire);

        with_retries(&self.retry, "ledger append", || {
            #[cfg(test)]
            self.faults.write()?;
            let result = writer
                .file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| writer.file.write_all(&frame));
            if result.is_err() {
                // Never leave a partial frame behind.
                let _ = writer.file.set_len(offset);
            }
            result
        })?;

        if writer.writes_since_sync + 1 >= self.sync_interval {
            let synced = writer.file.sync_data();
            #[cfg(test)]
            let synced = synced.and_then(|_| self.faults.sync());
            if let Err(e) = synced {
                tracing::warn!(offset, error = %e, "log sync failed, dropping appended frame");
                writer.file.set_len(offset)?;
                return Err(LedgerError::Io(e));
            }
            writer.writes_since_sync = 0;
        } else {
            writer.writes_since_sync += 1;
        }

        self.size
            .store(offset + frame.len() as u64, Ordering::Release);
        Ok(offset)
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.file.sync_all()?;
        writer.writes_since_sync = 0;
        Ok(())
    }

    /// Read the entry at a given offset.
    pub fn read_at(&self, offset: u64) -> Result<LogEntry> {
        if offset >= self.size() {
            return Err(LedgerError::Corruption(format!(
                "offset {} past end of log",
                offset
            )));
        }
        let mut file = self.reader.lock();
        file.seek(SeekFrom::Start(offset))?;
        let (entry, _) = read_frame(&mut *file, offset)?;
        Ok(entry)
    }

    /// Iterate all entries from a given offset.
    pub fn iter_from(&self, offset: u64) -> Result<LogIterator> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(LogIterator {
            reader: BufReader::new(file),
            offset,
            end: self.size(),
        })
    }

    /// Current size of the valid log.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Walk the log and return the end of the last intact frame.
    fn recover(file: &File, file_size: u64) -> Result<u64> {
        let mut file = file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);
        let mut offset = 0u64;

        while offset < file_size {
            match read_frame(&mut reader, offset) {
                Ok((_, next)) => offset = next,
                Err(FrameError::Truncated) => break,
                Err(FrameError::Checksum { end, .. }) if end >= file_size => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(offset)
    }
}

/// Iterator over `(offset, entry)` pairs.
pub struct LogIterator {
    reader: BufReader<File>,
    offset: u64,
    end: u64,
}

impl Iterator for LogIterator {
    type Item = Result<(u64, LogEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }

        let current = self.offset;
        match read_frame(&mut self.reader, current) {
            Ok((entry, next)) => {
                self.offset = next;
                Some(Ok((current, entry)))
            }
            Err(e) => {
                self.offset = self.end; // Stop iteration on error
                Some(Err(e.into()))
            }
        }
    }
}

fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec(entry)?;
    if payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(LedgerError::Serialization(format!(
            "log entry too large: {} bytes",
            payload.len()
        )));
    }

    let mut frame =
        Vec::with_capacity((FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE) as usize + payload.len());
    frame.extend_from_slice(LOG_MAGIC);
    frame.push(LOG_VERSION);
    frame.push(kind_byte(entry.kind));
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(frame)
}

/// Read one frame starting at `offset`; returns the entry and the next offset.
fn read_frame(reader: &mut impl Read, offset: u64) -> std::result::Result<(LogEntry, u64), FrameError> {
    let mut header = [0u8; FRAME_HEADER_SIZE as usize];
    reader.read_exact(&mut header)?;

    if &header[0..4] != LOG_MAGIC {
        return Err(FrameError::Other(LedgerError::Corruption(format!(
            "invalid frame magic at offset {}",
            offset
        ))));
    }
    if header[4] != LOG_VERSION {
        return Err(FrameError::Other(LedgerError::InvalidFormat(format!(
            "Unsupported log version: {}",
            header[4]
        ))));
    }

    let kind = header[5];
    let payload_len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]);
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(FrameError::Other(LedgerError::Corruption(format!(
            "frame at offset {} claims {} bytes",
            offset, payload_len
        ))));
    }

    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;

    let end = offset + FRAME_HEADER_SIZE + payload_len as u64 + FRAME_TRAILER_SIZE;
    let stored_checksum = u32::from_le_bytes(checksum_bytes);
    let computed_checksum = crc32fast::hash(&payload);
    if stored_checksum != computed_checksum {
        return Err(FrameError::Checksum {
            expected: stored_checksum,
            got: computed_checksum,
            end,
        });
    }

    let entry: LogEntry = rmp_serde::from_slice(&payload)
        .map_err(|e| FrameError::Other(LedgerError::from(e)))?;

    if kind_byte(entry.kind) != kind {
        return Err(FrameError::Other(LedgerError::Corruption(format!(
            "frame kind {} does not match entry at offset {}",
            kind, offset
        ))));
    }

    Ok((entry, end))
}
