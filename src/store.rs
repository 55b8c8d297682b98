//! Ledger store: durable log plus in-memory indexes.

use crate::error::{LedgerError, Result};
use crate::records::{LedgerIndex, LedgerLog, LogEntry, Slot};
use crate::reorg::ConflictPolicy;
use crate::retry::RetryPolicy;
use crate::types::{
    BlockRange, ChainId, ChainSummary, Cursor, HashState, IndexKey, InteractionRecord,
    LedgerStats, Revision, RevisionKind, ScanFilter, Timestamp, TxHash,
};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Ledger configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Base directory for the ledger.
    pub path: PathBuf,

    /// Record cache size (number of records).
    pub record_cache_size: usize,

    /// Whether to create the ledger if it doesn't exist.
    pub create_if_missing: bool,

    /// fsync the log every N appends.
    pub sync_interval: u64,

    /// Retries after the first failed attempt at a log append.
    pub max_write_retries: u32,

    /// Initial retry backoff in milliseconds (doubles per retry).
    pub retry_backoff_ms: u64,

    /// Index keys fetched per lock acquisition during scans.
    pub scan_batch_size: usize,

    /// Number of per-hash write locks.
    pub lock_stripes: usize,

    /// Number of shards per index map.
    pub index_shards: usize,

    /// What to do when a hash shows up with different facts.
    pub conflict_policy: ConflictPolicy,

    /// Correction sources allowed to supersede under `AcceptTrustedCorrections`.
    pub trusted_sources: Vec<String>,

    /// Lowercase `0x`-prefixed identifiers before storing them.
    pub normalize_hex: bool,

    /// Maximum identifier length in bytes.
    pub max_identifier_len: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./ledger"),
            record_cache_size: 10_000,
            create_if_missing: true,
            sync_interval: LedgerLog::DEFAULT_SYNC_INTERVAL,
            max_write_retries: 3,
            retry_backoff_ms: 10,
            scan_batch_size: 256,
            lock_stripes: 256,
            index_shards: 64,
            conflict_policy: ConflictPolicy::Reject,
            trusted_sources: Vec::new(),
            normalize_hex: true,
            max_identifier_len: 256,
        }
    }
}

impl LedgerConfig {
    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| LedgerError::InvalidFormat(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_write_retries.saturating_add(1),
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

/// Result of [`LedgerStore::put_if_absent`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    AlreadyExists(InteractionRecord),
}

/// Result of [`LedgerStore::supersede`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupersedeOutcome {
    Superseded {
        previous: InteractionRecord,
        current: InteractionRecord,
        revision: u32,
    },
    /// The stored facts already equal the correction.
    Unchanged(InteractionRecord),
}

/// Result of [`LedgerStore::invalidate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvalidateOutcome {
    Invalidated {
        record: InteractionRecord,
        revision: u32,
    },
    AlreadyInvalidated,
}

/// Magic bytes for ledger manifest.
const LEDGER_MAGIC: &[u8; 4] = b"ILD\0";

/// Current ledger format version.
const LEDGER_VERSION: u8 = 1;

/// The ledger store.
///
/// Owns the lock file, the log, the indexes and the record cache. Writes to
/// one hash are serialized through a striped lock; writes to unrelated
/// hashes only meet at the log append.
pub struct LedgerStore {
    config: LedgerConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    log: LedgerLog,

    index: LedgerIndex,

    /// Records by log offset.
    cache: Mutex<LruCache<u64, Arc<InteractionRecord>>>,

    /// Per-hash write locks.
    stripes: Box<[Mutex<()>]>,
}

impl LedgerStore {
    /// Open an existing ledger or create a new one.
    pub fn open_or_create(config: LedgerConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(LedgerError::NotInitialized)
        }
    }

    /// Create a new ledger.
    pub fn create(config: LedgerConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let log = LedgerLog::open_with(
            config.path.join("ledger.log"),
            config.sync_interval,
            config.retry_policy(),
        )?;

        tracing::info!(path = %config.path.display(), "created ledger");
        Ok(Self::assemble(config, lock_file, log))
    }

    /// Open an existing ledger, rebuilding indexes from the log.
    pub fn open(config: LedgerConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let log = LedgerLog::open_with(
            config.path.join("ledger.log"),
            config.sync_interval,
            config.retry_policy(),
        )?;

        let store = Self::assemble(config, lock_file, log);
        let replayed = store.replay()?;

        tracing::info!(
            path = %store.config.path.display(),
            entries = replayed,
            hashes = store.index.count(),
            "opened ledger"
        );
        Ok(store)
    }

    fn assemble(config: LedgerConfig, lock_file: File, log: LedgerLog) -> Self {
        let cache_size = NonZeroUsize::new(config.record_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        let stripes = (0..config.lock_stripes.max(1))
            .map(|_| Mutex::new(()))
            .collect();
        let index = LedgerIndex::new(config.index_shards);

        Self {
            config,
            _lock_file: lock_file,
            log,
            index,
            cache: Mutex::new(LruCache::new(cache_size)),
            stripes,
        }
    }

    /// Rebuild the indexes from the log.
    fn replay(&self) -> Result<u64> {
        let mut entries = 0u64;
        for item in self.log.iter_from(0)? {
            let (offset, entry) = item?;
            let hash = entry.record.hash.clone();

            if let Some(previous) = self.index.get(&hash) {
                if previous.is_live() {
                    let old = self.log.read_at(previous.offset)?.record;
                    self.index.remove_secondary(&old);
                }
            }

            self.index.set(
                &hash,
                Slot {
                    offset,
                    block: entry.record.block,
                    revision: entry.revision,
                    kind: entry.kind,
                },
            );
            if entry.kind != RevisionKind::Invalidated {
                self.index.add_secondary(&entry.record);
            }
            entries += 1;
        }
        Ok(entries)
    }

    fn lock_hash(&self, hash: &TxHash) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        hash.hash(&mut hasher);
        let stripe = (hasher.finish() % self.stripes.len() as u64) as usize;
        self.stripes[stripe].lock()
    }

    /// Read the record stored at a log offset, through the cache.
    fn read_record(&self, offset: u64) -> Result<Arc<InteractionRecord>> {
        if let Some(record) = self.cache.lock().get(&offset) {
            return Ok(Arc::clone(record));
        }
        let record = Arc::new(self.log.read_at(offset)?.record);
        self.cache.lock().put(offset, Arc::clone(&record));
        Ok(record)
    }

    /// Append an entry and make it visible in the cache.
    fn write_entry(&self, entry: LogEntry) -> Result<(u64, Arc<InteractionRecord>)> {
        let offset = self.log.append(&entry)?;
        let record = Arc::new(entry.record);
        self.cache.lock().put(offset, Arc::clone(&record));
        Ok((offset, record))
    }

    // --- Record Operations ---

    /// Insert a record unless its hash is already present.
    ///
    /// Concurrent callers with the same hash have exactly one winner; the
    /// others get `AlreadyExists` with the winning record. A hash that was
    /// invalidated counts as absent and is committed again.
    pub fn put_if_absent(&self, record: InteractionRecord) -> Result<PutOutcome> {
        self.put_if_absent_with(record, |_| {})
    }

    /// [`put_if_absent`](Self::put_if_absent), running `on_commit` before the
    /// hash lock is released.
    pub(crate) fn put_if_absent_with(
        &self,
        record: InteractionRecord,
        on_commit: impl FnOnce(&InteractionRecord),
    ) -> Result<PutOutcome> {
        let _lock = self.lock_hash(&record.hash);

        let (revision, prev_offset) = match self.index.get(&record.hash) {
            Some(slot) if slot.is_live() => {
                let existing = self.read_record(slot.offset)?;
                return Ok(PutOutcome::AlreadyExists((*existing).clone()));
            }
            Some(slot) => (slot.revision + 1, Some(slot.offset)),
            None => (0, None),
        };

        let entry = LogEntry {
            revision,
            prev_offset,
            ..LogEntry::commit(record)
        };
        let (offset, record) = self.write_entry(entry)?;

        // Primary first: an index entry must never point at nothing.
        self.index.set(
            &record.hash,
            Slot {
                offset,
                block: record.block,
                revision,
                kind: RevisionKind::Committed,
            },
        );
        self.index.add_secondary(&record);

        tracing::debug!(hash = %record.hash, block = record.block, chain = %record.chain, revision, "committed");
        on_commit(&record);
        Ok(PutOutcome::Inserted)
    }

    /// Get the live record for a hash.
    pub fn get(&self, hash: &TxHash) -> Result<Option<InteractionRecord>> {
        match self.index.get(hash) {
            Some(slot) if slot.is_live() => Ok(Some((*self.read_record(slot.offset)?).clone())),
            _ => Ok(None),
        }
    }

    /// Lazily scan one grouping in `(block, hash)` order, resuming after `cursor`.
    pub fn scan(
        &self,
        filter: ScanFilter,
        range: BlockRange,
        cursor: Option<&Cursor>,
    ) -> Result<Scan<'_>> {
        if let Some(cursor) = cursor {
            cursor.check_scope(&filter)?;
        }

        let start = IndexKey::block_start(range.start);
        let lower = match cursor {
            Some(c) if c.last >= start => Bound::Excluded(c.last.clone()),
            _ => Bound::Included(start),
        };

        Ok(Scan {
            store: self,
            filter,
            end_block: range.end,
            lower,
            buffer: VecDeque::new(),
            exhausted: range.is_empty(),
            batch_size: self.config.scan_batch_size.max(1),
            last: None,
            yielded: HashSet::new(),
        })
    }

    /// Replace the facts for a live hash, moving its index entries atomically.
    pub fn supersede(&self, record: InteractionRecord, source: &str) -> Result<SupersedeOutcome> {
        self.supersede_with(record, source, |_| {})
    }

    /// [`supersede`](Self::supersede), running `on_change` under the hash lock
    /// once the new revision is visible.
    pub(crate) fn supersede_with(
        &self,
        record: InteractionRecord,
        source: &str,
        on_change: impl FnOnce(&SupersedeOutcome),
    ) -> Result<SupersedeOutcome> {
        let _lock = self.lock_hash(&record.hash);

        let slot = match self.index.get(&record.hash) {
            Some(slot) if slot.is_live() => slot,
            _ => return Err(LedgerError::RecordNotFound(record.hash)),
        };
        let previous = self.read_record(slot.offset)?;
        if *previous == record {
            return Ok(SupersedeOutcome::Unchanged(record));
        }

        let revision = slot.revision + 1;
        let entry = LogEntry {
            kind: RevisionKind::Superseded,
            revision,
            record,
            prev_offset: Some(slot.offset),
            source: Some(source.to_string()),
            timestamp: Timestamp::now(),
        };
        let (offset, record) = self.write_entry(entry)?;

        // New entries, then the primary swap, then old entries out. Readers
        // check every index hit against the primary, so they see one state.
        self.index.add_secondary_diff(&previous, &record);
        self.index.set(
            &record.hash,
            Slot {
                offset,
                block: record.block,
                revision,
                kind: RevisionKind::Superseded,
            },
        );
        self.index.remove_secondary_diff(&previous, &record);

        tracing::info!(
            hash = %record.hash,
            from_block = previous.block,
            to_block = record.block,
            revision,
            source,
            "superseded"
        );
        let outcome = SupersedeOutcome::Superseded {
            previous: (*previous).clone(),
            current: (*record).clone(),
            revision,
        };
        on_change(&outcome);
        Ok(outcome)
    }

    /// Withdraw a live record from reads and queries. The hash stays reserved.
    pub fn invalidate(&self, hash: &TxHash, source: &str) -> Result<InvalidateOutcome> {
        self.invalidate_with(hash, source, |_| {})
    }

    /// [`invalidate`](Self::invalidate), running `on_change` under the hash
    /// lock once the record is withdrawn.
    pub(crate) fn invalidate_with(
        &self,
        hash: &TxHash,
        source: &str,
        on_change: impl FnOnce(&InvalidateOutcome),
    ) -> Result<InvalidateOutcome> {
        let _lock = self.lock_hash(hash);

        let slot = self
            .index
            .get(hash)
            .ok_or_else(|| LedgerError::RecordNotFound(hash.clone()))?;
        if !slot.is_live() {
            return Ok(InvalidateOutcome::AlreadyInvalidated);
        }
        let previous = self.read_record(slot.offset)?;

        let revision = slot.revision + 1;
        let entry = LogEntry {
            kind: RevisionKind::Invalidated,
            revision,
            record: (*previous).clone(),
            prev_offset: Some(slot.offset),
            source: Some(source.to_string()),
            timestamp: Timestamp::now(),
        };
        let (offset, record) = self.write_entry(entry)?;

        self.index.set(
            hash,
            Slot {
                offset,
                block: record.block,
                revision,
                kind: RevisionKind::Invalidated,
            },
        );
        self.index.remove_secondary(&record);

        tracing::info!(hash = %hash, block = record.block, revision, source, "invalidated");
        let outcome = InvalidateOutcome::Invalidated {
            record: (*record).clone(),
            revision,
        };
        on_change(&outcome);
        Ok(outcome)
    }

    /// Where a hash is in its lifecycle.
    pub fn state(&self, hash: &TxHash) -> HashState {
        match self.index.get(hash) {
            None => HashState::Unseen,
            Some(slot) => match slot.kind {
                RevisionKind::Committed => HashState::Committed,
                RevisionKind::Superseded => HashState::Superseded {
                    revision: slot.revision,
                },
                RevisionKind::Invalidated => HashState::Invalidated {
                    revision: slot.revision,
                },
            },
        }
    }

    /// Every revision of a hash, oldest first.
    ///
    /// Walks the per-hash chain backwards through `prev_offset` links.
    pub fn history(&self, hash: &TxHash) -> Result<Vec<Revision>> {
        let mut revisions = Vec::new();
        let mut current = self.index.get(hash).map(|slot| slot.offset);

        while let Some(offset) = current {
            let entry = self.log.read_at(offset)?;
            if &entry.record.hash != hash {
                return Err(LedgerError::Corruption(format!(
                    "revision chain for {} reached {} at offset {}",
                    hash, entry.record.hash, offset
                )));
            }
            current = entry.prev_offset;
            revisions.push(Revision {
                revision: entry.revision,
                kind: entry.kind,
                record: entry.record,
                source: entry.source,
                timestamp: entry.timestamp,
            });
        }

        revisions.reverse();
        Ok(revisions)
    }

    // --- Ledger Operations ---

    /// Get ledger statistics.
    pub fn stats(&self) -> LedgerStats {
        let (live, superseded, invalidated) = self.index.counts();
        LedgerStats {
            record_count: live,
            superseded_count: superseded,
            invalidated_count: invalidated,
            chain_count: self.index.chain_count() as u64,
            log_size_bytes: self.log.size(),
        }
    }

    /// Record count and block span for one chain.
    pub fn chain_summary(&self, chain: &ChainId) -> ChainSummary {
        let (count, min_block, max_block) = self.index.chain_bounds(chain);
        ChainSummary {
            chain: chain.clone(),
            record_count: count as u64,
            min_block,
            max_block,
        }
    }

    /// Sync all data to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Get the ledger path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn log(&self) -> &LedgerLog {
        &self.log
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(LEDGER_MAGIC)?;
        file.write_all(&[LEDGER_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        if !manifest_path.exists() {
            return Err(LedgerError::NotInitialized);
        }
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != LEDGER_MAGIC {
            return Err(LedgerError::InvalidFormat("Invalid ledger magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != LEDGER_VERSION {
            return Err(LedgerError::InvalidFormat(format!(
                "Unsupported ledger version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| LedgerError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for LedgerStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

/// Lazy, restartable scan over one secondary index.
///
/// Index keys are copied out in batches under a short read lock; each key is
/// then checked against the primary slot, and stale keys (left behind by an
/// in-flight supersede or invalidation) are skipped. A hash is yielded at most
/// once per scan: if a supersede moves it past the scan position after its
/// old key was yielded, the new key is skipped.
pub struct Scan<'a> {
    store: &'a LedgerStore,
    filter: ScanFilter,
    end_block: u64,
    /// Next batch starts after this bound.
    lower: Bound<IndexKey>,
    buffer: VecDeque<IndexKey>,
    exhausted: bool,
    batch_size: usize,
    /// Last key actually yielded.
    last: Option<IndexKey>,
    /// Hashes yielded so far.
    yielded: HashSet<TxHash>,
}

impl<'a> Scan<'a> {
    /// Cursor positioned after the last record yielded so far.
    pub fn cursor(&self) -> Option<Cursor> {
        self.last
            .as_ref()
            .map(|key| Cursor::after(key.clone(), &self.filter))
    }

    pub fn filter(&self) -> &ScanFilter {
        &self.filter
    }

    fn refill(&mut self) {
        let keys = self.store.index.scan_keys(
            &self.filter,
            self.lower.clone(),
            self.end_block,
            self.batch_size,
        );
        if keys.len() < self.batch_size {
            self.exhausted = true;
        }
        if let Some(last) = keys.last() {
            self.lower = Bound::Excluded(last.clone());
        }
        self.buffer.extend(keys);
    }

    fn resolve(&self, key: &IndexKey) -> Result<Option<InteractionRecord>> {
        let slot = match self.store.index.get(&key.hash) {
            Some(slot) if slot.is_live() && slot.block == key.block => slot,
            _ => return Ok(None),
        };
        let record = self.store.read_record(slot.offset)?;
        if record.block == key.block && self.filter.matches(&record) {
            Ok(Some((*record).clone()))
        } else {
            Ok(None)
        }
    }
}

impl<'a> Iterator for Scan<'a> {
    type Item = Result<InteractionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.buffer.is_empty() {
                if self.exhausted {
                    return None;
                }
                self.refill();
                continue;
            }

            let key = self.buffer.pop_front()?;
            match self.resolve(&key) {
                Ok(Some(record)) => {
                    if !self.yielded.insert(record.hash.clone()) {
                        continue;
                    }
                    self.last = Some(key);
                    return Some(Ok(record));
                }
                Ok(None) => continue,
                Err(e) => {
                    // Stop iteration on error
                    self.exhausted = true;
                    self.buffer.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> LedgerConfig {
        LedgerConfig {
            path: dir.path().join("ledger"),
            record_cache_size: 100,
            scan_batch_size: 2,
            ..Default::default()
        }
    }

    fn record(hash: &str, block: u64) -> InteractionRecord {
        InteractionRecord::new(hash, block, "0xaaa", "0xccc", "eth")
    }

    #[test]
    fn test_create_store() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::create(test_config(&dir)).unwrap();

        assert!(store.path().join("MANIFEST").exists());
        assert!(store.path().join("ledger.log").exists());
    }

    #[test]
    fn test_put_if_absent_and_get() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::create(test_config(&dir)).unwrap();

        let r = record("0xabc", 100);
        assert_eq!(store.put_if_absent(r.clone()).unwrap(), PutOutcome::Inserted);
        assert_eq!(
            store.put_if_absent(record("0xabc", 999)).unwrap(),
            PutOutcome::AlreadyExists(r.clone())
        );
        assert_eq!(store.get(&TxHash::from("0xabc")).unwrap(), Some(r));
        assert_eq!(store.get(&TxHash::from("0xdef")).unwrap(), None);
    }

    #[test]
    fn test_scan_crosses_batches() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::create(test_config(&dir)).unwrap();

        for i in 0..7u64 {
            store.put_if_absent(record(&format!("0x{i}"), i * 10)).unwrap();
        }

        let blocks: Vec<u64> = store
            .scan(ScanFilter::contract("eth", "0xccc"), BlockRange::new(5, 45), None)
            .unwrap()
            .map(|r| r.unwrap().block)
            .collect();
        assert_eq!(blocks, vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_scan_cursor_resumes() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::create(test_config(&dir)).unwrap();

        for i in 0..5u64 {
            store.put_if_absent(record(&format!("0x{i}"), i)).unwrap();
        }

        let filter = ScanFilter::chain("eth");
        let mut scan = store.scan(filter.clone(), BlockRange::all(), None).unwrap();
        assert_eq!(scan.next().unwrap().unwrap().block, 0);
        assert_eq!(scan.next().unwrap().unwrap().block, 1);
        let cursor = scan.cursor().unwrap();
        drop(scan);

        let rest: Vec<u64> = store
            .scan(filter, BlockRange::all(), Some(&cursor))
            .unwrap()
            .map(|r| r.unwrap().block)
            .collect();
        assert_eq!(rest, vec![2, 3, 4]);
    }

    #[test]
    fn test_supersede_moves_index_entries() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::create(test_config(&dir)).unwrap();

        store.put_if_absent(record("0xabc", 100)).unwrap();
        let outcome = store.supersede(record("0xabc", 200), "reorg-feed").unwrap();
        assert!(matches!(
            outcome,
            SupersedeOutcome::Superseded { revision: 1, .. }
        ));

        let filter = ScanFilter::contract("eth", "0xccc");
        let old: Vec<_> = store
            .scan(filter.clone(), BlockRange::new(0, 150), None)
            .unwrap()
            .collect();
        assert!(old.is_empty());
        let new: Vec<_> = store
            .scan(filter, BlockRange::new(150, 250), None)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(new, vec![record("0xabc", 200)]);
        assert_eq!(
            store.state(&TxHash::from("0xabc")),
            HashState::Superseded { revision: 1 }
        );
    }

    #[test]
    fn test_scan_yields_each_hash_once_across_supersede() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::create(LedgerConfig {
            scan_batch_size: 1,
            ..test_config(&dir)
        })
        .unwrap();

        store.put_if_absent(record("0xflip", 10)).unwrap();
        store.put_if_absent(record("0xother", 15)).unwrap();

        let mut scan = store
            .scan(ScanFilter::contract("eth", "0xccc"), BlockRange::all(), None)
            .unwrap();
        let first = scan.next().unwrap().unwrap();
        assert_eq!(first, record("0xflip", 10));

        // Moves 0xflip ahead of the scan position.
        store.supersede(record("0xflip", 20), "ops").unwrap();

        let rest: Vec<_> = scan.map(|r| r.unwrap()).collect();
        assert_eq!(rest, vec![record("0xother", 15)]);
    }

    #[test]
    fn test_change_hooks_run_under_hash_lock() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::create(test_config(&dir)).unwrap();
        let held = |store: &LedgerStore| store.stripes.iter().any(|s| s.is_locked());

        let mut calls = 0;
        store
            .put_if_absent_with(record("0xabc", 1), |r| {
                assert_eq!(r.block, 1);
                assert!(held(&store));
                calls += 1;
            })
            .unwrap();
        store
            .supersede_with(record("0xabc", 2), "ops", |outcome| {
                assert!(matches!(outcome, SupersedeOutcome::Superseded { revision: 1, .. }));
                assert!(held(&store));
                calls += 1;
            })
            .unwrap();
        store
            .invalidate_with(&TxHash::from("0xabc"), "ops", |_| {
                assert!(held(&store));
                calls += 1;
            })
            .unwrap();
        assert_eq!(calls, 3);
        assert!(!held(&store));

        // Losing a put runs no hook.
        store.put_if_absent(record("0xdef", 1)).unwrap();
        store
            .put_if_absent_with(record("0xdef", 9), |_| panic!("not committed"))
            .unwrap();
    }

    #[test]
    fn test_failed_sync_leaves_hash_absent() {
        let dir = TempDir::new().unwrap();
        let config = LedgerConfig {
            sync_interval: 1,
            ..test_config(&dir)
        };
        let hash = TxHash::from("0xabc");

        {
            let store = LedgerStore::create(config.clone()).unwrap();
            store
                .log()
                .faults
                .syncs
                .store(1, std::sync::atomic::Ordering::SeqCst);
            assert!(store.put_if_absent(record("0xabc", 100)).is_err());
            assert_eq!(store.get(&hash).unwrap(), None);

            assert_eq!(
                store.put_if_absent(record("0xabc", 100)).unwrap(),
                PutOutcome::Inserted
            );
        }

        let store = LedgerStore::open(config).unwrap();
        let history = store.history(&hash).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].revision, 0);
        assert_eq!(store.stats().record_count, 1);
    }

    #[test]
    fn test_supersede_unknown_hash() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::create(test_config(&dir)).unwrap();

        assert!(matches!(
            store.supersede(record("0xabc", 1), "ops"),
            Err(LedgerError::RecordNotFound(_))
        ));
    }

    #[test]
    fn test_invalidate_and_recommit() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::create(test_config(&dir)).unwrap();
        let hash = TxHash::from("0xabc");

        store.put_if_absent(record("0xabc", 100)).unwrap();
        assert!(matches!(
            store.invalidate(&hash, "reorg-feed").unwrap(),
            InvalidateOutcome::Invalidated { revision: 1, .. }
        ));
        assert_eq!(
            store.invalidate(&hash, "reorg-feed").unwrap(),
            InvalidateOutcome::AlreadyInvalidated
        );
        assert_eq!(store.get(&hash).unwrap(), None);
        assert_eq!(store.state(&hash), HashState::Invalidated { revision: 1 });

        assert_eq!(
            store.put_if_absent(record("0xabc", 105)).unwrap(),
            PutOutcome::Inserted
        );
        assert_eq!(store.state(&hash), HashState::Committed);

        let history = store.history(&hash).unwrap();
        let kinds: Vec<_> = history.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RevisionKind::Committed,
                RevisionKind::Invalidated,
                RevisionKind::Committed
            ]
        );
        assert_eq!(history[2].revision, 2);
        assert_eq!(history[2].record.block, 105);
    }

    #[test]
    fn test_persistence_rebuilds_indexes() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        {
            let store = LedgerStore::create(config.clone()).unwrap();
            store.put_if_absent(record("0x1", 10)).unwrap();
            store.put_if_absent(record("0x2", 20)).unwrap();
            store.put_if_absent(record("0x3", 30)).unwrap();
            store.supersede(record("0x2", 25), "ops").unwrap();
            store.invalidate(&TxHash::from("0x3"), "ops").unwrap();
        }

        let store = LedgerStore::open(config).unwrap();
        let blocks: Vec<u64> = store
            .scan(ScanFilter::address("eth", "0xaaa"), BlockRange::all(), None)
            .unwrap()
            .map(|r| r.unwrap().block)
            .collect();
        assert_eq!(blocks, vec![10, 25]);

        let stats = store.stats();
        assert_eq!(stats.record_count, 2);
        assert_eq!(stats.superseded_count, 1);
        assert_eq!(stats.invalidated_count, 1);
        assert_eq!(stats.chain_count, 1);
    }

    #[test]
    fn test_store_lock() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let _store = LedgerStore::create(config.clone()).unwrap();

        assert!(matches!(
            LedgerStore::open(config),
            Err(LedgerError::Locked)
        ));
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = TempDir::new().unwrap();
        let config = LedgerConfig {
            create_if_missing: false,
            ..test_config(&dir)
        };
        assert!(matches!(
            LedgerStore::open_or_create(config),
            Err(LedgerError::NotInitialized)
        ));
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config = LedgerConfig::from_json_str(
            r#"{"path": "/tmp/ledger", "conflict_policy": "accept_trusted_corrections", "trusted_sources": ["reorg-feed"]}"#,
        )
        .unwrap();
        assert_eq!(config.path, PathBuf::from("/tmp/ledger"));
        assert_eq!(config.conflict_policy, ConflictPolicy::AcceptTrustedCorrections);
        assert_eq!(config.scan_batch_size, 256);
        assert_eq!(config.retry_policy().max_attempts, 4);
    }

    #[test]
    fn test_chain_summary() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::create(test_config(&dir)).unwrap();

        store.put_if_absent(record("0x1", 42)).unwrap();
        store.put_if_absent(record("0x2", 7)).unwrap();

        let summary = store.chain_summary(&ChainId::from("eth"));
        assert_eq!(summary.record_count, 2);
        assert_eq!(summary.min_block, Some(7));
        assert_eq!(summary.max_block, Some(42));
    }
}
