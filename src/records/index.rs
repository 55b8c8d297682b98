//! In-memory indexes over the ledger log.
//!
//! The primary index maps a hash to its [`Slot`]. Three secondary indexes
//! keep `(block, hash)` keys ordered within a grouping: `(chain, contract)`,
//! `(chain, address)` and `chain`. Every map is split into independently
//! locked shards.

use crate::types::{ChainId, IndexKey, InteractionRecord, RevisionKind, ScanFilter, TxHash};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::ops::Bound;

/// Where the current facts for a hash live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    /// Offset of the latest log entry for the hash.
    pub offset: u64,
    pub block: u64,
    pub revision: u32,
    pub kind: RevisionKind,
}

impl Slot {
    pub fn is_live(&self) -> bool {
        self.kind != RevisionKind::Invalidated
    }
}

fn shard_of<K: Hash + ?Sized>(key: &K, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// Ordered `(block, hash)` keys per grouping.
struct GroupIndex<K> {
    shards: Box<[RwLock<HashMap<K, BTreeSet<IndexKey>>>]>,
}

impl<K: Hash + Eq + Clone> GroupIndex<K> {
    fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, group: &K) -> &RwLock<HashMap<K, BTreeSet<IndexKey>>> {
        &self.shards[shard_of(group, self.shards.len())]
    }

    fn insert(&self, group: K, key: IndexKey) {
        self.shard(&group).write().entry(group).or_default().insert(key);
    }

    fn remove(&self, group: &K, key: &IndexKey) {
        let mut shard = self.shard(group).write();
        if let Some(keys) = shard.get_mut(group) {
            keys.remove(key);
            if keys.is_empty() {
                shard.remove(group);
            }
        }
    }

    /// Up to `max` keys after `lower`, stopping past `end_block`.
    fn range(&self, group: &K, lower: Bound<IndexKey>, end_block: u64, max: usize) -> Vec<IndexKey> {
        let shard = self.shard(group).read();
        match shard.get(group) {
            Some(keys) => keys
                .range((lower, Bound::Unbounded))
                .take_while(|k| k.block <= end_block)
                .take(max)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// `(count, first, last)` for one grouping.
    fn bounds(&self, group: &K) -> (usize, Option<u64>, Option<u64>) {
        let shard = self.shard(group).read();
        match shard.get(group) {
            Some(keys) => (
                keys.len(),
                keys.first().map(|k| k.block),
                keys.last().map(|k| k.block),
            ),
            None => (0, None, None),
        }
    }

    fn group_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }
}

type PairKey = (ChainId, String);

/// Primary and secondary indexes.
pub struct LedgerIndex {
    primary: Box<[RwLock<HashMap<TxHash, Slot>>]>,
    by_contract: GroupIndex<PairKey>,
    by_address: GroupIndex<PairKey>,
    by_chain: GroupIndex<ChainId>,
}

impl LedgerIndex {
    /// Create empty indexes with `shards` locks per map.
    pub fn new(shards: usize) -> Self {
        Self {
            primary: (0..shards.max(1))
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            by_contract: GroupIndex::new(shards),
            by_address: GroupIndex::new(shards),
            by_chain: GroupIndex::new(shards),
        }
    }

    fn primary_shard(&self, hash: &TxHash) -> &RwLock<HashMap<TxHash, Slot>> {
        &self.primary[shard_of(hash, self.primary.len())]
    }

    /// Get the slot for a hash.
    pub fn get(&self, hash: &TxHash) -> Option<Slot> {
        self.primary_shard(hash).read().get(hash).copied()
    }

    /// Install or replace the slot for a hash.
    pub fn set(&self, hash: &TxHash, slot: Slot) {
        self.primary_shard(hash).write().insert(hash.clone(), slot);
    }

    /// Add a record to every secondary index.
    pub fn add_secondary(&self, record: &InteractionRecord) {
        let key = record.index_key();
        self.by_contract.insert(
            (record.chain.clone(), record.contract.clone()),
            key.clone(),
        );
        self.by_address
            .insert((record.chain.clone(), record.address.clone()), key.clone());
        self.by_chain.insert(record.chain.clone(), key);
    }

    /// Remove a record from every secondary index.
    pub fn remove_secondary(&self, record: &InteractionRecord) {
        let key = record.index_key();
        self.by_contract
            .remove(&(record.chain.clone(), record.contract.clone()), &key);
        self.by_address
            .remove(&(record.chain.clone(), record.address.clone()), &key);
        self.by_chain.remove(&record.chain, &key);
    }

    /// Add the secondary entries `new` needs that `old` does not already have.
    pub fn add_secondary_diff(&self, old: &InteractionRecord, new: &InteractionRecord) {
        let (old_key, new_key) = (old.index_key(), new.index_key());
        let old_contract = (old.chain.clone(), old.contract.clone());
        let new_contract = (new.chain.clone(), new.contract.clone());
        if old_contract != new_contract || old_key != new_key {
            self.by_contract.insert(new_contract, new_key.clone());
        }
        let old_address = (old.chain.clone(), old.address.clone());
        let new_address = (new.chain.clone(), new.address.clone());
        if old_address != new_address || old_key != new_key {
            self.by_address.insert(new_address, new_key.clone());
        }
        if old.chain != new.chain || old_key != new_key {
            self.by_chain.insert(new.chain.clone(), new_key);
        }
    }

    /// Remove the secondary entries `old` had that `new` does not share.
    pub fn remove_secondary_diff(&self, old: &InteractionRecord, new: &InteractionRecord) {
        let (old_key, new_key) = (old.index_key(), new.index_key());
        let old_contract = (old.chain.clone(), old.contract.clone());
        let new_contract = (new.chain.clone(), new.contract.clone());
        if old_contract != new_contract || old_key != new_key {
            self.by_contract.remove(&old_contract, &old_key);
        }
        let old_address = (old.chain.clone(), old.address.clone());
        let new_address = (new.chain.clone(), new.address.clone());
        if old_address != new_address || old_key != new_key {
            self.by_address.remove(&old_address, &old_key);
        }
        if old.chain != new.chain || old_key != new_key {
            self.by_chain.remove(&old.chain, &old_key);
        }
    }

    /// Up to `max` index keys for `filter` after `lower`, with block <= `end_block`.
    pub fn scan_keys(
        &self,
        filter: &ScanFilter,
        lower: Bound<IndexKey>,
        end_block: u64,
        max: usize,
    ) -> Vec<IndexKey> {
        match filter {
            ScanFilter::Contract { chain, contract } => self.by_contract.range(
                &(chain.clone(), contract.clone()),
                lower,
                end_block,
                max,
            ),
            ScanFilter::Address { chain, address } => self.by_address.range(
                &(chain.clone(), address.clone()),
                lower,
                end_block,
                max,
            ),
            ScanFilter::Chain { chain } => self.by_chain.range(chain, lower, end_block, max),
        }
    }

    /// Live record count and block bounds for a chain.
    pub fn chain_bounds(&self, chain: &ChainId) -> (usize, Option<u64>, Option<u64>) {
        self.by_chain.bounds(chain)
    }

    pub fn chain_count(&self) -> usize {
        self.by_chain.group_count()
    }

    /// Count slots by their latest revision kind: (live, superseded, invalidated).
    pub fn counts(&self) -> (u64, u64, u64) {
        let (mut live, mut superseded, mut invalidated) = (0, 0, 0);
        for shard in self.primary.iter() {
            for slot in shard.read().values() {
                match slot.kind {
                    RevisionKind::Committed => live += 1,
                    RevisionKind::Superseded => {
                        live += 1;
                        superseded += 1;
                    }
                    RevisionKind::Invalidated => invalidated += 1,
                }
            }
        }
        (live, superseded, invalidated)
    }

    /// Number of hashes ever seen, including invalidated ones.
    pub fn count(&self) -> usize {
        self.primary.iter().map(|s| s.read().len()).sum()
    }
}
