//! Core types for the interaction ledger.

use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Transaction hash, the global primary key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl TxHash {
    pub fn new(hash: impl Into<String>) -> Self {
        TxHash(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({})", self.0)
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TxHash {
    fn from(s: &str) -> Self {
        TxHash(s.to_string())
    }
}

/// Chain identifier (e.g. "eth", "polygon").
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ChainId(pub String);

impl ChainId {
    pub fn new(chain: impl Into<String>) -> Self {
        ChainId(chain.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainId({})", self.0)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainId {
    fn from(s: &str) -> Self {
        ChainId(s.to_string())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A transaction at `block` on `chain` invoked `contract` from `address`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub hash: TxHash,
    pub block: u64,
    pub address: String,
    pub contract: String,
    pub chain: ChainId,
}

impl InteractionRecord {
    pub fn new(
        hash: impl Into<String>,
        block: u64,
        address: impl Into<String>,
        contract: impl Into<String>,
        chain: impl Into<String>,
    ) -> Self {
        Self {
            hash: TxHash(hash.into()),
            block,
            address: address.into(),
            contract: contract.into(),
            chain: ChainId(chain.into()),
        }
    }

    /// Names of the fields whose values differ from `other`.
    pub fn differing_fields(&self, other: &InteractionRecord) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.hash != other.hash {
            fields.push("hash");
        }
        if self.block != other.block {
            fields.push("block");
        }
        if self.address != other.address {
            fields.push("address");
        }
        if self.contract != other.contract {
            fields.push("contract");
        }
        if self.chain != other.chain {
            fields.push("chain");
        }
        fields
    }

    pub(crate) fn index_key(&self) -> IndexKey {
        IndexKey {
            block: self.block,
            hash: self.hash.clone(),
        }
    }
}

/// Sort key inside a secondary index grouping: block first, hash as tie-break.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey {
    pub block: u64,
    pub hash: TxHash,
}

impl IndexKey {
    /// Smallest key at a given block.
    pub fn block_start(block: u64) -> Self {
        IndexKey {
            block,
            hash: TxHash::default(),
        }
    }
}

/// Inclusive block range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Every block.
    pub fn all() -> Self {
        Self {
            start: 0,
            end: u64::MAX,
        }
    }

    /// From `start` onward.
    pub fn from(start: u64) -> Self {
        Self {
            start,
            end: u64::MAX,
        }
    }

    pub fn contains(&self, block: u64) -> bool {
        self.start <= block && block <= self.end
    }

    /// Inverted ranges match nothing.
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

impl Default for BlockRange {
    fn default() -> Self {
        Self::all()
    }
}

/// Which secondary index a scan walks.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScanFilter {
    Contract { chain: ChainId, contract: String },
    Address { chain: ChainId, address: String },
    Chain { chain: ChainId },
}

impl ScanFilter {
    pub fn contract(chain: impl Into<String>, contract: impl Into<String>) -> Self {
        ScanFilter::Contract {
            chain: ChainId(chain.into()),
            contract: contract.into(),
        }
    }

    pub fn address(chain: impl Into<String>, address: impl Into<String>) -> Self {
        ScanFilter::Address {
            chain: ChainId(chain.into()),
            address: address.into(),
        }
    }

    pub fn chain(chain: impl Into<String>) -> Self {
        ScanFilter::Chain {
            chain: ChainId(chain.into()),
        }
    }

    pub fn chain_id(&self) -> &ChainId {
        match self {
            ScanFilter::Contract { chain, .. }
            | ScanFilter::Address { chain, .. }
            | ScanFilter::Chain { chain } => chain,
        }
    }

    /// Whether a record belongs to this grouping.
    pub fn matches(&self, record: &InteractionRecord) -> bool {
        match self {
            ScanFilter::Contract { chain, contract } => {
                &record.chain == chain && &record.contract == contract
            }
            ScanFilter::Address { chain, address } => {
                &record.chain == chain && &record.address == address
            }
            ScanFilter::Chain { chain } => &record.chain == chain,
        }
    }

    /// Short digest binding a cursor to the query that produced it.
    pub fn scope_digest(&self) -> [u8; 8] {
        let mut hasher = Sha256::new();
        match self {
            ScanFilter::Contract { chain, contract } => {
                hasher.update(b"contract\0");
                hasher.update(chain.as_str().as_bytes());
                hasher.update(b"\0");
                hasher.update(contract.as_bytes());
            }
            ScanFilter::Address { chain, address } => {
                hasher.update(b"address\0");
                hasher.update(chain.as_str().as_bytes());
                hasher.update(b"\0");
                hasher.update(address.as_bytes());
            }
            ScanFilter::Chain { chain } => {
                hasher.update(b"chain\0");
                hasher.update(chain.as_str().as_bytes());
            }
        }
        let digest = hasher.finalize();
        let mut scope = [0u8; 8];
        scope.copy_from_slice(&digest[..8]);
        scope
    }
}

#[derive(Serialize, Deserialize)]
struct CursorPayload {
    block: u64,
    hash: String,
    scope: [u8; 8],
}

/// Opaque pagination token: the last returned `(block, hash)` plus a scope digest.
#[derive(Clone, PartialEq, Eq)]
pub struct Cursor {
    pub(crate) last: IndexKey,
    pub(crate) scope: [u8; 8],
}

impl Cursor {
    pub(crate) fn after(last: IndexKey, filter: &ScanFilter) -> Self {
        Self {
            last,
            scope: filter.scope_digest(),
        }
    }

    /// Encode as a hex token suitable for handing to clients.
    pub fn to_token(&self) -> String {
        let payload = CursorPayload {
            block: self.last.block,
            hash: self.last.hash.0.clone(),
            scope: self.scope,
        };
        // Encoding a plain struct into a Vec cannot fail.
        hex::encode(rmp_serde::to_vec(&payload).unwrap_or_default())
    }

    /// Parse a token produced by [`Cursor::to_token`].
    pub fn from_token(token: &str) -> Result<Self> {
        let bytes =
            hex::decode(token).map_err(|e| LedgerError::InvalidCursor(e.to_string()))?;
        let payload: CursorPayload = rmp_serde::from_slice(&bytes)
            .map_err(|e| LedgerError::InvalidCursor(e.to_string()))?;
        Ok(Self {
            last: IndexKey {
                block: payload.block,
                hash: TxHash(payload.hash),
            },
            scope: payload.scope,
        })
    }

    /// Block of the last record returned.
    pub fn last_block(&self) -> u64 {
        self.last.block
    }

    /// Hash of the last record returned.
    pub fn last_hash(&self) -> &TxHash {
        &self.last.hash
    }

    pub(crate) fn check_scope(&self, filter: &ScanFilter) -> Result<()> {
        if self.scope != filter.scope_digest() {
            return Err(LedgerError::InvalidCursor(
                "cursor belongs to a different query".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cursor({}, {})", self.last.block, self.last.hash)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_token())
    }
}

/// Marks an event as an authoritative correction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionMark {
    /// Name of the reorg-aware source that issued the correction.
    pub source: String,
}

/// Same hash observed with divergent facts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictReport {
    pub existing: InteractionRecord,
    pub incoming: InteractionRecord,
    /// Correction source, if the incoming event carried one that was not trusted.
    pub correction_source: Option<String>,
}

impl ConflictReport {
    pub fn hash(&self) -> &TxHash {
        &self.existing.hash
    }

    pub fn differing_fields(&self) -> Vec<&'static str> {
        self.existing.differing_fields(&self.incoming)
    }
}

/// Lifecycle of a hash in the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashState {
    Unseen,
    Committed,
    Superseded { revision: u32 },
    Invalidated { revision: u32 },
}

/// Kind of change a revision made.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevisionKind {
    Committed,
    Superseded,
    Invalidated,
}

/// One step of a hash's history.
#[derive(Clone, Debug)]
pub struct Revision {
    pub revision: u32,
    pub kind: RevisionKind,
    /// Facts in force after this revision (the invalidated facts for `Invalidated`).
    pub record: InteractionRecord,
    pub source: Option<String>,
    pub timestamp: Timestamp,
}

/// Ledger statistics.
#[derive(Clone, Debug, Default)]
pub struct LedgerStats {
    pub record_count: u64,
    pub superseded_count: u64,
    pub invalidated_count: u64,
    pub chain_count: u64,
    pub log_size_bytes: u64,
}

/// Per-chain coverage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainSummary {
    pub chain: ChainId,
    pub record_count: u64,
    pub min_block: Option<u64>,
    pub max_block: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_key_orders_by_block_then_hash() {
        let a = IndexKey {
            block: 5,
            hash: TxHash::from("0xb"),
        };
        let b = IndexKey {
            block: 5,
            hash: TxHash::from("0xc"),
        };
        let c = IndexKey {
            block: 6,
            hash: TxHash::from("0xa"),
        };
        assert!(a < b);
        assert!(b < c);
        assert!(IndexKey::block_start(5) < a);
    }

    #[test]
    fn test_block_range_inclusive() {
        let range = BlockRange::new(0, 12);
        assert!(range.contains(0));
        assert!(range.contains(12));
        assert!(!range.contains(13));
        assert!(BlockRange::new(10, 5).is_empty());
    }

    #[test]
    fn test_cursor_token_roundtrip() {
        let filter = ScanFilter::contract("eth", "0xccc");
        let cursor = Cursor::after(
            IndexKey {
                block: 10,
                hash: TxHash::from("0xabc"),
            },
            &filter,
        );
        let parsed = Cursor::from_token(&cursor.to_token()).unwrap();
        assert_eq!(parsed, cursor);
        assert!(parsed.check_scope(&filter).is_ok());
        assert!(parsed
            .check_scope(&ScanFilter::address("eth", "0xccc"))
            .is_err());
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!(matches!(
            Cursor::from_token("not-hex"),
            Err(LedgerError::InvalidCursor(_))
        ));
        assert!(matches!(
            Cursor::from_token("00ff"),
            Err(LedgerError::InvalidCursor(_))
        ));
    }

    #[test]
    fn test_differing_fields() {
        let a = InteractionRecord::new("0xabc", 100, "0xaaa", "0xccc", "eth");
        let mut b = a.clone();
        b.block = 200;
        b.chain = ChainId::from("polygon");
        assert_eq!(a.differing_fields(&b), vec!["block", "chain"]);
        assert!(a.differing_fields(&a).is_empty());
    }
}
