//! Error types for the interaction ledger.

use crate::types::{ConflictReport, TxHash};
use thiserror::Error;

/// Why an event was refused before touching the store.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("field `{0}` is empty")]
    EmptyField(&'static str),

    #[error("block height must be non-negative, got {0}")]
    NegativeBlock(i64),

    #[error("block height {0} is out of range")]
    BlockOutOfRange(u64),

    #[error("field `{field}` is {len} bytes long (max {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("field `{0}` contains control characters")]
    ControlCharacters(&'static str),

    #[error("malformed event: {0}")]
    Malformed(String),
}

/// Main error type for ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Conflicting facts for {}", .0.hash())]
    Conflict(Box<ConflictReport>),

    #[error("Storage unavailable after {attempts} attempts: {message}")]
    StorageUnavailable { attempts: u32, message: String },

    #[error("Record not found: {0}")]
    RecordNotFound(TxHash),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Ledger is locked by another process")]
    Locked,

    #[error("Ledger not initialized")]
    NotInitialized,

    #[error("Invalid ledger format: {0}")]
    InvalidFormat(String),
}

impl LedgerError {
    /// Stable machine-readable code, reported per failed batch item.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Io(_) => "io",
            LedgerError::Validation(_) => "validation",
            LedgerError::Conflict(_) => "conflict",
            LedgerError::StorageUnavailable { .. } => "storage_unavailable",
            LedgerError::RecordNotFound(_) => "record_not_found",
            LedgerError::InvalidCursor(_) => "invalid_cursor",
            LedgerError::InvalidQuery(_) => "invalid_query",
            LedgerError::Serialization(_) => "serialization",
            LedgerError::Deserialization(_) => "deserialization",
            LedgerError::Corruption(_) => "corruption",
            LedgerError::ChecksumMismatch { .. } => "checksum_mismatch",
            LedgerError::Locked => "locked",
            LedgerError::NotInitialized => "not_initialized",
            LedgerError::InvalidFormat(_) => "invalid_format",
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::StorageUnavailable { .. })
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for LedgerError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for LedgerError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        LedgerError::Deserialization(e.to_string())
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
