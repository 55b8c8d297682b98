//! # Interaction Ledger
//!
//! An embedded, concurrent ledger of smart-contract interactions: which
//! transaction, at which block, called which contract from which address,
//! on which chain.
//!
//! ## Core Concepts
//!
//! - **Records**: One per transaction hash, ever. Re-ingesting is a no-op.
//! - **Log**: Checksummed append-only log; the indexes are rebuilt from it
//! - **Queries**: Cursor-paginated block-range scans by contract, address or chain
//! - **Revisions**: Conflicting facts are reported, or superseded under policy
//!
//! ## Example
//!
//! ```ignore
//! use interaction_ledger::{BlockRange, IngestEvent, Ledger, LedgerConfig, WriteOutcome};
//!
//! let ledger = Ledger::open_or_create(LedgerConfig {
//!     path: "./my-ledger".into(),
//!     ..Default::default()
//! })?;
//!
//! let outcome = ledger.ingest(IngestEvent::new("0xabc", 5, "0xaaa", "0xccc", "eth"))?;
//! assert_eq!(outcome, WriteOutcome::Accepted);
//!
//! let page = ledger.query_by_contract("eth", "0xccc", BlockRange::new(0, 12), 100, None)?;
//! for record in &page.records {
//!     println!("{} @ {}", record.hash, record.block);
//! }
//! ```

pub mod error;
pub mod ingest;
pub mod ledger;
pub mod query;
pub mod records;
pub mod reorg;
pub mod retry;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use error::{LedgerError, Result, ValidationError};
pub use ingest::{BatchReport, EventValidator, IngestEvent, WriteOutcome};
pub use ledger::Ledger;
pub use query::{Page, PageIter};
pub use records::{LedgerIndex, LedgerLog};
pub use reorg::{ConflictPolicy, ReorgHandler, Resolution};
pub use retry::RetryPolicy;
pub use store::{
    InvalidateOutcome, LedgerConfig, LedgerStore, PutOutcome, Scan, SupersedeOutcome,
};
pub use subscriptions::{
    DropReason, LedgerEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId, SubscriptionManager,
};
pub use types::*;
