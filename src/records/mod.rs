//! Ledger log and indexes.
//!
//! Ledger entries are stored in an append-only log; the indexes are kept in
//! memory and rebuilt from the log on open.

mod index;
mod log;

pub use index::{LedgerIndex, Slot};
pub use log::{LedgerLog, LogEntry, LogIterator};
