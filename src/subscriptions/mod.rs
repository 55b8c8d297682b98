//! Subscription system for live ledger updates.
//!
//! In-process subscriptions to ledger events: commits, supersedes,
//! invalidations and conflicts. Subscriptions filter by event kind and chain
//! and use bounded buffers; a slow subscriber is dropped instead of stalling
//! writers, and receives `Dropped { reason: BufferOverflow }` as its last
//! event.
//!
//! Events for one hash are broadcast while its write lock is held, so they
//! arrive in commit order: a `Superseded` never precedes the `Inserted` for
//! the same hash. Events for different hashes may interleave freely.
//!
//! # Example
//!
//! ```ignore
//! let handle = ledger.subscribe(SubscriptionConfig {
//!     filter: SubscriptionFilter::conflicts(),
//!     ..Default::default()
//! });
//!
//! loop {
//!     match handle.recv() {
//!         Ok(LedgerEvent::Conflict { existing, incoming, .. }) => alert(existing, incoming),
//!         Ok(LedgerEvent::Dropped { .. }) | Err(_) => break,
//!         Ok(_) => {}
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    DropReason, LedgerEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId,
};
