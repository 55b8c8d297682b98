//! The ledger: one ownership domain for the store, the conflict policy and
//! the subscribers.
//!
//! Ingestion lives in `ingest.rs`, queries in `query.rs` and revisions in
//! `reorg.rs`; each adds its operations to [`Ledger`].

use crate::error::Result;
use crate::ingest::EventValidator;
use crate::reorg::ReorgHandler;
use crate::store::{LedgerConfig, LedgerStore};
use crate::subscriptions::{SubscriptionConfig, SubscriptionHandle, SubscriptionId, SubscriptionManager};
use crate::types::{ChainId, ChainSummary, HashState, InteractionRecord, LedgerStats, Revision, TxHash};
use std::path::Path;

/// Embedded, concurrent interaction ledger.
///
/// `Ledger` is `Send + Sync`; share it behind an `Arc` across writer and
/// reader threads.
pub struct Ledger {
    pub(crate) store: LedgerStore,
    pub(crate) reorg: ReorgHandler,
    pub(crate) validator: EventValidator,
    pub(crate) subscriptions: SubscriptionManager,
}

impl Ledger {
    /// Open an existing ledger or create a new one.
    pub fn open_or_create(config: LedgerConfig) -> Result<Self> {
        LedgerStore::open_or_create(config).map(Self::from_store)
    }

    /// Create a new ledger.
    pub fn create(config: LedgerConfig) -> Result<Self> {
        LedgerStore::create(config).map(Self::from_store)
    }

    /// Open an existing ledger.
    pub fn open(config: LedgerConfig) -> Result<Self> {
        LedgerStore::open(config).map(Self::from_store)
    }

    fn from_store(store: LedgerStore) -> Self {
        let config = store.config();
        Self {
            reorg: ReorgHandler::from_config(config),
            validator: EventValidator::from_config(config),
            subscriptions: SubscriptionManager::new(),
            store,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        self.store.config()
    }

    pub fn reorg_handler(&self) -> &ReorgHandler {
        &self.reorg
    }

    pub fn validator(&self) -> &EventValidator {
        &self.validator
    }

    pub(crate) fn hash_key(&self, hash: &str) -> TxHash {
        TxHash(self.validator.normalize(hash))
    }

    /// Get the live record for a hash.
    pub fn get(&self, hash: &str) -> Result<Option<InteractionRecord>> {
        self.store.get(&self.hash_key(hash))
    }

    /// Where a hash is in its lifecycle.
    pub fn state(&self, hash: &str) -> HashState {
        self.store.state(&self.hash_key(hash))
    }

    /// Every revision of a hash, oldest first.
    pub fn history(&self, hash: &str) -> Result<Vec<Revision>> {
        self.store.history(&self.hash_key(hash))
    }

    pub fn stats(&self) -> LedgerStats {
        self.store.stats()
    }

    pub fn chain_summary(&self, chain: &str) -> ChainSummary {
        self.store.chain_summary(&ChainId::new(chain.trim()))
    }

    /// Sync all data to disk.
    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    // --- Subscriptions ---

    /// Subscribe to ledger events.
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        self.subscriptions.subscribe(config)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.unsubscribe(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.subscription_count()
    }
}
