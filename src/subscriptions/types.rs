//! Subscription types for live ledger updates.

use crate::types::{ChainId, InteractionRecord};
use serde::{Deserialize, Serialize};

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before dropping subscriber.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: SubscriptionFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: SubscriptionFilter::all(),
        }
    }
}

/// Filter criteria for subscriptions.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    /// Only events for these chains (None = every chain).
    pub chains: Option<Vec<ChainId>>,

    /// Include newly committed records.
    pub include_inserts: bool,

    /// Include supersedes.
    pub include_supersedes: bool,

    /// Include invalidations.
    pub include_invalidations: bool,

    /// Include conflict reports.
    pub include_conflicts: bool,
}

impl SubscriptionFilter {
    /// Subscribe to everything.
    pub fn all() -> Self {
        Self {
            chains: None,
            include_inserts: true,
            include_supersedes: true,
            include_invalidations: true,
            include_conflicts: true,
        }
    }

    /// Only conflicts, for operator alerting.
    pub fn conflicts() -> Self {
        Self {
            include_conflicts: true,
            ..Default::default()
        }
    }

    /// Supersedes and invalidations: every change to committed facts.
    pub fn revisions() -> Self {
        Self {
            include_supersedes: true,
            include_invalidations: true,
            ..Default::default()
        }
    }

    /// Restrict to the given chains.
    pub fn on_chains(mut self, chains: impl IntoIterator<Item = ChainId>) -> Self {
        self.chains = Some(chains.into_iter().collect());
        self
    }

    pub(crate) fn matches(&self, event: &LedgerEvent) -> bool {
        let wanted = match event {
            LedgerEvent::Inserted { .. } => self.include_inserts,
            LedgerEvent::Superseded { .. } => self.include_supersedes,
            LedgerEvent::Invalidated { .. } => self.include_invalidations,
            LedgerEvent::Conflict { .. } => self.include_conflicts,
            LedgerEvent::Dropped { .. } => true,
        };
        if !wanted {
            return false;
        }

        match (&self.chains, event.chain()) {
            (Some(chains), Some(chain)) => chains.contains(chain),
            _ => true,
        }
    }
}

/// Events emitted by subscriptions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// A hash was committed (first sighting or re-inclusion after invalidation).
    Inserted { record: InteractionRecord },

    /// Committed facts were replaced.
    Superseded {
        previous: InteractionRecord,
        current: InteractionRecord,
        revision: u32,
        source: String,
    },

    /// A record was withdrawn from the canonical view.
    Invalidated {
        record: InteractionRecord,
        revision: u32,
        source: String,
    },

    /// Divergent facts were observed and not applied.
    Conflict {
        existing: InteractionRecord,
        incoming: InteractionRecord,
        correction_source: Option<String>,
    },

    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

impl LedgerEvent {
    /// Chain the event concerns, if any.
    pub fn chain(&self) -> Option<&ChainId> {
        match self {
            LedgerEvent::Inserted { record } | LedgerEvent::Invalidated { record, .. } => {
                Some(&record.chain)
            }
            LedgerEvent::Superseded { current, .. } => Some(&current.chain),
            LedgerEvent::Conflict { existing, .. } => Some(&existing.chain),
            LedgerEvent::Dropped { .. } => None,
        }
    }
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to manage a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<LedgerEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<LedgerEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<LedgerEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<LedgerEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
