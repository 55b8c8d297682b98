//! Reorg and revision handling.
//!
//! A hash moves through `Unseen -> Committed -> Superseded* -> Invalidated`,
//! and back to `Committed` if an invalidated transaction is observed again.
//! Divergent facts for a committed hash are never applied silently: they
//! either become a [`ConflictReport`] or, when the policy allows it, an
//! atomic supersede.

use crate::error::Result;
use crate::ingest::WriteOutcome;
use crate::ledger::Ledger;
use crate::store::{InvalidateOutcome, LedgerConfig, SupersedeOutcome};
use crate::subscriptions::LedgerEvent;
use crate::types::{ConflictReport, CorrectionMark, InteractionRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What to do with an event whose facts differ from the committed record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Always report the conflict.
    #[default]
    Reject,
    /// Supersede when the event is a correction from a trusted source.
    AcceptTrustedCorrections,
}

/// Decision for one conflicting event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Supersede {
        record: InteractionRecord,
        source: String,
    },
    Conflict(ConflictReport),
}

/// Applies the conflict policy.
#[derive(Clone, Debug, Default)]
pub struct ReorgHandler {
    policy: ConflictPolicy,
    trusted_sources: HashSet<String>,
}

impl ReorgHandler {
    pub fn new(policy: ConflictPolicy, trusted_sources: impl IntoIterator<Item = String>) -> Self {
        Self {
            policy,
            trusted_sources: trusted_sources.into_iter().collect(),
        }
    }

    pub fn from_config(config: &LedgerConfig) -> Self {
        Self::new(config.conflict_policy, config.trusted_sources.iter().cloned())
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn is_trusted(&self, source: &str) -> bool {
        self.trusted_sources.contains(source)
    }

    /// Decide what happens to `incoming`, which disagrees with `existing`.
    pub fn decide(
        &self,
        existing: InteractionRecord,
        incoming: InteractionRecord,
        correction: Option<&CorrectionMark>,
    ) -> Resolution {
        match correction {
            Some(mark)
                if self.policy == ConflictPolicy::AcceptTrustedCorrections
                    && self.is_trusted(&mark.source) =>
            {
                Resolution::Supersede {
                    record: incoming,
                    source: mark.source.clone(),
                }
            }
            _ => Resolution::Conflict(ConflictReport {
                existing,
                incoming,
                correction_source: correction.map(|m| m.source.clone()),
            }),
        }
    }
}

impl Ledger {
    /// Route an event that collided with a committed record.
    pub(crate) fn resolve_conflict(
        &self,
        existing: InteractionRecord,
        incoming: InteractionRecord,
        correction: Option<&CorrectionMark>,
    ) -> Result<WriteOutcome> {
        match self.reorg.decide(existing, incoming, correction) {
            Resolution::Supersede { record, source } => self.apply_supersede(record, &source),
            Resolution::Conflict(report) => {
                tracing::warn!(
                    hash = %report.hash(),
                    fields = ?report.differing_fields(),
                    correction_source = ?report.correction_source,
                    "conflicting facts for committed hash"
                );
                self.subscriptions.broadcast(LedgerEvent::Conflict {
                    existing: report.existing.clone(),
                    incoming: report.incoming.clone(),
                    correction_source: report.correction_source.clone(),
                });
                Ok(WriteOutcome::Conflict(Box::new(report)))
            }
        }
    }

    /// Explicitly replace the facts of a committed hash.
    ///
    /// This is the operator path and ignores the conflict policy. The record
    /// and all three secondary indexes change together. Fails with
    /// `RecordNotFound` if the hash has no live record.
    pub fn supersede(&self, record: InteractionRecord, source: &str) -> Result<WriteOutcome> {
        let record = match self.validator.validate_record(record) {
            Ok(record) => record,
            Err(reason) => return Ok(WriteOutcome::Rejected(reason)),
        };
        self.apply_supersede(record, source)
    }

    fn apply_supersede(&self, record: InteractionRecord, source: &str) -> Result<WriteOutcome> {
        let outcome = self.store.supersede_with(record, source, |outcome| {
            if let SupersedeOutcome::Superseded {
                previous,
                current,
                revision,
            } = outcome
            {
                self.subscriptions.broadcast(LedgerEvent::Superseded {
                    previous: previous.clone(),
                    current: current.clone(),
                    revision: *revision,
                    source: source.to_string(),
                });
            }
        })?;
        match outcome {
            SupersedeOutcome::Superseded {
                previous, revision, ..
            } => Ok(WriteOutcome::Superseded { previous, revision }),
            SupersedeOutcome::Unchanged(_) => Ok(WriteOutcome::Duplicate),
        }
    }

    /// Withdraw a transaction that a reorg removed from the canonical chain.
    ///
    /// The record disappears from `get` and every query. Ingesting the same
    /// hash later commits it again.
    pub fn invalidate(&self, hash: &str, source: &str) -> Result<WriteOutcome> {
        let outcome = self.store.invalidate_with(&self.hash_key(hash), source, |outcome| {
            if let InvalidateOutcome::Invalidated { record, revision } = outcome {
                self.subscriptions.broadcast(LedgerEvent::Invalidated {
                    record: record.clone(),
                    revision: *revision,
                    source: source.to_string(),
                });
            }
        })?;
        match outcome {
            InvalidateOutcome::Invalidated { record, revision } => {
                Ok(WriteOutcome::Invalidated { record, revision })
            }
            InvalidateOutcome::AlreadyInvalidated => Ok(WriteOutcome::Duplicate),
        }
    }
}
