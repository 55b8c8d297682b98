//! Ingestion path: validate events, apply them idempotently.
//!
//! Upstream delivery is at-least-once, so seeing the same event twice is
//! normal and costs no write. Events that disagree with a committed record
//! go to the reorg handler; ingestion itself never overwrites.

use crate::error::{LedgerError, Result, ValidationError};
use crate::ledger::Ledger;
use crate::store::{LedgerConfig, PutOutcome};
use crate::subscriptions::LedgerEvent;
use crate::types::{ChainId, ConflictReport, CorrectionMark, InteractionRecord, TxHash};
use serde::{Deserialize, Serialize};
use std::io::BufRead;

/// An interaction as delivered by the upstream indexer.
///
/// Mirrors [`InteractionRecord`] but keeps `block` signed so that bad input
/// can be reported instead of wrapping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestEvent {
    pub hash: String,
    pub block: i64,
    pub address: String,
    pub contract: String,
    pub chain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<CorrectionMark>,
}

impl IngestEvent {
    pub fn new(
        hash: impl Into<String>,
        block: i64,
        address: impl Into<String>,
        contract: impl Into<String>,
        chain: impl Into<String>,
    ) -> Self {
        Self {
            hash: hash.into(),
            block,
            address: address.into(),
            contract: contract.into(),
            chain: chain.into(),
            correction: None,
        }
    }

    /// Mark this event as a correction issued by `source`.
    pub fn with_correction(mut self, source: impl Into<String>) -> Self {
        self.correction = Some(CorrectionMark {
            source: source.into(),
        });
        self
    }
}

/// Checks and normalizes identifiers before anything reaches the store.
#[derive(Clone, Debug)]
pub struct EventValidator {
    normalize_hex: bool,
    max_len: usize,
}

impl Default for EventValidator {
    fn default() -> Self {
        Self::from_config(&LedgerConfig::default())
    }
}

impl EventValidator {
    pub fn new(normalize_hex: bool, max_len: usize) -> Self {
        Self {
            normalize_hex,
            max_len,
        }
    }

    pub fn from_config(config: &LedgerConfig) -> Self {
        Self::new(config.normalize_hex, config.max_identifier_len)
    }

    /// Turn an event into a storable record.
    pub fn validate(
        &self,
        event: &IngestEvent,
    ) -> std::result::Result<InteractionRecord, ValidationError> {
        if event.block < 0 {
            return Err(ValidationError::NegativeBlock(event.block));
        }
        Ok(InteractionRecord {
            hash: TxHash(self.identifier("hash", &event.hash, true)?),
            block: event.block as u64,
            address: self.identifier("address", &event.address, true)?,
            contract: self.identifier("contract", &event.contract, true)?,
            chain: ChainId(self.identifier("chain", &event.chain, false)?),
        })
    }

    /// Same checks for a record built by the caller.
    pub fn validate_record(
        &self,
        record: InteractionRecord,
    ) -> std::result::Result<InteractionRecord, ValidationError> {
        if record.block > i64::MAX as u64 {
            return Err(ValidationError::BlockOutOfRange(record.block));
        }
        Ok(InteractionRecord {
            hash: TxHash(self.identifier("hash", &record.hash.0, true)?),
            block: record.block,
            address: self.identifier("address", &record.address, true)?,
            contract: self.identifier("contract", &record.contract, true)?,
            chain: ChainId(self.identifier("chain", record.chain.as_str(), false)?),
        })
    }

    /// Normalize a lookup key the same way stored identifiers are.
    pub fn normalize(&self, value: &str) -> String {
        let value = value.trim();
        if self.normalize_hex && is_hex_prefixed(value) {
            value.to_ascii_lowercase()
        } else {
            value.to_string()
        }
    }

    fn identifier(
        &self,
        field: &'static str,
        value: &str,
        hex: bool,
    ) -> std::result::Result<String, ValidationError> {
        let value = if hex {
            self.normalize(value)
        } else {
            value.trim().to_string()
        };

        if value.is_empty() {
            return Err(ValidationError::EmptyField(field));
        }
        if value.chars().any(char::is_control) {
            return Err(ValidationError::ControlCharacters(field));
        }
        if value.len() > self.max_len {
            return Err(ValidationError::TooLong {
                field,
                len: value.len(),
                max: self.max_len,
            });
        }
        Ok(value)
    }
}

fn is_hex_prefixed(value: &str) -> bool {
    value.starts_with("0x") || value.starts_with("0X")
}

/// Tagged result of a mutating call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A new record was committed.
    Accepted,
    /// Identical facts were already committed; nothing was written.
    Duplicate,
    /// Refused before touching the store.
    Rejected(ValidationError),
    /// Divergent facts, not applied.
    Conflict(Box<ConflictReport>),
    /// Committed facts were replaced.
    Superseded {
        previous: InteractionRecord,
        revision: u32,
    },
    /// The record was withdrawn.
    Invalidated {
        record: InteractionRecord,
        revision: u32,
    },
}

impl WriteOutcome {
    /// Error semantics for callers that prefer them: `Rejected` and
    /// `Conflict` become errors, everything else is `Ok`.
    pub fn into_result(self) -> Result<WriteOutcome> {
        match self {
            WriteOutcome::Rejected(reason) => Err(LedgerError::Validation(reason)),
            WriteOutcome::Conflict(report) => Err(LedgerError::Conflict(report)),
            other => Ok(other),
        }
    }

    /// Whether the call changed the ledger.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            WriteOutcome::Accepted
                | WriteOutcome::Superseded { .. }
                | WriteOutcome::Invalidated { .. }
        )
    }
}

/// Per-event outcomes of a batch, in input order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<Result<WriteOutcome>>,
}

impl BatchReport {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    fn count(&self, pred: impl Fn(&WriteOutcome) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, Ok(outcome) if pred(outcome)))
            .count()
    }

    pub fn accepted(&self) -> usize {
        self.count(|o| matches!(o, WriteOutcome::Accepted))
    }

    pub fn duplicates(&self) -> usize {
        self.count(|o| matches!(o, WriteOutcome::Duplicate))
    }

    pub fn rejected(&self) -> usize {
        self.count(|o| matches!(o, WriteOutcome::Rejected(_)))
    }

    pub fn conflicts(&self) -> usize {
        self.count(|o| matches!(o, WriteOutcome::Conflict(_)))
    }

    pub fn superseded(&self) -> usize {
        self.count(|o| matches!(o, WriteOutcome::Superseded { .. }))
    }

    /// Items that failed with an error (not a rejection or conflict).
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_err()).count()
    }

    /// Positions worth resubmitting.
    pub fn retryable_indices(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, o)| match o {
                Err(e) if e.is_retryable() => Some(i),
                _ => None,
            })
            .collect()
    }

    /// `(position, code)` for every failed item.
    pub fn error_codes(&self) -> Vec<(usize, &'static str)> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.as_ref().err().map(|e| (i, e.code())))
            .collect()
    }
}

impl Ledger {
    /// Validate and apply one event.
    ///
    /// Only storage failures are errors; validation failures, duplicates and
    /// conflicts are outcomes.
    pub fn ingest(&self, event: IngestEvent) -> Result<WriteOutcome> {
        let record = match self.validator.validate(&event) {
            Ok(record) => record,
            Err(reason) => {
                tracing::debug!(hash = %event.hash, %reason, "rejected event");
                return Ok(WriteOutcome::Rejected(reason));
            }
        };
        self.apply(record, event.correction.as_ref())
    }

    fn apply(
        &self,
        record: InteractionRecord,
        correction: Option<&CorrectionMark>,
    ) -> Result<WriteOutcome> {
        // Broadcast under the hash lock so per-hash events keep commit order.
        let outcome = self.store.put_if_absent_with(record.clone(), |committed| {
            self.subscriptions.broadcast(LedgerEvent::Inserted {
                record: committed.clone(),
            })
        })?;
        match outcome {
            PutOutcome::Inserted => Ok(WriteOutcome::Accepted),
            PutOutcome::AlreadyExists(existing) if existing == record => {
                Ok(WriteOutcome::Duplicate)
            }
            PutOutcome::AlreadyExists(existing) => {
                self.resolve_conflict(existing, record, correction)
            }
        }
    }

    /// Apply each event independently, in order.
    pub fn ingest_batch(&self, events: impl IntoIterator<Item = IngestEvent>) -> BatchReport {
        let report = BatchReport {
            outcomes: events.into_iter().map(|e| self.ingest(e)).collect(),
        };
        log_batch(&report);
        report
    }

    /// Ingest newline-delimited JSON events.
    ///
    /// A line that does not parse becomes `Rejected(Malformed)` and the
    /// stream continues. Blank lines are skipped. A read error ends the
    /// stream and is reported as the last outcome.
    pub fn ingest_json_lines(&self, reader: impl BufRead) -> BatchReport {
        let mut report = BatchReport::default();

        for (number, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(line = number + 1, error = %e, "event stream read failed");
                    report.outcomes.push(Err(LedgerError::Io(e)));
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let outcome = match serde_json::from_str::<IngestEvent>(&line) {
                Ok(event) => self.ingest(event),
                Err(e) => Ok(WriteOutcome::Rejected(ValidationError::Malformed(format!(
                    "line {}: {}",
                    number + 1,
                    e
                )))),
            };
            report.outcomes.push(outcome);
        }

        log_batch(&report);
        report
    }
}

fn log_batch(report: &BatchReport) {
    tracing::debug!(
        events = report.len(),
        accepted = report.accepted(),
        duplicates = report.duplicates(),
        rejected = report.rejected(),
        conflicts = report.conflicts(),
        failed = report.failed(),
        "ingested batch"
    );
}
