//! Error handling tests for the interaction ledger.

use interaction_ledger::{
    BlockRange, Cursor, IngestEvent, InteractionRecord, Ledger, LedgerConfig, LedgerError,
    LedgerLog, ValidationError, WriteOutcome,
};
use std::fs::OpenOptions;
use std::io::Write;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> LedgerConfig {
    LedgerConfig {
        path: dir.path().join("ledger"),
        ..Default::default()
    }
}

fn event(hash: &str, block: i64) -> IngestEvent {
    IngestEvent::new(hash, block, "0xaaa", "0xccc", "eth")
}

// --- Ledger Errors ---

#[test]
fn test_open_nonexistent_ledger() {
    let dir = TempDir::new().unwrap();

    let result = Ledger::open_or_create(LedgerConfig {
        create_if_missing: false,
        ..test_config(&dir)
    });
    assert!(matches!(result, Err(LedgerError::NotInitialized)));

    let result = Ledger::open(test_config(&dir));
    assert!(matches!(result, Err(LedgerError::NotInitialized)));
}

#[test]
fn test_concurrent_ledger_access() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let _ledger1 = Ledger::create(config.clone()).unwrap();

    // Second ledger should fail with lock error
    let result = Ledger::open(config);
    assert!(matches!(result, Err(LedgerError::Locked)));
}

#[test]
fn test_bad_manifest() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    std::fs::create_dir_all(&config.path).unwrap();
    std::fs::write(config.path.join("MANIFEST"), b"NOPE\x01").unwrap();

    let result = Ledger::open(config);
    assert!(matches!(result, Err(LedgerError::InvalidFormat(_))));
}

// --- Log Recovery ---

#[test]
fn test_torn_tail_is_truncated_on_open() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let intact_size = {
        let ledger = Ledger::create(config.clone()).unwrap();
        ledger.ingest(event("0x1", 1)).unwrap();
        ledger.ingest(event("0x2", 2)).unwrap();
        ledger.sync().unwrap();
        ledger.stats().log_size_bytes
    };

    // Half a frame, as if the process died mid-append.
    let mut file = OpenOptions::new()
        .append(true)
        .open(config.path.join("ledger.log"))
        .unwrap();
    file.write_all(b"ILG\0\x01\x00\x40\x00").unwrap();
    drop(file);

    let ledger = Ledger::open(config).unwrap();
    assert_eq!(ledger.stats().log_size_bytes, intact_size);
    assert_eq!(ledger.stats().record_count, 2);

    // Appends continue cleanly after recovery.
    assert_eq!(ledger.ingest(event("0x3", 3)).unwrap(), WriteOutcome::Accepted);
}

#[test]
fn test_mid_log_corruption_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    {
        let ledger = Ledger::create(config.clone()).unwrap();
        ledger.ingest(event("0x1", 1)).unwrap();
        ledger.ingest(event("0x2", 2)).unwrap();
        ledger.sync().unwrap();
    }

    // Flip a payload byte inside the first frame.
    let log_path = config.path.join("ledger.log");
    let mut bytes = std::fs::read(&log_path).unwrap();
    bytes[12] ^= 0xff;
    std::fs::write(&log_path, bytes).unwrap();

    let result = Ledger::open(config);
    assert!(matches!(result, Err(LedgerError::ChecksumMismatch { .. })));
}

#[test]
fn test_read_past_end_of_log() {
    let dir = TempDir::new().unwrap();
    let log = LedgerLog::open(dir.path().join("ledger.log")).unwrap();

    assert!(log.read_at(4096).is_err());
}

// --- Query Errors ---

#[test]
fn test_garbage_cursor_token() {
    assert!(matches!(
        Cursor::from_token("not-hex"),
        Err(LedgerError::InvalidCursor(_))
    ));
    assert!(matches!(
        Cursor::from_token("deadbeef"),
        Err(LedgerError::InvalidCursor(_))
    ));
}

#[test]
fn test_cursor_from_other_chain_rejected() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::create(test_config(&dir)).unwrap();
    ledger.ingest(event("0x1", 1)).unwrap();
    ledger.ingest(event("0x2", 2)).unwrap();

    let page = ledger
        .query_by_chain("eth", BlockRange::all(), 1, None)
        .unwrap();
    let cursor = page.next_cursor.unwrap();

    let result = ledger.query_by_chain("polygon", BlockRange::all(), 1, Some(&cursor));
    assert!(matches!(result, Err(LedgerError::InvalidCursor(_))));
}

#[test]
fn test_zero_limit() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::create(test_config(&dir)).unwrap();

    let result = ledger.query_by_address("eth", "0xaaa", BlockRange::all(), 0, None);
    assert!(matches!(result, Err(LedgerError::InvalidQuery(_))));
}

// --- Outcome Conversion ---

#[test]
fn test_outcomes_as_errors() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::create(test_config(&dir)).unwrap();

    ledger.ingest(event("0x1", 1)).unwrap();
    let err = ledger
        .ingest(event("0x1", 2))
        .unwrap()
        .into_result()
        .unwrap_err();
    assert_eq!(err.code(), "conflict");
    assert!(err.to_string().contains("0x1"));

    let err = ledger
        .ingest(event("0x2", -1))
        .unwrap()
        .into_result()
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Validation(ValidationError::NegativeBlock(-1))
    ));
}

#[test]
fn test_supersede_rejects_invalid_record() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::create(test_config(&dir)).unwrap();
    ledger.ingest(event("0x1", 1)).unwrap();

    let outcome = ledger
        .supersede(InteractionRecord::new("0x1", 2, "", "0xccc", "eth"), "ops")
        .unwrap();
    assert_eq!(
        outcome,
        WriteOutcome::Rejected(ValidationError::EmptyField("address"))
    );
    assert_eq!(ledger.get("0x1").unwrap().unwrap().block, 1);
}

#[test]
fn test_invalidate_unknown_hash() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::create(test_config(&dir)).unwrap();

    assert!(matches!(
        ledger.invalidate("0x404", "ops"),
        Err(LedgerError::RecordNotFound(_))
    ));
}

// --- Unicode ---

#[test]
fn test_unicode_identifiers() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::create(test_config(&dir)).unwrap();

    let outcome = ledger
        .ingest(IngestEvent::new("tx-日本", 1, "アドレス", "契約", "チェーン"))
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Accepted);

    let page = ledger
        .query_by_contract("チェーン", "契約", BlockRange::all(), 10, None)
        .unwrap();
    assert_eq!(page.records[0].address, "アドレス");
}
