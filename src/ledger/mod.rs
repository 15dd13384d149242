//! Durable event log: append-only NDJSON, hash-chained, fsync'd.
//!
//! Every spend decision and safety-state change lands here before it is
//! considered final. Records are never mutated or deleted; sequence numbers
//! are gap-free; each record's hash covers its predecessor's hash, so any
//! after-the-fact edit or truncation breaks the chain and is detected at
//! startup.
//!
//! Two durability tiers:
//! - critical: `append` returns only after the bytes are fsync'd. Budget and
//!   kill-switch changes always use this tier.
//! - informational: buffered, synced at a bounded interval. Callers writing
//!   this tier accept that a crash can lose the tail.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{BudgetBucket, DecisionReason};

/// prev_hash of the first record.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Critical,
    Informational,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventBody {
    SpendCommitted {
        product_id: String,
        bucket: BudgetBucket,
        day: u64,
        amount: Decimal,
        new_total: Decimal,
        idempotency_key: String,
        correlation_id: String,
    },
    SpendDenied {
        product_id: String,
        bucket: BudgetBucket,
        day: u64,
        amount: Decimal,
        reason: DecisionReason,
        idempotency_key: String,
        correlation_id: String,
    },
    SpendReserved {
        idempotency_key: String,
        product_id: String,
        reserved_ts: u64,
    },
    KillSwitchChanged {
        scope: String,
        active: bool,
        reason: String,
    },
    CircuitTransition {
        from: String,
        to: String,
        cooldown_secs: u64,
    },
}

impl EventBody {
    pub fn durability(&self) -> Durability {
        match self {
            EventBody::SpendCommitted { .. }
            | EventBody::SpendDenied { .. }
            | EventBody::KillSwitchChanged { .. } => Durability::Critical,
            EventBody::SpendReserved { .. } | EventBody::CircuitTransition { .. } => {
                Durability::Informational
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub seq: u64,
    pub ts: u64,
    pub body: EventBody,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug)]
pub enum LedgerError {
    /// Chain mismatch, bad record, or sequence gap. Fatal: spend processing
    /// must halt until an operator intervenes.
    Corrupt { line: usize, detail: String },
    Io(std::io::Error),
    Encode(serde_json::Error),
    /// A previous write failed partway; the on-disk tail is unknown, so the
    /// log refuses further appends until the process restarts and re-verifies.
    Wedged,
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Corrupt { line, detail } => {
                write!(f, "corrupt ledger at line {}: {}", line, detail)
            }
            LedgerError::Io(e) => write!(f, "ledger io error: {}", e),
            LedgerError::Encode(e) => write!(f, "ledger encode error: {}", e),
            LedgerError::Wedged => write!(f, "ledger wedged after failed write"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        LedgerError::Io(e)
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Encode(e)
    }
}

fn chain_hash(prev_hash: &str, seq: u64, ts: u64, body_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(seq.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(ts.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(body_json.as_bytes());
    hex::encode(hasher.finalize())
}

fn verify_record(record: &LedgerRecord, expected_seq: u64, prev_hash: &str, line: usize) -> Result<(), LedgerError> {
    if record.seq != expected_seq {
        return Err(LedgerError::Corrupt {
            line,
            detail: format!("sequence gap: expected {}, found {}", expected_seq, record.seq),
        });
    }
    if record.prev_hash != prev_hash {
        return Err(LedgerError::Corrupt {
            line,
            detail: format!("prev_hash mismatch at seq {}", record.seq),
        });
    }
    let body_json = serde_json::to_string(&record.body)?;
    let recomputed = chain_hash(prev_hash, record.seq, record.ts, &body_json);
    if recomputed != record.hash {
        return Err(LedgerError::Corrupt {
            line,
            detail: format!("hash mismatch at seq {}", record.seq),
        });
    }
    Ok(())
}

/// Parses and chain-verifies the file. A final fragment without a trailing
/// newline is a torn write from a crash mid-append: that event was never
/// acknowledged, so it is dropped (`truncate_at` reports where). A complete
/// line that fails to parse or verify is corruption.
fn read_records(path: &Path) -> Result<(Vec<LedgerRecord>, Option<u64>), LedgerError> {
    if !path.exists() {
        return Ok((Vec::new(), None));
    }
    let raw = std::fs::read_to_string(path)?;
    let mut records = Vec::new();
    let mut prev_hash = GENESIS_HASH.to_string();
    let mut offset: u64 = 0;
    let mut truncate_at = None;
    let mut line_no = 0usize;

    let mut rest = raw.as_str();
    while !rest.is_empty() {
        line_no += 1;
        match rest.find('\n') {
            None => {
                // Torn tail: unacknowledged, drop it.
                truncate_at = Some(offset);
                break;
            }
            Some(nl) => {
                let line = &rest[..nl];
                if !line.trim().is_empty() {
                    let record: LedgerRecord =
                        serde_json::from_str(line).map_err(|e| LedgerError::Corrupt {
                            line: line_no,
                            detail: format!("unparseable record: {}", e),
                        })?;
                    verify_record(&record, records.len() as u64 + 1, &prev_hash, line_no)?;
                    prev_hash = record.hash.clone();
                    records.push(record);
                }
                offset += nl as u64 + 1;
                rest = &rest[nl + 1..];
            }
        }
    }
    Ok((records, truncate_at))
}

#[derive(Debug)]
pub struct EventLog {
    file: File,
    path: PathBuf,
    next_seq: u64,
    last_hash: String,
    wedged: bool,
    unsynced: u32,
    last_sync: Instant,
    info_flush: Duration,
}

impl EventLog {
    /// Opens the log, verifying the full chain, and returns it alongside the
    /// replayed records for state reconstruction.
    pub fn open(path: &str, info_flush_secs: u64) -> Result<(Self, Vec<LedgerRecord>), LedgerError> {
        let path_buf = PathBuf::from(path);
        if let Some(parent) = path_buf.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let (records, truncate_at) = read_records(&path_buf)?;
        if let Some(len) = truncate_at {
            let f = OpenOptions::new().write(true).open(&path_buf)?;
            f.set_len(len)?;
            f.sync_all()?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path_buf)?;
        let (next_seq, last_hash) = match records.last() {
            Some(last) => (last.seq + 1, last.hash.clone()),
            None => (1, GENESIS_HASH.to_string()),
        };
        let log = EventLog {
            file,
            path: path_buf,
            next_seq,
            last_hash,
            wedged: false,
            unsynced: 0,
            last_sync: Instant::now(),
            info_flush: Duration::from_secs(info_flush_secs),
        };
        Ok((log, records))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one event and returns its sequence number. For critical events
    /// this does not return until the record is fsync'd; failure here must
    /// fail the originating request, never drop silently.
    pub fn append(&mut self, ts: u64, body: &EventBody) -> Result<u64, LedgerError> {
        if self.wedged {
            return Err(LedgerError::Wedged);
        }
        let seq = self.next_seq;
        let body_json = serde_json::to_string(body)?;
        let hash = chain_hash(&self.last_hash, seq, ts, &body_json);
        let record = LedgerRecord {
            seq,
            ts,
            body: body.clone(),
            prev_hash: self.last_hash.clone(),
            hash: hash.clone(),
        };
        let line = serde_json::to_string(&record)?;

        let result = self.write_line(&line, body.durability());
        if let Err(e) = result {
            // The tail on disk is now unknown; a second append could fork the
            // chain. Refuse everything until restart re-verifies.
            self.wedged = true;
            return Err(LedgerError::Io(e));
        }
        self.next_seq = seq + 1;
        self.last_hash = hash;
        Ok(seq)
    }

    fn write_line(&mut self, line: &str, durability: Durability) -> std::io::Result<()> {
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        match durability {
            Durability::Critical => {
                self.file.sync_all()?;
                self.unsynced = 0;
                self.last_sync = Instant::now();
            }
            Durability::Informational => {
                self.unsynced += 1;
                if self.last_sync.elapsed() >= self.info_flush {
                    self.file.sync_all()?;
                    self.unsynced = 0;
                    self.last_sync = Instant::now();
                }
            }
        }
        Ok(())
    }

    /// Forces the informational tail to stable storage.
    pub fn sync(&mut self) -> std::io::Result<()> {
        if self.unsynced > 0 {
            self.file.sync_all()?;
            self.unsynced = 0;
            self.last_sync = Instant::now();
        }
        Ok(())
    }

    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Standalone chain verification; used by the operator `verify` command
    /// and the corruption tests.
    pub fn verify_file(path: &str) -> Result<u64, LedgerError> {
        let (records, _) = read_records(Path::new(path))?;
        Ok(records.len() as u64)
    }

    /// Replays records from `from_seq` (inclusive) without holding the log open.
    pub fn replay_file(path: &str, from_seq: u64) -> Result<Vec<LedgerRecord>, LedgerError> {
        let (records, _) = read_records(Path::new(path))?;
        Ok(records.into_iter().filter(|r| r.seq >= from_seq).collect())
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed(key: &str, cents: i64) -> EventBody {
        EventBody::SpendCommitted {
            product_id: "p1".to_string(),
            bucket: BudgetBucket::Learning,
            day: 20_000,
            amount: Decimal::new(cents, 2),
            new_total: Decimal::new(cents, 2),
            idempotency_key: key.to_string(),
            correlation_id: "c1".to_string(),
        }
    }

    #[test]
    fn test_append_replay_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spend.ledger");
        let path = path.to_str().unwrap();

        {
            let (mut log, records) = EventLog::open(path, 1).unwrap();
            assert!(records.is_empty());
            assert_eq!(log.append(1000, &committed("k1", 1500)).unwrap(), 1);
            assert_eq!(log.append(1001, &committed("k2", 500)).unwrap(), 2);
        }

        let (log, records) = EventLog::open(path, 1).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].seq, 1);
        assert_eq!(records[1].prev_hash, records[0].hash);
        assert_eq!(log.last_seq(), 2);
    }

    #[test]
    fn test_sequence_numbers_gap_free() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spend.ledger");
        let path = path.to_str().unwrap();

        let (mut log, _) = EventLog::open(path, 1).unwrap();
        for i in 0..10 {
            let seq = log.append(1000 + i, &committed(&format!("k{}", i), 100)).unwrap();
            assert_eq!(seq, i + 1);
        }
    }

    #[test]
    fn test_flipped_byte_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spend.ledger");
        let path_str = path.to_str().unwrap();

        {
            let (mut log, _) = EventLog::open(path_str, 1).unwrap();
            log.append(1000, &committed("k1", 1500)).unwrap();
            log.append(1001, &committed("k2", 500)).unwrap();
        }

        // Flip one byte inside the first record's payload.
        let mut bytes = std::fs::read(&path).unwrap();
        let pos = bytes.iter().position(|&b| b == b'p').unwrap();
        bytes[pos] = b'q';
        std::fs::write(&path, &bytes).unwrap();

        match EventLog::open(path_str, 1) {
            Err(LedgerError::Corrupt { .. }) => {}
            other => panic!("expected corruption, got {:?}", other.map(|(l, r)| (l.last_seq(), r.len()))),
        }
    }

    #[test]
    fn test_truncated_history_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spend.ledger");
        let path_str = path.to_str().unwrap();

        {
            let (mut log, _) = EventLog::open(path_str, 1).unwrap();
            log.append(1000, &committed("k1", 1500)).unwrap();
            log.append(1001, &committed("k2", 500)).unwrap();
            log.append(1002, &committed("k3", 700)).unwrap();
        }

        // Delete the middle line: seq gap plus chain break.
        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        std::fs::write(&path, format!("{}\n{}\n", lines[0], lines[2])).unwrap();

        assert!(matches!(
            EventLog::verify_file(path_str),
            Err(LedgerError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_torn_tail_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spend.ledger");
        let path_str = path.to_str().unwrap();

        {
            let (mut log, _) = EventLog::open(path_str, 1).unwrap();
            log.append(1000, &committed("k1", 1500)).unwrap();
        }

        // Simulate a crash mid-append: a half-written record with no newline.
        use std::io::Write as _;
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"seq\":2,\"ts\":1001,\"bo").unwrap();
        drop(f);

        let (mut log, records) = EventLog::open(path_str, 1).unwrap();
        assert_eq!(records.len(), 1);
        // The log continues cleanly from the surviving prefix.
        assert_eq!(log.append(1002, &committed("k2", 500)).unwrap(), 2);
        drop(log);
        assert_eq!(EventLog::verify_file(path_str).unwrap(), 2);
    }

    #[test]
    fn test_reason_payload_survives_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spend.ledger");
        let path_str = path.to_str().unwrap();

        let denied = EventBody::SpendDenied {
            product_id: "p9".to_string(),
            bucket: BudgetBucket::Operational,
            day: 20_001,
            amount: Decimal::new(999, 2),
            reason: DecisionReason::CapExceeded {
                cap: Decimal::new(3000, 2),
                spent: Decimal::new(2500, 2),
            },
            idempotency_key: "k-denied".to_string(),
            correlation_id: "c9".to_string(),
        };
        {
            let (mut log, _) = EventLog::open(path_str, 1).unwrap();
            log.append(1000, &denied).unwrap();
        }
        let records = EventLog::replay_file(path_str, 1).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].body, denied);
    }
}
