//! Sqlite reporting mirror of the event log.
//!
//! Dashboards and ops summaries query this; the spend path never reads it.
//! Rebuilt by replaying the ledger, which stays the only authority on
//! budget state.

use anyhow::Result;
use rusqlite::{params, Connection};

use crate::ledger::{EventBody, LedgerRecord};

pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self {
            conn: Connection::open(path)?,
        })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS spend_decisions (
                seq INTEGER PRIMARY KEY,
                ts INTEGER NOT NULL,
                decision TEXT NOT NULL,
                product_id TEXT NOT NULL,
                bucket TEXT NOT NULL,
                day INTEGER NOT NULL,
                amount TEXT NOT NULL,
                reason TEXT NOT NULL,
                idempotency_key TEXT NOT NULL,
                correlation_id TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Mirrors decision events; idempotent by `seq`, so re-running over the
    /// full ledger is safe.
    pub fn mirror_from_ledger(&mut self, records: &[LedgerRecord]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut written = 0usize;
        for record in records {
            match &record.body {
                EventBody::SpendCommitted {
                    product_id,
                    bucket,
                    day,
                    amount,
                    idempotency_key,
                    correlation_id,
                    ..
                } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO spend_decisions
                         (seq, ts, decision, product_id, bucket, day, amount, reason, idempotency_key, correlation_id)
                         VALUES (?1, ?2, 'accepted', ?3, ?4, ?5, ?6, 'granted', ?7, ?8)",
                        params![
                            record.seq as i64,
                            record.ts as i64,
                            product_id,
                            bucket.as_str(),
                            *day as i64,
                            amount.to_string(),
                            idempotency_key,
                            correlation_id
                        ],
                    )?;
                    written += 1;
                }
                EventBody::SpendDenied {
                    product_id,
                    bucket,
                    day,
                    amount,
                    reason,
                    idempotency_key,
                    correlation_id,
                } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO spend_decisions
                         (seq, ts, decision, product_id, bucket, day, amount, reason, idempotency_key, correlation_id)
                         VALUES (?1, ?2, 'denied', ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            record.seq as i64,
                            record.ts as i64,
                            product_id,
                            bucket.as_str(),
                            *day as i64,
                            amount.to_string(),
                            reason.code(),
                            idempotency_key,
                            correlation_id
                        ],
                    )?;
                    written += 1;
                }
                _ => {}
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn decision_counts(&self) -> Result<(i64, i64)> {
        let accepted: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM spend_decisions WHERE decision = 'accepted'",
            [],
            |row| row.get(0),
        )?;
        let denied: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM spend_decisions WHERE decision = 'denied'",
            [],
            |row| row.get(0),
        )?;
        Ok((accepted, denied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BudgetBucket, DecisionReason};
    use rust_decimal::Decimal;

    fn records() -> Vec<LedgerRecord> {
        vec![
            LedgerRecord {
                seq: 1,
                ts: 1000,
                body: EventBody::SpendCommitted {
                    product_id: "p1".to_string(),
                    bucket: BudgetBucket::Learning,
                    day: 0,
                    amount: Decimal::new(1500, 2),
                    new_total: Decimal::new(1500, 2),
                    idempotency_key: "k1".to_string(),
                    correlation_id: "c1".to_string(),
                },
                prev_hash: String::new(),
                hash: String::new(),
            },
            LedgerRecord {
                seq: 2,
                ts: 1001,
                body: EventBody::SpendDenied {
                    product_id: "p1".to_string(),
                    bucket: BudgetBucket::Learning,
                    day: 0,
                    amount: Decimal::new(9000, 2),
                    reason: DecisionReason::CapExceeded {
                        cap: Decimal::new(3000, 2),
                        spent: Decimal::new(1500, 2),
                    },
                    idempotency_key: "k2".to_string(),
                    correlation_id: "c2".to_string(),
                },
                prev_hash: String::new(),
                hash: String::new(),
            },
            LedgerRecord {
                seq: 3,
                ts: 1002,
                body: EventBody::SpendReserved {
                    idempotency_key: "k3".to_string(),
                    product_id: "p1".to_string(),
                    reserved_ts: 1002,
                },
                prev_hash: String::new(),
                hash: String::new(),
            },
        ]
    }

    #[test]
    fn test_mirror_counts_decisions_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.sqlite");
        let mut store = StateStore::new(path.to_str().unwrap()).unwrap();
        store.init().unwrap();

        let written = store.mirror_from_ledger(&records()).unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.decision_counts().unwrap(), (1, 1));
    }

    #[test]
    fn test_mirror_is_idempotent_by_seq() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.sqlite");
        let mut store = StateStore::new(path.to_str().unwrap()).unwrap();
        store.init().unwrap();

        store.mirror_from_ledger(&records()).unwrap();
        store.mirror_from_ledger(&records()).unwrap();
        assert_eq!(store.decision_counts().unwrap(), (1, 1));
    }
}
