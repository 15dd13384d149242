//! Idempotency store: maps a caller-supplied key to its one decision.
//!
//! Durable through the event log, not through its own file: decision events
//! carry the key, so startup replay rebuilds the map. A reservation that
//! never reached a terminal event (crash mid-processing) is reconciled per
//! the configured [`RecoveryPolicy`].

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use rust_decimal::Decimal;

use crate::config::RecoveryPolicy;
use crate::ledger::{EventBody, LedgerRecord};
use crate::types::{DecisionReason, SpendDecision};

/// Result of asking for a key without blocking.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// Key is now reserved by the caller, who must eventually `record` or
    /// `abandon` it.
    Fresh,
    /// A decision already exists; return it verbatim, never re-execute.
    Replay(SpendDecision),
    /// Another execution holds the key right now.
    InFlight,
}

#[derive(Debug, Clone)]
enum Entry {
    /// Reserved by a thread in this process.
    Live { reserved_ts: u64 },
    /// Reserved before a restart with no terminal event; only exists under
    /// the timeout-abandonment policy.
    Stale { reserved_ts: u64 },
    Decided { decision: SpendDecision, decided_ts: u64 },
}

pub struct IdempotencyStore {
    entries: Mutex<HashMap<String, Entry>>,
    settled: Condvar,
    ttl_secs: u64,
    policy: RecoveryPolicy,
    timeout_secs: u64,
}

/// Rebuilds the decision a ledger record represents. Replays must be
/// verbatim, so the gateway constructs its decisions with exactly these
/// shapes.
pub fn decision_from_record(record: &LedgerRecord) -> Option<(String, SpendDecision)> {
    match &record.body {
        EventBody::SpendCommitted {
            amount,
            idempotency_key,
            ..
        } => Some((
            idempotency_key.clone(),
            SpendDecision {
                accepted: true,
                reason: DecisionReason::Granted,
                amount_committed: *amount,
                ledger_seq: Some(record.seq),
                decided_at: record.ts,
            },
        )),
        EventBody::SpendDenied {
            reason,
            idempotency_key,
            ..
        } => Some((
            idempotency_key.clone(),
            SpendDecision {
                accepted: false,
                reason: reason.clone(),
                amount_committed: Decimal::ZERO,
                ledger_seq: Some(record.seq),
                decided_at: record.ts,
            },
        )),
        _ => None,
    }
}

impl IdempotencyStore {
    pub fn new(ttl_secs: u64, policy: RecoveryPolicy, timeout_secs: u64) -> Self {
        IdempotencyStore {
            entries: Mutex::new(HashMap::new()),
            settled: Condvar::new(),
            ttl_secs,
            policy,
            timeout_secs,
        }
    }

    /// Rebuilds the map from replayed ledger records. Reservations with no
    /// terminal event either vanish (replay policy: the ledger says the
    /// spend never happened) or stay blocked until their timeout.
    pub fn load(&self, records: &[LedgerRecord]) {
        let mut map = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        map.clear();
        for record in records {
            if let EventBody::SpendReserved {
                idempotency_key,
                reserved_ts,
                ..
            } = &record.body
            {
                map.entry(idempotency_key.clone())
                    .or_insert(Entry::Stale { reserved_ts: *reserved_ts });
                continue;
            }
            if let Some((key, decision)) = decision_from_record(record) {
                let decided_ts = decision.decided_at;
                map.insert(key, Entry::Decided { decision, decided_ts });
            }
        }
        if self.policy == RecoveryPolicy::ReplayLedger {
            map.retain(|_, e| !matches!(e, Entry::Stale { .. }));
        }
    }

    pub fn check_or_reserve(&self, key: &str, now: u64) -> Claim {
        let mut map = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        self.claim_locked(&mut map, key, now)
    }

    /// Like `check_or_reserve`, but waits for an in-process holder of the
    /// same key to settle, then replays its decision. A stale pre-restart
    /// reservation cannot be waited on (no thread will settle it); it stays
    /// `InFlight` until its timeout passes.
    pub fn claim_blocking(&self, key: &str, now: u64) -> Claim {
        let mut map = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            match self.claim_locked(&mut map, key, now) {
                Claim::InFlight if matches!(map.get(key), Some(Entry::Live { .. })) => {
                    map = self.settled.wait(map).unwrap_or_else(|p| p.into_inner());
                }
                claim => return claim,
            }
        }
    }

    fn claim_locked(&self, map: &mut HashMap<String, Entry>, key: &str, now: u64) -> Claim {
        match map.get(key).cloned() {
            None => {
                map.insert(key.to_string(), Entry::Live { reserved_ts: now });
                Claim::Fresh
            }
            Some(Entry::Decided { decision, .. }) => Claim::Replay(decision),
            Some(Entry::Live { .. }) => Claim::InFlight,
            Some(Entry::Stale { reserved_ts }) => {
                if now >= reserved_ts + self.timeout_secs {
                    // Abandoned: the pre-crash execution never committed.
                    map.insert(key.to_string(), Entry::Live { reserved_ts: now });
                    Claim::Fresh
                } else {
                    Claim::InFlight
                }
            }
        }
    }

    /// Settles a reservation with its terminal decision.
    pub fn record(&self, key: &str, decision: SpendDecision, now: u64) {
        let mut map = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        map.insert(
            key.to_string(),
            Entry::Decided {
                decision,
                decided_ts: now,
            },
        );
        self.settled.notify_all();
    }

    /// Drops a reservation whose request ended without a terminal decision
    /// (e.g. vault unavailable); the key becomes retryable immediately.
    pub fn abandon(&self, key: &str) {
        let mut map = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if matches!(map.get(key), Some(Entry::Live { .. })) {
            map.remove(key);
        }
        self.settled.notify_all();
    }

    /// Removes decided entries older than the TTL. Reservations are never
    /// collected; a decision still inside its TTL is still replayable.
    pub fn gc_expired(&self, now: u64) -> usize {
        let mut map = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let before = map.len();
        map.retain(|_, e| match e {
            Entry::Decided { decided_ts, .. } => now.saturating_sub(*decided_ts) < self.ttl_secs,
            _ => true,
        });
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
