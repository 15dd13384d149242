//! Budget ledger: cumulative spend per `(product, bucket, UTC day)`.
//!
//! The in-memory totals are a cache, never the authority: they are built
//! only by replaying the event log at startup and mutated only inside
//! `reserve_spend`, after its ledger append has been acknowledged. Requests
//! for the same `(product, bucket)` serialize; different keys proceed
//! independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rust_decimal::Decimal;

use crate::config::{utc_day, Config};
use crate::ledger::{EventBody, EventLog, LedgerRecord};
use crate::safety::SafetyToken;
use crate::types::{BudgetBucket, DecisionReason, SpendRequest};

/// Cap lookup for a request. Per-product overrides apply to the learning
/// bucket, where per-product experiments get individual budgets.
#[derive(Debug, Clone)]
pub struct CapTable {
    daily: HashMap<BudgetBucket, Decimal>,
    product_daily: HashMap<String, Decimal>,
    learning_total: Option<Decimal>,
}

impl CapTable {
    pub fn from_config(cfg: &Config) -> Self {
        CapTable {
            daily: cfg.daily_caps.clone(),
            product_daily: cfg.product_daily_caps.clone(),
            learning_total: cfg.learning_total_cap,
        }
    }

    pub fn daily_cap(&self, product_id: &str, bucket: BudgetBucket) -> Option<Decimal> {
        if bucket == BudgetBucket::Learning {
            if let Some(cap) = self.product_daily.get(product_id) {
                return Some(*cap);
            }
        }
        self.daily.get(&bucket).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    Granted { new_total: Decimal, seq: u64 },
    Denied(DecisionReason),
}

#[derive(Debug, Default)]
struct BucketTotals {
    by_day: HashMap<u64, Decimal>,
    lifetime: Decimal,
}

pub struct Vault {
    caps: CapTable,
    ledger: Arc<Mutex<EventLog>>,
    totals: Mutex<HashMap<(String, BudgetBucket), Arc<Mutex<BucketTotals>>>>,
}

impl Vault {
    pub fn new(caps: CapTable, ledger: Arc<Mutex<EventLog>>) -> Self {
        Vault {
            caps,
            ledger,
            totals: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuilds totals from replayed records. Committed events are the only
    /// source of spend.
    pub fn load(&self, records: &[LedgerRecord]) {
        let mut map = self.totals.lock().unwrap_or_else(|p| p.into_inner());
        map.clear();
        for record in records {
            if let EventBody::SpendCommitted {
                product_id,
                bucket,
                day,
                amount,
                ..
            } = &record.body
            {
                let entry = map
                    .entry((product_id.clone(), *bucket))
                    .or_insert_with(|| Arc::new(Mutex::new(BucketTotals::default())));
                let mut totals = entry.lock().unwrap_or_else(|p| p.into_inner());
                let day_total = totals.by_day.get(day).copied().unwrap_or(Decimal::ZERO) + *amount;
                totals.by_day.insert(*day, day_total);
                totals.lifetime += *amount;
            }
        }
    }

    pub fn caps(&self) -> &CapTable {
        &self.caps
    }

    /// Atomically checks the budget and, if the spend fits, records it:
    /// append to the ledger (fsync'd), then update the cache, all inside the
    /// per-key critical section. The `SafetyToken` parameter is the
    /// type-level proof that the safety gate ran.
    pub fn reserve_spend(&self, _token: &SafetyToken, req: &SpendRequest, now: u64) -> ReserveOutcome {
        let day = utc_day(now);
        let cap = match self.caps.daily_cap(&req.product_id, req.bucket) {
            Some(c) => c,
            None => return ReserveOutcome::Denied(DecisionReason::BucketUnknown),
        };

        let entry = {
            let mut map = match self.totals.lock() {
                Ok(m) => m,
                Err(_) => {
                    return ReserveOutcome::Denied(DecisionReason::VaultUnavailable {
                        detail: "vault lock poisoned".to_string(),
                    })
                }
            };
            map.entry((req.product_id.clone(), req.bucket))
                .or_insert_with(|| Arc::new(Mutex::new(BucketTotals::default())))
                .clone()
        };

        let mut totals = match entry.lock() {
            Ok(t) => t,
            Err(_) => {
                return ReserveOutcome::Denied(DecisionReason::VaultUnavailable {
                    detail: "vault entry lock poisoned".to_string(),
                })
            }
        };

        let spent = totals.by_day.get(&day).copied().unwrap_or(Decimal::ZERO);
        let new_total = spent + req.amount;
        if new_total > cap {
            return ReserveOutcome::Denied(DecisionReason::CapExceeded { cap, spent });
        }
        if req.bucket == BudgetBucket::Learning {
            if let Some(total_cap) = self.caps.learning_total {
                if totals.lifetime + req.amount > total_cap {
                    return ReserveOutcome::Denied(DecisionReason::CapExceeded {
                        cap: total_cap,
                        spent: totals.lifetime,
                    });
                }
            }
        }

        let body = EventBody::SpendCommitted {
            product_id: req.product_id.clone(),
            bucket: req.bucket,
            day,
            amount: req.amount,
            new_total,
            idempotency_key: req.idempotency_key.as_str().to_string(),
            correlation_id: req.correlation_id.clone(),
        };
        let seq = {
            let mut ledger = match self.ledger.lock() {
                Ok(l) => l,
                Err(_) => {
                    return ReserveOutcome::Denied(DecisionReason::VaultUnavailable {
                        detail: "ledger lock poisoned".to_string(),
                    })
                }
            };
            match ledger.append(now, &body) {
                Ok(seq) => seq,
                // A backend failure is never reported as "no budget".
                Err(e) => {
                    return ReserveOutcome::Denied(DecisionReason::VaultUnavailable {
                        detail: e.to_string(),
                    })
                }
            }
        };

        // Durable commit acknowledged; now the cache may move.
        totals.by_day.insert(day, new_total);
        totals.lifetime += req.amount;
        ReserveOutcome::Granted { new_total, seq }
    }

    pub fn spent_on(&self, product_id: &str, bucket: BudgetBucket, day: u64) -> Decimal {
        let map = match self.totals.lock() {
            Ok(m) => m,
            Err(_) => return Decimal::ZERO,
        };
        map.get(&(product_id.to_string(), bucket))
            .and_then(|e| e.lock().ok().map(|t| t.by_day.get(&day).copied().unwrap_or(Decimal::ZERO)))
            .unwrap_or(Decimal::ZERO)
    }

    pub fn lifetime_spent(&self, product_id: &str, bucket: BudgetBucket) -> Decimal {
        let map = match self.totals.lock() {
            Ok(m) => m,
            Err(_) => return Decimal::ZERO,
        };
        map.get(&(product_id.to_string(), bucket))
            .and_then(|e| e.lock().ok().map(|t| t.lifetime))
            .unwrap_or(Decimal::ZERO)
    }
}
