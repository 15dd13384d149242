//! Spend gateway: the single entry point for spend authorization.
//!
//! Request flow, each step a hard gate:
//! 1. idempotency claim (replay if the key has a decision; duplicates of an
//!    in-process key wait for its decision),
//! 2. safety gate (kill switch, circuit breaker, risk limits),
//! 3. vault reservation (budget check + durable commit),
//! 4. idempotency record.
//!
//! Crash recovery: `open` verifies the hash chain and replays the event log
//! into the vault and idempotency store, so a crash between any two steps
//! converges back to a consistent state. The ledger is authoritative
//! throughout; in-memory state is cache.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rust_decimal::Decimal;

use crate::config::{now_ts, utc_day, Config};
use crate::idempotency::{Claim, IdempotencyStore};
use crate::ledger::{EventBody, EventLog};
use crate::logging::{json_log, obj, v_bool, v_num, v_str};
use crate::safety::killswitch::{KillSwitch, Scope};
use crate::safety::{SafetyDecision, SafetyGate};
use crate::types::{DecisionReason, Outcome, SpendDecision, SpendRequest};
use crate::vault::{CapTable, ReserveOutcome, Vault};

#[derive(Debug)]
pub enum GatewayError {
    /// The same key is reserved by an execution this process cannot wait on
    /// (a pre-restart reservation under the timeout policy). Deterministic:
    /// retry after the reservation timeout.
    RequestInFlight { idempotency_key: String },
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::RequestInFlight { idempotency_key } => {
                write!(f, "request in flight for key {}", idempotency_key)
            }
        }
    }
}

impl std::error::Error for GatewayError {}

pub struct SpendGateway {
    ledger: Arc<Mutex<EventLog>>,
    vault: Vault,
    idem: IdempotencyStore,
    gate: SafetyGate,
    kill: Arc<KillSwitch>,
}

impl SpendGateway {
    /// Opens all persisted state. A broken hash chain or sequence gap is
    /// fatal here: spend processing must not start over a corrupt ledger.
    pub fn open(cfg: &Config) -> Result<Self> {
        let now = now_ts();
        let (log, records) = EventLog::open(&cfg.ledger_path, cfg.info_flush_secs)
            .with_context(|| format!("opening ledger at {}", cfg.ledger_path))?;
        let ledger = Arc::new(Mutex::new(log));

        let kill = Arc::new(KillSwitch::load(&cfg.killswitch_path, now));
        let gate = SafetyGate::new(cfg, kill.clone(), ledger.clone(), now);

        let vault = Vault::new(CapTable::from_config(cfg), ledger.clone());
        vault.load(&records);

        let idem = IdempotencyStore::new(
            cfg.idempotency_ttl_secs,
            cfg.reservation_recovery,
            cfg.reservation_timeout_secs,
        );
        idem.load(&records);

        json_log(
            "gateway",
            obj(&[
                ("status", v_str("recovered")),
                ("ledger_events", v_num(records.len() as u64)),
                ("idempotency_entries", v_num(idem.len() as u64)),
                ("killswitch_active", v_bool(kill.is_active(&Scope::System))),
                ("circuit", v_str(gate.circuit_state().as_str())),
            ]),
        );

        Ok(SpendGateway {
            ledger,
            vault,
            idem,
            gate,
            kill,
        })
    }

    /// Authorizes one spend. Runs to a terminal decision; duplicates replay.
    pub fn request(&self, req: &SpendRequest) -> std::result::Result<Outcome, GatewayError> {
        let now = now_ts();
        let key = req.idempotency_key.as_str();

        // 1. Idempotency claim.
        match self.idem.claim_blocking(key, now) {
            Claim::Replay(decision) => {
                json_log(
                    "gateway",
                    obj(&[
                        ("result", v_str("replay")),
                        ("idempotency_key", v_str(key)),
                        ("corr_id", v_str(&req.correlation_id)),
                    ]),
                );
                return Ok(Outcome::Replay(decision));
            }
            Claim::InFlight => {
                return Err(GatewayError::RequestInFlight {
                    idempotency_key: key.to_string(),
                })
            }
            Claim::Fresh => {}
        }

        // Reservation breadcrumb for restart reconciliation. Informational
        // tier: a lost reservation only ever frees a key early.
        let reserved = self.ledger.lock().map_err(|_| ()).and_then(|mut l| {
            l.append(
                now,
                &EventBody::SpendReserved {
                    idempotency_key: key.to_string(),
                    product_id: req.product_id.clone(),
                    reserved_ts: now,
                },
            )
            .map_err(|_| ())
        });
        if reserved.is_err() {
            self.idem.abandon(key);
            return Ok(Outcome::Fresh(self.unavailable(req, "ledger append failed", now)));
        }

        // 2. Safety gate.
        let daily_cap = self.vault.caps().daily_cap(&req.product_id, req.bucket);
        let token = match self.gate.pre_spend_check(
            &req.product_id,
            req.bucket,
            req.amount,
            daily_cap,
            &req.correlation_id,
            now,
        ) {
            SafetyDecision::Denied(deny) => {
                return Ok(self.settle_denied(req, deny.into_reason(), now));
            }
            SafetyDecision::Cleared(token) => token,
        };

        // 3. Vault reservation (budget check + durable commit).
        match self.vault.reserve_spend(&token, req, now) {
            ReserveOutcome::Granted { new_total, seq } => {
                let decision = SpendDecision {
                    accepted: true,
                    reason: DecisionReason::Granted,
                    amount_committed: req.amount,
                    ledger_seq: Some(seq),
                    decided_at: now,
                };
                // 4. Record for replays.
                self.idem.record(key, decision.clone(), now);
                json_log(
                    "gateway",
                    obj(&[
                        ("result", v_str("accepted")),
                        ("idempotency_key", v_str(key)),
                        ("corr_id", v_str(&req.correlation_id)),
                        ("product_id", v_str(&req.product_id)),
                        ("bucket", v_str(req.bucket.as_str())),
                        ("amount", v_str(&req.amount.to_string())),
                        ("new_total", v_str(&new_total.to_string())),
                        ("seq", v_num(seq)),
                    ]),
                );
                Ok(Outcome::Fresh(decision))
            }
            ReserveOutcome::Denied(reason) => {
                if token.probe_armed {
                    // No downstream call will happen; free the trial slot.
                    self.gate.abort_probe();
                }
                match reason {
                    DecisionReason::VaultUnavailable { detail } => {
                        // Non-terminal: the caller may retry with the same
                        // key, so nothing is recorded.
                        self.idem.abandon(key);
                        Ok(Outcome::Fresh(self.unavailable(req, &detail, now)))
                    }
                    reason => Ok(self.settle_denied(req, reason, now)),
                }
            }
        }
    }

    /// Writes the denial to the ledger and settles the idempotency key. The
    /// decision mirrors what replay reconstruction produces, so replays
    /// before and after a restart are identical.
    fn settle_denied(&self, req: &SpendRequest, reason: DecisionReason, now: u64) -> Outcome {
        let key = req.idempotency_key.as_str();
        let body = EventBody::SpendDenied {
            product_id: req.product_id.clone(),
            bucket: req.bucket,
            day: utc_day(now),
            amount: req.amount,
            reason: reason.clone(),
            idempotency_key: key.to_string(),
            correlation_id: req.correlation_id.clone(),
        };
        let seq = match self.ledger.lock().map_err(|_| ()).and_then(|mut l| l.append(now, &body).map_err(|_| ())) {
            Ok(seq) => seq,
            Err(()) => {
                // The denial could not be made durable; treat like any other
                // backend failure instead of inventing an unrecorded terminal
                // decision.
                self.idem.abandon(key);
                return Outcome::Fresh(self.unavailable(req, "ledger append failed", now));
            }
        };
        let decision = SpendDecision {
            accepted: false,
            reason,
            amount_committed: Decimal::ZERO,
            ledger_seq: Some(seq),
            decided_at: now,
        };
        self.idem.record(key, decision.clone(), now);
        json_log(
            "gateway",
            obj(&[
                ("result", v_str("denied")),
                ("reason", v_str(decision.reason.code())),
                ("idempotency_key", v_str(key)),
                ("corr_id", v_str(&req.correlation_id)),
                ("product_id", v_str(&req.product_id)),
                ("seq", v_num(seq)),
            ]),
        );
        Outcome::Fresh(decision)
    }

    fn unavailable(&self, req: &SpendRequest, detail: &str, now: u64) -> SpendDecision {
        json_log(
            "gateway",
            obj(&[
                ("result", v_str("denied")),
                ("reason", v_str("vault_unavailable")),
                ("detail", v_str(detail)),
                ("corr_id", v_str(&req.correlation_id)),
            ]),
        );
        SpendDecision {
            accepted: false,
            reason: DecisionReason::VaultUnavailable {
                detail: detail.to_string(),
            },
            amount_committed: Decimal::ZERO,
            ledger_seq: None,
            decided_at: now,
        }
    }

    /// Activates a kill-switch scope: the switch file is the recovery
    /// authority and persists first; the ledger gets the audit record.
    pub fn activate_kill(&self, scope: &Scope, reason: &str, triggered_by: &str) -> Result<()> {
        let now = now_ts();
        self.kill
            .activate(scope, reason, triggered_by, now)
            .context("persisting kill switch state")?;
        self.audit_kill(scope, true, reason, now);
        Ok(())
    }

    pub fn deactivate_kill(&self, scope: &Scope) -> Result<()> {
        let now = now_ts();
        self.kill
            .deactivate(scope)
            .context("persisting kill switch state")?;
        self.audit_kill(scope, false, "deactivated", now);
        Ok(())
    }

    fn audit_kill(&self, scope: &Scope, active: bool, reason: &str, now: u64) {
        if let Ok(mut ledger) = self.ledger.lock() {
            let _ = ledger.append(
                now,
                &EventBody::KillSwitchChanged {
                    scope: scope.key(),
                    active,
                    reason: reason.to_string(),
                },
            );
        }
        json_log(
            "killswitch",
            obj(&[
                ("scope", v_str(&scope.key())),
                ("active", v_bool(active)),
                ("reason", v_str(reason)),
            ]),
        );
    }

    /// Downstream spend-channel health, fed by the caller that actually
    /// talks to the ad APIs.
    pub fn record_downstream_success(&self) {
        self.gate.record_downstream_success(now_ts());
    }

    pub fn record_downstream_failure(&self) {
        self.gate.record_downstream_failure(now_ts());
    }

    pub fn gc_idempotency(&self) -> usize {
        self.idem.gc_expired(now_ts())
    }

    // -- Introspection for the operator binary and tests --

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill
    }

    pub fn circuit_state(&self) -> crate::safety::circuit::CircuitState {
        self.gate.circuit_state()
    }

    pub fn spent_today(&self, product_id: &str, bucket: crate::types::BudgetBucket) -> Decimal {
        self.vault.spent_on(product_id, bucket, utc_day(now_ts()))
    }

    pub fn last_seq(&self) -> u64 {
        self.ledger.lock().map(|l| l.last_seq()).unwrap_or(0)
    }

    pub fn idempotency_entries(&self) -> usize {
        self.idem.len()
    }
}
