//! The mandatory pre-spend checkpoint.
//!
//! Check order is fixed: kill switch, then circuit breaker, then risk
//! limits. The first failing check short-circuits. A cleared check mints a
//! [`SafetyToken`], which is the only way to call the vault's reservation,
//! so a spend path that skips the gate is a type error, not a runtime bug.

pub mod circuit;
pub mod killswitch;
pub mod limits;

use std::sync::{Arc, Mutex};

use rust_decimal::Decimal;

use crate::config::Config;
use crate::ledger::{EventBody, EventLog};
use crate::logging::{json_log, obj, v_num, v_str};
use crate::safety::circuit::{CircuitBreaker, CircuitConfig};
use crate::safety::killswitch::KillSwitch;
use crate::safety::limits::{RiskLimits, RiskViolation};
use crate::types::{BudgetBucket, DecisionReason};

/// Proof that the safety gate cleared this request. Cannot be constructed
/// outside this module.
#[derive(Debug)]
pub struct SafetyToken {
    /// True when clearing consumed the circuit's half-open trial slot; the
    /// gateway releases it if the request dies before any downstream call.
    pub(crate) probe_armed: bool,
    _priv: (),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyDeny {
    KillswitchActive { scope: String, reason: String },
    CircuitOpen { retry_after_secs: u64 },
    AllocationOverShare { share_limit: Decimal, cap: Decimal },
}

impl SafetyDeny {
    pub fn into_reason(self) -> DecisionReason {
        match self {
            SafetyDeny::KillswitchActive { scope, .. } => DecisionReason::KillswitchActive { scope },
            SafetyDeny::CircuitOpen { retry_after_secs } => DecisionReason::CircuitOpen { retry_after_secs },
            SafetyDeny::AllocationOverShare { share_limit, .. } => {
                DecisionReason::RiskLimitExceeded { share_limit }
            }
        }
    }
}

#[derive(Debug)]
pub enum SafetyDecision {
    Cleared(SafetyToken),
    Denied(SafetyDeny),
}

pub struct SafetyGate {
    kill: Arc<KillSwitch>,
    circuit: Mutex<CircuitBreaker>,
    limits: RiskLimits,
    ledger: Arc<Mutex<EventLog>>,
}

impl SafetyGate {
    pub fn new(cfg: &Config, kill: Arc<KillSwitch>, ledger: Arc<Mutex<EventLog>>, now: u64) -> Self {
        let circuit = CircuitBreaker::load(
            CircuitConfig {
                failure_threshold: cfg.failure_threshold,
                success_threshold: cfg.success_threshold,
                cooldown_secs: cfg.cooldown_secs,
                max_cooldown_secs: cfg.max_cooldown_secs,
            },
            &cfg.circuit_path,
            now,
        );
        SafetyGate {
            kill,
            circuit: Mutex::new(circuit),
            limits: RiskLimits {
                max_allocation_share: cfg.max_allocation_share,
            },
            ledger,
        }
    }

    pub fn pre_spend_check(
        &self,
        product_id: &str,
        bucket: BudgetBucket,
        amount: Decimal,
        daily_cap: Option<Decimal>,
        correlation_id: &str,
        now: u64,
    ) -> SafetyDecision {
        // 1. Kill switch. When active, nothing else is consulted.
        if let Some((scope, act)) = self.kill.active_for(bucket, product_id) {
            json_log(
                "safety_gate",
                obj(&[
                    ("check", v_str("killswitch")),
                    ("result", v_str("deny")),
                    ("scope", v_str(&scope.key())),
                    ("corr_id", v_str(correlation_id)),
                ]),
            );
            return SafetyDecision::Denied(SafetyDeny::KillswitchActive {
                scope: scope.key(),
                reason: act.reason,
            });
        }

        // 2. Circuit breaker.
        let probe_armed;
        {
            let mut circuit = match self.circuit.lock() {
                Ok(c) => c,
                Err(_) => {
                    return SafetyDecision::Denied(SafetyDeny::CircuitOpen { retry_after_secs: 0 })
                }
            };
            let was_half_open_entry = circuit.state() != circuit::CircuitState::Closed;
            if !circuit.allow(now) {
                let retry_after_secs = circuit.retry_after(now);
                json_log(
                    "safety_gate",
                    obj(&[
                        ("check", v_str("circuit")),
                        ("result", v_str("deny")),
                        ("retry_after_secs", v_num(retry_after_secs)),
                        ("corr_id", v_str(correlation_id)),
                    ]),
                );
                return SafetyDecision::Denied(SafetyDeny::CircuitOpen { retry_after_secs });
            }
            probe_armed = was_half_open_entry;
        }

        // 3. Risk limits.
        if let Err(RiskViolation::AllocationOverShare { share_limit, cap }) =
            self.limits.evaluate(amount, daily_cap)
        {
            if probe_armed {
                self.abort_probe();
            }
            json_log(
                "safety_gate",
                obj(&[
                    ("check", v_str("risk_limits")),
                    ("result", v_str("deny")),
                    ("corr_id", v_str(correlation_id)),
                ]),
            );
            return SafetyDecision::Denied(SafetyDeny::AllocationOverShare { share_limit, cap });
        }

        SafetyDecision::Cleared(SafetyToken {
            probe_armed,
            _priv: (),
        })
    }

    /// Releases a half-open trial slot consumed by a request that never made
    /// its downstream call.
    pub fn abort_probe(&self) {
        if let Ok(mut circuit) = self.circuit.lock() {
            circuit.abort_probe();
        }
    }

    pub fn record_downstream_success(&self, now: u64) {
        let transition = match self.circuit.lock() {
            Ok(mut c) => c.record_success(now),
            Err(_) => None,
        };
        self.audit_transition(transition, now);
    }

    pub fn record_downstream_failure(&self, now: u64) {
        let transition = match self.circuit.lock() {
            Ok(mut c) => c.record_failure(now),
            Err(_) => None,
        };
        self.audit_transition(transition, now);
    }

    pub fn circuit_state(&self) -> circuit::CircuitState {
        self.circuit
            .lock()
            .map(|c| c.state())
            .unwrap_or(circuit::CircuitState::Open)
    }

    fn audit_transition(&self, transition: Option<(circuit::CircuitState, circuit::CircuitState)>, now: u64) {
        let Some((from, to)) = transition else {
            return;
        };
        let cooldown_secs = self
            .circuit
            .lock()
            .map(|c| c.current_cooldown_secs())
            .unwrap_or(0);
        json_log(
            "circuit",
            obj(&[
                ("from", v_str(from.as_str())),
                ("to", v_str(to.as_str())),
                ("cooldown_secs", v_num(cooldown_secs)),
            ]),
        );
        if let Ok(mut ledger) = self.ledger.lock() {
            let _ = ledger.append(
                now,
                &EventBody::CircuitTransition {
                    from: from.as_str().to_string(),
                    to: to.as_str().to_string(),
                    cooldown_secs,
                },
            );
        }
    }
}
