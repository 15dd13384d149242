//! Circuit breaker over the downstream spend channel.
//!
//! CLOSED counts consecutive failures and trips OPEN at the threshold. OPEN
//! blocks until the cooldown elapses, then HALF_OPEN admits one trial call
//! at a time; the trial's outcome drives the transition. The cooldown
//! doubles on every HALF_OPEN failure, capped at a maximum, and resets to
//! the base value only once the breaker fully closes.
//!
//! State persists as a small JSON document. A corrupt state file loads as
//! OPEN at max cooldown: fail closed, never fail open.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::logging::{json_log, obj, v_str};
use crate::safety::killswitch::atomic_write_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_secs: u64,
    pub max_cooldown_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCircuit {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure_ts: Option<u64>,
    current_cooldown: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    cfg: CircuitConfig,
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure_ts: Option<u64>,
    current_cooldown: u64,
    probe_in_flight: bool,
    state_file: Option<PathBuf>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitConfig) -> Self {
        let base = cfg.cooldown_secs;
        CircuitBreaker {
            cfg,
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure_ts: None,
            current_cooldown: base,
            probe_in_flight: false,
            state_file: None,
        }
    }

    pub fn load(cfg: CircuitConfig, path: &str, now: u64) -> Self {
        let mut cb = Self::new(cfg);
        cb.state_file = Some(PathBuf::from(path));
        let file = PathBuf::from(path);
        if !file.exists() {
            return cb;
        }
        match std::fs::read_to_string(&file)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<PersistedCircuit>(&raw).map_err(|e| e.to_string()))
        {
            Ok(p) => {
                cb.state = p.state;
                cb.failures = p.failures;
                cb.successes = p.successes;
                cb.last_failure_ts = p.last_failure_ts;
                cb.current_cooldown = p.current_cooldown.clamp(cb.cfg.cooldown_secs, cb.cfg.max_cooldown_secs);
            }
            Err(detail) => {
                cb.state = CircuitState::Open;
                cb.failures = cb.cfg.failure_threshold;
                cb.successes = 0;
                cb.last_failure_ts = Some(now);
                cb.current_cooldown = cb.cfg.max_cooldown_secs;
                cb.persist();
                json_log(
                    "circuit",
                    obj(&[("status", v_str("fail_closed")), ("detail", v_str(&detail))]),
                );
            }
        }
        cb
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn current_cooldown_secs(&self) -> u64 {
        self.current_cooldown
    }

    /// Seconds until the next trial is admitted; 0 when calls are allowed.
    pub fn retry_after(&self, now: u64) -> u64 {
        match self.state {
            CircuitState::Open => {
                let since = self.last_failure_ts.map(|t| now.saturating_sub(t)).unwrap_or(u64::MAX);
                self.current_cooldown.saturating_sub(since)
            }
            _ => 0,
        }
    }

    /// In OPEN: false until the cooldown has elapsed, then transitions to
    /// HALF_OPEN and admits the trial. In HALF_OPEN: admits one trial at a
    /// time; the next is admitted only after the current one reports.
    pub fn allow(&mut self, now: u64) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.cooldown_elapsed(now) {
                    self.transition(CircuitState::HalfOpen);
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Releases an admitted trial slot without an outcome, e.g. when the
    /// request was denied downstream of the gate and no call was made.
    pub fn abort_probe(&mut self) {
        self.probe_in_flight = false;
    }

    /// Returns `(from, to)` when the call caused a state transition.
    pub fn record_success(&mut self, _now: u64) -> Option<(CircuitState, CircuitState)> {
        self.probe_in_flight = false;
        self.successes += 1;
        self.failures = 0;
        if self.state == CircuitState::HalfOpen && self.successes >= self.cfg.success_threshold {
            let from = self.state;
            self.current_cooldown = self.cfg.cooldown_secs;
            self.transition(CircuitState::Closed);
            return Some((from, CircuitState::Closed));
        }
        self.persist();
        None
    }

    pub fn record_failure(&mut self, now: u64) -> Option<(CircuitState, CircuitState)> {
        self.probe_in_flight = false;
        self.failures += 1;
        self.successes = 0;
        self.last_failure_ts = Some(now);
        let from = self.state;
        match self.state {
            CircuitState::Closed if self.failures >= self.cfg.failure_threshold => {
                self.transition(CircuitState::Open);
                Some((from, CircuitState::Open))
            }
            CircuitState::HalfOpen => {
                // Failed trial: back to OPEN with a doubled cooldown.
                self.current_cooldown =
                    (self.current_cooldown * 2).min(self.cfg.max_cooldown_secs);
                self.transition(CircuitState::Open);
                Some((from, CircuitState::Open))
            }
            _ => {
                self.persist();
                None
            }
        }
    }

    fn cooldown_elapsed(&self, now: u64) -> bool {
        match self.last_failure_ts {
            None => true,
            Some(t) => now.saturating_sub(t) >= self.current_cooldown,
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.persist();
    }

    fn persist(&self) {
        let Some(path) = &self.state_file else {
            return;
        };
        let doc = json!({
            "state": self.state,
            "failures": self.failures,
            "successes": self.successes,
            "last_failure_ts": self.last_failure_ts,
            "current_cooldown": self.current_cooldown,
        });
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        // Persistence failure must not crash the caller; state stays correct
        // in memory and the next transition retries the write.
        if let Err(e) = atomic_write_json(path, &doc) {
            json_log(
                "circuit",
                obj(&[("status", v_str("persist_failed")), ("detail", v_str(&e.to_string()))]),
            );
        }
    }
}
