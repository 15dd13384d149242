//! Restart durability: every safety-relevant state must be reconstructable
//! from persisted files alone. "Restart" here means dropping the gateway
//! and opening a fresh one over the same directory.

use std::collections::HashMap;
use std::path::Path;

use rust_decimal::Decimal;

use spendguard::config::{now_ts, Config, RecoveryPolicy};
use spendguard::gateway::{GatewayError, SpendGateway};
use spendguard::ledger::{EventBody, EventLog};
use spendguard::safety::circuit::CircuitState;
use spendguard::safety::killswitch::Scope;
use spendguard::types::{BudgetBucket, DecisionReason, IdempotencyKey, SpendRequest};

fn config_in(dir: &Path) -> Config {
    let mut daily_caps = HashMap::new();
    daily_caps.insert(BudgetBucket::Learning, Decimal::new(3000, 2));
    daily_caps.insert(BudgetBucket::Operational, Decimal::new(10000, 2));
    Config {
        ledger_path: dir.join("spend.ledger").to_string_lossy().into_owned(),
        killswitch_path: dir.join("killswitch.json").to_string_lossy().into_owned(),
        circuit_path: dir.join("circuit.json").to_string_lossy().into_owned(),
        sqlite_path: dir.join("mirror.sqlite").to_string_lossy().into_owned(),
        daily_caps,
        product_daily_caps: HashMap::new(),
        learning_total_cap: None,
        max_allocation_share: Decimal::new(50, 2),
        failure_threshold: 3,
        success_threshold: 2,
        cooldown_secs: 60,
        max_cooldown_secs: 3600,
        idempotency_ttl_secs: 7 * 86_400,
        reservation_recovery: RecoveryPolicy::ReplayLedger,
        reservation_timeout_secs: 900,
        info_flush_secs: 1,
    }
}

fn request(product: &str, cents: i64, key: &str) -> SpendRequest {
    SpendRequest::new(
        product,
        Decimal::new(cents, 2),
        BudgetBucket::Learning,
        IdempotencyKey::new(key).unwrap(),
        "corr",
        now_ts(),
    )
    .unwrap()
}

#[test]
fn killswitch_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_in(dir.path());
    {
        let gw = SpendGateway::open(&cfg).unwrap();
        gw.activate_kill(&Scope::System, "incident 714", "operator").unwrap();
    }

    let gw = SpendGateway::open(&cfg).unwrap();
    assert!(gw.kill_switch().is_active(&Scope::System));
    let out = gw.request(&request("p1", 100, "k-after-restart")).unwrap();
    assert!(matches!(
        out.decision().reason,
        DecisionReason::KillswitchActive { .. }
    ));
}

#[test]
fn vault_state_rebuilt_from_ledger_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_in(dir.path());
    let (first_decision, spent_before) = {
        let gw = SpendGateway::open(&cfg).unwrap();
        let d = gw.request(&request("p1", 1250, "k1")).unwrap().decision().clone();
        gw.request(&request("p1", 875, "k2")).unwrap();
        (d, gw.spent_today("p1", BudgetBucket::Learning))
    };
    assert_eq!(spent_before, Decimal::new(2125, 2));

    let gw = SpendGateway::open(&cfg).unwrap();
    assert_eq!(gw.spent_today("p1", BudgetBucket::Learning), spent_before);

    // The pre-restart decision replays verbatim from reconstructed state.
    let replay = gw.request(&request("p1", 1250, "k1")).unwrap();
    assert!(replay.is_replay());
    assert_eq!(replay.decision(), &first_decision);

    // And the cap still accounts for pre-restart spend.
    let over = gw.request(&request("p1", 1000, "k3")).unwrap();
    assert!(matches!(
        over.decision().reason,
        DecisionReason::CapExceeded { .. }
    ));
}

#[test]
fn corrupted_ledger_byte_is_fatal_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_in(dir.path());
    {
        let gw = SpendGateway::open(&cfg).unwrap();
        gw.request(&request("p1", 500, "k1")).unwrap();
        gw.request(&request("p1", 500, "k2")).unwrap();
    }

    // Flip one byte of recorded history.
    let mut bytes = std::fs::read(&cfg.ledger_path).unwrap();
    let pos = bytes.iter().position(|&b| b == b'5').unwrap();
    bytes[pos] = b'6';
    std::fs::write(&cfg.ledger_path, &bytes).unwrap();

    assert!(SpendGateway::open(&cfg).is_err());
}

#[test]
fn circuit_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_in(dir.path());
    {
        let gw = SpendGateway::open(&cfg).unwrap();
        for _ in 0..3 {
            gw.record_downstream_failure();
        }
        assert_eq!(gw.circuit_state(), CircuitState::Open);
    }

    let gw = SpendGateway::open(&cfg).unwrap();
    assert_eq!(gw.circuit_state(), CircuitState::Open);
    let out = gw.request(&request("p1", 100, "k1")).unwrap();
    assert!(matches!(
        out.decision().reason,
        DecisionReason::CircuitOpen { .. }
    ));
}

/// Plants a reservation with no terminal decision, as a crash between the
/// idempotency reservation and the ledger commit leaves behind.
fn plant_interrupted_reservation(cfg: &Config, key: &str, reserved_ts: u64) {
    let (mut log, _) = EventLog::open(&cfg.ledger_path, 1).unwrap();
    log.append(
        reserved_ts,
        &EventBody::SpendReserved {
            idempotency_key: key.to_string(),
            product_id: "p1".to_string(),
            reserved_ts,
        },
    )
    .unwrap();
}

#[test]
fn replay_policy_frees_interrupted_key() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_in(dir.path());
    plant_interrupted_reservation(&cfg, "k-crashed", now_ts() - 5);

    // Replay policy: the ledger has no commit for the key, so the retry
    // re-executes and succeeds.
    let gw = SpendGateway::open(&cfg).unwrap();
    let out = gw.request(&request("p1", 500, "k-crashed")).unwrap();
    assert!(!out.is_replay());
    assert!(out.decision().accepted);
}

#[test]
fn timeout_policy_blocks_then_frees_interrupted_key() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config_in(dir.path());
    cfg.reservation_recovery = RecoveryPolicy::TimeoutAbandon;
    plant_interrupted_reservation(&cfg, "k-crashed", now_ts() - 5);

    // Before the timeout the key is deterministically rejected.
    {
        let gw = SpendGateway::open(&cfg).unwrap();
        match gw.request(&request("p1", 500, "k-crashed")) {
            Err(GatewayError::RequestInFlight { idempotency_key }) => {
                assert_eq!(idempotency_key, "k-crashed");
            }
            other => panic!("expected in-flight rejection, got {:?}", other),
        }
        // Other keys are unaffected.
        assert!(gw.request(&request("p1", 500, "k-other")).unwrap().decision().accepted);
    }

    // Past the timeout the reservation counts as abandoned and the retry
    // runs fresh.
    cfg.reservation_timeout_secs = 0;
    let gw = SpendGateway::open(&cfg).unwrap();
    let out = gw.request(&request("p1", 500, "k-crashed")).unwrap();
    assert!(!out.is_replay());
    assert!(out.decision().accepted);
}

#[test]
fn commit_before_idempotency_record_recovers_as_replay() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_in(dir.path());

    // Simulate a crash after the durable commit but before anything else:
    // the ledger holds reservation + commit; no other state was written.
    let now = now_ts();
    {
        let (mut log, _) = EventLog::open(&cfg.ledger_path, 1).unwrap();
        log.append(
            now,
            &EventBody::SpendReserved {
                idempotency_key: "k-half".to_string(),
                product_id: "p1".to_string(),
                reserved_ts: now,
            },
        )
        .unwrap();
        log.append(
            now,
            &EventBody::SpendCommitted {
                product_id: "p1".to_string(),
                bucket: BudgetBucket::Learning,
                day: now / 86_400,
                amount: Decimal::new(700, 2),
                new_total: Decimal::new(700, 2),
                idempotency_key: "k-half".to_string(),
                correlation_id: "corr".to_string(),
            },
        )
        .unwrap();
    }

    let gw = SpendGateway::open(&cfg).unwrap();
    // The commit is the decision: the retry replays it instead of
    // re-executing, and the budget reflects it exactly once.
    let out = gw.request(&request("p1", 700, "k-half")).unwrap();
    assert!(out.is_replay());
    assert!(out.decision().accepted);
    assert_eq!(gw.spent_today("p1", BudgetBucket::Learning), Decimal::new(700, 2));
}
