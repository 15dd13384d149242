use anyhow::{bail, Context, Result};

use spendguard::config::{now_ts, Config};
use spendguard::gateway::SpendGateway;
use spendguard::ledger::EventLog;
use spendguard::logging::{json_log, obj, v_num, v_str};
use spendguard::safety::killswitch::Scope;
use spendguard::storage::StateStore;
use spendguard::types::{BudgetBucket, IdempotencyKey, SpendRequest};

fn usage() -> ! {
    eprintln!(
        "usage: spendguard <command>\n\
         \n\
         commands:\n\
           spend <product_id> <amount> <bucket> <idempotency_key> [correlation_id]\n\
           kill on <scope> <reason>\n\
           kill off <scope>\n\
           status\n\
           verify\n\
           mirror\n\
           gc\n\
         \n\
         scopes: system | bucket:<learning|operational> | product:<id>"
    );
    std::process::exit(2);
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cfg = Config::from_env();
    match args.first().map(|s| s.as_str()) {
        Some("spend") => cmd_spend(&cfg, &args[1..]),
        Some("kill") => cmd_kill(&cfg, &args[1..]),
        Some("status") => cmd_status(&cfg),
        Some("verify") => cmd_verify(&cfg),
        Some("mirror") => cmd_mirror(&cfg),
        Some("gc") => cmd_gc(&cfg),
        _ => usage(),
    }
}

fn cmd_spend(cfg: &Config, args: &[String]) -> Result<()> {
    if args.len() < 4 {
        usage();
    }
    let amount = args[1]
        .parse()
        .with_context(|| format!("invalid amount {:?}", args[1]))?;
    let bucket = match BudgetBucket::parse(&args[2]) {
        Some(b) => b,
        None => bail!("unknown bucket {:?} (learning|operational)", args[2]),
    };
    let key = IdempotencyKey::new(&args[3])?;
    let correlation_id = args.get(4).cloned().unwrap_or_else(|| args[3].clone());
    let req = SpendRequest::new(&args[0], amount, bucket, key, &correlation_id, now_ts())?;

    let gateway = SpendGateway::open(cfg)?;
    let outcome = gateway.request(&req)?;
    let decision = outcome.decision();
    println!(
        "{}",
        serde_json::json!({
            "replay": outcome.is_replay(),
            "accepted": decision.accepted,
            "reason": decision.reason,
            "amount_committed": decision.amount_committed,
            "ledger_seq": decision.ledger_seq,
            "decided_at": decision.decided_at,
        })
    );
    Ok(())
}

fn cmd_kill(cfg: &Config, args: &[String]) -> Result<()> {
    let gateway = SpendGateway::open(cfg)?;
    match args.first().map(|s| s.as_str()) {
        Some("on") => {
            if args.len() < 3 {
                usage();
            }
            let scope = parse_scope(&args[1])?;
            let reason = args[2..].join(" ");
            gateway.activate_kill(&scope, &reason, "operator")?;
            println!("{}", serde_json::json!({"scope": scope.key(), "active": true}));
        }
        Some("off") => {
            if args.len() < 2 {
                usage();
            }
            let scope = parse_scope(&args[1])?;
            gateway.deactivate_kill(&scope)?;
            println!("{}", serde_json::json!({"scope": scope.key(), "active": false}));
        }
        _ => usage(),
    }
    Ok(())
}

fn parse_scope(raw: &str) -> Result<Scope> {
    match Scope::parse(raw) {
        Some(s) => Ok(s),
        None => bail!("invalid scope {:?}", raw),
    }
}

fn cmd_status(cfg: &Config) -> Result<()> {
    let gateway = SpendGateway::open(cfg)?;
    println!(
        "{}",
        serde_json::json!({
            "ledger_last_seq": gateway.last_seq(),
            "circuit": gateway.circuit_state().as_str(),
            "killswitch": gateway.kill_switch().snapshot(),
            "idempotency_entries": gateway.idempotency_entries(),
        })
    );
    Ok(())
}

fn cmd_verify(cfg: &Config) -> Result<()> {
    match EventLog::verify_file(&cfg.ledger_path) {
        Ok(count) => {
            println!(
                "{}",
                serde_json::json!({"ok": true, "events": count, "path": cfg.ledger_path})
            );
            Ok(())
        }
        Err(e) => {
            println!(
                "{}",
                serde_json::json!({"ok": false, "error": e.to_string(), "path": cfg.ledger_path})
            );
            bail!("ledger verification failed: {}", e)
        }
    }
}

fn cmd_mirror(cfg: &Config) -> Result<()> {
    let records = EventLog::replay_file(&cfg.ledger_path, 1)?;
    let mut store = StateStore::new(&cfg.sqlite_path)?;
    store.init()?;
    let written = store.mirror_from_ledger(&records)?;
    let (accepted, denied) = store.decision_counts()?;
    json_log(
        "mirror",
        obj(&[
            ("written", v_num(written as u64)),
            ("accepted", v_num(accepted as u64)),
            ("denied", v_num(denied as u64)),
            ("sqlite", v_str(&cfg.sqlite_path)),
        ]),
    );
    Ok(())
}

fn cmd_gc(cfg: &Config) -> Result<()> {
    let gateway = SpendGateway::open(cfg)?;
    let removed = gateway.gc_idempotency();
    println!("{}", serde_json::json!({"removed": removed}));
    Ok(())
}
