//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::path::Path;

use rust_decimal::Decimal;

use crate::config::{Config, RecoveryPolicy};
use crate::types::BudgetBucket;

/// Config rooted in an isolated directory: $30.00/day learning,
/// $100.00/day operational, 50% single-allocation share, breaker 3/2 with
/// 60s base cooldown.
pub fn config_in(dir: &Path) -> Config {
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
