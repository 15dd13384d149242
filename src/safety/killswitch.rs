//! Scoped emergency stop with file-backed persistence.
//!
//! State survives restarts via atomic JSON writes (temp file + rename +
//! fsync), so a crash mid-write can never leave a half-written state file.
//! A corrupted or unreadable state file FAILS CLOSED: the system scope is
//! activated, not silently cleared.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::logging::{json_log, obj, v_str};
use crate::types::BudgetBucket;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    System,
    Bucket(BudgetBucket),
    Product(String),
}

impl Scope {
    pub fn key(&self) -> String {
        match self {
            Scope::System => "system".to_string(),
            Scope::Bucket(b) => format!("bucket:{}", b.as_str()),
            Scope::Product(id) => format!("product:{}", id),
        }
    }

    pub fn parse(s: &str) -> Option<Scope> {
        if s == "system" {
            return Some(Scope::System);
        }
        if let Some(b) = s.strip_prefix("bucket:") {
            return BudgetBucket::parse(b).map(Scope::Bucket);
        }
        if let Some(id) = s.strip_prefix("product:") {
            if !id.is_empty() {
                return Some(Scope::Product(id.to_string()));
            }
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activation {
    pub reason: String,
    pub triggered_by: String,
    /// Captured from the clock at activation time, never from a default.
    pub activated_at: u64,
}

#[derive(Debug)]
pub struct KillSwitch {
    active: Mutex<HashMap<String, Activation>>,
    state_file: PathBuf,
}

impl KillSwitch {
    /// Loads persisted state. Corrupt state trips the system scope.
    pub fn load(path: &str, now: u64) -> Self {
        let state_file = PathBuf::from(path);
        let mut active: HashMap<String, Activation> = HashMap::new();
        if state_file.exists() {
            match std::fs::read_to_string(&state_file)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
            {
                Ok(map) => active = map,
                Err(detail) => {
                    active.insert(
                        Scope::System.key(),
                        Activation {
                            reason: "state_file_corrupted".to_string(),
                            triggered_by: "killswitch_loader".to_string(),
                            activated_at: now,
                        },
                    );
                    json_log(
                        "killswitch",
                        obj(&[
                            ("status", v_str("fail_closed")),
                            ("detail", v_str(&detail)),
                        ]),
                    );
                }
            }
        }
        KillSwitch {
            active: Mutex::new(active),
            state_file,
        }
    }

    pub fn is_active(&self, scope: &Scope) -> bool {
        self.active
            .lock()
            .map(|m| m.contains_key(&scope.key()))
            .unwrap_or(true)
    }

    /// First match wins: system, then the request's bucket, then its product.
    pub fn active_for(&self, bucket: BudgetBucket, product_id: &str) -> Option<(Scope, Activation)> {
        let map = match self.active.lock() {
            Ok(m) => m,
            // A poisoned lock means a panic mid-update; treat as active.
            Err(_) => {
                return Some((
                    Scope::System,
                    Activation {
                        reason: "killswitch_lock_poisoned".to_string(),
                        triggered_by: "system".to_string(),
                        activated_at: 0,
                    },
                ))
            }
        };
        for scope in [
            Scope::System,
            Scope::Bucket(bucket),
            Scope::Product(product_id.to_string()),
        ] {
            if let Some(act) = map.get(&scope.key()) {
                return Some((scope, act.clone()));
            }
        }
        None
    }

    pub fn activate(
        &self,
        scope: &Scope,
        reason: &str,
        triggered_by: &str,
        now: u64,
    ) -> std::io::Result<()> {
        let snapshot = {
            let mut map = self.active.lock().unwrap_or_else(|p| p.into_inner());
            map.insert(
                scope.key(),
                Activation {
                    reason: reason.to_string(),
                    triggered_by: triggered_by.to_string(),
                    activated_at: now,
                },
            );
            map.clone()
        };
        self.persist(&snapshot)
    }

    pub fn deactivate(&self, scope: &Scope) -> std::io::Result<()> {
        let snapshot = {
            let mut map = self.active.lock().unwrap_or_else(|p| p.into_inner());
            map.remove(&scope.key());
            map.clone()
        };
        self.persist(&snapshot)
    }

    pub fn snapshot(&self) -> HashMap<String, Activation> {
        self.active.lock().map(|m| m.clone()).unwrap_or_default()
    }

    fn persist(&self, snapshot: &HashMap<String, Activation>) -> std::io::Result<()> {
        if let Some(parent) = self.state_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        atomic_write_json(&self.state_file, &json!(snapshot))
    }
}

/// Write-to-temp + fsync + rename. Readers see either the old document or
/// the new one, never a partial write.
pub fn atomic_write_json(path: &Path, value: &serde_json::Value) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(serde_json::to_string_pretty(value)?.as_bytes())?;
        f.flush()?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    // Rename durability needs the directory synced too.
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Ok(dir) = OpenOptions::new().read(true).open(parent) {
                let _ = dir.sync_all();
            }
        }
    }
    Ok(())
}
