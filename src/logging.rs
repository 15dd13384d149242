//! Structured NDJSON logging for the spend core.
//!
//! One JSON object per line on stderr: `ts`, `run_id`, `seq`, `lvl`,
//! `component`, `event`, plus caller fields. The ledger is the audit record;
//! this stream exists for operators tailing a run, so losing it is never
//! allowed to fail a spend decision.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("debug") => Level::Debug,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_ID: OnceLock<String> = OnceLock::new();

fn run_id() -> &'static str {
    RUN_ID.get_or_init(|| {
        std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", Utc::now().timestamp_millis(), process::id()))
    })
}

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

/// RFC3339 timestamp with milliseconds.
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn log(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() {
        return;
    }
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(run_id()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    for (k, v) in fields {
        entry.entry(k).or_insert(v);
    }
    eprintln!("{}", Value::Object(entry));
}

/// Info-level entry where the event doubles as the component name.
pub fn json_log(component: &str, fields: Map<String, Value>) {
    log(Level::Info, component, component, fields);
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: u64) -> Value {
    json!(n)
}

pub fn v_bool(b: bool) -> Value {
    json!(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
    }

    #[test]
    fn test_obj_builds_map() {
        let m = obj(&[("a", v_str("x")), ("n", v_num(3)), ("f", v_bool(true))]);
        assert_eq!(m.len(), 3);
        assert_eq!(m["a"], json!("x"));
        assert_eq!(m["n"], json!(3));
        assert_eq!(m["f"], json!(true));
    }

    #[test]
    fn test_seq_monotonic() {
        let a = next_seq();
        let b = next_seq();
        assert!(b > a);
    }
}
