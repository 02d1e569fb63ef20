//! Structured logging for the game service.
//!
//! Every record is one JSON line with a run id, a monotonically increasing
//! `seq`, a level and a domain. Lines go to stderr (stdout carries relay
//! outcomes) and to `events.jsonl` / `trace.jsonl` under `LOG_DIR/RUN_ID`.
//!
//! Filtering:
//! - `LOG_LEVEL`: trace | debug | info | warn | error | fatal (default info)
//! - `LOG_DOMAINS`: comma-separated domain list, or `all`

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::engine::reducer::EngineEvent;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Round,  // Round lifecycle: start, bank, bust, win
    Dice,   // Rolls and pairings
    Effect, // Cell triggers and applied outcome fields
    Gate,   // Gates opened and cleared
    Store,  // Persistence calls, timeouts, retries
    Coord,  // Command intake and per-player serialization
    System, // Startup, shutdown, content loading
    Audit,  // Committed state hashes
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Round => "round",
            Domain::Dice => "dice",
            Domain::Effect => "effect",
            Domain::Gate => "gate",
            Domain::Store => "store",
            Domain::Coord => "coord",
            Domain::System => "system",
            Domain::Audit => "audit",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }
        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            run_id,
        }
    })
}

/// Promote correlation keys out of `data` onto the record itself.
fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["player_id", "command", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain, event, fields);
}

fn emit_record(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("domain".to_string(), json!(domain.as_str()));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    eprintln!("{}", line);
}

/// Flush the run files; call before exit.
pub fn flush() {
    if let Some(ctx) = RUN_CONTEXT.get() {
        for sink in [&ctx.events, &ctx.trace].into_iter().flatten() {
            if let Ok(mut w) = sink.lock() {
                let _ = w.flush();
            }
        }
    }
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

/// One line per processed command, accepted or not.
pub fn log_command(
    player_id: &str,
    command: &str,
    status: &str,
    error_code: Option<&str>,
    state_hash: Option<&str>,
    elapsed_ms: f64,
) {
    let level = if error_code.is_some() { Level::Warn } else { Level::Info };
    log(
        level,
        Domain::Coord,
        "command",
        obj(&[
            ("player_id", v_str(player_id)),
            ("command", v_str(command)),
            ("status", v_str(status)),
            ("error_code", error_code.map(v_str).unwrap_or(Value::Null)),
            ("state_hash", state_hash.map(v_str).unwrap_or(Value::Null)),
            ("elapsed_ms", v_num(elapsed_ms)),
        ]),
    );
}

/// Route one engine event to its domain.
pub fn log_transition(player_id: &str, event: &EngineEvent) {
    match event {
        EngineEvent::Triggered { .. }
        | EngineEvent::TrapNullified { .. }
        | EngineEvent::Message { .. }
        | EngineEvent::ItemGranted { .. }
        | EngineEvent::ItemRemoved { .. }
        | EngineEvent::ScoreChanged { .. }
        | EngineEvent::FlagSet { .. }
        | EngineEvent::CounterSet { .. }
        | EngineEvent::NextRollFixed { .. }
        | EngineEvent::ColumnsBlocked { .. }
        | EngineEvent::Retreated { .. }
        | EngineEvent::ItemUsed { .. } => log_effect(player_id, event),
        EngineEvent::GateOpened { .. } | EngineEvent::GateCleared { .. } | EngineEvent::RoundEndDeferred { .. } => {
            log_gate(player_id, event)
        }
        EngineEvent::Rolled { .. } | EngineEvent::RollSkipped { .. } => {
            log(Level::Debug, Domain::Dice, event.name(), event_fields(player_id, event))
        }
        _ => log(Level::Info, Domain::Round, event.name(), event_fields(player_id, event)),
    }
}

pub fn log_effect(player_id: &str, event: &EngineEvent) {
    log(Level::Debug, Domain::Effect, event.name(), event_fields(player_id, event));
}

pub fn log_gate(player_id: &str, event: &EngineEvent) {
    log(Level::Info, Domain::Gate, event.name(), event_fields(player_id, event));
}

fn event_fields(player_id: &str, event: &EngineEvent) -> Map<String, Value> {
    let mut fields = match serde_json::to_value(event) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    fields.remove("event");
    fields.insert("player_id".to_string(), v_str(player_id));
    fields.insert("msg".to_string(), v_str(&event.summary()));
    fields
}

pub fn log_persistence(op: &str, player_id: &str, attempt: u32, elapsed_ms: f64, error: Option<&str>) {
    let level = if error.is_some() { Level::Warn } else { Level::Trace };
    log(
        level,
        Domain::Store,
        op,
        obj(&[
            ("player_id", v_str(player_id)),
            ("attempt", json!(attempt)),
            ("elapsed_ms", v_num(elapsed_ms)),
            ("error", error.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

/// Log a committed transition for replay verification
pub fn log_audit(player_id: &str, command: &str, version: u64, state_hash: &str) {
    log(
        Level::Info,
        Domain::Audit,
        "commit",
        obj(&[
            ("player_id", v_str(player_id)),
            ("command", v_str(command)),
            ("version", json!(version)),
            ("state_hash", v_str(state_hash)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

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

pub fn v_num(n: f64) -> Value {
    json!(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }

    #[test]
    fn test_split_promotes_correlation_keys() {
        let (top, data) = split_fields(obj(&[
            ("player_id", v_str("p1")),
            ("column", json!(7)),
        ]));
        assert_eq!(top.get("player_id").unwrap(), "p1");
        assert!(data.contains_key("column"));
        assert!(!data.contains_key("player_id"));
    }

    #[test]
    fn test_event_fields_flatten_payload() {
        let event = EngineEvent::Advanced { column: 7, from: None, to: 0 };
        let fields = event_fields("p1", &event);
        assert_eq!(fields.get("column").unwrap(), 7);
        assert_eq!(fields.get("player_id").unwrap(), "p1");
        assert!(!fields.contains_key("event"));
    }
}
