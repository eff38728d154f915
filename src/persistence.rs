// ─────────────────────────────────────────────────────────────────────────────
// persistence.rs — append-only audit log
//
// Engine state lives entirely in memory (GridLevel/GridPlan inside each
// GridExecutor); nothing here is read back on restart. This is an optional
// append-only newline-delimited-JSON log of fills and state transitions for
// after-the-fact audit, in place of a whole-state snapshot read/write —
// there is no `load_state` because there is nothing to resume from a file.
// ─────────────────────────────────────────────────────────────────────────────
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::error;
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum AuditEvent {
    EpochStarted {
        epoch_id: u64,
        levels_count: u32,
        spacing: Decimal,
    },
    OrderPlaced {
        direction: String,
        level_id: u32,
        side: String,
        price: Decimal,
        qty: Decimal,
        client_order_id: String,
    },
    OrderFilled {
        direction: String,
        level_id: u32,
        price: Decimal,
        qty: Decimal,
    },
    OrderCancelled {
        direction: String,
        level_id: u32,
        client_order_id: String,
    },
    LevelFailed {
        direction: String,
        level_id: u32,
        reason: String,
    },
    LevelRecycled {
        direction: String,
        level_id: u32,
    },
    RiskBreach {
        reason: String,
    },
    EmergencyUnwind {
        reason: String,
    },
}

#[derive(Serialize)]
struct LogLine<'a> {
    ts: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a AuditEvent,
}

/// Append-only sink for `AuditEvent`s. Construct with `path=None` to disable
/// logging entirely — every `record` call then becomes a no-op, so callers
/// never need to branch on whether auditing is turned on.
pub struct EventLog {
    file: Option<Mutex<File>>,
}

impl EventLog {
    pub fn open(path: Option<&str>) -> Self {
        let file = path.and_then(|p| match OpenOptions::new().create(true).append(true).open(Path::new(p)) {
            Ok(f) => Some(Mutex::new(f)),
            Err(e) => {
                error!("[persistence] could not open event log at {p}: {e}; continuing without audit logging");
                None
            }
        });
        Self { file }
    }

    pub fn record(&self, event: AuditEvent) {
        let Some(file) = &self.file else { return };
        let line = LogLine { ts: Utc::now(), event: &event };
        let serialized = match serde_json::to_string(&line) {
            Ok(s) => s,
            Err(e) => {
                error!("[persistence] failed to serialize audit event: {e}");
                return;
            }
        };
        match file.lock() {
            Ok(mut f) => {
                if let Err(e) = writeln!(f, "{serialized}") {
                    error!("[persistence] failed to append to event log: {e}");
                }
            }
            Err(e) => error!("[persistence] event log mutex poisoned: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Read;

    #[test]
    fn disabled_log_is_a_silent_no_op() {
        let log = EventLog::open(None);
        log.record(AuditEvent::RiskBreach { reason: "test".into() });
    }

    #[test]
    fn enabled_log_appends_one_json_line_per_event() {
        let path = std::env::temp_dir().join(format!("grid-audit-test-{}.ndjson", std::process::id()));
        let path_str = path.to_str().unwrap();
        let log = EventLog::open(Some(path_str));
        log.record(AuditEvent::EpochStarted { epoch_id: 1, levels_count: 4, spacing: dec!(0.01) });
        log.record(AuditEvent::OrderPlaced {
            direction: "LONG".into(),
            level_id: 0,
            side: "BUY".into(),
            price: dec!(1.0),
            qty: dec!(10),
            client_order_id: "c1".into(),
        });

        let mut content = String::new();
        File::open(&path).unwrap().read_to_string(&mut content).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("EpochStarted"));

        let _ = std::fs::remove_file(&path);
    }
}
