//! Structured event stream: one JSON object per line on stdout.

use serde::Serialize;
use std::fmt;
use std::io::Write;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const SQL_PREVIEW_LEN: usize = 120;

/// Which way a migration is being driven.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

/// Everything the engine reports while it works. Serialized with an
/// `"event"` discriminator so consumers can dispatch on one key.
#[derive(Debug, Serialize)]
#[serde(tag = "event")]
pub enum Event {
    #[serde(rename = "lock-acquired")]
    LockAcquired { timestamp: String, key: String },
    #[serde(rename = "lock-released")]
    LockReleased { timestamp: String, key: String },
    #[serde(rename = "apply-start")]
    ApplyStart {
        timestamp: String,
        version: u64,
        name: String,
        direction: Direction,
    },
    #[serde(rename = "apply-end")]
    ApplyEnd {
        timestamp: String,
        version: u64,
        name: String,
        direction: Direction,
        elapsed_ms: u64,
    },
    #[serde(rename = "stmt-run")]
    StatementRun {
        timestamp: String,
        version: u64,
        name: String,
        direction: Direction,
        elapsed_ms: u64,
        sql: String,
    },
    #[serde(rename = "verify-start")]
    VerifyStart { timestamp: String },
    #[serde(rename = "verify-end")]
    VerifyEnd {
        timestamp: String,
        valid: bool,
        drift_count: usize,
        missing_count: usize,
    },
}

/// Emits events as whole lines to stdout when enabled, otherwise drops them.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventSink {
    enabled: bool,
}

impl EventSink {
    pub fn new(enabled: bool) -> Self {
        EventSink { enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn emit(&self, event: Event) {
        if !self.enabled {
            return;
        }
        // serialization of these shapes cannot fail; a closed stdout is not
        // worth failing a migration over
        if let Ok(line) = serde_json::to_string(&event) {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            let _ = writeln!(handle, "{}", line);
        }
    }
}

/// Current wall-clock instant in RFC 3339.
pub fn now_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

/// Truncate SQL for event payloads, respecting char boundaries.
pub fn sql_preview(sql: &str) -> String {
    if sql.len() <= SQL_PREVIEW_LEN {
        return sql.to_string();
    }
    let mut cut = SQL_PREVIEW_LEN;
    while !sql.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &sql[..cut])
}
