// src/shared_data.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Statistics for one directional queue, as published in a `STAT` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStat {
    pub direction: String,
    pub length: usize,
    pub max: usize,
    pub avg_wait_ms: u64,
    pub light_open: bool,
    #[serde(default)]
    pub capacity: usize,
    #[serde(default)]
    pub drained: u64,
    #[serde(default)]
    pub rejected: u64,
}

/// Periodic per-node statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatPayload {
    #[serde(default)]
    pub queues: Vec<QueueStat>,
    /// Only set by the terminal sink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_dwell_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A single log line forwarded to the telemetry sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload {
    pub level: LogLevel,
    pub message: String,
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_stat_uses_camel_case_on_the_wire() {
        let stat = QueueStat {
            direction: "E3".to_string(),
            length: 4,
            max: 9,
            avg_wait_ms: 1200,
            light_open: false,
            capacity: 10,
            drained: 3,
            rejected: 0,
        };
        let json = serde_json::to_value(&stat).unwrap();
        assert_eq!(json["avgWaitMs"], 1200);
        assert_eq!(json["lightOpen"], false);
        assert_eq!(json["direction"], "E3");
    }

    #[test]
    fn queue_stat_accepts_minimal_form() {
        let json = r#"{"direction":"E3","length":4,"max":9,"avgWaitMs":1200,"lightOpen":false}"#;
        let stat: QueueStat = serde_json::from_str(json).unwrap();
        assert_eq!(stat.capacity, 0);
        assert_eq!(stat.max, 9);
    }

    #[test]
    fn log_level_serializes_uppercase() {
        let payload = LogPayload {
            level: LogLevel::Warn,
            message: "peer down".to_string(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"WARN\""));
        assert_eq!(LogLevel::Error.to_string(), "ERROR");
    }
}
