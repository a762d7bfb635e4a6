// engine/mod.rs
pub mod exit_sink;
pub mod intersection_node;

use log::warn;

use crate::monitoring::telemetry::TelemetrySink;
use crate::shared_data::LogLevel;

/// Logs a discarded vehicle locally and on the telemetry sink.
pub(crate) fn report_drop(telemetry: &dyn TelemetrySink, node_id: &str, message: String) {
    warn!("[{}] {}", node_id, message);
    telemetry.publish_log(node_id, LogLevel::Warn, message);
}
