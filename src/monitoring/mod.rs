// monitoring/mod.rs
pub mod stats_publisher;
pub mod telemetry;
pub mod traffic_monitoring_system;
