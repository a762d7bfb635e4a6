// control_system/mod.rs
pub mod directional_queue;
pub mod traffic_light_controller;
