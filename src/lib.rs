//! A road network of independent intersection nodes that pass vehicles to
//! each other over TCP as newline-delimited JSON.
//!
//! Each intersection owns one bounded queue per incoming direction, opens
//! one light at a time, and forwards crossed vehicles to the next node on
//! their route. Entry generators feed the network and a terminal sink
//! records completed journeys.

pub mod communication;
pub mod config;
pub mod control_system;
pub mod engine;
pub mod error;
pub mod global_variables;
pub mod models;
pub mod monitoring;
pub mod shared_data;
pub mod simulation_engine;
