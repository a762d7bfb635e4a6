// simulation_engine/mod.rs
pub mod vehicle_generator;
