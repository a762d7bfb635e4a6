// models/mod.rs
pub mod vehicle;
