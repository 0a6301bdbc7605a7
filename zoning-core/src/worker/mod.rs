//! Worker-side wiring
//!
//! Per-process facade over the connection, strategy, map, manager, locking
//! policy and migration engine.

pub mod zoning;

pub use zoning::WorkerZoning;
