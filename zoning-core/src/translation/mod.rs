//! Virtual worker translation management
//!
//! Runs only on the worker authoritative over the mapping entity.

pub mod manager;

pub use manager::{TranslationManager, TranslationManagerConfig, TranslationPhase};
