//! Shared test utilities for colloquy
//!
//! - Deterministic scope ids
//! - Small programs exercising the drivers

#![allow(dead_code)]


pub use determinism::ScopeIdSequence;
pub use programs::{number_echo, word_stats, EffectCounter};
