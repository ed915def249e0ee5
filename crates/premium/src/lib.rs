//! Kimchi premium calculation
//!
//! Features:
//! - Per-instrument premium with explicit unavailability reasons
//! - Parallel evaluation of the whole symbol table with rayon
//! - Summary statistics over available results only

pub mod calculator;
pub mod summary;

pub use calculator::PremiumCalculator;
pub use summary::summarize;
