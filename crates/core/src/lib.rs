//! Core types and utilities for the kimchi-premium price engine
//!
//! This crate provides shared types used across all components:
//! - Exchange, source and connection-state definitions
//! - Quote, candle and exchange-rate types
//! - The global/local symbol mapping table
//! - Premium result types
//! - Engine configuration and error taxonomy

pub mod types;
pub mod quotes;
pub mod symbols;
pub mod premium;
pub mod config;
pub mod errors;

pub use types::*;
pub use quotes::*;
pub use symbols::*;
pub use premium::*;
pub use config::*;
pub use errors::*;
