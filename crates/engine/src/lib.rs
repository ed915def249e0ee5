//! Kimchi premium price engine
//!
//! Consumer-facing facade over the price feeds, the price store and the
//! premium calculator, plus layered settings loading for the binary.

pub mod engine;
pub mod error;
pub mod settings;

pub use engine::{EngineStatus, PriceEngine, Subscription};
pub use error::{EngineError, EngineResult};
