//! Common Utilities and Types Library
//!
//! This crate provides shared types, the tuning planner and small utilities
//! used by the USRP2 host engine, codec and command-line tool.

pub mod types;
pub mod tuning;
pub mod utils;

// Re-export commonly used items
pub use types::*;
pub use tuning::{plan_tune, MixerSpan, TuneError, TuneParams};
pub use utils::*;
