//! Domain model for rtgate
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{Keywords, Level, ObjectAddr, RequestId, TypeId};

pub use errors::{ArenaError, BatchError, ConfigError, FilterError, ReplayError};
