//! Structured error types for rtgate
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! None of these ever reach the instrumented runtime: producers swallow them
//! and count the dropped event.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArenaError {
    #[error("Failed to map {size} byte arena block: {source}")]
    MapFailed {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Arena budget exhausted: {mapped} bytes mapped, {requested} more requested, limit {limit}")]
    BudgetExhausted { mapped: usize, requested: usize, limit: usize },

    #[error("Allocation of {0} bytes overflows the block size computation")]
    SizeOverflow(usize),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BatchError {
    #[error("Item of {size} bytes exceeds the {ceiling} byte event ceiling")]
    ItemTooLarge { size: usize, ceiling: usize },

    #[error("No description available for type 0x{0:x}")]
    UnknownType(u64),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReplayError {
    #[error("Unknown record kind {kind} at offset {offset}")]
    UnknownKind { kind: u32, offset: usize },

    #[error("Record at offset {offset} claims {size} bytes but only {available} remain")]
    Truncated { offset: usize, size: usize, available: usize },

    #[error("Malformed {kind} payload at offset {offset}")]
    MalformedPayload { kind: &'static str, offset: usize },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FilterError {
    #[error("Filter payload has a key without a value: {0}")]
    DanglingKey(String),

    #[error("Filter payload is not valid UTF-8")]
    InvalidUtf8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_error_display() {
        let err = BatchError::ItemTooLarge { size: 70_000, ceiling: 64_512 };
        assert_eq!(err.to_string(), "Item of 70000 bytes exceeds the 64512 byte event ceiling");
    }

    #[test]
    fn test_budget_error_display() {
        let err = ArenaError::BudgetExhausted { mapped: 8192, requested: 8192, limit: 10_000 };
        assert!(err.to_string().contains("limit 10000"));
    }

    #[test]
    fn test_replay_error_display() {
        let err = ReplayError::UnknownKind { kind: 99, offset: 64 };
        assert!(err.to_string().contains("99"));
        assert!(err.to_string().contains("64"));
    }
}
