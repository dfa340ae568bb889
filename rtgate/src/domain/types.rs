//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep type identifiers, object addresses and keyword
//! masks from being mixed up in engine signatures.

use serde::{Deserialize, Serialize};
use std::fmt;

use rtgate_common::keywords;

/// Runtime type identifier (a vtable/class handle in the managed runtime)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u64);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type:0x{:x}", self.0)
    }
}

/// Address of a managed object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectAddr(pub u64);

impl fmt::Display for ObjectAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Identifier of a pending on-demand request
///
/// Assigned monotonically by the subscription manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request#{}", self.0)
    }
}

/// Keyword bitmask of a tracing session
///
/// Each bit owns a disjoint group of producer hooks (see
/// [`rtgate_common::keywords`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Keywords(pub u64);

impl Keywords {
    pub const NONE: Keywords = Keywords(0);
    pub const ALL: Keywords = Keywords(keywords::ALL);

    #[must_use]
    pub fn contains(self, other: Keywords) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set in `self`
    #[must_use]
    pub fn intersects(self, other: Keywords) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Bits set in exactly one of `self` and `other`
    #[must_use]
    pub fn diff(self, other: Keywords) -> Keywords {
        Keywords(self.0 ^ other.0)
    }

    /// Iterate the single-bit masks set in `self`, lowest bit first
    pub fn bits(self) -> impl Iterator<Item = Keywords> {
        let mut remaining = self.0;
        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let lowest = remaining & remaining.wrapping_neg();
            remaining &= !lowest;
            Some(Keywords(lowest))
        })
    }
}

impl From<u64> for Keywords {
    fn from(bits: u64) -> Self {
        Keywords(bits)
    }
}

impl fmt::Display for Keywords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Verbosity level of a tracing session
///
/// Ordered so that `Verbose > Informational > ... > LogAlways`; an event at
/// level `L` is enabled when the session level is at least `L`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    LogAlways = 0,
    Critical = 1,
    Error = 2,
    Warning = 3,
    #[default]
    Informational = 4,
    Verbose = 5,
}

impl From<u8> for Level {
    fn from(value: u8) -> Self {
        match value {
            0 => Level::LogAlways,
            1 => Level::Critical,
            2 => Level::Error,
            3 => Level::Warning,
            4 => Level::Informational,
            _ => Level::Verbose,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::LogAlways => "log-always",
            Level::Critical => "critical",
            Level::Error => "error",
            Level::Warning => "warning",
            Level::Informational => "informational",
            Level::Verbose => "verbose",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_bits_iteration() {
        let bits: Vec<u64> = Keywords(0b1010_0101).bits().map(|k| k.0).collect();
        assert_eq!(bits, vec![0b1, 0b100, 0b10_0000, 0b1000_0000]);
        assert_eq!(Keywords::NONE.bits().count(), 0);
    }

    #[test]
    fn test_keyword_contains() {
        let mask = Keywords(keywords::GC | keywords::TYPE);
        assert!(mask.contains(Keywords(keywords::GC)));
        assert!(!mask.contains(Keywords(keywords::JIT)));
        assert!(!mask.contains(Keywords::NONE));
    }

    #[test]
    fn test_keyword_intersects() {
        let mask = Keywords(keywords::GC);
        assert!(mask.intersects(Keywords(keywords::GC | keywords::GC_HEAP_DUMP)));
        assert!(!mask.contains(Keywords(keywords::GC | keywords::GC_HEAP_DUMP)));
        assert!(!mask.intersects(Keywords(keywords::JIT | keywords::TYPE)));
        assert!(!mask.intersects(Keywords::NONE));
    }

    #[test]
    fn test_keyword_diff() {
        assert_eq!(Keywords(0b0101).diff(Keywords(0b0100)), Keywords(0b0001));
        assert_eq!(Keywords(0b0101).diff(Keywords(0b0101)), Keywords::NONE);
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Verbose > Level::Informational);
        assert!(Level::LogAlways < Level::Critical);
        assert_eq!(Level::from(9), Level::Verbose);
        assert_eq!(Level::from(3), Level::Warning);
    }

    #[test]
    fn test_type_id_display() {
        assert_eq!(TypeId(0x2a).to_string(), "Type:0x2a");
        assert_eq!(RequestId(3).to_string(), "Request#3");
    }
}
