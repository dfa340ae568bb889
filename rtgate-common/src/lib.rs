//! # Shared Binary Layouts (Engine ↔ Log Decoders)
//!
//! Defines the on-arena layout of buffered GC records, the keyword bit
//! assignments and the bulk-type batch header. Everything here is plain data
//! so that an out-of-process decoder of a dumped arena block can share the
//! exact same constants as the engine that wrote it.
//!
//! ## Record Layout
//!
//! ```text
//! ┌──────────────┬──────────────────┬───────────────────────────┐
//! │ kind (u32)   │ payload_size u32 │ payload (payload_size B)  │  padded to 8
//! └──────────────┴──────────────────┴───────────────────────────┘
//! ```
//!
//! All integers are little endian. Records start on 8-byte boundaries.
//!
//! ## Key Types
//!
//! - [`RecordHeader`] - Fixed header in front of every buffered record
//! - [`BulkTypeHeader`] - Prefix of every flushed bulk-type batch

#![no_std]

// ============================================================================
// Record Kinds
// ============================================================================

/// GC phase transition (start, end, mark, sweep, world stop/start)
///
/// Payload: `phase: u32`, `generation: u32`
pub const RECORD_GC_PHASE: u32 = 1;

/// Heap resize
///
/// Payload: `new_size: u64`
pub const RECORD_GC_RESIZE: u32 = 2;

/// Dense array of moved object ranges
///
/// Payload: `count: u32`, `pad: u32`, then `count` × [`MOVE_ENTRY_SIZE`]
pub const RECORD_GC_MOVES: u32 = 3;

/// Dense array of root edges
///
/// Payload: `count: u32`, `pad: u32`, then `count` × [`ROOT_ENTRY_SIZE`]
pub const RECORD_GC_ROOTS: u32 = 4;

/// One object and the objects it references (heap dump only)
///
/// Payload: `object: u64`, `type_id: u64`, `size: u64`, `ref_count: u32`,
/// `pad: u32`, then `ref_count` × `u64`
pub const RECORD_GC_OBJECT_REFERENCE: u32 = 5;

/// GC root registered by the runtime
///
/// Payload: `root_id: u64`, `size: u64`, `key: u64`, `source: u32`, `pad: u32`
pub const RECORD_GC_ROOT_REGISTER: u32 = 6;

/// GC root unregistered by the runtime
///
/// Payload: `root_id: u64`
pub const RECORD_GC_ROOT_UNREGISTER: u32 = 7;

// ============================================================================
// Sizes
// ============================================================================

/// Size of [`RecordHeader`] in bytes
pub const RECORD_HEADER_SIZE: usize = 8;

/// Alignment every record (header + payload) is padded to
pub const RECORD_ALIGN: usize = 8;

/// Prefix of dense-array payloads: `count: u32` + `pad: u32`
pub const ARRAY_PREFIX_SIZE: usize = 8;

/// One moved range: `old: u64`, `new: u64`, `length: u64`
pub const MOVE_ENTRY_SIZE: usize = 24;

/// One root edge: `root_address: u64`, `object: u64`
pub const ROOT_ENTRY_SIZE: usize = 16;

/// Fixed part of an object-reference payload (without the reference array)
pub const OBJECT_REFERENCE_FIXED_SIZE: usize = 32;

/// Reserved prefix at the start of each arena block
///
/// A block mapped with `N` bytes offers `N - BLOCK_HEADER_SIZE` usable bytes.
pub const BLOCK_HEADER_SIZE: usize = 64;

/// Default per-event size ceiling of the tracing transport
pub const DEFAULT_EVENT_CEILING: usize = 64_512;

/// Size of [`BulkTypeHeader`] in bytes
pub const BULK_TYPE_HEADER_SIZE: usize = 6;

/// Encoded size of a type descriptor without any type parameters
///
/// `type_id u64 + module_id u64 + type_name_id u32 + flags u32 +
/// element_type u8 + empty UTF-16 name (2) + param_count u32`
pub const TYPE_DESCRIPTOR_BASE_SIZE: usize = 31;

/// Rounds `size` up to the record alignment
#[must_use]
pub const fn align_record(size: usize) -> usize {
    (size + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

// ============================================================================
// Keywords
// ============================================================================

/// Bit indices of the runtime provider keywords.
///
/// Each bit owns a disjoint set of producer hooks.
pub mod keywords {
    pub const GC: u64 = 1 << 0;
    pub const GC_HANDLE: u64 = 1 << 1;
    pub const LOADER: u64 = 1 << 2;
    pub const JIT: u64 = 1 << 3;
    pub const CONTENTION: u64 = 1 << 4;
    pub const EXCEPTION: u64 = 1 << 5;
    pub const THREADING: u64 = 1 << 6;
    pub const TYPE: u64 = 1 << 7;
    pub const GC_HEAP_DUMP: u64 = 1 << 8;
    /// Requests an on-demand collection (carries no hooks of its own)
    pub const GC_HEAP_COLLECT: u64 = 1 << 9;
    pub const GC_ALLOCATION: u64 = 1 << 10;

    /// Number of keyword bits in use
    pub const COUNT: u32 = 11;

    /// Every keyword the runtime provider understands
    pub const ALL: u64 = (1 << COUNT) - 1;
}

// ============================================================================
// GC Phases
// ============================================================================

pub const GC_PHASE_START: u32 = 0;
pub const GC_PHASE_MARK_START: u32 = 1;
pub const GC_PHASE_MARK_END: u32 = 2;
pub const GC_PHASE_RECLAIM_START: u32 = 3;
pub const GC_PHASE_RECLAIM_END: u32 = 4;
pub const GC_PHASE_END: u32 = 5;
pub const GC_PHASE_PRE_STOP_WORLD: u32 = 6;
pub const GC_PHASE_POST_STOP_WORLD: u32 = 7;
pub const GC_PHASE_PRE_START_WORLD: u32 = 8;
pub const GC_PHASE_POST_START_WORLD: u32 = 9;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Header written in front of every buffered record
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    /// One of the `RECORD_*` constants
    pub kind: u32,

    /// Number of payload bytes that follow (excluding alignment padding)
    pub payload_size: u32,
}

impl RecordHeader {
    /// Total bytes the record occupies in a block, padding included
    #[must_use]
    pub const fn record_size(&self) -> usize {
        align_record(RECORD_HEADER_SIZE + self.payload_size as usize)
    }

    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut out = [0u8; RECORD_HEADER_SIZE];
        out[..4].copy_from_slice(&self.kind.to_le_bytes());
        out[4..].copy_from_slice(&self.payload_size.to_le_bytes());
        out
    }

    /// Decode a header from the front of `bytes`
    ///
    /// Returns `None` if fewer than [`RECORD_HEADER_SIZE`] bytes are available.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let kind = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
        let payload_size = u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?);
        Some(Self { kind, payload_size })
    }
}

/// Prefix of a flushed bulk-type batch
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BulkTypeHeader {
    /// Number of type descriptors in the batch
    pub count: u32,

    /// Runtime instance that produced the batch
    pub instance_id: u16,
}

impl BulkTypeHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; BULK_TYPE_HEADER_SIZE] {
        let mut out = [0u8; BULK_TYPE_HEADER_SIZE];
        out[..4].copy_from_slice(&self.count.to_le_bytes());
        out[4..].copy_from_slice(&self.instance_id.to_le_bytes());
        out
    }

    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            count: u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?),
            instance_id: u16::from_le_bytes(bytes.get(4..6)?.try_into().ok()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size_is_aligned() {
        let header = RecordHeader { kind: RECORD_GC_PHASE, payload_size: 8 };
        assert_eq!(header.record_size(), 16);

        let header = RecordHeader { kind: RECORD_GC_RESIZE, payload_size: 9 };
        assert_eq!(header.record_size(), 24);
    }

    #[test]
    fn test_object_reference_without_refs_is_40_bytes() {
        let header = RecordHeader {
            kind: RECORD_GC_OBJECT_REFERENCE,
            payload_size: OBJECT_REFERENCE_FIXED_SIZE as u32,
        };
        assert_eq!(header.record_size(), 40);
    }

    #[test]
    fn test_header_decode_rejects_short_input() {
        assert!(RecordHeader::decode(&[1, 0, 0]).is_none());
        let header = RecordHeader { kind: 7, payload_size: 8 };
        assert_eq!(RecordHeader::decode(&header.encode()), Some(header));
    }

    #[test]
    fn test_keyword_bits_are_dense() {
        assert_eq!(keywords::ALL.count_ones(), keywords::COUNT);
        assert_eq!(keywords::GC_ALLOCATION, 1 << (keywords::COUNT - 1));
    }
}
