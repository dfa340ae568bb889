//! # Buffered Event Log
//!
//! Binary log of GC records captured while the world is stopped and replayed
//! through the ordinary sink once it is running again.
//!
//! ## Flow
//!
//! ```text
//!   pause ──▶ append(record) ──▶ arena block #0 ─▶ #1 ─▶ #2
//!                                     │
//!   resume ─▶ replay ─────────────────┘  oldest → newest, offset 0 → high-water
//!                │
//!                ├─▶ sink.fire(event)           (same order as appended)
//!                └─▶ identity cache (type ids seen in object references)
//! ```
//!
//! Payloads are copied by value at append time; nothing in a record points
//! back into runtime state that could move or die before replay.

use log::{debug, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::arena::{Arena, ArenaStats, BlockInfo};
use crate::config::ArenaConfig;
use crate::domain::{ReplayError, TypeId};
use crate::event::{Event, GcPhase, MovedRange, RootEdge, RootSource};
use crate::gate::FireGate;
use crate::sink::EventSink;
use rtgate_common::{
    align_record, RecordHeader, ARRAY_PREFIX_SIZE, MOVE_ENTRY_SIZE, OBJECT_REFERENCE_FIXED_SIZE,
    RECORD_GC_MOVES, RECORD_GC_OBJECT_REFERENCE, RECORD_GC_PHASE, RECORD_GC_RESIZE,
    RECORD_GC_ROOTS, RECORD_GC_ROOT_REGISTER, RECORD_GC_ROOT_UNREGISTER, RECORD_HEADER_SIZE,
    ROOT_ENTRY_SIZE,
};

/// A record to buffer, borrowing its bulk data from the caller
///
/// The borrowed slices are copied into the arena by [`BufferedLog::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record<'a> {
    GcPhase { phase: GcPhase, generation: u32 },
    GcResize { new_size: u64 },
    GcMoves(&'a [MovedRange]),
    GcRoots(&'a [RootEdge]),
    GcObjectReference { object: u64, type_id: TypeId, size: u64, references: &'a [u64] },
    GcRootRegister { root_id: u64, size: u64, key: u64, source: RootSource },
    GcRootUnregister { root_id: u64 },
}

impl Record<'_> {
    #[must_use]
    pub fn kind(&self) -> u32 {
        match self {
            Record::GcPhase { .. } => RECORD_GC_PHASE,
            Record::GcResize { .. } => RECORD_GC_RESIZE,
            Record::GcMoves(_) => RECORD_GC_MOVES,
            Record::GcRoots(_) => RECORD_GC_ROOTS,
            Record::GcObjectReference { .. } => RECORD_GC_OBJECT_REFERENCE,
            Record::GcRootRegister { .. } => RECORD_GC_ROOT_REGISTER,
            Record::GcRootUnregister { .. } => RECORD_GC_ROOT_UNREGISTER,
        }
    }

    /// Payload bytes, excluding header and alignment padding
    #[must_use]
    pub fn payload_size(&self) -> usize {
        match self {
            Record::GcPhase { .. } | Record::GcResize { .. } | Record::GcRootUnregister { .. } => 8,
            Record::GcMoves(moves) => ARRAY_PREFIX_SIZE + moves.len() * MOVE_ENTRY_SIZE,
            Record::GcRoots(roots) => ARRAY_PREFIX_SIZE + roots.len() * ROOT_ENTRY_SIZE,
            Record::GcObjectReference { references, .. } => {
                OBJECT_REFERENCE_FIXED_SIZE + references.len() * 8
            }
            Record::GcRootRegister { .. } => 32,
        }
    }

    /// Bytes the record occupies in a block (header + payload, aligned)
    #[must_use]
    pub fn record_size(&self) -> usize {
        align_record(RECORD_HEADER_SIZE + self.payload_size())
    }

    fn encode_payload(&self, out: &mut ByteWriter<'_>) {
        match *self {
            Record::GcPhase { phase, generation } => {
                out.put_u32(phase.as_raw());
                out.put_u32(generation);
            }
            Record::GcResize { new_size } => out.put_u64(new_size),
            Record::GcMoves(moves) => {
                out.put_count(moves.len());
                for range in moves {
                    out.put_u64(range.old);
                    out.put_u64(range.new);
                    out.put_u64(range.length);
                }
            }
            Record::GcRoots(roots) => {
                out.put_count(roots.len());
                for edge in roots {
                    out.put_u64(edge.root);
                    out.put_u64(edge.object);
                }
            }
            Record::GcObjectReference { object, type_id, size, references } => {
                out.put_u64(object);
                out.put_u64(type_id.0);
                out.put_u64(size);
                out.put_count(references.len());
                for reference in references {
                    out.put_u64(*reference);
                }
            }
            Record::GcRootRegister { root_id, size, key, source } => {
                out.put_u64(root_id);
                out.put_u64(size);
                out.put_u64(key);
                out.put_u32(source.as_raw());
                out.put_u32(0);
            }
            Record::GcRootUnregister { root_id } => out.put_u64(root_id),
        }
    }
}

// ============================================================================
// Byte Cursors
// ============================================================================

struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn put_u32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.put(&value.to_le_bytes());
    }

    /// Dense-array prefix: count + padding to 8 bytes
    #[allow(clippy::cast_possible_truncation)]
    fn put_count(&mut self, count: usize) {
        self.put_u32(count as u32);
        self.put_u32(0);
    }
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.buf.get(self.pos..self.pos + N)?;
        self.pos += N;
        bytes.try_into().ok()
    }

    fn u32(&mut self) -> Option<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take::<8>().map(u64::from_le_bytes)
    }

    fn count(&mut self) -> Option<usize> {
        let count = self.u32()?;
        self.u32()?;
        usize::try_from(count).ok()
    }
}

/// Decode one payload back into the event it describes
fn decode_payload(kind: u32, payload: &[u8]) -> Option<Event> {
    let mut r = ByteReader::new(payload);
    let event = match kind {
        RECORD_GC_PHASE => {
            Event::GcPhase { phase: GcPhase::from_raw(r.u32()?)?, generation: r.u32()? }
        }
        RECORD_GC_RESIZE => Event::GcResize { new_size: r.u64()? },
        RECORD_GC_MOVES => {
            let count = r.count()?;
            let mut ranges = Vec::with_capacity(count);
            for _ in 0..count {
                ranges.push(MovedRange { old: r.u64()?, new: r.u64()?, length: r.u64()? });
            }
            Event::GcMovedRanges { ranges }
        }
        RECORD_GC_ROOTS => {
            let count = r.count()?;
            let mut roots = Vec::with_capacity(count);
            for _ in 0..count {
                roots.push(RootEdge { root: r.u64()?, object: r.u64()? });
            }
            Event::GcRoots { roots }
        }
        RECORD_GC_OBJECT_REFERENCE => {
            let object = r.u64()?;
            let type_id = r.u64()?;
            let size = r.u64()?;
            let count = r.count()?;
            let mut references = Vec::with_capacity(count);
            for _ in 0..count {
                references.push(r.u64()?);
            }
            Event::GcObjectReference { object, type_id, size, references }
        }
        RECORD_GC_ROOT_REGISTER => Event::GcRootRegister {
            root_id: r.u64()?,
            size: r.u64()?,
            key: r.u64()?,
            source: RootSource::from_raw(r.u32()?),
        },
        RECORD_GC_ROOT_UNREGISTER => Event::GcRootUnregister { root_id: r.u64()? },
        _ => return None,
    };
    Some(event)
}

fn kind_name(kind: u32) -> &'static str {
    match kind {
        RECORD_GC_PHASE => "gc_phase",
        RECORD_GC_RESIZE => "gc_resize",
        RECORD_GC_MOVES => "gc_moves",
        RECORD_GC_ROOTS => "gc_roots",
        RECORD_GC_OBJECT_REFERENCE => "gc_object_reference",
        RECORD_GC_ROOT_REGISTER => "gc_root_register",
        RECORD_GC_ROOT_UNREGISTER => "gc_root_unregister",
        _ => "unknown",
    }
}

/// Decode the record at the front of `bytes`
///
/// Returns the event and the number of bytes the record occupies.
fn decode_record(bytes: &[u8], offset: usize) -> Result<(Event, usize), ReplayError> {
    let header = RecordHeader::decode(bytes).ok_or(ReplayError::Truncated {
        offset,
        size: RECORD_HEADER_SIZE,
        available: bytes.len(),
    })?;
    let size = header.record_size();
    if size > bytes.len() {
        return Err(ReplayError::Truncated { offset, size, available: bytes.len() });
    }
    if kind_name(header.kind) == "unknown" {
        return Err(ReplayError::UnknownKind { kind: header.kind, offset });
    }

    let payload = &bytes[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + header.payload_size as usize];
    let event = decode_payload(header.kind, payload)
        .ok_or(ReplayError::MalformedPayload { kind: kind_name(header.kind), offset })?;
    Ok((event, size))
}

// ============================================================================
// Identity Cache
// ============================================================================

/// Distinct type ids referenced by replayed object-reference records
///
/// Kept in first-seen order so the follow-up type descriptions come out in a
/// stable order.
#[derive(Debug, Default)]
pub struct IdentityCache {
    seen: HashSet<TypeId>,
    order: Vec<TypeId>,
}

impl IdentityCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `type_id` was not seen before
    pub fn insert(&mut self, type_id: TypeId) -> bool {
        if self.seen.insert(type_id) {
            self.order.push(type_id);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Take every cached id in first-seen order, leaving the cache empty
    pub fn drain(&mut self) -> Vec<TypeId> {
        self.seen.clear();
        std::mem::take(&mut self.order)
    }
}

// ============================================================================
// Buffered Log
// ============================================================================

/// Outcome of one replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub blocks: usize,
    pub records: u64,
    /// Blocks whose replay stopped early on a malformed record
    pub corrupt_blocks: usize,
    /// New distinct identities added to the identity cache
    pub identities: usize,
}

/// Counters accumulated over the life of a log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub appended: u64,
    pub dropped: u64,
    pub replayed: u64,
    pub bytes_buffered: u64,
    pub arena: ArenaStats,
}

/// Pause-time record log over an [`Arena`]
pub struct BufferedLog {
    arena: Arena,
    appended: AtomicU64,
    dropped: AtomicU64,
    replayed: AtomicU64,
    bytes: AtomicU64,
}

impl BufferedLog {
    #[must_use]
    pub fn new(config: ArenaConfig) -> Self {
        Self {
            arena: Arena::new(config),
            appended: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Copy `record` into the arena
    ///
    /// Returns `false` if the record was dropped because no block could be
    /// mapped for it. Safe to call from several GC worker threads at once.
    ///
    /// # Panics
    /// In debug builds, if `gate` is not paused.
    pub fn append(&self, gate: &FireGate, record: &Record<'_>) -> bool {
        debug_assert!(gate.is_paused(), "BufferedLog::append() outside a pause");

        let Ok(payload_size) = u32::try_from(record.payload_size()) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let header = RecordHeader { kind: record.kind(), payload_size };
        let size = header.record_size();

        let Ok(mut reservation) = self.arena.alloc(size) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let mut out = ByteWriter::new(reservation.as_mut_slice());
        out.put(&header.encode());
        record.encode_payload(&mut out);
        debug_assert_eq!(out.pos, RECORD_HEADER_SIZE + payload_size as usize);
        drop(reservation);

        self.appended.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size as u64, Ordering::Relaxed);
        true
    }

    /// Fire every buffered record on `sink` in append order
    ///
    /// Object-reference records add their type id to `cache`. The arena write
    /// lock is held for the whole walk.
    pub fn replay(&self, sink: &dyn EventSink, cache: &mut IdentityCache) -> ReplayReport {
        let mut report = ReplayReport::default();

        self.arena.for_each_block(|info: BlockInfo, bytes: &[u8]| {
            report.blocks += 1;
            let mut offset = 0;
            while offset < bytes.len() {
                match decode_record(&bytes[offset..], offset) {
                    Ok((event, size)) => {
                        if let Event::GcObjectReference { type_id, .. } = &event {
                            if cache.insert(TypeId(*type_id)) {
                                report.identities += 1;
                            }
                        }
                        sink.fire(event);
                        report.records += 1;
                        offset += size;
                    }
                    Err(e) => {
                        warn!("Stopping replay of arena block #{}: {e}", info.sequence);
                        report.corrupt_blocks += 1;
                        break;
                    }
                }
            }
        });

        self.replayed.fetch_add(report.records, Ordering::Relaxed);
        debug!(
            "replayed {} records from {} blocks ({} new identities)",
            report.records, report.blocks, report.identities
        );
        report
    }

    /// Drop replayed records, keeping one warm block for the next pause
    pub fn reset(&self) {
        self.arena.free_all_but_current();
    }

    /// Unmap every block
    pub fn clear(&self) {
        self.arena.free_all();
    }

    #[must_use]
    pub fn blocks(&self) -> Vec<BlockInfo> {
        self.arena.blocks()
    }

    #[must_use]
    pub fn stats(&self) -> LogStats {
        LogStats {
            appended: self.appended.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            bytes_buffered: self.bytes.load(Ordering::Relaxed),
            arena: self.arena.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DrainBackoff;
    use crate::sink::RecordingSink;

    fn paused_gate() -> FireGate {
        let gate = FireGate::new(DrainBackoff::default());
        gate.pause();
        gate
    }

    fn log(block_size: usize) -> BufferedLog {
        BufferedLog::new(ArenaConfig { block_size, max_bytes: None })
    }

    #[test]
    fn test_record_sizes() {
        assert_eq!(Record::GcPhase { phase: GcPhase::Start, generation: 0 }.record_size(), 16);
        assert_eq!(Record::GcRootRegister { root_id: 1, size: 2, key: 3, source: RootSource::Stack }.record_size(), 40);
        let moves = [MovedRange { old: 1, new: 2, length: 3 }; 3];
        assert_eq!(Record::GcMoves(&moves).record_size(), 8 + 8 + 72);
        let refs = [1, 2];
        let record = Record::GcObjectReference { object: 1, type_id: TypeId(2), size: 3, references: &refs };
        assert_eq!(record.record_size(), 8 + 32 + 16);
    }

    #[test]
    fn test_every_record_kind_replays_as_its_event() {
        let gate = paused_gate();
        let log = log(8192);
        let moves = [MovedRange { old: 0x1000, new: 0x2000, length: 64 }];
        let roots = [RootEdge { root: 0x10, object: 0x1000 }, RootEdge { root: 0x18, object: 0x2000 }];
        let refs = [0x3000, 0x4000];

        let records = [
            Record::GcPhase { phase: GcPhase::MarkStart, generation: 2 },
            Record::GcResize { new_size: 1 << 20 },
            Record::GcMoves(&moves),
            Record::GcRoots(&roots),
            Record::GcObjectReference { object: 0x1000, type_id: TypeId(7), size: 48, references: &refs },
            Record::GcRootRegister { root_id: 5, size: 128, key: 9, source: RootSource::Static },
            Record::GcRootUnregister { root_id: 5 },
        ];
        for record in &records {
            assert!(log.append(&gate, record));
        }
        gate.resume();

        let sink = RecordingSink::new();
        let mut cache = IdentityCache::new();
        let report = log.replay(&sink, &mut cache);
        assert_eq!(report.records, 7);
        assert_eq!(report.corrupt_blocks, 0);

        let events = sink.take();
        assert_eq!(events[0], Event::GcPhase { phase: GcPhase::MarkStart, generation: 2 });
        assert_eq!(events[1], Event::GcResize { new_size: 1 << 20 });
        assert_eq!(events[2], Event::GcMovedRanges { ranges: moves.to_vec() });
        assert_eq!(events[3], Event::GcRoots { roots: roots.to_vec() });
        assert_eq!(
            events[4],
            Event::GcObjectReference { object: 0x1000, type_id: 7, size: 48, references: refs.to_vec() }
        );
        assert_eq!(
            events[5],
            Event::GcRootRegister { root_id: 5, size: 128, key: 9, source: RootSource::Static }
        );
        assert_eq!(events[6], Event::GcRootUnregister { root_id: 5 });
        assert_eq!(cache.drain(), vec![TypeId(7)]);
    }

    #[test]
    fn test_identity_cache_deduplicates() {
        let gate = paused_gate();
        let log = log(8192);
        for (object, type_id) in [(1, 10), (2, 11), (3, 10), (4, 12), (5, 11)] {
            log.append(
                &gate,
                &Record::GcObjectReference { object, type_id: TypeId(type_id), size: 24, references: &[] },
            );
        }
        gate.resume();

        let mut cache = IdentityCache::new();
        let report = log.replay(&RecordingSink::new(), &mut cache);
        assert_eq!(report.records, 5);
        assert_eq!(report.identities, 3);
        assert_eq!(cache.drain(), vec![TypeId(10), TypeId(11), TypeId(12)]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_exhausted_arena_drops_record() {
        let gate = paused_gate();
        let log = BufferedLog::new(ArenaConfig { block_size: 4096, max_bytes: Some(4096) });
        let refs = vec![0u64; 600]; // 4840 bytes, larger than the whole budget
        let record = Record::GcObjectReference { object: 1, type_id: TypeId(1), size: 8, references: &refs };
        assert!(log.append(&gate, &Record::GcResize { new_size: 1 }));
        assert!(!log.append(&gate, &record));
        assert!(log.append(&gate, &Record::GcResize { new_size: 2 }));

        let stats = log.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.appended, 2);
        gate.resume();
    }

    #[test]
    fn test_reset_keeps_one_empty_block() {
        let gate = paused_gate();
        let log = log(4096);
        let refs = vec![0u64; 400];
        for _ in 0..3 {
            log.append(&gate, &Record::GcObjectReference { object: 1, type_id: TypeId(1), size: 8, references: &refs });
        }
        gate.resume();
        assert_eq!(log.blocks().len(), 3);

        log.reset();
        let blocks = log.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].used, 0);

        let report = log.replay(&RecordingSink::new(), &mut IdentityCache::new());
        assert_eq!(report.records, 0);
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let header = RecordHeader { kind: 99, payload_size: 8 }.encode();
        let mut bytes = header.to_vec();
        bytes.extend_from_slice(&[0; 8]);
        assert_eq!(
            decode_record(&bytes, 0).unwrap_err(),
            ReplayError::UnknownKind { kind: 99, offset: 0 }
        );
    }

    #[test]
    fn test_decode_rejects_truncated_record() {
        let header = RecordHeader { kind: RECORD_GC_RESIZE, payload_size: 64 }.encode();
        let err = decode_record(&header, 128).unwrap_err();
        assert!(matches!(err, ReplayError::Truncated { offset: 128, .. }));
    }
}
