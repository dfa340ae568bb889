//! Event shapes handed to an [`EventSink`](crate::sink::EventSink)
//!
//! One variant per distinct event the runtime provider fires. The wire
//! encoding of each shape belongs to the sink; the engine only decides
//! *when* (and whether) an event is fired.

use serde::Serialize;

use rtgate_common::{
    GC_PHASE_END, GC_PHASE_MARK_END, GC_PHASE_MARK_START, GC_PHASE_POST_START_WORLD,
    GC_PHASE_POST_STOP_WORLD, GC_PHASE_PRE_START_WORLD, GC_PHASE_PRE_STOP_WORLD,
    GC_PHASE_RECLAIM_END, GC_PHASE_RECLAIM_START, GC_PHASE_START,
};

/// Phase transition reported by the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GcPhase {
    Start,
    MarkStart,
    MarkEnd,
    ReclaimStart,
    ReclaimEnd,
    End,
    PreStopWorld,
    PostStopWorld,
    PreStartWorld,
    PostStartWorld,
}

impl GcPhase {
    #[must_use]
    pub fn as_raw(self) -> u32 {
        match self {
            GcPhase::Start => GC_PHASE_START,
            GcPhase::MarkStart => GC_PHASE_MARK_START,
            GcPhase::MarkEnd => GC_PHASE_MARK_END,
            GcPhase::ReclaimStart => GC_PHASE_RECLAIM_START,
            GcPhase::ReclaimEnd => GC_PHASE_RECLAIM_END,
            GcPhase::End => GC_PHASE_END,
            GcPhase::PreStopWorld => GC_PHASE_PRE_STOP_WORLD,
            GcPhase::PostStopWorld => GC_PHASE_POST_STOP_WORLD,
            GcPhase::PreStartWorld => GC_PHASE_PRE_START_WORLD,
            GcPhase::PostStartWorld => GC_PHASE_POST_START_WORLD,
        }
    }

    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            GC_PHASE_START => GcPhase::Start,
            GC_PHASE_MARK_START => GcPhase::MarkStart,
            GC_PHASE_MARK_END => GcPhase::MarkEnd,
            GC_PHASE_RECLAIM_START => GcPhase::ReclaimStart,
            GC_PHASE_RECLAIM_END => GcPhase::ReclaimEnd,
            GC_PHASE_END => GcPhase::End,
            GC_PHASE_PRE_STOP_WORLD => GcPhase::PreStopWorld,
            GC_PHASE_POST_STOP_WORLD => GcPhase::PostStopWorld,
            GC_PHASE_PRE_START_WORLD => GcPhase::PreStartWorld,
            GC_PHASE_POST_START_WORLD => GcPhase::PostStartWorld,
            _ => return None,
        })
    }
}

/// Where a registered GC root lives
///
/// `Other` is meant for raw values without a named variant. `Other(n)` with a
/// known `n` is normalized by a trip through the buffered log:
/// `from_raw(Other(1).as_raw())` is `Stack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RootSource {
    External,
    Stack,
    FinalizerQueue,
    Static,
    ThreadStatic,
    GcHandle,
    Ephemeron,
    Other(u32),
}

impl RootSource {
    #[must_use]
    pub fn as_raw(self) -> u32 {
        match self {
            RootSource::External => 0,
            RootSource::Stack => 1,
            RootSource::FinalizerQueue => 2,
            RootSource::Static => 3,
            RootSource::ThreadStatic => 4,
            RootSource::GcHandle => 5,
            RootSource::Ephemeron => 6,
            RootSource::Other(raw) => raw,
        }
    }

    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => RootSource::External,
            1 => RootSource::Stack,
            2 => RootSource::FinalizerQueue,
            3 => RootSource::Static,
            4 => RootSource::ThreadStatic,
            5 => RootSource::GcHandle,
            6 => RootSource::Ephemeron,
            other => RootSource::Other(other),
        }
    }
}

/// An object range relocated by a compacting collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MovedRange {
    pub old: u64,
    pub new: u64,
    pub length: u64,
}

/// A root slot and the object it keeps alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RootEdge {
    pub root: u64,
    pub object: u64,
}

/// A structured diagnostic event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    // ------------------------------------------------------------------ GC
    GcPhase { phase: GcPhase, generation: u32 },
    GcResize { new_size: u64 },
    GcMovedRanges { ranges: Vec<MovedRange> },
    GcRoots { roots: Vec<RootEdge> },
    GcObjectReference { object: u64, type_id: u64, size: u64, references: Vec<u64> },
    GcRootRegister { root_id: u64, size: u64, key: u64, source: RootSource },
    GcRootUnregister { root_id: u64 },
    GcAllocation { object: u64, type_id: u64, size: u64 },
    GcHandleCreated { handle: u64, object: u64, kind: u32 },

    // -------------------------------------------------------------- loader
    ModuleLoad { module_id: u64, path: String },

    // ----------------------------------------------------------------- JIT
    MethodJitDone { method_id: u64, code_size: u32 },

    // ----------------------------------------------------------- threading
    /// A contended lock acquisition, reported once it completes
    Contention { lock: u64, thread_id: u64, duration_ns: u64 },
    ExceptionThrown { type_id: u64, message: String },
    ThreadStarted { thread_id: u64 },

    // --------------------------------------------------------------- types
    TypeLoad { type_id: u64, module_id: u64 },
    /// One flushed batch of type descriptors (opaque flat payload)
    BulkType { count: u32, instance_id: u16, payload: Vec<u8> },
}

impl Event {
    /// Short event name, used for logging and summaries
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Event::GcPhase { .. } => "gc_phase",
            Event::GcResize { .. } => "gc_resize",
            Event::GcMovedRanges { .. } => "gc_moved_ranges",
            Event::GcRoots { .. } => "gc_roots",
            Event::GcObjectReference { .. } => "gc_object_reference",
            Event::GcRootRegister { .. } => "gc_root_register",
            Event::GcRootUnregister { .. } => "gc_root_unregister",
            Event::GcAllocation { .. } => "gc_allocation",
            Event::GcHandleCreated { .. } => "gc_handle_created",
            Event::ModuleLoad { .. } => "module_load",
            Event::MethodJitDone { .. } => "method_jit_done",
            Event::Contention { .. } => "contention",
            Event::ExceptionThrown { .. } => "exception_thrown",
            Event::ThreadStarted { .. } => "thread_started",
            Event::TypeLoad { .. } => "type_load",
            Event::BulkType { .. } => "bulk_type",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_phase_raw_mapping_is_bijective() {
        for raw in 0..10 {
            let phase = GcPhase::from_raw(raw).unwrap();
            assert_eq!(phase.as_raw(), raw);
        }
        assert!(GcPhase::from_raw(10).is_none());
    }

    #[test]
    fn test_root_source_preserves_unknown_values() {
        assert_eq!(RootSource::from_raw(1), RootSource::Stack);
        assert_eq!(RootSource::from_raw(42), RootSource::Other(42));
        assert_eq!(RootSource::Other(42).as_raw(), 42);
    }

    #[test]
    fn test_root_source_other_with_known_value_normalizes() {
        assert_eq!(RootSource::from_raw(RootSource::Other(1).as_raw()), RootSource::Stack);
        assert_eq!(RootSource::from_raw(RootSource::Other(6).as_raw()), RootSource::Ephemeron);
        for raw in 0..=7 {
            assert_eq!(RootSource::from_raw(raw).as_raw(), raw);
        }
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = Event::GcPhase { phase: GcPhase::MarkStart, generation: 1 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "gc_phase");
        assert_eq!(json["phase"], "mark_start");
        assert_eq!(json["generation"], 1);
    }
}
