//! Producer hook slots
//!
//! Every producer call site in the runtime belongs to exactly one
//! [`HookSlot`], and every slot to exactly one keyword bit. A slot holds an
//! optional [`Hook`]; the subscription manager installs and removes hooks as
//! keywords are switched on and off, and an unwired slot costs the producer a
//! single read lock.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffered_log::Record;
use crate::domain::{Keywords, ObjectAddr, TypeId};
use crate::engine::Engine;
use crate::event::{Event, GcPhase, MovedRange, RootEdge, RootSource};
use rtgate_common::keywords;

/// A producer hook
pub type Hook = Arc<dyn Fn(&Engine, &HookEvent<'_>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookSlot {
    GcPhase,
    GcResize,
    GcMoves,
    GcHandleCreated,
    ModuleLoad,
    MethodJitDone,
    Contention,
    ExceptionThrown,
    ThreadStarted,
    TypeLoad,
    GcRoots,
    GcRootRegister,
    GcRootUnregister,
    GcObjectReference,
    GcAllocation,
}

impl HookSlot {
    pub const COUNT: usize = 15;

    pub const ALL: [HookSlot; Self::COUNT] = [
        HookSlot::GcPhase,
        HookSlot::GcResize,
        HookSlot::GcMoves,
        HookSlot::GcHandleCreated,
        HookSlot::ModuleLoad,
        HookSlot::MethodJitDone,
        HookSlot::Contention,
        HookSlot::ExceptionThrown,
        HookSlot::ThreadStarted,
        HookSlot::TypeLoad,
        HookSlot::GcRoots,
        HookSlot::GcRootRegister,
        HookSlot::GcRootUnregister,
        HookSlot::GcObjectReference,
        HookSlot::GcAllocation,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// The keyword bit that owns this slot
    #[must_use]
    pub fn keyword(self) -> Keywords {
        let bit = match self {
            HookSlot::GcPhase | HookSlot::GcResize | HookSlot::GcMoves => keywords::GC,
            HookSlot::GcHandleCreated => keywords::GC_HANDLE,
            HookSlot::ModuleLoad => keywords::LOADER,
            HookSlot::MethodJitDone => keywords::JIT,
            HookSlot::Contention => keywords::CONTENTION,
            HookSlot::ExceptionThrown => keywords::EXCEPTION,
            HookSlot::ThreadStarted => keywords::THREADING,
            HookSlot::TypeLoad => keywords::TYPE,
            HookSlot::GcRoots
            | HookSlot::GcRootRegister
            | HookSlot::GcRootUnregister
            | HookSlot::GcObjectReference => keywords::GC_HEAP_DUMP,
            HookSlot::GcAllocation => keywords::GC_ALLOCATION,
        };
        Keywords(bit)
    }

    /// Slots owned by a single keyword bit (empty for unknown bits)
    pub fn for_keyword(bit: Keywords) -> impl Iterator<Item = HookSlot> {
        Self::ALL.into_iter().filter(move |slot| slot.keyword() == bit)
    }

    /// Whether events from this slot are buffered while the world is stopped
    #[must_use]
    pub fn buffers_during_pause(self) -> bool {
        matches!(
            self,
            HookSlot::GcPhase
                | HookSlot::GcResize
                | HookSlot::GcMoves
                | HookSlot::GcRoots
                | HookSlot::GcRootRegister
                | HookSlot::GcRootUnregister
                | HookSlot::GcObjectReference
        )
    }
}

/// Arguments of one producer call, borrowed from the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent<'a> {
    GcPhase { phase: GcPhase, generation: u32 },
    GcResize { new_size: u64 },
    GcMoves(&'a [MovedRange]),
    GcRoots(&'a [RootEdge]),
    GcObjectReference { object: ObjectAddr, type_id: TypeId, size: u64, references: &'a [u64] },
    GcRootRegister { root_id: u64, size: u64, key: u64, source: RootSource },
    GcRootUnregister { root_id: u64 },
    GcAllocation { object: ObjectAddr, type_id: TypeId, size: u64 },
    GcHandleCreated { handle: u64, object: ObjectAddr, kind: u32 },
    ModuleLoad { module_id: u64, path: &'a str },
    MethodJitDone { method_id: u64, code_size: u32 },
    Contention { lock: u64, thread_id: u64, duration_ns: u64 },
    ExceptionThrown { type_id: TypeId, message: &'a str },
    ThreadStarted { thread_id: u64 },
    TypeLoad { type_id: TypeId, module_id: u64 },
}

impl<'a> HookEvent<'a> {
    #[must_use]
    pub fn slot(&self) -> HookSlot {
        match self {
            HookEvent::GcPhase { .. } => HookSlot::GcPhase,
            HookEvent::GcResize { .. } => HookSlot::GcResize,
            HookEvent::GcMoves(_) => HookSlot::GcMoves,
            HookEvent::GcRoots(_) => HookSlot::GcRoots,
            HookEvent::GcObjectReference { .. } => HookSlot::GcObjectReference,
            HookEvent::GcRootRegister { .. } => HookSlot::GcRootRegister,
            HookEvent::GcRootUnregister { .. } => HookSlot::GcRootUnregister,
            HookEvent::GcAllocation { .. } => HookSlot::GcAllocation,
            HookEvent::GcHandleCreated { .. } => HookSlot::GcHandleCreated,
            HookEvent::ModuleLoad { .. } => HookSlot::ModuleLoad,
            HookEvent::MethodJitDone { .. } => HookSlot::MethodJitDone,
            HookEvent::Contention { .. } => HookSlot::Contention,
            HookEvent::ExceptionThrown { .. } => HookSlot::ExceptionThrown,
            HookEvent::ThreadStarted { .. } => HookSlot::ThreadStarted,
            HookEvent::TypeLoad { .. } => HookSlot::TypeLoad,
        }
    }

    /// The buffered form of this event, for slots that buffer during a pause
    #[must_use]
    pub fn as_record(&self) -> Option<Record<'a>> {
        Some(match *self {
            HookEvent::GcPhase { phase, generation } => Record::GcPhase { phase, generation },
            HookEvent::GcResize { new_size } => Record::GcResize { new_size },
            HookEvent::GcMoves(moves) => Record::GcMoves(moves),
            HookEvent::GcRoots(roots) => Record::GcRoots(roots),
            HookEvent::GcObjectReference { object, type_id, size, references } => {
                Record::GcObjectReference { object: object.0, type_id, size, references }
            }
            HookEvent::GcRootRegister { root_id, size, key, source } => {
                Record::GcRootRegister { root_id, size, key, source }
            }
            HookEvent::GcRootUnregister { root_id } => Record::GcRootUnregister { root_id },
            _ => return None,
        })
    }

    /// Owned event for the sink
    #[must_use]
    pub fn to_event(&self) -> Event {
        match *self {
            HookEvent::GcPhase { phase, generation } => Event::GcPhase { phase, generation },
            HookEvent::GcResize { new_size } => Event::GcResize { new_size },
            HookEvent::GcMoves(moves) => Event::GcMovedRanges { ranges: moves.to_vec() },
            HookEvent::GcRoots(roots) => Event::GcRoots { roots: roots.to_vec() },
            HookEvent::GcObjectReference { object, type_id, size, references } => {
                Event::GcObjectReference {
                    object: object.0,
                    type_id: type_id.0,
                    size,
                    references: references.to_vec(),
                }
            }
            HookEvent::GcRootRegister { root_id, size, key, source } => {
                Event::GcRootRegister { root_id, size, key, source }
            }
            HookEvent::GcRootUnregister { root_id } => Event::GcRootUnregister { root_id },
            HookEvent::GcAllocation { object, type_id, size } => {
                Event::GcAllocation { object: object.0, type_id: type_id.0, size }
            }
            HookEvent::GcHandleCreated { handle, object, kind } => {
                Event::GcHandleCreated { handle, object: object.0, kind }
            }
            HookEvent::ModuleLoad { module_id, path } => {
                Event::ModuleLoad { module_id, path: path.to_string() }
            }
            HookEvent::MethodJitDone { method_id, code_size } => {
                Event::MethodJitDone { method_id, code_size }
            }
            HookEvent::Contention { lock, thread_id, duration_ns } => {
                Event::Contention { lock, thread_id, duration_ns }
            }
            HookEvent::ExceptionThrown { type_id, message } => {
                Event::ExceptionThrown { type_id: type_id.0, message: message.to_string() }
            }
            HookEvent::ThreadStarted { thread_id } => Event::ThreadStarted { thread_id },
            HookEvent::TypeLoad { type_id, module_id } => {
                Event::TypeLoad { type_id: type_id.0, module_id }
            }
        }
    }
}

/// The live hook of every slot
pub struct HookTable {
    slots: [RwLock<Option<Hook>>; HookSlot::COUNT],
    installs: AtomicU64,
    removals: AtomicU64,
}

impl Default for HookTable {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| RwLock::new(None)),
            installs: AtomicU64::new(0),
            removals: AtomicU64::new(0),
        }
    }
}

impl HookTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, slot: HookSlot, hook: Hook) {
        *self.slots[slot.index()].write() = Some(hook);
        self.installs.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns `true` if a hook was wired
    pub fn remove(&self, slot: HookSlot) -> bool {
        let removed = self.slots[slot.index()].write().take().is_some();
        if removed {
            self.removals.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// The wired hook, cloned out so it runs without the slot lock held
    #[must_use]
    pub fn get(&self, slot: HookSlot) -> Option<Hook> {
        self.slots[slot.index()].read().clone()
    }

    #[must_use]
    pub fn is_wired(&self, slot: HookSlot) -> bool {
        self.slots[slot.index()].read().is_some()
    }

    #[must_use]
    pub fn wired(&self) -> Vec<HookSlot> {
        HookSlot::ALL.into_iter().filter(|slot| self.is_wired(*slot)).collect()
    }

    /// Unwire every slot; returns how many were wired
    pub fn clear(&self) -> usize {
        HookSlot::ALL.into_iter().filter(|slot| self.remove(*slot)).count()
    }

    #[must_use]
    pub fn installs(&self) -> u64 {
        self.installs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn removals(&self) -> u64 {
        self.removals.load(Ordering::Relaxed)
    }
}

fn buffering_hook(engine: &Engine, event: &HookEvent<'_>) {
    engine.emit_or_buffer(event);
}

fn firing_hook(engine: &Engine, event: &HookEvent<'_>) {
    engine.emit(event);
}

/// Supplies the hook to install when a slot's keyword is switched on
///
/// Defaults to the engine's own hooks: GC slots buffer while the world is
/// stopped, everything else fires through the gate. Individual slots can be
/// overridden.
#[derive(Clone)]
pub struct HookRegistry {
    overrides: HashMap<HookSlot, Hook>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { overrides: HashMap::new() }
    }

    /// Replace the default hook of `slot`
    #[must_use]
    pub fn with_hook(mut self, slot: HookSlot, hook: Hook) -> Self {
        self.overrides.insert(slot, hook);
        self
    }

    #[must_use]
    pub fn hook_for(&self, slot: HookSlot) -> Hook {
        if let Some(hook) = self.overrides.get(&slot) {
            return Arc::clone(hook);
        }
        if slot.buffers_during_pause() {
            return Arc::new(buffering_hook);
        }
        Arc::new(firing_hook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_keyword_owns_disjoint_slots() {
        let mut owned = 0usize;
        for bit in Keywords::ALL.bits() {
            let slots: Vec<HookSlot> = HookSlot::for_keyword(bit).collect();
            if bit.0 == keywords::GC_HEAP_COLLECT {
                assert!(slots.is_empty());
            } else {
                assert!(!slots.is_empty(), "keyword {bit} has no slots");
            }
            owned += slots.len();
        }
        assert_eq!(owned, HookSlot::COUNT);
    }

    #[test]
    fn test_slot_index_matches_all_order() {
        for (i, slot) in HookSlot::ALL.iter().enumerate() {
            assert_eq!(slot.index(), i);
        }
    }

    #[test]
    fn test_gc_slots_buffer() {
        assert!(HookSlot::GcMoves.buffers_during_pause());
        assert!(HookSlot::GcObjectReference.buffers_during_pause());
        assert!(!HookSlot::GcAllocation.buffers_during_pause());
        assert!(!HookSlot::TypeLoad.buffers_during_pause());
    }

    #[test]
    fn test_buffered_slots_have_records() {
        let refs = [1u64];
        let event = HookEvent::GcObjectReference {
            object: ObjectAddr(0x10),
            type_id: TypeId(3),
            size: 24,
            references: &refs,
        };
        assert_eq!(event.slot(), HookSlot::GcObjectReference);
        assert!(event.as_record().is_some());

        let event = HookEvent::TypeLoad { type_id: TypeId(3), module_id: 1 };
        assert!(event.as_record().is_none());
        assert_eq!(event.to_event(), Event::TypeLoad { type_id: 3, module_id: 1 });
    }

    #[test]
    fn test_table_install_remove() {
        let table = HookTable::new();
        let registry = HookRegistry::new();
        table.install(HookSlot::ModuleLoad, registry.hook_for(HookSlot::ModuleLoad));
        assert!(table.is_wired(HookSlot::ModuleLoad));
        assert_eq!(table.wired(), vec![HookSlot::ModuleLoad]);

        assert!(table.remove(HookSlot::ModuleLoad));
        assert!(!table.remove(HookSlot::ModuleLoad));
        assert_eq!(table.installs(), 1);
        assert_eq!(table.removals(), 1);
        assert!(table.get(HookSlot::ModuleLoad).is_none());
    }

    #[test]
    fn test_registry_override_is_returned() {
        let hook: Hook = Arc::new(|_: &Engine, _: &HookEvent<'_>| {});
        let registry = HookRegistry::new().with_hook(HookSlot::TypeLoad, Arc::clone(&hook));
        assert!(Arc::ptr_eq(&registry.hook_for(HookSlot::TypeLoad), &hook));
        assert!(!Arc::ptr_eq(&registry.hook_for(HookSlot::ModuleLoad), &hook));
    }
}
