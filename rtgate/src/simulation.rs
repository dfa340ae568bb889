//! Simulated managed runtime
//!
//! Drives an [`Engine`] the way a real runtime would: a pool of mutator
//! threads producing events concurrently, and a collector thread running
//! stop-the-world cycles that report phases, moved ranges and (when a heap
//! dump is requested) the object graph.

// Addresses and sizes are synthetic; truncation is irrelevant here
#![allow(clippy::cast_possible_truncation)]

use log::{debug, info};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::batch::{StaticTypeTable, TypeDescriptor};
use crate::domain::{Keywords, Level, ObjectAddr, TypeId};
use crate::engine::{CycleReport, Engine};
use crate::event::{GcPhase, MovedRange, RootEdge, RootSource};
use crate::hooks::HookEvent;
use crate::subscription::{FilterPayload, SessionChange, GC_SEQUENCE_KEY};
use rtgate_common::keywords;

const HEAP_BASE: u64 = 0x7f00_0000_0000;
const OBJECT_STRIDE: u64 = 0x40;
/// Number of simulated types; ids start at 1
const TYPE_COUNT: u64 = 24;

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub producers: usize,
    pub cycles: u32,
    /// Objects reported per heap dump
    pub objects: usize,
    /// Heap-collect requests to queue, one before each of the first cycles
    pub heap_dumps: u32,
    /// Mutator time between two collections
    pub interval: Duration,
    pub keywords: Keywords,
    pub level: Level,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationReport {
    pub producer_events: u64,
    pub cycles: u32,
    pub records_replayed: u64,
    pub heap_dumps_serviced: u32,
    pub bulk_type_events: u64,
    pub longest_drain: Duration,
    pub elapsed: Duration,
}

impl SimulationReport {
    fn record_cycle(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.records_replayed += report.replay.records;
        self.bulk_type_events += report.types.flushes;
        if report.serviced_request.is_some() {
            self.heap_dumps_serviced += 1;
        }
        self.longest_drain = self.longest_drain.max(report.drain.waited);
    }
}

/// The type system of the simulated runtime
///
/// Every fourth type is generic over the two types before it, so heap dumps
/// exercise parameter logging.
#[must_use]
pub fn type_table() -> StaticTypeTable {
    (1..=TYPE_COUNT)
        .map(|id| {
            let mut descriptor = TypeDescriptor::simple(TypeId(id));
            descriptor.module_id = 1 + id % 3;
            descriptor.type_name_id = id as u32;
            if id % 4 == 0 {
                descriptor.params = vec![TypeId(id - 1), TypeId(id - 2)];
            }
            descriptor
        })
        .collect()
}

fn object_addr(index: usize) -> ObjectAddr {
    ObjectAddr(HEAP_BASE + index as u64 * OBJECT_STRIDE)
}

fn object_type(index: usize) -> TypeId {
    TypeId(1 + index as u64 % TYPE_COUNT)
}

/// One step of mutator activity; `n` selects the event
fn produce(engine: &Engine, thread: u64, n: u64) {
    let event = match n % 8 {
        0 => HookEvent::ThreadStarted { thread_id: thread },
        1 => HookEvent::ModuleLoad { module_id: n, path: "/usr/lib/runtime/System.Private.CoreLib.dll" },
        2 => HookEvent::MethodJitDone { method_id: n, code_size: 256 + (n % 64) as u32 },
        3 => HookEvent::GcAllocation {
            object: object_addr(n as usize),
            type_id: object_type(n as usize),
            size: 24 + n % 128,
        },
        4 => HookEvent::Contention { lock: 0x1000 + n % 8, thread_id: thread, duration_ns: 1500 },
        5 => HookEvent::TypeLoad { type_id: object_type(n as usize), module_id: 1 },
        6 => HookEvent::GcHandleCreated { handle: n, object: object_addr(n as usize), kind: 1 },
        _ => HookEvent::ExceptionThrown { type_id: TypeId(3), message: "Object reference not set" },
    };
    engine.dispatch(&event);
}

/// Report the heap graph: roots first, then every object with its outgoing
/// references
fn walk_heap(engine: &Engine, objects: usize) {
    if objects == 0 {
        return;
    }
    let roots: Vec<RootEdge> = (0..objects.min(16))
        .map(|i| RootEdge { root: 0x5000 + i as u64 * 8, object: object_addr(i).0 })
        .collect();
    engine.dispatch(&HookEvent::GcRoots(&roots));
    engine.dispatch(&HookEvent::GcRootRegister {
        root_id: 1,
        size: 8 * roots.len() as u64,
        key: 0,
        source: RootSource::Stack,
    });

    let mut references = Vec::with_capacity(2);
    for i in 0..objects {
        references.clear();
        references.extend(
            [2 * i + 1, 2 * i + 2].into_iter().filter(|child| *child < objects).map(|child| object_addr(child).0),
        );
        engine.dispatch(&HookEvent::GcObjectReference {
            object: object_addr(i),
            type_id: object_type(i),
            size: 24 + (i % 5) as u64 * 8,
            references: &references,
        });
    }
    engine.dispatch(&HookEvent::GcRootUnregister { root_id: 1 });
}

/// One stop-the-world collection of `generation`
fn collect(engine: &Engine, generation: u32, objects: usize) -> CycleReport {
    engine.gc_pre_pause();
    engine.gc_paused();

    engine.dispatch(&HookEvent::GcPhase { phase: GcPhase::Start, generation });
    engine.dispatch(&HookEvent::GcPhase { phase: GcPhase::MarkStart, generation });
    if engine.heap_walk_requested() {
        walk_heap(engine, objects);
    }
    engine.dispatch(&HookEvent::GcPhase { phase: GcPhase::MarkEnd, generation });

    let moves: Vec<MovedRange> = (0..8u64)
        .map(|i| MovedRange {
            old: HEAP_BASE + 0x10_0000 + i * 0x1000,
            new: HEAP_BASE + i * 0x1000,
            length: 0x800,
        })
        .collect();
    engine.dispatch(&HookEvent::GcMoves(&moves));
    engine.dispatch(&HookEvent::GcResize { new_size: 0x0100_0000 + u64::from(generation) * 0x1000 });
    engine.dispatch(&HookEvent::GcPhase { phase: GcPhase::End, generation });

    engine.gc_pre_resume();
    engine.gc_resumed()
}

fn request_heap_dump(engine: &Engine, config: &SimulationConfig, sequence: u32) {
    let mask = Keywords(config.keywords.0 | keywords::GC_HEAP_DUMP | keywords::GC_HEAP_COLLECT);
    let value = sequence.to_string();
    let filter = FilterPayload::from_pairs(&[(GC_SEQUENCE_KEY, value.as_str())]);
    let outcome = engine.apply_subscription_change(&SessionChange::enable(config.level, mask).with_filter(filter));
    if let Some(request) = outcome.request {
        debug!("requested heap dump {} (sequence {sequence})", request.id);
    }
}

/// Run the simulation to completion
///
/// Subscribes the engine to `config.keywords`, starts the producers, runs
/// every collection and stops the producers again.
pub fn run(engine: &Arc<Engine>, config: &SimulationConfig) -> SimulationReport {
    let start = Instant::now();
    engine.apply_subscription_change(&SessionChange::enable(config.level, config.keywords));

    let stop = Arc::new(AtomicBool::new(false));
    let produced = Arc::new(AtomicU64::new(0));
    let producers: Vec<_> = (0..config.producers)
        .map(|thread| {
            let engine = Arc::clone(engine);
            let stop = Arc::clone(&stop);
            let produced = Arc::clone(&produced);
            std::thread::spawn(move || {
                let mut n = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    produce(&engine, thread as u64, n);
                    n += 1;
                    if n % 64 == 0 {
                        std::thread::yield_now();
                    }
                }
                produced.fetch_add(n, Ordering::Relaxed);
            })
        })
        .collect();

    let mut report = SimulationReport::default();
    for cycle in 0..config.cycles {
        if cycle < config.heap_dumps {
            request_heap_dump(engine, config, cycle + 1);
        }
        std::thread::sleep(config.interval);

        let cycle_report = collect(engine, cycle % 3, config.objects);
        debug!(
            "GC #{}: drained {} producers in {:?}, replayed {} records",
            cycle_report.cycle, cycle_report.drain.in_flight, cycle_report.drain.waited, cycle_report.replay.records
        );
        report.record_cycle(&cycle_report);
    }

    stop.store(true, Ordering::Relaxed);
    for producer in producers {
        if producer.join().is_err() {
            log::warn!("Producer thread panicked");
        }
    }

    report.producer_events = produced.load(Ordering::Relaxed);
    report.elapsed = start.elapsed();
    info!(
        "Simulation finished: {} cycles, {} producer events, {} heap dumps",
        report.cycles, report.producer_events, report.heap_dumps_serviced
    );
    report
}
