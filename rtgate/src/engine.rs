//! # Engine Context
//!
//! Owns the gate, the pause-time log, the hook table and the subscription
//! state of one tracing provider, and exposes the two faces the runtime sees:
//!
//! - **Collector-facing**: four call sites around every stop-the-world pause
//! - **Producer-facing**: [`Engine::dispatch`] for every instrumented event,
//!   plus [`Engine::log_types`] for type rundown
//!
//! ## Pause protocol
//!
//! ```text
//!   collector thread                        producers
//!   ────────────────                        ─────────
//!   gc_pre_pause()   gate.pause()           enter() parks
//!     │              (drain in-flight)
//!   gc_paused()      open buffering window,
//!     │              arm heap dump if requested
//!     │   GC events ──▶ buffered log
//!   gc_pre_resume()  heap walk over
//!   gc_resumed()     close window, gate.resume() ──▶ unpark
//!                    replay + bulk types under enter()
//!                    reset arena, complete request
//! ```
//!
//! Several engines can coexist; nothing here is process-global.

use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::batch::{BatchEncoder, BatchStats, TypeDescriber};
use crate::buffered_log::{BufferedLog, IdentityCache, LogStats, ReplayReport};
use crate::config::EngineConfig;
use crate::domain::{Keywords, Level, TypeId};
use crate::gate::{DrainReport, FireGate, GateStats};
use crate::hooks::{HookEvent, HookRegistry, HookTable};
use crate::sink::EventSink;
use crate::subscription::{ChangeOutcome, HeapCollectRequest, SessionChange, SubscriptionManager};
use rtgate_common::keywords;

/// What one pause/resume cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub drain: DrainReport,
    pub replay: ReplayReport,
    pub types: BatchStats,
    /// The heap-collect request this cycle serviced, if any
    pub serviced_request: Option<HeapCollectRequest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub cycles: u64,
    pub dispatched: u64,
    pub emitted: u64,
    pub buffered: u64,
    pub keywords: Keywords,
    pub level: Level,
    pub wired_hooks: usize,
    pub hook_installs: u64,
    pub hook_removals: u64,
    pub pending_requests: usize,
    pub gate: GateStats,
    pub log: LogStats,
    pub types: BatchStats,
}

pub struct Engine {
    config: EngineConfig,
    gate: FireGate,
    log: BufferedLog,
    subscriptions: SubscriptionManager,
    hooks: HookTable,
    registry: HookRegistry,
    sink: Arc<dyn EventSink>,
    describer: Arc<dyn TypeDescriber>,

    window_open: AtomicBool,
    heap_walk: AtomicBool,
    armed: Mutex<Option<HeapCollectRequest>>,
    last_drain: Mutex<DrainReport>,

    cycles: AtomicU64,
    dispatched: AtomicU64,
    emitted: AtomicU64,
    buffered: AtomicU64,
    types: Mutex<BatchStats>,
    shut_down: AtomicBool,
}

impl Engine {
    /// Create an engine with the default hooks
    ///
    /// `config` is expected to be validated already
    /// ([`EngineConfig::validate`]).
    #[must_use]
    pub fn new(config: EngineConfig, sink: Arc<dyn EventSink>, describer: Arc<dyn TypeDescriber>) -> Self {
        Self::with_registry(config, sink, describer, HookRegistry::new())
    }

    #[must_use]
    pub fn with_registry(
        config: EngineConfig,
        sink: Arc<dyn EventSink>,
        describer: Arc<dyn TypeDescriber>,
        registry: HookRegistry,
    ) -> Self {
        Self {
            config,
            gate: FireGate::new(config.gate),
            log: BufferedLog::new(config.arena),
            subscriptions: SubscriptionManager::new(),
            hooks: HookTable::new(),
            registry,
            sink,
            describer,
            window_open: AtomicBool::new(false),
            heap_walk: AtomicBool::new(false),
            armed: Mutex::new(None),
            last_drain: Mutex::new(DrainReport::default()),
            cycles: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            buffered: AtomicU64::new(0),
            types: Mutex::new(BatchStats::default()),
            shut_down: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn gate(&self) -> &FireGate {
        &self.gate
    }

    #[must_use]
    pub fn hooks(&self) -> &HookTable {
        &self.hooks
    }

    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    // ========================================================================
    // Collector-facing
    // ========================================================================

    /// Stop producers and wait for in-flight emissions to drain
    pub fn gc_pre_pause(&self) -> DrainReport {
        let drain = self.gate.pause();
        *self.last_drain.lock() = drain;
        drain
    }

    /// The world is stopped: start buffering GC events
    ///
    /// Returns the heap-collect request this pause services, if a heap dump
    /// is enabled and one is queued. The request stays queued until
    /// [`Engine::gc_resumed`].
    pub fn gc_paused(&self) -> Option<HeapCollectRequest> {
        debug_assert!(self.gate.is_paused(), "gc_paused() without gc_pre_pause()");
        self.window_open.store(true, Ordering::Release);

        let heap_dump = Keywords(keywords::GC_HEAP_DUMP);
        let request = if self.subscriptions.keywords().contains(heap_dump) {
            self.subscriptions.peek_request()
        } else {
            None
        };

        if let Some(request) = request {
            debug!("heap walk armed for {}", request.id);
            self.heap_walk.store(true, Ordering::Release);
        }
        *self.armed.lock() = request;
        request
    }

    /// The collector is done walking the heap
    pub fn gc_pre_resume(&self) {
        self.heap_walk.store(false, Ordering::Release);
    }

    /// Restart producers and flush everything buffered during the pause
    pub fn gc_resumed(&self) -> CycleReport {
        self.window_open.store(false, Ordering::Release);
        self.heap_walk.store(false, Ordering::Release);
        self.gate.resume();

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let mut cache = IdentityCache::new();
        let (replay, types) = {
            let _guard = self.gate.enter();
            let replay = self.log.replay(self.sink.as_ref(), &mut cache);
            let types = self.log_identities(cache.drain());
            (replay, types)
        };
        self.log.reset();

        let serviced_request = self.armed.lock().take();
        if let Some(request) = serviced_request {
            if self.subscriptions.complete_request(request.id) {
                info!("Completed heap collect {} in GC cycle {cycle}", request.id);
            } else {
                debug!("{} was dropped before cycle {cycle} completed it", request.id);
            }
        }

        CycleReport { cycle, drain: *self.last_drain.lock(), replay, types, serviced_request }
    }

    /// Whether the current pause should walk the heap
    #[must_use]
    pub fn heap_walk_requested(&self) -> bool {
        self.heap_walk.load(Ordering::Acquire)
    }

    // ========================================================================
    // Producer-facing
    // ========================================================================

    /// Run the hook wired in the event's slot (no-op when unwired)
    pub fn dispatch(&self, event: &HookEvent<'_>) {
        let Some(hook) = self.hooks.get(event.slot()) else {
            return;
        };
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        hook(self, event);
    }

    /// Fire `event` on the sink through the gate
    ///
    /// Blocks while a pause is in progress. Must not be called from the
    /// thread that paused the gate.
    pub fn emit(&self, event: &HookEvent<'_>) {
        let _guard = self.gate.enter();
        self.sink.fire(event.to_event());
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Buffer `event` if the pause window is open, otherwise [`Engine::emit`] it
    pub fn emit_or_buffer(&self, event: &HookEvent<'_>) {
        if self.window_open.load(Ordering::Acquire) {
            if let Some(record) = event.as_record() {
                if self.log.append(&self.gate, &record) {
                    self.buffered.fetch_add(1, Ordering::Relaxed);
                }
                return;
            }
        }
        self.emit(event);
    }

    /// Emit bulk type events describing `types` and their parameters
    pub fn log_types(&self, types: &[TypeId]) -> BatchStats {
        let _guard = self.gate.enter();
        self.log_identities(types.iter().copied())
    }

    fn log_identities(&self, types: impl IntoIterator<Item = TypeId>) -> BatchStats {
        let mut encoder = BatchEncoder::new(self.sink.as_ref(), self.describer.as_ref(), self.config.batch);
        for type_id in types {
            if let Err(e) = encoder.log_type(type_id) {
                debug!("skipping type {type_id}: {e}");
            }
        }
        let stats = encoder.finish();
        self.types.lock().merge(&stats);
        stats
    }

    // ========================================================================
    // Session
    // ========================================================================

    pub fn apply_subscription_change(&self, change: &SessionChange) -> ChangeOutcome {
        let outcome = self.subscriptions.apply_change(change, &self.hooks, &self.registry);
        if outcome.previous != outcome.current {
            info!(
                "Session keywords {} -> {} (level {}), {} hooks wired, {} unwired",
                outcome.previous,
                outcome.current,
                change.level,
                outcome.wired.len(),
                outcome.unwired.len()
            );
        }
        outcome
    }

    #[must_use]
    pub fn is_enabled(&self, keyword: Keywords, level: Level) -> bool {
        self.subscriptions.is_enabled(keyword, level)
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            keywords: self.subscriptions.keywords(),
            level: self.subscriptions.level(),
            wired_hooks: self.hooks.wired().len(),
            hook_installs: self.hooks.installs(),
            hook_removals: self.hooks.removals(),
            pending_requests: self.subscriptions.pending_requests(),
            gate: self.gate.stats(),
            log: self.log.stats(),
            types: *self.types.lock(),
        }
    }

    /// Unwire every hook, unmap the arena and drop pending requests
    ///
    /// Idempotent; also run on drop.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let unwired = self.hooks.clear();
        let dropped = self.subscriptions.clear_requests();
        self.log.clear();

        let stats = self.stats();
        info!(
            "Engine shut down after {} GC cycles: {} events emitted, {} buffered, {} dropped \
             ({unwired} hooks unwired, {dropped} requests dropped)",
            stats.cycles, stats.emitted, stats.buffered, stats.log.dropped
        );
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
