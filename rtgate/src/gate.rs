//! # Fire-Event Gate
//!
//! Readers/pauser exclusion between event producers and the collector's
//! stop-the-world window.
//!
//! ## State Word
//!
//! ```text
//!  63  62                                                    0
//! ┌───┬───────────────────────────────────────────────────────┐
//! │ P │                    fire_count                          │
//! └───┴───────────────────────────────────────────────────────┘
//! ```
//!
//! - **Producers** (`enter`) CAS `fire_count + 1` while `P` is clear. That is
//!   the whole fast path: no lock, no syscall.
//! - **Pauser** (`pause`) sets `P` while keeping `fire_count`, then waits for
//!   `fire_count` to reach zero. `exit` is a plain `fetch_sub`, so producers
//!   that entered before the pause can always leave.
//! - Producers that find `P` set park on the companion mutex/condvar until
//!   `resume` clears it.
//!
//! There is no drain timeout. A producer that never exits deadlocks the
//! pauser.

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::cell::RefCell;
use std::hint;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::DrainBackoff;

const PAUSED_BIT: u64 = 1 << 63;
const COUNT_MASK: u64 = PAUSED_BIT - 1;

static NEXT_GATE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Gates the current thread is inside of (for recursion checks)
    static HELD_GATES: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Outcome of one pause drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Producers that were inside the gate when the pause started
    pub in_flight: u64,
    pub spins: u64,
    pub sleeps: u64,
    pub waited: Duration,
}

/// Counters accumulated over the life of a gate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub pauses: u64,
    /// Times a producer found the gate paused and parked
    pub parked_producers: u64,
    pub drain_spins: u64,
    pub drain_sleeps: u64,
    pub longest_drain: Duration,
}

#[derive(Default)]
struct GateCounters {
    pauses: AtomicU64,
    parked: AtomicU64,
    spins: AtomicU64,
    sleeps: AtomicU64,
    longest_drain_ns: AtomicU64,
}

/// Lock-free producer gate with a single exclusive pauser
pub struct FireGate {
    id: u64,
    state: AtomicU64,
    /// `true` while a pause controller owns the gate
    pause_lock: Mutex<bool>,
    resumed: Condvar,
    backoff: DrainBackoff,
    counters: GateCounters,
}

/// Proof that the holder is inside the gate; exits on drop
///
/// Bound to the entering thread, which tracks the gates it holds:
///
/// ```compile_fail
/// let gate = rtgate::gate::FireGate::default();
/// let guard = gate.enter();
/// std::thread::scope(|s| {
///     s.spawn(move || drop(guard));
/// });
/// ```
#[must_use = "dropping the guard exits the gate immediately"]
pub struct FireGuard<'a> {
    gate: &'a FireGate,
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for FireGuard<'_> {
    fn drop(&mut self) {
        self.gate.exit();
    }
}

impl FireGate {
    #[must_use]
    pub fn new(backoff: DrainBackoff) -> Self {
        Self {
            id: NEXT_GATE_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU64::new(0),
            pause_lock: Mutex::new(false),
            resumed: Condvar::new(),
            backoff,
            counters: GateCounters::default(),
        }
    }

    /// Enter the gate before emitting an event that reads live runtime state
    ///
    /// Returns immediately unless a pause is active, in which case the
    /// calling thread parks until [`FireGate::resume`].
    ///
    /// # Panics
    /// In debug builds, if the calling thread is already inside this gate.
    pub fn enter(&self) -> FireGuard<'_> {
        debug_assert!(!self.held_by_current_thread(), "recursive FireGate::enter()");

        loop {
            let current = self.state.load(Ordering::Acquire);
            if current & PAUSED_BIT == 0 {
                debug_assert!(current < COUNT_MASK, "fire_count overflow");
                if self
                    .state
                    .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.mark_held(true);
                    return FireGuard { gate: self, _thread_bound: PhantomData };
                }
                continue;
            }
            self.wait_for_resume();
        }
    }

    fn exit(&self) {
        self.mark_held(false);
        let previous = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous & COUNT_MASK != 0, "FireGate::exit() without enter()");
    }

    fn wait_for_resume(&self) {
        self.counters.parked.fetch_add(1, Ordering::Relaxed);
        let mut paused = self.pause_lock.lock();
        while *paused {
            self.resumed.wait(&mut paused);
        }
    }

    /// Block new producers and wait for in-flight ones to exit
    ///
    /// Called from the collector's pre-stop-the-world hook. Returns once
    /// `fire_count` is zero; the gate stays paused until [`FireGate::resume`].
    ///
    /// # Panics
    /// In debug builds, if the gate is already paused or the calling thread is
    /// inside this gate (the drain would wait on itself).
    pub fn pause(&self) -> DrainReport {
        debug_assert!(!self.held_by_current_thread(), "FireGate::pause() from inside the gate");

        {
            let mut paused = self.pause_lock.lock();
            debug_assert!(!*paused, "FireGate::pause() while already paused");
            while *paused {
                self.resumed.wait(&mut paused);
            }
            *paused = true;
        }

        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match self.state.compare_exchange_weak(
                current,
                current | PAUSED_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.counters.pauses.fetch_add(1, Ordering::Relaxed);
        let report = self.drain(current & COUNT_MASK);
        debug!(
            "gate {} paused: {} in flight, {} spins, {} sleeps, {:?}",
            self.id, report.in_flight, report.spins, report.sleeps, report.waited
        );
        report
    }

    fn drain(&self, in_flight: u64) -> DrainReport {
        let mut report = DrainReport { in_flight, ..DrainReport::default() };
        if in_flight == 0 {
            return report;
        }

        let start = Instant::now();
        let mut sleep = self.backoff.initial_sleep();
        let mut warn_at = self.backoff.warn_after();

        while self.state.load(Ordering::Acquire) & COUNT_MASK != 0 {
            if report.spins < u64::from(self.backoff.spin_iterations) {
                report.spins += 1;
                hint::spin_loop();
                continue;
            }

            thread::sleep(sleep);
            report.sleeps += 1;
            sleep = (sleep * 2).min(self.backoff.max_sleep());

            let elapsed = start.elapsed();
            if elapsed >= warn_at {
                warn!(
                    "gate {} pause still draining after {:?}: {} producers inside",
                    self.id,
                    elapsed,
                    self.fire_count()
                );
                warn_at = warn_at.saturating_mul(2);
            }
        }

        report.waited = start.elapsed();
        self.counters.spins.fetch_add(report.spins, Ordering::Relaxed);
        self.counters.sleeps.fetch_add(report.sleeps, Ordering::Relaxed);
        let waited_ns = u64::try_from(report.waited.as_nanos()).unwrap_or(u64::MAX);
        self.counters.longest_drain_ns.fetch_max(waited_ns, Ordering::Relaxed);
        report
    }

    /// End the pause and wake every parked producer
    ///
    /// # Panics
    /// In debug builds, if the gate is not paused.
    pub fn resume(&self) {
        let previous = self.state.fetch_and(!PAUSED_BIT, Ordering::AcqRel);
        debug_assert!(previous & PAUSED_BIT != 0, "FireGate::resume() without pause()");

        let mut paused = self.pause_lock.lock();
        *paused = false;
        self.resumed.notify_all();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.load(Ordering::Acquire) & PAUSED_BIT != 0
    }

    /// Producers currently inside the gate
    #[must_use]
    pub fn fire_count(&self) -> u64 {
        self.state.load(Ordering::Acquire) & COUNT_MASK
    }

    #[must_use]
    pub fn stats(&self) -> GateStats {
        GateStats {
            pauses: self.counters.pauses.load(Ordering::Relaxed),
            parked_producers: self.counters.parked.load(Ordering::Relaxed),
            drain_spins: self.counters.spins.load(Ordering::Relaxed),
            drain_sleeps: self.counters.sleeps.load(Ordering::Relaxed),
            longest_drain: Duration::from_nanos(
                self.counters.longest_drain_ns.load(Ordering::Relaxed),
            ),
        }
    }

    fn held_by_current_thread(&self) -> bool {
        HELD_GATES.with(|held| held.borrow().contains(&self.id))
    }

    fn mark_held(&self, held: bool) {
        HELD_GATES.with(|gates| {
            let mut gates = gates.borrow_mut();
            if held {
                gates.push(self.id);
            } else if let Some(pos) = gates.iter().rposition(|id| *id == self.id) {
                gates.swap_remove(pos);
            }
        });
    }
}

impl Default for FireGate {
    fn default() -> Self {
        Self::new(DrainBackoff::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{Arc, Barrier};

    fn fast_backoff() -> DrainBackoff {
        DrainBackoff { spin_iterations: 10, initial_sleep_us: 50, max_sleep_us: 500, warn_after_ms: 10_000 }
    }

    #[test]
    fn test_enter_exit_counts() {
        let gate = FireGate::new(fast_backoff());
        assert_eq!(gate.fire_count(), 0);
        {
            let _guard = gate.enter();
            assert_eq!(gate.fire_count(), 1);
        }
        assert_eq!(gate.fire_count(), 0);
        assert!(!gate.is_paused());
    }

    #[test]
    fn test_pause_with_no_producers_returns_immediately() {
        let gate = FireGate::new(fast_backoff());
        let report = gate.pause();
        assert!(gate.is_paused());
        assert_eq!(report.in_flight, 0);
        assert_eq!(report.sleeps, 0);
        gate.resume();
        assert!(!gate.is_paused());
        assert_eq!(gate.stats().pauses, 1);
    }

    #[test]
    fn test_pause_waits_for_in_flight_producer() {
        let gate = Arc::new(FireGate::new(fast_backoff()));
        let entered = Arc::new(Barrier::new(2));
        let exited = Arc::new(AtomicBool::new(false));

        let producer = {
            let gate = Arc::clone(&gate);
            let entered = Arc::clone(&entered);
            let exited = Arc::clone(&exited);
            thread::spawn(move || {
                let guard = gate.enter();
                entered.wait();
                thread::sleep(Duration::from_millis(30));
                exited.store(true, Ordering::SeqCst);
                drop(guard);
            })
        };

        entered.wait();
        let report = gate.pause();
        assert!(exited.load(Ordering::SeqCst), "pause returned before producer exited");
        assert_eq!(report.in_flight, 1);
        assert_eq!(gate.fire_count(), 0);
        gate.resume();
        producer.join().unwrap();
    }

    #[test]
    fn test_pause_drains_every_in_flight_producer() {
        const PRODUCERS: usize = 6;

        let gate = Arc::new(FireGate::new(fast_backoff()));
        let entered = Arc::new(Barrier::new(PRODUCERS + 1));
        let exited = Arc::new(AtomicUsize::new(0));
        let resumed = Arc::new(AtomicBool::new(false));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|i| {
                let gate = Arc::clone(&gate);
                let entered = Arc::clone(&entered);
                let exited = Arc::clone(&exited);
                let resumed = Arc::clone(&resumed);
                thread::spawn(move || {
                    let guard = gate.enter();
                    entered.wait();
                    thread::sleep(Duration::from_millis(50 + 10 * i as u64));
                    exited.fetch_add(1, Ordering::SeqCst);
                    drop(guard);

                    let _again = gate.enter();
                    assert!(resumed.load(Ordering::SeqCst), "producer entered before resume");
                })
            })
            .collect();

        entered.wait();
        let report = gate.pause();
        assert_eq!(exited.load(Ordering::SeqCst), PRODUCERS, "pause returned before every producer exited");
        assert_eq!(report.in_flight, PRODUCERS as u64);
        assert_eq!(gate.fire_count(), 0);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(gate.fire_count(), 0);
        resumed.store(true, Ordering::SeqCst);
        gate.resume();

        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(gate.fire_count(), 0);
    }

    #[test]
    fn test_enter_blocks_while_paused() {
        let gate = Arc::new(FireGate::new(fast_backoff()));
        gate.pause();

        let entered = Arc::new(AtomicBool::new(false));
        let producer = {
            let gate = Arc::clone(&gate);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let _guard = gate.enter();
                entered.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst), "producer entered a paused gate");
        assert_eq!(gate.fire_count(), 0);

        gate.resume();
        producer.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert!(gate.stats().parked_producers >= 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "recursive FireGate::enter()")]
    fn test_recursive_enter_panics_in_debug() {
        let gate = FireGate::new(fast_backoff());
        let _outer = gate.enter();
        let _inner = gate.enter();
    }

    #[test]
    fn test_reenter_after_guard_dropped() {
        let gate = FireGate::new(fast_backoff());
        drop(gate.enter());
        let _guard = gate.enter();
        assert_eq!(gate.fire_count(), 1);
    }

    #[test]
    fn test_distinct_gates_can_nest() {
        let outer = FireGate::new(fast_backoff());
        let inner = FireGate::new(fast_backoff());
        let _a = outer.enter();
        let _b = inner.enter();
        assert_eq!(outer.fire_count(), 1);
        assert_eq!(inner.fire_count(), 1);
    }
}
