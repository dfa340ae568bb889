//! # Subscription Manager
//!
//! Turns session reconfigurations into hook wiring. Only the keyword bits
//! that actually changed are touched, so re-applying the same session is a
//! no-op and switching one keyword never disturbs the hooks of another.
//!
//! ```text
//!   previous 0b0000_0101 ─┐
//!                         ├─ xor ─▶ 0b0000_0001 ─▶ unwire GC slots
//!   new      0b0000_0100 ─┘
//! ```
//!
//! The same lock guards the FIFO of on-demand heap-collect requests: a
//! request is queued by a session change and serviced by the next GC pause.

use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crate::domain::{FilterError, Keywords, Level, RequestId};
use crate::hooks::{HookRegistry, HookSlot, HookTable};
use rtgate_common::keywords;

/// Filter key whose presence turns a heap-collect session into a request
pub const GC_SEQUENCE_KEY: &str = "GCSeqNumber";

/// Session filter data: NUL-separated `key\0value\0` pairs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPayload {
    bytes: Vec<u8>,
}

impl FilterPayload {
    /// Wrap raw filter bytes without validating them
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Wrap raw filter bytes, checking every key has a value
    ///
    /// # Errors
    /// Returns [`FilterError::InvalidUtf8`] for non UTF-8 data and
    /// [`FilterError::DanglingKey`] for a trailing key with no value.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, FilterError> {
        let text = std::str::from_utf8(&bytes).map_err(|_| FilterError::InvalidUtf8)?;
        let fields: Vec<&str> = text.trim_end_matches('\0').split('\0').collect();
        if fields.len() % 2 == 1 && !text.is_empty() {
            return Err(FilterError::DanglingKey(fields[fields.len() - 1].to_string()));
        }
        Ok(Self { bytes })
    }

    #[must_use]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let mut bytes = Vec::new();
        for (key, value) in pairs {
            bytes.extend_from_slice(key.as_bytes());
            bytes.push(0);
            bytes.extend_from_slice(value.as_bytes());
            bytes.push(0);
        }
        Self { bytes }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Key/value pairs in order; pairs that are not UTF-8 are skipped
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        let mut fields = self.bytes.split(|b| *b == 0);
        std::iter::from_fn(move || loop {
            let key = fields.next()?;
            let value = fields.next()?;
            if key.is_empty() {
                return None;
            }
            if let (Ok(key), Ok(value)) = (std::str::from_utf8(key), std::str::from_utf8(value)) {
                return Some((key, value));
            }
        })
    }

    /// Value of the first pair whose key is `key`
    #[must_use]
    pub fn find(&self, key: &str) -> Option<&str> {
        self.pairs().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

/// A session reconfiguration, already decoded from its transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChange {
    pub is_enabled: bool,
    pub level: Level,
    pub match_any: Keywords,
    /// Carried for completeness; wiring only looks at `match_any`
    pub match_all: Keywords,
    pub filter: Option<FilterPayload>,
}

impl SessionChange {
    #[must_use]
    pub fn enable(level: Level, match_any: Keywords) -> Self {
        Self { is_enabled: true, level, match_any, match_all: Keywords::NONE, filter: None }
    }

    #[must_use]
    pub fn disable() -> Self {
        Self {
            is_enabled: false,
            level: Level::LogAlways,
            match_any: Keywords::NONE,
            match_all: Keywords::NONE,
            filter: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: FilterPayload) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// A pending on-demand heap collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapCollectRequest {
    pub id: RequestId,
    /// Caller-supplied sequence number from the session filter
    pub sequence: Option<u32>,
}

/// What one [`SubscriptionManager::apply_change`] did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeOutcome {
    pub previous: Keywords,
    pub current: Keywords,
    pub wired: Vec<HookSlot>,
    pub unwired: Vec<HookSlot>,
    pub request: Option<HeapCollectRequest>,
    pub dropped_requests: usize,
}

impl ChangeOutcome {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.wired.is_empty() && self.unwired.is_empty() && self.request.is_none()
    }
}

#[derive(Debug, Default)]
struct SubscriptionState {
    is_enabled: bool,
    level: Level,
    keywords: Keywords,
    requests: VecDeque<HeapCollectRequest>,
    next_request: u64,
}

/// Session state, hook wiring and the heap-collect request queue
pub struct SubscriptionManager {
    state: Mutex<SubscriptionState>,
    // Lock-free mirrors for the producer-side check
    enabled: AtomicBool,
    level: AtomicU8,
    mask: AtomicU64,
    changes: AtomicU64,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self {
            state: Mutex::new(SubscriptionState::default()),
            enabled: AtomicBool::new(false),
            level: AtomicU8::new(Level::LogAlways as u8),
            mask: AtomicU64::new(0),
            changes: AtomicU64::new(0),
        }
    }
}

impl SubscriptionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a session change, wiring and unwiring only the changed keywords
    pub fn apply_change(
        &self,
        change: &SessionChange,
        table: &HookTable,
        registry: &HookRegistry,
    ) -> ChangeOutcome {
        let mut state = self.state.lock();
        let previous = state.keywords;
        let current = if change.is_enabled { change.match_any } else { Keywords::NONE };

        let mut outcome = ChangeOutcome { previous, current, ..ChangeOutcome::default() };
        for bit in previous.diff(current).bits() {
            for slot in HookSlot::for_keyword(bit) {
                if current.contains(bit) {
                    table.install(slot, registry.hook_for(slot));
                    outcome.wired.push(slot);
                } else if table.remove(slot) {
                    outcome.unwired.push(slot);
                }
            }
        }

        state.is_enabled = change.is_enabled;
        state.level = change.level;
        state.keywords = current;

        if !change.is_enabled && !state.requests.is_empty() {
            outcome.dropped_requests = state.requests.len();
            state.requests.clear();
            info!("Provider disabled, dropping {} pending heap-collect requests", outcome.dropped_requests);
        }

        if current.contains(Keywords(keywords::GC_HEAP_COLLECT)) {
            if let Some(value) = change.filter.as_ref().and_then(|f| f.find(GC_SEQUENCE_KEY)) {
                state.next_request += 1;
                let request =
                    HeapCollectRequest { id: RequestId(state.next_request), sequence: value.parse().ok() };
                state.requests.push_back(request);
                outcome.request = Some(request);
                debug!("queued heap-collect {} (sequence {:?})", request.id, request.sequence);
            }
        }

        self.enabled.store(state.is_enabled, Ordering::Release);
        self.level.store(state.level as u8, Ordering::Release);
        self.mask.store(current.0, Ordering::Release);
        self.changes.fetch_add(1, Ordering::Relaxed);

        if !outcome.is_noop() {
            debug!(
                "session {previous} -> {current}: {} wired, {} unwired",
                outcome.wired.len(),
                outcome.unwired.len()
            );
        }
        outcome
    }

    /// Whether an event with `keyword` at `level` should be produced
    ///
    /// The session mask matches any: an event tagged with several keywords is
    /// enabled when one of them is on. An empty `keyword` matches any enabled
    /// session.
    #[must_use]
    pub fn is_enabled(&self, keyword: Keywords, level: Level) -> bool {
        if !self.enabled.load(Ordering::Acquire) {
            return false;
        }
        if level > Level::from(self.level.load(Ordering::Acquire)) {
            return false;
        }
        keyword.is_empty() || Keywords(self.mask.load(Ordering::Acquire)).intersects(keyword)
    }

    #[must_use]
    pub fn keywords(&self) -> Keywords {
        self.state.lock().keywords
    }

    #[must_use]
    pub fn level(&self) -> Level {
        self.state.lock().level
    }

    /// The request the next pause should service, left in the queue
    #[must_use]
    pub fn peek_request(&self) -> Option<HeapCollectRequest> {
        self.state.lock().requests.front().copied()
    }

    /// Pop the head request if it is `id`
    ///
    /// Returns `false` if the head is a different request (or the queue was
    /// emptied by a disable in the meantime).
    pub fn complete_request(&self, id: RequestId) -> bool {
        let mut state = self.state.lock();
        if state.requests.front().is_some_and(|head| head.id == id) {
            state.requests.pop_front();
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Drop every pending request; returns how many there were
    pub fn clear_requests(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.requests.len();
        state.requests.clear();
        dropped
    }

    #[must_use]
    pub fn changes(&self) -> u64 {
        self.changes.load(Ordering::Relaxed)
    }
}
