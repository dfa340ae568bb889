//! # Bulk Type Batching
//!
//! Packs type descriptors into size-bounded bulk events. A descriptor is
//! never split across two events and never emitted partially; a type's
//! parameter types are logged in front of it, within the same event when the
//! whole group fits.
//!
//! ```text
//!   ┌────────────┬──────────┬──────────┬─────┬──────────┐
//!   │ count  u32 │ item #0  │ item #1  │ ... │ item #n  │   ≤ ceiling bytes
//!   │ inst   u16 │          │          │     │          │
//!   └────────────┴──────────┴──────────┴─────┴──────────┘
//! ```

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::config::BatchConfig;
use crate::domain::{BatchError, TypeId};
use crate::event::Event;
use crate::sink::EventSink;
use rtgate_common::{BulkTypeHeader, BULK_TYPE_HEADER_SIZE, TYPE_DESCRIPTOR_BASE_SIZE};

/// Flat description of one runtime type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub type_id: TypeId,
    pub module_id: u64,
    pub type_name_id: u32,
    pub flags: u32,
    pub element_type: u8,
    /// Generic arguments / element types, each logged before this type
    #[serde(default)]
    pub params: Vec<TypeId>,
}

impl TypeDescriptor {
    /// A descriptor with no parameters
    #[must_use]
    pub fn simple(type_id: TypeId) -> Self {
        Self { type_id, module_id: 0, type_name_id: 0, flags: 0, element_type: 0, params: Vec::new() }
    }

    #[must_use]
    pub fn with_params(mut self, params: impl IntoIterator<Item = TypeId>) -> Self {
        self.params = params.into_iter().collect();
        self
    }

    /// Bytes this descriptor occupies inside a bulk event
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        TYPE_DESCRIPTOR_BASE_SIZE + 8 * self.params.len()
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.type_id.0.to_le_bytes());
        out.extend_from_slice(&self.module_id.to_le_bytes());
        out.extend_from_slice(&self.type_name_id.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.push(self.element_type);
        // Names are not resolved: always the empty UTF-16 string
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&(self.params.len() as u32).to_le_bytes());
        for param in &self.params {
            out.extend_from_slice(&param.0.to_le_bytes());
        }
    }
}

/// Source of type descriptions (the runtime's type system)
pub trait TypeDescriber: Send + Sync {
    fn describe(&self, type_id: TypeId) -> Option<TypeDescriptor>;
}

/// [`TypeDescriber`] over a fixed set of descriptors
#[derive(Debug, Clone, Default)]
pub struct StaticTypeTable {
    types: HashMap<TypeId, TypeDescriptor>,
}

impl StaticTypeTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, descriptor: TypeDescriptor) {
        self.types.insert(descriptor.type_id, descriptor);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl FromIterator<TypeDescriptor> for StaticTypeTable {
    fn from_iter<I: IntoIterator<Item = TypeDescriptor>>(iter: I) -> Self {
        let mut table = Self::new();
        for descriptor in iter {
            table.insert(descriptor);
        }
        table
    }
}

impl TypeDescriber for StaticTypeTable {
    fn describe(&self, type_id: TypeId) -> Option<TypeDescriptor> {
        self.types.get(&type_id).cloned()
    }
}

/// What one encoder emitted over its lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub items: u64,
    pub flushes: u64,
    pub bytes_emitted: u64,
    /// Items larger than a whole batch
    pub rejected: u64,
    /// Type ids the describer did not know
    pub unknown: u64,
}

impl BatchStats {
    pub fn merge(&mut self, other: &BatchStats) {
        self.items += other.items;
        self.flushes += other.flushes;
        self.bytes_emitted += other.bytes_emitted;
        self.rejected += other.rejected;
        self.unknown += other.unknown;
    }
}

/// Accumulates descriptors and fires one [`Event::BulkType`] per batch
///
/// Pending items are flushed on drop.
pub struct BatchEncoder<'a> {
    sink: &'a dyn EventSink,
    describer: &'a dyn TypeDescriber,
    config: BatchConfig,
    items: Vec<u8>,
    count: u32,
    /// Types already in the current batch
    seen: HashSet<TypeId>,
    stats: BatchStats,
}

impl<'a> BatchEncoder<'a> {
    pub fn new(sink: &'a dyn EventSink, describer: &'a dyn TypeDescriber, config: BatchConfig) -> Self {
        Self {
            sink,
            describer,
            config,
            items: Vec::with_capacity(config.ceiling.saturating_sub(BULK_TYPE_HEADER_SIZE)),
            count: 0,
            seen: HashSet::new(),
            stats: BatchStats::default(),
        }
    }

    /// Bytes the pending batch would occupy if flushed now (header included)
    #[must_use]
    pub fn bytes_used(&self) -> usize {
        BULK_TYPE_HEADER_SIZE + self.items.len()
    }

    #[must_use]
    pub fn pending(&self) -> u32 {
        self.count
    }

    /// Append one descriptor, flushing first if it does not fit
    ///
    /// # Errors
    /// Returns [`BatchError::ItemTooLarge`] if the descriptor could not fit
    /// even in an empty batch. Nothing is emitted for it.
    pub fn log_item(&mut self, item: &TypeDescriptor) -> Result<(), BatchError> {
        let size = item.encoded_size();
        if BULK_TYPE_HEADER_SIZE + size > self.config.ceiling {
            self.stats.rejected += 1;
            let err = BatchError::ItemTooLarge { size, ceiling: self.config.ceiling };
            warn!("Dropping type {}: {err}", item.type_id);
            return Err(err);
        }

        if self.bytes_used() + size > self.config.ceiling {
            self.flush();
        }

        item.encode(&mut self.items);
        self.count += 1;
        self.stats.items += 1;
        self.seen.insert(item.type_id);
        Ok(())
    }

    /// Log `type_id` preceded by every parameter type not yet in this batch
    ///
    /// The whole group lands in one batch when it can. A group larger than
    /// an empty batch is logged item by item and may be split across
    /// flushes, so `type_id` can end up in a later batch than some of its
    /// parameters.
    ///
    /// # Errors
    /// Returns [`BatchError::UnknownType`] if `type_id` itself cannot be
    /// described, or the first [`BatchError::ItemTooLarge`] hit while logging
    /// the group.
    pub fn log_type(&mut self, type_id: TypeId) -> Result<(), BatchError> {
        if self.seen.contains(&type_id) {
            return Ok(());
        }

        let mut group = self.closure(type_id)?;
        let mut size: usize = group.iter().map(TypeDescriptor::encoded_size).sum();

        if self.count > 0 && self.bytes_used() + size > self.config.ceiling {
            self.flush();
            // Parameters emitted in the flushed batch must be repeated
            group = self.closure(type_id)?;
            size = group.iter().map(TypeDescriptor::encoded_size).sum();
        }

        if BULK_TYPE_HEADER_SIZE + size > self.config.ceiling {
            debug!("type {type_id} group of {size} bytes exceeds one batch, logging item by item");
        }

        let mut first_err = None;
        for item in &group {
            if let Err(e) = self.log_item(item) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Unseen descriptors reachable from `root`, parameters first
    fn closure(&mut self, root: TypeId) -> Result<Vec<TypeDescriptor>, BatchError> {
        let Some(descriptor) = self.describer.describe(root) else {
            self.stats.unknown += 1;
            return Err(BatchError::UnknownType(root.0));
        };

        let mut group = Vec::new();
        let mut visited = HashSet::from([root]);
        self.collect_params(&descriptor, &mut visited, &mut group);
        group.push(descriptor);
        Ok(group)
    }

    fn collect_params(
        &mut self,
        descriptor: &TypeDescriptor,
        visited: &mut HashSet<TypeId>,
        group: &mut Vec<TypeDescriptor>,
    ) {
        for param in &descriptor.params {
            if self.seen.contains(param) || !visited.insert(*param) {
                continue;
            }
            match self.describer.describe(*param) {
                Some(inner) => {
                    self.collect_params(&inner, visited, group);
                    group.push(inner);
                }
                None => {
                    self.stats.unknown += 1;
                    debug!("parameter {param} of type {} has no description", descriptor.type_id);
                }
            }
        }
    }

    /// Emit the pending batch, if any, and start a new one
    pub fn flush(&mut self) {
        if self.count == 0 {
            return;
        }

        let header = BulkTypeHeader { count: self.count, instance_id: self.config.instance_id };
        let mut payload = Vec::with_capacity(self.bytes_used());
        payload.extend_from_slice(&header.encode());
        payload.extend_from_slice(&self.items);
        debug_assert!(payload.len() <= self.config.ceiling);

        self.stats.flushes += 1;
        self.stats.bytes_emitted += payload.len() as u64;
        self.sink.fire(Event::BulkType { count: self.count, instance_id: self.config.instance_id, payload });

        self.items.clear();
        self.count = 0;
        self.seen.clear();
    }

    /// Flush what is pending and return the totals
    pub fn finish(mut self) -> BatchStats {
        self.flush();
        self.stats
    }
}

impl Drop for BatchEncoder<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}
