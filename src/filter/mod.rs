//! Packet filters applied between parsing and logging
//!
//! Filters are conjunctive: a packet survives only if every active filter
//! accepts it. The chain and its mutable sets are shared across both decode
//! pipelines in dual-protocol mode, so stateful filters guard their sets
//! with a mutex.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::amr::Packet;

pub trait MessageFilter: Send + Sync {
    fn matches(&self, packet: &Packet) -> bool;
}

/// Ordered conjunction of filters. Every filter is evaluated for every
/// packet, with no short-circuit, so stateful filters observe all packets
/// regardless of chain order. An empty chain accepts everything.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn MessageFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, filter: Arc<dyn MessageFilter>) {
        self.filters.push(filter);
    }

    pub fn matches(&self, packet: &Packet) -> bool {
        let mut accept = true;
        for filter in &self.filters {
            if !filter.matches(packet) {
                accept = false;
            }
        }
        accept
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// Accepts the first packet per meter id and suppresses repeats.
/// Marking an id seen is a side effect of evaluation.
#[derive(Default)]
pub struct UniqueFilter {
    seen: Mutex<HashSet<u32>>,
}

impl UniqueFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageFilter for UniqueFilter {
    fn matches(&self, packet: &Packet) -> bool {
        self.seen.lock().unwrap().insert(packet.meter_id())
    }
}

/// Keeps only packets whose meter id is in the configured set. The set is
/// mutable: single-shot mode drains it as target meters are heard, so it
/// doubles as the completion set.
pub struct MeterIdFilter {
    ids: Mutex<HashSet<u32>>,
}

impl MeterIdFilter {
    pub fn new(ids: HashSet<u32>) -> Self {
        Self { ids: Mutex::new(ids) }
    }

    /// Remove a matched id. Idempotent: removing an absent id is a no-op,
    /// and a removed id is never resurrected.
    pub fn remove(&self, id: u32) {
        self.ids.lock().unwrap().remove(&id);
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap().len()
    }
}

impl MessageFilter for MeterIdFilter {
    fn matches(&self, packet: &Packet) -> bool {
        self.ids.lock().unwrap().contains(&packet.meter_id())
    }
}

/// Keeps only packets whose meter type is in the configured set.
/// The set is fixed at configuration time.
pub struct MeterTypeFilter {
    types: HashSet<u8>,
}

impl MeterTypeFilter {
    pub fn new(types: HashSet<u8>) -> Self {
        Self { types }
    }
}

impl MessageFilter for MeterTypeFilter {
    fn matches(&self, packet: &Packet) -> bool {
        self.types.contains(&packet.meter_type())
    }
}
