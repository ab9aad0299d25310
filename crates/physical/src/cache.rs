//! Container read cache.
//!
//! Byte-bounded FIFO of record payloads keyed by (stream, ASN, version).
//! Keys carry the version so an overwritten record can never be served from
//! a stale entry; truncation and record deletes still evict eagerly to free
//! the budget.

use ktlog_core::{Asn, StreamId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Cached metadata and data of one record version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRecord {
    /// Metadata buffer
    pub metadata: Vec<u8>,
    /// Data buffer
    pub data: Vec<u8>,
}

impl CachedRecord {
    fn weight(&self) -> u64 {
        (self.metadata.len() + self.data.len()) as u64
    }
}

type CacheKey = (StreamId, Asn, u64);

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, Arc<CachedRecord>>,
    order: VecDeque<CacheKey>,
    usage: u64,
    limit: u64,
}

impl CacheState {
    fn evict_to(&mut self, target: u64) {
        while self.usage > target {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.usage -= entry.weight();
            }
        }
    }
}

/// FIFO read cache with a byte budget.
#[derive(Debug)]
pub struct ReadCache {
    state: Mutex<CacheState>,
}

impl ReadCache {
    /// Create a cache holding at most `limit` payload bytes
    pub fn new(limit: u64) -> Self {
        ReadCache {
            state: Mutex::new(CacheState {
                limit,
                ..CacheState::default()
            }),
        }
    }

    /// Look up a record version
    pub fn get(&self, stream: StreamId, asn: Asn, version: u64) -> Option<Arc<CachedRecord>> {
        self.state.lock().entries.get(&(stream, asn, version)).cloned()
    }

    /// Insert a record version, evicting the oldest entries as needed.
    ///
    /// Records larger than the whole budget are not cached.
    pub fn insert(&self, stream: StreamId, asn: Asn, version: u64, record: CachedRecord) {
        let mut state = self.state.lock();
        let weight = record.weight();
        if weight > state.limit {
            return;
        }
        let key = (stream, asn, version);
        if state.entries.contains_key(&key) {
            return;
        }
        let target = state.limit - weight;
        state.evict_to(target);
        state.entries.insert(key, Arc::new(record));
        state.order.push_back(key);
        state.usage += weight;
    }

    /// Drop every cached version of one record
    pub fn invalidate_record(&self, stream: StreamId, asn: Asn) {
        self.retain(|key| !(key.0 == stream && key.1 == asn));
    }

    /// Drop cached records of `stream` at or below `asn`
    pub fn invalidate_through(&self, stream: StreamId, asn: Asn) {
        self.retain(|key| !(key.0 == stream && key.1 <= asn));
    }

    /// Drop everything cached for `stream`
    pub fn invalidate_stream(&self, stream: StreamId) {
        self.retain(|key| key.0 != stream);
    }

    fn retain(&self, keep: impl Fn(&CacheKey) -> bool) {
        let mut state = self.state.lock();
        let mut freed = 0;
        state.entries.retain(|key, entry| {
            let kept = keep(key);
            if !kept {
                freed += entry.weight();
            }
            kept
        });
        state.usage -= freed;
        let CacheState { order, entries, .. } = &mut *state;
        order.retain(|key| entries.contains_key(key));
    }

    /// (limit, usage) in bytes
    pub fn size(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.limit, state.usage)
    }

    /// Change the budget, evicting immediately if it shrank
    pub fn set_limit(&self, limit: u64) {
        let mut state = self.state.lock();
        state.limit = limit;
        state.evict_to(limit);
    }
}
