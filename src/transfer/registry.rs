//! Direct-dispatch segment id table.
//!
//! Ids come from one counter seeded randomly at startup. Zero means "no
//! segment" and is never handed out; ids still live after a wraparound are
//! skipped so a stale id can only miss, never hit an unrelated segment.

use crate::protocol::{ContentHash, NO_SEGMENT_ID};
use std::collections::HashMap;

#[derive(Debug)]
pub struct SegmentRegistry {
    last_id: u32,
    routes: HashMap<u32, ContentHash>,
}

impl Default for SegmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self::with_seed(rand::random::<u32>())
    }

    pub fn with_seed(seed: u32) -> Self {
        Self {
            last_id: seed,
            routes: HashMap::new(),
        }
    }

    /// Allocates the next id and routes it to `owner` in one step.
    pub fn allocate(&mut self, owner: ContentHash) -> u32 {
        loop {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id == NO_SEGMENT_ID || self.routes.contains_key(&self.last_id) {
                continue;
            }
            self.routes.insert(self.last_id, owner);
            return self.last_id;
        }
    }

    pub fn release(&mut self, segment_id: u32) -> Option<ContentHash> {
        self.routes.remove(&segment_id)
    }

    pub fn lookup(&self, segment_id: u32) -> Option<ContentHash> {
        self.routes.get(&segment_id).copied()
    }

    /// Drops every id still routed to `owner`.
    pub fn release_owner(&mut self, owner: &ContentHash) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, h| h != owner);
        before - self.routes.len()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
