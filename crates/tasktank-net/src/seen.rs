//! Bounded memory of recently seen record ids.
//!
//! The same record usually arrives once per relay. Callers stay idempotent
//! regardless, this just keeps duplicate work off the hot path.

use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone)]
pub struct SeenCache {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Returns `true` the first time an id is seen.
    pub fn first_sighting(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(4096)
    }
}
