//! Relay-side record retention.
//!
//! Replaceable records keep only the latest per (author, kind, `d` tag);
//! ephemeral records are fanned out and never retained; anything else is
//! kept by id.

use std::collections::HashMap;

use tasktank_shared::identity::AuthorPubkey;
use tasktank_shared::record::{Record, RecordFilter};

/// What happened to a record handed to [`RecordStore::accept`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// First record under its key.
    Stored,
    /// Superseded an older replaceable record.
    Replaced,
    /// An equal or newer record already holds the key; nothing changed.
    Stale,
    /// Exactly this record is already stored.
    Duplicate,
    /// Not retained, only fanned out.
    Ephemeral,
}

impl StoreOutcome {
    /// Whether live subscribers should see the record.
    pub fn should_broadcast(self) -> bool {
        matches!(
            self,
            StoreOutcome::Stored | StoreOutcome::Replaced | StoreOutcome::Ephemeral
        )
    }
}

type ReplaceKey = (AuthorPubkey, u32, String);

#[derive(Debug, Default)]
pub struct RecordStore {
    replaceable: HashMap<ReplaceKey, Record>,
    regular: HashMap<String, Record>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, record: Record) -> StoreOutcome {
        if record.is_ephemeral() {
            return StoreOutcome::Ephemeral;
        }

        if record.is_replaceable() {
            let key = record.replace_key();
            return match self.replaceable.get(&key) {
                Some(existing) if existing.id == record.id => StoreOutcome::Duplicate,
                Some(existing) if !record.supersedes(existing) => StoreOutcome::Stale,
                Some(_) => {
                    self.replaceable.insert(key, record);
                    StoreOutcome::Replaced
                }
                None => {
                    self.replaceable.insert(key, record);
                    StoreOutcome::Stored
                }
            };
        }

        if self.regular.contains_key(&record.id) {
            return StoreOutcome::Duplicate;
        }
        self.regular.insert(record.id.clone(), record);
        StoreOutcome::Stored
    }

    /// Stored records matching any filter, oldest first.
    pub fn query(&self, filters: &[RecordFilter]) -> Vec<Record> {
        let mut out: Vec<Record> = self
            .replaceable
            .values()
            .chain(self.regular.values())
            .filter(|r| filters.iter().any(|f| f.matches(r)))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn len(&self) -> usize {
        self.replaceable.len() + self.regular.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
