//! Cached key and value schemas of a store.

use crate::types::{SchemaEntry, SchemaId};
use std::collections::BTreeMap;
use tracing::warn;

/// Key schema plus the append-only map of value schemas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSet {
    key: SchemaEntry,
    values: BTreeMap<SchemaId, SchemaEntry>,
    /// Incremented whenever a value schema is added.
    version: u64,
}

impl SchemaSet {
    /// Create a schema set with only a key schema.
    pub fn new(key: SchemaEntry) -> Self {
        Self {
            key,
            values: BTreeMap::new(),
            version: 0,
        }
    }

    /// Builder-style variant of [`SchemaSet::merge`] for a single schema.
    pub fn with_value_schema(mut self, entry: SchemaEntry) -> Self {
        self.merge(std::iter::once(entry));
        self
    }

    pub fn key_schema(&self) -> &SchemaEntry {
        &self.key
    }

    pub fn value_schema(&self, id: SchemaId) -> Option<&SchemaEntry> {
        self.values.get(&id)
    }

    /// Value schema with the highest id.
    pub fn latest_value_schema(&self) -> Option<&SchemaEntry> {
        self.values.values().next_back()
    }

    pub fn latest_value_schema_id(&self) -> Option<SchemaId> {
        self.values.keys().next_back().copied()
    }

    /// Reverse lookup of a value schema by its raw text.
    pub fn value_schema_id(&self, raw_schema: &str) -> Option<SchemaId> {
        let wanted = raw_schema.trim();
        self.values
            .values()
            .find(|entry| entry.raw_schema.trim() == wanted)
            .map(|entry| entry.id)
    }

    /// Value schemas in id order.
    pub fn value_schemas(&self) -> impl Iterator<Item = &SchemaEntry> {
        self.values.values()
    }

    pub fn value_schema_count(&self) -> usize {
        self.values.len()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Add value schemas. Known ids are never replaced or removed.
    ///
    /// Returns the number of schemas added.
    pub fn merge(&mut self, entries: impl IntoIterator<Item = SchemaEntry>) -> usize {
        let mut added = 0;
        for entry in entries {
            match self.values.get(&entry.id) {
                Some(existing) if existing.raw_schema != entry.raw_schema => {
                    warn!(
                        schema_id = entry.id,
                        "Registry returned a different schema for a known id, keeping the cached one"
                    );
                }
                Some(_) => {}
                None => {
                    self.values.insert(entry.id, entry);
                    added += 1;
                }
            }
        }
        if added > 0 {
            self.version += 1;
        }
        added
    }

    /// Copy of this set with `entries` merged in.
    pub fn merged(&self, entries: impl IntoIterator<Item = SchemaEntry>) -> Self {
        let mut next = self.clone();
        next.merge(entries);
        next
    }
}
