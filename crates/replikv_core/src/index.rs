//! Materialized secondary indexes.
//!
//! An index maps a JSON-pointer projection of matching rows to the rows
//! themselves. Entries are composite `(secondary, primary)` keys ordered
//! lexicographically by secondary and then by primary. The components are
//! kept separate so two entries are never conflated, whatever bytes the
//! strings contain.

use crate::pointer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Definition of a secondary index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Unique index name.
    pub name: String,
    /// Only rows whose key starts with this prefix are indexed.
    pub key_prefix: String,
    /// JSON pointer selecting the secondary key within the row value.
    pub json_pointer: String,
}

impl IndexDef {
    /// Creates an index definition.
    pub fn new(
        name: impl Into<String>,
        key_prefix: impl Into<String>,
        json_pointer: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            key_prefix: key_prefix.into(),
            json_pointer: json_pointer.into(),
        }
    }
}

/// One materialized index entry: the composite `(secondary, primary)` key.
///
/// Ordered lexicographically by secondary, then primary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexEntry {
    /// The projected secondary key.
    pub secondary: String,
    /// The primary row key.
    pub primary: String,
}

impl IndexEntry {
    /// Creates a composite entry key.
    pub fn new(secondary: impl Into<String>, primary: impl Into<String>) -> Self {
        Self {
            secondary: secondary.into(),
            primary: primary.into(),
        }
    }
}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.secondary.cmp(&other.secondary) {
            std::cmp::Ordering::Equal => self.primary.cmp(&other.primary),
            ord => ord,
        }
    }
}

/// Projects the secondary key strings out of a row value.
///
/// A string target yields one entry; an array of strings yields one entry
/// per element with duplicates collapsed to the first occurrence. Any other
/// target (including a missing one) yields nothing; such rows are skipped,
/// never errors.
pub(crate) fn secondary_values(value: &Value, json_pointer: &str) -> Vec<String> {
    match pointer::resolve(value, json_pointer) {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => {
            let mut seen = BTreeSet::new();
            let mut out = Vec::new();
            if !items.iter().all(Value::is_string) {
                return Vec::new();
            }
            for item in items {
                if let Value::String(s) = item {
                    if seen.insert(s.as_str()) {
                        out.push(s.clone());
                    }
                }
            }
            out
        }
        _ => Vec::new(),
    }
}

/// A live index: its definition plus the materialized entry set.
#[derive(Debug, Clone)]
pub(crate) struct IndexState {
    pub(crate) def: IndexDef,
    pub(crate) entries: BTreeSet<IndexEntry>,
}

impl IndexState {
    /// Builds the index by scanning `map` for rows matching the prefix.
    pub(crate) fn build(def: IndexDef, map: &BTreeMap<String, Value>) -> Self {
        let mut state = Self {
            def,
            entries: BTreeSet::new(),
        };
        let prefix = state.def.key_prefix.clone();
        for (key, value) in map
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
        {
            state.insert_row(key, value, None);
        }
        state
    }

    /// Applies a row change, removing entries emitted for the old value and
    /// emitting entries for the new one.
    ///
    /// Every entry touched (removed, added, or retained while the row value
    /// changed) is recorded in `changed` so subscriptions over this index
    /// re-evaluate.
    pub(crate) fn update_row(
        &mut self,
        key: &str,
        old: Option<&Value>,
        new: Option<&Value>,
        changed: &mut BTreeSet<IndexEntry>,
    ) {
        if !key.starts_with(&self.def.key_prefix) {
            return;
        }
        if let Some(old) = old {
            for secondary in secondary_values(old, &self.def.json_pointer) {
                let entry = IndexEntry::new(secondary, key);
                self.entries.remove(&entry);
                changed.insert(entry);
            }
        }
        if let Some(new) = new {
            self.insert_row(key, new, Some(changed));
        }
    }

    fn insert_row(&mut self, key: &str, value: &Value, changed: Option<&mut BTreeSet<IndexEntry>>) {
        let mut changed = changed;
        for secondary in secondary_values(value, &self.def.json_pointer) {
            let entry = IndexEntry::new(secondary, key);
            if let Some(changed) = changed.as_deref_mut() {
                changed.insert(entry.clone());
            }
            self.entries.insert(entry);
        }
    }
}
