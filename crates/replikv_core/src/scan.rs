//! Scan options, iterators, and range bookkeeping.

use crate::error::{CoreError, CoreResult};
use crate::index::{IndexEntry, IndexState};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Options controlling a scan.
///
/// Scans yield entries in ascending order of the store's canonical key form:
/// the primary key for base scans, the `(secondary, primary)` composite for
/// index scans.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Only yield entries whose canonical key starts with this prefix. For
    /// index scans the prefix matches the secondary key.
    pub prefix: String,
    /// Maximum number of entries to yield, applied after filtering.
    pub limit: Option<u32>,
    /// Start position within the ordered entries.
    pub start: Option<ScanStart>,
    /// Scan the named index instead of the base map.
    pub index_name: Option<String>,
}

impl ScanOptions {
    /// Creates default options: full base scan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the prefix filter.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the entry limit.
    #[must_use]
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the start position.
    #[must_use]
    pub fn with_start(mut self, key: StartKey, exclusive: bool) -> Self {
        self.start = Some(ScanStart { key, exclusive });
        self
    }

    /// Scans the named index.
    #[must_use]
    pub fn with_index(mut self, name: impl Into<String>) -> Self {
        self.index_name = Some(name.into());
        self
    }
}

/// A scan start position.
#[derive(Debug, Clone)]
pub struct ScanStart {
    /// The key to position at.
    pub key: StartKey,
    /// If true, positioning is strictly after `key`.
    pub exclusive: bool,
}

/// The key form of a start position.
#[derive(Debug, Clone)]
pub enum StartKey {
    /// A bare key: the primary key for base scans, or a bare secondary for
    /// index scans (positioning at the beginning of that secondary).
    Primary(String),
    /// A secondary position, for index scans. An absent primary means "from
    /// the beginning of that secondary".
    Secondary {
        /// The secondary key to position at.
        secondary: String,
        /// Optional primary component of the composite position.
        primary: Option<String>,
    },
}

/// The key of a yielded scan entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanKey {
    /// Base scan: the row key.
    Primary(String),
    /// Index scan: the composite entry key.
    Index {
        /// The projected secondary key.
        secondary: String,
        /// The primary row key.
        primary: String,
    },
}

impl ScanKey {
    /// Returns the primary row key regardless of scan kind.
    #[must_use]
    pub fn primary(&self) -> &str {
        match self {
            ScanKey::Primary(key) => key,
            ScanKey::Index { primary, .. } => primary,
        }
    }
}

/// One scan result: a key and the row value.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanItem {
    /// The canonical key of this entry.
    pub key: ScanKey,
    /// The row value.
    pub value: Value,
}

/// Iterator over scan results.
///
/// The iterator owns its snapshot of the results; dropping it mid-iteration
/// releases everything it holds.
#[derive(Debug)]
pub struct ScanIter {
    items: std::vec::IntoIter<ScanItem>,
}

impl Iterator for ScanIter {
    type Item = ScanItem;

    fn next(&mut self) -> Option<ScanItem> {
        self.items.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

impl ExactSizeIterator for ScanIter {}

impl ScanIter {
    pub(crate) fn new(items: Vec<ScanItem>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

/// The key region a scan observed, recorded in subscription read sets.
///
/// Ranges deliberately ignore the limit: a key change inside the range
/// re-evaluates the query even when the change falls past the limit, and the
/// structural result compare suppresses spurious notifications.
#[derive(Debug, Clone)]
pub(crate) enum ScanRange {
    /// A base scan over primary keys.
    Primary {
        /// Primary-key prefix filter.
        prefix: String,
        /// Start bound over primary keys.
        start: Option<(String, bool)>,
    },
    /// An index scan over composite entries.
    Index {
        /// Name of the scanned index.
        name: String,
        /// Secondary-key prefix filter.
        prefix: String,
        /// Start bound over composite entries.
        start: Option<(IndexEntry, bool)>,
    },
}

impl ScanRange {
    /// Returns the index name for index ranges.
    pub(crate) fn index_name(&self) -> Option<&str> {
        match self {
            ScanRange::Primary { .. } => None,
            ScanRange::Index { name, .. } => Some(name),
        }
    }

    /// Returns true if a change to primary `key` falls inside a base range.
    pub(crate) fn matches_key(&self, key: &str) -> bool {
        match self {
            ScanRange::Primary { prefix, start } => {
                key.starts_with(prefix)
                    && match start {
                        Some((s, true)) => key > s.as_str(),
                        Some((s, false)) => key >= s.as_str(),
                        None => true,
                    }
            }
            ScanRange::Index { .. } => false,
        }
    }

    /// Returns true if a changed entry falls inside an index range.
    pub(crate) fn matches_entry(&self, entry: &IndexEntry) -> bool {
        match self {
            ScanRange::Primary { .. } => false,
            ScanRange::Index { prefix, start, .. } => {
                entry.secondary.starts_with(prefix)
                    && match start {
                        Some((s, true)) => entry > s,
                        Some((s, false)) => entry >= s,
                        None => true,
                    }
            }
        }
    }
}

/// Runs a base scan over `map`.
pub(crate) fn scan_map(
    map: &BTreeMap<String, Value>,
    opts: &ScanOptions,
) -> CoreResult<(Vec<ScanItem>, ScanRange)> {
    let start = match &opts.start {
        None => None,
        Some(ScanStart {
            key: StartKey::Primary(key),
            exclusive,
        }) => Some((key.clone(), *exclusive)),
        Some(ScanStart {
            key: StartKey::Secondary { .. },
            ..
        }) => {
            return Err(CoreError::invalid_operation(
                "secondary start key on a base scan",
            ))
        }
    };

    let range = ScanRange::Primary {
        prefix: opts.prefix.clone(),
        start: start.clone(),
    };

    let lower = lower_bound(&opts.prefix, start);
    let limit = opts.limit.map_or(usize::MAX, |l| l as usize);

    let items = map
        .range((lower, Bound::<String>::Unbounded))
        .take_while(|(k, _)| k.starts_with(&opts.prefix))
        .take(limit)
        .map(|(k, v)| ScanItem {
            key: ScanKey::Primary(k.clone()),
            value: v.clone(),
        })
        .collect();

    Ok((items, range))
}

/// Runs an index scan over the index's materialized entries, resolving row
/// values through `map`.
pub(crate) fn scan_index(
    index: &IndexState,
    map: &BTreeMap<String, Value>,
    opts: &ScanOptions,
) -> CoreResult<(Vec<ScanItem>, ScanRange)> {
    let start: Option<(IndexEntry, bool)> = match &opts.start {
        None => None,
        Some(ScanStart { key, exclusive }) => {
            let entry = match key {
                // A bare string positions at the beginning of that secondary.
                StartKey::Primary(secondary) => IndexEntry::new(secondary.clone(), String::new()),
                StartKey::Secondary { secondary, primary } => IndexEntry::new(
                    secondary.clone(),
                    primary.clone().unwrap_or_default(),
                ),
            };
            Some((entry, *exclusive))
        }
    };

    let range = ScanRange::Index {
        name: index.def.name.clone(),
        prefix: opts.prefix.clone(),
        start: start.clone(),
    };

    let prefix_bound = IndexEntry::new(opts.prefix.clone(), String::new());
    let lower = match start {
        Some((entry, exclusive)) if entry >= prefix_bound => {
            if exclusive {
                Bound::Excluded(entry)
            } else {
                Bound::Included(entry)
            }
        }
        _ => Bound::Included(prefix_bound),
    };
    let limit = opts.limit.map_or(usize::MAX, |l| l as usize);

    let mut items = Vec::new();
    for entry in index
        .entries
        .range((lower, Bound::<IndexEntry>::Unbounded))
        .take_while(|e| e.secondary.starts_with(&opts.prefix))
    {
        // Index maintenance keeps entries in lockstep with rows; a missing
        // row would be a bug, but skipping is safer than panicking.
        let Some(value) = map.get(&entry.primary) else {
            continue;
        };
        items.push(ScanItem {
            key: ScanKey::Index {
                secondary: entry.secondary.clone(),
                primary: entry.primary.clone(),
            },
            value: value.clone(),
        });
        if items.len() >= limit {
            break;
        }
    }

    Ok((items, range))
}

fn lower_bound(prefix: &str, start: Option<(String, bool)>) -> Bound<String> {
    match start {
        Some((key, exclusive)) if key.as_str() >= prefix => {
            if exclusive {
                Bound::Excluded(key)
            } else {
                Bound::Included(key)
            }
        }
        _ => Bound::Included(prefix.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexDef;
    use serde_json::json;

    fn sample_map() -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        for (i, key) in ["a/0", "a/1", "a/2", "a/3", "a/4", "b/0", "b/1", "b/2", "c/0"]
            .iter()
            .enumerate()
        {
            map.insert((*key).to_string(), json!(i));
        }
        map
    }

    fn primary_keys(items: &[ScanItem]) -> Vec<&str> {
        items.iter().map(|i| i.key.primary()).collect()
    }

    #[test]
    fn scan_prefix() {
        let map = sample_map();
        let (items, _) = scan_map(&map, &ScanOptions::new().with_prefix("a")).unwrap();
        assert_eq!(primary_keys(&items), vec!["a/0", "a/1", "a/2", "a/3", "a/4"]);
        assert_eq!(items[0].value, json!(0));
        assert_eq!(items[4].value, json!(4));
    }

    #[test]
    fn scan_start_exclusive() {
        let map = sample_map();
        let opts = ScanOptions::new().with_start(StartKey::Primary("b/1".into()), true);
        let (items, _) = scan_map(&map, &opts).unwrap();
        assert_eq!(primary_keys(&items), vec!["b/2", "c/0"]);
    }

    #[test]
    fn scan_start_inclusive() {
        let map = sample_map();
        let opts = ScanOptions::new().with_start(StartKey::Primary("b/1".into()), false);
        let (items, _) = scan_map(&map, &opts).unwrap();
        assert_eq!(primary_keys(&items), vec!["b/1", "b/2", "c/0"]);
    }

    #[test]
    fn scan_limit() {
        let map = sample_map();
        let (items, _) = scan_map(&map, &ScanOptions::new().with_limit(3)).unwrap();
        assert_eq!(primary_keys(&items), vec!["a/0", "a/1", "a/2"]);
    }

    #[test]
    fn scan_prefix_with_earlier_start() {
        let map = sample_map();
        // Start below the prefix region: the prefix still wins.
        let opts = ScanOptions::new()
            .with_prefix("b")
            .with_start(StartKey::Primary("a/0".into()), false);
        let (items, _) = scan_map(&map, &opts).unwrap();
        assert_eq!(primary_keys(&items), vec!["b/0", "b/1", "b/2"]);
    }

    #[test]
    fn scan_secondary_start_on_base_scan_is_an_error() {
        let map = sample_map();
        let opts = ScanOptions::new().with_start(
            StartKey::Secondary {
                secondary: "s".into(),
                primary: None,
            },
            false,
        );
        assert!(matches!(
            scan_map(&map, &opts),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    fn sample_index() -> (IndexState, BTreeMap<String, Value>) {
        let mut map = BTreeMap::new();
        map.insert("t/1".to_string(), json!({"tag": "b", "n": 1}));
        map.insert("t/2".to_string(), json!({"tag": "a", "n": 2}));
        map.insert("t/3".to_string(), json!({"tag": "b", "n": 3}));
        let index = IndexState::build(IndexDef::new("byTag", "t/", "/tag"), &map);
        (index, map)
    }

    #[test]
    fn index_scan_orders_by_secondary_then_primary() {
        let (index, map) = sample_index();
        let (items, _) = scan_index(&index, &map, &ScanOptions::new()).unwrap();
        let keys: Vec<_> = items
            .iter()
            .map(|i| match &i.key {
                ScanKey::Index { secondary, primary } => (secondary.as_str(), primary.as_str()),
                ScanKey::Primary(_) => panic!("expected index key"),
            })
            .collect();
        assert_eq!(keys, vec![("a", "t/2"), ("b", "t/1"), ("b", "t/3")]);
        assert_eq!(items[0].value, json!({"tag": "a", "n": 2}));
    }

    #[test]
    fn index_scan_prefix_matches_secondary() {
        let (index, map) = sample_index();
        let (items, _) = scan_index(&index, &map, &ScanOptions::new().with_prefix("b")).unwrap();
        assert_eq!(primary_keys(&items), vec!["t/1", "t/3"]);
    }

    #[test]
    fn index_scan_start_at_bare_secondary() {
        let (index, map) = sample_index();
        let opts = ScanOptions::new().with_start(StartKey::Primary("b".into()), false);
        let (items, _) = scan_index(&index, &map, &opts).unwrap();
        assert_eq!(primary_keys(&items), vec!["t/1", "t/3"]);
    }

    #[test]
    fn index_scan_start_at_composite() {
        let (index, map) = sample_index();
        let opts = ScanOptions::new().with_start(
            StartKey::Secondary {
                secondary: "b".into(),
                primary: Some("t/1".into()),
            },
            true,
        );
        let (items, _) = scan_index(&index, &map, &opts).unwrap();
        assert_eq!(primary_keys(&items), vec!["t/3"]);
    }

    #[test]
    fn scan_range_matching() {
        let range = ScanRange::Primary {
            prefix: "a/".into(),
            start: Some(("a/2".into(), true)),
        };
        assert!(!range.matches_key("a/1"));
        assert!(!range.matches_key("a/2"));
        assert!(range.matches_key("a/3"));
        assert!(!range.matches_key("b/0"));

        let open = ScanRange::Primary {
            prefix: String::new(),
            start: None,
        };
        assert!(open.matches_key("anything"));

        let index = ScanRange::Index {
            name: "i".into(),
            prefix: "b".into(),
            start: Some((IndexEntry::new("b", "t/1"), true)),
        };
        assert_eq!(index.index_name(), Some("i"));
        assert!(!index.matches_entry(&IndexEntry::new("a", "t/9")));
        assert!(!index.matches_entry(&IndexEntry::new("b", "t/1")));
        assert!(index.matches_entry(&IndexEntry::new("b", "t/2")));
        assert!(!index.matches_key("b"));
    }
}
