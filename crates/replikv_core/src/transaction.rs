//! Read and write transactions.
//!
//! Reads take a snapshot of the head and never block each other. Writes hold
//! the head lock exclusively for their whole lifetime: read transactions
//! opened while a write is in flight queue behind it and observe the
//! post-write state. Dropping a write transaction without committing aborts
//! it; the buffered writes are discarded.

use crate::commit::{Commit, CommitKind, DeltaOp};
use crate::dag::{apply_row_change, HeadState};
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexEntry, IndexState};
use crate::scan::{scan_index, scan_map, ScanIter, ScanOptions, ScanRange};
use crate::store::StoreInner;
use crate::subscription::StoreDiff;
use parking_lot::{Mutex, RwLockWriteGuard};
use replikv_protocol::Mutation;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// The keys and ranges a recorded transaction has observed.
#[derive(Debug, Default)]
pub(crate) struct ReadSet {
    keys: BTreeSet<String>,
    ranges: Vec<ScanRange>,
}

impl ReadSet {
    fn record_key(&mut self, key: &str) {
        self.keys.insert(key.to_string());
    }

    fn record_range(&mut self, range: ScanRange) {
        self.ranges.push(range);
    }

    /// Returns true if any observed key or range intersects the diff.
    pub(crate) fn intersects(&self, diff: &StoreDiff) -> bool {
        if self.keys.iter().any(|k| diff.keys.contains(k)) {
            return true;
        }
        self.ranges.iter().any(|range| match range.index_name() {
            None => diff.keys.iter().any(|k| range.matches_key(k)),
            Some(name) => {
                diff.full_indexes.contains(name)
                    || diff
                        .index_entries
                        .get(name)
                        .is_some_and(|entries| entries.iter().any(|e| range.matches_entry(e)))
            }
        })
    }
}

/// A snapshot read transaction.
pub struct ReadTransaction {
    store: Arc<StoreInner>,
    state: HeadState,
    read_set: Option<Mutex<ReadSet>>,
}

impl ReadTransaction {
    pub(crate) fn new(store: Arc<StoreInner>, state: HeadState, recording: bool) -> Self {
        Self {
            store,
            state,
            read_set: recording.then(|| Mutex::new(ReadSet::default())),
        }
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.store.is_closed() {
            return Err(CoreError::TransactionClosed);
        }
        Ok(())
    }

    /// Returns the value for `key`.
    pub fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        self.check_open()?;
        if let Some(read_set) = &self.read_set {
            read_set.lock().record_key(key);
        }
        Ok(self.state.map.get(key).cloned())
    }

    /// Returns true if `key` is present.
    pub fn has(&self, key: &str) -> CoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Returns true if the store holds no keys.
    pub fn is_empty(&self) -> CoreResult<bool> {
        self.check_open()?;
        if let Some(read_set) = &self.read_set {
            // Emptiness observes every key.
            read_set.lock().record_range(ScanRange::Primary {
                prefix: String::new(),
                start: None,
            });
        }
        Ok(self.state.map.is_empty())
    }

    /// Runs a scan and returns an iterator over its results.
    pub fn scan(&self, opts: ScanOptions) -> CoreResult<ScanIter> {
        self.check_open()?;
        let (items, range) = run_scan(&self.state.map, &self.state.indexes, &opts)?;
        if let Some(read_set) = &self.read_set {
            read_set.lock().record_range(range);
        }
        Ok(ScanIter::new(items))
    }

    pub(crate) fn take_read_set(&mut self) -> ReadSet {
        self.read_set
            .take()
            .map(Mutex::into_inner)
            .unwrap_or_default()
    }
}

fn run_scan(
    map: &BTreeMap<String, Value>,
    indexes: &BTreeMap<String, IndexState>,
    opts: &ScanOptions,
) -> CoreResult<(Vec<crate::scan::ScanItem>, ScanRange)> {
    match &opts.index_name {
        None => scan_map(map, opts),
        Some(name) => {
            let index = indexes
                .get(name)
                .ok_or_else(|| CoreError::unknown_index(name))?;
            scan_index(index, map, opts)
        }
    }
}

/// What a write transaction will commit as.
pub(crate) enum WriteMeta {
    /// A mutator invocation (or replay).
    Mutation {
        /// The mutation this transaction applies.
        mutation: Mutation,
        /// True for ordering-only commits appended after a failed replay.
        errored: bool,
    },
    /// An index creation or deletion.
    IndexChange(crate::commit::IndexChangeOp),
}

/// An exclusive write transaction.
///
/// Reads within the transaction observe its prior writes. `commit` appends a
/// local commit and advances the head; dropping without commit discards all
/// buffered writes.
pub struct WriteTransaction<'a> {
    store: &'a StoreInner,
    guard: Option<RwLockWriteGuard<'a, HeadState>>,
    base: HeadState,
    map: BTreeMap<String, Value>,
    indexes: BTreeMap<String, IndexState>,
    delta: BTreeMap<String, Option<Value>>,
    index_changes: BTreeMap<String, BTreeSet<IndexEntry>>,
    meta: WriteMeta,
}

impl<'a> WriteTransaction<'a> {
    /// Begins a write against the main head; the guard is held until the
    /// transaction ends.
    pub(crate) fn begin(
        store: &'a StoreInner,
        guard: RwLockWriteGuard<'a, HeadState>,
        meta: WriteMeta,
    ) -> Self {
        let base = (*guard).clone();
        Self::with_base(store, Some(guard), base, meta)
    }

    /// Begins a write against a sync-branch state; no head lock is taken.
    pub(crate) fn begin_branch(store: &'a StoreInner, base: HeadState, meta: WriteMeta) -> Self {
        Self::with_base(store, None, base, meta)
    }

    fn with_base(
        store: &'a StoreInner,
        guard: Option<RwLockWriteGuard<'a, HeadState>>,
        base: HeadState,
        meta: WriteMeta,
    ) -> Self {
        let map = (*base.map).clone();
        let indexes = (*base.indexes).clone();
        Self {
            store,
            guard,
            base,
            map,
            indexes,
            delta: BTreeMap::new(),
            index_changes: BTreeMap::new(),
            meta,
        }
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.store.is_closed() {
            return Err(CoreError::TransactionClosed);
        }
        Ok(())
    }

    /// Returns the value for `key`, observing this transaction's writes.
    pub fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        self.check_open()?;
        Ok(self.map.get(key).cloned())
    }

    /// Returns true if `key` is present.
    pub fn has(&self, key: &str) -> CoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Returns true if the store holds no keys.
    pub fn is_empty(&self) -> CoreResult<bool> {
        self.check_open()?;
        Ok(self.map.is_empty())
    }

    /// Runs a scan over this transaction's view.
    pub fn scan(&self, opts: ScanOptions) -> CoreResult<ScanIter> {
        self.check_open()?;
        let (items, _) = run_scan(&self.map, &self.indexes, &opts)?;
        Ok(ScanIter::new(items))
    }

    /// Writes `value` under `key`.
    pub fn put(&mut self, key: impl Into<String>, value: Value) -> CoreResult<()> {
        self.check_open()?;
        let key = key.into();
        apply_row_change(
            &mut self.map,
            &mut self.indexes,
            &key,
            Some(value.clone()),
            &mut self.index_changes,
        );
        self.delta.insert(key, Some(value));
        Ok(())
    }

    /// Removes `key`, returning true iff it existed.
    pub fn del(&mut self, key: &str) -> CoreResult<bool> {
        self.check_open()?;
        let old = apply_row_change(
            &mut self.map,
            &mut self.indexes,
            key,
            None,
            &mut self.index_changes,
        );
        let existed = old.is_some();
        if existed || self.delta.contains_key(key) {
            self.delta.insert(key.to_string(), None);
        }
        Ok(existed)
    }

    pub(crate) fn create_index_state(&mut self, state: IndexState) {
        self.indexes.insert(state.def.name.clone(), state);
    }

    pub(crate) fn drop_index_state(&mut self, name: &str) {
        self.indexes.remove(name);
    }

    pub(crate) fn map(&self) -> &BTreeMap<String, Value> {
        &self.map
    }

    pub(crate) fn has_index(&self, name: &str) -> bool {
        self.indexes.contains_key(name)
    }

    /// Builds the commit, its successor head state, and the diff to publish.
    fn build(mut self) -> (Arc<Commit>, HeadState, StoreDiff, Option<RwLockWriteGuard<'a, HeadState>>) {
        // Drop no-op delta entries so diffs reflect actual change.
        let base_map = Arc::clone(&self.base.map);
        self.delta.retain(|key, new| match (base_map.get(key), new) {
            (Some(old), Some(new)) => old != new,
            (None, None) => false,
            _ => true,
        });

        let delta: Vec<DeltaOp> = self
            .delta
            .iter()
            .map(|(key, new)| match new {
                Some(value) => DeltaOp::Put {
                    key: key.clone(),
                    value: value.clone(),
                },
                None => DeltaOp::Del { key: key.clone() },
            })
            .collect();

        let mut diff = StoreDiff::default();
        diff.keys.extend(self.delta.keys().cloned());
        for (name, changed) in std::mem::take(&mut self.index_changes) {
            if !changed.is_empty() {
                diff.index_entries.insert(name, changed);
            }
        }

        let (kind, mutation_id) = match &self.meta {
            WriteMeta::Mutation { mutation, errored } => (
                CommitKind::Local {
                    mutation: mutation.clone(),
                    errored: *errored,
                },
                Some(mutation.id),
            ),
            WriteMeta::IndexChange(change) => {
                let name = match change {
                    crate::commit::IndexChangeOp::Create(def) => def.name.clone(),
                    crate::commit::IndexChangeOp::Drop(name) => name.clone(),
                };
                diff.full_indexes.insert(name);
                (
                    CommitKind::IndexChange {
                        change: change.clone(),
                    },
                    None,
                )
            }
        };

        let commit = Arc::new(Commit::new(Some(self.base.commit.hash()), kind, delta));
        let state = HeadState {
            commit: Arc::clone(&commit),
            map: Arc::new(std::mem::take(&mut self.map)),
            indexes: Arc::new(std::mem::take(&mut self.indexes)),
            snapshot: Arc::clone(&self.base.snapshot),
            max_mutation_id: mutation_id
                .map_or(self.base.max_mutation_id, |id| {
                    self.base.max_mutation_id.max(id)
                }),
        };
        (commit, state, diff, self.guard.take())
    }

    /// Commits against the main head, advancing it.
    pub fn commit(self) -> CoreResult<crate::commit::CommitHash> {
        self.check_open()?;
        debug_assert!(self.guard.is_some(), "branch write committed as main");
        let store = self.store;
        let (commit, state, diff, guard) = self.build();
        let mut guard = guard.ok_or_else(|| {
            CoreError::invalid_operation("write transaction has no head lock")
        })?;
        store.finish_main_commit(&mut guard, commit, state, diff)
    }

    /// Commits on a sync branch, returning the successor state.
    pub(crate) fn commit_branch(self) -> CoreResult<HeadState> {
        self.check_open()?;
        let store = self.store;
        let (commit, state, _diff, _guard) = self.build();
        store.register_branch_commit(commit);
        Ok(state)
    }
}
