//! Commit graph registry, materialization, and persistence.
//!
//! Commits live in an in-memory registry keyed by content address. The main
//! head (and everything reachable from it) is additionally persisted through
//! the backend under `commit/<hash>` keys plus a `meta/head` pointer, so a
//! durable store can rebuild its state on open by replaying deltas from the
//! chain's snapshot. Unreachable commits are swept after head updates.

use crate::commit::{Commit, CommitHash, CommitKind, DeltaOp, IndexChangeOp};
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexEntry, IndexState};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Backend key holding the current head hash.
pub(crate) const META_HEAD: &str = "meta/head";

/// Backend key holding the persisted client ID.
pub(crate) const META_CLIENT_ID: &str = "meta/client_id";

/// Backend key prefix for commit records.
pub(crate) const COMMIT_PREFIX: &str = "commit/";

/// Returns the backend key of a commit record.
pub(crate) fn commit_key(hash: CommitHash) -> String {
    format!("{COMMIT_PREFIX}{hash}")
}

/// A materialized view of the store at some commit.
#[derive(Clone)]
pub(crate) struct HeadState {
    /// The commit this state corresponds to.
    pub(crate) commit: Arc<Commit>,
    /// Full key-value contents.
    pub(crate) map: Arc<BTreeMap<String, Value>>,
    /// Live indexes with materialized entries.
    pub(crate) indexes: Arc<BTreeMap<String, IndexState>>,
    /// The chain's base snapshot commit.
    pub(crate) snapshot: Arc<Commit>,
    /// Highest mutation ID issued on this chain.
    pub(crate) max_mutation_id: u64,
}

impl HeadState {
    /// Returns the snapshot's cookie and acknowledged mutation ID.
    pub(crate) fn snapshot_info(&self) -> (Value, u64) {
        match self.snapshot.kind() {
            CommitKind::Snapshot {
                cookie,
                last_mutation_id,
                ..
            } => (cookie.clone(), *last_mutation_id),
            _ => (Value::Null, 0),
        }
    }
}

/// Applies one row change to a map and its indexes, returning the old value.
///
/// Changed index entries are accumulated per index in `index_changes`.
pub(crate) fn apply_row_change(
    map: &mut BTreeMap<String, Value>,
    indexes: &mut BTreeMap<String, IndexState>,
    key: &str,
    new: Option<Value>,
    index_changes: &mut BTreeMap<String, BTreeSet<IndexEntry>>,
) -> Option<Value> {
    let old = match &new {
        Some(value) => map.insert(key.to_string(), value.clone()),
        None => map.remove(key),
    };
    for (name, index) in indexes.iter_mut() {
        let changed = index_changes.entry(name.clone()).or_default();
        index.update_row(key, old.as_ref(), new.as_ref(), changed);
    }
    old
}

/// The in-memory commit registry.
///
/// Tracks which commits have been written through the backend so head swaps
/// can persist exactly the new suffix of the chain.
pub(crate) struct CommitGraph {
    commits: HashMap<CommitHash, Arc<Commit>>,
    persisted: HashSet<CommitHash>,
}

impl CommitGraph {
    pub(crate) fn new() -> Self {
        Self {
            commits: HashMap::new(),
            persisted: HashSet::new(),
        }
    }

    pub(crate) fn insert(&mut self, commit: Arc<Commit>, persisted: bool) {
        let hash = commit.hash();
        self.commits.insert(hash, commit);
        if persisted {
            self.persisted.insert(hash);
        }
    }

    pub(crate) fn get(&self, hash: CommitHash) -> CoreResult<Arc<Commit>> {
        self.commits
            .get(&hash)
            .cloned()
            .ok_or_else(|| CoreError::protocol(format!("missing commit {hash}")))
    }

    pub(crate) fn mark_persisted(&mut self, hash: CommitHash) {
        self.persisted.insert(hash);
    }

    pub(crate) fn is_persisted(&self, hash: CommitHash) -> bool {
        self.persisted.contains(&hash)
    }

    /// Returns the chain from the nearest snapshot (first) to `head` (last).
    pub(crate) fn chain(&self, head: CommitHash) -> CoreResult<Vec<Arc<Commit>>> {
        let mut chain = Vec::new();
        let mut cursor = self.get(head)?;
        loop {
            let is_snapshot = cursor.is_snapshot();
            chain.push(Arc::clone(&cursor));
            if is_snapshot {
                break;
            }
            let parent = cursor
                .parent()
                .ok_or_else(|| CoreError::protocol("commit chain has no snapshot"))?;
            cursor = self.get(parent)?;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Returns the local commits above the chain's snapshot, ascending by
    /// mutation ID.
    pub(crate) fn pending(&self, head: CommitHash) -> CoreResult<Vec<Arc<Commit>>> {
        let chain = self.chain(head)?;
        let last_mutation_id = match chain[0].kind() {
            CommitKind::Snapshot {
                last_mutation_id, ..
            } => *last_mutation_id,
            _ => 0,
        };
        Ok(chain
            .into_iter()
            .filter(|c| {
                c.mutation()
                    .map(|m| m.id > last_mutation_id)
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Returns the commits from `head` down that are not yet persisted, in
    /// parent-first order.
    pub(crate) fn unpersisted_suffix(&self, head: CommitHash) -> CoreResult<Vec<Arc<Commit>>> {
        let mut suffix = Vec::new();
        let mut cursor = head;
        loop {
            if self.is_persisted(cursor) {
                break;
            }
            let commit = self.get(cursor)?;
            let parent = commit.parent();
            let is_snapshot = commit.is_snapshot();
            suffix.push(commit);
            match parent {
                Some(parent) if !is_snapshot => cursor = parent,
                _ => break,
            }
        }
        suffix.reverse();
        Ok(suffix)
    }

    /// Sweeps commits unreachable from `live` heads.
    ///
    /// Returns the removed commits that had been persisted, so their backend
    /// records can be deleted.
    pub(crate) fn collect_garbage(&mut self, live: &[CommitHash]) -> Vec<CommitHash> {
        let mut reachable = HashSet::new();
        for &head in live {
            let mut cursor = Some(head);
            while let Some(hash) = cursor {
                if !reachable.insert(hash) {
                    break;
                }
                // History below a snapshot is dead weight; a chain is only
                // live from its snapshot up.
                let Some(commit) = self.commits.get(&hash) else {
                    break;
                };
                if commit.is_snapshot() {
                    break;
                }
                cursor = commit.parent();
            }
        }

        let dead: Vec<CommitHash> = self
            .commits
            .keys()
            .filter(|h| !reachable.contains(*h))
            .copied()
            .collect();

        let mut removed_persisted = Vec::new();
        for hash in dead {
            self.commits.remove(&hash);
            if self.persisted.remove(&hash) {
                removed_persisted.push(hash);
            }
        }
        removed_persisted
    }

    /// Loads the chain ending at `head` from persisted commit records.
    pub(crate) fn load(
        backend: &dyn replikv_storage::KvBackend,
        head: CommitHash,
    ) -> CoreResult<Self> {
        let mut graph = Self::new();
        let mut cursor = head;
        loop {
            let bytes = backend
                .get(&commit_key(cursor))?
                .ok_or_else(|| CoreError::protocol(format!("missing commit record {cursor}")))?;
            let commit = Arc::new(Commit::decode(cursor, &bytes)?);
            let parent = commit.parent();
            let is_snapshot = commit.is_snapshot();
            graph.insert(commit, true);
            if is_snapshot {
                break;
            }
            match parent {
                Some(parent) => cursor = parent,
                None => return Err(CoreError::protocol("commit chain has no snapshot")),
            }
        }
        Ok(graph)
    }
}

/// Materializes the store state at `head` by replaying the chain's deltas
/// from its snapshot.
pub(crate) fn materialize(graph: &CommitGraph, head: CommitHash) -> CoreResult<HeadState> {
    let chain = graph.chain(head)?;
    let snapshot = Arc::clone(&chain[0]);

    let (snapshot_defs, mut max_mutation_id) = match snapshot.kind() {
        CommitKind::Snapshot {
            indexes,
            last_mutation_id,
            ..
        } => (indexes.clone(), *last_mutation_id),
        _ => return Err(CoreError::protocol("chain does not start at a snapshot")),
    };

    let mut map: BTreeMap<String, Value> = BTreeMap::new();
    for op in snapshot.delta() {
        match op {
            DeltaOp::Put { key, value } => {
                map.insert(key.clone(), value.clone());
            }
            DeltaOp::Del { key } => {
                map.remove(key);
            }
        }
    }

    let mut indexes: BTreeMap<String, IndexState> = BTreeMap::new();
    for def in snapshot_defs {
        let name = def.name.clone();
        indexes.insert(name, IndexState::build(def, &map));
    }

    let mut scratch = BTreeMap::new();
    for commit in chain.iter().skip(1) {
        match commit.kind() {
            CommitKind::Local { mutation, .. } => {
                for op in commit.delta() {
                    let (key, new) = match op {
                        DeltaOp::Put { key, value } => (key, Some(value.clone())),
                        DeltaOp::Del { key } => (key, None),
                    };
                    apply_row_change(&mut map, &mut indexes, key, new, &mut scratch);
                }
                max_mutation_id = max_mutation_id.max(mutation.id);
            }
            CommitKind::IndexChange { change } => match change {
                IndexChangeOp::Create(def) => {
                    let name = def.name.clone();
                    indexes.insert(name, IndexState::build(def.clone(), &map));
                }
                IndexChangeOp::Drop(name) => {
                    indexes.remove(name);
                }
            },
            CommitKind::Snapshot { .. } => {
                return Err(CoreError::protocol("snapshot above the chain base"))
            }
        }
    }

    Ok(HeadState {
        commit: Arc::clone(chain.last().expect("chain is non-empty")),
        map: Arc::new(map),
        indexes: Arc::new(indexes),
        snapshot,
        max_mutation_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexDef;
    use replikv_protocol::Mutation;
    use serde_json::json;

    fn snapshot(lmid: u64, contents: &[(&str, Value)]) -> Commit {
        Commit::new(
            None,
            CommitKind::Snapshot {
                cookie: json!(null),
                last_mutation_id: lmid,
                indexes: vec![],
            },
            contents
                .iter()
                .map(|(k, v)| DeltaOp::Put {
                    key: (*k).to_string(),
                    value: v.clone(),
                })
                .collect(),
        )
    }

    fn local(parent: CommitHash, id: u64, key: &str, value: Value) -> Commit {
        Commit::new(
            Some(parent),
            CommitKind::Local {
                mutation: Mutation::new(id, "m", json!(null)),
                errored: false,
            },
            vec![DeltaOp::Put {
                key: key.to_string(),
                value,
            }],
        )
    }

    #[test]
    fn chain_and_pending() {
        let mut graph = CommitGraph::new();
        let snap = Arc::new(snapshot(1, &[("base", json!(0))]));
        let l2 = Arc::new(local(snap.hash(), 2, "a", json!(2)));
        let l3 = Arc::new(local(l2.hash(), 3, "b", json!(3)));
        graph.insert(Arc::clone(&snap), true);
        graph.insert(Arc::clone(&l2), false);
        graph.insert(Arc::clone(&l3), false);

        let chain = graph.chain(l3.hash()).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].hash(), snap.hash());
        assert_eq!(chain[2].hash(), l3.hash());

        let pending = graph.pending(l3.hash()).unwrap();
        let ids: Vec<u64> = pending.iter().map(|c| c.mutation().unwrap().id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn materialize_replays_deltas() {
        let mut graph = CommitGraph::new();
        let snap = Arc::new(snapshot(0, &[("a", json!("old")), ("gone", json!(1))]));
        let l1 = Arc::new(local(snap.hash(), 1, "a", json!("new")));
        let l2 = Arc::new(Commit::new(
            Some(l1.hash()),
            CommitKind::Local {
                mutation: Mutation::new(2, "m", json!(null)),
                errored: false,
            },
            vec![DeltaOp::Del { key: "gone".into() }],
        ));
        graph.insert(Arc::clone(&snap), true);
        graph.insert(Arc::clone(&l1), false);
        graph.insert(Arc::clone(&l2), false);

        let state = materialize(&graph, l2.hash()).unwrap();
        assert_eq!(state.map.get("a"), Some(&json!("new")));
        assert_eq!(state.map.get("gone"), None);
        assert_eq!(state.max_mutation_id, 2);
        assert_eq!(state.snapshot.hash(), snap.hash());
    }

    #[test]
    fn materialize_builds_indexes_from_index_change() {
        let mut graph = CommitGraph::new();
        let snap = Arc::new(snapshot(0, &[("t/1", json!({"tag": "x"}))]));
        let create = Arc::new(Commit::new(
            Some(snap.hash()),
            CommitKind::IndexChange {
                change: IndexChangeOp::Create(IndexDef::new("byTag", "t/", "/tag")),
            },
            vec![],
        ));
        let l1 = Arc::new(local(create.hash(), 1, "t/2", json!({"tag": "y"})));
        graph.insert(Arc::clone(&snap), true);
        graph.insert(Arc::clone(&create), false);
        graph.insert(Arc::clone(&l1), false);

        let state = materialize(&graph, l1.hash()).unwrap();
        let index = state.indexes.get("byTag").unwrap();
        assert_eq!(index.entries.len(), 2);
    }

    #[test]
    fn garbage_collection_removes_abandoned_branch() {
        let mut graph = CommitGraph::new();
        let snap = Arc::new(snapshot(0, &[]));
        let keep = Arc::new(local(snap.hash(), 1, "k", json!(1)));
        let dead = Arc::new(local(snap.hash(), 1, "d", json!(1)));
        graph.insert(Arc::clone(&snap), true);
        graph.insert(Arc::clone(&keep), true);
        graph.insert(Arc::clone(&dead), true);

        let removed = graph.collect_garbage(&[keep.hash()]);
        assert_eq!(removed, vec![dead.hash()]);
        assert!(graph.get(dead.hash()).is_err());
        assert!(graph.get(keep.hash()).is_ok());
        assert!(graph.get(snap.hash()).is_ok());
    }

    #[test]
    fn garbage_collection_drops_history_below_new_snapshot() {
        let mut graph = CommitGraph::new();
        let old_snap = Arc::new(snapshot(0, &[]));
        let old_local = Arc::new(local(old_snap.hash(), 1, "a", json!(1)));
        let new_snap = Arc::new(Commit::new(
            Some(old_snap.hash()),
            CommitKind::Snapshot {
                cookie: json!(1),
                last_mutation_id: 1,
                indexes: vec![],
            },
            vec![],
        ));
        graph.insert(Arc::clone(&old_snap), true);
        graph.insert(Arc::clone(&old_local), true);
        graph.insert(Arc::clone(&new_snap), true);

        let mut removed = graph.collect_garbage(&[new_snap.hash()]);
        removed.sort();
        let mut expected = vec![old_snap.hash(), old_local.hash()];
        expected.sort();
        assert_eq!(removed, expected);
        assert!(graph.get(new_snap.hash()).is_ok());
    }

    #[test]
    fn unpersisted_suffix_stops_at_persisted() {
        let mut graph = CommitGraph::new();
        let snap = Arc::new(snapshot(0, &[]));
        let l1 = Arc::new(local(snap.hash(), 1, "a", json!(1)));
        let l2 = Arc::new(local(l1.hash(), 2, "b", json!(2)));
        graph.insert(Arc::clone(&snap), true);
        graph.insert(Arc::clone(&l1), false);
        graph.insert(Arc::clone(&l2), false);

        let suffix = graph.unpersisted_suffix(l2.hash()).unwrap();
        let hashes: Vec<CommitHash> = suffix.iter().map(|c| c.hash()).collect();
        assert_eq!(hashes, vec![l1.hash(), l2.hash()]);
    }
}
