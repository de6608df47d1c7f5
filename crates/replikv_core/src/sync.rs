//! Sync-branch tree surgery: building pull snapshots, replaying pending
//! mutations, and swapping the head.
//!
//! The wire protocol client in `replikv_sync` drives these operations:
//! `begin_sync` applies a pull patch on a branch and rebases the pending
//! mutations onto it; `end_sync` folds the branch back into the main head.

use crate::commit::{Commit, CommitHash, CommitKind, DeltaOp};
use crate::dag::{materialize, HeadState};
use crate::error::{CoreError, CoreResult};
use crate::index::IndexState;
use crate::store::{Store, StoreInner, SyncBranchState};
use crate::subscription::StoreDiff;
use crate::transaction::{WriteMeta, WriteTransaction};
use replikv_protocol::{Mutation, PatchOp};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

/// The base-state identifiers a pull request carries.
#[derive(Debug, Clone)]
pub struct PullInfo {
    /// Hash of the snapshot the client holds.
    pub base_state_id: CommitHash,
    /// The snapshot's server cookie.
    pub cookie: Value,
    /// The snapshot's acknowledged mutation ID.
    pub last_mutation_id: u64,
}

impl Store {
    /// Returns the identifiers of the snapshot underneath the current head.
    pub fn pull_info(&self) -> CoreResult<PullInfo> {
        let head = self.inner.read_state()?;
        let (cookie, last_mutation_id) = head.snapshot_info();
        Ok(PullInfo {
            base_state_id: head.snapshot.hash(),
            cookie,
            last_mutation_id,
        })
    }

    /// Builds a sync branch from a pull response: applies `patch` to the
    /// base snapshot, then replays every pending mutation with id >
    /// `last_mutation_id` on top. Returns the branch head hash.
    ///
    /// A `last_mutation_id` below the base snapshot's is a protocol error;
    /// a patch-application failure aborts the whole cycle with no branch.
    pub fn begin_sync(
        &self,
        cookie: Value,
        last_mutation_id: u64,
        patch: &[PatchOp],
    ) -> CoreResult<CommitHash> {
        let inner = &self.inner;
        inner.check_open()?;

        let head = inner.read_state()?;
        let (_, base_lmid) = head.snapshot_info();
        if last_mutation_id < base_lmid {
            return Err(CoreError::protocol(format!(
                "pull lastMutationID regressed from {base_lmid} to {last_mutation_id}"
            )));
        }

        // State of the base snapshot alone, without pending local commits.
        let base_state = {
            let graph = inner.graph.lock();
            materialize(&graph, head.snapshot.hash())?
        };

        let mut map = (*base_state.map).clone();
        for op in patch {
            match op {
                PatchOp::Del { key } if key.is_empty() => {
                    map.clear();
                }
                PatchOp::Put { key, value } => {
                    map.insert(key.clone(), value.clone());
                }
                PatchOp::Del { key } => {
                    map.remove(key);
                }
            }
        }

        // Index definitions follow the head (they may have been created or
        // dropped since the base snapshot); entries are rebuilt over the
        // patched contents.
        let indexes: BTreeMap<String, IndexState> = head
            .indexes
            .values()
            .map(|state| {
                (
                    state.def.name.clone(),
                    IndexState::build(state.def.clone(), &map),
                )
            })
            .collect();

        // The snapshot's delta is its full contents relative to empty.
        let delta: Vec<DeltaOp> = map
            .iter()
            .map(|(key, value)| DeltaOp::Put {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        let snapshot = Arc::new(Commit::new(
            Some(head.snapshot.hash()),
            CommitKind::Snapshot {
                cookie,
                last_mutation_id,
                indexes: indexes.values().map(|s| s.def.clone()).collect(),
            },
            delta,
        ));
        inner.register_branch_commit(Arc::clone(&snapshot));

        let mut state = HeadState {
            commit: Arc::clone(&snapshot),
            map: Arc::new(map),
            indexes: Arc::new(indexes),
            snapshot: Arc::clone(&snapshot),
            max_mutation_id: last_mutation_id,
        };

        // Rebase: replay the unacknowledged pending mutations in id order.
        let pending = {
            let graph = inner.graph.lock();
            graph.pending(head.commit.hash())?
        };
        for commit in pending {
            let Some(mutation) = commit.mutation() else {
                continue;
            };
            if mutation.id <= last_mutation_id {
                continue;
            }
            state = replay_mutation(inner, state, mutation.clone())?;
        }

        let branch_head = state.commit.hash();
        debug!(sync_head = %branch_head, "sync branch built");
        *inner.sync_branch.lock() = Some(SyncBranchState {
            state,
            base_snapshot: head.snapshot.hash(),
        });
        Ok(branch_head)
    }

    /// Folds the sync branch at `sync_head` back into the main head.
    ///
    /// Local mutations committed while the pull was in flight are replayed
    /// on top of the branch first; then the head is swapped atomically,
    /// acknowledged mutations leave the pending log (they are below the new
    /// snapshot), and subscriptions are notified of the net change.
    pub fn end_sync(&self, sync_head: CommitHash) -> CoreResult<CommitHash> {
        let inner = &self.inner;
        inner.check_open()?;

        let mut guard = inner.head.write();

        let branch = inner
            .sync_branch
            .lock()
            .take()
            .ok_or_else(|| CoreError::protocol("no sync branch in progress"))?;
        if branch.state.commit.hash() != sync_head {
            return Err(CoreError::protocol(format!(
                "unknown sync head {sync_head}"
            )));
        }
        if guard.snapshot.hash() != branch.base_snapshot {
            return Err(CoreError::protocol(
                "main snapshot changed while pull was in flight",
            ));
        }

        // Replay mutations that landed on main after the branch was built.
        let missed = {
            let graph = inner.graph.lock();
            graph.pending(guard.commit.hash())?
        };
        let mut state = branch.state;
        let mut replayed = 0usize;
        for commit in missed {
            let Some(mutation) = commit.mutation() else {
                continue;
            };
            if mutation.id <= state.max_mutation_id {
                continue;
            }
            state = replay_mutation(inner, state, mutation.clone())?;
            replayed += 1;
        }
        if replayed > 0 {
            debug!(replayed, "replayed mutations committed during pull");
        }

        let new_head = state.commit.hash();

        // Persist the branch chain and the head pointer in one atomic batch.
        let mut batch = replikv_storage::WriteBatch::new();
        {
            let graph = inner.graph.lock();
            for commit in graph.unpersisted_suffix(new_head)? {
                batch.put(
                    crate::dag::commit_key(commit.hash()),
                    commit.encode()?,
                );
            }
        }
        batch.put(crate::dag::META_HEAD, new_head.to_hex().into_bytes());
        inner.backend.apply(batch)?;

        {
            let mut graph = inner.graph.lock();
            let mut cursor = Some(new_head);
            while let Some(hash) = cursor {
                if graph.is_persisted(hash) {
                    break;
                }
                graph.mark_persisted(hash);
                cursor = graph.get(hash).ok().and_then(|c| c.parent());
            }
            inner.sweep(&mut graph, &[new_head]);
        }

        let diff = diff_states(&guard, &state);
        *guard = state;
        drop(guard);

        inner.subscriptions.publish(diff);
        Ok(new_head)
    }
}

/// Replays one mutation on a sync branch.
///
/// A failure is logged and recorded as an empty, errored commit so mutation
/// IDs keep their order; it never aborts the rebase.
fn replay_mutation(
    inner: &StoreInner,
    base: HeadState,
    mutation: Mutation,
) -> CoreResult<HeadState> {
    let mutator = inner.mutators.read().get(&mutation.name).cloned();

    let attempt = match mutator {
        None => Err(CoreError::unknown_mutator(&mutation.name)),
        Some(f) => {
            let meta = WriteMeta::Mutation {
                mutation: mutation.clone(),
                errored: false,
            };
            let mut tx = WriteTransaction::begin_branch(inner, base.clone(), meta);
            match f(&mut tx, &mutation.args) {
                Ok(_) => tx.commit_branch(),
                Err(err) => Err(err),
            }
        }
    };

    match attempt {
        Ok(state) => Ok(state),
        Err(err) => {
            error!(
                mutator = %mutation.name,
                id = mutation.id,
                error = %err,
                "replay failed, appending errored commit"
            );
            let meta = WriteMeta::Mutation {
                mutation,
                errored: true,
            };
            WriteTransaction::begin_branch(inner, base, meta).commit_branch()
        }
    }
}

/// Computes the net key and index-entry changes between two states.
fn diff_states(old: &HeadState, new: &HeadState) -> StoreDiff {
    let mut diff = StoreDiff::default();

    let mut old_iter = old.map.iter();
    let mut new_iter = new.map.iter();
    let mut old_next = old_iter.next();
    let mut new_next = new_iter.next();
    loop {
        match (old_next, new_next) {
            (None, None) => break,
            (Some((k, _)), None) => {
                diff.keys.insert(k.clone());
                old_next = old_iter.next();
            }
            (None, Some((k, _))) => {
                diff.keys.insert(k.clone());
                new_next = new_iter.next();
            }
            (Some((ok, ov)), Some((nk, nv))) => match ok.cmp(nk) {
                std::cmp::Ordering::Less => {
                    diff.keys.insert(ok.clone());
                    old_next = old_iter.next();
                }
                std::cmp::Ordering::Greater => {
                    diff.keys.insert(nk.clone());
                    new_next = new_iter.next();
                }
                std::cmp::Ordering::Equal => {
                    if ov != nv {
                        diff.keys.insert(ok.clone());
                    }
                    old_next = old_iter.next();
                    new_next = new_iter.next();
                }
            },
        }
    }

    for name in old.indexes.keys().chain(new.indexes.keys()) {
        if diff.full_indexes.contains(name) || diff.index_entries.contains_key(name) {
            continue;
        }
        match (old.indexes.get(name), new.indexes.get(name)) {
            (Some(old_index), Some(new_index)) => {
                let mut changed = std::collections::BTreeSet::new();
                for entry in &old_index.entries {
                    if !new_index.entries.contains(entry) || diff.keys.contains(&entry.primary) {
                        changed.insert(entry.clone());
                    }
                }
                for entry in &new_index.entries {
                    if !old_index.entries.contains(entry) || diff.keys.contains(&entry.primary) {
                        changed.insert(entry.clone());
                    }
                }
                if !changed.is_empty() {
                    diff.index_entries.insert(name.clone(), changed);
                }
            }
            // Created or dropped wholesale.
            _ => {
                diff.full_indexes.insert(name.clone());
            }
        }
    }

    diff
}
