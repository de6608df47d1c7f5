//! The store facade: open/close, mutators, indexes, reads, subscriptions.

use crate::commit::{Commit, CommitHash, CommitKind, IndexChangeOp};
use crate::dag::{
    commit_key, materialize, CommitGraph, HeadState, COMMIT_PREFIX, META_CLIENT_ID, META_HEAD,
};
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexDef, IndexState};
use crate::pointer;
use crate::scan::{ScanIter, ScanOptions};
use crate::subscription::{
    StoreDiff, Subscription, SubscriptionHandlers, SubscriptionManager,
};
use crate::transaction::{ReadTransaction, WriteMeta, WriteTransaction};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use replikv_protocol::Mutation;
use replikv_storage::{KvBackend, WriteBatch};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;
use uuid::Uuid;

/// A mutator body: runs inside a write transaction with the invocation
/// arguments and returns a result value for the caller.
pub type MutatorFn =
    dyn Fn(&mut WriteTransaction<'_>, &Value) -> CoreResult<Value> + Send + Sync;

/// Bookkeeping for an in-flight pull's sync branch.
pub(crate) struct SyncBranchState {
    /// Materialized state at the branch head.
    pub(crate) state: HeadState,
    /// Hash of the main snapshot the pull was based on.
    pub(crate) base_snapshot: CommitHash,
}

pub(crate) struct StoreInner {
    name: String,
    pub(crate) backend: Arc<dyn KvBackend>,
    client_id: String,
    pub(crate) head: RwLock<HeadState>,
    pub(crate) graph: Mutex<CommitGraph>,
    pub(crate) sync_branch: Mutex<Option<SyncBranchState>>,
    pub(crate) mutators: RwLock<HashMap<String, Arc<MutatorFn>>>,
    pub(crate) subscriptions: SubscriptionManager,
    closed: AtomicBool,
}

/// A named, versioned, transactional key-value store.
///
/// `Store` is cheaply cloneable; clones share the same underlying state.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

/// Introspection counters for a store.
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Current head commit hash.
    pub head: CommitHash,
    /// Number of pending (unacknowledged) mutations.
    pub pending_count: usize,
    /// Names of live indexes.
    pub indexes: Vec<String>,
}

impl Store {
    /// Opens the named store over `backend`.
    ///
    /// A fresh backend is initialized with a genesis snapshot and a generated
    /// client ID; an existing one is recovered by replaying the persisted
    /// commit chain. Commit records left unreachable by a crash are swept.
    pub fn open(name: impl Into<String>, backend: Arc<dyn KvBackend>) -> CoreResult<Store> {
        let name = name.into();

        let client_id = match backend.get(META_CLIENT_ID)? {
            Some(bytes) => String::from_utf8(bytes)
                .map_err(|_| CoreError::protocol("client id is not valid UTF-8"))?,
            None => {
                let id = Uuid::new_v4().to_string();
                let mut batch = WriteBatch::new();
                batch.put(META_CLIENT_ID, id.clone().into_bytes());
                backend.apply(batch)?;
                id
            }
        };

        let (graph, head) = match backend.get(META_HEAD)? {
            Some(bytes) => {
                let hex = String::from_utf8(bytes)
                    .map_err(|_| CoreError::protocol("head pointer is not valid UTF-8"))?;
                let hash = CommitHash::from_hex(&hex)?;
                let graph = CommitGraph::load(&*backend, hash)?;
                let head = materialize(&graph, hash)?;
                (graph, head)
            }
            None => {
                let genesis = Arc::new(Commit::new(
                    None,
                    CommitKind::Snapshot {
                        cookie: Value::Null,
                        last_mutation_id: 0,
                        indexes: Vec::new(),
                    },
                    Vec::new(),
                ));
                let mut batch = WriteBatch::new();
                batch.put(commit_key(genesis.hash()), genesis.encode()?);
                batch.put(META_HEAD, genesis.hash().to_hex().into_bytes());
                backend.apply(batch)?;

                let mut graph = CommitGraph::new();
                graph.insert(Arc::clone(&genesis), true);
                let head = materialize(&graph, genesis.hash())?;
                (graph, head)
            }
        };

        // Sweep commit records orphaned by a crash mid-pull.
        let mut sweep = WriteBatch::new();
        for key in backend.keys_with_prefix(COMMIT_PREFIX)? {
            let hex = &key[COMMIT_PREFIX.len()..];
            let stale = match CommitHash::from_hex(hex) {
                Ok(hash) => graph.get(hash).is_err(),
                Err(_) => true,
            };
            if stale {
                sweep.del(key);
            }
        }
        if !sweep.is_empty() {
            backend.apply(sweep)?;
        }

        let inner = Arc::new(StoreInner {
            name,
            backend,
            client_id,
            head: RwLock::new(head),
            graph: Mutex::new(graph),
            sync_branch: Mutex::new(None),
            mutators: RwLock::new(HashMap::new()),
            subscriptions: SubscriptionManager::new(),
            closed: AtomicBool::new(false),
        });
        inner.subscriptions.start(Arc::downgrade(&inner));

        Ok(Store { inner })
    }

    /// Returns the store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the persisted client identity carried on sync requests.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Begins a read transaction over the current head.
    ///
    /// Blocks while a write transaction is in flight and observes its
    /// committed state.
    pub fn read(&self) -> CoreResult<ReadTransaction> {
        let state = self.inner.read_state()?;
        Ok(ReadTransaction::new(Arc::clone(&self.inner), state, false))
    }

    /// Begins a named write transaction.
    ///
    /// The transaction holds the head lock exclusively until committed or
    /// dropped. Its mutation ID is the next in the store's sequence.
    pub fn write(&self, name: impl Into<String>, args: Value) -> CoreResult<WriteTransaction<'_>> {
        self.inner.check_open()?;
        let guard = self.inner.head.write();
        let id = guard.max_mutation_id + 1;
        let meta = WriteMeta::Mutation {
            mutation: Mutation::new(id, name, args),
            errored: false,
        };
        Ok(WriteTransaction::begin(&self.inner, guard, meta))
    }

    /// Registers a mutator under `name`, returning an invocation handle.
    ///
    /// Re-registering a name replaces the previous body.
    pub fn register(
        &self,
        name: impl Into<String>,
        f: impl Fn(&mut WriteTransaction<'_>, &Value) -> CoreResult<Value> + Send + Sync + 'static,
    ) -> Mutator {
        let name = name.into();
        let previous = self
            .inner
            .mutators
            .write()
            .insert(name.clone(), Arc::new(f));
        if previous.is_some() {
            warn!(mutator = %name, "mutator re-registered, replacing previous body");
        }
        Mutator {
            store: Arc::downgrade(&self.inner),
            name,
        }
    }

    /// Invokes the registered mutator `name` with `args`.
    ///
    /// On success the mutation is committed locally and joins the pending
    /// log. On failure nothing is committed and the error surfaces as
    /// [`CoreError::MutatorFailed`].
    pub fn mutate(&self, name: &str, args: Value) -> CoreResult<Value> {
        self.inner.check_open()?;
        let mutator = self
            .inner
            .mutators
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::unknown_mutator(name))?;

        let mut tx = self.write(name, args.clone())?;
        match mutator(&mut tx, &args) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(err) => Err(CoreError::mutator_failed(name, err)),
        }
    }

    /// Creates a secondary index; fails with `IndexExists` on name reuse and
    /// `InvalidPointer` if the pointer is malformed.
    ///
    /// The index is built over all matching rows as part of one commit.
    pub fn create_index(&self, def: IndexDef) -> CoreResult<()> {
        self.inner.check_open()?;
        pointer::validate(&def.json_pointer)?;

        let guard = self.inner.head.write();
        if guard.indexes.contains_key(&def.name) {
            return Err(CoreError::index_exists(&def.name));
        }
        let meta = WriteMeta::IndexChange(IndexChangeOp::Create(def.clone()));
        let mut tx = WriteTransaction::begin(&self.inner, guard, meta);
        let state = IndexState::build(def, tx.map());
        tx.create_index_state(state);
        tx.commit()?;
        Ok(())
    }

    /// Drops a secondary index; fails with `UnknownIndex` if absent.
    pub fn drop_index(&self, name: &str) -> CoreResult<()> {
        self.inner.check_open()?;

        let guard = self.inner.head.write();
        let meta = WriteMeta::IndexChange(IndexChangeOp::Drop(name.to_string()));
        let mut tx = WriteTransaction::begin(&self.inner, guard, meta);
        if !tx.has_index(name) {
            return Err(CoreError::unknown_index(name));
        }
        tx.drop_index_state(name);
        tx.commit()?;
        Ok(())
    }

    /// Subscribes a live query. The initial evaluation runs asynchronously
    /// after this returns; afterwards the query re-runs whenever a commit
    /// touches what it read.
    pub fn subscribe(
        &self,
        query: impl Fn(&mut ReadTransaction) -> CoreResult<Value> + Send + Sync + 'static,
        handlers: SubscriptionHandlers,
    ) -> CoreResult<Subscription> {
        self.inner.check_open()?;
        Ok(self
            .inner
            .subscriptions
            .subscribe(Box::new(query), handlers))
    }

    /// Point lookup through an ephemeral read transaction.
    pub fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        self.read()?.get(key)
    }

    /// Key-presence check through an ephemeral read transaction.
    pub fn has(&self, key: &str) -> CoreResult<bool> {
        self.read()?.has(key)
    }

    /// Emptiness check through an ephemeral read transaction.
    pub fn is_empty(&self) -> CoreResult<bool> {
        self.read()?.is_empty()
    }

    /// Scan through an ephemeral read transaction.
    pub fn scan(&self, opts: ScanOptions) -> CoreResult<ScanIter> {
        self.read()?.scan(opts)
    }

    /// Returns the pending (unacknowledged) mutations, ascending by ID.
    pub fn pending_mutations(&self) -> CoreResult<Vec<Mutation>> {
        self.inner.check_open()?;
        let head = self.inner.read_state()?;
        let graph = self.inner.graph.lock();
        Ok(graph
            .pending(head.commit.hash())?
            .iter()
            .filter_map(|c| c.mutation().cloned())
            .collect())
    }

    /// Returns the current head commit hash.
    pub fn head_hash(&self) -> CoreResult<CommitHash> {
        Ok(self.inner.read_state()?.commit.hash())
    }

    /// Returns introspection counters.
    pub fn stats(&self) -> CoreResult<StoreStats> {
        let head = self.inner.read_state()?;
        let pending_count = {
            let graph = self.inner.graph.lock();
            graph.pending(head.commit.hash())?.len()
        };
        Ok(StoreStats {
            head: head.commit.hash(),
            pending_count,
            indexes: head.indexes.keys().cloned().collect(),
        })
    }

    /// Closes the store.
    ///
    /// Fires every subscription's `on_done`, then closes the backend.
    /// Transactions outstanding at close time fail their next operation with
    /// `TransactionClosed`; closing twice is a no-op.
    pub fn close(&self) -> CoreResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.subscriptions.close();
        self.inner.backend.close()?;
        Ok(())
    }

    /// Returns true once the store is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl StoreInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn check_open(&self) -> CoreResult<()> {
        if self.is_closed() {
            return Err(CoreError::StoreClosed);
        }
        Ok(())
    }

    /// Clones the current head state for a reader.
    pub(crate) fn read_state(&self) -> CoreResult<HeadState> {
        self.check_open()?;
        Ok(self.head.read().clone())
    }

    /// Applies a finished main-head commit: persist, register, sweep, swap,
    /// notify.
    pub(crate) fn finish_main_commit(
        &self,
        guard: &mut RwLockWriteGuard<'_, HeadState>,
        commit: Arc<Commit>,
        state: HeadState,
        diff: StoreDiff,
    ) -> CoreResult<CommitHash> {
        let hash = commit.hash();

        let mut batch = WriteBatch::new();
        batch.put(commit_key(hash), commit.encode()?);
        batch.put(META_HEAD, hash.to_hex().into_bytes());
        self.backend.apply(batch)?;

        {
            let mut graph = self.graph.lock();
            graph.insert(commit, true);
            let mut live = vec![hash];
            if let Some(branch) = self.sync_branch.lock().as_ref() {
                live.push(branch.state.commit.hash());
            }
            self.sweep(&mut graph, &live);
        }

        **guard = state;
        self.subscriptions.publish(diff);
        Ok(hash)
    }

    /// Registers a commit created on a sync branch; persisted only when the
    /// branch becomes the head.
    pub(crate) fn register_branch_commit(&self, commit: Arc<Commit>) {
        self.graph.lock().insert(commit, false);
    }

    /// Removes commits unreachable from `live`, deleting persisted records.
    pub(crate) fn sweep(&self, graph: &mut CommitGraph, live: &[CommitHash]) {
        let removed = graph.collect_garbage(live);
        if removed.is_empty() {
            return;
        }
        let mut batch = WriteBatch::new();
        for hash in removed {
            batch.del(commit_key(hash));
        }
        // Failing to delete garbage records is harmless; the open-time sweep
        // catches them.
        if let Err(err) = self.backend.apply(batch) {
            warn!(error = %err, "failed to delete unreachable commit records");
        }
    }
}

/// Handle for invoking a registered mutator.
pub struct Mutator {
    store: Weak<StoreInner>,
    name: String,
}

impl Mutator {
    /// Returns the mutator name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes the mutator with `args`. See [`Store::mutate`].
    pub fn invoke(&self, args: Value) -> CoreResult<Value> {
        let inner = self.store.upgrade().ok_or(CoreError::StoreClosed)?;
        Store { inner }.mutate(&self.name, args)
    }
}
