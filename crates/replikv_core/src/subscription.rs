//! Live queries re-evaluated when commits touch the keys they read.
//!
//! Subscriptions run on a single worker thread, so notifications happen
//! after the commit that triggered them and in registration order. Each
//! evaluation records the keys, scan ranges, and index ranges the query
//! observed; a commit diff intersecting that read set re-runs the query, and
//! `on_data` fires only when the structurally compared result changed.

use crate::error::{CoreError, CoreResult};
use crate::index::IndexEntry;
use crate::store::StoreInner;
use crate::transaction::{ReadSet, ReadTransaction};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// The set of keys and index entries changed by one head update.
#[derive(Debug, Default)]
pub(crate) struct StoreDiff {
    /// Changed primary keys.
    pub(crate) keys: BTreeSet<String>,
    /// Changed composite entries, per index.
    pub(crate) index_entries: BTreeMap<String, BTreeSet<IndexEntry>>,
    /// Indexes that changed wholesale (created or dropped).
    pub(crate) full_indexes: BTreeSet<String>,
}

impl StoreDiff {
    pub(crate) fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.index_entries.is_empty() && self.full_indexes.is_empty()
    }
}

/// Callbacks attached to a subscription.
///
/// `on_error` and `on_done` default to no-ops.
pub struct SubscriptionHandlers {
    pub(crate) on_data: Box<dyn Fn(&Value) + Send>,
    pub(crate) on_error: Box<dyn Fn(&CoreError) + Send>,
    pub(crate) on_done: Box<dyn Fn() + Send>,
}

impl SubscriptionHandlers {
    /// Creates handlers with the given data callback.
    pub fn new(on_data: impl Fn(&Value) + Send + 'static) -> Self {
        Self {
            on_data: Box::new(on_data),
            on_error: Box::new(|_| {}),
            on_done: Box::new(|| {}),
        }
    }

    /// Sets the error callback, fired when the query fails; `on_data` is
    /// suppressed for that cycle.
    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&CoreError) + Send + 'static) -> Self {
        self.on_error = Box::new(f);
        self
    }

    /// Sets the done callback, fired exactly once on cancel or store close.
    #[must_use]
    pub fn on_done(mut self, f: impl Fn() + Send + 'static) -> Self {
        self.on_done = Box::new(f);
        self
    }
}

pub(crate) type QueryFn = dyn Fn(&mut ReadTransaction) -> CoreResult<Value> + Send + Sync;

/// Handle to a live subscription; `cancel` detaches it.
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Cancels the subscription. Its `on_done` fires once on the worker;
    /// cancelling twice (or after close) is a no-op.
    pub fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.send(Event::Cancel(self.id));
        }
    }
}

struct SubState {
    query: Box<QueryFn>,
    handlers: SubscriptionHandlers,
    last: Option<Value>,
    read_set: Option<ReadSet>,
}

enum Event {
    Eval(u64),
    Diff(StoreDiff),
    Cancel(u64),
    Shutdown,
}

struct Shared {
    store: Mutex<Weak<StoreInner>>,
    sender: Mutex<Option<Sender<Event>>>,
    subs: Mutex<BTreeMap<u64, SubState>>,
    next_id: AtomicU64,
}

impl Shared {
    fn send(&self, event: Event) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(event);
        }
    }
}

/// Owns the worker thread and the registered subscriptions.
pub(crate) struct SubscriptionManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionManager {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                store: Mutex::new(Weak::new()),
                sender: Mutex::new(None),
                subs: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Starts the worker. Called once the owning store is behind an `Arc`.
    pub(crate) fn start(&self, store: Weak<StoreInner>) {
        *self.shared.store.lock() = store;
        let (sender, receiver) = mpsc::channel();
        *self.shared.sender.lock() = Some(sender);

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("replikv-subscriptions".into())
            .spawn(move || worker_loop(&shared, &receiver))
            .expect("failed to spawn subscription worker");
        *self.worker.lock() = Some(handle);
    }

    /// Registers a subscription and queues its initial evaluation.
    pub(crate) fn subscribe(
        &self,
        query: Box<QueryFn>,
        handlers: SubscriptionHandlers,
    ) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.subs.lock().insert(
            id,
            SubState {
                query,
                handlers,
                last: None,
                read_set: None,
            },
        );
        // Initial evaluation runs on the worker, after this call returns.
        self.shared.send(Event::Eval(id));
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Queues re-evaluation of subscriptions whose read set intersects the
    /// diff.
    pub(crate) fn publish(&self, diff: StoreDiff) {
        if !diff.is_empty() {
            self.shared.send(Event::Diff(diff));
        }
    }

    /// Shuts the worker down, firing every live subscription's `on_done`.
    pub(crate) fn close(&self) {
        let sender = self.shared.sender.lock().take();
        if let Some(sender) = sender {
            let _ = sender.send(Event::Shutdown);
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &Arc<Shared>, receiver: &Receiver<Event>) {
    while let Ok(event) = receiver.recv() {
        match event {
            Event::Eval(id) => evaluate(shared, id),
            Event::Diff(diff) => {
                // Registration order: the subs map is keyed by ascending id.
                let due: Vec<u64> = shared
                    .subs
                    .lock()
                    .iter()
                    .filter(|(_, sub)| {
                        sub.read_set
                            .as_ref()
                            .is_some_and(|read_set| read_set.intersects(&diff))
                    })
                    .map(|(id, _)| *id)
                    .collect();
                for id in due {
                    evaluate(shared, id);
                }
            }
            Event::Cancel(id) => {
                if let Some(sub) = shared.subs.lock().remove(&id) {
                    (sub.handlers.on_done)();
                }
            }
            Event::Shutdown => break,
        }
    }

    // Store closed (or dropped): every remaining subscription is done.
    let subs = std::mem::take(&mut *shared.subs.lock());
    for (_, sub) in subs {
        (sub.handlers.on_done)();
    }
}

fn evaluate(shared: &Arc<Shared>, id: u64) {
    // Take the subscription out while the user query runs so the query can
    // itself subscribe or cancel without deadlocking.
    let Some(mut sub) = shared.subs.lock().remove(&id) else {
        return;
    };
    let store = shared.store.lock().upgrade();
    let Some(store) = store else {
        (sub.handlers.on_done)();
        return;
    };

    if let Ok(state) = store.read_state() {
        let mut tx = ReadTransaction::new(Arc::clone(&store), state, true);
        match (sub.query)(&mut tx) {
            Ok(value) => {
                sub.read_set = Some(tx.take_read_set());
                if sub.last.as_ref() != Some(&value) {
                    (sub.handlers.on_data)(&value);
                    sub.last = Some(value);
                }
            }
            Err(err) => {
                sub.read_set = Some(tx.take_read_set());
                (sub.handlers.on_error)(&err);
            }
        }
    }

    shared.subs.lock().insert(id, sub);
}
