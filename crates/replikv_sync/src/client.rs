//! The app-facing client: a store plus its sync machinery.

use crate::connection_loop::{ConnectionLoop, ConnectionLoopConfig};
use crate::engine::{BeginPullResult, SyncEngine};
use crate::error::SyncResult;
use crate::http::{HttpClient, HttpPuller, HttpPusher};
use crate::options::ClientOptions;
use parking_lot::RwLock;
use replikv_core::{
    CommitHash, CoreResult, IndexDef, ReadTransaction, ScanIter, ScanOptions, Store, StoreStats,
    Subscription, SubscriptionHandlers, WriteTransaction,
};
use replikv_storage::{FileBackend, KvBackend, MemBackend};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

/// Tracks the busy/idle transitions reported through `on_sync`.
#[derive(Default)]
struct SyncEvents {
    on_sync: RwLock<Option<Box<dyn Fn(bool) + Send + Sync>>>,
    active: AtomicUsize,
}

impl SyncEvents {
    fn begin(&self) {
        if self.active.fetch_add(1, Ordering::SeqCst) == 0 {
            if let Some(f) = self.on_sync.read().as_ref() {
                f(true);
            }
        }
    }

    fn end(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(f) = self.on_sync.read().as_ref() {
                f(false);
            }
        }
    }
}

struct ClientInner {
    store: Store,
    engine: Arc<SyncEngine>,
    push_loop: ConnectionLoop,
    pull_loop: ConnectionLoop,
    events: Arc<SyncEvents>,
    closed: AtomicBool,
}

/// An offline-first replicated store client.
///
/// Wraps a [`Store`] with push/pull connection loops. Mutator invocations
/// commit locally and nudge the push loop; pulls arrive on the watchdog
/// interval or via [`Client::pull`]. Cheaply cloneable.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Opens the client described by `options`, sending HTTP through
    /// `http`.
    pub fn new(options: ClientOptions, http: Arc<dyn HttpClient>) -> SyncResult<Client> {
        debug!(options = ?options, "opening client");

        let backend: Arc<dyn KvBackend> = if options.use_memstore {
            Arc::new(MemBackend::new())
        } else {
            let path = options.data_dir.join(format!("{}.rkv", options.name));
            Arc::new(FileBackend::open(&path).map_err(replikv_core::CoreError::from)?)
        };
        let store = Store::open(options.name.clone(), backend)?;

        let puller = Arc::new(HttpPuller::new(options.pull_url.clone(), Arc::clone(&http)));
        let pusher = Arc::new(HttpPusher::new(options.push_url.clone(), http));
        let mut engine = SyncEngine::new(
            store.clone(),
            puller,
            pusher,
            options.pull_url.clone(),
            options.push_url.clone(),
            options.schema_version.clone(),
        );
        engine.set_pull_auth(options.pull_auth.clone(), options.get_pull_auth.clone());
        engine.set_push_auth(options.push_auth.clone(), options.get_push_auth.clone());
        let engine = Arc::new(engine);

        let events = Arc::new(SyncEvents::default());

        let push_engine = Arc::clone(&engine);
        let push_events = Arc::clone(&events);
        let push_loop = ConnectionLoop::new(
            ConnectionLoopConfig {
                debounce_delay: options.push_delay,
                watchdog_timeout: None,
                ..ConnectionLoopConfig::default()
            },
            move || {
                push_events.begin();
                let ok = match push_engine.push() {
                    Ok(()) => true,
                    Err(err) => {
                        error!(error = %err, "push failed");
                        false
                    }
                };
                push_events.end();
                ok
            },
        );

        let pull_engine = Arc::clone(&engine);
        let pull_events = Arc::clone(&events);
        let pull_loop = ConnectionLoop::new(
            ConnectionLoopConfig {
                watchdog_timeout: options.pull_interval,
                ..ConnectionLoopConfig::default()
            },
            move || {
                pull_events.begin();
                let ok = match pull_engine.pull() {
                    Ok(()) => true,
                    Err(err) => {
                        error!(error = %err, "pull failed");
                        false
                    }
                };
                pull_events.end();
                ok
            },
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                store,
                engine,
                push_loop,
                pull_loop,
                events,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Returns the persisted client identity.
    #[must_use]
    pub fn client_id(&self) -> &str {
        self.inner.store.client_id()
    }

    /// Registers a mutator; invoking the returned handle commits locally and
    /// schedules a push.
    pub fn register(
        &self,
        name: impl Into<String>,
        f: impl Fn(&mut WriteTransaction<'_>, &Value) -> CoreResult<Value> + Send + Sync + 'static,
    ) -> Mutator {
        Mutator {
            inner: self.inner.store.register(name, f),
            client: Arc::downgrade(&self.inner),
        }
    }

    /// Point lookup. See [`Store::get`].
    pub fn get(&self, key: &str) -> SyncResult<Option<Value>> {
        Ok(self.inner.store.get(key)?)
    }

    /// Key-presence check. See [`Store::has`].
    pub fn has(&self, key: &str) -> SyncResult<bool> {
        Ok(self.inner.store.has(key)?)
    }

    /// Emptiness check. See [`Store::is_empty`].
    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.inner.store.is_empty()?)
    }

    /// Scan. See [`Store::scan`].
    pub fn scan(&self, opts: ScanOptions) -> SyncResult<ScanIter> {
        Ok(self.inner.store.scan(opts)?)
    }

    /// Creates a secondary index. See [`Store::create_index`].
    pub fn create_index(&self, def: IndexDef) -> SyncResult<()> {
        Ok(self.inner.store.create_index(def)?)
    }

    /// Drops a secondary index. See [`Store::drop_index`].
    pub fn drop_index(&self, name: &str) -> SyncResult<()> {
        Ok(self.inner.store.drop_index(name)?)
    }

    /// Subscribes a live query. See [`Store::subscribe`].
    pub fn subscribe(
        &self,
        query: impl Fn(&mut ReadTransaction) -> CoreResult<Value> + Send + Sync + 'static,
        handlers: SubscriptionHandlers,
    ) -> SyncResult<Subscription> {
        Ok(self.inner.store.subscribe(query, handlers)?)
    }

    /// Returns store counters. See [`Store::stats`].
    pub fn stats(&self) -> SyncResult<StoreStats> {
        Ok(self.inner.store.stats()?)
    }

    /// Schedules a pull cycle on the pull connection loop.
    pub fn pull(&self) {
        self.inner.pull_loop.send();
    }

    /// Runs the first pull phase synchronously. See
    /// [`SyncEngine::begin_pull`].
    pub fn begin_pull(&self) -> SyncResult<BeginPullResult> {
        self.inner.engine.begin_pull()
    }

    /// Runs the second pull phase synchronously. See
    /// [`SyncEngine::maybe_end_pull`].
    pub fn maybe_end_pull(&self, result: &BeginPullResult) -> SyncResult<Option<CommitHash>> {
        self.inner.engine.maybe_end_pull(result)
    }

    /// Sets the callback observing busy/idle sync transitions.
    pub fn set_on_sync(&self, f: impl Fn(bool) + Send + Sync + 'static) {
        *self.inner.events.on_sync.write() = Some(Box::new(f));
    }

    /// Closes the client: stops both connection loops (in-flight results
    /// are discarded), fires subscription `on_done`s, and closes the store.
    pub fn close(&self) -> SyncResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.pull_loop.close();
        self.inner.push_loop.close();
        self.inner.store.close()?;
        Ok(())
    }
}

/// Handle for invoking a registered mutator through a [`Client`].
///
/// On successful commit the push connection loop is signalled.
pub struct Mutator {
    inner: replikv_core::Mutator,
    client: Weak<ClientInner>,
}

impl Mutator {
    /// Returns the mutator name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Invokes the mutator and schedules a push.
    pub fn invoke(&self, args: Value) -> SyncResult<Value> {
        let result = self.inner.invoke(args)?;
        if let Some(client) = self.client.upgrade() {
            client.push_loop.send();
        }
        Ok(result)
    }
}
