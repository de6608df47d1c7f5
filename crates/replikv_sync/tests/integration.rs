//! End-to-end tests: a client syncing against an in-process server over the
//! loopback transport.

use parking_lot::Mutex;
use replikv_protocol::{
    MutationInfo, PatchOp, PullRequest, PullResponse, PushRequest, PushResponse,
};
use replikv_sync::{Client, ClientOptions, HttpResponse, LoopbackClient, LoopbackServer};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A minimal sync server: applies pushed mutations to a row map and answers
/// pulls with a clear-all patch of its current rows.
#[derive(Default)]
struct TestServer {
    state: Mutex<ServerState>,
}

#[derive(Default)]
struct ServerState {
    rows: BTreeMap<String, Value>,
    last_mutation_id: u64,
    cookie: u64,
    required_auth: Option<String>,
    /// Status codes to answer pushes with before behaving normally.
    push_status_script: Vec<u16>,
    /// Errors to attach to every pushed mutation instead of applying it.
    reject_pushes_with: Option<String>,
    push_requests: Vec<(PushRequest, Instant)>,
    pull_requests: Vec<PullRequest>,
}

impl TestServer {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn require_auth(&self, token: &str) {
        self.state.lock().required_auth = Some(token.to_string());
    }

    fn script_push_statuses(&self, statuses: &[u16]) {
        let mut state = self.state.lock();
        state.push_status_script = statuses.iter().rev().copied().collect();
    }

    fn reject_pushes(&self, error: &str) {
        self.state.lock().reject_pushes_with = Some(error.to_string());
    }

    fn push_requests(&self) -> Vec<(PushRequest, Instant)> {
        self.state.lock().push_requests.clone()
    }

    fn pull_requests(&self) -> Vec<PullRequest> {
        self.state.lock().pull_requests.clone()
    }

    fn rows(&self) -> BTreeMap<String, Value> {
        self.state.lock().rows.clone()
    }

    fn handle_push(&self, body: &[u8]) -> HttpResponse {
        let request: PushRequest = match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(_) => return HttpResponse::status(400),
        };

        let mut state = self.state.lock();
        state.push_requests.push((request.clone(), Instant::now()));

        if let Some(status) = state.push_status_script.pop() {
            if status != 200 {
                return HttpResponse::status(status);
            }
        }

        if let Some(error) = state.reject_pushes_with.clone() {
            let infos = request
                .mutations
                .iter()
                .map(|m| MutationInfo {
                    id: m.id,
                    error: Some(error.clone()),
                })
                .collect();
            let response = PushResponse {
                mutation_infos: infos,
            };
            return HttpResponse::ok(serde_json::to_vec(&response).unwrap());
        }

        for mutation in &request.mutations {
            if mutation.id <= state.last_mutation_id {
                continue;
            }
            match mutation.name.as_str() {
                "putTodo" => {
                    let key = mutation.args["key"].as_str().unwrap().to_string();
                    let value = mutation.args["value"].clone();
                    state.rows.insert(key, value);
                }
                "delTodo" => {
                    let key = mutation.args["key"].as_str().unwrap();
                    state.rows.remove(key);
                }
                _ => {}
            }
            state.last_mutation_id = mutation.id;
        }
        state.cookie += 1;

        HttpResponse::ok(serde_json::to_vec(&PushResponse::default()).unwrap())
    }

    fn handle_pull(&self, body: &[u8]) -> HttpResponse {
        let request: PullRequest = match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(_) => return HttpResponse::status(400),
        };

        let mut state = self.state.lock();
        state.pull_requests.push(request.clone());

        let client_cookie = request.cookie.as_u64().unwrap_or(0);
        let patch = if client_cookie == state.cookie {
            Vec::new()
        } else {
            let mut patch = vec![PatchOp::Del { key: String::new() }];
            patch.extend(state.rows.iter().map(|(key, value)| PatchOp::Put {
                key: key.clone(),
                value: value.clone(),
            }));
            patch
        };

        let response = PullResponse {
            cookie: json!(state.cookie),
            last_mutation_id: state.last_mutation_id,
            patch,
        };
        HttpResponse::ok(serde_json::to_vec(&response).unwrap())
    }
}

impl LoopbackServer for TestServer {
    fn handle_post(&self, url: &str, auth: Option<&str>, body: &[u8]) -> Result<HttpResponse, String> {
        if let Some(required) = self.state.lock().required_auth.clone() {
            if auth != Some(required.as_str()) {
                return Ok(HttpResponse::status(401));
            }
        }
        match url {
            "/push" => Ok(self.handle_push(body)),
            "/pull" => Ok(self.handle_pull(body)),
            other => Err(format!("no such endpoint: {other}")),
        }
    }
}

fn open_client(server: &Arc<TestServer>, options: ClientOptions) -> Client {
    let http = Arc::new(LoopbackClient::new(Arc::clone(server)));
    Client::new(options, http).unwrap()
}

fn todo_options(name: &str) -> ClientOptions {
    ClientOptions::new(name)
        .with_memstore()
        .with_pull_url("/pull")
        .with_push_url("/push")
        .with_push_delay(Duration::from_millis(1))
}

fn register_todo_mutators(client: &Client) -> (replikv_sync::Mutator, replikv_sync::Mutator) {
    let put = client.register("putTodo", |tx, args| {
        let key = args["key"].as_str().unwrap_or_default().to_string();
        tx.put(key, args["value"].clone())?;
        Ok(Value::Null)
    });
    let del = client.register("delTodo", |tx, args| {
        let key = args["key"].as_str().unwrap_or_default();
        let existed = tx.del(key)?;
        Ok(json!(existed))
    });
    (put, del)
}

fn wait_for(pred: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    pred()
}

#[test]
fn push_batches_and_retains_until_acknowledged() {
    let server = TestServer::new();
    // The server answers every push with per-mutation errors: advisory only.
    server.reject_pushes("db unavailable");

    let client = open_client(&server, todo_options("s4"));
    let (put, del) = register_todo_mutators(&client);

    put.invoke(json!({"key": "todo/1", "value": {"t": 1}})).unwrap();
    del.invoke(json!({"key": "todo/1"})).unwrap();

    // Both mutations were pushed (possibly across bursts) and, because push
    // responses are advisory, both stay pending.
    assert!(wait_for(
        || !server.push_requests().is_empty(),
        Duration::from_secs(5)
    ));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(client.stats().unwrap().pending_count, 2);

    // The next mutation pushes the full pending batch, ordered ascending.
    put.invoke(json!({"key": "todo/2", "value": {"t": 2}})).unwrap();
    assert!(wait_for(
        || {
            server
                .push_requests()
                .iter()
                .any(|(r, _)| r.mutations.iter().map(|m| m.id).collect::<Vec<_>>() == vec![1, 2, 3])
        },
        Duration::from_secs(5)
    ));
    assert_eq!(client.stats().unwrap().pending_count, 3);

    client.close().unwrap();
}

#[test]
fn pull_applies_patch_and_acknowledges_pending() {
    let server = TestServer::new();
    {
        // Server state the client has never seen, acknowledging mutation 3.
        let mut state = server.state.lock();
        state
            .rows
            .insert("todo/14323534".to_string(), json!({"text": "from server"}));
        state.last_mutation_id = 3;
        state.cookie = 9;
    }

    let options = ClientOptions::new("s5").with_memstore().with_pull_url("/pull");
    let client = open_client(&server, options);
    let (put, _) = register_todo_mutators(&client);
    put.invoke(json!({"key": "local", "value": 1})).unwrap();
    assert_eq!(client.stats().unwrap().pending_count, 1);

    let result = client.begin_pull().unwrap();
    assert!(result.sync_head.is_some());
    client.maybe_end_pull(&result).unwrap();

    assert_eq!(
        client.get("todo/14323534").unwrap(),
        Some(json!({"text": "from server"}))
    );
    // Mutation 1 <= lastMutationID 3: acknowledged and gone from pending.
    assert_eq!(client.stats().unwrap().pending_count, 0);
    // The local write was not replayed (it is acknowledged), so the
    // clear-all patch removed it.
    assert_eq!(client.get("local").unwrap(), None);

    let pulls = server.pull_requests();
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].last_mutation_id, 0);

    client.close().unwrap();
}

#[test]
fn pull_with_nothing_to_do_returns_empty_sync_head() {
    let server = TestServer::new();
    let client = open_client(&server, ClientOptions::new("noop").with_memstore().with_pull_url("/pull"));

    // First pull establishes the server cookie.
    let first = client.begin_pull().unwrap();
    client.maybe_end_pull(&first).unwrap();

    // Second pull: same cookie, no patch, nothing acknowledged.
    let second = client.begin_pull().unwrap();
    assert!(second.sync_head.is_none());
    // maybeEndPull on an empty sync head is a no-op.
    assert_eq!(client.maybe_end_pull(&second).unwrap(), None);

    client.close().unwrap();
}

#[test]
fn round_trip_push_then_pull_converges() {
    let server = TestServer::new();
    let client = open_client(&server, todo_options("rt"));
    let (put, del) = register_todo_mutators(&client);

    put.invoke(json!({"key": "todo/a", "value": {"done": false}}))
        .unwrap();
    put.invoke(json!({"key": "todo/b", "value": {"done": true}}))
        .unwrap();
    del.invoke(json!({"key": "todo/a"})).unwrap();

    // Wait for the server to have applied all three mutations.
    assert!(wait_for(
        || {
            let state = server.state.lock();
            state.last_mutation_id == 3
        },
        Duration::from_secs(5)
    ));
    assert_eq!(server.rows().len(), 1);

    let result = client.begin_pull().unwrap();
    client.maybe_end_pull(&result).unwrap();

    assert_eq!(client.stats().unwrap().pending_count, 0);
    assert_eq!(client.get("todo/a").unwrap(), None);
    assert_eq!(client.get("todo/b").unwrap(), Some(json!({"done": true})));

    client.close().unwrap();
}

#[test]
fn failed_pushes_retry_with_growing_intervals() {
    let server = TestServer::new();
    server.script_push_statuses(&[500, 500, 200]);

    let client = open_client(&server, todo_options("retry"));
    let (put, _) = register_todo_mutators(&client);
    put.invoke(json!({"key": "k", "value": 1})).unwrap();

    assert!(wait_for(
        || server.push_requests().len() >= 3,
        Duration::from_secs(5)
    ));

    let requests = server.push_requests();
    let gap1 = requests[1].1.duration_since(requests[0].1);
    let gap2 = requests[2].1.duration_since(requests[1].1);
    assert!(gap1 >= Duration::from_millis(30), "gap1 = {gap1:?}");
    assert!(gap2 >= Duration::from_millis(60), "gap2 = {gap2:?}");

    // The third attempt succeeded and applied the mutation.
    assert!(wait_for(
        || server.state.lock().last_mutation_id == 1,
        Duration::from_secs(5)
    ));

    client.close().unwrap();
}

#[test]
fn unauthorized_pull_refreshes_credential() {
    let server = TestServer::new();
    server.require_auth("fresh-token");

    let refreshes = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let counter = Arc::clone(&refreshes);
    let options = ClientOptions::new("auth")
        .with_memstore()
        .with_pull_url("/pull")
        .with_pull_auth("stale-token")
        .with_get_pull_auth(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Some("fresh-token".to_string())
        });
    let client = open_client(&server, options);

    let result = client.begin_pull().unwrap();
    client.maybe_end_pull(&result).unwrap();

    assert_eq!(refreshes.load(std::sync::atomic::Ordering::SeqCst), 1);
    client.close().unwrap();
}

#[test]
fn on_sync_reports_busy_then_idle() {
    let server = TestServer::new();
    let client = open_client(&server, todo_options("onsync"));
    let (put, _) = register_todo_mutators(&client);

    let (events_tx, events_rx) = mpsc::channel();
    client.set_on_sync(move |syncing| {
        events_tx.send(syncing).unwrap();
    });

    put.invoke(json!({"key": "k", "value": 1})).unwrap();

    let first = events_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = events_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(first);
    assert!(!second);

    client.close().unwrap();
}

#[test]
fn subscription_fires_after_pull() {
    let server = TestServer::new();
    {
        let mut state = server.state.lock();
        state.rows.insert("watched".to_string(), json!("server value"));
        state.cookie = 1;
    }

    let client = open_client(
        &server,
        ClientOptions::new("subs").with_memstore().with_pull_url("/pull"),
    );

    let (data_tx, data_rx) = mpsc::channel();
    client
        .subscribe(
            |tx| Ok(tx.get("watched")?.unwrap_or(Value::Null)),
            replikv_core::SubscriptionHandlers::new(move |v| {
                data_tx.send(v.clone()).unwrap();
            }),
        )
        .unwrap();

    // Initial evaluation: the key is absent locally.
    assert_eq!(
        data_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Value::Null
    );

    let result = client.begin_pull().unwrap();
    client.maybe_end_pull(&result).unwrap();

    assert_eq!(
        data_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        json!("server value")
    );

    client.close().unwrap();
}

#[test]
fn durable_client_restores_pending_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::new();
    server.script_push_statuses(&[500, 500, 500, 500, 500, 500]);

    let options = || {
        ClientOptions::new("restart")
            .with_pull_url("/pull")
            .with_push_url("/push")
            .with_push_delay(Duration::from_millis(1))
            .with_data_dir(dir.path())
    };

    {
        let client = open_client(&server, options());
        let (put, _) = register_todo_mutators(&client);
        put.invoke(json!({"key": "k", "value": 1})).unwrap();
        client.close().unwrap();
    }

    let client = open_client(&server, options());
    register_todo_mutators(&client);
    assert_eq!(client.get("k").unwrap(), Some(json!(1)));
    assert_eq!(client.stats().unwrap().pending_count, 1);

    // The restarted client pushes the restored mutation once asked to.
    {
        let mut state = server.state.lock();
        state.push_status_script.clear();
    }
    let result = client.begin_pull().unwrap();
    client.maybe_end_pull(&result).unwrap();

    client.close().unwrap();
}
