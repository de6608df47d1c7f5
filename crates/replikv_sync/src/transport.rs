//! Pull and push transport seams.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use replikv_protocol::{PullRequest, PullResponse, PushRequest, PushResponse};

/// Issues pull requests against the server.
pub trait Puller: Send + Sync {
    /// Sends one pull request.
    fn pull(&self, request: &PullRequest, auth: Option<&str>) -> SyncResult<PullResponse>;
}

/// Issues push requests against the server.
pub trait Pusher: Send + Sync {
    /// Sends one push request.
    fn push(&self, request: &PushRequest, auth: Option<&str>) -> SyncResult<PushResponse>;
}

/// A scripted [`Puller`] for tests: pops queued responses and records
/// requests.
#[derive(Default)]
pub struct MockPuller {
    responses: Mutex<Vec<SyncResult<PullResponse>>>,
    requests: Mutex<Vec<(PullRequest, Option<String>)>>,
}

impl MockPuller {
    /// Creates an empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the next response.
    pub fn enqueue(&self, response: SyncResult<PullResponse>) {
        self.responses.lock().insert(0, response);
    }

    /// Returns the requests seen so far.
    pub fn requests(&self) -> Vec<(PullRequest, Option<String>)> {
        self.requests.lock().clone()
    }
}

impl Puller for MockPuller {
    fn pull(&self, request: &PullRequest, auth: Option<&str>) -> SyncResult<PullResponse> {
        self.requests
            .lock()
            .push((request.clone(), auth.map(str::to_string)));
        self.responses
            .lock()
            .pop()
            .unwrap_or_else(|| Err(SyncError::transport("no scripted pull response")))
    }
}

/// A scripted [`Pusher`] for tests: pops queued responses and records
/// requests.
#[derive(Default)]
pub struct MockPusher {
    responses: Mutex<Vec<SyncResult<PushResponse>>>,
    requests: Mutex<Vec<(PushRequest, Option<String>)>>,
}

impl MockPusher {
    /// Creates an empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the next response.
    pub fn enqueue(&self, response: SyncResult<PushResponse>) {
        self.responses.lock().insert(0, response);
    }

    /// Returns the requests seen so far.
    pub fn requests(&self) -> Vec<(PushRequest, Option<String>)> {
        self.requests.lock().clone()
    }
}

impl Pusher for MockPusher {
    fn push(&self, request: &PushRequest, auth: Option<&str>) -> SyncResult<PushResponse> {
        self.requests
            .lock()
            .push((request.clone(), auth.map(str::to_string)));
        self.responses
            .lock()
            .pop()
            .unwrap_or_else(|| Err(SyncError::transport("no scripted push response")))
    }
}
