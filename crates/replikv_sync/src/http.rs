//! HTTP client abstraction and JSON POST plumbing.
//!
//! The actual HTTP stack is supplied by the embedding application through
//! the [`HttpClient`] trait, which keeps this crate transport-agnostic
//! (reqwest, ureq, a platform webview, ...). [`LoopbackClient`] routes
//! requests to an in-process handler for tests.

use crate::error::{SyncError, SyncResult};
use crate::transport::{Puller, Pusher};
use replikv_protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// A raw HTTP response: status code and body bytes.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a 200 response with the given body.
    #[must_use]
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }

    /// Creates a response with the given status and an empty body.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }
}

/// HTTP client abstraction.
///
/// `post` sends a JSON body to `url`; `auth`, when present, is the value of
/// the `Authorization` header. The transport reports only transport-level
/// failures as `Err`; non-2xx statuses come back as responses.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the response.
    fn post(&self, url: &str, auth: Option<&str>, body: &[u8]) -> Result<HttpResponse, String>;
}

/// Sends `request` as JSON and decodes the response body.
///
/// Status mapping: 2xx decodes the body, 401 is [`SyncError::Unauthorized`],
/// anything else is [`SyncError::HttpError`].
pub(crate) fn post_json<Req, Resp>(
    client: &dyn HttpClient,
    url: &str,
    auth: Option<&str>,
    request: &Req,
) -> SyncResult<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let body = serde_json::to_vec(request)
        .map_err(|e| SyncError::protocol(format!("failed to encode request: {e}")))?;

    let response = client
        .post(url, auth, &body)
        .map_err(SyncError::transport)?;

    match response.status {
        200..=299 => serde_json::from_slice(&response.body)
            .map_err(|e| SyncError::protocol(format!("malformed response: {e}"))),
        401 => Err(SyncError::Unauthorized),
        status => Err(SyncError::HttpError {
            status,
            body: String::from_utf8_lossy(&response.body).into_owned(),
        }),
    }
}

/// A [`Puller`] that POSTs JSON to a pull endpoint.
pub struct HttpPuller {
    url: String,
    client: Arc<dyn HttpClient>,
}

impl HttpPuller {
    /// Creates a puller for `url`.
    pub fn new(url: impl Into<String>, client: Arc<dyn HttpClient>) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

impl Puller for HttpPuller {
    fn pull(&self, request: &PullRequest, auth: Option<&str>) -> SyncResult<PullResponse> {
        post_json(&*self.client, &self.url, auth, request)
    }
}

/// A [`Pusher`] that POSTs JSON to a push endpoint.
pub struct HttpPusher {
    url: String,
    client: Arc<dyn HttpClient>,
}

impl HttpPusher {
    /// Creates a pusher for `url`.
    pub fn new(url: impl Into<String>, client: Arc<dyn HttpClient>) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

impl Pusher for HttpPusher {
    fn push(&self, request: &PushRequest, auth: Option<&str>) -> SyncResult<PushResponse> {
        post_json(&*self.client, &self.url, auth, request)
    }
}

/// Handler side of a loopback transport.
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST and returns the response, or a transport error.
    fn handle_post(&self, url: &str, auth: Option<&str>, body: &[u8]) -> Result<HttpResponse, String>;
}

/// An [`HttpClient`] that routes requests directly to an in-process server.
///
/// Useful for testing without network overhead.
pub struct LoopbackClient<S> {
    server: Arc<S>,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a loopback client over `server`.
    pub fn new(server: Arc<S>) -> Self {
        Self { server }
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, auth: Option<&str>, body: &[u8]) -> Result<HttpResponse, String> {
        self.server.handle_post(url, auth, body)
    }
}

/// An [`HttpClient`] for stores that never sync; every request fails.
#[derive(Debug, Default)]
pub struct NullHttpClient;

impl HttpClient for NullHttpClient {
    fn post(&self, _url: &str, _auth: Option<&str>, _body: &[u8]) -> Result<HttpResponse, String> {
        Err("no HTTP client configured".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoServer;

    impl LoopbackServer for EchoServer {
        fn handle_post(
            &self,
            url: &str,
            auth: Option<&str>,
            body: &[u8],
        ) -> Result<HttpResponse, String> {
            match url {
                "/ok" => Ok(HttpResponse::ok(body.to_vec())),
                "/auth" => {
                    if auth == Some("token") {
                        Ok(HttpResponse::ok(b"{}".to_vec()))
                    } else {
                        Ok(HttpResponse::status(401))
                    }
                }
                "/boom" => Ok(HttpResponse {
                    status: 500,
                    body: b"server on fire".to_vec(),
                }),
                _ => Err("connection refused".into()),
            }
        }
    }

    #[test]
    fn post_json_decodes_success() {
        let client = LoopbackClient::new(Arc::new(EchoServer));
        let value: serde_json::Value =
            post_json(&client, "/ok", None, &json!({"a": 1})).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn post_json_maps_statuses() {
        let client = LoopbackClient::new(Arc::new(EchoServer));

        let err = post_json::<_, serde_json::Value>(&client, "/auth", None, &json!(null))
            .unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized));

        let ok: serde_json::Value =
            post_json(&client, "/auth", Some("token"), &json!(null)).unwrap();
        assert_eq!(ok, json!({}));

        let err = post_json::<_, serde_json::Value>(&client, "/boom", None, &json!(null))
            .unwrap_err();
        match err {
            SyncError::HttpError { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "server on fire");
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = post_json::<_, serde_json::Value>(&client, "/missing", None, &json!(null))
            .unwrap_err();
        assert!(matches!(err, SyncError::Transport { .. }));
    }

    #[test]
    fn post_json_rejects_malformed_body() {
        struct Garbage;
        impl HttpClient for Garbage {
            fn post(
                &self,
                _url: &str,
                _auth: Option<&str>,
                _body: &[u8],
            ) -> Result<HttpResponse, String> {
                Ok(HttpResponse::ok(b"not json".to_vec()))
            }
        }

        let err = post_json::<_, serde_json::Value>(&Garbage, "/", None, &json!(null))
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }
}
