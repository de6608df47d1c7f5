//! Protocol messages for push and pull.

use crate::patch::PatchOp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version of the push request body.
pub const PUSH_VERSION: u32 = 0;

/// Version of the pull request body.
pub const PULL_VERSION: u32 = 0;

/// A single mutation: a named write procedure invocation with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Client-assigned mutation ID, strictly increasing from 1.
    pub id: u64,
    /// Name of the registered mutator.
    pub name: String,
    /// Arguments the mutator was invoked with.
    pub args: Value,
}

impl Mutation {
    /// Creates a new mutation.
    pub fn new(id: u64, name: impl Into<String>, args: Value) -> Self {
        Self {
            id,
            name: name.into(),
            args,
        }
    }
}

/// Push request body, POSTed to the push endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Persisted client identity.
    #[serde(rename = "clientID")]
    pub client_id: String,
    /// All currently pending mutations, ordered by id ascending.
    pub mutations: Vec<Mutation>,
    /// Protocol version of this body.
    pub push_version: u32,
    /// Application schema version, forwarded opaquely.
    pub schema_version: String,
}

/// Per-mutation outcome reported by the push endpoint.
///
/// Advisory only: an error here is logged but does not remove the mutation
/// from the pending log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationInfo {
    /// ID of the mutation this info refers to.
    pub id: u64,
    /// Server-side error description, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Push response body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    /// Per-mutation outcomes.
    #[serde(default)]
    pub mutation_infos: Vec<MutationInfo>,
}

/// Pull request body, POSTed to the pull endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Persisted client identity.
    #[serde(rename = "clientID")]
    pub client_id: String,
    /// Identity of the snapshot the client holds (commit hash).
    #[serde(rename = "baseStateID")]
    pub base_state_id: String,
    /// Opaque server token identifying the client's state version.
    pub cookie: Value,
    /// Last mutation ID the client's snapshot has acknowledged.
    #[serde(rename = "lastMutationID")]
    pub last_mutation_id: u64,
    /// Protocol version of this body.
    pub pull_version: u32,
    /// Application schema version, forwarded opaquely.
    pub schema_version: String,
}

/// Pull response body: an authoritative patch relative to the request cookie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// New opaque state token.
    pub cookie: Value,
    /// Highest mutation ID the server has applied for this client.
    #[serde(rename = "lastMutationID")]
    pub last_mutation_id: u64,
    /// Operations to apply to the base snapshot, in array order.
    #[serde(default)]
    pub patch: Vec<PatchOp>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_request_wire_shape() {
        let req = PushRequest {
            client_id: "c-1".into(),
            mutations: vec![Mutation::new(1, "createTodo", json!({"text": "buy milk"}))],
            push_version: PUSH_VERSION,
            schema_version: "".into(),
        };

        let wire: Value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            wire,
            json!({
                "clientID": "c-1",
                "mutations": [{"id": 1, "name": "createTodo", "args": {"text": "buy milk"}}],
                "pushVersion": 0,
                "schemaVersion": "",
            })
        );
    }

    #[test]
    fn pull_request_wire_shape() {
        let req = PullRequest {
            client_id: "c-1".into(),
            base_state_id: "abc123".into(),
            cookie: json!(null),
            last_mutation_id: 7,
            pull_version: PULL_VERSION,
            schema_version: "v2".into(),
        };

        let wire: Value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            wire,
            json!({
                "clientID": "c-1",
                "baseStateID": "abc123",
                "cookie": null,
                "lastMutationID": 7,
                "pullVersion": 0,
                "schemaVersion": "v2",
            })
        );
    }

    #[test]
    fn pull_response_parses_server_body() {
        let body = json!({
            "cookie": {"v": 42},
            "lastMutationID": 3,
            "patch": [
                {"op": "put", "key": "todo/1", "value": {"done": false}},
                {"op": "del", "key": "todo/2"},
            ],
        });

        let resp: PullResponse = serde_json::from_value(body).unwrap();
        assert_eq!(resp.cookie, json!({"v": 42}));
        assert_eq!(resp.last_mutation_id, 3);
        assert_eq!(resp.patch.len(), 2);
    }

    #[test]
    fn pull_response_patch_defaults_empty() {
        let resp: PullResponse =
            serde_json::from_str(r#"{"cookie": null, "lastMutationID": 0}"#).unwrap();
        assert!(resp.patch.is_empty());
    }

    #[test]
    fn push_response_error_optional() {
        let resp: PushResponse = serde_json::from_str(
            r#"{"mutationInfos": [{"id": 1, "error": "boom"}, {"id": 2}]}"#,
        )
        .unwrap();
        assert_eq!(resp.mutation_infos[0].error.as_deref(), Some("boom"));
        assert_eq!(resp.mutation_infos[1].error, None);
    }
}
