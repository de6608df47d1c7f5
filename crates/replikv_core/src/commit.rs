//! The commit model: content-addressed, immutable snapshots of store state.

use crate::error::{CoreError, CoreResult};
use crate::index::IndexDef;
use replikv_protocol::Mutation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Content address of a commit: SHA-256 over the parent hash and a canonical
/// serialization of the commit payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommitHash([u8; 32]);

impl CommitHash {
    /// Returns the lowercase hex rendering of the hash.
    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            use fmt::Write;
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    /// Parses a hash from its hex rendering.
    pub fn from_hex(hex: &str) -> CoreResult<Self> {
        if hex.len() != 64 {
            return Err(CoreError::protocol(format!("bad commit hash: {hex:?}")));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk)
                .map_err(|_| CoreError::protocol(format!("bad commit hash: {hex:?}")))?;
            bytes[i] = u8::from_str_radix(s, 16)
                .map_err(|_| CoreError::protocol(format!("bad commit hash: {hex:?}")))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitHash({})", &self.to_hex()[..12])
    }
}

impl Serialize for CommitHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CommitHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        CommitHash::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// A single key change within a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum DeltaOp {
    /// The key now holds `value`.
    Put {
        /// The key written.
        key: String,
        /// The value written.
        value: Value,
    },
    /// The key was removed.
    Del {
        /// The key removed.
        key: String,
    },
}

impl DeltaOp {
    /// Returns the key this delta touches.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            DeltaOp::Put { key, .. } | DeltaOp::Del { key } => key,
        }
    }
}

/// An index creation or deletion carried by an `IndexChange` commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexChangeOp {
    /// A new index definition; the commit's materialized entries cover all
    /// matching rows at that point.
    Create(IndexDef),
    /// Removal of the named index.
    Drop(String),
}

/// What kind of state transition a commit represents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitKind {
    /// Authoritative server state. The commit's delta holds the full base
    /// contents relative to an empty map.
    Snapshot {
        /// Opaque server state token.
        cookie: Value,
        /// Highest mutation ID the server acknowledged for this client.
        last_mutation_id: u64,
        /// Index definitions live at this snapshot.
        indexes: Vec<IndexDef>,
    },
    /// One applied mutation on top of the parent.
    Local {
        /// The mutation that produced this commit.
        mutation: Mutation,
        /// True if this commit was appended for ordering after a failed
        /// replay; its delta is empty.
        errored: bool,
    },
    /// An index creation or deletion on top of the parent.
    IndexChange {
        /// The change applied.
        change: IndexChangeOp,
    },
}

/// An immutable, content-addressed commit.
///
/// Commits are never mutated; a store's history is the chain of parents from
/// its head down to the nearest snapshot.
#[derive(Debug, Clone)]
pub struct Commit {
    hash: CommitHash,
    parent: Option<CommitHash>,
    kind: CommitKind,
    delta: Vec<DeltaOp>,
}

/// Persisted form of a commit; the hash is the storage key.
#[derive(Serialize, Deserialize)]
struct CommitRecord {
    parent: Option<CommitHash>,
    kind: CommitKind,
    delta: Vec<DeltaOp>,
}

impl Commit {
    /// Creates a commit, computing its content address.
    #[must_use]
    pub fn new(parent: Option<CommitHash>, kind: CommitKind, delta: Vec<DeltaOp>) -> Self {
        let hash = Self::compute_hash(parent.as_ref(), &kind, &delta);
        Self {
            hash,
            parent,
            kind,
            delta,
        }
    }

    fn compute_hash(parent: Option<&CommitHash>, kind: &CommitKind, delta: &[DeltaOp]) -> CommitHash {
        // serde_json orders object members, so the rendering is canonical.
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_hex().as_bytes());
        }
        let payload = serde_json::json!({ "kind": kind, "delta": delta });
        hasher.update(payload.to_string().as_bytes());
        CommitHash(hasher.finalize().into())
    }

    /// Returns the commit's content address.
    #[must_use]
    pub fn hash(&self) -> CommitHash {
        self.hash
    }

    /// Returns the parent commit hash, if any.
    #[must_use]
    pub fn parent(&self) -> Option<CommitHash> {
        self.parent
    }

    /// Returns the commit kind.
    #[must_use]
    pub fn kind(&self) -> &CommitKind {
        &self.kind
    }

    /// Returns the key changes relative to the parent (or to an empty map
    /// for snapshots).
    #[must_use]
    pub fn delta(&self) -> &[DeltaOp] {
        &self.delta
    }

    /// Returns the mutation carried by a local commit.
    #[must_use]
    pub fn mutation(&self) -> Option<&Mutation> {
        match &self.kind {
            CommitKind::Local { mutation, .. } => Some(mutation),
            _ => None,
        }
    }

    /// Returns true for snapshot commits.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        matches!(self.kind, CommitKind::Snapshot { .. })
    }

    /// Encodes the commit for persistence.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let record = CommitRecord {
            parent: self.parent,
            kind: self.kind.clone(),
            delta: self.delta.clone(),
        };
        Ok(serde_json::to_vec(&record)?)
    }

    /// Decodes a persisted commit and verifies its content address.
    pub fn decode(expected: CommitHash, bytes: &[u8]) -> CoreResult<Self> {
        let record: CommitRecord = serde_json::from_slice(bytes)?;
        let commit = Commit::new(record.parent, record.kind, record.delta);
        if commit.hash != expected {
            return Err(CoreError::protocol(format!(
                "commit record hash mismatch: expected {expected}, got {}",
                commit.hash
            )));
        }
        Ok(commit)
    }
}
