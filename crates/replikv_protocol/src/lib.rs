//! # replikv sync protocol
//!
//! Wire message types for the push and pull channels.
//!
//! Bodies are JSON; field names on the wire are camelCase. The protocol is
//! versioned independently per direction via [`PUSH_VERSION`] and
//! [`PULL_VERSION`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod messages;
mod patch;

pub use messages::{
    Mutation, MutationInfo, PullRequest, PullResponse, PushRequest, PushResponse, PULL_VERSION,
    PUSH_VERSION,
};
pub use patch::PatchOp;
