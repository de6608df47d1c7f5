//! # replikv sync
//!
//! The wire-protocol side of replikv: pushing pending mutations, pulling
//! authoritative patches, adaptive connection pacing, and the app-facing
//! [`Client`] facade over a [`replikv_core::Store`].
//!
//! HTTP itself is abstracted behind [`HttpClient`]; embedders supply a real
//! transport, tests use [`LoopbackClient`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod connection_loop;
mod engine;
mod error;
mod http;
mod options;
mod transport;

pub use client::{Client, Mutator};
pub use connection_loop::{ConnectionLoop, ConnectionLoopConfig};
pub use engine::{BeginPullResult, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use http::{HttpClient, HttpPuller, HttpPusher, HttpResponse, LoopbackClient, LoopbackServer, NullHttpClient};
pub use options::{AuthCallback, ClientOptions, LogLevel};
pub use transport::{MockPuller, MockPusher, Puller, Pusher};
