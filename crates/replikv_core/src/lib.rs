//! # replikv core
//!
//! The versioned transactional store at the heart of replikv.
//!
//! State is a chain of content-addressed commits over a JSON key-value map.
//! Writes run through named mutators inside exclusive write transactions and
//! append local commits; pulls rebase the pending local commits onto a new
//! server snapshot. Reads are snapshot transactions with point lookups,
//! prefix/range scans, and secondary-index scans. Subscriptions re-evaluate
//! queries whenever a commit touches the keys they read.
//!
//! This crate is network-free; the wire protocol client lives in
//! `replikv_sync`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod commit;
mod dag;
mod error;
mod index;
mod pointer;
mod scan;
mod store;
mod subscription;
mod sync;
mod transaction;

pub use commit::{Commit, CommitHash, CommitKind, DeltaOp, IndexChangeOp};
pub use error::{CoreError, CoreResult};
pub use index::{IndexDef, IndexEntry};
pub use scan::{ScanItem, ScanIter, ScanKey, ScanOptions, ScanStart, StartKey};
pub use store::{Mutator, MutatorFn, Store, StoreStats};
pub use subscription::{Subscription, SubscriptionHandlers};
pub use sync::PullInfo;
pub use transaction::{ReadTransaction, WriteTransaction};

pub use replikv_protocol::Mutation;
