//! State management module for the Halldyll provisioning engine.
//!
//! This module persists the last-known-good mapping from logical identity to
//! provider identity, recorded properties and outputs, plus run history.

mod local;
mod lock;
mod migrate;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use migrate::{decode, encode};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{HistoryEntry, Operation, STATE_VERSION, StateRecord, StateSnapshot};
