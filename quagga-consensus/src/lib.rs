//! Consensus validation for the Quagga node.
//!
//! The [`engine::ValidationEngine`] accepts serialized blocks, runs the
//! header and body pipelines against the fork tree and the unspent-output
//! store, maintains the active chain, and notifies downstream consumers.

#![allow(clippy::unit_arg)]

pub mod block;
pub mod engine;
pub mod error;
pub mod flags;
pub mod fork_tree;
pub mod mempool;
pub mod notifier;
pub mod script;
pub mod subsidy;

pub use engine::{EngineSettings, EngineStatus, ValidationEngine};
pub use error::{BlockError, TransactionError};
pub use notifier::{Event, Notifier};
