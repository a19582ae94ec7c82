//! Core Bitcoin-Cash data structures and consensus-critical serialization.
//!
//! This crate holds the data model shared by the state, consensus and
//! network crates: blocks, transactions, transparent outputs, amounts,
//! difficulty arithmetic, chain parameters and the CashAddr codec.

#![allow(clippy::unit_arg)]

#[macro_use]
extern crate serde;

pub mod amount;
pub mod block;
pub mod cached;
pub mod compactint;
pub mod fmt;
pub mod parameters;
pub mod serialization;
pub mod transaction;
pub mod transparent;
pub mod work;

pub use cached::Cached;
pub use compactint::CompactInt;
pub use serialization::{
    BchDeserialize, BchDeserializeInto, BchSerialize, SerializationError,
};

#[cfg(any(test, feature = "proptest-impl"))]
pub use parameters::LedgerState;
