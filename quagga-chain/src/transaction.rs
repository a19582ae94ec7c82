//! Transactions: ids, lock times, and the wire codec.

use crate::BchSerialize;
use crate::{cached::Cached, compactint::CompactInt};
use bch_serde_derive::BchSerialize;
use serde::{Deserialize, Serialize};

mod hash;
mod lock_time;
mod serialize;

#[cfg(any(test, feature = "proptest-impl"))]
mod arbitrary;

pub use hash::Hash;
pub use lock_time::LockTime;
pub use serialize::MAX_TX_SIZE;

use crate::transparent;

/// The minimum serialized transaction size accepted once HF-2018-11 is
/// active, in bytes.
pub const MIN_TX_SIZE_HF201811: usize = 100;

/// A Bitcoin-Cash transaction: a batch of inputs consumed and outputs
/// created, atomically.
///
/// The inputs name unspent outputs of earlier transactions and prove the
/// right to spend them; the outputs lock new value behind scripts. The
/// validation engine holds transactions behind `Arc` so a block and the
/// mempool can share one parse.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, BchSerialize)]
pub struct Transaction {
    /// The transaction version. Versions greater than 1 mean that BIP 68 applies
    pub version: i32,
    /// The transaction Inputs
    pub inputs: Vec<transparent::Input>,
    /// The transaction Outputs
    pub outputs: Vec<transparent::Output>,
    /// The transaction LockTime
    pub locktime: LockTime,
    #[serde(skip)]
    hash: Cached<Hash>,
}

impl Transaction {
    pub fn new(
        version: i32,
        inputs: Vec<transparent::Input>,
        outputs: Vec<transparent::Output>,
        locktime: LockTime,
    ) -> Transaction {
        Transaction {
            version,
            inputs,
            outputs,
            locktime,
            hash: Cached::new(),
        }
    }

    /// Get the hash of this transaction.
    pub fn hash(&self) -> Hash {
        // If we have a cached version, just return that
        if let Some(hash) = self.hash.value() {
            return hash;
        }
        // Otherwise, serialize the tx to calculate and return the hash
        Hash::from(self)
    }

    pub fn contains_coinbase_input(&self) -> bool {
        self.inputs
            .iter()
            .any(|input| matches!(input, transparent::Input::Coinbase { .. }))
    }

    /// Returns `true` if this transaction is a coinbase transaction.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && matches!(
                self.inputs.get(0),
                Some(transparent::Input::Coinbase { .. })
            )
    }

    /// Returns the serialized length (in bytes) of a transaction.
    pub fn len(&self) -> usize {
        let mut size = 0;
        size += 4 + CompactInt::size(self.inputs.len());
        for input in self.inputs.iter() {
            size += input.len();
        }
        size += CompactInt::size(self.outputs.len());
        for output in self.outputs.iter() {
            size += output.len();
        }
        size + 4
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }
}
