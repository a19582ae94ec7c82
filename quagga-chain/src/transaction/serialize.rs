//! The transaction wire codec.

use crate::serialization::{BchDeserialize, SerializationError};

use super::*;
use crate::transparent;

/// The maximum size of a single transaction, in bytes.
///
/// The cash forks grew the block, not the transaction: 1 MB is still the
/// consensus cap on one transaction. The post-Nov-2018 *minimum* of
/// [`MIN_TX_SIZE_HF201811`] is contextual and enforced by the engine, not
/// here.
pub const MAX_TX_SIZE: u64 = 1_000_000;

impl BchDeserialize for Transaction {
    fn bch_deserialize<R: std::io::Read>(src: R) -> Result<Self, SerializationError> {
        // Cap the read at the consensus transaction size so a forged input
        // count cannot pull unbounded bytes.
        let mut src = src.take(MAX_TX_SIZE);
        let version = i32::bch_deserialize(&mut src)?;
        let inputs = <Vec<transparent::Input>>::bch_deserialize(&mut src)?;
        let outputs = <Vec<transparent::Output>>::bch_deserialize(&mut src)?;
        let locktime = LockTime::bch_deserialize(&mut src)?;
        let mut tx = Transaction {
            version,
            inputs,
            outputs,
            locktime,
            hash: Cached::new(),
        };
        // The txid is the sha256d of exactly the bytes just read; computing
        // it here, once, is what lets every later `hash()` call be free.
        let own_hash = tx.hash();
        tx.hash = Cached::from(own_hash);
        Ok(tx)
    }
}
