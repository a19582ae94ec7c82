//! Blocks: headers, hashes, heights, the merkle tree, and the zero-copy
//! iterator over serialized block bytes.
#![allow(clippy::unit_arg)]

mod hash;
mod header;
mod height;
mod serialize;

pub mod iterator;
pub mod merkle;

#[cfg(any(test, feature = "proptest-impl"))]
mod arbitrary;
#[cfg(test)]
mod tests;

use std::{convert::TryInto, fmt, io::Read, sync::Arc};

use crate::compactint::CompactInt;
use crate::{BchDeserialize, SerializationError};
use bytes::{Buf, BytesMut};

pub use hash::Hash;
pub use header::Header;
pub use height::Height;
pub use iterator::{BlockIterator, Field, TxRef};

use serde::{Deserialize, Serialize};

use crate::{fmt::DisplayToDebug, transaction::Transaction, transparent};

pub use self::serialize::MAX_BLOCK_BYTES;

/// A Bitcoin-Cash block, containing a header and a list of transactions.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// The block header, containing block metadata.
    pub header: Header,
    /// The block transactions.
    pub transactions: Vec<std::sync::Arc<Transaction>>,
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fmter = f.debug_struct("Block");
        if let Some(height) = self.coinbase_height() {
            fmter.field("height", &height);
        }

        fmter.field("hash", &DisplayToDebug(self.hash())).finish()
    }
}

impl Block {
    /// Return the block height reported in the coinbase transaction, if any.
    pub fn coinbase_height(&self) -> Option<Height> {
        self.transactions
            .get(0)
            .and_then(|tx| tx.inputs.get(0))
            .and_then(|input| match input {
                transparent::Input::Coinbase { ref height, .. } => {
                    height.as_ref().and_then(|cached| cached.value())
                }
                _ => None,
            })
    }

    /// Compute the hash of this block.
    pub fn hash(&self) -> Hash {
        Hash::from(self)
    }

    /// Returns the serialized length (in bytes) of this block.
    pub fn serialized_len(&self) -> usize {
        let mut size = Header::len() + CompactInt::size(self.transactions.len());
        for tx in self.transactions.iter() {
            size += tx.len();
        }
        size
    }

    /// Deserializes a block from an in-memory buffer, caching the header
    /// hash and each transaction id along the way.
    pub fn deserialize_from_buf(src: &mut BytesMut) -> Result<Self, SerializationError> {
        if src.remaining() < Header::len() {
            return Err(SerializationError::Parse("Not enough bytes for a header"));
        }
        let header = Header::deserialize_from_buf(src.split_to(Header::len()))?;

        let mut src = src.reader().take(MAX_BLOCK_BYTES - Header::len() as u64);
        let tx_count = {
            let tx_count = CompactInt::bch_deserialize(&mut src)?;
            tx_count.value()
        };

        // No block under the byte cap can hold more transactions than
        // this, so a larger claim is a lie and not worth allocating for.
        if tx_count > MAX_BLOCK_BYTES / (36 * 4) {
            return Err(SerializationError::Parse(
                "block claims more transactions than its bytes could carry",
            ));
        }
        let mut transactions = Vec::with_capacity(
            tx_count
                .try_into()
                .expect("tx_count is bounded by MAX_BLOCK_BYTES / (36 * 4)"),
        );

        for _ in 0..tx_count {
            transactions.push(<Arc<Transaction>>::bch_deserialize(&mut src)?);
        }
        Ok(Block {
            header,
            transactions,
        })
    }
}

impl<'a> From<&'a Block> for Hash {
    fn from(block: &'a Block) -> Hash {
        block.header.hash()
    }
}
