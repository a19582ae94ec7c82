use std::io;

use crate::{BchDeserialize, BchSerialize, SerializationError};

use super::{Block, Header};

/// The hard upper bound on the size of a serialized block this node will
/// parse, in bytes.
///
/// This is a denial-of-service cap, not the consensus accept limit: the
/// configurable accept limit lives in `ChainParams` and is enforced by the
/// validation engine.
pub const MAX_BLOCK_BYTES: u64 = 128_000_000;

impl BchSerialize for Block {
    fn bch_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        self.header.bch_serialize(&mut writer)?;
        self.transactions.bch_serialize(&mut writer)?;
        Ok(())
    }
}

impl BchDeserialize for Block {
    fn bch_deserialize<R: io::Read>(reader: R) -> Result<Self, SerializationError> {
        // A block running past the cap surfaces as a short read partway
        // through a transaction.
        let mut limited_reader = reader.take(MAX_BLOCK_BYTES);
        Ok(Block {
            header: Header::bch_deserialize(&mut limited_reader)?,
            transactions: Vec::bch_deserialize(&mut limited_reader)?,
        })
    }
}
