use std::io::Write;

use bytes::Buf;
use chrono::{DateTime, Utc};

use crate::{serialization::sha256d, BchDeserialize, BchSerialize, SerializationError};
use bch_serde_derive::BchSerialize;

use crate::{cached::Cached, work::difficulty::CompactDifficulty};

use super::{merkle, Hash};

/// The fixed 80-byte block header.
///
/// The `previous_block_hash` back-pointer is what makes the chain a chain:
/// rewriting any block changes its hash and severs every descendant. The
/// fork tree is built from nothing but these.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, BchSerialize)]
pub struct Header {
    /// The block's version field, signed as on the wire. Version floors
    /// and supermajority counting interpret it as a plain integer.
    pub version: i32,

    /// The id of the parent block.
    pub previous_block_hash: Hash,

    /// The root of the transaction merkle tree.
    ///
    /// The tree's duplicate-last-node padding makes this commitment
    /// malleable (CVE-2012-2459); `merkle::root_and_mutated` is the
    /// companion check that keeps the malleation out of the fork tree.
    pub merkle_root: merkle::Root,

    /// The miner's claimed start-of-work time. Only loosely trusted:
    /// bounded above by wall clock plus two hours and below by the
    /// median time of the 11 ancestor blocks.
    pub time: DateTime<Utc>,

    /// The target threshold in compact `nBits` form; the header's own hash
    /// must not exceed it.
    pub difficulty_threshold: CompactDifficulty,

    /// Free bits the miner grinds to bring the header hash under the
    /// target.
    pub nonce: u32,

    /// For efficiency, we cache the hash of this block after computing it the first time
    /// This field is not part of the consensus serialization
    #[serde(skip)]
    hash: Cached<Hash>,
}

impl Header {
    // Returns length of serialized header in bytes
    pub const fn len() -> usize {
        80
    }

    pub fn new(
        version: i32,
        previous_block_hash: Hash,
        merkle_root: merkle::Root,
        time: DateTime<Utc>,
        difficulty_threshold: CompactDifficulty,
        nonce: u32,
    ) -> Header {
        Header {
            version,
            previous_block_hash,
            merkle_root,
            time,
            difficulty_threshold,
            nonce,
            hash: Cached::new(),
        }
    }

    /// The hash of this header, cached on deserialization.
    pub fn hash(&self) -> Hash {
        if let Some(hash) = self.hash.value() {
            return hash;
        }
        Hash::from(self)
    }

    /// Parse a header out of a buffer, filling its hash cache on the way.
    ///
    /// The 80 bytes pass through the hasher before field decoding, so the
    /// block id costs one digest here instead of a re-serialize later; on
    /// a `Bytes`-backed buffer the split is copy-free.
    pub fn deserialize_from_buf<B: Buf>(mut src: B) -> Result<Self, SerializationError> {
        if src.remaining() < Header::len() {
            return Err(SerializationError::Parse(
                "Not enough bytes in block header",
            ));
        }
        let src = src.copy_to_bytes(80);
        let mut hash_writer = sha256d::Writer::default();
        hash_writer
            .write_all(&src[..])
            .expect("Sha256dWriter is infallible");
        let hash_bytes = hash_writer.finish();
        let own_hash = Hash::from_bytes_exact(hash_bytes);

        // Deserialize the header
        let mut src = std::io::Cursor::new(src);
        Ok(Header {
            version: i32::bch_deserialize(&mut src)?,
            previous_block_hash: Hash::bch_deserialize(&mut src)?,
            merkle_root: merkle::Root::bch_deserialize(&mut src)?,
            time: <DateTime<Utc>>::bch_deserialize(&mut src)?,
            difficulty_threshold: CompactDifficulty::bch_deserialize(&mut src)?,
            nonce: u32::bch_deserialize(&mut src)?,
            hash: Cached::from(own_hash),
        })
    }
}

impl BchDeserialize for Header {
    fn bch_deserialize<R: std::io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let mut bytes = [0u8; 80];
        reader.read_exact(&mut bytes)?;
        Header::deserialize_from_buf(&bytes[..])
    }
}
