//! The sled-backed block index: block hash → index record, plus the
//! height ↔ hash mappings the header chain is rebuilt from at startup.

use std::convert::TryInto;

use quagga_chain::{block, parameters::Network};
use tracing::trace;

use crate::{block_files::FilePos, BoxError, Config};

/// Validation-status bits persisted with each index record.
///
/// These mirror the in-memory fork-tree status set; `INVALID` dominates.
pub struct StatusBits;

impl StatusBits {
    pub const HEADER_CHECKED: u8 = 0b0000_0001;
    pub const BODY_CHECKED: u8 = 0b0000_0010;
    pub const PARENT_VALID: u8 = 0b0000_0100;
    pub const CHAIN_HEADERS_VALID: u8 = 0b0000_1000;
    pub const FULLY_VALIDATED: u8 = 0b0001_0000;
    pub const INVALID: u8 = 0b1000_0000;
}

/// The persisted index record for one block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexRecord {
    /// Chain height; -1 while the block is still an orphan.
    pub height: i32,
    /// Where the raw block lives, if its body has been stored.
    pub pos: Option<FilePos>,
    /// Where the undo block lives, once the block has been connected.
    pub undo_pos: Option<FilePos>,
    /// Validation status bits.
    pub status: u8,
    /// Number of transactions, when the body is known.
    pub tx_count: u32,
}

fn read_exact<'a>(bytes: &'a [u8], cursor: &mut usize, n: usize) -> Result<&'a [u8], BoxError> {
    if bytes.len() < *cursor + n {
        return Err("truncated index record".into());
    }
    let slice = &bytes[*cursor..*cursor + n];
    *cursor += n;
    Ok(slice)
}

fn read_pos(bytes: &[u8], cursor: &mut usize) -> Result<FilePos, BoxError> {
    let file = u32::from_le_bytes(read_exact(bytes, cursor, 4)?.try_into().expect("4 bytes"));
    let offset = u32::from_le_bytes(read_exact(bytes, cursor, 4)?.try_into().expect("4 bytes"));
    Ok(FilePos { file, offset })
}

impl IndexRecord {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 1 + 8 + 8 + 1 + 4);
        out.extend_from_slice(&self.height.to_le_bytes());
        let mut flags = 0u8;
        if self.pos.is_some() {
            flags |= 1;
        }
        if self.undo_pos.is_some() {
            flags |= 2;
        }
        out.push(flags);
        for pos in [self.pos, self.undo_pos].iter().flatten() {
            out.extend_from_slice(&pos.file.to_le_bytes());
            out.extend_from_slice(&pos.offset.to_le_bytes());
        }
        out.push(self.status);
        out.extend_from_slice(&self.tx_count.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<IndexRecord, BoxError> {
        let mut cursor = 0usize;

        let height = i32::from_le_bytes(
            read_exact(bytes, &mut cursor, 4)?
                .try_into()
                .expect("4 bytes"),
        );
        let flags = read_exact(bytes, &mut cursor, 1)?[0];
        let pos = if flags & 1 != 0 {
            Some(read_pos(bytes, &mut cursor)?)
        } else {
            None
        };
        let undo_pos = if flags & 2 != 0 {
            Some(read_pos(bytes, &mut cursor)?)
        } else {
            None
        };
        let status = read_exact(bytes, &mut cursor, 1)?[0];
        let tx_count = u32::from_le_bytes(
            read_exact(bytes, &mut cursor, 4)?
                .try_into()
                .expect("4 bytes"),
        );

        Ok(IndexRecord {
            height,
            pos,
            undo_pos,
            status,
            tx_count,
        })
    }
}

/// The sled trees backing the persistent block index.
pub struct IndexDb {
    hash_by_height: sled::Tree,
    height_by_hash: sled::Tree,
    record_by_hash: sled::Tree,
}

impl IndexDb {
    pub fn new(config: &Config, network: Network) -> Result<Self, BoxError> {
        let db = config.sled_config(network).open()?;

        Ok(Self {
            hash_by_height: db.open_tree(b"hash_by_height")?,
            height_by_hash: db.open_tree(b"height_by_hash")?,
            record_by_hash: db.open_tree(b"record_by_hash")?,
        })
    }

    /// Store or replace the record for `hash`.
    pub fn insert(&self, hash: block::Hash, record: &IndexRecord) -> Result<(), BoxError> {
        trace!(?hash, height = record.height, "writing index record");
        self.record_by_hash.insert(&hash.0[..], record.to_bytes())?;
        if record.height >= 0 {
            // Heights are stored big-endian so sled's lexicographic order is
            // the numeric order, which makes tip() a reverse scan.
            let height_key = (record.height as u32).to_be_bytes();
            self.hash_by_height.insert(&height_key, &hash.0[..])?;
            self.height_by_hash.insert(&hash.0[..], &height_key)?;
        }
        Ok(())
    }

    /// Drop the height mapping for a block that is no longer on the active
    /// chain. Its record stays, so the failure or reorg is remembered.
    pub fn remove_from_chain(&self, hash: block::Hash, height: u32) -> Result<(), BoxError> {
        self.hash_by_height.remove(&height.to_be_bytes())?;
        self.height_by_hash.remove(&hash.0[..])?;
        Ok(())
    }

    /// Fetch the record for `hash`, if any.
    pub fn get(&self, hash: block::Hash) -> Result<Option<IndexRecord>, BoxError> {
        match self.record_by_hash.get(&hash.0[..])? {
            Some(ivec) => Ok(Some(IndexRecord::from_bytes(&ivec)?)),
            None => Ok(None),
        }
    }

    /// The hash stored for `height` on the active chain, if any.
    pub fn hash_at(&self, height: u32) -> Result<Option<block::Hash>, BoxError> {
        match self.hash_by_height.get(&height.to_be_bytes())? {
            Some(ivec) => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&ivec);
                Ok(Some(block::Hash(hash)))
            }
            None => Ok(None),
        }
    }

    /// The highest (height, hash) pair recorded for the active chain.
    pub fn tip(&self) -> Result<Option<(u32, block::Hash)>, BoxError> {
        if let Some((height_bytes, hash_bytes)) =
            self.hash_by_height.iter().rev().next().transpose()?
        {
            let height = u32::from_be_bytes(
                height_bytes[..]
                    .try_into()
                    .map_err(|_| "malformed height key")?,
            );
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&hash_bytes);
            Ok(Some((height, block::Hash(hash))))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral_db() -> IndexDb {
        let config = Config {
            ephemeral: true,
            ..Config::default()
        };
        IndexDb::new(&config, Network::Mainnet).unwrap()
    }

    #[test]
    fn records_round_trip() {
        quagga_test::init();

        let db = ephemeral_db();
        let hash = block::Hash([7; 32]);
        let record = IndexRecord {
            height: 12,
            pos: Some(FilePos { file: 0, offset: 99 }),
            undo_pos: None,
            status: StatusBits::HEADER_CHECKED | StatusBits::FULLY_VALIDATED,
            tx_count: 3,
        };
        db.insert(hash, &record).unwrap();
        assert_eq!(db.get(hash).unwrap(), Some(record));
        assert_eq!(db.hash_at(12).unwrap(), Some(hash));
    }

    #[test]
    fn tip_is_the_highest_height() {
        quagga_test::init();

        let db = ephemeral_db();
        for height in &[0i32, 300, 7] {
            let mut hash = [0u8; 32];
            hash[0] = *height as u8;
            let record = IndexRecord {
                height: *height,
                pos: None,
                undo_pos: None,
                status: 0,
                tx_count: 0,
            };
            db.insert(block::Hash(hash), &record).unwrap();
        }
        let (tip_height, _) = db.tip().unwrap().unwrap();
        assert_eq!(tip_height, 300);
    }
}
