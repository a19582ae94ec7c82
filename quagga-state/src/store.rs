//! The persistent store: block files plus the sled index, glued together
//! behind the [`BlockStore`] interface the engine drives.

use std::convert::TryInto;

use bytes::Bytes;

use quagga_chain::{block::Header, parameters::Network};

use crate::{
    block_files::BlockFiles,
    index_db::{IndexDb, IndexRecord},
    undo::UndoBlock,
    utxo::{BlockSource, BlockStore, UtxoError},
    BoxError, Config,
};

/// On-disk block storage for one network: raw files and the hash/height
/// index over them.
pub struct Store {
    files: BlockFiles,
    index: IndexDb,
}

impl Store {
    pub fn open(config: &Config, network: Network) -> Result<Store, BoxError> {
        let files = BlockFiles::open(config.data_dir(network).join("blocks"))?;
        let index = IndexDb::new(config, network)?;
        Ok(Store { files, index })
    }

    pub fn files(&self) -> &BlockFiles {
        &self.files
    }

    pub fn index(&self) -> &IndexDb {
        &self.index
    }

    fn storage_error(error: impl std::fmt::Display) -> UtxoError {
        tracing::error!(%error, "block store failure");
        UtxoError::Inconsistent("block store failure")
    }
}

impl BlockSource for Store {
    fn block_at_height(&self, height: u32) -> Result<Bytes, UtxoError> {
        let hash = self
            .index
            .hash_at(height)
            .map_err(Store::storage_error)?
            .ok_or(UtxoError::BlockDataMissing(height))?;
        let record = self
            .index
            .get(hash)
            .map_err(Store::storage_error)?
            .ok_or(UtxoError::BlockDataMissing(height))?;
        let pos = record.pos.ok_or(UtxoError::BlockDataMissing(height))?;
        self.files.read_block(pos).map_err(Store::storage_error)
    }
}

impl BlockStore for Store {
    fn store_block(&self, height: u32, bytes: Bytes) -> Result<(), UtxoError> {
        let header =
            Header::deserialize_from_buf(&bytes[..]).map_err(Store::storage_error)?;
        let pos = self.files.write_block(&bytes).map_err(Store::storage_error)?;

        let mut record = self
            .index
            .get(header.hash())
            .map_err(Store::storage_error)?
            .unwrap_or(IndexRecord {
                height: height as i32,
                pos: None,
                undo_pos: None,
                status: 0,
                tx_count: 0,
            });
        record.height = height as i32;
        record.pos = Some(pos);
        record.tx_count = count_transactions(&bytes).unwrap_or(record.tx_count);
        self.index
            .insert(header.hash(), &record)
            .map_err(Store::storage_error)?;
        Ok(())
    }

    fn unstore_height(&self, height: u32) {
        if let Ok(Some(hash)) = self.index.hash_at(height) {
            let _ = self.index.remove_from_chain(hash, height);
        }
    }

    fn store_undo(&self, height: u32, undo: &UndoBlock) -> Result<(), UtxoError> {
        let hash = self
            .index
            .hash_at(height)
            .map_err(Store::storage_error)?
            .ok_or(UtxoError::BlockDataMissing(height))?;
        let undo_pos = self.files.write_undo(undo).map_err(Store::storage_error)?;
        let mut record = self
            .index
            .get(hash)
            .map_err(Store::storage_error)?
            .ok_or(UtxoError::BlockDataMissing(height))?;
        record.undo_pos = Some(undo_pos);
        self.index
            .insert(hash, &record)
            .map_err(Store::storage_error)?;
        Ok(())
    }

    fn undo_at_height(&self, height: u32) -> Result<UndoBlock, UtxoError> {
        let hash = self
            .index
            .hash_at(height)
            .map_err(Store::storage_error)?
            .ok_or(UtxoError::UndoDataMissing(height))?;
        let record = self
            .index
            .get(hash)
            .map_err(Store::storage_error)?
            .ok_or(UtxoError::UndoDataMissing(height))?;
        let undo_pos = record.undo_pos.ok_or(UtxoError::UndoDataMissing(height))?;
        self.files.read_undo(undo_pos).map_err(Store::storage_error)
    }
}

/// Read the transaction count out of a serialized block without parsing
/// the transactions.
fn count_transactions(bytes: &[u8]) -> Option<u32> {
    let after_header = bytes.get(Header::len()..)?;
    let first = *after_header.get(0)?;
    let count: u64 = match first {
        0..=252 => first as u64,
        253 => u16::from_le_bytes(after_header.get(1..3)?.try_into().ok()?) as u64,
        254 => u32::from_le_bytes(after_header.get(1..5)?.try_into().ok()?) as u64,
        255 => u64::from_le_bytes(after_header.get(1..9)?.try_into().ok()?),
    };
    count.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn open_store(dir: &TempDir) -> Store {
        let config = Config {
            cache_dir: dir.path().to_path_buf(),
            ephemeral: true,
        };
        Store::open(&config, Network::Mainnet).unwrap()
    }

    #[test]
    fn store_and_reload_block_by_height() {
        quagga_test::init();

        let dir = TempDir::new("quagga-store").unwrap();
        let store = open_store(&dir);
        let bytes = Bytes::from(quagga_test::vectors::DUMMY_BLOCK.clone());

        store.store_block(0, bytes.clone()).unwrap();
        assert_eq!(store.block_at_height(0).unwrap(), bytes);

        store.unstore_height(0);
        assert!(matches!(
            store.block_at_height(0),
            Err(UtxoError::BlockDataMissing(0))
        ));
    }

    #[test]
    fn undo_blocks_ride_along() {
        quagga_test::init();

        let dir = TempDir::new("quagga-store").unwrap();
        let store = open_store(&dir);
        store
            .store_block(0, Bytes::from(quagga_test::vectors::DUMMY_BLOCK.clone()))
            .unwrap();

        let undo = UndoBlock::default();
        store.store_undo(0, &undo).unwrap();
        assert_eq!(store.undo_at_height(0).unwrap(), undo);
    }
}
