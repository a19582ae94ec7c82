//! State storage for the Quagga node: raw block files, the sled-backed
//! block index, undo blocks, and the unspent-output store the validation
//! engine mutates.

#![allow(clippy::unit_arg)]

mod block_files;
mod config;
mod index_db;
mod store;
mod undo;
mod utxo;

pub use block_files::{BlockFiles, FilePos};
pub use config::Config;
pub use index_db::{IndexDb, IndexRecord, StatusBits};
pub use store::Store;
pub use undo::{UndoBlock, UndoItem};
pub use utxo::{
    BlockData, BlockSource, BlockStore, MemoryBlockSource, SpentOutput, TxOutputs, UnspentOutputs,
    UtxoEntry, UtxoError, UtxoStore,
};

/// A boxed [`std::error::Error`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
