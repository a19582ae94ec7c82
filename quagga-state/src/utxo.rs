//! The unspent-output store.
//!
//! The validation engine drives this store through the [`UtxoStore`] trait:
//! bulk pre-insert of a block's outputs, concurrent `find`/`remove` during
//! chunked input checks, then a single `block_finished` commit (or
//! `rollback`). Entries record where the producing transaction lives
//! (height and offset in its block) so re-inserts during reorgs can restore
//! amount and script from block storage, without the undo data having to
//! carry them.

use std::{
    collections::HashMap,
    convert::TryFrom,
    sync::{Arc, Mutex, RwLock},
};

use bytes::Bytes;
use displaydoc::Display;
use thiserror::Error;
use tracing::trace;

use quagga_chain::{
    amount::{Amount, NonNegative},
    block::{self, BlockIterator, Field},
    transaction,
    transparent::{OutPoint, Script},
};

/// Errors from the unspent-output store.
///
/// Everything except `DuplicateEntry` and `Inconsistent` is recoverable by
/// rejecting the block being validated; those two indicate local corruption
/// and are treated as fatal by the engine.
#[derive(Error, Debug, Display, Clone, PartialEq)]
pub enum UtxoError {
    /// output {0}:{1} inserted twice
    DuplicateEntry(transaction::Hash, u32),
    /// block data not present for height {0}
    BlockDataMissing(u32),
    /// undo data not present for height {0}
    UndoDataMissing(u32),
    /// no transaction at offset {1} in the block at height {0}
    TxNotFound(u32, u32),
    /// output index {1} out of range for transaction {0}
    OutputOutOfRange(transaction::Hash, u32),
    /// unspent output database inconsistent: {0}
    Inconsistent(&'static str),
}

/// One unspent output: key data plus the disk location of its producer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoEntry {
    /// The output's value.
    pub value: Amount<NonNegative>,
    /// The output's lock script.
    pub lock_script: Script,
    /// Height of the block that created the output.
    pub height: u32,
    /// Byte offset of the creating transaction inside that block.
    pub offset_in_block: u32,
}

/// What `remove` reports about the entry it deleted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpentOutput {
    pub height: u32,
    pub offset_in_block: u32,
}

/// The outputs of one transaction, for bulk insertion.
#[derive(Clone, Debug)]
pub struct TxOutputs {
    pub tx: transaction::Hash,
    pub offset_in_block: u32,
    pub outputs: Vec<(Amount<NonNegative>, Script)>,
}

/// All outputs created by one block, for bulk insertion.
#[derive(Clone, Debug)]
pub struct BlockData {
    pub height: u32,
    pub outputs: Vec<TxOutputs>,
}

impl BlockData {
    /// Collect every transaction's outputs from a serialized block, using
    /// the zero-copy iterator.
    pub fn from_block_bytes(height: u32, bytes: Bytes) -> Result<BlockData, UtxoError> {
        let mut iter = BlockIterator::new(bytes)
            .map_err(|_| UtxoError::Inconsistent("stored block bytes do not parse"))?;
        let mut outputs = Vec::new();
        let mut current: Vec<(Amount<NonNegative>, Script)> = Vec::new();
        let mut pending_value: Option<i64> = None;
        loop {
            match iter
                .next_field()
                .map_err(|_| UtxoError::Inconsistent("stored block bytes do not parse"))?
            {
                Field::OutputValue(value) => pending_value = Some(value),
                Field::OutputScript(script) => {
                    let value = pending_value
                        .take()
                        .ok_or(UtxoError::Inconsistent("output script without value"))?;
                    let value = Amount::try_from(value)
                        .map_err(|_| UtxoError::Inconsistent("output value out of range"))?;
                    current.push((value, Script(script.to_vec())));
                }
                Field::TxEnd => {
                    let tx_ref = iter
                        .prev_tx()
                        .expect("prev_tx is set at TxEnd")
                        .clone();
                    outputs.push(TxOutputs {
                        tx: tx_ref.hash(),
                        offset_in_block: tx_ref.offset_in_block() as u32,
                        outputs: std::mem::take(&mut current),
                    });
                }
                Field::End => break,
                _ => {}
            }
        }
        Ok(BlockData { height, outputs })
    }
}

/// Read access to stored blocks by height, used to restore re-inserted
/// outputs.
pub trait BlockSource: Send + Sync {
    fn block_at_height(&self, height: u32) -> Result<Bytes, UtxoError>;
}

/// Writable block and undo storage, as driven by the validation engine.
///
/// `store_block` attaches a block's bytes to an active-chain height;
/// `unstore_height` detaches them again when the block is disconnected
/// during a reorg. The bytes themselves may be retained by the backend.
pub trait BlockStore: BlockSource {
    fn store_block(&self, height: u32, bytes: Bytes) -> Result<(), UtxoError>;
    fn unstore_height(&self, height: u32);
    fn store_undo(&self, height: u32, undo: &crate::undo::UndoBlock) -> Result<(), UtxoError>;
    fn undo_at_height(&self, height: u32) -> Result<crate::undo::UndoBlock, UtxoError>;
}

/// An in-memory [`BlockStore`] for tests and `CheckValidityOnly` runs.
#[derive(Default)]
pub struct MemoryBlockSource {
    blocks: RwLock<HashMap<u32, Bytes>>,
    undo: RwLock<HashMap<u32, crate::undo::UndoBlock>>,
}

impl MemoryBlockSource {
    pub fn new() -> MemoryBlockSource {
        MemoryBlockSource::default()
    }

    pub fn insert(&self, height: u32, bytes: Bytes) {
        self.blocks
            .write()
            .expect("block source lock poisoned")
            .insert(height, bytes);
    }

    pub fn remove(&self, height: u32) {
        self.blocks
            .write()
            .expect("block source lock poisoned")
            .remove(&height);
    }
}

impl BlockSource for MemoryBlockSource {
    fn block_at_height(&self, height: u32) -> Result<Bytes, UtxoError> {
        self.blocks
            .read()
            .expect("block source lock poisoned")
            .get(&height)
            .cloned()
            .ok_or(UtxoError::BlockDataMissing(height))
    }
}

impl BlockStore for MemoryBlockSource {
    fn store_block(&self, height: u32, bytes: Bytes) -> Result<(), UtxoError> {
        self.insert(height, bytes);
        Ok(())
    }

    fn unstore_height(&self, height: u32) {
        self.remove(height);
    }

    fn store_undo(&self, height: u32, undo: &crate::undo::UndoBlock) -> Result<(), UtxoError> {
        self.undo
            .write()
            .expect("block source lock poisoned")
            .insert(height, undo.clone());
        Ok(())
    }

    fn undo_at_height(&self, height: u32) -> Result<crate::undo::UndoBlock, UtxoError> {
        self.undo
            .read()
            .expect("block source lock poisoned")
            .get(&height)
            .cloned()
            .ok_or(UtxoError::UndoDataMissing(height))
    }
}

/// The mutation contract the validation engine assumes.
///
/// `find` and `remove` are called from multiple worker threads during one
/// block's chunked input checks; the remaining operations are serialized on
/// the engine strand.
pub trait UtxoStore: Send + Sync {
    /// Add one entry, restoring its amount and script from block storage.
    /// A pre-existing key is a fatal internal error.
    fn insert(
        &self,
        tx: transaction::Hash,
        index: u32,
        height: u32,
        offset: u32,
    ) -> Result<(), UtxoError>;

    /// Bulk-insert all outputs of a block.
    fn insert_all(&self, data: &BlockData) -> Result<(), UtxoError>;

    /// Look up one entry.
    fn find(&self, tx: transaction::Hash, index: u32) -> Result<Option<UtxoEntry>, UtxoError>;

    /// Remove and return one entry; absence means a double-spend attempt.
    /// The hint is an opaque acceleration and may be ignored.
    fn remove(
        &self,
        tx: transaction::Hash,
        index: u32,
        hint: Option<u64>,
    ) -> Result<Option<SpentOutput>, UtxoError>;

    /// Atomically commit staged mutations and set the best block.
    fn block_finished(&self, height: u32, hash: block::Hash) -> Result<(), UtxoError>;

    /// The current best block.
    fn block_id(&self) -> block::Hash;

    /// Discard staged mutations since the last `block_finished`.
    fn rollback(&self);
}

enum StageOp {
    Inserted(OutPoint),
    Removed(OutPoint, UtxoEntry),
}

/// The in-memory unspent-output store.
pub struct UnspentOutputs {
    map: RwLock<HashMap<OutPoint, UtxoEntry>>,
    stage: Mutex<Vec<StageOp>>,
    best: Mutex<block::Hash>,
    blocks: Arc<dyn BlockSource>,
}

impl UnspentOutputs {
    pub fn new(blocks: Arc<dyn BlockSource>) -> UnspentOutputs {
        UnspentOutputs {
            map: RwLock::new(HashMap::new()),
            stage: Mutex::new(Vec::new()),
            best: Mutex::new(block::Hash([0; 32])),
            blocks,
        }
    }

    /// The number of unspent outputs currently tracked.
    pub fn len(&self) -> usize {
        self.map.read().expect("utxo lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stage_push(&self, op: StageOp) {
        self.stage.lock().expect("stage lock poisoned").push(op);
    }

    fn insert_entry(&self, outpoint: OutPoint, entry: UtxoEntry) -> Result<(), UtxoError> {
        let mut map = self.map.write().expect("utxo lock poisoned");
        if map.contains_key(&outpoint) {
            return Err(UtxoError::DuplicateEntry(outpoint.hash, outpoint.index));
        }
        map.insert(outpoint, entry);
        drop(map);
        self.stage_push(StageOp::Inserted(outpoint));
        Ok(())
    }
}

impl UtxoStore for UnspentOutputs {
    fn insert(
        &self,
        tx: transaction::Hash,
        index: u32,
        height: u32,
        offset: u32,
    ) -> Result<(), UtxoError> {
        let bytes = self.blocks.block_at_height(height)?;
        let mut iter = BlockIterator::new(bytes)
            .map_err(|_| UtxoError::Inconsistent("stored block bytes do not parse"))?;

        // Walk to the transaction at `offset`, collecting its outputs.
        let mut current: Vec<(i64, Bytes)> = Vec::new();
        let mut pending_value: Option<i64> = None;
        loop {
            match iter
                .next_field()
                .map_err(|_| UtxoError::Inconsistent("stored block bytes do not parse"))?
            {
                Field::OutputValue(value) => pending_value = Some(value),
                Field::OutputScript(script) => {
                    let value = pending_value
                        .take()
                        .ok_or(UtxoError::Inconsistent("output script without value"))?;
                    current.push((value, script));
                }
                Field::TxEnd => {
                    let tx_ref = iter.prev_tx().expect("prev_tx is set at TxEnd");
                    if tx_ref.offset_in_block() as u32 == offset {
                        if tx_ref.hash() != tx {
                            return Err(UtxoError::Inconsistent(
                                "transaction at recorded offset has a different id",
                            ));
                        }
                        let (value, script) = current
                            .get(index as usize)
                            .ok_or(UtxoError::OutputOutOfRange(tx, index))?;
                        let value = Amount::try_from(*value)
                            .map_err(|_| UtxoError::Inconsistent("output value out of range"))?;
                        return self.insert_entry(
                            OutPoint { hash: tx, index },
                            UtxoEntry {
                                value,
                                lock_script: Script(script.to_vec()),
                                height,
                                offset_in_block: offset,
                            },
                        );
                    }
                    current.clear();
                }
                Field::End => return Err(UtxoError::TxNotFound(height, offset)),
                _ => {}
            }
        }
    }

    fn insert_all(&self, data: &BlockData) -> Result<(), UtxoError> {
        for tx_outputs in &data.outputs {
            for (index, (value, script)) in tx_outputs.outputs.iter().enumerate() {
                self.insert_entry(
                    OutPoint {
                        hash: tx_outputs.tx,
                        index: index as u32,
                    },
                    UtxoEntry {
                        value: *value,
                        lock_script: script.clone(),
                        height: data.height,
                        offset_in_block: tx_outputs.offset_in_block,
                    },
                )?;
            }
        }
        Ok(())
    }

    fn find(&self, tx: transaction::Hash, index: u32) -> Result<Option<UtxoEntry>, UtxoError> {
        Ok(self
            .map
            .read()
            .expect("utxo lock poisoned")
            .get(&OutPoint { hash: tx, index })
            .cloned())
    }

    fn remove(
        &self,
        tx: transaction::Hash,
        index: u32,
        _hint: Option<u64>,
    ) -> Result<Option<SpentOutput>, UtxoError> {
        let outpoint = OutPoint { hash: tx, index };
        let removed = self
            .map
            .write()
            .expect("utxo lock poisoned")
            .remove(&outpoint);
        Ok(match removed {
            Some(entry) => {
                let spent = SpentOutput {
                    height: entry.height,
                    offset_in_block: entry.offset_in_block,
                };
                self.stage_push(StageOp::Removed(outpoint, entry));
                Some(spent)
            }
            None => None,
        })
    }

    fn block_finished(&self, height: u32, hash: block::Hash) -> Result<(), UtxoError> {
        self.stage.lock().expect("stage lock poisoned").clear();
        *self.best.lock().expect("best lock poisoned") = hash;

        metrics::gauge!("state.utxo.entries", self.len() as _);
        metrics::gauge!("state.utxo.height", height as _);
        trace!(height, %hash, "utxo block finished");
        Ok(())
    }

    fn block_id(&self) -> block::Hash {
        *self.best.lock().expect("best lock poisoned")
    }

    fn rollback(&self) {
        let ops: Vec<StageOp> = {
            let mut stage = self.stage.lock().expect("stage lock poisoned");
            stage.drain(..).collect()
        };
        let mut map = self.map.write().expect("utxo lock poisoned");
        for op in ops.into_iter().rev() {
            match op {
                StageOp::Inserted(outpoint) => {
                    map.remove(&outpoint);
                }
                StageOp::Removed(outpoint, entry) => {
                    map.insert(outpoint, entry);
                }
            }
        }
    }
}
