//! Undo blocks: the per-block journal that makes disconnecting a block from
//! the UTXO set possible during reorgs.

use bch_serde_derive::BchSerialize;
use quagga_chain::{transaction, BchDeserialize, BchSerialize, SerializationError};

/// One undo entry: an outpoint plus where its output lives on disk.
///
/// For a spent input this names the *previous* output that was consumed; for
/// a created output it names the output the block itself produced.
#[derive(Clone, Debug, Eq, PartialEq, BchSerialize)]
pub struct UndoItem {
    /// The transaction that produced the output.
    pub tx: transaction::Hash,
    /// The output index.
    pub index: u32,
    /// The height of the block holding the output.
    pub height: u32,
    /// The byte offset of the producing transaction inside its block.
    pub offset: u32,
}

impl BchDeserialize for UndoItem {
    fn bch_deserialize<R: std::io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(UndoItem {
            tx: transaction::Hash::bch_deserialize(&mut reader)?,
            index: u32::bch_deserialize(&mut reader)?,
            height: u32::bch_deserialize(&mut reader)?,
            offset: u32::bch_deserialize(&mut reader)?,
        })
    }
}

/// The ordered undo journal for one block.
///
/// Disconnecting the block applies the two lists in this order: every
/// `created` entry is removed from the UTXO set, then every `spent` entry is
/// re-inserted. The lists are kept separate because a block may spend an
/// output it created, and those entries would otherwise be ambiguous.
#[derive(Clone, Debug, Default, Eq, PartialEq, BchSerialize)]
pub struct UndoBlock {
    /// Outputs consumed by this block, to re-insert on disconnect.
    pub spent: Vec<UndoItem>,
    /// Outputs created by this block, to remove on disconnect.
    pub created: Vec<UndoItem>,
}

impl BchDeserialize for UndoBlock {
    fn bch_deserialize<R: std::io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(UndoBlock {
            spent: Vec::bch_deserialize(&mut reader)?,
            created: Vec::bch_deserialize(&mut reader)?,
        })
    }
}

impl UndoBlock {
    /// Merge another undo journal into this one, preserving order.
    pub fn append(&mut self, mut other: UndoBlock) {
        self.spent.append(&mut other.spent);
        self.created.append(&mut other.created);
    }

    pub fn is_empty(&self) -> bool {
        self.spent.is_empty() && self.created.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undo_block_round_trip() {
        quagga_test::init();

        let undo = UndoBlock {
            spent: vec![UndoItem {
                tx: transaction::Hash([3; 32]),
                index: 1,
                height: 10,
                offset: 81,
            }],
            created: vec![
                UndoItem {
                    tx: transaction::Hash([4; 32]),
                    index: 0,
                    height: 11,
                    offset: 81,
                },
                UndoItem {
                    tx: transaction::Hash([4; 32]),
                    index: 1,
                    height: 11,
                    offset: 81,
                },
            ],
        };

        let bytes = undo.bch_serialize_to_vec().unwrap();
        let other = UndoBlock::bch_deserialize(&bytes[..]).unwrap();
        assert_eq!(undo, other);
    }
}
