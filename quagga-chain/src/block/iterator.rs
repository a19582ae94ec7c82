//! A zero-copy walk over a serialized block.
//!
//! The iterator never materializes `Transaction` structs: it steps through
//! the raw bytes yielding tagged fields, and hands out cheap `Bytes` slices
//! for scripts and whole transactions. The UTXO pre-insert pass and the
//! undo-block builder use it to learn transaction ids, output counts and
//! per-transaction offsets without a full parse.

use std::io::Write;

use bytes::Bytes;

use crate::{
    serialization::sha256d,
    transaction, SerializationError,
};

use super::Header;

/// One tagged field yielded by [`BlockIterator::next_field`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Field {
    /// The 32-byte hash of the transaction an input spends.
    PrevTxHash(transaction::Hash),
    /// The output index of the spent outpoint.
    PrevTxIndex(u32),
    /// An input's unlock script.
    InputScript(Bytes),
    /// An input's sequence number.
    Sequence(u32),
    /// An output's value, in satoshis.
    OutputValue(i64),
    /// An output's lock script.
    OutputScript(Bytes),
    /// The current transaction is complete; [`BlockIterator::prev_tx`] now
    /// refers to it.
    TxEnd,
    /// All transactions have been walked.
    End,
}

/// A borrowed view of one serialized transaction inside a block.
#[derive(Clone, Debug)]
pub struct TxRef {
    bytes: Bytes,
    offset_in_block: usize,
}

impl TxRef {
    /// The transaction id (SHA256d of the serialized bytes).
    pub fn hash(&self) -> transaction::Hash {
        let mut writer = sha256d::Writer::default();
        writer
            .write_all(&self.bytes[..])
            .expect("Sha256dWriter is infallible");
        transaction::Hash(writer.finish())
    }

    /// Offset of the first byte of this transaction within the block.
    pub fn offset_in_block(&self) -> usize {
        self.offset_in_block
    }

    /// The serialized length of this transaction.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The raw serialized transaction.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

enum State {
    TxStart,
    InputPrevHash { inputs_left: u64 },
    InputIndex { inputs_left: u64 },
    InputScript { inputs_left: u64 },
    InputSequence { inputs_left: u64 },
    OutputValue { outputs_left: u64 },
    OutputScript { outputs_left: u64 },
    LockTime,
    Finished,
}

/// Walks a serialized block, yielding [`Field`]s.
pub struct BlockIterator {
    src: Bytes,
    cursor: usize,
    txs_remaining: u64,
    tx_start: usize,
    prev_tx: Option<TxRef>,
    state: State,
}

impl BlockIterator {
    /// Start a walk over a full serialized block (header included).
    pub fn new(src: Bytes) -> Result<BlockIterator, SerializationError> {
        if src.len() < Header::len() {
            return Err(SerializationError::Parse("block shorter than its header"));
        }
        let mut iter = BlockIterator {
            src,
            cursor: Header::len(),
            txs_remaining: 0,
            tx_start: 0,
            prev_tx: None,
            state: State::TxStart,
        };
        iter.txs_remaining = iter.read_varint()?;
        Ok(iter)
    }

    /// The transaction finished by the most recent [`Field::TxEnd`].
    pub fn prev_tx(&self) -> Option<&TxRef> {
        self.prev_tx.as_ref()
    }

    /// The number of transactions the block claims to contain.
    pub fn tx_count(&self) -> u64 {
        self.txs_remaining
    }

    /// Advance to the next tagged field.
    pub fn next_field(&mut self) -> Result<Field, SerializationError> {
        loop {
            match self.state {
                State::TxStart => {
                    if self.txs_remaining == 0 {
                        self.state = State::Finished;
                        return Ok(Field::End);
                    }
                    self.tx_start = self.cursor;
                    // version
                    self.skip(4)?;
                    let inputs = self.read_varint()?;
                    if inputs == 0 {
                        let outputs = self.read_varint()?;
                        self.state = State::OutputValue {
                            outputs_left: outputs,
                        };
                    } else {
                        self.state = State::InputPrevHash {
                            inputs_left: inputs,
                        };
                    }
                }
                State::InputPrevHash { inputs_left } => {
                    let bytes = self.take(32)?;
                    let mut hash = [0u8; 32];
                    hash.copy_from_slice(&bytes[..]);
                    self.state = State::InputIndex { inputs_left };
                    return Ok(Field::PrevTxHash(transaction::Hash(hash)));
                }
                State::InputIndex { inputs_left } => {
                    let index = self.read_u32()?;
                    self.state = State::InputScript { inputs_left };
                    return Ok(Field::PrevTxIndex(index));
                }
                State::InputScript { inputs_left } => {
                    let len = self.read_varint()?;
                    let script = self.take(len as usize)?;
                    self.state = State::InputSequence { inputs_left };
                    return Ok(Field::InputScript(script));
                }
                State::InputSequence { inputs_left } => {
                    let sequence = self.read_u32()?;
                    let inputs_left = inputs_left - 1;
                    if inputs_left == 0 {
                        let outputs = self.read_varint()?;
                        self.state = State::OutputValue {
                            outputs_left: outputs,
                        };
                    } else {
                        self.state = State::InputPrevHash { inputs_left };
                    }
                    return Ok(Field::Sequence(sequence));
                }
                State::OutputValue { outputs_left } => {
                    if outputs_left == 0 {
                        self.state = State::LockTime;
                        continue;
                    }
                    let value = self.read_i64()?;
                    self.state = State::OutputScript { outputs_left };
                    return Ok(Field::OutputValue(value));
                }
                State::OutputScript { outputs_left } => {
                    let len = self.read_varint()?;
                    let script = self.take(len as usize)?;
                    self.state = State::OutputValue {
                        outputs_left: outputs_left - 1,
                    };
                    return Ok(Field::OutputScript(script));
                }
                State::LockTime => {
                    self.skip(4)?;
                    self.prev_tx = Some(TxRef {
                        bytes: self.src.slice(self.tx_start..self.cursor),
                        offset_in_block: self.tx_start,
                    });
                    self.txs_remaining -= 1;
                    self.state = State::TxStart;
                    return Ok(Field::TxEnd);
                }
                State::Finished => return Ok(Field::End),
            }
        }
    }

    fn remaining(&self) -> usize {
        self.src.len() - self.cursor
    }

    fn skip(&mut self, count: usize) -> Result<(), SerializationError> {
        if self.remaining() < count {
            return Err(SerializationError::Parse("block truncated mid-transaction"));
        }
        self.cursor += count;
        Ok(())
    }

    fn take(&mut self, count: usize) -> Result<Bytes, SerializationError> {
        if self.remaining() < count {
            return Err(SerializationError::Parse("block truncated mid-transaction"));
        }
        let bytes = self.src.slice(self.cursor..self.cursor + count);
        self.cursor += count;
        Ok(bytes)
    }

    fn read_u32(&mut self) -> Result<u32, SerializationError> {
        let bytes = self.take(4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[..]);
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i64(&mut self) -> Result<i64, SerializationError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..]);
        Ok(i64::from_le_bytes(buf))
    }

    fn read_varint(&mut self) -> Result<u64, SerializationError> {
        let first = self.take(1)?[0];
        Ok(match first {
            0..=252 => first as u64,
            253 => {
                let bytes = self.take(2)?;
                u16::from_le_bytes([bytes[0], bytes[1]]) as u64
            }
            254 => {
                let bytes = self.take(4)?;
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&bytes[..]);
                u32::from_le_bytes(buf) as u64
            }
            255 => {
                let bytes = self.take(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..]);
                u64::from_le_bytes(buf)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BchSerialize, BchDeserializeInto};

    fn walk(block: &crate::block::Block) -> Vec<Field> {
        let bytes = Bytes::from(block.bch_serialize_to_vec().unwrap());
        let mut iter = BlockIterator::new(bytes).unwrap();
        let mut fields = Vec::new();
        loop {
            let field = iter.next_field().unwrap();
            let done = field == Field::End;
            fields.push(field);
            if done {
                return fields;
            }
        }
    }

    #[test]
    fn iterator_matches_full_parse() {
        quagga_test::init();

        let block: crate::block::Block = (&quagga_test::vectors::DUMMY_BLOCK[..])
            .bch_deserialize_into()
            .expect("dummy block parses");
        let fields = walk(&block);

        let tx_ends = fields.iter().filter(|f| **f == Field::TxEnd).count();
        assert_eq!(tx_ends, block.transactions.len());

        let output_values: Vec<i64> = fields
            .iter()
            .filter_map(|f| match f {
                Field::OutputValue(v) => Some(*v),
                _ => None,
            })
            .collect();
        let expected: Vec<i64> = block
            .transactions
            .iter()
            .flat_map(|tx| tx.outputs.iter().map(|out| out.value.value()))
            .collect();
        assert_eq!(output_values, expected);
    }

    #[test]
    fn prev_tx_offsets_and_ids_match() {
        quagga_test::init();

        let block: crate::block::Block = (&quagga_test::vectors::DUMMY_BLOCK[..])
            .bch_deserialize_into()
            .expect("dummy block parses");
        let bytes = Bytes::from(block.bch_serialize_to_vec().unwrap());
        let mut iter = BlockIterator::new(bytes).unwrap();

        let mut tx_index = 0;
        let mut offset = Header::len() + 1; // one-byte varint for small blocks
        loop {
            match iter.next_field().unwrap() {
                Field::TxEnd => {
                    let tx_ref = iter.prev_tx().unwrap();
                    assert_eq!(tx_ref.offset_in_block(), offset);
                    assert_eq!(tx_ref.hash(), block.transactions[tx_index].hash());
                    offset += tx_ref.len();
                    tx_index += 1;
                }
                Field::End => break,
                _ => {}
            }
        }
        assert_eq!(tx_index, block.transactions.len());
    }

    #[test]
    fn truncated_block_reports_parse_error() {
        quagga_test::init();

        let block: crate::block::Block = (&quagga_test::vectors::DUMMY_BLOCK[..])
            .bch_deserialize_into()
            .expect("dummy block parses");
        let full = block.bch_serialize_to_vec().unwrap();
        let truncated = Bytes::from(full[..full.len() - 3].to_vec());

        let mut iter = BlockIterator::new(truncated).unwrap();
        let mut saw_error = false;
        loop {
            match iter.next_field() {
                Ok(Field::End) => break,
                Ok(_) => continue,
                Err(_) => {
                    saw_error = true;
                    break;
                }
            }
        }
        assert!(saw_error);
    }
}
