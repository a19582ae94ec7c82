//! Hand-built blocks for tests that need structure without proptest noise.
use std::{convert::TryFrom, iter::FromIterator, sync::Arc};

use transparent::CoinbaseData;

use crate::{
    amount::{Amount, COIN},
    cached::Cached,
    serialization::BchDeserialize,
    transaction::{self, LockTime, Transaction},
    transparent,
};

use super::super::{Block, Header, Height};

/// Generate a block header from the shared dummy vector.
pub fn block_header() -> Header {
    Header::bch_deserialize(&quagga_test::vectors::DUMMY_HEADER[..]).unwrap()
}

/// A coinbase transaction claiming `height`, paying `value` satoshis to an
/// anyone-can-spend output.
pub fn coinbase_transaction(height: Height, value: i64) -> Transaction {
    let input = transparent::Input::Coinbase {
        height: Some(Cached::from(height)),
        data: CoinbaseData::new(b"generated".to_vec()),
        sequence: 0xffff_ffff,
    };
    let output = transparent::Output {
        value: Amount::try_from(value).expect("test values are in range"),
        lock_script: transparent::Script(vec![0x51]),
    };
    Transaction::new(1, vec![input], vec![output], LockTime::unlocked())
}

/// A non-coinbase transaction spending a distinct fake outpoint.
pub fn spending_transaction(salt: u8) -> Transaction {
    let input = transparent::Input::PrevOut {
        outpoint: transparent::OutPoint {
            hash: transaction::Hash([salt.wrapping_add(1); 32]),
            index: 0,
        },
        unlock_script: transparent::Script(vec![]),
        sequence: 0xffff_ffff,
    };
    let output = transparent::Output {
        value: Amount::try_from(COIN).expect("one coin is in range"),
        lock_script: transparent::Script(vec![0x51]),
    };
    Transaction::new(1, vec![input], vec![output], LockTime::unlocked())
}

/// Generate a structurally valid block at `height` with `extra_tx` dummy
/// transactions after the coinbase, with a correct merkle root.
pub fn valid_block(height: Height, extra_tx: usize) -> Block {
    let mut header = block_header();
    let coinbase = coinbase_transaction(height, 50 * COIN);

    let mut transactions = vec![Arc::new(coinbase)];
    for i in 0..extra_tx {
        transactions.push(Arc::new(spending_transaction(i as u8)));
    }

    header.merkle_root =
        crate::block::merkle::Root::from_iter(transactions.iter().map(|tx| tx.hash()));
    Block {
        header,
        transactions,
    }
}
