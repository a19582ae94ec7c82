use std::{iter::FromIterator, sync::Arc};

use chrono::{TimeZone, Utc};
use proptest::{arbitrary::any, collection::vec, prelude::*};

use crate::{
    cached::Cached,
    parameters::{LedgerState, Network},
    transaction::Transaction,
    transparent,
    work::difficulty::CompactDifficulty,
};

use super::{merkle, Block, Hash, Header, Height};

impl Default for LedgerState {
    fn default() -> Self {
        LedgerState {
            tip_height: Height(0),
            is_coinbase: true,
            network: Network::Mainnet,
        }
    }
}

impl Arbitrary for Header {
    type Parameters = ();

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        (
            1i32..=4,
            any::<Hash>(),
            any::<merkle::Root>(),
            // u32 timestamps only; the consensus serialization truncates
            // anything larger.
            (0u32..=u32::max_value()).prop_map(|t| Utc.timestamp(t as i64, 0)),
            any::<u32>().prop_map(CompactDifficulty),
            any::<u32>(),
        )
            .prop_map(
                |(version, previous_block_hash, merkle_root, time, difficulty_threshold, nonce)| {
                    Header::new(
                        version,
                        previous_block_hash,
                        merkle_root,
                        time,
                        difficulty_threshold,
                        nonce,
                    )
                },
            )
            .boxed()
    }

    type Strategy = BoxedStrategy<Self>;
}

impl Arbitrary for Block {
    type Parameters = LedgerState;

    fn arbitrary_with(ledger_state: Self::Parameters) -> Self::Strategy {
        let coinbase = (vec(any::<u8>(), 0..20), any::<u32>()).prop_map(move |(data, sequence)| {
            let input = transparent::Input::Coinbase {
                height: Some(Cached::from(ledger_state.tip_height)),
                data: transparent::CoinbaseData::new(data),
                sequence,
            };
            Transaction::new(
                1,
                vec![input],
                vec![],
                crate::transaction::LockTime::unlocked(),
            )
        });

        (
            any::<Header>(),
            coinbase,
            vec(any::<Transaction>(), 0..3),
        )
            .prop_map(move |(mut header, coinbase, rest)| {
                let mut transactions: Vec<Arc<Transaction>> = Vec::new();
                if ledger_state.is_coinbase {
                    transactions.push(Arc::new(coinbase));
                }
                transactions.extend(rest.into_iter().map(Arc::new));
                header.merkle_root =
                    merkle::Root::from_iter(transactions.iter().map(|tx| tx.hash()));
                Block {
                    header,
                    transactions,
                }
            })
            .boxed()
    }

    type Strategy = BoxedStrategy<Self>;
}
