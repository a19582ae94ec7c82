use std::env;

use proptest::{arbitrary::any, prelude::*, test_runner::Config};
use quagga_test::prelude::*;
use quagga_test::prelude::assert_eq;

use crate::serialization::{BchDeserializeInto, BchSerialize};
use crate::{block, parameters::Network, LedgerState};

use super::super::*;

proptest! {
    #[test]
    fn block_hash_roundtrip(hash in any::<Hash>()) {
        quagga_test::init();

        let bytes = hash.bch_serialize_to_vec()?;
        let other_hash: Hash = bytes.as_slice().bch_deserialize_into()?;

        prop_assert_eq![hash, other_hash];
    }

    #[test]
    fn block_hash_display_fromstr_roundtrip(hash in any::<Hash>()) {
        quagga_test::init();

        let display = format!("{}", hash);
        let parsed = display.parse::<Hash>().expect("hash should parse");
        prop_assert_eq!(hash, parsed);
    }
}

proptest! {
    #![proptest_config(Config::with_cases(1000))]

    #[test]
    fn blockheader_roundtrip(header in any::<Header>()) {
        quagga_test::init();

        let bytes = header.bch_serialize_to_vec().unwrap();
        prop_assert_eq![bytes.len(), Header::len()];

        let other_header: Header = bytes.as_slice().bch_deserialize_into()?;
        prop_assert_eq![header, other_header];

        // The cached hash must agree with a fresh serialize-and-hash.
        prop_assert_eq![other_header.hash(), Hash::from(&header)];
    }
}

proptest! {
    // Whole-block roundtrips serialize and rehash every transaction, so
    // the default case count stays low; PROPTEST_CASES raises it.
    #![proptest_config(Config::with_cases(env::var("PROPTEST_CASES")
                                          .ok()
                                           .and_then(|v| v.parse().ok())
                                          .unwrap_or(16)))]

    #[test]
    fn block_roundtrip(block in any::<Block>(), _network in any::<Network>()) {
        quagga_test::init();
        let bytes = block.bch_serialize_to_vec()?;

        let other_block: Block = bytes.as_slice().bch_deserialize_into()?;
        prop_assert_eq![&block, &other_block];
        prop_assert_eq![block.serialized_len(), bytes.len()];
    }
}

#[test]
fn blocks_have_coinbase() -> Result<()> {
    quagga_test::init();

    let strategy = any::<block::Height>()
        .prop_map(|tip_height| LedgerState {
            tip_height,
            is_coinbase: true,
            network: Network::Mainnet,
        })
        .prop_flat_map(Block::arbitrary_with);

    proptest!(|(blk in strategy)| {
        let has_coinbase = blk.transactions[0].is_coinbase();
        prop_assert!(has_coinbase);
    });

    Ok(())
}

#[test]
fn generated_blocks_are_coherent() -> Result<()> {
    quagga_test::init();

    let block = super::generate::valid_block(Height(5), 3);
    assert_eq!(block.transactions.len(), 4);
    assert_eq!(block.coinbase_height(), Some(Height(5)));

    let bytes = block.bch_serialize_to_vec()?;
    let reparsed: Block = bytes.as_slice().bch_deserialize_into()?;
    assert_eq!(block, reparsed);
    assert_eq!(reparsed.coinbase_height(), Some(Height(5)));
    Ok(())
}

#[test]
fn dummy_block_parses_and_hashes() -> Result<()> {
    quagga_test::init();

    let block: Block = (&quagga_test::vectors::DUMMY_BLOCK[..]).bch_deserialize_into()?;
    assert_eq!(block.transactions.len(), 1);
    assert_eq!(
        format!("{}", block.hash()),
        "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
    );

    let (computed_root, mutated) =
        merkle::root_and_mutated(&[block.transactions[0].hash()]);
    assert_eq!(computed_root, block.header.merkle_root);
    assert!(!mutated);
    Ok(())
}
