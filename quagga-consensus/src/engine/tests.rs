//! End-to-end engine scenarios over an in-memory state.

use std::iter::FromIterator;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Duration as ChronoDuration;

use quagga_chain::{
    amount::{Amount, COIN},
    block::{merkle, Block, Header, Height},
    cached::Cached,
    parameters::{ChainParams, Network},
    serialization::{BchDeserializeInto, BchSerialize},
    transaction::{self, LockTime, Transaction},
    transparent::{CoinbaseData, Input, OutPoint, Output, Script},
};
use quagga_state::{MemoryBlockSource, UnspentOutputs, UtxoStore};

use super::*;
use crate::error::TransactionError;

struct Harness {
    engine: ValidationEngine,
    utxo: Arc<UnspentOutputs>,
    mempool: Arc<Mempool>,
    events: tokio::sync::broadcast::Receiver<Event>,
}

fn harness() -> Harness {
    quagga_test::init();

    let blocks = Arc::new(MemoryBlockSource::new());
    let utxo = Arc::new(UnspentOutputs::new(blocks.clone()));
    let mempool = Arc::new(Mempool::new());
    let notifier = Notifier::new(4096);
    let events = notifier.subscribe();

    let settings = EngineSettings {
        check_pow: false,
        ..EngineSettings::default()
    };
    let handles = EngineHandles::new(
        utxo.clone(),
        blocks.clone(),
        mempool.clone(),
        notifier,
    );
    let engine = ValidationEngine::spawn(ChainParams::new(Network::Mainnet), settings, handles);
    Harness {
        engine,
        utxo,
        mempool,
        events,
    }
}

fn genesis_block() -> Block {
    (&quagga_test::vectors::DUMMY_BLOCK[..])
        .bch_deserialize_into()
        .expect("genesis vector parses")
}

fn coinbase(height: u32, value: i64, salt: u8) -> Transaction {
    use std::convert::TryFrom;
    let input = Input::Coinbase {
        height: Some(Cached::from(Height(height))),
        data: CoinbaseData::new(vec![b'q', salt]),
        sequence: 0xffff_ffff,
    };
    let output = Output {
        value: Amount::try_from(value).expect("test values are in range"),
        lock_script: Script(vec![0x51]),
    };
    Transaction::new(1, vec![input], vec![output], LockTime::unlocked())
}

fn spending_tx(prev: transaction::Hash, value_out: i64) -> Transaction {
    use std::convert::TryFrom;
    let input = Input::PrevOut {
        outpoint: OutPoint {
            hash: prev,
            index: 0,
        },
        unlock_script: Script(vec![]),
        sequence: 0xffff_ffff,
    };
    let output = Output {
        value: Amount::try_from(value_out).expect("test values are in range"),
        lock_script: Script(vec![0x51]),
    };
    Transaction::new(1, vec![input], vec![output], LockTime::unlocked())
}

/// A child block of `parent` at `height`, with valid timestamps, inherited
/// difficulty bits, and a correct merkle root.
fn next_block(parent: &Header, height: u32, salt: u8, extra: Vec<Transaction>) -> Block {
    let mut transactions = vec![Arc::new(coinbase(height, 50 * COIN, salt))];
    transactions.extend(extra.into_iter().map(Arc::new));

    let mut header = Header::new(
        4,
        parent.hash(),
        merkle::Root([0; 32]),
        parent.time + ChronoDuration::seconds(600),
        parent.difficulty_threshold,
        height,
    );
    header.merkle_root = merkle::Root::from_iter(transactions.iter().map(|tx| tx.hash()));
    Block {
        header,
        transactions,
    }
}

fn block_bytes(block: &Block) -> Bytes {
    Bytes::from(block.bch_serialize_to_vec().expect("blocks serialize"))
}

async fn submit(engine: &ValidationEngine, block: &Block) -> Result<block::Hash, BlockError> {
    engine.submit_block(block_bytes(block), None).await
}

fn drain_events(events: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// S1 — headers-only extension: the header chain advances while the active
/// chain stays at genesis.
#[tokio::test(flavor = "multi_thread")]
async fn headers_only_extension() {
    let harness = harness();
    let genesis = genesis_block();
    submit(&harness.engine, &genesis).await.expect("genesis connects");

    let mut parent = genesis.header;
    for height in 1..=10u32 {
        let block = next_block(&parent, height, 0, vec![]);
        let header_bytes =
            Bytes::from(block.header.bch_serialize_to_vec().expect("headers serialize"));
        harness
            .engine
            .submit_block(header_bytes, None)
            .await
            .expect("headers are accepted");
        parent = block.header;
    }

    let status = harness.engine.status().await.unwrap();
    assert_eq!(status.header_height, 10);
    assert_eq!(status.active_height, 0);
    assert_eq!(status.awaiting_bodies, 10);
}

/// S2 — a linear chain of full blocks fully validates and commits.
#[tokio::test(flavor = "multi_thread")]
async fn linear_full_chain() {
    let harness = harness();
    let genesis = genesis_block();
    submit(&harness.engine, &genesis).await.expect("genesis connects");

    let mut parent = genesis.header;
    let mut last_hash = genesis.hash();
    for height in 1..=20u32 {
        let block = next_block(&parent, height, 0, vec![]);
        last_hash = submit(&harness.engine, &block).await.expect("block connects");
        parent = block.header;
    }

    let status = harness.engine.status().await.unwrap();
    assert_eq!(status.active_height, 20);
    assert_eq!(status.header_height, 20);
    assert_eq!(harness.utxo.block_id(), last_hash);
    // One unspent coinbase output per non-genesis block.
    assert_eq!(harness.utxo.len(), 20);
}

/// S3 — a heavier side chain takes over; disconnected transactions are
/// re-admitted to the mempool.
#[tokio::test(flavor = "multi_thread")]
async fn simple_reorg() {
    let mut harness = harness();
    let genesis = genesis_block();
    submit(&harness.engine, &genesis).await.expect("genesis connects");

    let mut blocks = vec![genesis];
    for height in 1..=18u32 {
        let block = next_block(&blocks[height as usize - 1].header, height, 0, vec![]);
        submit(&harness.engine, &block).await.expect("block connects");
        blocks.push(block);
    }

    // Blocks 19 and 20 each confirm one spend of an old coinbase.
    let spend_19 = spending_tx(blocks[5].transactions[0].hash(), 49 * COIN);
    let spend_20 = spending_tx(blocks[6].transactions[0].hash(), 49 * COIN);
    let block_19 = next_block(&blocks[18].header, 19, 0, vec![spend_19.clone()]);
    submit(&harness.engine, &block_19).await.expect("block 19 connects");
    let block_20 = next_block(&block_19.header, 20, 0, vec![spend_20.clone()]);
    submit(&harness.engine, &block_20).await.expect("block 20 connects");
    assert!(harness.mempool.is_empty());

    // A heavier fork from block 18: three empty blocks.
    let fork_19 = next_block(&blocks[18].header, 19, 9, vec![]);
    let fork_20 = next_block(&fork_19.header, 20, 9, vec![]);
    let fork_21 = next_block(&fork_20.header, 21, 9, vec![]);

    let engine = harness.engine.clone();
    let bytes = block_bytes(&fork_19);
    let pending_19 = tokio::spawn(async move { engine.submit_block(bytes, None).await });
    let engine = harness.engine.clone();
    let bytes = block_bytes(&fork_20);
    let pending_20 = tokio::spawn(async move { engine.submit_block(bytes, None).await });

    let new_tip = submit(&harness.engine, &fork_21)
        .await
        .expect("the fork takes over");
    pending_19.await.unwrap().expect("fork block 19 connects");
    pending_20.await.unwrap().expect("fork block 20 connects");

    let status = harness.engine.status().await.unwrap();
    assert_eq!(status.active_height, 21);
    assert_eq!(new_tip, fork_21.hash());
    assert_eq!(harness.utxo.block_id(), fork_21.hash());

    // Both disconnected spends went back to the mempool.
    assert!(harness.mempool.contains(&spend_19.hash()));
    assert!(harness.mempool.contains(&spend_20.hash()));

    // Disconnecting and re-applying left exactly the new chain's outputs:
    // 18 shared coinbases (the spent ones restored by the undo data) plus
    // the 3 fork coinbases.
    assert_eq!(harness.utxo.len(), 21);

    let events = drain_events(&mut harness.events);
    let out_of_block: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::TxSyncedOutOfBlock(tx) => Some(tx.hash()),
            _ => None,
        })
        .collect();
    assert!(out_of_block.contains(&spend_19.hash()));
    assert!(out_of_block.contains(&spend_20.hash()));
}

/// S4 — an invalid middle block poisons its subtree and the header chain
/// rolls back to the last valid block.
#[tokio::test(flavor = "multi_thread")]
async fn invalid_middle_block() {
    let harness = harness();
    let genesis = genesis_block();
    submit(&harness.engine, &genesis).await.expect("genesis connects");

    let mut parent = genesis.header;
    for height in 1..=13u32 {
        let block = next_block(&parent, height, 0, vec![]);
        submit(&harness.engine, &block).await.expect("block connects");
        parent = block.header;
    }

    // Block 14 carries a second coinbase.
    let mut bad_block = next_block(&parent, 14, 0, vec![]);
    let second_coinbase = coinbase(14, COIN, 77);
    bad_block.transactions.push(Arc::new(second_coinbase));
    bad_block.header.merkle_root =
        merkle::Root::from_iter(bad_block.transactions.iter().map(|tx| tx.hash()));

    let failure = submit(&harness.engine, &bad_block)
        .await
        .expect_err("duplicate coinbase is rejected");
    assert_eq!(failure.code(), "bad-cb-multiple");
    assert_eq!(
        failure,
        BlockError::Transaction(TransactionError::CoinbaseInputFound)
    );

    // Descendants of the bad block are rejected as bad-parent.
    let mut parent = bad_block.header;
    for height in 15..=20u32 {
        let block = next_block(&parent, height, 0, vec![]);
        let failure = submit(&harness.engine, &block)
            .await
            .expect_err("children of an invalid block fail");
        assert_eq!(failure, BlockError::BadParent);
        parent = block.header;
    }

    let status = harness.engine.status().await.unwrap();
    assert_eq!(status.header_height, 13);
    assert_eq!(status.active_height, 13);
}

/// S5 — an orphan waits for its parent and both finalize in height order.
#[tokio::test(flavor = "multi_thread")]
async fn orphan_then_parent() {
    let mut harness = harness();
    let genesis = genesis_block();
    submit(&harness.engine, &genesis).await.expect("genesis connects");

    let parent_block = next_block(&genesis.header, 1, 0, vec![]);
    let orphan_block = next_block(&parent_block.header, 2, 0, vec![]);

    let engine = harness.engine.clone();
    let bytes = block_bytes(&orphan_block);
    let orphan_pending = tokio::spawn(async move { engine.submit_block(bytes, None).await });

    // Let the orphan reach the pool before its parent shows up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = harness.engine.status().await.unwrap();
    assert_eq!(status.orphans, 1);

    submit(&harness.engine, &parent_block)
        .await
        .expect("parent connects");
    orphan_pending
        .await
        .unwrap()
        .expect("orphan connects after adoption");

    let status = harness.engine.status().await.unwrap();
    assert_eq!(status.active_height, 2);
    assert_eq!(status.orphans, 0);

    // Confirmation events arrive parent first.
    let events = drain_events(&mut harness.events);
    let confirmed: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::AllTransactionsInBlock(block) => Some(block.hash()),
            _ => None,
        })
        .collect();
    let parent_position = confirmed
        .iter()
        .position(|hash| *hash == parent_block.hash())
        .expect("parent was confirmed");
    let orphan_position = confirmed
        .iter()
        .position(|hash| *hash == orphan_block.hash())
        .expect("orphan was confirmed");
    assert!(parent_position < orphan_position);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_rejects_new_work() {
    let harness = harness();
    harness.engine.shutdown();
    let failure = submit(&harness.engine, &genesis_block())
        .await
        .expect_err("submissions after shutdown fail");
    assert_eq!(failure, BlockError::Shutdown);
}

/// CTOR: equal or descending txids after the coinbase fail the pre-insert
/// scan once the Nov 2018 rules are on.
#[tokio::test(flavor = "multi_thread")]
async fn ctor_ordering_is_enforced() {
    quagga_test::init();

    let tx_a = spending_tx(transaction::Hash([1; 32]), COIN);
    let tx_b = spending_tx(transaction::Hash([2; 32]), COIN);
    let mut low_first = vec![Arc::new(tx_a.clone()), Arc::new(tx_b.clone())];
    low_first.sort_by_key(|tx| tx.hash());
    let (low, high) = (low_first[0].clone(), low_first[1].clone());

    let build = |order: Vec<Arc<Transaction>>| {
        let mut transactions = vec![Arc::new(coinbase(1, 50 * COIN, 0))];
        transactions.extend(order);
        let genesis = genesis_block();
        let mut header = Header::new(
            4,
            genesis.hash(),
            merkle::Root([0; 32]),
            genesis.header.time + ChronoDuration::seconds(600),
            genesis.header.difficulty_threshold,
            1,
        );
        header.merkle_root = merkle::Root::from_iter(transactions.iter().map(|tx| tx.hash()));
        let block = Block {
            header,
            transactions,
        };
        block_bytes(&block)
    };

    let mut flags = ValidationFlags::default();
    flags.hf201811_active = true;

    // Ascending txids pass the scan.
    assert!(Inner::scan_block(&build(vec![low.clone(), high.clone()]), 1, &flags).is_ok());

    // Descending txids fail.
    let failure = Inner::scan_block(&build(vec![high.clone(), low.clone()]), 1, &flags)
        .expect_err("descending txids violate CTOR");
    assert_eq!(failure, BlockError::NotCtorOrdered);

    // Two equal txids fail the same way.
    let failure = Inner::scan_block(&build(vec![low.clone(), low.clone()]), 1, &flags)
        .expect_err("equal txids violate CTOR");
    assert_eq!(failure, BlockError::NotCtorOrdered);

    // Without the fork flag the scan accepts any order.
    let relaxed = ValidationFlags::default();
    assert!(Inner::scan_block(&build(vec![high, low]), 1, &relaxed).is_ok());
}
