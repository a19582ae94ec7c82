//! Contextual block checks: everything that needs the fork tree.
//!
//! These run on the engine strand, which owns the tree, so they take plain
//! references and never block.

use primitive_types::U256;

use quagga_chain::{
    block::{Block, Height},
    parameters::{
        ChainParams, NetworkUpgrade, POW_RETARGET_WINDOW, VERSION_MAJORITY_WINDOW,
    },
    transaction::MIN_TX_SIZE_HF201811,
    transparent::{coinbase_height_script, Input},
    work::difficulty::{CompactDifficulty, ExpandedDifficulty},
};

use crate::error::{BlockError, TransactionError};
use crate::flags::ValidationFlags;
use crate::fork_tree::{ForkTree, NodeId};
use crate::script;

/// The classic retarget interval timespan, in seconds.
const POW_TARGET_TIMESPAN: i64 = POW_RETARGET_WINDOW as i64 * 600;

/// The cw-144 averaging window.
const DAA_WINDOW: i32 = 144;

/// The emergency difficulty adjustment trigger: six blocks taking longer
/// than twelve hours of median time.
const EDA_TRIGGER_SECONDS: i64 = 12 * 3600;

/// The classic every-2016-blocks retarget, with the 4x timespan clamp.
pub fn calculate_next_work_required(
    last_bits: CompactDifficulty,
    first_block_time: i64,
    last_block_time: i64,
    params: &ChainParams,
) -> CompactDifficulty {
    let mut timespan = last_block_time - first_block_time;
    if timespan < POW_TARGET_TIMESPAN / 4 {
        timespan = POW_TARGET_TIMESPAN / 4;
    }
    if timespan > POW_TARGET_TIMESPAN * 4 {
        timespan = POW_TARGET_TIMESPAN * 4;
    }

    let limit = ExpandedDifficulty::target_difficulty_limit(params.network);
    let target = match last_bits.to_expanded() {
        Some(target) => target,
        None => return limit.to_compact(),
    };

    let (scaled, overflowed) = target
        .to_u256()
        .overflowing_mul(U256::from(timespan as u64));
    let new_target = if overflowed {
        limit.to_u256()
    } else {
        scaled / U256::from(POW_TARGET_TIMESPAN as u64)
    };
    let new_target = std::cmp::min(new_target, limit.to_u256());
    ExpandedDifficulty::from_u256(new_target).to_compact()
}

/// The median-of-three block used as a window endpoint by the cw-144
/// difficulty adjustment.
fn suitable_block(tree: &ForkTree, id: NodeId) -> NodeId {
    let node = tree.get(id);
    let parent = match node.parent {
        Some(parent) => parent,
        None => return id,
    };
    let grandparent = match tree.get(parent).parent {
        Some(grandparent) => grandparent,
        None => return parent,
    };
    let mut candidates = [grandparent, parent, id];
    candidates.sort_by_key(|candidate| tree.get(*candidate).header.time);
    candidates[1]
}

/// The cw-144 difficulty adjustment active since the Nov 2017 fork:
/// work-weighted over a 144-block window with median-of-three endpoints.
fn cash_work_required(tree: &ForkTree, parent: NodeId, params: &ChainParams) -> CompactDifficulty {
    let limit = ExpandedDifficulty::target_difficulty_limit(params.network);
    let parent_height = tree.get(parent).height;
    if parent_height < DAA_WINDOW + 3 {
        return tree.get(parent).header.difficulty_threshold;
    }

    let last = suitable_block(tree, parent);
    let first_anchor = tree
        .ancestor(parent, parent_height - DAA_WINDOW)
        .expect("window fits below parent height");
    let first = suitable_block(tree, first_anchor);

    let work = tree.get(last).chain_work - tree.get(first).chain_work;
    let mut timespan =
        tree.get(last).header.time.timestamp() - tree.get(first).header.time.timestamp();
    // Sanity clamp: between half and double the expected window duration.
    timespan = timespan.max((DAA_WINDOW as i64) * 600 / 2);
    timespan = timespan.min((DAA_WINDOW as i64) * 600 * 2);

    let projected_work = work.to_u256() * U256::from(600u64) / U256::from(timespan as u64);
    if projected_work.is_zero() {
        return limit.to_compact();
    }
    // target = (2^256 - work) / work, all in the 256-bit ring.
    let target = (U256::max_value() - projected_work) / projected_work;
    let target = std::cmp::min(target, limit.to_u256());
    ExpandedDifficulty::from_u256(target).to_compact()
}

/// The difficulty a block extending `parent` must carry.
///
/// Which rule applies depends on the activation state at the new height:
/// the cw-144 adjustment after the Nov 2017 fork, the classic 2016-block
/// retarget plus the post-UAHF emergency adjustment before it.
pub fn next_work_required(
    tree: &ForkTree,
    parent: NodeId,
    params: &ChainParams,
) -> CompactDifficulty {
    let height = Height((tree.get(parent).height + 1) as u32);

    if NetworkUpgrade::DifficultyAdjustment.is_active_at(params.network, height) {
        return cash_work_required(tree, parent, params);
    }

    if height.0 % POW_RETARGET_WINDOW == 0 {
        let first = tree
            .ancestor(parent, tree.get(parent).height - (POW_RETARGET_WINDOW as i32 - 1))
            .expect("retarget windows start at a known ancestor");
        return calculate_next_work_required(
            tree.get(parent).header.difficulty_threshold,
            tree.get(first).header.time.timestamp(),
            tree.get(parent).header.time.timestamp(),
            params,
        );
    }

    let bits = tree.get(parent).header.difficulty_threshold;

    // Post-UAHF emergency difficulty adjustment: if the last six blocks took
    // more than twelve hours of median time, ease the target by 25%.
    if NetworkUpgrade::Uahf.is_active_at(params.network, height)
        && tree.get(parent).height >= 6
    {
        let six_back = tree
            .ancestor(parent, tree.get(parent).height - 6)
            .expect("six ancestors exist");
        let gap = tree.median_time_past(parent).timestamp()
            - tree.median_time_past(six_back).timestamp();
        if gap > EDA_TRIGGER_SECONDS {
            if let Some(target) = bits.to_expanded() {
                let eased = target.to_u256() + (target.to_u256() >> 2);
                let limit = ExpandedDifficulty::target_difficulty_limit(params.network);
                let eased = std::cmp::min(eased, limit.to_u256());
                return ExpandedDifficulty::from_u256(eased).to_compact();
            }
        }
    }

    bits
}

/// Whether the coinbase script starts with the serialized block height, as
/// BIP 34 requires.
fn coinbase_claims_height(block: &Block, height: Height) -> bool {
    let input = match block.transactions.get(0).and_then(|tx| tx.inputs.get(0)) {
        Some(input) => input,
        None => return false,
    };
    match input {
        Input::Coinbase { height: parsed, data, .. } => {
            // The deserializer splits a minimal height push off the script;
            // an equal parse is exact. Anything else must still start with
            // the expected push bytes.
            if let Some(parsed) = parsed.as_ref().and_then(|cached| cached.value()) {
                return parsed == height;
            }
            data.as_ref().starts_with(&coinbase_height_script(height))
        }
        _ => false,
    }
}

/// The serial, per-block contextual checks (the second validation stage).
pub fn checks2_have_parent_headers(
    tree: &ForkTree,
    node: NodeId,
    block: &Block,
    block_size: usize,
    flags: &ValidationFlags,
    params: &ChainParams,
) -> Result<(), BlockError> {
    let index = tree.get(node);
    let height = Height(index.height as u32);

    if let Some(parent) = index.parent {
        // Check proof of work against the retarget schedule.
        if index.header.difficulty_threshold != next_work_required(tree, parent, params) {
            return Err(BlockError::BadDiffBits);
        }

        // Check timestamp against the parent's median time.
        if index.header.time <= tree.median_time_past(parent) {
            return Err(BlockError::TimeTooOld);
        }

        // Reject obsolete block versions once a supermajority of the
        // network has upgraded.
        for version in &[2i32, 3, 4] {
            if index.header.version < *version
                && tree.count_versions_at_least(parent, *version, VERSION_MAJORITY_WINDOW)
                    >= params.version_majority_reject
            {
                return Err(BlockError::BadVersion);
            }
        }
    }

    // Enforce the rule that the coinbase starts with the serialized height.
    if let Some(bip34) = params.activation_height(NetworkUpgrade::Bip34) {
        if height >= bip34 && !coinbase_claims_height(block, height) {
            return Err(BlockError::BadCoinbaseHeight);
        }
    }

    // Structural sigop count, before any input resolution.
    let mut sigops = 0u64;
    for tx in block.transactions.iter() {
        sigops += script::count_sigops(tx);
    }
    if sigops > params.sigop_accept_limit(block_size) {
        return Err(BlockError::TooManySigOps);
    }

    // Impose a minimum transaction size after the Nov 2018 fork; small
    // transactions enable a leaf-node weakness in the merkle tree design.
    if flags.hf201811_active {
        for tx in block.transactions.iter() {
            if tx.len() < MIN_TX_SIZE_HF201811 {
                return Err(TransactionError::Undersize.into());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quagga_chain::parameters::Network;

    fn params() -> ChainParams {
        ChainParams::new(Network::Mainnet)
    }

    /// Test calculation of next difficulty target with no constraints
    /// applying.
    #[test]
    fn get_next_work() {
        quagga_test::init();

        // Block #30240 retarget to #32256.
        let result = calculate_next_work_required(
            CompactDifficulty(0x1d00ffff),
            1_261_130_161,
            1_262_152_739,
            &params(),
        );
        assert_eq!(result, CompactDifficulty(0x1d00d86a));
    }

    /// Test the constraint on the upper bound for next work.
    #[test]
    fn get_next_work_pow_limit() {
        quagga_test::init();

        let result = calculate_next_work_required(
            CompactDifficulty(0x1d00ffff),
            1_231_006_505,
            1_233_061_996,
            &params(),
        );
        assert_eq!(result, CompactDifficulty(0x1d00ffff));
    }

    /// Test the constraint on the lower bound for actual time taken.
    #[test]
    fn get_next_work_lower_limit_actual() {
        quagga_test::init();

        let result = calculate_next_work_required(
            CompactDifficulty(0x1c05a3f4),
            1_279_008_237,
            1_279_297_671,
            &params(),
        );
        assert_eq!(result, CompactDifficulty(0x1c0168fd));
    }

    #[test]
    fn undersize_rule_only_after_activation() {
        quagga_test::init();

        use quagga_chain::serialization::BchDeserializeInto;

        let block: Block = (&quagga_test::vectors::DUMMY_BLOCK[..])
            .bch_deserialize_into()
            .unwrap();
        let mut tree = ForkTree::new();
        let node = tree.insert(block.header, true);

        // The genesis coinbase is 204 bytes, comfortably over the minimum,
        // so the block passes with and without the rule. A tiny transaction
        // trips it only once the flag is on.
        let mut flags = ValidationFlags::default();
        assert_eq!(
            checks2_have_parent_headers(&tree, node, &block, 285, &flags, &params()),
            Ok(())
        );

        let small_tx = quagga_chain::transaction::Transaction::new(
            1,
            vec![],
            vec![],
            quagga_chain::transaction::LockTime::unlocked(),
        );
        assert!(small_tx.len() < MIN_TX_SIZE_HF201811);
        let mut small_block = block.clone();
        small_block.transactions.push(std::sync::Arc::new(small_tx));

        flags.hf201811_active = true;
        assert_eq!(
            checks2_have_parent_headers(&tree, node, &small_block, 285, &flags, &params()),
            Err(BlockError::Transaction(TransactionError::Undersize))
        );
    }

    /// The minimum-size boundary sits exactly at 100 serialized bytes.
    #[test]
    fn minimum_transaction_size_boundary() {
        quagga_test::init();

        use quagga_chain::serialization::BchDeserializeInto;
        use quagga_chain::transaction::{LockTime, Transaction};
        use quagga_chain::transparent::{Input, OutPoint, Script};
        use std::convert::TryFrom;
        use std::sync::Arc;

        // 60 bytes of fixed layout plus the input script.
        let tx_of_size = |total: usize| {
            let script_len = total - 60;
            Transaction::new(
                4,
                vec![Input::PrevOut {
                    outpoint: OutPoint {
                        hash: quagga_chain::transaction::Hash([5; 32]),
                        index: 0,
                    },
                    unlock_script: Script(vec![0x51; script_len]),
                    sequence: 0xffff_ffff,
                }],
                vec![quagga_chain::transparent::Output {
                    value: quagga_chain::amount::Amount::try_from(1).unwrap(),
                    lock_script: Script(vec![]),
                }],
                LockTime::unlocked(),
            )
        };
        assert_eq!(tx_of_size(99).len(), 99);
        assert_eq!(tx_of_size(100).len(), 100);

        let block: Block = (&quagga_test::vectors::DUMMY_BLOCK[..])
            .bch_deserialize_into()
            .unwrap();
        let mut tree = ForkTree::new();
        let node = tree.insert(block.header, true);
        let mut flags = ValidationFlags::default();
        flags.hf201811_active = true;

        let mut undersize = block.clone();
        undersize.transactions.push(Arc::new(tx_of_size(99)));
        assert_eq!(
            checks2_have_parent_headers(&tree, node, &undersize, 400, &flags, &params()),
            Err(BlockError::Transaction(TransactionError::Undersize))
        );

        let mut at_limit = block;
        at_limit.transactions.push(Arc::new(tx_of_size(100)));
        assert_eq!(
            checks2_have_parent_headers(&tree, node, &at_limit, 400, &flags, &params()),
            Ok(())
        );
    }
}
