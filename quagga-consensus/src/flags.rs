//! Per-tip activation flags.
//!
//! A `ValidationFlags` value travels with each block being validated; it is
//! copied from the current tip's flags and advanced by `update_for_block`
//! once the block's contextual checks pass. Every transition latches: a
//! flag that turns on stays on for all descendants.

use quagga_chain::{
    block::Height,
    parameters::{ChainParams, NetworkUpgrade, BIP16_SWITCH_TIME, VERSION_MAJORITY_WINDOW},
};

use crate::fork_tree::{ForkTree, NodeId};
use crate::script::VerifyFlags;

#[derive(Copy, Clone, Debug, Default)]
pub struct ValidationFlags {
    /// BIP 16: evaluate pay-to-script-hash outputs.
    pub strict_pay_to_script_hash: bool,
    /// BIP 66: strict DER signatures.
    pub script_verify_der_sig: bool,
    /// BIP 65: CHECKLOCKTIMEVERIFY.
    pub script_verify_lock_time: bool,
    /// BIP 68/112: relative lock times and CHECKSEQUENCEVERIFY.
    pub script_verify_sequence: bool,
    /// The Aug 2017 fork rules (replay-protected sighash).
    pub hf201708_active: bool,
    /// The May 2018 fork rules (re-enabled opcodes).
    pub hf201805_active: bool,
    /// The Nov 2018 fork rules (CHECKDATASIG, CTOR, minimum tx size).
    pub hf201811_active: bool,
    /// Whether expensive input validation runs for this block. Blocks deep
    /// below the header tip skip it during initial sync.
    pub enable_validation: bool,
}

impl ValidationFlags {
    /// Advance the flags for the block at `node`.
    pub fn update_for_block(&mut self, tree: &ForkTree, node: NodeId, params: &ChainParams) {
        let index = tree.get(node);
        let parent = match index.parent {
            Some(parent) => parent,
            // Nothing activates at the genesis block.
            None => return,
        };
        let height = Height(index.height as u32);

        self.strict_pay_to_script_hash =
            self.strict_pay_to_script_hash || index.header.time.timestamp() >= BIP16_SWITCH_TIME;

        // Version-gated soft forks turn on once enough of the last 1000
        // ancestors carry the newer version.
        if !self.script_verify_der_sig
            && index.header.version >= 3
            && tree.count_versions_at_least(parent, 3, VERSION_MAJORITY_WINDOW)
                >= params.version_majority_enforce
        {
            self.script_verify_der_sig = true;
        }
        if !self.script_verify_lock_time
            && index.header.version >= 4
            && tree.count_versions_at_least(parent, 4, VERSION_MAJORITY_WINDOW)
                >= params.version_majority_enforce
        {
            self.script_verify_lock_time = true;
        }

        if !self.script_verify_sequence
            && NetworkUpgrade::Csv.is_active_at(params.network, height)
        {
            self.script_verify_sequence = true;
        }

        // The 2017 fork latches on median-time-past.
        if !self.hf201708_active
            && tree.median_time_past(node).timestamp() >= params.uahf_start_time
        {
            self.hf201708_active = true;
        }

        if !self.hf201805_active
            && NetworkUpgrade::Monolith.is_active_at(params.network, height)
        {
            self.hf201805_active = true;
        }
        if !self.hf201811_active
            && NetworkUpgrade::MagneticAnomaly.is_active_at(params.network, height)
        {
            self.hf201811_active = true;
        }
    }

    /// The script-verification flag set this activation state implies.
    pub fn script_flags(&self) -> VerifyFlags {
        let mut flags = VerifyFlags::empty();
        if self.strict_pay_to_script_hash {
            flags |= VerifyFlags::P2SH;
        }
        if self.script_verify_der_sig {
            flags |= VerifyFlags::DERSIG;
        }
        if self.script_verify_lock_time {
            flags |= VerifyFlags::CHECKLOCKTIMEVERIFY;
        }
        if self.script_verify_sequence {
            flags |= VerifyFlags::CHECKSEQUENCEVERIFY;
        }
        if self.hf201708_active {
            flags |= VerifyFlags::SIGHASH_FORKID | VerifyFlags::STRICTENC;
        }
        if self.hf201805_active {
            flags |= VerifyFlags::MONOLITH_OPCODES;
        }
        if self.hf201811_active {
            flags |= VerifyFlags::CHECKDATASIG
                | VerifyFlags::SIGPUSHONLY
                | VerifyFlags::CLEANSTACK
                // Implied requirement of CLEANSTACK.
                | VerifyFlags::P2SH;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use quagga_chain::{
        block::{merkle, Header},
        parameters::{ChainParams, Network, UAHF_START_TIME},
        work::difficulty::CompactDifficulty,
    };

    fn chain_with_times(times: &[i64]) -> (ForkTree, Vec<NodeId>) {
        let mut tree = ForkTree::new();
        let mut prev = quagga_chain::block::Hash([0; 32]);
        let mut ids = Vec::new();
        for (i, time) in times.iter().enumerate() {
            let header = Header::new(
                4,
                prev,
                merkle::Root([0; 32]),
                Utc.timestamp(*time, 0),
                CompactDifficulty(0x207f_ffff),
                i as u32,
            );
            prev = header.hash();
            ids.push(tree.insert(header, i == 0));
        }
        (tree, ids)
    }

    #[test]
    fn uahf_latches_on_median_time_past() {
        quagga_test::init();

        let params = ChainParams::new(Network::Mainnet);
        // Times straddle the fork time: the median crosses at the tip.
        let times: Vec<i64> = (0..12).map(|i| UAHF_START_TIME - 3000 + i * 600).collect();
        let (tree, ids) = chain_with_times(&times);

        let mut flags = ValidationFlags::default();
        flags.update_for_block(&tree, ids[6], &params);
        assert!(!flags.hf201708_active);

        flags.update_for_block(&tree, ids[11], &params);
        assert!(flags.hf201708_active);

        // BIP16 has long been active at these times.
        assert!(flags.strict_pay_to_script_hash);
        let script_flags = flags.script_flags();
        assert!(script_flags.contains(VerifyFlags::SIGHASH_FORKID));
        assert!(script_flags.contains(VerifyFlags::P2SH));
        assert!(!script_flags.contains(VerifyFlags::CHECKDATASIG));
    }
}
