//! Chain parameters: networks, genesis constants, and the consensus
//! activation schedule.
//!
//! There is no global parameter state; a [`ChainParams`] value is threaded
//! through component constructors, and `reload-config` publishes a fresh one.

mod genesis;
mod network_upgrade;

pub use genesis::{genesis_hash, GENESIS_PREVIOUS_BLOCK_HASH};
pub use network_upgrade::{
    NetworkUpgrade, DAA_AVERAGING_WINDOW, POW_RETARGET_WINDOW, POW_TARGET_SPACING,
};

use crate::block;

/// An enum describing the possible network choices.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[cfg_attr(
    any(test, feature = "proptest-impl"),
    derive(proptest_derive::Arbitrary)
)]
pub enum Network {
    /// The production network.
    Mainnet,
    /// The test network.
    Testnet,
}

impl Default for Network {
    fn default() -> Self {
        Network::Mainnet
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Network::Mainnet => f.write_str("mainnet"),
            Network::Testnet => f.write_str("testnet"),
        }
    }
}

/// BIP 16 (pay-to-script-hash) became active on Apr 1 2012.
pub const BIP16_SWITCH_TIME: i64 = 1_333_238_400;

/// The median-time-past at which the Aug 1 2017 hard fork (UAHF) activates.
pub const UAHF_START_TIME: i64 = 1_501_590_000;

/// The window of ancestor blocks examined for version supermajorities.
pub const VERSION_MAJORITY_WINDOW: usize = 1000;

/// Consensus parameters for one network, bundled as a value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainParams {
    /// Which network these parameters describe.
    pub network: Network,
    /// The block-size accept limit, in bytes. Blocks above this (or with
    /// more transactions than this) are rejected with `bad-blk-length`.
    pub block_accept_bytes: u64,
    /// The median-time-past that latches the hf2017-08 rules on.
    pub uahf_start_time: i64,
    /// Blocks needed (out of [`VERSION_MAJORITY_WINDOW`]) to make lower
    /// header versions obsolete.
    pub version_majority_reject: usize,
    /// Blocks needed (out of [`VERSION_MAJORITY_WINDOW`]) to start enforcing
    /// the script rules tied to a header version.
    pub version_majority_enforce: usize,
}

impl ChainParams {
    pub fn new(network: Network) -> ChainParams {
        ChainParams {
            network,
            block_accept_bytes: 32_000_000,
            uahf_start_time: UAHF_START_TIME,
            version_majority_reject: match network {
                Network::Mainnet => 950,
                Network::Testnet => 750,
            },
            version_majority_enforce: match network {
                Network::Mainnet => 750,
                Network::Testnet => 510,
            },
        }
    }

    /// The hash of this network's genesis block.
    pub fn genesis_hash(&self) -> block::Hash {
        genesis_hash(self.network)
    }

    /// The activation height of `upgrade`, if it has one on this network.
    pub fn activation_height(&self, upgrade: NetworkUpgrade) -> Option<block::Height> {
        upgrade.activation_height(self.network)
    }

    /// The structural sigop accept limit for a block of `block_size` bytes:
    /// 20k sigops per started megabyte.
    pub fn sigop_accept_limit(&self, block_size: usize) -> u64 {
        let mb = (block_size.saturating_sub(1) / 1_000_000) as u64 + 1;
        mb * 20_000
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        ChainParams::new(Network::Mainnet)
    }
}

/// A summary of chain state used to generate coherent random blocks in
/// property tests.
#[cfg(any(test, feature = "proptest-impl"))]
#[derive(Copy, Clone, Debug)]
pub struct LedgerState {
    pub tip_height: block::Height,
    pub is_coinbase: bool,
    pub network: Network,
}
