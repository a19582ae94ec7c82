//! Network upgrade consensus parameters for Bitcoin-Cash.

use NetworkUpgrade::*;

use crate::block;
use crate::parameters::{Network, Network::*};

use std::collections::BTreeMap;
use std::ops::Bound::*;

/// A Bitcoin-Cash network upgrade.
///
/// Network upgrades can change the network protocol or consensus rules in
/// incompatible ways. Upgrades before the Aug 2017 chain split are inherited
/// from Bitcoin.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum NetworkUpgrade {
    /// The Bitcoin protocol at the Genesis block, before any softforks had
    /// been implemented.
    Genesis,
    /// [`BIP 34`](https://github.com/bitcoin/bips/blob/master/bip-0034.mediawiki):
    /// blocks must contain their height in the coinbase input, and version 1
    /// blocks are no longer accepted.
    Bip34,
    /// [`BIP 66`](https://github.com/bitcoin/bips/blob/master/bip-0066.mediawiki):
    /// strict DER signatures, and version 2 blocks are no longer accepted.
    Bip66,
    /// [`BIP 65`](https://github.com/bitcoin/bips/blob/master/bip-0065.mediawiki):
    /// CHECKLOCKTIMEVERIFY, and version 3 blocks are no longer accepted.
    Bip65,
    /// [`BIP 112`](https://github.com/bitcoin/bips/blob/master/bip-0112.mediawiki):
    /// CHECKSEQUENCEVERIFY plus BIP 68 relative lock times.
    Csv,
    /// The Aug 1 2017 hard fork (UAHF) that split Bitcoin-Cash from Bitcoin:
    /// replay-protected signature hashing and the larger block size.
    ///
    /// Activation is latched by median-time-past at run time; the height
    /// here is the buried result of that latch.
    Uahf,
    /// The Nov 13 2017 hard fork replacing the emergency difficulty
    /// adjustment with the cw-144 difficulty adjustment algorithm.
    DifficultyAdjustment,
    /// The May 15 2018 hard fork ("hf2018-05"): 32 MB blocks and re-enabled
    /// opcodes.
    Monolith,
    /// The Nov 15 2018 hard fork ("hf2018-11"): CHECKDATASIG, canonical
    /// transaction ordering, and the 100-byte minimum transaction size.
    MagneticAnomaly,
}

/// Mainnet network upgrade activation heights.
///
/// This is actually a bijective map, but it is const, so we use a vector, and
/// do the uniqueness check in the unit tests.
pub(crate) const MAINNET_ACTIVATION_HEIGHTS: &[(block::Height, NetworkUpgrade)] = &[
    (block::Height(0), Genesis),
    (block::Height(227_931), Bip34),
    (block::Height(363_725), Bip66),
    (block::Height(388_381), Bip65),
    (block::Height(419_328), Csv),
    (block::Height(478_559), Uahf),
    (block::Height(504_031), DifficultyAdjustment),
    (block::Height(530_359), Monolith),
    (block::Height(556_767), MagneticAnomaly),
];

/// Testnet network upgrade activation heights.
///
/// This is actually a bijective map, but it is const, so we use a vector, and
/// do the uniqueness check in the unit tests.
pub(crate) const TESTNET_ACTIVATION_HEIGHTS: &[(block::Height, NetworkUpgrade)] = &[
    (block::Height(0), Genesis),
    (block::Height(21_111), Bip34),
    (block::Height(330_776), Bip66),
    (block::Height(581_885), Bip65),
    (block::Height(770_112), Csv),
    (block::Height(1_155_876), Uahf),
    (block::Height(1_188_697), DifficultyAdjustment),
    (block::Height(1_233_070), Monolith),
    (block::Height(1_267_996), MagneticAnomaly),
];

/// The target block spacing, in seconds.
pub const POW_TARGET_SPACING: i64 = 10 * 60;

/// The number of blocks in the classic retarget window.
pub const POW_RETARGET_WINDOW: u32 = 2016;

/// The number of blocks averaged by the cw-144 difficulty adjustment.
pub const DAA_AVERAGING_WINDOW: u32 = 144;

impl NetworkUpgrade {
    /// Returns a BTreeMap of activation heights and network upgrades for
    /// `network`.
    ///
    /// This is actually a bijective map.
    pub(crate) fn activation_list(network: Network) -> BTreeMap<block::Height, NetworkUpgrade> {
        match network {
            Mainnet => MAINNET_ACTIVATION_HEIGHTS,
            Testnet => TESTNET_ACTIVATION_HEIGHTS,
        }
        .iter()
        .cloned()
        .collect()
    }

    /// Returns the current network upgrade for `network` and `height`.
    pub fn current(network: Network, height: block::Height) -> NetworkUpgrade {
        NetworkUpgrade::activation_list(network)
            .range(..=height)
            .map(|(_, nu)| *nu)
            .next_back()
            .expect("every height has a current network upgrade")
    }

    /// Returns the next network upgrade for `network` and `height`.
    pub fn next(network: Network, height: block::Height) -> Option<NetworkUpgrade> {
        NetworkUpgrade::activation_list(network)
            .range((Excluded(height), Unbounded))
            .map(|(_, nu)| *nu)
            .next()
    }

    /// Returns the activation height for this network upgrade on `network`.
    pub fn activation_height(&self, network: Network) -> Option<block::Height> {
        NetworkUpgrade::activation_list(network)
            .iter()
            .filter(|(_, nu)| nu == &self)
            .map(|(height, _)| *height)
            .next()
    }

    /// Returns true if this upgrade is active at `height` on `network`.
    pub fn is_active_at(&self, network: Network, height: block::Height) -> bool {
        match self.activation_height(network) {
            Some(activation) => height >= activation,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn activation_heights_are_unique() {
        quagga_test::init();

        for table in &[MAINNET_ACTIVATION_HEIGHTS, TESTNET_ACTIVATION_HEIGHTS] {
            let heights: HashSet<_> = table.iter().map(|(h, _)| h).collect();
            let upgrades: HashSet<_> = table.iter().map(|(_, nu)| nu).collect();
            assert_eq!(heights.len(), table.len());
            assert_eq!(upgrades.len(), table.len());
        }
    }

    #[test]
    fn upgrades_are_ordered() {
        quagga_test::init();

        assert_eq!(
            NetworkUpgrade::current(Mainnet, block::Height(0)),
            Genesis
        );
        assert_eq!(
            NetworkUpgrade::current(Mainnet, block::Height(556_767)),
            MagneticAnomaly
        );
        assert_eq!(
            NetworkUpgrade::current(Mainnet, block::Height(556_766)),
            Monolith
        );
        assert_eq!(NetworkUpgrade::next(Mainnet, block::Height(556_767)), None);
        assert!(MagneticAnomaly.is_active_at(Mainnet, block::Height(600_000)));
        assert!(!MagneticAnomaly.is_active_at(Mainnet, block::Height(500_000)));
    }
}
