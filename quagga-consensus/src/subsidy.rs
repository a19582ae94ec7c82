//! Block subsidies and halvings.

use std::convert::TryFrom;

use quagga_chain::{
    amount::{Amount, Error, NonNegative},
    block::Height,
    parameters::Network,
};

/// The subsidy halves each time the chain grows by this many blocks.
pub const HALVING_INTERVAL: Height = Height(210_000);

/// The genesis-era block subsidy: 50 coins, in satoshis.
pub const MAX_BLOCK_SUBSIDY: u64 = 5_000_000_000;

/// The coins a block at `height` may mint, before fees.
///
/// A right-shift per halving, rounding down at every step, and pinned to
/// zero from the 64th halving on (where the shift width would exceed the
/// integer). Finalization checks the coinbase payout against this plus the
/// block's collected fees.
pub fn block_subsidy(height: Height, _network: Network) -> Result<Amount<NonNegative>, Error> {
    let halvings = height.0 / HALVING_INTERVAL.0;
    if halvings >= 64 {
        return Amount::try_from(0);
    }
    let subsidy = MAX_BLOCK_SUBSIDY >> (halvings as u64);
    Amount::try_from(subsidy as i64)
}

#[cfg(test)]
mod test {
    use super::*;
    use color_eyre::Report;

    #[test]
    fn block_subsidy_test() -> Result<(), Report> {
        quagga_test::init();

        block_subsidy_for_network(Network::Mainnet)?;
        block_subsidy_for_network(Network::Testnet)?;

        Ok(())
    }

    fn block_subsidy_for_network(network: Network) -> Result<(), Report> {
        // The initial block subsidy is 50 coins
        assert_eq!(
            Amount::try_from(5_000_000_000i64),
            block_subsidy(Height(0), network)
        );

        // After the second halving, it's 12.5 coins
        assert_eq!(
            Amount::try_from(1_250_000_000i64),
            block_subsidy(Height(HALVING_INTERVAL.0 * 2), network)
        );

        // After the 15th halving, it's 152_587 satoshis
        assert_eq!(
            Amount::try_from(152_587i64),
            block_subsidy(Height(HALVING_INTERVAL.0 * 15), network)
        );

        // After the 32nd halving, the block subsidy is 1 satoshi
        // Check that the block subsidy is calculated correctly at the limit
        assert_eq!(
            Amount::try_from(1i64),
            block_subsidy(Height(HALVING_INTERVAL.0 * 32), network)
        );

        // After the 33rd halving, there is no block subsidy
        // Check that there are no errors
        assert_eq!(
            Amount::try_from(0i64),
            block_subsidy(Height(HALVING_INTERVAL.0 * 33), network)
        );

        assert_eq!(
            Amount::try_from(0i64),
            block_subsidy(Height(HALVING_INTERVAL.0 * 63), network)
        );

        Ok(())
    }
}
