//! Context-free block checks.
//!
//! Everything here can run on any worker thread: it looks only at the
//! serialized block and the chain parameters, never at the fork tree.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Duration, Utc};

use quagga_chain::{
    block::{self, merkle, Block, Header},
    parameters::ChainParams,
    transaction::Transaction,
    work::difficulty::ExpandedDifficulty,
};

use crate::engine::EngineSettings;
use crate::error::{BlockError, TransactionError};

/// The outcome of the context-free pass.
///
/// A parse or consensus failure after the header was readable is carried in
/// `error` rather than returned: the engine still admits the header so the
/// failure can be recorded in the fork tree and propagated to descendants.
pub struct ParsedBlock {
    pub hash: block::Hash,
    pub header: Header,
    pub block: Option<Arc<Block>>,
    pub bytes: Bytes,
    pub error: Option<BlockError>,
}

impl ParsedBlock {
    pub fn is_header_only(&self) -> bool {
        self.block.is_none()
    }
}

/// The coinbase sits first, and nothing else may be one: a second coinbase
/// would mint unaccounted value, a displaced one breaks the BIP 34 height
/// check and the subsidy accounting.
pub fn coinbase_is_first(transactions: &[Arc<Transaction>]) -> Result<(), BlockError> {
    let first = transactions.get(0).ok_or(BlockError::Length(0))?;
    let mut rest = transactions.iter().skip(1);
    if !first.is_coinbase() {
        return Err(TransactionError::CoinbasePosition.into());
    }
    if rest.any(|tx| tx.contains_coinbase_input()) {
        return Err(TransactionError::CoinbaseInputFound.into());
    }
    Ok(())
}

/// Proof-of-work, context-free half: the claimed target must be
/// expressible and within the network's limit, and the header's own hash
/// must not exceed it. Whether the target is the *right* one for this
/// chain position is the contextual `bad-diffbits` check.
pub fn difficulty_is_valid(
    header: &Header,
    params: &ChainParams,
    hash: &block::Hash,
) -> Result<(), BlockError> {
    let difficulty_threshold = header
        .difficulty_threshold
        .to_expanded()
        .ok_or(BlockError::HighHash)?;

    // u256 comparisons throughout; a *greater* target means less work.
    if difficulty_threshold > ExpandedDifficulty::target_difficulty_limit(params.network) {
        return Err(BlockError::HighHash);
    }
    if hash > &difficulty_threshold {
        return Err(BlockError::HighHash);
    }
    Ok(())
}

/// The two-hours-in-the-future clock rule.
///
/// The only check in this pass that depends on the local machine rather
/// than the bytes: nodes with skewed clocks disagree about it, and
/// `time-too-new` rejections heal by themselves as the wall clock catches
/// up, which is why the failure never marks the header invalid in the
/// fork tree.
pub fn time_is_valid_at(header: &Header, now: DateTime<Utc>) -> Result<(), BlockError> {
    let two_hours_in_the_future = now
        .checked_add_signed(Duration::hours(2))
        .expect("calculating 2 hours in the future does not overflow");
    if header.time <= two_hours_in_the_future {
        Ok(())
    } else {
        Err(BlockError::TimeTooNew)
    }
}

/// Check Merkle root validity, and detect the merkle-tree duplication
/// malleability (CVE-2012-2459).
///
/// Duplicate transactions should cause a block to be rejected, as duplicate
/// transactions imply that the block contains a double-spend. The mutation
/// flag keeps an honest header from being marked permanently invalid when a
/// peer sends the wrong transaction list for it.
pub fn merkle_root_is_valid(block: &Block) -> Result<(), BlockError> {
    let hashes: Vec<_> = block.transactions.iter().map(|tx| tx.hash()).collect();
    let (root, mutated) = merkle::root_and_mutated(&hashes);

    if root != block.header.merkle_root {
        return Err(BlockError::BadMerkleRoot);
    }
    if mutated {
        return Err(BlockError::DuplicateTransaction);
    }
    Ok(())
}

/// The punishment for an oversize block grows with the overshoot.
fn oversize_punishment(size: u64, limit: u64) -> u32 {
    let excess = size.saturating_sub(limit);
    let punishment = (excess * 10 / limit) as u32;
    std::cmp::min(punishment.saturating_add(1), 100)
}

/// Structural transaction checks: inputs and outputs present.
pub fn transaction_is_well_formed(tx: &Transaction) -> Result<(), TransactionError> {
    if tx.inputs.is_empty() {
        return Err(TransactionError::NoInputs);
    }
    if tx.outputs.is_empty() {
        return Err(TransactionError::NoOutputs);
    }
    Ok(())
}

/// The full context-free pass over a serialized block.
///
/// Returns `Err` only when the bytes do not even contain a header; any
/// later failure is reported through [`ParsedBlock::error`].
pub fn checks1_no_context(
    bytes: Bytes,
    settings: &EngineSettings,
    params: &ChainParams,
    now: DateTime<Utc>,
) -> Result<ParsedBlock, BlockError> {
    if bytes.len() < Header::len() {
        return Err(BlockError::Length(0));
    }
    let header = Header::deserialize_from_buf(&bytes[..]).map_err(|_| BlockError::Length(0))?;
    let hash = header.hash();

    let mut parsed = ParsedBlock {
        hash,
        header,
        block: None,
        bytes: bytes.clone(),
        error: None,
    };

    if settings.check_pow {
        if let Err(error) = difficulty_is_valid(&header, params, &hash) {
            parsed.error = Some(error);
            return Ok(parsed);
        }
    }
    if let Err(error) = time_is_valid_at(&header, now) {
        parsed.error = Some(error);
        return Ok(parsed);
    }

    if bytes.len() == Header::len() {
        return Ok(parsed);
    }

    // Full block: parse the transactions and check structure.
    let block = match Block::deserialize_from_buf(&mut BytesMut::from(&bytes[..])) {
        Ok(block) => Arc::new(block),
        Err(_) => {
            parsed.error = Some(BlockError::Length(100));
            return Ok(parsed);
        }
    };

    if settings.check_transaction_validity {
        let result = (|| -> Result<(), BlockError> {
            if settings.check_merkle_root {
                merkle_root_is_valid(&block)?;
            }
            if block.transactions.is_empty() {
                return Err(BlockError::Length(0));
            }
            let size = bytes.len() as u64;
            if size > params.block_accept_bytes
                || block.transactions.len() as u64 > params.block_accept_bytes
            {
                return Err(BlockError::Length(oversize_punishment(
                    size,
                    params.block_accept_bytes,
                )));
            }
            // All potential-corruption validation happens before transaction
            // validation, so a wrong transaction list cannot poison the
            // header.
            coinbase_is_first(&block.transactions)?;
            for tx in block.transactions.iter() {
                transaction_is_well_formed(tx)?;
            }
            Ok(())
        })();
        if let Err(error) = result {
            parsed.error = Some(error);
        }
    }

    if parsed.error.is_none() {
        parsed.block = Some(block);
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use quagga_chain::parameters::Network;

    fn settings() -> EngineSettings {
        EngineSettings {
            check_pow: false,
            ..EngineSettings::default()
        }
    }

    fn now() -> DateTime<Utc> {
        // Well past the genesis timestamp.
        Utc.timestamp(1_300_000_000, 0)
    }

    #[test]
    fn genesis_block_passes() {
        quagga_test::init();

        let bytes = Bytes::from(quagga_test::vectors::DUMMY_BLOCK.clone());
        let params = ChainParams::new(Network::Mainnet);
        let parsed = checks1_no_context(bytes, &settings(), &params, now()).unwrap();
        assert!(parsed.error.is_none());
        assert!(!parsed.is_header_only());
        assert_eq!(parsed.hash, params.genesis_hash());
    }

    #[test]
    fn header_only_is_accepted() {
        quagga_test::init();

        let bytes = Bytes::from(quagga_test::vectors::DUMMY_HEADER.clone());
        let params = ChainParams::new(Network::Mainnet);
        let parsed = checks1_no_context(bytes, &settings(), &params, now()).unwrap();
        assert!(parsed.error.is_none());
        assert!(parsed.is_header_only());
    }

    #[test]
    fn short_block_is_rejected_outright() {
        quagga_test::init();

        let params = ChainParams::new(Network::Mainnet);
        let result = checks1_no_context(Bytes::from(vec![0u8; 79]), &settings(), &params, now());
        assert!(matches!(result, Err(BlockError::Length(0))));
    }

    #[test]
    fn future_timestamp_is_reported() {
        quagga_test::init();

        let bytes = Bytes::from(quagga_test::vectors::DUMMY_HEADER.clone());
        let params = ChainParams::new(Network::Mainnet);
        // Pretend "now" is three hours before the genesis timestamp.
        let early = Utc.timestamp(1_231_006_505 - 3 * 3600, 0);
        let parsed = checks1_no_context(bytes, &settings(), &params, early).unwrap();
        assert_eq!(parsed.error, Some(BlockError::TimeTooNew));
    }

    #[test]
    fn tampered_merkle_root_is_reported() {
        quagga_test::init();

        let mut raw = quagga_test::vectors::DUMMY_BLOCK.clone();
        // Flip a byte inside the merkle root field.
        raw[40] ^= 0x01;
        let params = ChainParams::new(Network::Mainnet);
        let parsed =
            checks1_no_context(Bytes::from(raw), &settings(), &params, now()).unwrap();
        assert_eq!(parsed.error, Some(BlockError::BadMerkleRoot));
        assert!(parsed.block.is_none());
    }

    /// A block of exactly the accept limit passes; one byte more fails.
    #[test]
    fn accept_limit_boundary() {
        quagga_test::init();

        let bytes = Bytes::from(quagga_test::vectors::DUMMY_BLOCK.clone());
        let mut params = ChainParams::new(Network::Mainnet);

        params.block_accept_bytes = bytes.len() as u64;
        let parsed = checks1_no_context(bytes.clone(), &settings(), &params, now()).unwrap();
        assert!(parsed.error.is_none());

        params.block_accept_bytes = bytes.len() as u64 - 1;
        let parsed = checks1_no_context(bytes, &settings(), &params, now()).unwrap();
        assert!(matches!(parsed.error, Some(BlockError::Length(_))));
    }

    #[test]
    fn oversize_punishment_grows_with_overshoot() {
        quagga_test::init();

        assert_eq!(oversize_punishment(32_000_001, 32_000_000), 1);
        assert_eq!(oversize_punishment(64_000_000, 32_000_000), 11);
        assert_eq!(oversize_punishment(3_200_000_000, 32_000_000), 100);
    }
}
