//! Block difficulty data structures and calculations.
//!
//! The block difficulty "target threshold" is stored in the block header as a
//! 32-bit `CompactDifficulty` (the classic `nBits` field). The `block::Hash`
//! must be less than or equal to the `ExpandedDifficulty` threshold, when
//! both are interpreted as 256-bit integers in little-endian byte order.

use std::{cmp::Ordering, fmt, ops::Add};

use primitive_types::U256;

use crate::{block, parameters::Network, BchDeserialize, BchSerialize, SerializationError};

/// A 32-bit "compact bits" value, as used in Bitcoin.
///
/// Bitcoin calculates block difficulty by comparing the block hash with an
/// expanded 256-bit threshold. The compact form is a base-256 floating point
/// encoding of that threshold: the top byte is an exponent (in bytes), the
/// low 23 bits a mantissa, and bit 23 a (consensus-invalid) sign bit.
#[derive(Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Hash)]
pub struct CompactDifficulty(pub u32);

/// A 256-bit unsigned "expanded difficulty" value.
///
/// Valid block hashes are less than or equal to this threshold. Greater
/// values represent *less* work.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct ExpandedDifficulty(U256);

/// A 256-bit unsigned "block work" value: `2^256 / (target + 1)`.
///
/// Chain work is the sum of the block work of every block on a path from
/// genesis, and is what the fork tree maximizes when picking the best header
/// tip.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct Work(U256);

/// The mantissa sign bit. Set mantissas are invalid in block headers.
const SIGN_BIT: u32 = 0x0080_0000;

/// The lower 23 mantissa bits.
const UNSIGNED_MANTISSA_MASK: u32 = 0x007f_ffff;

impl CompactDifficulty {
    /// Calculate the ExpandedDifficulty for a compact representation.
    ///
    /// Returns None for negative, zero, or overflowing targets, all of which
    /// are invalid in block headers.
    pub fn to_expanded(self) -> Option<ExpandedDifficulty> {
        if self.0 & SIGN_BIT != 0 {
            return None;
        }
        let mantissa = self.0 & UNSIGNED_MANTISSA_MASK;
        if mantissa == 0 {
            return None;
        }
        let exponent = self.0 >> 24;

        let result = if exponent <= 3 {
            U256::from(mantissa >> (8 * (3 - exponent)))
        } else {
            let shift = 8 * (exponent - 3) as usize;
            if shift >= 256 {
                return None;
            }
            let value = U256::from(mantissa);
            let shifted = value << shift;
            if (shifted >> shift) != value {
                return None;
            }
            shifted
        };

        if result.is_zero() {
            None
        } else {
            Some(ExpandedDifficulty(result))
        }
    }

    /// Calculate the Work for a compact representation, if it is valid.
    pub fn to_work(self) -> Option<Work> {
        self.to_expanded().and_then(|expanded| expanded.to_work())
    }
}

impl fmt::Debug for CompactDifficulty {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("CompactDifficulty")
            .field(&format_args!("{:#010x}", self.0))
            .finish()
    }
}

impl BchSerialize for CompactDifficulty {
    fn bch_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error> {
        self.0.bch_serialize(target)
    }
}

impl BchDeserialize for CompactDifficulty {
    fn bch_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(CompactDifficulty(u32::bch_deserialize(reader)?))
    }
}

impl ExpandedDifficulty {
    /// The minimum difficulty (maximum target) accepted on `network`.
    ///
    /// Both networks use the classic Bitcoin limit:
    /// `0x00000000ffff0000...00`.
    pub fn target_difficulty_limit(_network: Network) -> ExpandedDifficulty {
        let limit = U256::from(0xffffu64) << (8 * (0x1d - 3));
        ExpandedDifficulty(limit)
    }

    /// Calculate the CompactDifficulty for an expanded difficulty.
    pub fn to_compact(self) -> CompactDifficulty {
        let mut size = (self.0.bits() + 7) / 8;
        let mut compact: u64 = if size <= 3 {
            self.0.low_u64() << (8 * (3 - size))
        } else {
            (self.0 >> (8 * (size - 3))).low_u64()
        };
        // Mantissas with the sign bit set are invalid, borrow an exponent byte.
        if compact & (SIGN_BIT as u64) != 0 {
            compact >>= 8;
            size += 1;
        }
        CompactDifficulty(((size as u32) << 24) | (compact as u32 & UNSIGNED_MANTISSA_MASK))
    }

    /// Calculate the Work for this difficulty: `2^256 / (target + 1)`.
    pub fn to_work(self) -> Option<Work> {
        if self.0 == U256::max_value() {
            return None;
        }
        // 2^256 / (x + 1) == ~x / (x + 1) + 1, keeping everything in 256 bits.
        let work = (!self.0) / (self.0 + 1) + 1;
        Some(Work(work))
    }

    /// The raw 256-bit target value.
    pub fn to_u256(self) -> U256 {
        self.0
    }

    /// Build an expanded difficulty directly from a 256-bit target.
    pub fn from_u256(value: U256) -> ExpandedDifficulty {
        ExpandedDifficulty(value)
    }
}

impl fmt::Debug for ExpandedDifficulty {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut buf = [0u8; 32];
        self.0.to_big_endian(&mut buf);
        f.debug_tuple("ExpandedDifficulty")
            .field(&hex::encode(buf))
            .finish()
    }
}

impl From<block::Hash> for U256 {
    fn from(hash: block::Hash) -> Self {
        U256::from_little_endian(&hash.0)
    }
}

impl PartialEq<ExpandedDifficulty> for block::Hash {
    fn eq(&self, other: &ExpandedDifficulty) -> bool {
        U256::from(*self) == other.0
    }
}

impl PartialOrd<ExpandedDifficulty> for block::Hash {
    fn partial_cmp(&self, other: &ExpandedDifficulty) -> Option<Ordering> {
        U256::from(*self).partial_cmp(&other.0)
    }
}

impl PartialEq<block::Hash> for ExpandedDifficulty {
    fn eq(&self, other: &block::Hash) -> bool {
        other == self
    }
}

impl PartialOrd<block::Hash> for ExpandedDifficulty {
    fn partial_cmp(&self, other: &block::Hash) -> Option<Ordering> {
        self.0.partial_cmp(&U256::from(*other))
    }
}

impl Work {
    /// The zero work value, used for the fork-tree root.
    pub fn zero() -> Work {
        Work(U256::zero())
    }

    /// The raw 256-bit work value.
    pub fn to_u256(self) -> U256 {
        self.0
    }
}

impl Add for Work {
    type Output = Work;

    fn add(self, rhs: Work) -> Work {
        Work(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::AddAssign for Work {
    fn add_assign(&mut self, rhs: Work) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for Work {
    type Output = Work;

    fn sub(self, rhs: Work) -> Work {
        Work(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Work").field(&self.0).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The classic mainnet limit, 0x1d00ffff.
    const POW_LIMIT_BITS: u32 = 0x1d00ffff;

    #[test]
    fn compact_round_trips_through_expanded() {
        quagga_test::init();

        for bits in &[POW_LIMIT_BITS, 0x1c05a3f4, 0x1b04864c, 0x207fffff] {
            let compact = CompactDifficulty(*bits);
            let expanded = compact.to_expanded().expect("valid test vectors");
            assert_eq!(expanded.to_compact(), compact, "bits {:#x}", bits);
        }
    }

    #[test]
    fn invalid_compact_values_rejected() {
        quagga_test::init();

        // Zero mantissa, negative mantissa, overflowing exponent.
        assert!(CompactDifficulty(0).to_expanded().is_none());
        assert!(CompactDifficulty(0x1d800000).to_expanded().is_none());
        assert!(CompactDifficulty(0xff123456).to_expanded().is_none());
    }

    #[test]
    fn pow_limit_matches_compact_form() {
        quagga_test::init();

        let limit = ExpandedDifficulty::target_difficulty_limit(Network::Mainnet);
        assert_eq!(limit.to_compact(), CompactDifficulty(POW_LIMIT_BITS));
    }

    #[test]
    fn easier_targets_have_less_work() {
        quagga_test::init();

        let easy = CompactDifficulty(POW_LIMIT_BITS).to_work().unwrap();
        let hard = CompactDifficulty(0x1c05a3f4).to_work().unwrap();
        assert!(hard > easy);

        let sum = easy + hard;
        assert!(sum > hard);
    }

    #[test]
    fn hash_ordering_against_target() {
        quagga_test::init();

        let target = CompactDifficulty(POW_LIMIT_BITS).to_expanded().unwrap();
        let zero_hash = block::Hash([0; 32]);
        let max_hash = block::Hash([0xff; 32]);

        assert!(zero_hash < target);
        assert!(max_hash > target);
    }
}
