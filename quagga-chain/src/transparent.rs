//! Outputs, inputs, outpoints and addresses — the value-transfer half of
//! the data model. ("Transparent" is inherited naming; on this chain there
//! is no other kind.)
#![allow(clippy::unit_arg)]

mod address;
mod script;
mod serialize;

pub use address::{Address, AddressKind, Content};
pub use script::Script;
pub use serialize::coinbase_height_script;

use crate::{cached::Cached, compactint::CompactInt, serialization::BchSerialize};
use bch_serde_derive::BchSerialize;

#[cfg(any(test, feature = "proptest-impl"))]
use proptest_derive::Arbitrary;

#[cfg(any(test, feature = "proptest-impl"))]
mod arbitrary;

use crate::{
    amount::{Amount, NonNegative},
    block, transaction,
};

/// The free-form tail of a coinbase script, after the encoded height.
///
/// Miners put anything here: pool tags, extra nonces, newspaper headlines.
/// Together with the height push it must fit the 100-byte coinbase script
/// limit, which the deserializer enforces.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct CoinbaseData(pub(crate) Vec<u8>);

impl AsRef<[u8]> for CoinbaseData {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl CoinbaseData {
    pub fn new(data: Vec<u8>) -> CoinbaseData {
        CoinbaseData(data)
    }

    pub fn serialized_size(&self) -> usize {
        CompactInt::size(self.0.len()) + self.0.len()
    }
}

impl std::fmt::Debug for CoinbaseData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let escaped = String::from_utf8(
            self.0
                .iter()
                .cloned()
                .flat_map(std::ascii::escape_default)
                .collect(),
        )
        .expect("ascii::escape_default produces utf8");
        f.debug_tuple("CoinbaseData").field(&escaped).finish()
    }
}

/// The globally unique name of one output: which transaction made it, and
/// at which position. The UTXO store is keyed by exactly this pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Hash, BchSerialize)]
pub struct OutPoint {
    /// The producing transaction.
    pub hash: transaction::Hash,

    /// The zero-based position in that transaction's output list.
    pub index: u32,
}

impl OutPoint {
    #[inline]
    pub const fn len() -> usize {
        36
    }
}

/// One input of a transaction.
///
/// On the wire both variants share a layout; a null previous hash plus an
/// all-ones index is the coinbase marker, and the deserializer splits the
/// variants on exactly that.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Input {
    /// Spends an existing unspent output.
    PrevOut {
        /// The output being consumed.
        outpoint: OutPoint,
        /// The script satisfying the consumed output's lock.
        unlock_script: Script,
        /// Relative lock-time bits (BIP 68) and replaceability signalling.
        sequence: u32,
    },
    /// New coins created by the block reward.
    Coinbase {
        /// The height of this block, encoded in the coinbase script after
        /// BIP 34 activation. Wrapped in an explicit option to make it clear
        /// that not all blocks have a height encoded.
        #[serde(skip)]
        height: Option<Cached<block::Height>>,
        /// Free data inserted by miners, after the encoded height.
        data: CoinbaseData,
        /// The sequence number for the output.
        sequence: u32,
    },
}

impl Input {
    /// The serialized length of this input, in bytes.
    pub fn len(&self) -> usize {
        match self {
            Input::PrevOut {
                ref unlock_script, ..
            } => OutPoint::len() + unlock_script.serialized_size() + 4,
            Input::Coinbase {
                height, ref data, ..
            } => {
                let height_len = height
                    .as_ref()
                    .and_then(|cached| cached.value())
                    .map(|h| serialize::height_push_len(h))
                    .unwrap_or(0);
                let script_len = height_len + data.0.len();
                OutPoint::len() + CompactInt::size(script_len) + script_len + 4
            }
        }
    }

    /// The sequence number of this input.
    pub fn sequence(&self) -> u32 {
        match self {
            Input::PrevOut { sequence, .. } => *sequence,
            Input::Coinbase { sequence, .. } => *sequence,
        }
    }
}

/// A transaction output: some value locked behind a script.
///
/// Outputs are spent whole or not at all; making change means a
/// transaction pays part of a consumed output back to its owner. The set
/// of outputs not yet consumed is exactly what the UTXO store tracks, so
/// this struct is also the value half of every entry there.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Hash, BchSerialize)]
#[cfg_attr(any(test, feature = "proptest-impl"), derive(Arbitrary))]
pub struct Output {
    /// Transaction value.
    // At https://en.bitcoin.it/wiki/Protocol_documentation#tx, this is an i64.
    pub value: Amount<NonNegative>,

    /// The lock script defines the conditions under which this output can be spent.
    pub lock_script: Script,
}

impl Output {
    /// Returns the serialized length (in bytes) of this Output
    pub fn len(&self) -> usize {
        8 + self.lock_script.serialized_size()
    }
}
