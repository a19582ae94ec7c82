//! Shared byte vectors for serialization and validation tests.

use lazy_static::lazy_static;

/// The Bitcoin mainnet genesis block, which Bitcoin-Cash inherits.
///
/// Header (80 bytes), a one-byte transaction count, and the single coinbase
/// transaction.
const GENESIS_BLOCK_HEX: &str = concat!(
    // header
    "01000000",
    "0000000000000000000000000000000000000000000000000000000000000000",
    "3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a",
    "29ab5f49",
    "ffff001d",
    "1dac2b7c",
    // tx count
    "01",
    // coinbase transaction
    "01000000",
    "01",
    "0000000000000000000000000000000000000000000000000000000000000000",
    "ffffffff",
    "4d",
    "04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368",
    "616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c",
    "6f757420666f722062616e6b73",
    "ffffffff",
    "01",
    "00f2052a01000000",
    "43",
    "4104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61",
    "deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf1",
    "1d5fac",
    "00000000",
);

lazy_static! {
    /// A full serialized block (the genesis block).
    pub static ref DUMMY_BLOCK: Vec<u8> =
        hex::decode(GENESIS_BLOCK_HEX).expect("hard-coded hex is valid");

    /// A serialized 80-byte block header.
    pub static ref DUMMY_HEADER: Vec<u8> = DUMMY_BLOCK[..80].to_vec();

    /// A serialized transaction (the genesis coinbase).
    pub static ref DUMMY_TX1: Vec<u8> = DUMMY_BLOCK[81..].to_vec();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_lengths() {
        assert_eq!(DUMMY_BLOCK.len(), 285);
        assert_eq!(DUMMY_HEADER.len(), 80);
        assert_eq!(DUMMY_TX1.len(), 204);
    }
}
