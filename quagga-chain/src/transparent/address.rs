//! CashAddr addresses.
//!
//! Bitcoin-Cash addresses are Bech32-style strings: a lowercase prefix
//! identifying the network, a `:` separator, and a base-32 payload carrying
//! a version byte, the hash, and a 40-bit BCH checksum. The checksum
//! polynomial guarantees detection of up to 5 errors within a window of 160
//! characters, plus any burst of up to 8 errors.

use std::fmt;

use ripemd160::{Digest, Ripemd160};
use secp256k1::PublicKey;
use sha2::{Digest as Sha2Digest, Sha256};
use thiserror::Error;

#[cfg(test)]
use proptest::{arbitrary::Arbitrary, collection::vec, prelude::*};

use crate::parameters::Network;

use super::Script;

/// The cashaddr character set for encoding.
const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// The cashaddr character set for decoding.
#[rustfmt::skip]
const CHARSET_REV: [i8; 128] = [
    -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1,
    -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1,
    -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, 15, -1, 10, 17, 21, 20, 26, 30,  7,
     5, -1, -1, -1, -1, -1, -1, -1, 29, -1, 24, 13, 25,  9,  8, 23, -1, 18, 22,
    31, 27, 19, -1,  1,  0,  3, 16, 11, 28, 12, 14,  6,  4,  2, -1, -1, -1, -1,
    -1, -1, 29, -1, 24, 13, 25,  9,  8, 23, -1, 18, 22, 31, 27, 19, -1,  1,  0,
     3, 16, 11, 28, 12, 14,  6,  4,  2, -1, -1, -1, -1, -1,
];

/// What an address pays to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AddressKind {
    /// Pay to the hash of a public key.
    PubKeyHash,
    /// Pay to the hash of a redeem script.
    ScriptHash,
}

impl AddressKind {
    fn type_bits(self) -> u8 {
        match self {
            AddressKind::PubKeyHash => 0,
            AddressKind::ScriptHash => 1,
        }
    }
}

/// The decoded content of an address: its kind and raw hash bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Content {
    pub kind: AddressKind,
    pub hash: Vec<u8>,
}

/// A Bitcoin-Cash address: a network plus decoded content.
#[derive(Clone, Eq, PartialEq)]
pub struct Address {
    /// Production or test network, selecting the string prefix.
    pub network: Network,
    /// The address payload.
    pub content: Content,
}

/// Errors produced while decoding a CashAddr string.
#[derive(Error, Debug, PartialEq)]
pub enum AddressError {
    /// upper- and lowercase characters mixed in one address
    #[error("upper- and lowercase characters mixed in one address")]
    MixedCase,
    /// a character outside the cashaddr set, or a misplaced separator
    #[error("a character outside the cashaddr set, or a misplaced separator")]
    InvalidCharacter,
    /// the checksum does not verify
    #[error("the checksum does not verify")]
    BadChecksum,
    /// the prefix does not belong to the expected network
    #[error("the prefix does not belong to the expected network")]
    PrefixMismatch,
    /// the payload is empty
    #[error("the payload is empty")]
    Empty,
    /// the payload carries non-zero padding bits
    #[error("the payload carries non-zero padding bits")]
    BadPadding,
    /// the reserved high bit of the version byte is set
    #[error("the reserved high bit of the version byte is set")]
    ReservedBit,
    /// the version byte names an unknown address kind
    #[error("the version byte names an unknown address kind")]
    UnknownKind,
    /// the hash length does not match the version byte's size code
    #[error("the hash length does not match the version byte's size code")]
    HashLength,
}

/// The string prefix for `network`.
pub fn prefix_for(network: Network) -> &'static str {
    match network {
        Network::Mainnet => "bitcoincash",
        Network::Testnet => "bchtest",
    }
}

/// Compute what 8 5-bit values to XOR into the last 8 input values to make
/// the checksum zero. The input is interpreted as the coefficients of a
/// polynomial over GF(32) with an implicit leading 1; the output packs the
/// remainder mod the cashaddr generator, post-XORed with 1 so that appending
/// zeros to a valid string never yields another valid string.
fn polymod(values: &[u8]) -> u64 {
    let mut c: u64 = 1;
    for &d in values {
        let c0 = (c >> 35) as u8;
        c = ((c & 0x0007_ffff_ffff) << 5) ^ (d as u64);
        if c0 & 0x01 != 0 {
            c ^= 0x0098_f2bc_8e61;
        }
        if c0 & 0x02 != 0 {
            c ^= 0x0079_b76d_99e2;
        }
        if c0 & 0x04 != 0 {
            c ^= 0x00f3_3e5f_b3c4;
        }
        if c0 & 0x08 != 0 {
            c ^= 0x00ae_2eab_e2a8;
        }
        if c0 & 0x10 != 0 {
            c ^= 0x001e_4f43_e470;
        }
    }
    c ^ 1
}

/// Expand the address prefix for the checksum computation: the low 5 bits of
/// each character, followed by a zero separator.
fn expand_prefix(prefix: &str) -> Vec<u8> {
    let mut ret: Vec<u8> = prefix.bytes().map(|b| b & 0x1f).collect();
    ret.push(0);
    ret
}

fn verify_checksum(prefix: &str, payload: &[u8]) -> bool {
    let mut values = expand_prefix(prefix);
    values.extend_from_slice(payload);
    polymod(&values) == 0
}

fn create_checksum(prefix: &str, payload: &[u8]) -> [u8; 8] {
    let mut values = expand_prefix(prefix);
    values.extend_from_slice(payload);
    values.extend_from_slice(&[0; 8]);
    let polymod = polymod(&values);
    let mut checksum = [0u8; 8];
    for (i, item) in checksum.iter_mut().enumerate() {
        *item = ((polymod >> (5 * (7 - i))) & 0x1f) as u8;
    }
    checksum
}

/// Pack content into 5-bit groups: `(type << 3) | size_code` version byte,
/// then the hash, regrouped from 8-bit to 5-bit with zero padding.
fn pack_content(content: &Content) -> Result<Vec<u8>, AddressError> {
    let size_code: u8 = match content.hash.len() * 8 {
        160 => 0,
        192 => 1,
        224 => 2,
        256 => 3,
        320 => 4,
        384 => 5,
        448 => 6,
        512 => 7,
        _ => return Err(AddressError::HashLength),
    };
    let version_byte = (content.kind.type_bits() << 3) | size_code;
    let mut data = Vec::with_capacity(content.hash.len() + 1);
    data.push(version_byte);
    data.extend_from_slice(&content.hash);

    bech32::convert_bits(&data, 8, 5, true).map_err(|_| AddressError::HashLength)
}

impl Address {
    /// Encode this address into its canonical lowercase string form.
    pub fn encode(&self) -> String {
        let prefix = prefix_for(self.network);
        let payload =
            pack_content(&self.content).expect("constructed addresses have valid hash lengths");
        let checksum = create_checksum(prefix, &payload);

        let mut out = String::with_capacity(prefix.len() + 1 + payload.len() + 8);
        out.push_str(prefix);
        out.push(':');
        for five in payload.iter().chain(checksum.iter()) {
            out.push(CHARSET[*five as usize] as char);
        }
        out
    }

    /// Decode a CashAddr string, defaulting to `network`'s prefix when the
    /// string carries none.
    pub fn decode(addr: &str, network: Network) -> Result<Address, AddressError> {
        let expected_prefix = prefix_for(network);

        // Scan the string: classify characters and locate the separator.
        let bytes = addr.as_bytes();
        let mut lower = false;
        let mut upper = false;
        let mut has_number = false;
        let mut prefix_size = 0usize;
        for (i, &c) in bytes.iter().enumerate() {
            match c {
                b'a'..=b'z' => lower = true,
                b'A'..=b'Z' => upper = true,
                b'0'..=b'9' => has_number = true,
                b':' => {
                    // The separator cannot be the first character, the prefix
                    // cannot contain a number, and there must not be two
                    // separators.
                    if has_number || i == 0 || prefix_size != 0 {
                        return Err(AddressError::InvalidCharacter);
                    }
                    prefix_size = i;
                }
                _ => return Err(AddressError::InvalidCharacter),
            }
        }
        if upper && lower {
            return Err(AddressError::MixedCase);
        }

        let prefix: String = if prefix_size == 0 {
            expected_prefix.to_string()
        } else {
            let p: String = addr[..prefix_size].to_ascii_lowercase();
            prefix_size += 1;
            p
        };

        let mut values = Vec::with_capacity(bytes.len() - prefix_size);
        for &c in &bytes[prefix_size..] {
            if c > 127 || CHARSET_REV[c as usize] == -1 {
                return Err(AddressError::InvalidCharacter);
            }
            values.push(CHARSET_REV[c as usize] as u8);
        }

        if !verify_checksum(&prefix, &values) {
            return Err(AddressError::BadChecksum);
        }
        if prefix != expected_prefix {
            return Err(AddressError::PrefixMismatch);
        }

        let payload = &values[..values.len().saturating_sub(8)];
        if payload.is_empty() {
            return Err(AddressError::Empty);
        }

        // Check that the padding is zero.
        let extra_bits = payload.len() * 5 % 8;
        if extra_bits >= 5 {
            return Err(AddressError::BadPadding);
        }
        let last = *payload.last().expect("payload is non-empty");
        let mask = (1u8 << extra_bits) - 1;
        if last & mask != 0 {
            return Err(AddressError::BadPadding);
        }

        let data =
            bech32::convert_bits(payload, 5, 8, false).map_err(|_| AddressError::BadPadding)?;

        let version = data[0];
        if version & 0x80 != 0 {
            return Err(AddressError::ReservedBit);
        }
        let kind = match (version >> 3) & 0x1f {
            0 => AddressKind::PubKeyHash,
            1 => AddressKind::ScriptHash,
            _ => return Err(AddressError::UnknownKind),
        };
        let mut hash_size = 20 + 4 * (version & 0x03) as usize;
        if version & 0x04 != 0 {
            hash_size *= 2;
        }
        if data.len() != hash_size + 1 {
            return Err(AddressError::HashLength);
        }

        Ok(Address {
            network,
            content: Content {
                kind,
                hash: data[1..].to_vec(),
            },
        })
    }

    /// The sha256 of the canonical output script this address pays to,
    /// as consumed by the address indexer.
    ///
    /// Only defined for 160-bit hashes, the only lengths with a canonical
    /// P2PKH/P2SH script form.
    pub fn hashed_output_script(&self) -> Option<[u8; 32]> {
        if self.content.hash.len() != 20 {
            return None;
        }
        let mut hasher = Sha256::new();
        match self.content.kind {
            AddressKind::PubKeyHash => {
                // OP_DUP OP_HASH160, 20-byte push
                hasher.update(&[0x76, 0xa9, 20]);
                hasher.update(&self.content.hash);
                // OP_EQUALVERIFY OP_CHECKSIG
                hasher.update(&[0x88, 0xac]);
            }
            AddressKind::ScriptHash => {
                // OP_HASH160, 20-byte push
                hasher.update(&[0xa9, 20]);
                hasher.update(&self.content.hash);
                // OP_EQUAL
                hasher.update(&[0x87]);
            }
        }
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Some(out)
    }

    /// A hash of an address payload: sha256 then ripemd160, always exactly
    /// 20 bytes.
    fn hash_payload(bytes: &[u8]) -> Vec<u8> {
        let sha_hash = Sha256::digest(bytes);
        let ripe_hash = Ripemd160::digest(&sha_hash);
        ripe_hash.to_vec()
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Address")
            .field("network", &self.network)
            .field("kind", &self.content.kind)
            .field("hash", &hex::encode(&self.content.hash))
            .finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl std::str::FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Address::decode(s, Network::Mainnet) {
            Err(AddressError::PrefixMismatch) => Address::decode(s, Network::Testnet),
            other => other,
        }
    }
}

pub trait ToAddressWithNetwork {
    /// Convert `self` to an `Address`, given the current `network`.
    fn to_address(&self, network: Network) -> Address;
}

impl ToAddressWithNetwork for Script {
    fn to_address(&self, network: Network) -> Address {
        Address {
            network,
            content: Content {
                kind: AddressKind::ScriptHash,
                hash: Address::hash_payload(&self.0[..]),
            },
        }
    }
}

impl ToAddressWithNetwork for PublicKey {
    fn to_address(&self, network: Network) -> Address {
        Address {
            network,
            content: Content {
                kind: AddressKind::PubKeyHash,
                hash: Address::hash_payload(&self.serialize()[..]),
            },
        }
    }
}

#[cfg(test)]
impl Arbitrary for Address {
    type Parameters = ();

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        (
            any::<bool>(),
            prop_oneof![Just(AddressKind::PubKeyHash), Just(AddressKind::ScriptHash)],
            vec(any::<u8>(), 20),
        )
            .prop_map(|(mainnet, kind, hash)| Address {
                network: if mainnet {
                    Network::Mainnet
                } else {
                    Network::Testnet
                },
                content: Content { kind, hash },
            })
            .boxed()
    }

    type Strategy = BoxedStrategy<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // The published cashaddr test payload.
    const VECTOR_HASH: &str = "f5bf48b397dae70be82b3cca4793f8eb2b6cdac9";

    fn vector_content(kind: AddressKind) -> Content {
        Content {
            kind,
            hash: hex::decode(VECTOR_HASH).unwrap(),
        }
    }

    #[test]
    fn p2pkh_vector_encodes() {
        quagga_test::init();

        let addr = Address {
            network: Network::Mainnet,
            content: vector_content(AddressKind::PubKeyHash),
        };
        assert_eq!(
            addr.encode(),
            "bitcoincash:qr6m7j9njldwwzlg9v7v53unlr4jkmx6eylep8ekg2"
        );
    }

    #[test]
    fn p2sh_vector_encodes() {
        quagga_test::init();

        let addr = Address {
            network: Network::Mainnet,
            content: vector_content(AddressKind::ScriptHash),
        };
        assert_eq!(
            addr.encode(),
            "bitcoincash:pr6m7j9njldwwzlg9v7v53unlr4jkmx6ey65nvtks5"
        );
    }

    #[test]
    fn decode_accepts_uppercase_but_not_mixed() {
        quagga_test::init();

        let lower = "bitcoincash:qr6m7j9njldwwzlg9v7v53unlr4jkmx6eylep8ekg2";
        let upper = lower.to_ascii_uppercase();
        assert!(Address::decode(&upper, Network::Mainnet).is_ok());

        let mut mixed = lower.to_string();
        mixed.replace_range(12..13, "Q");
        assert_eq!(
            Address::decode(&mixed, Network::Mainnet),
            Err(AddressError::MixedCase)
        );
    }

    #[test]
    fn decode_rejects_wrong_prefix_and_duplicate_separator() {
        quagga_test::init();

        let addr = Address {
            network: Network::Testnet,
            content: vector_content(AddressKind::PubKeyHash),
        };
        let encoded = addr.encode();
        assert!(encoded.starts_with("bchtest:"));
        assert_eq!(
            Address::decode(&encoded, Network::Mainnet),
            Err(AddressError::PrefixMismatch)
        );

        assert_eq!(
            Address::decode("bitcoin:cash:qqqq", Network::Mainnet),
            Err(AddressError::InvalidCharacter)
        );
    }

    #[test]
    fn decode_without_prefix_uses_default() {
        quagga_test::init();

        let addr = Address {
            network: Network::Mainnet,
            content: vector_content(AddressKind::PubKeyHash),
        };
        let encoded = addr.encode();
        let no_prefix = encoded.split(':').nth(1).unwrap();
        let decoded = Address::decode(no_prefix, Network::Mainnet).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn pubkey_and_script_conversions_round_trip() {
        quagga_test::init();

        let pub_key = PublicKey::from_slice(&[
            4, 80, 134, 58, 214, 74, 135, 174, 138, 47, 232, 60, 26, 241, 168, 64, 60, 181, 63,
            83, 228, 134, 216, 81, 29, 173, 138, 4, 136, 126, 91, 35, 82, 44, 212, 112, 36, 52,
            83, 162, 153, 250, 158, 119, 35, 119, 22, 16, 58, 188, 17, 161, 223, 56, 133, 94, 214,
            242, 238, 24, 126, 156, 88, 43, 166,
        ])
        .expect("A PublicKey from slice");

        let addr = pub_key.to_address(Network::Mainnet);
        assert_eq!(addr.content.kind, AddressKind::PubKeyHash);
        assert_eq!(addr.content.hash.len(), 20);
        let decoded = Address::decode(&addr.encode(), Network::Mainnet).unwrap();
        assert_eq!(decoded, addr);

        let script = Script(vec![0; 20]);
        let addr = script.to_address(Network::Testnet);
        assert_eq!(addr.content.kind, AddressKind::ScriptHash);
        assert!(addr.encode().starts_with("bchtest:p"));
    }

    #[test]
    fn hashed_output_script_differs_by_kind() {
        quagga_test::init();

        let p2pkh = Address {
            network: Network::Mainnet,
            content: vector_content(AddressKind::PubKeyHash),
        };
        let p2sh = Address {
            network: Network::Mainnet,
            content: vector_content(AddressKind::ScriptHash),
        };
        let a = p2pkh.hashed_output_script().unwrap();
        let b = p2sh.hashed_output_script().unwrap();
        assert_ne!(a, b);
    }
}

#[cfg(test)]
proptest! {
    #[test]
    fn cashaddr_roundtrip(addr in any::<Address>()) {
        quagga_test::init();

        let encoded = addr.encode();
        let decoded = Address::decode(&encoded, addr.network).expect("encoded addresses decode");

        prop_assert_eq![addr, decoded];
    }

    #[test]
    fn single_mutation_fails_decode(
        addr in any::<Address>(),
        position in 0usize..42,
        replacement in 0usize..32,
    ) {
        quagga_test::init();

        let encoded = addr.encode();
        let prefix_len = encoded.find(':').unwrap() + 1;
        let payload_len = encoded.len() - prefix_len;
        let index = prefix_len + (position % payload_len);

        let old = encoded.as_bytes()[index];
        let new = CHARSET[replacement];
        prop_assume!(old != new);

        let mut mutated = encoded.into_bytes();
        mutated[index] = new;
        let mutated = String::from_utf8(mutated).unwrap();

        prop_assert!(Address::decode(&mutated, addr.network).is_err());
    }
}
