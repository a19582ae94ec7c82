//! Serialization for transparent inputs and outputs, including the BIP 34
//! coinbase height encoding.

use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    block::Height,
    cached::Cached,
    compactint::CompactInt,
    serialization::{BchDeserialize, BchSerialize, SerializationError},
};

use super::{CoinbaseData, Input, OutPoint, Script};

/// The index used by coinbase inputs in place of a real outpoint.
const COINBASE_PREV_INDEX: u32 = 0xffff_ffff;

/// The serialized script prefix a BIP 34 coinbase must start with: the block
/// height as a minimal script number push.
pub fn coinbase_height_script(height: Height) -> Vec<u8> {
    let n = height.0 as i64;
    match n {
        0 => vec![0x00],
        // OP_1 through OP_16
        1..=16 => vec![0x50 + n as u8],
        _ => {
            let mut le = Vec::with_capacity(5);
            let mut value = n;
            while value > 0 {
                le.push((value & 0xff) as u8);
                value >>= 8;
            }
            // Add a sign-padding byte when the top bit is set, per script
            // number encoding.
            if le.last().copied().unwrap_or(0) & 0x80 != 0 {
                le.push(0);
            }
            let mut script = Vec::with_capacity(1 + le.len());
            script.push(le.len() as u8);
            script.extend_from_slice(&le);
            script
        }
    }
}

/// The number of bytes `coinbase_height_script` occupies for `height`.
pub(super) fn height_push_len(height: Height) -> usize {
    coinbase_height_script(height).len()
}

/// Attempt to split a coinbase script into (height, remaining data).
///
/// Only accepts encodings that round-trip through
/// [`coinbase_height_script`], so a parsed-then-reserialized input is
/// byte-identical.
fn parse_height_push(script: &[u8]) -> Option<(Height, usize)> {
    let first = *script.first()?;
    let (height, consumed) = match first {
        0x00 => (0u32, 1),
        0x51..=0x60 => ((first - 0x50) as u32, 1),
        1..=5 => {
            let len = first as usize;
            if script.len() < 1 + len {
                return None;
            }
            let mut value: i64 = 0;
            for (i, byte) in script[1..1 + len].iter().enumerate() {
                value |= (*byte as i64) << (8 * i);
            }
            if value < 0 || value > Height::MAX.0 as i64 {
                return None;
            }
            (value as u32, 1 + len)
        }
        _ => return None,
    };
    let height = Height(height);
    if coinbase_height_script(height) != script[..consumed] {
        return None;
    }
    Some((height, consumed))
}

impl BchSerialize for Input {
    fn bch_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        match self {
            Input::PrevOut {
                outpoint,
                unlock_script,
                sequence,
            } => {
                outpoint.bch_serialize(&mut writer)?;
                unlock_script.bch_serialize(&mut writer)?;
                writer.write_u32::<LittleEndian>(*sequence)?;
            }
            Input::Coinbase {
                height,
                data,
                sequence,
            } => {
                writer.write_all(&[0; 32])?;
                writer.write_u32::<LittleEndian>(COINBASE_PREV_INDEX)?;
                let height_bytes = height
                    .as_ref()
                    .and_then(|cached| cached.value())
                    .map(coinbase_height_script)
                    .unwrap_or_default();
                CompactInt::from(height_bytes.len() + data.0.len())
                    .bch_serialize(&mut writer)?;
                writer.write_all(&height_bytes)?;
                writer.write_all(&data.0)?;
                writer.write_u32::<LittleEndian>(*sequence)?;
            }
        }
        Ok(())
    }
}

impl BchDeserialize for Input {
    fn bch_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let prev_hash = <[u8; 32]>::bch_deserialize(&mut reader)?;
        let prev_index = reader.read_u32::<LittleEndian>()?;

        if prev_hash == [0; 32] && prev_index == COINBASE_PREV_INDEX {
            let len = CompactInt::bch_deserialize(&mut reader)?.value();
            if len > 100 {
                return Err(SerializationError::Parse("coinbase script is too long"));
            }
            let mut script = vec![0; len as usize];
            reader.read_exact(&mut script)?;
            let sequence = reader.read_u32::<LittleEndian>()?;

            let (height, data) = match parse_height_push(&script) {
                Some((height, consumed)) => (
                    Some(Cached::from(height)),
                    CoinbaseData(script[consumed..].to_vec()),
                ),
                None => (None, CoinbaseData(script)),
            };
            Ok(Input::Coinbase {
                height,
                data,
                sequence,
            })
        } else {
            Ok(Input::PrevOut {
                outpoint: OutPoint {
                    hash: crate::transaction::Hash(prev_hash),
                    index: prev_index,
                },
                unlock_script: Script::bch_deserialize(&mut reader)?,
                sequence: reader.read_u32::<LittleEndian>()?,
            })
        }
    }
}

impl BchDeserialize for OutPoint {
    fn bch_deserialize<R: Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(OutPoint {
            hash: crate::transaction::Hash::bch_deserialize(&mut reader)?,
            index: reader.read_u32::<LittleEndian>()?,
        })
    }
}

impl BchDeserialize for super::Output {
    fn bch_deserialize<R: Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(super::Output {
            value: crate::amount::Amount::bch_deserialize(&mut reader)?,
            lock_script: Script::bch_deserialize(&mut reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_pushes_are_minimal_and_round_trip() {
        quagga_test::init();

        for height in &[0u32, 1, 16, 17, 255, 256, 478_559, 556_767] {
            let height = Height(*height);
            let script = coinbase_height_script(height);
            let (parsed, consumed) = parse_height_push(&script).expect("round trips");
            assert_eq!(parsed, height);
            assert_eq!(consumed, script.len());
        }
    }

    #[test]
    fn coinbase_input_round_trip_preserves_bytes() {
        quagga_test::init();

        let input = Input::Coinbase {
            height: Some(Cached::from(Height(556_767))),
            data: CoinbaseData(b"quagga".to_vec()),
            sequence: 0xffff_ffff,
        };
        let bytes = input.bch_serialize_to_vec().unwrap();
        let reparsed = Input::bch_deserialize(&bytes[..]).unwrap();
        let bytes2 = reparsed.bch_serialize_to_vec().unwrap();
        assert_eq!(bytes, bytes2);

        match reparsed {
            Input::Coinbase { height, data, .. } => {
                assert_eq!(height.unwrap().value(), Some(Height(556_767)));
                assert_eq!(data.as_ref(), b"quagga");
            }
            _ => panic!("coinbase input reparsed as PrevOut"),
        }
    }

    #[test]
    fn non_minimal_height_stays_in_data() {
        quagga_test::init();

        // A two-byte push of the value 1 is not minimal, so it must not be
        // interpreted as a height.
        let mut script = vec![0x02, 0x01, 0x00];
        script.extend_from_slice(b"tail");
        assert!(parse_height_push(&script).is_none());
    }
}
