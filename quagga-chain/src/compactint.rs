//! The Bitcoin variable-length integer ("CompactSize").
//!
//! Counts below 253 fit one byte; larger values carry a marker byte (253,
//! 254, 255) and a little-endian 2-, 4- or 8-byte payload. Decoding
//! enforces canonical form: a value that fits a shorter encoding must use
//! it. Padded encodings of the same count are a malleability vector — two
//! byte-distinct serializations of one transaction — and the reference
//! parsers reject them, so blocks accepted here re-serialize byte-exact.

use crate::{BchDeserialize, BchSerialize, SerializationError};
use byteorder::{LittleEndian, WriteBytesExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactInt(u64);

impl CompactInt {
    pub fn from(value: usize) -> CompactInt {
        CompactInt(value as u64)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// The number of bytes `value` occupies when encoded canonically.
    pub fn size(value: usize) -> usize {
        match value as u64 {
            0..=0xfc => 1,
            0xfd..=0xffff => 3,
            0x1_0000..=0xffff_ffff => 5,
            _ => 9,
        }
    }
}

impl BchSerialize for CompactInt {
    fn bch_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        match self.0 {
            0..=0xfc => target.write_all(&[self.0 as u8]),
            0xfd..=0xffff => {
                target.write_all(&[0xfd])?;
                target.write_u16::<LittleEndian>(self.0 as u16)
            }
            0x1_0000..=0xffff_ffff => {
                target.write_all(&[0xfe])?;
                target.write_u32::<LittleEndian>(self.0 as u32)
            }
            _ => {
                target.write_all(&[0xff])?;
                target.write_u64::<LittleEndian>(self.0)
            }
        }
    }
}

impl BchDeserialize for CompactInt {
    fn bch_deserialize<R: std::io::Read>(mut target: R) -> Result<CompactInt, SerializationError> {
        let marker = u8::bch_deserialize(&mut target)?;
        let (value, encoded_len) = match marker {
            0..=0xfc => return Ok(CompactInt(marker as u64)),
            0xfd => (u16::bch_deserialize(&mut target)? as u64, 3),
            0xfe => (u32::bch_deserialize(&mut target)? as u64, 5),
            0xff => (u64::bch_deserialize(&mut target)?, 9),
        };
        // Reject padded encodings of values that fit a shorter form.
        if CompactInt::size(value as usize) != encoded_len {
            return Err(SerializationError::Parse("non-canonical CompactSize"));
        }
        Ok(CompactInt(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_boundary_values() {
        for &(value, expected_len) in &[
            (0usize, 1usize),
            (252, 1),
            (253, 3),
            (65_535, 3),
            (65_536, 5),
            (4_294_967_295, 5),
            (4_294_967_296, 9),
        ] {
            let encoded = CompactInt::from(value).bch_serialize_to_vec().unwrap();
            assert_eq!(encoded.len(), expected_len, "value {}", value);
            assert_eq!(CompactInt::size(value), expected_len, "value {}", value);
            let decoded = CompactInt::bch_deserialize(&encoded[..]).unwrap();
            assert_eq!(decoded.value(), value as u64);
        }
    }

    #[test]
    fn non_canonical_encodings_are_rejected() {
        // 252 padded out to the two-byte form.
        let padded = [0xfdu8, 0xfc, 0x00];
        assert!(CompactInt::bch_deserialize(&padded[..]).is_err());

        // 65535 padded out to the four-byte form.
        let padded = [0xfeu8, 0xff, 0xff, 0x00, 0x00];
        assert!(CompactInt::bch_deserialize(&padded[..]).is_err());

        // 1 padded out to the eight-byte form.
        let padded = [0xffu8, 1, 0, 0, 0, 0, 0, 0, 0];
        assert!(CompactInt::bch_deserialize(&padded[..]).is_err());
    }
}
