//! Consensus-critical serialization.
//!
//! `BchSerialize` and `BchDeserialize` cover the Satoshi formats this node
//! actually reads and writes: blocks, transactions, and undo data. They are
//! deliberately narrower than a general Bitcoin codec — the legacy p2p
//! message encodings (network addresses, inventory strings, service bits)
//! are not part of this node's surface, whose external wire is the framed
//! transport with its own tag-value codec.
//!
//! All integers are little-endian, counted collections use a CompactSize
//! prefix, and deserialization never trusts an announced length further
//! than the bytes that actually follow it.

mod deserialize;
mod error;

pub mod sha256d;

use std::{convert::TryFrom, sync::Arc};

use chrono::{DateTime, Utc};

pub use deserialize::{BchDeserialize, BchDeserializeInto};
pub use error::SerializationError;

use crate::compactint::CompactInt;
use byteorder::{LittleEndian, WriteBytesExt};

pub trait BchSerialize {
    fn bch_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error>;

    fn bch_serialize_to_vec(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut data = Vec::new();
        self.bch_serialize(&mut data)?;
        Ok(data)
    }
}

macro_rules! impl_serializable_le_int {
    ($($ty:ty => $write:ident),+ $(,)?) => {
        $(
            impl BchSerialize for $ty {
                fn bch_serialize<W: std::io::Write>(
                    &self,
                    mut target: W,
                ) -> Result<(), std::io::Error> {
                    target.$write::<LittleEndian>(*self)
                }
            }
        )+
    };
}

impl_serializable_le_int!(
    u16 => write_u16,
    u32 => write_u32,
    u64 => write_u64,
    i32 => write_i32,
    i64 => write_i64,
);

/// Timestamps are u32 seconds on the wire. Every consensus-valid time fits
/// until 2106; later dates saturate instead of wrapping, and the header
/// time checks reject them long before that matters.
impl BchSerialize for DateTime<Utc> {
    fn bch_serialize<W: std::io::Write>(&self, mut target: W) -> Result<(), std::io::Error> {
        let time_u32 = u32::try_from(self.timestamp()).unwrap_or(u32::max_value());
        target.write_u32::<LittleEndian>(time_u32)
    }
}

impl BchSerialize for [u8; 32] {
    fn bch_serialize<W: std::io::Write>(&self, mut target: W) -> Result<(), std::io::Error> {
        target.write_all(self)
    }
}

/// Collections carry their CompactSize count, then their items.
impl<T: BchSerialize> BchSerialize for Vec<T> {
    fn bch_serialize<W: std::io::Write>(&self, mut target: W) -> Result<(), std::io::Error> {
        CompactInt::from(self.len()).bch_serialize(&mut target)?;
        self.iter()
            .try_for_each(|item| item.bch_serialize(&mut target))
    }
}

/// Shared values serialize as their contents; sharing is a memory-layout
/// concern, not a wire one.
impl<T: BchSerialize> BchSerialize for Arc<T> {
    fn bch_serialize<W: std::io::Write>(&self, writer: W) -> Result<(), std::io::Error> {
        T::bch_serialize(self, writer)
    }
}
