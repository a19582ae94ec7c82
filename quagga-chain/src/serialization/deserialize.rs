use std::{io, sync::Arc};

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, TimeZone, Utc};

use super::SerializationError;
use crate::compactint::CompactInt;

type Result<R> = std::result::Result<R, SerializationError>;

/// Collections announce their own element counts, so preallocation is
/// capped: a peer claiming a few billion entries costs itself the bytes it
/// actually sent, nothing more.
pub(crate) const BLIND_ALLOC_LIMIT: usize = 1024;

pub trait BchDeserialize {
    fn bch_deserialize<R: io::Read>(reader: R) -> Result<Self>
    where
        Self: Sized;
}

/// The reader-side companion of [`BchDeserialize`]: lets the target type
/// be picked up from context instead of spelled at the call site.
pub trait BchDeserializeInto {
    fn bch_deserialize_into<T>(self) -> Result<T>
    where
        T: BchDeserialize;
}

impl<R: io::Read> BchDeserializeInto for R {
    fn bch_deserialize_into<T>(self) -> Result<T>
    where
        T: BchDeserialize,
    {
        T::bch_deserialize(self)
    }
}

impl BchDeserialize for u8 {
    fn bch_deserialize<R: io::Read>(mut reader: R) -> Result<u8> {
        Ok(reader.read_u8()?)
    }
}

macro_rules! impl_deserializable_le_int {
    ($($ty:ty => $read:ident),+ $(,)?) => {
        $(
            impl BchDeserialize for $ty {
                fn bch_deserialize<R: io::Read>(mut reader: R) -> Result<$ty> {
                    Ok(reader.$read::<LittleEndian>()?)
                }
            }
        )+
    };
}

impl_deserializable_le_int!(
    u16 => read_u16,
    u32 => read_u32,
    u64 => read_u64,
    i32 => read_i32,
    i64 => read_i64,
);

impl BchDeserialize for DateTime<Utc> {
    fn bch_deserialize<R: io::Read>(mut reader: R) -> Result<DateTime<Utc>> {
        Ok(Utc.timestamp(reader.read_u32::<LittleEndian>()? as i64, 0))
    }
}

impl BchDeserialize for [u8; 32] {
    fn bch_deserialize<R: io::Read>(mut reader: R) -> Result<[u8; 32]> {
        let mut result = [0u8; 32];
        reader.read_exact(&mut result)?;
        Ok(result)
    }
}

impl<T: BchDeserialize> BchDeserialize for Vec<T> {
    fn bch_deserialize<R: io::Read>(mut reader: R) -> Result<Vec<T>> {
        let len = CompactInt::bch_deserialize(&mut reader)?.value() as usize;
        let mut result: Vec<T> = Vec::with_capacity(len.min(BLIND_ALLOC_LIMIT));
        for _ in 0..len {
            result.push(T::bch_deserialize(&mut reader)?);
        }
        Ok(result)
    }
}

impl<T: BchDeserialize> BchDeserialize for Arc<T> {
    fn bch_deserialize<R: io::Read>(reader: R) -> Result<Arc<T>> {
        Ok(Arc::new(T::bch_deserialize(reader)?))
    }
}
