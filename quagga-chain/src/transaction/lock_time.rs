use std::{convert::TryInto, io};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, TimeZone, Utc};

use crate::block::Height;
use crate::serialization::{BchDeserialize, BchSerialize, SerializationError};

/// A transaction's lock time: the earliest height or time it may be mined.
///
/// The raw u32 is interpreted as a block height below 500 million and a Unix
/// timestamp at or above it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Hash)]
pub enum LockTime {
    /// Unlocked at the given block height.
    Height(Height),
    /// Unlocked at the given time.
    Time(DateTime<Utc>),
}

impl LockTime {
    /// The smallest threshold interpreted as a time rather than a height.
    pub const MIN_TIMESTAMP: i64 = 500_000_000;

    /// Returns the `LockTime` for a transaction with no lock.
    pub fn unlocked() -> LockTime {
        LockTime::Height(Height(0))
    }
}

impl BchSerialize for LockTime {
    fn bch_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        match self {
            LockTime::Height(Height(height)) => writer.write_u32::<LittleEndian>(*height)?,
            LockTime::Time(time) => writer.write_u32::<LittleEndian>(
                time.timestamp()
                    .try_into()
                    .expect("times are in the u32 range by construction"),
            )?,
        }
        Ok(())
    }
}

impl BchDeserialize for LockTime {
    fn bch_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let raw = reader.read_u32::<LittleEndian>()?;
        if i64::from(raw) < LockTime::MIN_TIMESTAMP {
            Ok(LockTime::Height(Height(raw)))
        } else {
            Ok(LockTime::Time(Utc.timestamp(raw as i64, 0)))
        }
    }
}
