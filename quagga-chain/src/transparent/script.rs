//! Script byte strings.

use crate::{
    compactint::CompactInt,
    serialization::{BchDeserialize, BchSerialize, SerializationError},
};
use std::{
    fmt,
    io::{self, Read},
};

/// An encoded script.
///
/// The chain layer carries scripts as opaque byte strings: an output whose
/// script exceeds the interpreter limit is storable on-chain (it is merely
/// unspendable), so parsing accepts any announced length that is actually
/// present and leaves size policy to [`Script::MAX_SIZE`]'s consumers.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Hash)]
#[cfg_attr(
    any(test, feature = "proptest-impl"),
    derive(proptest_derive::Arbitrary)
)]
pub struct Script(pub Vec<u8>);

impl Script {
    /// The interpreter's script-size limit, in bytes (the classic
    /// `MAX_SCRIPT_SIZE`, unchanged by the cash forks). Scripts above this
    /// fail execution; the verifier seam checks it before evaluating.
    pub const MAX_SIZE: usize = 10_000;

    /// The bytes this script occupies serialized: its CompactSize length
    /// prefix plus the body.
    pub fn serialized_size(&self) -> usize {
        let body = self.0.len();
        CompactInt::size(body) + body
    }

    /// Whether this script can never pass the interpreter's size limit.
    pub fn exceeds_max_size(&self) -> bool {
        self.0.len() > Script::MAX_SIZE
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Script")
            .field("len", &self.0.len())
            .field("bytes", &hex::encode(&self.0))
            .finish()
    }
}

impl BchSerialize for Script {
    fn bch_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        CompactInt::from(self.0.len()).bch_serialize(&mut writer)?;
        writer.write_all(&self.0)
    }
}

impl BchDeserialize for Script {
    fn bch_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        let announced = CompactInt::bch_deserialize(&mut reader)?.value();
        // Preallocation trusts the claim only up to the interpreter limit;
        // the bytes themselves decide whether the claim was honest.
        let mut bytes = Vec::with_capacity((announced as usize).min(Script::MAX_SIZE));
        reader.take(announced).read_to_end(&mut bytes)?;
        if (bytes.len() as u64) < announced {
            return Err(SerializationError::Parse("script truncated"));
        }
        Ok(Script(bytes))
    }
}
