//! A write-once cache slot for values derived from consensus data.
//!
//! Block hashes and txids are expensive enough that the deserializers
//! compute them once, while the raw bytes are still at hand, and stash them
//! next to the parsed structure. The slot never reaches the wire: consensus
//! serialization writes nothing for it and reading always yields an empty
//! slot, so adding one to a struct cannot break the format.

use crate::{BchDeserialize, BchSerialize, SerializationError};

#[derive(Clone, Copy, Eq)]
pub struct Cached<T: Copy>(Option<T>);

impl<T: Copy> Cached<T> {
    pub fn new() -> Cached<T> {
        Cached(None)
    }

    pub fn from(val: T) -> Cached<T> {
        Cached(Some(val))
    }

    pub fn value(&self) -> Option<T> {
        self.0
    }
}

impl<T: Copy> Default for Cached<T> {
    fn default() -> Self {
        Cached::new()
    }
}

/// An unfilled cache compares equal to anything: a freshly built structure
/// (empty cache) must equal its deserialized twin (cache filled by the
/// parser). Two filled caches compare by value.
impl<T: PartialEq + Copy> PartialEq for Cached<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self.0, other.0) {
            (Some(lhs), Some(rhs)) => lhs == rhs,
            _ => true,
        }
    }
}

impl<T: Copy + std::fmt::Debug> std::fmt::Debug for Cached<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl<T: Copy> BchSerialize for Cached<T> {
    fn bch_serialize<W>(&self, _: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        Ok(())
    }
}

impl<T: Copy> BchDeserialize for Cached<T> {
    fn bch_deserialize<R: std::io::Read>(_: R) -> Result<Self, SerializationError> {
        // The cache is filled by whoever parses the surrounding structure,
        // not from the bytes themselves.
        Ok(Cached(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cache_is_a_comparison_wildcard() {
        let empty: Cached<u32> = Cached::new();
        let one = Cached::from(1u32);
        let two = Cached::from(2u32);

        assert_eq!(empty, one);
        assert_eq!(one, empty);
        assert_eq!(one, one);
        assert_ne!(one, two);
    }

    #[test]
    fn never_serialized_never_deserialized() {
        let filled = Cached::from(7u32);
        assert!(filled.bch_serialize_to_vec().unwrap().is_empty());

        let read: Cached<u32> = Cached::bch_deserialize(&[1, 2, 3][..]).unwrap();
        assert_eq!(read.value(), None);
    }
}
