//! The Bitcoin-inherited transaction Merkle tree.

use std::{fmt, io, iter::FromIterator};

use crate::serialization::{sha256d, BchDeserialize, BchSerialize, SerializationError};
use crate::transaction;

/// The root of the transaction Merkle tree.
///
/// Bitcoin's Merkle construction duplicates the last node on levels with an
/// odd number of nodes, which makes the tree malleable: some transaction
/// lists produce the same root as a list with repeated entries
/// (CVE-2012-2459). Use [`root_and_mutated`] when validating untrusted
/// blocks to detect that malleation.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[cfg_attr(
    any(test, feature = "proptest-impl"),
    derive(proptest_derive::Arbitrary)
)]
pub struct Root(pub [u8; 32]);

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut reversed_bytes = self.0;
        reversed_bytes.reverse();
        f.debug_tuple("merkle::Root")
            .field(&hex::encode(&reversed_bytes))
            .finish()
    }
}

impl BchSerialize for Root {
    fn bch_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), io::Error> {
        writer.write_all(&self.0)
    }
}

impl BchDeserialize for Root {
    fn bch_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(Root(<[u8; 32]>::bch_deserialize(&mut reader)?))
    }
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    use io::Write;
    let mut writer = sha256d::Writer::default();
    writer
        .write_all(left)
        .and_then(|_| writer.write_all(right))
        .expect("Sha256dWriter is infallible");
    writer.finish()
}

/// Compute the Merkle root of a list of transaction hashes, and report
/// whether the list shows the CVE-2012-2459 duplication pattern.
///
/// An empty list produces the all-zero root, which never matches a valid
/// header.
pub fn root_and_mutated(hashes: &[transaction::Hash]) -> (Root, bool) {
    let mut mutated = false;
    let mut level: Vec<[u8; 32]> = hashes.iter().map(|hash| hash.0).collect();

    if level.is_empty() {
        return (Root([0; 32]), false);
    }

    while level.len() > 1 {
        // Check for repeated pairs before padding: padding legitimately
        // duplicates the final node.
        let mut i = 0;
        while i + 1 < level.len() {
            if level[i] == level[i + 1] {
                mutated = true;
            }
            i += 2;
        }

        if level.len() % 2 == 1 {
            let last = *level.last().expect("level is non-empty");
            level.push(last);
        }

        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            next.push(hash_pair(&pair[0], &pair[1]));
        }
        level = next;
    }

    (Root(level[0]), mutated)
}

impl FromIterator<transaction::Hash> for Root {
    fn from_iter<I>(hashes: I) -> Self
    where
        I: IntoIterator<Item = transaction::Hash>,
    {
        let hashes: Vec<transaction::Hash> = hashes.into_iter().collect();
        root_and_mutated(&hashes).0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(byte: u8) -> transaction::Hash {
        transaction::Hash([byte; 32])
    }

    #[test]
    fn single_transaction_root_is_its_hash() {
        let tx = hash_of(7);
        let (root, mutated) = root_and_mutated(&[tx]);
        assert_eq!(root.0, tx.0);
        assert!(!mutated);
    }

    #[test]
    fn duplicate_pair_is_flagged_as_mutated() {
        let a = hash_of(1);
        let b = hash_of(2);
        let c = hash_of(3);

        let (clean_root, clean) = root_and_mutated(&[a, b, c]);
        assert!(!clean);

        // [a, b, c, c] produces the same root as [a, b, c] because odd
        // levels duplicate their last node: the CVE-2012-2459 pattern. The
        // mutation flag is what tells them apart.
        let (dup_root, mutated) = root_and_mutated(&[a, b, c, c]);
        assert!(mutated);
        assert_eq!(clean_root.0, dup_root.0);
    }

    #[test]
    fn odd_padding_is_not_flagged() {
        let (_, mutated) = root_and_mutated(&[hash_of(1), hash_of(2), hash_of(3)]);
        assert!(!mutated);
    }
}
