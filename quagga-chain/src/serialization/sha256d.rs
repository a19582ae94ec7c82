//! Streaming double-SHA256 as used for block hashes, txids and the legacy
//! message checksum.

use sha2::{Digest, Sha256};
use std::io;

/// A write-through adapter that accumulates a SHA256d digest.
#[derive(Default)]
pub struct Writer {
    hash: Sha256,
}

impl Writer {
    /// Consume the writer and produce the double hash.
    pub fn finish(self) -> [u8; 32] {
        let result1 = self.hash.finalize();
        let result2 = Sha256::digest(&result1);
        let mut buffer = [0u8; 32];
        buffer[0..32].copy_from_slice(&result2);
        buffer
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hash.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A 4-byte checksum using truncated double-SHA256 (two rounds of SHA256).
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Checksum(pub [u8; 4]);

impl<'a> From<&'a [u8]> for Checksum {
    fn from(bytes: &'a [u8]) -> Self {
        let hash1 = Sha256::digest(bytes);
        let hash2 = Sha256::digest(&hash1);
        let mut checksum = [0u8; 4];
        checksum[0..4].copy_from_slice(&hash2[0..4]);
        Self(checksum)
    }
}

impl std::fmt::Debug for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Checksum")
            .field(&hex::encode(self.0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn double_hash_of_empty_input() {
        let mut writer = Writer::default();
        writer.write_all(b"").unwrap();
        // sha256d("") from any reference implementation.
        assert_eq!(
            hex::encode(writer.finish()),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn checksum_matches_writer() {
        let mut writer = Writer::default();
        writer.write_all(b"quagga").unwrap();
        let full = writer.finish();
        let check = Checksum::from(&b"quagga"[..]);
        assert_eq!(&full[0..4], &check.0[..]);
    }
}
