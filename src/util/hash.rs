//! Hashing utilities for command signatures.

use sha2::{Digest, Sha256};

/// Compute a 64-bit hash of a byte slice.
///
/// The value is the first eight bytes of the SHA-256 digest, so it is
/// stable across runs and platforms (which the persisted signatures
/// require).
pub fn hash64(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Compute a 64-bit hash of a string.
pub fn hash64_str(s: &str) -> u64 {
    hash64(s.as_bytes())
}

/// An accumulator for building command signatures from multiple components.
///
/// Components are XOR-combined, matching how subclass contributions fold
/// into a command's base signature.
#[derive(Debug, Default, Clone, Copy)]
pub struct Signature(u64);

impl Signature {
    pub fn new() -> Self {
        Signature(0)
    }

    /// Fold a string component into the signature.
    pub fn combine_str(mut self, s: &str) -> Self {
        self.0 ^= hash64_str(s);
        self
    }

    /// Fold a raw 64-bit component into the signature.
    pub fn combine(mut self, value: u64) -> Self {
        self.0 ^= value;
        self
    }

    pub fn value(self) -> u64 {
        self.0
    }
}
