//! Integrity: whole-payload SHA-256 carried in the End frame, verified on receive.

use sha2::{Digest, Sha256};

/// Hash a complete payload. Returns 32-byte digest.
pub fn hash_payload(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Incremental digest over slices fed in order. Also counts the bytes it has seen.
#[derive(Default)]
pub struct RunningDigest {
    hasher: Sha256,
    hashed: u64,
}

impl RunningDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, slice: &[u8]) {
        self.hasher.update(slice);
        self.hashed += slice.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.hashed
    }

    pub fn finalize(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }

    /// Finish and compare against the sender's digest.
    pub fn verify(self, expected: &[u8; 32]) -> bool {
        self.finalize() == *expected
    }
}
