//! Payload validation against a repeating byte sequence `0,1,…,M-1`.

use tracing::warn;

use crate::errors::{Error, Result};

pub const DEFAULT_ERROR_THRESHOLD: usize = 20;

/// Writes the expected sequence into `out`, starting from `seed` (a cumulative
/// byte position; only its residue modulo `modulus` matters).
pub fn fill_pattern(out: &mut [u8], modulus: u64, seed: u64) {
    let mut next = seed % modulus;
    for byte in out.iter_mut() {
        *byte = next as u8;
        next += 1;
        if next == modulus {
            next = 0;
        }
    }
}

pub struct Validator {
    modulus: u64,
    errors: usize,
    threshold: usize,
}

impl Validator {
    pub fn new(modulus: u64) -> Self {
        Self {
            modulus,
            errors: 0,
            threshold: DEFAULT_ERROR_THRESHOLD,
        }
    }

    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    pub fn errors(&self) -> usize {
        self.errors
    }

    pub fn fill(&self, out: &mut [u8], seed: u64) {
        fill_pattern(out, self.modulus, seed);
    }

    /// Checks `data` against the sequence starting at `seed`. Mismatches are
    /// counted; crossing the threshold is fatal.
    pub fn check(&mut self, data: &[u8], seed: u64) -> Result<()> {
        let mut expected = seed % self.modulus;
        for (i, byte) in data.iter().enumerate() {
            if *byte != expected as u8 {
                warn!(
                    "failed validation: expected={expected}, actual={}, index={i}",
                    *byte
                );
                self.errors += 1;
                if self.errors > self.threshold {
                    return Err(Error::Validation(self.errors));
                }
            }
            expected += 1;
            if expected == self.modulus {
                expected = 0;
            }
        }
        Ok(())
    }
}
