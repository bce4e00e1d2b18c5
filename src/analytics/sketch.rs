//! HyperLogLog distinct-count sketch used for unique IP / country counts
//!
//! Registers are one byte each and are persisted as a blob alongside the
//! aggregation bucket. An empty register vector stands for an empty sketch.

use sha2::{Digest, Sha256};

const PRECISION: u32 = 10;
const REGISTER_COUNT: usize = 1 << PRECISION;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistinctSketch {
    registers: Vec<u8>,
}

impl DistinctSketch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a sketch from its persisted bytes. Blobs of the wrong size are
    /// treated as empty.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        if bytes.len() == REGISTER_COUNT {
            Self { registers: bytes }
        } else {
            if !bytes.is_empty() {
                tracing::warn!(len = bytes.len(), "discarding malformed distinct sketch");
            }
            Self::default()
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.registers
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn insert(&mut self, value: &[u8]) {
        let hash = hash64(value);
        let index = (hash >> (64 - PRECISION)) as usize;
        let remaining = hash << PRECISION;
        let rank = (remaining.leading_zeros() + 1).min(64 - PRECISION + 1) as u8;

        if self.registers.is_empty() {
            self.registers = vec![0; REGISTER_COUNT];
        }

        if self.registers[index] < rank {
            self.registers[index] = rank;
        }
    }

    /// Estimated number of distinct inserted values
    pub fn estimate(&self) -> u64 {
        if self.registers.is_empty() {
            return 0;
        }

        let m = REGISTER_COUNT as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);

        let mut sum = 0.0;
        let mut zeros = 0usize;
        for &register in &self.registers {
            sum += 2f64.powi(-i32::from(register));
            if register == 0 {
                zeros += 1;
            }
        }

        let raw = alpha * m * m / sum;

        // Small-range correction (linear counting)
        if raw <= 2.5 * m && zeros > 0 {
            (m * (m / zeros as f64).ln()).round() as u64
        } else {
            raw.round() as u64
        }
    }
}

fn hash64(value: &[u8]) -> u64 {
    let digest = Sha256::digest(value);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
