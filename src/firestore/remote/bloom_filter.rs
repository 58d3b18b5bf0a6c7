//! Bloom filter over document resource names, sent by the backend with an
//! existence filter so the client can tell which cached documents are gone.

use md5::{Digest, Md5};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Outcome of using a bloom filter to repair a target after an existence
/// filter mismatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BloomFilterApplicationStatus {
    /// The stale documents were removed and the counts now agree.
    Success,
    /// No usable bloom filter was sent.
    Skipped,
    /// Counts still disagree after filtering.
    FalsePositive,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> FirestoreResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Invalid padding when bitmap length is 0: {padding}"
            )));
        }
        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    /// `false` means `value` is definitely absent.
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let digest = Md5::digest(value.as_bytes());
        let (first, second) = digest.split_at(8);
        let hash1 = u64::from_le_bytes(first.try_into().unwrap_or([0; 8]));
        let hash2 = u64::from_le_bytes(second.try_into().unwrap_or([0; 8]));
        (0..self.hash_count).all(|index| self.is_bit_set(self.bit_index(hash1, hash2, index)))
    }

    fn bit_index(&self, hash1: u64, hash2: u64, hash_index: u32) -> u64 {
        let combined = hash1.wrapping_add(hash2.wrapping_mul(hash_index as u64));
        combined % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }
}
