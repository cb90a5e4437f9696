//! Sharder implementation.
use std::io::Cursor;

pub trait Sharder {
    /// 32-bit hash of `input`, widened so callers can split it into allocation and distribution
    /// buckets.
    fn get_hash(&self, input: impl AsRef<[u8]>) -> u64;
}

/// The default (and only) sharder: murmur3 x86 32-bit with seed 0.
pub struct Murmur3Sharder;

impl Sharder for Murmur3Sharder {
    fn get_hash(&self, input: impl AsRef<[u8]>) -> u64 {
        // Reading from an in-memory cursor cannot fail.
        let hash = murmur3::murmur3_32(&mut Cursor::new(input.as_ref()), 0).unwrap_or(0);
        u64::from(hash)
    }
}
