//! Bloom projection of reported values.
//!
//! A reported value is hashed into a k-bit vector with at most h bits
//! set, prefixed by the client's cohort so that different cohorts use
//! independent projections of the same value. Unlike a set-membership
//! Bloom filter, this is a one-shot lossy encoding: nothing is ever
//! queried back out of the vector, and hash collisions merely cost the
//! decoder some resolution.
//!
//! ## Layouts
//!
//! Two vector layouts exist, fixed by the wire format:
//!
//! - **Fixed** (k ≤ 32): the vector is a `u32`; hash i sets bit
//!   `digest[i] % k`.
//! - **Extended** (k a multiple of 8): the vector is a `k/8`-byte
//!   buffer. Bit b lives in byte `(k/8 - 1) - b/8` at position `b % 8`,
//!   i.e. bit 0 sits in the *last* byte. Reading the k = 32 buffer as a
//!   big-endian integer reproduces the fixed layout exactly.

use thiserror::Error;

use crate::deps::BloomHash;

/// Errors from the Bloom projection. All are per-report and
/// recoverable; the caller may drop the report or retry.
#[derive(Debug, Error)]
pub enum BloomError {
    #[error("hash output too short: need {need} bytes, got {got}")]
    HashTooShort { need: usize, got: usize },

    #[error("fixed-profile width must be in [1, 32], got {0}")]
    WidthOutOfRange(u32),

    #[error("vector width must be a positive multiple of 8, got {0}")]
    SizeNotByteAligned(u32),
}

/// Smallest e with `2^e >= n`. `n` must be non-zero.
fn ceil_log2(n: u32) -> u32 {
    32 - (n - 1).leading_zeros()
}

/// Number of hash-output bytes consumed per Bloom index for a k-bit
/// vector: `⌈ceil_log2(k) / 8⌉`, at least one. Any width a `u32` can
/// express needs at most four bytes per index.
pub(crate) fn bytes_per_hash(num_bits: u32) -> usize {
    let e = ceil_log2(num_bits);
    if e == 0 {
        1
    } else {
        ((e - 1) / 8 + 1) as usize
    }
}

/// Fixed-profile projection: h bits of a `u32`, k ≤ 32.
///
/// The hash input is the 4-byte big-endian cohort followed by the value.
pub fn project_u32(
    hash: &dyn BloomHash,
    cohort_prefix: &[u8; 4],
    value: &[u8],
    num_bits: u32,
    num_hashes: usize,
) -> Result<u32, BloomError> {
    if num_bits == 0 || num_bits > 32 {
        return Err(BloomError::WidthOutOfRange(num_bits));
    }

    let digest = hash_input(hash, cohort_prefix, value);
    if digest.len() < num_hashes {
        return Err(BloomError::HashTooShort {
            need: num_hashes,
            got: digest.len(),
        });
    }

    let mut bloom = 0u32;
    for &byte in &digest[..num_hashes] {
        bloom |= 1 << (u32::from(byte) % num_bits);
    }
    Ok(bloom)
}

/// Extended-profile projection: h bits of a `k/8`-byte buffer.
///
/// Hash i reads `bytes_per_hash` digest bytes little-endian into an
/// integer b and sets bit `b % k` in the byte-reversed layout.
pub fn project_bytes(
    hash: &dyn BloomHash,
    cohort_prefix: &[u8; 4],
    value: &[u8],
    num_bits: u32,
    num_hashes: usize,
) -> Result<Vec<u8>, BloomError> {
    if num_bits == 0 || !num_bits.is_multiple_of(8) {
        return Err(BloomError::SizeNotByteAligned(num_bits));
    }

    let per_hash = bytes_per_hash(num_bits);
    let digest = hash_input(hash, cohort_prefix, value);
    if digest.len() < num_hashes * per_hash {
        return Err(BloomError::HashTooShort {
            need: num_hashes * per_hash,
            got: digest.len(),
        });
    }

    let mut bloom = vec![0u8; (num_bits / 8) as usize];
    for i in 0..num_hashes {
        let mut index = 0u64;
        for (j, &byte) in digest[i * per_hash..(i + 1) * per_hash].iter().enumerate() {
            index |= u64::from(byte) << (8 * j);
        }
        set_bit(&mut bloom, (index % u64::from(num_bits)) as usize);
    }
    Ok(bloom)
}

fn hash_input(hash: &dyn BloomHash, cohort_prefix: &[u8; 4], value: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(4 + value.len());
    input.extend_from_slice(cohort_prefix);
    input.extend_from_slice(value);
    hash.digest(&input)
}

/// Set logical bit `i` in the byte-reversed layout.
pub(crate) fn set_bit(buf: &mut [u8], i: usize) {
    let last = buf.len() - 1;
    buf[last - i / 8] |= 1 << (i % 8);
}

/// Read logical bit `i` from the byte-reversed layout.
pub fn get_bit(buf: &[u8], i: usize) -> bool {
    let last = buf.len() - 1;
    (buf[last - i / 8] >> (i % 8)) & 1 == 1
}

/// Count the set bits of a report buffer.
pub fn count_ones(buf: &[u8]) -> u32 {
    buf.iter().map(|b| b.count_ones()).sum()
}
