//! Injected capabilities: hashing, keyed MACs, and randomness.
//!
//! The encoder core is a pure function over three capabilities plus the
//! client secret. They are injected as a record of trait objects so that
//! simulations and tests can substitute deterministic implementations
//! without touching the pipeline itself. There is no hidden global PRNG
//! state anywhere: every randomness source is an explicit object owned by
//! the caller.

use std::fmt;
use std::sync::Mutex;

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use sha2::Sha256;
use thiserror::Error;

use crate::drbg::HmacDrbg;

/// Errors from the injected randomness source.
#[derive(Debug, Error)]
pub enum RandError {
    #[error("randomness source read failed: {0}")]
    Source(#[from] rand::Error),

    /// A deterministic replay stream ran out of recorded bytes.
    #[error("deterministic randomness stream exhausted")]
    Exhausted,
}

/// Hash capability for the Bloom projection.
///
/// Used purely for dispersion, not security; collisions are tolerated.
/// The output must be long enough for the configured hash count (one or
/// more bytes per Bloom index).
pub trait BloomHash: Send + Sync {
    /// Digest arbitrary bytes to a fixed-length output.
    fn digest(&self, data: &[u8]) -> Vec<u8>;
}

/// Keyed MAC capability for cohort assignment and the PRR stage.
pub trait PrrMac: Send + Sync {
    /// Compute `out_len` bytes of keyed MAC output over `message`.
    ///
    /// Fixed-width MACs ignore `out_len` and return their native digest;
    /// stretchable MACs honor it exactly.
    fn mac(&self, key: &[u8], message: &[u8], out_len: usize) -> Vec<u8>;

    /// Native output size in bytes, or `None` when the output can be
    /// stretched to any requested length.
    fn output_limit(&self) -> Option<usize>;
}

/// Randomness capability for the IRR stage.
///
/// Returns a mask of `num_bits` bits (at most 32) in which each bit is
/// independently 1 with probability `prob`. Implementations must be
/// internally synchronized: a shared encoder calls this concurrently.
pub trait IrrRand: Send + Sync {
    fn get_mask(&self, prob: f64, num_bits: usize) -> Result<u32, RandError>;
}

// ============================================================================
// Production implementations
// ============================================================================

/// MD5 Bloom hash: 16 output bytes, enough for up to 16 hash indices.
#[derive(Clone, Copy, Debug, Default)]
pub struct Md5Hash;

impl BloomHash for Md5Hash {
    fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = Md5::new();
        hasher.update(data);
        hasher.finalize().to_vec()
    }
}

/// HMAC-SHA-256 MAC: fixed 32-byte output, enough for reports up to 32
/// bits.
#[derive(Clone, Copy, Debug, Default)]
pub struct HmacSha256Mac;

impl PrrMac for HmacSha256Mac {
    fn mac(&self, key: &[u8], message: &[u8], _out_len: usize) -> Vec<u8> {
        let mut mac = Hmac::<Sha256>::new_from_slice(key)
            .expect("HMAC-SHA256 accepts any key length");
        mac.update(message);
        mac.finalize().into_bytes().to_vec()
    }

    fn output_limit(&self) -> Option<usize> {
        Some(32)
    }
}

/// HMAC-DRBG MAC: stretches HMAC-SHA-256 to any requested length for
/// wide reports.
///
/// The DRBG seed material is `key ‖ message`, so the output stays a
/// deterministic function of exactly the same inputs as the fixed MAC.
#[derive(Clone, Copy, Debug, Default)]
pub struct HmacDrbgMac;

impl PrrMac for HmacDrbgMac {
    fn mac(&self, key: &[u8], message: &[u8], out_len: usize) -> Vec<u8> {
        let mut seed = Vec::with_capacity(key.len() + message.len());
        seed.extend_from_slice(key);
        seed.extend_from_slice(message);

        let mut out = vec![0u8; out_len];
        let mut drbg = HmacDrbg::new(&seed);
        drbg.generate(&mut out);
        out
    }

    fn output_limit(&self) -> Option<usize> {
        None
    }
}

/// Threshold a byte stream into a bit mask: bit i is 1 when byte i falls
/// below `⌊prob · 256⌋`.
pub(crate) fn mask_from_bytes(bytes: &[u8], prob: f64) -> u32 {
    let threshold = (prob * 256.0) as u16;
    let mut mask = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        if u16::from(byte) < threshold {
            mask |= 1 << i;
        }
    }
    mask
}

/// Kernel-backed randomness: one OS CSPRNG byte per mask bit.
///
/// This is the production source. Reads may block while the kernel pool
/// seeds at early boot; they do not fail under normal operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct KernelRand;

impl IrrRand for KernelRand {
    fn get_mask(&self, prob: f64, num_bits: usize) -> Result<u32, RandError> {
        debug_assert!(num_bits <= 32);
        let mut buf = [0u8; 32];
        OsRng.try_fill_bytes(&mut buf[..num_bits])?;
        Ok(mask_from_bytes(&buf[..num_bits], prob))
    }
}

/// Deterministic randomness for simulation, backed by a seeded PRNG.
///
/// Draws are consumed in call order; the mutex keeps the stream position
/// coherent when the source is shared across threads.
#[derive(Debug)]
pub struct SeededRand {
    rng: Mutex<StdRng>,
}

impl SeededRand {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl IrrRand for SeededRand {
    fn get_mask(&self, prob: f64, num_bits: usize) -> Result<u32, RandError> {
        debug_assert!(num_bits <= 32);
        let mut buf = [0u8; 32];
        let mut rng = self.rng.lock().expect("seeded rng poisoned");
        rng.fill_bytes(&mut buf[..num_bits]);
        Ok(mask_from_bytes(&buf[..num_bits], prob))
    }
}

// ============================================================================
// Capability record
// ============================================================================

/// Capability record handed to the encoder at construction.
///
/// The record (and everything it borrows) must outlive the encoder. The
/// encoder never mutates it.
pub struct Deps<'a> {
    /// Bloom projection hash.
    pub hash: &'a dyn BloomHash,
    /// Per-client secret keying the cohort and PRR derivations.
    pub client_secret: Vec<u8>,
    /// Keyed MAC for cohort assignment and PRR masks.
    pub mac: &'a dyn PrrMac,
    /// Fresh randomness for the IRR stage.
    pub irr_rand: &'a dyn IrrRand,
}

impl<'a> Deps<'a> {
    pub fn new(
        hash: &'a dyn BloomHash,
        client_secret: impl Into<Vec<u8>>,
        mac: &'a dyn PrrMac,
        irr_rand: &'a dyn IrrRand,
    ) -> Self {
        Self {
            hash,
            client_secret: client_secret.into(),
            mac,
            irr_rand,
        }
    }
}

impl fmt::Debug for Deps<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deps")
            .field("client_secret", &"[redacted]")
            .field("mac_output_limit", &self.mac.output_limit())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_digest() {
        // $ echo -n test | md5sum
        let digest = Md5Hash.digest(b"test");
        assert_eq!(hex::encode(digest), "098f6bcd4621d373cade4e832627b4f6");
    }

    #[test]
    fn test_hmac_sha256() {
        let digest = HmacSha256Mac.mac(b"key", b"value", 32);
        assert_eq!(
            hex::encode(digest),
            "90fbfcf15e74a36b89dbdb2a721d9aecffdfdddc5c83e27f7592594f71932481"
        );
    }

    #[test]
    fn test_hmac_sha256_handles_nul_bytes() {
        // Embedded and trailing NUL bytes must reach the MAC untouched.
        let empty = HmacSha256Mac.mac(b"key", b"", 32);
        assert_eq!(
            hex::encode(empty),
            "5d5d139563c95b5967b9bd9a8c9b233a9dedb45072794cd232dc1b74832607d0"
        );

        let nul = HmacSha256Mac.mac(b"key", b"\x00", 32);
        assert_eq!(
            hex::encode(nul),
            "8a8dfb9656dccf21b7ea526911243b7568f432815f1cd43a42771f2db4aaa525"
        );

        let nul_trailing = HmacSha256Mac.mac(b"key", b"\x00a", 32);
        assert_eq!(
            hex::encode(nul_trailing),
            "5787df47c2c486645a6af89844c34636fc5bb78b1b8729a06ca875567b75c05a"
        );
    }

    #[test]
    fn test_drbg_mac_stretches() {
        let digest = HmacDrbgMac.mac(b"key", b"value", 30);
        assert_eq!(digest.len(), 30);
        assert_eq!(
            hex::encode(digest),
            "89d71bb8a37d80c26e639cbd68f3607aa94deef425a7afbbf8d00992af92"
        );

        assert_eq!(HmacDrbgMac.mac(b"key", b"value", 64).len(), 64);
    }

    #[test]
    fn test_output_limits() {
        assert_eq!(HmacSha256Mac.output_limit(), Some(32));
        assert_eq!(HmacDrbgMac.output_limit(), None);
    }

    #[test]
    fn test_mask_from_bytes_thresholds() {
        let bytes = [0u8, 63, 64, 127, 128, 191, 192, 255];
        // ⌊0.25 · 256⌋ = 64: bytes strictly below set their bit.
        assert_eq!(mask_from_bytes(&bytes, 0.25), 0b0000_0011);
        assert_eq!(mask_from_bytes(&bytes, 0.5), 0b0000_1111);
        assert_eq!(mask_from_bytes(&bytes, 0.75), 0b0011_1111);
        // Degenerate probabilities behave exactly.
        assert_eq!(mask_from_bytes(&bytes, 0.0), 0);
        assert_eq!(mask_from_bytes(&bytes, 1.0), 0b1111_1111);
    }

    #[test]
    fn test_kernel_rand_degenerate_probabilities() {
        let rand = KernelRand;
        assert_eq!(rand.get_mask(0.0, 32).unwrap(), 0);
        assert_eq!(rand.get_mask(1.0, 32).unwrap(), u32::MAX);
        assert_eq!(rand.get_mask(1.0, 8).unwrap(), 0xFF);
    }

    #[test]
    fn test_seeded_rand_reproducible() {
        let a = SeededRand::new(7);
        let b = SeededRand::new(7);
        let draws_a: Vec<u32> = (0..8).map(|_| a.get_mask(0.5, 32).unwrap()).collect();
        let draws_b: Vec<u32> = (0..8).map(|_| b.get_mask(0.5, 32).unwrap()).collect();
        assert_eq!(draws_a, draws_b);

        let c = SeededRand::new(8);
        let draws_c: Vec<u32> = (0..8).map(|_| c.get_mask(0.5, 32).unwrap()).collect();
        assert_ne!(draws_a, draws_c);
    }

    #[test]
    fn test_deps_debug_redacts_secret() {
        let hash = Md5Hash;
        let mac = HmacSha256Mac;
        let rand = KernelRand;
        let deps = Deps::new(&hash, b"super-secret".as_slice(), &mac, &rand);
        let dbg = format!("{:?}", deps);
        assert!(dbg.contains("[redacted]"));
        assert!(!dbg.contains("super-secret"));
    }
}
