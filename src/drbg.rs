//! HMAC-DRBG deterministic byte stream.
//!
//! Implements the HMAC_DRBG construction from NIST SP 800-90A over
//! HMAC-SHA-256, used to stretch the 32-byte MAC output into the longer
//! deterministic streams that wide reports need (one byte per report
//! bit).
//!
//! Only the instantiate and generate processes are implemented.
//! Reseeding is not supported: construct a new generator instead.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Output size of the underlying HMAC in bytes.
const DIGEST_LEN: usize = 32;

/// Deterministic random bit generator built from HMAC-SHA-256
/// (NIST SP 800-90A HMAC_DRBG).
pub struct HmacDrbg {
    /// "Key" from SP 800-90A.
    key: [u8; DIGEST_LEN],
    /// "V" from SP 800-90A.
    value: [u8; DIGEST_LEN],
}

impl HmacDrbg {
    /// Instantiate from seed material.
    ///
    /// `Key` starts as all-zero bytes and `V` as all 0x01 bytes, then one
    /// update round absorbs the seed material (SP 800-90A 10.1.1.2).
    pub fn new(seed_material: &[u8]) -> Self {
        let mut drbg = Self {
            key: [0x00; DIGEST_LEN],
            value: [0x01; DIGEST_LEN],
        };
        drbg.update(Some(seed_material));
        drbg
    }

    fn hmac(key: &[u8], parts: &[&[u8]]) -> [u8; DIGEST_LEN] {
        let mut mac =
            HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts any key length");
        for part in parts {
            mac.update(part);
        }
        mac.finalize().into_bytes().into()
    }

    /// HMAC_DRBG update process (SP 800-90A 10.1.2.2).
    ///
    /// With no provided data only the first two steps run.
    fn update(&mut self, provided_data: Option<&[u8]>) {
        let data = provided_data.unwrap_or(&[]);
        self.key = Self::hmac(&self.key, &[&self.value, &[0x00], data]);
        self.value = Self::hmac(&self.key, &[&self.value]);
        if provided_data.is_none() {
            return;
        }
        self.key = Self::hmac(&self.key, &[&self.value, &[0x01], data]);
        self.value = Self::hmac(&self.key, &[&self.value]);
    }

    /// HMAC_DRBG generate process (SP 800-90A 10.1.2.5), no additional
    /// input.
    ///
    /// Fills `out` with the next pseudo-random bytes: `V = HMAC(Key, V)`
    /// blocks are emitted until the request is satisfied, truncating the
    /// final block.
    pub fn generate(&mut self, out: &mut [u8]) {
        let mut written = 0;
        while written < out.len() {
            self.value = Self::hmac(&self.key, &[&self.value]);
            let n = (out.len() - written).min(DIGEST_LEN);
            out[written..written + n].copy_from_slice(&self.value[..n]);
            written += n;
        }
        self.update(None);
    }
}
