//! Encoding parameters.
//!
//! The six numeric parameters that shape a RAPPOR deployment. They are
//! part of the wire contract: the aggregator needs the exact values used
//! by clients to decode the collected reports, so `Params` serializes
//! with the analysis pipeline's JSON field names.
//!
//! Validation happens at encoder construction. Invalid parameters are
//! programming errors: construction refuses to produce an encoder and the
//! caller is expected to fail fast at startup.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum report width in bits with a fixed 32-byte MAC (one MAC byte
/// per bit).
pub const MAX_BITS_FIXED: u32 = 32;

/// Maximum report width in bits for stretchable MACs.
///
/// The 4-byte cohort prefix would allow widths up to 2^32, but nothing
/// practical needs more than this.
pub const MAX_BITS: u32 = 1 << 24;

/// Maximum number of Bloom hashes (one MD5 byte per hash index).
pub const MAX_HASHES: u32 = 16;

/// Maximum number of cohorts.
pub const MAX_COHORTS: u32 = 1 << 24;

/// Errors detected when validating parameters at encoder construction.
#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("num_bits must be in [1, 16777216], got {0}")]
    InvalidNumBits(u32),

    #[error("num_bits {num_bits} exceeds the {limit}-byte MAC output; use a stretchable MAC")]
    NumBitsOverMac { num_bits: u32, limit: usize },

    #[error("num_bits must be a multiple of 8 for wide reports, got {0}")]
    NumBitsNotByteAligned(u32),

    #[error("num_hashes must be in [1, 16], got {0}")]
    InvalidNumHashes(u32),

    #[error("num_cohorts must be a power of two in [1, 16777216], got {0}")]
    InvalidNumCohorts(u32),

    #[error("{name} must be in [0.0, 1.0], got {value}")]
    InvalidProbability { name: &'static str, value: f64 },

    #[error("MAC output too short for cohort assignment: need {need} bytes, got {got}")]
    MacTooShort { need: usize, got: usize },
}

/// RAPPOR encoding parameters.
///
/// Serializes with the field names the analysis pipeline expects
/// (`numBits`, `numHashes`, `numCohorts`, `probPrr`, `probIrr0`,
/// `probIrr1`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Params {
    /// Report width k: the size of the Bloom filter, PRR, and IRR in
    /// bits. Up to 32 with HMAC-SHA-256; any multiple of 8 with the
    /// HMAC-DRBG stretch.
    #[serde(rename = "numBits")]
    pub num_bits: u32,

    /// Number of bits h set in the Bloom filter per value.
    #[serde(rename = "numHashes")]
    pub num_hashes: u32,

    /// Number of cohorts m. Must be a power of two so the cohort mask is
    /// an unbiased reduction.
    #[serde(rename = "numCohorts")]
    pub num_cohorts: u32,

    /// PRR noise probability f: the chance that a Bloom bit is replaced
    /// by a permanent uniform bit. Applied quantized to the 1/128 grid;
    /// see [`Params::quantized_prob_f`].
    #[serde(rename = "probPrr")]
    pub prob_f: f64,

    /// IRR probability p: the chance that a 0-bit of the PRR reports as 1.
    #[serde(rename = "probIrr0")]
    pub prob_p: f64,

    /// IRR probability q: the chance that a 1-bit of the PRR reports as 1.
    #[serde(rename = "probIrr1")]
    pub prob_q: f64,
}

impl Params {
    /// Validate against the MAC capability the encoder was given.
    ///
    /// `mac_limit` is the MAC's native output size in bytes, or `None`
    /// when the output can be stretched to any length. One MAC byte feeds
    /// one PRR bit, so a fixed-width MAC caps `num_bits` at its output
    /// size; a stretchable MAC instead requires byte-aligned widths.
    pub(crate) fn validate(&self, mac_limit: Option<usize>) -> Result<(), ParamsError> {
        if self.num_bits == 0 || self.num_bits > MAX_BITS {
            return Err(ParamsError::InvalidNumBits(self.num_bits));
        }
        match mac_limit {
            Some(limit) => {
                let max = (limit as u32).min(MAX_BITS_FIXED);
                if self.num_bits > max {
                    return Err(ParamsError::NumBitsOverMac {
                        num_bits: self.num_bits,
                        limit,
                    });
                }
            }
            None => {
                if !self.num_bits.is_multiple_of(8) {
                    return Err(ParamsError::NumBitsNotByteAligned(self.num_bits));
                }
            }
        }
        if self.num_hashes == 0 || self.num_hashes > MAX_HASHES {
            return Err(ParamsError::InvalidNumHashes(self.num_hashes));
        }
        if self.num_cohorts == 0
            || !self.num_cohorts.is_power_of_two()
            || self.num_cohorts > MAX_COHORTS
        {
            return Err(ParamsError::InvalidNumCohorts(self.num_cohorts));
        }
        Self::check_probability("prob_f", self.prob_f)?;
        Self::check_probability("prob_p", self.prob_p)?;
        Self::check_probability("prob_q", self.prob_q)?;
        Ok(())
    }

    fn check_probability(name: &'static str, value: f64) -> Result<(), ParamsError> {
        if !(0.0..=1.0).contains(&value) {
            return Err(ParamsError::InvalidProbability { name, value });
        }
        Ok(())
    }

    /// The effective PRR noise rate after quantization: `⌊f·128⌋ / 128`.
    ///
    /// One MAC byte per bit yields one uniform bit and seven threshold
    /// bits, so f resolves to the 1/128 grid; finer resolutions are
    /// silently truncated. This is part of the wire contract: the decoder
    /// must be given the quantized rate.
    pub fn quantized_prob_f(&self) -> f64 {
        f64::from(Self::threshold128(self.prob_f)) / 128.0
    }

    /// Quantize a probability to the [0, 128] grid used by the PRR noise
    /// decision.
    pub(crate) fn threshold128(prob: f64) -> u8 {
        (prob * 128.0) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Params {
        Params {
            num_bits: 32,
            num_hashes: 2,
            num_cohorts: 128,
            prob_f: 0.25,
            prob_p: 0.75,
            prob_q: 0.5,
        }
    }

    #[test]
    fn test_valid_params() {
        assert!(valid().validate(Some(32)).is_ok());
        assert!(valid().validate(None).is_ok());
    }

    #[test]
    fn test_num_bits_bounds() {
        let mut p = valid();
        p.num_bits = 0;
        assert!(matches!(
            p.validate(Some(32)),
            Err(ParamsError::InvalidNumBits(0))
        ));

        p.num_bits = 33;
        assert!(matches!(
            p.validate(Some(32)),
            Err(ParamsError::NumBitsOverMac { num_bits: 33, .. })
        ));

        // 33 is also rejected by a stretchable MAC: not byte-aligned.
        assert!(matches!(
            p.validate(None),
            Err(ParamsError::NumBitsNotByteAligned(33))
        ));

        p.num_bits = 63;
        assert!(matches!(
            p.validate(None),
            Err(ParamsError::NumBitsNotByteAligned(63))
        ));

        p.num_bits = 64;
        assert!(p.validate(None).is_ok());
        assert!(matches!(
            p.validate(Some(32)),
            Err(ParamsError::NumBitsOverMac { num_bits: 64, .. })
        ));
    }

    #[test]
    fn test_num_hashes_bounds() {
        let mut p = valid();
        p.num_hashes = 0;
        assert!(matches!(
            p.validate(Some(32)),
            Err(ParamsError::InvalidNumHashes(0))
        ));
        p.num_hashes = 17;
        assert!(matches!(
            p.validate(Some(32)),
            Err(ParamsError::InvalidNumHashes(17))
        ));
        p.num_hashes = 16;
        assert!(p.validate(Some(32)).is_ok());
    }

    #[test]
    fn test_num_cohorts_bounds() {
        let mut p = valid();
        p.num_cohorts = 0;
        assert!(matches!(
            p.validate(Some(32)),
            Err(ParamsError::InvalidNumCohorts(0))
        ));
        p.num_cohorts = 3;
        assert!(matches!(
            p.validate(Some(32)),
            Err(ParamsError::InvalidNumCohorts(3))
        ));
        p.num_cohorts = 1 << 25;
        assert!(matches!(
            p.validate(Some(32)),
            Err(ParamsError::InvalidNumCohorts(_))
        ));
        p.num_cohorts = 1;
        assert!(p.validate(Some(32)).is_ok());
    }

    #[test]
    fn test_probability_bounds() {
        for (name, f, p, q) in [
            ("prob_f", 1.1, 0.75, 0.5),
            ("prob_f", -0.1, 0.75, 0.5),
            ("prob_p", 0.25, 1.1, 0.5),
            ("prob_p", 0.25, -0.1, 0.5),
            ("prob_q", 0.25, 0.75, 1.1),
            ("prob_q", 0.25, 0.75, -0.1),
        ] {
            let mut params = valid();
            params.prob_f = f;
            params.prob_p = p;
            params.prob_q = q;
            match params.validate(Some(32)) {
                Err(ParamsError::InvalidProbability { name: got, .. }) => {
                    assert_eq!(got, name)
                }
                other => panic!("expected probability error for {}, got {:?}", name, other),
            }
        }
    }

    #[test]
    fn test_f_quantization() {
        let mut p = valid();
        p.prob_f = 0.3;
        // 0.3 * 128 = 38.4, truncated to 38; effective rate 38/128.
        assert_eq!(Params::threshold128(p.prob_f), 38);
        assert_eq!(p.quantized_prob_f(), 0.296875);

        p.prob_f = 1.0;
        assert_eq!(Params::threshold128(p.prob_f), 128);
        assert_eq!(p.quantized_prob_f(), 1.0);

        p.prob_f = 0.0;
        assert_eq!(p.quantized_prob_f(), 0.0);
    }

    #[test]
    fn test_serde_field_names() {
        let p = valid();
        let json = serde_json::to_string(&p).unwrap();
        for field in [
            "numBits",
            "numHashes",
            "numCohorts",
            "probPrr",
            "probIrr0",
            "probIrr1",
        ] {
            assert!(json.contains(field), "missing {} in {}", field, json);
        }

        let back: Params = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_serde_from_pipeline_json() {
        let json = r#"{
            "numBits": 16,
            "numHashes": 2,
            "numCohorts": 64,
            "probPrr": 0.5,
            "probIrr0": 0.5,
            "probIrr1": 0.75
        }"#;
        let p: Params = serde_json::from_str(json).unwrap();
        assert_eq!(p.num_bits, 16);
        assert_eq!(p.num_cohorts, 64);
        assert_eq!(p.prob_f, 0.5);
        assert_eq!(p.prob_q, 0.75);
    }
}
