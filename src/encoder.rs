//! Report encoding pipeline.
//!
//! Composes the three encoding stages into the public API: Bloom
//! projection of the value, the Permanent Randomized Response (PRR), and
//! the Instantaneous Randomized Response (IRR). Only the IRR may leave
//! the client.
//!
//! ```text
//! value --Bloom--> B --PRR--> (B & !F) | (U & F) --IRR--> (P & !PRR) | (Q & PRR)
//! ```
//!
//! The PRR masks F (noise selector) and U (uniform replacement bits) are
//! derived from a keyed MAC over (client_secret, encoder_id, B), so a
//! client re-reporting the same value regenerates the identical PRR and
//! only the IRR stage is re-randomized. That permanence is what stops an
//! aggregator from averaging the noise away over many reports.
//!
//! Cohort assignment runs once at construction; `encode_*` calls share
//! nothing but the immutable configuration and the cached cohort, so a
//! single encoder is safe to use from many threads when its randomness
//! source is internally synchronized.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::bloom::{self, BloomError};
use crate::deps::{Deps, RandError};
use crate::params::{Params, ParamsError};

/// Leading byte of every PRR MAC message. Cohort derivation MACs the
/// empty message, so the two derivations can never collide.
const PRR_MESSAGE_TAG: u8 = 0x01;

/// Per-report failures.
///
/// All of these are recoverable: the caller may retry or drop the
/// report. No partial output is ever produced, and the core never
/// retries on its own.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Bloom(#[from] BloomError),

    #[error("MAC output too short: need {need} bytes, got {got}")]
    MacTooShort { need: usize, got: usize },

    #[error("num_bits {0} exceeds the 32-bit fixed profile; use the byte-buffer API")]
    NotFixedWidth(u32),

    #[error("byte-buffer encoding requires num_bits divisible by 8, got {0}")]
    NotByteAligned(u32),

    #[error("report buffer is {got} bytes but num_bits/8 is {need}")]
    WrongLength { need: usize, got: usize },

    #[error("input bits extend past the {num_bits}-bit report width")]
    BitsOutOfRange { num_bits: u32 },

    #[error("ordinal {ordinal} out of range for {num_bits}-bit reports")]
    OrdinalOutOfRange { ordinal: u32, num_bits: u32 },

    #[error(transparent)]
    Rand(#[from] RandError),
}

/// Intermediate stages of a single encode.
///
/// For simulation and test reconstruction only: the `bloom` and `prr`
/// stages are exactly what the randomized response protects and must
/// never be transmitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stages<B> {
    pub bloom: B,
    pub prr: B,
    pub irr: B,
}

/// One encoded report, ready to hand to the collector.
///
/// The IRR is the only field derived from the client's value, and it has
/// already passed through both randomization stages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Report {
    /// Metric this report belongs to.
    pub encoder_id: String,
    /// The client's cohort in `[0, num_cohorts)`.
    pub cohort: u32,
    /// IRR bits. Fixed-profile reports travel as the k-bit integer in
    /// little-endian byte order; wide reports carry the byte-reversed
    /// buffer layout unchanged.
    pub irr: Vec<u8>,
}

impl Report {
    /// Package a fixed-profile report.
    pub fn from_bits(encoder_id: &str, cohort: u32, irr: u32) -> Self {
        Self {
            encoder_id: encoder_id.to_owned(),
            cohort,
            irr: irr.to_le_bytes().to_vec(),
        }
    }

    /// Package a wide report; the buffer already carries the wire layout.
    pub fn from_bytes(encoder_id: &str, cohort: u32, irr: Vec<u8>) -> Self {
        Self {
            encoder_id: encoder_id.to_owned(),
            cohort,
            irr,
        }
    }
}

/// Client-side encoder for one metric.
///
/// Constructed once at startup and reused for every report of that
/// metric. Immutable afterwards (aside from the explicit
/// [`set_cohort`](Encoder::set_cohort) override); holds its parameters
/// and capabilities by reference, so both must outlive it.
#[derive(Debug)]
pub struct Encoder<'d> {
    encoder_id: String,
    params: &'d Params,
    deps: &'d Deps<'d>,
    cohort: u32,
    /// Big-endian cohort bytes, prefixed to every Bloom hash input.
    cohort_prefix: [u8; 4],
}

impl<'d> Encoder<'d> {
    /// Validate the parameters against the MAC capability, derive the
    /// client's cohort, and build an encoder.
    ///
    /// Parameter violations are programming errors; treat them as fatal
    /// at startup rather than handling them at report time.
    pub fn new(
        encoder_id: &str,
        params: &'d Params,
        deps: &'d Deps<'d>,
    ) -> Result<Self, ParamsError> {
        params.validate(deps.mac.output_limit())?;
        let cohort = assign_cohort(deps, params.num_cohorts)?;
        debug!(encoder_id, cohort, "encoder constructed");

        let mut encoder = Self {
            encoder_id: encoder_id.to_owned(),
            params,
            deps,
            cohort: 0,
            cohort_prefix: [0; 4],
        };
        encoder.set_cohort(cohort);
        Ok(encoder)
    }

    /// The cohort this client reports under.
    pub fn cohort(&self) -> u32 {
        self.cohort
    }

    /// The metric identifier.
    pub fn encoder_id(&self) -> &str {
        &self.encoder_id
    }

    /// Override the derived cohort.
    ///
    /// For simulations and deployments that assign cohorts out of band.
    /// The value is not range-checked against `num_cohorts`.
    pub fn set_cohort(&mut self, cohort: u32) {
        self.cohort = cohort;
        self.cohort_prefix = cohort.to_be_bytes();
    }

    // ========================================================================
    // Fixed profile (k <= 32)
    // ========================================================================

    /// Encode raw report bits: PRR then IRR.
    pub fn encode_bits(&self, bits: u32) -> Result<u32, EncodeError> {
        Ok(self.encode_bits_stages(bits)?.irr)
    }

    /// Encode a string value through the Bloom projection.
    pub fn encode_string(&self, value: &[u8]) -> Result<u32, EncodeError> {
        Ok(self.encode_string_stages(value)?.irr)
    }

    /// Encode a boolean as a single report bit.
    ///
    /// Most deployments pair this with `num_bits = 1`.
    pub fn encode_boolean(&self, value: bool) -> Result<u32, EncodeError> {
        self.encode_bits(u32::from(value))
    }

    /// Encode an ordinal in `[0, num_bits)` as a one-hot bit pattern.
    pub fn encode_ordinal(&self, ordinal: u32) -> Result<u32, EncodeError> {
        if ordinal >= self.params.num_bits {
            return Err(EncodeError::OrdinalOutOfRange {
                ordinal,
                num_bits: self.params.num_bits,
            });
        }
        self.encode_bits(1 << ordinal)
    }

    /// Encode a string value and package the result for the collector.
    pub fn report_string(&self, value: &[u8]) -> Result<Report, EncodeError> {
        Ok(Report::from_bits(
            &self.encoder_id,
            self.cohort,
            self.encode_string(value)?,
        ))
    }

    /// [`encode_bits`](Encoder::encode_bits) returning every stage.
    /// Simulation only; the `bloom` field echoes the input bits.
    pub fn encode_bits_stages(&self, bits: u32) -> Result<Stages<u32>, EncodeError> {
        let k = self.fixed_width()?;
        let input_mask = ((1u64 << k) - 1) as u32;
        if bits & !input_mask != 0 {
            return Err(EncodeError::BitsOutOfRange {
                num_bits: self.params.num_bits,
            });
        }

        let (uniform, f_mask) = self.prr_masks(bits)?;
        let prr = (bits & !f_mask) | (uniform & f_mask);

        // Fresh draws on every call; a failed draw aborts the report.
        let p = self.deps.irr_rand.get_mask(self.params.prob_p, k)?;
        let q = self.deps.irr_rand.get_mask(self.params.prob_q, k)?;
        let irr = (p & !prr) | (q & prr);

        Ok(Stages {
            bloom: bits,
            prr,
            irr,
        })
    }

    /// [`encode_string`](Encoder::encode_string) returning every stage.
    /// Simulation only.
    pub fn encode_string_stages(&self, value: &[u8]) -> Result<Stages<u32>, EncodeError> {
        self.fixed_width()?;
        let bloom = bloom::project_u32(
            self.deps.hash,
            &self.cohort_prefix,
            value,
            self.params.num_bits,
            self.params.num_hashes as usize,
        )?;
        self.encode_bits_stages(bloom)
    }

    fn fixed_width(&self) -> Result<usize, EncodeError> {
        if self.params.num_bits > 32 {
            return Err(EncodeError::NotFixedWidth(self.params.num_bits));
        }
        Ok(self.params.num_bits as usize)
    }

    /// Derive the permanent masks for `bits`: one MAC byte per report
    /// bit, yielding a uniform bit (bit 0) and a noise decision (bits
    /// 1-7 against the ⌊f·128⌋ threshold).
    fn prr_masks(&self, bits: u32) -> Result<(u32, u32), EncodeError> {
        let k = self.params.num_bits as usize;
        let digest = self.prr_digest(&bits.to_be_bytes(), k)?;
        let threshold = Params::threshold128(self.params.prob_f);

        let mut uniform = 0u32;
        let mut f_mask = 0u32;
        for (i, &byte) in digest[..k].iter().enumerate() {
            uniform |= u32::from(byte & 1) << i;
            if (byte >> 1) < threshold {
                f_mask |= 1 << i;
            }
        }
        Ok((uniform, f_mask))
    }

    /// MAC stream backing the PRR masks, keyed by the client secret over
    /// `0x01 ‖ encoder_id ‖ bloom_bytes`.
    fn prr_digest(&self, bloom_bytes: &[u8], need: usize) -> Result<Vec<u8>, EncodeError> {
        let mut message = Vec::with_capacity(1 + self.encoder_id.len() + bloom_bytes.len());
        message.push(PRR_MESSAGE_TAG);
        message.extend_from_slice(self.encoder_id.as_bytes());
        message.extend_from_slice(bloom_bytes);

        let digest = self
            .deps
            .mac
            .mac(&self.deps.client_secret, &message, need);
        if digest.len() < need {
            warn!(need, got = digest.len(), "MAC output too short for PRR");
            return Err(EncodeError::MacTooShort {
                need,
                got: digest.len(),
            });
        }
        Ok(digest)
    }

    // ========================================================================
    // Extended profile (k a multiple of 8)
    // ========================================================================

    /// Encode a raw report buffer in the byte-reversed layout (bit 0 in
    /// the last byte). PRR then IRR.
    pub fn encode_bits_bytes(&self, bits: &[u8]) -> Result<Vec<u8>, EncodeError> {
        let num_bytes = self.wide_num_bytes()?;
        if bits.len() != num_bytes {
            return Err(EncodeError::WrongLength {
                need: num_bytes,
                got: bits.len(),
            });
        }
        Ok(self.randomize_bytes(bits)?.1)
    }

    /// Encode a string value through the Bloom projection, wide layout.
    pub fn encode_string_bytes(&self, value: &[u8]) -> Result<Vec<u8>, EncodeError> {
        Ok(self.encode_string_bytes_stages(value)?.irr)
    }

    /// Encode a string value and package the wide result for the
    /// collector.
    pub fn report_string_bytes(&self, value: &[u8]) -> Result<Report, EncodeError> {
        Ok(Report::from_bytes(
            &self.encoder_id,
            self.cohort,
            self.encode_string_bytes(value)?,
        ))
    }

    /// [`encode_string_bytes`](Encoder::encode_string_bytes) returning
    /// every stage. Simulation only.
    pub fn encode_string_bytes_stages(
        &self,
        value: &[u8],
    ) -> Result<Stages<Vec<u8>>, EncodeError> {
        self.wide_num_bytes()?;
        let bloom = bloom::project_bytes(
            self.deps.hash,
            &self.cohort_prefix,
            value,
            self.params.num_bits,
            self.params.num_hashes as usize,
        )?;
        let (prr, irr) = self.randomize_bytes(&bloom)?;
        Ok(Stages { bloom, prr, irr })
    }

    fn wide_num_bytes(&self) -> Result<usize, EncodeError> {
        if !self.params.num_bits.is_multiple_of(8) {
            return Err(EncodeError::NotByteAligned(self.params.num_bits));
        }
        Ok((self.params.num_bits / 8) as usize)
    }

    /// PRR then IRR over a byte buffer. Bit i of each mask sits in byte
    /// `(k/8 - 1) - i/8`, matching the Bloom layout.
    fn randomize_bytes(&self, bloom: &[u8]) -> Result<(Vec<u8>, Vec<u8>), EncodeError> {
        let k = self.params.num_bits as usize;
        let num_bytes = bloom.len();

        let digest = self.prr_digest(bloom, k)?;
        let threshold = Params::threshold128(self.params.prob_f);

        let mut uniform = vec![0u8; num_bytes];
        let mut f_mask = vec![0u8; num_bytes];
        for (i, &byte) in digest[..k].iter().enumerate() {
            if byte & 1 == 1 {
                bloom::set_bit(&mut uniform, i);
            }
            if (byte >> 1) < threshold {
                bloom::set_bit(&mut f_mask, i);
            }
        }

        let mut prr = vec![0u8; num_bytes];
        for j in 0..num_bytes {
            prr[j] = (bloom[j] & !f_mask[j]) | (uniform[j] & f_mask[j]);
        }

        // The randomness source yields 32-bit draws; each (P, Q) pair
        // covers exactly four output bytes, indexed big-endian. Draws
        // are never reused across reports.
        let mut irr = vec![0u8; num_bytes];
        for group in (0..num_bytes).step_by(4) {
            let p = self.deps.irr_rand.get_mask(self.params.prob_p, 32)?;
            let q = self.deps.irr_rand.get_mask(self.params.prob_q, 32)?;
            let p_bytes = p.to_be_bytes();
            let q_bytes = q.to_be_bytes();
            for w in 0..4 {
                let j = group + w;
                if j >= num_bytes {
                    break;
                }
                irr[j] = (p_bytes[w] & !prr[j]) | (q_bytes[w] & prr[j]);
            }
        }

        Ok((prr, irr))
    }
}

/// Derive the stable cohort for this client: the first four bytes of the
/// keyed MAC over the empty message, read little-endian and masked to
/// `[0, num_cohorts)`. A power-of-two cohort count makes the mask an
/// unbiased reduction.
fn assign_cohort(deps: &Deps<'_>, num_cohorts: u32) -> Result<u32, ParamsError> {
    let digest = deps.mac.mac(&deps.client_secret, &[], 4);
    if digest.len() < 4 {
        return Err(ParamsError::MacTooShort {
            need: 4,
            got: digest.len(),
        });
    }
    let raw = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    Ok(raw & (num_cohorts - 1))
}
