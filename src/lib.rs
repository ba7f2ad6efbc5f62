//! RAPPOR: Randomized Aggregatable Privacy-Preserving Ordinal Response
//!
//! Client-side encoder that turns a categorical or string-valued
//! observation into a noisy bit vector safe to send to an aggregator.
//! Any single report gives the client plausible deniability, while a
//! large collection of reports still lets the aggregator estimate the
//! population-wide distribution.
//!
//! ## Encoding pipeline
//!
//! Every report passes through three stages:
//!
//! | Stage | Output | Randomness |
//! |-------|--------|------------|
//! | Bloom | h of k bits set from MD5(cohort ‖ value) | none |
//! | PRR   | Bloom bits masked by per-(client, metric, value) noise | deterministic (HMAC) |
//! | IRR   | PRR bits re-randomized through the (p, q) channel | fresh per report |
//!
//! The PRR ("permanent" randomized response) is the memoized stage: the
//! same client reporting the same value always produces the same PRR, so
//! repeated reports do not average away the noise. The IRR is what
//! actually leaves the client.
//!
//! Cohort assignment happens once per encoder: each client is pinned to a
//! bucket in `[0, num_cohorts)` derived from its secret, so independent
//! clients hash values through different Bloom projections.
//!
//! ## Example
//!
//! ```
//! use rappor::{Deps, Encoder, HmacSha256Mac, KernelRand, Md5Hash, Params};
//!
//! let params = Params {
//!     num_bits: 16,
//!     num_hashes: 2,
//!     num_cohorts: 64,
//!     prob_f: 0.5,
//!     prob_p: 0.5,
//!     prob_q: 0.75,
//! };
//! let hash = Md5Hash;
//! let mac = HmacSha256Mac;
//! let rand = KernelRand;
//! let deps = Deps::new(&hash, b"32 bytes of stable client entropy".as_slice(), &mac, &rand);
//!
//! let encoder = Encoder::new("app.popup-choice", &params, &deps)?;
//! let irr = encoder.encode_string(b"never")?;
//! assert!(irr < 1 << 16);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bloom;
pub mod deps;
pub mod drbg;
pub mod encoder;
pub mod params;

pub use bloom::BloomError;
pub use deps::{
    BloomHash, Deps, HmacDrbgMac, HmacSha256Mac, IrrRand, KernelRand, Md5Hash, PrrMac, RandError,
    SeededRand,
};
pub use drbg::HmacDrbg;
pub use encoder::{EncodeError, Encoder, Report, Stages};
pub use params::{Params, ParamsError};
