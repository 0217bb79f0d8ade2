//! Contribution entropy.
//!
//! Soundness of the whole ceremony rests on no single party knowing the full
//! toxic waste. Every contribution therefore draws a fresh token from a
//! cryptographically strong generator; tokens are handed straight to the
//! proving-system CLI and never written to disk, logged or reused.

use std::fmt;

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};

/// Bytes of randomness per token. 256 bits, comfortably above the 160-bit
/// floor needed to rule out collisions between runs.
pub const ENTROPY_BYTES: usize = 32;

/// A hex-encoded random token. `Debug` and `Display` are redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct EntropyToken(String);

impl EntropyToken {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    /// The raw token, for passing to the contribution command only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EntropyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EntropyToken(<redacted>)")
    }
}

impl fmt::Display for EntropyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

pub trait EntropySource {
    fn next_token(&mut self) -> EntropyToken;
}

/// Entropy drawn from any cryptographically secure RNG. Production uses
/// [`OsRng`]; tests seed a `StdRng` to get reproducible tokens.
pub struct RngEntropy<R> {
    rng: R,
}

impl<R: RngCore + CryptoRng> RngEntropy<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl RngEntropy<OsRng> {
    pub fn os() -> Self {
        Self::new(OsRng)
    }
}

impl<R: RngCore + CryptoRng> EntropySource for RngEntropy<R> {
    fn next_token(&mut self) -> EntropyToken {
        let mut bytes = [0u8; ENTROPY_BYTES];
        self.rng.fill_bytes(&mut bytes);
        EntropyToken::from_bytes(&bytes)
    }
}
