//! Cryptographic hash-based entropy conditioning.
//!
//! Uses standard hash functions to compress raw, low-density input into
//! uniformly distributed output of the requested length.

use blake3::Hasher as Blake3Hasher;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Domain separator mixed into every conditioning call.
const CONDITIONING_DOMAIN: &[u8] = b"entropy-feeder-condition-v1";

/// Supported hash algorithms for conditioning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// BLAKE3 in extendable-output mode - fast, recommended default.
    #[default]
    Blake3,
    /// SHA-256 in counter mode - widely deployed, conservative choice.
    Sha256,
}

/// Entropy conditioner using cryptographic hashing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Conditioner {
    algorithm: HashAlgorithm,
}

impl Conditioner {
    /// Creates a new conditioner with the specified algorithm.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Returns the configured algorithm.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Compresses `raw` into `out_len` output bytes.
    ///
    /// The output never carries more entropy than `raw` did; callers
    /// must size `raw` so the compression ratio supports their claim.
    pub fn condition(&self, raw: &[u8], out_len: usize) -> Vec<u8> {
        let mut stream = self.stream();
        stream.update(raw);
        stream.finish(out_len)
    }

    /// Starts an incremental conditioning pass, for input too large to
    /// buffer.
    pub fn stream(&self) -> ConditioningStream {
        let state = match self.algorithm {
            HashAlgorithm::Blake3 => {
                let mut hasher = Blake3Hasher::new();
                hasher.update(CONDITIONING_DOMAIN);
                StreamState::Blake3(Box::new(hasher))
            }
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(CONDITIONING_DOMAIN);
                StreamState::Sha256(hasher)
            }
        };
        ConditioningStream { state }
    }
}

enum StreamState {
    Blake3(Box<Blake3Hasher>),
    Sha256(Sha256),
}

/// Raw input fed to a [`Conditioner`] piece by piece.
///
/// Produces the same output as [`Conditioner::condition`] over the
/// concatenated input.
pub struct ConditioningStream {
    state: StreamState,
}

impl ConditioningStream {
    pub fn update(&mut self, raw: &[u8]) {
        match &mut self.state {
            StreamState::Blake3(hasher) => {
                hasher.update(raw);
            }
            StreamState::Sha256(hasher) => hasher.update(raw),
        }
    }

    /// Consumes the stream and emits `out_len` bytes.
    pub fn finish(self, out_len: usize) -> Vec<u8> {
        let mut out = vec![0u8; out_len];
        match self.state {
            StreamState::Blake3(hasher) => hasher.finalize_xof().fill(&mut out),
            StreamState::Sha256(hasher) => {
                let seed = hasher.finalize();
                // Counter mode over the compressed input.
                for (counter, chunk) in out.chunks_mut(32).enumerate() {
                    let mut hasher = Sha256::new();
                    hasher.update(seed);
                    hasher.update((counter as u64).to_le_bytes());
                    let block = hasher.finalize();
                    chunk.copy_from_slice(&block[..chunk.len()]);
                }
            }
        }
        out
    }
}
