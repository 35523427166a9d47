//! Word-shingle MinHash signatures.
//!
//! A [`SignatureBuilder`] turns normalized text into a fixed-length
//! [`Signature`] whose slot-wise agreement with another signature estimates
//! the Jaccard similarity of the two documents' 3-word shingle sets.
//!
//! Hashing is fully deterministic: the permutation coefficients come from a
//! fixed-seed generator and shingles are hashed with FNV-1a, so identical
//! text always produces bit-identical signatures across processes and
//! platforms. This is what makes persisted signatures reusable.

use std::collections::HashSet;

use crate::normalize::normalize_text;

/// Tokens per shingle.
pub const SHINGLE_SIZE: usize = 3;

pub const DEFAULT_NUM_PERM: usize = 192;
pub const DEFAULT_MIN_WORD_COUNT: usize = 3;

const MERSENNE_PRIME: u64 = (1 << 61) - 1;
const MAX_HASH: u64 = 0xFFFF_FFFF;
const PERMUTATION_SEED: u64 = 1;

const BLOB_MAGIC: &[u8; 2] = b"MH";
const BLOB_VERSION: u8 = 1;
const BLOB_HEADER_LEN: usize = 5;

/// Errors raised while configuring a builder or decoding a signature blob.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("num_perm must be in [1, {max}], got {got}", max = u16::MAX)]
    InvalidPermutations { got: usize },
    #[error("signature blob is too short ({0} bytes)")]
    Truncated(usize),
    #[error("signature blob has an unknown header")]
    BadMagic,
    #[error("unsupported signature blob version {0}")]
    UnsupportedVersion(u8),
    #[error("signature blob declares {declared} slots but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

/// A MinHash signature: one minimum per hash permutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    values: Vec<u32>,
}

impl Signature {
    pub fn from_values(values: Vec<u32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[u32] {
        &self.values
    }

    /// Number of permutation slots.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Estimated Jaccard similarity: the fraction of matching slots.
    ///
    /// Returns `None` when the signatures have different lengths (built
    /// with different permutation counts) or are empty.
    pub fn jaccard(&self, other: &Signature) -> Option<f64> {
        if self.values.len() != other.values.len() || self.values.is_empty() {
            return None;
        }
        let matches = self
            .values
            .iter()
            .zip(other.values.iter())
            .filter(|(a, b)| a == b)
            .count();
        Some(matches as f64 / self.values.len() as f64)
    }

    /// Serialize to the versioned blob stored in `documents.minhash_signature`.
    ///
    /// Layout: `b"MH"`, version byte, slot count (`u16` LE), then each slot
    /// as `u32` LE.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(BLOB_HEADER_LEN + self.values.len() * 4);
        bytes.extend_from_slice(BLOB_MAGIC);
        bytes.push(BLOB_VERSION);
        bytes.extend_from_slice(&(self.values.len() as u16).to_le_bytes());
        for v in &self.values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    /// Decode a blob produced by [`Signature::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        if bytes.len() < BLOB_HEADER_LEN {
            return Err(SignatureError::Truncated(bytes.len()));
        }
        if &bytes[..2] != BLOB_MAGIC {
            return Err(SignatureError::BadMagic);
        }
        if bytes[2] != BLOB_VERSION {
            return Err(SignatureError::UnsupportedVersion(bytes[2]));
        }
        let declared = u16::from_le_bytes([bytes[3], bytes[4]]) as usize;
        let body = &bytes[BLOB_HEADER_LEN..];
        if body.len() != declared * 4 {
            return Err(SignatureError::LengthMismatch {
                declared,
                actual: body.len() / 4,
            });
        }
        let values = body
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { values })
    }
}

/// Builds signatures with a fixed number of permutations.
#[derive(Debug, Clone)]
pub struct SignatureBuilder {
    min_word_count: usize,
    permutations: Vec<(u64, u64)>,
}

impl SignatureBuilder {
    pub fn new(num_perm: usize, min_word_count: usize) -> Result<Self, SignatureError> {
        if num_perm == 0 || num_perm > u16::MAX as usize {
            return Err(SignatureError::InvalidPermutations { got: num_perm });
        }
        Ok(Self::generate(num_perm, min_word_count))
    }

    fn generate(num_perm: usize, min_word_count: usize) -> Self {
        let mut state = PERMUTATION_SEED;
        let permutations = (0..num_perm)
            .map(|_| {
                let a = 1 + splitmix64(&mut state) % (MERSENNE_PRIME - 1);
                let b = splitmix64(&mut state) % MERSENNE_PRIME;
                (a, b)
            })
            .collect();

        Self {
            min_word_count,
            permutations,
        }
    }

    pub fn num_perm(&self) -> usize {
        self.permutations.len()
    }

    pub fn min_word_count(&self) -> usize {
        self.min_word_count
    }

    /// Signature for already-normalized text.
    ///
    /// Returns `None` when the text has fewer than `min_word_count` tokens
    /// (or no tokens at all).
    pub fn build(&self, normalized: &str) -> Option<Signature> {
        let tokens: Vec<String> = normalized.split_whitespace().map(fold_ocr_digits).collect();
        if tokens.is_empty() || tokens.len() < self.min_word_count {
            return None;
        }

        let mut mins = vec![u32::MAX; self.permutations.len()];
        for shingle in shingles(&tokens) {
            let h = fnv1a64(shingle.as_bytes());
            for (slot, &(a, b)) in mins.iter_mut().zip(self.permutations.iter()) {
                let permuted = permute(h, a, b);
                if permuted < *slot {
                    *slot = permuted;
                }
            }
        }
        Some(Signature { values: mins })
    }

    /// Normalize raw OCR text and build its signature.
    pub fn build_from_raw(&self, raw: Option<&str>) -> Option<Signature> {
        self.build(&normalize_text(raw))
    }
}

impl Default for SignatureBuilder {
    fn default() -> Self {
        Self::generate(DEFAULT_NUM_PERM, DEFAULT_MIN_WORD_COUNT)
    }
}

/// Distinct 3-token shingles. Fewer than three tokens form one shingle.
fn shingles(tokens: &[String]) -> HashSet<String> {
    if tokens.len() < SHINGLE_SIZE {
        return std::iter::once(tokens.join(" ")).collect();
    }
    tokens
        .windows(SHINGLE_SIZE)
        .map(|w| w.join(" "))
        .collect()
}

/// Fold glyphs OCR commonly confuses with digits inside numeric tokens.
///
/// Only tokens that already contain an ASCII digit are touched, so `l2345`
/// becomes `12345` while ordinary words keep their spelling.
fn fold_ocr_digits(token: &str) -> String {
    if !token.bytes().any(|b| b.is_ascii_digit()) {
        return token.to_string();
    }
    token
        .chars()
        .map(|c| match c {
            'o' => '0',
            'l' | 'i' => '1',
            's' => '5',
            'b' => '8',
            'z' => '2',
            other => other,
        })
        .collect()
}

fn permute(h: u64, a: u64, b: u64) -> u32 {
    let v = (a as u128 * h as u128 + b as u128) % MERSENNE_PRIME as u128;
    (v as u64 & MAX_HASH) as u32
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x00000100000001B3;
    let mut state = OFFSET;
    for &b in bytes {
        state ^= b as u64;
        state = state.wrapping_mul(PRIME);
    }
    state
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
