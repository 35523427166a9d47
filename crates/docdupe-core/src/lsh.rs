//! Banded locality-sensitive hashing over MinHash signatures.
//!
//! Each signature is split into `bands` runs of `rows_per_band` slots and
//! every band is hashed into a bucket. Two documents become candidates when
//! at least one band lands in the same bucket, which happens with
//! probability `1 - (1 - s^r)^b` for true similarity `s`. Candidates are
//! only *likely* above the threshold and must still be verified.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};

use crate::minhash::Signature;

const INTEGRATION_STEPS: usize = 200;

/// Errors for LSH index construction and insertion.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LshError {
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    #[error("signature has {got} slots, index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// In-memory LSH index keyed by document id.
#[derive(Debug)]
pub struct LshIndex {
    num_perm: usize,
    threshold: f64,
    bands: usize,
    rows_per_band: usize,
    buckets: Vec<HashMap<u64, Vec<i64>>>,
    ids: HashSet<i64>,
}

impl LshIndex {
    /// Create an index for signatures of `num_perm` slots.
    ///
    /// When `num_bands` is `None`, the banding is chosen to minimize the
    /// combined false-positive and false-negative probability mass around
    /// `threshold`.
    pub fn new(num_perm: usize, threshold: f64, num_bands: Option<usize>) -> Result<Self, LshError> {
        if num_perm == 0 {
            return Err(LshError::InvalidParam("num_perm must be >= 1"));
        }
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(LshError::InvalidParam("threshold must be in (0, 1)"));
        }
        let (bands, rows_per_band) = match num_bands {
            Some(0) => return Err(LshError::InvalidParam("num_bands must be >= 1")),
            Some(b) if b > num_perm => {
                return Err(LshError::InvalidParam("num_bands must not exceed num_perm"))
            }
            Some(b) => (b, num_perm / b),
            None => optimal_bands(threshold, num_perm),
        };

        Ok(Self {
            num_perm,
            threshold,
            bands,
            rows_per_band,
            buckets: (0..bands).map(|_| HashMap::new()).collect(),
            ids: HashSet::new(),
        })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    pub fn rows_per_band(&self) -> usize {
        self.rows_per_band
    }

    /// Number of distinct documents inserted.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, doc_id: i64) -> bool {
        self.ids.contains(&doc_id)
    }

    /// Drop every bucket.
    pub fn clear(&mut self) {
        for band in &mut self.buckets {
            band.clear();
        }
        self.ids.clear();
    }

    /// Add `doc_id` to the bucket of each of its bands.
    ///
    /// Inserting an id a second time is a no-op.
    pub fn insert(&mut self, doc_id: i64, signature: &Signature) -> Result<(), LshError> {
        self.check_len(signature)?;
        if !self.ids.insert(doc_id) {
            return Ok(());
        }
        for (band_idx, key) in self.band_keys(signature).enumerate() {
            self.buckets[band_idx].entry(key).or_default().push(doc_id);
        }
        Ok(())
    }

    /// Every inserted id sharing at least one bucket with `signature`.
    ///
    /// A signature of the wrong length matches nothing.
    pub fn query(&self, signature: &Signature) -> BTreeSet<i64> {
        let mut candidates = BTreeSet::new();
        if self.check_len(signature).is_err() {
            return candidates;
        }
        for (band_idx, key) in self.band_keys(signature).enumerate() {
            if let Some(ids) = self.buckets[band_idx].get(&key) {
                candidates.extend(ids.iter().copied());
            }
        }
        candidates
    }

    fn check_len(&self, signature: &Signature) -> Result<(), LshError> {
        if signature.len() != self.num_perm {
            return Err(LshError::DimensionMismatch {
                expected: self.num_perm,
                got: signature.len(),
            });
        }
        Ok(())
    }

    fn band_keys<'a>(&self, signature: &'a Signature) -> impl Iterator<Item = u64> + 'a {
        signature
            .values()
            .chunks_exact(self.rows_per_band)
            .take(self.bands)
            .map(hash_band)
    }
}

fn hash_band(values: &[u32]) -> u64 {
    let mut hasher = DefaultHasher::new();
    values.hash(&mut hasher);
    hasher.finish()
}

/// Pick `(bands, rows)` with `bands * rows <= num_perm` minimizing the
/// equally weighted false-positive and false-negative areas under the
/// candidate-probability curve.
fn optimal_bands(threshold: f64, num_perm: usize) -> (usize, usize) {
    let mut best = (1, num_perm);
    let mut best_error = f64::INFINITY;
    for b in 1..=num_perm {
        for r in 1..=(num_perm / b) {
            let fp = integrate(|s| candidate_probability(s, b, r), 0.0, threshold);
            let fneg = integrate(|s| 1.0 - candidate_probability(s, b, r), threshold, 1.0);
            let error = 0.5 * fp + 0.5 * fneg;
            if error < best_error {
                best_error = error;
                best = (b, r);
            }
        }
    }
    best
}

fn candidate_probability(s: f64, bands: usize, rows: usize) -> f64 {
    1.0 - (1.0 - s.powi(rows as i32)).powi(bands as i32)
}

fn integrate(f: impl Fn(f64) -> f64, lo: f64, hi: f64) -> f64 {
    let step = (hi - lo) / INTEGRATION_STEPS as f64;
    (0..INTEGRATION_STEPS)
        .map(|i| f(lo + (i as f64 + 0.5) * step) * step)
        .sum()
}
