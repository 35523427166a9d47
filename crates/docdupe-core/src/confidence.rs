//! Confidence recalculation from stored component scores.
//!
//! Operators tune how much each similarity component counts. Rather than
//! re-running detection, a group's confidence is recomputed from the raw
//! component scores persisted with it.

use serde::{Deserialize, Serialize};

use crate::models::ComponentScores;

const WEIGHT_TOTAL: f64 = 100.0;
const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WeightsError {
    #[error("weight for {0} must be a finite, non-negative number")]
    Invalid(&'static str),
    #[error("weights must sum to 100 when all four are set (got {0})")]
    BadTotal(f64),
}

/// Operator weights per component. `None` or `0` disables a component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceWeights {
    #[serde(default)]
    pub jaccard: Option<f64>,
    #[serde(default)]
    pub fuzzy: Option<f64>,
    /// Applies to the file size ratio stored as `metadata_similarity`.
    #[serde(default)]
    pub metadata: Option<f64>,
    #[serde(default)]
    pub filename: Option<f64>,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            jaccard: Some(40.0),
            fuzzy: Some(30.0),
            metadata: Some(20.0),
            filename: Some(10.0),
        }
    }
}

impl ConfidenceWeights {
    pub fn validate(&self) -> Result<(), WeightsError> {
        let named = [
            ("jaccard", self.jaccard),
            ("fuzzy", self.fuzzy),
            ("metadata", self.metadata),
            ("filename", self.filename),
        ];
        for (name, w) in named {
            if let Some(w) = w {
                if !w.is_finite() || w < 0.0 {
                    return Err(WeightsError::Invalid(name));
                }
            }
        }
        if let [Some(a), Some(b), Some(c), Some(d)] = named.map(|(_, w)| w) {
            let total = a + b + c + d;
            if (total - WEIGHT_TOTAL).abs() > WEIGHT_TOLERANCE {
                return Err(WeightsError::BadTotal(total));
            }
        }
        Ok(())
    }

    /// `(component value, weight)` for every component that is enabled.
    fn enabled_pairs(&self, scores: &ComponentScores) -> [(Option<f64>, Option<f64>); 4] {
        let on = |w: Option<f64>| w.filter(|w| *w > 0.0);
        [
            (scores.jaccard_similarity, on(self.jaccard)),
            (scores.fuzzy_text_ratio, on(self.fuzzy)),
            (scores.metadata_similarity, on(self.metadata)),
            (scores.filename_similarity, on(self.filename)),
        ]
    }
}

/// Recompute a confidence from stored component scores.
///
/// The result is the weighted mean over components that are both present
/// and enabled; a disabled or missing component is excluded from the
/// numerator and the denominator alike. Returns `None` when no component
/// qualifies.
pub fn recalculate_confidence(scores: &ComponentScores, weights: &ConfidenceWeights) -> Option<f64> {
    let (sum, total) = weights
        .enabled_pairs(scores)
        .iter()
        .filter_map(|(v, w)| Some((v.as_ref()?, w.as_ref()?)))
        .fold((0.0, 0.0), |(s, t), (v, w)| (s + v * w, t + w));
    (total > 0.0).then(|| (sum / total).clamp(0.0, 1.0))
}
