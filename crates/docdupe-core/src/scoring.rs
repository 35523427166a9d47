//! Pairwise duplicate scoring.
//!
//! A pair is scored from up to three weighted components:
//!
//! | Component | Source | Weight | Quick-mode weight |
//! |-----------|--------|--------|-------------------|
//! | Jaccard | MinHash signatures | 0.4 | 0.6 |
//! | Size ratio | `min(size) / max(size)` | 0.1 | 0.4 |
//! | Fuzzy text | token-sort ratio of text samples | 0.3 | n/a |
//!
//! Components that cannot be computed are left out of both the numerator
//! and the denominator. Quick mode skips the fuzzy comparison entirely and
//! is used as a cheap gate: only pairs whose quick score reaches
//! [`QUICK_GATE_FACTOR`] × threshold pay for the fuzzy stage.
//!
//! The quick score only gates; the score that is accepted and stored is
//! always the weighted mean of the full-mode components, so a stored
//! confidence can be recomputed from the stored components.
//!
//! Title similarity is recorded as `filename_similarity` for persistence
//! and later recalculation, but does not contribute to the detection score.

use crate::minhash::Signature;
use crate::models::ComponentScores;
use crate::normalize::normalize_text;

pub const DEFAULT_FUZZY_SAMPLE_SIZE: usize = 5000;

/// Fraction of the threshold a quick score must reach before the full
/// (fuzzy) comparison runs.
pub const QUICK_GATE_FACTOR: f64 = 0.8;

const JACCARD_WEIGHT: f64 = 0.4;
const SIZE_WEIGHT: f64 = 0.1;
const FUZZY_WEIGHT: f64 = 0.3;
const QUICK_JACCARD_WEIGHT: f64 = 0.6;
const QUICK_SIZE_WEIGHT: f64 = 0.4;

/// The view of a document the scorer needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoringDoc<'a> {
    pub id: i64,
    pub file_size: Option<i64>,
    pub signature: Option<&'a Signature>,
    /// Prepared with [`PairScorer::prepare_sample`].
    pub sample: Option<&'a str>,
    pub title: Option<&'a str>,
}

/// Result of scoring one pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairScore {
    pub score: f64,
    pub components: ComponentScores,
    pub quick: bool,
}

/// Scores document pairs.
#[derive(Debug, Clone)]
pub struct PairScorer {
    enable_fuzzy: bool,
    fuzzy_sample_size: usize,
}

impl Default for PairScorer {
    fn default() -> Self {
        Self::new(true, DEFAULT_FUZZY_SAMPLE_SIZE)
    }
}

impl PairScorer {
    pub fn new(enable_fuzzy: bool, fuzzy_sample_size: usize) -> Self {
        Self {
            enable_fuzzy,
            fuzzy_sample_size,
        }
    }

    pub fn fuzzy_enabled(&self) -> bool {
        self.enable_fuzzy && self.fuzzy_sample_size > 0
    }

    /// Turn raw OCR text into the token-sorted sample compared by the fuzzy
    /// component: the first `fuzzy_sample_size` characters, normalized, with
    /// tokens sorted so word order does not matter.
    ///
    /// Returns `None` when fuzzy matching is disabled or nothing remains.
    pub fn prepare_sample(&self, raw: Option<&str>) -> Option<String> {
        if !self.fuzzy_enabled() {
            return None;
        }
        let raw = raw?;
        let head: String = raw.chars().take(self.fuzzy_sample_size).collect();
        let normalized = normalize_text(Some(&head));
        let mut tokens: Vec<&str> = normalized.split_whitespace().collect();
        if tokens.is_empty() {
            return None;
        }
        tokens.sort_unstable();
        Some(tokens.join(" "))
    }

    /// Score a pair. In quick mode only the signature and size components
    /// are computed.
    pub fn score(&self, a: &ScoringDoc<'_>, b: &ScoringDoc<'_>, quick_mode: bool) -> PairScore {
        let jaccard = match (a.signature, b.signature) {
            (Some(sa), Some(sb)) => sa.jaccard(sb),
            _ => None,
        };
        let size_ratio = size_ratio(a.file_size, b.file_size);

        if quick_mode {
            let score = weighted_mean(&[
                (jaccard, QUICK_JACCARD_WEIGHT),
                (size_ratio, QUICK_SIZE_WEIGHT),
            ]);
            return PairScore {
                score: score.unwrap_or(0.0),
                components: ComponentScores {
                    jaccard_similarity: jaccard,
                    metadata_similarity: size_ratio,
                    ..ComponentScores::default()
                },
                quick: true,
            };
        }

        let fuzzy = if self.fuzzy_enabled() {
            match (a.sample, b.sample) {
                (Some(x), Some(y)) if !x.is_empty() && !y.is_empty() => {
                    Some(strsim::normalized_levenshtein(x, y))
                }
                _ => None,
            }
        } else {
            None
        };

        let score = weighted_mean(&[
            (jaccard, JACCARD_WEIGHT),
            (size_ratio, SIZE_WEIGHT),
            (fuzzy, FUZZY_WEIGHT),
        ])
        .unwrap_or(0.0);

        PairScore {
            score,
            components: ComponentScores {
                jaccard_similarity: jaccard,
                fuzzy_text_ratio: fuzzy,
                metadata_similarity: size_ratio,
                filename_similarity: title_similarity(a.title, b.title),
            },
            quick: false,
        }
    }

    /// Two-phase verification against `threshold`.
    ///
    /// Returns the full score when the pair is accepted as a duplicate.
    pub fn verify(&self, a: &ScoringDoc<'_>, b: &ScoringDoc<'_>, threshold: f64) -> Option<PairScore> {
        let quick = self.score(a, b, true);
        if quick.score < QUICK_GATE_FACTOR * threshold {
            return None;
        }
        let full = self.score(a, b, false);
        (full.score >= threshold).then_some(full)
    }
}

fn size_ratio(a: Option<i64>, b: Option<i64>) -> Option<f64> {
    let (a, b) = (a?, b?);
    if a < 0 || b < 0 {
        return None;
    }
    let (lo, hi) = (a.min(b), a.max(b));
    if hi == 0 {
        return None;
    }
    Some(lo as f64 / hi as f64)
}

fn title_similarity(a: Option<&str>, b: Option<&str>) -> Option<f64> {
    let a = normalize_text(a);
    let b = normalize_text(b);
    if a.is_empty() || b.is_empty() {
        return None;
    }
    Some(strsim::normalized_levenshtein(&a, &b))
}

fn weighted_mean(parts: &[(Option<f64>, f64)]) -> Option<f64> {
    let (sum, weight) = parts
        .iter()
        .filter_map(|(v, w)| v.map(|v| (v * w, *w)))
        .fold((0.0, 0.0), |(s, t), (vw, w)| (s + vw, t + w));
    (weight > 0.0).then(|| sum / weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minhash::SignatureBuilder;

    struct Owned {
        id: i64,
        size: Option<i64>,
        signature: Option<Signature>,
        sample: Option<String>,
        title: Option<String>,
    }

    impl Owned {
        fn new(scorer: &PairScorer, id: i64, text: &str, size: Option<i64>) -> Self {
            let builder = SignatureBuilder::default();
            Self {
                id,
                size,
                signature: builder.build_from_raw(Some(text)),
                sample: scorer.prepare_sample(Some(text)),
                title: None,
            }
        }

        fn view(&self) -> ScoringDoc<'_> {
            ScoringDoc {
                id: self.id,
                file_size: self.size,
                signature: self.signature.as_ref(),
                sample: self.sample.as_deref(),
                title: self.title.as_deref(),
            }
        }
    }

    const MEMO: &str = "Please find attached the signed lease agreement for the warehouse \
        on Harbor Street. The tenant agrees to pay rent on the first business day of each \
        month and to keep the loading dock clear of debris at all times.";

    #[test]
    fn identical_text_equal_size_scores_high() {
        let scorer = PairScorer::default();
        let a = Owned::new(&scorer, 1, MEMO, Some(2048));
        let b = Owned::new(&scorer, 2, MEMO, Some(2048));
        let full = scorer.score(&a.view(), &b.view(), false);
        assert!(full.score >= 0.95, "score {}", full.score);
        assert_eq!(full.components.jaccard_similarity, Some(1.0));
        assert_eq!(full.components.fuzzy_text_ratio, Some(1.0));
        assert_eq!(full.components.metadata_similarity, Some(1.0));
    }

    #[test]
    fn disjoint_vocabulary_and_sizes_score_low() {
        let scorer = PairScorer::default();
        let a = Owned::new(&scorer, 1, MEMO, Some(1000));
        let b = Owned::new(
            &scorer,
            2,
            "Quarterly revenue report: gross margin improved across every regional segment",
            Some(4000),
        );
        let full = scorer.score(&a.view(), &b.view(), false);
        assert!(full.score < 0.3, "score {}", full.score);
    }

    #[test]
    fn full_score_is_weighted_mean_of_components() {
        let scorer = PairScorer::default();
        let pairs = [
            (
                MEMO,
                Some(2048),
                "Please find attached the signed lease agreement for the garage",
                Some(2000),
            ),
            (MEMO, Some(1000), "cats and dogs", Some(10)),
            ("Invoice 12345 total $500", Some(24), "Invoice l2345 total $5OO", Some(24)),
        ];
        for (i, (ta, sa, tb, sb)) in pairs.iter().enumerate() {
            let a = Owned::new(&scorer, 2 * i as i64, ta, *sa);
            let b = Owned::new(&scorer, 2 * i as i64 + 1, tb, *sb);
            let full = scorer.score(&a.view(), &b.view(), false);
            let c = full.components;
            let (j, m, f) = (
                c.jaccard_similarity.unwrap(),
                c.metadata_similarity.unwrap(),
                c.fuzzy_text_ratio.unwrap(),
            );
            let expected = (0.4 * j + 0.1 * m + 0.3 * f) / 0.8;
            assert!((full.score - expected).abs() < 1e-12, "{} vs {}", full.score, expected);
        }
    }

    #[test]
    fn disjoint_vocabulary_with_similar_sizes_scores_low() {
        let scorer = PairScorer::default();
        let a = Owned::new(&scorer, 1, MEMO, Some(1000));
        let b = Owned::new(
            &scorer,
            2,
            "Quarterly revenue report: gross margin improved across every regional segment",
            Some(900),
        );
        let quick = scorer.score(&a.view(), &b.view(), true);
        let full = scorer.score(&a.view(), &b.view(), false);
        assert!(quick.score >= 0.3, "quick {}", quick.score);
        assert!(full.score < 0.3, "full {}", full.score);
    }

    #[test]
    fn absent_components_are_not_zero() {
        let scorer = PairScorer::default();
        let sig = SignatureBuilder::default().build_from_raw(Some(MEMO)).unwrap();
        let a = ScoringDoc {
            id: 1,
            signature: Some(&sig),
            ..ScoringDoc::default()
        };
        let b = ScoringDoc {
            id: 2,
            signature: Some(&sig),
            ..ScoringDoc::default()
        };
        let quick = scorer.score(&a, &b, true);
        assert_eq!(quick.score, 1.0);
        assert_eq!(quick.components.metadata_similarity, None);

        let empty = scorer.score(&ScoringDoc::default(), &ScoringDoc::default(), false);
        assert_eq!(empty.score, 0.0);
        assert_eq!(empty.components, ComponentScores::default());
    }

    #[test]
    fn size_ratio_edge_cases() {
        assert_eq!(size_ratio(Some(50), Some(100)), Some(0.5));
        assert_eq!(size_ratio(Some(100), Some(50)), Some(0.5));
        assert_eq!(size_ratio(Some(0), Some(0)), None);
        assert_eq!(size_ratio(None, Some(10)), None);
    }

    #[test]
    fn fuzzy_ignores_word_order() {
        let scorer = PairScorer::default();
        let a = scorer.prepare_sample(Some("total due invoice")).unwrap();
        let b = scorer.prepare_sample(Some("Invoice: total due")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fuzzy_sample_is_bounded() {
        let scorer = PairScorer::new(true, 10);
        assert_eq!(
            scorer.prepare_sample(Some("abcdefghij klmnop")).as_deref(),
            Some("abcdefghij")
        );
        assert!(PairScorer::new(false, 10).prepare_sample(Some("abc")).is_none());
    }

    #[test]
    fn disabled_fuzzy_leaves_component_absent() {
        let scorer = PairScorer::new(false, 5000);
        let a = Owned::new(&scorer, 1, MEMO, Some(100));
        let b = Owned::new(&scorer, 2, MEMO, Some(100));
        let full = scorer.score(&a.view(), &b.view(), false);
        assert_eq!(full.components.fuzzy_text_ratio, None);
        assert!((full.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn verify_gates_on_quick_score() {
        let scorer = PairScorer::default();
        let a = Owned::new(&scorer, 1, "Invoice 12345 total $500", None);
        let b = Owned::new(&scorer, 2, "Invoice l2345 total $5OO", None);
        let accepted = scorer.verify(&a.view(), &b.view(), 0.5).unwrap();
        assert!(accepted.score >= 0.5);
        assert!(!accepted.quick);

        let c = Owned::new(&scorer, 3, "cats and dogs", None);
        let d = Owned::new(&scorer, 4, "quarterly revenue report", None);
        assert!(scorer.verify(&c.view(), &d.view(), 0.3).is_none());
    }

    #[test]
    fn title_similarity_is_recorded_but_not_weighted() {
        let scorer = PairScorer::default();
        let mut a = Owned::new(&scorer, 1, MEMO, Some(100));
        let mut b = Owned::new(&scorer, 2, MEMO, Some(100));
        let untitled = scorer.score(&a.view(), &b.view(), false).score;
        a.title = Some("Lease 2023.pdf".to_string());
        b.title = Some("lease-2024.pdf".to_string());
        let titled = scorer.score(&a.view(), &b.view(), false);
        assert!(titled.components.filename_similarity.unwrap() > 0.7);
        assert_eq!(titled.score, untitled);
    }
}
