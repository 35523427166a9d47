//! Greedy duplicate grouping over LSH candidates.
//!
//! Documents are visited in ascending id order. Each unassigned document
//! becomes an anchor: its LSH candidates are verified with the two-phase
//! [`PairScorer::verify`] and every accepted candidate joins the anchor's
//! group. A document is assigned at most once, so the first group that
//! accepts it wins; overlapping candidate sets are *not* merged
//! transitively. Groups with no accepted candidates are dropped.

use std::collections::{HashMap, HashSet};

use crate::lsh::LshIndex;
use crate::minhash::Signature;
use crate::models::ComponentScores;
use crate::scoring::{PairScore, PairScorer, ScoringDoc};

/// A document eligible for grouping (it has a signature).
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: i64,
    pub file_size: Option<i64>,
    pub title: Option<String>,
    pub signature: Signature,
    /// Token-sorted fuzzy sample, see [`PairScorer::prepare_sample`].
    pub sample: Option<String>,
}

impl Candidate {
    pub fn view(&self) -> ScoringDoc<'_> {
        ScoringDoc {
            id: self.id,
            file_size: self.file_size,
            signature: Some(&self.signature),
            sample: self.sample.as_deref(),
            title: self.title.as_deref(),
        }
    }
}

/// A group found by the engine, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupDraft {
    /// The anchor document.
    pub primary: i64,
    /// Accepted members with their score against the anchor, in id order.
    pub duplicates: Vec<(i64, PairScore)>,
    /// Mean of the pairwise scores against the anchor.
    pub confidence: f64,
    /// Per-component means over the pairs where the component was present.
    pub components: ComponentScores,
}

impl GroupDraft {
    /// All member ids, primary first.
    pub fn member_ids(&self) -> Vec<i64> {
        std::iter::once(self.primary)
            .chain(self.duplicates.iter().map(|(id, _)| *id))
            .collect()
    }

    fn from_pairs(primary: i64, duplicates: Vec<(i64, PairScore)>) -> Self {
        let n = duplicates.len() as f64;
        let confidence = duplicates.iter().map(|(_, s)| s.score).sum::<f64>() / n;
        let mean_of = |pick: fn(&ComponentScores) -> Option<f64>| {
            let present: Vec<f64> = duplicates
                .iter()
                .filter_map(|(_, s)| pick(&s.components))
                .collect();
            (!present.is_empty()).then(|| present.iter().sum::<f64>() / present.len() as f64)
        };
        let components = ComponentScores {
            jaccard_similarity: mean_of(|c| c.jaccard_similarity),
            fuzzy_text_ratio: mean_of(|c| c.fuzzy_text_ratio),
            metadata_similarity: mean_of(|c| c.metadata_similarity),
            filename_similarity: mean_of(|c| c.filename_similarity),
        };
        Self {
            primary,
            duplicates,
            confidence,
            components,
        }
    }
}

/// Stepwise grouping pass.
///
/// [`Grouper::process`] handles one anchor at a time so callers can
/// interleave progress reporting or yield between steps; [`Grouper::run`]
/// drives the whole pass.
pub struct Grouper<'a> {
    candidates: &'a [Candidate],
    order: Vec<usize>,
    positions: HashMap<i64, usize>,
    index: &'a LshIndex,
    scorer: &'a PairScorer,
    threshold: f64,
    assigned: HashSet<i64>,
    comparisons: u64,
}

impl<'a> Grouper<'a> {
    pub fn new(
        candidates: &'a [Candidate],
        index: &'a LshIndex,
        scorer: &'a PairScorer,
        threshold: f64,
    ) -> Self {
        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by_key(|&i| candidates[i].id);
        let positions = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id, i))
            .collect();
        Self {
            candidates,
            order,
            positions,
            index,
            scorer,
            threshold,
            assigned: HashSet::new(),
            comparisons: 0,
        }
    }

    /// Number of anchor steps.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Exclude a document from grouping, e.g. because it already belongs
    /// to a persisted group that is being kept.
    pub fn mark_assigned(&mut self, doc_id: i64) {
        self.assigned.insert(doc_id);
    }

    pub fn is_assigned(&self, doc_id: i64) -> bool {
        self.assigned.contains(&doc_id)
    }

    /// Pairs that went through [`PairScorer::verify`] so far.
    pub fn comparisons(&self) -> u64 {
        self.comparisons
    }

    /// Process the anchor at `step` (in id order).
    pub fn process(&mut self, step: usize) -> Option<GroupDraft> {
        let candidates = self.candidates;
        let anchor = &candidates[*self.order.get(step)?];
        if !self.assigned.insert(anchor.id) {
            return None;
        }

        let anchor_view = anchor.view();
        let mut duplicates = Vec::new();
        for id in self.index.query(&anchor.signature) {
            if id == anchor.id || self.assigned.contains(&id) {
                continue;
            }
            let Some(&pos) = self.positions.get(&id) else {
                continue;
            };
            self.comparisons += 1;
            let other = candidates[pos].view();
            if let Some(score) = self.scorer.verify(&anchor_view, &other, self.threshold) {
                duplicates.push((id, score));
            }
        }

        if duplicates.is_empty() {
            return None;
        }
        for (id, _) in &duplicates {
            self.assigned.insert(*id);
        }
        tracing::debug!(
            primary = anchor.id,
            members = duplicates.len() + 1,
            "duplicate group found"
        );
        Some(GroupDraft::from_pairs(anchor.id, duplicates))
    }

    /// Run every step and collect the groups.
    pub fn run(mut self) -> Vec<GroupDraft> {
        (0..self.len()).filter_map(|step| self.process(step)).collect()
    }
}
