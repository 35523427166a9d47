//! # docdupe Core
//!
//! The near-duplicate detection engine shared by the `docdupe` application:
//! data models, text normalization, MinHash signatures, the LSH index,
//! pairwise scoring, grouping, confidence recalculation, and the store
//! abstraction.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Orchestration
//! (incremental runs, persistence, progress) lives in the `docdupe` crate.
//!
//! ## Pipeline
//!
//! ```text
//! normalize ─▶ SignatureBuilder ─▶ LshIndex::insert
//!                                      │
//!              LshIndex::query ◀───────┘
//!                    │
//!                    ▼
//!              PairScorer::verify ─▶ Grouper ─▶ GroupDraft
//! ```

pub mod confidence;
pub mod grouping;
pub mod lsh;
pub mod minhash;
pub mod models;
pub mod normalize;
pub mod scoring;
pub mod store;

pub use confidence::{recalculate_confidence, ConfidenceWeights, WeightsError};
pub use grouping::{Candidate, GroupDraft, Grouper};
pub use lsh::{LshError, LshIndex};
pub use minhash::{Signature, SignatureBuilder, SignatureError};
pub use models::{ComponentScores, Document, DuplicateGroup, DuplicateMember, ProcessingStatus};
pub use normalize::normalize_text;
pub use scoring::{PairScore, PairScorer, ScoringDoc};

/// Version tag written to every [`DuplicateGroup`] produced by this engine.
pub const ALGORITHM_VERSION: &str = "minhash-lsh/1";
