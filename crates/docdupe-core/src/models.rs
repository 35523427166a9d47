//! Core data models shared by the engine and every store backend.
//!
//! Documents and their content are written by ingestion; groups and
//! members are written only by the analysis controller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Analysis state of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    /// Needs analysis on the next run.
    Pending,
    /// Being analyzed by the current run. Never persisted across runs.
    Processing,
    Completed,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Error => "error",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "error" => Ok(ProcessingStatus::Error),
            other => anyhow::bail!("unknown processing status: '{}'", other),
        }
    }
}

/// OCR text of a document (1:1 with [`Document`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentContent {
    pub text: String,
    pub word_count: i64,
}

/// A document as seen by the engine.
///
/// Store backends adapt their rows to this type at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: i64,
    pub external_id: String,
    pub title: Option<String>,
    /// Content hash, unique across the corpus.
    pub fingerprint: String,
    /// Serialized [`Signature`](crate::minhash::Signature) blob.
    pub minhash_signature: Option<Vec<u8>>,
    pub processing_status: ProcessingStatus,
    pub file_size: Option<i64>,
    /// Unix seconds.
    pub created_date: i64,
    /// Unix seconds.
    pub last_processed: Option<i64>,
    pub content: Option<DocumentContent>,
}

impl Document {
    pub fn text(&self) -> Option<&str> {
        self.content.as_ref().map(|c| c.text.as_str())
    }
}

/// Raw component scores kept alongside a group's confidence.
///
/// `None` means the component could not be computed, which is not the
/// same thing as a score of zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub jaccard_similarity: Option<f64>,
    pub fuzzy_text_ratio: Option<f64>,
    /// File size ratio `min(size) / max(size)`. The only metadata compared
    /// today, so the `metadata` weight in
    /// [`ConfidenceWeights`](crate::confidence::ConfidenceWeights) acts on
    /// this value. Shown as `SIZE` by `ddup groups list`.
    pub metadata_similarity: Option<f64>,
    pub filename_similarity: Option<f64>,
}

/// A persisted group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateMember {
    pub group_id: i64,
    pub document_id: i64,
    pub is_primary: bool,
}

/// A persisted duplicate group with its members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: i64,
    pub confidence_score: f64,
    #[serde(flatten)]
    pub components: ComponentScores,
    pub algorithm_version: String,
    pub reviewed: bool,
    pub resolved: bool,
    /// Unix seconds.
    pub created_at: i64,
    pub members: Vec<DuplicateMember>,
}

impl DuplicateGroup {
    pub fn primary(&self) -> Option<i64> {
        self.members
            .iter()
            .find(|m| m.is_primary)
            .map(|m| m.document_id)
    }

    pub fn contains(&self, document_id: i64) -> bool {
        self.members.iter().any(|m| m.document_id == document_id)
    }
}
