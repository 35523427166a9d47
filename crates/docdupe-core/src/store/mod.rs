//! Storage abstraction for docdupe.
//!
//! The [`Store`] trait defines every persistence operation the analysis
//! controller and the CLI need, so the engine can run against SQLite in
//! production and an in-memory store in tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::models::{ComponentScores, Document, DuplicateGroup, ProcessingStatus};

/// A document as handed over by ingestion.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub external_id: String,
    pub title: Option<String>,
    pub fingerprint: String,
    pub file_size: Option<i64>,
    pub text: Option<String>,
}

/// What [`Store::upsert_document`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New document, queued as pending.
    Inserted(i64),
    /// Content changed, re-queued as pending.
    Updated(i64),
    Unchanged(i64),
    /// Another document already has this exact fingerprint; nothing written.
    ExactDuplicate(i64),
}

/// How a document's stored signature changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureUpdate {
    Keep,
    Set(Vec<u8>),
    Clear,
}

/// Analysis result for one document.
///
/// Only applied while the stored fingerprint still equals
/// `expected_fingerprint`. A document re-ingested after the run loaded it
/// keeps its new content and `pending` status.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentUpdate {
    pub id: i64,
    /// Fingerprint the run saw when it loaded the document.
    pub expected_fingerprint: String,
    pub status: ProcessingStatus,
    pub signature: SignatureUpdate,
    pub last_processed: i64,
}

/// A group to be created by [`Store::apply_run`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewGroup {
    pub confidence: f64,
    pub components: ComponentScores,
    pub algorithm_version: String,
    pub primary: i64,
    /// Non-primary members.
    pub duplicates: Vec<i64>,
    pub created_at: i64,
}

/// Everything one analysis run writes. Applied atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    /// Delete every existing group before creating new ones.
    pub delete_all_groups: bool,
    pub deleted_groups: Vec<i64>,
    pub new_groups: Vec<NewGroup>,
    pub document_updates: Vec<DocumentUpdate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Incremental,
    Force,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Incremental => "incremental",
            RunMode::Force => "force",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "incremental" => Ok(RunMode::Incremental),
            "force" => Ok(RunMode::Force),
            other => anyhow::bail!("unknown run mode: '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => anyhow::bail!("unknown run status: '{}'", other),
        }
    }
}

/// Bookkeeping row for one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRun {
    pub id: i64,
    pub mode: RunMode,
    pub status: RunStatus,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub documents_processed: i64,
    pub groups_created: i64,
    pub message: Option<String>,
}

/// Terminal state reported through [`Store::finish_run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub status: RunStatus,
    pub documents_processed: i64,
    pub groups_created: i64,
    pub message: Option<String>,
}

/// Abstract storage backend for docdupe.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_document`](Store::upsert_document) | Ingestion boundary: insert or update a document and its text |
/// | [`load_documents`](Store::load_documents) | All documents with content, ordered by id |
/// | [`list_groups`](Store::list_groups) | All groups with members, ordered by id |
/// | [`mark_pending`](Store::mark_pending) | Queue documents for re-analysis |
/// | [`apply_run`](Store::apply_run) | Atomically persist one run's results |
/// | [`set_group_confidence`](Store::set_group_confidence) | Persist a recalculated confidence |
/// | [`active_run`](Store::active_run) | Mutual-exclusion check |
/// | [`begin_run`](Store::begin_run) / [`finish_run`](Store::finish_run) | Run bookkeeping |
/// | [`recent_runs`](Store::recent_runs) | Run history, newest first |
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_document(&self, input: &DocumentInput) -> Result<UpsertOutcome>;

    async fn load_documents(&self) -> Result<Vec<Document>>;

    async fn list_groups(&self) -> Result<Vec<DuplicateGroup>>;

    /// Returns how many documents were found.
    async fn mark_pending(&self, ids: &[i64]) -> Result<u64>;

    /// Apply every change of a run in one atomic unit: either all of it is
    /// visible afterwards or none of it. Document updates whose fingerprint
    /// no longer matches are skipped, not treated as errors. Returns the new
    /// group ids in the order of `outcome.new_groups`.
    async fn apply_run(&self, outcome: &RunOutcome) -> Result<Vec<i64>>;

    async fn set_group_confidence(&self, group_id: i64, confidence: f64) -> Result<()>;

    /// The currently running analysis, if any.
    async fn active_run(&self) -> Result<Option<AnalysisRun>>;

    async fn begin_run(&self, mode: RunMode) -> Result<i64>;

    async fn finish_run(&self, run_id: i64, report: &RunReport) -> Result<()>;

    async fn recent_runs(&self, limit: i64) -> Result<Vec<AnalysisRun>>;
}
