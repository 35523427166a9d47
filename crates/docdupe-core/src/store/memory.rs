//! In-memory [`Store`] implementation for tests and embedding.
//!
//! All state lives behind a single `std::sync::RwLock`, so every
//! [`Store::apply_run`] is validated in full before anything is mutated and
//! is therefore atomic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{Document, DocumentContent, DuplicateGroup, DuplicateMember, ProcessingStatus};

use super::{
    AnalysisRun, DocumentInput, RunMode, RunOutcome, RunReport, RunStatus, SignatureUpdate, Store,
    UpsertOutcome,
};

#[derive(Default)]
struct State {
    docs: BTreeMap<i64, Document>,
    groups: BTreeMap<i64, DuplicateGroup>,
    runs: BTreeMap<i64, AnalysisRun>,
    next_doc_id: i64,
    next_group_id: i64,
    next_run_id: i64,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    fail_next_apply: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next [`Store::apply_run`] fail without writing anything.
    pub fn fail_next_apply(&self) {
        self.fail_next_apply.store(true, Ordering::SeqCst);
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn word_count(text: &str) -> i64 {
    text.split_whitespace().count() as i64
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_document(&self, input: &DocumentInput) -> Result<UpsertOutcome> {
        let mut state = self.write()?;

        if let Some(dup) = state
            .docs
            .values()
            .find(|d| d.fingerprint == input.fingerprint && d.external_id != input.external_id)
        {
            return Ok(UpsertOutcome::ExactDuplicate(dup.id));
        }

        let content = input.text.as_ref().map(|t| DocumentContent {
            text: t.clone(),
            word_count: word_count(t),
        });

        if let Some(doc) = state
            .docs
            .values_mut()
            .find(|d| d.external_id == input.external_id)
        {
            doc.title = input.title.clone();
            doc.file_size = input.file_size;
            if doc.fingerprint == input.fingerprint {
                return Ok(UpsertOutcome::Unchanged(doc.id));
            }
            doc.fingerprint = input.fingerprint.clone();
            doc.content = content;
            doc.processing_status = ProcessingStatus::Pending;
            return Ok(UpsertOutcome::Updated(doc.id));
        }

        state.next_doc_id += 1;
        let id = state.next_doc_id;
        state.docs.insert(
            id,
            Document {
                id,
                external_id: input.external_id.clone(),
                title: input.title.clone(),
                fingerprint: input.fingerprint.clone(),
                minhash_signature: None,
                processing_status: ProcessingStatus::Pending,
                file_size: input.file_size,
                created_date: now(),
                last_processed: None,
                content,
            },
        );
        Ok(UpsertOutcome::Inserted(id))
    }

    async fn load_documents(&self) -> Result<Vec<Document>> {
        Ok(self.read()?.docs.values().cloned().collect())
    }

    async fn list_groups(&self) -> Result<Vec<DuplicateGroup>> {
        Ok(self.read()?.groups.values().cloned().collect())
    }

    async fn mark_pending(&self, ids: &[i64]) -> Result<u64> {
        let mut state = self.write()?;
        let mut found = 0;
        for id in ids {
            if let Some(doc) = state.docs.get_mut(id) {
                doc.processing_status = ProcessingStatus::Pending;
                found += 1;
            }
        }
        Ok(found)
    }

    async fn apply_run(&self, outcome: &RunOutcome) -> Result<Vec<i64>> {
        if self.fail_next_apply.swap(false, Ordering::SeqCst) {
            bail!("simulated persistence failure");
        }
        let mut state = self.write()?;

        // Validate everything first so a rejected run leaves no trace.
        let deleted: HashSet<i64> = if outcome.delete_all_groups {
            state.groups.keys().copied().collect()
        } else {
            outcome.deleted_groups.iter().copied().collect()
        };
        let mut grouped: HashMap<i64, i64> = state
            .groups
            .values()
            .filter(|g| !deleted.contains(&g.id))
            .flat_map(|g| g.members.iter().map(|m| (m.document_id, m.group_id)))
            .collect();
        for group in &outcome.new_groups {
            for id in std::iter::once(group.primary).chain(group.duplicates.iter().copied()) {
                if !state.docs.contains_key(&id) {
                    bail!("group member {} does not exist", id);
                }
                if let Some(existing) = grouped.insert(id, -1) {
                    bail!("document {} is already in group {}", id, existing);
                }
            }
        }
        for update in &outcome.document_updates {
            if !state.docs.contains_key(&update.id) {
                bail!("document {} does not exist", update.id);
            }
        }

        for id in &deleted {
            state.groups.remove(id);
        }

        let mut new_ids = Vec::with_capacity(outcome.new_groups.len());
        for group in &outcome.new_groups {
            state.next_group_id += 1;
            let id = state.next_group_id;
            let members = std::iter::once((group.primary, true))
                .chain(group.duplicates.iter().map(|d| (*d, false)))
                .map(|(document_id, is_primary)| DuplicateMember {
                    group_id: id,
                    document_id,
                    is_primary,
                })
                .collect();
            state.groups.insert(
                id,
                DuplicateGroup {
                    id,
                    confidence_score: group.confidence,
                    components: group.components,
                    algorithm_version: group.algorithm_version.clone(),
                    reviewed: false,
                    resolved: false,
                    created_at: group.created_at,
                    members,
                },
            );
            new_ids.push(id);
        }

        for update in &outcome.document_updates {
            if let Some(doc) = state
                .docs
                .get_mut(&update.id)
                .filter(|d| d.fingerprint == update.expected_fingerprint)
            {
                doc.processing_status = update.status;
                doc.last_processed = Some(update.last_processed);
                match &update.signature {
                    SignatureUpdate::Keep => {}
                    SignatureUpdate::Set(blob) => doc.minhash_signature = Some(blob.clone()),
                    SignatureUpdate::Clear => doc.minhash_signature = None,
                }
            }
        }

        Ok(new_ids)
    }

    async fn set_group_confidence(&self, group_id: i64, confidence: f64) -> Result<()> {
        let mut state = self.write()?;
        let group = state
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| anyhow!("group not found: {}", group_id))?;
        group.confidence_score = confidence;
        Ok(())
    }

    async fn active_run(&self) -> Result<Option<AnalysisRun>> {
        Ok(self
            .read()?
            .runs
            .values()
            .rev()
            .find(|r| r.status == RunStatus::Running)
            .cloned())
    }

    async fn begin_run(&self, mode: RunMode) -> Result<i64> {
        let mut state = self.write()?;
        state.next_run_id += 1;
        let id = state.next_run_id;
        state.runs.insert(
            id,
            AnalysisRun {
                id,
                mode,
                status: RunStatus::Running,
                started_at: now(),
                finished_at: None,
                documents_processed: 0,
                groups_created: 0,
                message: None,
            },
        );
        Ok(id)
    }

    async fn finish_run(&self, run_id: i64, report: &RunReport) -> Result<()> {
        let mut state = self.write()?;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow!("analysis run not found: {}", run_id))?;
        run.status = report.status;
        run.finished_at = Some(now());
        run.documents_processed = report.documents_processed;
        run.groups_created = report.groups_created;
        run.message = report.message.clone();
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<AnalysisRun>> {
        Ok(self
            .read()?
            .runs
            .values()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
