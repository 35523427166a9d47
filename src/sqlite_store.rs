//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation onto the schema created by
//! [`migrate`](crate::migrate). [`Store::apply_run`] runs inside a single
//! transaction; every `checkpoint_every` writes the open savepoint is
//! released and a new one started, and the task yields to the runtime.
//! Any error drops the transaction, which rolls back the whole run.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use docdupe_core::models::{
    ComponentScores, Document, DocumentContent, DuplicateGroup, DuplicateMember,
};
use docdupe_core::store::{
    AnalysisRun, DocumentInput, RunMode, RunOutcome, RunReport, RunStatus, SignatureUpdate, Store,
    UpsertOutcome,
};

const DEFAULT_CHECKPOINT_EVERY: usize = 250;

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    checkpoint_every: usize,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
        }
    }

    pub fn with_checkpoint_every(mut self, every: usize) -> Self {
        self.checkpoint_every = every.max(1);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Release the current savepoint and open the next one once enough
    /// writes have accumulated.
    async fn checkpoint(&self, tx: &mut Transaction<'_, Sqlite>, writes: &mut usize) -> Result<()> {
        *writes += 1;
        if *writes % self.checkpoint_every != 0 {
            return Ok(());
        }
        sqlx::query("RELEASE SAVEPOINT run_checkpoint")
            .execute(&mut **tx)
            .await?;
        sqlx::query("SAVEPOINT run_checkpoint")
            .execute(&mut **tx)
            .await?;
        tracing::debug!(writes = *writes, "analysis write checkpoint");
        tokio::task::yield_now().await;
        Ok(())
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn word_count(text: &str) -> i64 {
    text.split_whitespace().count() as i64
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("processing_status");
    let text: Option<String> = row.get("text");
    let content = text.map(|text| DocumentContent {
        word_count: row.get::<Option<i64>, _>("word_count").unwrap_or(0),
        text,
    });
    Ok(Document {
        id: row.get("id"),
        external_id: row.get("external_id"),
        title: row.get("title"),
        fingerprint: row.get("fingerprint"),
        minhash_signature: row.get("minhash_signature"),
        processing_status: status.parse()?,
        file_size: row.get("file_size"),
        created_date: row.get("created_date"),
        last_processed: row.get("last_processed"),
        content,
    })
}

fn row_to_run(row: &SqliteRow) -> Result<AnalysisRun> {
    let mode: String = row.get("mode");
    let status: String = row.get("status");
    Ok(AnalysisRun {
        id: row.get("id"),
        mode: mode.parse::<RunMode>()?,
        status: status.parse::<RunStatus>()?,
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        documents_processed: row.get("documents_processed"),
        groups_created: row.get("groups_created"),
        message: row.get("message"),
    })
}

const RUN_COLUMNS: &str = "id, mode, status, started_at, finished_at, documents_processed, \
                           groups_created, message";

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_document(&self, input: &DocumentInput) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let duplicate: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE fingerprint = ? AND external_id != ?",
        )
        .bind(&input.fingerprint)
        .bind(&input.external_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(id) = duplicate {
            return Ok(UpsertOutcome::ExactDuplicate(id));
        }

        let existing: Option<(i64, String)> =
            sqlx::query_as("SELECT id, fingerprint FROM documents WHERE external_id = ?")
                .bind(&input.external_id)
                .fetch_optional(&mut *tx)
                .await?;

        let outcome = match existing {
            Some((id, fingerprint)) if fingerprint == input.fingerprint => {
                sqlx::query("UPDATE documents SET title = ?, file_size = ? WHERE id = ?")
                    .bind(&input.title)
                    .bind(input.file_size)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                UpsertOutcome::Unchanged(id)
            }
            Some((id, _)) => {
                sqlx::query(
                    r#"
                    UPDATE documents
                    SET title = ?, fingerprint = ?, file_size = ?, processing_status = 'pending'
                    WHERE id = ?
                    "#,
                )
                .bind(&input.title)
                .bind(&input.fingerprint)
                .bind(input.file_size)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Updated(id)
            }
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO documents (external_id, title, fingerprint, processing_status,
                                           file_size, created_date)
                    VALUES (?, ?, ?, 'pending', ?, ?)
                    "#,
                )
                .bind(&input.external_id)
                .bind(&input.title)
                .bind(&input.fingerprint)
                .bind(input.file_size)
                .bind(now())
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Inserted(result.last_insert_rowid())
            }
        };

        if let UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) = outcome {
            sqlx::query("DELETE FROM document_content WHERE document_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if let Some(text) = &input.text {
                sqlx::query(
                    "INSERT INTO document_content (document_id, text, word_count) VALUES (?, ?, ?)",
                )
                .bind(id)
                .bind(text)
                .bind(word_count(text))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn load_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, d.external_id, d.title, d.fingerprint, d.minhash_signature,
                   d.processing_status, d.file_size, d.created_date, d.last_processed,
                   c.text, c.word_count
            FROM documents d
            LEFT JOIN document_content c ON c.document_id = d.id
            ORDER BY d.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_document).collect()
    }

    async fn list_groups(&self) -> Result<Vec<DuplicateGroup>> {
        let group_rows = sqlx::query(
            r#"
            SELECT id, confidence_score, jaccard_similarity, fuzzy_text_ratio,
                   metadata_similarity, filename_similarity, algorithm_version,
                   reviewed, resolved, created_at
            FROM duplicate_groups
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut groups: BTreeMap<i64, DuplicateGroup> = BTreeMap::new();
        for row in &group_rows {
            let id: i64 = row.get("id");
            groups.insert(
                id,
                DuplicateGroup {
                    id,
                    confidence_score: row.get("confidence_score"),
                    components: ComponentScores {
                        jaccard_similarity: row.get("jaccard_similarity"),
                        fuzzy_text_ratio: row.get("fuzzy_text_ratio"),
                        metadata_similarity: row.get("metadata_similarity"),
                        filename_similarity: row.get("filename_similarity"),
                    },
                    algorithm_version: row.get("algorithm_version"),
                    reviewed: row.get("reviewed"),
                    resolved: row.get("resolved"),
                    created_at: row.get("created_at"),
                    members: Vec::new(),
                },
            );
        }

        let member_rows = sqlx::query(
            r#"
            SELECT group_id, document_id, is_primary
            FROM duplicate_members
            ORDER BY group_id, is_primary DESC, document_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for row in &member_rows {
            let group_id: i64 = row.get("group_id");
            if let Some(group) = groups.get_mut(&group_id) {
                group.members.push(DuplicateMember {
                    group_id,
                    document_id: row.get("document_id"),
                    is_primary: row.get("is_primary"),
                });
            }
        }

        Ok(groups.into_values().collect())
    }

    async fn mark_pending(&self, ids: &[i64]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut found = 0;
        for id in ids {
            let result =
                sqlx::query("UPDATE documents SET processing_status = 'pending' WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            found += result.rows_affected();
        }
        tx.commit().await?;
        Ok(found)
    }

    async fn apply_run(&self, outcome: &RunOutcome) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;

        if outcome.delete_all_groups {
            sqlx::query("DELETE FROM duplicate_members")
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM duplicate_groups")
                .execute(&mut *tx)
                .await?;
        } else {
            for group_id in &outcome.deleted_groups {
                sqlx::query("DELETE FROM duplicate_members WHERE group_id = ?")
                    .bind(group_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM duplicate_groups WHERE id = ?")
                    .bind(group_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query("SAVEPOINT run_checkpoint")
            .execute(&mut *tx)
            .await?;
        let mut writes = 0usize;

        let mut new_ids = Vec::with_capacity(outcome.new_groups.len());
        for group in &outcome.new_groups {
            let result = sqlx::query(
                r#"
                INSERT INTO duplicate_groups (confidence_score, jaccard_similarity,
                    fuzzy_text_ratio, metadata_similarity, filename_similarity,
                    algorithm_version, reviewed, resolved, created_at)
                VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?)
                "#,
            )
            .bind(group.confidence)
            .bind(group.components.jaccard_similarity)
            .bind(group.components.fuzzy_text_ratio)
            .bind(group.components.metadata_similarity)
            .bind(group.components.filename_similarity)
            .bind(&group.algorithm_version)
            .bind(group.created_at)
            .execute(&mut *tx)
            .await?;
            let group_id = result.last_insert_rowid();

            let members = std::iter::once((group.primary, true))
                .chain(group.duplicates.iter().map(|id| (*id, false)));
            for (document_id, is_primary) in members {
                sqlx::query(
                    "INSERT INTO duplicate_members (group_id, document_id, is_primary) VALUES (?, ?, ?)",
                )
                .bind(group_id)
                .bind(document_id)
                .bind(is_primary)
                .execute(&mut *tx)
                .await
                .with_context(|| {
                    format!("Failed to add document {} to group {}", document_id, group_id)
                })?;
            }
            new_ids.push(group_id);
            self.checkpoint(&mut tx, &mut writes).await?;
        }

        let mut stale = 0usize;
        for update in &outcome.document_updates {
            let query = match &update.signature {
                SignatureUpdate::Keep => sqlx::query(
                    "UPDATE documents SET processing_status = ?, last_processed = ? \
                     WHERE id = ? AND fingerprint = ?",
                )
                .bind(update.status.as_str())
                .bind(update.last_processed),
                SignatureUpdate::Set(blob) => sqlx::query(
                    "UPDATE documents SET processing_status = ?, last_processed = ?, \
                     minhash_signature = ? WHERE id = ? AND fingerprint = ?",
                )
                .bind(update.status.as_str())
                .bind(update.last_processed)
                .bind(blob.as_slice()),
                SignatureUpdate::Clear => sqlx::query(
                    "UPDATE documents SET processing_status = ?, last_processed = ?, \
                     minhash_signature = NULL WHERE id = ? AND fingerprint = ?",
                )
                .bind(update.status.as_str())
                .bind(update.last_processed),
            };
            let result = query
                .bind(update.id)
                .bind(&update.expected_fingerprint)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                let exists: Option<(i64,)> =
                    sqlx::query_as("SELECT id FROM documents WHERE id = ?")
                        .bind(update.id)
                        .fetch_optional(&mut *tx)
                        .await?;
                if exists.is_none() {
                    bail!("document {} does not exist", update.id);
                }
                // Re-ingested after the run loaded it; stays pending.
                tracing::debug!(document = update.id, "document changed during analysis; update skipped");
                stale += 1;
                continue;
            }
            self.checkpoint(&mut tx, &mut writes).await?;
        }

        sqlx::query("RELEASE SAVEPOINT run_checkpoint")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::debug!(
            groups = new_ids.len(),
            documents = outcome.document_updates.len() - stale,
            stale,
            "analysis results committed"
        );
        Ok(new_ids)
    }

    async fn set_group_confidence(&self, group_id: i64, confidence: f64) -> Result<()> {
        let result = sqlx::query("UPDATE duplicate_groups SET confidence_score = ? WHERE id = ?")
            .bind(confidence)
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("group not found: {}", group_id);
        }
        Ok(())
    }

    async fn active_run(&self) -> Result<Option<AnalysisRun>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM analysis_runs WHERE status = 'running' ORDER BY id DESC LIMIT 1",
            RUN_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_run).transpose()
    }

    async fn begin_run(&self, mode: RunMode) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO analysis_runs (mode, status, started_at) VALUES (?, 'running', ?)",
        )
        .bind(mode.as_str())
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn finish_run(&self, run_id: i64, report: &RunReport) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_runs
            SET status = ?, finished_at = ?, documents_processed = ?, groups_created = ?,
                message = ?
            WHERE id = ?
            "#,
        )
        .bind(report.status.as_str())
        .bind(now())
        .bind(report.documents_processed)
        .bind(report.groups_created)
        .bind(&report.message)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("analysis run not found: {}", run_id);
        }
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<AnalysisRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM analysis_runs ORDER BY id DESC LIMIT ?",
            RUN_COLUMNS
        ))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_run).collect()
    }
}
