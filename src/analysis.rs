//! Incremental analysis controller.
//!
//! Decides which documents need work, rebuilds the LSH index from fresh and
//! cached signatures, regroups everything that is not held by a surviving
//! group, and hands the whole result to [`Store::apply_run`] as one atomic
//! [`RunOutcome`].
//!
//! # Modes
//!
//! | Mode | Work set | Groups deleted |
//! |------|----------|----------------|
//! | [`RunMode::Incremental`] | `pending` and `error` documents | every group containing or matching a work-set document |
//! | [`RunMode::Force`] | every document | all groups |
//!
//! A group "matches" a work-set document when one of its members passes
//! [`PairScorer::verify`] against it. Such a group is dissolved so the new
//! document can join it; every other group is left byte-identical.
//!
//! Nothing is written until grouping has finished, so a cancelled or
//! timed-out run leaves the database exactly as it found it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use docdupe_core::grouping::{Candidate, Grouper};
use docdupe_core::models::{Document, ProcessingStatus};
use docdupe_core::store::{
    DocumentUpdate, NewGroup, RunMode, RunOutcome, RunReport, RunStatus, SignatureUpdate, Store,
};
use docdupe_core::{LshIndex, PairScorer, Signature, SignatureBuilder, ALGORITHM_VERSION};

use crate::config::Config;
use crate::db;
use crate::progress::{ProgressMode, RunHandle};
use crate::sqlite_store::SqliteStore;

/// Tunables for one analysis run.
#[derive(Debug, Clone)]
pub struct AnalysisParams {
    pub num_perm: usize,
    pub min_word_count: usize,
    pub lsh_threshold: f64,
    pub lsh_num_bands: Option<usize>,
    /// Acceptance threshold for the full pairwise score.
    pub threshold: f64,
    pub enable_fuzzy: bool,
    pub fuzzy_sample_size: usize,
    pub progress_every: usize,
    pub yield_every: usize,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self::from_config_parts(&Default::default(), &Default::default())
    }
}

impl AnalysisParams {
    pub fn from_config(config: &Config) -> Self {
        Self::from_config_parts(&config.detection, &config.analysis)
    }

    fn from_config_parts(
        detection: &crate::config::DetectionConfig,
        analysis: &crate::config::AnalysisConfig,
    ) -> Self {
        Self {
            num_perm: detection.minhash_num_perm,
            min_word_count: detection.min_word_count,
            lsh_threshold: detection.lsh_threshold,
            lsh_num_bands: detection.lsh_num_bands,
            threshold: detection.fuzzy_threshold,
            enable_fuzzy: detection.enable_fuzzy,
            fuzzy_sample_size: detection.fuzzy_sample_size,
            progress_every: analysis.progress_every.max(1),
            yield_every: analysis.yield_every.max(1),
        }
    }
}

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisSummary {
    /// Size of the work set.
    pub documents_processed: usize,
    pub signatures_computed: usize,
    /// Work-set documents that ended in `error`.
    pub errors: usize,
    pub groups_deleted: usize,
    pub groups_created: usize,
    pub comparisons: u64,
    pub new_group_ids: Vec<i64>,
}

/// Run one analysis pass against `store`.
///
/// Returns an error without writing anything if the handle is cancelled
/// before persistence. Persistence failures are propagated after the store
/// has rolled back.
pub async fn run_analysis(
    store: &dyn Store,
    params: &AnalysisParams,
    mode: RunMode,
    handle: &RunHandle,
) -> Result<AnalysisSummary> {
    let builder = SignatureBuilder::new(params.num_perm, params.min_word_count)?;
    let scorer = PairScorer::new(params.enable_fuzzy, params.fuzzy_sample_size);
    let mut index = LshIndex::new(params.num_perm, params.lsh_threshold, params.lsh_num_bands)?;

    let documents = store.load_documents().await?;
    let existing_groups = store.list_groups().await?;
    let total = documents.len() as u64;

    let work: BTreeSet<i64> = documents
        .iter()
        .filter(|d| match mode {
            RunMode::Force => true,
            RunMode::Incremental => matches!(
                d.processing_status,
                ProcessingStatus::Pending | ProcessingStatus::Processing | ProcessingStatus::Error
            ),
        })
        .map(|d| d.id)
        .collect();

    info!(
        mode = %mode,
        documents = documents.len(),
        work_set = work.len(),
        "analysis started"
    );

    let mut summary = AnalysisSummary {
        documents_processed: work.len(),
        ..AnalysisSummary::default()
    };
    let mut updates = Vec::new();
    let mut candidates = Vec::new();

    // Phase 1: signatures.
    for (i, doc) in documents.iter().enumerate() {
        let step = i + 1;
        let in_work = work.contains(&doc.id);
        let cached = if in_work {
            None
        } else {
            cached_signature(doc, builder.num_perm())
        };

        let signature = match cached {
            Some(sig) => Some(sig),
            None if in_work || doc.minhash_signature.is_some() => {
                let sig = builder.build_from_raw(doc.text());
                if sig.is_some() {
                    summary.signatures_computed += 1;
                }
                let status = if doc.content.is_none() {
                    ProcessingStatus::Error
                } else if in_work {
                    ProcessingStatus::Completed
                } else {
                    doc.processing_status
                };
                if in_work && status == ProcessingStatus::Error {
                    summary.errors += 1;
                }
                if !in_work {
                    warn!(document = doc.id, "cached signature unusable; recomputed");
                }
                updates.push(DocumentUpdate {
                    id: doc.id,
                    expected_fingerprint: doc.fingerprint.clone(),
                    status,
                    signature: match &sig {
                        Some(s) => SignatureUpdate::Set(s.to_bytes()),
                        None => SignatureUpdate::Clear,
                    },
                    last_processed: chrono::Utc::now().timestamp(),
                });
                sig
            }
            // Completed document that never produced a signature.
            None => None,
        };

        if let Some(signature) = signature {
            index
                .insert(doc.id, &signature)
                .with_context(|| format!("Failed to index document {}", doc.id))?;
            candidates.push(Candidate {
                id: doc.id,
                file_size: doc.file_size,
                title: doc.title.clone(),
                signature,
                sample: scorer.prepare_sample(doc.text()),
            });
        }

        if step % params.progress_every == 0 {
            handle.report_progress("signatures", step as u64, total);
        }
        if step % params.yield_every == 0 {
            suspension_point(handle).await?;
        }
    }

    // Phase 2: stale groups.
    let (delete_all_groups, deleted_groups, kept_members) = match mode {
        RunMode::Force => (true, Vec::new(), HashSet::new()),
        RunMode::Incremental => {
            let mut deleted = BTreeSet::new();
            let mut owner: HashMap<i64, i64> = HashMap::new();
            for group in &existing_groups {
                if group.members.iter().any(|m| work.contains(&m.document_id)) {
                    deleted.insert(group.id);
                } else {
                    owner.extend(group.members.iter().map(|m| (m.document_id, group.id)));
                }
            }

            // A work-set document that matches a member of an otherwise
            // untouched group reopens that group so it can be regrouped.
            let positions: HashMap<i64, usize> = candidates
                .iter()
                .enumerate()
                .map(|(i, c)| (c.id, i))
                .collect();
            let incoming = candidates.iter().filter(|c| work.contains(&c.id));
            for (i, candidate) in incoming.enumerate() {
                for hit in index.query(&candidate.signature) {
                    let Some(&group_id) = owner.get(&hit) else {
                        continue;
                    };
                    if deleted.contains(&group_id) {
                        continue;
                    }
                    let Some(&pos) = positions.get(&hit) else {
                        continue;
                    };
                    summary.comparisons += 1;
                    let other = candidates[pos].view();
                    if scorer
                        .verify(&candidate.view(), &other, params.threshold)
                        .is_some()
                    {
                        debug!(group = group_id, document = candidate.id, "group reopened");
                        deleted.insert(group_id);
                    }
                }
                if (i + 1) % params.yield_every == 0 {
                    suspension_point(handle).await?;
                }
            }

            let kept: HashSet<i64> = owner
                .into_iter()
                .filter(|(_, group_id)| !deleted.contains(group_id))
                .map(|(doc_id, _)| doc_id)
                .collect();
            (false, deleted.into_iter().collect::<Vec<i64>>(), kept)
        }
    };
    summary.groups_deleted = if delete_all_groups {
        existing_groups.len()
    } else {
        deleted_groups.len()
    };

    // Phase 3: grouping.
    let mut grouper = Grouper::new(&candidates, &index, &scorer, params.threshold);
    for id in &kept_members {
        grouper.mark_assigned(*id);
    }
    let steps = grouper.len();
    let mut drafts = Vec::new();
    for step in 0..steps {
        if let Some(draft) = grouper.process(step) {
            drafts.push(draft);
        }
        let done = step + 1;
        if done % params.progress_every == 0 {
            handle.report_progress("grouping", done as u64, steps as u64);
        }
        if done % params.yield_every == 0 {
            suspension_point(handle).await?;
        }
    }
    summary.comparisons += grouper.comparisons();

    // Phase 4: persistence.
    suspension_point(handle).await?;
    let created_at = chrono::Utc::now().timestamp();
    let new_groups: Vec<NewGroup> = drafts
        .iter()
        .map(|d| NewGroup {
            confidence: d.confidence,
            components: d.components,
            algorithm_version: ALGORITHM_VERSION.to_string(),
            primary: d.primary,
            duplicates: d.duplicates.iter().map(|(id, _)| *id).collect(),
            created_at,
        })
        .collect();

    let outcome = RunOutcome {
        delete_all_groups,
        deleted_groups,
        new_groups,
        document_updates: updates,
    };
    summary.new_group_ids = store
        .apply_run(&outcome)
        .await
        .context("Failed to persist analysis results")?;
    summary.groups_created = summary.new_group_ids.len();

    handle.report_completion(total);
    info!(
        processed = summary.documents_processed,
        groups_created = summary.groups_created,
        groups_deleted = summary.groups_deleted,
        comparisons = summary.comparisons,
        "analysis finished"
    );
    Ok(summary)
}

/// Decode a stored signature, rejecting blobs built with different
/// parameters.
fn cached_signature(doc: &Document, num_perm: usize) -> Option<Signature> {
    let blob = doc.minhash_signature.as_deref()?;
    Signature::from_bytes(blob)
        .ok()
        .filter(|s| s.len() == num_perm)
}

async fn suspension_point(handle: &RunHandle) -> Result<()> {
    tokio::task::yield_now().await;
    if handle.is_cancelled() {
        bail!("analysis cancelled");
    }
    Ok(())
}

/// Run bookkeeping around [`run_analysis`]: refuse to overlap another
/// active run, record the run, and enforce the optional time limit.
pub async fn analyze_with_bookkeeping(
    store: &dyn Store,
    params: &AnalysisParams,
    mode: RunMode,
    handle: &RunHandle,
    ignore_active: bool,
    time_limit: Option<Duration>,
) -> Result<AnalysisSummary> {
    if let Some(active) = store.active_run().await? {
        if !ignore_active {
            bail!(
                "analysis run {} is already active (started at {}); use --ignore-active to override",
                active.id,
                active.started_at
            );
        }
        warn!(run = active.id, "ignoring active analysis run");
    }

    let run_id = store.begin_run(mode).await?;
    let result = match time_limit {
        Some(limit) => tokio::time::timeout(limit, run_analysis(store, params, mode, handle))
            .await
            .unwrap_or_else(|_| {
                Err(anyhow::anyhow!(
                    "analysis exceeded time limit of {}s",
                    limit.as_secs()
                ))
            }),
        None => run_analysis(store, params, mode, handle).await,
    };

    let report = match &result {
        Ok(summary) => RunReport {
            status: RunStatus::Completed,
            documents_processed: summary.documents_processed as i64,
            groups_created: summary.groups_created as i64,
            message: None,
        },
        Err(err) => RunReport {
            status: RunStatus::Failed,
            documents_processed: 0,
            groups_created: 0,
            message: Some(format!("{:#}", err)),
        },
    };
    store.finish_run(run_id, &report).await?;
    result
}

/// CLI entry point for `ddup analyze`.
pub async fn run_analyze(
    config: &Config,
    force: bool,
    progress: Option<ProgressMode>,
    ignore_active: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let store =
        SqliteStore::new(pool.clone()).with_checkpoint_every(config.analysis.checkpoint_every);
    let params = AnalysisParams::from_config(config);
    let mode = if force {
        RunMode::Force
    } else {
        RunMode::Incremental
    };
    let handle = RunHandle::new(
        progress
            .unwrap_or_else(ProgressMode::default_for_tty)
            .reporter(),
    );
    let time_limit = config.analysis.time_limit_secs.map(Duration::from_secs);

    let result =
        analyze_with_bookkeeping(&store, &params, mode, &handle, ignore_active, time_limit).await;
    pool.close().await;
    let summary = result?;

    println!(
        "Analysis complete ({}): {} documents processed, {} groups created, {} groups removed.",
        mode, summary.documents_processed, summary.groups_created, summary.groups_deleted
    );
    if summary.errors > 0 {
        println!("  {} documents had no usable content (status: error).", summary.errors);
    }
    Ok(())
}

/// CLI entry point for `ddup reanalyze`.
pub async fn run_reanalyze(config: &Config, ids: &[i64]) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let found = store.mark_pending(ids).await?;
    pool.close().await;

    println!("Marked {} of {} documents pending.", found, ids.len());
    if (found as usize) < ids.len() {
        bail!("{} document ids were not found", ids.len() - found as usize);
    }
    Ok(())
}
