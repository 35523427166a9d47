use std::collections::BTreeSet;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use docdupe::analysis::{analyze_with_bookkeeping, run_analysis, AnalysisParams};
use docdupe::progress::{ProgressEvent, ProgressReporter, RunHandle};
use docdupe::sqlite_store::SqliteStore;
use docdupe::{config, db, migrate};
use docdupe_core::models::{Document, ProcessingStatus};
use docdupe_core::store::memory::InMemoryStore;
use docdupe_core::store::{
    AnalysisRun, DocumentInput, DocumentUpdate, RunMode, RunOutcome, RunReport, RunStatus,
    SignatureUpdate, Store, UpsertOutcome,
};
use docdupe_core::DuplicateGroup;

const LEASE_A: &str = "The tenant agrees to pay rent on the first business day of each month \
    and to keep the loading dock clear of debris at all times during the lease term.";
const LEASE_B: &str = "THE TENANT agrees to pay rent on the first business day of each month, \
    and to keep the loading dock clear of debris at all times during the lease term!!";
const REPORT_A: &str = "Quarterly revenue report shows gross margin improvement across all \
    regional segments with particularly strong growth in the northern territories.";
const REPORT_B: &str = "Quarterly revenue report: shows gross margin improvement across ALL \
    regional segments, with particularly strong growth in the northern territories";
const LEASE_C: &str = "The Tenant agrees to pay rent on the first business day of each month \
    and to keep the loading dock clear of debris at all times; during the lease term.";
const MINUTES: &str = "Minutes of the annual general meeting held in the community hall with \
    thirty members present and voting on the new parking arrangements.";

fn input(external_id: &str, text: &str) -> DocumentInput {
    DocumentInput {
        external_id: external_id.to_string(),
        title: Some(external_id.to_string()),
        fingerprint: format!("sha:{}", text),
        file_size: Some(text.len() as i64),
        text: Some(text.to_string()),
    }
}

async fn seed(store: &dyn Store, docs: &[(&str, &str)]) {
    for (id, text) in docs {
        store.upsert_document(&input(id, text)).await.unwrap();
    }
}

async fn seed_corpus(store: &dyn Store) {
    seed(
        store,
        &[
            ("lease-a", LEASE_A),
            ("lease-b", LEASE_B),
            ("report-a", REPORT_A),
            ("report-b", REPORT_B),
            ("minutes", MINUTES),
        ],
    )
    .await;
}

fn params() -> AnalysisParams {
    AnalysisParams {
        yield_every: 1,
        progress_every: 1,
        ..AnalysisParams::default()
    }
}

fn membership(groups: &[DuplicateGroup]) -> BTreeSet<Vec<i64>> {
    groups
        .iter()
        .map(|g| {
            let mut ids: Vec<i64> = g.members.iter().map(|m| m.document_id).collect();
            ids.sort_unstable();
            ids
        })
        .collect()
}

async fn sqlite_store(tmp: &TempDir) -> SqliteStore {
    let config_path = tmp.path().join("ddup.toml");
    fs::write(
        &config_path,
        format!(
            "[db]\npath = \"{}\"\n",
            tmp.path().join("ddup.sqlite").display()
        ),
    )
    .unwrap();
    let cfg = config::load_config(&config_path).unwrap();
    migrate::run_migrations(&cfg).await.unwrap();
    SqliteStore::new(db::connect(&cfg).await.unwrap()).with_checkpoint_every(2)
}

async fn check_first_run(store: &dyn Store) {
    seed_corpus(store).await;
    let summary = run_analysis(store, &params(), RunMode::Incremental, &RunHandle::silent())
        .await
        .unwrap();
    assert_eq!(summary.documents_processed, 5);
    assert_eq!(summary.groups_created, 2);

    let groups = store.list_groups().await.unwrap();
    assert_eq!(
        membership(&groups),
        BTreeSet::from([vec![1, 2], vec![3, 4]])
    );
    for group in &groups {
        assert_eq!(group.members.iter().filter(|m| m.is_primary).count(), 1);
        assert!(group.confidence_score >= 0.95);
        assert_eq!(group.components.jaccard_similarity, Some(1.0));
    }

    let docs = store.load_documents().await.unwrap();
    assert!(docs
        .iter()
        .all(|d| d.processing_status == ProcessingStatus::Completed));
    assert!(docs.iter().all(|d| d.minhash_signature.is_some()));
}

async fn check_incremental_rerun(store: &dyn Store) {
    check_first_run(store).await;
    let before = store.list_groups().await.unwrap();
    let docs_before = store.load_documents().await.unwrap();

    assert_eq!(store.mark_pending(&[3]).await.unwrap(), 1);
    let summary = run_analysis(store, &params(), RunMode::Incremental, &RunHandle::silent())
        .await
        .unwrap();
    assert_eq!(summary.documents_processed, 1);
    assert_eq!(summary.groups_deleted, 1);
    assert_eq!(summary.groups_created, 1);

    let after = store.list_groups().await.unwrap();
    let lease_before = before.iter().find(|g| g.contains(1)).unwrap();
    let lease_after = after.iter().find(|g| g.contains(1)).unwrap();
    assert_eq!(lease_before, lease_after);

    let report_before = before.iter().find(|g| g.contains(3)).unwrap();
    let report_after = after.iter().find(|g| g.contains(3)).unwrap();
    assert_ne!(report_before.id, report_after.id);
    assert_eq!(membership(&after), membership(&before));

    // Documents outside the work set are not touched.
    let docs_after = store.load_documents().await.unwrap();
    for (b, a) in docs_before.iter().zip(&docs_after) {
        if b.id != 3 {
            assert_eq!(b, a);
        }
    }
}

#[tokio::test]
async fn memory_first_run_groups_duplicates() {
    check_first_run(&InMemoryStore::new()).await;
}

#[tokio::test]
async fn sqlite_first_run_groups_duplicates() {
    let tmp = TempDir::new().unwrap();
    check_first_run(&sqlite_store(&tmp).await).await;
}

#[tokio::test]
async fn memory_incremental_keeps_untouched_groups() {
    check_incremental_rerun(&InMemoryStore::new()).await;
}

#[tokio::test]
async fn sqlite_incremental_keeps_untouched_groups() {
    let tmp = TempDir::new().unwrap();
    check_incremental_rerun(&sqlite_store(&tmp).await).await;
}

async fn check_new_duplicate_joins_existing_group(store: &dyn Store) {
    check_first_run(store).await;
    let before = store.list_groups().await.unwrap();

    seed(store, &[("lease-c", LEASE_C)]).await;
    let summary = run_analysis(store, &params(), RunMode::Incremental, &RunHandle::silent())
        .await
        .unwrap();
    assert_eq!(summary.documents_processed, 1);
    assert_eq!(summary.groups_deleted, 1);
    assert_eq!(summary.groups_created, 1);

    let after = store.list_groups().await.unwrap();
    assert_eq!(
        membership(&after),
        BTreeSet::from([vec![1, 2, 6], vec![3, 4]])
    );
    let report_before = before.iter().find(|g| g.contains(3)).unwrap();
    let report_after = after.iter().find(|g| g.contains(3)).unwrap();
    assert_eq!(report_before, report_after);

    // A force run over the same corpus agrees.
    let fresh = InMemoryStore::new();
    seed_corpus(&fresh).await;
    seed(&fresh, &[("lease-c", LEASE_C)]).await;
    run_analysis(&fresh, &params(), RunMode::Force, &RunHandle::silent())
        .await
        .unwrap();
    assert_eq!(membership(&fresh.list_groups().await.unwrap()), membership(&after));
}

#[tokio::test]
async fn memory_new_duplicate_joins_existing_group() {
    check_new_duplicate_joins_existing_group(&InMemoryStore::new()).await;
}

#[tokio::test]
async fn sqlite_new_duplicate_joins_existing_group() {
    let tmp = TempDir::new().unwrap();
    check_new_duplicate_joins_existing_group(&sqlite_store(&tmp).await).await;
}

struct Recorder(Arc<Mutex<Vec<ProgressEvent>>>);

impl ProgressReporter for Recorder {
    fn report(&self, event: &ProgressEvent) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[tokio::test]
async fn progress_is_reported_every_n_documents_and_on_completion() {
    let store = InMemoryStore::new();
    seed_corpus(&store).await;
    let events = Arc::new(Mutex::new(Vec::new()));
    let handle = RunHandle::new(Box::new(Recorder(events.clone())));
    let params = AnalysisParams {
        progress_every: 2,
        ..params()
    };
    run_analysis(&store, &params, RunMode::Incremental, &handle)
        .await
        .unwrap();

    let seen: Vec<(String, u64, u64)> = events
        .lock()
        .unwrap()
        .iter()
        .map(|e| (e.step.clone(), e.current, e.total))
        .collect();
    let expected: Vec<(String, u64, u64)> = [
        ("signatures", 2, 5),
        ("signatures", 4, 5),
        ("grouping", 2, 5),
        ("grouping", 4, 5),
        ("completed", 5, 5),
    ]
    .iter()
    .map(|(s, c, t)| (s.to_string(), *c, *t))
    .collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn incremental_run_with_nothing_pending_changes_nothing() {
    let store = InMemoryStore::new();
    check_first_run(&store).await;
    let before = store.list_groups().await.unwrap();
    let summary = run_analysis(&store, &params(), RunMode::Incremental, &RunHandle::silent())
        .await
        .unwrap();
    assert_eq!(summary.documents_processed, 0);
    assert_eq!(summary.groups_created, 0);
    assert_eq!(store.list_groups().await.unwrap(), before);
}

#[tokio::test]
async fn force_rebuild_is_stable() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    seed_corpus(&store).await;

    let first = run_analysis(&store, &params(), RunMode::Force, &RunHandle::silent())
        .await
        .unwrap();
    let groups_first = store.list_groups().await.unwrap();
    let second = run_analysis(&store, &params(), RunMode::Force, &RunHandle::silent())
        .await
        .unwrap();
    let groups_second = store.list_groups().await.unwrap();

    assert_eq!(first.documents_processed, 5);
    assert_eq!(second.groups_deleted, 2);
    assert_eq!(membership(&groups_first), membership(&groups_second));
    let confidences = |gs: &[DuplicateGroup]| -> Vec<f64> {
        gs.iter().map(|g| g.confidence_score).collect()
    };
    assert_eq!(confidences(&groups_first), confidences(&groups_second));
}

#[tokio::test]
async fn ocr_noise_scenario() {
    let store = InMemoryStore::new();
    seed(
        &store,
        &[
            ("inv-1", "Invoice 12345 total $500"),
            ("inv-2", "Invoice l2345 total $5OO"),
            ("cats", "cats and dogs"),
            ("report", "quarterly revenue report"),
        ],
    )
    .await;
    let params = AnalysisParams {
        threshold: 0.5,
        ..params()
    };
    run_analysis(&store, &params, RunMode::Incremental, &RunHandle::silent())
        .await
        .unwrap();

    let groups = store.list_groups().await.unwrap();
    assert_eq!(membership(&groups), BTreeSet::from([vec![1, 2]]));
    assert!(groups[0].confidence_score >= 0.5);
    assert_eq!(groups[0].primary(), Some(1));
}

#[tokio::test]
async fn short_and_empty_documents_do_not_fail_the_run() {
    let store = InMemoryStore::new();
    seed(&store, &[("tiny", "two words"), ("lease", LEASE_A)]).await;
    store
        .upsert_document(&DocumentInput {
            external_id: "blank".to_string(),
            title: None,
            fingerprint: "none".to_string(),
            file_size: None,
            text: None,
        })
        .await
        .unwrap();

    let summary = run_analysis(&store, &params(), RunMode::Incremental, &RunHandle::silent())
        .await
        .unwrap();
    assert_eq!(summary.errors, 1);

    let docs = store.load_documents().await.unwrap();
    assert_eq!(docs[0].processing_status, ProcessingStatus::Completed);
    assert_eq!(docs[0].minhash_signature, None);
    assert_eq!(docs[1].processing_status, ProcessingStatus::Completed);
    assert_eq!(docs[2].processing_status, ProcessingStatus::Error);
}

#[tokio::test]
async fn corrupt_cached_signature_is_recomputed() {
    let store = InMemoryStore::new();
    seed(&store, &[("a", LEASE_A), ("b", LEASE_B)]).await;
    let first = AnalysisParams {
        num_perm: 64,
        ..params()
    };
    run_analysis(&store, &first, RunMode::Incremental, &RunHandle::silent())
        .await
        .unwrap();

    // Same corpus, different signature length: cached blobs no longer fit.
    store.mark_pending(&[2]).await.unwrap();
    run_analysis(&store, &params(), RunMode::Incremental, &RunHandle::silent())
        .await
        .unwrap();

    let docs = store.load_documents().await.unwrap();
    let expected_len = 2 + 1 + 2 + 4 * params().num_perm;
    for doc in &docs {
        assert_eq!(doc.minhash_signature.as_ref().unwrap().len(), expected_len);
    }
    assert_eq!(
        membership(&store.list_groups().await.unwrap()),
        BTreeSet::from([vec![1, 2]])
    );
}

#[tokio::test]
async fn failed_persistence_leaves_everything_pending() {
    let store = InMemoryStore::new();
    seed_corpus(&store).await;
    store.fail_next_apply();

    let err = run_analysis(&store, &params(), RunMode::Incremental, &RunHandle::silent())
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to persist analysis results"));
    assert!(store.list_groups().await.unwrap().is_empty());
    assert!(store
        .load_documents()
        .await
        .unwrap()
        .iter()
        .all(|d| d.processing_status == ProcessingStatus::Pending && d.minhash_signature.is_none()));

    // The retry recomputes the same documents.
    let summary = run_analysis(&store, &params(), RunMode::Incremental, &RunHandle::silent())
        .await
        .unwrap();
    assert_eq!(summary.documents_processed, 5);
    assert_eq!(summary.groups_created, 2);
}

#[tokio::test]
async fn sqlite_apply_run_rolls_back_on_error() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    check_first_run(&store).await;
    let before = store.list_groups().await.unwrap();

    let bad = RunOutcome {
        delete_all_groups: true,
        new_groups: vec![docdupe_core::store::NewGroup {
            confidence: 1.0,
            components: Default::default(),
            algorithm_version: "test".to_string(),
            primary: 1,
            duplicates: vec![999],
            created_at: 0,
        }],
        ..RunOutcome::default()
    };
    assert!(store.apply_run(&bad).await.is_err());
    assert_eq!(store.list_groups().await.unwrap(), before);
}

#[tokio::test]
async fn cancelled_run_writes_nothing() {
    let store = InMemoryStore::new();
    seed_corpus(&store).await;
    let handle = RunHandle::silent();
    handle.cancel();

    let err = run_analysis(&store, &params(), RunMode::Incremental, &handle)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cancelled"));
    assert!(store.list_groups().await.unwrap().is_empty());
}

#[tokio::test]
async fn active_run_blocks_new_runs() {
    let store = InMemoryStore::new();
    seed_corpus(&store).await;
    let stuck = store.begin_run(RunMode::Incremental).await.unwrap();

    let err = analyze_with_bookkeeping(
        &store,
        &params(),
        RunMode::Incremental,
        &RunHandle::silent(),
        false,
        None,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("already active"));
    assert_eq!(store.recent_runs(10).await.unwrap().len(), 1);

    analyze_with_bookkeeping(
        &store,
        &params(),
        RunMode::Incremental,
        &RunHandle::silent(),
        true,
        None,
    )
    .await
    .unwrap();
    let runs = store.recent_runs(10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert_eq!(runs[0].groups_created, 2);
    assert_eq!(runs[1].id, stuck);
}

/// Delegates to an in-memory store. Loading documents can be slowed down,
/// and a document can be re-ingested right after the run has loaded its
/// snapshot.
#[derive(Default)]
struct HookedStore {
    inner: InMemoryStore,
    load_delay: Duration,
    ingest_after_load: Mutex<Option<DocumentInput>>,
}

#[async_trait::async_trait]
impl Store for HookedStore {
    async fn upsert_document(&self, input: &DocumentInput) -> anyhow::Result<UpsertOutcome> {
        self.inner.upsert_document(input).await
    }
    async fn load_documents(&self) -> anyhow::Result<Vec<Document>> {
        tokio::time::sleep(self.load_delay).await;
        let docs = self.inner.load_documents().await?;
        let late = self.ingest_after_load.lock().unwrap().take();
        if let Some(input) = late {
            self.inner.upsert_document(&input).await?;
        }
        Ok(docs)
    }
    async fn list_groups(&self) -> anyhow::Result<Vec<DuplicateGroup>> {
        self.inner.list_groups().await
    }
    async fn mark_pending(&self, ids: &[i64]) -> anyhow::Result<u64> {
        self.inner.mark_pending(ids).await
    }
    async fn apply_run(&self, outcome: &RunOutcome) -> anyhow::Result<Vec<i64>> {
        self.inner.apply_run(outcome).await
    }
    async fn set_group_confidence(&self, group_id: i64, confidence: f64) -> anyhow::Result<()> {
        self.inner.set_group_confidence(group_id, confidence).await
    }
    async fn active_run(&self) -> anyhow::Result<Option<AnalysisRun>> {
        self.inner.active_run().await
    }
    async fn begin_run(&self, mode: RunMode) -> anyhow::Result<i64> {
        self.inner.begin_run(mode).await
    }
    async fn finish_run(&self, run_id: i64, report: &RunReport) -> anyhow::Result<()> {
        self.inner.finish_run(run_id, report).await
    }
    async fn recent_runs(&self, limit: i64) -> anyhow::Result<Vec<AnalysisRun>> {
        self.inner.recent_runs(limit).await
    }
}

#[tokio::test]
async fn document_reingested_during_run_stays_pending() {
    let store = HookedStore::default();
    seed(&store, &[("lease-a", LEASE_A), ("lease-b", LEASE_B)]).await;
    *store.ingest_after_load.lock().unwrap() = Some(input("lease-b", MINUTES));

    run_analysis(&store, &params(), RunMode::Incremental, &RunHandle::silent())
        .await
        .unwrap();
    let docs = store.load_documents().await.unwrap();
    assert_eq!(docs[0].processing_status, ProcessingStatus::Completed);
    assert_eq!(docs[1].processing_status, ProcessingStatus::Pending);
    assert_eq!(docs[1].minhash_signature, None);
    assert_eq!(docs[1].text(), Some(MINUTES));

    // The next run picks up the new content and dissolves the stale group.
    let summary = run_analysis(&store, &params(), RunMode::Incremental, &RunHandle::silent())
        .await
        .unwrap();
    assert_eq!(summary.documents_processed, 1);
    assert!(store.list_groups().await.unwrap().is_empty());
    let docs = store.load_documents().await.unwrap();
    assert_eq!(docs[1].processing_status, ProcessingStatus::Completed);
    assert!(docs[1].minhash_signature.is_some());
}

#[tokio::test]
async fn sqlite_apply_run_skips_reingested_documents() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    seed(&store, &[("lease-a", LEASE_A)]).await;
    let loaded = store.load_documents().await.unwrap();
    store.upsert_document(&input("lease-a", LEASE_B)).await.unwrap();

    store
        .apply_run(&RunOutcome {
            document_updates: vec![DocumentUpdate {
                id: loaded[0].id,
                expected_fingerprint: loaded[0].fingerprint.clone(),
                status: ProcessingStatus::Completed,
                signature: SignatureUpdate::Set(vec![1, 2, 3]),
                last_processed: 1,
            }],
            ..RunOutcome::default()
        })
        .await
        .unwrap();

    let doc = &store.load_documents().await.unwrap()[0];
    assert_eq!(doc.processing_status, ProcessingStatus::Pending);
    assert_eq!(doc.minhash_signature, None);
    assert_eq!(doc.text(), Some(LEASE_B));
}

#[tokio::test]
async fn time_limit_fails_the_run() {
    let store = HookedStore {
        load_delay: Duration::from_millis(200),
        ..HookedStore::default()
    };
    seed_corpus(&store).await;

    let err = analyze_with_bookkeeping(
        &store,
        &params(),
        RunMode::Force,
        &RunHandle::silent(),
        false,
        Some(Duration::from_millis(20)),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("time limit"));

    let runs = store.recent_runs(1).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0].message.as_deref().unwrap().contains("time limit"));
    assert!(store.list_groups().await.unwrap().is_empty());
    assert!(store.active_run().await.unwrap().is_none());
}
