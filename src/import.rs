//! Local text-file import.
//!
//! Walks a directory, applies the `[import]` include/exclude globs, and
//! upserts every matching file as a document. The relative path is the
//! external id and the SHA-256 of the file bytes is the fingerprint, so a
//! re-import only re-queues files whose content changed. Files whose bytes
//! exactly match another document are skipped as exact duplicates.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::Path;
use walkdir::WalkDir;

use docdupe_core::store::{DocumentInput, Store, UpsertOutcome};

use crate::config::{Config, ImportConfig};
use crate::db;
use crate::sqlite_store::SqliteStore;

/// Counts reported by an import.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub exact_duplicates: usize,
}

pub fn scan_directory(root: &Path, import: &ImportConfig) -> Result<Vec<DocumentInput>> {
    if !root.is_dir() {
        bail!("Import root is not a directory: {}", root.display());
    }

    let include_set = build_globset(&import.include_globs)?;

    let mut default_excludes = vec!["**/.git/**".to_string(), "**/target/**".to_string()];
    default_excludes.extend(import.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut items = Vec::new();
    for entry in WalkDir::new(root).follow_links(import.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        items.push(file_to_input(path, rel_str)?);
    }

    items.sort_by(|a, b| a.external_id.cmp(&b.external_id));
    Ok(items)
}

fn file_to_input(path: &Path, relative_path: String) -> Result<DocumentInput> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let fingerprint = format!("{:x}", hasher.finalize());

    let title = path
        .file_stem()
        .map(|n| n.to_string_lossy().to_string());

    Ok(DocumentInput {
        external_id: relative_path,
        title,
        fingerprint,
        file_size: Some(bytes.len() as i64),
        text: Some(String::from_utf8_lossy(&bytes).into_owned()),
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Upsert every scanned file into `store`.
pub async fn import_inputs(store: &dyn Store, inputs: &[DocumentInput]) -> Result<ImportStats> {
    let mut stats = ImportStats::default();
    for input in inputs {
        match store.upsert_document(input).await? {
            UpsertOutcome::Inserted(_) => stats.inserted += 1,
            UpsertOutcome::Updated(_) => stats.updated += 1,
            UpsertOutcome::Unchanged(_) => stats.unchanged += 1,
            UpsertOutcome::ExactDuplicate(existing) => {
                tracing::info!(
                    file = %input.external_id,
                    existing,
                    "skipping exact duplicate"
                );
                stats.exact_duplicates += 1;
            }
        }
    }
    Ok(stats)
}

/// CLI entry point for `ddup import <dir>`.
pub async fn run_import(config: &Config, dir: &Path) -> Result<()> {
    let inputs = scan_directory(dir, &config.import)?;
    tracing::info!(root = %dir.display(), files = inputs.len(), "import scan complete");

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let result = import_inputs(&store, &inputs).await;
    pool.close().await;
    let stats = result?;

    println!(
        "Imported {} files: {} new, {} updated, {} unchanged, {} exact duplicates skipped.",
        inputs.len(),
        stats.inserted,
        stats.updated,
        stats.unchanged,
        stats.exact_duplicates
    );
    Ok(())
}
