//! `ddup groups`: list duplicate groups and recalculate their confidence.

use anyhow::Result;
use serde::Serialize;

use docdupe_core::store::Store;
use docdupe_core::{recalculate_confidence, ConfidenceWeights, DuplicateGroup};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// One group's confidence before and after recalculation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recalculated {
    pub group_id: i64,
    pub previous: f64,
    /// `None` when no component is both stored and enabled.
    pub recalculated: Option<f64>,
}

/// Recompute every group's confidence under `weights`, persisting the new
/// values when `apply` is set. Groups with no qualifying component keep
/// their stored confidence.
pub async fn recalculate_groups(
    store: &dyn Store,
    weights: &ConfidenceWeights,
    apply: bool,
) -> Result<Vec<Recalculated>> {
    weights.validate()?;
    let groups = store.list_groups().await?;
    let mut results = Vec::with_capacity(groups.len());
    for group in &groups {
        let recalculated = recalculate_confidence(&group.components, weights);
        if apply {
            if let Some(confidence) = recalculated {
                store.set_group_confidence(group.id, confidence).await?;
            }
        }
        results.push(Recalculated {
            group_id: group.id,
            previous: group.confidence_score,
            recalculated,
        });
    }
    Ok(results)
}

fn fmt_component(v: Option<f64>) -> String {
    v.map(|v| format!("{:.3}", v))
        .unwrap_or_else(|| "-".to_string())
}

fn print_group(group: &DuplicateGroup) {
    let members: Vec<String> = group
        .members
        .iter()
        .map(|m| {
            if m.is_primary {
                format!("{}*", m.document_id)
            } else {
                m.document_id.to_string()
            }
        })
        .collect();
    println!(
        "  {:>6}  {:>6.3}  {:>7}  {:>7}  {:>7}  {:>7}  {}",
        group.id,
        group.confidence_score,
        fmt_component(group.components.jaccard_similarity),
        fmt_component(group.components.fuzzy_text_ratio),
        fmt_component(group.components.metadata_similarity),
        fmt_component(group.components.filename_similarity),
        members.join(", ")
    );
}

/// CLI entry point for `ddup groups list`.
pub async fn run_list(config: &Config, json: bool, limit: Option<usize>) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let mut groups = store.list_groups().await?;
    pool.close().await;

    if let Some(limit) = limit {
        groups.truncate(limit);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }

    if groups.is_empty() {
        println!("No duplicate groups.");
        return Ok(());
    }

    println!(
        "  {:>6}  {:>6}  {:>7}  {:>7}  {:>7}  {:>7}  MEMBERS (* = primary)",
        "GROUP", "CONF", "JACCARD", "FUZZY", "SIZE", "TITLE"
    );
    println!("  {}", "-".repeat(76));
    for group in &groups {
        print_group(group);
    }
    Ok(())
}

/// CLI entry point for `ddup groups recalc`.
pub async fn run_recalc(config: &Config, apply: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let result = recalculate_groups(&store, &config.weights, apply).await;
    pool.close().await;
    let results = result?;

    for r in &results {
        match r.recalculated {
            Some(new) => println!("  group {:>6}: {:.3} -> {:.3}", r.group_id, r.previous, new),
            None => println!(
                "  group {:>6}: {:.3} (no enabled component; unchanged)",
                r.group_id, r.previous
            ),
        }
    }
    if apply {
        println!("Updated {} groups.", results.iter().filter(|r| r.recalculated.is_some()).count());
    } else {
        println!("Dry run; pass --apply to persist.");
    }
    Ok(())
}
