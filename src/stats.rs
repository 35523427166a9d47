//! Database statistics and run history.
//!
//! `ddup stats` summarizes document processing state and duplicate groups;
//! `ddup runs` lists recent analysis runs.

use anyhow::Result;
use sqlx::Row;

use docdupe_core::store::{AnalysisRun, Store};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(&pool)
        .await?;

    let with_signature: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE minhash_signature IS NOT NULL")
            .fetch_one(&pool)
            .await?;

    let status_rows = sqlx::query(
        r#"
        SELECT processing_status, COUNT(*) AS n
        FROM documents
        GROUP BY processing_status
        ORDER BY processing_status
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let total_groups: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM duplicate_groups")
        .fetch_one(&pool)
        .await?;

    let grouped_docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM duplicate_members")
        .fetch_one(&pool)
        .await?;

    let unreviewed: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM duplicate_groups WHERE reviewed = 0")
            .fetch_one(&pool)
            .await?;

    let store = SqliteStore::new(pool.clone());
    let last_run = store.recent_runs(1).await?.into_iter().next();

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("docdupe - Database Stats");
    println!("========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", total_docs);
    println!("  Signatures:  {}", with_signature);
    for row in &status_rows {
        let status: String = row.get("processing_status");
        let n: i64 = row.get("n");
        println!("    {:<11} {}", status, n);
    }
    println!();
    println!("  Groups:      {} ({} unreviewed)", total_groups, unreviewed);
    println!("  Grouped:     {} documents", grouped_docs);
    println!();
    match last_run {
        Some(run) => println!(
            "  Last run:    #{} {} {} ({})",
            run.id,
            run.mode,
            run.status,
            format_ts_relative(run.started_at)
        ),
        None => println!("  Last run:    never"),
    }
    println!();

    pool.close().await;
    Ok(())
}

/// Run the runs command: list the most recent analysis runs.
pub async fn run_runs(config: &Config, limit: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let runs = store.recent_runs(limit).await?;
    pool.close().await;

    if runs.is_empty() {
        println!("No analysis runs recorded.");
        return Ok(());
    }

    println!(
        "  {:>5}  {:<11} {:<9} {:>7} {:>7}   {}",
        "RUN", "MODE", "STATUS", "DOCS", "GROUPS", "STARTED"
    );
    println!("  {}", "-".repeat(66));
    for run in &runs {
        print_run(run);
    }
    Ok(())
}

fn print_run(run: &AnalysisRun) {
    println!(
        "  {:>5}  {:<11} {:<9} {:>7} {:>7}   {}",
        run.id,
        run.mode.as_str(),
        run.status.as_str(),
        run.documents_processed,
        run.groups_created,
        format_ts_relative(run.started_at)
    );
    if let Some(message) = &run.message {
        println!("         {}", message);
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn relative_times() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_iso(0), "1970-01-01 00:00");
    }
}
