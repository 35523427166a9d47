use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT NOT NULL UNIQUE,
            title TEXT,
            fingerprint TEXT NOT NULL UNIQUE,
            minhash_signature BLOB,
            processing_status TEXT NOT NULL DEFAULT 'pending',
            file_size INTEGER,
            created_date INTEGER NOT NULL,
            last_processed INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_content (
            document_id INTEGER PRIMARY KEY,
            text TEXT NOT NULL,
            word_count INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS duplicate_groups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            confidence_score REAL NOT NULL,
            jaccard_similarity REAL,
            fuzzy_text_ratio REAL,
            metadata_similarity REAL,
            filename_similarity REAL,
            algorithm_version TEXT NOT NULL,
            reviewed INTEGER NOT NULL DEFAULT 0,
            resolved INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // A document belongs to at most one group.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS duplicate_members (
            group_id INTEGER NOT NULL,
            document_id INTEGER NOT NULL UNIQUE,
            is_primary INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (group_id, document_id),
            FOREIGN KEY (group_id) REFERENCES duplicate_groups(id) ON DELETE CASCADE,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            documents_processed INTEGER NOT NULL DEFAULT 0,
            groups_created INTEGER NOT NULL DEFAULT 0,
            message TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(processing_status)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_members_group ON duplicate_members(group_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_status ON analysis_runs(status)")
        .execute(pool)
        .await?;

    Ok(())
}
