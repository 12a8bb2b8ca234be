//! SQLite pool setup and schema bootstrap.

use std::path::Path;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Open (creating if missing) the Parley database and apply the schema.
pub async fn open_pool(db_path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("opening database: {}", db_path.display()))?;
    apply_schema(&pool).await?;
    Ok(pool)
}

/// In-memory pool for tests.
///
/// Capped at one connection: pooled `:memory:` connections each get their
/// own database otherwise.
pub async fn open_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .context("opening in-memory database")?;
    apply_schema(&pool).await?;
    Ok(pool)
}

async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chats (
            id TEXT PRIMARY KEY NOT NULL,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            unread INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("creating chats table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY NOT NULL,
            chat_id TEXT NOT NULL,
            role TEXT NOT NULL,
            parts TEXT NOT NULL DEFAULT '[]',
            attachments TEXT NOT NULL DEFAULT '[]',
            parent_id TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("creating messages table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS generation_runs (
            id TEXT PRIMARY KEY NOT NULL,
            chat_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            model_id TEXT NOT NULL,
            messages TEXT NOT NULL DEFAULT '[]',
            user_message_id TEXT NOT NULL,
            assistant_message_id TEXT NOT NULL,
            personalization TEXT NOT NULL DEFAULT '{}',
            cursor INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .context("creating generation_runs table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_events (
            run_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            chunk TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (run_id, seq)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("creating run_events table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_runs_chat_status ON generation_runs(chat_id, status)",
    )
    .execute(pool)
    .await
    .context("creating run status index")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id)")
        .execute(pool)
        .await
        .context("creating messages index")?;

    Ok(())
}
