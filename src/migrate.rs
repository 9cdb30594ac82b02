//! Database schema.
//!
//! | Table | Contents |
//! |-------|----------|
//! | `collections` | collection name → live generation |
//! | `generations` | one row per physical build: metadata, dims, staged flag |
//! | `notes` | per-note bookkeeping (content hash, tags) for change detection |
//! | `chunks` | chunk text, position, and embedding BLOB in one row |
//! | `write_locks` | per-collection writer lease |
//!
//! A chunk and its vector share a row, so a reader can never see one
//! without the other.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing. Safe to run repeatedly.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            generation TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS generations (
            id TEXT PRIMARY KEY,
            collection TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            embedding_model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            creation_mode TEXT NOT NULL,
            staged INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notes (
            generation TEXT NOT NULL,
            note_id TEXT NOT NULL,
            title TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '[]',
            updated_at INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            chunk_count INTEGER NOT NULL,
            indexed_at INTEGER NOT NULL,
            PRIMARY KEY (generation, note_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            generation TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            note_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            char_start INTEGER NOT NULL,
            char_end INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (generation, chunk_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS write_locks (
            collection TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            acquired_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_note ON chunks(generation, note_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_generations_collection ON generations(collection)")
        .execute(pool)
        .await?;

    Ok(())
}
