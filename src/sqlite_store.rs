//! SQLite-backed [`VectorStore`] implementation.
//!
//! Maps each [`VectorStore`] operation onto the schema created by
//! [`crate::migrate`]. Every multi-statement write runs in one transaction,
//! and a query resolves the collection pointer and scans its chunk rows in
//! a single statement, so it always reads one generation.
//!
//! The per-collection writer lock is a lease row in `write_locks`. It also
//! excludes a second *process* indexing the same database. The holder
//! renews the lease before every write; a lease not renewed for
//! `lock_ttl_secs` is treated as abandoned and may be taken over.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use notectx_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use notectx_core::error::{Error, Result};
use notectx_core::models::{
    ChunkPosition, CollectionHandle, CollectionInfo, CollectionSpec, CreationMode, EmbeddedChunk,
    NoteRecord, SearchFilters, SearchResult,
};
use notectx_core::retrieval::compare_results;
use notectx_core::store::VectorStore;

use crate::config::Config;

/// SQLite implementation of the [`VectorStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    lock_ttl_secs: i64,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, lock_ttl_secs: u64) -> Self {
        Self {
            pool,
            lock_ttl_secs: i64::try_from(lock_ttl_secs).unwrap_or(i64::MAX),
        }
    }

    /// Connect to the configured database and bring its schema up to date.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = crate::db::connect(config).await?;
        crate::migrate::migrate(&pool).await?;
        Ok(Self::new(pool, config.index.lock_ttl_secs))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const INFO_SELECT: &str = r#"
    SELECT c.name, g.description, g.embedding_model, g.dims, g.creation_mode,
           g.created_at, g.updated_at,
           (SELECT COUNT(*) FROM notes n WHERE n.generation = g.id) AS note_count,
           (SELECT COUNT(*) FROM chunks ch WHERE ch.generation = g.id) AS chunk_count
    FROM collections c
    JOIN generations g ON g.id = c.generation
"#;

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn row_to_info(row: &SqliteRow) -> Result<CollectionInfo> {
    let mode: String = row.get("creation_mode");
    let dims: i64 = row.get("dims");
    let note_count: i64 = row.get("note_count");
    let chunk_count: i64 = row.get("chunk_count");
    Ok(CollectionInfo {
        name: row.get("name"),
        description: row.get("description"),
        embedding_model: row.get("embedding_model"),
        dims: dims as usize,
        mode: CreationMode::parse(&mode)
            .ok_or_else(|| Error::store(format!("unknown creation mode in database: {mode}")))?,
        note_count: note_count as usize,
        chunk_count: chunk_count as usize,
        created_at: from_ts(row.get("created_at")),
        updated_at: from_ts(row.get("updated_at")),
    })
}

fn row_to_record(row: &SqliteRow) -> Result<NoteRecord> {
    let tags_json: String = row.get("tags_json");
    Ok(NoteRecord {
        note_id: row.get("note_id"),
        title: row.get("title"),
        tags: serde_json::from_str(&tags_json).map_err(Error::store)?,
        updated_at: from_ts(row.get("updated_at")),
        content_hash: row.get("content_hash"),
    })
}

fn check_dims(handle: &CollectionHandle, chunks: &[EmbeddedChunk]) -> Result<()> {
    match chunks.iter().find(|c| c.vector.len() != handle.dims) {
        Some(bad) => Err(Error::DimensionMismatch {
            collection: handle.name.clone(),
            stored: handle.dims,
            requested: bad.vector.len(),
        }),
        None => Ok(()),
    }
}

async fn insert_chunks(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    generation: &str,
    chunks: &[EmbeddedChunk],
) -> Result<()> {
    for ec in chunks {
        let blob = vec_to_blob(&ec.vector);
        sqlx::query(
            r#"
            INSERT INTO chunks (generation, chunk_id, note_id, chunk_index, char_start,
                                char_end, text, hash, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(generation, chunk_id) DO UPDATE SET
                note_id = excluded.note_id,
                chunk_index = excluded.chunk_index,
                char_start = excluded.char_start,
                char_end = excluded.char_end,
                text = excluded.text,
                hash = excluded.hash,
                embedding = excluded.embedding
            "#,
        )
        .bind(generation)
        .bind(&ec.chunk.id)
        .bind(&ec.chunk.note_id)
        .bind(ec.chunk.position.index as i64)
        .bind(ec.chunk.position.char_start as i64)
        .bind(ec.chunk.position.char_end as i64)
        .bind(&ec.chunk.text)
        .bind(&ec.chunk.hash)
        .bind(&blob)
        .execute(&mut **tx)
        .await
        .map_err(Error::store)?;
    }
    Ok(())
}

async fn touch_generation(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    generation: &str,
) -> Result<()> {
    sqlx::query("UPDATE generations SET updated_at = ? WHERE id = ?")
        .bind(Utc::now().timestamp())
        .bind(generation)
        .execute(&mut **tx)
        .await
        .map_err(Error::store)?;
    Ok(())
}

async fn drop_generation(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    generation: &str,
) -> Result<()> {
    for sql in [
        "DELETE FROM chunks WHERE generation = ?",
        "DELETE FROM notes WHERE generation = ?",
        "DELETE FROM generations WHERE id = ?",
    ] {
        sqlx::query(sql)
            .bind(generation)
            .execute(&mut **tx)
            .await
            .map_err(Error::store)?;
    }
    Ok(())
}

async fn insert_generation(
    pool: &SqlitePool,
    id: &str,
    spec: &CollectionSpec,
    mode: CreationMode,
    staged: bool,
) -> Result<()> {
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO generations (id, collection, description, embedding_model, dims,
                                 creation_mode, staged, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(&spec.name)
    .bind(&spec.description)
    .bind(&spec.embedding_model)
    .bind(spec.dims as i64)
    .bind(mode.as_str())
    .bind(staged)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(Error::store)?;
    Ok(())
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn create_or_open_collection(&self, spec: &CollectionSpec) -> Result<CollectionHandle> {
        let existing = sqlx::query(
            r#"
            SELECT g.id, g.dims
            FROM collections c
            JOIN generations g ON g.id = c.generation
            WHERE c.name = ?
            "#,
        )
        .bind(&spec.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::store)?;

        if let Some(row) = existing {
            let generation: String = row.get("id");
            let dims: i64 = row.get("dims");
            if dims as usize != spec.dims {
                return Err(Error::DimensionMismatch {
                    collection: spec.name.clone(),
                    stored: dims as usize,
                    requested: spec.dims,
                });
            }
            if !spec.description.is_empty() {
                sqlx::query("UPDATE generations SET description = ? WHERE id = ?")
                    .bind(&spec.description)
                    .bind(&generation)
                    .execute(&self.pool)
                    .await
                    .map_err(Error::store)?;
            }
            return Ok(CollectionHandle {
                name: spec.name.clone(),
                generation,
                dims: spec.dims,
                staged: false,
            });
        }

        let generation = uuid::Uuid::new_v4().to_string();
        insert_generation(&self.pool, &generation, spec, CreationMode::Incremental, false)
            .await?;
        sqlx::query("INSERT INTO collections (name, generation) VALUES (?, ?)")
            .bind(&spec.name)
            .bind(&generation)
            .execute(&self.pool)
            .await
            .map_err(Error::store)?;
        tracing::info!(collection = %spec.name, dims = spec.dims, "created collection");

        Ok(CollectionHandle {
            name: spec.name.clone(),
            generation,
            dims: spec.dims,
            staged: false,
        })
    }

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let row = sqlx::query(&format!("{INFO_SELECT} WHERE c.name = ?"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::store)?;
        row.as_ref().map(row_to_info).transpose()
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        let rows = sqlx::query(&format!("{INFO_SELECT} ORDER BY c.name ASC"))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::store)?;
        rows.iter().map(row_to_info).collect()
    }

    async fn upsert_chunks(
        &self,
        handle: &CollectionHandle,
        chunks: &[EmbeddedChunk],
    ) -> Result<()> {
        check_dims(handle, chunks)?;
        let mut tx = self.pool.begin().await.map_err(Error::store)?;
        insert_chunks(&mut tx, &handle.generation, chunks).await?;
        touch_generation(&mut tx, &handle.generation).await?;
        tx.commit().await.map_err(Error::store)?;
        Ok(())
    }

    async fn replace_note(
        &self,
        handle: &CollectionHandle,
        record: &NoteRecord,
        chunks: &[EmbeddedChunk],
    ) -> Result<()> {
        check_dims(handle, chunks)?;
        let tags_json = serde_json::to_string(&record.tags).map_err(Error::store)?;
        let now = Utc::now().timestamp();

        let mut tx = self.pool.begin().await.map_err(Error::store)?;

        sqlx::query("DELETE FROM chunks WHERE generation = ? AND note_id = ?")
            .bind(&handle.generation)
            .bind(&record.note_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::store)?;

        insert_chunks(&mut tx, &handle.generation, chunks).await?;

        sqlx::query(
            r#"
            INSERT INTO notes (generation, note_id, title, tags_json, updated_at,
                               content_hash, chunk_count, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(generation, note_id) DO UPDATE SET
                title = excluded.title,
                tags_json = excluded.tags_json,
                updated_at = excluded.updated_at,
                content_hash = excluded.content_hash,
                chunk_count = excluded.chunk_count,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&handle.generation)
        .bind(&record.note_id)
        .bind(&record.title)
        .bind(&tags_json)
        .bind(record.updated_at.timestamp())
        .bind(&record.content_hash)
        .bind(chunks.len() as i64)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::store)?;

        touch_generation(&mut tx, &handle.generation).await?;
        tx.commit().await.map_err(Error::store)?;
        Ok(())
    }

    async fn delete_by_source(&self, handle: &CollectionHandle, note_id: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(Error::store)?;

        let removed = sqlx::query("DELETE FROM chunks WHERE generation = ? AND note_id = ?")
            .bind(&handle.generation)
            .bind(note_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::store)?
            .rows_affected();

        sqlx::query("DELETE FROM notes WHERE generation = ? AND note_id = ?")
            .bind(&handle.generation)
            .bind(note_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::store)?;

        touch_generation(&mut tx, &handle.generation).await?;
        tx.commit().await.map_err(Error::store)?;
        Ok(removed as usize)
    }

    async fn note_records(&self, handle: &CollectionHandle) -> Result<HashMap<String, NoteRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT note_id, title, tags_json, updated_at, content_hash
            FROM notes
            WHERE generation = ?
            "#,
        )
        .bind(&handle.generation)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::store)?;
        rows.iter()
            .map(|row| row_to_record(row).map(|r| (r.note_id.clone(), r)))
            .collect()
    }

    async fn update_note_record(
        &self,
        handle: &CollectionHandle,
        record: &NoteRecord,
    ) -> Result<()> {
        let tags_json = serde_json::to_string(&record.tags).map_err(Error::store)?;
        sqlx::query(
            r#"
            UPDATE notes
            SET title = ?, tags_json = ?, updated_at = ?, content_hash = ?
            WHERE generation = ? AND note_id = ?
            "#,
        )
        .bind(&record.title)
        .bind(&tags_json)
        .bind(record.updated_at.timestamp())
        .bind(&record.content_hash)
        .bind(&handle.generation)
        .bind(&record.note_id)
        .execute(&self.pool)
        .await
        .map_err(Error::store)?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>> {
        // One statement: the generation pointer and the chunk rows come from
        // the same read snapshot.
        let rows = sqlx::query(
            r#"
            SELECT g.dims, ch.chunk_id, ch.note_id, ch.chunk_index, ch.char_start,
                   ch.char_end, ch.text, ch.embedding,
                   n.title, n.tags_json, n.updated_at AS note_updated_at
            FROM collections c
            JOIN generations g ON g.id = c.generation
            LEFT JOIN chunks ch ON ch.generation = g.id
            LEFT JOIN notes n ON n.generation = ch.generation AND n.note_id = ch.note_id
            WHERE c.name = ?
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::store)?;

        let Some(first) = rows.first() else {
            return Err(Error::NotFound {
                collection: collection.to_string(),
            });
        };
        let dims: i64 = first.get("dims");
        if dims as usize != vector.len() {
            return Err(Error::DimensionMismatch {
                collection: collection.to_string(),
                stored: dims as usize,
                requested: vector.len(),
            });
        }

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(chunk_id) = row.get::<Option<String>, _>("chunk_id") else {
                continue;
            };
            let note_id: String = row.get("note_id");

            if !filters.is_empty() {
                let tags: Vec<String> = row
                    .get::<Option<String>, _>("tags_json")
                    .and_then(|t| serde_json::from_str(&t).ok())
                    .unwrap_or_default();
                let updated_at = from_ts(
                    row.get::<Option<i64>, _>("note_updated_at")
                        .unwrap_or_default(),
                );
                if !filters.matches(&note_id, &tags, updated_at) {
                    continue;
                }
            }

            let blob: Vec<u8> = row.get("embedding");
            let index: i64 = row.get("chunk_index");
            let char_start: i64 = row.get("char_start");
            let char_end: i64 = row.get("char_end");
            results.push(SearchResult {
                chunk_id,
                collection: collection.to_string(),
                note_id,
                note_title: row
                    .get::<Option<String>, _>("title")
                    .unwrap_or_default(),
                position: ChunkPosition {
                    index: index as usize,
                    char_start: char_start as usize,
                    char_end: char_end as usize,
                },
                text: row.get("text"),
                score: cosine_similarity(vector, &blob_to_vec(&blob)) as f64,
            });
        }

        results.sort_by(compare_results);
        results.truncate(k);
        Ok(results)
    }

    async fn stage_collection(&self, spec: &CollectionSpec) -> Result<CollectionHandle> {
        // Staged builds left behind by a crashed run of this collection.
        let abandoned: Vec<String> =
            sqlx::query_scalar("SELECT id FROM generations WHERE collection = ? AND staged = 1")
                .bind(&spec.name)
                .fetch_all(&self.pool)
                .await
                .map_err(Error::store)?;
        if !abandoned.is_empty() {
            let mut tx = self.pool.begin().await.map_err(Error::store)?;
            for id in &abandoned {
                drop_generation(&mut tx, id).await?;
            }
            tx.commit().await.map_err(Error::store)?;
            tracing::warn!(
                collection = %spec.name,
                count = abandoned.len(),
                "removed abandoned staged generations"
            );
        }

        let generation = uuid::Uuid::new_v4().to_string();
        insert_generation(&self.pool, &generation, spec, spec.mode, true).await?;
        tracing::debug!(collection = %spec.name, generation = %generation, "staged generation");

        Ok(CollectionHandle {
            name: spec.name.clone(),
            generation,
            dims: spec.dims,
            staged: true,
        })
    }

    async fn promote_staged(&self, handle: &CollectionHandle) -> Result<CollectionInfo> {
        if !handle.staged {
            return Err(Error::store(format!(
                "cannot promote the live generation of {}",
                handle.name
            )));
        }
        let mut tx = self.pool.begin().await.map_err(Error::store)?;

        let previous: Option<String> =
            sqlx::query_scalar("SELECT generation FROM collections WHERE name = ?")
                .bind(&handle.name)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Error::store)?;

        sqlx::query(
            r#"
            INSERT INTO collections (name, generation) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET generation = excluded.generation
            "#,
        )
        .bind(&handle.name)
        .bind(&handle.generation)
        .execute(&mut *tx)
        .await
        .map_err(Error::store)?;

        let created_at: Option<i64> = match &previous {
            Some(old) => sqlx::query_scalar("SELECT created_at FROM generations WHERE id = ?")
                .bind(old)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Error::store)?,
            None => None,
        };

        sqlx::query(
            r#"
            UPDATE generations
            SET staged = 0, updated_at = ?, created_at = COALESCE(?, created_at)
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(created_at)
        .bind(&handle.generation)
        .execute(&mut *tx)
        .await
        .map_err(Error::store)?;

        if let Some(old) = previous.filter(|old| *old != handle.generation) {
            drop_generation(&mut tx, &old).await?;
        }

        tx.commit().await.map_err(Error::store)?;

        self.collection_info(&handle.name)
            .await?
            .ok_or_else(|| Error::store(format!("collection {} vanished after promote", handle.name)))
    }

    async fn discard_staged(&self, handle: &CollectionHandle) -> Result<()> {
        if !handle.staged {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(Error::store)?;
        let live: Option<String> =
            sqlx::query_scalar("SELECT generation FROM collections WHERE name = ?")
                .bind(&handle.name)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Error::store)?;
        if live.as_deref() != Some(handle.generation.as_str()) {
            drop_generation(&mut tx, &handle.generation).await?;
        }
        tx.commit().await.map_err(Error::store)?;
        Ok(())
    }

    async fn acquire_write_lock(&self, collection: &str, owner: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        let stale_before = now.saturating_sub(self.lock_ttl_secs);
        let taken = sqlx::query(
            r#"
            INSERT INTO write_locks (collection, owner, acquired_at) VALUES (?, ?, ?)
            ON CONFLICT(collection) DO UPDATE SET
                owner = excluded.owner,
                acquired_at = excluded.acquired_at
            WHERE write_locks.owner = excluded.owner OR write_locks.acquired_at < ?
            "#,
        )
        .bind(collection)
        .bind(owner)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(Error::store)?
        .rows_affected();

        if taken == 0 {
            return Err(Error::Busy {
                collection: collection.to_string(),
            });
        }
        Ok(())
    }

    async fn renew_write_lock(&self, collection: &str, owner: &str) -> Result<()> {
        let renewed =
            sqlx::query("UPDATE write_locks SET acquired_at = ? WHERE collection = ? AND owner = ?")
                .bind(Utc::now().timestamp())
                .bind(collection)
                .bind(owner)
                .execute(&self.pool)
                .await
                .map_err(Error::store)?
                .rows_affected();
        if renewed == 0 {
            return Err(Error::Busy {
                collection: collection.to_string(),
            });
        }
        Ok(())
    }

    async fn release_write_lock(&self, collection: &str, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM write_locks WHERE collection = ? AND owner = ?")
            .bind(collection)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(Error::store)?;
        Ok(())
    }
}
