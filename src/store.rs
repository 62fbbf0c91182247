//! Persistence repository (§4.M): the durable SQLite-backed store for
//! every entity in §3, behind plain async methods rather than a
//! generic repository trait (this crate has exactly one backend).
//!
//! Generalizes the teacher's `SqliteMemoryStore` (`memory.rs`) — table
//! creation in `new`, BLOB-encoded vectors via `to_le_bytes`/
//! `from_le_bytes`, manual row mapping with `sqlx::query`/`query_as` —
//! from a single `memories` table to the full entity set. The
//! multi-table ingest commit borrows `saga.rs`'s sequential-steps shape
//! but is implemented as one `sqlx::Transaction`, since every step here
//! is local to one SQLite connection and a DB transaction is the
//! idiomatic primitive for that (recorded in DESIGN.md). `Document`/
//! `Chunk`/`Concept`/`Summary` ids are the database's own
//! `INTEGER PRIMARY KEY AUTOINCREMENT` — never recomputed client-side —
//! so `doc_id` stays monotonic under concurrent workers. `Cluster` ids
//! are the one deliberate exception: §4.G's `max(existing)+1`
//! allocation is part of the clustering algorithm itself, and
//! membership changes are decided and written inside
//! [`SqliteStore::commit_ingest`]'s own transaction rather than by a
//! caller-held lock: the chunk/concept/summary inserts earlier in that
//! same transaction already force SQLite to take its one
//! writer-at-a-time lock, so the cluster read a few statements later
//! and the upsert a few statements after that are never interleaved
//! with another `commit_ingest` call's cluster read-decide-write (§5,
//! S4). `busy_timeout` on the pool's connect options makes the second
//! writer wait for that lock instead of failing outright.

use crate::cache::ResponseCache;
use crate::cluster::ClusteringEngine;
use crate::domain::*;
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
}

fn to_json<T: serde::Serialize>(v: &T) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string())
}

fn from_json<T: serde::de::DeserializeOwned + Default>(s: &str) -> T {
    serde_json::from_str(s).unwrap_or_default()
}

/// The durable store behind every domain operation in §3. Holds one
/// shared connection pool (teacher's `SqlitePoolOptions::max_connections`
/// pattern) and an optional response cache to invalidate on mutation.
/// Cheap to clone: `SqlitePool` is itself a handle around a shared pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    cache: Option<Arc<ResponseCache>>,
}

impl SqliteStore {
    pub async fn new(config: &crate::config::StoreConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| AppError::Internal(e.to_string()))?
            .create_if_missing(true)
            // SQLite allows exactly one writer at a time; without a
            // busy timeout a second concurrent `commit_ingest` would
            // fail outright with "database is locked" instead of
            // waiting its turn behind the first transaction's cluster
            // read-decide-write (§5, S4).
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool, cache: None };
        store.migrate().await?;
        Ok(store)
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                hashed_password TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS knowledge_bases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_username TEXT NOT NULL,
                name TEXT NOT NULL,
                is_default INTEGER NOT NULL DEFAULT 0,
                document_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_kb_owner ON knowledge_bases(owner_username)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kb_id INTEGER NOT NULL,
                owner_username TEXT NOT NULL,
                cluster_id INTEGER,
                source_type TEXT NOT NULL,
                filename TEXT,
                source_url TEXT,
                image_path TEXT,
                content_length INTEGER NOT NULL DEFAULT 0,
                skill_level TEXT,
                chunking_status TEXT NOT NULL DEFAULT 'pending',
                summary_status TEXT NOT NULL DEFAULT 'pending',
                chunk_count INTEGER NOT NULL DEFAULT 0,
                ingested_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_kb ON documents(kb_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_cluster ON documents(cluster_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vector_documents (
                doc_id INTEGER PRIMARY KEY REFERENCES documents(id),
                raw_text TEXT NOT NULL,
                tfidf_vector BLOB,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id INTEGER NOT NULL,
                kb_id INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                tier TEXT NOT NULL,
                parent_chunk_id INTEGER,
                start_token INTEGER NOT NULL,
                end_token INTEGER NOT NULL,
                content TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                embedding BLOB,
                concepts TEXT NOT NULL DEFAULT '[]',
                summary TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(document_id, chunk_index)
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_kb_tier ON chunks(kb_id, tier)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS concepts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                category TEXT NOT NULL,
                confidence REAL NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(document_id, name)
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_concepts_document ON concepts(document_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS clusters (
                id INTEGER PRIMARY KEY,
                kb_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                primary_concepts TEXT NOT NULL DEFAULT '[]',
                skill_level TEXT,
                doc_ids TEXT NOT NULL DEFAULT '[]',
                doc_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_clusters_kb ON clusters(kb_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id INTEGER NOT NULL,
                chunk_id INTEGER,
                parent_id INTEGER,
                level INTEGER NOT NULL,
                short_summary TEXT NOT NULL,
                long_summary TEXT,
                key_concepts TEXT NOT NULL DEFAULT '[]',
                tech_stack TEXT NOT NULL DEFAULT '[]',
                skill_profile TEXT,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_summaries_document ON summaries(document_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS build_idea_seeds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kb_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                feasibility TEXT NOT NULL,
                effort_estimate TEXT NOT NULL,
                required_skills TEXT NOT NULL DEFAULT '[]',
                missing_knowledge TEXT NOT NULL DEFAULT '[]',
                relevant_clusters TEXT NOT NULL DEFAULT '[]',
                starter_steps TEXT NOT NULL DEFAULT '[]',
                knowledge_coverage REAL NOT NULL DEFAULT 0,
                referenced_sections TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'proposed',
                generated_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS saved_ideas (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_username TEXT NOT NULL,
                seed_id INTEGER NOT NULL,
                notes TEXT,
                saved_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                owner_username TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL,
                progress_percent INTEGER NOT NULL DEFAULT 0,
                progress_message TEXT NOT NULL DEFAULT '',
                attempt INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                result TEXT,
                error_kind TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                subscription_id INTEGER,
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL,
                api_calls INTEGER NOT NULL DEFAULT 0,
                documents_uploaded INTEGER NOT NULL DEFAULT 0,
                ai_requests INTEGER NOT NULL DEFAULT 0,
                storage_bytes INTEGER NOT NULL DEFAULT 0,
                search_queries INTEGER NOT NULL DEFAULT 0,
                build_suggestions INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE(username, period_start)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                plan TEXT NOT NULL,
                status TEXT NOT NULL,
                current_period_start TEXT,
                current_period_end TEXT,
                cancel_at_period_end INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limit_overrides (
                username TEXT PRIMARY KEY,
                api_calls_per_minute INTEGER,
                api_calls_per_day INTEGER,
                documents_per_month INTEGER,
                ai_requests_per_day INTEGER,
                storage_mb INTEGER,
                knowledge_bases INTEGER,
                reason TEXT,
                granted_by TEXT,
                expires_at TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // -----------------------------------------------------------------
    // Users / knowledge bases
    // -----------------------------------------------------------------

    pub async fn create_user(&self, username: &str, hashed_password: &str) -> Result<User> {
        let now = Utc::now();
        sqlx::query("INSERT INTO users (username, hashed_password, created_at) VALUES (?, ?, ?)")
            .bind(username)
            .bind(hashed_password)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    AppError::Conflict(format!("username '{username}' already exists"))
                }
                other => AppError::Database(other),
            })?;
        Ok(User { id: 0, username: username.to_string(), hashed_password: hashed_password.to_string(), created_at: now })
    }

    pub async fn get_user(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT username, hashed_password, created_at FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| User {
            id: 0,
            username: r.get("username"),
            hashed_password: r.get("hashed_password"),
            created_at: parse_ts(r.get("created_at")),
        }))
    }

    /// Create a knowledge base for `owner`; the first one ever created
    /// for that owner is flagged `is_default`.
    pub async fn create_knowledge_base(&self, owner: &str, name: &str) -> Result<KnowledgeBase> {
        let existing = self.count_knowledge_bases(owner).await?;
        let now = Utc::now();
        let is_default = existing == 0;
        let id: i64 = sqlx::query(
            "INSERT INTO knowledge_bases (owner_username, name, is_default, document_count, created_at, updated_at) \
             VALUES (?, ?, ?, 0, ?, ?) RETURNING id",
        )
        .bind(owner)
        .bind(name)
        .bind(is_default)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .fetch_one(&self.pool)
        .await?
        .get("id");

        Ok(KnowledgeBase {
            id,
            owner_username: owner.to_string(),
            name: name.to_string(),
            is_default,
            document_count: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn count_knowledge_bases(&self, owner: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM knowledge_bases WHERE owner_username = ?")
            .bind(owner)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub async fn get_default_knowledge_base(&self, owner: &str) -> Result<Option<KnowledgeBase>> {
        let row = sqlx::query("SELECT * FROM knowledge_bases WHERE owner_username = ? AND is_default = 1")
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(kb_from_row))
    }

    pub async fn get_knowledge_base(&self, id: i64) -> Result<Option<KnowledgeBase>> {
        let row = sqlx::query("SELECT * FROM knowledge_bases WHERE id = ?").bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(kb_from_row))
    }

    // -----------------------------------------------------------------
    // Ingest commit (§4.M: Document + VectorDocument + Concepts + Chunks
    // + Summaries + Cluster update as one serializable transaction).
    // -----------------------------------------------------------------

    /// Insert a new document and its text, allocating `id`/`doc_id`
    /// from the database's own autoincrement sequence. Separate from
    /// [`Self::commit_ingest`] because chunking/concept extraction/
    /// clustering happen in later pipeline stages against this row.
    pub async fn create_document(&self, doc: NewDocument) -> Result<Document> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let id: i64 = sqlx::query(
            "INSERT INTO documents (kb_id, owner_username, cluster_id, source_type, filename, source_url, \
             image_path, content_length, skill_level, chunking_status, summary_status, chunk_count, \
             ingested_at, updated_at) \
             VALUES (?, ?, NULL, ?, ?, ?, ?, ?, NULL, 'pending', 'pending', 0, ?, ?) RETURNING id",
        )
        .bind(doc.kb_id)
        .bind(&doc.owner_username)
        .bind(doc.source_type.as_str())
        .bind(&doc.filename)
        .bind(&doc.source_url)
        .bind(&doc.image_path)
        .bind(doc.content_length)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .fetch_one(&mut *tx)
        .await?
        .get("id");

        sqlx::query(
            "INSERT INTO vector_documents (doc_id, raw_text, tfidf_vector, created_at) VALUES (?, ?, NULL, ?)",
        )
        .bind(id)
        .bind(&doc.raw_text)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE knowledge_bases SET document_count = document_count + 1, updated_at = ? WHERE id = ?")
            .bind(now.to_rfc3339())
            .bind(doc.kb_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.invalidate_owner_caches(&doc.owner_username).await;

        Ok(Document {
            id,
            doc_id: id,
            kb_id: doc.kb_id,
            owner_username: doc.owner_username,
            cluster_id: None,
            source_type: doc.source_type,
            filename: doc.filename,
            source_url: doc.source_url,
            image_path: doc.image_path,
            content_length: doc.content_length,
            skill_level: None,
            chunking_status: ChunkingStatus::Pending,
            summary_status: SummaryStatus::Pending,
            chunk_count: 0,
            ingested_at: now,
            updated_at: now,
        })
    }

    /// Commit the rest of the pipeline for one document as a single
    /// transaction: persist chunks (parents first, so children can
    /// reference real parent ids), concepts (batched, not row-by-row),
    /// summaries, the cluster membership change, and the document's
    /// final status fields. Either all of it lands, or none of it does.
    pub async fn commit_ingest(&self, outcome: IngestOutcome) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let mut parent_id_by_position: Vec<i64> = Vec::with_capacity(outcome.chunks.len());
        for chunk in &outcome.chunks {
            if chunk.parent_chunk_id.is_some() {
                continue;
            }
            let id = insert_chunk(&mut tx, chunk, None).await?;
            parent_id_by_position.push(id);
        }
        // `chunk.parent_chunk_id` on a child chunk is a *position* index
        // into the parent-chunk slice (see chunk.rs), not a real id yet;
        // resolve it against the ids we just minted before inserting.
        for chunk in &outcome.chunks {
            if let Some(parent_position) = chunk.parent_chunk_id {
                let real_parent_id = parent_id_by_position
                    .get(parent_position as usize)
                    .copied()
                    .ok_or_else(|| AppError::Internal("chunk references an out-of-range parent position".to_string()))?;
                insert_chunk(&mut tx, chunk, Some(real_parent_id)).await?;
            }
        }

        if !outcome.concepts.is_empty() {
            batch_insert_concepts(&mut tx, &outcome.concepts).await?;
        }

        for summary in &outcome.summaries {
            insert_summary(&mut tx, summary).await?;
        }

        if let Some(assignment) = &outcome.cluster_assignment {
            // Read, decide, and write cluster membership inside this
            // same transaction. By this point the transaction already
            // holds SQLite's one write lock (the chunk inserts above
            // forced that), so this read is never stale with respect
            // to a concurrent `commit_ingest`'s write, and that
            // concurrent call's own read in turn can't run until this
            // transaction commits (§5: cluster-row serialization; S4).
            let existing_clusters = list_clusters_for_kb_tx(&mut tx, assignment.kb_id).await?;
            let engine = ClusteringEngine::new();
            let cluster = match engine.find_best_cluster(
                &assignment.concept_names,
                &assignment.suggested_cluster_name,
                &existing_clusters,
            ) {
                Some(cluster_id) => {
                    let mut cluster = existing_clusters
                        .get(&cluster_id)
                        .cloned()
                        .ok_or_else(|| AppError::Internal("clustering engine returned an unknown cluster id".to_string()))?;
                    engine.add_to_cluster(&mut cluster, outcome.document_id, &assignment.concept_names);
                    cluster
                }
                None => engine.create_cluster(
                    assignment.kb_id,
                    outcome.document_id,
                    assignment.suggested_cluster_name.clone(),
                    &assignment.concept_names,
                    assignment.skill_level.clone(),
                    &existing_clusters,
                ),
            };

            upsert_cluster_tx(&mut tx, &cluster).await?;
            sqlx::query("UPDATE documents SET cluster_id = ? WHERE id = ?")
                .bind(cluster.id)
                .bind(outcome.document_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "UPDATE documents SET chunking_status = 'chunked', summary_status = ?, chunk_count = ?, \
             skill_level = ?, updated_at = ? WHERE id = ?",
        )
        .bind(if outcome.summaries.is_empty() { "pending" } else { "summarized" })
        .bind(outcome.chunks.len() as i64)
        .bind(&outcome.skill_level)
        .bind(Utc::now().to_rfc3339())
        .bind(outcome.document_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.invalidate_owner_caches(&outcome.owner_username).await;
        info!(document_id = outcome.document_id, chunks = outcome.chunks.len(), "ingest committed");
        Ok(())
    }

    pub async fn get_document(&self, id: i64) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?").bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(document_from_row))
    }

    /// Read-through search: joins the document with its owning cluster.
    pub async fn get_document_with_cluster(&self, id: i64) -> Result<Option<(Document, Option<Cluster>)>> {
        let Some(doc) = self.get_document(id).await? else { return Ok(None) };
        let cluster = match doc.cluster_id {
            Some(cid) => self.get_cluster(cid).await?,
            None => None,
        };
        Ok(Some((doc, cluster)))
    }

    pub async fn list_documents_for_kb(&self, kb_id: i64) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents WHERE kb_id = ? ORDER BY id")
            .bind(kb_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(document_from_row).collect())
    }

    pub async fn get_raw_text(&self, doc_id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT raw_text FROM vector_documents WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("raw_text")))
    }

    /// Cascading delete (invariant 3, §8): removes the document's
    /// Chunks, Summaries, Concepts, VectorDocument, and IdeaSeeds that
    /// reference it, and drops it from its Cluster — deleting the
    /// cluster too if that empties it.
    pub async fn delete_document(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let doc = sqlx::query("SELECT kb_id, owner_username, cluster_id FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("document {id} not found")))?;
        let kb_id: i64 = doc.get("kb_id");
        let owner: String = doc.get("owner_username");
        let cluster_id: Option<i64> = doc.get("cluster_id");

        sqlx::query("DELETE FROM chunks WHERE document_id = ?").bind(id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM summaries WHERE document_id = ?").bind(id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM concepts WHERE document_id = ?").bind(id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM vector_documents WHERE doc_id = ?").bind(id).execute(&mut *tx).await?;
        sqlx::query(
            "DELETE FROM build_idea_seeds WHERE id IN (SELECT id FROM build_idea_seeds WHERE referenced_sections LIKE '%' || ? || '%')",
        )
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?").bind(id).execute(&mut *tx).await?;
        sqlx::query("UPDATE knowledge_bases SET document_count = document_count - 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(kb_id)
            .execute(&mut *tx)
            .await?;

        if let Some(cid) = cluster_id {
            if let Some(row) = sqlx::query("SELECT doc_ids FROM clusters WHERE id = ?").bind(cid).fetch_optional(&mut *tx).await? {
                let mut doc_ids: Vec<i64> = from_json(row.get("doc_ids"));
                doc_ids.retain(|&d| d != id);
                if doc_ids.is_empty() {
                    sqlx::query("DELETE FROM clusters WHERE id = ?").bind(cid).execute(&mut *tx).await?;
                } else {
                    sqlx::query("UPDATE clusters SET doc_ids = ?, doc_count = ?, updated_at = ? WHERE id = ?")
                        .bind(to_json(&doc_ids))
                        .bind(doc_ids.len() as i64)
                        .bind(Utc::now().to_rfc3339())
                        .bind(cid)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        self.invalidate_owner_caches(&owner).await;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Chunks / concepts / summaries (read paths)
    // -----------------------------------------------------------------

    pub async fn list_chunks_for_document(&self, document_id: i64) -> Result<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_index")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(chunk_from_row).collect())
    }

    pub async fn get_chunk(&self, id: i64) -> Result<Option<Chunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?").bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(chunk_from_row))
    }

    /// Every child chunk in `kb_id`, the corpus the hybrid retriever
    /// (§4.I) fits its TF-IDF model and dense index against. Scoped to
    /// one KB so search never crosses tenant boundaries (invariant 5).
    pub async fn list_child_chunks_for_kb(&self, kb_id: i64) -> Result<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE kb_id = ? AND tier = 'child' ORDER BY id")
            .bind(kb_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(chunk_from_row).collect())
    }

    pub async fn list_concepts_for_document(&self, document_id: i64) -> Result<Vec<Concept>> {
        let rows = sqlx::query("SELECT * FROM concepts WHERE document_id = ? ORDER BY confidence DESC")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| Concept {
                id: r.get("id"),
                document_id: r.get("document_id"),
                name: r.get("name"),
                category: r.get("category"),
                confidence: r.get::<f64, _>("confidence") as f32,
                created_at: parse_ts(r.get("created_at")),
            })
            .collect())
    }

    pub async fn list_summaries_for_document(&self, document_id: i64) -> Result<Vec<Summary>> {
        let rows = sqlx::query("SELECT * FROM summaries WHERE document_id = ? ORDER BY level, id")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(summary_from_row).collect())
    }

    // -----------------------------------------------------------------
    // Clusters
    // -----------------------------------------------------------------

    pub async fn get_cluster(&self, id: i64) -> Result<Option<Cluster>> {
        let row = sqlx::query("SELECT * FROM clusters WHERE id = ?").bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(cluster_from_row))
    }

    /// All clusters in a KB, ordered by id. Read-only convenience for
    /// callers that just want to display cluster state (e.g. the build
    /// suggester); [`Self::commit_ingest`] does not use this — it reads
    /// clusters through its own transaction so the read is covered by
    /// the same lock as its write (§5, S4).
    pub async fn list_clusters_for_kb(&self, kb_id: i64) -> Result<BTreeMap<i64, Cluster>> {
        let rows = sqlx::query("SELECT * FROM clusters WHERE kb_id = ? ORDER BY id").bind(kb_id).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|r| { let c = cluster_from_row(r); (c.id, c) }).collect())
    }

    pub async fn upsert_cluster(&self, cluster: &Cluster) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_cluster_tx(&mut tx, cluster).await?;
        tx.commit().await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Build ideas
    // -----------------------------------------------------------------

    pub async fn add_build_idea_seeds(&self, seeds: &[BuildIdeaSeed]) -> Result<Vec<i64>> {
        let mut ids = Vec::with_capacity(seeds.len());
        let mut tx = self.pool.begin().await?;
        for seed in seeds {
            let id: i64 = sqlx::query(
                "INSERT INTO build_idea_seeds (kb_id, title, description, feasibility, effort_estimate, \
                 required_skills, missing_knowledge, relevant_clusters, starter_steps, knowledge_coverage, \
                 referenced_sections, status, generated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
            )
            .bind(seed.kb_id)
            .bind(&seed.title)
            .bind(&seed.description)
            .bind(feasibility_str(seed.feasibility))
            .bind(&seed.effort_estimate)
            .bind(to_json(&seed.required_skills))
            .bind(to_json(&seed.missing_knowledge))
            .bind(to_json(&seed.relevant_clusters))
            .bind(to_json(&seed.starter_steps))
            .bind(seed.knowledge_coverage)
            .bind(to_json(&seed.referenced_sections))
            .bind("proposed")
            .bind(seed.generated_at.to_rfc3339())
            .fetch_one(&mut *tx)
            .await?
            .get("id");
            ids.push(id);
        }
        tx.commit().await?;
        self.invalidate_namespace_for_kb(seeds.first().map(|s| s.kb_id)).await;
        Ok(ids)
    }

    pub async fn list_build_idea_seeds_for_kb(&self, kb_id: i64) -> Result<Vec<BuildIdeaSeed>> {
        let rows = sqlx::query("SELECT * FROM build_idea_seeds WHERE kb_id = ? ORDER BY id DESC")
            .bind(kb_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(idea_seed_from_row).collect())
    }

    // -----------------------------------------------------------------
    // Jobs (§4.C)
    // -----------------------------------------------------------------

    pub async fn create_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (id, kind, owner_username, payload, state, progress_percent, progress_message, \
             attempt, max_attempts, result, error_kind, error_message, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(job_kind_str(job.kind))
        .bind(&job.owner_username)
        .bind(job.payload.to_string())
        .bind(job_state_str(job.state))
        .bind(job.progress.percent as i64)
        .bind(&job.progress.message)
        .bind(job.attempt as i64)
        .bind(job.max_attempts as i64)
        .bind(job.result.as_ref().map(|v| v.to_string()))
        .bind(job.error.as_ref().map(|e| e.kind.clone()))
        .bind(job.error.as_ref().map(|e| e.message.clone()))
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?").bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(job_from_row))
    }

    pub async fn update_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET state = ?, progress_percent = ?, progress_message = ?, attempt = ?, \
             result = ?, error_kind = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(job_state_str(job.state))
        .bind(job.progress.percent as i64)
        .bind(&job.progress.message)
        .bind(job.attempt as i64)
        .bind(job.result.as_ref().map(|v| v.to_string()))
        .bind(job.error.as_ref().map(|e| e.kind.clone()))
        .bind(job.error.as_ref().map(|e| e.message.clone()))
        .bind(Utc::now().to_rfc3339())
        .bind(&job.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_job(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// Move a job that finished its backoff delay back to `PENDING` so
    /// the next free worker can claim it, provided nothing else moved
    /// it out of `Retry` in the meantime (e.g. manual cancellation).
    pub async fn reset_job_to_pending(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET state = 'pending', updated_at = ? WHERE id = ? AND state = 'retry'")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomically claim one `PENDING` job for a worker, transitioning
    /// it to `PROCESSING` in the same statement so two workers can
    /// never claim the same job (the queue's single point of
    /// cross-worker contention).
    pub async fn claim_next_pending_job(&self) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM jobs WHERE state = 'pending' ORDER BY created_at LIMIT 1")
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let mut job = job_from_row(row);
        job.state = JobState::Processing;
        job.updated_at = Utc::now();
        sqlx::query("UPDATE jobs SET state = 'processing', updated_at = ? WHERE id = ? AND state = 'pending'")
            .bind(job.updated_at.to_rfc3339())
            .bind(&job.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    // -----------------------------------------------------------------
    // Usage accounting (§4.L)
    // -----------------------------------------------------------------

    /// Look up or idempotently create the current calendar-month
    /// `UsageRecord` for `username`. The `UNIQUE(username, period_start)`
    /// constraint makes concurrent first-calls-of-the-month safe: the
    /// loser of the race just re-selects the winner's row.
    pub async fn get_or_create_usage_record(&self, username: &str, now: DateTime<Utc>) -> Result<UsageRecord> {
        let period_start = crate::usage::period_start(now);
        if let Some(existing) = self.find_usage_record(username, period_start).await? {
            return Ok(existing);
        }

        let fresh = crate::usage::new_period_record(username, None, now);
        let insert = sqlx::query(
            "INSERT OR IGNORE INTO usage_records (username, subscription_id, period_start, period_end, \
             api_calls, documents_uploaded, ai_requests, storage_bytes, search_queries, build_suggestions, created_at) \
             VALUES (?, NULL, ?, ?, 0, 0, 0, 0, 0, 0, ?)",
        )
        .bind(username)
        .bind(fresh.period_start.to_rfc3339())
        .bind(fresh.period_end.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        let _ = insert;

        self.find_usage_record(username, period_start)
            .await?
            .ok_or_else(|| AppError::Internal("usage record vanished immediately after insert".to_string()))
    }

    async fn find_usage_record(&self, username: &str, period_start: DateTime<Utc>) -> Result<Option<UsageRecord>> {
        let row = sqlx::query("SELECT * FROM usage_records WHERE username = ? AND period_start = ?")
            .bind(username)
            .bind(period_start.to_rfc3339())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(usage_record_from_row))
    }

    /// Atomic increment (`UPDATE ... SET x = x + 1`), never a
    /// read-modify-write in application code, per §5's shared-resource
    /// policy for usage counters.
    pub async fn apply_usage(&self, username: &str, period_start: DateTime<Utc>, op: crate::usage::Operation, storage_delta_bytes: i64) -> Result<()> {
        for counter in op.counters() {
            let column = match counter {
                crate::usage::Counter::ApiCalls => "api_calls",
                crate::usage::Counter::DocumentsUploaded => "documents_uploaded",
                crate::usage::Counter::AiRequests => "ai_requests",
                crate::usage::Counter::SearchQueries => "search_queries",
                crate::usage::Counter::BuildSuggestions => "build_suggestions",
            };
            let sql = format!("UPDATE usage_records SET {column} = {column} + 1 WHERE username = ? AND period_start = ?");
            sqlx::query(&sql).bind(username).bind(period_start.to_rfc3339()).execute(&self.pool).await?;
        }
        if storage_delta_bytes != 0 {
            sqlx::query("UPDATE usage_records SET storage_bytes = storage_bytes + ? WHERE username = ? AND period_start = ?")
                .bind(storage_delta_bytes)
                .bind(username)
                .bind(period_start.to_rfc3339())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn get_subscription(&self, username: &str) -> Result<Option<Subscription>> {
        let row = sqlx::query("SELECT * FROM subscriptions WHERE username = ?").bind(username).fetch_optional(&self.pool).await?;
        Ok(row.map(subscription_from_row))
    }

    pub async fn get_rate_limit_override(&self, username: &str) -> Result<Option<RateLimitOverride>> {
        let row = sqlx::query("SELECT * FROM rate_limit_overrides WHERE username = ?").bind(username).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| RateLimitOverride {
            username: r.get("username"),
            api_calls_per_minute: r.get("api_calls_per_minute"),
            api_calls_per_day: r.get("api_calls_per_day"),
            documents_per_month: r.get("documents_per_month"),
            ai_requests_per_day: r.get("ai_requests_per_day"),
            storage_mb: r.get("storage_mb"),
            knowledge_bases: r.get("knowledge_bases"),
            reason: r.get("reason"),
            granted_by: r.get("granted_by"),
            expires_at: r.get::<Option<String>, _>("expires_at").map(|s| parse_ts(s)),
        }))
    }

    // -----------------------------------------------------------------
    // Cache invalidation hooks (§4.N)
    // -----------------------------------------------------------------

    async fn invalidate_owner_caches(&self, owner: &str) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.invalidate_for_owner(owner).await {
                debug!(error = %e, owner, "cache invalidation failed, falling through");
            }
        }
    }

    async fn invalidate_namespace_for_kb(&self, kb_id: Option<i64>) {
        let Some(kb_id) = kb_id else { return };
        if let Some(cache) = &self.cache {
            let key = ResponseCache::compute_key(crate::cache::Namespace::BuildSuggestions, "kb", &kb_id.to_string());
            let _ = cache.invalidate(crate::cache::Namespace::BuildSuggestions, &key).await;
        }
    }
}

/// Everything [`SqliteStore::create_document`] needs to insert a fresh
/// Document + VectorDocument row; chunking/concepts/clustering happen
/// later in the pipeline against the resulting `id`.
pub struct NewDocument {
    pub kb_id: i64,
    pub owner_username: String,
    pub source_type: SourceType,
    pub filename: Option<String>,
    pub source_url: Option<String>,
    pub image_path: Option<String>,
    pub content_length: i64,
    pub raw_text: String,
}

/// The inputs [`SqliteStore::commit_ingest`] needs to run the
/// clustering engine itself, inside its own transaction, against a
/// cluster snapshot read under the same lock as the eventual write
/// (§5, S4) — deliberately *not* a pre-decided [`Cluster`], since
/// deciding membership before the transaction starts is the race this
/// type exists to close off.
pub struct ClusterAssignmentInput {
    pub kb_id: i64,
    pub concept_names: Vec<String>,
    pub suggested_cluster_name: String,
    pub skill_level: Option<String>,
}

/// Everything [`SqliteStore::commit_ingest`] writes in one transaction
/// once chunking, embedding, concept extraction, and summarization have
/// all produced their results for `document_id`. Clustering is decided
/// inside the transaction from `cluster_assignment`, not beforehand.
pub struct IngestOutcome {
    pub document_id: i64,
    pub owner_username: String,
    pub skill_level: Option<String>,
    pub chunks: Vec<Chunk>,
    pub concepts: Vec<Concept>,
    pub summaries: Vec<Summary>,
    pub cluster_assignment: Option<ClusterAssignmentInput>,
}

async fn insert_chunk(tx: &mut Transaction<'_, Sqlite>, chunk: &Chunk, real_parent_id: Option<i64>) -> Result<i64> {
    let id: i64 = sqlx::query(
        "INSERT INTO chunks (document_id, kb_id, chunk_index, tier, parent_chunk_id, start_token, end_token, \
         content, token_count, embedding, concepts, summary, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(chunk.document_id)
    .bind(chunk.kb_id)
    .bind(chunk.chunk_index)
    .bind(tier_str(chunk.tier))
    .bind(real_parent_id)
    .bind(chunk.start_token)
    .bind(chunk.end_token)
    .bind(&chunk.content)
    .bind(chunk.token_count)
    .bind(chunk.embedding.as_ref().map(|v| encode_vector(v)))
    .bind(to_json(&chunk.concepts))
    .bind(&chunk.summary)
    .bind(chunk.created_at.to_rfc3339())
    .fetch_one(&mut **tx)
    .await?
    .get("id");
    Ok(id)
}

/// Batch insert, not row-by-row (§9 design notes: "row-by-row concept
/// inserts" is the anti-pattern to avoid). `INSERT OR REPLACE` honors
/// the `(document_id, name)` uniqueness invariant by keeping the
/// highest-confidence write when a caller re-submits.
async fn batch_insert_concepts(tx: &mut Transaction<'_, Sqlite>, concepts: &[Concept]) -> Result<()> {
    let mut qb = sqlx::QueryBuilder::new(
        "INSERT OR REPLACE INTO concepts (document_id, name, category, confidence, created_at) ",
    );
    qb.push_values(concepts, |mut b, c| {
        b.push_bind(c.document_id)
            .push_bind(&c.name)
            .push_bind(&c.category)
            .push_bind(c.confidence)
            .push_bind(c.created_at.to_rfc3339());
    });
    qb.build().execute(&mut **tx).await?;
    Ok(())
}

async fn insert_summary(tx: &mut Transaction<'_, Sqlite>, summary: &Summary) -> Result<i64> {
    let id: i64 = sqlx::query(
        "INSERT INTO summaries (document_id, chunk_id, parent_id, level, short_summary, long_summary, \
         key_concepts, tech_stack, skill_profile, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(summary.document_id)
    .bind(summary.chunk_id)
    .bind(summary.parent_id)
    .bind(summary.level as i64)
    .bind(&summary.short_summary)
    .bind(&summary.long_summary)
    .bind(to_json(&summary.key_concepts))
    .bind(to_json(&summary.tech_stack))
    .bind(&summary.skill_profile)
    .bind(summary.created_at.to_rfc3339())
    .fetch_one(&mut **tx)
    .await?
    .get("id");
    Ok(id)
}

/// Same read as [`SqliteStore::list_clusters_for_kb`], but against the
/// caller's transaction so it observes that transaction's own writes
/// and shares its lock — the snapshot [`SqliteStore::commit_ingest`]
/// runs the clustering engine against (§5, S4).
async fn list_clusters_for_kb_tx(tx: &mut Transaction<'_, Sqlite>, kb_id: i64) -> Result<BTreeMap<i64, Cluster>> {
    let rows = sqlx::query("SELECT * FROM clusters WHERE kb_id = ? ORDER BY id").bind(kb_id).fetch_all(&mut **tx).await?;
    Ok(rows.into_iter().map(|r| { let c = cluster_from_row(r); (c.id, c) }).collect())
}

async fn upsert_cluster_tx(tx: &mut Transaction<'_, Sqlite>, cluster: &Cluster) -> Result<()> {
    sqlx::query(
        "INSERT INTO clusters (id, kb_id, name, primary_concepts, skill_level, doc_ids, doc_count, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, primary_concepts = excluded.primary_concepts, \
         skill_level = excluded.skill_level, doc_ids = excluded.doc_ids, doc_count = excluded.doc_count, \
         updated_at = excluded.updated_at",
    )
    .bind(cluster.id)
    .bind(cluster.kb_id)
    .bind(&cluster.name)
    .bind(to_json(&cluster.primary_concepts))
    .bind(&cluster.skill_level)
    .bind(to_json(&cluster.doc_ids))
    .bind(cluster.doc_count)
    .bind(cluster.created_at.to_rfc3339())
    .bind(cluster.updated_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn tier_str(t: ChunkTier) -> &'static str {
    match t {
        ChunkTier::Parent => "parent",
        ChunkTier::Child => "child",
    }
}

fn tier_from_str(s: &str) -> ChunkTier {
    match s {
        "child" => ChunkTier::Child,
        _ => ChunkTier::Parent,
    }
}

fn feasibility_str(f: Feasibility) -> &'static str {
    match f {
        Feasibility::High => "high",
        Feasibility::Medium => "medium",
        Feasibility::Low => "low",
    }
}

fn feasibility_from_str(s: &str) -> Feasibility {
    match s {
        "high" => Feasibility::High,
        "low" => Feasibility::Low,
        _ => Feasibility::Medium,
    }
}

fn job_kind_str(k: JobKind) -> &'static str {
    match k {
        JobKind::Ingest => "ingest",
        JobKind::Embed => "embed",
        JobKind::ExtractConcepts => "extract_concepts",
        JobKind::Cluster => "cluster",
        JobKind::Summarize => "summarize",
        JobKind::Suggest => "suggest",
    }
}

fn job_kind_from_str(s: &str) -> JobKind {
    match s {
        "embed" => JobKind::Embed,
        "extract_concepts" => JobKind::ExtractConcepts,
        "cluster" => JobKind::Cluster,
        "summarize" => JobKind::Summarize,
        "suggest" => JobKind::Suggest,
        _ => JobKind::Ingest,
    }
}

fn job_state_str(s: JobState) -> &'static str {
    match s {
        JobState::Pending => "pending",
        JobState::Processing => "processing",
        JobState::Success => "success",
        JobState::Failure => "failure",
        JobState::Retry => "retry",
    }
}

fn job_state_from_str(s: &str) -> JobState {
    match s {
        "processing" => JobState::Processing,
        "success" => JobState::Success,
        "failure" => JobState::Failure,
        "retry" => JobState::Retry,
        _ => JobState::Pending,
    }
}

fn kb_from_row(r: sqlx::sqlite::SqliteRow) -> KnowledgeBase {
    KnowledgeBase {
        id: r.get("id"),
        owner_username: r.get("owner_username"),
        name: r.get("name"),
        is_default: r.get::<i64, _>("is_default") != 0,
        document_count: r.get("document_count"),
        created_at: parse_ts(r.get("created_at")),
        updated_at: parse_ts(r.get("updated_at")),
    }
}

fn document_from_row(r: sqlx::sqlite::SqliteRow) -> Document {
    let id: i64 = r.get("id");
    let source_type: String = r.get("source_type");
    let chunking_status: String = r.get("chunking_status");
    let summary_status: String = r.get("summary_status");
    Document {
        id,
        doc_id: id,
        kb_id: r.get("kb_id"),
        owner_username: r.get("owner_username"),
        cluster_id: r.get("cluster_id"),
        source_type: match source_type.as_str() {
            "url" => SourceType::Url,
            "file" => SourceType::File,
            "image" => SourceType::Image,
            _ => SourceType::Text,
        },
        filename: r.get("filename"),
        source_url: r.get("source_url"),
        image_path: r.get("image_path"),
        content_length: r.get("content_length"),
        skill_level: r.get("skill_level"),
        chunking_status: match chunking_status.as_str() {
            "chunked" => ChunkingStatus::Chunked,
            "failed" => ChunkingStatus::Failed,
            _ => ChunkingStatus::Pending,
        },
        summary_status: match summary_status.as_str() {
            "summarized" => SummaryStatus::Summarized,
            "failed" => SummaryStatus::Failed,
            _ => SummaryStatus::Pending,
        },
        chunk_count: r.get("chunk_count"),
        ingested_at: parse_ts(r.get("ingested_at")),
        updated_at: parse_ts(r.get("updated_at")),
    }
}

fn chunk_from_row(r: sqlx::sqlite::SqliteRow) -> Chunk {
    let tier: String = r.get("tier");
    let embedding: Option<Vec<u8>> = r.get("embedding");
    let concepts: String = r.get("concepts");
    Chunk {
        id: r.get("id"),
        document_id: r.get("document_id"),
        kb_id: r.get("kb_id"),
        chunk_index: r.get("chunk_index"),
        tier: tier_from_str(&tier),
        parent_chunk_id: r.get("parent_chunk_id"),
        start_token: r.get("start_token"),
        end_token: r.get("end_token"),
        content: r.get("content"),
        token_count: r.get("token_count"),
        embedding: embedding.map(|b| decode_vector(&b)),
        concepts: from_json(&concepts),
        summary: r.get("summary"),
        created_at: parse_ts(r.get("created_at")),
    }
}

fn summary_from_row(r: sqlx::sqlite::SqliteRow) -> Summary {
    let level: i64 = r.get("level");
    let key_concepts: String = r.get("key_concepts");
    let tech_stack: String = r.get("tech_stack");
    Summary {
        id: r.get("id"),
        document_id: r.get("document_id"),
        chunk_id: r.get("chunk_id"),
        parent_id: r.get("parent_id"),
        level: match level {
            1 => SummaryLevel::Chunk,
            2 => SummaryLevel::Section,
            _ => SummaryLevel::Document,
        },
        short_summary: r.get("short_summary"),
        long_summary: r.get("long_summary"),
        key_concepts: from_json(&key_concepts),
        tech_stack: from_json(&tech_stack),
        skill_profile: r.get("skill_profile"),
        created_at: parse_ts(r.get("created_at")),
    }
}

fn cluster_from_row(r: sqlx::sqlite::SqliteRow) -> Cluster {
    let primary_concepts: String = r.get("primary_concepts");
    let doc_ids: String = r.get("doc_ids");
    Cluster {
        id: r.get("id"),
        kb_id: r.get("kb_id"),
        name: r.get("name"),
        primary_concepts: from_json(&primary_concepts),
        skill_level: r.get("skill_level"),
        doc_ids: from_json(&doc_ids),
        doc_count: r.get("doc_count"),
        created_at: parse_ts(r.get("created_at")),
        updated_at: parse_ts(r.get("updated_at")),
    }
}

fn idea_seed_from_row(r: sqlx::sqlite::SqliteRow) -> BuildIdeaSeed {
    let feasibility: String = r.get("feasibility");
    let required_skills: String = r.get("required_skills");
    let missing_knowledge: String = r.get("missing_knowledge");
    let relevant_clusters: String = r.get("relevant_clusters");
    let starter_steps: String = r.get("starter_steps");
    let referenced_sections: String = r.get("referenced_sections");
    let status: String = r.get("status");
    BuildIdeaSeed {
        id: r.get("id"),
        kb_id: r.get("kb_id"),
        title: r.get("title"),
        description: r.get("description"),
        feasibility: feasibility_from_str(&feasibility),
        effort_estimate: r.get("effort_estimate"),
        required_skills: from_json(&required_skills),
        missing_knowledge: from_json(&missing_knowledge),
        relevant_clusters: from_json(&relevant_clusters),
        starter_steps: from_json(&starter_steps),
        knowledge_coverage: r.get::<f64, _>("knowledge_coverage") as f32,
        referenced_sections: from_json(&referenced_sections),
        status: match status.as_str() {
            "saved" => IdeaStatus::Saved,
            "dismissed" => IdeaStatus::Dismissed,
            _ => IdeaStatus::Proposed,
        },
        generated_at: parse_ts(r.get("generated_at")),
    }
}

fn job_from_row(r: sqlx::sqlite::SqliteRow) -> Job {
    let kind: String = r.get("kind");
    let state: String = r.get("state");
    let payload: String = r.get("payload");
    let result: Option<String> = r.get("result");
    let error_kind: Option<String> = r.get("error_kind");
    let error_message: Option<String> = r.get("error_message");
    Job {
        id: r.get("id"),
        kind: job_kind_from_str(&kind),
        owner_username: r.get("owner_username"),
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        state: job_state_from_str(&state),
        progress: JobProgress { percent: r.get::<i64, _>("progress_percent") as u8, message: r.get("progress_message") },
        attempt: r.get::<i64, _>("attempt") as u32,
        max_attempts: r.get::<i64, _>("max_attempts") as u32,
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
        error: match (error_kind, error_message) {
            (Some(kind), Some(message)) => Some(JobError { kind, message }),
            _ => None,
        },
        created_at: parse_ts(r.get("created_at")),
        updated_at: parse_ts(r.get("updated_at")),
    }
}

fn usage_record_from_row(r: sqlx::sqlite::SqliteRow) -> UsageRecord {
    UsageRecord {
        id: r.get("id"),
        username: r.get("username"),
        subscription_id: r.get("subscription_id"),
        period_start: parse_ts(r.get("period_start")),
        period_end: parse_ts(r.get("period_end")),
        api_calls: r.get("api_calls"),
        documents_uploaded: r.get("documents_uploaded"),
        ai_requests: r.get("ai_requests"),
        storage_bytes: r.get("storage_bytes"),
        search_queries: r.get("search_queries"),
        build_suggestions: r.get("build_suggestions"),
        created_at: parse_ts(r.get("created_at")),
    }
}

fn subscription_from_row(r: sqlx::sqlite::SqliteRow) -> Subscription {
    Subscription {
        id: r.get("id"),
        username: r.get("username"),
        plan: match r.get::<String, _>("plan").as_str() {
            "starter" => Plan::Starter,
            "pro" => Plan::Pro,
            "enterprise" => Plan::Enterprise,
            _ => Plan::Free,
        },
        status: r.get("status"),
        current_period_start: r.get::<Option<String>, _>("current_period_start").map(parse_ts),
        current_period_end: r.get::<Option<String>, _>("current_period_end").map(parse_ts),
        cancel_at_period_end: r.get::<i64, _>("cancel_at_period_end") != 0,
        created_at: parse_ts(r.get("created_at")),
        updated_at: parse_ts(r.get("updated_at")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    async fn test_store() -> SqliteStore {
        let config = StoreConfig {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 5,
            image_store_path: "./data/images".to_string(),
            max_upload_bytes: 100 * 1024 * 1024,
        };
        SqliteStore::new(&config).await.unwrap()
    }

    #[tokio::test]
    async fn create_user_then_conflict_on_duplicate() {
        let store = test_store().await;
        store.create_user("alice", "hash").await.unwrap();
        let err = store.create_user("alice", "hash2").await.unwrap_err();
        assert_eq!(err.category(), "conflict");
    }

    #[tokio::test]
    async fn first_knowledge_base_is_default() {
        let store = test_store().await;
        let kb = store.create_knowledge_base("alice", "Personal").await.unwrap();
        assert!(kb.is_default);
        let second = store.create_knowledge_base("alice", "Work").await.unwrap();
        assert!(!second.is_default);
    }

    #[tokio::test]
    async fn document_ids_are_monotonic_across_inserts() {
        let store = test_store().await;
        let kb = store.create_knowledge_base("alice", "Personal").await.unwrap();
        let first = store
            .create_document(NewDocument {
                kb_id: kb.id,
                owner_username: "alice".to_string(),
                source_type: SourceType::Text,
                filename: None,
                source_url: None,
                image_path: None,
                content_length: 10,
                raw_text: "hello".to_string(),
            })
            .await
            .unwrap();
        let second = store
            .create_document(NewDocument {
                kb_id: kb.id,
                owner_username: "alice".to_string(),
                source_type: SourceType::Text,
                filename: None,
                source_url: None,
                image_path: None,
                content_length: 10,
                raw_text: "world".to_string(),
            })
            .await
            .unwrap();
        assert!(second.doc_id > first.doc_id);
    }

    #[tokio::test]
    async fn document_count_tracks_live_documents() {
        let store = test_store().await;
        let kb = store.create_knowledge_base("alice", "Personal").await.unwrap();
        let doc = store
            .create_document(NewDocument {
                kb_id: kb.id,
                owner_username: "alice".to_string(),
                source_type: SourceType::Text,
                filename: None,
                source_url: None,
                image_path: None,
                content_length: 10,
                raw_text: "hello".to_string(),
            })
            .await
            .unwrap();
        let refreshed = store.get_knowledge_base(kb.id).await.unwrap().unwrap();
        assert_eq!(refreshed.document_count, 1);

        store.delete_document(doc.id).await.unwrap();
        let refreshed = store.get_knowledge_base(kb.id).await.unwrap().unwrap();
        assert_eq!(refreshed.document_count, 0);
    }

    #[tokio::test]
    async fn commit_ingest_persists_chunks_concepts_and_cluster_atomically() {
        let store = test_store().await;
        let kb = store.create_knowledge_base("alice", "Personal").await.unwrap();
        let doc = store
            .create_document(NewDocument {
                kb_id: kb.id,
                owner_username: "alice".to_string(),
                source_type: SourceType::Text,
                filename: None,
                source_url: None,
                image_path: None,
                content_length: 10,
                raw_text: "Rust is great for systems programming".to_string(),
            })
            .await
            .unwrap();

        let now = Utc::now();
        let parent = Chunk {
            id: 0,
            document_id: doc.id,
            kb_id: kb.id,
            chunk_index: 0,
            tier: ChunkTier::Parent,
            parent_chunk_id: None,
            start_token: 0,
            end_token: 10,
            content: "Rust is great for systems programming".to_string(),
            token_count: 10,
            embedding: None,
            concepts: vec![],
            summary: None,
            created_at: now,
        };
        let child = Chunk { chunk_index: 1, tier: ChunkTier::Child, parent_chunk_id: Some(0), ..parent.clone() };

        let concept = Concept { id: 0, document_id: doc.id, name: "Rust".to_string(), category: "technology".to_string(), confidence: 0.9, created_at: now };
        let assignment = ClusterAssignmentInput {
            kb_id: kb.id,
            concept_names: vec!["Rust".to_string()],
            suggested_cluster_name: "Rust".to_string(),
            skill_level: Some("intermediate".to_string()),
        };

        store
            .commit_ingest(IngestOutcome {
                document_id: doc.id,
                owner_username: "alice".to_string(),
                skill_level: Some("intermediate".to_string()),
                chunks: vec![parent, child],
                concepts: vec![concept],
                summaries: vec![],
                cluster_assignment: Some(assignment),
            })
            .await
            .unwrap();

        let chunks = store.list_chunks_for_document(doc.id).await.unwrap();
        assert_eq!(chunks.len(), 2);
        let child_row = chunks.iter().find(|c| c.tier == ChunkTier::Child).unwrap();
        let parent_row = chunks.iter().find(|c| c.tier == ChunkTier::Parent).unwrap();
        assert_eq!(child_row.parent_chunk_id, Some(parent_row.id));

        let concepts = store.list_concepts_for_document(doc.id).await.unwrap();
        assert_eq!(concepts.len(), 1);

        let refreshed_doc = store.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(refreshed_doc.chunk_count, 2);
        assert_eq!(refreshed_doc.cluster_id, Some(0));
    }

    #[tokio::test]
    async fn delete_document_cascades_and_empties_cluster() {
        let store = test_store().await;
        let kb = store.create_knowledge_base("alice", "Personal").await.unwrap();
        let doc = store
            .create_document(NewDocument {
                kb_id: kb.id,
                owner_username: "alice".to_string(),
                source_type: SourceType::Text,
                filename: None,
                source_url: None,
                image_path: None,
                content_length: 5,
                raw_text: "x".to_string(),
            })
            .await
            .unwrap();

        let assignment = ClusterAssignmentInput {
            kb_id: kb.id,
            concept_names: vec!["x".to_string()],
            suggested_cluster_name: "Solo".to_string(),
            skill_level: None,
        };
        store
            .commit_ingest(IngestOutcome {
                document_id: doc.id,
                owner_username: "alice".to_string(),
                skill_level: None,
                chunks: vec![],
                concepts: vec![],
                summaries: vec![],
                cluster_assignment: Some(assignment),
            })
            .await
            .unwrap();

        store.delete_document(doc.id).await.unwrap();
        assert!(store.get_document(doc.id).await.unwrap().is_none());
        assert!(store.get_cluster(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn usage_record_is_idempotent_under_repeated_lookup() {
        let store = test_store().await;
        let now = Utc::now();
        let first = store.get_or_create_usage_record("alice", now).await.unwrap();
        let second = store.get_or_create_usage_record("alice", now).await.unwrap();
        assert_eq!(first.id, second.id);

        store.apply_usage("alice", first.period_start, crate::usage::Operation::Ingest, 1024).await.unwrap();
        let refreshed = store.get_or_create_usage_record("alice", now).await.unwrap();
        assert_eq!(refreshed.api_calls, 1);
        assert_eq!(refreshed.documents_uploaded, 1);
        assert_eq!(refreshed.storage_bytes, 1024);
    }

    #[tokio::test]
    async fn job_claim_transitions_pending_to_processing() {
        let store = test_store().await;
        let now = Utc::now();
        let job = Job {
            id: "job-1".to_string(),
            kind: JobKind::Ingest,
            owner_username: "alice".to_string(),
            payload: serde_json::json!({}),
            state: JobState::Pending,
            progress: JobProgress { percent: 0, message: "queued".to_string() },
            attempt: 0,
            max_attempts: 3,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        store.create_job(&job).await.unwrap();

        let claimed = store.claim_next_pending_job().await.unwrap().unwrap();
        assert_eq!(claimed.state, JobState::Processing);
        assert!(store.claim_next_pending_job().await.unwrap().is_none());
    }
}
