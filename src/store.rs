//! Document store: transactional persistence over SQLite.
//!
//! Two related tables — `documents` and `chunks` — plus `chunk_vectors`
//! carrying the embedding blobs. The one write path, [`DocumentStore::upsert`],
//! replaces a document and its entire chunk set in a single transaction:
//! either the full document-plus-chunks write is visible, or none of it is.
//! Chunks are never patched in place; old rows for the document are deleted
//! and the new set inserted (delete-then-insert, same transaction).
//!
//! The store refuses chunk sets that violate the durable-document
//! invariants: missing or wrong-width embeddings, non-contiguous indices,
//! or empty chunk content. A document with unembedded chunks is an invalid
//! intermediate state that must never become visible to readers.

use anyhow::{bail, Context, Result};
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{Chunk, Document, DocumentSummary, StoredDocument};

#[derive(Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
    /// Embedding model stamped on vector rows.
    model: String,
    dims: usize,
}

impl DocumentStore {
    pub fn new(pool: SqlitePool, model: impl Into<String>, dims: usize) -> Self {
        Self {
            pool,
            model: model.into(),
            dims,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Atomically write a document and its full chunk set.
    ///
    /// Existing rows under the same id are updated in place (`created_at`
    /// is preserved); the previous chunk set and its vectors are dropped in
    /// the same transaction, so readers never observe a mixed set.
    pub async fn upsert(&self, document: &Document, chunks: &[Chunk]) -> Result<()> {
        validate_chunk_set(&document.id, chunks, self.dims)?;

        let keywords_json = serde_json::to_string(&document.keywords)?;
        let merge_history_json = serde_json::to_string(&document.merge_history)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, title, category, mode, content, summary, keywords_json, created_at, updated_at, merge_history_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                category = excluded.category,
                mode = excluded.mode,
                content = excluded.content,
                summary = excluded.summary,
                keywords_json = excluded.keywords_json,
                updated_at = excluded.updated_at,
                merge_history_json = excluded.merge_history_json
            "#,
        )
        .bind(&document.id)
        .bind(&document.title)
        .bind(&document.category)
        .bind(&document.mode)
        .bind(&document.content)
        .bind(&document.summary)
        .bind(&keywords_json)
        .bind(document.created_at)
        .bind(document.updated_at)
        .bind(&merge_history_json)
        .execute(&mut *tx)
        .await?;

        // Drop the old chunk set before inserting the new one
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(&document.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&document.id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, content, token_count) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(chunk.token_count)
            .execute(&mut *tx)
            .await?;

            // validate_chunk_set already guaranteed presence
            let Some(embedding) = chunk.embedding.as_ref() else {
                bail!("Chunk {} lost its embedding before insert", chunk.id);
            };
            sqlx::query(
                "INSERT INTO chunk_vectors (chunk_id, document_id, model, dims, embedding) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&self.model)
            .bind(embedding.len() as i64)
            .bind(vec_to_blob(embedding))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Fetch a document by id.
    pub async fn get(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, title, category, mode, content, summary, keywords_json, created_at, updated_at, merge_history_json FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_document(&r)).transpose()
    }

    /// Fetch a document's chunks in index order, stored vectors attached.
    pub async fn get_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.chunk_index, c.content, c.token_count, v.embedding
            FROM chunks c
            LEFT JOIN chunk_vectors v ON v.chunk_id = c.id
            WHERE c.document_id = ?
            ORDER BY c.chunk_index
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        let chunks = rows
            .iter()
            .map(|row| Chunk {
                id: row.get("id"),
                document_id: row.get("document_id"),
                chunk_index: row.get("chunk_index"),
                content: row.get("content"),
                token_count: row.get("token_count"),
                embedding: row
                    .get::<Option<Vec<u8>>, _>("embedding")
                    .map(|blob| blob_to_vec(&blob)),
            })
            .collect();

        Ok(chunks)
    }

    /// Every document with the chunk embeddings actually stored for it.
    ///
    /// The vectors are decoded from the persisted blobs as-is — never
    /// recomputed — so similarity comparisons run against what is indexed.
    pub async fn list_with_embeddings(&self, category: Option<&str>) -> Result<Vec<StoredDocument>> {
        let doc_rows = match category {
            Some(cat) => {
                sqlx::query(
                    "SELECT id, title, category, mode, content, summary, keywords_json, created_at, updated_at, merge_history_json FROM documents WHERE category = ? ORDER BY updated_at DESC",
                )
                .bind(cat)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, title, category, mode, content, summary, keywords_json, created_at, updated_at, merge_history_json FROM documents ORDER BY updated_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut out = Vec::with_capacity(doc_rows.len());
        for doc_row in &doc_rows {
            let document = row_to_document(doc_row)?;
            let vec_rows = sqlx::query(
                "SELECT embedding FROM chunk_vectors WHERE document_id = ? ORDER BY chunk_id",
            )
            .bind(&document.id)
            .fetch_all(&self.pool)
            .await?;

            let embeddings = vec_rows
                .iter()
                .map(|row| blob_to_vec(&row.get::<Vec<u8>, _>("embedding")))
                .collect();

            out.push(StoredDocument {
                document,
                embeddings,
            });
        }

        Ok(out)
    }

    /// Listing entries for CLI output, most recently updated first.
    pub async fn list_summaries(&self) -> Result<Vec<DocumentSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, d.title, d.category, d.updated_at, COUNT(c.id) AS chunk_count
            FROM documents d
            LEFT JOIN chunks c ON c.document_id = d.id
            GROUP BY d.id
            ORDER BY d.updated_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DocumentSummary {
                id: row.get("id"),
                title: row.get("title"),
                category: row.get("category"),
                chunk_count: row.get("chunk_count"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let keywords_json: String = row.get("keywords_json");
    let merge_history_json: String = row.get("merge_history_json");

    Ok(Document {
        id: row.get("id"),
        title: row.get("title"),
        category: row.get("category"),
        mode: row.get("mode"),
        content: row.get("content"),
        summary: row.get("summary"),
        keywords: serde_json::from_str(&keywords_json)
            .with_context(|| "Malformed keywords_json in documents row")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        merge_history: serde_json::from_str(&merge_history_json)
            .with_context(|| "Malformed merge_history_json in documents row")?,
    })
}

/// Reject chunk sets that would violate the durable-document invariants.
fn validate_chunk_set(document_id: &str, chunks: &[Chunk], dims: usize) -> Result<()> {
    if chunks.is_empty() {
        bail!("Document {} has no chunks to persist", document_id);
    }

    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.document_id != document_id {
            bail!(
                "Chunk {} belongs to document {}, not {}",
                chunk.id,
                chunk.document_id,
                document_id
            );
        }
        if chunk.chunk_index != i as i64 {
            bail!(
                "Document {} chunk indices not contiguous: expected {}, got {}",
                document_id,
                i,
                chunk.chunk_index
            );
        }
        if chunk.content.trim().is_empty() {
            bail!("Document {} chunk {} has empty content", document_id, i);
        }
        match &chunk.embedding {
            None => bail!(
                "Document {} chunk {} has no embedding; refusing to persist",
                document_id,
                i
            ),
            Some(embedding) => {
                if embedding.is_empty() {
                    bail!("Document {} chunk {} has an empty embedding", document_id, i);
                }
                if dims > 0 && embedding.len() != dims {
                    bail!(
                        "Document {} chunk {} embedding has {} dims, expected {}",
                        document_id,
                        i,
                        embedding.len(),
                        dims
                    );
                }
            }
        }
    }

    Ok(())
}
