use super::{Db, now};
use super::models::{ChunkDraft, CodeChunk, EntityType, VectorIndexEntry};
use crate::error::{Result, StoreError};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::HashSet;

const CHUNK_COLUMNS: &str = "c.id, c.file_id, c.project_id, c.chunk_uuid, c.chunk_type, c.text, \
     c.ordinal, c.entity_type, c.entity_id, c.vector_id, c.embedding_model";

fn map_chunk(row: &Row<'_>) -> rusqlite::Result<CodeChunk> {
    Ok(CodeChunk {
        id: row.get(0)?,
        file_id: row.get(1)?,
        project_id: row.get(2)?,
        chunk_uuid: row.get(3)?,
        chunk_type: row.get(4)?,
        text: row.get(5)?,
        ordinal: row.get(6)?,
        entity_type: row.get(7)?,
        entity_id: row.get(8)?,
        vector_id: row.get(9)?,
        embedding_model: row.get(10)?,
    })
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ChunkSyncSummary {
    pub inserted: usize,
    pub unchanged: usize,
    pub invalidated: usize,
    pub removed: usize,
}

/// Reconciles a file's chunks with the drafts produced by the latest parse.
///
/// Chunks are matched by uuid. A chunk whose text changed loses its vector binding
/// (and vector-index entry) so the vectorizer picks it up again; chunks no longer
/// produced are removed.
pub(crate) fn sync_file_chunks_in(
    tx: &Connection,
    file_id: i64,
    project_id: i64,
    drafts: &[ChunkDraft],
) -> Result<ChunkSyncSummary> {
    let mut summary = ChunkSyncSummary::default();
    let ts = now();

    let mut produced = HashSet::with_capacity(drafts.len());
    for draft in drafts {
        produced.insert(draft.chunk_uuid.as_str());

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, text FROM code_chunks WHERE chunk_uuid = ?1",
                params![draft.chunk_uuid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => {
                tx.execute(
                    "INSERT INTO code_chunks (file_id, project_id, chunk_uuid, chunk_type, text, ordinal,
                                              entity_type, entity_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                    params![
                        file_id,
                        project_id,
                        draft.chunk_uuid,
                        draft.chunk_type,
                        draft.text,
                        draft.ordinal,
                        draft.entity_type,
                        draft.entity_id,
                        ts
                    ],
                )?;
                summary.inserted += 1;
            }
            Some((id, text)) if text == draft.text => {
                tx.execute(
                    "UPDATE code_chunks SET file_id = ?1, ordinal = ?2, entity_type = ?3, entity_id = ?4
                     WHERE id = ?5",
                    params![file_id, draft.ordinal, draft.entity_type, draft.entity_id, id],
                )?;
                summary.unchanged += 1;
            }
            Some((id, _)) => {
                tx.execute(
                    "UPDATE code_chunks SET file_id = ?1, chunk_type = ?2, text = ?3, ordinal = ?4,
                            entity_type = ?5, entity_id = ?6, vector_id = NULL, embedding_model = NULL,
                            embed_attempts = 0, last_attempt_at = NULL, updated_at = ?7
                     WHERE id = ?8",
                    params![
                        file_id,
                        draft.chunk_type,
                        draft.text,
                        draft.ordinal,
                        draft.entity_type,
                        draft.entity_id,
                        ts,
                        id
                    ],
                )?;
                tx.execute(
                    "DELETE FROM vector_index WHERE entity_type = ?1 AND entity_id = ?2",
                    params![EntityType::Chunk, id],
                )?;
                summary.invalidated += 1;
            }
        }
    }

    let current: Vec<(i64, String)> = {
        let mut stmt =
            tx.prepare_cached("SELECT id, chunk_uuid FROM code_chunks WHERE file_id = ?1")?;
        let rows = stmt
            .query_map(params![file_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        rows
    };
    for (id, uuid) in current {
        if !produced.contains(uuid.as_str()) {
            tx.execute(
                "DELETE FROM vector_index WHERE entity_type = ?1 AND entity_id = ?2",
                params![EntityType::Chunk, id],
            )?;
            tx.execute("DELETE FROM code_chunks WHERE id = ?1", params![id])?;
            summary.removed += 1;
        }
    }

    Ok(summary)
}

impl Db {
    /// [`sync_file_chunks_in`] inside its own immediate transaction.
    pub fn sync_file_chunks(
        &mut self,
        file_id: i64,
        project_id: i64,
        drafts: &[ChunkDraft],
    ) -> Result<ChunkSyncSummary> {
        let tx = self.immediate()?;
        let summary = sync_file_chunks_in(&tx, file_id, project_id, drafts)?;
        tx.commit()?;
        Ok(summary)
    }

    pub fn list_file_chunks(&self, file_id: i64) -> Result<Vec<CodeChunk>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {CHUNK_COLUMNS} FROM code_chunks c WHERE c.file_id = ?1 ORDER BY c.ordinal, c.id"
        ))?;
        let rows = stmt.query_map(params![file_id], map_chunk)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Chunks of live files that still need an embedding. Chunks never tried come
    /// first, then the ones whose last failure is oldest.
    pub fn pending_chunks(&self, project_id: Option<i64>, limit: usize) -> Result<Vec<CodeChunk>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {CHUNK_COLUMNS} FROM code_chunks c JOIN files f ON c.file_id = f.id
             WHERE c.vector_id IS NULL AND f.deleted = 0 AND (?1 IS NULL OR c.project_id = ?1)
             ORDER BY c.embed_attempts, c.last_attempt_at, c.id LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![project_id, limit as i64], map_chunk)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Counts a failed embedding attempt so the chunk yields its place in the queue.
    pub fn record_embed_failure(&mut self, chunk_id: i64) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE code_chunks SET embed_attempts = embed_attempts + 1, last_attempt_at = ?1 WHERE id = ?2",
            params![now(), chunk_id],
        )?;
        if rows == 0 {
            return Err(StoreError::not_found("chunk", chunk_id));
        }
        Ok(())
    }

    /// Records that a chunk has been embedded and indexes the vector pointer.
    pub fn bind_chunk_vector(
        &mut self,
        chunk_id: i64,
        vector_id: &str,
        model: &str,
        dim: usize,
    ) -> Result<()> {
        let tx = self.immediate()?;
        let owner: Option<(i64, i64)> = tx
            .query_row(
                "SELECT project_id, file_id FROM code_chunks WHERE id = ?1",
                params![chunk_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((project_id, file_id)) = owner else {
            return Err(StoreError::not_found("chunk", chunk_id));
        };

        tx.execute(
            "UPDATE code_chunks SET vector_id = ?1, embedding_model = ?2, updated_at = ?3 WHERE id = ?4",
            params![vector_id, model, now(), chunk_id],
        )?;
        tx.execute(
            "INSERT INTO vector_index (project_id, file_id, entity_type, entity_id, vector_id, dim, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(project_id, entity_type, entity_id) DO UPDATE
             SET file_id = excluded.file_id, vector_id = excluded.vector_id,
                 dim = excluded.dim, model = excluded.model",
            params![
                project_id,
                file_id,
                EntityType::Chunk,
                chunk_id,
                vector_id,
                dim as i64,
                model,
                now()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn vector_entries_for_file(&self, file_id: i64) -> Result<Vec<VectorIndexEntry>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT project_id, file_id, entity_type, entity_id, vector_id, dim, model
             FROM vector_index WHERE file_id = ?1 ORDER BY entity_id",
        )?;
        let rows = stmt.query_map(params![file_id], |row| {
            Ok(VectorIndexEntry {
                project_id: row.get(0)?,
                file_id: row.get(1)?,
                entity_type: row.get(2)?,
                entity_id: row.get(3)?,
                vector_id: row.get(4)?,
                dim: row.get(5)?,
                model: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(uuid: &str, text: &str, ordinal: i64) -> ChunkDraft {
        ChunkDraft {
            chunk_uuid: uuid.into(),
            chunk_type: "code".into(),
            text: text.into(),
            ordinal,
            entity_type: None,
            entity_id: None,
        }
    }

    fn setup() -> (Db, i64, i64) {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();
        let fid = db.add_file("/proj/a.py", 3, 1.0, false, pid).unwrap();
        (db, pid, fid)
    }

    #[test]
    fn test_unchanged_chunk_keeps_vector_binding() {
        let (mut db, pid, fid) = setup();
        db.sync_file_chunks(fid, pid, &[draft("u1", "def a(): pass", 0)])
            .unwrap();
        let chunk = db.list_file_chunks(fid).unwrap().remove(0);
        db.bind_chunk_vector(chunk.id, "vec-1", "mock", 8).unwrap();
        assert!(db.pending_chunks(Some(pid), 10).unwrap().is_empty());

        let summary = db
            .sync_file_chunks(fid, pid, &[draft("u1", "def a(): pass", 0)])
            .unwrap();
        assert_eq!(summary.unchanged, 1);
        let again = db.list_file_chunks(fid).unwrap().remove(0);
        assert_eq!(again.id, chunk.id);
        assert_eq!(again.vector_id.as_deref(), Some("vec-1"));
        assert_eq!(db.vector_entries_for_file(fid).unwrap().len(), 1);
    }

    #[test]
    fn test_changed_text_clears_binding_and_removed_chunks_go() {
        let (mut db, pid, fid) = setup();
        db.sync_file_chunks(
            fid,
            pid,
            &[draft("u1", "def a(): pass", 0), draft("u2", "def b(): pass", 1)],
        )
        .unwrap();
        for chunk in db.list_file_chunks(fid).unwrap() {
            db.bind_chunk_vector(chunk.id, &format!("vec-{}", chunk.id), "mock", 8)
                .unwrap();
        }

        let summary = db
            .sync_file_chunks(fid, pid, &[draft("u1", "def a(): return 1", 0)])
            .unwrap();
        assert_eq!(summary.invalidated, 1);
        assert_eq!(summary.removed, 1);

        let chunks = db.list_file_chunks(fid).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].vector_id.is_none());
        assert!(db.vector_entries_for_file(fid).unwrap().is_empty());
        assert_eq!(db.pending_chunks(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_pending_skips_deleted_files() {
        let (mut db, pid, fid) = setup();
        db.sync_file_chunks(fid, pid, &[draft("u1", "x", 0)]).unwrap();
        db.set_deleted_state(fid, "/versions/1/a.py", "/proj/a.py", "/versions/1")
            .unwrap();
        assert!(db.pending_chunks(Some(pid), 10).unwrap().is_empty());
        assert!(db.bind_chunk_vector(999, "v", "m", 1).is_err());
    }
}
