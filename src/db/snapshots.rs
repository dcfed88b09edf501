use super::{Db, models::SnapshotKind, models::TreeSnapshot, now};
use crate::error::{Result, StoreError};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

const SNAPSHOT_COLUMNS: &str =
    "id, file_id, project_id, kind, payload, content_hash, source_mtime, created_at, updated_at";

fn map_snapshot(row: &Row<'_>) -> rusqlite::Result<TreeSnapshot> {
    Ok(TreeSnapshot {
        id: row.get(0)?,
        file_id: row.get(1)?,
        project_id: row.get(2)?,
        kind: row.get(3)?,
        payload: row.get(4)?,
        content_hash: row.get(5)?,
        source_mtime: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Stores a snapshot of `kind` for a file and returns its id.
///
/// With `overwrite`, every prior snapshot of that kind is dropped first. Otherwise a
/// snapshot with the same hash is refreshed in place instead of duplicated.
#[allow(clippy::too_many_arguments)]
pub(crate) fn save_tree_in(
    tx: &Connection,
    file_id: i64,
    project_id: i64,
    kind: SnapshotKind,
    payload: &str,
    content_hash: &str,
    source_mtime: f64,
    overwrite: bool,
) -> Result<i64> {
    let owner: Option<i64> = tx
        .query_row(
            "SELECT project_id FROM files WHERE id = ?1",
            params![file_id],
            |row| row.get(0),
        )
        .optional()?;
    match owner {
        None => return Err(StoreError::not_found("file", file_id)),
        Some(pid) if pid != project_id => {
            return Err(StoreError::InvalidInput(format!(
                "file {file_id} belongs to project {pid}, not {project_id}"
            )));
        }
        Some(_) => {}
    }

    if overwrite {
        let dropped = tx.execute(
            "DELETE FROM tree_snapshots WHERE file_id = ?1 AND kind = ?2",
            params![file_id, kind],
        )?;
        if dropped > 0 {
            debug!("Dropped {dropped} prior {kind} snapshots of file {file_id}");
        }
    }

    let ts = now();
    let id: i64 = tx.query_row(
        "INSERT INTO tree_snapshots (file_id, project_id, kind, payload, content_hash, source_mtime, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT(file_id, kind, content_hash) DO UPDATE
         SET payload = excluded.payload, source_mtime = excluded.source_mtime, updated_at = excluded.updated_at
         RETURNING id",
        params![file_id, project_id, kind, payload, content_hash, source_mtime, ts],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub(crate) fn latest_snapshot_in(
    conn: &Connection,
    file_id: i64,
    kind: SnapshotKind,
) -> Result<Option<TreeSnapshot>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM tree_snapshots WHERE file_id = ?1 AND kind = ?2
                 ORDER BY source_mtime DESC, updated_at DESC, id DESC LIMIT 1"
            ),
            params![file_id, kind],
            map_snapshot,
        )
        .optional()?)
}

impl Db {
    /// [`save_tree_in`] inside its own immediate transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn save_tree(
        &mut self,
        file_id: i64,
        project_id: i64,
        kind: SnapshotKind,
        payload: &str,
        content_hash: &str,
        source_mtime: f64,
        overwrite: bool,
    ) -> Result<i64> {
        let tx = self.immediate()?;
        let id = save_tree_in(&tx, file_id, project_id, kind, payload, content_hash, source_mtime, overwrite)?;
        tx.commit()?;
        Ok(id)
    }

    /// Most recently refreshed snapshot of `kind` for a file.
    pub fn latest_snapshot(&self, file_id: i64, kind: SnapshotKind) -> Result<Option<TreeSnapshot>> {
        latest_snapshot_in(&self.conn, file_id, kind)
    }

    /// Source mtime recorded by the latest snapshot of `kind`, if any.
    pub fn snapshot_mtime(&self, file_id: i64, kind: SnapshotKind) -> Result<Option<f64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT MAX(source_mtime) FROM tree_snapshots WHERE file_id = ?1 AND kind = ?2",
                params![file_id, kind],
                |row| row.get::<_, Option<f64>>(0),
            )?)
    }

    pub fn snapshot_count(&self, file_id: i64, kind: SnapshotKind) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM tree_snapshots WHERE file_id = ?1 AND kind = ?2",
            params![file_id, kind],
            |row| row.get(0),
        )?)
    }
}
