use super::xref::{defined_entities, names_of, refresh_after_state_change, refresh_dependents};
use super::{Db, FILE_OWNED_TABLES, models::FileRecord, now};
use crate::error::{Result, StoreError};
use crate::paths::normalize_path;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use tracing::{debug, warn};

pub(crate) const FILE_COLUMNS: &str = "id, project_id, path, original_path, version_dir, lines, \
     last_modified, has_docstring, deleted, created_at, updated_at";

pub(crate) fn map_file(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        path: row.get(2)?,
        original_path: row.get(3)?,
        version_dir: row.get(4)?,
        lines: row.get(5)?,
        last_modified: row.get(6)?,
        has_docstring: row.get(7)?,
        deleted: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// Deletes every row owned by `file_id` except the file row itself. Returns rows removed.
pub(crate) fn delete_owned_rows(conn: &Connection, file_id: i64) -> Result<usize> {
    let mut removed = 0;
    for (table, predicate) in FILE_OWNED_TABLES {
        removed += conn.execute(
            &format!("DELETE FROM {table} WHERE {predicate}"),
            params![file_id],
        )?;
    }
    Ok(removed)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HardDeleteOutcome {
    pub file_id: i64,
    pub rows_removed: usize,
    pub archived_copy_removed: bool,
}

/// Records a file for a project, updating the existing row for (project, path) if any.
///
/// When several version rows share the path, the newest one is updated.
pub(crate) fn add_file_in(
    tx: &Connection,
    path: &str,
    lines: i64,
    mtime: f64,
    has_docstring: bool,
    project_id: i64,
) -> Result<i64> {
    let path = normalize_path(path);

    let project_exists: bool = tx
        .query_row(
            "SELECT 1 FROM projects WHERE id = ?1",
            params![project_id],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);
    if !project_exists {
        return Err(StoreError::not_found("project", project_id));
    }

    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM files WHERE project_id = ?1 AND path = ?2 AND deleted = 0
             ORDER BY last_modified DESC, id DESC LIMIT 1",
            params![project_id, path],
            |row| row.get(0),
        )
        .optional()?;

    let ts = now();
    let id = match existing {
        Some(id) => {
            tx.execute(
                "UPDATE files SET lines = ?1, last_modified = ?2, has_docstring = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![lines, mtime, has_docstring, ts, id],
            )?;
            id
        }
        None => {
            tx.execute(
                "INSERT INTO files (project_id, path, lines, last_modified, has_docstring, deleted, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
                params![project_id, path, lines, mtime, has_docstring, ts],
            )?;
            tx.last_insert_rowid()
        }
    };
    Ok(id)
}

impl Db {
    /// [`add_file_in`] inside its own immediate transaction.
    pub fn add_file(
        &mut self,
        path: &str,
        lines: i64,
        mtime: f64,
        has_docstring: bool,
        project_id: i64,
    ) -> Result<i64> {
        let tx = self.immediate()?;
        let id = add_file_in(&tx, path, lines, mtime, has_docstring, project_id)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn get_file(&self, file_id: i64) -> Result<FileRecord> {
        self.conn
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
                params![file_id],
                map_file,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("file", file_id))
    }

    /// Finds the row for a path: the newest active row first, else a deleted row whose
    /// restore target or archive location matches.
    pub fn find_file_by_path(&self, project_id: i64, path: &str) -> Result<Option<FileRecord>> {
        let path = normalize_path(path);
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {FILE_COLUMNS} FROM files
                     WHERE project_id = ?1 AND (path = ?2 OR original_path = ?2)
                     ORDER BY deleted ASC, last_modified DESC, id DESC LIMIT 1"
                ),
                params![project_id, path],
                map_file,
            )
            .optional()?)
    }

    pub fn list_files(&self, project_id: i64, include_deleted: bool) -> Result<Vec<FileRecord>> {
        let sql = if include_deleted {
            format!("SELECT {FILE_COLUMNS} FROM files WHERE project_id = ?1 ORDER BY path, id")
        } else {
            format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE project_id = ?1 AND deleted = 0 ORDER BY path, id"
            )
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project_id], map_file)?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    /// Removes every row owned by the file in one transaction. The file row itself stays.
    pub fn clear_file_data(&mut self, file_id: i64) -> Result<usize> {
        let project_id = self.get_file(file_id)?.project_id;
        let tx = self.immediate()?;
        let names = names_of(&defined_entities(&tx, file_id)?);
        let removed = delete_owned_rows(&tx, file_id)?;
        refresh_dependents(&tx, project_id, &names, Some(file_id))?;
        tx.commit()?;
        debug!("Cleared {removed} rows owned by file {file_id}");
        Ok(removed)
    }

    /// Clears the file's data, removes its row, then best-effort removes its archived copy.
    ///
    /// The archived copy is kept when another row still points at the same location.
    pub fn hard_delete_file(&mut self, file_id: i64) -> Result<HardDeleteOutcome> {
        let file = self.get_file(file_id)?;

        let tx = self.immediate()?;
        let names = names_of(&defined_entities(&tx, file_id)?);
        let rows_removed = delete_owned_rows(&tx, file_id)?;
        tx.execute("DELETE FROM files WHERE id = ?1", params![file_id])?;
        refresh_dependents(&tx, file.project_id, &names, None)?;
        let still_referenced: i64 = tx.query_row(
            "SELECT COUNT(*) FROM files WHERE project_id = ?1 AND path = ?2",
            params![file.project_id, file.path],
            |row| row.get(0),
        )?;
        tx.commit()?;

        let mut archived_copy_removed = false;
        if file.deleted && still_referenced == 0 {
            let archived = Path::new(&file.path);
            if archived.exists() {
                match std::fs::remove_file(archived) {
                    Ok(()) => archived_copy_removed = true,
                    Err(e) => warn!("Failed to remove archived copy {}: {e}", file.path),
                }
            }
        }

        debug!("Hard-deleted file {file_id} ({})", file.path);
        Ok(HardDeleteOutcome {
            file_id,
            rows_removed,
            archived_copy_removed,
        })
    }

    /// Marks a file deleted: `path` becomes the archive location, `original_path` the restore target.
    /// Files that referenced its entities are re-planned against the remaining live ones.
    pub(crate) fn set_deleted_state(
        &mut self,
        file_id: i64,
        archive_path: &str,
        original_path: &str,
        version_dir: &str,
    ) -> Result<()> {
        let tx = self.immediate()?;
        let rows = tx.execute(
            "UPDATE files SET deleted = 1, path = ?1, original_path = ?2, version_dir = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                normalize_path(archive_path),
                normalize_path(original_path),
                normalize_path(version_dir),
                now(),
                file_id
            ],
        )?;
        if rows == 0 {
            return Err(StoreError::not_found("file", file_id));
        }
        refresh_after_state_change(&tx, file_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Marks a file active at `live_path`, clearing the restore metadata, and re-plans
    /// its own edges together with those of its dependents.
    pub(crate) fn set_active_state(&mut self, file_id: i64, live_path: &str) -> Result<()> {
        let tx = self.immediate()?;
        let rows = tx.execute(
            "UPDATE files SET deleted = 0, path = ?1, original_path = NULL, version_dir = NULL, updated_at = ?2
             WHERE id = ?3",
            params![normalize_path(live_path), now(), file_id],
        )?;
        if rows == 0 {
            return Err(StoreError::not_found("file", file_id));
        }
        refresh_after_state_change(&tx, file_id)?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{
        ChunkDraft, EntityType, ImportType, ParsedClass, ParsedFile, ParsedFunction,
        ParsedImport, ParsedMethod, ParsedUsage, SnapshotKind, TargetType, UsageScope,
    };

    fn sample_parsed() -> ParsedFile {
        ParsedFile {
            lines: 12,
            docstring: Some("Module doc".into()),
            classes: vec![ParsedClass {
                name: "Shape".into(),
                line: 3,
                end_line: 8,
                docstring: Some("A shape".into()),
                bases: vec!["Base".into()],
                methods: vec![ParsedMethod {
                    name: "area".into(),
                    line: 5,
                    end_line: 6,
                    args: vec!["self".into()],
                    has_pass: true,
                    ..Default::default()
                }],
            }],
            functions: vec![ParsedFunction {
                name: "main".into(),
                line: 10,
                end_line: 12,
                args: vec!["argv".into()],
                ..Default::default()
            }],
            imports: vec![ParsedImport {
                name: "os".into(),
                module: None,
                import_type: ImportType::Direct,
                line: 1,
            }],
            usages: vec![ParsedUsage {
                line: 11,
                usage_type: "call".into(),
                target_type: TargetType::Class,
                target_name: "Shape".into(),
                target_class: None,
                context: "main".into(),
                scope: UsageScope::Function(0),
            }],
        }
    }

    const SOURCE: &str = "import os\n\nclass Shape(Base):\n    \"\"\"A shape\"\"\"\n    def area(self):\n        pass\n\n\n\ndef main(argv):\n    Shape()\n    return 0\n";

    #[test]
    fn test_add_file_upserts() {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();

        let a = db.add_file("/proj/a.py", 10, 100.0, false, pid).unwrap();
        let b = db.add_file("/proj/a.py", 12, 200.0, true, pid).unwrap();
        assert_eq!(a, b);

        let files = db.list_files(pid, true).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].lines, 12);
        assert_eq!(files[0].last_modified, 200.0);
        assert!(files[0].has_docstring);
        assert!(files[0].original_path.is_none());
    }

    #[test]
    fn test_add_file_requires_project() {
        let mut db = Db::open_in_memory().unwrap();
        let err = db.add_file("/proj/a.py", 1, 1.0, false, 99).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NotFound);
    }

    #[test]
    fn test_clear_file_data_removes_every_owned_row() {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();
        let fid = db.add_file("/proj/a.py", 12, 100.0, true, pid).unwrap();
        let other = db.add_file("/proj/b.py", 3, 100.0, false, pid).unwrap();

        let ids = db.ingest_entities(fid, &sample_parsed(), SOURCE).unwrap().ids;
        db.ingest_entities(other, &sample_parsed(), SOURCE).unwrap();
        db.save_tree(fid, pid, SnapshotKind::Ast, "{}", "h1", 100.0, false)
            .unwrap();
        db.save_tree(fid, pid, SnapshotKind::Cst, SOURCE, "h2", 100.0, false)
            .unwrap();
        db.sync_file_chunks(
            fid,
            pid,
            &[ChunkDraft {
                chunk_uuid: "chunk-a".into(),
                chunk_type: "code".into(),
                text: "def main(argv): ...".into(),
                ordinal: 0,
                entity_type: Some(EntityType::Function),
                entity_id: Some(ids.functions[0]),
            }],
        )
        .unwrap();
        let chunk = db.list_file_chunks(fid).unwrap().remove(0);
        db.bind_chunk_vector(chunk.id, "vec-1", "mock", 8).unwrap();

        let before: i64 = db
            .owned_row_counts(fid)
            .unwrap()
            .iter()
            .map(|(_, n)| n)
            .sum();
        assert!(before > 0);

        db.clear_file_data(fid).unwrap();

        for (table, n) in db.owned_row_counts(fid).unwrap() {
            assert_eq!(n, 0, "{table} still has rows for the cleared file");
        }
        // The other file is untouched and the file row itself survives.
        assert!(db.owned_row_counts(other).unwrap().iter().any(|(_, n)| *n > 0));
        assert!(db.get_file(fid).is_ok());

        // Clearing a childless file is fine.
        assert_eq!(db.clear_file_data(fid).unwrap(), 0);
    }

    #[test]
    fn test_hard_delete_removes_row_and_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archived = dir.path().join("a.py");
        std::fs::write(&archived, "x = 1\n").unwrap();

        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();
        let fid = db.add_file("/proj/a.py", 1, 1.0, false, pid).unwrap();
        db.set_deleted_state(
            fid,
            &archived.to_string_lossy(),
            "/proj/a.py",
            &dir.path().to_string_lossy(),
        )
        .unwrap();

        let outcome = db.hard_delete_file(fid).unwrap();
        assert!(outcome.archived_copy_removed);
        assert!(!archived.exists());
        assert!(db.get_file(fid).is_err());
    }

    #[test]
    fn test_hard_delete_keeps_live_file() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("live.py");
        std::fs::write(&live, "x = 1\n").unwrap();

        let mut db = Db::open_in_memory().unwrap();
        let pid = db
            .get_or_create_project(&dir.path().to_string_lossy(), None)
            .unwrap();
        let fid = db
            .add_file(&live.to_string_lossy(), 1, 1.0, false, pid)
            .unwrap();
        let outcome = db.hard_delete_file(fid).unwrap();
        assert!(!outcome.archived_copy_removed);
        assert!(live.exists());
    }

    #[test]
    fn test_find_file_matches_restore_target() {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();
        let fid = db.add_file("/proj/a.py", 1, 1.0, false, pid).unwrap();
        db.set_deleted_state(fid, "/versions/1/a.py", "/proj/a.py", "/versions/1")
            .unwrap();

        let found = db.find_file_by_path(pid, "/proj/a.py").unwrap().unwrap();
        assert_eq!(found.id, fid);
        assert!(found.deleted);
        assert_eq!(found.check_path(), "/proj/a.py");
        assert!(db.list_files(pid, false).unwrap().is_empty());
    }
}
