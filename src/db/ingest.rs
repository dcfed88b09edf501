use super::Db;
use super::chunks::{ChunkSyncSummary, sync_file_chunks_in};
use super::entities::{IngestSummary, ingest_entities_in};
use super::files::add_file_in;
use super::models::{ChunkDraft, IngestedIds, ParsedFile, SnapshotKind};
use super::snapshots::{latest_snapshot_in, save_tree_in};
use crate::error::Result;

/// Everything one parse of a source file writes to the store.
pub struct FileWrite<'a> {
    pub project_id: i64,
    pub path: &'a str,
    pub mtime: f64,
    pub parsed: &'a ParsedFile,
    pub source: &'a str,
    pub source_hash: &'a str,
    pub ast: &'a str,
    pub analysis: &'a str,
    pub analysis_hash: &'a str,
}

#[derive(Debug, Clone)]
pub struct FileWriteSummary {
    pub file_id: i64,
    pub ingest: IngestSummary,
    pub chunks: ChunkSyncSummary,
    /// The verbatim source differs from the previous snapshot, so prior snapshots were replaced.
    pub source_changed: bool,
}

impl Db {
    /// Writes the file row, its entities and cross-references, its three snapshots and its
    /// chunks in one immediate transaction. Any failure leaves the previous index of the
    /// file untouched, including the snapshot mtime the staleness check reads.
    ///
    /// `chunk_drafts` receives the file id and the ids assigned to the parsed entities.
    pub fn write_indexed_file<F>(&mut self, write: &FileWrite<'_>, chunk_drafts: F) -> Result<FileWriteSummary>
    where
        F: FnOnce(i64, &IngestedIds) -> Vec<ChunkDraft>,
    {
        let tx = self.immediate()?;
        let file_id = add_file_in(
            &tx,
            write.path,
            write.parsed.lines,
            write.mtime,
            write.parsed.has_docstring(),
            write.project_id,
        )?;
        let ingest = ingest_entities_in(&tx, file_id, write.parsed, write.source)?;

        let source_changed = latest_snapshot_in(&tx, file_id, SnapshotKind::Cst)?
            .is_none_or(|s| s.content_hash != write.source_hash);
        for (kind, payload, hash) in [
            (SnapshotKind::Ast, write.ast, write.source_hash),
            (SnapshotKind::Cst, write.source, write.source_hash),
            (SnapshotKind::Analysis, write.analysis, write.analysis_hash),
        ] {
            save_tree_in(
                &tx,
                file_id,
                write.project_id,
                kind,
                payload,
                hash,
                write.mtime,
                source_changed,
            )?;
        }

        let drafts = chunk_drafts(file_id, &ingest.ids);
        let chunks = sync_file_chunks_in(&tx, file_id, write.project_id, &drafts)?;
        tx.commit()?;

        Ok(FileWriteSummary {
            file_id,
            ingest,
            chunks,
            source_changed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ParsedFunction;

    fn parsed(name: &str) -> ParsedFile {
        ParsedFile {
            lines: 2,
            functions: vec![ParsedFunction {
                name: name.into(),
                line: 1,
                end_line: 2,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn write<'a>(pid: i64, parsed: &'a ParsedFile, source: &'a str, hash: &'a str) -> FileWrite<'a> {
        FileWrite {
            project_id: pid,
            path: "/proj/a.py",
            mtime: 5.0,
            parsed,
            source,
            source_hash: hash,
            ast: "{}",
            analysis: "{}",
            analysis_hash: "analysis",
        }
    }

    #[test]
    fn test_failed_write_keeps_previous_index() {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();

        let first = parsed("old_name");
        let summary = db
            .write_indexed_file(&write(pid, &first, "def old_name():\n    pass\n", "h1"), |_, _| Vec::new())
            .unwrap();
        let fid = summary.file_id;
        assert!(summary.source_changed);

        // Chunk inserts are refused, so the write fails after entities and snapshots.
        db.conn
            .execute_batch(
                "CREATE TEMP TRIGGER refuse_chunks BEFORE INSERT ON code_chunks
                 BEGIN SELECT RAISE(ABORT, 'chunk write refused'); END;",
            )
            .unwrap();
        let second = parsed("new_name");
        let draft = ChunkDraft {
            chunk_uuid: "c1".into(),
            chunk_type: "code".into(),
            text: "def new_name():".into(),
            ordinal: 0,
            entity_type: None,
            entity_id: None,
        };
        let err = db.write_indexed_file(&write(pid, &second, "def new_name():\n    pass\n", "h2"), |_, _| {
            vec![draft]
        });
        assert!(err.is_err());

        let names: Vec<_> = db.functions_for_file(fid).unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["old_name"]);
        let cst = db.latest_snapshot(fid, SnapshotKind::Cst).unwrap().unwrap();
        assert_eq!(cst.content_hash, "h1");
        assert!(db.list_file_chunks(fid).unwrap().is_empty());
    }
}
