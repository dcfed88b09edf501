use crate::db::ingest::FileWrite;
use crate::db::models::SnapshotKind;
use crate::db::{SharedDb, file_mtime};
use crate::error::{ItemError, Result, StoreError};
use crate::indexer::chunks::build_chunks;
use crate::indexer::content_hash;
use crate::parser::SourceParser;
use crate::parser::extract::extract;
use crate::paths::{canonical_root, normalize_path};
use crate::staleness::StalenessOracle;
use globset::GlobSet;
use ignore::WalkBuilder;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Serialize)]
pub struct CodeSyncResult {
    pub project_id: i64,
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub added: usize,
    pub updated: usize,
    pub errors: Vec<ItemError>,
    pub elapsed_secs: f64,
    /// Set when the pass stopped early on cancellation.
    pub cancelled: bool,
}

impl CodeSyncResult {
    fn record(&mut self, path: &Path, outcome: Result<FileOutcome>) {
        match outcome {
            Ok(FileOutcome::Skipped { .. }) => self.skipped += 1,
            Ok(FileOutcome::Indexed { added, .. }) => {
                self.indexed += 1;
                if added {
                    self.added += 1;
                } else {
                    self.updated += 1;
                }
            }
            Err(e) => {
                warn!("Failed to index {}: {e}", path.display());
                self.failed += 1;
                self.errors
                    .push(ItemError::new(None, Some(&normalize_path(path)), &e));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Indexed { file_id: i64, added: bool },
    Skipped { file_id: i64 },
}

pub struct Indexer {
    db: SharedDb,
    parser: Arc<dyn SourceParser>,
    oracle: StalenessOracle,
    ignore: GlobSet,
    max_tree_depth: usize,
    /// Directories never walked, such as the archive tree.
    excluded: Vec<PathBuf>,
}

impl Indexer {
    pub fn new(
        db: SharedDb,
        parser: Arc<dyn SourceParser>,
        oracle: StalenessOracle,
        ignore: GlobSet,
        max_tree_depth: usize,
    ) -> Self {
        Self {
            db,
            parser,
            oracle,
            ignore,
            max_tree_depth,
            excluded: Vec::new(),
        }
    }

    pub fn exclude_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.excluded.push(dir.into());
        self
    }

    pub fn db(&self) -> &SharedDb {
        &self.db
    }

    /// Whether a path is a source file this indexer handles.
    pub fn is_candidate(&self, path: &Path) -> bool {
        self.parser.accepts(path)
            && !self.ignore.is_match(path)
            && !self.excluded.iter().any(|dir| path.starts_with(dir))
    }

    /// Index one file: skip it unless its AST snapshot is outdated (or `force`), otherwise
    /// parse and write entities, cross-references, snapshots and chunks in one transaction.
    pub async fn index_file(&self, project_id: i64, path: &Path, force: bool) -> Result<FileOutcome> {
        let path_str = normalize_path(path);
        let mtime = file_mtime(path)?;

        let existing = {
            let db = self.db.lock().await;
            db.find_file_by_path(project_id, &path_str)?
                .filter(|f| !f.deleted)
        };
        if let Some(file) = &existing {
            let db = self.db.lock().await;
            if !force && !self.oracle.is_outdated(&db, file.id, mtime, SnapshotKind::Ast)? {
                debug!("Up to date: {path_str}");
                return Ok(FileOutcome::Skipped { file_id: file.id });
            }
        }

        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        let tree = self.parser.parse(&source)?;
        let parsed = extract(&tree);
        let hash = content_hash(&source);
        let ast = tree.to_json()?;
        let analysis = serde_json::to_string(&tree.statistics(self.max_tree_depth))?;
        let analysis_hash = content_hash(&analysis);

        let write = FileWrite {
            project_id,
            path: &path_str,
            mtime,
            parsed: &parsed,
            source: &source,
            source_hash: &hash,
            ast: &ast,
            analysis: &analysis,
            analysis_hash: &analysis_hash,
        };
        let written = self.db.lock().await.write_indexed_file(&write, |file_id, ids| {
            build_chunks(project_id, file_id, &path_str, &parsed, ids, &source)
        })?;
        let file_id = written.file_id;

        debug!(
            file_id,
            classes = written.ingest.classes,
            functions = written.ingest.functions,
            xrefs = written.ingest.cross_references,
            dependents_replanned = written.ingest.dependents_replanned,
            chunks_invalidated = written.chunks.invalidated,
            "Indexed {path_str}"
        );
        Ok(FileOutcome::Indexed {
            file_id,
            added: existing.is_none(),
        })
    }

    /// Walks a project tree and indexes every candidate file. Per-file failures are
    /// recorded and the walk continues; cancellation stops between files.
    pub async fn index_project(
        &self,
        root: &Path,
        force: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<CodeSyncResult> {
        let started = Instant::now();
        let root = canonical_root(root);
        let project_id = {
            let mut db = self.db.lock().await;
            db.get_or_create_project(&root.to_string_lossy(), None)?
        };

        let mut result = CodeSyncResult {
            project_id,
            ..Default::default()
        };

        for path in self.collect_files(&root) {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                result.cancelled = true;
                break;
            }
            let outcome = self.index_file(project_id, &path, force).await;
            result.record(&path, outcome);
        }

        result.elapsed_secs = started.elapsed().as_secs_f64();
        info!(
            project_id,
            indexed = result.indexed,
            skipped = result.skipped,
            failed = result.failed,
            "Project sync finished for {}",
            root.display()
        );
        Ok(result)
    }

    /// Re-indexes specific paths, typically from change notifications. Paths that no
    /// longer exist are skipped and left for the repair pass.
    pub async fn index_paths(&self, project_id: i64, paths: &[PathBuf]) -> CodeSyncResult {
        let started = Instant::now();
        let mut result = CodeSyncResult {
            project_id,
            ..Default::default()
        };
        for path in paths {
            if !path.is_file() || !self.is_candidate(path) {
                continue;
            }
            let outcome = self.index_file(project_id, path, false).await;
            result.record(path, outcome);
        }
        result.elapsed_secs = started.elapsed().as_secs_f64();
        result
    }

    /// Candidate files under `root` in walk order. Honors .gitignore via `ignore`.
    pub fn collect_files(&self, root: &Path) -> Vec<PathBuf> {
        let walker = WalkBuilder::new(root).hidden(false).build();
        let mut files: Vec<PathBuf> = walker
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_some_and(|t| t.is_file()))
            .map(|e| e.into_path())
            .filter(|p| self.is_candidate(p))
            .collect();
        files.sort();
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Db;
    use crate::db::models::EntityType;
    use crate::parser::python::PythonParser;

    fn indexer(db: SharedDb) -> Indexer {
        Indexer::new(
            db,
            Arc::new(PythonParser::default()),
            StalenessOracle::default(),
            Config::default().ignore_set().unwrap(),
            512,
        )
    }

    #[tokio::test]
    async fn test_index_project_then_skip_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("lib.py"),
            "def helper():\n    return 1\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("app.py"),
            "from lib import helper\n\ndef main():\n    return helper()\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not python").unwrap();

        let db = Db::open_in_memory().unwrap().into_shared();
        let indexer = indexer(db.clone());

        let first = indexer.index_project(dir.path(), false, None).await.unwrap();
        assert_eq!(first.indexed, 2);
        assert_eq!(first.added, 2);
        assert_eq!(first.failed, 0);
        // app.py is walked before lib.py and still links to helper.
        assert_eq!(
            db.lock().await.entity_counts(first.project_id).unwrap().cross_references,
            1
        );

        let second = indexer.index_project(dir.path(), false, None).await.unwrap();
        assert_eq!(second.skipped, 2);
        assert_eq!(second.indexed, 0);

        let forced = indexer.index_project(dir.path(), true, None).await.unwrap();
        assert_eq!(forced.updated, 2);

        let guard = db.lock().await;
        let counts = guard.entity_counts(first.project_id).unwrap();
        assert_eq!(counts.files, 2);
        assert_eq!(counts.functions, 2);
        assert_eq!(counts.cross_references, 1);
        assert!(counts.chunks >= 2);
        // ast + cst + analysis per file, refreshed in place
        assert_eq!(counts.snapshots, 6);
    }

    #[tokio::test]
    async fn test_edited_callee_keeps_caller_edge() {
        let dir = tempfile::tempdir().unwrap();
        let root = canonical_root(dir.path());
        let lib = root.join("lib.py");
        std::fs::write(&lib, "def helper():\n    return 1\n").unwrap();
        std::fs::write(root.join("app.py"), "def main():\n    return helper()\n").unwrap();

        let db = Db::open_in_memory().unwrap().into_shared();
        let indexer = indexer(db.clone());
        let pid = indexer.index_project(&root, false, None).await.unwrap().project_id;

        std::fs::write(&lib, "# shifted\ndef helper():\n    return 1\n").unwrap();
        indexer.index_file(pid, &lib, true).await.unwrap();

        let guard = db.lock().await;
        let app = guard
            .find_file_by_path(pid, &normalize_path(root.join("app.py")))
            .unwrap()
            .unwrap();
        let main = guard.functions_for_file(app.id).unwrap()[0].id;
        let deps = guard.get_dependencies_by_caller(EntityType::Function, main).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].target.name, "helper");
        assert_eq!(deps[0].target.line, 2);
    }

    #[tokio::test]
    async fn test_cancelled_pass_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let db = Db::open_in_memory().unwrap().into_shared();
        let token = CancellationToken::new();
        token.cancel();

        let result = indexer(db)
            .index_project(dir.path(), false, Some(&token))
            .await
            .unwrap();
        assert!(result.cancelled);
        assert_eq!(result.indexed, 0);
    }

    #[tokio::test]
    async fn test_excluded_dirs_and_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("versions");
        std::fs::create_dir_all(&archive).unwrap();
        std::fs::write(archive.join("old.py"), "x = 1\n").unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();

        let db = Db::open_in_memory().unwrap().into_shared();
        let indexer = indexer(db).exclude_dir(&archive);
        let files = indexer.collect_files(dir.path());
        assert_eq!(files, vec![dir.path().join("a.py")]);

        let result = indexer
            .index_paths(1, &[dir.path().join("gone.py")])
            .await;
        assert_eq!(result.indexed + result.failed + result.skipped, 0);
    }
}
