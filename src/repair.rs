//! Reconciles file rows against the live project tree and the archive tree.
//!
//! For each row the expected state is derived from where the file actually is:
//! present in the project tree means active, present in the archive means deleted,
//! absent from both means it is rebuilt from its verbatim source snapshot or
//! reported as unresolved.
use crate::db::SharedDb;
use crate::db::models::{CycleDelta, FileRecord, SnapshotKind, WorkerKind};
use crate::error::{ItemError, Result, StoreError};
use crate::indexer::content_hash;
use crate::lifecycle::LifecycleManager;
use crate::paths::{archive_path, is_within, normalize_path};
use crate::workers::{SuspendReport, WorkerController, suspend_workers};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RepairCounts {
    pub checked: usize,
    pub consistent: usize,
    pub restored_in_project: usize,
    pub marked_deleted: usize,
    pub restored_from_snapshot: usize,
    pub unresolved: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnresolvedItem {
    pub file_id: i64,
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub project_id: i64,
    pub dry_run: bool,
    pub cycle_id: Option<String>,
    pub counts: RepairCounts,
    pub errors: Vec<ItemError>,
    pub unresolved: Vec<UnresolvedItem>,
    pub suspend: Option<SuspendReport>,
}

/// What a single row needs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Consistent,
    /// Live in the project tree but marked deleted.
    ActivateInPlace(String),
    /// Found in the archive but marked active, or archived somewhere else.
    MarkDeleted { archived: String },
    Reconstruct { payload: String, target: String },
    Unresolved(String),
}

pub struct RepairCoordinator {
    db: SharedDb,
    lifecycle: LifecycleManager,
    controller: Option<Arc<dyn WorkerController>>,
    stop_timeout: Duration,
}

impl RepairCoordinator {
    pub fn new(db: SharedDb, lifecycle: LifecycleManager, stop_timeout: Duration) -> Self {
        Self {
            db,
            lifecycle,
            controller: None,
            stop_timeout,
        }
    }

    /// Workers to pause while a repair pass mutates the store.
    pub fn with_controller(mut self, controller: Arc<dyn WorkerController>) -> Self {
        self.controller = Some(controller);
        self
    }

    /// One pass over every file row of a project. Item failures are collected and the
    /// pass continues. A dry run reports what would change without touching anything.
    pub async fn run_cycle(&self, project_id: i64, dry_run: bool) -> Result<RepairReport> {
        let (project_root, files) = {
            let db = self.db.lock().await;
            let project = db.get_project(project_id)?;
            (PathBuf::from(project.root_path), db.list_files(project_id, true)?)
        };
        let version_dir = self.lifecycle.version_dir(project_id);

        let mut report = RepairReport {
            project_id,
            dry_run,
            cycle_id: None,
            counts: RepairCounts::default(),
            errors: Vec::new(),
            unresolved: Vec::new(),
            suspend: None,
        };

        if !dry_run {
            if let Some(controller) = &self.controller {
                report.suspend = Some(suspend_workers(controller.as_ref(), self.stop_timeout).await);
            }
        }

        // Stopped workers come back whether or not the pass itself succeeds.
        let outcome = self
            .reconcile(&mut report, &files, &project_root, &version_dir)
            .await;
        if let (Some(controller), Some(suspend)) = (&self.controller, &report.suspend) {
            for name in suspend.stopped() {
                controller.resume(name);
            }
        }
        outcome?;

        let c = report.counts;
        info!(
            project_id,
            dry_run,
            checked = c.checked,
            restored_in_project = c.restored_in_project,
            marked_deleted = c.marked_deleted,
            restored_from_snapshot = c.restored_from_snapshot,
            unresolved = c.unresolved,
            errors = report.errors.len(),
            "Repair pass finished"
        );
        Ok(report)
    }

    /// Walks the rows inside a worker cycle. Only a failure to open the cycle aborts.
    async fn reconcile(
        &self,
        report: &mut RepairReport,
        files: &[FileRecord],
        project_root: &Path,
        version_dir: &Path,
    ) -> Result<()> {
        let dry_run = report.dry_run;
        if !dry_run {
            let mut db = self.db.lock().await;
            report.cycle_id = Some(db.start_cycle(WorkerKind::Repair, files.len() as i64)?);
        }

        for file in files {
            let started = Instant::now();
            report.counts.checked += 1;
            let outcome = self.repair_one(file, project_root, version_dir, dry_run).await;

            let mut delta = CycleDelta {
                processing_time: started.elapsed().as_secs_f64(),
                ..Default::default()
            };
            match outcome {
                Ok(Verdict::Consistent) => {
                    report.counts.consistent += 1;
                    delta.skipped = 1;
                }
                Ok(Verdict::ActivateInPlace(_)) => {
                    report.counts.restored_in_project += 1;
                    delta.processed = 1;
                }
                Ok(Verdict::MarkDeleted { .. }) => {
                    report.counts.marked_deleted += 1;
                    delta.processed = 1;
                }
                Ok(Verdict::Reconstruct { .. }) => {
                    report.counts.restored_from_snapshot += 1;
                    delta.processed = 1;
                }
                Ok(Verdict::Unresolved(reason)) => {
                    warn!(file_id = file.id, "Unresolved during repair: {reason}");
                    report.counts.unresolved += 1;
                    report.unresolved.push(UnresolvedItem {
                        file_id: file.id,
                        path: file.check_path().to_string(),
                        reason,
                    });
                    delta.skipped = 1;
                }
                Err(e) => {
                    warn!(file_id = file.id, "Repair failed for {}: {e}", file.path);
                    report
                        .errors
                        .push(ItemError::new(Some(file.id), Some(&file.path), &e));
                    delta.failed = 1;
                }
            }
            if let Some(cycle_id) = &report.cycle_id {
                if let Err(e) = self.db.lock().await.update_cycle(cycle_id, delta) {
                    warn!(file_id = file.id, "Failed to record repair progress: {e}");
                    report
                        .errors
                        .push(ItemError::new(Some(file.id), Some(&file.path), &e));
                }
            }
        }

        if let Some(cycle_id) = &report.cycle_id {
            if let Err(e) = self.db.lock().await.end_cycle(cycle_id) {
                warn!("Failed to close repair cycle {cycle_id}: {e}");
                report.errors.push(ItemError::new(None, None, &e));
            }
        }
        Ok(())
    }

    /// Classifies one row and, unless `dry_run`, applies the fix while holding the store.
    async fn repair_one(
        &self,
        file: &FileRecord,
        project_root: &Path,
        version_dir: &Path,
        dry_run: bool,
    ) -> Result<Verdict> {
        let mut db = self.db.lock().await;
        // Re-read under the lock; another worker may have changed the row.
        let file = db.get_file(file.id)?;
        let verdict = classify(&file, project_root, version_dir, || {
            db.latest_snapshot(file.id, SnapshotKind::Cst)
        })?;
        debug!(file_id = file.id, ?verdict, "Repair verdict");
        if dry_run {
            return Ok(verdict);
        }

        match &verdict {
            Verdict::Consistent | Verdict::Unresolved(_) => {}
            Verdict::ActivateInPlace(live) => db.set_active_state(file.id, live)?,
            Verdict::MarkDeleted { archived } => db.set_deleted_state(
                file.id,
                archived,
                file.check_path(),
                &version_dir.to_string_lossy(),
            )?,
            Verdict::Reconstruct { payload, target } => {
                let target_path = Path::new(target);
                if let Some(parent) = target_path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
                }
                std::fs::write(target_path, payload).map_err(|e| StoreError::io(target_path, e))?;
                if let Err(e) = db.set_active_state(file.id, target) {
                    if let Err(undo) = std::fs::remove_file(target_path) {
                        warn!("Failed to remove {target} after error: {undo}");
                    }
                    return Err(e);
                }
                info!(file_id = file.id, "Reconstructed {target} from snapshot");
            }
        }
        Ok(verdict)
    }
}

fn classify<F>(
    file: &FileRecord,
    project_root: &Path,
    version_dir: &Path,
    cst_snapshot: F,
) -> Result<Verdict>
where
    F: FnOnce() -> Result<Option<crate::db::models::TreeSnapshot>>,
{
    let check_path = file.check_path();

    // 1. Live in the project tree.
    let mut candidates = vec![check_path];
    if file.path != check_path {
        candidates.push(&file.path);
    }
    let live = candidates.into_iter().find(|p| {
        let path = Path::new(p);
        is_within(project_root, path) && !is_within(version_dir, path) && path.is_file()
    });
    if let Some(live) = live {
        return Ok(if file.deleted || live != file.path {
            Verdict::ActivateInPlace(live.to_string())
        } else {
            Verdict::Consistent
        });
    }

    // 2. In the archive tree.
    if let Some(archived) = find_in_archive(file, project_root, version_dir) {
        return Ok(if file.deleted && archived == file.path {
            Verdict::Consistent
        } else {
            Verdict::MarkDeleted { archived }
        });
    }

    // 3. Absent from both.
    match cst_snapshot()? {
        Some(snapshot) if content_hash(&snapshot.payload) == snapshot.content_hash => {
            Ok(Verdict::Reconstruct {
                payload: snapshot.payload,
                target: check_path.to_string(),
            })
        }
        Some(_) => Ok(Verdict::Unresolved(
            "source snapshot does not match its content hash".into(),
        )),
        None => Ok(Verdict::Unresolved(
            "file is missing from the project and the archive, and no source snapshot exists".into(),
        )),
    }
}

/// Exact archive location first, then the first file with the same name in a sorted walk.
fn find_in_archive(file: &FileRecord, project_root: &Path, version_dir: &Path) -> Option<String> {
    let exact = if file.deleted && is_within(version_dir, Path::new(&file.path)) {
        PathBuf::from(&file.path)
    } else {
        archive_path(version_dir, project_root, Path::new(file.check_path()))
    };
    if exact.is_file() {
        return Some(normalize_path(&exact));
    }

    let name = Path::new(file.check_path()).file_name()?;
    if !version_dir.is_dir() {
        return None;
    }
    let mut matches: Vec<PathBuf> = ignore::WalkBuilder::new(version_dir)
        .standard_filters(false)
        .build()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_some_and(|t| t.is_file()))
        .map(|e| e.into_path())
        .filter(|p| p.file_name() == Some(name))
        .collect();
    matches.sort();
    matches.first().map(normalize_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::workers::Supervisor;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        versions: PathBuf,
        db: SharedDb,
        project_id: i64,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("proj");
        let versions = dir.path().join("versions");
        std::fs::create_dir_all(&root).unwrap();
        let mut db = Db::open_in_memory().unwrap();
        let project_id = db
            .get_or_create_project(&root.to_string_lossy(), None)
            .unwrap();
        Fixture {
            _dir: dir,
            root,
            versions,
            db: db.into_shared(),
            project_id,
        }
    }

    fn coordinator(f: &Fixture) -> RepairCoordinator {
        RepairCoordinator::new(
            f.db.clone(),
            LifecycleManager::new(&f.versions),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_missing_live_file_found_in_archive_is_marked_deleted() {
        let f = fixture().await;
        let live = f.root.join("a.py");
        let fid = f
            .db
            .lock()
            .await
            .add_file(&live.to_string_lossy(), 1, 1.0, false, f.project_id)
            .unwrap();
        let archived = f.versions.join(f.project_id.to_string()).join("a.py");
        std::fs::create_dir_all(archived.parent().unwrap()).unwrap();
        std::fs::write(&archived, "x = 1\n").unwrap();

        let dry = coordinator(&f).run_cycle(f.project_id, true).await.unwrap();
        assert_eq!(dry.counts.marked_deleted, 1);
        assert!(dry.cycle_id.is_none());
        assert!(!f.db.lock().await.get_file(fid).unwrap().deleted);

        let report = coordinator(&f).run_cycle(f.project_id, false).await.unwrap();
        assert_eq!(report.counts.marked_deleted, 1);
        assert!(report.errors.is_empty());

        let db = f.db.lock().await;
        let row = db.get_file(fid).unwrap();
        assert!(row.deleted);
        assert_eq!(row.path, normalize_path(&archived));
        assert_eq!(row.original_path.as_deref(), Some(normalize_path(&live).as_str()));
        assert_eq!(
            row.version_dir.as_deref(),
            Some(normalize_path(f.versions.join(f.project_id.to_string())).as_str())
        );
        let cycle = db.get_cycle(report.cycle_id.as_deref().unwrap()).unwrap();
        assert!(!cycle.is_open());
        assert_eq!(cycle.files_processed, 1);
    }

    #[tokio::test]
    async fn test_deleted_row_with_live_file_is_activated_in_place() {
        let f = fixture().await;
        let live = f.root.join("pkg").join("b.py");
        std::fs::create_dir_all(live.parent().unwrap()).unwrap();
        std::fs::write(&live, "y = 2\n").unwrap();
        let fid = {
            let mut db = f.db.lock().await;
            let fid = db.add_file(&live.to_string_lossy(), 1, 1.0, false, f.project_id).unwrap();
            db.set_deleted_state(fid, "/gone/b.py", &live.to_string_lossy(), "/gone").unwrap();
            fid
        };

        let report = coordinator(&f).run_cycle(f.project_id, false).await.unwrap();
        assert_eq!(report.counts.restored_in_project, 1);
        let row = f.db.lock().await.get_file(fid).unwrap();
        assert!(!row.deleted);
        assert_eq!(row.path, normalize_path(&live));
        assert!(row.original_path.is_none());
    }

    #[tokio::test]
    async fn test_reconstruct_from_source_snapshot_or_report_unresolved() {
        let f = fixture().await;
        let source = "def c():\n    return 3\n";
        let rebuilt = f.root.join("c.py");
        let orphan = f.root.join("d.py");
        let (c_id, d_id) = {
            let mut db = f.db.lock().await;
            let c_id = db.add_file(&rebuilt.to_string_lossy(), 2, 1.0, false, f.project_id).unwrap();
            db.save_tree(c_id, f.project_id, SnapshotKind::Cst, source, &content_hash(source), 1.0, false)
                .unwrap();
            let d_id = db.add_file(&orphan.to_string_lossy(), 2, 1.0, false, f.project_id).unwrap();
            db.save_tree(d_id, f.project_id, SnapshotKind::Ast, "{}", "h", 1.0, false)
                .unwrap();
            (c_id, d_id)
        };

        let report = coordinator(&f).run_cycle(f.project_id, false).await.unwrap();
        assert_eq!(report.counts.restored_from_snapshot, 1);
        assert_eq!(report.counts.unresolved, 1);
        assert_eq!(report.unresolved[0].file_id, d_id);
        assert_eq!(std::fs::read_to_string(&rebuilt).unwrap(), source);
        assert!(!orphan.exists());
        assert!(!f.db.lock().await.get_file(c_id).unwrap().deleted);
    }

    #[tokio::test]
    async fn test_archive_filename_fallback() {
        let f = fixture().await;
        let live = f.root.join("moved.py");
        let fid = f
            .db
            .lock()
            .await
            .add_file(&live.to_string_lossy(), 1, 1.0, false, f.project_id)
            .unwrap();
        let archived = f
            .versions
            .join(f.project_id.to_string())
            .join("old")
            .join("moved.py");
        std::fs::create_dir_all(archived.parent().unwrap()).unwrap();
        std::fs::write(&archived, "z = 3\n").unwrap();

        coordinator(&f).run_cycle(f.project_id, false).await.unwrap();
        let row = f.db.lock().await.get_file(fid).unwrap();
        assert!(row.deleted);
        assert_eq!(row.path, normalize_path(&archived));
    }

    #[tokio::test]
    async fn test_workers_are_suspended_and_resumed() {
        let f = fixture().await;
        let supervisor = Arc::new(Supervisor::new());
        supervisor.spawn(
            "vectorizer",
            Arc::new(|token: CancellationToken| tokio::spawn(async move { token.cancelled().await })),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = coordinator(&f)
            .with_controller(supervisor.clone())
            .run_cycle(f.project_id, false)
            .await
            .unwrap();
        let suspend = report.suspend.unwrap();
        assert_eq!(suspend.stopped_gracefully, vec!["vectorizer".to_string()]);
        assert!(supervisor.is_running("vectorizer"));
        supervisor.shutdown(Duration::from_millis(100)).await;
    }

    #[derive(Default)]
    struct RecordingController {
        resumed: std::sync::Mutex<Vec<String>>,
    }

    impl WorkerController for RecordingController {
        fn workers(&self) -> Vec<String> {
            vec!["indexer".to_string()]
        }
        fn is_running(&self, _name: &str) -> bool {
            false
        }
        fn signal_stop(&self, _name: &str) -> bool {
            true
        }
        fn force_stop(&self, _name: &str) -> bool {
            true
        }
        fn resume(&self, name: &str) -> bool {
            self.resumed.lock().unwrap().push(name.to_string());
            true
        }
    }

    #[tokio::test]
    async fn test_workers_resume_when_cycle_cannot_start() {
        let f = fixture().await;
        f.db.lock()
            .await
            .conn
            .execute_batch(
                "CREATE TEMP TRIGGER refuse_cycles BEFORE INSERT ON worker_cycles
                 BEGIN SELECT RAISE(ABORT, 'cycle refused'); END;",
            )
            .unwrap();
        let controller = Arc::new(RecordingController::default());

        let result = coordinator(&f)
            .with_controller(controller.clone())
            .run_cycle(f.project_id, false)
            .await;
        assert!(result.is_err());
        assert_eq!(*controller.resumed.lock().unwrap(), vec!["indexer".to_string()]);
    }

    #[tokio::test]
    async fn test_progress_write_failure_is_reported_and_cycle_closes() {
        let f = fixture().await;
        let live = f.root.join("a.py");
        std::fs::write(&live, "x = 1\n").unwrap();
        {
            let mut db = f.db.lock().await;
            db.add_file(&live.to_string_lossy(), 1, 1.0, false, f.project_id).unwrap();
            db.conn
                .execute_batch(
                    "CREATE TEMP TRIGGER refuse_progress BEFORE UPDATE OF files_processed ON worker_cycles
                     BEGIN SELECT RAISE(ABORT, 'progress refused'); END;",
                )
                .unwrap();
        }
        let controller = Arc::new(RecordingController::default());

        let report = coordinator(&f)
            .with_controller(controller.clone())
            .run_cycle(f.project_id, false)
            .await
            .unwrap();
        assert_eq!(report.counts.consistent, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(controller.resumed.lock().unwrap().len(), 1);
        let db = f.db.lock().await;
        assert!(!db.get_cycle(report.cycle_id.as_deref().unwrap()).unwrap().is_open());
    }

    #[tokio::test]
    async fn test_unknown_project_is_not_found() {
        let f = fixture().await;
        let err = coordinator(&f).run_cycle(999, true).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NotFound);
    }
}
