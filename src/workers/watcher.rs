//! Keeps a project's index current from change notifications and periodic scans.
//!
//! Deleted files are not touched here; the repair pass decides what happened to them.
use crate::db::models::{CycleDelta, WorkerKind};
use crate::error::Result;
use crate::indexer::{CodeSyncResult, Indexer};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// notify watcher bridged onto a tokio channel.
struct ChangeStream {
    // Keep watcher alive
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

impl ChangeStream {
    fn new(root: &Path) -> notify::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }
}

async fn next_event(stream: &mut Option<ChangeStream>) -> Option<notify::Result<Event>> {
    match stream {
        Some(stream) => stream.rx.recv().await,
        None => std::future::pending().await,
    }
}

pub struct FileWatcher {
    indexer: Arc<Indexer>,
    project_id: i64,
    root: PathBuf,
    scan_interval: Duration,
}

impl FileWatcher {
    pub fn new(indexer: Arc<Indexer>, project_id: i64, root: impl Into<PathBuf>, scan_interval: Duration) -> Self {
        Self {
            indexer,
            project_id,
            root: root.into(),
            scan_interval,
        }
    }

    /// Full pass over the project tree, recorded as one `file_watcher` cycle.
    pub async fn scan(&self, cancel: &CancellationToken) -> Result<CodeSyncResult> {
        let cycle_id = self.open_cycle().await?;
        let result = self.indexer.index_project(&self.root, false, Some(cancel)).await;
        self.close_cycle(&cycle_id, result.as_ref().ok()).await?;
        result
    }

    /// Re-indexes the given changed paths, recorded as one `file_watcher` cycle.
    pub async fn apply_changes(&self, paths: &[PathBuf]) -> Result<CodeSyncResult> {
        let cycle_id = self.open_cycle().await?;
        let result = self.indexer.index_paths(self.project_id, paths).await;
        self.close_cycle(&cycle_id, Some(&result)).await?;
        Ok(result)
    }

    async fn open_cycle(&self) -> Result<String> {
        let mut db = self.indexer.db().lock().await;
        let known = db.list_files(self.project_id, false)?.len() as i64;
        db.start_cycle(WorkerKind::FileWatcher, known)
    }

    async fn close_cycle(&self, cycle_id: &str, result: Option<&CodeSyncResult>) -> Result<()> {
        let mut db = self.indexer.db().lock().await;
        if let Some(result) = result {
            db.update_cycle(
                cycle_id,
                CycleDelta {
                    processed: result.indexed as i64,
                    failed: result.failed as i64,
                    skipped: result.skipped as i64,
                    processing_time: result.elapsed_secs,
                },
            )?;
        }
        db.end_cycle(cycle_id)
    }

    /// Event loop; exits when `cancel` fires. Runs a scan immediately and then every
    /// `scan_interval`. Without a working notify backend only the scans run.
    pub async fn run(self, cancel: CancellationToken) {
        let mut events = match ChangeStream::new(&self.root) {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("File notifications unavailable for {}: {e}", self.root.display());
                None
            }
        };
        info!(project_id = self.project_id, "Started watching {}", self.root.display());

        let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
        let mut ticker = tokio::time::interval(self.scan_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.scan(&cancel).await {
                        Ok(result) => debug!(indexed = result.indexed, skipped = result.skipped, "Periodic scan done"),
                        Err(e) => error!("Periodic scan failed: {e}"),
                    }
                }
                event = next_event(&mut events) => match event {
                    Some(Ok(event)) => pending.extend(event.paths),
                    Some(Err(e)) => warn!("Watch error: {e}"),
                    None => events = None,
                },
                _ = tokio::time::sleep(DEBOUNCE), if !pending.is_empty() => {
                    let paths: Vec<PathBuf> = std::mem::take(&mut pending).into_iter().collect();
                    info!("Detected changes in {} paths. Updating...", paths.len());
                    if let Err(e) = self.apply_changes(&paths).await {
                        error!("Failed to update changed files: {e}");
                    }
                }
            }
        }
        info!("File watcher task ended for {}", self.root.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config as AppConfig;
    use crate::db::Db;
    use crate::parser::python::PythonParser;
    use crate::staleness::StalenessOracle;

    async fn watcher(root: &Path) -> (FileWatcher, Arc<Indexer>) {
        let db = Db::open_in_memory().unwrap().into_shared();
        let project_id = db
            .lock()
            .await
            .get_or_create_project(&root.to_string_lossy(), None)
            .unwrap();
        let indexer = Arc::new(Indexer::new(
            db,
            Arc::new(PythonParser::default()),
            StalenessOracle::default(),
            AppConfig::default().ignore_set().unwrap(),
            512,
        ));
        let watcher = FileWatcher::new(indexer.clone(), project_id, root, Duration::from_secs(60));
        (watcher, indexer)
    }

    #[tokio::test]
    async fn test_scan_and_changes_are_tracked_as_cycles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "def a():\n    pass\n").unwrap();
        let (watcher, indexer) = watcher(dir.path()).await;

        let scan = watcher.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(scan.indexed, 1);

        let new_file = dir.path().join("b.py");
        std::fs::write(&new_file, "def b():\n    pass\n").unwrap();
        let changes = watcher
            .apply_changes(&[new_file, dir.path().join("removed.py")])
            .await
            .unwrap();
        assert_eq!(changes.indexed, 1);

        let db = indexer.db().lock().await;
        assert_eq!(db.open_cycle_count(WorkerKind::FileWatcher).unwrap(), 0);
        let last = db.get_current(WorkerKind::FileWatcher).unwrap().unwrap();
        assert_eq!(last.files_processed, 1);
        assert_eq!(last.files_total_at_start, 1);
    }

    #[tokio::test]
    async fn test_run_exits_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, _) = watcher(dir.path()).await;
        let token = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
