//! Soft-delete, restore, hard-delete and version collapse for file rows.
use crate::db::Db;
use crate::db::models::FileRecord;
use crate::error::{ItemError, Result, StoreError};
use crate::paths::{archive_path, move_file, normalize_path};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    SoftDeleted,
    Restored,
    HardDeleted,
    /// The row already had the requested state.
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleReport {
    pub file_id: i64,
    pub action: LifecycleAction,
    pub dry_run: bool,
    pub from_path: String,
    pub to_path: Option<String>,
    /// False when only the row was corrected because the file was already in place.
    pub moved: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollapseReport {
    pub project_id: i64,
    pub dry_run: bool,
    pub kept: usize,
    pub deleted: usize,
    pub kept_ids: Vec<i64>,
    pub deleted_ids: Vec<i64>,
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Clone)]
pub struct LifecycleManager {
    version_root: PathBuf,
}

impl LifecycleManager {
    pub fn new(version_root: impl Into<PathBuf>) -> Self {
        Self {
            version_root: version_root.into(),
        }
    }

    pub fn version_root(&self) -> &Path {
        &self.version_root
    }

    /// Archive tree of a project: `<version_root>/<project_id>`.
    pub fn version_dir(&self, project_id: i64) -> PathBuf {
        self.version_root.join(project_id.to_string())
    }

    /// Moves an active file into the archive tree and marks its row deleted.
    pub fn soft_delete(
        &self,
        db: &mut Db,
        file_id: i64,
        version_dir: Option<&Path>,
        dry_run: bool,
    ) -> Result<LifecycleReport> {
        let file = db.get_file(file_id)?;
        if file.deleted {
            return Ok(unchanged(&file, dry_run));
        }

        let project = db.get_project(file.project_id)?;
        let version_dir = version_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.version_dir(file.project_id));
        let live = PathBuf::from(&file.path);
        let archived = archive_path(&version_dir, Path::new(&project.root_path), &live);

        let report = LifecycleReport {
            file_id,
            action: LifecycleAction::SoftDeleted,
            dry_run,
            from_path: file.path.clone(),
            to_path: Some(normalize_path(&archived)),
            moved: live.exists(),
        };
        if dry_run {
            return Ok(report);
        }

        if live.exists() {
            if archived.exists() {
                warn!("Replacing existing archive copy {}", archived.display());
            }
            move_file(&live, &archived).map_err(|e| StoreError::io(&live, e))?;
        } else if !archived.exists() {
            return Err(StoreError::io(
                &live,
                std::io::Error::new(std::io::ErrorKind::NotFound, "file is neither live nor archived"),
            ));
        }

        if let Err(e) = db.set_deleted_state(
            file_id,
            &archived.to_string_lossy(),
            &file.path,
            &version_dir.to_string_lossy(),
        ) {
            if report.moved {
                if let Err(undo) = move_file(&archived, &live) {
                    warn!("Failed to move {} back after error: {undo}", live.display());
                }
            }
            return Err(e);
        }

        info!(file_id, "Soft-deleted {} -> {}", file.path, archived.display());
        Ok(report)
    }

    /// Moves an archived file back to its original location and marks the row active.
    pub fn restore(&self, db: &mut Db, file_id: i64, dry_run: bool) -> Result<LifecycleReport> {
        let file = db.get_file(file_id)?;
        if !file.deleted {
            return Ok(unchanged(&file, dry_run));
        }
        let original = file.original_path.clone().ok_or_else(|| {
            StoreError::StaleState(format!("file {file_id} is deleted but has no original path"))
        })?;

        let archived = PathBuf::from(&file.path);
        let target = PathBuf::from(&original);
        if target.exists() && archived.exists() {
            return Err(StoreError::Conflict(format!(
                "restore target {original} already exists"
            )));
        }

        let report = LifecycleReport {
            file_id,
            action: LifecycleAction::Restored,
            dry_run,
            from_path: file.path.clone(),
            to_path: Some(original.clone()),
            moved: archived.exists(),
        };
        if dry_run {
            return Ok(report);
        }

        if archived.exists() {
            move_file(&archived, &target).map_err(|e| StoreError::io(&archived, e))?;
        } else if !target.exists() {
            return Err(StoreError::io(
                &archived,
                std::io::Error::new(std::io::ErrorKind::NotFound, "archived copy is missing"),
            ));
        }

        if let Err(e) = db.set_active_state(file_id, &original) {
            if report.moved {
                if let Err(undo) = move_file(&target, &archived) {
                    warn!("Failed to move {} back after error: {undo}", archived.display());
                }
            }
            return Err(e);
        }

        info!(file_id, "Restored {} -> {original}", file.path);
        Ok(report)
    }

    pub fn hard_delete(&self, db: &mut Db, file_id: i64, dry_run: bool) -> Result<LifecycleReport> {
        let file = db.get_file(file_id)?;
        let mut report = LifecycleReport {
            file_id,
            action: LifecycleAction::HardDeleted,
            dry_run,
            from_path: file.path.clone(),
            to_path: None,
            moved: false,
        };
        if dry_run {
            return Ok(report);
        }
        let outcome = db.hard_delete_file(file_id)?;
        report.moved = outcome.archived_copy_removed;
        info!(file_id, "Hard-deleted {}", file.path);
        Ok(report)
    }

    /// Keeps one row per path and hard-deletes the other versions.
    ///
    /// `keep_latest` keeps the greatest `last_modified`, otherwise the smallest; ties go
    /// to the larger id. Failures are collected per row.
    pub fn collapse_versions(
        &self,
        db: &mut Db,
        project_id: i64,
        keep_latest: bool,
        dry_run: bool,
    ) -> Result<CollapseReport> {
        db.get_project(project_id)?;

        let mut groups: BTreeMap<String, Vec<FileRecord>> = BTreeMap::new();
        for file in db.list_files(project_id, true)? {
            groups.entry(file.path.clone()).or_default().push(file);
        }

        let mut report = CollapseReport {
            project_id,
            dry_run,
            ..Default::default()
        };

        for (path, mut versions) in groups {
            if versions.len() < 2 {
                continue;
            }
            versions.sort_by(|a, b| {
                let by_time = a.last_modified.total_cmp(&b.last_modified);
                let by_time = if keep_latest { by_time } else { by_time.reverse() };
                by_time.then(a.id.cmp(&b.id))
            });
            let Some(keeper) = versions.pop() else {
                continue;
            };
            report.kept += 1;
            report.kept_ids.push(keeper.id);

            for stale in versions {
                if dry_run {
                    report.deleted += 1;
                    report.deleted_ids.push(stale.id);
                    continue;
                }
                match db.hard_delete_file(stale.id) {
                    Ok(_) => {
                        report.deleted += 1;
                        report.deleted_ids.push(stale.id);
                    }
                    Err(e) => {
                        warn!("Failed to collapse version {} of {path}: {e}", stale.id);
                        report.errors.push(ItemError::new(Some(stale.id), Some(&path), &e));
                    }
                }
            }
        }

        info!(
            project_id,
            kept = report.kept,
            deleted = report.deleted,
            dry_run,
            "Collapsed file versions"
        );
        Ok(report)
    }
}

fn unchanged(file: &FileRecord, dry_run: bool) -> LifecycleReport {
    LifecycleReport {
        file_id: file.id,
        action: LifecycleAction::Unchanged,
        dry_run,
        from_path: file.path.clone(),
        to_path: None,
        moved: false,
    }
}
