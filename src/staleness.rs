//! Decides whether a stored snapshot still reflects the file on disk.
use crate::db::Db;
use crate::db::models::SnapshotKind;
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct StalenessOracle {
    analysis_tolerance: f64,
}

impl Default for StalenessOracle {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl StalenessOracle {
    pub fn new(analysis_tolerance_secs: f64) -> Self {
        Self {
            analysis_tolerance: analysis_tolerance_secs.max(0.0),
        }
    }

    /// True when no snapshot of `kind` exists or `current_mtime` is newer than the stored one.
    ///
    /// Analysis snapshots treat mtimes within the tolerance band as equal. Read-only.
    pub fn is_outdated(
        &self,
        db: &Db,
        file_id: i64,
        current_mtime: f64,
        kind: SnapshotKind,
    ) -> Result<bool> {
        Ok(match db.snapshot_mtime(file_id, kind)? {
            None => true,
            Some(stored) => self.exceeds(kind, current_mtime, stored),
        })
    }

    pub fn exceeds(&self, kind: SnapshotKind, current_mtime: f64, stored_mtime: f64) -> bool {
        match kind {
            SnapshotKind::Analysis => current_mtime - stored_mtime > self.analysis_tolerance,
            SnapshotKind::Ast | SnapshotKind::Cst => current_mtime > stored_mtime,
        }
    }
}
