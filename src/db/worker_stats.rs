use super::models::{CycleDelta, WorkerCycle, WorkerKind};
use super::{Db, now};
use crate::error::{Result, StoreError};
use rusqlite::{OptionalExtension, Row, params};
use tracing::warn;
use uuid::Uuid;

const CYCLE_COLUMNS: &str = "cycle_id, worker_kind, start_time, end_time, files_total_at_start, \
     files_processed, files_failed, files_skipped, total_processing_time, average_processing_time, last_updated";

fn map_cycle(row: &Row<'_>) -> rusqlite::Result<WorkerCycle> {
    Ok(WorkerCycle {
        cycle_id: row.get(0)?,
        worker_kind: row.get(1)?,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        files_total_at_start: row.get(4)?,
        files_processed: row.get(5)?,
        files_failed: row.get(6)?,
        files_skipped: row.get(7)?,
        total_processing_time: row.get(8)?,
        average_processing_time: row.get(9)?,
        last_updated: row.get(10)?,
    })
}

impl Db {
    /// Opens a new cycle for `kind`, closing any cycle of that kind left open.
    pub fn start_cycle(&mut self, kind: WorkerKind, files_total_at_start: i64) -> Result<String> {
        let tx = self.immediate()?;
        let ts = now();

        let closed = tx.execute(
            "UPDATE worker_cycles SET end_time = ?1, last_updated = ?1
             WHERE worker_kind = ?2 AND end_time IS NULL",
            params![ts, kind],
        )?;
        if closed > 0 {
            warn!(worker = %kind, closed, "Force-closed cycles left open by a previous run");
        }

        let cycle_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO worker_cycles (cycle_id, worker_kind, start_time, files_total_at_start, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?3)",
            params![cycle_id, kind, ts, files_total_at_start],
        )?;
        tx.commit()?;
        Ok(cycle_id)
    }

    /// Adds `delta` to the cycle counters and recomputes the average processing time.
    pub fn update_cycle(&mut self, cycle_id: &str, delta: CycleDelta) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE worker_cycles SET
                files_processed = files_processed + ?1,
                files_failed = files_failed + ?2,
                files_skipped = files_skipped + ?3,
                total_processing_time = total_processing_time + ?4,
                average_processing_time = CASE
                    WHEN files_processed + ?1 + files_failed + ?2 > 0
                    THEN (total_processing_time + ?4) / (files_processed + ?1 + files_failed + ?2)
                    ELSE NULL
                END,
                last_updated = ?5
             WHERE cycle_id = ?6",
            params![
                delta.processed,
                delta.failed,
                delta.skipped,
                delta.processing_time,
                now(),
                cycle_id
            ],
        )?;
        if rows == 0 {
            return Err(StoreError::not_found("worker cycle", cycle_id));
        }
        Ok(())
    }

    /// Stamps the end time. Ending an already-closed cycle keeps its original end time.
    pub fn end_cycle(&mut self, cycle_id: &str) -> Result<()> {
        let ts = now();
        let rows = self.conn.execute(
            "UPDATE worker_cycles SET end_time = COALESCE(end_time, ?1), last_updated = ?1
             WHERE cycle_id = ?2",
            params![ts, cycle_id],
        )?;
        if rows == 0 {
            return Err(StoreError::not_found("worker cycle", cycle_id));
        }
        Ok(())
    }

    /// The open cycle for `kind`, else the most recent closed one.
    pub fn get_current(&self, kind: WorkerKind) -> Result<Option<WorkerCycle>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {CYCLE_COLUMNS} FROM worker_cycles WHERE worker_kind = ?1
                     ORDER BY (end_time IS NULL) DESC, start_time DESC, rowid DESC LIMIT 1"
                ),
                params![kind],
                map_cycle,
            )
            .optional()?)
    }

    pub fn get_cycle(&self, cycle_id: &str) -> Result<WorkerCycle> {
        self.conn
            .query_row(
                &format!("SELECT {CYCLE_COLUMNS} FROM worker_cycles WHERE cycle_id = ?1"),
                params![cycle_id],
                map_cycle,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("worker cycle", cycle_id))
    }

    pub fn open_cycle_count(&self, kind: WorkerKind) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM worker_cycles WHERE worker_kind = ?1 AND end_time IS NULL",
            params![kind],
            |row| row.get(0),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_closes_previous_open_cycle() {
        let mut db = Db::open_in_memory().unwrap();
        let first = db.start_cycle(WorkerKind::Vectorizer, 10).unwrap();
        let second = db.start_cycle(WorkerKind::Vectorizer, 5).unwrap();
        assert_ne!(first, second);
        assert_eq!(db.open_cycle_count(WorkerKind::Vectorizer).unwrap(), 1);
        assert!(!db.get_cycle(&first).unwrap().is_open());

        let current = db.get_current(WorkerKind::Vectorizer).unwrap().unwrap();
        assert_eq!(current.cycle_id, second);
        assert!(current.is_open());

        // Other kinds are independent.
        db.start_cycle(WorkerKind::FileWatcher, 1).unwrap();
        assert_eq!(db.open_cycle_count(WorkerKind::Vectorizer).unwrap(), 1);
    }

    #[test]
    fn test_update_accumulates_and_averages() {
        let mut db = Db::open_in_memory().unwrap();
        let id = db.start_cycle(WorkerKind::FileWatcher, 4).unwrap();

        db.update_cycle(
            &id,
            CycleDelta {
                skipped: 2,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(db.get_cycle(&id).unwrap().average_processing_time.is_none());

        db.update_cycle(
            &id,
            CycleDelta {
                processed: 1,
                failed: 1,
                skipped: 0,
                processing_time: 3.0,
            },
        )
        .unwrap();
        let cycle = db.get_cycle(&id).unwrap();
        assert_eq!(cycle.files_processed, 1);
        assert_eq!(cycle.files_failed, 1);
        assert_eq!(cycle.files_skipped, 2);
        assert_eq!(cycle.average_processing_time, Some(1.5));

        assert!(db.update_cycle("missing", CycleDelta::default()).is_err());
    }

    #[test]
    fn test_get_current_falls_back_to_latest_closed() {
        let mut db = Db::open_in_memory().unwrap();
        assert!(db.get_current(WorkerKind::Repair).unwrap().is_none());

        let id = db.start_cycle(WorkerKind::Repair, 0).unwrap();
        db.end_cycle(&id).unwrap();
        let ended = db.get_cycle(&id).unwrap().end_time;
        db.end_cycle(&id).unwrap();
        assert_eq!(db.get_cycle(&id).unwrap().end_time, ended);

        let current = db.get_current(WorkerKind::Repair).unwrap().unwrap();
        assert_eq!(current.cycle_id, id);
        assert!(!current.is_open());
    }
}
