use super::{Db, models::Project, now};
use crate::error::{Result, StoreError};
use crate::paths::normalize_path;
use rusqlite::{OptionalExtension, Row, params};
use std::path::Path;
use tracing::debug;

fn map_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        root_path: row.get(1)?,
        name: row.get(2)?,
        comment: row.get(3)?,
        created_at: row.get(4)?,
    })
}

const PROJECT_COLUMNS: &str = "id, root_path, name, comment, created_at";

impl Db {
    /// Returns the id of the project rooted at `root_path`, creating it if needed.
    ///
    /// Concurrent callers converge on the same id: the lookup and the insert run
    /// inside one immediate transaction, and the unique constraint on `root_path`
    /// turns any remaining race into a no-op insert followed by a re-read.
    pub fn get_or_create_project(&mut self, root_path: &str, name: Option<&str>) -> Result<i64> {
        let root = normalize_path(root_path);
        if root.is_empty() {
            return Err(StoreError::InvalidInput("root_path is empty".into()));
        }

        let tx = self.immediate()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM projects WHERE root_path = ?1",
                params![root],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            tx.commit()?;
            return Ok(id);
        }

        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| default_project_name(&root));
        tx.execute(
            "INSERT INTO projects (root_path, name, comment, created_at) VALUES (?1, ?2, NULL, ?3)
             ON CONFLICT(root_path) DO NOTHING",
            params![root, name, now()],
        )?;
        let id: i64 = tx.query_row(
            "SELECT id FROM projects WHERE root_path = ?1",
            params![root],
            |row| row.get(0),
        )?;
        tx.commit()?;

        debug!("Created project {id} for {root}");
        Ok(id)
    }

    pub fn get_project(&self, project_id: i64) -> Result<Project> {
        self.conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                params![project_id],
                map_project,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("project", project_id))
    }

    pub fn get_project_by_root(&self, root_path: &str) -> Result<Option<Project>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE root_path = ?1"),
                params![normalize_path(root_path)],
                map_project,
            )
            .optional()?)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY id"))?;
        let rows = stmt.query_map([], map_project)?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row?);
        }
        Ok(projects)
    }
}

fn default_project_name(root: &str) -> String {
    Path::new(root)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| root.to_string())
}
