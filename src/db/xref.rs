use super::Db;
use super::models::{CrossReference, EntityLocation, EntityType, ResolvedEdge, TargetType};
use crate::error::Result;
use crate::indexer::xref::{PlannedEdge, Reference, ReferenceTarget, plan_edges};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::BTreeSet;
use tracing::debug;

const XREF_COLUMNS: &str = "id, file_id, caller_type, caller_id, callee_type, callee_id";

fn map_xref(row: &Row<'_>) -> rusqlite::Result<CrossReference> {
    Ok(CrossReference {
        id: row.get(0)?,
        file_id: row.get(1)?,
        caller_type: row.get(2)?,
        caller_id: row.get(3)?,
        callee_type: row.get(4)?,
        callee_id: row.get(5)?,
    })
}

/// Ids of live entities in `project_id` matching `target`. Two ids are enough to
/// tell an ambiguous target from a unique one.
pub(crate) fn find_candidates(
    conn: &Connection,
    project_id: i64,
    target: ReferenceTarget<'_>,
) -> Result<Vec<i64>> {
    let mut ids = Vec::new();
    match target {
        ReferenceTarget::Function(name) => {
            let mut stmt = conn.prepare_cached(
                "SELECT fn.id FROM functions fn JOIN files f ON fn.file_id = f.id
                 WHERE f.project_id = ?1 AND f.deleted = 0 AND fn.name = ?2
                 ORDER BY fn.id LIMIT 2",
            )?;
            for id in stmt.query_map(params![project_id, name], |r| r.get(0))? {
                ids.push(id?);
            }
        }
        ReferenceTarget::Class(name) => {
            let mut stmt = conn.prepare_cached(
                "SELECT c.id FROM classes c JOIN files f ON c.file_id = f.id
                 WHERE f.project_id = ?1 AND f.deleted = 0 AND c.name = ?2
                 ORDER BY c.id LIMIT 2",
            )?;
            for id in stmt.query_map(params![project_id, name], |r| r.get(0))? {
                ids.push(id?);
            }
        }
        ReferenceTarget::Method { name, class } => {
            let mut stmt = conn.prepare_cached(
                "SELECT m.id FROM methods m
                 JOIN classes c ON m.class_id = c.id
                 JOIN files f ON c.file_id = f.id
                 WHERE f.project_id = ?1 AND f.deleted = 0 AND m.name = ?2
                   AND (?3 IS NULL OR c.name = ?3)
                 ORDER BY m.id LIMIT 2",
            )?;
            for id in stmt.query_map(params![project_id, name, class], |r| r.get(0))? {
                ids.push(id?);
            }
        }
    }
    Ok(ids)
}

pub(crate) fn insert_edges(conn: &Connection, file_id: i64, edges: &[PlannedEdge]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO cross_references (file_id, caller_type, caller_id, callee_type, callee_id)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    let mut inserted = 0;
    for edge in edges {
        inserted += stmt.execute(params![
            file_id,
            edge.caller_type,
            edge.caller_id,
            edge.callee_type,
            edge.callee_id
        ])?;
    }
    Ok(inserted)
}

/// References a file made at its last ingest: its usages plus the bases of its classes.
pub(crate) fn stored_references(conn: &Connection, file_id: i64) -> Result<Vec<Reference>> {
    let mut refs = Vec::new();
    let mut stmt = conn.prepare_cached(
        "SELECT caller_type, caller_id, target_type, target_name, target_class
         FROM usages WHERE file_id = ?1 ORDER BY id",
    )?;
    for row in stmt.query_map(params![file_id], |row| {
        Ok(Reference {
            caller_type: row.get(0)?,
            caller_id: row.get(1)?,
            target_type: row.get(2)?,
            name: row.get(3)?,
            class: row.get(4)?,
        })
    })? {
        refs.push(row?);
    }

    let mut stmt = conn.prepare_cached(
        "SELECT b.class_id, b.name FROM class_bases b JOIN classes c ON b.class_id = c.id
         WHERE c.file_id = ?1 ORDER BY b.class_id, b.ordinal",
    )?;
    for row in stmt.query_map(params![file_id], |row| {
        Ok(Reference {
            caller_type: EntityType::Class,
            caller_id: row.get(0)?,
            target_type: TargetType::Class,
            name: row.get(1)?,
            class: None,
        })
    })? {
        refs.push(row?);
    }
    Ok(refs)
}

/// Drops a file's edges and plans them again against the current live entities.
pub(crate) fn replan_file(conn: &Connection, project_id: i64, file_id: i64) -> Result<usize> {
    conn.execute("DELETE FROM cross_references WHERE file_id = ?1", params![file_id])?;
    let refs = stored_references(conn, file_id)?;
    let edges = plan_edges(&refs, |target| find_candidates(conn, project_id, target))?;
    insert_edges(conn, file_id, &edges)
}

/// Classes, methods and functions a file defines, with their current ids.
pub(crate) fn defined_entities(
    conn: &Connection,
    file_id: i64,
) -> Result<BTreeSet<(EntityType, i64, String)>> {
    let mut entities = BTreeSet::new();
    for (entity_type, sql) in [
        (EntityType::Class, "SELECT id, name FROM classes WHERE file_id = ?1"),
        (
            EntityType::Method,
            "SELECT m.id, m.name FROM methods m JOIN classes c ON m.class_id = c.id WHERE c.file_id = ?1",
        ),
        (EntityType::Function, "SELECT id, name FROM functions WHERE file_id = ?1"),
    ] {
        let mut stmt = conn.prepare_cached(sql)?;
        for row in stmt.query_map(params![file_id], |row| Ok((row.get(0)?, row.get(1)?)))? {
            let (id, name) = row?;
            entities.insert((entity_type, id, name));
        }
    }
    Ok(entities)
}

/// Re-plans every live file of the project (except `skip`) that references one of
/// `names`, so edges follow callees that appeared, moved, vanished or became
/// ambiguous. Returns the number of files re-planned.
pub(crate) fn refresh_dependents(
    conn: &Connection,
    project_id: i64,
    names: &BTreeSet<String>,
    skip: Option<i64>,
) -> Result<usize> {
    let mut files = BTreeSet::new();
    let mut stmt = conn.prepare_cached(
        "SELECT u.file_id FROM usages u JOIN files f ON u.file_id = f.id
         WHERE f.project_id = ?1 AND f.deleted = 0 AND u.target_name = ?2
         UNION
         SELECT c.file_id FROM class_bases b
         JOIN classes c ON b.class_id = c.id JOIN files f ON c.file_id = f.id
         WHERE f.project_id = ?1 AND f.deleted = 0 AND b.name = ?2",
    )?;
    for name in names {
        for row in stmt.query_map(params![project_id, name], |row| row.get::<_, i64>(0))? {
            files.insert(row?);
        }
    }
    if let Some(skip) = skip {
        files.remove(&skip);
    }

    for file_id in &files {
        replan_file(conn, project_id, *file_id)?;
    }
    if !files.is_empty() {
        debug!("Re-planned cross-references of {} dependent file(s)", files.len());
    }
    Ok(files.len())
}

/// Liveness of a file's entities changed: its dependents are re-planned, and when it
/// is live again so are its own edges.
pub(crate) fn refresh_after_state_change(conn: &Connection, file_id: i64) -> Result<usize> {
    let (project_id, deleted): (i64, bool) = conn.query_row(
        "SELECT project_id, deleted FROM files WHERE id = ?1",
        params![file_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    if !deleted {
        replan_file(conn, project_id, file_id)?;
    }
    let names = names_of(&defined_entities(conn, file_id)?);
    refresh_dependents(conn, project_id, &names, Some(file_id))
}

pub(crate) fn names_of(entities: &BTreeSet<(EntityType, i64, String)>) -> BTreeSet<String> {
    entities.iter().map(|(_, _, name)| name.clone()).collect()
}

/// Name and location of an entity, or `None` if it is gone or lives in a deleted file.
pub(crate) fn resolve_entity(
    conn: &Connection,
    entity_type: EntityType,
    id: i64,
) -> Result<Option<EntityLocation>> {
    let sql = match entity_type {
        EntityType::File => {
            "SELECT f.path, NULL, f.id, f.path, 1 FROM files f WHERE f.id = ?1 AND f.deleted = 0"
        }
        EntityType::Class => {
            "SELECT c.name, NULL, f.id, f.path, c.line FROM classes c JOIN files f ON c.file_id = f.id
             WHERE c.id = ?1 AND f.deleted = 0"
        }
        EntityType::Function => {
            "SELECT fn.name, NULL, f.id, f.path, fn.line FROM functions fn JOIN files f ON fn.file_id = f.id
             WHERE fn.id = ?1 AND f.deleted = 0"
        }
        EntityType::Method => {
            "SELECT m.name, c.name, f.id, f.path, m.line FROM methods m
             JOIN classes c ON m.class_id = c.id JOIN files f ON c.file_id = f.id
             WHERE m.id = ?1 AND f.deleted = 0"
        }
        EntityType::Chunk => {
            "SELECT ch.chunk_uuid, NULL, f.id, f.path, ch.ordinal FROM code_chunks ch JOIN files f ON ch.file_id = f.id
             WHERE ch.id = ?1 AND f.deleted = 0"
        }
    };
    Ok(conn
        .query_row(sql, params![id], |row| {
            Ok(EntityLocation {
                entity_type,
                id,
                name: row.get(0)?,
                owner: row.get(1)?,
                file_id: row.get(2)?,
                file_path: row.get(3)?,
                line: row.get(4)?,
            })
        })
        .optional()?)
}

impl Db {
    /// Outgoing edges of a caller with their resolved callees; dangling callees are skipped.
    pub fn get_dependencies_by_caller(
        &self,
        caller_type: EntityType,
        caller_id: i64,
    ) -> Result<Vec<ResolvedEdge>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {XREF_COLUMNS} FROM cross_references
             WHERE caller_type = ?1 AND caller_id = ?2 ORDER BY id"
        ))?;
        let refs = stmt
            .query_map(params![caller_type, caller_id], map_xref)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut edges = Vec::with_capacity(refs.len());
        for reference in refs {
            if let Some(target) =
                resolve_entity(&self.conn, reference.callee_type, reference.callee_id)?
            {
                edges.push(ResolvedEdge { reference, target });
            }
        }
        Ok(edges)
    }

    /// Incoming edges of a callee with their resolved callers; dangling callers are skipped.
    pub fn get_dependents_by_callee(
        &self,
        callee_type: EntityType,
        callee_id: i64,
    ) -> Result<Vec<ResolvedEdge>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {XREF_COLUMNS} FROM cross_references
             WHERE callee_type = ?1 AND callee_id = ?2 ORDER BY id"
        ))?;
        let refs = stmt
            .query_map(params![callee_type, callee_id], map_xref)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut edges = Vec::with_capacity(refs.len());
        for reference in refs {
            if let Some(target) =
                resolve_entity(&self.conn, reference.caller_type, reference.caller_id)?
            {
                edges.push(ResolvedEdge { reference, target });
            }
        }
        Ok(edges)
    }

    pub fn cross_references_for_file(&self, file_id: i64) -> Result<Vec<CrossReference>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {XREF_COLUMNS} FROM cross_references WHERE file_id = ?1 ORDER BY id"
        ))?;
        let refs = stmt
            .query_map(params![file_id], map_xref)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(refs)
    }

    pub fn resolve_entity(&self, entity_type: EntityType, id: i64) -> Result<Option<EntityLocation>> {
        resolve_entity(&self.conn, entity_type, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ParsedFile, ParsedFunction, ParsedUsage, TargetType, UsageScope};

    fn caller_file(call: &str) -> ParsedFile {
        ParsedFile {
            lines: 3,
            functions: vec![ParsedFunction {
                name: "main".into(),
                line: 1,
                end_line: 2,
                ..Default::default()
            }],
            usages: vec![ParsedUsage {
                line: 2,
                usage_type: "call".into(),
                target_type: TargetType::Function,
                target_name: call.into(),
                target_class: None,
                context: "main".into(),
                scope: UsageScope::Function(0),
            }],
            ..Default::default()
        }
    }

    fn helper_file() -> ParsedFile {
        ParsedFile {
            lines: 2,
            functions: vec![ParsedFunction {
                name: "helper".into(),
                line: 1,
                end_line: 2,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_unique_callee_materializes_edge() {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();
        let lib = db.add_file("/proj/lib.py", 2, 1.0, false, pid).unwrap();
        let app = db.add_file("/proj/app.py", 3, 1.0, false, pid).unwrap();

        let helper_ids = db
            .ingest_entities(lib, &helper_file(), "def helper():\n    pass\n")
            .unwrap()
            .ids;
        let summary = db
            .ingest_entities(app, &caller_file("helper"), "def main():\n    helper()\n")
            .unwrap();
        assert_eq!(summary.cross_references, 1);

        let main_id = summary.ids.functions[0];
        let deps = db
            .get_dependencies_by_caller(EntityType::Function, main_id)
            .unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].target.name, "helper");
        assert_eq!(deps[0].target.file_path, "/proj/lib.py");

        let dependents = db
            .get_dependents_by_callee(EntityType::Function, helper_ids.functions[0])
            .unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].target.name, "main");
    }

    #[test]
    fn test_ambiguous_callee_has_no_edge() {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();
        let a = db.add_file("/proj/a.py", 2, 1.0, false, pid).unwrap();
        let b = db.add_file("/proj/b.py", 2, 1.0, false, pid).unwrap();
        let app = db.add_file("/proj/app.py", 3, 1.0, false, pid).unwrap();
        db.ingest_entities(a, &helper_file(), "").unwrap();
        db.ingest_entities(b, &helper_file(), "").unwrap();

        let summary = db.ingest_entities(app, &caller_file("helper"), "").unwrap();
        assert_eq!(summary.cross_references, 0);
        assert!(db.cross_references_for_file(app).unwrap().is_empty());
        // The name-based usage is still recorded.
        assert_eq!(db.usages_for_file(app).unwrap().len(), 1);
    }

    #[test]
    fn test_dangling_callee_filtered() {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();
        let lib = db.add_file("/proj/lib.py", 2, 1.0, false, pid).unwrap();
        let app = db.add_file("/proj/app.py", 3, 1.0, false, pid).unwrap();
        db.ingest_entities(lib, &helper_file(), "").unwrap();
        let main_id = db
            .ingest_entities(app, &caller_file("helper"), "")
            .unwrap()
            .ids
            .functions[0];

        // Removed behind the store's back, so the edge row outlives its callee.
        db.conn
            .execute("DELETE FROM functions WHERE file_id = ?1", params![lib])
            .unwrap();

        assert_eq!(db.cross_references_for_file(app).unwrap().len(), 1);
        assert!(
            db.get_dependencies_by_caller(EntityType::Function, main_id)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_cleared_callee_drops_dependent_edge() {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();
        let lib = db.add_file("/proj/lib.py", 2, 1.0, false, pid).unwrap();
        let app = db.add_file("/proj/app.py", 3, 1.0, false, pid).unwrap();
        db.ingest_entities(lib, &helper_file(), "").unwrap();
        db.ingest_entities(app, &caller_file("helper"), "").unwrap();

        db.clear_file_data(lib).unwrap();
        assert!(db.cross_references_for_file(app).unwrap().is_empty());
    }

    #[test]
    fn test_caller_ingested_before_callee_gets_edge() {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();
        let app = db.add_file("/proj/app.py", 3, 1.0, false, pid).unwrap();
        let lib = db.add_file("/proj/lib.py", 2, 1.0, false, pid).unwrap();

        let caller = db.ingest_entities(app, &caller_file("helper"), "").unwrap();
        assert_eq!(caller.cross_references, 0);

        let callee = db.ingest_entities(lib, &helper_file(), "").unwrap();
        assert_eq!(callee.dependents_replanned, 1);
        let deps = db
            .get_dependencies_by_caller(EntityType::Function, caller.ids.functions[0])
            .unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].target.id, callee.ids.functions[0]);
    }

    #[test]
    fn test_second_definition_makes_edge_ambiguous() {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();
        let a = db.add_file("/proj/a.py", 2, 1.0, false, pid).unwrap();
        let app = db.add_file("/proj/app.py", 3, 1.0, false, pid).unwrap();
        db.ingest_entities(a, &helper_file(), "").unwrap();
        db.ingest_entities(app, &caller_file("helper"), "").unwrap();
        assert_eq!(db.cross_references_for_file(app).unwrap().len(), 1);

        let b = db.add_file("/proj/b.py", 2, 1.0, false, pid).unwrap();
        db.ingest_entities(b, &helper_file(), "").unwrap();
        assert!(db.cross_references_for_file(app).unwrap().is_empty());

        // Dropping the duplicate again brings the edge back.
        db.ingest_entities(b, &ParsedFile::default(), "").unwrap();
        assert_eq!(db.cross_references_for_file(app).unwrap().len(), 1);
    }

    #[test]
    fn test_moved_callee_edge_follows_new_id() {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();
        let lib = db.add_file("/proj/lib.py", 4, 1.0, false, pid).unwrap();
        let app = db.add_file("/proj/app.py", 3, 1.0, false, pid).unwrap();
        let old_id = db.ingest_entities(lib, &helper_file(), "").unwrap().ids.functions[0];
        db.ingest_entities(app, &caller_file("helper"), "").unwrap();

        let mut moved = helper_file();
        moved.lines = 4;
        moved.functions[0].line = 3;
        moved.functions[0].end_line = 4;
        let new_id = db.ingest_entities(lib, &moved, "").unwrap().ids.functions[0];
        assert_ne!(old_id, new_id);

        let edges = db.cross_references_for_file(app).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].callee_id, new_id);
        assert!(db.resolve_entity(EntityType::Function, edges[0].callee_id).unwrap().is_some());
    }

    #[test]
    fn test_soft_deleting_a_duplicate_makes_edge_unique() {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();
        let a = db.add_file("/proj/a.py", 2, 1.0, false, pid).unwrap();
        let b = db.add_file("/proj/b.py", 2, 1.0, false, pid).unwrap();
        let app = db.add_file("/proj/app.py", 3, 1.0, false, pid).unwrap();
        let a_helper = db.ingest_entities(a, &helper_file(), "").unwrap().ids.functions[0];
        db.ingest_entities(b, &helper_file(), "").unwrap();
        db.ingest_entities(app, &caller_file("helper"), "").unwrap();
        assert!(db.cross_references_for_file(app).unwrap().is_empty());

        db.set_deleted_state(b, "/versions/b.py", "/proj/b.py", "/versions").unwrap();
        let edges = db.cross_references_for_file(app).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].callee_id, a_helper);

        db.set_active_state(b, "/proj/b.py").unwrap();
        assert!(db.cross_references_for_file(app).unwrap().is_empty());
    }
}
