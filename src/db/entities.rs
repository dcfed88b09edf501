use super::Db;
use super::models::{
    ClassRecord, EntityType, FunctionRecord, ImportRecord, IngestedIds, MethodRecord, ParsedFile,
    TargetType, UsageRecord,
};
use super::xref::{defined_entities, names_of, refresh_dependents, replan_file};
use crate::error::{Result, StoreError};
use crate::paths::normalize_path;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

/// Counters reported by `ingest_entities`, plus the ids assigned to each parsed entity.
#[derive(Debug, Clone, Default)]
pub struct IngestSummary {
    pub ids: IngestedIds,
    pub classes: usize,
    pub methods: usize,
    pub functions: usize,
    pub imports: usize,
    pub usages: usize,
    pub cross_references: usize,
    pub removed_entities: usize,
    /// Other files whose edges were planned again because this file's entities changed.
    pub dependents_replanned: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentHit {
    pub file_id: i64,
    pub file_path: String,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub entity_name: String,
    pub docstring: Option<String>,
    pub snippet: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EntityCounts {
    pub files: i64,
    pub deleted_files: i64,
    pub classes: i64,
    pub methods: i64,
    pub functions: i64,
    pub imports: i64,
    pub usages: i64,
    pub cross_references: i64,
    pub chunks: i64,
    pub pending_chunks: i64,
    pub snapshots: i64,
}

/// Lines `line..=end_line` (1-based) of `source`.
fn slice_lines(source: &str, line: i64, end_line: i64) -> String {
    let start = (line.max(1) - 1) as usize;
    let count = (end_line - line + 1).max(1) as usize;
    source
        .lines()
        .skip(start)
        .take(count)
        .collect::<Vec<_>>()
        .join("\n")
}

fn load_names(conn: &Connection, sql: &str, owner_id: i64) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params![owner_id], |row| row.get(0))?;
    rows.collect()
}

fn replace_names(conn: &Connection, table: &str, key: &str, owner_id: i64, names: &[String]) -> Result<()> {
    conn.execute(&format!("DELETE FROM {table} WHERE {key} = ?1"), params![owner_id])?;
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT INTO {table} ({key}, ordinal, name) VALUES (?1, ?2, ?3)"
    ))?;
    for (ordinal, name) in names.iter().enumerate() {
        stmt.execute(params![owner_id, ordinal as i64, name])?;
    }
    Ok(())
}

fn insert_content(
    conn: &Connection,
    file_id: i64,
    entity_type: EntityType,
    entity_id: i64,
    entity_name: &str,
    content: &str,
    docstring: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO code_content (file_id, entity_type, entity_id, entity_name, content, docstring)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![file_id, entity_type, entity_id, entity_name, content, docstring],
    )?;
    let rowid = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO code_content_fts (rowid, entity_name, content, docstring) VALUES (?1, ?2, ?3, ?4)",
        params![rowid, entity_name, content, docstring.unwrap_or("")],
    )?;
    Ok(())
}

/// Quotes each whitespace-separated term so user input never hits FTS5 query syntax.
fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn map_class(conn: &Connection, row: &Row<'_>) -> rusqlite::Result<ClassRecord> {
    let id: i64 = row.get(0)?;
    Ok(ClassRecord {
        id,
        file_id: row.get(1)?,
        file_path: row.get(2)?,
        name: row.get(3)?,
        line: row.get(4)?,
        end_line: row.get(5)?,
        docstring: row.get(6)?,
        bases: load_names(
            conn,
            "SELECT name FROM class_bases WHERE class_id = ?1 ORDER BY ordinal",
            id,
        )?,
    })
}

const USAGE_COLUMNS: &str = "u.id, u.file_id, f.path, u.line, u.usage_type, u.target_type, \
     u.target_name, u.target_class, u.context";

fn map_usage(row: &Row<'_>) -> rusqlite::Result<UsageRecord> {
    Ok(UsageRecord {
        id: row.get(0)?,
        file_id: row.get(1)?,
        file_path: row.get(2)?,
        line: row.get(3)?,
        usage_type: row.get(4)?,
        target_type: row.get(5)?,
        target_name: row.get(6)?,
        target_class: row.get(7)?,
        context: row.get(8)?,
    })
}

fn map_import(row: &Row<'_>) -> rusqlite::Result<ImportRecord> {
    Ok(ImportRecord {
        id: row.get(0)?,
        file_id: row.get(1)?,
        file_path: row.get(2)?,
        name: row.get(3)?,
        module: row.get(4)?,
        import_type: row.get(5)?,
        line: row.get(6)?,
    })
}

/// Replaces the parsed entities of one file and rebuilds its cross-references.
///
/// Classes, methods and functions are upserted by (owner, name, line) so their ids
/// survive a re-index; entities that disappeared are removed. Imports, usages,
/// content rows and outgoing cross-references are rewritten. When the set of
/// defined entities changed, files referencing any of their names are re-planned.
pub(crate) fn ingest_entities_in(
    tx: &Connection,
    file_id: i64,
    parsed: &ParsedFile,
    source: &str,
) -> Result<IngestSummary> {
    let project_id: i64 = tx
        .query_row(
            "SELECT project_id FROM files WHERE id = ?1",
            params![file_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found("file", file_id))?;

    let mut summary = IngestSummary::default();
    let before = defined_entities(tx, file_id)?;

    for (table, predicate) in [
        (
            "code_content_fts",
            "rowid IN (SELECT id FROM code_content WHERE file_id = ?1)",
        ),
        ("code_content", "file_id = ?1"),
        ("imports", "file_id = ?1"),
        ("usages", "file_id = ?1"),
    ] {
        tx.execute(&format!("DELETE FROM {table} WHERE {predicate}"), params![file_id])?;
    }

    // Classes and their methods.
    let mut kept_classes = HashSet::new();
    for class in &parsed.classes {
        let class_id: i64 = tx.query_row(
            "INSERT INTO classes (file_id, name, line, end_line, docstring) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(file_id, name, line) DO UPDATE
             SET end_line = excluded.end_line, docstring = excluded.docstring
             RETURNING id",
            params![file_id, class.name, class.line, class.end_line, class.docstring],
            |row| row.get(0),
        )?;
        kept_classes.insert(class_id);
        replace_names(tx, "class_bases", "class_id", class_id, &class.bases)?;
        insert_content(
            tx,
            file_id,
            EntityType::Class,
            class_id,
            &class.name,
            &slice_lines(source, class.line, class.end_line),
            class.docstring.as_deref(),
        )?;

        let mut kept_methods = HashSet::new();
        let mut method_ids = Vec::with_capacity(class.methods.len());
        for method in &class.methods {
            let method_id: i64 = tx.query_row(
                "INSERT INTO methods (class_id, name, line, end_line, docstring, is_abstract, has_pass, has_not_implemented)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(class_id, name, line) DO UPDATE
                 SET end_line = excluded.end_line, docstring = excluded.docstring,
                     is_abstract = excluded.is_abstract, has_pass = excluded.has_pass,
                     has_not_implemented = excluded.has_not_implemented
                 RETURNING id",
                params![
                    class_id,
                    method.name,
                    method.line,
                    method.end_line,
                    method.docstring,
                    method.is_abstract,
                    method.has_pass,
                    method.has_not_implemented
                ],
                |row| row.get(0),
            )?;
            kept_methods.insert(method_id);
            method_ids.push(method_id);
            replace_names(tx, "method_args", "method_id", method_id, &method.args)?;
            insert_content(
                tx,
                file_id,
                EntityType::Method,
                method_id,
                &format!("{}.{}", class.name, method.name),
                &slice_lines(source, method.line, method.end_line),
                method.docstring.as_deref(),
            )?;
        }
        summary.methods += method_ids.len();

        let existing: Vec<i64> = {
            let mut stmt = tx.prepare_cached("SELECT id FROM methods WHERE class_id = ?1")?;
            let ids = stmt
                .query_map(params![class_id], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            ids
        };
        for stale in existing.into_iter().filter(|id| !kept_methods.contains(id)) {
            tx.execute("DELETE FROM method_args WHERE method_id = ?1", params![stale])?;
            tx.execute("DELETE FROM methods WHERE id = ?1", params![stale])?;
            summary.removed_entities += 1;
        }

        summary.ids.classes.push(class_id);
        summary.ids.methods.push(method_ids);
    }
    summary.classes = summary.ids.classes.len();

    let existing: Vec<i64> = {
        let mut stmt = tx.prepare_cached("SELECT id FROM classes WHERE file_id = ?1")?;
        let ids = stmt
            .query_map(params![file_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        ids
    };
    for stale in existing.into_iter().filter(|id| !kept_classes.contains(id)) {
        tx.execute(
            "DELETE FROM method_args WHERE method_id IN (SELECT id FROM methods WHERE class_id = ?1)",
            params![stale],
        )?;
        summary.removed_entities += tx.execute("DELETE FROM methods WHERE class_id = ?1", params![stale])?;
        tx.execute("DELETE FROM class_bases WHERE class_id = ?1", params![stale])?;
        tx.execute("DELETE FROM classes WHERE id = ?1", params![stale])?;
        summary.removed_entities += 1;
    }

    // Module-level functions.
    let mut kept_functions = HashSet::new();
    for function in &parsed.functions {
        let function_id: i64 = tx.query_row(
            "INSERT INTO functions (file_id, name, line, end_line, docstring) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(file_id, name, line) DO UPDATE
             SET end_line = excluded.end_line, docstring = excluded.docstring
             RETURNING id",
            params![file_id, function.name, function.line, function.end_line, function.docstring],
            |row| row.get(0),
        )?;
        kept_functions.insert(function_id);
        replace_names(tx, "function_args", "function_id", function_id, &function.args)?;
        insert_content(
            tx,
            file_id,
            EntityType::Function,
            function_id,
            &function.name,
            &slice_lines(source, function.line, function.end_line),
            function.docstring.as_deref(),
        )?;
        summary.ids.functions.push(function_id);
    }
    summary.functions = summary.ids.functions.len();

    let existing: Vec<i64> = {
        let mut stmt = tx.prepare_cached("SELECT id FROM functions WHERE file_id = ?1")?;
        let ids = stmt
            .query_map(params![file_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        ids
    };
    for stale in existing.into_iter().filter(|id| !kept_functions.contains(id)) {
        tx.execute("DELETE FROM function_args WHERE function_id = ?1", params![stale])?;
        tx.execute("DELETE FROM functions WHERE id = ?1", params![stale])?;
        summary.removed_entities += 1;
    }

    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO imports (file_id, name, module, import_type, line) VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for import in &parsed.imports {
            stmt.execute(params![
                file_id,
                import.name,
                import.module,
                import.import_type,
                import.line
            ])?;
        }
        summary.imports = parsed.imports.len();

        let mut stmt = tx.prepare_cached(
            "INSERT INTO usages (file_id, line, usage_type, target_type, target_name, target_class, context,
                                 caller_type, caller_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for usage in &parsed.usages {
            let (caller_type, caller_id) = summary.ids.caller(file_id, usage.scope);
            stmt.execute(params![
                file_id,
                usage.line,
                usage.usage_type,
                usage.target_type,
                usage.target_name,
                usage.target_class,
                usage.context,
                caller_type,
                caller_id
            ])?;
        }
        summary.usages = parsed.usages.len();
    }

    summary.cross_references = replan_file(tx, project_id, file_id)?;

    let after = defined_entities(tx, file_id)?;
    if after != before {
        let mut names = names_of(&before);
        names.extend(names_of(&after));
        summary.dependents_replanned = refresh_dependents(tx, project_id, &names, Some(file_id))?;
    }

    debug!(
        "Ingested file {file_id}: {} classes, {} methods, {} functions, {} usages, {} cross-references",
        summary.classes, summary.methods, summary.functions, summary.usages, summary.cross_references
    );
    Ok(summary)
}

impl Db {
    /// [`ingest_entities_in`] inside its own immediate transaction.
    pub fn ingest_entities(
        &mut self,
        file_id: i64,
        parsed: &ParsedFile,
        source: &str,
    ) -> Result<IngestSummary> {
        let tx = self.immediate()?;
        let summary = ingest_entities_in(&tx, file_id, parsed, source)?;
        tx.commit()?;
        Ok(summary)
    }

    /// Classes of live files in a project, optionally restricted to one file path.
    pub fn list_classes(&self, project_id: i64, file: Option<&str>) -> Result<Vec<ClassRecord>> {
        let file = file.map(normalize_path);
        let mut stmt = self.conn.prepare_cached(
            "SELECT c.id, c.file_id, f.path, c.name, c.line, c.end_line, c.docstring
             FROM classes c JOIN files f ON c.file_id = f.id
             WHERE f.project_id = ?1 AND f.deleted = 0 AND (?2 IS NULL OR f.path = ?2)
             ORDER BY f.path, c.line, c.id",
        )?;
        let rows = stmt.query_map(params![project_id, file], |row| map_class(&self.conn, row))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn methods_for_class(&self, class_id: i64) -> Result<Vec<MethodRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, class_id, name, line, end_line, docstring, is_abstract, has_pass, has_not_implemented
             FROM methods WHERE class_id = ?1 ORDER BY line, id",
        )?;
        let rows = stmt.query_map(params![class_id], |row| {
            let id: i64 = row.get(0)?;
            Ok(MethodRecord {
                id,
                class_id: row.get(1)?,
                name: row.get(2)?,
                line: row.get(3)?,
                end_line: row.get(4)?,
                docstring: row.get(5)?,
                args: load_names(
                    &self.conn,
                    "SELECT name FROM method_args WHERE method_id = ?1 ORDER BY ordinal",
                    id,
                )?,
                is_abstract: row.get(6)?,
                has_pass: row.get(7)?,
                has_not_implemented: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn functions_for_file(&self, file_id: i64) -> Result<Vec<FunctionRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, file_id, name, line, end_line, docstring FROM functions
             WHERE file_id = ?1 ORDER BY line, id",
        )?;
        let rows = stmt.query_map(params![file_id], |row| {
            let id: i64 = row.get(0)?;
            Ok(FunctionRecord {
                id,
                file_id: row.get(1)?,
                name: row.get(2)?,
                line: row.get(3)?,
                end_line: row.get(4)?,
                docstring: row.get(5)?,
                args: load_names(
                    &self.conn,
                    "SELECT name FROM function_args WHERE function_id = ?1 ORDER BY ordinal",
                    id,
                )?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn usages_for_file(&self, file_id: i64) -> Result<Vec<UsageRecord>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {USAGE_COLUMNS} FROM usages u JOIN files f ON u.file_id = f.id
             WHERE u.file_id = ?1 ORDER BY u.line, u.id"
        ))?;
        let rows = stmt.query_map(params![file_id], map_usage)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Usages of live files whose target name matches exactly, ordered by (file path, line).
    pub fn query_usages(
        &self,
        project_id: i64,
        name: &str,
        target_type: Option<TargetType>,
        target_class: Option<&str>,
        file: Option<&str>,
    ) -> Result<Vec<UsageRecord>> {
        let file = file.map(normalize_path);
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {USAGE_COLUMNS} FROM usages u JOIN files f ON u.file_id = f.id
             WHERE f.project_id = ?1 AND f.deleted = 0 AND u.target_name = ?2
               AND (?3 IS NULL OR u.target_type = ?3)
               AND (?4 IS NULL OR u.target_class = ?4)
               AND (?5 IS NULL OR f.path = ?5)
             ORDER BY f.path, u.line, u.id"
        ))?;
        let rows = stmt.query_map(
            params![project_id, name, target_type, target_class, file],
            map_usage,
        )?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Imports of live files where the module equals `name`, the imported name equals
    /// `name`, or the module contains `name`.
    pub fn query_imports_matching(&self, project_id: i64, name: &str) -> Result<Vec<ImportRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT i.id, i.file_id, f.path, i.name, i.module, i.import_type, i.line
             FROM imports i JOIN files f ON i.file_id = f.id
             WHERE f.project_id = ?1 AND f.deleted = 0
               AND (i.module = ?2 OR i.name = ?2 OR instr(i.module, ?2) > 0)
             ORDER BY f.path, i.line, i.id",
        )?;
        let rows = stmt.query_map(params![project_id, name], map_import)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Full-text search over entity source and docstrings of live files, best match first.
    pub fn search_content(&self, project_id: i64, query: &str, limit: usize) -> Result<Vec<ContentHit>> {
        let query = fts_query(query);
        if query.is_empty() {
            return Err(StoreError::InvalidInput("search query is empty".into()));
        }
        let mut stmt = self.conn.prepare_cached(
            "SELECT cc.file_id, f.path, cc.entity_type, cc.entity_id, cc.entity_name, cc.docstring,
                    snippet(code_content_fts, 1, '[', ']', '...', 12)
             FROM code_content_fts
             JOIN code_content cc ON cc.id = code_content_fts.rowid
             JOIN files f ON f.id = cc.file_id
             WHERE code_content_fts MATCH ?1 AND f.project_id = ?2 AND f.deleted = 0
             ORDER BY rank
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![query, project_id, limit as i64], |row| {
            Ok(ContentHit {
                file_id: row.get(0)?,
                file_path: row.get(1)?,
                entity_type: row.get(2)?,
                entity_id: row.get(3)?,
                entity_name: row.get(4)?,
                docstring: row.get(5)?,
                snippet: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn entity_counts(&self, project_id: i64) -> Result<EntityCounts> {
        let count = |sql: &str| -> Result<i64> {
            Ok(self.conn.query_row(sql, params![project_id], |row| row.get(0))?)
        };
        Ok(EntityCounts {
            files: count("SELECT COUNT(*) FROM files WHERE project_id = ?1 AND deleted = 0")?,
            deleted_files: count("SELECT COUNT(*) FROM files WHERE project_id = ?1 AND deleted = 1")?,
            classes: count(
                "SELECT COUNT(*) FROM classes c JOIN files f ON c.file_id = f.id WHERE f.project_id = ?1",
            )?,
            methods: count(
                "SELECT COUNT(*) FROM methods m JOIN classes c ON m.class_id = c.id
                 JOIN files f ON c.file_id = f.id WHERE f.project_id = ?1",
            )?,
            functions: count(
                "SELECT COUNT(*) FROM functions fn JOIN files f ON fn.file_id = f.id WHERE f.project_id = ?1",
            )?,
            imports: count(
                "SELECT COUNT(*) FROM imports i JOIN files f ON i.file_id = f.id WHERE f.project_id = ?1",
            )?,
            usages: count(
                "SELECT COUNT(*) FROM usages u JOIN files f ON u.file_id = f.id WHERE f.project_id = ?1",
            )?,
            cross_references: count(
                "SELECT COUNT(*) FROM cross_references x JOIN files f ON x.file_id = f.id WHERE f.project_id = ?1",
            )?,
            chunks: count("SELECT COUNT(*) FROM code_chunks WHERE project_id = ?1")?,
            pending_chunks: count(
                "SELECT COUNT(*) FROM code_chunks WHERE project_id = ?1 AND vector_id IS NULL",
            )?,
            snapshots: count("SELECT COUNT(*) FROM tree_snapshots WHERE project_id = ?1")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ImportType, ParsedClass, ParsedFunction, ParsedImport, ParsedMethod};

    fn parsed(method_names: &[&str]) -> ParsedFile {
        ParsedFile {
            lines: 10,
            classes: vec![ParsedClass {
                name: "Shape".into(),
                line: 1,
                end_line: 6,
                bases: vec!["Base".into(), "Mixin".into()],
                methods: method_names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| ParsedMethod {
                        name: name.to_string(),
                        line: 2 + i as i64 * 2,
                        end_line: 3 + i as i64 * 2,
                        args: vec!["self".into(), "scale".into()],
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            functions: vec![ParsedFunction {
                name: "build".into(),
                line: 8,
                end_line: 9,
                docstring: Some("Builds a shape from config".into()),
                args: vec!["cfg".into()],
            }],
            imports: vec![
                ParsedImport {
                    name: "path".into(),
                    module: Some("os".into()),
                    import_type: ImportType::From,
                    line: 1,
                },
                ParsedImport {
                    name: "json".into(),
                    module: None,
                    import_type: ImportType::Direct,
                    line: 2,
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_reingest_keeps_ids_and_removes_stale() {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();
        let fid = db.add_file("/proj/shape.py", 10, 1.0, false, pid).unwrap();

        let first = db.ingest_entities(fid, &parsed(&["area", "scale"]), "").unwrap();
        let second = db.ingest_entities(fid, &parsed(&["area"]), "").unwrap();

        assert_eq!(first.ids.classes, second.ids.classes);
        assert_eq!(first.ids.methods[0][0], second.ids.methods[0][0]);
        assert_eq!(first.ids.functions, second.ids.functions);
        assert_eq!(second.removed_entities, 1);

        let methods = db.methods_for_class(second.ids.classes[0]).unwrap();
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].args, vec!["self", "scale"]);

        let classes = db.list_classes(pid, None).unwrap();
        assert_eq!(classes[0].bases, vec!["Base", "Mixin"]);
        assert_eq!(db.functions_for_file(fid).unwrap()[0].args, vec!["cfg"]);
        // Imports are rewritten, not duplicated.
        assert_eq!(db.entity_counts(pid).unwrap().imports, 2);
    }

    #[test]
    fn test_import_matching_rules() {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();
        let fid = db.add_file("/proj/shape.py", 10, 1.0, false, pid).unwrap();
        db.ingest_entities(fid, &parsed(&[]), "").unwrap();

        assert_eq!(db.query_imports_matching(pid, "os").unwrap().len(), 1);
        assert_eq!(db.query_imports_matching(pid, "json").unwrap().len(), 1);
        assert!(db.query_imports_matching(pid, "sys").unwrap().is_empty());
    }

    #[test]
    fn test_search_content_finds_docstrings() {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();
        let fid = db.add_file("/proj/shape.py", 10, 1.0, false, pid).unwrap();
        let source = "class Shape(Base, Mixin):\n    def area(self, scale):\n        return 1\n\n\n\n\ndef build(cfg):\n    return Shape()\n";
        db.ingest_entities(fid, &parsed(&["area"]), source).unwrap();

        let hits = db.search_content(pid, "config", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity_name, "build");
        assert_eq!(hits[0].entity_type, EntityType::Function);

        let hits = db.search_content(pid, "area \"quoted", 5).unwrap();
        assert!(hits.is_empty());
        assert!(db.search_content(pid, "   ", 5).is_err());
    }

    #[test]
    fn test_slice_lines() {
        let src = "a\nb\nc\nd\n";
        assert_eq!(slice_lines(src, 2, 3), "b\nc");
        assert_eq!(slice_lines(src, 4, 9), "d");
    }
}
