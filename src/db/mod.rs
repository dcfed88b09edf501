//! SQLite store: schema, connection setup and one `impl Db` module per concern.
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tracing::info;

use crate::error::{Result, StoreError};

pub mod chunks;
pub mod entities;
pub mod files;
pub mod ingest;
pub mod models;
pub mod projects;
pub mod snapshots;
pub mod worker_stats;
pub mod xref;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    root_path TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    comment TEXT,
    created_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    path TEXT NOT NULL,
    original_path TEXT,
    version_dir TEXT,
    lines INTEGER NOT NULL DEFAULT 0,
    last_modified REAL NOT NULL,
    has_docstring INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_files_project_path ON files(project_id, path);
CREATE INDEX IF NOT EXISTS idx_files_project_deleted ON files(project_id, deleted);

CREATE TABLE IF NOT EXISTS classes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    docstring TEXT,
    UNIQUE(file_id, name, line),
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_classes_name ON classes(name);

CREATE TABLE IF NOT EXISTS class_bases (
    class_id INTEGER NOT NULL,
    ordinal INTEGER NOT NULL,
    name TEXT NOT NULL,
    PRIMARY KEY (class_id, ordinal),
    FOREIGN KEY (class_id) REFERENCES classes(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_class_bases_name ON class_bases(name);

CREATE TABLE IF NOT EXISTS methods (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    class_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    docstring TEXT,
    is_abstract INTEGER NOT NULL DEFAULT 0,
    has_pass INTEGER NOT NULL DEFAULT 0,
    has_not_implemented INTEGER NOT NULL DEFAULT 0,
    UNIQUE(class_id, name, line),
    FOREIGN KEY (class_id) REFERENCES classes(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_methods_name ON methods(name);

CREATE TABLE IF NOT EXISTS method_args (
    method_id INTEGER NOT NULL,
    ordinal INTEGER NOT NULL,
    name TEXT NOT NULL,
    PRIMARY KEY (method_id, ordinal),
    FOREIGN KEY (method_id) REFERENCES methods(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS functions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    docstring TEXT,
    UNIQUE(file_id, name, line),
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_functions_name ON functions(name);

CREATE TABLE IF NOT EXISTS function_args (
    function_id INTEGER NOT NULL,
    ordinal INTEGER NOT NULL,
    name TEXT NOT NULL,
    PRIMARY KEY (function_id, ordinal),
    FOREIGN KEY (function_id) REFERENCES functions(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS imports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    module TEXT,
    import_type TEXT NOT NULL CHECK(import_type IN ('direct', 'from')),
    line INTEGER NOT NULL,
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_imports_file ON imports(file_id);
CREATE INDEX IF NOT EXISTS idx_imports_name ON imports(name);
CREATE INDEX IF NOT EXISTS idx_imports_module ON imports(module);

CREATE TABLE IF NOT EXISTS usages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    line INTEGER NOT NULL,
    usage_type TEXT NOT NULL,
    target_type TEXT NOT NULL CHECK(target_type IN ('method', 'property', 'class', 'function')),
    target_name TEXT NOT NULL,
    target_class TEXT,
    context TEXT NOT NULL,
    caller_type TEXT NOT NULL,
    caller_id INTEGER NOT NULL,
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_usages_file ON usages(file_id);
CREATE INDEX IF NOT EXISTS idx_usages_target ON usages(target_name);

CREATE TABLE IF NOT EXISTS cross_references (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    caller_type TEXT NOT NULL,
    caller_id INTEGER NOT NULL,
    callee_type TEXT NOT NULL,
    callee_id INTEGER NOT NULL,
    UNIQUE(file_id, caller_type, caller_id, callee_type, callee_id),
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_xref_caller ON cross_references(caller_type, caller_id);
CREATE INDEX IF NOT EXISTS idx_xref_callee ON cross_references(callee_type, callee_id);

CREATE TABLE IF NOT EXISTS code_content (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    entity_name TEXT NOT NULL,
    content TEXT NOT NULL,
    docstring TEXT,
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_code_content_file ON code_content(file_id);

CREATE VIRTUAL TABLE IF NOT EXISTS code_content_fts USING fts5(
    entity_name,
    content,
    docstring
);

CREATE TABLE IF NOT EXISTS tree_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    project_id INTEGER NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('ast', 'cst', 'analysis')),
    payload TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    source_mtime REAL NOT NULL,
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    UNIQUE(file_id, kind, content_hash),
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_snapshots_file_kind ON tree_snapshots(file_id, kind);

CREATE TABLE IF NOT EXISTS code_chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    project_id INTEGER NOT NULL,
    chunk_uuid TEXT NOT NULL UNIQUE,
    chunk_type TEXT NOT NULL,
    text TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    entity_type TEXT,
    entity_id INTEGER,
    vector_id TEXT,
    embedding_model TEXT,
    embed_attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt_at DATETIME,
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chunks_file ON code_chunks(file_id);
CREATE INDEX IF NOT EXISTS idx_chunks_pending ON code_chunks(project_id, vector_id);

CREATE TABLE IF NOT EXISTS vector_index (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    file_id INTEGER NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    vector_id TEXT NOT NULL,
    dim INTEGER NOT NULL,
    model TEXT NOT NULL,
    created_at DATETIME NOT NULL,
    UNIQUE(project_id, entity_type, entity_id),
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_vector_index_file ON vector_index(file_id);

CREATE TABLE IF NOT EXISTS worker_cycles (
    cycle_id TEXT PRIMARY KEY,
    worker_kind TEXT NOT NULL,
    start_time DATETIME NOT NULL,
    end_time DATETIME,
    files_total_at_start INTEGER NOT NULL DEFAULT 0,
    files_processed INTEGER NOT NULL DEFAULT 0,
    files_failed INTEGER NOT NULL DEFAULT 0,
    files_skipped INTEGER NOT NULL DEFAULT 0,
    total_processing_time REAL NOT NULL DEFAULT 0,
    average_processing_time REAL,
    last_updated DATETIME NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_worker_cycles_kind ON worker_cycles(worker_kind, end_time);
"#;

/// Tables holding rows owned (directly or transitively) by a file, paired with the
/// subquery that selects that file's rows. Used by `clear_file_data` and its tests.
pub(crate) const FILE_OWNED_TABLES: &[(&str, &str)] = &[
    ("cross_references", "file_id = ?1"),
    (
        "code_content_fts",
        "rowid IN (SELECT id FROM code_content WHERE file_id = ?1)",
    ),
    ("code_content", "file_id = ?1"),
    (
        "method_args",
        "method_id IN (SELECT m.id FROM methods m JOIN classes c ON m.class_id = c.id WHERE c.file_id = ?1)",
    ),
    (
        "methods",
        "class_id IN (SELECT id FROM classes WHERE file_id = ?1)",
    ),
    (
        "class_bases",
        "class_id IN (SELECT id FROM classes WHERE file_id = ?1)",
    ),
    ("classes", "file_id = ?1"),
    (
        "function_args",
        "function_id IN (SELECT id FROM functions WHERE file_id = ?1)",
    ),
    ("functions", "file_id = ?1"),
    ("imports", "file_id = ?1"),
    ("usages", "file_id = ?1"),
    ("tree_snapshots", "file_id = ?1"),
    ("vector_index", "file_id = ?1"),
    ("code_chunks", "file_id = ?1"),
];

/// Shared handle used by every worker; the mutex is the in-process write guard.
pub type SharedDb = Arc<TokioMutex<Db>>;

/// A SQLite connection initialized with the index schema.
pub struct Db {
    pub(crate) conn: Connection,
}

impl Db {
    /// Open a database at the given path, creating parent directories and the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Initializing database: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    /// Open an in-memory database connection (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // Other processes may hold the write lock briefly.
        conn.busy_timeout(Duration::from_millis(5000))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!("Database initialized successfully");
        Ok(Self { conn })
    }

    pub fn into_shared(self) -> SharedDb {
        Arc::new(TokioMutex::new(self))
    }

    /// Begins a write transaction that takes the SQLite write lock up front, so a
    /// read-then-write sequence cannot interleave with another writer.
    pub(crate) fn immediate(&mut self) -> Result<Transaction<'_>> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    /// Number of rows each owned table holds for `file_id`.
    pub fn owned_row_counts(&self, file_id: i64) -> Result<Vec<(&'static str, i64)>> {
        let mut counts = Vec::with_capacity(FILE_OWNED_TABLES.len());
        for (table, predicate) in FILE_OWNED_TABLES {
            let n: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE {predicate}"),
                [file_id],
                |row| row.get(0),
            )?;
            counts.push((*table, n));
        }
        Ok(counts)
    }
}

pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current modification time of a file as fractional Unix seconds.
pub fn file_mtime(path: &Path) -> Result<f64> {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| StoreError::io(path, e))?;
    let secs = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(secs)
}
