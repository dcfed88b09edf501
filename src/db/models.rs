use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Declares a fieldless enum stored as a TEXT column.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s).ok_or_else(|| format!("unknown {}: {s}", stringify!($name)))
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                Self::parse(s).ok_or_else(|| {
                    FromSqlError::Other(format!("unknown {}: {s}", stringify!($name)).into())
                })
            }
        }
    };
}

text_enum!(
    /// Kind of a node on either end of a cross-reference or vector-index entry.
    EntityType {
        File => "file",
        Class => "class",
        Function => "function",
        Method => "method",
        Chunk => "chunk",
    }
);

text_enum!(ImportType {
    Direct => "direct",
    From => "from",
});

text_enum!(TargetType {
    Method => "method",
    Property => "property",
    Class => "class",
    Function => "function",
});

text_enum!(
    /// Which derived artifact a tree snapshot holds.
    SnapshotKind {
        Ast => "ast",
        Cst => "cst",
        Analysis => "analysis",
    }
);

text_enum!(WorkerKind {
    FileWatcher => "file_watcher",
    Vectorizer => "vectorizer",
    Repair => "repair",
});

#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: i64,
    pub root_path: String,
    pub name: String,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Active,
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub project_id: i64,
    pub path: String,
    pub original_path: Option<String>,
    pub version_dir: Option<String>,
    pub lines: i64,
    pub last_modified: f64,
    pub has_docstring: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn state(&self) -> FileState {
        if self.deleted {
            FileState::Deleted
        } else {
            FileState::Active
        }
    }

    /// Where the file is expected to live when active: the restore target if set, else `path`.
    pub fn check_path(&self) -> &str {
        self.original_path.as_deref().unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassRecord {
    pub id: i64,
    pub file_id: i64,
    pub file_path: String,
    pub name: String,
    pub line: i64,
    pub end_line: i64,
    pub docstring: Option<String>,
    pub bases: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionRecord {
    pub id: i64,
    pub file_id: i64,
    pub name: String,
    pub line: i64,
    pub end_line: i64,
    pub docstring: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodRecord {
    pub id: i64,
    pub class_id: i64,
    pub name: String,
    pub line: i64,
    pub end_line: i64,
    pub docstring: Option<String>,
    pub args: Vec<String>,
    pub is_abstract: bool,
    pub has_pass: bool,
    pub has_not_implemented: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportRecord {
    pub id: i64,
    pub file_id: i64,
    pub file_path: String,
    pub name: String,
    pub module: Option<String>,
    pub import_type: ImportType,
    pub line: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub id: i64,
    pub file_id: i64,
    pub file_path: String,
    pub line: i64,
    pub usage_type: String,
    pub target_type: TargetType,
    pub target_name: String,
    pub target_class: Option<String>,
    pub context: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrossReference {
    pub id: i64,
    pub file_id: i64,
    pub caller_type: EntityType,
    pub caller_id: i64,
    pub callee_type: EntityType,
    pub callee_id: i64,
}

/// Name and location of an entity, resolved against live files at query time.
#[derive(Debug, Clone, Serialize)]
pub struct EntityLocation {
    pub entity_type: EntityType,
    pub id: i64,
    pub name: String,
    pub owner: Option<String>,
    pub file_id: i64,
    pub file_path: String,
    pub line: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedEdge {
    pub reference: CrossReference,
    pub target: EntityLocation,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeSnapshot {
    pub id: i64,
    pub file_id: i64,
    pub project_id: i64,
    pub kind: SnapshotKind,
    pub payload: String,
    pub content_hash: String,
    pub source_mtime: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CodeChunk {
    pub id: i64,
    pub file_id: i64,
    pub project_id: i64,
    pub chunk_uuid: String,
    pub chunk_type: String,
    pub text: String,
    pub ordinal: i64,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<i64>,
    pub vector_id: Option<String>,
    pub embedding_model: Option<String>,
}

/// A chunk as produced by the indexer, before it has a row id.
#[derive(Debug, Clone)]
pub struct ChunkDraft {
    pub chunk_uuid: String,
    pub chunk_type: String,
    pub text: String,
    pub ordinal: i64,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorIndexEntry {
    pub project_id: i64,
    pub file_id: i64,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub vector_id: String,
    pub dim: i64,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerCycle {
    pub cycle_id: String,
    pub worker_kind: WorkerKind,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub files_total_at_start: i64,
    pub files_processed: i64,
    pub files_failed: i64,
    pub files_skipped: i64,
    pub total_processing_time: f64,
    pub average_processing_time: Option<f64>,
    pub last_updated: DateTime<Utc>,
}

impl WorkerCycle {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Additive counter increments applied by `update_cycle`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleDelta {
    pub processed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub processing_time: f64,
}

// ── Parse output consumed by ingestion ───────────────────────────────

/// Where a usage occurs; indexes refer to positions inside the owning `ParsedFile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageScope {
    Module,
    Class(usize),
    Function(usize),
    Method { class: usize, method: usize },
}

#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub lines: i64,
    pub docstring: Option<String>,
    pub classes: Vec<ParsedClass>,
    pub functions: Vec<ParsedFunction>,
    pub imports: Vec<ParsedImport>,
    pub usages: Vec<ParsedUsage>,
}

impl ParsedFile {
    pub fn has_docstring(&self) -> bool {
        self.docstring.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedClass {
    pub name: String,
    pub line: i64,
    pub end_line: i64,
    pub docstring: Option<String>,
    pub bases: Vec<String>,
    pub methods: Vec<ParsedMethod>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedMethod {
    pub name: String,
    pub line: i64,
    pub end_line: i64,
    pub docstring: Option<String>,
    pub args: Vec<String>,
    pub is_abstract: bool,
    pub has_pass: bool,
    pub has_not_implemented: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedFunction {
    pub name: String,
    pub line: i64,
    pub end_line: i64,
    pub docstring: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedImport {
    pub name: String,
    pub module: Option<String>,
    pub import_type: ImportType,
    pub line: i64,
}

#[derive(Debug, Clone)]
pub struct ParsedUsage {
    pub line: i64,
    pub usage_type: String,
    pub target_type: TargetType,
    pub target_name: String,
    pub target_class: Option<String>,
    pub context: String,
    pub scope: UsageScope,
}

/// Row ids assigned while ingesting a `ParsedFile`, positionally aligned with it.
#[derive(Debug, Clone, Default)]
pub struct IngestedIds {
    pub classes: Vec<i64>,
    pub methods: Vec<Vec<i64>>,
    pub functions: Vec<i64>,
}

impl IngestedIds {
    /// Caller entity for a usage scope; module-level usages are attributed to the file.
    pub fn caller(&self, file_id: i64, scope: UsageScope) -> (EntityType, i64) {
        match scope {
            UsageScope::Module => (EntityType::File, file_id),
            UsageScope::Class(c) => self
                .classes
                .get(c)
                .map(|id| (EntityType::Class, *id))
                .unwrap_or((EntityType::File, file_id)),
            UsageScope::Function(f) => self
                .functions
                .get(f)
                .map(|id| (EntityType::Function, *id))
                .unwrap_or((EntityType::File, file_id)),
            UsageScope::Method { class, method } => self
                .methods
                .get(class)
                .and_then(|m| m.get(method))
                .map(|id| (EntityType::Method, *id))
                .unwrap_or((EntityType::File, file_id)),
        }
    }
}
