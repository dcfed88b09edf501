//! Request/response boundary over the engine.
//!
//! Every command resolves a [`ProjectRef`], runs to completion and returns a
//! [`CommandResponse`]; failures become `success: false` with a stable error code.
use crate::config::Config;
use crate::db::SharedDb;
use crate::db::models::{EntityType, TargetType, WorkerKind};
use crate::embedder::Embedder;
use crate::error::{ErrorCode, ItemError, Result, StoreError};
use crate::graph;
use crate::indexer::Indexer;
use crate::lifecycle::LifecycleManager;
use crate::parser::python::PythonParser;
use crate::paths::canonical_root;
use crate::repair::RepairCoordinator;
use crate::staleness::StalenessOracle;
use crate::workers::WorkerController;
use crate::workers::vectorizer::Vectorizer;
use serde::Serialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// A project given either by id or by root path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectRef {
    Id(i64),
    Root(String),
}

impl ProjectRef {
    /// An all-digit string is an id; anything else is a root path.
    pub fn parse(s: &str) -> Self {
        match s.trim().parse::<i64>() {
            Ok(id) => ProjectRef::Id(id),
            Err(_) => ProjectRef::Root(s.to_string()),
        }
    }
}

impl From<i64> for ProjectRef {
    fn from(id: i64) -> Self {
        ProjectRef::Id(id)
    }
}

impl From<&Path> for ProjectRef {
    fn from(path: &Path) -> Self {
        ProjectRef::Root(path.to_string_lossy().to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>, payload: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(err: &StoreError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            payload: None,
            error: Some(ErrorBody {
                code: err.code(),
                message: err.to_string(),
            }),
        }
    }

    /// A batch that finished but had failing items; the payload is still returned.
    pub fn partial(message: impl Into<String>, payload: Value, errors: &[ItemError]) -> Self {
        let message = message.into();
        Self {
            success: false,
            payload: Some(payload),
            error: Some(ErrorBody {
                code: ErrorCode::PartialFailure,
                message: format!("{} item(s) failed", errors.len()),
            }),
            message,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

fn respond<T: Serialize>(result: Result<T>, message: impl FnOnce(&T) -> String) -> CommandResponse {
    match result.and_then(|value| {
        let message = message(&value);
        Ok((message, serde_json::to_value(&value)?))
    }) {
        Ok((message, payload)) => CommandResponse::ok(message, payload),
        Err(e) => {
            error!("Command failed: {e}");
            CommandResponse::failure(&e)
        }
    }
}

fn respond_batch<T: Serialize>(
    result: Result<T>,
    message: impl FnOnce(&T) -> String,
    errors: impl FnOnce(&T) -> &[ItemError],
) -> CommandResponse {
    match result {
        Ok(value) => {
            let message = message(&value);
            let failed = errors(&value).to_vec();
            match serde_json::to_value(&value) {
                Ok(payload) if failed.is_empty() => CommandResponse::ok(message, payload),
                Ok(payload) => CommandResponse::partial(message, payload, &failed),
                Err(e) => CommandResponse::failure(&e.into()),
            }
        }
        Err(e) => {
            error!("Command failed: {e}");
            CommandResponse::failure(&e)
        }
    }
}

fn parse_target_type(s: Option<&str>) -> Result<Option<TargetType>> {
    s.map(|s| {
        TargetType::parse(s).ok_or_else(|| {
            StoreError::InvalidInput(format!(
                "unknown target type {s:?}; expected method, property, class or function"
            ))
        })
    })
    .transpose()
}

pub struct Commands {
    db: SharedDb,
    config: Arc<Config>,
    indexer: Arc<Indexer>,
    lifecycle: LifecycleManager,
    embedder: Arc<dyn Embedder>,
    controller: Option<Arc<dyn WorkerController>>,
}

impl Commands {
    pub fn new(db: SharedDb, config: Arc<Config>, embedder: Arc<dyn Embedder>) -> anyhow::Result<Self> {
        let lifecycle = LifecycleManager::new(&config.version_root);
        let indexer = Indexer::new(
            db.clone(),
            Arc::new(PythonParser::new(config.parser.max_tree_depth)),
            StalenessOracle::new(config.staleness.analysis_tolerance_secs),
            config.ignore_set()?,
            config.parser.max_tree_depth,
        )
        .exclude_dir(lifecycle.version_root());
        Ok(Self {
            db,
            config,
            indexer: Arc::new(indexer),
            lifecycle,
            embedder,
            controller: None,
        })
    }

    /// Workers the repair command pauses while it runs.
    pub fn with_controller(mut self, controller: Arc<dyn WorkerController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn db(&self) -> &SharedDb {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn indexer(&self) -> Arc<Indexer> {
        self.indexer.clone()
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        self.embedder.clone()
    }

    /// Ids must exist; root paths are canonicalized and registered on first use.
    pub async fn resolve_project(&self, project: &ProjectRef) -> Result<(i64, PathBuf)> {
        let mut db = self.db.lock().await;
        let project = match project {
            ProjectRef::Id(id) => db.get_project(*id)?,
            ProjectRef::Root(root) => {
                let root = canonical_root(Path::new(root));
                let id = db.get_or_create_project(&root.to_string_lossy(), None)?;
                db.get_project(id)?
            }
        };
        Ok((project.id, PathBuf::from(project.root_path)))
    }

    pub async fn index(&self, project: &ProjectRef, force: bool) -> CommandResponse {
        let result = async {
            let (_, root) = self.resolve_project(project).await?;
            self.indexer.index_project(&root, force, None).await
        }
        .await;
        respond_batch(
            result,
            |r| {
                format!(
                    "Indexed {} file(s), skipped {}, failed {} in {:.2}s",
                    r.indexed, r.skipped, r.failed, r.elapsed_secs
                )
            },
            |r| &r.errors,
        )
    }

    pub async fn index_file(&self, project: &ProjectRef, path: &str, force: bool) -> CommandResponse {
        let result = async {
            let (project_id, _) = self.resolve_project(project).await?;
            let outcome = self.indexer.index_file(project_id, Path::new(path), force).await?;
            Ok::<_, StoreError>(match outcome {
                crate::indexer::FileOutcome::Indexed { file_id, added } => {
                    json!({"file_id": file_id, "indexed": true, "added": added})
                }
                crate::indexer::FileOutcome::Skipped { file_id } => {
                    json!({"file_id": file_id, "indexed": false, "added": false})
                }
            })
        }
        .await;
        respond(result, |_| format!("Processed {path}"))
    }

    pub async fn repair(&self, project: &ProjectRef, dry_run: bool) -> CommandResponse {
        let result = async {
            let (project_id, _) = self.resolve_project(project).await?;
            let mut coordinator = RepairCoordinator::new(
                self.db.clone(),
                self.lifecycle.clone(),
                self.config.stop_timeout(),
            );
            if let Some(controller) = &self.controller {
                coordinator = coordinator.with_controller(controller.clone());
            }
            coordinator.run_cycle(project_id, dry_run).await
        }
        .await;
        respond_batch(
            result,
            |r| {
                format!(
                    "Checked {} file(s): {} restored in project, {} marked deleted, {} rebuilt, {} unresolved",
                    r.counts.checked,
                    r.counts.restored_in_project,
                    r.counts.marked_deleted,
                    r.counts.restored_from_snapshot,
                    r.counts.unresolved
                )
            },
            |r| &r.errors,
        )
    }

    pub async fn collapse(&self, project: &ProjectRef, keep_latest: bool, dry_run: bool) -> CommandResponse {
        let result = async {
            let (project_id, _) = self.resolve_project(project).await?;
            let mut db = self.db.lock().await;
            self.lifecycle
                .collapse_versions(&mut db, project_id, keep_latest, dry_run)
        }
        .await;
        respond_batch(
            result,
            |r| format!("Kept {} path(s), removed {} version(s)", r.kept, r.deleted),
            |r| &r.errors,
        )
    }

    pub async fn soft_delete(&self, file_id: i64, dry_run: bool) -> CommandResponse {
        let mut db = self.db.lock().await;
        let result = self.lifecycle.soft_delete(&mut db, file_id, None, dry_run);
        respond(result, |r| format!("{:?} file {}", r.action, r.file_id))
    }

    pub async fn restore(&self, file_id: i64, dry_run: bool) -> CommandResponse {
        let mut db = self.db.lock().await;
        let result = self.lifecycle.restore(&mut db, file_id, dry_run);
        respond(result, |r| format!("{:?} file {}", r.action, r.file_id))
    }

    pub async fn hard_delete(&self, file_id: i64, dry_run: bool) -> CommandResponse {
        let mut db = self.db.lock().await;
        let result = self.lifecycle.hard_delete(&mut db, file_id, dry_run);
        respond(result, |r| format!("{:?} file {}", r.action, r.file_id))
    }

    pub async fn find_usages(
        &self,
        project: &ProjectRef,
        name: &str,
        target_type: Option<&str>,
        target_class: Option<&str>,
        file: Option<&str>,
    ) -> CommandResponse {
        let result = async {
            let target_type = parse_target_type(target_type)?;
            let (project_id, _) = self.resolve_project(project).await?;
            let db = self.db.lock().await;
            graph::find_usages(&db, project_id, name, target_type, target_class, file)
        }
        .await;
        respond(result, |r| {
            format!("{} usage(s) of {} in {} file(s)", r.total, r.name, r.files.len())
        })
    }

    pub async fn find_dependencies(
        &self,
        project: &ProjectRef,
        name: &str,
        target_type: Option<&str>,
        target_class: Option<&str>,
    ) -> CommandResponse {
        let result = async {
            let target_type = parse_target_type(target_type)?;
            let (project_id, _) = self.resolve_project(project).await?;
            let db = self.db.lock().await;
            graph::find_dependencies(&db, project_id, name, target_type, target_class)
        }
        .await;
        respond(result, |hits| format!("{} dependency hit(s) for {name}", hits.len()))
    }

    pub async fn class_hierarchy(
        &self,
        project: &ProjectRef,
        class_name: Option<&str>,
        file: Option<&str>,
    ) -> CommandResponse {
        let result = async {
            let (project_id, _) = self.resolve_project(project).await?;
            let db = self.db.lock().await;
            graph::get_class_hierarchy(
                &db,
                project_id,
                class_name,
                file,
                self.config.graph.max_hierarchy_depth,
            )
        }
        .await;
        respond(result, |r| {
            format!("{} root(s) over {} class(es)", r.roots.len(), r.classes_in_scope)
        })
    }

    /// Resolved cross-reference edges of one entity: outgoing when `outgoing`, else incoming.
    pub async fn cross_references(&self, entity_type: &str, entity_id: i64, outgoing: bool) -> CommandResponse {
        let result = async {
            let entity_type = EntityType::parse(entity_type)
                .ok_or_else(|| StoreError::InvalidInput(format!("unknown entity type {entity_type:?}")))?;
            let db = self.db.lock().await;
            if outgoing {
                db.get_dependencies_by_caller(entity_type, entity_id)
            } else {
                db.get_dependents_by_callee(entity_type, entity_id)
            }
        }
        .await;
        respond(result, |edges| format!("{} edge(s)", edges.len()))
    }

    pub async fn search(&self, project: &ProjectRef, query: &str, limit: usize) -> CommandResponse {
        let result = async {
            let (project_id, _) = self.resolve_project(project).await?;
            let db = self.db.lock().await;
            db.search_content(project_id, query, limit.max(1))
        }
        .await;
        respond(result, |hits| format!("{} match(es)", hits.len()))
    }

    /// Embeds one batch of pending chunks for the project.
    pub async fn vectorize(&self, project: &ProjectRef) -> CommandResponse {
        let result = async {
            let (project_id, _) = self.resolve_project(project).await?;
            Vectorizer::new(
                self.db.clone(),
                self.embedder.clone(),
                self.config.workers.batch_size,
                self.config.poll_interval(),
            )
            .for_project(project_id)
            .run_pass(&CancellationToken::new())
            .await
        }
        .await;
        respond_batch(
            result,
            |p| format!("Embedded {} chunk(s), {} failed", p.embedded, p.failed),
            |p| &p.errors,
        )
    }

    pub async fn status(&self, project: &ProjectRef) -> CommandResponse {
        let result = async {
            let (project_id, _) = self.resolve_project(project).await?;
            let db = self.db.lock().await;
            let project = db.get_project(project_id)?;
            let counts = db.entity_counts(project_id)?;
            let mut workers = serde_json::Map::new();
            for kind in WorkerKind::ALL {
                workers.insert(
                    kind.to_string(),
                    serde_json::to_value(db.get_current(*kind)?)?,
                );
            }
            Ok::<_, StoreError>(json!({
                "project": project,
                "counts": counts,
                "workers": workers,
            }))
        }
        .await;
        respond(result, |_| "Status".to_string())
    }
}
