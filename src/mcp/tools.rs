/// MCP tool handlers. Each tool forwards to one [`Commands`] operation and returns
/// its response envelope as pretty JSON text.
use crate::commands::{CommandResponse, Commands, ProjectRef};
use crate::mcp::server::McpContext;
use rmcp::handler::server::ServerHandler;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{ErrorData as McpError, handler::server::tool::ToolRouter, model::*, tool, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;

// ── Parameter structs ────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct ProjectParam {
    /// Project id or project root path
    project: String,
}

#[derive(Deserialize, JsonSchema)]
struct IndexParams {
    /// Project id or project root path
    project: String,
    /// Single file to index instead of the whole project
    filepath: Option<String>,
    /// Force re-index even if unchanged (default: false)
    force: Option<bool>,
}

#[derive(Deserialize, JsonSchema)]
struct RepairParams {
    /// Project id or project root path
    project: String,
    /// Report without changing anything (default: false)
    dry_run: Option<bool>,
}

#[derive(Deserialize, JsonSchema)]
struct CollapseParams {
    /// Project id or project root path
    project: String,
    /// Keep the newest version of each path (default: true)
    keep_latest: Option<bool>,
    dry_run: Option<bool>,
}

#[derive(Deserialize, JsonSchema)]
struct FileLifecycleParams {
    /// File row id
    file_id: i64,
    /// Action: soft_delete | restore | hard_delete
    action: String,
    dry_run: Option<bool>,
}

#[derive(Deserialize, JsonSchema)]
struct UsageParams {
    /// Project id or project root path
    project: String,
    /// Exact, case-sensitive target name
    name: String,
    /// Target type: method | property | class | function
    target_type: Option<String>,
    /// Owning class of a method or property
    target_class: Option<String>,
    /// Restrict to one file path
    file: Option<String>,
}

#[derive(Deserialize, JsonSchema)]
struct HierarchyParams {
    /// Project id or project root path
    project: String,
    /// Class to center the tree on (whole forest if omitted)
    class_name: Option<String>,
    /// Restrict to classes of one file path
    file: Option<String>,
}

#[derive(Deserialize, JsonSchema)]
struct XrefParams {
    /// Entity type: file | class | function | method
    entity_type: String,
    entity_id: i64,
    /// Direction: outgoing | incoming (default: outgoing)
    direction: Option<String>,
}

#[derive(Deserialize, JsonSchema)]
struct SearchParams {
    /// Project id or project root path
    project: String,
    /// Full-text query over entity source and docstrings
    query: String,
    /// Max results (default: 10)
    limit: Option<usize>,
}

// ── Response helpers ─────────────────────────────────────────────────

fn envelope(resp: CommandResponse) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(&resp).unwrap_or_default();
    if resp.success {
        Ok(CallToolResult::success(vec![Content::text(text)]))
    } else {
        Ok(CallToolResult::error(vec![Content::text(text)]))
    }
}

fn error_result(msg: &str) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(msg.to_string())]))
}

// ── Tool implementations ─────────────────────────────────────────────

#[derive(Clone)]
pub struct AppTools {
    pub ctx: McpContext,
    pub tool_router: ToolRouter<Self>,
}

impl ServerHandler for AppTools {}

#[tool_router]
impl AppTools {
    pub fn new(ctx: McpContext) -> Self {
        Self {
            ctx,
            tool_router: Self::tool_router(),
        }
    }

    fn commands(&self) -> &Commands {
        &self.ctx.commands
    }

    #[tool(description = "Index a project (or one file of it). Unchanged files are skipped unless force is set.")]
    async fn index(&self, params: Parameters<IndexParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let project = ProjectRef::parse(&p.project);
        let force = p.force.unwrap_or(false);
        let resp = match p.filepath {
            Some(path) => self.commands().index_file(&project, &path, force).await,
            None => self.commands().index(&project, force).await,
        };
        envelope(resp)
    }

    #[tool(description = "Reconcile file records with the project tree and the archive. Pauses background workers while it runs.")]
    async fn repair(&self, params: Parameters<RepairParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        envelope(
            self.commands()
                .repair(&ProjectRef::parse(&p.project), p.dry_run.unwrap_or(false))
                .await,
        )
    }

    #[tool(description = "Keep one file record per path and hard-delete the other versions.")]
    async fn collapse_versions(&self, params: Parameters<CollapseParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        envelope(
            self.commands()
                .collapse(
                    &ProjectRef::parse(&p.project),
                    p.keep_latest.unwrap_or(true),
                    p.dry_run.unwrap_or(false),
                )
                .await,
        )
    }

    #[tool(description = "Soft-delete, restore or hard-delete one file record.")]
    async fn file_lifecycle(&self, params: Parameters<FileLifecycleParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let dry_run = p.dry_run.unwrap_or(false);
        let resp = match p.action.as_str() {
            "soft_delete" => self.commands().soft_delete(p.file_id, dry_run).await,
            "restore" => self.commands().restore(p.file_id, dry_run).await,
            "hard_delete" => self.commands().hard_delete(p.file_id, dry_run).await,
            other => return error_result(&format!("unknown action: {other}")),
        };
        envelope(resp)
    }

    #[tool(description = "Find usages of a name, grouped by file and ordered by line.")]
    async fn find_usages(&self, params: Parameters<UsageParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        envelope(
            self.commands()
                .find_usages(
                    &ProjectRef::parse(&p.project),
                    &p.name,
                    p.target_type.as_deref(),
                    p.target_class.as_deref(),
                    p.file.as_deref(),
                )
                .await,
        )
    }

    #[tool(description = "Find everything depending on a name: usages plus imports mentioning it.")]
    async fn find_dependencies(&self, params: Parameters<UsageParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        envelope(
            self.commands()
                .find_dependencies(
                    &ProjectRef::parse(&p.project),
                    &p.name,
                    p.target_type.as_deref(),
                    p.target_class.as_deref(),
                )
                .await,
        )
    }

    #[tool(description = "Class inheritance tree around one class, or the whole forest.")]
    async fn class_hierarchy(&self, params: Parameters<HierarchyParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        envelope(
            self.commands()
                .class_hierarchy(
                    &ProjectRef::parse(&p.project),
                    p.class_name.as_deref(),
                    p.file.as_deref(),
                )
                .await,
        )
    }

    #[tool(description = "Resolved call and inheritance edges of one entity.")]
    async fn cross_references(&self, params: Parameters<XrefParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let outgoing = match p.direction.as_deref().unwrap_or("outgoing") {
            "outgoing" => true,
            "incoming" => false,
            other => return error_result(&format!("unknown direction: {other}")),
        };
        envelope(
            self.commands()
                .cross_references(&p.entity_type, p.entity_id, outgoing)
                .await,
        )
    }

    #[tool(description = "Full-text search over indexed source and docstrings.")]
    async fn search(&self, params: Parameters<SearchParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        if p.query.trim().is_empty() {
            return error_result("query is required");
        }
        envelope(
            self.commands()
                .search(&ProjectRef::parse(&p.project), &p.query, p.limit.unwrap_or(10))
                .await,
        )
    }

    #[tool(description = "Embed one batch of chunks that have no vector yet.")]
    async fn vectorize(&self, params: Parameters<ProjectParam>) -> Result<CallToolResult, McpError> {
        envelope(self.commands().vectorize(&ProjectRef::parse(&params.0.project)).await)
    }

    #[tool(description = "Entity counts and the latest cycle of each background worker.")]
    async fn status(&self, params: Parameters<ProjectParam>) -> Result<CallToolResult, McpError> {
        envelope(self.commands().status(&ProjectRef::parse(&params.0.project)).await)
    }
}
