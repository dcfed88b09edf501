use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codeatlas::commands::{CommandResponse, Commands, ProjectRef};
use codeatlas::config::{Config, DEFAULT_CONFIG_FILE};
use codeatlas::db::Db;
use codeatlas::embedder::Embedder;
use codeatlas::embedder::mock::MockEmbedder;
use codeatlas::mcp::server::{McpContext, McpServer};
use codeatlas::workers::Supervisor;
use codeatlas::workers::vectorizer::Vectorizer;
use codeatlas::workers::watcher::FileWatcher;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "codeatlas", version, about = "Structural code index with lifecycle and repair")]
struct Cli {
    /// Config file (JSON)
    #[arg(long, short, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Override the database path from the config
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index a project tree, or a single file of it
    Index {
        root: PathBuf,
        #[arg(long)]
        file: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Keep a project indexed and embedded until interrupted
    Watch { root: PathBuf },
    /// Reconcile file records with the project and archive trees
    Repair {
        project: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Keep one record per path, hard-deleting other versions
    Collapse {
        project: String,
        /// Keep the oldest version instead of the newest
        #[arg(long)]
        keep_oldest: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Soft-delete, restore or hard-delete a file record
    File {
        file_id: i64,
        #[arg(value_parser = ["soft-delete", "restore", "hard-delete"])]
        action: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Usages of a name
    Usages {
        project: String,
        name: String,
        #[arg(long = "type")]
        target_type: Option<String>,
        #[arg(long)]
        class: Option<String>,
        #[arg(long)]
        file: Option<String>,
    },
    /// Usages plus imports depending on a name
    Deps {
        project: String,
        name: String,
        #[arg(long = "type")]
        target_type: Option<String>,
        #[arg(long)]
        class: Option<String>,
    },
    /// Class inheritance tree
    Hierarchy {
        project: String,
        class: Option<String>,
        #[arg(long)]
        file: Option<String>,
    },
    /// Full-text search over indexed source
    Search {
        project: String,
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Embed one batch of pending chunks
    Vectorize { project: String },
    /// Entity counts and worker cycles
    Status { project: String },
    /// Serve the MCP tools on stdio
    Serve {
        /// Also watch and embed this project in the background
        #[arg(long)]
        watch: Option<PathBuf>,
    },
}

fn print(resp: &CommandResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(resp)?);
    Ok(())
}

/// Registers the file watcher and vectorizer for one project.
async fn spawn_workers(commands: &Commands, supervisor: &Supervisor, root: PathBuf) -> Result<()> {
    let (project_id, root) = commands
        .resolve_project(&ProjectRef::from(root.as_path()))
        .await
        .context("failed to resolve project")?;
    let config = commands.config().clone();

    let indexer = commands.indexer();
    let scan_interval = config.poll_interval();
    supervisor.spawn(
        "file_watcher",
        Arc::new(move |token| {
            let watcher = FileWatcher::new(indexer.clone(), project_id, root.clone(), scan_interval);
            tokio::spawn(watcher.run(token))
        }),
    );

    let db = commands.db().clone();
    let embedder = commands.embedder();
    supervisor.spawn(
        "vectorizer",
        Arc::new(move |token| {
            let vectorizer = Vectorizer::new(
                db.clone(),
                embedder.clone(),
                config.workers.batch_size,
                config.poll_interval(),
            )
            .for_project(project_id);
            tokio::spawn(vectorizer.run(token))
        }),
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // 1. Load config
    let mut config = Config::load(&cli.config)?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    config.validate().context("invalid configuration")?;
    let config = Arc::new(config);

    // 2. Init DB and embedder
    let db = Db::open(&config.db_path)
        .with_context(|| format!("failed to open database {}", config.db_path))?
        .into_shared();
    let embedder: Arc<dyn Embedder> = Arc::new(MockEmbedder::new(
        config.embedding.model.clone(),
        config.embedding.dimensions,
    ));

    // 3. Workers are registered here so repair can pause them
    let supervisor = Arc::new(Supervisor::new());
    let commands = Commands::new(db, config.clone(), embedder)?.with_controller(supervisor.clone());

    let resp = match cli.command {
        Command::Index { root, file, force } => {
            let project = ProjectRef::from(root.as_path());
            match file {
                Some(file) => commands.index_file(&project, &file, force).await,
                None => commands.index(&project, force).await,
            }
        }
        Command::Watch { root } => {
            spawn_workers(&commands, &supervisor, root).await?;
            info!("Watching; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
            supervisor.shutdown(config.stop_timeout()).await;
            return Ok(());
        }
        Command::Repair { project, dry_run } => commands.repair(&ProjectRef::parse(&project), dry_run).await,
        Command::Collapse {
            project,
            keep_oldest,
            dry_run,
        } => {
            commands
                .collapse(&ProjectRef::parse(&project), !keep_oldest, dry_run)
                .await
        }
        Command::File {
            file_id,
            action,
            dry_run,
        } => match action.as_str() {
            "soft-delete" => commands.soft_delete(file_id, dry_run).await,
            "restore" => commands.restore(file_id, dry_run).await,
            _ => commands.hard_delete(file_id, dry_run).await,
        },
        Command::Usages {
            project,
            name,
            target_type,
            class,
            file,
        } => {
            commands
                .find_usages(
                    &ProjectRef::parse(&project),
                    &name,
                    target_type.as_deref(),
                    class.as_deref(),
                    file.as_deref(),
                )
                .await
        }
        Command::Deps {
            project,
            name,
            target_type,
            class,
        } => {
            commands
                .find_dependencies(
                    &ProjectRef::parse(&project),
                    &name,
                    target_type.as_deref(),
                    class.as_deref(),
                )
                .await
        }
        Command::Hierarchy { project, class, file } => {
            commands
                .class_hierarchy(&ProjectRef::parse(&project), class.as_deref(), file.as_deref())
                .await
        }
        Command::Search { project, query, limit } => {
            commands.search(&ProjectRef::parse(&project), &query, limit).await
        }
        Command::Vectorize { project } => commands.vectorize(&ProjectRef::parse(&project)).await,
        Command::Status { project } => commands.status(&ProjectRef::parse(&project)).await,
        Command::Serve { watch } => {
            if let Some(root) = watch {
                spawn_workers(&commands, &supervisor, root).await?;
            }
            let server = McpServer::new(McpContext {
                commands: Arc::new(commands),
            });
            server.start().await?;
            supervisor.shutdown(config.stop_timeout()).await;
            return Ok(());
        }
    };

    print(&resp)?;
    if !resp.success {
        std::process::exit(1);
    }
    Ok(())
}
