/// Configuration loading, defaults and validation.
///
/// A missing file yields the defaults; a file that is not valid JSON is reported and
/// also yields the defaults. Every field has its own default so partial files work.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_CONFIG_FILE: &str = "codeatlas.json";

// ── Default value functions ──────────────────────────────────────────

fn default_db_path() -> String {
    "./codeatlas.db".to_string()
}

fn default_version_root() -> String {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("codeatlas")
        .join("versions")
        .to_string_lossy()
        .to_string()
}

fn default_analysis_tolerance() -> f64 {
    1.0
}

fn default_poll_interval() -> u64 {
    30
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_batch_size() -> usize {
    64
}

fn default_max_hierarchy_depth() -> usize {
    32
}

fn default_max_tree_depth() -> usize {
    512
}

fn default_ignore_patterns() -> Vec<String> {
    vec![
        "**/.git/**".to_string(),
        "**/__pycache__/**".to_string(),
        "**/.venv/**".to_string(),
        "**/node_modules/**".to_string(),
    ]
}

fn default_model_name() -> String {
    "mock-embedder".to_string()
}

fn default_dimensions() -> usize {
    384
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Root of the per-project archive trees for soft-deleted files.
    #[serde(default = "default_version_root")]
    pub version_root: String,

    #[serde(default)]
    pub staleness: StalenessConfig,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub graph: GraphConfig,

    #[serde(default)]
    pub parser: ParserConfig,

    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,

    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StalenessConfig {
    /// Seconds of mtime jitter tolerated for analysis snapshots.
    #[serde(default = "default_analysis_tolerance")]
    pub analysis_tolerance_secs: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Bounded wait for a graceful stop before a worker is force-stopped.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GraphConfig {
    #[serde(default = "default_max_hierarchy_depth")]
    pub max_hierarchy_depth: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ParserConfig {
    #[serde(default = "default_max_tree_depth")]
    pub max_tree_depth: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_model_name")]
    pub model: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            version_root: default_version_root(),
            staleness: StalenessConfig::default(),
            workers: WorkerConfig::default(),
            graph: GraphConfig::default(),
            parser: ParserConfig::default(),
            ignore_patterns: default_ignore_patterns(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            analysis_tolerance_secs: default_analysis_tolerance(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            stop_timeout_secs: default_stop_timeout(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_hierarchy_depth: default_max_hierarchy_depth(),
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_tree_depth: default_max_tree_depth(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_model_name(),
            dimensions: default_dimensions(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file; an empty path means [`DEFAULT_CONFIG_FILE`].
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            DEFAULT_CONFIG_FILE
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");
        Ok(cfg)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.db_path.trim().is_empty(), "db_path must be set");
        anyhow::ensure!(
            !self.version_root.trim().is_empty(),
            "version_root must be set"
        );
        anyhow::ensure!(
            self.staleness.analysis_tolerance_secs >= 0.0,
            "staleness.analysis_tolerance_secs must not be negative"
        );
        anyhow::ensure!(
            self.workers.poll_interval_secs > 0,
            "workers.poll_interval_secs must be positive"
        );
        anyhow::ensure!(
            self.workers.batch_size > 0,
            "workers.batch_size must be positive"
        );
        anyhow::ensure!(
            self.graph.max_hierarchy_depth > 0,
            "graph.max_hierarchy_depth must be positive"
        );
        anyhow::ensure!(
            self.parser.max_tree_depth > 0,
            "parser.max_tree_depth must be positive"
        );
        anyhow::ensure!(
            self.embedding.dimensions > 0,
            "embedding.dimensions must be positive"
        );
        self.ignore_set()?;
        Ok(())
    }

    /// Compiles `ignore_patterns` into one matcher.
    pub fn ignore_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.ignore_patterns {
            let glob =
                Glob::new(pattern).with_context(|| format!("invalid ignore pattern: {pattern}"))?;
            builder.add(glob);
        }
        builder.build().context("failed to build ignore patterns")
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.workers.poll_interval_secs)
    }

    pub fn stop_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.workers.stop_timeout_secs)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
