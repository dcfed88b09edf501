//! # codeatlas: structural code index
//!
//! Keeps a queryable index of a source tree (files, classes, functions, methods,
//! imports, usages, cross-references, inheritance) correct while files are edited,
//! moved or deleted outside its control and while background workers share the store.
//!
//! ## Architecture
//!
//! - **[`db`]**: SQLite store, one `impl Db` block per concern
//! - **[`staleness`]**: snapshot freshness checks
//! - **[`lifecycle`]**: soft-delete, restore, hard-delete, version collapse
//! - **[`indexer`]**: ingestion pipeline and cross-reference planning
//! - **[`graph`]**: usage, dependency and class-hierarchy queries
//! - **[`repair`]**: reconciliation against the project and archive trees
//! - **[`workers`]**: supervised file watcher and vectorizer tasks
//! - **[`commands`]** / **[`mcp`]**: response envelope and MCP stdio tools

pub mod commands;
pub mod config;
pub mod db;
pub mod embedder;
pub mod error;
pub mod graph;
pub mod indexer;
pub mod lifecycle;
pub mod mcp;
pub mod parser;
pub mod paths;
pub mod repair;
pub mod staleness;
pub mod workers;
