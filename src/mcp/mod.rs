//! MCP stdio surface over [`crate::commands::Commands`].
pub mod server;
pub mod tools;
