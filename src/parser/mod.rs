//! Owned syntax trees and the parser seam.
//!
//! A [`SyntaxTree`] is an arena of named nodes copied out of the concrete parser so it
//! can be stored as a snapshot, sent across threads and walked without the source
//! grammar. Traversal is always iterative and depth-capped.
pub mod extract;
pub mod python;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntaxNode {
    pub kind: String,
    /// 1-based first line.
    pub line: i64,
    pub end_line: i64,
    pub column: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeId>,
    /// Named-field children, in source order. A field name may repeat.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<(String, NodeId)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyntaxTree {
    pub language: String,
    pub nodes: Vec<SyntaxNode>,
    pub line_count: i64,
    /// Set when the converter dropped subtrees below its depth cap.
    pub truncated: bool,
}

/// Node statistics stored as the `analysis` snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeStatistics {
    pub node_count: usize,
    pub max_depth: usize,
    pub line_count: i64,
    pub kind_counts: BTreeMap<String, usize>,
    pub truncated: bool,
}

const TOP_KINDS: usize = 20;

impl SyntaxTree {
    pub fn root(&self) -> Option<NodeId> {
        if self.nodes.is_empty() { None } else { Some(0) }
    }

    pub fn node(&self, id: NodeId) -> Option<&SyntaxNode> {
        self.nodes.get(id)
    }

    pub fn kind(&self, id: NodeId) -> &str {
        self.nodes.get(id).map(|n| n.kind.as_str()).unwrap_or("")
    }

    pub fn text(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(id).and_then(|n| n.text.as_deref())
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes.get(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// First child stored under field `name`.
    pub fn field(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.nodes
            .get(id)?
            .fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, child)| *child)
    }

    /// Every child stored under field `name`.
    pub fn field_list(&self, id: NodeId, name: &str) -> Vec<NodeId> {
        self.nodes
            .get(id)
            .map(|n| {
                n.fields
                    .iter()
                    .filter(|(field, _)| field == name)
                    .map(|(_, child)| *child)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pre-order depth-first walk from the root. Subtrees deeper than `max_depth`
    /// are skipped; the return value reports whether anything was skipped.
    pub fn walk<F>(&self, max_depth: usize, mut visit: F) -> bool
    where
        F: FnMut(NodeId, usize),
    {
        let Some(root) = self.root() else {
            return false;
        };
        let mut truncated = false;
        let mut stack = vec![(root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            if depth > max_depth {
                truncated = true;
                continue;
            }
            visit(id, depth);
            for child in self.children(id).iter().rev() {
                stack.push((*child, depth + 1));
            }
        }
        truncated
    }

    /// Finds the class or function definition called `name` that starts on `line`.
    pub fn find_declaration(&self, name: &str, line: i64) -> Option<NodeId> {
        let mut found = None;
        self.walk(usize::MAX, |id, _| {
            if found.is_some() {
                return;
            }
            let Some(node) = self.node(id) else {
                return;
            };
            if node.line != line
                || !matches!(node.kind.as_str(), "class_definition" | "function_definition")
            {
                return;
            }
            if self.field(id, "name").and_then(|n| self.text(n)) == Some(name) {
                found = Some(id);
            }
        });
        found
    }

    pub fn statistics(&self, max_depth: usize) -> TreeStatistics {
        let mut stats = TreeStatistics {
            line_count: self.line_count,
            ..Default::default()
        };
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        let skipped = self.walk(max_depth, |id, depth| {
            stats.node_count += 1;
            stats.max_depth = stats.max_depth.max(depth);
            *counts.entry(self.kind(id).to_string()).or_default() += 1;
        });
        stats.truncated = self.truncated || skipped;

        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        stats.kind_counts = ranked.into_iter().take(TOP_KINDS).collect();
        stats
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Turns source text into a [`SyntaxTree`].
pub trait SourceParser: Send + Sync {
    fn language(&self) -> &'static str;

    /// File extensions (without the dot) this parser accepts.
    fn extensions(&self) -> &'static [&'static str];

    fn parse(&self, source: &str) -> Result<SyntaxTree>;

    fn accepts(&self, path: &std::path::Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions().contains(&ext))
    }
}
