use super::{NodeId, SourceParser, SyntaxNode, SyntaxTree};
use crate::error::{Result, StoreError};
use tracing::debug;
use tree_sitter::Parser;

/// Nodes whose text is kept even though they have named children. Strings are also
/// opaque: their inner pieces are not converted.
const TEXT_KINDS: &[&str] = &["string", "dotted_name", "attribute", "relative_import"];
const OPAQUE_KINDS: &[&str] = &["string", "comment"];

/// tree-sitter-python adapter producing an owned [`SyntaxTree`].
#[derive(Debug, Clone)]
pub struct PythonParser {
    max_depth: usize,
}

impl Default for PythonParser {
    fn default() -> Self {
        Self::new(512)
    }
}

impl PythonParser {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
        }
    }
}

impl SourceParser for PythonParser {
    fn language(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py", "pyi"]
    }

    fn parse(&self, source: &str) -> Result<SyntaxTree> {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .map_err(|e| StoreError::Parse(e.to_string()))?;
        let tree = parser
            .parse(source, None)
            .ok_or_else(|| StoreError::Parse("parser produced no tree".into()))?;
        if tree.root_node().has_error() {
            debug!("Source contains syntax errors; keeping the partial tree");
        }
        Ok(convert(&tree, source, self.max_depth))
    }
}

fn convert(tree: &tree_sitter::Tree, source: &str, max_depth: usize) -> SyntaxTree {
    let bytes = source.as_bytes();
    let mut out = SyntaxTree {
        language: "python".into(),
        nodes: Vec::new(),
        line_count: source.lines().count() as i64,
        truncated: false,
    };

    let mut cursor = tree.walk();
    // Arena ids of the kept ancestors of the cursor position.
    let mut parents: Vec<NodeId> = Vec::new();

    loop {
        let node = cursor.node();
        let mut descended = false;

        if node.is_named() {
            if parents.len() >= max_depth {
                out.truncated = true;
            } else {
                let id = out.nodes.len();
                let kind = node.kind();
                let opaque = OPAQUE_KINDS.contains(&kind);
                let is_leaf = node.named_child_count() == 0 || opaque;
                let text = if is_leaf || TEXT_KINDS.contains(&kind) {
                    node.utf8_text(bytes).ok().map(str::to_string)
                } else {
                    None
                };
                let parent = parents.last().copied();
                out.nodes.push(SyntaxNode {
                    kind: kind.to_string(),
                    line: node.start_position().row as i64 + 1,
                    end_line: node.end_position().row as i64 + 1,
                    column: node.start_position().column as i64,
                    text,
                    children: Vec::new(),
                    fields: Vec::new(),
                    parent,
                });
                if let Some(parent) = parent {
                    out.nodes[parent].children.push(id);
                    if let Some(field) = cursor.field_name() {
                        out.nodes[parent].fields.push((field.to_string(), id));
                    }
                }
                if !is_leaf && cursor.goto_first_child() {
                    parents.push(id);
                    descended = true;
                }
            }
        }

        if descended {
            continue;
        }

        // Advance to the next sibling, climbing out of finished subtrees.
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return out;
            }
            parents.pop();
        }
    }
}
