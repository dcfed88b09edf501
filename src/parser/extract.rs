//! Entity extraction from a Python [`SyntaxTree`].
use super::{NodeId, SyntaxTree};
use crate::db::models::{
    ImportType, ParsedClass, ParsedFile, ParsedFunction, ParsedImport, ParsedMethod, ParsedUsage,
    TargetType, UsageScope,
};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy)]
enum Scope {
    Module,
    Class(usize),
    Function(usize),
    Method { class: usize, method: usize },
}

impl Scope {
    fn usage_scope(self) -> UsageScope {
        match self {
            Scope::Module => UsageScope::Module,
            Scope::Class(c) => UsageScope::Class(c),
            Scope::Function(f) => UsageScope::Function(f),
            Scope::Method { class, method } => UsageScope::Method { class, method },
        }
    }

    fn class(self) -> Option<usize> {
        match self {
            Scope::Class(c) | Scope::Method { class: c, .. } => Some(c),
            _ => None,
        }
    }
}

/// Walks the tree once and collects classes, functions, imports and usages.
pub fn extract(tree: &SyntaxTree) -> ParsedFile {
    let mut out = ParsedFile {
        lines: tree.line_count,
        ..Default::default()
    };
    let Some(root) = tree.root() else {
        return out;
    };
    out.docstring = block_docstring(tree, root);

    // Attribute nodes already reported as the callee of a call.
    let mut consumed: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<(NodeId, Scope, Vec<NodeId>)> = tree
        .children(root)
        .iter()
        .rev()
        .map(|c| (*c, Scope::Module, Vec::new()))
        .collect();

    while let Some((id, scope, decorators)) = stack.pop() {
        let mut child_scope = scope;
        let mut skip: Option<NodeId> = None;

        match tree.kind(id) {
            "decorated_definition" => {
                let decorator_ids: Vec<NodeId> = tree
                    .children(id)
                    .iter()
                    .copied()
                    .filter(|c| tree.kind(*c) == "decorator")
                    .collect();
                // Decorator expressions belong to the enclosing scope.
                for dec in decorator_ids.iter().rev() {
                    stack.push((*dec, scope, Vec::new()));
                }
                if let Some(def) = tree.field(id, "definition") {
                    stack.push((def, scope, decorator_ids));
                }
                continue;
            }
            "class_definition" => {
                let name = name_of(tree, id);
                let index = out.classes.len();
                out.classes.push(ParsedClass {
                    name,
                    line: line_of(tree, id),
                    end_line: end_line_of(tree, id),
                    docstring: tree.field(id, "body").and_then(|b| block_docstring(tree, b)),
                    bases: bases_of(tree, id),
                    methods: Vec::new(),
                });
                child_scope = Scope::Class(index);
                // Bases are recorded as inheritance, not as usages.
                skip = tree.field(id, "superclasses");
            }
            "function_definition" => {
                let body = tree.field(id, "body");
                let docstring = body.and_then(|b| block_docstring(tree, b));
                let args = tree
                    .field(id, "parameters")
                    .map(|p| parameters_of(tree, p))
                    .unwrap_or_default();
                match scope {
                    Scope::Class(class) => {
                        let (has_pass, has_not_implemented) =
                            body.map(|b| body_flags(tree, b)).unwrap_or((false, false));
                        let methods = &mut out.classes[class].methods;
                        methods.push(ParsedMethod {
                            name: name_of(tree, id),
                            line: line_of(tree, id),
                            end_line: end_line_of(tree, id),
                            docstring,
                            args,
                            is_abstract: decorators.iter().any(|d| is_abstract_decorator(tree, *d)),
                            has_pass,
                            has_not_implemented,
                        });
                        child_scope = Scope::Method {
                            class,
                            method: methods.len() - 1,
                        };
                    }
                    Scope::Module => {
                        out.functions.push(ParsedFunction {
                            name: name_of(tree, id),
                            line: line_of(tree, id),
                            end_line: end_line_of(tree, id),
                            docstring,
                            args,
                        });
                        child_scope = Scope::Function(out.functions.len() - 1);
                    }
                    // Nested functions are attributed to the enclosing definition.
                    Scope::Function(_) | Scope::Method { .. } => {}
                }
                skip = tree.field(id, "parameters");
            }
            "import_statement" => {
                for name in tree.field_list(id, "name") {
                    if let Some(module) = import_name(tree, name) {
                        out.imports.push(ParsedImport {
                            name: module,
                            module: None,
                            import_type: ImportType::Direct,
                            line: line_of(tree, id),
                        });
                    }
                }
                continue;
            }
            "import_from_statement" => {
                let module = tree
                    .field(id, "module_name")
                    .and_then(|m| tree.text(m))
                    .map(str::to_string);
                let mut names: Vec<String> = tree
                    .field_list(id, "name")
                    .into_iter()
                    .filter_map(|n| import_name(tree, n))
                    .collect();
                if tree
                    .children(id)
                    .iter()
                    .any(|c| tree.kind(*c) == "wildcard_import")
                {
                    names.push("*".into());
                }
                for name in names {
                    out.imports.push(ParsedImport {
                        name,
                        module: module.clone(),
                        import_type: ImportType::From,
                        line: line_of(tree, id),
                    });
                }
                continue;
            }
            "call" => {
                if let Some(function) = tree.field(id, "function") {
                    match tree.kind(function) {
                        "identifier" => {
                            if let Some(name) = tree.text(function) {
                                let target_type = if starts_uppercase(name) {
                                    TargetType::Class
                                } else {
                                    TargetType::Function
                                };
                                let u =
                                    usage(&out, id, tree, scope, "call", target_type, name, None);
                                out.usages.push(u);
                            }
                        }
                        "attribute" => {
                            if let Some(u) = attribute_usage(&out, tree, function, scope, "call", TargetType::Method) {
                                out.usages.push(u);
                            }
                            consumed.insert(function);
                        }
                        _ => {}
                    }
                }
            }
            "attribute" if !consumed.contains(&id) => {
                if let Some(u) = attribute_usage(&out, tree, id, scope, "attribute", TargetType::Property) {
                    out.usages.push(u);
                }
            }
            "string" | "comment" => continue,
            _ => {}
        }

        for child in tree.children(id).iter().rev() {
            if Some(*child) != skip {
                stack.push((*child, child_scope, Vec::new()));
            }
        }
    }

    out.usages.sort_by_key(|u| u.line);
    out
}

fn line_of(tree: &SyntaxTree, id: NodeId) -> i64 {
    tree.node(id).map(|n| n.line).unwrap_or(0)
}

fn end_line_of(tree: &SyntaxTree, id: NodeId) -> i64 {
    tree.node(id).map(|n| n.end_line).unwrap_or(0)
}

fn name_of(tree: &SyntaxTree, id: NodeId) -> String {
    tree.field(id, "name")
        .and_then(|n| tree.text(n))
        .unwrap_or("")
        .to_string()
}

fn starts_uppercase(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_uppercase)
}

fn context_of(out: &ParsedFile, scope: Scope) -> String {
    match scope {
        Scope::Module => "<module>".into(),
        Scope::Class(c) => out.classes[c].name.clone(),
        Scope::Function(f) => out.functions[f].name.clone(),
        Scope::Method { class, method } => format!(
            "{}.{}",
            out.classes[class].name, out.classes[class].methods[method].name
        ),
    }
}

#[allow(clippy::too_many_arguments)]
fn usage(
    out: &ParsedFile,
    id: NodeId,
    tree: &SyntaxTree,
    scope: Scope,
    usage_type: &str,
    target_type: TargetType,
    target_name: &str,
    target_class: Option<String>,
) -> ParsedUsage {
    ParsedUsage {
        line: line_of(tree, id),
        usage_type: usage_type.into(),
        target_type,
        target_name: target_name.into(),
        target_class,
        context: context_of(out, scope),
        scope: scope.usage_scope(),
    }
}

/// `obj.name` as a usage of `name`. The owning class is known for `self`/`cls`
/// receivers and for capitalized receivers naming a class directly.
fn attribute_usage(
    out: &ParsedFile,
    tree: &SyntaxTree,
    id: NodeId,
    scope: Scope,
    usage_type: &str,
    target_type: TargetType,
) -> Option<ParsedUsage> {
    let name = tree.field(id, "attribute").and_then(|a| tree.text(a))?;
    let target_class = tree.field(id, "object").and_then(|object| {
        if tree.kind(object) != "identifier" {
            return None;
        }
        match tree.text(object)? {
            "self" | "cls" => scope.class().map(|c| out.classes[c].name.clone()),
            receiver if starts_uppercase(receiver) => Some(receiver.to_string()),
            _ => None,
        }
    });
    Some(usage(out, id, tree, scope, usage_type, target_type, name, target_class))
}

/// Docstring of a module or block: a leading string expression statement.
fn block_docstring(tree: &SyntaxTree, block: NodeId) -> Option<String> {
    let first = tree
        .children(block)
        .iter()
        .copied()
        .find(|c| tree.kind(*c) != "comment")?;
    if tree.kind(first) != "expression_statement" {
        return None;
    }
    let string = tree
        .children(first)
        .iter()
        .copied()
        .find(|c| tree.kind(*c) == "string")?;
    tree.text(string).map(strip_string_literal)
}

fn strip_string_literal(raw: &str) -> String {
    let body = raw.trim_start_matches(|c: char| "rRuUbBfF".contains(c));
    let body = ["\"\"\"", "'''", "\"", "'"]
        .iter()
        .find_map(|q| body.strip_prefix(q).and_then(|b| b.strip_suffix(q)))
        .unwrap_or(body);
    body.trim().to_string()
}

fn bases_of(tree: &SyntaxTree, class: NodeId) -> Vec<String> {
    let Some(list) = tree.field(class, "superclasses") else {
        return Vec::new();
    };
    tree.children(list)
        .iter()
        .filter(|c| matches!(tree.kind(**c), "identifier" | "attribute"))
        .filter_map(|c| tree.text(*c).map(str::to_string))
        .collect()
}

fn parameters_of(tree: &SyntaxTree, params: NodeId) -> Vec<String> {
    let mut args = Vec::new();
    for param in tree.children(params) {
        let name = match tree.kind(*param) {
            "identifier" => tree.text(*param).map(str::to_string),
            "typed_parameter" => tree.children(*param).first().and_then(|c| match tree.kind(*c) {
                "identifier" => tree.text(*c).map(str::to_string),
                _ => splat_name(tree, *c),
            }),
            "default_parameter" | "typed_default_parameter" => tree
                .field(*param, "name")
                .and_then(|n| tree.text(n))
                .map(str::to_string),
            "list_splat_pattern" | "dictionary_splat_pattern" => splat_name(tree, *param),
            _ => None,
        };
        if let Some(name) = name {
            args.push(name);
        }
    }
    args
}

fn splat_name(tree: &SyntaxTree, id: NodeId) -> Option<String> {
    let prefix = match tree.kind(id) {
        "list_splat_pattern" => "*",
        "dictionary_splat_pattern" => "**",
        _ => return None,
    };
    let inner = tree.children(id).first().and_then(|c| tree.text(*c))?;
    Some(format!("{prefix}{inner}"))
}

fn import_name(tree: &SyntaxTree, id: NodeId) -> Option<String> {
    match tree.kind(id) {
        "aliased_import" => tree
            .field(id, "name")
            .and_then(|n| tree.text(n))
            .map(str::to_string),
        _ => tree.text(id).map(str::to_string),
    }
}

/// (body is only `pass`, body raises NotImplementedError), ignoring a docstring.
fn body_flags(tree: &SyntaxTree, body: NodeId) -> (bool, bool) {
    let statements: Vec<NodeId> = tree
        .children(body)
        .iter()
        .copied()
        .filter(|c| tree.kind(*c) != "comment")
        .filter(|c| {
            !(tree.kind(*c) == "expression_statement"
                && tree.children(*c).iter().any(|s| tree.kind(*s) == "string"))
        })
        .collect();
    let has_pass = statements.len() == 1 && tree.kind(statements[0]) == "pass_statement";
    let has_not_implemented = statements.iter().any(|s| {
        tree.kind(*s) == "raise_statement" && raises_not_implemented(tree, *s)
    });
    (has_pass, has_not_implemented)
}

fn raises_not_implemented(tree: &SyntaxTree, raise: NodeId) -> bool {
    tree.children(raise).iter().any(|c| {
        let target = match tree.kind(*c) {
            "call" => tree.field(*c, "function"),
            _ => Some(*c),
        };
        target.and_then(|t| tree.text(t)) == Some("NotImplementedError")
    })
}

fn is_abstract_decorator(tree: &SyntaxTree, decorator: NodeId) -> bool {
    tree.children(decorator).iter().any(|c| {
        let text = match tree.kind(*c) {
            "call" => tree.field(*c, "function").and_then(|f| tree.text(f)),
            _ => tree.text(*c),
        };
        text.is_some_and(|t| t == "abstractmethod" || t.ends_with(".abstractmethod"))
    })
}
