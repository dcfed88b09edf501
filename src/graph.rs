//! Usage, dependency and inheritance queries over live files.
use crate::db::Db;
use crate::db::models::{ClassRecord, ImportRecord, TargetType, UsageRecord};
use crate::error::{Result, StoreError};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Serialize)]
pub struct FileUsages {
    pub file_id: i64,
    pub file_path: String,
    pub usages: Vec<UsageRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub name: String,
    pub total: usize,
    pub files: Vec<FileUsages>,
}

/// Exact, case-sensitive lookup of usages by target name, grouped by file.
pub fn find_usages(
    db: &Db,
    project_id: i64,
    name: &str,
    target_type: Option<TargetType>,
    target_class: Option<&str>,
    file: Option<&str>,
) -> Result<UsageReport> {
    let usages = db.query_usages(project_id, name, target_type, target_class, file)?;
    let total = usages.len();

    let mut files: Vec<FileUsages> = Vec::new();
    for usage in usages {
        match files.last_mut() {
            Some(group) if group.file_id == usage.file_id => group.usages.push(usage),
            _ => files.push(FileUsages {
                file_id: usage.file_id,
                file_path: usage.file_path.clone(),
                usages: vec![usage],
            }),
        }
    }

    Ok(UsageReport {
        name: name.to_string(),
        total,
        files,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencySource {
    Usage,
    Import,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyHit {
    pub source: DependencySource,
    pub file_id: i64,
    pub file_path: String,
    pub line: i64,
    /// Usage target type or import type.
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl From<UsageRecord> for DependencyHit {
    fn from(u: UsageRecord) -> Self {
        Self {
            source: DependencySource::Usage,
            file_id: u.file_id,
            file_path: u.file_path,
            line: u.line,
            kind: u.target_type.to_string(),
            name: u.target_name,
            module: None,
            target_class: u.target_class,
            context: Some(u.context),
        }
    }
}

impl From<ImportRecord> for DependencyHit {
    fn from(i: ImportRecord) -> Self {
        Self {
            source: DependencySource::Import,
            file_id: i.file_id,
            file_path: i.file_path,
            line: i.line,
            kind: i.import_type.to_string(),
            name: i.name,
            module: i.module,
            target_class: None,
            context: None,
        }
    }
}

/// Everything that depends on `name`: its usages plus imports that mention it.
///
/// One hit per (file, line, source), ordered by file path then line.
pub fn find_dependencies(
    db: &Db,
    project_id: i64,
    name: &str,
    target_type: Option<TargetType>,
    target_class: Option<&str>,
) -> Result<Vec<DependencyHit>> {
    let usages = db.query_usages(project_id, name, target_type, target_class, None)?;
    let imports = db.query_imports_matching(project_id, name)?;

    let mut seen = HashSet::new();
    let mut hits: Vec<DependencyHit> = usages
        .into_iter()
        .map(DependencyHit::from)
        .chain(imports.into_iter().map(DependencyHit::from))
        .filter(|h| seen.insert((h.file_id, h.line, h.source)))
        .collect();
    hits.sort_by(|a, b| {
        (a.file_path.as_str(), a.line, a.source).cmp(&(b.file_path.as_str(), b.line, b.source))
    });
    Ok(hits)
}

#[derive(Debug, Clone, Serialize)]
pub struct HierarchyNode {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    /// No in-scope class has this name.
    pub external: bool,
    /// Repeated on its own branch; not expanded again.
    pub cycle: bool,
    /// Cut by the depth limit.
    pub truncated: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bases: Vec<HierarchyNode>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<HierarchyNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HierarchyReport {
    pub classes_in_scope: usize,
    pub roots: Vec<HierarchyNode>,
}

#[derive(Clone, Copy)]
enum Direction {
    Up,
    Down,
}

struct ClassGraph<'a> {
    /// Name to record; on duplicate names the smallest (path, line) wins.
    by_name: BTreeMap<&'a str, &'a ClassRecord>,
    children: BTreeMap<&'a str, Vec<&'a str>>,
    max_depth: usize,
}

impl<'a> ClassGraph<'a> {
    fn new(classes: &'a [ClassRecord], max_depth: usize) -> Self {
        let mut by_name: BTreeMap<&str, &ClassRecord> = BTreeMap::new();
        for class in classes {
            by_name.entry(class.name.as_str()).or_insert(class);
        }

        let mut graph = Self {
            by_name,
            children: BTreeMap::new(),
            max_depth,
        };
        for class in classes {
            for base in &class.bases {
                let Some(parent) = graph.resolve(base) else {
                    continue;
                };
                let parent = parent.name.as_str();
                if parent == class.name {
                    continue;
                }
                let list = graph.children.entry(parent).or_default();
                if !list.contains(&class.name.as_str()) {
                    list.push(class.name.as_str());
                }
            }
        }
        graph
    }

    /// In-scope record for a base as written, also trying its last dotted segment.
    fn resolve(&self, name: &str) -> Option<&'a ClassRecord> {
        self.by_name.get(name).copied().or_else(|| {
            name.rsplit('.')
                .next()
                .and_then(|short| self.by_name.get(short).copied())
        })
    }

    fn stub(&self, name: &str) -> HierarchyNode {
        let record = self.resolve(name);
        HierarchyNode {
            name: record.map_or_else(|| name.to_string(), |r| r.name.clone()),
            class_id: record.map(|r| r.id),
            file_path: record.map(|r| r.file_path.clone()),
            line: record.map(|r| r.line),
            external: record.is_none(),
            cycle: false,
            truncated: false,
            bases: Vec::new(),
            children: Vec::new(),
        }
    }

    fn neighbours(&self, record: &'a ClassRecord, direction: Direction) -> Vec<&'a str> {
        match direction {
            Direction::Up => record.bases.iter().map(String::as_str).collect(),
            Direction::Down => self
                .children
                .get(record.name.as_str())
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Expands `name` in one direction. `branch` holds the names on the path from the
    /// root; a name already on it becomes a leaf marked `cycle`.
    fn expand(&self, name: &str, direction: Direction, depth: usize, branch: &mut Vec<String>) -> HierarchyNode {
        let mut node = self.stub(name);
        let Some(record) = self.resolve(name) else {
            return node;
        };
        if branch.iter().any(|n| *n == record.name) {
            node.cycle = true;
            return node;
        }
        let next = self.neighbours(record, direction);
        if next.is_empty() {
            return node;
        }
        if depth >= self.max_depth {
            node.truncated = true;
            return node;
        }

        branch.push(record.name.clone());
        let expanded: Vec<HierarchyNode> = next
            .into_iter()
            .map(|n| self.expand(n, direction, depth + 1, branch))
            .collect();
        branch.pop();

        match direction {
            Direction::Up => node.bases = expanded,
            Direction::Down => node.children = expanded,
        }
        node
    }

    /// Ancestors and descendants of one class.
    fn around(&self, record: &'a ClassRecord) -> HierarchyNode {
        let mut branch = vec![record.name.clone()];
        let mut node = self.stub(&record.name);
        if self.max_depth == 0 {
            node.truncated = true;
            return node;
        }
        node.bases = self
            .neighbours(record, Direction::Up)
            .into_iter()
            .map(|b| self.expand(b, Direction::Up, 1, &mut branch))
            .collect();
        node.children = self
            .neighbours(record, Direction::Down)
            .into_iter()
            .map(|c| self.expand(c, Direction::Down, 1, &mut branch))
            .collect();
        node
    }

    fn has_in_scope_base(&self, record: &ClassRecord) -> bool {
        record
            .bases
            .iter()
            .any(|b| self.resolve(b).is_some_and(|r| r.name != record.name))
    }
}

/// Inheritance tree around `class_name`, or the whole forest when no class is given.
///
/// In forest mode each class without an in-scope base is a root expanded downward.
/// Classes reachable from no root (members of a base cycle) are added as extra roots
/// so every in-scope class appears.
pub fn get_class_hierarchy(
    db: &Db,
    project_id: i64,
    class_name: Option<&str>,
    file: Option<&str>,
    max_depth: usize,
) -> Result<HierarchyReport> {
    let classes = db.list_classes(project_id, file)?;
    let graph = ClassGraph::new(&classes, max_depth);

    let roots = match class_name {
        Some(name) => {
            let record = graph
                .by_name
                .get(name)
                .copied()
                .ok_or_else(|| StoreError::not_found("class", name))?;
            vec![graph.around(record)]
        }
        None => {
            let mut roots = Vec::new();
            let mut reached: HashSet<String> = HashSet::new();
            for record in graph.by_name.values() {
                if !graph.has_in_scope_base(record) {
                    let node = graph.expand(&record.name, Direction::Down, 0, &mut Vec::new());
                    collect_names(&node, &mut reached);
                    roots.push(node);
                }
            }
            for record in graph.by_name.values() {
                if !reached.contains(&record.name) {
                    let node = graph.expand(&record.name, Direction::Down, 0, &mut Vec::new());
                    collect_names(&node, &mut reached);
                    roots.push(node);
                }
            }
            roots
        }
    };

    Ok(HierarchyReport {
        classes_in_scope: graph.by_name.len(),
        roots,
    })
}

fn collect_names(node: &HierarchyNode, out: &mut HashSet<String>) {
    let mut stack = vec![node];
    while let Some(n) = stack.pop() {
        out.insert(n.name.clone());
        stack.extend(n.children.iter());
        stack.extend(n.bases.iter());
    }
}
