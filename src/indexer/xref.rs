//! Resolves a file's name-based references into id-based edges.
//!
//! An edge is only planned when the lookup returns exactly one candidate;
//! ambiguous or unknown targets stay visible through the usage rows alone.
use crate::db::models::{EntityType, IngestedIds, ParsedFile, TargetType};
use crate::error::Result;
use std::collections::BTreeSet;

/// What a reference names, as handed to the candidate lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceTarget<'a> {
    Function(&'a str),
    Class(&'a str),
    Method {
        name: &'a str,
        class: Option<&'a str>,
    },
}

impl ReferenceTarget<'_> {
    pub fn entity_type(&self) -> EntityType {
        match self {
            ReferenceTarget::Function(_) => EntityType::Function,
            ReferenceTarget::Class(_) => EntityType::Class,
            ReferenceTarget::Method { .. } => EntityType::Method,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PlannedEdge {
    pub caller_type: EntityType,
    pub caller_id: i64,
    pub callee_type: EntityType,
    pub callee_id: i64,
}

/// A name-based reference and the entity making it. Usages and class bases both
/// reduce to this, whether they come from a fresh parse or from stored rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub caller_type: EntityType,
    pub caller_id: i64,
    pub target_type: TargetType,
    pub name: String,
    pub class: Option<String>,
}

impl Reference {
    pub fn target(&self) -> ReferenceTarget<'_> {
        match self.target_type {
            TargetType::Function => ReferenceTarget::Function(&self.name),
            TargetType::Class => ReferenceTarget::Class(&self.name),
            TargetType::Method | TargetType::Property => ReferenceTarget::Method {
                name: &self.name,
                class: self.class.as_deref(),
            },
        }
    }
}

/// References made by a freshly parsed file, callers taken from its ingested ids.
pub fn references_of(file_id: i64, parsed: &ParsedFile, ids: &IngestedIds) -> Vec<Reference> {
    let mut refs = Vec::with_capacity(parsed.usages.len());
    for usage in &parsed.usages {
        let (caller_type, caller_id) = ids.caller(file_id, usage.scope);
        refs.push(Reference {
            caller_type,
            caller_id,
            target_type: usage.target_type,
            name: usage.target_name.clone(),
            class: usage.target_class.clone(),
        });
    }
    for (class, class_id) in parsed.classes.iter().zip(&ids.classes) {
        for base in &class.bases {
            refs.push(Reference {
                caller_type: EntityType::Class,
                caller_id: *class_id,
                target_type: TargetType::Class,
                name: base.clone(),
                class: None,
            });
        }
    }
    refs
}

/// Plans the cross-reference rows for a set of references.
///
/// `lookup` returns the ids of live entities matching a target; the planner
/// only needs to know whether there are zero, one or several.
pub fn plan_edges<F>(refs: &[Reference], mut lookup: F) -> Result<Vec<PlannedEdge>>
where
    F: FnMut(ReferenceTarget<'_>) -> Result<Vec<i64>>,
{
    let mut edges = BTreeSet::new();
    for reference in refs {
        let target = reference.target();
        if let Some(callee_id) = unique(lookup(target)?) {
            let edge = PlannedEdge {
                caller_type: reference.caller_type,
                caller_id: reference.caller_id,
                callee_type: target.entity_type(),
                callee_id,
            };
            if !is_self_edge(&edge) {
                edges.insert(edge);
            }
        }
    }
    Ok(edges.into_iter().collect())
}

fn unique(mut candidates: Vec<i64>) -> Option<i64> {
    candidates.dedup();
    match candidates.as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}

// Recursion is a real usage but not a dependency edge.
fn is_self_edge(edge: &PlannedEdge) -> bool {
    edge.caller_type == edge.callee_type && edge.caller_id == edge.callee_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ParsedClass, ParsedUsage, UsageScope};

    fn usage(target_type: TargetType, name: &str, class: Option<&str>, scope: UsageScope) -> ParsedUsage {
        ParsedUsage {
            line: 1,
            usage_type: "call".into(),
            target_type,
            target_name: name.into(),
            target_class: class.map(str::to_string),
            context: "<module>".into(),
            scope,
        }
    }

    #[test]
    fn test_only_unique_candidates_become_edges() {
        let parsed = ParsedFile {
            usages: vec![
                usage(TargetType::Function, "helper", None, UsageScope::Function(0)),
                usage(TargetType::Function, "shared", None, UsageScope::Module),
                usage(TargetType::Function, "missing", None, UsageScope::Module),
            ],
            ..Default::default()
        };
        let ids = IngestedIds {
            functions: vec![7],
            ..Default::default()
        };

        let edges = plan_edges(&references_of(1, &parsed, &ids), |target| {
            Ok(match target {
                ReferenceTarget::Function("helper") => vec![42],
                ReferenceTarget::Function("shared") => vec![43, 44],
                _ => vec![],
            })
        })
        .unwrap();

        assert_eq!(
            edges,
            vec![PlannedEdge {
                caller_type: EntityType::Function,
                caller_id: 7,
                callee_type: EntityType::Function,
                callee_id: 42,
            }]
        );
    }

    #[test]
    fn test_method_lookup_carries_class_and_bases_resolve() {
        let parsed = ParsedFile {
            classes: vec![ParsedClass {
                name: "Child".into(),
                bases: vec!["Parent".into()],
                ..Default::default()
            }],
            usages: vec![usage(
                TargetType::Method,
                "run",
                Some("Child"),
                UsageScope::Method { class: 0, method: 0 },
            )],
            ..Default::default()
        };
        let ids = IngestedIds {
            classes: vec![10],
            methods: vec![vec![11]],
            functions: vec![],
        };

        let mut seen = Vec::new();
        let edges = plan_edges(&references_of(1, &parsed, &ids), |target| {
            seen.push(format!("{target:?}"));
            Ok(match target {
                ReferenceTarget::Method { name: "run", class: Some("Child") } => vec![11],
                ReferenceTarget::Class("Parent") => vec![3],
                _ => vec![],
            })
        })
        .unwrap();

        // The self-call from run() to itself is dropped, the base edge stays.
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].caller_id, 10);
        assert_eq!(edges[0].callee_id, 3);
        assert_eq!(seen.len(), 2);
    }
}
