//! Embedding chunks derived from a parsed file.
//!
//! Chunk uuids are v5 uuids over the entity's qualified name, so re-indexing an
//! unchanged entity produces the same key even if its line moved.
use crate::db::models::{ChunkDraft, EntityType, IngestedIds, ParsedFile};
use std::collections::HashMap;
use uuid::Uuid;

pub const CHUNK_CODE: &str = "code";
pub const CHUNK_DOCSTRING: &str = "docstring";

struct ChunkBuilder<'a> {
    project_id: i64,
    file_path: &'a str,
    drafts: Vec<ChunkDraft>,
    seen: HashMap<String, usize>,
}

impl ChunkBuilder<'_> {
    fn push(
        &mut self,
        entity_type: EntityType,
        entity_id: i64,
        qualified_name: &str,
        chunk_type: &str,
        text: String,
    ) {
        if text.trim().is_empty() {
            return;
        }
        let mut key = format!(
            "{}:{}:{}:{}:{}",
            self.project_id, self.file_path, entity_type, qualified_name, chunk_type
        );
        // Same-named definitions in one file get an occurrence suffix.
        let occurrence = self.seen.entry(key.clone()).or_insert(0);
        if *occurrence > 0 {
            key.push_str(&format!("#{occurrence}"));
        }
        *occurrence += 1;

        self.drafts.push(ChunkDraft {
            chunk_uuid: Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string(),
            chunk_type: chunk_type.to_string(),
            text,
            ordinal: self.drafts.len() as i64,
            entity_type: Some(entity_type),
            entity_id: Some(entity_id),
        });
    }
}

fn lines(source: &str, line: i64, end_line: i64) -> String {
    let start = (line.max(1) - 1) as usize;
    let count = (end_line - line + 1).max(0) as usize;
    source
        .lines()
        .skip(start)
        .take(count)
        .collect::<Vec<_>>()
        .join("\n")
}

/// One code chunk per class header, method and function, plus one chunk per docstring.
pub fn build_chunks(
    project_id: i64,
    file_id: i64,
    file_path: &str,
    parsed: &ParsedFile,
    ids: &IngestedIds,
    source: &str,
) -> Vec<ChunkDraft> {
    let mut builder = ChunkBuilder {
        project_id,
        file_path,
        drafts: Vec::new(),
        seen: HashMap::new(),
    };

    if let Some(doc) = &parsed.docstring {
        builder.push(EntityType::File, file_id, "<module>", CHUNK_DOCSTRING, doc.clone());
    }

    for (class, class_id) in parsed.classes.iter().zip(&ids.classes) {
        // The class header runs up to its first method.
        let header_end = class
            .methods
            .iter()
            .map(|m| m.line - 1)
            .min()
            .unwrap_or(class.end_line)
            .max(class.line);
        builder.push(
            EntityType::Class,
            *class_id,
            &class.name,
            CHUNK_CODE,
            lines(source, class.line, header_end),
        );
        if let Some(doc) = &class.docstring {
            builder.push(EntityType::Class, *class_id, &class.name, CHUNK_DOCSTRING, doc.clone());
        }
    }

    for (c, class) in parsed.classes.iter().enumerate() {
        let Some(method_ids) = ids.methods.get(c) else {
            continue;
        };
        for (method, method_id) in class.methods.iter().zip(method_ids) {
            let qualified = format!("{}.{}", class.name, method.name);
            builder.push(
                EntityType::Method,
                *method_id,
                &qualified,
                CHUNK_CODE,
                lines(source, method.line, method.end_line),
            );
            if let Some(doc) = &method.docstring {
                builder.push(EntityType::Method, *method_id, &qualified, CHUNK_DOCSTRING, doc.clone());
            }
        }
    }

    for (function, function_id) in parsed.functions.iter().zip(&ids.functions) {
        builder.push(
            EntityType::Function,
            *function_id,
            &function.name,
            CHUNK_CODE,
            lines(source, function.line, function.end_line),
        );
        if let Some(doc) = &function.docstring {
            builder.push(
                EntityType::Function,
                *function_id,
                &function.name,
                CHUNK_DOCSTRING,
                doc.clone(),
            );
        }
    }

    builder.drafts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ParsedClass, ParsedFunction, ParsedMethod};

    const SOURCE: &str = "class A:\n    \"\"\"Doc.\"\"\"\n    def run(self):\n        return 1\n\ndef f():\n    pass\n\ndef f():\n    pass\n";

    fn parsed() -> (ParsedFile, IngestedIds) {
        let parsed = ParsedFile {
            lines: 10,
            docstring: None,
            classes: vec![ParsedClass {
                name: "A".into(),
                line: 1,
                end_line: 4,
                docstring: Some("Doc.".into()),
                bases: vec![],
                methods: vec![ParsedMethod {
                    name: "run".into(),
                    line: 3,
                    end_line: 4,
                    ..Default::default()
                }],
            }],
            functions: vec![
                ParsedFunction {
                    name: "f".into(),
                    line: 6,
                    end_line: 7,
                    ..Default::default()
                },
                ParsedFunction {
                    name: "f".into(),
                    line: 9,
                    end_line: 10,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let ids = IngestedIds {
            classes: vec![1],
            methods: vec![vec![2]],
            functions: vec![3, 4],
        };
        (parsed, ids)
    }

    #[test]
    fn test_chunks_cover_entities_and_docstrings() {
        let (parsed, ids) = parsed();
        let chunks = build_chunks(1, 9, "/proj/a.py", &parsed, &ids, SOURCE);
        let kinds: Vec<_> = chunks
            .iter()
            .map(|c| (c.entity_type, c.chunk_type.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (Some(EntityType::Class), CHUNK_CODE),
                (Some(EntityType::Class), CHUNK_DOCSTRING),
                (Some(EntityType::Method), CHUNK_CODE),
                (Some(EntityType::Function), CHUNK_CODE),
                (Some(EntityType::Function), CHUNK_CODE),
            ]
        );
        assert_eq!(chunks[0].text, "class A:\n    \"\"\"Doc.\"\"\"");
        assert_eq!(chunks[2].text, "    def run(self):\n        return 1");
        assert_ne!(chunks[3].chunk_uuid, chunks[4].chunk_uuid);
    }

    #[test]
    fn test_uuids_are_stable_across_line_shifts() {
        let (parsed, ids) = parsed();
        let first = build_chunks(1, 9, "/proj/a.py", &parsed, &ids, SOURCE);

        let (mut shifted, ids) = self::parsed();
        shifted.functions[0].line += 3;
        shifted.functions[0].end_line += 3;
        let second = build_chunks(1, 9, "/proj/a.py", &shifted, &ids, SOURCE);
        assert_eq!(first[3].chunk_uuid, second[3].chunk_uuid);

        let elsewhere = build_chunks(1, 9, "/proj/b.py", &parsed, &ids, SOURCE);
        assert_ne!(first[0].chunk_uuid, elsewhere[0].chunk_uuid);
    }
}
