use super::languages::LanguageConfig;
use std::collections::HashMap;
use tracing::{debug, warn};
use tree_sitter::{Language, Node, Parser, Query, QueryCursor, StreamingIterator};

/// A declaration's line range (1-based, inclusive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub start_line: usize,
    pub end_line: usize,
    pub symbol: Option<String>,
    pub kind: String,
}

/// Supplies structural spans for a file. `None` means the language is not
/// supported (or the text could not be parsed) and the caller should fall
/// back to plain line windows.
pub trait StructuralParser: Send + Sync {
    fn spans(&self, text: &str, language: &str) -> Option<Vec<Span>>;
}

/// Parser that never returns spans.
pub struct NoSpans;

impl StructuralParser for NoSpans {
    fn spans(&self, _text: &str, _language: &str) -> Option<Vec<Span>> {
        None
    }
}

pub struct TreeSitterParser {
    grammars: HashMap<&'static str, (Language, Query)>,
}

impl TreeSitterParser {
    pub fn new() -> Result<Self, tree_sitter::QueryError> {
        let mut grammars = HashMap::new();
        for config in LanguageConfig::get_all() {
            let query = Query::new(&config.language, config.query)?;
            grammars.insert(config.name, (config.language, query));
        }
        Ok(Self { grammars })
    }

    fn extract_spans(&self, root: Node, source: &[u8], lang: &str, query: &Query) -> Vec<Span> {
        let mut cursor = QueryCursor::new();
        let mut spans = Vec::new();
        let mut seen = std::collections::HashSet::new();

        let mut matches = cursor.matches(query, root, source);
        while let Some(m) = matches.next() {
            let mut main_node = None;
            let mut kind = String::new();
            let mut name = None;

            for cap in m.captures {
                let capture_name = query.capture_names()[cap.index as usize];
                if capture_name == "name" {
                    if let Ok(text) = cap.node.utf8_text(source) {
                        name = Some(text.to_string());
                    }
                } else {
                    main_node = Some(cap.node);
                    kind = capture_name.to_string();
                }
            }

            if let Some(node) = main_node {
                let start_line = node.start_position().row + 1;
                let end_line = node.end_position().row + 1;
                if !seen.insert((start_line, end_line)) {
                    continue;
                }
                let symbol = match (find_parent_symbol(node, source, lang), name) {
                    (Some(parent), Some(name)) if parent != name => {
                        Some(format!("{parent}.{name}"))
                    }
                    (_, name) => name,
                };
                spans.push(Span {
                    start_line,
                    end_line,
                    symbol,
                    kind,
                });
            }
        }

        spans.sort_by_key(|s| (s.start_line, std::cmp::Reverse(s.end_line)));
        spans
    }
}

impl StructuralParser for TreeSitterParser {
    fn spans(&self, text: &str, language: &str) -> Option<Vec<Span>> {
        let (grammar, query) = self.grammars.get(language)?;

        let mut parser = Parser::new();
        if let Err(e) = parser.set_language(grammar) {
            warn!("tree-sitter grammar for {language} unusable: {e}");
            return None;
        }
        let source = text.as_bytes();
        let tree = parser.parse(source, None)?;
        let spans = self.extract_spans(tree.root_node(), source, language, query);
        debug!("Found {} structural spans ({language})", spans.len());
        Some(spans)
    }
}

fn find_parent_symbol(node: Node, source: &[u8], lang: &str) -> Option<String> {
    let mut parent = node.parent();
    while let Some(p) = parent {
        let kind = p.kind();
        let is_class_like = match lang {
            "go" => kind == "type_declaration",
            "python" => kind == "class_definition",
            "typescript" | "javascript" => kind == "class_declaration",
            "rust" => kind == "impl_item" || kind == "trait_item",
            _ => false,
        };

        if is_class_like {
            if lang == "rust" && kind == "impl_item" {
                if let Some(type_node) = p.child_by_field_name("type") {
                    if let Ok(name) = type_node.utf8_text(source) {
                        return Some(name.to_string());
                    }
                }
            } else {
                let mut cursor = p.walk();
                for child in p.children(&mut cursor) {
                    let child_kind = child.kind();
                    if child_kind.contains("identifier") || child_kind == "name" {
                        if let Ok(name) = child.utf8_text(source) {
                            return Some(name.to_string());
                        }
                    }
                }
            }
        }
        parent = p.parent();
    }
    None
}
