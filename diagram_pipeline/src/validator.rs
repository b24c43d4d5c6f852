//! Dialect registry and per-dialect validation rules.
//!
//! Each dialect owns an ordered list of rules. Rules run in order; every
//! error a rule finds is reported together, and no later rule runs once one
//! has reported errors. The checks are structural only: they catch empty,
//! mislabeled or obviously broken blocks without parsing the full grammar.

use std::collections::BTreeMap;

use crate::complexity::CONNECTOR_REGEX;
use crate::model::{DiagramBlock, ValidationResult};

/// One structural check over a block's content.
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every problem found, in source order. Empty means the rule passed.
    fn check(&self, content: &str) -> Vec<String>;
}

/// Lines that carry diagram statements: non-empty and not comments.
fn statements(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with("%%") && !line.starts_with('\''))
}

pub struct NonEmpty;

impl Rule for NonEmpty {
    fn name(&self) -> &'static str {
        "non-empty"
    }

    fn check(&self, content: &str) -> Vec<String> {
        if content.trim().is_empty() {
            vec!["diagram block is empty".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// First statement must open with one of the given keywords.
pub struct KindDeclaration {
    keywords: Vec<&'static str>,
}

impl KindDeclaration {
    pub fn new(keywords: &[&'static str]) -> Self {
        Self {
            keywords: keywords.to_vec(),
        }
    }
}

impl Rule for KindDeclaration {
    fn name(&self) -> &'static str {
        "kind-declaration"
    }

    fn check(&self, content: &str) -> Vec<String> {
        let first_word = statements(content)
            .next()
            .and_then(|(_, line)| line.split_whitespace().next());
        match first_word {
            Some(word) if self.keywords.iter().any(|k| k.eq_ignore_ascii_case(word)) => Vec::new(),
            Some(word) => vec![format!(
                "missing diagram-kind declaration: expected one of {}, found `{word}`",
                self.keywords.join(", ")
            )],
            None => vec![format!(
                "missing diagram-kind declaration: expected one of {}",
                self.keywords.join(", ")
            )],
        }
    }
}

/// Flow-style declaration: `graph` or `flowchart`, optionally followed by a direction.
pub struct DirectionalGraph;

const GRAPH_KEYWORDS: [&str; 2] = ["graph", "flowchart"];
const DIRECTIONS: [&str; 5] = ["TB", "TD", "BT", "LR", "RL"];

impl Rule for DirectionalGraph {
    fn name(&self) -> &'static str {
        "directional-graph"
    }

    fn check(&self, content: &str) -> Vec<String> {
        let mut errors = KindDeclaration::new(&GRAPH_KEYWORDS).check(content);
        if !errors.is_empty() {
            return errors;
        }
        if let Some((line_no, line)) = statements(content).next() {
            if let Some(direction) = line.split_whitespace().nth(1) {
                let direction = direction.trim_end_matches(';');
                if !DIRECTIONS.iter().any(|d| d.eq_ignore_ascii_case(direction)) {
                    errors.push(format!(
                        "line {line_no}: unknown graph direction `{direction}` (expected TB, TD, BT, LR or RL)"
                    ));
                }
            }
        }
        errors
    }
}

/// Markup-style dialects wrap the body in an open/close marker pair.
pub struct PairedMarkers {
    open: &'static str,
    close: &'static str,
}

impl PairedMarkers {
    pub fn new(open: &'static str, close: &'static str) -> Self {
        Self { open, close }
    }
}

impl Rule for PairedMarkers {
    fn name(&self) -> &'static str {
        "paired-markers"
    }

    fn check(&self, content: &str) -> Vec<String> {
        let mut errors = Vec::new();
        let mut open_line: Option<usize> = None;
        let mut pairs = 0usize;

        for (line_no, line) in statements(content) {
            let word = line.split_whitespace().next().unwrap_or_default();
            if word.eq_ignore_ascii_case(self.open) {
                if let Some(previous) = open_line {
                    errors.push(format!(
                        "line {line_no}: `{}` before `{}` closes the one opened on line {previous}",
                        self.open, self.close
                    ));
                }
                open_line = Some(line_no);
            } else if word.eq_ignore_ascii_case(self.close) {
                if open_line.take().is_none() {
                    errors.push(format!("line {line_no}: `{}` without matching `{}`", self.close, self.open));
                } else {
                    pairs += 1;
                }
            }
        }

        if let Some(line_no) = open_line {
            errors.push(format!("line {line_no}: `{}` is never closed by `{}`", self.open, self.close));
        }
        if pairs == 0 && errors.is_empty() {
            errors.push(format!(
                "missing diagram-kind declaration: expected `{}` ... `{}`",
                self.open, self.close
            ));
        }
        errors
    }
}

/// Every connector needs a node on both sides.
pub struct ConnectorOperands;

/// Drop a leading `|label|` from the text after a connector.
fn strip_edge_label(text: &str) -> &str {
    let text = text.trim_start();
    match text.strip_prefix('|').and_then(|rest| rest.split_once('|')) {
        Some((_, after)) => after,
        None => text,
    }
}

impl Rule for ConnectorOperands {
    fn name(&self) -> &'static str {
        "connector-operands"
    }

    fn check(&self, content: &str) -> Vec<String> {
        let mut errors = Vec::new();
        for (line_no, line) in statements(content) {
            if !CONNECTOR_REGEX.is_match(line) {
                continue;
            }
            let pieces: Vec<&str> = CONNECTOR_REGEX.split(line).collect();
            if pieces[0].trim().is_empty() {
                errors.push(format!("line {line_no}: connector is missing a source node"));
            }
            if pieces[1..].iter().any(|p| strip_edge_label(p).trim().is_empty()) {
                errors.push(format!("line {line_no}: connector is missing a target node"));
            }
        }
        errors
    }
}

struct Dialect {
    rules: Vec<Box<dyn Rule>>,
}

/// Maps a dialect name (the fence tag) to its rule set.
#[derive(Default)]
pub struct DialectRegistry {
    dialects: BTreeMap<String, Dialect>,
}

const MERMAID_KEYWORDS: [&str; 14] = [
    "graph",
    "flowchart",
    "sequenceDiagram",
    "classDiagram",
    "classDiagram-v2",
    "stateDiagram",
    "stateDiagram-v2",
    "erDiagram",
    "gantt",
    "pie",
    "journey",
    "gitGraph",
    "mindmap",
    "timeline",
];

impl DialectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in flow, sequence, ER, class, mermaid and plantuml dialects.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register(
                "flow",
                vec![Box::new(NonEmpty), Box::new(DirectionalGraph), Box::new(ConnectorOperands)],
            )
            .register(
                "sequence",
                vec![Box::new(NonEmpty), Box::new(KindDeclaration::new(&["sequenceDiagram"]))],
            )
            .register(
                "entity-relationship",
                vec![Box::new(NonEmpty), Box::new(KindDeclaration::new(&["erDiagram"]))],
            )
            .register(
                "uml-class",
                vec![
                    Box::new(NonEmpty),
                    Box::new(KindDeclaration::new(&["classDiagram", "classDiagram-v2"])),
                ],
            )
            .register(
                "mermaid",
                vec![Box::new(NonEmpty), Box::new(KindDeclaration::new(&MERMAID_KEYWORDS))],
            )
            .register(
                "plantuml",
                vec![Box::new(NonEmpty), Box::new(PairedMarkers::new("@startuml", "@enduml"))],
            );
        registry
    }

    /// Add or replace a dialect. Names are matched lowercase.
    pub fn register(&mut self, name: &str, rules: Vec<Box<dyn Rule>>) -> &mut Self {
        self.dialects
            .insert(name.to_ascii_lowercase(), Dialect { rules });
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dialects.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.dialects.keys().map(String::as_str)
    }

    /// Run the block's dialect rules, stopping after the first rule that reports errors.
    pub fn validate(&self, block: &DiagramBlock) -> ValidationResult {
        let Some(dialect) = self.dialects.get(&block.dialect) else {
            return ValidationResult::failed(vec![format!("unsupported dialect `{}`", block.dialect)]);
        };
        for rule in &dialect.rules {
            let errors = rule.check(&block.content);
            if !errors.is_empty() {
                tracing::debug!(
                    dialect = %block.dialect,
                    rule = rule.name(),
                    errors = errors.len(),
                    "Diagram rule failed"
                );
                return ValidationResult::failed(errors);
            }
        }
        ValidationResult::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(dialect: &str, content: &str) -> DiagramBlock {
        DiagramBlock {
            dialect: dialect.to_string(),
            content: content.to_string(),
            start: 0,
            end: content.len(),
        }
    }

    #[test]
    fn valid_flow_block_passes() {
        let registry = DialectRegistry::builtin();
        let result = registry.validate(&block("flow", "graph TD\n  A[Start] -->|go| B[End]\n"));
        assert_eq!(result, ValidationResult::ok());
    }

    #[test]
    fn empty_block_stops_at_first_rule() {
        let registry = DialectRegistry::builtin();
        let result = registry.validate(&block("flow", "  \n\n"));
        assert!(!result.valid);
        assert_eq!(result.errors, vec!["diagram block is empty"]);
    }

    #[test]
    fn flow_without_declaration_is_rejected() {
        let registry = DialectRegistry::builtin();
        let result = registry.validate(&block("flow", "A[Start] --> B[End]"));
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("missing diagram-kind declaration"));
    }

    #[test]
    fn flow_rejects_unknown_direction() {
        let registry = DialectRegistry::builtin();
        let result = registry.validate(&block("flow", "graph XY\nA --> B"));
        assert_eq!(
            result.errors,
            vec!["line 1: unknown graph direction `XY` (expected TB, TD, BT, LR or RL)"]
        );
    }

    #[test]
    fn connector_rule_reports_every_bad_line() {
        let registry = DialectRegistry::builtin();
        let result = registry.validate(&block(
            "flow",
            "graph LR\n  --> B\n  A --> B\n  C -->|label|\n  D ==> \n",
        ));
        assert_eq!(
            result.errors,
            vec![
                "line 2: connector is missing a source node",
                "line 4: connector is missing a target node",
                "line 5: connector is missing a target node",
            ]
        );
    }

    #[test]
    fn plantuml_requires_paired_markers() {
        let registry = DialectRegistry::builtin();
        assert!(registry
            .validate(&block("plantuml", "@startuml\nAlice -> Bob\n@enduml"))
            .valid);

        let unclosed = registry.validate(&block("plantuml", "@startuml\nAlice -> Bob"));
        assert_eq!(unclosed.errors, vec!["line 1: `@startuml` is never closed by `@enduml`"]);

        let missing = registry.validate(&block("plantuml", "Alice -> Bob"));
        assert_eq!(
            missing.errors,
            vec!["missing diagram-kind declaration: expected `@startuml` ... `@enduml`"]
        );
    }

    #[test]
    fn comments_before_declaration_are_skipped() {
        let registry = DialectRegistry::builtin();
        assert!(registry
            .validate(&block("sequence", "%% login\nsequenceDiagram\nAlice->>Bob: hi"))
            .valid);
    }

    #[test]
    fn validation_is_deterministic() {
        let registry = DialectRegistry::builtin();
        let b = block("flow", "graph TD\n--> X\nY -->\n");
        assert_eq!(registry.validate(&b), registry.validate(&b));
    }

    #[test]
    fn custom_dialects_register_without_core_changes() {
        struct MustMentionQueue;
        impl Rule for MustMentionQueue {
            fn name(&self) -> &'static str {
                "mentions-queue"
            }
            fn check(&self, content: &str) -> Vec<String> {
                if content.contains("queue") {
                    Vec::new()
                } else {
                    vec!["no queue".to_string()]
                }
            }
        }

        let mut registry = DialectRegistry::new();
        registry.register("Topology", vec![Box::new(MustMentionQueue)]);
        assert!(registry.contains("topology"));
        assert!(registry.validate(&block("topology", "queue a")).valid);
        assert!(!registry.validate(&block("topology", "a")).valid);
    }

    #[test]
    fn unknown_dialect_is_invalid() {
        let result = DialectRegistry::builtin().validate(&block("dot", "digraph {}"));
        assert_eq!(result.errors, vec!["unsupported dialect `dot`"]);
    }
}
