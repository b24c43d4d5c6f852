//! Block extraction — pulls fenced diagram blocks out of document text.
//!
//! Extraction is purely lexical. A block opens at a backtick fence (three or
//! more) whose first tag token names a registered dialect, and closes at the
//! next line made only of backticks, at least as many as the opener.
//!
//! Known limitation: nested fences are not supported. The first closing
//! fence after an opener ends the block, so an inner opener becomes part of
//! the outer block's content. Fences tagged with anything else (or nothing)
//! are skipped whole, and an opener that is never closed yields no block.

use crate::model::DiagramBlock;
use crate::validator::DialectRegistry;

/// Parse a fence opener: backtick count and lowercased first tag token.
fn parse_opener(line: &str) -> Option<(usize, String)> {
    let line = line.trim();
    let fence_len = line.chars().take_while(|c| *c == '`').count();
    if fence_len < 3 {
        return None;
    }
    let info = line[fence_len..].trim();
    // Backticks in the info string mean inline code, not a fence.
    if info.contains('`') {
        return None;
    }
    let tag = info
        .split(|c: char| c.is_whitespace() || c == '{' || c == ',')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    Some((fence_len, tag))
}

fn is_closer(line: &str, fence_len: usize) -> bool {
    let line = line.trim();
    line.len() >= fence_len && line.chars().all(|c| c == '`')
}

fn trim_line_ending(text: &str) -> &str {
    let text = text.strip_suffix('\n').unwrap_or(text);
    text.strip_suffix('\r').unwrap_or(text)
}

/// All diagram blocks in `text`, in source order.
pub fn extract(text: &str, registry: &DialectRegistry) -> Vec<DiagramBlock> {
    let mut lines = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        lines.push((offset, line));
        offset += line.len();
    }

    let mut blocks = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let (line_offset, line) = lines[i];
        let Some((fence_len, tag)) = parse_opener(line) else {
            i += 1;
            continue;
        };

        let Some(close) = (i + 1..lines.len()).find(|&j| is_closer(lines[j].1, fence_len)) else {
            break;
        };

        if registry.contains(&tag) {
            let start = line_offset + line.len();
            let content = trim_line_ending(&text[start..lines[close].0]);
            blocks.push(DiagramBlock {
                dialect: tag,
                content: content.to_string(),
                start,
                end: start + content.len(),
            });
        }
        i = close + 1;
    }
    blocks
}

/// Wrap content in a fence for `dialect`. Inverse of `extract` for a single block.
pub fn embed(dialect: &str, content: &str) -> String {
    format!("```{dialect}\n{content}\n```\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> DialectRegistry {
        DialectRegistry::builtin()
    }

    const DOC: &str = "# Architecture\n\nSome prose.\n\n```flow\ngraph TD\n  A[Client] --> B[API]\n```\n\n```rust\nfn main() {}\n```\n\n```Sequence title=\"login\"\nsequenceDiagram\n  Alice->>Bob: hi\n```\n";

    #[test]
    fn extracts_registered_blocks_in_order() {
        let blocks = extract(DOC, &registry());
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].dialect, "flow");
        assert_eq!(blocks[0].content, "graph TD\n  A[Client] --> B[API]");
        assert_eq!(blocks[1].dialect, "sequence");
        assert_eq!(blocks[1].content, "sequenceDiagram\n  Alice->>Bob: hi");
    }

    #[test]
    fn offsets_point_at_content() {
        for block in extract(DOC, &registry()) {
            assert_eq!(&DOC[block.start..block.end], block.content);
        }
    }

    #[test]
    fn embedded_content_round_trips() {
        let registry = registry();
        for block in extract(DOC, &registry) {
            let again = extract(&embed(&block.dialect, &block.content), &registry);
            assert_eq!(again.len(), 1);
            assert_eq!(again[0].dialect, block.dialect);
            assert_eq!(again[0].content, block.content);
        }
        let empty = extract(&embed("flow", ""), &registry);
        assert_eq!(empty[0].content, "");
    }

    #[test]
    fn no_blocks_yields_empty_list() {
        assert!(extract("just prose\n```\ncode\n```\n", &registry()).is_empty());
        assert!(extract("", &registry()).is_empty());
    }

    #[test]
    fn unclosed_fence_yields_nothing() {
        assert!(extract("```flow\ngraph TD\nA --> B\n", &registry()).is_empty());
    }

    #[test]
    fn fences_inside_other_code_blocks_are_ignored() {
        let text = "````markdown\n```flow\ngraph TD\n```\n````\n";
        assert!(extract(text, &registry()).is_empty());
    }

    #[test]
    fn nested_fence_is_closed_by_first_closer() {
        let text = "```flow\ngraph TD\n```flow\nA --> B\n```\n```\n";
        let blocks = extract(text, &registry());
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].content, "graph TD\n```flow\nA --> B");
    }

    #[test]
    fn crlf_line_endings_are_trimmed() {
        let blocks = extract("```flow\r\ngraph LR\r\n```\r\n", &registry());
        assert_eq!(blocks[0].content, "graph LR");
    }
}
