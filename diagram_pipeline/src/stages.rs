//! Per-file stages: extract → validate → analyze → metadata.
//!
//! Pure and independent per file, so the orchestrator runs them concurrently.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::extractor::extract;
use crate::metadata::DiagramMetadata;
use crate::validator::DialectRegistry;

/// One invalid block and everything its rules reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockFailure {
    pub dialect: String,
    pub start: usize,
    pub end: usize,
    pub content: String,
    pub errors: Vec<String>,
}

/// Result of running the stages over one diagram change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Every block valid.
    Analyzed { path: String, metadata: DiagramMetadata },
    /// The file holds no diagram blocks.
    NoBlocks { path: String },
    /// The source file was deleted.
    Deleted { path: String },
    /// At least one block failed validation; no metadata.
    Invalid { path: String, failures: Vec<BlockFailure> },
}

impl FileOutcome {
    pub fn path(&self) -> &str {
        match self {
            Self::Analyzed { path, .. }
            | Self::NoBlocks { path }
            | Self::Deleted { path }
            | Self::Invalid { path, .. } => path,
        }
    }
}

/// Run every stage over the current text of one source file.
pub fn analyze_source(
    registry: &DialectRegistry,
    path: &str,
    text: &str,
    generated_at: DateTime<Utc>,
) -> FileOutcome {
    let blocks = extract(text, registry);
    if blocks.is_empty() {
        return FileOutcome::NoBlocks {
            path: path.to_string(),
        };
    }

    let failures: Vec<BlockFailure> = blocks
        .iter()
        .filter_map(|block| {
            let result = registry.validate(block);
            (!result.valid).then(|| BlockFailure {
                dialect: block.dialect.clone(),
                start: block.start,
                end: block.end,
                content: block.content.clone(),
                errors: result.errors,
            })
        })
        .collect();

    if !failures.is_empty() {
        tracing::info!(path, invalid = failures.len(), blocks = blocks.len(), "Diagram validation failed");
        return FileOutcome::Invalid {
            path: path.to_string(),
            failures,
        };
    }

    match DiagramMetadata::for_blocks(path, &blocks, generated_at) {
        Some(metadata) => FileOutcome::Analyzed {
            path: path.to_string(),
            metadata,
        },
        None => FileOutcome::NoBlocks {
            path: path.to_string(),
        },
    }
}
