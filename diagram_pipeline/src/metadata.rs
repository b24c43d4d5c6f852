//! Sidecar metadata records — one per diagram-bearing source file.
//!
//! Pure transformation: the reconciler does the writing. Serialization is
//! deterministic so that unchanged input never produces a diff.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::complexity::ComplexityMetrics;
use crate::model::DiagramBlock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagramMetadata {
    /// Dialect of the first block in the file.
    pub dialect: String,
    /// RFC 3339, second precision.
    pub generated_at: String,
    pub source_path: String,
    pub block_count: usize,
    pub metrics: ComplexityMetrics,
}

impl DiagramMetadata {
    pub fn new(
        source_path: &str,
        dialect: &str,
        block_count: usize,
        metrics: ComplexityMetrics,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            dialect: dialect.to_string(),
            generated_at: generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            source_path: source_path.to_string(),
            block_count,
            metrics,
        }
    }

    /// File-level record for a set of valid blocks: metrics summed across blocks.
    pub fn for_blocks(
        source_path: &str,
        blocks: &[DiagramBlock],
        generated_at: DateTime<Utc>,
    ) -> Option<Self> {
        let first = blocks.first()?;
        let metrics = blocks
            .iter()
            .map(|b| crate::complexity::analyze(&b.content))
            .sum();
        Some(Self::new(source_path, &first.dialect, blocks.len(), metrics, generated_at))
    }

    /// Same dialect, metrics and block count; the timestamp is ignored.
    pub fn same_analysis(&self, other: &Self) -> bool {
        self.dialect == other.dialect
            && self.source_path == other.source_path
            && self.block_count == other.block_count
            && self.metrics == other.metrics
    }

    /// Pretty JSON with a trailing newline.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = serde_json::to_vec_pretty(self).unwrap_or_default();
        out.push(b'\n');
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Sidecar path: same directory and stem as `source_path`, extension replaced by `suffix`.
pub fn sidecar_path(source_path: &str, suffix: &str) -> String {
    let (dir, file) = match source_path.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, source_path),
    };
    let stem = match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file,
    };
    match dir {
        Some(dir) => format!("{dir}/{stem}{suffix}"),
        None => format!("{stem}{suffix}"),
    }
}
