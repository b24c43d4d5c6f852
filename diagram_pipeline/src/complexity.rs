//! Structural metrics and the coarse complexity score for diagram blocks.

use std::iter::Sum;
use std::ops::Add;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// `[label]`-style node declarations.
static NODE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[[^\[\]\r\n]*\]").unwrap());

/// Directional connectors: `-->`, `--->`, `-.->`, `==>`, `->>`.
pub(crate) static CONNECTOR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-{2,}>|-\.+->|={2,}>|->>").unwrap());

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityMetrics {
    pub line_count: u64,
    pub node_count: u64,
    pub edge_count: u64,
    pub score: u64,
}

impl ComplexityMetrics {
    /// Build metrics from raw counts, deriving the score.
    pub fn from_counts(line_count: u64, node_count: u64, edge_count: u64) -> Self {
        Self {
            line_count,
            node_count,
            edge_count,
            score: score(line_count, node_count, edge_count),
        }
    }
}

/// `round((lines + nodes + edges) / 10)`, halves rounding up.
pub fn score(line_count: u64, node_count: u64, edge_count: u64) -> u64 {
    (line_count + node_count + edge_count + 5) / 10
}

/// Element-wise sum; the score is recomputed from the summed counts.
impl Add for ComplexityMetrics {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::from_counts(
            self.line_count + other.line_count,
            self.node_count + other.node_count,
            self.edge_count + other.edge_count,
        )
    }
}

impl Sum for ComplexityMetrics {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// Metrics for one block's content.
pub fn analyze(content: &str) -> ComplexityMetrics {
    let line_count = content.lines().filter(|l| !l.trim().is_empty()).count() as u64;
    let node_count = NODE_REGEX.find_iter(content).count() as u64;
    let edge_count = CONNECTOR_REGEX.find_iter(content).count() as u64;
    ComplexityMetrics::from_counts(line_count, node_count, edge_count)
}
