//! Pipeline data model — repository targets, change events, diagram blocks.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// A monitored repository and the rules for which of its files carry diagrams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoTarget {
    /// Repository full name, e.g. `centrixsystems/docs`.
    pub repository: String,
    /// API base URL of the hosting platform.
    #[serde(default = "default_host")]
    pub host: String,
    /// Branch whose pushes are processed and where metadata is committed.
    #[serde(default = "default_branch")]
    pub branch: String,
    /// A path qualifies only if it starts with one of these. `""` matches everything.
    #[serde(default = "default_include")]
    pub include: Vec<String>,
    /// A path starting with any of these never qualifies.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Accepted file extensions, lowercase without the leading dot.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Suffix that replaces the source extension to form the sidecar path.
    #[serde(default = "default_metadata_suffix")]
    pub metadata_suffix: String,
    /// Labels attached to validation-failure issues.
    #[serde(default = "default_issue_labels")]
    pub issue_labels: Vec<String>,
}

fn default_host() -> String {
    "https://api.github.com".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_include() -> Vec<String> {
    vec![String::new()]
}

fn default_extensions() -> Vec<String> {
    vec!["md".to_string(), "markdown".to_string(), "mdx".to_string()]
}

fn default_metadata_suffix() -> String {
    ".diagram.json".to_string()
}

fn default_issue_labels() -> Vec<String> {
    vec!["diagram-validation".to_string()]
}

impl RepoTarget {
    /// Target with default host, branch, extensions and suffix.
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            host: default_host(),
            branch: default_branch(),
            include: default_include(),
            exclude: Vec::new(),
            extensions: default_extensions(),
            metadata_suffix: default_metadata_suffix(),
            issue_labels: default_issue_labels(),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_include(mut self, prefixes: &[&str]) -> Self {
        self.include = prefixes.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_exclude(mut self, prefixes: &[&str]) -> Self {
        self.exclude = prefixes.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions.iter().map(|e| e.to_string()).collect();
        self
    }

    /// Check the target and normalize its extensions.
    pub fn validate(mut self) -> PipelineResult<Self> {
        let bad = |msg: String| Err(PipelineError::Configuration(msg));

        match self.repository.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {}
            _ => return bad(format!("repository must be owner/name, got {:?}", self.repository)),
        }
        if !self.host.starts_with("http://") && !self.host.starts_with("https://") {
            return bad(format!("{}: host must be an http(s) URL", self.repository));
        }
        if self.branch.trim().is_empty() {
            return bad(format!("{}: branch is empty", self.repository));
        }
        if self.include.is_empty() {
            return bad(format!(
                "{}: no include prefixes (use \"\" for the whole repository)",
                self.repository
            ));
        }

        let mut extensions = Vec::with_capacity(self.extensions.len());
        for ext in &self.extensions {
            let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
            if ext.is_empty() {
                return bad(format!("{}: empty extension", self.repository));
            }
            if !extensions.contains(&ext) {
                extensions.push(ext);
            }
        }
        if extensions.is_empty() {
            return bad(format!("{}: no accepted extensions", self.repository));
        }
        self.extensions = extensions;

        if !self.metadata_suffix.starts_with('.') || self.metadata_suffix.len() < 2 {
            return bad(format!(
                "{}: metadata suffix must start with '.', got {:?}",
                self.repository, self.metadata_suffix
            ));
        }
        // A sidecar that itself qualifies would re-trigger the pipeline on its own commit.
        let sidecar_ext = self
            .metadata_suffix
            .rsplit('.')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if self.extensions.contains(&sidecar_ext) {
            return bad(format!(
                "{}: metadata suffix {:?} uses an accepted diagram extension",
                self.repository, self.metadata_suffix
            ));
        }

        Ok(self)
    }

    /// Include/exclude/extension predicate for one repository path.
    pub fn matches(&self, path: &str) -> bool {
        let included = self.include.iter().any(|p| path.starts_with(p.as_str()));
        let excluded = self.exclude.iter().any(|p| path.starts_with(p.as_str()));
        if !included || excluded {
            return false;
        }
        match extension_of(path) {
            Some(ext) => self.extensions.iter().any(|e| *e == ext),
            None => false,
        }
    }
}

/// Lowercased extension of a repository path, if any.
pub fn extension_of(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Webhook event kind. Only `Push` is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Push,
    PullRequest,
    #[serde(other)]
    Other,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::PullRequest => write!(f, "pull_request"),
            Self::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    #[serde(alias = "changed")]
    Modified,
    #[serde(alias = "removed")]
    Deleted,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Modified => write!(f, "modified"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub status: FileStatus,
    #[serde(default)]
    pub patch: Option<String>,
}

impl ChangedFile {
    pub fn new(path: impl Into<String>, status: FileStatus) -> Self {
        Self {
            path: path.into(),
            status,
            patch: None,
        }
    }
}

/// One webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: EventType,
    pub repository: String,
    /// Branch name; a full `refs/heads/...` ref is accepted too.
    #[serde(alias = "ref")]
    pub branch: String,
    pub commit_sha: String,
    pub parent_sha: String,
    #[serde(default)]
    pub committed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub changed_files: Vec<ChangedFile>,
}

impl ChangeEvent {
    /// A push event with no timestamp.
    pub fn push(
        repository: impl Into<String>,
        branch: impl Into<String>,
        commit_sha: impl Into<String>,
        parent_sha: impl Into<String>,
        changed_files: Vec<ChangedFile>,
    ) -> Self {
        Self {
            event_type: EventType::Push,
            repository: repository.into(),
            branch: branch.into(),
            commit_sha: commit_sha.into(),
            parent_sha: parent_sha.into(),
            committed_at: None,
            changed_files,
        }
    }

    /// Branch name with any `refs/heads/` prefix removed.
    pub fn branch_name(&self) -> &str {
        self.branch
            .strip_prefix("refs/heads/")
            .unwrap_or(&self.branch)
    }
}

/// A touched file that passed the target's filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagramChange {
    pub path: String,
    pub action: FileStatus,
    pub patch: Option<String>,
    /// Pre-change content for modifications, when it could be fetched.
    pub previous_content: Option<String>,
}

/// One fenced diagram block inside a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagramBlock {
    pub dialect: String,
    pub content: String,
    /// Byte offset where `content` starts in the source text.
    pub start: usize,
    /// Byte offset one past the end of `content`.
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}
