//! Hosting platform seam — the only outbound calls the pipeline makes.
//!
//! Implementations: `diagram_server`'s GitHub client, and
//! `fakes::MemoryPlatform` for tests and dry runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::model::RepoTarget;

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// One entry of a batched commit. `content: None` deletes the path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOp {
    pub path: String,
    pub content: Option<Vec<u8>>,
}

impl FileOp {
    pub fn write(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            content: Some(content),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: None,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.content.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    /// Idempotency key; implementations must make it findable by `find_open_issue`.
    pub key: String,
}

#[async_trait]
pub trait HostingPlatform: Send + Sync {
    /// Raw file bytes at `git_ref`, or `None` when the path does not exist there.
    async fn fetch_content(
        &self,
        target: &RepoTarget,
        path: &str,
        git_ref: &str,
    ) -> PlatformResult<Option<Vec<u8>>>;

    /// Current head commit of `branch`.
    async fn branch_head(&self, target: &RepoTarget, branch: &str) -> PlatformResult<String>;

    /// Apply every op as one new commit on top of `base`.
    ///
    /// All-or-nothing. Returns `PlatformError::Conflict` when the branch head
    /// is no longer `base`.
    async fn commit_batch(
        &self,
        target: &RepoTarget,
        branch: &str,
        base: &str,
        ops: &[FileOp],
        message: &str,
    ) -> PlatformResult<String>;

    /// Number of an open issue carrying `key`, if one exists.
    async fn find_open_issue(&self, target: &RepoTarget, key: &str) -> PlatformResult<Option<u64>>;

    async fn create_issue(&self, target: &RepoTarget, issue: &NewIssue) -> PlatformResult<u64>;
}
