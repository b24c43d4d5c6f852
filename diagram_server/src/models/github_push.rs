//! Native GitHub `push` webhook payload and its normalization.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use diagram_pipeline::{ChangeEvent, ChangedFile, EventType, FileStatus};
use serde::Deserialize;

/// `after` value GitHub sends when a branch is deleted.
const NULL_SHA: &str = "0000000000000000000000000000000000000000";

#[derive(Debug, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub before: String,
    pub after: String,
    pub repository: PushRepository,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub commits: Vec<PushCommit>,
    pub head_commit: Option<PushCommit>,
}

#[derive(Debug, Deserialize)]
pub struct PushRepository {
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct PushCommit {
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
}

/// Whether a path existed before the push, and whether it exists after.
struct NetChange {
    existed_before: bool,
    exists_now: bool,
}

impl PushPayload {
    /// Collapse the pushed commits into one event with a net status per path.
    ///
    /// A path added and removed within the same push drops out. Returns `None`
    /// for branch deletions.
    pub fn into_change_event(self) -> Option<ChangeEvent> {
        if self.deleted || self.after == NULL_SHA {
            return None;
        }

        let mut order: Vec<String> = Vec::new();
        let mut net: HashMap<String, NetChange> = HashMap::new();
        for commit in &self.commits {
            let touched = commit
                .added
                .iter()
                .map(|p| (p, FileStatus::Added))
                .chain(commit.modified.iter().map(|p| (p, FileStatus::Modified)))
                .chain(commit.removed.iter().map(|p| (p, FileStatus::Deleted)));
            for (path, status) in touched {
                let entry = net.entry(path.clone()).or_insert_with(|| {
                    order.push(path.clone());
                    NetChange {
                        existed_before: status != FileStatus::Added,
                        exists_now: true,
                    }
                });
                entry.exists_now = status != FileStatus::Deleted;
            }
        }

        let changed_files = order
            .into_iter()
            .filter_map(|path| {
                let change = net.get(&path)?;
                let status = match (change.existed_before, change.exists_now) {
                    (false, true) => FileStatus::Added,
                    (true, true) => FileStatus::Modified,
                    (true, false) => FileStatus::Deleted,
                    (false, false) => return None,
                };
                Some(ChangedFile::new(path, status))
            })
            .collect();

        let committed_at = self
            .head_commit
            .as_ref()
            .or_else(|| self.commits.last())
            .and_then(|c| c.timestamp);

        Some(ChangeEvent {
            event_type: EventType::Push,
            repository: self.repository.full_name,
            branch: self.git_ref,
            commit_sha: self.after,
            parent_sha: self.before,
            committed_at,
            changed_files,
        })
    }
}
