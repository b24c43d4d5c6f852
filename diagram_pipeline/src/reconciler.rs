//! Reconciliation — turns per-file outcomes into one atomic commit plus issues.
//!
//! Issues are filed first: they are idempotent, so a failed commit that gets
//! redelivered finds them again instead of duplicating them. The metadata
//! batch is staged against the current branch head and committed in a single
//! call; if the head moves underneath, the batch is restaged once.

use std::collections::HashMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, PipelineResult, PlatformError};
use crate::metadata::{sidecar_path, DiagramMetadata};
use crate::model::RepoTarget;
use crate::platform::{FileOp, HostingPlatform, NewIssue};
use crate::retry::{with_backoff, RetryPolicy};
use crate::stages::{BlockFailure, FileOutcome};

/// Marker embedded in issue bodies so the key can be searched for.
pub const ISSUE_KEY_MARKER: &str = "diagram-sync:key=";

/// A staged sidecar change and the source file it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedChange {
    pub source_path: String,
    pub op: FileOp,
}

/// Every metadata write and delete for one event; applied atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationBatch {
    pub commit_sha: String,
    pub changes: Vec<StagedChange>,
}

impl ReconciliationBatch {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn ops(&self) -> Vec<FileOp> {
        self.changes.iter().map(|c| c.op.clone()).collect()
    }

    /// Summary commit message enumerating every affected file.
    pub fn message(&self) -> String {
        let short: String = self.commit_sha.chars().take(7).collect();
        let mut message = format!(
            "Update diagram metadata for {short}\n\n{} file(s) affected:\n",
            self.changes.len()
        );
        for change in &self.changes {
            let verb = if change.op.is_delete() { "delete" } else { "write" };
            message.push_str(&format!("- {verb} {} ({})\n", change.op.path, change.source_path));
        }
        message
    }
}

/// A validation-failure issue for one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueRecord {
    pub path: String,
    pub commit_sha: String,
    pub failures: Vec<BlockFailure>,
    /// SHA-256 of the path and every failing block's dialect and content.
    pub key: String,
}

impl IssueRecord {
    pub fn new(path: &str, commit_sha: &str, failures: Vec<BlockFailure>) -> Self {
        Self {
            key: idempotency_key(path, &failures),
            path: path.to_string(),
            commit_sha: commit_sha.to_string(),
            failures,
        }
    }

    pub fn title(&self) -> String {
        let mut dialects: Vec<&str> = self.failures.iter().map(|f| f.dialect.as_str()).collect();
        dialects.dedup();
        format!("Invalid {} diagram in {}", dialects.join("/"), self.path)
    }

    pub fn body(&self) -> String {
        let mut body = format!(
            "Diagram validation failed for `{}` at commit {}.\n",
            self.path, self.commit_sha
        );
        for (i, failure) in self.failures.iter().enumerate() {
            body.push_str(&format!(
                "\n### Block {} (`{}`, bytes {}..{})\n\n",
                i + 1,
                failure.dialect,
                failure.start,
                failure.end
            ));
            for error in &failure.errors {
                body.push_str(&format!("- {error}\n"));
            }
        }
        body.push_str(&format!("\n<!-- {ISSUE_KEY_MARKER}{} -->\n", self.key));
        body
    }

    pub fn to_new_issue(&self, labels: &[String]) -> NewIssue {
        NewIssue {
            title: self.title(),
            body: self.body(),
            labels: labels.to_vec(),
            key: self.key.clone(),
        }
    }
}

pub fn idempotency_key(path: &str, failures: &[BlockFailure]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    for failure in failures {
        hasher.update([0u8]);
        hasher.update(failure.dialect.as_bytes());
        hasher.update([0u8]);
        hasher.update(failure.content.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FiledIssue {
    pub number: u64,
    pub path: String,
    pub key: String,
    /// An open issue with the same key already existed.
    pub reused: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub commit: Option<String>,
    pub written: Vec<String>,
    pub deleted: Vec<String>,
    pub issues: Vec<FiledIssue>,
    pub errors: Vec<PipelineError>,
}

pub struct Reconciler<'a> {
    platform: &'a dyn HostingPlatform,
    target: &'a RepoTarget,
    policy: &'a RetryPolicy,
}

impl<'a> Reconciler<'a> {
    pub fn new(platform: &'a dyn HostingPlatform, target: &'a RepoTarget, policy: &'a RetryPolicy) -> Self {
        Self {
            platform,
            target,
            policy,
        }
    }

    /// File issues for invalid files, then commit every metadata change at once.
    pub async fn reconcile(&self, commit_sha: &str, outcomes: &[FileOutcome]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if outcomes.is_empty() {
            return report;
        }

        for outcome in outcomes {
            if let FileOutcome::Invalid { path, failures } = outcome {
                let record = IssueRecord::new(path, commit_sha, failures.clone());
                match self.file_issue(&record).await {
                    Ok(filed) => report.issues.push(filed),
                    Err(e) => report.errors.push(e),
                }
            }
        }
        if !report.errors.is_empty() {
            return report;
        }

        match self.commit(commit_sha, outcomes).await {
            Ok(Some((sha, batch))) => {
                for change in batch.changes {
                    if change.op.is_delete() {
                        report.deleted.push(change.op.path);
                    } else {
                        report.written.push(change.op.path);
                    }
                }
                crate::metrics::metadata_files("write", report.written.len());
                crate::metrics::metadata_files("delete", report.deleted.len());
                report.commit = Some(sha);
            }
            Ok(None) => {}
            Err(e) => report.errors.push(e),
        }
        report
    }

    /// Check-then-open. Two runs racing on the same key may both open; that is tolerated.
    pub async fn file_issue(&self, record: &IssueRecord) -> PipelineResult<FiledIssue> {
        let existing = with_backoff(self.policy, "find_open_issue", || {
            self.platform.find_open_issue(self.target, &record.key)
        })
        .await?;

        if let Some(number) = existing {
            tracing::info!(
                repo = %self.target.repository,
                path = %record.path,
                issue = number,
                "Open issue already tracks this failure"
            );
            return Ok(FiledIssue {
                number,
                path: record.path.clone(),
                key: record.key.clone(),
                reused: true,
            });
        }

        let issue = record.to_new_issue(&self.target.issue_labels);
        let number = with_backoff(self.policy, "create_issue", || {
            self.platform.create_issue(self.target, &issue)
        })
        .await?;

        crate::metrics::issue_opened();
        tracing::info!(
            repo = %self.target.repository,
            path = %record.path,
            issue = number,
            "Opened validation issue"
        );
        Ok(FiledIssue {
            number,
            path: record.path.clone(),
            key: record.key.clone(),
            reused: false,
        })
    }

    /// Stage against the head and commit; restage once if the head moved.
    async fn commit(
        &self,
        commit_sha: &str,
        outcomes: &[FileOutcome],
    ) -> PipelineResult<Option<(String, ReconciliationBatch)>> {
        let branch = self.target.branch.as_str();
        let mut conflicted = false;

        loop {
            let head = with_backoff(self.policy, "branch_head", || {
                self.platform.branch_head(self.target, branch)
            })
            .await?;

            let batch = self.stage(commit_sha, &head, outcomes).await?;
            if batch.is_empty() {
                tracing::info!(repo = %self.target.repository, commit = commit_sha, "No metadata changes to commit");
                return Ok(None);
            }

            let ops = batch.ops();
            let message = batch.message();
            let result = with_backoff(self.policy, "commit_batch", || {
                self.platform.commit_batch(self.target, branch, &head, &ops, &message)
            })
            .await;

            match result {
                Ok(sha) => {
                    tracing::info!(
                        repo = %self.target.repository,
                        commit = commit_sha,
                        new_commit = %sha,
                        files = ops.len(),
                        "Committed metadata batch"
                    );
                    return Ok(Some((sha, batch)));
                }
                Err(PlatformError::Conflict { message, .. }) if !conflicted => {
                    tracing::warn!(
                        repo = %self.target.repository,
                        branch,
                        "Branch moved during commit, restaging once: {message}"
                    );
                    conflicted = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Decide the sidecar operation for every outcome, reading sidecars at `head`.
    ///
    /// Each sidecar path belongs to exactly one source. Two sources claiming
    /// the same path is an error, and a delete only removes a sidecar whose
    /// record names the deleted source.
    pub async fn stage(
        &self,
        commit_sha: &str,
        head: &str,
        outcomes: &[FileOutcome],
    ) -> PipelineResult<ReconciliationBatch> {
        let mut changes = Vec::new();
        let mut claimed: HashMap<String, &str> = HashMap::new();

        for outcome in outcomes {
            let FileOutcome::Analyzed { path, metadata } = outcome else {
                continue;
            };
            let sidecar = sidecar_path(path, &self.target.metadata_suffix);
            if let Some(first) = claimed.insert(sidecar.clone(), path) {
                return Err(PipelineError::SidecarCollision {
                    sidecar,
                    first: first.to_string(),
                    second: path.clone(),
                });
            }

            let existing = self
                .read_sidecar(&sidecar, head)
                .await?
                .as_deref()
                .and_then(DiagramMetadata::from_bytes);
            if let Some(current) = existing {
                if current.same_analysis(metadata) {
                    tracing::debug!(path = %sidecar, "Sidecar already up to date");
                    continue;
                }
                let other_owner = current.source_path != *path
                    && self.still_claims(&current.source_path, commit_sha, outcomes).await?;
                if other_owner {
                    return Err(PipelineError::SidecarCollision {
                        sidecar,
                        first: current.source_path,
                        second: path.clone(),
                    });
                }
            }
            changes.push(StagedChange {
                source_path: path.clone(),
                op: FileOp::write(sidecar, metadata.to_bytes()),
            });
        }

        for outcome in outcomes {
            let (FileOutcome::NoBlocks { path } | FileOutcome::Deleted { path }) = outcome else {
                continue;
            };
            let sidecar = sidecar_path(path, &self.target.metadata_suffix);
            if claimed.contains_key(&sidecar) {
                // Rewritten for another source in this batch.
                continue;
            }
            let Some(bytes) = self.read_sidecar(&sidecar, head).await? else {
                continue;
            };
            let owned = DiagramMetadata::from_bytes(&bytes).is_some_and(|m| m.source_path == *path);
            if !owned {
                tracing::warn!(path = %sidecar, source = %path, "Sidecar does not belong to this source, leaving it");
                continue;
            }
            changes.push(StagedChange {
                source_path: path.clone(),
                op: FileOp::delete(sidecar),
            });
        }

        Ok(ReconciliationBatch {
            commit_sha: commit_sha.to_string(),
            changes,
        })
    }

    /// Whether `source` still owns its sidecar: present at `commit_sha` and
    /// not dropped or emptied by this event.
    async fn still_claims(
        &self,
        source: &str,
        commit_sha: &str,
        outcomes: &[FileOutcome],
    ) -> PipelineResult<bool> {
        let settled = outcomes.iter().find(|o| o.path() == source);
        if let Some(outcome) = settled {
            return Ok(matches!(outcome, FileOutcome::Analyzed { .. } | FileOutcome::Invalid { .. }));
        }
        let content = with_backoff(self.policy, "fetch_content", || {
            self.platform.fetch_content(self.target, source, commit_sha)
        })
        .await?;
        Ok(content.is_some())
    }

    async fn read_sidecar(&self, path: &str, head: &str) -> PipelineResult<Option<Vec<u8>>> {
        Ok(with_backoff(self.policy, "fetch_sidecar", || {
            self.platform.fetch_content(self.target, path, head)
        })
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(dialect: &str, content: &str) -> BlockFailure {
        BlockFailure {
            dialect: dialect.to_string(),
            start: 10,
            end: 10 + content.len(),
            content: content.to_string(),
            errors: vec!["missing diagram-kind declaration".to_string()],
        }
    }

    #[test]
    fn key_depends_on_path_and_failing_content() {
        let a = idempotency_key("docs/a.md", &[failure("flow", "A --> B")]);
        assert_eq!(a, idempotency_key("docs/a.md", &[failure("flow", "A --> B")]));
        assert_ne!(a, idempotency_key("docs/b.md", &[failure("flow", "A --> B")]));
        assert_ne!(a, idempotency_key("docs/a.md", &[failure("flow", "A --> C")]));
        assert_ne!(a, idempotency_key("docs/a.md", &[failure("sequence", "A --> B")]));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn issue_body_lists_errors_and_key() {
        let record = IssueRecord::new("docs/a.md", "abc1234def", vec![failure("flow", "A --> B")]);
        assert_eq!(record.title(), "Invalid flow diagram in docs/a.md");
        let body = record.body();
        assert!(body.contains("### Block 1 (`flow`, bytes 10..17)"));
        assert!(body.contains("- missing diagram-kind declaration"));
        assert!(body.contains(&format!("{ISSUE_KEY_MARKER}{}", record.key)));
    }

    #[test]
    fn batch_message_enumerates_files() {
        let batch = ReconciliationBatch {
            commit_sha: "0123456789abcdef".to_string(),
            changes: vec![
                StagedChange {
                    source_path: "docs/a.md".into(),
                    op: FileOp::write("docs/a.diagram.json", b"{}".to_vec()),
                },
                StagedChange {
                    source_path: "docs/b.md".into(),
                    op: FileOp::delete("docs/b.diagram.json"),
                },
            ],
        };
        assert_eq!(
            batch.message(),
            "Update diagram metadata for 0123456\n\n2 file(s) affected:\n\
             - write docs/a.diagram.json (docs/a.md)\n\
             - delete docs/b.diagram.json (docs/b.md)\n"
        );
    }

    #[test]
    fn batch_message_shortens_non_ascii_commit_ids() {
        let batch = ReconciliationBatch {
            commit_sha: "aaaaaa\u{e9}\u{e9}".to_string(),
            changes: Vec::new(),
        };
        assert!(batch.message().starts_with("Update diagram metadata for aaaaaa\u{e9}\n"));
    }
}
