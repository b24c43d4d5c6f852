//! In-memory hosting platform (testing and dry runs).
//!
//! `MemoryPlatform` keeps full file snapshots per commit, moves branch heads
//! on commit, stores issues, and can be told to fail specific calls.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::PlatformError;
use crate::model::RepoTarget;
use crate::platform::{FileOp, HostingPlatform, NewIssue, PlatformResult};

/// Which platform call an injected failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformCall {
    FetchContent,
    BranchHead,
    CommitBatch,
    FindOpenIssue,
    CreateIssue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommit {
    pub sha: String,
    pub parent: String,
    pub message: String,
    pub ops: Vec<FileOp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedIssue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub key: String,
    pub open: bool,
}

type Snapshot = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Default)]
struct RepoState {
    snapshots: HashMap<String, Snapshot>,
    heads: HashMap<String, String>,
    commits: Vec<RecordedCommit>,
    issues: Vec<RecordedIssue>,
}

#[derive(Debug, Default)]
struct State {
    repos: HashMap<String, RepoState>,
    failures: HashMap<PlatformCall, VecDeque<PlatformError>>,
    calls: HashMap<PlatformCall, usize>,
    next_sha: u64,
}

impl State {
    /// Count the call and pop an injected failure for it, if any.
    fn enter(&mut self, call: PlatformCall) -> PlatformResult<()> {
        *self.calls.entry(call).or_default() += 1;
        match self.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn repo(&mut self, repository: &str) -> &mut RepoState {
        self.repos.entry(repository.to_string()).or_default()
    }
}

#[derive(Debug, Default)]
pub struct MemoryPlatform {
    state: Mutex<State>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a commit with exactly `files` and point `branch` at it.
    pub fn seed_commit(&self, repository: &str, branch: &str, sha: &str, files: &[(&str, &str)]) {
        let mut state = self.state.lock().unwrap();
        let repo = state.repo(repository);
        let snapshot = files
            .iter()
            .map(|(path, content)| (path.to_string(), content.as_bytes().to_vec()))
            .collect();
        repo.snapshots.insert(sha.to_string(), snapshot);
        repo.heads.insert(branch.to_string(), sha.to_string());
    }

    /// Queue a failure for the next call of the given kind.
    pub fn fail_next(&self, call: PlatformCall, err: PlatformError) {
        let mut state = self.state.lock().unwrap();
        state.failures.entry(call).or_default().push_back(err);
    }

    pub fn calls(&self, call: PlatformCall) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.get(&call).copied().unwrap_or(0)
    }

    /// File content at a commit sha or branch name.
    pub fn file(&self, repository: &str, git_ref: &str, path: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        let repo = state.repo(repository);
        let sha = repo.heads.get(git_ref).cloned().unwrap_or_else(|| git_ref.to_string());
        repo.snapshots
            .get(&sha)?
            .get(path)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn head(&self, repository: &str, branch: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        state.repo(repository).heads.get(branch).cloned()
    }

    pub fn commits(&self, repository: &str) -> Vec<RecordedCommit> {
        let mut state = self.state.lock().unwrap();
        state.repo(repository).commits.clone()
    }

    pub fn issues(&self, repository: &str) -> Vec<RecordedIssue> {
        let mut state = self.state.lock().unwrap();
        state.repo(repository).issues.clone()
    }

    pub fn close_issue(&self, repository: &str, number: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(issue) = state
            .repo(repository)
            .issues
            .iter_mut()
            .find(|i| i.number == number)
        {
            issue.open = false;
        }
    }
}

#[async_trait]
impl HostingPlatform for MemoryPlatform {
    async fn fetch_content(
        &self,
        target: &RepoTarget,
        path: &str,
        git_ref: &str,
    ) -> PlatformResult<Option<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        state.enter(PlatformCall::FetchContent)?;
        let repo = state.repo(&target.repository);
        let sha = repo.heads.get(git_ref).cloned().unwrap_or_else(|| git_ref.to_string());
        Ok(repo
            .snapshots
            .get(&sha)
            .and_then(|snapshot| snapshot.get(path))
            .cloned())
    }

    async fn branch_head(&self, target: &RepoTarget, branch: &str) -> PlatformResult<String> {
        let mut state = self.state.lock().unwrap();
        state.enter(PlatformCall::BranchHead)?;
        state
            .repo(&target.repository)
            .heads
            .get(branch)
            .cloned()
            .ok_or_else(|| PlatformError::permanent("branch_head", format!("no branch {branch}")))
    }

    async fn commit_batch(
        &self,
        target: &RepoTarget,
        branch: &str,
        base: &str,
        ops: &[FileOp],
        message: &str,
    ) -> PlatformResult<String> {
        let mut state = self.state.lock().unwrap();
        state.enter(PlatformCall::CommitBatch)?;
        state.next_sha += 1;
        let sha = format!("mem-{}", state.next_sha);

        let repo = state.repo(&target.repository);
        if repo.heads.get(branch).map(String::as_str) != Some(base) {
            return Err(PlatformError::conflict(branch, format!("head is no longer {base}")));
        }

        // Build the whole snapshot before touching any state.
        let mut snapshot = repo.snapshots.get(base).cloned().unwrap_or_default();
        for op in ops {
            match &op.content {
                Some(content) => {
                    snapshot.insert(op.path.clone(), content.clone());
                }
                None => {
                    if snapshot.remove(&op.path).is_none() {
                        return Err(PlatformError::permanent(
                            "commit_batch",
                            format!("cannot delete missing path {}", op.path),
                        ));
                    }
                }
            }
        }

        repo.snapshots.insert(sha.clone(), snapshot);
        repo.heads.insert(branch.to_string(), sha.clone());
        repo.commits.push(RecordedCommit {
            sha: sha.clone(),
            parent: base.to_string(),
            message: message.to_string(),
            ops: ops.to_vec(),
        });
        Ok(sha)
    }

    async fn find_open_issue(&self, target: &RepoTarget, key: &str) -> PlatformResult<Option<u64>> {
        let mut state = self.state.lock().unwrap();
        state.enter(PlatformCall::FindOpenIssue)?;
        Ok(state
            .repo(&target.repository)
            .issues
            .iter()
            .find(|i| i.open && i.key == key)
            .map(|i| i.number))
    }

    async fn create_issue(&self, target: &RepoTarget, issue: &NewIssue) -> PlatformResult<u64> {
        let mut state = self.state.lock().unwrap();
        state.enter(PlatformCall::CreateIssue)?;
        let issues = &mut state.repo(&target.repository).issues;
        let number = issues.len() as u64 + 1;
        issues.push(RecordedIssue {
            number,
            title: issue.title.clone(),
            body: issue.body.clone(),
            labels: issue.labels.clone(),
            key: issue.key.clone(),
            open: true,
        });
        Ok(number)
    }
}
