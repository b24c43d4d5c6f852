//! Orchestrator routing: dedup, ignored events, per-repository queues, reload.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use diagram_pipeline::error::PlatformError;
use diagram_pipeline::fakes::MemoryPlatform;
use diagram_pipeline::platform::PlatformResult;
use diagram_pipeline::retry::RetryPolicy;
use diagram_pipeline::{
    ChangeEvent, ChangedFile, DialectRegistry, EventType, FileOp, FileStatus, HostingPlatform,
    NewIssue, Orchestrator, PipelineConfig, PipelineError, RepoTarget, RunState, RunStatus,
    SubmitOutcome,
};
use tokio::sync::Semaphore;

const FLOW: &str = "```flow\ngraph LR\n  A[a] --> B[b]\n```\n";

/// Wraps `MemoryPlatform`, holding content fetches for one repository until released.
struct GatedPlatform {
    inner: MemoryPlatform,
    gated_repo: String,
    gate: Semaphore,
    panic_on_commit: AtomicBool,
}

impl GatedPlatform {
    fn new(gated_repo: &str) -> Self {
        Self {
            inner: MemoryPlatform::new(),
            gated_repo: gated_repo.to_string(),
            gate: Semaphore::new(0),
            panic_on_commit: AtomicBool::new(false),
        }
    }

    fn panic_next_commit(&self) {
        self.panic_on_commit.store(true, Ordering::SeqCst);
    }

    fn open(&self) {
        self.gate.add_permits(1_000);
    }
}

#[async_trait]
impl HostingPlatform for GatedPlatform {
    async fn fetch_content(
        &self,
        target: &RepoTarget,
        path: &str,
        git_ref: &str,
    ) -> PlatformResult<Option<Vec<u8>>> {
        if target.repository == self.gated_repo {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| PlatformError::transient("fetch_content", e.to_string()))?;
        }
        self.inner.fetch_content(target, path, git_ref).await
    }

    async fn branch_head(&self, target: &RepoTarget, branch: &str) -> PlatformResult<String> {
        self.inner.branch_head(target, branch).await
    }

    async fn commit_batch(
        &self,
        target: &RepoTarget,
        branch: &str,
        base: &str,
        ops: &[FileOp],
        message: &str,
    ) -> PlatformResult<String> {
        if self.panic_on_commit.swap(false, Ordering::SeqCst) {
            panic!("commit_batch blew up");
        }
        self.inner.commit_batch(target, branch, base, ops, message).await
    }

    async fn find_open_issue(&self, target: &RepoTarget, key: &str) -> PlatformResult<Option<u64>> {
        self.inner.find_open_issue(target, key).await
    }

    async fn create_issue(&self, target: &RepoTarget, issue: &NewIssue) -> PlatformResult<u64> {
        self.inner.create_issue(target, issue).await
    }
}

fn config(queue_depth: usize) -> PipelineConfig {
    PipelineConfig {
        queue_depth,
        retry: RetryPolicy::immediate(1),
        ..PipelineConfig::default()
    }
}

fn push(repo: &str, commit: &str, parent: &str) -> ChangeEvent {
    ChangeEvent::push(
        repo,
        "refs/heads/main",
        commit,
        parent,
        vec![ChangedFile::new("docs/flow.md", FileStatus::Added)],
    )
}

fn start(platform: Arc<dyn HostingPlatform>, repos: &[&str], queue_depth: usize) -> Orchestrator {
    let targets = repos.iter().map(|r| RepoTarget::new(*r)).collect();
    Orchestrator::start(platform, Arc::new(DialectRegistry::builtin()), targets, config(queue_depth)).unwrap()
}

async fn wait_until_busy(orchestrator: &Orchestrator, repo: &str) {
    while orchestrator.state(repo) == Some(RunState::Idle) {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn queued_event_resolves_with_acknowledgement() {
    let platform = Arc::new(MemoryPlatform::new());
    platform.seed_commit("acme/docs", "main", "c2", &[("docs/flow.md", FLOW)]);
    let orchestrator = start(platform.clone(), &["acme/docs"], 4);

    let SubmitOutcome::Queued(rx) = orchestrator.submit(push("acme/docs", "c2", "c1")) else {
        panic!("event should be queued");
    };
    let ack = rx.await.unwrap();

    assert_eq!(ack.status, RunStatus::Completed);
    assert_eq!(ack.commit_sha, "c2");
    assert_eq!(ack.written, vec!["docs/flow.diagram.json"]);
    assert_eq!(orchestrator.state("acme/docs"), Some(RunState::Idle));
    let history = orchestrator.history("acme/docs").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].run_id, ack.run_id);
}

#[tokio::test]
async fn repeated_commit_is_a_duplicate() {
    let platform = Arc::new(MemoryPlatform::new());
    platform.seed_commit("acme/docs", "main", "c2", &[("docs/flow.md", FLOW)]);
    let orchestrator = start(platform.clone(), &["acme/docs"], 4);

    let SubmitOutcome::Queued(rx) = orchestrator.submit(push("acme/docs", "c2", "c1")) else {
        panic!("event should be queued");
    };
    assert!(matches!(orchestrator.submit(push("acme/docs", "c2", "c1")), SubmitOutcome::Duplicate));
    rx.await.unwrap();
    assert!(matches!(orchestrator.submit(push("acme/docs", "c2", "c1")), SubmitOutcome::Duplicate));

    assert_eq!(platform.commits("acme/docs").len(), 1);
}

#[tokio::test]
async fn non_push_and_off_branch_events_are_ignored() {
    let platform = Arc::new(MemoryPlatform::new());
    let orchestrator = start(platform, &["acme/docs"], 4);

    let mut pull_request = push("acme/docs", "c2", "c1");
    pull_request.event_type = EventType::PullRequest;
    assert!(matches!(orchestrator.submit(pull_request), SubmitOutcome::Ignored(_)));

    let mut feature = push("acme/docs", "c3", "c1");
    feature.branch = "refs/heads/feature".to_string();
    assert!(matches!(orchestrator.submit(feature), SubmitOutcome::Ignored(_)));

    assert!(matches!(
        orchestrator.submit(push("acme/other", "c4", "c1")),
        SubmitOutcome::UnknownRepository
    ));
}

#[tokio::test]
async fn repository_names_are_case_insensitive() {
    let platform = Arc::new(MemoryPlatform::new());
    platform.seed_commit("Acme/Docs", "main", "c2", &[("docs/flow.md", FLOW)]);
    let orchestrator = start(platform, &["Acme/Docs"], 4);

    assert!(matches!(orchestrator.submit(push("acme/docs", "c2", "c1")), SubmitOutcome::Queued(_)));
    assert!(orchestrator.state("ACME/DOCS").is_some());
}

#[tokio::test]
async fn full_queue_refuses_and_forgets_the_commit() {
    let platform = Arc::new(GatedPlatform::new("acme/docs"));
    platform.inner.seed_commit("acme/docs", "main", "c3", &[("docs/flow.md", FLOW)]);
    let orchestrator = start(platform.clone(), &["acme/docs"], 1);

    let SubmitOutcome::Queued(first) = orchestrator.submit(push("acme/docs", "c1", "c0")) else {
        panic!("first event should be queued");
    };
    wait_until_busy(&orchestrator, "acme/docs").await;

    let SubmitOutcome::Queued(second) = orchestrator.submit(push("acme/docs", "c2", "c1")) else {
        panic!("second event should fill the queue");
    };
    assert!(matches!(orchestrator.submit(push("acme/docs", "c3", "c2")), SubmitOutcome::Busy));

    platform.open();
    first.await.unwrap();
    second.await.unwrap();

    // A refused commit can be redelivered.
    let SubmitOutcome::Queued(third) = orchestrator.submit(push("acme/docs", "c3", "c2")) else {
        panic!("redelivered event should be queued");
    };
    assert_eq!(third.await.unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn same_repository_runs_in_arrival_order() {
    let platform = Arc::new(MemoryPlatform::new());
    platform.seed_commit("acme/docs", "main", "c1", &[("docs/flow.md", FLOW)]);
    platform.seed_commit("acme/docs", "main", "c2", &[("docs/flow.md", FLOW)]);
    let orchestrator = start(platform.clone(), &["acme/docs"], 8);

    let receivers: Vec<_> = ["c1", "c2"]
        .iter()
        .map(|commit| match orchestrator.submit(push("acme/docs", commit, "c0")) {
            SubmitOutcome::Queued(rx) => rx,
            other => panic!("unexpected outcome: {other:?}"),
        })
        .collect();
    for rx in receivers {
        rx.await.unwrap();
    }

    let commits: Vec<String> = orchestrator
        .history("acme/docs")
        .unwrap()
        .into_iter()
        .map(|ack| ack.commit_sha)
        .collect();
    assert_eq!(commits, vec!["c2", "c1"]);
}

#[tokio::test]
async fn blocked_repository_does_not_stall_others() {
    let platform = Arc::new(GatedPlatform::new("acme/slow"));
    platform.inner.seed_commit("acme/slow", "main", "s1", &[("docs/flow.md", FLOW)]);
    platform.inner.seed_commit("acme/fast", "main", "f1", &[("docs/flow.md", FLOW)]);
    let orchestrator = start(platform.clone(), &["acme/slow", "acme/fast"], 4);

    let SubmitOutcome::Queued(slow) = orchestrator.submit(push("acme/slow", "s1", "s0")) else {
        panic!("slow event should be queued");
    };
    wait_until_busy(&orchestrator, "acme/slow").await;
    let SubmitOutcome::Queued(fast) = orchestrator.submit(push("acme/fast", "f1", "f0")) else {
        panic!("fast event should be queued");
    };

    assert_eq!(fast.await.unwrap().status, RunStatus::Completed);
    assert_ne!(orchestrator.state("acme/slow"), Some(RunState::Idle));

    platform.open();
    assert_eq!(slow.await.unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn failed_run_is_visible_in_state() {
    let platform = Arc::new(MemoryPlatform::new());
    platform.seed_commit("acme/docs", "main", "c1", &[]);
    let orchestrator = start(platform, &["acme/docs"], 4);

    let SubmitOutcome::Queued(rx) = orchestrator.submit(push("acme/docs", "c1", "c0")) else {
        panic!("event should be queued");
    };
    let ack = rx.await.unwrap();

    assert_eq!(ack.status, RunStatus::Failed);
    assert!(matches!(
        orchestrator.state("acme/docs"),
        Some(RunState::Failed { commit, .. }) if commit == "c1"
    ));
}

#[tokio::test]
async fn reload_adds_and_removes_repositories() {
    let platform = Arc::new(MemoryPlatform::new());
    let orchestrator = start(platform, &["acme/docs", "acme/old"], 4);

    orchestrator
        .reload(vec![RepoTarget::new("acme/docs"), RepoTarget::new("acme/new")])
        .unwrap();

    assert_eq!(orchestrator.repositories(), vec!["acme/docs", "acme/new"]);
    assert!(matches!(
        orchestrator.submit(push("acme/old", "c1", "c0")),
        SubmitOutcome::UnknownRepository
    ));
}

#[tokio::test]
async fn readded_repository_waits_for_draining_worker() {
    let platform = Arc::new(GatedPlatform::new("acme/docs"));
    platform.inner.seed_commit("acme/docs", "main", "c1", &[("docs/flow.md", FLOW)]);
    platform.inner.seed_commit("acme/docs", "main", "c2", &[("docs/flow.md", FLOW)]);
    let orchestrator = start(platform.clone(), &["acme/docs"], 4);

    let SubmitOutcome::Queued(first) = orchestrator.submit(push("acme/docs", "c1", "c0")) else {
        panic!("first event should be queued");
    };
    wait_until_busy(&orchestrator, "acme/docs").await;

    orchestrator.reload(Vec::new()).unwrap();
    orchestrator.reload(vec![RepoTarget::new("acme/docs")]).unwrap();
    assert_eq!(orchestrator.repositories(), vec!["acme/docs"]);

    // Dedup history survives the round trip.
    assert!(matches!(orchestrator.submit(push("acme/docs", "c1", "c0")), SubmitOutcome::Duplicate));
    let SubmitOutcome::Queued(second) = orchestrator.submit(push("acme/docs", "c2", "c1")) else {
        panic!("second event should be queued");
    };
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(orchestrator.state("acme/docs"), Some(RunState::Idle));

    platform.open();
    assert_eq!(first.await.unwrap().status, RunStatus::Completed);
    assert_eq!(second.await.unwrap().status, RunStatus::Completed);

    let commits: Vec<String> = orchestrator
        .history("acme/docs")
        .unwrap()
        .into_iter()
        .map(|ack| ack.commit_sha)
        .collect();
    assert_eq!(commits, vec!["c2", "c1"]);
}

#[tokio::test]
async fn panicking_run_fails_without_stopping_the_worker() {
    let platform = Arc::new(GatedPlatform::new("acme/none"));
    platform.inner.seed_commit("acme/docs", "main", "c1", &[("docs/flow.md", FLOW)]);
    platform.inner.seed_commit("acme/docs", "main", "c2", &[("docs/flow.md", FLOW)]);
    platform.panic_next_commit();
    let orchestrator = start(platform.clone(), &["acme/docs"], 4);

    let SubmitOutcome::Queued(rx) = orchestrator.submit(push("acme/docs", "c1", "c0")) else {
        panic!("event should be queued");
    };
    let ack = rx.await.unwrap();
    assert_eq!(ack.status, RunStatus::Failed);
    assert!(ack.errors[0].starts_with("run aborted:"));
    assert!(matches!(
        orchestrator.state("acme/docs"),
        Some(RunState::Failed { commit, .. }) if commit == "c1"
    ));

    let SubmitOutcome::Queued(rx) = orchestrator.submit(push("acme/docs", "c2", "c1")) else {
        panic!("worker should still accept events");
    };
    assert_eq!(rx.await.unwrap().status, RunStatus::Completed);
    assert_eq!(orchestrator.history("acme/docs").unwrap().len(), 2);
}

#[tokio::test]
async fn non_ascii_commit_id_is_processed() {
    let commit = "aaaaaa\u{e9}\u{e9}";
    let platform = Arc::new(MemoryPlatform::new());
    platform.seed_commit("acme/docs", "main", commit, &[("docs/flow.md", FLOW)]);
    let orchestrator = start(platform.clone(), &["acme/docs"], 4);

    let SubmitOutcome::Queued(rx) = orchestrator.submit(push("acme/docs", commit, "c0")) else {
        panic!("event should be queued");
    };
    assert_eq!(rx.await.unwrap().status, RunStatus::Completed);

    let commits = platform.commits("acme/docs");
    assert!(commits[0].message.starts_with("Update diagram metadata for aaaaaa\u{e9}\n"));
    assert!(matches!(
        orchestrator.submit(push("acme/docs", "c2", commit)),
        SubmitOutcome::Queued(_)
    ));
}

#[tokio::test]
async fn reload_updates_monitored_branch() {
    let platform = Arc::new(MemoryPlatform::new());
    let orchestrator = start(platform, &["acme/docs"], 4);

    orchestrator
        .reload(vec![RepoTarget::new("acme/docs").with_branch("release")])
        .unwrap();

    assert!(matches!(
        orchestrator.submit(push("acme/docs", "c1", "c0")),
        SubmitOutcome::Ignored(_)
    ));
}

#[tokio::test]
async fn invalid_reload_keeps_previous_targets() {
    let platform = Arc::new(MemoryPlatform::new());
    let orchestrator = start(platform, &["acme/docs"], 4);

    let err = orchestrator
        .reload(vec![RepoTarget::new("acme/new"), RepoTarget::new("not-a-repo")])
        .unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));

    let err = orchestrator
        .reload(vec![RepoTarget::new("acme/docs"), RepoTarget::new("ACME/docs")])
        .unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));

    assert_eq!(orchestrator.repositories(), vec!["acme/docs"]);
}

#[tokio::test]
async fn invalid_startup_targets_are_fatal() {
    let platform: Arc<dyn HostingPlatform> = Arc::new(MemoryPlatform::new());
    let result = Orchestrator::start(
        platform,
        Arc::new(DialectRegistry::builtin()),
        vec![RepoTarget::new("acme/docs").with_extensions(&["json"])],
        config(4),
    );
    assert!(matches!(result, Err(PipelineError::Configuration(_))));
}
