//! Pipeline orchestration — per-repository queues, run state, idempotency.
//!
//! Each monitored repository gets one worker task fed by a bounded queue, so
//! events for the same repository run strictly in arrival order while
//! different repositories proceed in parallel. Within a run the per-file
//! stages run concurrently; reconciliation is the single write point.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::detector;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{ChangeEvent, DiagramChange, EventType, FileStatus, RepoTarget};
use crate::platform::HostingPlatform;
use crate::reconciler::{FiledIssue, Reconciler};
use crate::retry::{with_backoff, RetryPolicy};
use crate::stages::{analyze_source, FileOutcome};
use crate::validator::DialectRegistry;

/// Commit ids remembered per repository for deduplication.
const SEEN_COMMITS_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Pending events per repository before submissions are refused.
    pub queue_depth: usize,
    /// Files analyzed concurrently within one run.
    pub file_concurrency: usize,
    /// Acknowledgements kept per repository for status queries.
    pub history_len: usize,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 32,
            file_concurrency: 8,
            history_len: 20,
            retry: RetryPolicy::default(),
        }
    }
}

/// Where a repository's worker is in its current run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Detecting { commit: String },
    Processing { commit: String, index: usize, total: usize },
    Reconciling { commit: String },
    /// Last run ended in failure; the next event starts a fresh run.
    Failed { commit: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Final report for one processed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Acknowledgement {
    pub run_id: Uuid,
    pub repository: String,
    pub commit_sha: String,
    pub status: RunStatus,
    /// Metadata commit created by this run, if any.
    pub new_commit: Option<String>,
    pub written: Vec<String>,
    pub deleted: Vec<String>,
    pub issues: Vec<FiledIssue>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// Answer to `Orchestrator::submit`. Never blocks on the run itself.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Accepted; the receiver resolves when the run finishes.
    Queued(oneshot::Receiver<Acknowledgement>),
    /// Commit already queued or processed.
    Duplicate,
    /// Not a push to the monitored branch.
    Ignored(String),
    UnknownRepository,
    /// Queue full.
    Busy,
}

/// Runs one event end to end and publishes its progress.
pub struct Pipeline {
    platform: Arc<dyn HostingPlatform>,
    registry: Arc<DialectRegistry>,
    config: PipelineConfig,
    state: watch::Sender<RunState>,
}

impl Pipeline {
    pub fn new(
        platform: Arc<dyn HostingPlatform>,
        registry: Arc<DialectRegistry>,
        config: PipelineConfig,
    ) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            platform,
            registry,
            config,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Detect → per-file stages → reconcile, collecting every error.
    pub async fn run(&self, target: &RepoTarget, event: &ChangeEvent) -> Acknowledgement {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "diagram_run",
            repo = %target.repository,
            commit = %event.commit_sha,
            %run_id
        );
        self.run_inner(run_id, target, event).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, target: &RepoTarget, event: &ChangeEvent) -> Acknowledgement {
        let started = Instant::now();
        let commit = event.commit_sha.clone();
        let mut ack = Acknowledgement {
            run_id,
            repository: target.repository.clone(),
            commit_sha: commit.clone(),
            status: RunStatus::Completed,
            new_commit: None,
            written: Vec::new(),
            deleted: Vec::new(),
            issues: Vec::new(),
            errors: Vec::new(),
            duration_ms: 0,
        };

        self.state.send_replace(RunState::Detecting {
            commit: commit.clone(),
        });
        let changes = detector::detect(self.platform.as_ref(), target, event, &self.config.retry).await;
        tracing::info!(files = changes.len(), "Processing diagram changes");

        let total = changes.len();
        let generated_at = event.committed_at.unwrap_or_else(Utc::now);
        let mut results = stream::iter(0..total)
            .map(|i| self.process_change(target, event, &changes[i], generated_at))
            .buffered(self.config.file_concurrency.max(1));

        let mut outcomes = Vec::with_capacity(total);
        let mut errors = Vec::new();
        let mut index = 0;
        while let Some(result) = results.next().await {
            index += 1;
            self.state.send_replace(RunState::Processing {
                commit: commit.clone(),
                index,
                total,
            });
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => errors.push(e),
            }
        }
        drop(results);

        if errors.is_empty() {
            self.state.send_replace(RunState::Reconciling {
                commit: commit.clone(),
            });
            let report = Reconciler::new(self.platform.as_ref(), target, &self.config.retry)
                .reconcile(&commit, &outcomes)
                .await;
            ack.new_commit = report.commit;
            ack.written = report.written;
            ack.deleted = report.deleted;
            ack.issues = report.issues;
            errors = report.errors;
        }

        ack.duration_ms = started.elapsed().as_millis() as u64;
        if errors.is_empty() {
            self.state.send_replace(RunState::Idle);
            tracing::info!(
                new_commit = ?ack.new_commit,
                written = ack.written.len(),
                deleted = ack.deleted.len(),
                issues = ack.issues.len(),
                duration_ms = ack.duration_ms,
                "Run completed"
            );
        } else {
            ack.status = RunStatus::Failed;
            ack.errors = errors.iter().map(ToString::to_string).collect();
            let reason = ack.errors.join("; ");
            tracing::error!(errors = errors.len(), "Run failed: {reason}");
            self.state.send_replace(RunState::Failed { commit, reason });
        }

        let status = match ack.status {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        crate::metrics::run_finished(status, ack.duration_ms);
        ack
    }

    async fn process_change(
        &self,
        target: &RepoTarget,
        event: &ChangeEvent,
        change: &DiagramChange,
        generated_at: chrono::DateTime<Utc>,
    ) -> PipelineResult<FileOutcome> {
        if change.action == FileStatus::Deleted {
            return Ok(FileOutcome::Deleted {
                path: change.path.clone(),
            });
        }

        let fetched = with_backoff(&self.config.retry, "fetch_content", || {
            self.platform.fetch_content(target, &change.path, &event.commit_sha)
        })
        .await?;
        let Some(bytes) = fetched else {
            return Err(PipelineError::PermanentPlatform(format!(
                "{} not found at {}",
                change.path, event.commit_sha
            )));
        };

        let text = String::from_utf8_lossy(&bytes);
        Ok(analyze_source(&self.registry, &change.path, &text, generated_at))
    }

    /// Report a run whose task died before producing an acknowledgement.
    fn aborted(&self, target: &RepoTarget, commit: &str, reason: String) -> Acknowledgement {
        let error = PipelineError::RunAborted(reason).to_string();
        tracing::error!(repo = %target.repository, commit, "Run failed: {error}");
        self.state.send_replace(RunState::Failed {
            commit: commit.to_string(),
            reason: error.clone(),
        });
        crate::metrics::run_finished("failed", 0);
        Acknowledgement {
            run_id: Uuid::new_v4(),
            repository: target.repository.clone(),
            commit_sha: commit.to_string(),
            status: RunStatus::Failed,
            new_commit: None,
            written: Vec::new(),
            deleted: Vec::new(),
            issues: Vec::new(),
            errors: vec![error],
            duration_ms: 0,
        }
    }
}

/// Commit ids seen by one repository plus its recent acknowledgements.
struct Ledger {
    seen: HashSet<String>,
    order: VecDeque<String>,
    history: VecDeque<Acknowledgement>,
    history_len: usize,
}

impl Ledger {
    fn new(history_len: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            history: VecDeque::new(),
            history_len,
        }
    }

    /// Mark a commit as seen. False if it already was.
    fn claim(&mut self, commit: &str) -> bool {
        if !self.seen.insert(commit.to_string()) {
            return false;
        }
        self.order.push_back(commit.to_string());
        if self.order.len() > SEEN_COMMITS_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    fn release(&mut self, commit: &str) {
        self.seen.remove(commit);
        self.order.retain(|c| c != commit);
    }

    fn record(&mut self, ack: Acknowledgement) {
        self.history.push_front(ack);
        self.history.truncate(self.history_len);
    }
}

struct Job {
    event: ChangeEvent,
    reply: oneshot::Sender<Acknowledgement>,
}

struct RepoWorker {
    target: watch::Sender<Arc<RepoTarget>>,
    queue: mpsc::Sender<Job>,
    state: watch::Receiver<RunState>,
    ledger: Arc<Mutex<Ledger>>,
    handle: JoinHandle<()>,
}

/// A removed repository's worker, still draining its queue.
struct Retired {
    ledger: Arc<Mutex<Ledger>>,
    handle: JoinHandle<()>,
}

/// Owns one worker per monitored repository.
pub struct Orchestrator {
    platform: Arc<dyn HostingPlatform>,
    registry: Arc<DialectRegistry>,
    config: PipelineConfig,
    workers: RwLock<HashMap<String, RepoWorker>>,
    retired: Mutex<HashMap<String, Retired>>,
}

fn repo_key(repository: &str) -> String {
    repository.to_ascii_lowercase()
}

impl Orchestrator {
    /// Validate targets and spawn a worker for each. Must run inside a tokio runtime.
    pub fn start(
        platform: Arc<dyn HostingPlatform>,
        registry: Arc<DialectRegistry>,
        targets: Vec<RepoTarget>,
        config: PipelineConfig,
    ) -> PipelineResult<Self> {
        let orchestrator = Self {
            platform,
            registry,
            config,
            workers: RwLock::new(HashMap::new()),
            retired: Mutex::new(HashMap::new()),
        };
        orchestrator.reload(targets)?;
        Ok(orchestrator)
    }

    /// Swap in a new target set. Nothing changes unless every target is valid.
    ///
    /// Existing workers pick up the new target on their next run; workers for
    /// removed repositories finish their queue and stop. A repository added
    /// back while its old worker drains keeps its ledger and waits for that
    /// worker before running anything new.
    pub fn reload(&self, targets: Vec<RepoTarget>) -> PipelineResult<()> {
        let mut validated = HashMap::new();
        for target in targets {
            let target = target.validate()?;
            let key = repo_key(&target.repository);
            if validated.insert(key, target).is_some() {
                return Err(PipelineError::Configuration(
                    "repository listed more than once".to_string(),
                ));
            }
        }

        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        let mut retired = self.retired.lock().unwrap_or_else(|e| e.into_inner());

        let removed: Vec<String> = workers
            .keys()
            .filter(|key| !validated.contains_key(*key))
            .cloned()
            .collect();
        for key in removed {
            if let Some(worker) = workers.remove(&key) {
                tracing::info!(repo = %key, "Repository removed, worker will drain and stop");
                retired.insert(
                    key,
                    Retired {
                        ledger: worker.ledger,
                        handle: worker.handle,
                    },
                );
            }
        }

        for (key, target) in validated {
            if let Some(worker) = workers.get(&key).filter(|w| !w.queue.is_closed()) {
                worker.target.send_replace(Arc::new(target));
                continue;
            }
            let (ledger, predecessor) = match workers.remove(&key) {
                Some(stopped) => {
                    tracing::warn!(repo = %target.repository, "Repository worker stopped, restarting");
                    (Some(stopped.ledger), None)
                }
                None => match retired.remove(&key) {
                    Some(old) => (Some(old.ledger), Some(old.handle)),
                    None => (None, None),
                },
            };
            tracing::info!(repo = %target.repository, branch = %target.branch, "Starting repository worker");
            let worker = self.spawn_worker(target, ledger, predecessor);
            workers.insert(key, worker);
        }

        retired.retain(|_, r| !r.handle.is_finished());
        Ok(())
    }

    fn spawn_worker(
        &self,
        target: RepoTarget,
        ledger: Option<Arc<Mutex<Ledger>>>,
        predecessor: Option<JoinHandle<()>>,
    ) -> RepoWorker {
        let pipeline = Arc::new(Pipeline::new(
            self.platform.clone(),
            self.registry.clone(),
            self.config.clone(),
        ));
        let (target_tx, target_rx) = watch::channel(Arc::new(target));
        let (queue, rx) = mpsc::channel(self.config.queue_depth.max(1));
        let ledger = ledger.unwrap_or_else(|| Arc::new(Mutex::new(Ledger::new(self.config.history_len))));
        let state = pipeline.subscribe();
        let handle = tokio::spawn(run_worker(pipeline, target_rx, rx, ledger.clone(), predecessor));
        RepoWorker {
            target: target_tx,
            queue,
            state,
            ledger,
            handle,
        }
    }

    /// Route an event to its repository's queue without waiting for the run.
    pub fn submit(&self, event: ChangeEvent) -> SubmitOutcome {
        if event.event_type != EventType::Push {
            return SubmitOutcome::Ignored(format!("{} events are not processed", event.event_type));
        }

        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        let Some(worker) = workers.get(&repo_key(&event.repository)) else {
            return SubmitOutcome::UnknownRepository;
        };

        let branch = worker.target.borrow().branch.clone();
        if event.branch_name() != branch {
            return SubmitOutcome::Ignored(format!("branch {} is not monitored", event.branch_name()));
        }

        let mut ledger = worker.ledger.lock().unwrap_or_else(|e| e.into_inner());
        if !ledger.claim(&event.commit_sha) {
            tracing::info!(repo = %event.repository, commit = %event.commit_sha, "Duplicate delivery acknowledged");
            return SubmitOutcome::Duplicate;
        }

        let (reply, rx) = oneshot::channel();
        let commit = event.commit_sha.clone();
        match worker.queue.try_send(Job { event, reply }) {
            Ok(()) => SubmitOutcome::Queued(rx),
            Err(mpsc::error::TrySendError::Full(_)) => {
                ledger.release(&commit);
                tracing::warn!(commit = %commit, "Repository queue full, refusing event");
                SubmitOutcome::Busy
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                ledger.release(&commit);
                SubmitOutcome::UnknownRepository
            }
        }
    }

    pub fn repositories(&self) -> Vec<String> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        let mut repos: Vec<String> = workers
            .values()
            .map(|w| w.target.borrow().repository.clone())
            .collect();
        repos.sort();
        repos
    }

    pub fn state(&self, repository: &str) -> Option<RunState> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        workers
            .get(&repo_key(repository))
            .map(|w| w.state.borrow().clone())
    }

    /// Most recent acknowledgements, newest first.
    pub fn history(&self, repository: &str) -> Option<Vec<Acknowledgement>> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        let worker = workers.get(&repo_key(repository))?;
        let ledger = worker.ledger.lock().unwrap_or_else(|e| e.into_inner());
        Some(ledger.history.iter().cloned().collect())
    }
}

async fn run_worker(
    pipeline: Arc<Pipeline>,
    target: watch::Receiver<Arc<RepoTarget>>,
    mut queue: mpsc::Receiver<Job>,
    ledger: Arc<Mutex<Ledger>>,
    predecessor: Option<JoinHandle<()>>,
) {
    if let Some(previous) = predecessor {
        // The old worker's runs must land first.
        let _ = previous.await;
    }

    while let Some(job) = queue.recv().await {
        let current = target.borrow().clone();
        let commit = job.event.commit_sha.clone();

        // Each run gets its own task so a panic fails that run, not the worker.
        let run = tokio::spawn({
            let pipeline = pipeline.clone();
            let current = current.clone();
            let event = job.event;
            async move { pipeline.run(&current, &event).await }
        });
        let ack = match run.await {
            Ok(ack) => ack,
            Err(e) => pipeline.aborted(&current, &commit, e.to_string()),
        };

        ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(ack.clone());
        // The submitter may not be waiting.
        let _ = job.reply.send(ack);
    }
    tracing::debug!("Repository worker stopped");
}
