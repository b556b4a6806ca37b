//! Orchestrator - fans every task out to every backend.
//!
//! Pairs are visited task-major, backend-minor so any prefix of the run
//! covers all backends within one pair of each other. Pairs already in the
//! checkpoint are filtered out before dispatch. Each remaining pair runs
//! under a wall-clock deadline; its result record is written first and the
//! checkpoint entry second.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::budget::BackendDescriptor;
use crate::checkpoint::{CheckpointError, CheckpointStore, PairKey};
use crate::results::{ResultRecord, ResultSink, ResultSinkError, PARSE_FAILED};
use crate::task::Task;
use crate::worker::{PairOutcome, VerificationWorker};

/// One unit of dispatch.
#[derive(Debug, Clone, Copy)]
pub struct Pair<'a> {
    pub task: &'a Task,
    pub backend: &'a BackendDescriptor,
}

impl Pair<'_> {
    pub fn key(&self) -> PairKey {
        PairKey::new(&self.task.id, &self.backend.id)
    }
}

/// Every distinct (task, backend) pair, interleaved across backends.
///
/// Order is strict round-robin and never adapts to slow backends. A repeated
/// task id or backend id keeps only its first occurrence.
pub fn build_execution_order<'a>(
    tasks: &'a [Task],
    backends: &'a [BackendDescriptor],
) -> Vec<Pair<'a>> {
    let mut seen = HashSet::new();
    tasks
        .iter()
        .flat_map(|task| backends.iter().map(move |backend| Pair { task, backend }))
        .filter(|pair| seen.insert(pair.key()))
        .collect()
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Wall-clock budget for one pair, both phases included.
    pub pair_timeout: Duration,
    /// Pairs in flight at once.
    pub concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pair_timeout: Duration::from_secs(180),
            concurrency: 1,
        }
    }
}

/// Failures that stop a run. Everything else is recorded and the run goes on.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Sink(#[from] ResultSinkError),
}

/// Tallies for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Distinct pairs in the task x backend set.
    pub total: usize,
    /// Pairs already in the checkpoint.
    pub skipped: usize,
    /// Pairs that produced a verdict.
    pub completed: usize,
    pub incomplete: usize,
    pub timeouts: usize,
    pub errors: usize,
    pub parse_failures: usize,
}

impl RunSummary {
    pub fn processed(&self) -> usize {
        self.total - self.skipped
    }

    fn tally(&mut self, record: &ResultRecord) {
        if record.timeout {
            self.timeouts += 1;
        } else if record.error.as_deref() == Some(PARSE_FAILED) {
            self.parse_failures += 1;
        } else if record.error.is_some() {
            self.errors += 1;
        } else if record.verdict.is_some() {
            self.completed += 1;
        }
        if record.incomplete {
            self.incomplete += 1;
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pairs: {} skipped, {} completed, {} incomplete, {} timed out, {} errors, {} parse failures",
            self.total,
            self.skipped,
            self.completed,
            self.incomplete,
            self.timeouts,
            self.errors,
            self.parse_failures
        )
    }
}

pub struct Orchestrator {
    worker: Arc<VerificationWorker>,
    checkpoint: Arc<CheckpointStore>,
    sink: Arc<dyn ResultSink>,
    config: OrchestratorConfig,
    run_id: Uuid,
}

impl Orchestrator {
    pub fn new(
        worker: Arc<VerificationWorker>,
        checkpoint: Arc<CheckpointStore>,
        sink: Arc<dyn ResultSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            worker,
            checkpoint,
            sink,
            config,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Process every unresolved pair.
    ///
    /// Returns early only when a record or checkpoint entry cannot be
    /// persisted; pairs in flight at that point stay unresolved.
    pub async fn run(
        &self,
        tasks: &[Task],
        backends: &[BackendDescriptor],
    ) -> Result<RunSummary, OrchestratorError> {
        let order = build_execution_order(tasks, backends);
        let mut summary = RunSummary {
            total: order.len(),
            ..RunSummary::default()
        };
        let mut pending = Vec::with_capacity(order.len());
        for pair in order {
            if !self.checkpoint.contains(&pair.key()).await {
                pending.push(pair);
            }
        }
        summary.skipped = summary.total - pending.len();

        tracing::info!(
            "Run {}: {} pairs pending, {} already checkpointed, concurrency {}",
            self.run_id,
            pending.len(),
            summary.skipped,
            self.config.concurrency
        );

        let mut results = stream::iter(pending)
            .map(|pair| self.process_pair(pair))
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some(result) = results.next().await {
            summary.tally(&result?);
        }

        tracing::info!("Run {} finished: {}", self.run_id, summary);
        Ok(summary)
    }

    async fn process_pair(&self, pair: Pair<'_>) -> Result<ResultRecord, OrchestratorError> {
        let key = pair.key();
        let started_at = Utc::now();
        tracing::info!("Starting {}", key);

        let record = match tokio::time::timeout(
            self.config.pair_timeout,
            self.worker.run(pair.task, pair.backend),
        )
        .await
        {
            Ok(outcome) => build_record(&key, self.run_id, started_at, outcome),
            Err(_) => {
                tracing::warn!(
                    "{} timed out after {:?}; abandoning in-flight calls",
                    key,
                    self.config.pair_timeout
                );
                ResultRecord::timed_out(&key, self.run_id, started_at)
            }
        };

        self.sink.write(&record).await?;
        self.checkpoint.record(key).await?;
        Ok(record)
    }
}

fn build_record(
    key: &PairKey,
    run_id: Uuid,
    started_at: chrono::DateTime<Utc>,
    outcome: PairOutcome,
) -> ResultRecord {
    let mut record = ResultRecord::empty(key, run_id, started_at);
    if let Some(verdict) = outcome.verdict {
        record.set_verdict(verdict);
    }
    record.finish_status = outcome.finish_status;
    record.turns = outcome.turns;
    record.usage = outcome.usage;
    record.reported_usage = outcome.reported_usage;
    record.incomplete = outcome.incomplete;
    record.error = outcome.error;
    record.finished_at = Utc::now();
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::RetryConfig;
    use crate::results::FileResultSink;
    use crate::test_support::{RecordingPageSource, ScriptedBackend, ScriptedSearch, Step};
    use crate::tools::{DomainBlocklist, FetchRateLimiter, ToolExecutor, ToolLimits};
    use crate::worker::WorkerConfig;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tempfile::{tempdir, TempDir};

    fn tasks(n: usize) -> Vec<Task> {
        (1..=n)
            .map(|i| Task::new(format!("task-{}", i), format!("Question {}?", i)))
            .collect()
    }

    fn backends() -> Vec<BackendDescriptor> {
        ["a/one", "b/two", "c/three", "d/four"]
            .iter()
            .map(|id| BackendDescriptor::new(*id, 100_000))
            .collect()
    }

    struct Harness {
        dir: TempDir,
        backend: Arc<ScriptedBackend>,
    }

    impl Harness {
        fn new(backend: ScriptedBackend) -> Self {
            Self {
                dir: tempdir().unwrap(),
                backend: Arc::new(backend),
            }
        }

        fn sink(&self) -> FileResultSink {
            FileResultSink::new(self.dir.path().join("verdicts"))
        }

        async fn orchestrator(&self, config: OrchestratorConfig) -> Orchestrator {
            self.orchestrator_with_sink(config, Arc::new(self.sink())).await
        }

        async fn orchestrator_with_sink(
            &self,
            config: OrchestratorConfig,
            sink: Arc<dyn ResultSink>,
        ) -> Orchestrator {
            let tools = ToolExecutor::new(
                Arc::new(ScriptedSearch::hits(Vec::new())),
                Arc::new(RecordingPageSource::ok("<p>text</p>")),
                DomainBlocklist::default(),
                Arc::new(FetchRateLimiter::new(Duration::from_millis(1))),
                ToolLimits::default(),
            );
            let worker = VerificationWorker::new(
                self.backend.clone(),
                Arc::new(tools),
                WorkerConfig {
                    retry: RetryConfig::none(),
                    ..WorkerConfig::default()
                },
            );
            let checkpoint = CheckpointStore::load(self.dir.path().join("state.jsonl"))
                .await
                .unwrap();
            Orchestrator::new(Arc::new(worker), Arc::new(checkpoint), sink, config)
        }

        async fn checkpoint_len(&self) -> usize {
            CheckpointStore::load(self.dir.path().join("state.jsonl"))
                .await
                .unwrap()
                .len()
                .await
        }
    }

    #[test]
    fn test_execution_order_is_interleaved() {
        let tasks = tasks(3);
        let backends = backends();
        let order = build_execution_order(&tasks, &backends);
        assert_eq!(order.len(), 12);

        let keys: Vec<String> = order.iter().take(5).map(|p| p.key().to_string()).collect();
        assert_eq!(keys[0], PairKey::new("task-1", "a/one").to_string());
        assert_eq!(keys[1], PairKey::new("task-1", "b/two").to_string());
        assert_eq!(keys[4], PairKey::new("task-2", "a/one").to_string());

        // Any prefix covers all backends within one pair of each other.
        for n in 1..=order.len() {
            let mut counts: HashMap<&str, usize> =
                backends.iter().map(|b| (b.id.as_str(), 0)).collect();
            for pair in &order[..n] {
                *counts.get_mut(pair.backend.id.as_str()).unwrap() += 1;
            }
            let max = counts.values().max().unwrap();
            let min = counts.values().min().unwrap();
            assert!(max - min <= 1, "prefix {} unbalanced: {:?}", n, counts);
        }
    }

    #[tokio::test]
    async fn test_duplicate_inputs_run_each_pair_once() {
        let backend = ScriptedBackend::new();
        let harness = Harness::new(backend);
        let mut tasks = tasks(1);
        let repeated = tasks[0].clone();
        tasks.push(repeated);
        let backends = vec![
            BackendDescriptor::new("a/one", 100_000),
            BackendDescriptor::new("a/one", 100_000),
        ];
        assert_eq!(build_execution_order(&tasks, &backends).len(), 1);

        for concurrency in [1, 2] {
            let config = OrchestratorConfig {
                concurrency,
                ..OrchestratorConfig::default()
            };
            let orchestrator = harness.orchestrator(config).await;
            let summary = orchestrator.run(&tasks, &backends).await.unwrap();
            assert_eq!(summary.total, 1);
        }

        // One investigation turn and one verdict call, then skipped on rerun.
        assert_eq!(harness.backend.calls().len(), 2);
        assert_eq!(harness.sink().read_all().await.unwrap().len(), 1);
        assert_eq!(harness.checkpoint_len().await, 1);
    }

    #[tokio::test]
    async fn test_full_run_then_rerun_is_idempotent() {
        let harness = Harness::new(ScriptedBackend::new());
        let tasks = tasks(2);
        let backends = backends();

        let orchestrator = harness.orchestrator(OrchestratorConfig::default()).await;
        let summary = tokio_test::assert_ok!(orchestrator.run(&tasks, &backends).await);
        assert_eq!(summary.total, 8);
        assert_eq!(summary.completed, 8);
        assert_eq!(harness.sink().read_all().await.unwrap().len(), 8);
        assert_eq!(harness.checkpoint_len().await, 8);

        let calls_before = harness.backend.calls().len();
        let orchestrator = harness.orchestrator(OrchestratorConfig::default()).await;
        let summary = orchestrator.run(&tasks, &backends).await.unwrap();
        assert_eq!(summary.skipped, 8);
        assert_eq!(summary.processed(), 0);
        assert_eq!(harness.backend.calls().len(), calls_before);
        assert_eq!(harness.sink().read_all().await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_resume_processes_only_remaining_pairs() {
        let harness = Harness::new(ScriptedBackend::new());
        let all_tasks = tasks(2);
        let backends = backends();

        let first = harness.orchestrator(OrchestratorConfig::default()).await;
        first.run(&all_tasks[..1], &backends).await.unwrap();
        assert_eq!(harness.checkpoint_len().await, 4);

        let second = harness.orchestrator(OrchestratorConfig::default()).await;
        let summary = second.run(&all_tasks, &backends).await.unwrap();
        assert_eq!(summary.skipped, 4);
        assert_eq!(summary.processed(), 4);

        let records = harness.sink().read_all().await.unwrap();
        assert_eq!(records.len(), 8);
        assert_eq!(harness.checkpoint_len().await, records.len());
        let second_run: Vec<&ResultRecord> =
            records.iter().filter(|r| r.run_id == second.run_id()).collect();
        assert_eq!(second_run.len(), 4);
        assert!(second_run.iter().all(|r| r.task_id == "task-2"));
    }

    #[tokio::test]
    async fn test_slow_backend_times_out_without_blocking_others() {
        let backend = ScriptedBackend::new().slow("b/two", Duration::from_secs(30));
        let harness = Harness::new(backend);
        let tasks = tasks(2);
        let backends = backends();

        let config = OrchestratorConfig {
            pair_timeout: Duration::from_millis(200),
            concurrency: 1,
        };
        let orchestrator = harness.orchestrator(config).await;
        let summary = orchestrator.run(&tasks, &backends).await.unwrap();

        assert_eq!(summary.timeouts, 2);
        assert_eq!(summary.completed, 6);

        let records = harness.sink().read_all().await.unwrap();
        assert_eq!(records.len(), 8);
        for record in &records {
            if record.backend_id == "b/two" {
                assert!(record.timeout);
                assert!(record.verdict.is_none());
                assert!(!record.usage.is_known());
            } else {
                assert!(record.is_success(), "{:?}", record);
            }
        }
        assert_eq!(harness.checkpoint_len().await, 8);
    }

    #[tokio::test]
    async fn test_parse_failure_is_recorded_and_checkpointed() {
        let backend = ScriptedBackend::new().script(
            "a/one",
            vec![Step::stop("done"), Step::stop("I think it is true")],
        );
        let harness = Harness::new(backend);
        let tasks = tasks(1);
        let backends = backends();

        let orchestrator = harness.orchestrator(OrchestratorConfig::default()).await;
        let summary = orchestrator.run(&tasks, &backends).await.unwrap();
        assert_eq!(summary.parse_failures, 1);
        assert_eq!(summary.completed, 3);

        let records = harness.sink().read_all().await.unwrap();
        let failed = records.iter().find(|r| r.backend_id == "a/one").unwrap();
        assert!(failed.verdict.is_none());
        assert_eq!(failed.error.as_deref(), Some(PARSE_FAILED));
        assert_eq!(harness.checkpoint_len().await, 4);

        // Not retried on the next run.
        let calls_before = harness.backend.calls_for("a/one").len();
        let rerun = harness.orchestrator(OrchestratorConfig::default()).await;
        rerun.run(&tasks, &backends).await.unwrap();
        assert_eq!(harness.backend.calls_for("a/one").len(), calls_before);
    }

    #[tokio::test]
    async fn test_parallel_run_keeps_counts_equal() {
        let harness = Harness::new(ScriptedBackend::new());
        let tasks = tasks(5);
        let backends = backends();

        let config = OrchestratorConfig {
            concurrency: 4,
            ..OrchestratorConfig::default()
        };
        let orchestrator = harness.orchestrator(config).await;
        let summary = orchestrator.run(&tasks, &backends).await.unwrap();
        assert_eq!(summary.completed, 20);
        assert_eq!(harness.sink().read_all().await.unwrap().len(), 20);
        assert_eq!(harness.checkpoint_len().await, 20);
    }

    struct BrokenSink;

    #[async_trait]
    impl ResultSink for BrokenSink {
        async fn write(&self, record: &ResultRecord) -> Result<(), ResultSinkError> {
            Err(ResultSinkError::Io {
                path: record.task_id.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            })
        }
    }

    #[tokio::test]
    async fn test_failed_record_write_leaves_pair_unresolved() {
        let harness = Harness::new(ScriptedBackend::new());
        let tasks = tasks(1);
        let backends = backends();

        let orchestrator = harness
            .orchestrator_with_sink(OrchestratorConfig::default(), Arc::new(BrokenSink))
            .await;
        let result = orchestrator.run(&tasks, &backends).await;
        assert!(matches!(result, Err(OrchestratorError::Sink(_))));
        assert_eq!(harness.checkpoint_len().await, 0);
    }
}
