use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use dataracy_core::TaskStatus;
use dataracy_observability::projection as log;

use crate::clock::Clock;
use crate::config::ProjectionConfig;
use crate::tasks::executor::panic_message;
use crate::tasks::{ProjectionExecutor, ProjectionTaskStore, TaskOutcome, TaskStoreError};

/// Result of one claim-and-execute pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub done: usize,
    pub retrying: usize,
    pub dead: usize,
    pub stale: usize,
    /// Outcome computed but not persisted; the task is re-claimed later.
    pub unrecorded: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: &Result<TaskOutcome, TaskStoreError>) {
        match outcome {
            Ok(TaskOutcome::Done) => self.done += 1,
            Ok(TaskOutcome::Retrying { .. }) => self.retrying += 1,
            Ok(TaskOutcome::Dead) => self.dead += 1,
            Ok(TaskOutcome::Stale) => self.stale += 1,
            Err(_) => self.unrecorded += 1,
        }
    }
}

/// Cumulative claimer statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ClaimerStats {
    pub ticks: u64,
    pub tasks_claimed: u64,
    pub tasks_done: u64,
    pub tasks_retrying: u64,
    pub tasks_dead: u64,
    pub tasks_stale: u64,
    pub tasks_unrecorded: u64,
    pub claim_failures: u64,
    pub panics: u64,
    pub uptime_secs: u64,
}

impl ClaimerStats {
    fn absorb(&mut self, report: &BatchReport) {
        self.tasks_claimed += report.claimed as u64;
        self.tasks_done += report.done as u64;
        self.tasks_retrying += report.retrying as u64;
        self.tasks_dead += report.dead as u64;
        self.tasks_stale += report.stale as u64;
        self.tasks_unrecorded += report.unrecorded as u64;
    }
}

/// Handle to control and join a running claimer.
#[derive(Debug)]
pub struct ClaimerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<ClaimerStats>>,
}

impl ClaimerHandle {
    /// Request graceful shutdown and wait for the current batch to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }

    pub fn stats(&self) -> ClaimerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Periodically claims due projection tasks and hands them to the executor.
///
/// Any number of claimers may run against the same store; the store's
/// skip-locked claim guarantees each task goes to one of them.
#[derive(Clone)]
pub struct ProjectionClaimer {
    store: Arc<dyn ProjectionTaskStore>,
    executor: ProjectionExecutor,
    clock: Arc<dyn Clock>,
    config: ProjectionConfig,
    stats: Arc<Mutex<ClaimerStats>>,
}

impl ProjectionClaimer {
    pub fn new(
        store: Arc<dyn ProjectionTaskStore>,
        executor: ProjectionExecutor,
        clock: Arc<dyn Clock>,
        config: ProjectionConfig,
    ) -> Self {
        Self {
            store,
            executor,
            clock,
            config,
            stats: Arc::new(Mutex::new(ClaimerStats::default())),
        }
    }

    pub fn config(&self) -> &ProjectionConfig {
        &self.config
    }

    pub fn executor(&self) -> &ProjectionExecutor {
        &self.executor
    }

    pub fn stats(&self) -> ClaimerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Claim one batch due at `now` and execute it.
    ///
    /// Tasks start in claim order; with `max_concurrent > 1` up to that many
    /// run at once. A failing task never aborts the rest of the batch. A
    /// failed claim mutates nothing and is returned as is.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<BatchReport, TaskStoreError> {
        let batch = self
            .store
            .find_batch_for_work(now, &TaskStatus::ELIGIBLE, self.config.batch_size)
            .await?;
        log::batch_claimed(&self.config.name, batch.len());

        let mut report = BatchReport {
            claimed: batch.len(),
            ..BatchReport::default()
        };

        let outcomes: Vec<_> = futures::stream::iter(batch)
            .map(|claimed| {
                let executor = self.executor.clone();
                async move { executor.execute(&claimed).await }.boxed()
            })
            .buffered(self.config.max_concurrent.max(1))
            .collect()
            .await;
        for outcome in &outcomes {
            report.record(outcome);
        }

        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .absorb(&report);
        Ok(report)
    }

    /// One loop iteration; never fails and never panics.
    async fn tick(&self) {
        let now = self.clock.now();
        let result = AssertUnwindSafe(self.run_once(now)).catch_unwind().await;

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.ticks += 1;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                stats.claim_failures += 1;
                log::claim_failed(&self.config.name, &err);
            }
            Err(panic) => {
                stats.panics += 1;
                log::tick_panicked(&self.config.name, panic_message(panic.as_ref()));
            }
        }
    }

    /// Spawn the claim loop on the current tokio runtime.
    ///
    /// Ticks every `poll_interval`; a tick that overruns delays the next one
    /// instead of bursting.
    pub fn spawn(self) -> ClaimerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();

        let join = tokio::spawn(async move {
            let name = self.config.name.clone();
            info!(worker = %name, "projection claimer started");
            let started = Instant::now();

            let mut interval = tokio::time::interval(self.config.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                }
            }

            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.uptime_secs = started.elapsed().as_secs();
            info!(worker = %name, ticks = stats.ticks, "projection claimer stopped");
        });

        ClaimerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

impl std::fmt::Debug for ProjectionClaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionClaimer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::tasks::{
        AggregateSource, AggregateState, InMemoryAggregateSource, InMemorySearchIndex,
        InMemoryTaskStore, SourceError,
    };
    use async_trait::async_trait;
    use dataracy_core::{AggregateRef, NewProjectionTask};
    use serde_json::json;
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    struct Setup {
        store: Arc<InMemoryTaskStore>,
        source: Arc<InMemoryAggregateSource>,
        index: Arc<InMemorySearchIndex>,
        clock: Arc<ManualClock>,
    }

    impl Setup {
        fn new() -> Self {
            Self {
                store: InMemoryTaskStore::arc(),
                source: Arc::new(InMemoryAggregateSource::new()),
                index: Arc::new(InMemorySearchIndex::new()),
                clock: Arc::new(ManualClock::new(at(0))),
            }
        }

        fn claimer_with(&self, source: Arc<dyn AggregateSource>, config: ProjectionConfig) -> ProjectionClaimer {
            let executor = ProjectionExecutor::new(
                self.store.clone(),
                source,
                self.index.clone(),
                self.clock.clone(),
            )
            .with_policy(config.retry.clone());
            ProjectionClaimer::new(self.store.clone(), executor, self.clock.clone(), config)
        }

        fn claimer(&self) -> ProjectionClaimer {
            self.claimer_with(self.source.clone(), ProjectionConfig::default())
        }
    }

    /// Source whose loads panic for one aggregate.
    struct PanickingSource(AggregateRef);

    #[async_trait]
    impl AggregateSource for PanickingSource {
        async fn load(&self, aggregate: AggregateRef) -> Result<Option<AggregateState>, SourceError> {
            if aggregate == self.0 {
                panic!("corrupted row");
            }
            Ok(Some(AggregateState::live(json!({"id": aggregate.id}))))
        }
    }

    /// Store whose claim always fails.
    struct UnavailableStore;

    #[async_trait]
    impl ProjectionTaskStore for UnavailableStore {
        async fn enqueue(&self, _: NewProjectionTask) -> Result<dataracy_core::TaskId, TaskStoreError> {
            Err(TaskStoreError::Unavailable("db down".to_string()))
        }
        async fn enqueue_batch(
            &self,
            _: Vec<NewProjectionTask>,
        ) -> Result<Vec<dataracy_core::TaskId>, TaskStoreError> {
            Err(TaskStoreError::Unavailable("db down".to_string()))
        }
        async fn get(
            &self,
            _: dataracy_core::TaskId,
        ) -> Result<Option<dataracy_core::ProjectionTask>, TaskStoreError> {
            Err(TaskStoreError::Unavailable("db down".to_string()))
        }
        async fn find_batch_for_work(
            &self,
            _: DateTime<Utc>,
            _: &[TaskStatus],
            _: usize,
        ) -> Result<Vec<crate::tasks::ClaimedTask>, TaskStoreError> {
            Err(TaskStoreError::Unavailable("db down".to_string()))
        }
        async fn record_transition(
            &self,
            _: dataracy_core::TaskId,
            _: dataracy_core::ClaimToken,
            _: &dataracy_core::Transition,
        ) -> Result<(), TaskStoreError> {
            Err(TaskStoreError::Unavailable("db down".to_string()))
        }
        async fn list_by_status(
            &self,
            _: TaskStatus,
            _: usize,
        ) -> Result<Vec<dataracy_core::ProjectionTask>, TaskStoreError> {
            Err(TaskStoreError::Unavailable("db down".to_string()))
        }
        async fn requeue_dead(
            &self,
            _: dataracy_core::TaskId,
            _: DateTime<Utc>,
        ) -> Result<dataracy_core::TaskId, TaskStoreError> {
            Err(TaskStoreError::Unavailable("db down".to_string()))
        }
        async fn stats(&self) -> Result<crate::tasks::TaskStats, TaskStoreError> {
            Err(TaskStoreError::Unavailable("db down".to_string()))
        }
    }

    #[tokio::test]
    async fn run_once_projects_due_tasks_and_skips_future_ones() {
        let s = Setup::new();
        for id in 1..=3 {
            s.source.put(AggregateRef::project(id), AggregateState::live(json!({"id": id})));
        }
        s.store
            .enqueue_batch(vec![
                NewProjectionTask::due_at(AggregateRef::project(1), at(-10)),
                NewProjectionTask::due_at(AggregateRef::project(2), at(-5)),
                NewProjectionTask::due_at(AggregateRef::project(3), at(100)),
            ])
            .await
            .unwrap();

        let report = s.claimer().run_once(at(0)).await.unwrap();

        assert_eq!(report, BatchReport { claimed: 2, done: 2, ..BatchReport::default() });
        assert!(s.index.document(AggregateRef::project(1)).is_some());
        assert!(s.index.document(AggregateRef::project(2)).is_some());
        assert!(s.index.document(AggregateRef::project(3)).is_none());
        let stats = s.store.stats().await.unwrap();
        assert_eq!((stats.pending, stats.done), (1, 2));
    }

    #[tokio::test]
    async fn batch_size_bounds_each_claim() {
        let s = Setup::new();
        s.store
            .enqueue_batch((0..5).map(|i| NewProjectionTask::due_at(AggregateRef::dataset(i), at(-1))).collect())
            .await
            .unwrap();
        let config = ProjectionConfig {
            batch_size: 2,
            max_concurrent: 2,
            ..ProjectionConfig::default()
        };

        let claimer = s.claimer_with(s.source.clone(), config);
        assert_eq!(claimer.run_once(at(0)).await.unwrap().claimed, 2);
        assert_eq!(claimer.run_once(at(0)).await.unwrap().claimed, 2);
        assert_eq!(claimer.run_once(at(0)).await.unwrap().claimed, 1);
        assert_eq!(claimer.run_once(at(0)).await.unwrap().claimed, 0);
        assert_eq!(claimer.stats().tasks_done, 5);
    }

    #[tokio::test]
    async fn failed_claim_is_returned_and_counted_by_the_loop() {
        let s = Setup::new();
        let executor = ProjectionExecutor::new(
            Arc::new(UnavailableStore),
            s.source.clone(),
            s.index.clone(),
            s.clock.clone(),
        );
        let claimer = ProjectionClaimer::new(
            Arc::new(UnavailableStore),
            executor,
            s.clock.clone(),
            ProjectionConfig::default(),
        );

        let err = claimer.run_once(at(0)).await.unwrap_err();
        assert!(err.is_transient());

        claimer.tick().await;
        claimer.tick().await;
        let stats = claimer.stats();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.claim_failures, 2);
        assert_eq!(stats.tasks_claimed, 0);
    }

    #[tokio::test]
    async fn panicking_task_does_not_cut_its_batch_short() {
        let s = Setup::new();
        s.store
            .enqueue_batch(vec![
                NewProjectionTask::due_at(AggregateRef::project(1), at(-10)),
                NewProjectionTask::due_at(AggregateRef::project(2), at(-5)),
            ])
            .await
            .unwrap();
        let claimer = s.claimer_with(
            Arc::new(PanickingSource(AggregateRef::project(1))),
            ProjectionConfig::default(),
        );

        claimer.tick().await;

        let stats = claimer.stats();
        assert_eq!((stats.ticks, stats.panics), (1, 0));
        assert_eq!((stats.tasks_claimed, stats.tasks_retrying, stats.tasks_done), (2, 1, 1));
        assert!(s.index.document(AggregateRef::project(2)).is_some());

        let tasks = s.store.list_by_status(TaskStatus::Retrying, 10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].aggregate, AggregateRef::project(1));
        assert!(tasks[0].last_error.as_deref().unwrap_or_default().contains("corrupted row"));
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_claimer_polls_and_shuts_down() {
        let s = Setup::new();
        s.source.put(AggregateRef::project(1), AggregateState::live(json!({"t": 1})));
        s.store
            .enqueue(NewProjectionTask::due_at(AggregateRef::project(1), at(-1)))
            .await
            .unwrap();
        let config = ProjectionConfig {
            poll_interval: Duration::from_millis(100),
            ..ProjectionConfig::default()
        };

        let handle = s.claimer_with(s.source.clone(), config).spawn();
        tokio::time::sleep(Duration::from_millis(350)).await;

        let stats = handle.stats();
        assert!(stats.ticks >= 3, "ticks = {}", stats.ticks);
        assert_eq!(stats.tasks_done, 1);
        handle.shutdown().await;
        assert_eq!(
            s.store.get(dataracy_core::TaskId::new(1)).await.unwrap().unwrap().status,
            TaskStatus::Done
        );
    }
}
