//! Asynchronous, per-job deduplicated import of CI builds into the store.
//!
//! At most one unfinished load task exists per [`JobId`]. Submitting a job
//! that is already being loaded hands back the in-flight task id.

use crate::ci::{CiClient, CiError};
use crate::config::LoaderConfig;
use crate::models::{BuildId, JobId};
use crate::store::BuildStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Submitted,
    Started,
    Finished,
}

/// Point-in-time view of a load task.
#[derive(Debug, Clone, Serialize)]
pub struct LoadStatus {
    pub task_id: TaskId,
    pub job: JobId,
    pub max_builds: usize,
    pub state: TaskState,
    pub started: bool,
    pub finished: bool,
    pub progress: u8,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub messages: Vec<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub loaded_builds: usize,
    pub ignored_builds: usize,
    pub skipped_builds: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Ci(#[from] CiError),
    #[error("storage failure: {0:#}")]
    Store(#[from] anyhow::Error),
    #[error("load task panicked: {0}")]
    Panicked(String),
    #[error("worker pool is shut down")]
    PoolClosed,
}

struct TaskRecord {
    job: JobId,
    max_builds: usize,
    state: TaskState,
    submitted_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    clock: Option<Instant>,
    elapsed: Option<Duration>,
    total_builds: Option<usize>,
    loaded_builds: usize,
    error: Option<String>,
    messages: Vec<String>,
}

impl TaskRecord {
    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn progress(&self) -> u8 {
        match (self.state, self.total_builds) {
            (TaskState::Submitted, _) => 0,
            (TaskState::Finished, _) | (TaskState::Started, Some(0)) => 100,
            (TaskState::Started, None) => 0,
            (TaskState::Started, Some(total)) => {
                let loaded = self.loaded_builds.min(total);
                (100.0 * loaded as f64 / total as f64).round() as u8
            }
        }
    }
}

struct TaskEntry {
    id: TaskId,
    record: Mutex<TaskRecord>,
    done: watch::Sender<bool>,
}

impl TaskEntry {
    fn new(id: TaskId, job: JobId, max_builds: usize) -> Self {
        let now = Utc::now();
        let (done, _) = watch::channel(false);
        Self {
            id,
            record: Mutex::new(TaskRecord {
                job,
                max_builds,
                state: TaskState::Submitted,
                submitted_at: now,
                started_at: None,
                finished_at: None,
                updated_at: now,
                clock: None,
                elapsed: None,
                total_builds: None,
                loaded_builds: 0,
                error: None,
                messages: Vec::new(),
            }),
            done,
        }
    }

    fn start(&self) -> (JobId, usize) {
        let mut record = self.record.lock();
        record.state = TaskState::Started;
        record.started_at = Some(Utc::now());
        record.clock = Some(Instant::now());
        record.touch();
        (record.job.clone(), record.max_builds)
    }

    fn message(&self, message: impl Into<String>) {
        let mut record = self.record.lock();
        record.messages.push(message.into());
        record.touch();
    }

    fn set_total(&self, total: usize) {
        let mut record = self.record.lock();
        record.total_builds = Some(total);
        record.touch();
    }

    fn build_done(&self) {
        let mut record = self.record.lock();
        record.loaded_builds += 1;
        record.touch();
    }

    fn snapshot(&self) -> LoadStatus {
        let record = self.record.lock();
        let duration = match (record.elapsed, record.clock) {
            (Some(elapsed), _) => elapsed,
            (None, Some(clock)) => clock.elapsed(),
            (None, None) => Duration::ZERO,
        };
        LoadStatus {
            task_id: self.id,
            job: record.job.clone(),
            max_builds: record.max_builds,
            state: record.state,
            started: record.state != TaskState::Submitted,
            finished: record.state == TaskState::Finished,
            progress: record.progress(),
            duration_ms: duration.as_millis() as u64,
            error: record.error.clone(),
            messages: record.messages.clone(),
            submitted_at: record.submitted_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Default)]
struct Registry {
    in_progress: HashMap<JobId, TaskId>,
    tasks: HashMap<TaskId, Arc<TaskEntry>>,
}

struct Inner {
    ci: Arc<dyn CiClient>,
    store: Arc<dyn BuildStore>,
    config: LoaderConfig,
    registry: Mutex<Registry>,
    workers: Arc<Semaphore>,
    runtime: Handle,
}

/// Schedules build loads on a bounded pool of workers.
#[derive(Clone)]
pub struct BuildLoader {
    inner: Arc<Inner>,
}

impl BuildLoader {
    pub fn new(
        ci: Arc<dyn CiClient>,
        store: Arc<dyn BuildStore>,
        config: LoaderConfig,
        runtime: Handle,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            inner: Arc::new(Inner {
                ci,
                store,
                config,
                registry: Mutex::new(Registry::default()),
                workers,
                runtime,
            }),
        }
    }

    pub fn submit_default(&self, job: JobId) -> TaskId {
        self.submit_load(job, self.inner.config.max_builds_per_job)
    }

    /// Schedules a load of the `max_builds` most recent builds of `job`
    /// unless one is already in flight. Never blocks on the load itself.
    pub fn submit_load(&self, job: JobId, max_builds: usize) -> TaskId {
        let mut registry = self.inner.registry.lock();
        if let Some(existing) = registry.in_progress.get(&job) {
            debug!(%job, task_id = %existing, max_builds, "load already in progress, reusing task");
            return *existing;
        }

        let id = Uuid::now_v7();
        let entry = Arc::new(TaskEntry::new(id, job.clone(), max_builds));
        registry.in_progress.insert(job.clone(), id);
        registry.tasks.insert(id, entry.clone());
        drop(registry);

        info!(%job, task_id = %id, max_builds, "submitted build load");
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            inner.execute(entry).await;
        });
        id
    }

    pub fn task_status(&self, id: TaskId) -> Option<LoadStatus> {
        self.entry(id).map(|entry| entry.snapshot())
    }

    /// Statuses of all retained tasks, oldest submission first.
    pub fn all_status(&self) -> Vec<LoadStatus> {
        let entries: Vec<Arc<TaskEntry>> =
            self.inner.registry.lock().tasks.values().cloned().collect();
        let mut statuses: Vec<LoadStatus> = entries.iter().map(|e| e.snapshot()).collect();
        statuses.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        statuses
    }

    /// Resolves once the task has finished. `None` for unknown ids.
    pub async fn wait_finished(&self, id: TaskId) -> Option<LoadStatus> {
        let entry = self.entry(id)?;
        let mut done = entry.done.subscribe();
        // The sender lives in `entry`, so this only returns once the flag is set.
        let _ = done.wait_for(|finished| *finished).await;
        Some(entry.snapshot())
    }

    /// Drops finished statuses past the retention period, then the oldest
    /// finished ones beyond the retained maximum. Returns how many were removed.
    pub fn prune_finished(&self, now: DateTime<Utc>) -> usize {
        let config = &self.inner.config;
        let cutoff = now - ChronoDuration::seconds(config.status_retention_seconds as i64);

        let mut registry = self.inner.registry.lock();
        let mut finished: Vec<(DateTime<Utc>, TaskId)> = registry
            .tasks
            .values()
            .filter_map(|entry| entry.record.lock().finished_at.map(|at| (at, entry.id)))
            .collect();
        finished.sort();

        let mut expired: HashSet<TaskId> = finished
            .iter()
            .filter(|(at, _)| *at < cutoff)
            .map(|(_, id)| *id)
            .collect();
        let remaining = registry.tasks.len() - expired.len();
        if remaining > config.max_retained_statuses {
            let excess = remaining - config.max_retained_statuses;
            let oldest: Vec<TaskId> = finished
                .iter()
                .map(|(_, id)| *id)
                .filter(|id| !expired.contains(id))
                .take(excess)
                .collect();
            expired.extend(oldest);
        }

        registry.tasks.retain(|id, _| !expired.contains(id));
        if !expired.is_empty() {
            debug!(removed = expired.len(), "pruned finished load statuses");
        }
        expired.len()
    }

    fn entry(&self, id: TaskId) -> Option<Arc<TaskEntry>> {
        self.inner.registry.lock().tasks.get(&id).cloned()
    }
}

impl Inner {
    async fn execute(self: Arc<Self>, entry: Arc<TaskEntry>) {
        let outcome = match self.workers.clone().acquire_owned().await {
            Ok(_permit) => {
                let inner = self.clone();
                let task = entry.clone();
                match tokio::spawn(async move { inner.run(&task).await }).await {
                    Ok(result) => result,
                    Err(e) => Err(LoadError::Panicked(e.to_string())),
                }
            }
            Err(_) => Err(LoadError::PoolClosed),
        };
        self.finish(&entry, outcome);
    }

    fn finish(&self, entry: &TaskEntry, outcome: Result<LoadSummary, LoadError>) {
        let mut registry = self.registry.lock();
        let mut record = entry.record.lock();
        match outcome {
            Ok(summary) => info!(
                job = %record.job,
                task_id = %entry.id,
                loaded = summary.loaded_builds,
                ignored = summary.ignored_builds,
                skipped = summary.skipped_builds,
                "build load finished"
            ),
            Err(e) => {
                error!(job = %record.job, task_id = %entry.id, error = %e, "build load failed");
                record.messages.push(format!("Problem when loading: {}", e));
                record.error = Some(e.to_string());
            }
        }
        record.state = TaskState::Finished;
        record.finished_at = Some(Utc::now());
        record.elapsed = record.clock.map(|clock| clock.elapsed());
        record.touch();

        if registry.in_progress.get(&record.job) == Some(&entry.id) {
            registry.in_progress.remove(&record.job);
        }
        drop(record);
        drop(registry);

        entry.done.send_replace(true);
    }

    async fn run(&self, task: &TaskEntry) -> Result<LoadSummary, LoadError> {
        let (job, max_builds) = task.start();

        let Some(builds) = self.ci.list_builds(&job).await? else {
            warn!(%job, "job cannot be found on the CI server");
            task.message(format!("Not loading job {}: it cannot be found", job));
            return Ok(LoadSummary::default());
        };
        let builds: Vec<BuildId> = builds.into_iter().take(max_builds).collect();
        if builds.is_empty() {
            task.message("No builds found");
            return Ok(LoadSummary::default());
        }

        let known = self.store.job_db_id(&job).await?;
        let job_db_id = match known {
            Some(id) => id,
            None => self.store.ensure_job(&job).await?,
        };

        let listed = builds.len();
        let to_load: Vec<BuildId> = if known.is_some() {
            let stored = self.stored_build_numbers(job_db_id).await?;
            builds
                .into_iter()
                .filter(|b| !stored.contains(&b.build_number))
                .collect()
        } else {
            builds
        };

        let mut summary = LoadSummary {
            skipped_builds: listed - to_load.len(),
            ..Default::default()
        };
        if to_load.is_empty() {
            task.message("Skipping job, all builds to load are already loaded");
            return Ok(summary);
        }

        task.message(format!(
            "Loading {} builds for {} ({} already loaded)",
            to_load.len(),
            job,
            summary.skipped_builds
        ));
        task.set_total(to_load.len());

        for build in &to_load {
            task.message(format!("Downloading build #{}", build.build_number));
            let clock = Instant::now();
            let loaded = self.load_build(task, job_db_id, build).await;
            task.build_done();
            if loaded? {
                summary.loaded_builds += 1;
            } else {
                summary.ignored_builds += 1;
            }
            task.message(format!(
                "Build #{} done in {} ms",
                build.build_number,
                clock.elapsed().as_millis()
            ));
        }
        Ok(summary)
    }

    /// Build numbers already fully stored for the job. Partially stored
    /// builds are deleted so they load again.
    async fn stored_build_numbers(&self, job_db_id: i64) -> Result<HashSet<u64>, LoadError> {
        let mut stored = HashSet::new();
        for build in self.store.all_of(job_db_id).await? {
            if build.fully_stored {
                stored.insert(build.build_number as u64);
            } else {
                debug!(job_db_id, build_number = build.build_number, "removing partially stored build");
                self.store
                    .delete_by_build_number_if_exists(job_db_id, build.build_number)
                    .await?;
            }
        }
        Ok(stored)
    }

    async fn load_build(
        &self,
        task: &TaskEntry,
        job_db_id: i64,
        build: &BuildId,
    ) -> Result<bool, LoadError> {
        let Some(ci_build) = self.ci.fetch_build(build).await? else {
            warn!(%build, "build disappeared from the CI server");
            task.message(format!("Ignoring build #{}: it cannot be found", build.build_number));
            return Ok(false);
        };
        if !ci_build.status.is_completed() {
            task.message(format!(
                "Ignoring incomplete build #{}: it is {}",
                build.build_number,
                ci_build.status.as_str()
            ));
            return Ok(false);
        }
        self.store.insert(job_db_id, &ci_build).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_db, SqliteBuildStore};
    use crate::models::{BuildStatus, CiBuild};
    use crate::test_support::ci_build;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeCi {
        /// Newest first, like the CI server lists them.
        builds: Vec<CiBuild>,
        unknown_job: bool,
        unreachable: bool,
        panic_on_list: bool,
        gate: Option<Arc<Semaphore>>,
        fetch_gate: Option<Arc<Semaphore>>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl CiClient for FakeCi {
        async fn list_builds(&self, _job: &JobId) -> Result<Option<Vec<BuildId>>, CiError> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if self.panic_on_list {
                panic!("listing exploded");
            }
            if self.unreachable {
                return Err(CiError::UnreachableHost {
                    host: "gitlab.example.com".into(),
                });
            }
            if self.unknown_job {
                return Ok(None);
            }
            Ok(Some(self.builds.iter().map(|b| b.id.clone()).collect()))
        }

        async fn fetch_build(&self, build: &BuildId) -> Result<Option<CiBuild>, CiError> {
            if let Some(gate) = &self.fetch_gate {
                gate.acquire().await.unwrap().forget();
            }
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.builds.iter().find(|b| &b.id == build).cloned())
        }
    }

    fn job() -> JobId {
        JobId::new("group/project", "main").unwrap()
    }

    fn three_builds() -> Vec<CiBuild> {
        vec![
            ci_build(&job(), 3, BuildStatus::Running, "PP"),
            ci_build(&job(), 2, BuildStatus::Unstable, "PF"),
            ci_build(&job(), 1, BuildStatus::Success, "PP"),
        ]
    }

    fn config() -> LoaderConfig {
        LoaderConfig {
            workers: 2,
            ..Default::default()
        }
    }

    async fn loader_with(ci: FakeCi, config: LoaderConfig) -> (BuildLoader, Arc<FakeCi>, SqliteBuildStore) {
        let ci = Arc::new(ci);
        let store = init_db("sqlite::memory:", 1).await.unwrap();
        let loader = BuildLoader::new(
            ci.clone(),
            Arc::new(store.clone()),
            config,
            Handle::current(),
        );
        (loader, ci, store)
    }

    #[tokio::test]
    async fn test_submitted_task_is_visible_before_start() {
        let (loader, _, _) = loader_with(FakeCi::default(), config()).await;
        let id = loader.submit_load(job(), 4);

        let status = loader.task_status(id).unwrap();
        assert_eq!(status.state, TaskState::Submitted);
        assert!(!status.started);
        assert!(!status.finished);
        assert_eq!(status.progress, 0);
        assert_eq!(status.max_builds, 4);

        let status = loader.wait_finished(id).await.unwrap();
        assert!(status.started);
        assert!(status.finished);
        assert_eq!(status.progress, 100);
        assert_eq!(status.error, None);
        assert!(status.messages.iter().any(|m| m == "No builds found"));
    }

    #[tokio::test]
    async fn test_duplicate_submission_returns_in_flight_task() {
        let (loader, _, _) = loader_with(FakeCi::default(), config()).await;
        let first = loader.submit_load(job(), 4);
        let second = loader.submit_load(job(), 10);
        assert_eq!(first, second);
        assert_eq!(loader.all_status().len(), 1);
        assert_eq!(loader.task_status(first).unwrap().max_builds, 4);

        loader.wait_finished(first).await.unwrap();
        let third = loader.submit_default(job());
        assert_ne!(first, third);

        let statuses = loader.all_status();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].task_id, first);
        assert_eq!(statuses[1].max_builds, 32);
    }

    #[tokio::test]
    async fn test_different_jobs_get_different_tasks() {
        let (loader, _, _) = loader_with(FakeCi::default(), config()).await;
        let a = loader.submit_load(job(), 4);
        let b = loader.submit_load(JobId::new("group/project", "4.0").unwrap(), 4);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_loads_completed_builds_into_store() {
        let ci = FakeCi {
            builds: three_builds(),
            ..Default::default()
        };
        let (loader, _, store) = loader_with(ci, config()).await;
        let id = loader.submit_load(job(), 10);
        let status = loader.wait_finished(id).await.unwrap();
        assert_eq!(status.error, None);
        assert!(status
            .messages
            .iter()
            .any(|m| m.starts_with("Ignoring incomplete build #3")));

        let job_db_id = store.job_db_id(&job()).await.unwrap().unwrap();
        let numbers: Vec<i64> = store
            .all_of(job_db_id)
            .await
            .unwrap()
            .iter()
            .map(|b| b.build_number)
            .collect();
        assert_eq!(numbers, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_progress_while_loading() {
        let gate = Arc::new(Semaphore::new(1));
        let ci = FakeCi {
            builds: vec![
                ci_build(&job(), 3, BuildStatus::Success, "PP"),
                ci_build(&job(), 2, BuildStatus::Unstable, "PF"),
                ci_build(&job(), 1, BuildStatus::Success, "PP"),
            ],
            fetch_gate: Some(gate.clone()),
            ..Default::default()
        };
        let (loader, _, _) = loader_with(ci, config()).await;
        let id = loader.submit_load(job(), 10);

        tokio::time::timeout(Duration::from_secs(5), async {
            while loader.task_status(id).unwrap().progress == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = loader.task_status(id).unwrap();
        assert_eq!(status.state, TaskState::Started);
        assert!(status.started);
        assert!(!status.finished);
        assert_eq!(status.progress, 33);
        assert!(status.duration_ms > 0);

        gate.add_permits(2);
        let status = loader.wait_finished(id).await.unwrap();
        assert_eq!(status.progress, 100);
        assert_eq!(status.error, None);
    }

    #[tokio::test]
    async fn test_max_builds_limits_listing() {
        let ci = FakeCi {
            builds: three_builds(),
            ..Default::default()
        };
        let (loader, ci, store) = loader_with(ci, config()).await;
        let id = loader.submit_load(job(), 2);
        loader.wait_finished(id).await.unwrap();

        assert_eq!(ci.fetches.load(Ordering::SeqCst), 2);
        let job_db_id = store.job_db_id(&job()).await.unwrap().unwrap();
        assert!(store.get_by_build_number(job_db_id, 1).await.unwrap().is_none());
        assert!(store.get_by_build_number(job_db_id, 2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_load_skips_stored_and_reloads_partial_builds() {
        let ci = FakeCi {
            builds: three_builds(),
            ..Default::default()
        };
        let (loader, ci, store) = loader_with(ci, config()).await;
        let id = loader.submit_load(job(), 10);
        loader.wait_finished(id).await.unwrap();
        assert_eq!(ci.fetches.load(Ordering::SeqCst), 3);

        let job_db_id = store.job_db_id(&job()).await.unwrap().unwrap();
        sqlx::query("UPDATE builds SET fully_stored = 0 WHERE job_id = ? AND build_number = 1")
            .bind(job_db_id)
            .execute(store.pool())
            .await
            .unwrap();

        let id = loader.submit_load(job(), 10);
        let status = loader.wait_finished(id).await.unwrap();
        assert_eq!(status.error, None);
        // Build 3 is still running and build 1 was partial: both fetched again.
        assert_eq!(ci.fetches.load(Ordering::SeqCst), 5);
        let reloaded = store.get_by_build_number(job_db_id, 1).await.unwrap().unwrap();
        assert!(reloaded.fully_stored);
    }

    #[tokio::test]
    async fn test_unknown_job_finishes_without_error() {
        let ci = FakeCi {
            unknown_job: true,
            ..Default::default()
        };
        let (loader, _, store) = loader_with(ci, config()).await;
        let id = loader.submit_load(job(), 10);
        let status = loader.wait_finished(id).await.unwrap();
        assert!(status.finished);
        assert_eq!(status.error, None);
        assert!(status.messages[0].contains("cannot be found"));
        assert_eq!(store.job_db_id(&job()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ci_failure_is_recorded_and_job_released() {
        let ci = FakeCi {
            unreachable: true,
            ..Default::default()
        };
        let (loader, _, _) = loader_with(ci, config()).await;
        let id = loader.submit_load(job(), 10);
        let status = loader.wait_finished(id).await.unwrap();
        assert!(status.finished);
        assert_eq!(
            status.error.as_deref(),
            Some("cannot reach CI host gitlab.example.com")
        );
        assert!(status.messages.last().unwrap().starts_with("Problem when loading"));

        assert_ne!(loader.submit_load(job(), 10), id);
    }

    #[tokio::test]
    async fn test_panicking_load_still_finishes() {
        let ci = FakeCi {
            panic_on_list: true,
            ..Default::default()
        };
        let (loader, _, _) = loader_with(ci, config()).await;
        let id = loader.submit_load(job(), 10);
        let status = loader.wait_finished(id).await.unwrap();
        assert!(status.finished);
        assert!(status.error.unwrap().starts_with("load task panicked"));
        assert_ne!(loader.submit_load(job(), 10), id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_share_one_task() {
        let gate = Arc::new(Semaphore::new(0));
        let ci = FakeCi {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let (loader, _, _) = loader_with(ci, config()).await;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let loader = loader.clone();
                tokio::spawn(async move { loader.submit_load(job(), 10) })
            })
            .collect();
        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(loader.all_status().len(), 1);

        gate.add_permits(16);
        let id = ids.into_iter().next().unwrap();
        assert!(loader.wait_finished(id).await.unwrap().finished);
    }

    #[tokio::test]
    async fn test_prune_drops_only_old_finished_statuses() {
        let gate = Arc::new(Semaphore::new(0));
        let ci = FakeCi {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let (loader, _, _) = loader_with(ci, config()).await;

        gate.add_permits(1);
        let done = loader.submit_load(job(), 10);
        loader.wait_finished(done).await.unwrap();
        let pending = loader.submit_load(JobId::new("group/other", "main").unwrap(), 10);

        assert_eq!(loader.prune_finished(Utc::now()), 0);
        let later = Utc::now() + ChronoDuration::hours(2);
        assert_eq!(loader.prune_finished(later), 1);
        assert!(loader.task_status(done).is_none());
        assert!(loader.task_status(pending).is_some());
        assert_eq!(loader.prune_finished(later), 0);

        gate.add_permits(1);
        loader.wait_finished(pending).await.unwrap();
    }

    #[tokio::test]
    async fn test_prune_caps_retained_statuses() {
        let config = LoaderConfig {
            max_retained_statuses: 1,
            ..config()
        };
        let (loader, _, _) = loader_with(FakeCi::default(), config).await;
        let first = loader.submit_load(job(), 1);
        loader.wait_finished(first).await.unwrap();
        let second = loader.submit_load(job(), 1);
        loader.wait_finished(second).await.unwrap();

        assert_eq!(loader.prune_finished(Utc::now()), 1);
        assert!(loader.task_status(first).is_none());
        assert!(loader.task_status(second).is_some());
    }
}
