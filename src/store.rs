use crate::models::{CiBuild, JobId, StoredBuild, TestName, WorkflowId};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Persistence for jobs, builds and test runs.
#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn job_db_id(&self, job: &JobId) -> Result<Option<i64>>;

    /// Returns the id of `job`, creating the row if needed.
    async fn ensure_job(&self, job: &JobId) -> Result<i64>;

    /// Stores a build and all its test runs; returns the build row id.
    async fn insert(&self, job_db_id: i64, build: &CiBuild) -> Result<i64>;

    async fn get_by_build_number(
        &self,
        job_db_id: i64,
        build_number: i64,
    ) -> Result<Option<StoredBuild>>;

    async fn all_of(&self, job_db_id: i64) -> Result<Vec<StoredBuild>>;

    /// Most recent builds first.
    async fn recent_of(&self, job_db_id: i64, limit: i64) -> Result<Vec<StoredBuild>>;

    /// Usable builds started at or after `since`, oldest first.
    async fn usable_since(&self, job_db_id: i64, since: DateTime<Utc>) -> Result<Vec<StoredBuild>>;

    async fn delete_by_build_number_if_exists(&self, job_db_id: i64, build_number: i64)
        -> Result<bool>;

    /// Run history of `test` across every branch of `workflow` as a compact
    /// batch, `None` if it never ran there.
    async fn test_history(&self, workflow: &WorkflowId, test: &TestName) -> Result<Option<String>>;

    /// Histories of the tests that failed in `workflow` since `since`, one
    /// compact batch per test holding its non-skipped runs of that period.
    async fn failure_histories(
        &self,
        workflow: &WorkflowId,
        since: DateTime<Utc>,
    ) -> Result<Vec<(TestName, String)>>;
}
