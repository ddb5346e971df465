use crate::codec;
use crate::models::{CiBuild, JobId, StoredBuild, TestName, WorkflowId};
use crate::store::BuildStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workflow TEXT NOT NULL,
    branch TEXT NOT NULL,
    UNIQUE(workflow, branch)
);
CREATE TABLE IF NOT EXISTS builds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL REFERENCES jobs(id),
    build_number INTEGER NOT NULL,
    build_url TEXT,
    status TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    usable INTEGER NOT NULL DEFAULT 0,
    fully_stored INTEGER NOT NULL DEFAULT 0,
    failed_tests INTEGER NOT NULL DEFAULT 0,
    ran_tests INTEGER NOT NULL DEFAULT 0,
    skipped_tests INTEGER NOT NULL DEFAULT 0,
    UNIQUE(job_id, build_number)
);
CREATE TABLE IF NOT EXISTS tests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT NOT NULL,
    path TEXT NOT NULL,
    class_name TEXT NOT NULL,
    test_name TEXT NOT NULL,
    UNIQUE(category, path, class_name, test_name)
);
CREATE TABLE IF NOT EXISTS test_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    build_id INTEGER NOT NULL REFERENCES builds(id),
    test_id INTEGER NOT NULL REFERENCES tests(id),
    variant TEXT NOT NULL DEFAULT '',
    worker TEXT NOT NULL DEFAULT '',
    timestamp INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    url TEXT,
    error_details TEXT,
    error_stack_trace TEXT,
    stdout TEXT,
    stderr TEXT
);
CREATE INDEX IF NOT EXISTS idx_builds_job_start ON builds(job_id, start_time DESC);
CREATE INDEX IF NOT EXISTS idx_runs_test ON test_runs(test_id, build_id);
CREATE INDEX IF NOT EXISTS idx_runs_build ON test_runs(build_id);
"#;

const BUILD_COLUMNS: &str = "id, job_id, build_number, build_url, status, start_time, \
     duration_ms, usable, fully_stored, failed_tests, ran_tests, skipped_tests";

// One compact run record per row, in test-run order.
const HISTORY_SQL: &str = r#"
SELECT j.workflow || '|' || j.branch || '|' || b.build_number || '|' || r.timestamp
    || '|' || r.variant || '|' || r.worker || '|' || r.failed || '|' || r.skipped
    || CASE WHEN r.url IS NULL OR r.url = '' THEN '' ELSE '|' || r.url END
FROM test_runs r
JOIN builds b ON b.id = r.build_id
JOIN jobs j ON j.id = b.job_id
JOIN tests t ON t.id = r.test_id
WHERE j.workflow = ? AND b.fully_stored = 1
  AND t.category = ? AND t.path = ? AND t.class_name = ? AND t.test_name = ?
ORDER BY r.timestamp, j.branch, b.build_number, r.id
"#;

// Rows grouped by test; only tests with a failure in the period.
const FAILURE_HISTORIES_SQL: &str = r#"
SELECT t.category, t.path, t.class_name, t.test_name,
    j.workflow || '|' || j.branch || '|' || b.build_number || '|' || r.timestamp
    || '|' || r.variant || '|' || r.worker || '|' || r.failed || '|' || r.skipped
    || CASE WHEN r.url IS NULL OR r.url = '' THEN '' ELSE '|' || r.url END
FROM test_runs r
JOIN builds b ON b.id = r.build_id
JOIN jobs j ON j.id = b.job_id
JOIN tests t ON t.id = r.test_id
WHERE j.workflow = ? AND b.fully_stored = 1 AND r.skipped = 0 AND r.timestamp >= ?
  AND r.test_id IN (
    SELECT fr.test_id FROM test_runs fr
    JOIN builds fb ON fb.id = fr.build_id
    JOIN jobs fj ON fj.id = fb.job_id
    WHERE fj.workflow = ? AND fb.fully_stored = 1 AND fr.failed = 1 AND fr.timestamp >= ?
  )
ORDER BY t.category, t.path, t.class_name, t.test_name, r.timestamp, j.branch, b.build_number, r.id
"#;

/// Replaces the compact-record delimiters so stored values never split a record.
fn record_safe(value: &str) -> String {
    value.replace(['|', ','], "_")
}

pub async fn init_db(database_url: &str, max_connections: u32) -> Result<SqliteBuildStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    sqlx::query(INIT_SQL).execute(&pool).await?;
    Ok(SqliteBuildStore { pool })
}

#[derive(Clone)]
pub struct SqliteBuildStore {
    pool: Pool<Sqlite>,
}

impl SqliteBuildStore {
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl BuildStore for SqliteBuildStore {
    async fn job_db_id(&self, job: &JobId) -> Result<Option<i64>> {
        let id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM jobs WHERE workflow = ? AND branch = ?")
                .bind(job.workflow.as_str())
                .bind(job.branch.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(id)
    }

    async fn ensure_job(&self, job: &JobId) -> Result<i64> {
        sqlx::query("INSERT INTO jobs (workflow, branch) VALUES (?, ?) ON CONFLICT DO NOTHING")
            .bind(job.workflow.as_str())
            .bind(job.branch.as_str())
            .execute(&self.pool)
            .await?;
        let id: i64 = sqlx::query_scalar("SELECT id FROM jobs WHERE workflow = ? AND branch = ?")
            .bind(job.workflow.as_str())
            .bind(job.branch.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn insert(&self, job_db_id: i64, build: &CiBuild) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let build_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO builds (job_id, build_number, build_url, status, start_time, duration_ms,
                                usable, fully_stored, failed_tests, ran_tests, skipped_tests)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            ON CONFLICT(job_id, build_number) DO UPDATE SET
                build_url = excluded.build_url,
                status = excluded.status,
                start_time = excluded.start_time,
                duration_ms = excluded.duration_ms,
                usable = excluded.usable,
                fully_stored = 0,
                failed_tests = excluded.failed_tests,
                ran_tests = excluded.ran_tests,
                skipped_tests = excluded.skipped_tests
            RETURNING id
            "#,
        )
        .bind(job_db_id)
        .bind(build.id.build_number as i64)
        .bind(build.url.as_deref())
        .bind(build.status.as_str())
        .bind(build.start_time.timestamp())
        .bind(build.duration_ms as i64)
        .bind(build.is_usable())
        .bind(build.failed_tests())
        .bind(build.ran_tests())
        .bind(build.skipped_tests())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM test_runs WHERE build_id = ?")
            .bind(build_id)
            .execute(&mut *tx)
            .await?;

        for run in &build.test_runs {
            let test = &run.test;
            sqlx::query(
                "INSERT INTO tests (category, path, class_name, test_name) VALUES (?, ?, ?, ?) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(&test.category)
            .bind(&test.path)
            .bind(&test.class_name)
            .bind(&test.test_name)
            .execute(&mut *tx)
            .await?;
            let test_id: i64 = sqlx::query_scalar(
                "SELECT id FROM tests WHERE category = ? AND path = ? AND class_name = ? AND test_name = ?",
            )
            .bind(&test.category)
            .bind(&test.path)
            .bind(&test.class_name)
            .bind(&test.test_name)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO test_runs (build_id, test_id, variant, worker, timestamp, duration_ms,
                                       failed, skipped, url, error_details, error_stack_trace,
                                       stdout, stderr)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(build_id)
            .bind(test_id)
            .bind(record_safe(run.variant.record_field()))
            .bind(record_safe(run.worker.as_deref().unwrap_or("")))
            .bind(build.start_time.timestamp())
            .bind(run.duration_ms as i64)
            .bind(run.failed)
            .bind(run.skipped)
            .bind(run.url.as_deref().map(record_safe))
            .bind(run.output.error_details.as_deref())
            .bind(run.output.error_stack_trace.as_deref())
            .bind(run.output.stdout.as_deref())
            .bind(run.output.stderr.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        // Readers only trust builds whose runs are all in place.
        sqlx::query("UPDATE builds SET fully_stored = 1 WHERE id = ?")
            .bind(build_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(build_id)
    }

    async fn get_by_build_number(
        &self,
        job_db_id: i64,
        build_number: i64,
    ) -> Result<Option<StoredBuild>> {
        let sql = format!(
            "SELECT {} FROM builds WHERE job_id = ? AND build_number = ?",
            BUILD_COLUMNS
        );
        let build = sqlx::query_as::<_, StoredBuild>(&sql)
            .bind(job_db_id)
            .bind(build_number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(build)
    }

    async fn all_of(&self, job_db_id: i64) -> Result<Vec<StoredBuild>> {
        let sql = format!(
            "SELECT {} FROM builds WHERE job_id = ? ORDER BY build_number DESC",
            BUILD_COLUMNS
        );
        let builds = sqlx::query_as::<_, StoredBuild>(&sql)
            .bind(job_db_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(builds)
    }

    async fn recent_of(&self, job_db_id: i64, limit: i64) -> Result<Vec<StoredBuild>> {
        let sql = format!(
            "SELECT {} FROM builds WHERE job_id = ? AND fully_stored = 1 \
             ORDER BY start_time DESC, build_number DESC LIMIT ?",
            BUILD_COLUMNS
        );
        let builds = sqlx::query_as::<_, StoredBuild>(&sql)
            .bind(job_db_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(builds)
    }

    async fn usable_since(&self, job_db_id: i64, since: DateTime<Utc>) -> Result<Vec<StoredBuild>> {
        let sql = format!(
            "SELECT {} FROM builds WHERE job_id = ? AND usable = 1 AND fully_stored = 1 \
             AND start_time >= ? ORDER BY start_time ASC, build_number ASC",
            BUILD_COLUMNS
        );
        let builds = sqlx::query_as::<_, StoredBuild>(&sql)
            .bind(job_db_id)
            .bind(since.timestamp())
            .fetch_all(&self.pool)
            .await?;
        Ok(builds)
    }

    async fn delete_by_build_number_if_exists(
        &self,
        job_db_id: i64,
        build_number: i64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM test_runs WHERE build_id IN \
             (SELECT id FROM builds WHERE job_id = ? AND build_number = ?)",
        )
        .bind(job_db_id)
        .bind(build_number)
        .execute(&mut *tx)
        .await?;
        let deleted = sqlx::query("DELETE FROM builds WHERE job_id = ? AND build_number = ?")
            .bind(job_db_id)
            .bind(build_number)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    async fn test_history(&self, workflow: &WorkflowId, test: &TestName) -> Result<Option<String>> {
        let records: Vec<String> = sqlx::query_scalar(HISTORY_SQL)
            .bind(workflow.as_str())
            .bind(&test.category)
            .bind(&test.path)
            .bind(&test.class_name)
            .bind(&test.test_name)
            .fetch_all(&self.pool)
            .await?;
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(codec::join_records(&records)))
    }

    async fn failure_histories(
        &self,
        workflow: &WorkflowId,
        since: DateTime<Utc>,
    ) -> Result<Vec<(TestName, String)>> {
        let rows: Vec<(String, String, String, String, String)> =
            sqlx::query_as(FAILURE_HISTORIES_SQL)
                .bind(workflow.as_str())
                .bind(since.timestamp())
                .bind(workflow.as_str())
                .bind(since.timestamp())
                .fetch_all(&self.pool)
                .await?;

        let mut histories: Vec<(TestName, Vec<String>)> = Vec::new();
        for (category, path, class_name, test_name, record) in rows {
            let test = TestName {
                category,
                path,
                class_name,
                test_name,
            };
            match histories.last_mut() {
                Some((last, records)) if *last == test => records.push(record),
                _ => histories.push((test, vec![record])),
            }
        }
        Ok(histories
            .into_iter()
            .map(|(test, records)| (test, codec::join_records(&records)))
            .collect())
    }
}
