use crate::ci::{CiClient, CiError};
use crate::config::{
    Config, DatabaseConfig, GitLabConfig, LoaderConfig, ServerConfig, TrendsConfig, UpstreamConfig,
};
use crate::models::{
    BuildId, BuildStatus, CiBuild, CiTestRun, JobId, TestName, TestRunOutput, TestVariant,
};
use async_trait::async_trait;
use chrono::DateTime;

pub const SUITE: &str = "org.example.SuiteTest";

pub fn test_case(index: usize) -> TestName {
    TestName::of_suite_and_test(SUITE, &format!("test{}", index)).unwrap()
}

/// One test per character of `outcomes`: P passed, F failed, S skipped.
pub fn ci_build(job: &JobId, number: i64, status: BuildStatus, outcomes: &str) -> CiBuild {
    let test_runs = outcomes
        .chars()
        .enumerate()
        .map(|(i, c)| CiTestRun {
            test: test_case(i),
            variant: TestVariant::Default,
            worker: Some("runner-1".into()),
            duration_ms: 250,
            failed: c == 'F',
            skipped: c == 'S',
            output: TestRunOutput {
                error_details: (c == 'F').then(|| format!("assertion failed in #{}", number)),
                ..Default::default()
            },
            url: None,
        })
        .collect();

    CiBuild {
        id: job.build(number).unwrap(),
        url: Some(format!("https://gitlab.example.com/{}/-/pipelines/{}", job.workflow, number)),
        status,
        start_time: DateTime::from_timestamp(1_700_000_000 + number * 3600, 0).unwrap(),
        duration_ms: 90_000,
        test_runs,
    }
}

/// A CI server without any builds.
pub struct EmptyCi;

#[async_trait]
impl CiClient for EmptyCi {
    async fn list_builds(&self, _job: &JobId) -> Result<Option<Vec<BuildId>>, CiError> {
        Ok(Some(Vec::new()))
    }

    async fn fetch_build(&self, _build: &BuildId) -> Result<Option<CiBuild>, CiError> {
        Ok(None)
    }
}

pub fn config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        gitlab: GitLabConfig {
            url: "https://gitlab.example.com".into(),
            token: "token".into(),
            timeout_seconds: None,
            skip_invalid_certs: None,
            max_listed_pipelines: None,
        },
        database: DatabaseConfig::default(),
        loader: LoaderConfig::default(),
        upstream: UpstreamConfig::default(),
        trends: TrendsConfig::default(),
    }
}
