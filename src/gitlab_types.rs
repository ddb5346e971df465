use crate::models::{BuildId, BuildStatus, CiBuild, CiTestRun, TestName, TestRunOutput, TestVariant};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::warn;

/// Entry of `GET /projects/:id/pipelines`; the listing only needs ids.
#[derive(Debug, Clone, Deserialize)]
pub struct GitlabPipeline {
    pub id: u64,
}

/// `GET /projects/:id/pipelines/:pipeline_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineDetail {
    pub id: u64,
    pub r#ref: String,
    pub status: String,
    pub web_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Seconds.
    pub duration: Option<u64>,
}

impl PipelineDetail {
    pub fn duration_ms(&self) -> u64 {
        match (self.duration, self.started_at, self.finished_at) {
            (Some(seconds), _, _) => seconds * 1000,
            (None, Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }
}

/// `GET /projects/:id/pipelines/:pipeline_id/test_report`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestReport {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub test_suites: Vec<TestSuite>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestSuite {
    pub name: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestCase {
    pub status: String,
    pub name: String,
    pub classname: Option<String>,
    /// Seconds.
    pub execution_time: Option<f64>,
    pub system_output: Option<JsonValue>,
    pub stack_trace: Option<String>,
}

impl TestCase {
    fn failed(&self) -> bool {
        matches!(self.status.as_str(), "failed" | "error")
    }

    fn skipped(&self) -> bool {
        self.status == "skipped"
    }
}

/// GitLab reports captured output either as a string or as a list of lines.
fn output_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Array(lines) => {
            let text: Vec<&str> = lines.iter().filter_map(JsonValue::as_str).collect();
            (!text.is_empty()).then(|| text.join("\n"))
        }
        _ => None,
    }
}

/// Failed pipelines whose failures are test failures count as unstable.
pub fn build_status(pipeline_status: &str, has_failed_tests: bool) -> BuildStatus {
    match pipeline_status {
        "success" if has_failed_tests => BuildStatus::Unstable,
        "success" => BuildStatus::Success,
        "failed" if has_failed_tests => BuildStatus::Unstable,
        "failed" => BuildStatus::Failure,
        "canceled" | "canceling" => BuildStatus::Aborted,
        "running" | "pending" | "created" | "preparing" | "scheduled"
        | "waiting_for_resource" | "waiting_for_callback" => BuildStatus::Running,
        _ => BuildStatus::NotBuilt,
    }
}

fn test_run(suite: &TestSuite, case: &TestCase, pipeline_url: Option<&str>) -> Option<CiTestRun> {
    let class = case
        .classname
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or(&suite.name);
    let test = match TestName::of_suite_and_test(class, &case.name) {
        Ok(test) => test,
        Err(e) => {
            warn!(suite = %suite.name, test = %case.name, error = %e, "skipping unnamed test case");
            return None;
        }
    };
    let failed = case.failed();
    let output = if failed {
        TestRunOutput {
            error_details: case.system_output.as_ref().and_then(output_text),
            error_stack_trace: case.stack_trace.clone().filter(|s| !s.is_empty()),
            ..Default::default()
        }
    } else {
        TestRunOutput::default()
    };

    Some(CiTestRun {
        test,
        variant: TestVariant::parse(&suite.name),
        worker: None,
        duration_ms: (case.execution_time.unwrap_or(0.0).max(0.0) * 1000.0).round() as u64,
        failed,
        skipped: case.skipped(),
        output,
        url: failed
            .then(|| pipeline_url.map(|u| format!("{}/test_report", u)))
            .flatten(),
    })
}

pub fn to_ci_build(id: BuildId, pipeline: &PipelineDetail, report: Option<&TestReport>) -> CiBuild {
    let url = pipeline.web_url.as_deref();
    let test_runs: Vec<CiTestRun> = report
        .map(|r| r.test_suites.as_slice())
        .unwrap_or_default()
        .iter()
        .flat_map(|suite| suite.test_cases.iter().map(move |case| (suite, case)))
        .filter_map(|(suite, case)| test_run(suite, case, url))
        .collect();
    let has_failed_tests = test_runs.iter().any(|r| r.failed);

    CiBuild {
        id,
        url: pipeline.web_url.clone(),
        status: build_status(&pipeline.status, has_failed_tests),
        start_time: pipeline.started_at.unwrap_or(pipeline.created_at),
        duration_ms: pipeline.duration_ms(),
        test_runs,
    }
}
