use crate::failures::FailureDetails;
use crate::models::{BranchVersion, RunDetails, TestName, TestRunOutput, WorkflowId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

/// History of one test within one workflow.
///
/// Always derived from the full list of known runs; a refresh builds a new
/// value instead of patching counters.
#[derive(Debug, Clone, Serialize)]
pub struct TestFailure {
    pub test: TestName,
    pub workflow: WorkflowId,
    pub failure_details: FailureDetails,
    pub num_runs_total: usize,
    pub num_runs_analyzed: usize,
    pub duration_sum_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_start: Option<DateTime<Utc>>,
}

impl TestFailure {
    /// The workflow comes from the first run, or `default_workflow` when there are none.
    pub fn build(test: TestName, runs: Vec<RunDetails>, default_workflow: &WorkflowId) -> Self {
        Self::build_in_window(test, runs, default_workflow, None)
    }

    pub fn build_in_window(
        test: TestName,
        runs: Vec<RunDetails>,
        default_workflow: &WorkflowId,
        window_start: Option<DateTime<Utc>>,
    ) -> Self {
        let workflow = runs
            .first()
            .map(|r| r.id.job.workflow.clone())
            .unwrap_or_else(|| default_workflow.clone());
        let num_runs_total = runs.len();
        let num_runs_analyzed = match window_start {
            Some(start) => runs
                .iter()
                .filter(|r| r.timestamp >= start.timestamp())
                .count(),
            None => num_runs_total,
        };
        let duration_sum_ms = runs.iter().map(|r| r.duration_ms).sum();

        Self {
            test,
            workflow,
            failure_details: FailureDetails::build(runs),
            num_runs_total,
            num_runs_analyzed,
            duration_sum_ms,
            window_start,
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failed_count() > 0
    }

    pub fn failed_count(&self) -> usize {
        self.failure_details.failures()
    }

    pub fn last_failed_output(&self) -> Option<&TestRunOutput> {
        self.failure_details
            .last_failed()
            .and_then(|run| run.output.as_ref())
    }

    pub fn last_run_workflow(&self) -> Option<&WorkflowId> {
        self.failure_details.last().map(|run| &run.id.job.workflow)
    }

    /// Versions on which the test failed at least once.
    pub fn affected_versions(&self) -> Vec<&BranchVersion> {
        self.failure_details.last_failed_by_version().keys().collect()
    }

    pub fn build_numbers(&self) -> BTreeSet<u64> {
        self.failure_details
            .all_runs()
            .iter()
            .map(|r| r.id.build_number)
            .collect()
    }

    /// The same history restricted to builds numbered below `build_number`.
    pub fn before_build(&self, build_number: u64) -> Self {
        let runs = self
            .failure_details
            .all_runs()
            .iter()
            .filter(|r| r.id.build_number < build_number)
            .cloned()
            .collect();
        Self::build_in_window(self.test.clone(), runs, &self.workflow, self.window_start)
    }
}

/// Every failing test of a set of upstream jobs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpstreamFailures {
    pub failures: Vec<TestFailure>,
}

impl UpstreamFailures {
    /// Most failing tests first, ties by test name.
    pub fn new(mut failures: Vec<TestFailure>) -> Self {
        failures.sort_by(|a, b| {
            b.failed_count()
                .cmp(&a.failed_count())
                .then_with(|| a.test.cmp(&b.test))
        });
        Self { failures }
    }

    pub fn failed(&self) -> impl Iterator<Item = &TestFailure> {
        self.failures.iter().filter(|f| f.has_failed())
    }

    /// Distinct build numbers across all histories.
    pub fn num_builds(&self) -> usize {
        self.failures
            .iter()
            .flat_map(TestFailure::build_numbers)
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn before_build(&self, build_number: u64) -> Self {
        Self::new(
            self.failures
                .iter()
                .map(|f| f.before_build(build_number))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobId, TestVariant};

    fn test_name() -> TestName {
        TestName::new(TestName::UNKNOWN_CATEGORY, "com.example", "TestClass", "testCase")
    }

    fn nightly() -> WorkflowId {
        WorkflowId::new("nightly").unwrap()
    }

    /// One run per character: P passed, F failed, S skipped.
    fn story(runs: &str) -> Vec<RunDetails> {
        let job = JobId::new("ci", "main").unwrap();
        runs.chars()
            .enumerate()
            .map(|(i, c)| RunDetails {
                id: job.build(i as i64 + 1).unwrap(),
                variant: TestVariant::Default,
                worker: None,
                url: None,
                timestamp: 1_700_000_000 + i as i64 * 3600,
                duration_ms: 2,
                failed: c == 'F',
                skipped: c == 'S',
                output: (c == 'F').then(|| TestRunOutput {
                    error_details: Some("error details".into()),
                    error_stack_trace: Some("stack trace".into()),
                    stdout: Some("stdout".into()),
                    stderr: Some("stderr".into()),
                }),
            })
            .collect()
    }

    #[test]
    fn test_returns_last_failed_output() {
        let failure = TestFailure::build(test_name(), story("PPFPFFSP"), &nightly());
        assert!(failure.has_failed());
        assert_eq!(failure.failed_count(), 3);
        assert!(failure.last_failed_output().is_some());
        assert_eq!(
            failure.failure_details.last_failed().unwrap().id.build_number,
            6
        );
    }

    #[test]
    fn test_no_output_without_failures() {
        let failure = TestFailure::build(test_name(), story("PPPPSP"), &nightly());
        assert!(!failure.has_failed());
        assert!(failure.last_failed_output().is_none());
    }

    #[test]
    fn test_counters_and_workflow() {
        let failure = TestFailure::build(test_name(), story("PFS"), &nightly());
        assert_eq!(failure.workflow.as_str(), "ci");
        assert_eq!(failure.num_runs_total, 3);
        assert_eq!(failure.num_runs_analyzed, 3);
        assert_eq!(failure.duration_sum_ms, 6);

        let empty = TestFailure::build(test_name(), Vec::new(), &nightly());
        assert_eq!(empty.workflow, nightly());
        assert_eq!(empty.num_runs_total, 0);
        assert!(empty.last_run_workflow().is_none());
    }

    #[test]
    fn test_window_limits_analyzed_runs() {
        let runs = story("PPPP");
        let start = DateTime::from_timestamp(runs[2].timestamp, 0).unwrap();
        let failure = TestFailure::build_in_window(test_name(), runs, &nightly(), Some(start));
        assert_eq!(failure.num_runs_total, 4);
        assert_eq!(failure.num_runs_analyzed, 2);
    }

    #[test]
    fn test_before_build_rederives_history() {
        let failure = TestFailure::build(test_name(), story("PFPF"), &nightly());
        let earlier = failure.before_build(3);
        assert_eq!(earlier.build_numbers(), BTreeSet::from([1, 2]));
        assert_eq!(earlier.failed_count(), 1);
        assert_eq!(earlier.num_runs_total, 2);
        assert_eq!(failure.failed_count(), 2);
    }

    #[test]
    fn test_affected_versions_only_count_failures() {
        let mut runs = story("FP");
        runs[1].id = JobId::new("ci", "5.0").unwrap().build(2).unwrap();
        let failure = TestFailure::build(test_name(), runs, &nightly());
        let versions: Vec<&str> = failure
            .affected_versions()
            .iter()
            .map(|v| v.as_str())
            .collect();
        assert_eq!(versions, vec!["main"]);
    }

    #[test]
    fn test_board_orders_by_failures_then_name() {
        let other = TestName::new(TestName::UNKNOWN_CATEGORY, "com.example", "ATest", "testCase");
        let board = UpstreamFailures::new(vec![
            TestFailure::build(test_name(), story("FPP"), &nightly()),
            TestFailure::build(other.clone(), story("PFF"), &nightly()),
            TestFailure::build(test_name(), story("PPFF"), &nightly()),
        ]);
        let counts: Vec<usize> = board.failures.iter().map(|f| f.failed_count()).collect();
        assert_eq!(counts, vec![2, 2, 1]);
        assert_eq!(board.failures[0].test, other);
        assert_eq!(board.num_builds(), 4);
        assert_eq!(board.failed().count(), 3);

        let earlier = board.before_build(3);
        assert_eq!(earlier.failed().count(), 2);
        assert_eq!(earlier.num_builds(), 2);
    }
}
