use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use sqlx::FromRow;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Characters that separate fields and records in the compact run format.
const RESERVED: [char; 2] = ['|', ','];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("{kind} cannot be blank")]
    Blank { kind: &'static str },
    #[error("{kind} '{value}' contains reserved character '{ch}'")]
    ReservedChar {
        kind: &'static str,
        value: String,
        ch: char,
    },
    #[error("invalid build number: {0}")]
    InvalidBuildNumber(i64),
    #[error("suite name cannot be blank")]
    BlankSuite,
}

fn validated(kind: &'static str, value: &str) -> Result<String, IdError> {
    if value.trim().is_empty() {
        return Err(IdError::Blank { kind });
    }
    if let Some(ch) = value.chars().find(|c| RESERVED.contains(c)) {
        return Err(IdError::ReservedChar {
            kind,
            value: value.to_string(),
            ch,
        });
    }
    Ok(value.to_string())
}

/// A named CI pipeline definition. For GitLab this is the project full path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn new(name: &str) -> Result<Self, IdError> {
        validated("workflow", name).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn job(&self, branch: Branch) -> JobId {
        JobId {
            workflow: self.clone(),
            branch,
        }
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Branch(String);

impl Branch {
    pub fn new(name: &str) -> Result<Self, IdError> {
        validated("branch", name).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Upstream branches are named after the version they track.
    pub fn version(&self) -> BranchVersion {
        BranchVersion::new(&self.0)
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tracked CI job: one branch of one workflow. Used as the import dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId {
    pub workflow: WorkflowId,
    pub branch: Branch,
}

impl JobId {
    pub fn new(workflow: &str, branch: &str) -> Result<Self, IdError> {
        Ok(WorkflowId::new(workflow)?.job(Branch::new(branch)?))
    }

    pub fn build(&self, build_number: i64) -> Result<BuildId, IdError> {
        BuildId::new(self.clone(), build_number)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} > {}", self.workflow, self.branch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BuildId {
    #[serde(flatten)]
    pub job: JobId,
    pub build_number: u64,
}

impl BuildId {
    pub fn new(job: JobId, build_number: i64) -> Result<Self, IdError> {
        if build_number <= 0 {
            return Err(IdError::InvalidBuildNumber(build_number));
        }
        Ok(Self {
            job,
            build_number: build_number as u64,
        })
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} > #{}", self.job, self.build_number)
    }
}

/// Version derived from a branch name, ordered semantically ("4.10" > "4.9").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BranchVersion(String);

impl BranchVersion {
    pub fn new(version: &str) -> Self {
        Self(version.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(['.', '-'])
    }
}

fn compare_segment(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

impl Ord for BranchVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut left = self.segments();
        let mut right = other.segments();
        loop {
            match (left.next(), right.next()) {
                (None, None) => return self.0.cmp(&other.0),
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(a), Some(b)) => match compare_segment(a, b) {
                    Ordering::Equal => continue,
                    unequal => return unequal,
                },
            }
        }
    }
}

impl PartialOrd for BranchVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BranchVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for BranchVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// The configuration a test ran with. Runs without one use [`TestVariant::Default`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TestVariant {
    Default,
    Named(String),
}

impl TestVariant {
    pub const DEFAULT_REPR: &'static str = "<default>";

    pub fn parse(s: &str) -> Self {
        if s.trim().is_empty() || s.eq_ignore_ascii_case(Self::DEFAULT_REPR) {
            TestVariant::Default
        } else {
            TestVariant::Named(s.to_string())
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, TestVariant::Default)
    }

    /// Representation inside a compact run record: the default variant is empty.
    pub fn record_field(&self) -> &str {
        match self {
            TestVariant::Default => "",
            TestVariant::Named(name) => name,
        }
    }
}

impl Ord for TestVariant {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (TestVariant::Default, TestVariant::Default) => Ordering::Equal,
            (TestVariant::Default, _) => Ordering::Greater,
            (_, TestVariant::Default) => Ordering::Less,
            (TestVariant::Named(a), TestVariant::Named(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for TestVariant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TestVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestVariant::Default => f.write_str(Self::DEFAULT_REPR),
            TestVariant::Named(name) => f.write_str(name),
        }
    }
}

impl Serialize for TestVariant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Fully qualified test identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TestName {
    pub category: String,
    /// Everything leading up to the class name; may be empty.
    pub path: String,
    pub class_name: String,
    pub test_name: String,
}

impl TestName {
    pub const UNKNOWN_CATEGORY: &'static str = "UNKNOWN";

    pub fn new(category: &str, path: &str, class_name: &str, test_name: &str) -> Self {
        Self {
            category: category.to_string(),
            path: path.to_string(),
            class_name: class_name.to_string(),
            test_name: test_name.to_string(),
        }
    }

    /// Splits `suite` on its last `.` into path and class name.
    pub fn of_suite_and_test(suite: &str, test_case: &str) -> Result<Self, IdError> {
        if suite.trim().is_empty() {
            return Err(IdError::BlankSuite);
        }
        let (path, class_name) = suite.rsplit_once('.').unwrap_or(("", suite));
        Ok(Self::new(Self::UNKNOWN_CATEGORY, path, class_name, test_case))
    }

    pub fn suite(&self) -> String {
        if self.path.is_empty() {
            self.class_name.clone()
        } else {
            format!("{}.{}", self.path, self.class_name)
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.suite(), self.test_name)
    }
}

impl fmt::Display for TestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class_name, self.test_name)
    }
}

/// Error text, stack trace and captured streams of one test run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunOutput {
    pub error_details: Option<String>,
    pub error_stack_trace: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl TestRunOutput {
    pub fn is_empty(&self) -> bool {
        self.error_details.is_none()
            && self.error_stack_trace.is_none()
            && self.stdout.is_none()
            && self.stderr.is_none()
    }
}

/// Outcome of one test execution within one build.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunDetails {
    pub id: BuildId,
    pub variant: TestVariant,
    pub worker: Option<String>,
    pub url: Option<String>,
    /// Epoch seconds.
    pub timestamp: i64,
    pub duration_ms: u64,
    pub failed: bool,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<TestRunOutput>,
}

impl RunDetails {
    pub fn version(&self) -> BranchVersion {
        self.id.job.branch.version()
    }

    pub fn has_output(&self) -> bool {
        self.output.as_ref().is_some_and(|o| !o.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    NotBuilt,
    Running,
    Aborted,
    Success,
    Unstable,
    Failure,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::NotBuilt => "NOT_BUILT",
            BuildStatus::Running => "RUNNING",
            BuildStatus::Aborted => "ABORTED",
            BuildStatus::Success => "SUCCESS",
            BuildStatus::Unstable => "UNSTABLE",
            BuildStatus::Failure => "FAILURE",
        }
    }

    pub fn is_completed(&self) -> bool {
        !matches!(
            self,
            BuildStatus::NotBuilt | BuildStatus::Running | BuildStatus::Aborted
        )
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, BuildStatus::Aborted | BuildStatus::Failure)
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_BUILT" => Ok(BuildStatus::NotBuilt),
            "RUNNING" => Ok(BuildStatus::Running),
            "ABORTED" => Ok(BuildStatus::Aborted),
            "SUCCESS" => Ok(BuildStatus::Success),
            "UNSTABLE" => Ok(BuildStatus::Unstable),
            "FAILURE" => Ok(BuildStatus::Failure),
            other => Err(format!("unknown build status '{}'", other)),
        }
    }
}

/// A build as reported by the CI system, with its test results.
#[derive(Debug, Clone)]
pub struct CiBuild {
    pub id: BuildId,
    pub url: Option<String>,
    pub status: BuildStatus,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub test_runs: Vec<CiTestRun>,
}

impl CiBuild {
    pub fn failed_tests(&self) -> i64 {
        self.test_runs.iter().filter(|r| r.failed).count() as i64
    }

    pub fn skipped_tests(&self) -> i64 {
        self.test_runs.iter().filter(|r| r.skipped).count() as i64
    }

    pub fn ran_tests(&self) -> i64 {
        self.test_runs.iter().filter(|r| !r.skipped).count() as i64
    }

    /// A build is usable for history when at least 60% of its tests ran.
    pub fn is_usable(&self) -> bool {
        let total = self.test_runs.len();
        total > 0 && self.ran_tests() as f64 / total as f64 >= 0.60
    }
}

#[derive(Debug, Clone)]
pub struct CiTestRun {
    pub test: TestName,
    pub variant: TestVariant,
    pub worker: Option<String>,
    pub duration_ms: u64,
    pub failed: bool,
    pub skipped: bool,
    pub output: TestRunOutput,
    pub url: Option<String>,
}

/// A row of the `builds` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredBuild {
    pub id: i64,
    pub job_id: i64,
    pub build_number: i64,
    pub build_url: Option<String>,
    pub status: String,
    /// Epoch seconds.
    pub start_time: i64,
    pub duration_ms: i64,
    pub usable: bool,
    pub fully_stored: bool,
    pub failed_tests: i64,
    pub ran_tests: i64,
    pub skipped_tests: i64,
}

impl StoredBuild {
    pub fn build_status(&self) -> BuildStatus {
        self.status.parse().unwrap_or(BuildStatus::NotBuilt)
    }
}
