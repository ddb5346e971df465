//! Compact run record format.
//!
//! One record per test run, fields separated by `|`:
//!
//! ```text
//! workflow|branch|buildNumber|epochSeconds|variant|worker|failed|skipped[|url]
//! ```
//!
//! Records are joined with `,` into a batch.

use crate::models::{IdError, JobId, RunDetails, TestVariant};

pub const FIELD_SEPARATOR: char = '|';
pub const RECORD_SEPARATOR: char = ',';
const MIN_FIELDS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("expected at least 8 fields, got {0}")]
    TooFewFields(usize),
    #[error("invalid build number '{0}'")]
    InvalidBuildNumber(String),
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error(transparent)]
    InvalidIdentifier(#[from] IdError),
}

fn parse_flag(field: &str) -> bool {
    field == "1" || field.eq_ignore_ascii_case("true")
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Decodes a single record. Duration and output are not carried by the format.
pub fn decode(record: &str) -> Result<RunDetails, DecodeError> {
    let parts: Vec<&str> = record.split(FIELD_SEPARATOR).collect();
    if parts.len() < MIN_FIELDS {
        return Err(DecodeError::TooFewFields(parts.len()));
    }
    let build_number: i64 = parts[2]
        .parse()
        .map_err(|_| DecodeError::InvalidBuildNumber(parts[2].to_string()))?;
    let timestamp: i64 = parts[3]
        .parse()
        .map_err(|_| DecodeError::InvalidTimestamp(parts[3].to_string()))?;
    let id = JobId::new(parts[0], parts[1])?.build(build_number)?;

    Ok(RunDetails {
        id,
        variant: TestVariant::parse(parts[4]),
        worker: Some(parts[5]).filter(|w| !w.is_empty()).map(str::to_string),
        url: parts
            .get(8)
            .filter(|u| !u.is_empty())
            .map(|u| u.to_string()),
        timestamp,
        duration_ms: 0,
        failed: parse_flag(parts[6]),
        skipped: parse_flag(parts[7]),
        output: None,
    })
}

pub fn encode(run: &RunDetails) -> String {
    let mut record = format!(
        "{workflow}|{branch}|{build}|{ts}|{variant}|{worker}|{failed}|{skipped}",
        workflow = run.id.job.workflow,
        branch = run.id.job.branch,
        build = run.id.build_number,
        ts = run.timestamp,
        variant = run.variant.record_field(),
        worker = run.worker.as_deref().unwrap_or(""),
        failed = flag(run.failed),
        skipped = flag(run.skipped),
    );
    if let Some(url) = &run.url {
        record.push(FIELD_SEPARATOR);
        record.push_str(url);
    }
    record
}

/// Splits a batch into its records. An empty batch holds no records.
pub fn split_batch(batch: &str) -> impl Iterator<Item = &str> {
    batch
        .split(RECORD_SEPARATOR)
        .filter(move |_| !batch.is_empty())
}

/// Joins already encoded records into a batch, keeping their order.
pub fn join_records<S: AsRef<str>>(records: impl IntoIterator<Item = S>) -> String {
    let mut batch = String::new();
    for (i, record) in records.into_iter().enumerate() {
        if i > 0 {
            batch.push(RECORD_SEPARATOR);
        }
        batch.push_str(record.as_ref());
    }
    batch
}

pub fn encode_batch<'a>(runs: impl IntoIterator<Item = &'a RunDetails>) -> String {
    join_records(runs.into_iter().map(encode))
}
