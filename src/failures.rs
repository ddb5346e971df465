//! Failure statistics over a test's run history.

use crate::codec::{self, DecodeError};
use crate::models::{BranchVersion, RunDetails};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// What to do with records that fail to decode inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Drop the record, count it in [`FailureDetails::malformed`] and keep going.
    #[default]
    Skip,
    /// Fail the whole batch.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error("malformed run record #{index}: {source}")]
    Malformed {
        index: usize,
        #[source]
        source: DecodeError,
    },
}

/// Aggregate over an ordered run history. `all_runs` keeps encounter order.
#[derive(Debug, Clone, Serialize)]
pub struct FailureDetails {
    all_runs: Vec<RunDetails>,
    last_by_variant: BTreeMap<String, RunDetails>,
    last_by_version: BTreeMap<BranchVersion, RunDetails>,
    last_failed_by_version: BTreeMap<BranchVersion, RunDetails>,
    last: Option<RunDetails>,
    oldest: Option<RunDetails>,
    last_failed: Option<RunDetails>,
    failures: usize,
    last_week_failures: usize,
    last_month_failures: usize,
    last_week_runs: usize,
    last_month_runs: usize,
    malformed: usize,
}

fn keep_newer<K: Ord>(map: &mut BTreeMap<K, RunDetails>, key: K, run: &RunDetails) {
    map.entry(key)
        .and_modify(|current| {
            if current.timestamp < run.timestamp {
                *current = run.clone();
            }
        })
        .or_insert_with(|| run.clone());
}

impl FailureDetails {
    pub fn build(runs: Vec<RunDetails>) -> Self {
        Self::build_at(runs, Utc::now())
    }

    /// Builds the aggregate with the 7 and 30 day windows ending at `now`.
    ///
    /// Only the most recent failure keeps its output; everything else is
    /// stripped so the aggregate stays small.
    pub fn build_at(mut runs: Vec<RunDetails>, now: DateTime<Utc>) -> Self {
        let week_start = (now - Duration::days(7)).timestamp();
        let month_start = (now - Duration::days(30)).timestamp();

        let mut last: Option<usize> = None;
        let mut oldest: Option<usize> = None;
        let mut last_failed: Option<usize> = None;
        let mut failures = 0;
        let mut last_week_failures = 0;
        let mut last_month_failures = 0;

        for (i, run) in runs.iter().enumerate() {
            if last.map_or(true, |j| runs[j].timestamp < run.timestamp) {
                last = Some(i);
            }
            if oldest.map_or(true, |j| run.timestamp < runs[j].timestamp) {
                oldest = Some(i);
            }
            if run.failed {
                failures += 1;
                if run.timestamp > week_start {
                    last_week_failures += 1;
                }
                if run.timestamp > month_start {
                    last_month_failures += 1;
                }
                if last_failed.map_or(true, |j| runs[j].timestamp < run.timestamp) {
                    last_failed = Some(i);
                }
            }
        }

        for (i, run) in runs.iter_mut().enumerate() {
            if Some(i) != last_failed {
                run.output = None;
            }
        }

        let mut last_by_variant = BTreeMap::new();
        let mut last_by_version = BTreeMap::new();
        let mut last_failed_by_version = BTreeMap::new();
        for run in &runs {
            keep_newer(&mut last_by_variant, run.variant.to_string(), run);
            keep_newer(&mut last_by_version, run.version(), run);
            if run.failed {
                keep_newer(&mut last_failed_by_version, run.version(), run);
            }
        }

        let last_week_runs = runs.iter().filter(|r| r.timestamp > week_start).count();
        let last_month_runs = runs.iter().filter(|r| r.timestamp > month_start).count();

        Self {
            last: last.map(|i| runs[i].clone()),
            oldest: oldest.map(|i| runs[i].clone()),
            last_failed: last_failed.map(|i| runs[i].clone()),
            all_runs: runs,
            last_by_variant,
            last_by_version,
            last_failed_by_version,
            failures,
            last_week_failures,
            last_month_failures,
            last_week_runs,
            last_month_runs,
            malformed: 0,
        }
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn all_runs(&self) -> &[RunDetails] {
        &self.all_runs
    }

    pub fn into_runs(self) -> Vec<RunDetails> {
        self.all_runs
    }

    pub fn runs_newest_first(&self) -> Vec<&RunDetails> {
        let mut runs: Vec<&RunDetails> = self.all_runs.iter().collect();
        runs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        runs
    }

    pub fn last(&self) -> Option<&RunDetails> {
        self.last.as_ref()
    }

    pub fn oldest(&self) -> Option<&RunDetails> {
        self.oldest.as_ref()
    }

    pub fn last_failed(&self) -> Option<&RunDetails> {
        self.last_failed.as_ref()
    }

    pub fn last_by_variant(&self) -> &BTreeMap<String, RunDetails> {
        &self.last_by_variant
    }

    pub fn last_by_version(&self) -> &BTreeMap<BranchVersion, RunDetails> {
        &self.last_by_version
    }

    pub fn last_failed_by_version(&self) -> &BTreeMap<BranchVersion, RunDetails> {
        &self.last_failed_by_version
    }

    pub fn last_week_failures(&self) -> usize {
        self.last_week_failures
    }

    pub fn last_month_failures(&self) -> usize {
        self.last_month_failures
    }

    pub fn last_week_runs(&self) -> usize {
        self.last_week_runs
    }

    pub fn last_month_runs(&self) -> usize {
        self.last_month_runs
    }

    /// Records dropped while decoding the batch this was built from.
    pub fn malformed(&self) -> usize {
        self.malformed
    }
}

/// Decodes compact batches into [`FailureDetails`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator {
    policy: MalformedPolicy,
}

impl Aggregator {
    pub fn new(policy: MalformedPolicy) -> Self {
        Self { policy }
    }

    pub fn aggregate(&self, batch: &str) -> Result<FailureDetails, BatchError> {
        self.aggregate_at(batch, Utc::now())
    }

    pub fn aggregate_at(
        &self,
        batch: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureDetails, BatchError> {
        match self.policy {
            MalformedPolicy::Skip => Ok(aggregate_skipping(batch, now)),
            MalformedPolicy::Reject => {
                let runs = codec::split_batch(batch)
                    .enumerate()
                    .map(|(index, record)| {
                        codec::decode(record).map_err(|source| BatchError::Malformed { index, source })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(FailureDetails::build_at(runs, now))
            }
        }
    }
}

fn aggregate_skipping(batch: &str, now: DateTime<Utc>) -> FailureDetails {
    let mut malformed = 0;
    let runs = codec::split_batch(batch)
        .enumerate()
        .filter_map(|(index, record)| match codec::decode(record) {
            Ok(run) => Some(run),
            Err(error) => {
                debug!(index, %error, "skipping malformed run record");
                malformed += 1;
                None
            }
        })
        .collect();
    let mut details = FailureDetails::build_at(runs, now);
    details.malformed = malformed;
    details
}

/// Aggregates a batch, skipping malformed records.
pub fn aggregate(batch: &str) -> FailureDetails {
    aggregate_skipping(batch, Utc::now())
}
