//! Per version / per workflow build trends for charting.

use crate::models::{BranchVersion, StoredBuild, WorkflowId};
use serde::Serialize;
use std::cmp::Ordering;

/// Number of most recent builds summarised separately from the full history.
pub const DEFAULT_RECENT_WINDOW: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

/// Points of one series, in render order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChartData {
    pub points: Vec<Point>,
}

impl ChartData {
    pub fn point(&mut self, x: i64, y: i64, extra: Option<String>) -> &mut Self {
        self.points.push(Point { x, y, extra });
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrendData {
    pub test_failures: ChartData,
    pub test_runs: ChartData,
    pub duration: ChartData,

    pub num_builds: usize,
    pub num_builds_failed: usize,
    pub num_builds_broken: usize,
    pub num_recent: usize,
    pub num_recent_failed: usize,
    pub num_recent_broken: usize,
    pub avg_num_failures_per_build: Option<f64>,
    pub avg_build_duration_min: Option<f64>,
    pub avg_recent_duration_min: Option<f64>,
    pub p90_build_duration_min: Option<f64>,
    pub p90_recent_duration_min: Option<f64>,
}

fn minutes(build: &StoredBuild) -> f64 {
    build.duration_ms as f64 / 1000.0 / 60.0
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Largest value among the lowest 90% (rounded, at least one value).
fn p90(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut values: Vec<f64> = values.collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let keep = ((0.9 * values.len() as f64).round() as usize).max(1);
    values.get(keep - 1).copied()
}

impl TrendData {
    /// `builds` must be ordered oldest first; the recent window is their tail.
    pub fn from_builds(builds: &[StoredBuild], recent_window: usize) -> Self {
        let mut data = TrendData::default();
        for build in builds {
            let x = build.start_time * 1000;
            let extra = Some(format!("#{}", build.build_number));
            data.test_failures.point(x, build.failed_tests, extra.clone());
            data.test_runs.point(x, build.ran_tests, extra.clone());
            data.duration.point(x, build.duration_ms / 1000 / 60, extra);
        }

        let recent = &builds[builds.len().saturating_sub(recent_window)..];
        let failed = |b: &&StoredBuild| b.failed_tests > 0;
        let broken = |b: &&StoredBuild| b.build_status().is_broken();

        data.num_builds = builds.len();
        data.num_builds_failed = builds.iter().filter(failed).count();
        data.num_builds_broken = builds.iter().filter(broken).count();
        data.num_recent = recent.len();
        data.num_recent_failed = recent.iter().filter(failed).count();
        data.num_recent_broken = recent.iter().filter(broken).count();
        data.avg_num_failures_per_build = average(builds.iter().map(|b| b.failed_tests as f64));
        data.avg_build_duration_min = average(builds.iter().map(minutes));
        data.avg_recent_duration_min = average(recent.iter().map(minutes));
        data.p90_build_duration_min = p90(builds.iter().map(minutes));
        data.p90_recent_duration_min = p90(recent.iter().map(minutes));
        data
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowVersionData {
    pub version: BranchVersion,
    pub workflow: WorkflowId,
    pub data: TrendData,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamTrends {
    pub data: Vec<WorkflowVersionData>,
}

impl UpstreamTrends {
    /// Orders entries by version, then workflow name. The sort is stable.
    pub fn build(entries: Vec<WorkflowVersionData>) -> Self {
        Self::build_by(entries, BranchVersion::cmp)
    }

    pub fn build_by<F>(mut entries: Vec<WorkflowVersionData>, compare_versions: F) -> Self
    where
        F: Fn(&BranchVersion, &BranchVersion) -> Ordering,
    {
        entries.sort_by(|a, b| {
            compare_versions(&a.version, &b.version).then_with(|| a.workflow.cmp(&b.workflow))
        });
        Self { data: entries }
    }
}
