use crate::config::UpstreamConfig;
use crate::loader::{BuildLoader, TaskId};
use crate::models::JobId;
use crate::state::AppState;
use chrono::Utc;
use regex::Regex;
use std::time::Duration as StdDuration;
use tokio::time::sleep;
use tracing::{error, info, warn};

fn branch_filter(config: &UpstreamConfig) -> Option<Regex> {
    let re = config.branch_filter_regex.as_ref()?;
    match Regex::new(re) {
        Ok(r) => Some(r),
        Err(e) => {
            error!("Invalid branch filter regex: {}", e);
            None
        }
    }
}

/// Configured upstream jobs whose branch passes the branch filter.
pub fn upstream_jobs(config: &UpstreamConfig) -> Vec<JobId> {
    let filter = branch_filter(config);
    let mut jobs = Vec::new();
    for upstream in &config.jobs {
        for branch in &upstream.branches {
            if let Some(re) = &filter {
                if !re.is_match(branch) {
                    continue;
                }
            }
            match JobId::new(&upstream.workflow, branch) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(workflow = %upstream.workflow, %branch, "skipping upstream job: {}", e),
            }
        }
    }
    jobs
}

pub fn submit_upstream_loads(loader: &BuildLoader, jobs: &[JobId]) -> Vec<TaskId> {
    jobs.iter()
        .map(|job| loader.submit_default(job.clone()))
        .collect()
}

/// Periodically loads the upstream jobs; a refresh request starts a cycle early.
pub async fn start_monitor_loop(state: AppState) {
    let jobs = upstream_jobs(&state.config.upstream);
    let interval = state.config.upstream.interval_seconds;

    loop {
        info!("Submitting loads for {} upstream jobs", jobs.len());
        let tasks = submit_upstream_loads(&state.loader, &jobs);
        info!(
            "Upstream cycle submitted {} tasks. Next cycle in {} seconds.",
            tasks.len(),
            interval
        );

        tokio::select! {
            _ = sleep(StdDuration::from_secs(interval)) => {}
            _ = state.refresh_notify.notified() => {
                info!("Received upstream refresh signal.");
                state.cache.invalidate_all();
            }
        }
    }
}

/// Periodically drops expired load statuses.
pub async fn start_cleanup_loop(loader: BuildLoader, interval_seconds: u64) {
    loop {
        sleep(StdDuration::from_secs(interval_seconds.max(1))).await;
        let removed = loader.prune_finished(Utc::now());
        if removed > 0 {
            info!("Pruned {} finished load statuses", removed);
        }
    }
}
