use crate::gitlab_types::GitlabPipeline;
use anyhow::Result;
use gitlab::api::common::SortOrder;
use gitlab::api::projects::pipelines::{PipelineOrderBy, Pipelines};
use gitlab::api::{paged, AsyncQuery, Pagination};
use gitlab::AsyncGitlab;
use std::time::Duration;
use tracing::warn;

const MAX_RETRIES: u32 = 3;

/// Pipelines of `project` on `ref_name`, newest first, at most `limit` of them.
pub async fn fetch_pipelines(
    client: &AsyncGitlab,
    project: &str,
    ref_name: &str,
    limit: usize,
) -> Result<Vec<GitlabPipeline>> {
    let mut builder = Pipelines::builder();
    builder.project(project);
    builder.ref_(ref_name);
    builder.order_by(PipelineOrderBy::Id);
    builder.sort(SortOrder::Descending);

    let endpoint = builder.build()?;
    let pipelines: Vec<GitlabPipeline> = paged(endpoint, Pagination::Limit(limit))
        .query_async(client)
        .await?;
    Ok(pipelines)
}

/// [`fetch_pipelines`] with exponential backoff: 500ms * 2^(attempt-1).
pub async fn fetch_pipelines_with_retry(
    client: &AsyncGitlab,
    project: &str,
    ref_name: &str,
    limit: usize,
) -> Result<Vec<GitlabPipeline>> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match fetch_pipelines(client, project, ref_name, limit).await {
            Ok(pipelines) => return Ok(pipelines),
            Err(e) => {
                if attempt > MAX_RETRIES {
                    return Err(e);
                }
                let backoff = backoff(attempt);
                warn!(project, ref_name, attempt, error = %e, "listing pipelines failed, retrying in {:?}", backoff);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(500u64.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16)))
}
