use crate::models::{BuildId, CiBuild, JobId};
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum CiError {
    #[error("cannot reach CI host {host}")]
    UnreachableHost { host: String },
    #[error("CI request failed with HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("cannot decode CI response: {0}")]
    Decode(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Read access to the external CI system.
#[async_trait]
pub trait CiClient: Send + Sync {
    /// Builds of `job`, newest first. `None` when the CI system does not know the job.
    async fn list_builds(&self, job: &JobId) -> Result<Option<Vec<BuildId>>, CiError>;

    /// A single build with its test results. `None` when it no longer exists.
    async fn fetch_build(&self, build: &BuildId) -> Result<Option<CiBuild>, CiError>;
}
