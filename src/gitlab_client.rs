use crate::ci::{CiClient, CiError};
use crate::gitlab_ops;
use crate::gitlab_types::{self, PipelineDetail, TestReport};
use crate::models::{BuildId, CiBuild, JobId};
use anyhow::Result;
use async_trait::async_trait;
use gitlab::AsyncGitlab;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::debug;

/// Reads jobs and builds from GitLab: a workflow is a project path, a branch
/// is a ref and a build number is a pipeline id.
#[derive(Clone)]
pub struct GitlabCiClient {
    gitlab: Arc<AsyncGitlab>,
    http: Client,
    base_url: String,
    token: String,
    list_limit: usize,
}

impl GitlabCiClient {
    pub fn new(
        gitlab: Arc<AsyncGitlab>,
        base_url: &str,
        token: String,
        timeout: u64,
        skip_invalid_certs: bool,
        list_limit: usize,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout))
            .danger_accept_invalid_certs(skip_invalid_certs)
            .build()?;

        Ok(Self {
            gitlab,
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            list_limit,
        })
    }

    fn project_url(&self, project: &str) -> String {
        project_api_url(&self.base_url, project)
    }

    fn transport_error(&self, e: reqwest::Error) -> CiError {
        if e.is_connect() || e.is_timeout() {
            CiError::UnreachableHost {
                host: host_of(&self.base_url).to_string(),
            }
        } else {
            CiError::Other(e.into())
        }
    }

    /// `None` on 404.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, CiError> {
        let resp = self
            .http
            .get(url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(CiError::Http { status, body });
        }
        resp.json::<T>()
            .await
            .map(Some)
            .map_err(|e| CiError::Decode(e.to_string()))
    }
}

/// REST url of a project addressed by its full path.
fn project_api_url(base_url: &str, project: &str) -> String {
    format!(
        "{}/api/v4/projects/{}",
        base_url.trim_end_matches('/'),
        project.replace('/', "%2F")
    )
}

pub fn host_of(url: &str) -> &str {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
}

#[async_trait]
impl CiClient for GitlabCiClient {
    async fn list_builds(&self, job: &JobId) -> Result<Option<Vec<BuildId>>, CiError> {
        let project = job.workflow.as_str();
        if self
            .get_json::<JsonValue>(&self.project_url(project))
            .await?
            .is_none()
        {
            return Ok(None);
        }

        let pipelines = gitlab_ops::fetch_pipelines_with_retry(
            &self.gitlab,
            project,
            job.branch.as_str(),
            self.list_limit,
        )
        .await?;
        debug!(%job, count = pipelines.len(), "listed pipelines");

        pipelines
            .iter()
            .map(|p| {
                job.build(p.id as i64)
                    .map_err(|e| CiError::Decode(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    async fn fetch_build(&self, build: &BuildId) -> Result<Option<CiBuild>, CiError> {
        let pipeline_url = format!(
            "{}/pipelines/{}",
            self.project_url(build.job.workflow.as_str()),
            build.build_number
        );
        let Some(pipeline) = self.get_json::<PipelineDetail>(&pipeline_url).await? else {
            return Ok(None);
        };
        if pipeline.r#ref != build.job.branch.as_str() {
            debug!(%build, pipeline_ref = %pipeline.r#ref, "pipeline belongs to another ref");
            return Ok(None);
        }
        let report = self
            .get_json::<TestReport>(&format!("{}/test_report", pipeline_url))
            .await?;

        Ok(Some(gitlab_types::to_ci_build(
            build.clone(),
            &pipeline,
            report.as_ref(),
        )))
    }
}
