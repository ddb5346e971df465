use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

use crate::failures::MalformedPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub gitlab: GitLabConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub trends: TrendsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitLabConfig {
    pub url: String,
    pub token: String,
    pub timeout_seconds: Option<u64>,
    pub skip_invalid_certs: Option<bool>,
    /// Upper bound on pipelines listed per job.
    pub max_listed_pipelines: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:ci_history.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoaderConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_builds_per_job")]
    pub max_builds_per_job: usize,
    #[serde(default = "default_status_retention_seconds")]
    pub status_retention_seconds: u64,
    #[serde(default = "default_max_retained_statuses")]
    pub max_retained_statuses: usize,
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_builds_per_job: default_max_builds_per_job(),
            status_retention_seconds: default_status_retention_seconds(),
            max_retained_statuses: default_max_retained_statuses(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
        }
    }
}

fn default_workers() -> usize {
    5
}

fn default_max_builds_per_job() -> usize {
    32
}

fn default_status_retention_seconds() -> u64 {
    3600
}

fn default_max_retained_statuses() -> usize {
    1000
}

fn default_cleanup_interval_seconds() -> u64 {
    900
}

/// A workflow whose listed branches are loaded periodically.
#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamJob {
    pub workflow: String,
    pub branches: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub jobs: Vec<UpstreamJob>,
    #[serde(default = "default_upstream_interval_seconds")]
    pub interval_seconds: u64,
    pub branch_filter_regex: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            jobs: Vec::new(),
            interval_seconds: default_upstream_interval_seconds(),
            branch_filter_regex: None,
        }
    }
}

fn default_upstream_interval_seconds() -> u64 {
    1800
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrendsConfig {
    #[serde(default = "default_trend_days")]
    pub days: i64,
    #[serde(default = "default_recent_builds")]
    pub recent_builds: usize,
    #[serde(default)]
    pub malformed_records: MalformedPolicy,
    pub ttl_seconds: Option<u64>,
    pub capacity: Option<u64>,
}

impl Default for TrendsConfig {
    fn default() -> Self {
        Self {
            days: default_trend_days(),
            recent_builds: default_recent_builds(),
            malformed_records: MalformedPolicy::default(),
            ttl_seconds: None,
            capacity: None,
        }
    }
}

fn default_trend_days() -> i64 {
    30
}

fn default_recent_builds() -> usize {
    crate::trends::DEFAULT_RECENT_WINDOW
}

impl Config {
    /// Reads `config.toml` (or any format `config` recognises), overridable
    /// with `APP__SECTION__KEY` environment variables.
    pub fn new() -> Result<Self, ConfigError> {
        let s = ConfigLoader::builder()
            .add_source(File::with_name("config"))
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn parse(toml: &str) -> Config {
        ConfigLoader::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse(
            r#"
            [server]
            host = "0.0.0.0"
            port = 8080

            [gitlab]
            url = "https://gitlab.example.com"
            token = "secret"
            "#,
        );
        assert_eq!(config.loader.workers, 5);
        assert_eq!(config.loader.max_builds_per_job, 32);
        assert_eq!(config.loader.status_retention_seconds, 3600);
        assert_eq!(config.upstream.interval_seconds, 1800);
        assert!(config.upstream.jobs.is_empty());
        assert_eq!(config.trends.recent_builds, 16);
        assert_eq!(config.trends.malformed_records, MalformedPolicy::Skip);
        assert_eq!(config.database.url, "sqlite:ci_history.db?mode=rwc");
    }

    #[test]
    fn test_upstream_jobs_and_overrides() {
        let config = parse(
            r#"
            [server]
            host = "127.0.0.1"
            port = 3000

            [gitlab]
            url = "https://gitlab.example.com"
            token = "secret"
            timeout_seconds = 10

            [loader]
            workers = 2
            max_builds_per_job = 8

            [upstream]
            branch_filter_regex = "^(main|\\d+\\.\\d+)$"

            [[upstream.jobs]]
            workflow = "group/project"
            branches = ["main", "4.0"]

            [trends]
            malformed_records = "reject"
            "#,
        );
        assert_eq!(config.loader.workers, 2);
        assert_eq!(config.loader.max_builds_per_job, 8);
        assert_eq!(config.loader.max_retained_statuses, 1000);
        assert_eq!(config.gitlab.timeout_seconds, Some(10));
        assert_eq!(config.upstream.jobs.len(), 1);
        assert_eq!(config.upstream.jobs[0].branches, vec!["main", "4.0"]);
        assert_eq!(config.trends.malformed_records, MalformedPolicy::Reject);
    }
}
