use anyhow::Result;
use ci_test_history::config::Config;
use ci_test_history::gitlab_client::{host_of, GitlabCiClient};
use ci_test_history::loader::BuildLoader;
use ci_test_history::state::AppState;
use ci_test_history::store::BuildStore;
use ci_test_history::{api, db, monitor};
use gitlab::GitlabBuilder;
use moka::future::Cache;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Arc::new(Config::new()?);

    let store = db::init_db(&config.database.url, config.database.max_connections).await?;
    let store: Arc<dyn BuildStore> = Arc::new(store);
    info!("Database ready at {}", config.database.url);

    let gitlab_client = GitlabBuilder::new(host_of(&config.gitlab.url), config.gitlab.token.clone())
        .build_async()
        .await?;

    let ci = GitlabCiClient::new(
        Arc::new(gitlab_client),
        &config.gitlab.url,
        config.gitlab.token.clone(),
        config.gitlab.timeout_seconds.unwrap_or(30),
        config.gitlab.skip_invalid_certs.unwrap_or(false),
        config.gitlab.max_listed_pipelines.unwrap_or(200),
    )?;

    let loader = BuildLoader::new(
        Arc::new(ci),
        store.clone(),
        config.loader.clone(),
        Handle::current(),
    );

    let ttl = config.trends.ttl_seconds.unwrap_or(600);
    let capacity = config.trends.capacity.unwrap_or(1_000);

    let state = AppState {
        loader: loader.clone(),
        store,
        config: config.clone(),
        refresh_notify: Arc::new(tokio::sync::Notify::new()),
        cache: Cache::builder()
            .time_to_live(std::time::Duration::from_secs(ttl))
            .max_capacity(capacity)
            .build(),
    };

    let monitor_state = state.clone();
    tokio::spawn(async move {
        monitor::start_monitor_loop(monitor_state).await;
    });

    let cleanup_interval = config.loader.cleanup_interval_seconds;
    tokio::spawn(async move {
        monitor::start_cleanup_loop(loader, cleanup_interval).await;
    });

    // Start Web Server
    let app = api::app_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Server running on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
