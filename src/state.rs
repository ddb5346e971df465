use crate::config::Config;
use crate::loader::BuildLoader;
use crate::store::BuildStore;
use moka::future::Cache;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone)]
pub struct AppState {
    pub loader: BuildLoader,
    pub store: Arc<dyn BuildStore>,
    pub config: Arc<Config>,
    pub refresh_notify: Arc<Notify>,
    pub cache: Cache<String, JsonValue>,
}
