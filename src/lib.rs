pub mod api;
pub mod ci;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod failures;
pub mod gitlab_client;
pub mod gitlab_ops;
pub mod gitlab_types;
pub mod loader;
pub mod models;
pub mod monitor;
pub mod state;
pub mod store;
pub mod test_failure;
pub mod trends;

#[cfg(test)]
mod test_support;
