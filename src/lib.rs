// Library exports for the API binary, tools and tests
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use config::Config;
use db::TableStore;
use services::email::EmailService;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TableStore>,
    pub config: Arc<Config>,
    /// Rate limiting is skipped when Redis is not configured.
    pub redis: Option<redis::aio::MultiplexedConnection>,
    pub email: Option<Arc<EmailService>>,
}
