use std::sync::Arc;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::{agent::AgentControl, config::Config, retry::RetryPolicy, webhooks::WebhookQueue};

#[derive(Clone, Debug)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: SqlitePool,
    pub agent: Arc<dyn AgentControl>,
    pub retry: RetryPolicy,
    pub webhooks: WebhookQueue,
    pub shutdown: CancellationToken,
}
