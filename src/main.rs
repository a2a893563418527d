use std::{sync::Arc, time::Duration};

use axum::Router;
use endorser_engine::{
    agent::AcaPyClient,
    config::Config,
    db::connect_and_bootstrap,
    handlers::router,
    retry::RetryPolicy,
    state::AppState,
    webhooks::{WebhookQueue, start_webhook_workers},
};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,endorser_engine=info".to_string()),
        )
        .json()
        .init();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!(error = %err, "refusing to start");
            return Err(err.into());
        }
    };
    info!(policy = ?config.policy, "endorser policy loaded");

    let db = connect_and_bootstrap(&config.database_url).await?;
    let http_client = Client::builder()
        .timeout(Duration::from_secs(config.agent_request_timeout_secs))
        .build()?;

    if config.agent_admin_url.is_none() {
        info!("AGENT_ADMIN_URL not set, agent control calls are simulated");
    }
    let agent = AcaPyClient::new(
        config.agent_admin_url.clone(),
        config.agent_admin_api_key.clone(),
        http_client,
    );

    let (webhooks, webhook_rx) = WebhookQueue::channel(config.webhook_queue_depth);
    let shutdown = CancellationToken::new();

    let state = AppState {
        config: config.clone(),
        db,
        agent: Arc::new(agent),
        retry: RetryPolicy::from_config(&config),
        webhooks,
        shutdown: shutdown.clone(),
    };

    let dispatcher = start_webhook_workers(state.clone(), webhook_rx);

    let app: Router = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(bind_addr = %config.bind_addr, "endorser engine listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    dispatcher.await?;
    info!("endorser engine stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(err) => {
                error!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(signal = "ctrl-c", "shutdown requested"),
        _ = terminate => info!(signal = "SIGTERM", "shutdown requested"),
    }
    shutdown.cancel();
}
