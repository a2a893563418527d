use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post, put},
};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::{
    auth::{
        OperatorContext, issue_operator_token, operator_auth_middleware, verify_admin_credentials,
        webhook_api_key_middleware,
    },
    allow_lists, connections,
    db::page_window,
    error::AppError,
    models::{
        AllowListPage, AllowedLogEntry, AllowedLogEntryRequest, AllowedPublicDid,
        AllowedPublicDidRequest, AllowedSchema, AllowedSchemaRequest, ConfigureConnectionRequest,
        ConnectionListQuery, ConnectionPage, ConnectionRecord, Decision, DecisionSource, PageQuery,
        RefuseRequest, TokenRequest, TokenResponse, TransactionListQuery, TransactionPage,
        TransactionRecord, WebhookEnvelope, WitnessListQuery, WitnessPage, WitnessRecord,
    },
    state::AppState,
    transactions,
    webhooks::{decode, normalize_topic},
    witnesses,
};

pub fn router(state: AppState) -> Router {
    let webhooks = Router::new()
        .route("/v1/webhooks", post(receive_envelope))
        .route("/topic/:topic", post(receive_topic))
        .route("/topic/:topic/", post(receive_topic))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            webhook_api_key_middleware,
        ));

    let protected = Router::new()
        .route("/v1/transactions", get(list_transactions))
        .route("/v1/transactions/:transaction_id", get(get_transaction))
        .route("/v1/transactions/:transaction_id/endorse", post(endorse_transaction))
        .route("/v1/transactions/:transaction_id/refuse", post(refuse_transaction))
        .route("/v1/transactions/:transaction_id/retry", post(retry_transaction))
        .route("/v1/connections", get(list_connections))
        .route("/v1/connections/:connection_id", get(get_connection))
        .route("/v1/connections/:connection_id/accept", post(accept_connection))
        .route("/v1/connections/:connection_id/reject", post(reject_connection))
        .route("/v1/connections/:connection_id/configure", put(configure_connection))
        .route("/v1/witness-requests", get(list_witness_requests))
        .route("/v1/witness-requests/:record_id", get(get_witness_request))
        .route("/v1/witness-requests/:record_id/approve", post(approve_witness_request))
        .route("/v1/witness-requests/:record_id/reject", post(reject_witness_request))
        .route("/v1/witness-requests/:record_id/retry", post(retry_witness_request))
        .route("/v1/allow/public-dids", get(list_allowed_public_dids).post(add_allowed_public_did))
        .route("/v1/allow/public-dids/:registered_did", delete(remove_allowed_public_did))
        .route("/v1/allow/schemas", get(list_allowed_schemas).post(add_allowed_schema))
        .route("/v1/allow/schemas/:allowed_schema_id", delete(remove_allowed_schema))
        .route("/v1/allow/log-entries", get(list_allowed_log_entries).post(add_allowed_log_entry))
        .route("/v1/allow/log-entries/:allowed_log_entry_id", delete(remove_allowed_log_entry))
        .route("/v1/config", get(get_config))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            operator_auth_middleware,
        ));

    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/readyz", get(readyz))
        .route("/v1/auth/token", post(issue_token))
        .merge(webhooks)
        .merge(protected)
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({"ok": true}))
}

async fn readyz(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    sqlx::query("SELECT 1").execute(&state.db).await?;
    Ok(Json(json!({"ready": !state.shutdown.is_cancelled()})))
}

async fn issue_token(
    State(state): State<AppState>,
    Json(payload): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    verify_admin_credentials(&state.config, &payload)?;
    let token = issue_operator_token(&state.config, payload.username.trim())?;
    info!(subject = payload.username.trim(), "operator token issued");
    Ok(Json(token))
}

async fn receive_envelope(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let envelope: WebhookEnvelope = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("malformed webhook envelope: {e}")))?;
    accept_webhook(&state, &envelope.topic, &envelope.payload)
}

async fn receive_topic(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("malformed webhook payload: {e}")))?;
    accept_webhook(&state, &topic, &payload)
}

fn accept_webhook(state: &AppState, topic: &str, payload: &Value) -> Result<Json<Value>, AppError> {
    let event = decode(topic, payload)?;
    let topic = normalize_topic(topic);

    if event.is_actionable() {
        state.webhooks.submit(event)?;
        debug!(topic, "webhook queued");
    } else {
        debug!(topic, "webhook acknowledged without action");
    }

    Ok(Json(json!({"accepted": true, "topic": topic})))
}

async fn list_transactions(
    State(state): State<AppState>,
    Query(query): Query<TransactionListQuery>,
) -> Result<Json<TransactionPage>, AppError> {
    let (limit, offset) = page_window(query.page_size, query.page_num);
    let (total_count, transactions) = transactions::list_transactions(&state.db, &query).await?;

    Ok(Json(TransactionPage {
        page_size: limit,
        page_num: offset / limit + 1,
        count: transactions.len(),
        total_count,
        transactions,
    }))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> Result<Json<TransactionRecord>, AppError> {
    let record = transactions::require_transaction(&state.db, &transaction_id).await?;
    Ok(Json(record))
}

async fn endorse_transaction(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(transaction_id): Path<String>,
) -> Result<Json<TransactionRecord>, AppError> {
    info!(transaction_id, operator = %operator.subject, token_id = %operator.token_id, "manual endorse");
    let record = transactions::execute_decision(
        &state,
        &transaction_id,
        Decision::Endorse,
        DecisionSource::Manual,
        None,
    )
    .await?;
    Ok(Json(record))
}

async fn refuse_transaction(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(transaction_id): Path<String>,
    body: Bytes,
) -> Result<Json<TransactionRecord>, AppError> {
    let request: RefuseRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RefuseRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(AppError::bad_request)?
    };
    let reason = request
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty());

    info!(transaction_id, operator = %operator.subject, token_id = %operator.token_id, reason, "manual refuse");
    let record = transactions::execute_decision(
        &state,
        &transaction_id,
        Decision::Refuse,
        DecisionSource::Manual,
        reason,
    )
    .await?;
    Ok(Json(record))
}

async fn retry_transaction(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(transaction_id): Path<String>,
) -> Result<Json<TransactionRecord>, AppError> {
    info!(transaction_id, operator = %operator.subject, token_id = %operator.token_id, "retrying decision delivery");
    let record = transactions::retry_decision(&state, &transaction_id).await?;
    Ok(Json(record))
}

async fn list_connections(
    State(state): State<AppState>,
    Query(query): Query<ConnectionListQuery>,
) -> Result<Json<ConnectionPage>, AppError> {
    let (limit, offset) = page_window(query.page_size, query.page_num);
    let (total_count, connections) = connections::list_connections(&state.db, &query).await?;

    Ok(Json(ConnectionPage {
        page_size: limit,
        page_num: offset / limit + 1,
        count: connections.len(),
        total_count,
        connections,
    }))
}

async fn get_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> Result<Json<ConnectionRecord>, AppError> {
    let record = connections::require_connection(&state.db, &connection_id).await?;
    Ok(Json(record))
}

async fn accept_connection(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(connection_id): Path<String>,
) -> Result<Json<ConnectionRecord>, AppError> {
    info!(connection_id, operator = %operator.subject, token_id = %operator.token_id, "manual connection accept");
    let record = connections::accept_request(&state, &connection_id).await?;
    Ok(Json(record))
}

async fn reject_connection(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(connection_id): Path<String>,
) -> Result<Json<ConnectionRecord>, AppError> {
    info!(connection_id, operator = %operator.subject, token_id = %operator.token_id, "manual connection reject");
    let record = connections::reject(&state, &connection_id).await?;
    Ok(Json(record))
}

async fn configure_connection(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(connection_id): Path<String>,
    Json(payload): Json<ConfigureConnectionRequest>,
) -> Result<Json<ConnectionRecord>, AppError> {
    info!(connection_id, operator = %operator.subject, token_id = %operator.token_id, "connection configure");
    let record = connections::configure(&state, &connection_id, &payload).await?;
    Ok(Json(record))
}

async fn list_witness_requests(
    State(state): State<AppState>,
    Query(query): Query<WitnessListQuery>,
) -> Result<Json<WitnessPage>, AppError> {
    let (limit, offset) = page_window(query.page_size, query.page_num);
    let (total_count, witness_requests) = witnesses::list_requests(&state.db, &query).await?;

    Ok(Json(WitnessPage {
        page_size: limit,
        page_num: offset / limit + 1,
        count: witness_requests.len(),
        total_count,
        witness_requests,
    }))
}

async fn get_witness_request(
    State(state): State<AppState>,
    Path(record_id): Path<String>,
) -> Result<Json<WitnessRecord>, AppError> {
    let record = witnesses::require_request(&state.db, &record_id).await?;
    Ok(Json(record))
}

async fn approve_witness_request(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(record_id): Path<String>,
) -> Result<Json<WitnessRecord>, AppError> {
    info!(record_id, operator = %operator.subject, token_id = %operator.token_id, "manual witness approve");
    let record =
        witnesses::execute_decision(&state, &record_id, Decision::Endorse, DecisionSource::Manual)
            .await?;
    Ok(Json(record))
}

async fn reject_witness_request(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(record_id): Path<String>,
) -> Result<Json<WitnessRecord>, AppError> {
    info!(record_id, operator = %operator.subject, token_id = %operator.token_id, "manual witness reject");
    let record =
        witnesses::execute_decision(&state, &record_id, Decision::Refuse, DecisionSource::Manual)
            .await?;
    Ok(Json(record))
}

async fn retry_witness_request(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(record_id): Path<String>,
) -> Result<Json<WitnessRecord>, AppError> {
    info!(record_id, operator = %operator.subject, token_id = %operator.token_id, "retrying witness decision");
    let record = witnesses::retry_decision(&state, &record_id).await?;
    Ok(Json(record))
}

async fn list_allowed_public_dids(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<AllowListPage<AllowedPublicDid>>, AppError> {
    Ok(Json(allow_lists::list_public_dids(&state.db, &query).await?))
}

async fn add_allowed_public_did(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Json(payload): Json<AllowedPublicDidRequest>,
) -> Result<(StatusCode, Json<AllowedPublicDid>), AppError> {
    info!(operator = %operator.subject, token_id = %operator.token_id, "adding allowed public did");
    let entry = allow_lists::add_public_did(&state, &payload).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn remove_allowed_public_did(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(registered_did): Path<String>,
) -> Result<StatusCode, AppError> {
    info!(registered_did, operator = %operator.subject, token_id = %operator.token_id, "removing allowed public did");
    allow_lists::remove_public_did(&state.db, &registered_did).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_allowed_schemas(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<AllowListPage<AllowedSchema>>, AppError> {
    Ok(Json(allow_lists::list_schemas(&state.db, &query).await?))
}

async fn add_allowed_schema(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Json(payload): Json<AllowedSchemaRequest>,
) -> Result<(StatusCode, Json<AllowedSchema>), AppError> {
    info!(operator = %operator.subject, token_id = %operator.token_id, "adding allowed schema");
    let entry = allow_lists::add_schema(&state, &payload).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn remove_allowed_schema(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(allowed_schema_id): Path<String>,
) -> Result<StatusCode, AppError> {
    info!(allowed_schema_id, operator = %operator.subject, token_id = %operator.token_id, "removing allowed schema");
    allow_lists::remove_schema(&state.db, &allowed_schema_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_allowed_log_entries(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<AllowListPage<AllowedLogEntry>>, AppError> {
    Ok(Json(allow_lists::list_log_entries(&state.db, &query).await?))
}

async fn add_allowed_log_entry(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Json(payload): Json<AllowedLogEntryRequest>,
) -> Result<(StatusCode, Json<AllowedLogEntry>), AppError> {
    info!(operator = %operator.subject, token_id = %operator.token_id, "adding allowed log entry");
    let entry = allow_lists::add_log_entry(&state, &payload).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn remove_allowed_log_entry(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(allowed_log_entry_id): Path<String>,
) -> Result<StatusCode, AppError> {
    info!(allowed_log_entry_id, operator = %operator.subject, token_id = %operator.token_id, "removing allowed log entry");
    allow_lists::remove_log_entry(&state.db, &allowed_log_entry_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "policy": state.config.policy,
        "agent": {
            "admin_url": state.config.agent_admin_url,
            "simulated": state.config.agent_admin_url.is_none(),
            "request_timeout_secs": state.config.agent_request_timeout_secs,
        },
        "control_retries": {
            "max_attempts": state.retry.max_attempts,
            "base_ms": state.config.control_retry_base_ms,
            "max_ms": state.config.control_retry_max_ms,
        },
        "webhooks": {
            "workers": state.config.webhook_workers,
            "queue_depth": state.config.webhook_queue_depth,
        },
    }))
}
