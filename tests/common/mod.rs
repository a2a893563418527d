#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use endorser_engine::{
    agent::{AgentControl, ControlCall, GatewayError},
    auth::issue_operator_token,
    config::Config,
    connections,
    db::connect_and_bootstrap,
    handlers::router,
    models::{
        ConnectionEvent, ConnectionRecord, ConnectionState, TransactionContent, TransactionEvent,
        TransactionRecord, TransactionState, TransactionType, WebvhLocator, WitnessEvent,
        WitnessKind, WitnessRecord, WitnessState,
    },
    policy::Policy,
    retry::RetryPolicy,
    state::AppState,
    transactions,
    webhooks::{WebhookEvent, WebhookQueue, start_webhook_workers},
    witnesses,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

pub const WEBHOOK_KEY: &str = "test-webhook-key";
pub const ADMIN_USER: &str = "endorser";
pub const ADMIN_KEY: &str = "test-admin-key";

/// Agent double that records every control call. It can be told to fail
/// transiently a number of times, or to reject everything.
#[derive(Debug, Default)]
pub struct RecordingAgent {
    calls: Mutex<Vec<(ControlCall, String)>>,
    transient_failures: AtomicU32,
    reject: AtomicBool,
}

impl RecordingAgent {
    pub fn calls(&self) -> Vec<(ControlCall, String)> {
        self.calls.lock().expect("calls lock should not be poisoned").clone()
    }

    pub fn calls_of(&self, call: ControlCall) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(c, _)| *c == call)
            .map(|(_, id)| id)
            .collect()
    }

    pub fn fail_next(&self, attempts: u32) {
        self.transient_failures.store(attempts, Ordering::SeqCst);
    }

    pub fn reject_all(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    fn record(&self, call: ControlCall, id: &str) -> Result<(), GatewayError> {
        self.calls
            .lock()
            .expect("calls lock should not be poisoned")
            .push((call, id.to_string()));

        if self.reject.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                call,
                status: 400,
                body: "record is not in a state that allows this".to_string(),
            });
        }

        let failed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(GatewayError::Unavailable {
                call,
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AgentControl for RecordingAgent {
    async fn accept_connection(&self, connection_id: &str) -> Result<(), GatewayError> {
        self.record(ControlCall::AcceptConnection, connection_id)
    }

    async fn endorse_transaction(&self, transaction_id: &str) -> Result<(), GatewayError> {
        self.record(ControlCall::EndorseTransaction, transaction_id)
    }

    async fn refuse_transaction(&self, transaction_id: &str) -> Result<(), GatewayError> {
        self.record(ControlCall::RefuseTransaction, transaction_id)
    }

    async fn approve_witness(&self, kind: WitnessKind, record_id: &str) -> Result<(), GatewayError> {
        self.record(ControlCall::ApproveWitness(kind), record_id)
    }

    async fn reject_witness(&self, kind: WitnessKind, record_id: &str) -> Result<(), GatewayError> {
        self.record(ControlCall::RejectWitness(kind), record_id)
    }
}

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub agent: Arc<RecordingAgent>,
    _temp_dir: TempDir,
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("request should execute");
        let status = response.status();
        let body = to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("response body should be readable");
        let parsed = serde_json::from_slice::<Value>(&body).unwrap_or(Value::Null);
        (status, parsed)
    }

    pub fn operator_token(&self) -> String {
        issue_operator_token(&self.state.config, ADMIN_USER)
            .expect("operator token should be signed")
            .access_token
    }

    pub async fn connection(&self, connection_id: &str) -> Option<ConnectionRecord> {
        connections::fetch_connection(&self.state.db, connection_id)
            .await
            .expect("connection lookup should succeed")
    }

    pub async fn transaction(&self, transaction_id: &str) -> Option<TransactionRecord> {
        transactions::fetch_transaction(&self.state.db, transaction_id)
            .await
            .expect("transaction lookup should succeed")
    }

    pub async fn witness(&self, record_id: &str) -> Option<WitnessRecord> {
        witnesses::fetch_request(&self.state.db, record_id)
            .await
            .expect("witness lookup should succeed")
    }

    /// Polls until the dispatcher has produced a matching connection record.
    pub async fn wait_for_connection<F>(&self, connection_id: &str, done: F) -> ConnectionRecord
    where
        F: Fn(&ConnectionRecord) -> bool,
    {
        for _ in 0..300 {
            match self.connection(connection_id).await {
                Some(record) if done(&record) => return record,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        panic!("connection {connection_id} did not reach the expected state");
    }

    /// Polls until the dispatcher has produced a matching transaction record.
    pub async fn wait_for_transaction<F>(&self, transaction_id: &str, done: F) -> TransactionRecord
    where
        F: Fn(&TransactionRecord) -> bool,
    {
        for _ in 0..300 {
            match self.transaction(transaction_id).await {
                Some(record) if done(&record) => return record,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        panic!("transaction {transaction_id} did not reach the expected state");
    }

    pub async fn wait_for_witness<F>(&self, record_id: &str, done: F) -> WitnessRecord
    where
        F: Fn(&WitnessRecord) -> bool,
    {
        for _ in 0..300 {
            match self.witness(record_id).await {
                Some(record) if done(&record) => return record,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        panic!("witness request {record_id} did not reach the expected state");
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
    }
}

pub fn schema_policy() -> Policy {
    Policy {
        auto_accept_connections: true,
        auto_accept_authors: true,
        auto_endorse_requests: true,
        reject_by_default: false,
        auto_endorse_transaction_types: [TransactionType::Schema].into_iter().collect(),
    }
}

pub fn manual_policy() -> Policy {
    Policy {
        auto_endorse_requests: false,
        reject_by_default: false,
        ..schema_policy()
    }
}

pub fn reject_policy() -> Policy {
    Policy {
        reject_by_default: true,
        ..manual_policy()
    }
}

pub async fn build_test_app(policy: Policy) -> TestApp {
    let (app, webhook_rx) = build_test_app_with_queue(policy).await;
    start_webhook_workers(app.state.clone(), webhook_rx);
    app
}

/// Same app with the dispatcher left unstarted, so a test controls when the
/// queue drains.
pub async fn build_test_app_with_queue(policy: Policy) -> (TestApp, mpsc::Receiver<WebhookEvent>) {
    let temp_dir = TempDir::new().expect("temp directory should be created");
    let db_path = temp_dir.path().join("test-endorser.db");
    let db_url = format!("sqlite://{}", db_path.display());
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be after the epoch")
        .as_nanos();

    let config = Config {
        bind_addr: "127.0.0.1:0".to_string(),
        database_url: db_url,
        agent_admin_url: None,
        agent_admin_api_key: None,
        agent_request_timeout_secs: 1,
        webhook_api_key: WEBHOOK_KEY.to_string(),
        webhook_api_key_header: "x-api-key".to_string(),
        webhook_workers: 4,
        webhook_queue_depth: 64,
        control_max_retries: 3,
        control_retry_base_ms: 1,
        control_retry_max_ms: 2,
        admin_user: ADMIN_USER.to_string(),
        admin_key: ADMIN_KEY.to_string(),
        jwt_secret: format!("secret-{unique}-0123456789"),
        jwt_issuer: "endorser-engine".to_string(),
        jwt_audience: "endorser-review-api".to_string(),
        jwt_ttl_minutes: 5,
        policy,
    };
    config.validate().expect("test config should be valid");

    let db = connect_and_bootstrap(&config.database_url)
        .await
        .expect("db bootstrap should succeed");
    let agent = Arc::new(RecordingAgent::default());
    let (webhooks, webhook_rx) = WebhookQueue::channel(config.webhook_queue_depth);

    let state = AppState {
        retry: RetryPolicy::from_config(&config),
        config: Arc::new(config),
        db,
        agent: agent.clone(),
        webhooks,
        shutdown: CancellationToken::new(),
    };
    let app = router(state.clone());

    let test_app = TestApp {
        app,
        state,
        agent,
        _temp_dir: temp_dir,
    };
    (test_app, webhook_rx)
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request should build")
}

pub fn operator_request(method: &str, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
    let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(body)
        .expect("request should build")
}

pub fn webhook_request(topic: &str, payload: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/topic/{topic}/"))
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-api-key", WEBHOOK_KEY)
        .body(Body::from(payload.to_string()))
        .expect("request should build")
}

pub fn connection_payload(connection_id: &str, state: &str) -> Value {
    json!({
        "connection_id": connection_id,
        "state": state,
        "their_label": "author agent",
    })
}

pub fn endorse_request_payload(transaction_id: &str, connection_id: &str, code: &str) -> Value {
    json!({
        "transaction_id": transaction_id,
        "connection_id": connection_id,
        "state": "request_received",
        "messages_attach": [{
            "data": {"json": format!("{{\"operation\": {{\"type\": \"{code}\"}}}}")}
        }],
        "signature_request": [{"author_goal_code": "aries.transaction.ledger.write"}],
    })
}

pub fn connection_event(connection_id: &str, state: ConnectionState) -> ConnectionEvent {
    ConnectionEvent {
        connection_id: connection_id.to_string(),
        state,
        their_label: Some("author agent".to_string()),
    }
}

pub fn request_event(
    transaction_id: &str,
    connection_id: &str,
    transaction_type: TransactionType,
) -> TransactionEvent {
    TransactionEvent {
        transaction_id: transaction_id.to_string(),
        connection_id: Some(connection_id.to_string()),
        state: TransactionState::RequestReceived,
        transaction_type: Some(transaction_type),
        content: TransactionContent::default(),
        signature_request: json!([{"author_goal_code": "aries.transaction.ledger.write"}]),
        failure_reason: None,
    }
}

pub fn schema_request_event(
    transaction_id: &str,
    connection_id: &str,
    author_did: &str,
    schema_name: &str,
    version: &str,
) -> TransactionEvent {
    TransactionEvent {
        content: TransactionContent {
            author_did: Some(author_did.to_string()),
            schema_name: Some(schema_name.to_string()),
            schema_version: Some(version.to_string()),
            ..TransactionContent::default()
        },
        ..request_event(transaction_id, connection_id, TransactionType::Schema)
    }
}

pub fn reported_event(transaction_id: &str, state: TransactionState) -> TransactionEvent {
    TransactionEvent {
        transaction_id: transaction_id.to_string(),
        connection_id: None,
        state,
        transaction_type: None,
        content: TransactionContent::default(),
        signature_request: Value::Null,
        failure_reason: None,
    }
}

pub const WEBVH_DID: &str = "did:webvh:QmScid:example.com:issuers:acme";

pub fn log_entry_event(record_id: &str, state: WitnessState) -> WitnessEvent {
    WitnessEvent {
        record_id: record_id.to_string(),
        kind: WitnessKind::LogEntry,
        state,
        locator: WebvhLocator::from_did(WEBVH_DID).expect("test did should parse"),
        record: json!({"state": {"id": WEBVH_DID}}),
    }
}

pub fn schema_resource_event(record_id: &str, name: &str, version: &str) -> WitnessEvent {
    WitnessEvent {
        record_id: record_id.to_string(),
        kind: WitnessKind::AttestedResource,
        state: WitnessState::Pending,
        locator: WebvhLocator::from_did(WEBVH_DID).expect("test did should parse"),
        record: json!({
            "id": format!("{WEBVH_DID}/resources/zQm{record_id}"),
            "metadata": {"resourceType": "anonCredsSchema"},
            "content": {"issuerId": WEBVH_DID, "name": name, "version": version},
        }),
    }
}

pub fn log_entry_payload(record_id: &str, state: &str) -> Value {
    json!({
        "record_id": record_id,
        "state": state,
        "record": {"state": {"id": WEBVH_DID}},
    })
}

/// Drives a connection through request and active directly on the tracker.
pub async fn activate_connection(app: &TestApp, connection_id: &str) {
    for state in [ConnectionState::Request, ConnectionState::Active] {
        connections::apply_event(&app.state, &connection_event(connection_id, state))
            .await
            .expect("connection event should apply");
    }
}
