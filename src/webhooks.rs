//! Agent webhook decoding and the bounded dispatcher that feeds the trackers.

use std::sync::Arc;

use serde_json::Value;
use tokio::{
    sync::{Semaphore, mpsc},
    task::{JoinError, JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

use crate::{
    connections,
    error::EngineError,
    models::{
        ConnectionEvent, ConnectionState, GOAL_REGISTER_PUBLIC_DID, TransactionContent,
        TransactionEvent, TransactionState, TransactionType, WebvhLocator, WitnessEvent,
        WitnessKind, WitnessState,
    },
    state::AppState,
    transactions, witnesses,
};

pub const TOPIC_CONNECTIONS: &str = "connections";
pub const TOPIC_ENDORSE_TRANSACTION: &str = "endorse_transaction";
pub const TOPIC_LOG_ENTRY: &str = "log_entry";
pub const TOPIC_ATTESTED_RESOURCE: &str = "attested_resource";
pub const TOPIC_PING: &str = "ping";

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    Connection(ConnectionEvent),
    Transaction(TransactionEvent),
    Witness(WitnessEvent),
    Ping,
    Ignored { topic: String },
}

impl WebhookEvent {
    /// Whether the event needs a tracker at all.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            WebhookEvent::Connection(_) | WebhookEvent::Transaction(_) | WebhookEvent::Witness(_)
        )
    }
}

pub fn normalize_topic(topic: &str) -> String {
    topic.trim().trim_matches('/').to_ascii_lowercase().replace('-', "_")
}

/// Decodes one webhook. Unknown topics decode to `Ignored`; a known topic with
/// a malformed payload is a `Validation` error.
pub fn decode(topic: &str, payload: &Value) -> Result<WebhookEvent, EngineError> {
    let topic = normalize_topic(topic);
    match topic.as_str() {
        TOPIC_CONNECTIONS => decode_connection(payload).map(WebhookEvent::Connection),
        TOPIC_ENDORSE_TRANSACTION => decode_transaction(payload).map(WebhookEvent::Transaction),
        TOPIC_LOG_ENTRY => decode_witness(payload, WitnessKind::LogEntry).map(WebhookEvent::Witness),
        TOPIC_ATTESTED_RESOURCE => {
            decode_witness(payload, WitnessKind::AttestedResource).map(WebhookEvent::Witness)
        }
        TOPIC_PING => Ok(WebhookEvent::Ping),
        _ => Ok(WebhookEvent::Ignored { topic }),
    }
}

fn decode_connection(payload: &Value) -> Result<ConnectionEvent, EngineError> {
    let connection_id = required_str(payload, "connection_id")?;
    let raw_state = optional_str(payload, "state")
        .or_else(|| optional_str(payload, "rfc23_state"))
        .ok_or_else(|| EngineError::Validation("connection webhook has no state".to_string()))?;
    let state: ConnectionState = raw_state.parse().map_err(EngineError::Validation)?;

    Ok(ConnectionEvent {
        connection_id,
        state,
        their_label: optional_str(payload, "their_label"),
    })
}

fn decode_transaction(payload: &Value) -> Result<TransactionEvent, EngineError> {
    let transaction_id = optional_str(payload, "transaction_id")
        .or_else(|| optional_str(payload, "_id"))
        .ok_or_else(|| EngineError::Validation("transaction webhook has no transaction_id".to_string()))?;
    let state: TransactionState = required_str(payload, "state")?
        .parse()
        .map_err(EngineError::Validation)?;
    let connection_id = optional_str(payload, "connection_id");
    let request = attached_request(payload);
    let transaction_type = optional_code(payload.get("transaction_type"))
        .or_else(|| {
            request
                .as_ref()
                .and_then(|r| optional_code(r.pointer("/operation/type")))
        })
        .map(TransactionType::from);

    if state == TransactionState::RequestReceived {
        if connection_id.is_none() {
            return Err(EngineError::Validation(format!(
                "endorsement request {transaction_id} has no connection_id"
            )));
        }
        if transaction_type.is_none() {
            return Err(EngineError::Validation(format!(
                "endorsement request {transaction_id} has no transaction type"
            )));
        }
    }

    Ok(TransactionEvent {
        transaction_id,
        connection_id,
        state,
        transaction_type,
        content: transaction_content(payload, request.as_ref()),
        signature_request: payload
            .get("signature_request")
            .cloned()
            .unwrap_or(Value::Null),
        failure_reason: optional_str(payload, "failure_reason")
            .or_else(|| optional_str(payload, "error_msg")),
    })
}

/// The ledger request inside the first attached message. The agent ships the
/// attachment either as an object or as a JSON string.
fn attached_request(payload: &Value) -> Option<Value> {
    let attached = payload
        .get("messages_attach")?
        .as_array()?
        .first()?
        .pointer("/data/json")?;

    match attached {
        Value::String(raw) => serde_json::from_str(raw).ok(),
        other => Some(other.clone()),
    }
}

/// What the allow-lists match on: who writes, which DID is written and which
/// schema.
fn transaction_content(payload: &Value, request: Option<&Value>) -> TransactionContent {
    let author_goal_code = payload
        .pointer("/signature_request/0/author_goal_code")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let text = |pointer: &str| {
        request
            .and_then(|r| r.pointer(pointer))
            .and_then(Value::as_str)
            .map(ToString::to_string)
    };

    let subject_did = match author_goal_code.as_deref() {
        Some(GOAL_REGISTER_PUBLIC_DID) => payload
            .pointer("/meta_data/did")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .or_else(|| text("/operation/dest")),
        _ => text("/operation/dest"),
    };

    TransactionContent {
        author_did: text("/identifier"),
        subject_did,
        schema_name: text("/operation/data/name"),
        schema_version: text("/operation/data/version"),
        author_goal_code,
    }
}

/// Witness requests name their DID in the record: a log entry in its document
/// state, an attested resource as the prefix of its resource id.
fn decode_witness(payload: &Value, topic_kind: WitnessKind) -> Result<WitnessEvent, EngineError> {
    let record_id = required_str(payload, "record_id")?;
    let kind = match optional_str(payload, "record_type") {
        Some(raw) => raw.parse().map_err(EngineError::Validation)?,
        None => topic_kind,
    };
    let state: WitnessState = required_str(payload, "state")?
        .parse()
        .map_err(EngineError::Validation)?;
    let record = payload
        .get("record")
        .filter(|r| r.is_object())
        .cloned()
        .ok_or_else(|| EngineError::Validation(format!("witness request {record_id} has no record")))?;

    let did = match kind {
        WitnessKind::LogEntry => record.pointer("/state/id").and_then(Value::as_str),
        WitnessKind::AttestedResource => record
            .get("id")
            .and_then(Value::as_str)
            .and_then(|id| id.split('/').next()),
    }
    .ok_or_else(|| EngineError::Validation(format!("witness request {record_id} names no did")))?;
    let locator = WebvhLocator::from_did(did).ok_or_else(|| {
        EngineError::Validation(format!("witness request {record_id} has a malformed did:webvh {did}"))
    })?;

    Ok(WitnessEvent {
        record_id,
        kind,
        state,
        locator,
        record,
    })
}

fn optional_code(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(code) if !code.trim().is_empty() => Some(code.trim().to_string()),
        Value::Number(code) => Some(code.to_string()),
        _ => None,
    }
}

fn optional_str(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn required_str(payload: &Value, key: &str) -> Result<String, EngineError> {
    optional_str(payload, key)
        .ok_or_else(|| EngineError::Validation(format!("webhook payload is missing {key}")))
}

/// Sending side of the dispatcher queue.
#[derive(Clone, Debug)]
pub struct WebhookQueue {
    tx: mpsc::Sender<WebhookEvent>,
}

impl WebhookQueue {
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<WebhookEvent>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    /// Enqueues without waiting. A full queue is reported so the agent
    /// redelivers later instead of the request hanging.
    pub fn submit(&self, event: WebhookEvent) -> Result<(), EngineError> {
        self.tx.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                EngineError::DependencyUnavailable("webhook queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                EngineError::DependencyUnavailable("webhook dispatcher stopped".to_string())
            }
        })
    }
}

enum Step {
    Event(WebhookEvent),
    Joined(Result<(), JoinError>),
    Stop,
}

/// Starts the dispatcher. Each event runs on its own task; at most
/// `webhook_workers` run at once. On shutdown the queue is closed, events
/// already accepted are still applied, and the handle resolves once every
/// task finished.
pub fn start_webhook_workers(
    state: AppState,
    mut rx: mpsc::Receiver<WebhookEvent>,
) -> JoinHandle<()> {
    let permits = Arc::new(Semaphore::new(state.config.webhook_workers.max(1)));

    tokio::spawn(async move {
        info!(workers = state.config.webhook_workers, "webhook dispatcher started");
        let mut tasks = JoinSet::new();

        loop {
            let step = tokio::select! {
                biased;
                _ = state.shutdown.cancelled() => Step::Stop,
                Some(joined) = tasks.join_next() => Step::Joined(joined),
                event = rx.recv() => event.map_or(Step::Stop, Step::Event),
            };

            match step {
                Step::Event(event) => spawn_event(&state, &permits, &mut tasks, event).await,
                Step::Joined(joined) => report_join(joined),
                Step::Stop => break,
            }
        }

        rx.close();
        let mut drained = 0usize;
        while let Some(event) = rx.recv().await {
            spawn_event(&state, &permits, &mut tasks, event).await;
            drained += 1;
        }
        if drained > 0 {
            info!(drained, "applying webhooks queued before shutdown");
        }
        while let Some(joined) = tasks.join_next().await {
            report_join(joined);
        }
        info!("webhook dispatcher stopped");
    })
}

async fn spawn_event(
    state: &AppState,
    permits: &Arc<Semaphore>,
    tasks: &mut JoinSet<()>,
    event: WebhookEvent,
) {
    // the semaphore is never closed
    let Ok(permit) = permits.clone().acquire_owned().await else {
        return;
    };
    let state = state.clone();
    tasks.spawn(async move {
        process_event(&state, event).await;
        drop(permit);
    });
}

fn report_join(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "webhook task did not complete");
    }
}

/// Applies one event to its tracker. Errors stay with the record they concern.
pub async fn process_event(state: &AppState, event: WebhookEvent) {
    let result = match &event {
        WebhookEvent::Connection(event) => connections::apply_event(state, event)
            .await
            .map(|outcome| debug!(connection_id = %event.connection_id, ?outcome, "connection event applied")),
        WebhookEvent::Transaction(event) => transactions::apply_event(state, event)
            .await
            .map(|outcome| debug!(transaction_id = %event.transaction_id, ?outcome, "transaction event applied")),
        WebhookEvent::Witness(event) => witnesses::apply_event(state, event)
            .await
            .map(|outcome| debug!(record_id = %event.record_id, ?outcome, "witness event applied")),
        WebhookEvent::Ping => {
            debug!("agent ping");
            Ok(())
        }
        WebhookEvent::Ignored { topic } => {
            debug!(topic, "ignoring webhook topic");
            Ok(())
        }
    };

    match result {
        Ok(()) => {}
        Err(err @ EngineError::StaleTransition { .. }) => {
            warn!(error = %err, "discarding stale webhook");
        }
        Err(err @ EngineError::DependencyUnavailable(_)) => {
            warn!(error = %err, "agent unreachable, fault recorded");
        }
        Err(err) => {
            error!(error = %err, "webhook processing failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{WebhookEvent, WebhookQueue, decode};
    use crate::{
        error::EngineError,
        models::{
            ConnectionState, GOAL_REGISTER_PUBLIC_DID, TransactionState, TransactionType,
            WitnessKind, WitnessState,
        },
    };

    #[test]
    fn connection_payload_prefers_state_over_rfc23_state() {
        let event = decode(
            "connections",
            &json!({"connection_id": "c1", "state": "completed", "rfc23_state": "completed", "their_label": "author"}),
        )
        .expect("connection payload should decode");
        let WebhookEvent::Connection(event) = event else {
            panic!("expected connection event");
        };
        assert_eq!(event.state, ConnectionState::Active);
        assert_eq!(event.their_label.as_deref(), Some("author"));

        let fallback = decode(
            "/connections/",
            &json!({"connection_id": "c1", "rfc23_state": "request-received"}),
        )
        .expect("rfc23 state should decode");
        assert!(matches!(
            fallback,
            WebhookEvent::Connection(ref e) if e.state == ConnectionState::Request
        ));
    }

    #[test]
    fn transaction_type_is_read_from_the_attached_request() {
        let payload = json!({
            "transaction_id": "t1",
            "connection_id": "c1",
            "state": "request_received",
            "messages_attach": [{
                "data": {"json": "{\"operation\": {\"type\": \"101\"}}"}
            }]
        });
        let WebhookEvent::Transaction(event) =
            decode("endorse-transaction", &payload).expect("should decode")
        else {
            panic!("expected transaction event");
        };
        assert_eq!(event.transaction_type, Some(TransactionType::Schema));

        let object_payload = json!({
            "transaction_id": "t2",
            "connection_id": "c1",
            "state": "request_received",
            "messages_attach": [{"data": {"json": {"operation": {"type": 102}}}}]
        });
        let WebhookEvent::Transaction(event) =
            decode("endorse_transaction", &object_payload).expect("should decode")
        else {
            panic!("expected transaction event");
        };
        assert_eq!(event.transaction_type, Some(TransactionType::CredDef));
    }

    #[test]
    fn schema_author_name_and_version_come_from_the_ledger_request() {
        let payload = json!({
            "transaction_id": "t1",
            "connection_id": "c1",
            "state": "request_received",
            "messages_attach": [{"data": {"json": {
                "identifier": "did:sov:author",
                "operation": {"type": "101", "data": {"name": "degree", "version": "1.2", "attr_names": ["score"]}}
            }}}]
        });
        let WebhookEvent::Transaction(event) = decode("endorse_transaction", &payload).expect("should decode")
        else {
            panic!("expected transaction event");
        };
        assert_eq!(event.content.author_did.as_deref(), Some("did:sov:author"));
        assert_eq!(event.content.schema_name.as_deref(), Some("degree"));
        assert_eq!(event.content.schema_version.as_deref(), Some("1.2"));
        assert_eq!(event.content.subject_did, None);
    }

    #[test]
    fn public_did_registration_names_the_did_from_meta_data() {
        let payload = json!({
            "transaction_id": "t1",
            "connection_id": "c1",
            "state": "request_received",
            "transaction_type": "1",
            "signature_request": [{"author_goal_code": GOAL_REGISTER_PUBLIC_DID}],
            "meta_data": {"did": "did:sov:newpublic"},
            "messages_attach": [{"data": {"json": {"operation": {"type": "1", "dest": "did:sov:other"}}}}]
        });
        let WebhookEvent::Transaction(event) = decode("endorse_transaction", &payload).expect("should decode")
        else {
            panic!("expected transaction event");
        };
        assert_eq!(event.content.author_goal_code.as_deref(), Some(GOAL_REGISTER_PUBLIC_DID));
        assert_eq!(event.content.subject_did.as_deref(), Some("did:sov:newpublic"));
    }

    #[test]
    fn witness_requests_locate_their_did_per_record_kind() {
        let WebhookEvent::Witness(entry) = decode(
            "log-entry",
            &json!({
                "record_id": "w1",
                "state": "pending",
                "record": {"state": {"id": "did:webvh:QmScid:example.com:issuers:acme"}}
            }),
        )
        .expect("log entry should decode") else {
            panic!("expected witness event");
        };
        assert_eq!(entry.kind, WitnessKind::LogEntry);
        assert_eq!(entry.state, WitnessState::Pending);
        assert_eq!(entry.locator.scid, "QmScid");
        assert_eq!(entry.locator.identifier, "acme");

        let WebhookEvent::Witness(resource) = decode(
            "attested_resource",
            &json!({
                "record_id": "w2",
                "state": "pending",
                "record": {"id": "did:webvh:QmScid:example.com:issuers:acme/resources/zQm1"}
            }),
        )
        .expect("attested resource should decode") else {
            panic!("expected witness event");
        };
        assert_eq!(resource.kind, WitnessKind::AttestedResource);
        assert_eq!(resource.locator.domain, "example.com");
    }

    #[test]
    fn witness_request_without_webvh_did_is_rejected() {
        let err = decode(
            "log_entry",
            &json!({"record_id": "w1", "state": "pending", "record": {"state": {"id": "did:sov:abc"}}}),
        )
        .expect_err("non webvh did should fail");
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn endorsement_request_without_connection_is_rejected() {
        let err = decode(
            "endorse_transaction",
            &json!({"transaction_id": "t1", "state": "request_received", "transaction_type": "schema"}),
        )
        .expect_err("missing connection should fail");
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn later_transaction_states_need_only_id_and_state() {
        let WebhookEvent::Transaction(event) = decode(
            "endorse_transaction",
            &json!({"transaction_id": "t1", "state": "transaction_failed", "error_msg": "ledger timeout"}),
        )
        .expect("should decode") else {
            panic!("expected transaction event");
        };
        assert_eq!(event.state, TransactionState::TransactionFailed);
        assert_eq!(event.failure_reason.as_deref(), Some("ledger timeout"));
    }

    #[test]
    fn unknown_topics_and_ping_are_not_actionable() {
        let ignored = decode("issue_credential_v2_0", &json!({})).expect("should decode");
        assert_eq!(
            ignored,
            WebhookEvent::Ignored {
                topic: "issue_credential_v2_0".to_string()
            }
        );
        assert!(!ignored.is_actionable());
        assert_eq!(decode("ping", &json!(null)).expect("ping"), WebhookEvent::Ping);
    }

    #[test]
    fn malformed_known_topic_is_a_validation_error() {
        let err = decode("connections", &json!({"state": "active"})).expect_err("should fail");
        assert!(matches!(err, EngineError::Validation(_)));
        let err = decode("connections", &json!({"connection_id": "c1", "state": "sideways"}))
            .expect_err("should fail");
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn full_queue_reports_backpressure() {
        let (queue, _rx) = WebhookQueue::channel(1);
        queue.submit(WebhookEvent::Ping).expect("first event fits");
        let err = queue.submit(WebhookEvent::Ping).expect_err("second should not fit");
        assert!(matches!(err, EngineError::DependencyUnavailable(_)));
    }
}
