use chrono::Duration;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, sqlite::SqliteRow};
use tracing::{debug, error, info, warn};

use crate::{
    agent::{ControlCall, GatewayError},
    allow_lists,
    connections::fetch_connection,
    db::{page_window, utc_now},
    error::EngineError,
    models::{
        ConnectionState, Decision, DecisionSource, TransactionContent, TransactionEvent,
        TransactionListQuery, TransactionRecord, TransactionState, TransactionType, Transition,
    },
    policy::{AuthorContext, Verdict, evaluate_transaction},
    retry::issue_with_retry,
    state::AppState,
};

const POLICY_REFUSAL_REASON: &str = "refused by endorser policy";
const MAX_AGE_SECONDS: i64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Waiting for its connection to exist and become active.
    Held,
    /// Routed, left for an operator.
    Pending,
    Decided(Decision),
    /// Reported by the agent before the request arrived; applied once it does.
    Buffered(TransactionState),
    Advanced {
        from: TransactionState,
        to: TransactionState,
    },
    Duplicate,
}

pub async fn apply_event(
    state: &AppState,
    event: &TransactionEvent,
) -> Result<TransactionOutcome, EngineError> {
    match event.state {
        TransactionState::RequestReceived => receive_request(state, event).await,
        reported => apply_reported(&state.db, event, reported).await,
    }
}

async fn receive_request(
    state: &AppState,
    event: &TransactionEvent,
) -> Result<TransactionOutcome, EngineError> {
    let connection_id = event.connection_id.as_deref().ok_or_else(|| {
        EngineError::Validation(format!(
            "transaction {} has no connection_id",
            event.transaction_id
        ))
    })?;
    let transaction_type = event.transaction_type.clone().ok_or_else(|| {
        EngineError::Validation(format!(
            "transaction {} has no transaction type",
            event.transaction_id
        ))
    })?;

    if insert_transaction(&state.db, event, connection_id, &transaction_type).await? {
        info!(
            transaction_id = %event.transaction_id,
            connection_id,
            transaction_type = %transaction_type,
            "endorsement request received"
        );
        if let Some(outcome) = replay_early_report(&state.db, &event.transaction_id).await? {
            return Ok(outcome);
        }
        return route(state, &event.transaction_id).await;
    }

    let current = require_transaction(&state.db, &event.transaction_id).await?;
    match current.state {
        TransactionState::RequestReceived if current.unroutable => {
            debug!(transaction_id = %current.transaction_id, "redelivered held request, routing again");
            route(state, &current.transaction_id).await
        }
        TransactionState::RequestReceived => Ok(TransactionOutcome::Duplicate),
        other => Err(stale(&current.transaction_id, Some(other), TransactionState::RequestReceived)),
    }
}

/// Routes a stored request to its connection. The record stays held until the
/// connection is active; after that policy decides or defers.
async fn route(state: &AppState, transaction_id: &str) -> Result<TransactionOutcome, EngineError> {
    let record = require_transaction(&state.db, transaction_id).await?;
    if record.state != TransactionState::RequestReceived || record.decision_source != DecisionSource::None {
        return Ok(TransactionOutcome::Duplicate);
    }

    let connection = match fetch_connection(&state.db, &record.connection_id).await? {
        Some(connection) if connection.state == ConnectionState::Active => connection,
        Some(connection) => {
            debug!(
                transaction_id,
                connection_id = %record.connection_id,
                connection_state = %connection.state,
                "connection not active, holding transaction"
            );
            return Ok(TransactionOutcome::Held);
        }
        None => {
            let hold = EngineError::UnroutableReference {
                transaction_id: transaction_id.to_string(),
                connection_id: record.connection_id.clone(),
            };
            debug!(error = %hold, "holding transaction");
            return Ok(TransactionOutcome::Held);
        }
    };

    if record.unroutable {
        sqlx::query(
            r#"
            UPDATE endorse_transactions
            SET unroutable = 0, updated_at = ?1
            WHERE transaction_id = ?2
              AND state = 'request_received'
              AND unroutable = 1
            "#,
        )
        .bind(utc_now())
        .bind(transaction_id)
        .execute(&state.db)
        .await?;
    }

    let allow_listed =
        allow_lists::transaction_allowed(&state.db, &record.transaction_type, &record.content)
            .await?;
    let verdict = evaluate_transaction(
        &state.config.policy,
        &AuthorContext::from(&connection),
        &record.transaction_type,
        allow_listed,
    );

    let (decision, reason) = match verdict {
        Verdict::Defer => {
            info!(transaction_id, "transaction awaits operator review");
            return Ok(TransactionOutcome::Pending);
        }
        Verdict::Approve => (Decision::Endorse, None),
        Verdict::Refuse => (Decision::Refuse, Some(POLICY_REFUSAL_REASON)),
    };

    match execute_decision(state, transaction_id, decision, DecisionSource::Auto, reason).await {
        Ok(_) => Ok(TransactionOutcome::Decided(decision)),
        // a concurrent release or an operator got there first
        Err(EngineError::AlreadyDecided(_)) => Ok(TransactionOutcome::Duplicate),
        Err(err) => Err(err),
    }
}

/// Re-runs routing for every undecided request of the connection. Returns how
/// many left the hold. Failures are logged per record and do not stop the
/// rest.
pub async fn release_held(state: &AppState, connection_id: &str) -> Result<usize, EngineError> {
    let rows = sqlx::query(
        r#"
        SELECT transaction_id
        FROM endorse_transactions
        WHERE connection_id = ?1
          AND state = 'request_received'
          AND decision_source = 'none'
        ORDER BY created_at ASC
        "#,
    )
    .bind(connection_id)
    .fetch_all(&state.db)
    .await?;

    let mut released = 0;
    for row in rows {
        let transaction_id: String = row.try_get("transaction_id")?;
        match route(state, &transaction_id).await {
            Ok(TransactionOutcome::Held) => {}
            Ok(outcome) => {
                debug!(transaction_id = %transaction_id, ?outcome, "re-evaluated transaction");
                released += 1;
            }
            Err(err) => {
                warn!(transaction_id = %transaction_id, connection_id, error = %err, "re-evaluation failed");
            }
        }
    }
    Ok(released)
}

/// Re-runs policy over every routed request still awaiting review, across all
/// connections. Returns how many got decided.
pub async fn reevaluate_pending(state: &AppState) -> Result<usize, EngineError> {
    let rows = sqlx::query(
        r#"
        SELECT transaction_id
        FROM endorse_transactions
        WHERE state = 'request_received'
          AND decision_source = 'none'
          AND unroutable = 0
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(&state.db)
    .await?;

    let mut decided = 0;
    for row in rows {
        let transaction_id: String = row.try_get("transaction_id")?;
        match route(state, &transaction_id).await {
            Ok(TransactionOutcome::Decided(_)) => decided += 1,
            Ok(_) => {}
            Err(err) => {
                warn!(transaction_id = %transaction_id, error = %err, "re-evaluation failed");
            }
        }
    }
    Ok(decided)
}

/// Claims the decision for this engine, then issues the control call and
/// moves the record once the agent accepted it. Losing the claim is
/// `AlreadyDecided`.
pub async fn execute_decision(
    state: &AppState,
    transaction_id: &str,
    decision: Decision,
    source: DecisionSource,
    reason: Option<&str>,
) -> Result<TransactionRecord, EngineError> {
    claim_decision(&state.db, transaction_id, decision, source, reason).await?;
    info!(
        transaction_id,
        decision = decision.as_str(),
        source = source.as_str(),
        "decision claimed"
    );
    issue_claimed(state, transaction_id, decision).await
}

/// Re-issues the control call of a claimed decision that did not reach the
/// agent.
pub async fn retry_decision(
    state: &AppState,
    transaction_id: &str,
) -> Result<TransactionRecord, EngineError> {
    let record = require_transaction(&state.db, transaction_id).await?;
    match (record.state, record.decision) {
        (TransactionState::RequestReceived, Some(decision)) => {
            info!(transaction_id, decision = decision.as_str(), "retrying decision");
            issue_claimed(state, transaction_id, decision).await
        }
        _ => Err(EngineError::AlreadyDecided(format!(
            "transaction {transaction_id} is {} with nothing to retry",
            record.state
        ))),
    }
}

async fn claim_decision(
    db: &SqlitePool,
    transaction_id: &str,
    decision: Decision,
    source: DecisionSource,
    reason: Option<&str>,
) -> Result<(), EngineError> {
    let result = sqlx::query(
        r#"
        UPDATE endorse_transactions
        SET decision_source = ?1,
            decision = ?2,
            refusal_reason = ?3,
            decided_at = ?4,
            updated_at = ?4
        WHERE transaction_id = ?5
          AND state = 'request_received'
          AND decision_source = 'none'
          AND unroutable = 0
        "#,
    )
    .bind(source.as_str())
    .bind(decision.as_str())
    .bind(reason)
    .bind(utc_now())
    .bind(transaction_id)
    .execute(db)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    let current = require_transaction(db, transaction_id).await?;
    if current.state == TransactionState::RequestReceived && current.unroutable {
        return Err(EngineError::UnroutableReference {
            transaction_id: transaction_id.to_string(),
            connection_id: current.connection_id,
        });
    }
    Err(EngineError::AlreadyDecided(format!(
        "transaction {transaction_id} is {} ({} decision)",
        current.state,
        current.decision_source.as_str()
    )))
}

async fn issue_claimed(
    state: &AppState,
    transaction_id: &str,
    decision: Decision,
) -> Result<TransactionRecord, EngineError> {
    let call = match decision {
        Decision::Endorse => ControlCall::EndorseTransaction,
        Decision::Refuse => ControlCall::RefuseTransaction,
    };

    match issue_with_retry(state.agent.as_ref(), &state.retry, &state.shutdown, call, transaction_id)
        .await
    {
        Ok(()) => {}
        Err(err @ GatewayError::Rejected { .. }) => {
            // the agent already moved the record; its webhook carries the state
            warn!(transaction_id, error = %err, "agent rejected decision");
            set_fault(&state.db, transaction_id, Some(&err.to_string())).await?;
            return require_transaction(&state.db, transaction_id).await;
        }
        Err(err) => {
            error!(transaction_id, error = %err, "decision did not reach the agent");
            set_fault(&state.db, transaction_id, Some(&err.to_string())).await?;
            return Err(EngineError::DependencyUnavailable(err.to_string()));
        }
    }

    let target = decision.target_state();
    let result = sqlx::query(
        r#"
        UPDATE endorse_transactions
        SET state = ?1,
            unroutable = 0,
            last_error = NULL,
            updated_at = ?2
        WHERE transaction_id = ?3
          AND state = 'request_received'
        "#,
    )
    .bind(target.as_str())
    .bind(utc_now())
    .bind(transaction_id)
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        debug!(transaction_id, "agent reported a later state before the decision landed");
    } else {
        info!(transaction_id, state = %target, "transaction decided");
    }

    require_transaction(&state.db, transaction_id).await
}

async fn apply_reported(
    db: &SqlitePool,
    event: &TransactionEvent,
    reported: TransactionState,
) -> Result<TransactionOutcome, EngineError> {
    let Some(current) = fetch_transaction(db, &event.transaction_id).await? else {
        return buffer_early_report(db, event, reported).await;
    };

    match current.state.transition_to(reported) {
        Transition::Duplicate => return Ok(TransactionOutcome::Duplicate),
        Transition::Stale => return Err(stale(&current.transaction_id, Some(current.state), reported)),
        Transition::Advance => {}
    }

    let observed = observed_decision(reported);
    match (current.decision, observed) {
        (Some(claimed), Some(observed)) if claimed != observed => {
            warn!(
                transaction_id = %current.transaction_id,
                claimed = claimed.as_str(),
                observed = observed.as_str(),
                "agent reported a different decision than the one claimed"
            );
        }
        _ => {}
    }

    write_reported(db, &current, reported, observed, event.failure_reason.as_deref()).await
}

fn observed_decision(reported: TransactionState) -> Option<Decision> {
    match reported {
        TransactionState::TransactionEndorsed => Some(Decision::Endorse),
        TransactionState::TransactionRefused => Some(Decision::Refuse),
        _ => None,
    }
}

async fn write_reported(
    db: &SqlitePool,
    current: &TransactionRecord,
    reported: TransactionState,
    observed: Option<Decision>,
    failure_reason: Option<&str>,
) -> Result<TransactionOutcome, EngineError> {
    // decision_source is only 'none' while in request_received, so leaving
    // that state without a local claim records the agent as the decider
    let result = sqlx::query(
        r#"
        UPDATE endorse_transactions
        SET state = ?1,
            unroutable = 0,
            decision_source = CASE WHEN decision_source = 'none' THEN 'agent' ELSE decision_source END,
            decision = COALESCE(decision, ?2),
            decided_at = COALESCE(decided_at, ?3),
            failure_reason = COALESCE(?4, failure_reason),
            last_error = NULL,
            updated_at = ?3
        WHERE transaction_id = ?5
          AND state = ?6
        "#,
    )
    .bind(reported.as_str())
    .bind(observed.map(Decision::as_str))
    .bind(utc_now())
    .bind(failure_reason)
    .bind(&current.transaction_id)
    .bind(current.state.as_str())
    .execute(db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(stale(&current.transaction_id, Some(current.state), reported));
    }

    if reported == TransactionState::TransactionFailed {
        warn!(
            transaction_id = %current.transaction_id,
            failure_reason = failure_reason.unwrap_or(""),
            "ledger write failed"
        );
    } else {
        info!(
            transaction_id = %current.transaction_id,
            from = %current.state,
            to = %reported,
            "transaction advanced"
        );
    }

    Ok(TransactionOutcome::Advanced {
        from: current.state,
        to: reported,
    })
}

/// Stores a state reported for a transaction whose request is not stored
/// yet. A later report only replaces an earlier one when it is a valid
/// successor, so the buffer holds the furthest state seen.
async fn buffer_early_report(
    db: &SqlitePool,
    event: &TransactionEvent,
    reported: TransactionState,
) -> Result<TransactionOutcome, EngineError> {
    let mut upsert = QueryBuilder::<Sqlite>::new(
        "INSERT INTO early_transaction_reports (transaction_id, state, decision, failure_reason, reported_at) VALUES (",
    );
    upsert
        .push_bind(event.transaction_id.clone())
        .push(", ")
        .push_bind(reported.as_str())
        .push(", ")
        .push_bind(observed_decision(reported).map(Decision::as_str))
        .push(", ")
        .push_bind(event.failure_reason.clone())
        .push(", ")
        .push_bind(utc_now())
        .push(
            ") ON CONFLICT(transaction_id) DO UPDATE SET \
             state = excluded.state, \
             decision = COALESCE(early_transaction_reports.decision, excluded.decision), \
             failure_reason = COALESCE(excluded.failure_reason, early_transaction_reports.failure_reason), \
             reported_at = excluded.reported_at \
             WHERE early_transaction_reports.state IN (",
        );
    let mut predecessors = upsert.separated(", ");
    for earlier in reported.predecessors() {
        predecessors.push_bind(earlier.as_str());
    }
    predecessors.push_unseparated(")");

    let result = upsert.build().execute(db).await?;
    if result.rows_affected() == 0 {
        let buffered: Option<String> = sqlx::query_scalar(
            "SELECT state FROM early_transaction_reports WHERE transaction_id = ?1",
        )
        .bind(&event.transaction_id)
        .fetch_optional(db)
        .await?;
        return match buffered.map(|s| s.parse::<TransactionState>()).transpose() {
            Ok(Some(buffered)) if buffered == reported => Ok(TransactionOutcome::Duplicate),
            Ok(buffered) => Err(stale(&event.transaction_id, buffered, reported)),
            Err(err) => Err(EngineError::corrupt(err)),
        };
    }

    debug!(
        transaction_id = %event.transaction_id,
        state = %reported,
        "buffered state reported before the request"
    );

    // the request may have been stored while this report was buffered
    if fetch_transaction(db, &event.transaction_id).await?.is_some() {
        if let Some(outcome) = replay_early_report(db, &event.transaction_id).await? {
            return Ok(outcome);
        }
    }
    Ok(TransactionOutcome::Buffered(reported))
}

/// Applies and clears a buffered report once the request is stored. Whoever
/// deletes the buffer row applies it.
async fn replay_early_report(
    db: &SqlitePool,
    transaction_id: &str,
) -> Result<Option<TransactionOutcome>, EngineError> {
    let row = sqlx::query(
        r#"
        DELETE FROM early_transaction_reports
        WHERE transaction_id = ?1
        RETURNING state, decision, failure_reason
        "#,
    )
    .bind(transaction_id)
    .fetch_optional(db)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let state: String = row.try_get("state")?;
    let state: TransactionState = state.parse().map_err(EngineError::corrupt)?;
    let decision: Option<String> = row.try_get("decision")?;
    let decision = decision
        .map(|d| d.parse::<Decision>())
        .transpose()
        .map_err(EngineError::corrupt)?;
    let failure_reason: Option<String> = row.try_get("failure_reason")?;

    let current = require_transaction(db, transaction_id).await?;
    let outcome = match (current.state, current.state.transition_to(state)) {
        (_, Transition::Duplicate) => TransactionOutcome::Duplicate,
        // the buffered state may skip states the agent passed through
        (TransactionState::RequestReceived, _) | (_, Transition::Advance) => {
            info!(transaction_id, state = %state, "applying state reported before the request");
            write_reported(db, &current, state, decision, failure_reason.as_deref()).await?
        }
        (_, Transition::Stale) => {
            debug!(transaction_id, state = %state, "buffered report is behind the stored state");
            TransactionOutcome::Duplicate
        }
    };
    Ok(Some(outcome))
}

async fn insert_transaction(
    db: &SqlitePool,
    event: &TransactionEvent,
    connection_id: &str,
    transaction_type: &TransactionType,
) -> Result<bool, EngineError> {
    let signature_request = serde_json::to_string(&event.signature_request)
        .map_err(EngineError::validation)?;
    let now = utc_now();

    let result = sqlx::query(
        r#"
        INSERT INTO endorse_transactions (
          transaction_id,
          connection_id,
          transaction_type,
          signature_request_json,
          author_did,
          subject_did,
          schema_name,
          schema_version,
          author_goal_code,
          state,
          unroutable,
          decision_source,
          created_at,
          updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'request_received', 1, 'none', ?10, ?10)
        ON CONFLICT(transaction_id) DO NOTHING
        "#,
    )
    .bind(&event.transaction_id)
    .bind(connection_id)
    .bind(transaction_type.as_str())
    .bind(signature_request)
    .bind(&event.content.author_did)
    .bind(&event.content.subject_did)
    .bind(&event.content.schema_name)
    .bind(&event.content.schema_version)
    .bind(&event.content.author_goal_code)
    .bind(now)
    .execute(db)
    .await?;

    Ok(result.rows_affected() == 1)
}

async fn set_fault(
    db: &SqlitePool,
    transaction_id: &str,
    fault: Option<&str>,
) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        UPDATE endorse_transactions
        SET last_error = ?1, updated_at = ?2
        WHERE transaction_id = ?3
        "#,
    )
    .bind(fault)
    .bind(utc_now())
    .bind(transaction_id)
    .execute(db)
    .await?;
    Ok(())
}

fn stale(
    transaction_id: &str,
    from: Option<TransactionState>,
    to: TransactionState,
) -> EngineError {
    EngineError::StaleTransition {
        entity: "transaction",
        id: transaction_id.to_string(),
        from: from.map_or_else(|| "unknown".to_string(), |s| s.to_string()),
        to: to.to_string(),
    }
}

pub async fn fetch_transaction(
    db: &SqlitePool,
    transaction_id: &str,
) -> Result<Option<TransactionRecord>, EngineError> {
    let row = sqlx::query("SELECT * FROM endorse_transactions WHERE transaction_id = ?1")
        .bind(transaction_id)
        .fetch_optional(db)
        .await?;

    row.as_ref().map(row_to_transaction).transpose()
}

pub async fn require_transaction(
    db: &SqlitePool,
    transaction_id: &str,
) -> Result<TransactionRecord, EngineError> {
    fetch_transaction(db, transaction_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("transaction {transaction_id}")))
}

/// Lists transactions oldest first. Without a state filter this is the
/// pending-review queue.
pub async fn list_transactions(
    db: &SqlitePool,
    query: &TransactionListQuery,
) -> Result<(i64, Vec<TransactionRecord>), EngineError> {
    let (limit, offset) = page_window(query.page_size, query.page_num);

    let mut count =
        QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM endorse_transactions WHERE 1 = 1");
    push_filters(&mut count, query);
    let total: i64 = count.build_query_scalar().fetch_one(db).await?;

    let mut select = QueryBuilder::<Sqlite>::new("SELECT * FROM endorse_transactions WHERE 1 = 1");
    push_filters(&mut select, query);
    select
        .push(" ORDER BY created_at ASC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let rows = select.build().fetch_all(db).await?;

    let transactions = rows
        .iter()
        .map(row_to_transaction)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((total, transactions))
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &TransactionListQuery) {
    let state = query.state.unwrap_or(TransactionState::RequestReceived);
    builder.push(" AND state = ").push_bind(state.as_str());

    if let Some(connection_id) = query.connection_id.clone() {
        builder.push(" AND connection_id = ").push_bind(connection_id);
    }
    if let Some(code) = query.transaction_type.clone() {
        let transaction_type = TransactionType::from(code);
        builder
            .push(" AND transaction_type = ")
            .push_bind(transaction_type.as_str().to_string());
    }
    if let Some(seconds) = query.older_than_seconds {
        let cutoff = utc_now() - Duration::seconds(seconds.clamp(0, MAX_AGE_SECONDS));
        builder.push(" AND created_at < ").push_bind(cutoff);
    }
}

fn row_to_transaction(row: &SqliteRow) -> Result<TransactionRecord, EngineError> {
    let transaction_type: String = row.try_get("transaction_type")?;
    let signature_request: String = row.try_get("signature_request_json")?;
    let state: String = row.try_get("state")?;
    let decision_source: String = row.try_get("decision_source")?;
    let decision: Option<String> = row.try_get("decision")?;

    Ok(TransactionRecord {
        transaction_id: row.try_get("transaction_id")?,
        connection_id: row.try_get("connection_id")?,
        transaction_type: TransactionType::from(transaction_type),
        signature_request: serde_json::from_str(&signature_request).map_err(EngineError::corrupt)?,
        content: TransactionContent {
            author_did: row.try_get("author_did")?,
            subject_did: row.try_get("subject_did")?,
            schema_name: row.try_get("schema_name")?,
            schema_version: row.try_get("schema_version")?,
            author_goal_code: row.try_get("author_goal_code")?,
        },
        state: state.parse().map_err(EngineError::corrupt)?,
        unroutable: row.try_get("unroutable")?,
        decision_source: decision_source.parse().map_err(EngineError::corrupt)?,
        decision: decision
            .map(|d| d.parse::<Decision>())
            .transpose()
            .map_err(EngineError::corrupt)?,
        refusal_reason: row.try_get("refusal_reason")?,
        failure_reason: row.try_get("failure_reason")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        decided_at: row.try_get("decided_at")?,
    })
}
