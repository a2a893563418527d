//! did:webvh witness requests. They follow the transaction path without a
//! connection: policy and allow-lists decide, or an operator does.

use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, sqlite::SqliteRow};
use tracing::{error, info, warn};

use crate::{
    agent::{ControlCall, GatewayError},
    allow_lists,
    db::{page_window, utc_now},
    error::EngineError,
    models::{
        Decision, DecisionSource, Transition, WebvhLocator, WitnessEvent, WitnessKind,
        WitnessListQuery, WitnessRecord, WitnessState,
    },
    policy::{Verdict, evaluate_witness},
    retry::issue_with_retry,
    state::AppState,
};

const ANONCREDS_SCHEMA_RESOURCE: &str = "anonCredsSchema";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WitnessOutcome {
    /// First delivery was already past `pending`.
    Created(WitnessState),
    Pending,
    Decided(Decision),
    Advanced {
        from: WitnessState,
        to: WitnessState,
    },
    Duplicate,
}

pub async fn apply_event(
    state: &AppState,
    event: &WitnessEvent,
) -> Result<WitnessOutcome, EngineError> {
    if insert_request(&state.db, event).await? {
        info!(
            record_id = %event.record_id,
            record_type = %event.kind,
            scid = %event.locator.scid,
            state = %event.state,
            "witness request received"
        );
        return match event.state {
            WitnessState::Pending => route(state, &event.record_id).await,
            other => Ok(WitnessOutcome::Created(other)),
        };
    }

    let current = require_request(&state.db, &event.record_id).await?;
    match current.state.transition_to(event.state) {
        Transition::Duplicate => Ok(WitnessOutcome::Duplicate),
        Transition::Stale => Err(stale(&current.record_id, current.state, event.state)),
        Transition::Advance => apply_reported(&state.db, &current, event.state).await,
    }
}

async fn route(state: &AppState, record_id: &str) -> Result<WitnessOutcome, EngineError> {
    let record = require_request(&state.db, record_id).await?;
    if record.state != WitnessState::Pending || record.decision_source != DecisionSource::None {
        return Ok(WitnessOutcome::Duplicate);
    }

    let allow_listed = witness_allowed(&state.db, &record).await?;
    let (decision, source) = match evaluate_witness(&state.config.policy, allow_listed) {
        Verdict::Defer => {
            info!(record_id, "witness request awaits operator review");
            return Ok(WitnessOutcome::Pending);
        }
        Verdict::Approve => (Decision::Endorse, DecisionSource::Auto),
        Verdict::Refuse => (Decision::Refuse, DecisionSource::Auto),
    };

    match execute_decision(state, record_id, decision, source).await {
        Ok(_) => Ok(WitnessOutcome::Decided(decision)),
        Err(EngineError::AlreadyDecided(_)) => Ok(WitnessOutcome::Duplicate),
        Err(err) => Err(err),
    }
}

/// Log entries match on their did:webvh parts. Attested schemas match the
/// schema allow-list on issuer, name and version; other resources need a
/// ledger lookup and never match.
async fn witness_allowed(db: &SqlitePool, record: &WitnessRecord) -> Result<bool, EngineError> {
    match record.record_type {
        WitnessKind::LogEntry => allow_lists::log_entry_allowed(db, &record.locator).await,
        WitnessKind::AttestedResource => {
            let resource_type = record
                .record
                .pointer("/metadata/resourceType")
                .and_then(Value::as_str);
            if resource_type != Some(ANONCREDS_SCHEMA_RESOURCE) {
                return Ok(false);
            }
            let content = |key: &str| {
                record
                    .record
                    .get("content")
                    .and_then(|c| c.get(key))
                    .and_then(Value::as_str)
            };
            match (content("issuerId"), content("name"), content("version")) {
                (Some(issuer), Some(name), Some(version)) => {
                    allow_lists::schema_allowed(db, issuer, name, version).await
                }
                _ => Ok(false),
            }
        }
    }
}

/// Re-runs policy over every undecided pending request. Returns how many got
/// decided.
pub async fn reevaluate_pending(state: &AppState) -> Result<usize, EngineError> {
    let rows = sqlx::query(
        r#"
        SELECT record_id FROM witness_requests
        WHERE state = 'pending' AND decision_source = 'none'
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(&state.db)
    .await?;

    let mut decided = 0;
    for row in rows {
        let record_id: String = row.try_get("record_id")?;
        match route(state, &record_id).await {
            Ok(WitnessOutcome::Decided(_)) => decided += 1,
            Ok(_) => {}
            Err(err) => warn!(record_id = %record_id, error = %err, "witness re-evaluation failed"),
        }
    }
    Ok(decided)
}

/// Same claim-then-call discipline as endorsements.
pub async fn execute_decision(
    state: &AppState,
    record_id: &str,
    decision: Decision,
    source: DecisionSource,
) -> Result<WitnessRecord, EngineError> {
    let result = sqlx::query(
        r#"
        UPDATE witness_requests
        SET decision_source = ?1,
            decision = ?2,
            decided_at = ?3,
            updated_at = ?3
        WHERE record_id = ?4
          AND state = 'pending'
          AND decision_source = 'none'
        "#,
    )
    .bind(source.as_str())
    .bind(decision.as_str())
    .bind(utc_now())
    .bind(record_id)
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        let current = require_request(&state.db, record_id).await?;
        return Err(EngineError::AlreadyDecided(format!(
            "witness request {record_id} is {} ({} decision)",
            current.state,
            current.decision_source.as_str()
        )));
    }

    info!(record_id, decision = decision.as_str(), source = source.as_str(), "witness decision claimed");
    issue_claimed(state, record_id, decision).await
}

pub async fn retry_decision(state: &AppState, record_id: &str) -> Result<WitnessRecord, EngineError> {
    let record = require_request(&state.db, record_id).await?;
    match (record.state, record.decision) {
        (WitnessState::Pending, Some(decision)) => {
            info!(record_id, decision = decision.as_str(), "retrying witness decision");
            issue_claimed(state, record_id, decision).await
        }
        _ => Err(EngineError::AlreadyDecided(format!(
            "witness request {record_id} is {} with nothing to retry",
            record.state
        ))),
    }
}

fn target_state(decision: Decision) -> WitnessState {
    match decision {
        Decision::Endorse => WitnessState::Witnessed,
        Decision::Refuse => WitnessState::Rejected,
    }
}

async fn issue_claimed(
    state: &AppState,
    record_id: &str,
    decision: Decision,
) -> Result<WitnessRecord, EngineError> {
    let record = require_request(&state.db, record_id).await?;
    let call = match decision {
        Decision::Endorse => ControlCall::ApproveWitness(record.record_type),
        Decision::Refuse => ControlCall::RejectWitness(record.record_type),
    };

    match issue_with_retry(state.agent.as_ref(), &state.retry, &state.shutdown, call, record_id).await {
        Ok(()) => {}
        Err(err @ GatewayError::Rejected { .. }) => {
            warn!(record_id, error = %err, "agent rejected witness decision");
            set_fault(&state.db, record_id, Some(&err.to_string())).await?;
            return require_request(&state.db, record_id).await;
        }
        Err(err) => {
            error!(record_id, error = %err, "witness decision did not reach the agent");
            set_fault(&state.db, record_id, Some(&err.to_string())).await?;
            return Err(EngineError::DependencyUnavailable(err.to_string()));
        }
    }

    let target = target_state(decision);
    sqlx::query(
        r#"
        UPDATE witness_requests
        SET state = ?1, last_error = NULL, updated_at = ?2
        WHERE record_id = ?3 AND state = 'pending'
        "#,
    )
    .bind(target.as_str())
    .bind(utc_now())
    .bind(record_id)
    .execute(&state.db)
    .await?;
    info!(record_id, state = %target, "witness request decided");

    require_request(&state.db, record_id).await
}

async fn apply_reported(
    db: &SqlitePool,
    current: &WitnessRecord,
    reported: WitnessState,
) -> Result<WitnessOutcome, EngineError> {
    let observed = match reported {
        WitnessState::Witnessed => Some(Decision::Endorse),
        WitnessState::Rejected => Some(Decision::Refuse),
        WitnessState::Pending => None,
    };

    let result = sqlx::query(
        r#"
        UPDATE witness_requests
        SET state = ?1,
            decision_source = CASE WHEN decision_source = 'none' THEN 'agent' ELSE decision_source END,
            decision = COALESCE(decision, ?2),
            decided_at = COALESCE(decided_at, ?3),
            last_error = NULL,
            updated_at = ?3
        WHERE record_id = ?4 AND state = ?5
        "#,
    )
    .bind(reported.as_str())
    .bind(observed.map(Decision::as_str))
    .bind(utc_now())
    .bind(&current.record_id)
    .bind(current.state.as_str())
    .execute(db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(stale(&current.record_id, current.state, reported));
    }
    info!(record_id = %current.record_id, from = %current.state, to = %reported, "witness request advanced");
    Ok(WitnessOutcome::Advanced {
        from: current.state,
        to: reported,
    })
}

async fn insert_request(db: &SqlitePool, event: &WitnessEvent) -> Result<bool, EngineError> {
    let record = serde_json::to_string(&event.record).map_err(EngineError::validation)?;
    let source = match event.state {
        WitnessState::Pending => DecisionSource::None,
        _ => DecisionSource::Agent,
    };
    let now = utc_now();

    let result = sqlx::query(
        r#"
        INSERT INTO witness_requests (
          record_id, record_type, state, scid, domain, namespace, identifier,
          record_json, decision_source, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
        ON CONFLICT(record_id) DO NOTHING
        "#,
    )
    .bind(&event.record_id)
    .bind(event.kind.as_str())
    .bind(event.state.as_str())
    .bind(&event.locator.scid)
    .bind(&event.locator.domain)
    .bind(&event.locator.namespace)
    .bind(&event.locator.identifier)
    .bind(record)
    .bind(source.as_str())
    .bind(now)
    .execute(db)
    .await?;

    Ok(result.rows_affected() == 1)
}

async fn set_fault(db: &SqlitePool, record_id: &str, fault: Option<&str>) -> Result<(), EngineError> {
    sqlx::query("UPDATE witness_requests SET last_error = ?1, updated_at = ?2 WHERE record_id = ?3")
        .bind(fault)
        .bind(utc_now())
        .bind(record_id)
        .execute(db)
        .await?;
    Ok(())
}

fn stale(record_id: &str, from: WitnessState, to: WitnessState) -> EngineError {
    EngineError::StaleTransition {
        entity: "witness request",
        id: record_id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

pub async fn fetch_request(
    db: &SqlitePool,
    record_id: &str,
) -> Result<Option<WitnessRecord>, EngineError> {
    let row = sqlx::query("SELECT * FROM witness_requests WHERE record_id = ?1")
        .bind(record_id)
        .fetch_optional(db)
        .await?;
    row.as_ref().map(row_to_request).transpose()
}

pub async fn require_request(db: &SqlitePool, record_id: &str) -> Result<WitnessRecord, EngineError> {
    fetch_request(db, record_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("witness request {record_id}")))
}

/// Oldest first; defaults to the pending queue.
pub async fn list_requests(
    db: &SqlitePool,
    query: &WitnessListQuery,
) -> Result<(i64, Vec<WitnessRecord>), EngineError> {
    let (limit, offset) = page_window(query.page_size, query.page_num);

    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM witness_requests WHERE 1 = 1");
    push_filters(&mut count, query);
    let total: i64 = count.build_query_scalar().fetch_one(db).await?;

    let mut select = QueryBuilder::<Sqlite>::new("SELECT * FROM witness_requests WHERE 1 = 1");
    push_filters(&mut select, query);
    select
        .push(" ORDER BY created_at ASC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let rows = select.build().fetch_all(db).await?;

    let requests = rows.iter().map(row_to_request).collect::<Result<Vec<_>, _>>()?;
    Ok((total, requests))
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &WitnessListQuery) {
    let state = query.state.unwrap_or(WitnessState::Pending);
    builder.push(" AND state = ").push_bind(state.as_str());
    if let Some(kind) = query.record_type {
        builder.push(" AND record_type = ").push_bind(kind.as_str());
    }
}

fn row_to_request(row: &SqliteRow) -> Result<WitnessRecord, EngineError> {
    let record_type: String = row.try_get("record_type")?;
    let state: String = row.try_get("state")?;
    let record: String = row.try_get("record_json")?;
    let decision_source: String = row.try_get("decision_source")?;
    let decision: Option<String> = row.try_get("decision")?;

    Ok(WitnessRecord {
        record_id: row.try_get("record_id")?,
        record_type: record_type.parse().map_err(EngineError::corrupt)?,
        state: state.parse().map_err(EngineError::corrupt)?,
        locator: WebvhLocator {
            scid: row.try_get("scid")?,
            domain: row.try_get("domain")?,
            namespace: row.try_get("namespace")?,
            identifier: row.try_get("identifier")?,
        },
        record: serde_json::from_str(&record).map_err(EngineError::corrupt)?,
        decision_source: decision_source.parse().map_err(EngineError::corrupt)?,
        decision: decision
            .map(|d| d.parse::<Decision>())
            .transpose()
            .map_err(EngineError::corrupt)?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        decided_at: row.try_get("decided_at")?,
    })
}
