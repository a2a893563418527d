use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, sqlite::SqliteRow};
use tracing::{debug, info, warn};

use crate::{
    agent::{ControlCall, GatewayError},
    db::{page_window, utc_now},
    error::EngineError,
    models::{
        ConfigureConnectionRequest, ConnectionEvent, ConnectionListQuery, ConnectionRecord,
        ConnectionState, Transition,
    },
    policy::{Verdict, evaluate_connection_request},
    retry::issue_with_retry,
    state::AppState,
    transactions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Created(ConnectionState),
    Advanced {
        from: ConnectionState,
        to: ConnectionState,
    },
    Duplicate,
}

impl ConnectionOutcome {
    fn entered(self) -> Option<ConnectionState> {
        match self {
            ConnectionOutcome::Created(state) => Some(state),
            ConnectionOutcome::Advanced { to, .. } => Some(to),
            ConnectionOutcome::Duplicate => None,
        }
    }
}

/// Applies one connection webhook. Replays are no-ops and backward moves come
/// back as `StaleTransition`.
pub async fn apply_event(
    state: &AppState,
    event: &ConnectionEvent,
) -> Result<ConnectionOutcome, EngineError> {
    let outcome = match fetch_connection(&state.db, &event.connection_id).await? {
        Some(current) => advance(&state.db, &current, event).await?,
        None => {
            if insert_connection(&state.db, event).await? {
                info!(connection_id = %event.connection_id, state = %event.state, "connection created");
                ConnectionOutcome::Created(event.state)
            } else {
                // lost the insert race to a concurrent delivery
                let current = require_connection(&state.db, &event.connection_id).await?;
                advance(&state.db, &current, event).await?
            }
        }
    };

    if let Some(entered) = outcome.entered() {
        on_enter(state, &event.connection_id, entered).await?;
    }

    Ok(outcome)
}

async fn advance(
    db: &SqlitePool,
    current: &ConnectionRecord,
    event: &ConnectionEvent,
) -> Result<ConnectionOutcome, EngineError> {
    match current.state.transition_to(event.state) {
        Transition::Duplicate => {
            debug!(connection_id = %current.connection_id, state = %current.state, "duplicate connection event");
            Ok(ConnectionOutcome::Duplicate)
        }
        Transition::Stale => Err(stale(&current.connection_id, current.state, event.state)),
        Transition::Advance => {
            compare_and_set_state(
                db,
                &current.connection_id,
                current.state,
                event.state,
                event.their_label.as_deref(),
            )
            .await?;
            info!(
                connection_id = %current.connection_id,
                from = %current.state,
                to = %event.state,
                "connection advanced"
            );
            Ok(ConnectionOutcome::Advanced {
                from: current.state,
                to: event.state,
            })
        }
    }
}

async fn on_enter(
    state: &AppState,
    connection_id: &str,
    entered: ConnectionState,
) -> Result<(), EngineError> {
    match entered {
        ConnectionState::Request => match evaluate_connection_request(&state.config.policy) {
            Verdict::Approve => {
                info!(connection_id, "auto-accepting connection request");
                issue_accept(state, connection_id).await
            }
            Verdict::Refuse | Verdict::Defer => {
                info!(connection_id, "connection request awaits operator");
                Ok(())
            }
        },
        ConnectionState::Active => {
            mark_active(state, connection_id).await?;
            let released = transactions::release_held(state, connection_id).await?;
            if released > 0 {
                info!(connection_id, released, "released held transactions");
            }
            Ok(())
        }
        ConnectionState::Invitation | ConnectionState::Response | ConnectionState::Abandoned => {
            Ok(())
        }
    }
}

async fn issue_accept(state: &AppState, connection_id: &str) -> Result<(), EngineError> {
    match issue_with_retry(
        state.agent.as_ref(),
        &state.retry,
        &state.shutdown,
        ControlCall::AcceptConnection,
        connection_id,
    )
    .await
    {
        Ok(()) => set_fault(&state.db, connection_id, None).await,
        Err(err @ GatewayError::Rejected { .. }) => {
            warn!(connection_id, error = %err, "agent rejected accept, treating as already accepted");
            Ok(())
        }
        Err(err) => {
            set_fault(&state.db, connection_id, Some(&err.to_string())).await?;
            Err(EngineError::DependencyUnavailable(err.to_string()))
        }
    }
}

/// Operator accept of a connection request left by policy.
pub async fn accept_request(
    state: &AppState,
    connection_id: &str,
) -> Result<ConnectionRecord, EngineError> {
    let current = require_connection(&state.db, connection_id).await?;
    if current.state != ConnectionState::Request {
        return Err(EngineError::AlreadyDecided(format!(
            "connection {connection_id} is {} and not awaiting acceptance",
            current.state
        )));
    }

    issue_accept(state, connection_id).await?;
    require_connection(&state.db, connection_id).await
}

/// Operator reject: the connection is abandoned locally and its transactions
/// stay held.
pub async fn reject(state: &AppState, connection_id: &str) -> Result<ConnectionRecord, EngineError> {
    let current = require_connection(&state.db, connection_id).await?;
    match current.state.transition_to(ConnectionState::Abandoned) {
        Transition::Advance => {
            compare_and_set_state(
                &state.db,
                connection_id,
                current.state,
                ConnectionState::Abandoned,
                None,
            )
            .await?;
            info!(connection_id, from = %current.state, "connection rejected by operator");
        }
        Transition::Duplicate => {}
        Transition::Stale => {
            return Err(stale(connection_id, current.state, ConnectionState::Abandoned));
        }
    }
    require_connection(&state.db, connection_id).await
}

/// Updates the per-connection author settings and re-runs policy over the
/// connection's undecided transactions.
pub async fn configure(
    state: &AppState,
    connection_id: &str,
    request: &ConfigureConnectionRequest,
) -> Result<ConnectionRecord, EngineError> {
    let result = sqlx::query(
        r#"
        UPDATE connections
        SET author_status = ?1,
            endorse_status = ?2,
            updated_at = ?3
        WHERE connection_id = ?4
        "#,
    )
    .bind(request.author_status.as_str())
    .bind(request.endorse_status.as_str())
    .bind(utc_now())
    .bind(connection_id)
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::NotFound(format!("connection {connection_id}")));
    }

    info!(
        connection_id,
        author_status = request.author_status.as_str(),
        endorse_status = request.endorse_status.as_str(),
        "connection configured"
    );

    let released = transactions::release_held(state, connection_id).await?;
    debug!(connection_id, released, "re-evaluated undecided transactions");
    require_connection(&state.db, connection_id).await
}

async fn insert_connection(db: &SqlitePool, event: &ConnectionEvent) -> Result<bool, EngineError> {
    let now = utc_now();
    let result = sqlx::query(
        r#"
        INSERT INTO connections (
          connection_id,
          their_label,
          state,
          role,
          auto_accepted,
          author_status,
          endorse_status,
          created_at,
          updated_at
        ) VALUES (?1, ?2, ?3, 'endorser', 0, 'pending', 'manual_endorse', ?4, ?4)
        ON CONFLICT(connection_id) DO NOTHING
        "#,
    )
    .bind(&event.connection_id)
    .bind(&event.their_label)
    .bind(event.state.as_str())
    .bind(now)
    .execute(db)
    .await?;

    Ok(result.rows_affected() == 1)
}

async fn compare_and_set_state(
    db: &SqlitePool,
    connection_id: &str,
    expected: ConnectionState,
    next: ConnectionState,
    their_label: Option<&str>,
) -> Result<(), EngineError> {
    let result = sqlx::query(
        r#"
        UPDATE connections
        SET state = ?1,
            their_label = COALESCE(?2, their_label),
            updated_at = ?3
        WHERE connection_id = ?4
          AND state = ?5
        "#,
    )
    .bind(next.as_str())
    .bind(their_label)
    .bind(utc_now())
    .bind(connection_id)
    .bind(expected.as_str())
    .execute(db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(stale(connection_id, expected, next));
    }
    Ok(())
}

async fn mark_active(state: &AppState, connection_id: &str) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        UPDATE connections
        SET auto_accepted = 1,
            author_status = CASE
              WHEN ?1 AND author_status = 'pending' THEN 'active'
              ELSE author_status
            END,
            updated_at = ?2
        WHERE connection_id = ?3
        "#,
    )
    .bind(state.config.policy.auto_accept_authors)
    .bind(utc_now())
    .bind(connection_id)
    .execute(&state.db)
    .await?;
    Ok(())
}

async fn set_fault(
    db: &SqlitePool,
    connection_id: &str,
    fault: Option<&str>,
) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        UPDATE connections
        SET last_error = ?1, updated_at = ?2
        WHERE connection_id = ?3
        "#,
    )
    .bind(fault)
    .bind(utc_now())
    .bind(connection_id)
    .execute(db)
    .await?;
    Ok(())
}

fn stale(connection_id: &str, from: ConnectionState, to: ConnectionState) -> EngineError {
    EngineError::StaleTransition {
        entity: "connection",
        id: connection_id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

pub async fn fetch_connection(
    db: &SqlitePool,
    connection_id: &str,
) -> Result<Option<ConnectionRecord>, EngineError> {
    let row = sqlx::query("SELECT * FROM connections WHERE connection_id = ?1")
        .bind(connection_id)
        .fetch_optional(db)
        .await?;

    row.as_ref().map(row_to_connection).transpose()
}

pub async fn require_connection(
    db: &SqlitePool,
    connection_id: &str,
) -> Result<ConnectionRecord, EngineError> {
    fetch_connection(db, connection_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("connection {connection_id}")))
}

pub async fn list_connections(
    db: &SqlitePool,
    query: &ConnectionListQuery,
) -> Result<(i64, Vec<ConnectionRecord>), EngineError> {
    let (limit, offset) = page_window(query.page_size, query.page_num);

    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM connections WHERE 1 = 1");
    push_filters(&mut count, query);
    let total: i64 = count.build_query_scalar().fetch_one(db).await?;

    let mut select = QueryBuilder::<Sqlite>::new("SELECT * FROM connections WHERE 1 = 1");
    push_filters(&mut select, query);
    select
        .push(" ORDER BY created_at DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let rows = select.build().fetch_all(db).await?;

    let connections = rows.iter().map(row_to_connection).collect::<Result<Vec<_>, _>>()?;
    Ok((total, connections))
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &ConnectionListQuery) {
    if let Some(state) = query.state {
        builder.push(" AND state = ").push_bind(state.as_str());
    }
}

fn row_to_connection(row: &SqliteRow) -> Result<ConnectionRecord, EngineError> {
    let state: String = row.try_get("state")?;
    let author_status: String = row.try_get("author_status")?;
    let endorse_status: String = row.try_get("endorse_status")?;

    Ok(ConnectionRecord {
        connection_id: row.try_get("connection_id")?,
        their_label: row.try_get("their_label")?,
        state: state.parse().map_err(EngineError::corrupt)?,
        role: row.try_get("role")?,
        auto_accepted: row.try_get("auto_accepted")?,
        author_status: author_status.parse().map_err(EngineError::corrupt)?,
        endorse_status: endorse_status.parse().map_err(EngineError::corrupt)?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
