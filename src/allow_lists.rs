//! Operator allow-lists. A pending request whose content matches an entry is
//! endorsed (or witnessed) without review. Every column accepts `*`.

use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::{info, warn};

use crate::{
    db::{new_id, page_window, utc_now},
    error::EngineError,
    models::{
        AllowListPage, AllowedLogEntry, AllowedLogEntryRequest, AllowedPublicDid,
        AllowedPublicDidRequest, AllowedSchema, AllowedSchemaRequest, GOAL_REGISTER_PUBLIC_DID,
        PageQuery, TransactionContent, TransactionType, WebvhLocator,
    },
    state::AppState,
    transactions, witnesses,
};

pub async fn public_did_allowed(db: &SqlitePool, did: &str) -> Result<bool, EngineError> {
    let row = sqlx::query(
        r#"
        SELECT 1 FROM allowed_public_dids
        WHERE registered_did = ?1 OR registered_did = '*'
        LIMIT 1
        "#,
    )
    .bind(did)
    .fetch_optional(db)
    .await?;
    Ok(row.is_some())
}

pub async fn schema_allowed(
    db: &SqlitePool,
    author_did: &str,
    schema_name: &str,
    version: &str,
) -> Result<bool, EngineError> {
    let row = sqlx::query(
        r#"
        SELECT 1 FROM allowed_schemas
        WHERE (author_did = ?1 OR author_did = '*')
          AND (schema_name = ?2 OR schema_name = '*')
          AND (version = ?3 OR version = '*')
        LIMIT 1
        "#,
    )
    .bind(author_did)
    .bind(schema_name)
    .bind(version)
    .fetch_optional(db)
    .await?;
    Ok(row.is_some())
}

pub async fn log_entry_allowed(db: &SqlitePool, locator: &WebvhLocator) -> Result<bool, EngineError> {
    let row = sqlx::query(
        r#"
        SELECT 1 FROM allowed_log_entries
        WHERE (scid = ?1 OR scid = '*')
          AND (domain = ?2 OR domain = '*')
          AND (namespace = ?3 OR namespace = '*')
          AND (identifier = ?4 OR identifier = '*')
        LIMIT 1
        "#,
    )
    .bind(&locator.scid)
    .bind(&locator.domain)
    .bind(&locator.namespace)
    .bind(&locator.identifier)
    .fetch_optional(db)
    .await?;
    Ok(row.is_some())
}

/// Whether a transaction's content matches an allow-list entry. Public DID
/// writes match on the written DID, schemas on author, name and version.
/// Other kinds would need ledger lookups and never match.
pub async fn transaction_allowed(
    db: &SqlitePool,
    transaction_type: &TransactionType,
    content: &TransactionContent,
) -> Result<bool, EngineError> {
    let registers_did = content.author_goal_code.as_deref() == Some(GOAL_REGISTER_PUBLIC_DID)
        || matches!(transaction_type, TransactionType::Did | TransactionType::Attrib);

    if registers_did {
        return match content.subject_did.as_deref() {
            Some(did) => public_did_allowed(db, did).await,
            None => Ok(false),
        };
    }

    match (
        transaction_type,
        content.author_did.as_deref(),
        content.schema_name.as_deref(),
        content.schema_version.as_deref(),
    ) {
        (TransactionType::Schema, Some(author), Some(name), Some(version)) => {
            schema_allowed(db, author, name, version).await
        }
        _ => Ok(false),
    }
}

pub async fn add_public_did(
    state: &AppState,
    request: &AllowedPublicDidRequest,
) -> Result<AllowedPublicDid, EngineError> {
    let registered_did = required(&request.registered_did, "registered_did")?;
    let now = utc_now();

    let result = sqlx::query(
        r#"
        INSERT INTO allowed_public_dids (registered_did, details, created_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(registered_did) DO NOTHING
        "#,
    )
    .bind(&registered_did)
    .bind(&request.details)
    .bind(now)
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::AlreadyExists(format!(
            "public did {registered_did} is already allowed"
        )));
    }
    info!(registered_did = %registered_did, "public did allowed");
    reevaluate_pending(state).await;

    Ok(AllowedPublicDid {
        registered_did,
        details: request.details.clone(),
        created_at: now,
    })
}

pub async fn add_schema(
    state: &AppState,
    request: &AllowedSchemaRequest,
) -> Result<AllowedSchema, EngineError> {
    let entry = AllowedSchema {
        allowed_schema_id: new_id("asch"),
        author_did: required(&request.author_did, "author_did")?,
        schema_name: required(&request.schema_name, "schema_name")?,
        version: required(&request.version, "version")?,
        details: request.details.clone(),
        created_at: utc_now(),
    };

    let result = sqlx::query(
        r#"
        INSERT INTO allowed_schemas (
          allowed_schema_id, author_did, schema_name, version, details, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(author_did, schema_name, version) DO NOTHING
        "#,
    )
    .bind(&entry.allowed_schema_id)
    .bind(&entry.author_did)
    .bind(&entry.schema_name)
    .bind(&entry.version)
    .bind(&entry.details)
    .bind(entry.created_at)
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::AlreadyExists(format!(
            "schema {}:{}:{} is already allowed",
            entry.author_did, entry.schema_name, entry.version
        )));
    }
    info!(
        author_did = %entry.author_did,
        schema_name = %entry.schema_name,
        version = %entry.version,
        "schema allowed"
    );
    reevaluate_pending(state).await;

    Ok(entry)
}

pub async fn add_log_entry(
    state: &AppState,
    request: &AllowedLogEntryRequest,
) -> Result<AllowedLogEntry, EngineError> {
    let entry = AllowedLogEntry {
        allowed_log_entry_id: new_id("alog"),
        scid: required(&request.scid, "scid")?,
        domain: required(&request.domain, "domain")?,
        namespace: required(&request.namespace, "namespace")?,
        identifier: required(&request.identifier, "identifier")?,
        details: request.details.clone(),
        created_at: utc_now(),
    };

    let result = sqlx::query(
        r#"
        INSERT INTO allowed_log_entries (
          allowed_log_entry_id, scid, domain, namespace, identifier, details, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(scid, domain, namespace, identifier) DO NOTHING
        "#,
    )
    .bind(&entry.allowed_log_entry_id)
    .bind(&entry.scid)
    .bind(&entry.domain)
    .bind(&entry.namespace)
    .bind(&entry.identifier)
    .bind(&entry.details)
    .bind(entry.created_at)
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::AlreadyExists(format!(
            "log entry {}:{}:{}:{} is already allowed",
            entry.scid, entry.domain, entry.namespace, entry.identifier
        )));
    }
    info!(scid = %entry.scid, domain = %entry.domain, "log entry allowed");
    reevaluate_pending(state).await;

    Ok(entry)
}

pub async fn remove_public_did(db: &SqlitePool, registered_did: &str) -> Result<(), EngineError> {
    let result = sqlx::query("DELETE FROM allowed_public_dids WHERE registered_did = ?1")
        .bind(registered_did)
        .execute(db)
        .await?;
    removed(result.rows_affected(), "public did", registered_did)
}

pub async fn remove_schema(db: &SqlitePool, allowed_schema_id: &str) -> Result<(), EngineError> {
    let result = sqlx::query("DELETE FROM allowed_schemas WHERE allowed_schema_id = ?1")
        .bind(allowed_schema_id)
        .execute(db)
        .await?;
    removed(result.rows_affected(), "schema", allowed_schema_id)
}

pub async fn remove_log_entry(db: &SqlitePool, allowed_log_entry_id: &str) -> Result<(), EngineError> {
    let result = sqlx::query("DELETE FROM allowed_log_entries WHERE allowed_log_entry_id = ?1")
        .bind(allowed_log_entry_id)
        .execute(db)
        .await?;
    removed(result.rows_affected(), "log entry", allowed_log_entry_id)
}

fn removed(rows: u64, kind: &str, id: &str) -> Result<(), EngineError> {
    if rows == 0 {
        return Err(EngineError::NotFound(format!("allowed {kind} {id}")));
    }
    info!(kind, id, "allow-list entry removed");
    Ok(())
}

pub async fn list_public_dids(
    db: &SqlitePool,
    query: &PageQuery,
) -> Result<AllowListPage<AllowedPublicDid>, EngineError> {
    list(db, "allowed_public_dids", query, |row| {
        Ok(AllowedPublicDid {
            registered_did: row.try_get("registered_did")?,
            details: row.try_get("details")?,
            created_at: row.try_get("created_at")?,
        })
    })
    .await
}

pub async fn list_schemas(
    db: &SqlitePool,
    query: &PageQuery,
) -> Result<AllowListPage<AllowedSchema>, EngineError> {
    list(db, "allowed_schemas", query, |row| {
        Ok(AllowedSchema {
            allowed_schema_id: row.try_get("allowed_schema_id")?,
            author_did: row.try_get("author_did")?,
            schema_name: row.try_get("schema_name")?,
            version: row.try_get("version")?,
            details: row.try_get("details")?,
            created_at: row.try_get("created_at")?,
        })
    })
    .await
}

pub async fn list_log_entries(
    db: &SqlitePool,
    query: &PageQuery,
) -> Result<AllowListPage<AllowedLogEntry>, EngineError> {
    list(db, "allowed_log_entries", query, |row| {
        Ok(AllowedLogEntry {
            allowed_log_entry_id: row.try_get("allowed_log_entry_id")?,
            scid: row.try_get("scid")?,
            domain: row.try_get("domain")?,
            namespace: row.try_get("namespace")?,
            identifier: row.try_get("identifier")?,
            details: row.try_get("details")?,
            created_at: row.try_get("created_at")?,
        })
    })
    .await
}

async fn list<T, F>(
    db: &SqlitePool,
    table: &'static str,
    query: &PageQuery,
    decode: F,
) -> Result<AllowListPage<T>, EngineError>
where
    F: Fn(&SqliteRow) -> Result<T, sqlx::Error>,
{
    let (limit, offset) = page_window(query.page_size, query.page_num);

    let total_count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(db)
        .await?;
    let rows = sqlx::query(&format!(
        "SELECT * FROM {table} ORDER BY created_at ASC LIMIT ?1 OFFSET ?2"
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(db)
    .await?;

    let entries = rows.iter().map(decode).collect::<Result<Vec<_>, _>>()?;
    Ok(AllowListPage {
        page_size: limit,
        page_num: offset / limit + 1,
        count: entries.len(),
        total_count,
        entries,
    })
}

fn required(value: &str, field: &str) -> Result<String, EngineError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::Validation(format!("{field} must not be empty")));
    }
    Ok(value.to_string())
}

/// A new entry may cover requests that were left for review.
async fn reevaluate_pending(state: &AppState) {
    match transactions::reevaluate_pending(state).await {
        Ok(decided) if decided > 0 => info!(decided, "pending transactions decided by allow-list"),
        Ok(_) => {}
        Err(err) => warn!(error = %err, "re-evaluating pending transactions failed"),
    }
    match witnesses::reevaluate_pending(state).await {
        Ok(decided) if decided > 0 => info!(decided, "pending witness requests decided by allow-list"),
        Ok(_) => {}
        Err(err) => warn!(error = %err, "re-evaluating pending witness requests failed"),
    }
}
