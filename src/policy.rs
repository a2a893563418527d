use std::collections::{BTreeSet, HashMap};

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::{
    error::EngineError,
    models::{AuthorStatus, ConnectionRecord, EndorseStatus, TransactionType},
};

/// Known transaction kinds, addressable by name or by ledger operation code.
static TRANSACTION_TYPE_CATALOG: Lazy<HashMap<&'static str, TransactionType>> = Lazy::new(|| {
    let mut map = HashMap::new();

    map.insert("did", TransactionType::Did);
    map.insert("nym", TransactionType::Did);
    map.insert("1", TransactionType::Did);
    map.insert("attrib", TransactionType::Attrib);
    map.insert("100", TransactionType::Attrib);
    map.insert("schema", TransactionType::Schema);
    map.insert("101", TransactionType::Schema);
    map.insert("cred_def", TransactionType::CredDef);
    map.insert("102", TransactionType::CredDef);
    map.insert("revoc_registry", TransactionType::RevocRegistry);
    map.insert("113", TransactionType::RevocRegistry);
    map.insert("revoc_entry", TransactionType::RevocEntry);
    map.insert("114", TransactionType::RevocEntry);
    map
});

const TRUE_VALUES: &[&str] = &["true", "1", "t", "y", "yes", "on"];

pub fn transaction_type_from_code(code: &str) -> Option<TransactionType> {
    let normalized = code.trim().to_ascii_lowercase().replace('-', "_");
    TRANSACTION_TYPE_CATALOG.get(normalized.as_str()).cloned()
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Refuse,
    Defer,
}

/// Process-wide decision policy. Loaded once at start-up and never mutated;
/// a restart is required to change it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Policy {
    pub auto_accept_connections: bool,
    pub auto_accept_authors: bool,
    pub auto_endorse_requests: bool,
    pub reject_by_default: bool,
    /// Empty means every transaction type.
    pub auto_endorse_transaction_types: BTreeSet<TransactionType>,
}

impl Policy {
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| {
            lookup(key)
                .map(|v| TRUE_VALUES.contains(&v.trim().to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        };

        let types = lookup("ENDORSER_AUTO_ENDORSE_TXN_TYPES").unwrap_or_default();

        Ok(Self {
            auto_accept_connections: flag("ENDORSER_AUTO_ACCEPT_CONNECTIONS"),
            auto_accept_authors: flag("ENDORSER_AUTO_ACCEPT_AUTHORS"),
            auto_endorse_requests: flag("ENDORSER_AUTO_ENDORSE_REQUESTS"),
            reject_by_default: flag("ENDORSER_REJECT_BY_DEFAULT"),
            auto_endorse_transaction_types: parse_type_allowlist(&types)?,
        })
    }

    pub fn allows_type(&self, transaction_type: &TransactionType) -> bool {
        self.auto_endorse_transaction_types.is_empty()
            || self.auto_endorse_transaction_types.contains(transaction_type)
    }

    /// Rejects flag combinations where one setting can never take effect.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.reject_by_default
            && self.auto_endorse_requests
            && self.auto_endorse_transaction_types.is_empty()
        {
            return Err(EngineError::Configuration(
                "ENDORSER_REJECT_BY_DEFAULT has no effect while ENDORSER_AUTO_ENDORSE_REQUESTS \
                 endorses every transaction type"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses a comma separated allowlist. `*` or an empty string means every
/// type. Unknown names are a configuration error; bare numeric ledger codes
/// are accepted so newer transaction kinds can be allowlisted without a
/// release.
pub fn parse_type_allowlist(raw: &str) -> Result<BTreeSet<TransactionType>, EngineError> {
    let mut types = BTreeSet::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        if entry == "*" {
            return Ok(BTreeSet::new());
        }
        match transaction_type_from_code(entry) {
            Some(known) => {
                types.insert(known);
            }
            None if entry.chars().all(|c| c.is_ascii_digit()) => {
                types.insert(TransactionType::Other(entry.to_string()));
            }
            None => {
                return Err(EngineError::Configuration(format!(
                    "ENDORSER_AUTO_ENDORSE_TXN_TYPES references unknown transaction type: {entry}"
                )));
            }
        }
    }
    Ok(types)
}

/// Per-connection trust inputs for a transaction decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthorContext {
    pub author_status: AuthorStatus,
    pub endorse_status: EndorseStatus,
}

impl From<&ConnectionRecord> for AuthorContext {
    fn from(connection: &ConnectionRecord) -> Self {
        Self {
            author_status: connection.author_status,
            endorse_status: connection.endorse_status,
        }
    }
}

pub fn evaluate_connection_request(policy: &Policy) -> Verdict {
    if policy.auto_accept_connections {
        Verdict::Approve
    } else {
        Verdict::Defer
    }
}

/// `allow_listed` is whether the transaction content matched an operator
/// allow-list entry.
pub fn evaluate_transaction(
    policy: &Policy,
    author: &AuthorContext,
    transaction_type: &TransactionType,
    allow_listed: bool,
) -> Verdict {
    if author.author_status != AuthorStatus::Active {
        return Verdict::Defer;
    }

    if author.endorse_status == EndorseStatus::AutoReject {
        return Verdict::Refuse;
    }

    let auto_endorse =
        policy.auto_endorse_requests || author.endorse_status == EndorseStatus::AutoEndorse;
    if auto_endorse && policy.allows_type(transaction_type) {
        return Verdict::Approve;
    }

    if allow_listed {
        return Verdict::Approve;
    }

    fallback(policy)
}

/// Witness requests carry no connection context; the global flags and the
/// allow-lists decide.
pub fn evaluate_witness(policy: &Policy, allow_listed: bool) -> Verdict {
    if policy.auto_endorse_requests || allow_listed {
        return Verdict::Approve;
    }
    fallback(policy)
}

fn fallback(policy: &Policy) -> Verdict {
    if policy.reject_by_default {
        Verdict::Refuse
    } else {
        Verdict::Defer
    }
}
