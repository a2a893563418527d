use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of comparing a reported state against the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advance,
    Duplicate,
    Stale,
}

/// Connection lifecycle as seen from the endorser side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Invitation,
    Request,
    Response,
    Active,
    Abandoned,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Invitation => "invitation",
            ConnectionState::Request => "request",
            ConnectionState::Response => "response",
            ConnectionState::Active => "active",
            ConnectionState::Abandoned => "abandoned",
        }
    }

    /// States the record may move to from `self`. Forward jumps are allowed
    /// so that a lost intermediate delivery does not wedge the record.
    pub fn successors(self) -> &'static [ConnectionState] {
        use ConnectionState::*;
        match self {
            Invitation => &[Request, Response, Active, Abandoned],
            Request => &[Response, Active, Abandoned],
            Response => &[Active, Abandoned],
            Active => &[Abandoned],
            Abandoned => &[],
        }
    }

    pub fn transition_to(self, next: ConnectionState) -> Transition {
        if self == next {
            Transition::Duplicate
        } else if self.successors().contains(&next) {
            Transition::Advance
        } else {
            Transition::Stale
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionState {
    type Err = String;

    /// Accepts the agent's connection vocabulary as well as the RFC 0023
    /// hyphenated names.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "init" | "start" | "invitation" | "invitation-sent" | "invitation_sent" => {
                Ok(ConnectionState::Invitation)
            }
            "request" | "request-received" | "request_received" => Ok(ConnectionState::Request),
            "response" | "response-sent" | "response_sent" => Ok(ConnectionState::Response),
            "active" | "completed" => Ok(ConnectionState::Active),
            "abandoned" | "error" => Ok(ConnectionState::Abandoned),
            other => Err(format!("unknown connection state: {other}")),
        }
    }
}

/// Endorsement transaction lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    RequestReceived,
    TransactionEndorsed,
    TransactionRefused,
    TransactionAcked,
    TransactionCancelled,
    TransactionFailed,
}

impl TransactionState {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionState::RequestReceived => "request_received",
            TransactionState::TransactionEndorsed => "transaction_endorsed",
            TransactionState::TransactionRefused => "transaction_refused",
            TransactionState::TransactionAcked => "transaction_acked",
            TransactionState::TransactionCancelled => "transaction_cancelled",
            TransactionState::TransactionFailed => "transaction_failed",
        }
    }

    pub fn successors(self) -> &'static [TransactionState] {
        use TransactionState::*;
        match self {
            RequestReceived => &[TransactionEndorsed, TransactionRefused, TransactionCancelled],
            TransactionEndorsed => &[TransactionAcked, TransactionCancelled, TransactionFailed],
            TransactionRefused => &[TransactionAcked, TransactionCancelled],
            TransactionAcked | TransactionCancelled | TransactionFailed => &[],
        }
    }

    pub const ALL: [TransactionState; 6] = [
        TransactionState::RequestReceived,
        TransactionState::TransactionEndorsed,
        TransactionState::TransactionRefused,
        TransactionState::TransactionAcked,
        TransactionState::TransactionCancelled,
        TransactionState::TransactionFailed,
    ];

    /// States that may move directly to `self`.
    pub fn predecessors(self) -> impl Iterator<Item = TransactionState> {
        Self::ALL
            .into_iter()
            .filter(move |earlier| earlier.successors().contains(&self))
    }

    pub fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }

    pub fn transition_to(self, next: TransactionState) -> Transition {
        if self == next {
            Transition::Duplicate
        } else if self.successors().contains(&next) {
            Transition::Advance
        } else {
            Transition::Stale
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "request_received" => Ok(TransactionState::RequestReceived),
            "transaction_endorsed" | "endorsed" => Ok(TransactionState::TransactionEndorsed),
            "transaction_refused" | "refused" => Ok(TransactionState::TransactionRefused),
            "transaction_acked" | "acked" => Ok(TransactionState::TransactionAcked),
            "transaction_cancelled" | "cancelled" => Ok(TransactionState::TransactionCancelled),
            "transaction_failed" | "failed" => Ok(TransactionState::TransactionFailed),
            other => Err(format!("unknown transaction state: {other}")),
        }
    }
}

/// Ledger transaction kinds. Codes the engine does not know are kept verbatim
/// so a newer agent protocol does not break decoding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransactionType {
    Did,
    Attrib,
    Schema,
    CredDef,
    RevocRegistry,
    RevocEntry,
    Other(String),
}

impl TransactionType {
    pub fn as_str(&self) -> &str {
        match self {
            TransactionType::Did => "did",
            TransactionType::Attrib => "attrib",
            TransactionType::Schema => "schema",
            TransactionType::CredDef => "cred_def",
            TransactionType::RevocRegistry => "revoc_registry",
            TransactionType::RevocEntry => "revoc_entry",
            TransactionType::Other(code) => code,
        }
    }
}

impl From<String> for TransactionType {
    fn from(value: String) -> Self {
        crate::policy::transaction_type_from_code(&value)
            .unwrap_or(TransactionType::Other(value))
    }
}

impl From<TransactionType> for String {
    fn from(value: TransactionType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    None,
    Auto,
    Manual,
    /// The agent reported a decided or withdrawn state this engine did not claim.
    Agent,
}

impl DecisionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionSource::None => "none",
            DecisionSource::Auto => "auto",
            DecisionSource::Manual => "manual",
            DecisionSource::Agent => "agent",
        }
    }
}

impl FromStr for DecisionSource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(DecisionSource::None),
            "auto" => Ok(DecisionSource::Auto),
            "manual" => Ok(DecisionSource::Manual),
            "agent" => Ok(DecisionSource::Agent),
            other => Err(format!("unknown decision source: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Endorse,
    Refuse,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Endorse => "endorse",
            Decision::Refuse => "refuse",
        }
    }

    pub fn target_state(self) -> TransactionState {
        match self {
            Decision::Endorse => TransactionState::TransactionEndorsed,
            Decision::Refuse => TransactionState::TransactionRefused,
        }
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "endorse" => Ok(Decision::Endorse),
            "refuse" => Ok(Decision::Refuse),
            other => Err(format!("unknown decision: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthorStatus {
    Pending,
    Active,
    Suspended,
}

impl AuthorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthorStatus::Pending => "pending",
            AuthorStatus::Active => "active",
            AuthorStatus::Suspended => "suspended",
        }
    }
}

impl FromStr for AuthorStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(AuthorStatus::Pending),
            "active" => Ok(AuthorStatus::Active),
            "suspended" => Ok(AuthorStatus::Suspended),
            other => Err(format!("unknown author status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndorseStatus {
    AutoEndorse,
    ManualEndorse,
    AutoReject,
}

impl EndorseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EndorseStatus::AutoEndorse => "auto_endorse",
            EndorseStatus::ManualEndorse => "manual_endorse",
            EndorseStatus::AutoReject => "auto_reject",
        }
    }
}

impl FromStr for EndorseStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "auto_endorse" => Ok(EndorseStatus::AutoEndorse),
            "manual_endorse" => Ok(EndorseStatus::ManualEndorse),
            "auto_reject" => Ok(EndorseStatus::AutoReject),
            other => Err(format!("unknown endorse status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub connection_id: String,
    #[serde(default)]
    pub their_label: Option<String>,
    pub state: ConnectionState,
    pub role: String,
    pub auto_accepted: bool,
    pub author_status: AuthorStatus,
    pub endorse_status: EndorseStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub connection_id: String,
    pub transaction_type: TransactionType,
    pub signature_request: Value,
    #[serde(flatten)]
    pub content: TransactionContent,
    pub state: TransactionState,
    pub unroutable: bool,
    pub decision_source: DecisionSource,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub refusal_reason: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
}

/// Connection webhook after decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    pub connection_id: String,
    pub state: ConnectionState,
    pub their_label: Option<String>,
}

/// Endorse-transaction webhook after decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionEvent {
    pub transaction_id: String,
    pub connection_id: Option<String>,
    pub state: TransactionState,
    pub transaction_type: Option<TransactionType>,
    pub signature_request: Value,
    pub content: TransactionContent,
    pub failure_reason: Option<String>,
}

/// Fields of the proposed ledger write that allow-lists match on. Read from
/// the webhook payload only; nothing here needs a ledger lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionContent {
    #[serde(default)]
    pub author_did: Option<String>,
    /// DID written or updated by a `did`/`attrib` request.
    #[serde(default)]
    pub subject_did: Option<String>,
    #[serde(default)]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub author_goal_code: Option<String>,
}

pub const GOAL_REGISTER_PUBLIC_DID: &str = "aries.transaction.register_public_did";

/// Witnessed record kinds of the did:webvh witness protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum WitnessKind {
    LogEntry,
    AttestedResource,
}

impl WitnessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WitnessKind::LogEntry => "log-entry",
            WitnessKind::AttestedResource => "attested-resource",
        }
    }
}

impl fmt::Display for WitnessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WitnessKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "log-entry" => Ok(WitnessKind::LogEntry),
            "attested-resource" => Ok(WitnessKind::AttestedResource),
            other => Err(format!("unknown witness record type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WitnessState {
    Pending,
    Witnessed,
    Rejected,
}

impl WitnessState {
    pub fn as_str(self) -> &'static str {
        match self {
            WitnessState::Pending => "pending",
            WitnessState::Witnessed => "witnessed",
            WitnessState::Rejected => "rejected",
        }
    }

    pub fn successors(self) -> &'static [WitnessState] {
        match self {
            WitnessState::Pending => &[WitnessState::Witnessed, WitnessState::Rejected],
            WitnessState::Witnessed | WitnessState::Rejected => &[],
        }
    }

    pub fn transition_to(self, next: WitnessState) -> Transition {
        if self == next {
            Transition::Duplicate
        } else if self.successors().contains(&next) {
            Transition::Advance
        } else {
            Transition::Stale
        }
    }
}

impl fmt::Display for WitnessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WitnessState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(WitnessState::Pending),
            "witnessed" | "attested" => Ok(WitnessState::Witnessed),
            "rejected" => Ok(WitnessState::Rejected),
            other => Err(format!("unknown witness state: {other}")),
        }
    }
}

/// did:webvh identifier parts a witness request is filed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebvhLocator {
    pub scid: String,
    pub domain: String,
    pub namespace: String,
    pub identifier: String,
}

impl WebvhLocator {
    /// Splits `did:webvh:{scid}:{domain}:{namespace}:{identifier}`.
    pub fn from_did(did: &str) -> Option<Self> {
        let parts: Vec<&str> = did.split(':').collect();
        match parts.as_slice() {
            ["did", _, scid, domain, namespace, identifier, ..]
                if [scid, domain, namespace, identifier].iter().all(|p| !p.is_empty()) =>
            {
                Some(Self {
                    scid: scid.to_string(),
                    domain: domain.to_string(),
                    namespace: namespace.to_string(),
                    identifier: identifier.to_string(),
                })
            }
            _ => None,
        }
    }
}

/// Witness-request webhook after decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct WitnessEvent {
    pub record_id: String,
    pub kind: WitnessKind,
    pub state: WitnessState,
    pub locator: WebvhLocator,
    pub record: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WitnessRecord {
    pub record_id: String,
    pub record_type: WitnessKind,
    pub state: WitnessState,
    #[serde(flatten)]
    pub locator: WebvhLocator,
    pub record: Value,
    pub decision_source: DecisionSource,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub topic: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionListQuery {
    #[serde(default)]
    pub state: Option<TransactionState>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub transaction_type: Option<String>,
    #[serde(default)]
    pub older_than_seconds: Option<i64>,
    #[serde(default)]
    pub page_size: Option<i64>,
    #[serde(default)]
    pub page_num: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionPage {
    pub page_size: i64,
    pub page_num: i64,
    pub count: usize,
    pub total_count: i64,
    pub transactions: Vec<TransactionRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionListQuery {
    #[serde(default)]
    pub state: Option<ConnectionState>,
    #[serde(default)]
    pub page_size: Option<i64>,
    #[serde(default)]
    pub page_num: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPage {
    pub page_size: i64,
    pub page_num: i64,
    pub count: usize,
    pub total_count: i64,
    pub connections: Vec<ConnectionRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WitnessListQuery {
    #[serde(default)]
    pub state: Option<WitnessState>,
    #[serde(default)]
    pub record_type: Option<WitnessKind>,
    #[serde(default)]
    pub page_size: Option<i64>,
    #[serde(default)]
    pub page_num: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WitnessPage {
    pub page_size: i64,
    pub page_num: i64,
    pub count: usize,
    pub total_count: i64,
    pub witness_requests: Vec<WitnessRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page_size: Option<i64>,
    #[serde(default)]
    pub page_num: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedPublicDid {
    pub registered_did: String,
    #[serde(default)]
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedSchema {
    pub allowed_schema_id: String,
    pub author_did: String,
    pub schema_name: String,
    pub version: String,
    #[serde(default)]
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedLogEntry {
    pub allowed_log_entry_id: String,
    pub scid: String,
    pub domain: String,
    pub namespace: String,
    pub identifier: String,
    #[serde(default)]
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedPublicDidRequest {
    pub registered_did: String,
    #[serde(default)]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedSchemaRequest {
    pub author_did: String,
    pub schema_name: String,
    pub version: String,
    #[serde(default)]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedLogEntryRequest {
    pub scid: String,
    pub domain: String,
    pub namespace: String,
    pub identifier: String,
    #[serde(default)]
    pub details: Option<String>,
}

/// One page of an allow-list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowListPage<T> {
    pub page_size: i64,
    pub page_num: i64,
    pub count: usize,
    pub total_count: i64,
    pub entries: Vec<T>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefuseRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureConnectionRequest {
    pub author_status: AuthorStatus,
    pub endorse_status: EndorseStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub jti: String,
    pub iat: usize,
    pub exp: usize,
}

#[cfg(test)]
mod tests {
    use super::{
        ConnectionState, Transition, TransactionState, TransactionType, WebvhLocator, WitnessKind,
        WitnessState,
    };

    const CONNECTION_STATES: [ConnectionState; 5] = [
        ConnectionState::Invitation,
        ConnectionState::Request,
        ConnectionState::Response,
        ConnectionState::Active,
        ConnectionState::Abandoned,
    ];

    #[test]
    fn connection_state_never_regresses_over_any_sequence() {
        // every sequence of four reported states, starting from each state
        for start in CONNECTION_STATES {
            for a in CONNECTION_STATES {
                for b in CONNECTION_STATES {
                    for c in CONNECTION_STATES {
                        let mut current = start;
                        for next in [a, b, c] {
                            match current.transition_to(next) {
                                Transition::Advance => {
                                    assert!(next > current, "{current} -> {next} regressed");
                                    current = next;
                                }
                                Transition::Duplicate => assert_eq!(current, next),
                                Transition::Stale => {}
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn replaying_last_connection_state_is_duplicate() {
        for state in CONNECTION_STATES {
            assert_eq!(state.transition_to(state), Transition::Duplicate);
        }
    }

    #[test]
    fn abandoned_is_reachable_from_every_other_connection_state() {
        for state in CONNECTION_STATES {
            if state != ConnectionState::Abandoned {
                assert_eq!(
                    state.transition_to(ConnectionState::Abandoned),
                    Transition::Advance
                );
            }
        }
    }

    #[test]
    fn agent_connection_vocabulary_is_decoded() {
        assert_eq!("completed".parse::<ConnectionState>(), Ok(ConnectionState::Active));
        assert_eq!("request-received".parse::<ConnectionState>(), Ok(ConnectionState::Request));
        assert_eq!("error".parse::<ConnectionState>(), Ok(ConnectionState::Abandoned));
        assert!("bogus".parse::<ConnectionState>().is_err());
    }

    #[test]
    fn terminal_transaction_states_accept_nothing() {
        for terminal in [
            TransactionState::TransactionAcked,
            TransactionState::TransactionCancelled,
            TransactionState::TransactionFailed,
        ] {
            assert!(terminal.is_terminal());
            assert_eq!(
                terminal.transition_to(TransactionState::RequestReceived),
                Transition::Stale
            );
        }
    }

    #[test]
    fn transaction_table_matches_lifecycle() {
        use TransactionState::*;
        assert_eq!(RequestReceived.transition_to(TransactionEndorsed), Transition::Advance);
        assert_eq!(RequestReceived.transition_to(TransactionAcked), Transition::Stale);
        assert_eq!(TransactionEndorsed.transition_to(TransactionFailed), Transition::Advance);
        assert_eq!(TransactionRefused.transition_to(TransactionFailed), Transition::Stale);
        assert_eq!(TransactionRefused.transition_to(TransactionCancelled), Transition::Advance);
        assert_eq!(TransactionEndorsed.transition_to(RequestReceived), Transition::Stale);
    }

    #[test]
    fn predecessors_mirror_the_successor_table() {
        use TransactionState::*;
        let acked: Vec<_> = TransactionAcked.predecessors().collect();
        assert_eq!(acked, vec![TransactionEndorsed, TransactionRefused]);
        assert_eq!(RequestReceived.predecessors().count(), 0);
        assert!(TransactionCancelled.predecessors().any(|s| s == RequestReceived));
    }

    #[test]
    fn webvh_locator_splits_did_parts() {
        let locator = WebvhLocator::from_did("did:webvh:QmScid:example.com:people:alice")
            .expect("six part did should split");
        assert_eq!(locator.scid, "QmScid");
        assert_eq!(locator.domain, "example.com");
        assert_eq!(locator.namespace, "people");
        assert_eq!(locator.identifier, "alice");
        assert!(WebvhLocator::from_did("did:web:example.com").is_none());
    }

    #[test]
    fn witness_requests_only_leave_pending_once() {
        assert_eq!(
            WitnessState::Pending.transition_to(WitnessState::Witnessed),
            Transition::Advance
        );
        assert_eq!(
            WitnessState::Witnessed.transition_to(WitnessState::Rejected),
            Transition::Stale
        );
        assert_eq!("log_entry".parse::<WitnessKind>(), Ok(WitnessKind::LogEntry));
    }

    #[test]
    fn transaction_type_accepts_names_codes_and_unknowns() {
        assert_eq!(TransactionType::from("101".to_string()), TransactionType::Schema);
        assert_eq!(TransactionType::from("cred_def".to_string()), TransactionType::CredDef);
        assert_eq!(
            TransactionType::from("20000".to_string()),
            TransactionType::Other("20000".to_string())
        );
        let encoded = serde_json::to_string(&TransactionType::RevocEntry).expect("serialize");
        assert_eq!(encoded, "\"revoc_entry\"");
    }
}
