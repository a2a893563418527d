use std::fmt;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, info};

use crate::models::WitnessKind;

/// Control-plane call issued to the agent's admin API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCall {
    AcceptConnection,
    EndorseTransaction,
    RefuseTransaction,
    ApproveWitness(WitnessKind),
    RejectWitness(WitnessKind),
}

impl ControlCall {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlCall::AcceptConnection => "accept-connection",
            ControlCall::EndorseTransaction => "endorse-transaction",
            ControlCall::RefuseTransaction => "refuse-transaction",
            ControlCall::ApproveWitness(_) => "approve-witness",
            ControlCall::RejectWitness(_) => "reject-witness",
        }
    }

    fn method(self) -> Method {
        match self {
            ControlCall::RejectWitness(_) => Method::DELETE,
            _ => Method::POST,
        }
    }

    fn path(self, id: &str) -> String {
        match self {
            ControlCall::AcceptConnection => format!("/connections/{id}/accept-request"),
            ControlCall::EndorseTransaction => format!("/transactions/{id}/endorse"),
            ControlCall::RefuseTransaction => format!("/transactions/{id}/refuse"),
            ControlCall::ApproveWitness(kind) | ControlCall::RejectWitness(kind) => {
                format!("/did/webvh/witness/{}?record_id={id}", witness_collection(kind))
            }
        }
    }
}

fn witness_collection(kind: WitnessKind) -> &'static str {
    match kind {
        WitnessKind::LogEntry => "log-entries",
        WitnessKind::AttestedResource => "attested-resources",
    }
}

impl fmt::Display for ControlCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// The agent refused the call, typically because the record was already
    /// decided on its side. Not retried.
    #[error("agent rejected {call}: http {status}: {body}")]
    Rejected {
        call: ControlCall,
        status: u16,
        body: String,
    },
    #[error("agent unavailable for {call}: {message}")]
    Unavailable { call: ControlCall, message: String },
    #[error("{call} abandoned: shutting down")]
    Abandoned { call: ControlCall },
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable { .. })
    }
}

/// Outbound control plane towards the agent process.
#[async_trait]
pub trait AgentControl: Send + Sync + fmt::Debug {
    async fn accept_connection(&self, connection_id: &str) -> Result<(), GatewayError>;
    async fn endorse_transaction(&self, transaction_id: &str) -> Result<(), GatewayError>;
    async fn refuse_transaction(&self, transaction_id: &str) -> Result<(), GatewayError>;
    async fn approve_witness(&self, kind: WitnessKind, record_id: &str) -> Result<(), GatewayError>;
    async fn reject_witness(&self, kind: WitnessKind, record_id: &str) -> Result<(), GatewayError>;
}

/// Issues one control call through any gateway implementation.
pub async fn issue(
    agent: &dyn AgentControl,
    call: ControlCall,
    id: &str,
) -> Result<(), GatewayError> {
    match call {
        ControlCall::AcceptConnection => agent.accept_connection(id).await,
        ControlCall::EndorseTransaction => agent.endorse_transaction(id).await,
        ControlCall::RefuseTransaction => agent.refuse_transaction(id).await,
        ControlCall::ApproveWitness(kind) => agent.approve_witness(kind, id).await,
        ControlCall::RejectWitness(kind) => agent.reject_witness(kind, id).await,
    }
}

/// Admin API client for an ACA-Py style agent.
#[derive(Clone, Debug)]
pub struct AcaPyClient {
    pub admin_url: Option<String>,
    pub api_key: Option<String>,
    pub http: Client,
}

impl AcaPyClient {
    pub fn new(admin_url: Option<String>, api_key: Option<String>, http: Client) -> Self {
        Self {
            admin_url,
            api_key,
            http,
        }
    }

    async fn send(&self, call: ControlCall, id: &str) -> Result<(), GatewayError> {
        let Some(admin_url) = self.admin_url.as_ref() else {
            info!(call = %call, id, simulated = true, "agent control call");
            return Ok(());
        };

        let url = format!("{admin_url}{}", call.path(id));
        let mut request = self
            .http
            .request(call.method(), &url)
            .header("content-type", "application/json");
        if let Some(api_key) = self.api_key.as_ref() {
            request = request.header("x-api-key", api_key);
        }

        let response = request.send().await.map_err(|e| GatewayError::Unavailable {
            call,
            message: e.to_string(),
        })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!(call = %call, id, status = status.as_u16(), "agent control call finished");
        classify_response(call, status, body)
    }
}

#[async_trait]
impl AgentControl for AcaPyClient {
    async fn accept_connection(&self, connection_id: &str) -> Result<(), GatewayError> {
        self.send(ControlCall::AcceptConnection, connection_id).await
    }

    async fn endorse_transaction(&self, transaction_id: &str) -> Result<(), GatewayError> {
        self.send(ControlCall::EndorseTransaction, transaction_id).await
    }

    async fn refuse_transaction(&self, transaction_id: &str) -> Result<(), GatewayError> {
        self.send(ControlCall::RefuseTransaction, transaction_id).await
    }

    async fn approve_witness(&self, kind: WitnessKind, record_id: &str) -> Result<(), GatewayError> {
        self.send(ControlCall::ApproveWitness(kind), record_id).await
    }

    async fn reject_witness(&self, kind: WitnessKind, record_id: &str) -> Result<(), GatewayError> {
        self.send(ControlCall::RejectWitness(kind), record_id).await
    }
}

fn classify_response(call: ControlCall, status: StatusCode, body: String) -> Result<(), GatewayError> {
    if status.is_success() {
        return Ok(());
    }

    if status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
    {
        return Err(GatewayError::Rejected {
            call,
            status: status.as_u16(),
            body,
        });
    }

    Err(GatewayError::Unavailable {
        call,
        message: format!("http status {status}"),
    })
}
