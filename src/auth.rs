use axum::{
    extract::State,
    http::{HeaderMap, Request, header},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};

use crate::{
    config::Config,
    db::{new_id, sha256_hex},
    error::AppError,
    models::{OperatorClaims, TokenRequest, TokenResponse},
    state::AppState,
};

/// Authenticated operator, attached to protected requests.
#[derive(Clone, Debug)]
pub struct OperatorContext {
    pub subject: String,
    pub token_id: String,
}

/// Compares digests so the comparison does not leak the key length or a
/// matching prefix.
fn keys_match(presented: &str, expected: &str) -> bool {
    sha256_hex(presented) == sha256_hex(expected)
}

pub async fn webhook_api_key_middleware(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let presented = request
        .headers()
        .get(state.config.webhook_api_key_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            AppError::Unauthorized(format!(
                "missing {} header",
                state.config.webhook_api_key_header
            ))
        })?;

    if !keys_match(presented, &state.config.webhook_api_key) {
        return Err(AppError::Unauthorized("invalid webhook api key".to_string()));
    }

    Ok(next.run(request).await)
}

pub async fn operator_auth_middleware(
    State(state): State<AppState>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(request.headers())?;
    let claims = verify_operator_token(&state.config, &token)?;

    request.extensions_mut().insert(OperatorContext {
        subject: claims.sub,
        token_id: claims.jti,
    });

    Ok(next.run(request).await)
}

pub fn verify_operator_token(config: &Config, token: &str) -> Result<OperatorClaims, AppError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[config.jwt_audience.clone()]);
    validation.set_issuer(&[config.jwt_issuer.clone()]);
    validation.leeway = 30;

    decode::<OperatorClaims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map(|decoded| decoded.claims)
    .map_err(|e| AppError::Unauthorized(format!("invalid token: {e}")))
}

pub fn verify_admin_credentials(config: &Config, request: &TokenRequest) -> Result<(), AppError> {
    let user_ok = keys_match(request.username.trim(), &config.admin_user);
    let key_ok = keys_match(&request.password, &config.admin_key);
    if user_ok && key_ok {
        Ok(())
    } else {
        Err(AppError::Unauthorized("incorrect username or password".to_string()))
    }
}

pub fn issue_operator_token(config: &Config, subject: &str) -> Result<TokenResponse, AppError> {
    let now = Utc::now();
    let ttl = chrono::Duration::minutes(config.jwt_ttl_minutes.max(1));
    let claims = OperatorClaims {
        iss: config.jwt_issuer.clone(),
        sub: subject.to_string(),
        aud: config.jwt_audience.clone(),
        jti: new_id("tok"),
        iat: now.timestamp() as usize,
        exp: (now + ttl).timestamp() as usize,
    };

    let access_token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|e| AppError::internal(format!("failed to sign operator token: {e}")))?;

    Ok(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
        expires_in_seconds: ttl.num_seconds(),
    })
}

pub fn bearer_token(headers: &HeaderMap) -> Result<String, AppError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing Authorization header".to_string()))?;

    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or_else(|| AppError::Unauthorized("authorization must be Bearer token".to_string()))?;

    Ok(token.trim().to_string())
}
