use crate::http::{ApiClient, ServiceError};
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Query},
    http::{header, request::Parts, HeaderMap},
};
use serde::Deserialize;
use std::convert::Infallible;

pub use codeduel_auth_common::{decode_jwt, issue_jwt, AuthError, AuthSecret, Claims};

const TOKEN_COOKIE: &str = "jwt";

/// Turns a player's credential into profile claims.
#[async_trait]
pub trait Identity: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Local HS256 validation with a shared secret.
#[derive(Debug, Clone)]
pub struct JwtIdentity {
    secret: AuthSecret,
}

impl JwtIdentity {
    pub fn new(secret: AuthSecret) -> Self {
        Self { secret }
    }
}

#[async_trait]
impl Identity for JwtIdentity {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode_jwt(token, &self.secret)
    }
}

#[derive(Debug, Deserialize)]
struct ValidatedToken {
    id: i32,
    username: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    image_url: String,
    #[serde(default)]
    role: String,
}

/// Asks the backend to validate tokens it issued.
#[derive(Debug, Clone)]
pub struct RemoteIdentity {
    client: ApiClient,
}

impl RemoteIdentity {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Identity for RemoteIdentity {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let body = serde_json::json!({ "token": token });
        let response = match self.client.post("/api/v1/validateToken", &body).await {
            Ok(response) => response,
            Err(ServiceError::Status { status, .. }) if (400..500).contains(&status) => {
                return Err(AuthError::InvalidToken)
            }
            Err(e) => return Err(AuthError::Unavailable(e.to_string())),
        };
        let validated: ValidatedToken = response
            .json()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        Ok(Claims {
            id: validated.id,
            username: validated.username,
            email: validated.email,
            avatar: validated.image_url,
            role: validated.role,
            exp: 0,
        })
    }
}

/// Pulls the credential out of the `jwt` cookie, a bearer header or the
/// `token` query parameter, in that order.
pub fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == TOKEN_COOKIE)
        .map(|(_, value)| value.to_string());

    let from_header = || {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_string)
    };

    from_cookie
        .or_else(from_header)
        .or_else(|| query.map(str::to_string))
        .filter(|token| !token.is_empty())
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// The credential presented with a request, if any. Never rejects: a
/// websocket entry point reports a missing credential with a close code.
#[derive(Debug, Clone)]
pub struct Credential(pub Option<String>);

#[async_trait]
impl<S> FromRequestParts<S> for Credential
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let query = Query::<TokenQuery>::from_request_parts(parts, state)
            .await
            .map(|Query(q)| q)
            .unwrap_or_default();
        Ok(Credential(extract_token(&parts.headers, query.token.as_deref())))
    }
}
