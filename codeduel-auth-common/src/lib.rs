use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric user identifier issued by the identity service.
pub type UserId = i32;

#[derive(Clone)]
pub struct AuthSecret(pub String);

impl std::fmt::Debug for AuthSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthSecret(..)")
    }
}

/// Profile claims carried by a player's credential.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Claims {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub role: String,
    pub exp: usize,
}

impl Claims {
    /// Claims for `id`/`username` expiring `hours` from now.
    pub fn new(id: UserId, username: impl Into<String>, hours: i64) -> Self {
        let expiration = chrono::Utc::now()
            .checked_add_signed(chrono::Duration::hours(hours))
            .unwrap_or_else(chrono::Utc::now)
            .timestamp();

        Self {
            id,
            username: username.into(),
            email: String::new(),
            avatar: String::new(),
            role: "user".to_string(),
            exp: expiration.max(0) as usize,
        }
    }
}

pub fn issue_jwt(claims: &Claims, secret: &AuthSecret) -> Result<String, AuthError> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.0.as_ref()),
    )
    .map_err(|e| AuthError::Encoding(e.to_string()))
}

/// Validates signature and expiry of an HS256 token.
pub fn decode_jwt(token: &str, secret: &AuthSecret) -> Result<Claims, AuthError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.0.as_ref()),
        &Validation::default(),
    )
    .map_err(|_| AuthError::InvalidToken)?;

    Ok(token_data.claims)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode token: {0}")]
    Encoding(String),
}
