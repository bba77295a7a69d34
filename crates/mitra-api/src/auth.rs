use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use uuid::Uuid;

use mitra_gateway::{Actions, Heartbeat};
use mitra_types::api::Claims;
use mitra_types::models::Role;

use crate::error::ApiError;
use crate::storage::Storage;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub actions: Actions,
    pub storage: Storage,
    pub jwt_secret: String,
    /// Externally reachable base URL, used to build attachment links.
    pub public_url: String,
    pub heartbeat: Heartbeat,
}

/// Verify an HS256 token minted by the auth service.
pub fn verify_token(secret: &str, token: &str) -> Result<Claims, ApiError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::Unauthorized)
}

/// Mint a token the way the auth service does. Used by tooling and tests.
pub fn create_token(
    secret: &str,
    user_id: Uuid,
    username: &str,
    role: Role,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        role,
        exp: (Utc::now() + Duration::days(30)).timestamp() as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}
