//! Caller identity.
//!
//! Tokens are issued elsewhere; this service only verifies HS256 bearer tokens and
//! reads guests' `x-session-id` header.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts, HeaderMap},
};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{errors::ServiceError, services::cart::CartOwner};

pub const SESSION_HEADER: &str = "x-session-id";
pub const MAX_SESSION_ID_LEN: usize = 128;
pub const ADMIN_ROLE: &str = "admin";

/// Claim structure for JWT tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
}

/// Verifies bearer tokens against the shared secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, ServiceError> {
        let claims = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => {
                    ServiceError::Unauthorized("token expired".to_string())
                }
                _ => ServiceError::Unauthorized("invalid token".to_string()),
            })?
            .claims;

        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| ServiceError::Unauthorized("invalid token subject".to_string()))?;
        Ok(AuthUser {
            user_id,
            email: claims.email,
            name: claims.name,
            roles: claims.roles,
        })
    }
}

/// Authenticated user data extracted from the JWT token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub name: Option<String>,
    pub roles: Vec<String>,
}

impl AuthUser {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>, ServiceError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| ServiceError::Unauthorized("malformed authorization header".to_string()))?;
    value
        .strip_prefix("Bearer ")
        .map(|token| Some(token.trim()))
        .ok_or_else(|| ServiceError::Unauthorized("expected a bearer token".to_string()))
}

/// Validates a guest session id.
pub fn parse_session_id(raw: &str) -> Result<String, ServiceError> {
    let session_id = raw.trim();
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
        return Err(ServiceError::ValidationError(format!(
            "{} must be 1 to {} characters",
            SESSION_HEADER, MAX_SESSION_ID_LEN
        )));
    }
    Ok(session_id.to_string())
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<JwtVerifier>: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?
            .ok_or_else(|| ServiceError::Unauthorized("missing bearer token".to_string()))?;
        Arc::<JwtVerifier>::from_ref(state).verify(token)
    }
}

/// An authenticated caller holding the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

#[async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
    Arc<JwtVerifier>: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(ServiceError::Forbidden("admin role required".to_string()));
        }
        Ok(AdminUser(user))
    }
}

/// Owner of the cart a request operates on: the bearer token's user when one is
/// presented, otherwise the guest session.
#[derive(Debug, Clone)]
pub struct CartCaller(pub CartOwner);

#[async_trait]
impl<S> FromRequestParts<S> for CartCaller
where
    S: Send + Sync,
    Arc<JwtVerifier>: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(token) = bearer_token(&parts.headers)? {
            let user = Arc::<JwtVerifier>::from_ref(state).verify(token)?;
            return Ok(CartCaller(CartOwner::User(user.user_id)));
        }

        let session_id = session_from_headers(&parts.headers)?.ok_or_else(|| {
            ServiceError::Unauthorized(format!(
                "bearer token or {} header required",
                SESSION_HEADER
            ))
        })?;
        Ok(CartCaller(CartOwner::Session(session_id)))
    }
}

/// The guest session presented on the request, if any.
pub fn session_from_headers(headers: &HeaderMap) -> Result<Option<String>, ServiceError> {
    headers
        .get(SESSION_HEADER)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| {
                    ServiceError::ValidationError(format!("{} must be ASCII", SESSION_HEADER))
                })
                .and_then(parse_session_id)
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "unit-test-secret-unit-test-secret-0001";

    fn token(sub: &str, roles: &[&str], ttl: Duration) -> String {
        let now = Utc::now();
        let claims = Claims {
            sub: sub.to_string(),
            email: Some("buyer@example.com".into()),
            name: Some("Buyer".into()),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn verifies_valid_token() {
        let id = Uuid::new_v4();
        let user = JwtVerifier::new(SECRET)
            .verify(&token(&id.to_string(), &["Admin"], Duration::hours(1)))
            .unwrap();

        assert_eq!(user.user_id, id);
        assert_eq!(user.email.as_deref(), Some("buyer@example.com"));
        assert!(user.is_admin());
    }

    #[test]
    fn rejects_expired_foreign_or_malformed_tokens() {
        let verifier = JwtVerifier::new(SECRET);
        let id = Uuid::new_v4().to_string();

        assert_matches!(
            verifier.verify(&token(&id, &[], Duration::hours(-2))),
            Err(ServiceError::Unauthorized(msg)) if msg == "token expired"
        );
        assert_matches!(
            JwtVerifier::new("another-secret-another-secret-0000").verify(&token(
                &id,
                &[],
                Duration::hours(1)
            )),
            Err(ServiceError::Unauthorized(_))
        );
        assert_matches!(
            verifier.verify(&token("not-a-uuid", &[], Duration::hours(1))),
            Err(ServiceError::Unauthorized(_))
        );
    }

    #[test]
    fn session_ids_are_bounded() {
        assert_eq!(parse_session_id("  guest-1 ").unwrap(), "guest-1");
        assert!(parse_session_id("   ").is_err());
        assert!(parse_session_id(&"x".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
    }

    #[test]
    fn session_header_is_optional_but_validated() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_from_headers(&headers).unwrap(), None);

        headers.insert(SESSION_HEADER, "guest-7".parse().unwrap());
        assert_eq!(session_from_headers(&headers).unwrap().as_deref(), Some("guest-7"));

        headers.insert(SESSION_HEADER, " ".parse().unwrap());
        assert_matches!(
            session_from_headers(&headers),
            Err(ServiceError::ValidationError(_))
        );
    }
}
