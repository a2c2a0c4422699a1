//! Bearer credential validation
//!
//! Converts an `Authorization: Bearer <jwt>` header into typed
//! [`IdentityClaims`]. Only the HMAC family (HS256/HS384/HS512) is accepted;
//! the algorithm named in the token header is checked before any signature
//! work so that algorithm-confusion tokens are refused outright.
//!
//! The middleware in this module inserts the claims into the request
//! extensions, where the admission middleware and the forwarder pick them up.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, errors::ErrorKind};
use serde::Deserialize;
use tracing::{debug, warn};

use super::router::AppState;
use crate::error::GatewayError;

/// Verified facts about the caller, extracted from a signed credential
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdentityClaims {
    /// Subject (user) id
    #[serde(rename = "id")]
    pub subject_id: i64,
    /// Email address
    pub email: String,
    /// Display name
    pub name: String,
    /// Expiry (Unix seconds)
    #[serde(rename = "exp")]
    pub expires_at: u64,
}

/// Credential validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Header absent or not of the form `Bearer <token>`
    #[error("Authorization header is missing")]
    MissingCredential,

    /// Token header names a non-HMAC algorithm
    #[error("unexpected signing method: {0}")]
    UnexpectedSigningMethod(String),

    /// Signature, structure, or expiry check failed
    #[error("{0}")]
    InvalidToken(String),

    /// Required claim missing or of the wrong type
    #[error("{0}")]
    MalformedClaims(String),
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredential => Self::MissingCredential,
            AuthError::UnexpectedSigningMethod(alg) => Self::UnexpectedSigningMethod(alg),
            AuthError::InvalidToken(reason) => Self::InvalidToken(reason),
            AuthError::MalformedClaims(reason) => Self::MalformedClaims(reason),
        }
    }
}

/// Only the `alg` field of the JOSE header; parsed independently of the JWT
/// library so that algorithms it does not know (e.g. `none`) are still
/// reported as a signing-method error.
#[derive(Deserialize)]
struct RawHeader {
    alg: String,
}

const HMAC_ALGORITHMS: [Algorithm; 3] = [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

/// Verifies HMAC-signed bearer tokens with a process-wide secret
pub struct CredentialValidator {
    key: DecodingKey,
    leeway: Duration,
}

impl std::fmt::Debug for CredentialValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialValidator")
            .field("leeway", &self.leeway)
            .finish_non_exhaustive()
    }
}

impl CredentialValidator {
    /// Create a validator for tokens signed with `secret`
    #[must_use]
    pub fn new(secret: &[u8], leeway: Duration) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            leeway,
        }
    }

    /// Validate a raw `Authorization` header value
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] describing why the credential was refused.
    pub fn validate(&self, authorization: Option<&str>) -> Result<IdentityClaims, AuthError> {
        let token = authorization
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingCredential)?;

        self.validate_token(token)
    }

    /// Validate a bare token (without the `Bearer ` prefix)
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] describing why the token was refused.
    pub fn validate_token(&self, token: &str) -> Result<IdentityClaims, AuthError> {
        let algorithm = signing_algorithm(token)?;

        let mut validation = Validation::new(algorithm);
        validation.algorithms = vec![algorithm];
        validation.leeway = self.leeway.as_secs();
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp"]);

        jsonwebtoken::decode::<IdentityClaims>(token, &self.key, &validation)
            .map(|data| data.claims)
            .map_err(|e| classify(&e))
    }
}

/// Read the `alg` header and make sure it belongs to the HMAC family
fn signing_algorithm(token: &str) -> Result<Algorithm, AuthError> {
    let encoded = token
        .split('.')
        .next()
        .ok_or_else(|| AuthError::InvalidToken("token is empty".to_string()))?;

    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| AuthError::InvalidToken(format!("header is not base64url: {e}")))?;
    let header: RawHeader = serde_json::from_slice(&raw)
        .map_err(|e| AuthError::InvalidToken(format!("header is not valid JSON: {e}")))?;

    HMAC_ALGORITHMS
        .into_iter()
        .find(|alg| format!("{alg:?}") == header.alg)
        .ok_or(AuthError::UnexpectedSigningMethod(header.alg))
}

fn classify(err: &jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
            AuthError::UnexpectedSigningMethod(err.to_string())
        }
        ErrorKind::Json(_) | ErrorKind::MissingRequiredClaim(_) => {
            AuthError::MalformedClaims(err.to_string())
        }
        ErrorKind::ExpiredSignature => AuthError::InvalidToken("token is expired".to_string()),
        ErrorKind::InvalidSignature => {
            AuthError::InvalidToken("signature is invalid".to_string())
        }
        _ => AuthError::InvalidToken(err.to_string()),
    }
}

/// Authentication middleware for protected routes
///
/// On success the verified [`IdentityClaims`] are attached to the request
/// extensions; on failure the request is answered with 401 and never forwarded.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match state.validator.validate(authorization) {
        Ok(claims) => {
            debug!(client = claims.subject_id, path = %request.uri().path(), "Authenticated request");
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %request.uri().path(), error = %e, "Credential rejected");
            GatewayError::from(e).into_response()
        }
    }
}
