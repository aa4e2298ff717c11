//! JWT (JSON Web Token) handling

use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JWT claims identifying an API caller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    /// Subject (user id, matched against domain owners and delegations)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// Mailbox S/MIME certificates are issued for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl JwtClaims {
    pub fn new(user: String, issuer: String, audience: String, validity: Duration) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: user,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: issuer,
            aud: audience,
            email: None,
            name: None,
        }
    }

    pub fn with_email(mut self, email: String) -> Self {
        self.email = Some(email);
        self
    }

    pub fn with_name(mut self, name: String) -> Self {
        self.name = Some(name);
        self
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    pub fn exp_formatted(&self) -> String {
        use chrono::DateTime;
        let dt = DateTime::<Utc>::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now);
        dt.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    }
}

/// Who is calling, as far as the services are concerned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

impl From<JwtClaims> for Identity {
    fn from(claims: JwtClaims) -> Self {
        Self {
            user: claims.sub,
            email: claims.email,
            name: claims.name,
        }
    }
}

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Missing bearer token")]
    MissingToken,
}

/// Token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: &str) -> Result<&str, JwtError> {
    let (scheme, token) = header.trim().split_once(' ').ok_or(JwtError::MissingToken)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(JwtError::MissingToken);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(JwtError::MissingToken);
    }
    Ok(token)
}

/// JWT validator
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Create a new JWT validator using HMAC-SHA256 (symmetric secret)
    ///
    /// Validates the signature and expiration. Issuer and audience are only
    /// checked once set with [`with_issuer`](Self::with_issuer) and
    /// [`with_audience`](Self::with_audience).
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn with_audience(mut self, audience: String) -> Self {
        self.validation.set_audience(&[audience]);
        self
    }

    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn validate(&self, token: &str) -> Result<JwtClaims, JwtError> {
        let token_data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => JwtError::TokenExpired,
                ErrorKind::InvalidToken
                | ErrorKind::InvalidSignature
                | ErrorKind::InvalidIssuer
                | ErrorKind::InvalidAudience
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => JwtError::InvalidToken,
                _ => JwtError::EncodingError(e),
            })?;

        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }
        if token_data.claims.sub.trim().is_empty() {
            return Err(JwtError::InvalidToken);
        }

        Ok(token_data.claims)
    }

    /// Validate a raw `Authorization` header value
    pub fn identify(&self, authorization: &str) -> Result<Identity, JwtError> {
        let token = bearer_token(authorization)?;
        Ok(self.validate(token)?.into())
    }

    /// Encode JWT using HMAC-SHA256 (symmetric secret)
    pub fn encode(secret: &[u8], claims: &JwtClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &[u8] = b"test_secret_key_1234567890";

    fn claims(validity: Duration) -> JwtClaims {
        JwtClaims::new(
            "alice".to_string(),
            "certbroker".to_string(),
            "certbroker-api".to_string(),
            validity,
        )
    }

    #[test]
    fn test_jwt_encode_decode() {
        let claims = claims(Duration::hours(1)).with_email("alice@example.com".to_string());
        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();

        let validator = JwtValidator::new(TEST_SECRET)
            .with_issuer("certbroker".to_string())
            .with_audience("certbroker-api".to_string());

        let decoded = validator.validate(&token).unwrap();
        assert_eq!(decoded, claims);
    }

    #[test]
    fn test_expired_token() {
        // Past the default 60s leeway
        let claims = claims(Duration::seconds(-120));
        assert!(claims.is_expired());

        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();
        let result = JwtValidator::new(TEST_SECRET).validate(&token);
        assert!(matches!(result, Err(JwtError::TokenExpired)));
    }

    #[test]
    fn test_wrong_secret_and_issuer() {
        let token = JwtValidator::encode(TEST_SECRET, &claims(Duration::hours(1))).unwrap();

        let result = JwtValidator::new(b"another_secret").validate(&token);
        assert!(matches!(result, Err(JwtError::InvalidToken)));

        let result = JwtValidator::new(TEST_SECRET)
            .with_issuer("someone-else".to_string())
            .validate(&token);
        assert!(matches!(result, Err(JwtError::InvalidToken)));

        assert!(matches!(
            JwtValidator::new(TEST_SECRET).validate("not.a.jwt"),
            Err(JwtError::InvalidToken)
        ));
    }

    #[test]
    fn test_identify_from_header() {
        let claims = claims(Duration::hours(1)).with_name("Alice Example".to_string());
        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();
        let validator = JwtValidator::new(TEST_SECRET);

        let identity = validator.identify(&format!("Bearer {}", token)).unwrap();
        assert_eq!(identity.user, "alice");
        assert_eq!(identity.email, None);
        assert_eq!(identity.name.as_deref(), Some("Alice Example"));

        assert!(matches!(validator.identify(&token), Err(JwtError::MissingToken)));
        assert!(matches!(validator.identify("Basic abc"), Err(JwtError::MissingToken)));
        assert!(matches!(validator.identify("Bearer   "), Err(JwtError::MissingToken)));
    }
}
