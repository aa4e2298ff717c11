//! Caller identity for the API: HS256 bearer tokens

pub mod jwt;

pub use jwt::{bearer_token, Identity, JwtClaims, JwtError, JwtValidator};

// Re-export useful types
pub use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Validation};
