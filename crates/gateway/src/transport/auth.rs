// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Bearer credential validation for the WebSocket upgrade (§4.1: "validates
//! bearer credentials"). Token issuance lives outside the core; this only
//! verifies a JWT signed by that external collaborator.

use fabric_core::ids::UserId;
use jsonwebtoken::{DecodingKey, Validation};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: uuid::Uuid,
    exp: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    Missing,
    Malformed,
    Expired,
    InvalidSignature,
}

/// Validates `token` against the configured public key, returning the
/// authenticated user id on success.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn from_pem(pem: &[u8]) -> anyhow::Result<Self> {
        let key = DecodingKey::from_rsa_pem(pem)?;
        let validation = Validation::new(jsonwebtoken::Algorithm::RS256);
        Ok(Self { key, validation })
    }

    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                _ => AuthError::Malformed,
            },
        )?;
        Ok(UserId::from(data.claims.sub))
    }
}

/// Extract the bearer token from a WebSocket upgrade query string
/// (`?token=...`), mirroring how the session layer pulls the device id
/// from the same query.
pub fn extract_query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    let prefix = format!("{key}=");
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix(prefix.as_str()))
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
