// Auth collaborator interface. The ground station never issues tokens;
// it only answers "who is this principal" for bearers minted by the auth
// service, verifiable locally because the HS256 secret is shared.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

use crate::utils::now_epoch_ms;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Principal {
    pub user_id: i64,
    pub is_admin: bool,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, bearer: &str) -> Result<Principal, AuthError>;
}

#[derive(Deserialize)]
struct Claims {
    #[serde(alias = "user_id")]
    sub: serde_json::Value,
    #[serde(default)]
    is_admin: bool,
    #[serde(default)]
    exp: Option<u64>,
}

/// HS256 verifier over the shared `JWT_SECRET`.
pub struct JwtVerifier {
    secret: Vec<u8>,
}

impl JwtVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn check(&self, bearer: &str) -> Result<Principal, AuthError> {
        let mut parts = bearer.split('.');
        let (header, payload, signature) = match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(s)) if parts.next().is_none() => (h, p, s),
            _ => return Err(AuthError::Malformed),
        };

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::Malformed)?;
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::BadSignature)?;
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)?;

        if let Some(exp) = claims.exp {
            if exp.saturating_mul(1000) < now_epoch_ms() {
                return Err(AuthError::Expired);
            }
        }

        let user_id = match &claims.sub {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .ok_or(AuthError::Malformed)?;

        Ok(Principal {
            user_id,
            is_admin: claims.is_admin,
        })
    }
}

#[async_trait]
impl AuthVerifier for JwtVerifier {
    async fn verify(&self, bearer: &str) -> Result<Principal, AuthError> {
        self.check(bearer)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Mint an HS256 token the way the auth collaborator would.
    pub fn mint(secret: &[u8], user_id: i64, is_admin: bool, exp: Option<u64>) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let mut claims = serde_json::json!({ "sub": user_id, "is_admin": is_admin });
        if let Some(exp) = exp {
            claims["exp"] = serde_json::json!(exp);
        }
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{}.{}.{}", header, payload, signature)
    }
}
