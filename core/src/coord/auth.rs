//! Relay bearer tokens - HMAC-signed claims binding a name to a mesh IP
//!
//! Compact three-segment format (`header.payload.signature`, base64url
//! without padding), HMAC-SHA-256 over the first two segments with the
//! server's shared secret. Tokens live 24 hours; with that lifetime no
//! explicit clock-skew allowance is needed.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Token lifetime.
pub const TOKEN_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

const ISSUER: &str = "tunnelmesh";

/// Claims carried by a relay token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub peer_name: String,
    pub mesh_ip: String,
    /// Issued-at, Unix seconds.
    pub iat: i64,
    /// Expiry, Unix seconds.
    pub exp: i64,
    pub iss: String,
}

/// Token validation error types.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("unexpected issuer {0:?}")]
    WrongIssuer(String),
}

/// Issues and validates relay tokens with a shared secret.
pub struct TokenAuthority {
    secret: Vec<u8>,
}

impl TokenAuthority {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        TokenAuthority {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Issue a token for a registered peer.
    pub fn issue(&self, peer_name: &str, mesh_ip: &str) -> String {
        let now = unix_now();
        let claims = TokenClaims {
            peer_name: peer_name.to_string(),
            mesh_ip: mesh_ip.to_string(),
            iat: now,
            exp: now + TOKEN_EXPIRY.as_secs() as i64,
            iss: ISSUER.to_string(),
        };
        self.issue_claims(&claims)
    }

    fn issue_claims(&self, claims: &TokenClaims) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims serialize"));

        let signing_input = format!("{}.{}", header, payload);
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(signing_input.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        format!("{}.{}", signing_input, sig)
    }

    /// Validate a token: signature first, then expiry and issuer.
    pub fn validate(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let mut parts = token.split('.');
        let (header, payload, sig) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(h), Some(p), Some(s), None) => (h, p, s),
            _ => return Err(TokenError::Malformed),
        };

        let signing_input = format!("{}.{}", header, payload);
        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| TokenError::Malformed)?;

        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&sig_bytes)
            .map_err(|_| TokenError::BadSignature)?;

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Malformed)?;
        let claims: TokenClaims =
            serde_json::from_slice(&payload_bytes).map_err(|_| TokenError::Malformed)?;

        if claims.iss != ISSUER {
            return Err(TokenError::WrongIssuer(claims.iss));
        }
        if unix_now() > claims.exp {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ============================================================================
// TESTS
// ============================================================================
