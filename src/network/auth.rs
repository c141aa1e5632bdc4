//! Lobby Admission
//!
//! The human-verification gate lives outside this node. It hands admitted
//! peers a signed JWT; we only check that token. With no key configured the
//! lobby is open.

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Admission configuration.
#[derive(Clone, Debug, Default)]
pub struct AdmissionConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format.
    pub public_key_pem: Option<String>,
    /// HS256 shared secret.
    pub secret: Option<String>,
    /// Our own token, presented to peers we connect to.
    pub token: Option<String>,
}

impl AdmissionConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("ADMISSION_ISSUER").ok(),
            audience: std::env::var("ADMISSION_AUDIENCE").ok(),
            public_key_pem: std::env::var("ADMISSION_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("ADMISSION_SECRET").ok(),
            token: std::env::var("ADMISSION_TOKEN").ok(),
        }
    }

    /// Inbound peers must present a token.
    pub fn is_enforced(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }

    /// Admit or refuse a peer presenting `token`.
    pub fn admit(&self, token: Option<&str>) -> Result<Option<AdmissionClaims>, AdmissionError> {
        if !self.is_enforced() {
            return Ok(None);
        }
        let token = token.ok_or(AdmissionError::MissingToken)?;
        validate_token(token, self).map(Some)
    }
}

/// Claims issued by the admission gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionClaims {
    /// Opaque subject from the gate.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

/// Admission errors.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Admission is enforced but no token was presented.
    #[error("admission token required")]
    MissingToken,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience claim doesn't match expected value.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Validate an admission token and extract its claims.
pub fn validate_token(token: &str, config: &AdmissionConfig) -> Result<AdmissionClaims, AdmissionError> {
    let algorithm = if config.public_key_pem.is_some() {
        Algorithm::RS256
    } else {
        Algorithm::HS256
    };

    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims = std::collections::HashSet::new();

    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }
    if let Some(ref audience) = config.audience {
        validation.set_audience(&[audience]);
    } else {
        validation.validate_aud = false;
    }

    let token_data: TokenData<AdmissionClaims> = if let Some(ref pem) = config.public_key_pem {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AdmissionError::DecodeError(format!("invalid public key: {}", e)))?;
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else if let Some(ref secret) = config.secret {
        let key = DecodingKey::from_secret(secret.as_bytes());
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else {
        return Err(AdmissionError::DecodeError("no admission key configured".into()));
    };

    let claims = token_data.claims;
    if claims.sub.is_empty() {
        return Err(AdmissionError::MissingClaim("sub".into()));
    }

    // Tokens without exp pass library validation; check ours explicitly
    if claims.exp > 0 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now > claims.exp {
            return Err(AdmissionError::Expired);
        }
    }

    Ok(claims)
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AdmissionError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AdmissionError::Expired,
        ErrorKind::InvalidSignature => AdmissionError::InvalidSignature,
        ErrorKind::InvalidIssuer => AdmissionError::InvalidIssuer,
        ErrorKind::InvalidAudience => AdmissionError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AdmissionError::InvalidFormat,
        _ => AdmissionError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "lobby-secret-key-256-bits-long!!";

    fn issue(claims: &AdmissionClaims, secret: &str) -> String {
        let key = EncodingKey::from_secret(secret.as_bytes());
        encode(&Header::new(Algorithm::HS256), claims, &key).unwrap()
    }

    fn claims() -> AdmissionClaims {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        AdmissionClaims {
            sub: "verified-human-42".into(),
            exp: now + 3600,
            iat: now,
            iss: Some("gate".into()),
            aud: Some(serde_json::json!("footsteps")),
        }
    }

    fn enforced() -> AdmissionConfig {
        AdmissionConfig { secret: Some(SECRET.into()), ..Default::default() }
    }

    #[test]
    fn test_open_lobby() {
        let config = AdmissionConfig::default();
        assert!(!config.is_enforced());
        assert!(config.admit(None).unwrap().is_none());
    }

    #[test]
    fn test_valid_token_admitted() {
        let token = issue(&claims(), SECRET);
        let admitted = enforced().admit(Some(&token)).unwrap().unwrap();
        assert_eq!(admitted.sub, "verified-human-42");
    }

    #[test]
    fn test_missing_token_refused() {
        assert!(matches!(enforced().admit(None), Err(AdmissionError::MissingToken)));
    }

    #[test]
    fn test_wrong_secret_refused() {
        let token = issue(&claims(), "some-other-secret-entirely-here!");
        assert!(matches!(enforced().admit(Some(&token)), Err(AdmissionError::InvalidSignature)));
    }

    #[test]
    fn test_expired_refused() {
        let mut expired = claims();
        expired.exp = 1;
        let token = issue(&expired, SECRET);
        assert!(matches!(enforced().admit(Some(&token)), Err(AdmissionError::Expired)));
    }

    #[test]
    fn test_issuer_and_audience() {
        let token = issue(&claims(), SECRET);
        let wrong_iss = AdmissionConfig { issuer: Some("elsewhere".into()), ..enforced() };
        assert!(matches!(wrong_iss.admit(Some(&token)), Err(AdmissionError::InvalidIssuer)));

        let right = AdmissionConfig {
            issuer: Some("gate".into()),
            audience: Some("footsteps".into()),
            ..enforced()
        };
        assert!(right.admit(Some(&token)).is_ok());
    }

    #[test]
    fn test_garbage_token() {
        assert!(enforced().admit(Some("not-a-jwt")).is_err());
    }
}
