//! Authentication settings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Token verification and session settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// JWT algorithm name (`HS256`, `HS384`, `HS512`, `RS256`, `ES256`).
    pub algorithm: String,
    /// Shared secret for HMAC algorithms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// PEM public key for RSA/EC algorithms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_public_key_pem: Option<String>,
    /// Required `iss` claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Required `aud` claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// Protocol versions offered, most preferred first.
    pub supported_versions: Vec<String>,
    /// Upper bound on session lifetime in ms.
    pub session_ttl_ms: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            algorithm: "HS256".to_string(),
            jwt_secret: None,
            jwt_public_key_pem: None,
            issuer: None,
            audience: None,
            supported_versions: vec!["1.0".to_string()],
            session_ttl_ms: 3_600_000,
        }
    }
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("algorithm", &self.algorithm)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("jwt_public_key_pem", &self.jwt_public_key_pem.is_some())
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("supported_versions", &self.supported_versions)
            .field("session_ttl_ms", &self.session_ttl_ms)
            .finish()
    }
}
