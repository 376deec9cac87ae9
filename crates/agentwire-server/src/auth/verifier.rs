//! Bearer token verification.
//!
//! The handshake only depends on [`TokenVerifier`]; [`JwtVerifier`] is the
//! production implementation backed by `jsonwebtoken`.

use std::fmt;
use std::str::FromStr;

use agentwire_settings::AuthSettings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

/// Identity extracted from a valid token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedToken {
    /// User the token was issued to.
    pub subject: String,
    /// Token expiry.
    pub expires_at: DateTime<Utc>,
}

/// Why a token was rejected, or why a verifier could not be built.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Token is past its `exp`.
    #[error("token expired")]
    Expired,
    /// Signature, issuer, audience, or structure is wrong.
    #[error("invalid token: {0}")]
    Invalid(String),
    /// Token carries no usable `sub` claim.
    #[error("token has no subject")]
    MissingSubject,
    /// Configured algorithm name is not recognised.
    #[error("unsupported signing algorithm `{0}`")]
    UnsupportedAlgorithm(String),
    /// Configured key material could not be parsed.
    #[error("invalid verification key: {0}")]
    InvalidKey(String),
    /// No key was configured for the chosen algorithm.
    #[error("no verification key configured for {0}")]
    MissingKey(&'static str),
}

/// Verifies bearer tokens presented in `hello`.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Check signature and expiry; return the token's identity.
    async fn verify(&self, token: &str) -> Result<VerifiedToken, AuthError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    exp: i64,
}

/// JWT verifier with a fixed key and algorithm.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("key", &"<redacted>")
            .field("algorithms", &self.validation.algorithms)
            .field("iss", &self.validation.iss)
            .field("aud", &self.validation.aud)
            .finish_non_exhaustive()
    }
}

impl JwtVerifier {
    /// HMAC verifier (`HS256`/`HS384`/`HS512`) with a shared secret.
    pub fn hmac(secret: &[u8], algorithm: Algorithm) -> Self {
        Self::with_key(DecodingKey::from_secret(secret), algorithm, None, None)
    }

    /// Build a verifier from settings. HMAC algorithms use `jwtSecret`;
    /// RSA, EC, and EdDSA algorithms use `jwtPublicKeyPem`.
    pub fn from_settings(settings: &AuthSettings) -> Result<Self, AuthError> {
        let algorithm = Algorithm::from_str(&settings.algorithm)
            .map_err(|_| AuthError::UnsupportedAlgorithm(settings.algorithm.clone()))?;
        let key = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = settings
                    .jwt_secret
                    .as_deref()
                    .ok_or(AuthError::MissingKey("HMAC"))?;
                DecodingKey::from_secret(secret.as_bytes())
            }
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => DecodingKey::from_rsa_pem(pem(settings, "RSA")?)
                .map_err(|e| AuthError::InvalidKey(e.to_string()))?,
            Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem(settings, "EC")?)
                .map_err(|e| AuthError::InvalidKey(e.to_string()))?,
            Algorithm::EdDSA => DecodingKey::from_ed_pem(pem(settings, "EdDSA")?)
                .map_err(|e| AuthError::InvalidKey(e.to_string()))?,
        };
        Ok(Self::with_key(
            key,
            algorithm,
            settings.issuer.as_deref(),
            settings.audience.as_deref(),
        ))
    }

    fn with_key(
        key: DecodingKey,
        algorithm: Algorithm,
        issuer: Option<&str>,
        audience: Option<&str>,
    ) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        Self { key, validation }
    }
}

fn pem<'a>(settings: &'a AuthSettings, family: &'static str) -> Result<&'a [u8], AuthError> {
    settings
        .jwt_public_key_pem
        .as_deref()
        .map(str::as_bytes)
        .ok_or(AuthError::MissingKey(family))
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            },
        )?;
        let subject = data
            .claims
            .sub
            .filter(|s| !s.trim().is_empty())
            .ok_or(AuthError::MissingSubject)?;
        let expires_at = DateTime::from_timestamp(data.claims.exp, 0)
            .ok_or_else(|| AuthError::Invalid("exp out of range".into()))?;
        Ok(VerifiedToken {
            subject,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    const SECRET: &[u8] = b"test-secret";

    fn sign(claims: &serde_json::Value) -> String {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    fn exp_in(secs: i64) -> i64 {
        Utc::now().timestamp() + secs
    }

    #[tokio::test]
    async fn valid_token_yields_subject_and_expiry() {
        let exp = exp_in(3600);
        let token = sign(&json!({"sub": "user-1", "exp": exp}));
        let verified = JwtVerifier::hmac(SECRET, Algorithm::HS256)
            .verify(&token)
            .await
            .unwrap();
        assert_eq!(verified.subject, "user-1");
        assert_eq!(verified.expires_at.timestamp(), exp);
    }

    #[test]
    fn debug_output_hides_key_material() {
        let settings = AuthSettings {
            jwt_secret: Some("super-secret-value".into()),
            ..AuthSettings::default()
        };
        let verifier = JwtVerifier::from_settings(&settings).unwrap();
        let rendered = format!("{verifier:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("HS256"));
        assert!(!rendered.contains("super-secret-value"));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let token = sign(&json!({"sub": "user-1", "exp": exp_in(-10)}));
        let err = JwtVerifier::hmac(SECRET, Algorithm::HS256)
            .verify(&token)
            .await
            .unwrap_err();
        assert_matches!(err, AuthError::Expired);
    }

    #[tokio::test]
    async fn wrong_secret_is_invalid() {
        let token = sign(&json!({"sub": "user-1", "exp": exp_in(60)}));
        let err = JwtVerifier::hmac(b"other", Algorithm::HS256)
            .verify(&token)
            .await
            .unwrap_err();
        assert_matches!(err, AuthError::Invalid(_));
    }

    #[tokio::test]
    async fn garbage_is_invalid() {
        let err = JwtVerifier::hmac(SECRET, Algorithm::HS256)
            .verify("not-a-jwt")
            .await
            .unwrap_err();
        assert_matches!(err, AuthError::Invalid(_));
    }

    #[tokio::test]
    async fn missing_subject_is_rejected() {
        let token = sign(&json!({"exp": exp_in(60)}));
        let err = JwtVerifier::hmac(SECRET, Algorithm::HS256)
            .verify(&token)
            .await
            .unwrap_err();
        assert_matches!(err, AuthError::MissingSubject);
    }

    #[tokio::test]
    async fn audience_is_enforced_when_configured() {
        let settings = AuthSettings {
            jwt_secret: Some("test-secret".into()),
            audience: Some("agentwire".into()),
            ..AuthSettings::default()
        };
        let verifier = JwtVerifier::from_settings(&settings).unwrap();
        let good = sign(&json!({"sub": "u", "exp": exp_in(60), "aud": "agentwire"}));
        let bad = sign(&json!({"sub": "u", "exp": exp_in(60), "aud": "elsewhere"}));
        assert!(verifier.verify(&good).await.is_ok());
        assert_matches!(verifier.verify(&bad).await, Err(AuthError::Invalid(_)));
    }

    #[test]
    fn from_settings_requires_key() {
        let err = JwtVerifier::from_settings(&AuthSettings::default()).err().unwrap();
        assert_matches!(err, AuthError::MissingKey("HMAC"));

        let settings = AuthSettings {
            algorithm: "RS256".into(),
            ..AuthSettings::default()
        };
        assert_matches!(
            JwtVerifier::from_settings(&settings),
            Err(AuthError::MissingKey("RSA"))
        );
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let settings = AuthSettings {
            algorithm: "none".into(),
            jwt_secret: Some("x".into()),
            ..AuthSettings::default()
        };
        assert_matches!(
            JwtVerifier::from_settings(&settings),
            Err(AuthError::UnsupportedAlgorithm(name)) if name == "none"
        );
    }
}
