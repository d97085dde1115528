//! Authorization collaborator
//!
//! The broker evaluates authorization per target before dispatch; a
//! failure is final and never triggers failover. The default authenticator
//! allows everything, the JWT authenticator validates a bearer token
//! carried in a request attribute.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::{
    config::{Auth, AuthMode},
    core::error::{ServiceError, ServiceResult},
    wire::ParamMap,
};

/// Authenticated caller identity.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate a request from its attributes and payload bytes.
    async fn authenticate(&self, attributes: &ParamMap, payload: &[u8])
        -> ServiceResult<Principal>;
}

/// Build the authenticator selected by configuration.
pub fn build_authenticator(config: &Auth) -> ServiceResult<Arc<dyn Authenticator>> {
    match config.mode {
        AuthMode::AllowAll => Ok(Arc::new(AllowAll)),
        AuthMode::Jwt => {
            let secret = config.secret.as_deref().ok_or_else(|| {
                ServiceError::Configuration("jwt auth requires a secret".to_string())
            })?;
            let key: Vec<u8> = if config.base64_secret {
                general_purpose::STANDARD.decode(secret).map_err(|e| {
                    ServiceError::Configuration(format!("invalid base64 secret: {e}"))
                })?
            } else {
                secret.as_bytes().to_vec()
            };
            Ok(Arc::new(JwtAuthenticator::new(
                &key,
                config.attribute.clone(),
            )))
        }
    }
}

/// Pass-through authenticator for deployments without an auth collaborator.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(
        &self,
        _attributes: &ParamMap,
        _payload: &[u8],
    ) -> ServiceResult<Principal> {
        Ok(Principal {
            subject: "anonymous".to_string(),
        })
    }
}

/// Validates an HS256 bearer token from the configured attribute.
/// A leading "Bearer " prefix is stripped before validation.
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
    attribute: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    #[allow(dead_code)]
    exp: Option<u64>,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8], attribute: String) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            attribute,
        }
    }

    fn extract_token<'a>(&self, attributes: &'a ParamMap) -> Option<&'a str> {
        let value = attributes.get(&self.attribute)?.first()?;
        let token = value.strip_prefix("Bearer ").unwrap_or(value);
        Some(token.trim())
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(
        &self,
        attributes: &ParamMap,
        _payload: &[u8],
    ) -> ServiceResult<Principal> {
        let token = self.extract_token(attributes).ok_or_else(|| {
            ServiceError::Unauthorized(format!("missing '{}' attribute", self.attribute))
        })?;
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| ServiceError::Unauthorized(format!("invalid token: {e}")))?;
        Ok(Principal {
            subject: data.claims.sub.unwrap_or_else(|| "anonymous".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
    }

    fn token(secret: &str) -> String {
        encode(
            &Header::default(),
            &TestClaims {
                sub: "alice".to_string(),
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn attributes(token: &str) -> ParamMap {
        let mut map = ParamMap::new();
        map.insert(
            "authorization".to_string(),
            vec![format!("Bearer {token}")],
        );
        map
    }

    #[tokio::test]
    async fn allow_all_always_passes() {
        let principal = AllowAll
            .authenticate(&ParamMap::new(), b"payload")
            .await
            .unwrap();
        assert_eq!(principal.subject, "anonymous");
    }

    #[tokio::test]
    async fn jwt_accepts_valid_and_rejects_bad_tokens() {
        let auth = JwtAuthenticator::new(b"s3cret", "authorization".to_string());

        let principal = auth
            .authenticate(&attributes(&token("s3cret")), b"")
            .await
            .unwrap();
        assert_eq!(principal.subject, "alice");

        let err = auth
            .authenticate(&attributes(&token("other")), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(_)));

        let err = auth.authenticate(&ParamMap::new(), b"").await.unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn base64_secret_decodes_before_use() {
        let config = Auth {
            mode: AuthMode::Jwt,
            secret: Some(general_purpose::STANDARD.encode("s3cret")),
            base64_secret: true,
            attribute: "authorization".to_string(),
        };
        let auth = build_authenticator(&config).unwrap();
        let principal = auth
            .authenticate(&attributes(&token("s3cret")), b"")
            .await
            .unwrap();
        assert_eq!(principal.subject, "alice");
    }
}
