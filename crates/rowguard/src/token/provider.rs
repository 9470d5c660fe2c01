//! Token issuing, verification and step-up

#[cfg(feature = "jwks")]
use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode_header};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::claims::JwtClaims;
#[cfg(feature = "jwks")]
use super::jwks::{JwksCache, JwksRefreshTask};
use super::now_epoch_seconds;
use crate::config::TokenConfig;
use crate::context::UserProfile;
use crate::error::{Error, Result};
use crate::mfa::AuthenticationMethod;

const BEARER_PREFIX: &str = "Bearer ";

/// Issues, verifies and steps up signed tokens
pub struct TokenProvider {
    config: TokenConfig,
    encoding_key: Option<EncodingKey>,
    decoding_key: Option<DecodingKey>,
    #[cfg(feature = "jwks")]
    jwks_cache: Option<Arc<JwksCache>>,
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("TokenProvider");
        debug
            .field("algorithm", &self.config.algorithm)
            .field("can_sign", &self.encoding_key.is_some())
            .field("has_static_key", &self.decoding_key.is_some());
        #[cfg(feature = "jwks")]
        debug.field("has_jwks_cache", &self.jwks_cache.is_some());
        debug.finish()
    }
}

impl TokenProvider {
    /// Load key material for the configured algorithm
    pub fn new(config: TokenConfig) -> Result<Self> {
        let (encoding_key, decoding_key) = if config.is_symmetric() {
            let secret = config.hs_secret.as_deref().map(str::as_bytes);
            (
                secret.map(EncodingKey::from_secret),
                secret.map(DecodingKey::from_secret),
            )
        } else {
            let encoding_key = config
                .private_key_pem
                .as_deref()
                .map(|pem| encoding_key_from_pem(config.algorithm, pem))
                .transpose()?;
            let decoding_key = config
                .public_key_pem
                .as_deref()
                .map(|pem| decoding_key_from_pem(config.algorithm, pem))
                .transpose()?;
            (encoding_key, decoding_key)
        };

        #[cfg(feature = "jwks")]
        let jwks_cache = match (&decoding_key, &config.jwks_uri) {
            (None, Some(uri)) => Some(Arc::new(JwksCache::new(
                uri.clone(),
                config.jwks_cache_ttl,
            )?)),
            _ => None,
        };

        Ok(Self {
            config,
            encoding_key,
            decoding_key,
            #[cfg(feature = "jwks")]
            jwks_cache,
        })
    }

    /// Shared JWKS cache, if keys are resolved remotely
    #[cfg(feature = "jwks")]
    #[must_use]
    pub fn jwks_cache(&self) -> Option<Arc<JwksCache>> {
        self.jwks_cache.clone()
    }

    /// Refresh the JWKS cache every `jwks_refresh_interval` until `shutdown`
    /// fires. Returns `None` when verification keys are static.
    pub fn spawn_jwks_refresh(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        #[cfg(feature = "jwks")]
        {
            if let Some(cache) = &self.jwks_cache {
                let interval = self.config.jwks_refresh_interval;
                tracing::debug!(interval = ?interval, "Starting JWKS refresh task");
                return Some(JwksRefreshTask::new(cache.clone(), interval).spawn(shutdown));
            }
        }

        drop(shutdown);
        None
    }

    #[must_use]
    pub const fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Issue a base token after a first factor succeeded
    pub fn generate_token(
        &self,
        user: &UserProfile,
        method: AuthenticationMethod,
    ) -> Result<String> {
        let now = now_epoch_seconds();
        let claims = JwtClaims {
            sub: user.id.clone(),
            iat: now,
            exp: now + ttl_secs(self.config.expires_in),
            amr: vec![method],
            acr: super::Acr::default(),
            username: user.username.clone(),
        };

        tracing::debug!(sub = %claims.sub, method = %method, "Issuing token");
        self.encode_token(&claims)
    }

    /// `claims` with a fresh step-up grant for `method`; `exp` is kept
    #[must_use]
    pub fn step_up_claims(&self, claims: &JwtClaims, method: AuthenticationMethod) -> JwtClaims {
        let now = now_epoch_seconds();
        let mut stepped_up = claims.clone();

        if !stepped_up.amr.contains(&method) {
            stepped_up.amr.push(method);
        }
        stepped_up
            .acr
            .values
            .insert(method, now + ttl_secs(self.config.step_up_expires_in));
        stepped_up.iat = now;
        stepped_up
    }

    /// Re-issue `claims` with a fresh step-up grant for `method`
    pub fn step_up_token(&self, claims: &JwtClaims, method: AuthenticationMethod) -> Result<String> {
        let stepped_up = self.step_up_claims(claims, method);
        tracing::info!(sub = %stepped_up.sub, method = %method, "Stepping up token");
        self.encode_token(&stepped_up)
    }

    /// Verify signature and algorithm, then return the claims
    pub async fn decode_token(&self, raw: &str) -> Result<JwtClaims> {
        let token = raw.strip_prefix(BEARER_PREFIX).unwrap_or(raw).trim();

        let header = decode_header(token)?;
        if header.alg != self.config.algorithm {
            tracing::warn!(
                expected = ?self.config.algorithm,
                actual = ?header.alg,
                "Token algorithm mismatch"
            );
            return Err(Error::Verification);
        }

        let key = self.decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(self.config.algorithm);
        validation.validate_aud = false;
        validation.leeway = self.config.clock_skew.as_secs();
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }

        let data = jsonwebtoken::decode::<JwtClaims>(token, &key, &validation)?;
        Ok(data.claims)
    }

    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey> {
        if let Some(key) = &self.decoding_key {
            return Ok(key.clone());
        }

        #[cfg(feature = "jwks")]
        if let Some(cache) = &self.jwks_cache {
            return cache.get_key(kid, self.config.algorithm).await;
        }

        #[cfg(not(feature = "jwks"))]
        let _ = kid;

        Err(Error::Config("no verification key configured".into()))
    }

    /// Sign `claims` with the configured private key or secret
    pub fn encode_token(&self, claims: &JwtClaims) -> Result<String> {
        let key = self
            .encoding_key
            .as_ref()
            .ok_or_else(|| Error::Config("signing key not configured".into()))?;

        let mut header = Header::new(self.config.algorithm);
        header.typ = Some("JWT".to_string());

        jsonwebtoken::encode(&header, claims, key)
            .map_err(|e| Error::Config(format!("failed to sign token: {e}")))
    }
}

fn ttl_secs(ttl: std::time::Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2)
}

fn encoding_key_from_pem(alg: Algorithm, pem: &str) -> Result<EncodingKey> {
    let bytes = pem.as_bytes();
    let key = match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => EncodingKey::from_rsa_pem(bytes),
        Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(bytes),
        Algorithm::EdDSA => EncodingKey::from_ed_pem(bytes),
        other => {
            return Err(Error::Config(format!(
                "{other:?} does not use a PEM private key"
            )));
        }
    };
    key.map_err(|e| Error::Config(format!("invalid private key: {e}")))
}

fn decoding_key_from_pem(alg: Algorithm, pem: &str) -> Result<DecodingKey> {
    let bytes = pem.as_bytes();
    let key = match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => DecodingKey::from_rsa_pem(bytes),
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(bytes),
        Algorithm::EdDSA => DecodingKey::from_ed_pem(bytes),
        other => {
            return Err(Error::Config(format!(
                "{other:?} does not use a PEM public key"
            )));
        }
    };
    key.map_err(|e| Error::Config(format!("invalid public key: {e}")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    use super::*;

    const SECRET: &str = "test-secret-key-at-least-32-bytes-long";
    const PRIVATE_PEM: &str = include_str!("../../tests/fixtures/es256_private.pem");
    const PUBLIC_PEM: &str = include_str!("../../tests/fixtures/es256_public.pem");
    const OTHER_PUBLIC_PEM: &str = include_str!("../../tests/fixtures/other_public.pem");

    fn hs_provider() -> TokenProvider {
        TokenProvider::new(TokenConfig {
            algorithm: Algorithm::HS256,
            hs_secret: Some(SECRET.to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    fn es_provider() -> TokenProvider {
        TokenProvider::new(TokenConfig {
            algorithm: Algorithm::ES256,
            private_key_pem: Some(PRIVATE_PEM.to_string()),
            public_key_pem: Some(PUBLIC_PEM.to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    fn user() -> UserProfile {
        UserProfile::new("user123", vec!["editor".to_string()]).with_username("ada")
    }

    #[tokio::test]
    async fn test_generate_and_decode_base_token() {
        let provider = es_provider();
        let token = provider
            .generate_token(&user(), AuthenticationMethod::Password)
            .unwrap();

        let claims = provider.decode_token(&token).await.unwrap();
        assert_eq!(claims.sub, "user123");
        assert_eq!(claims.username.as_deref(), Some("ada"));
        assert_eq!(claims.amr, vec![AuthenticationMethod::Password]);
        assert!(claims.acr.values.is_empty());
        assert!(claims.exp > claims.iat);
    }

    #[tokio::test]
    async fn test_decode_accepts_bearer_prefix() {
        let provider = hs_provider();
        let token = provider
            .generate_token(&user(), AuthenticationMethod::MagicLink)
            .unwrap();

        let claims = provider
            .decode_token(&format!("Bearer {token}"))
            .await
            .unwrap();
        assert_eq!(claims.amr, vec![AuthenticationMethod::MagicLink]);
    }

    #[tokio::test]
    async fn test_step_up_extends_amr_and_acr() {
        let provider = es_provider();
        let token = provider
            .generate_token(&user(), AuthenticationMethod::Password)
            .unwrap();
        let base = provider.decode_token(&token).await.unwrap();

        let stepped = provider
            .step_up_token(&base, AuthenticationMethod::OneTimePassword)
            .unwrap();
        let claims = provider.decode_token(&stepped).await.unwrap();

        assert_eq!(
            claims.amr,
            vec![
                AuthenticationMethod::Password,
                AuthenticationMethod::OneTimePassword
            ]
        );
        let expires = claims.acr.values[&AuthenticationMethod::OneTimePassword];
        assert!(expires > now_epoch_seconds());
        assert_eq!(claims.exp, base.exp);
    }

    #[tokio::test]
    async fn test_step_up_keeps_prior_acr_entries() {
        let provider = hs_provider();
        let mut claims = provider
            .decode_token(
                &provider
                    .generate_token(&user(), AuthenticationMethod::Password)
                    .unwrap(),
            )
            .await
            .unwrap();
        // expired grant from an earlier step-up
        claims.acr.values.insert(AuthenticationMethod::Passkey, 1);
        claims.amr.push(AuthenticationMethod::Passkey);

        let stepped = provider
            .step_up_token(&claims, AuthenticationMethod::Passkey)
            .unwrap();
        let claims = provider.decode_token(&stepped).await.unwrap();
        assert_eq!(
            claims
                .amr
                .iter()
                .filter(|m| **m == AuthenticationMethod::Passkey)
                .count(),
            1
        );
        assert!(claims.acr.is_fresh(AuthenticationMethod::Passkey, now_epoch_seconds()));

        let stepped = provider
            .step_up_token(&claims, AuthenticationMethod::OneTimePassword)
            .unwrap();
        let claims = provider.decode_token(&stepped).await.unwrap();
        assert_eq!(claims.acr.values.len(), 2);
    }

    #[tokio::test]
    async fn test_wrong_key_is_verification_failure() {
        let signer = es_provider();
        let verifier = TokenProvider::new(TokenConfig {
            algorithm: Algorithm::ES256,
            public_key_pem: Some(OTHER_PUBLIC_PEM.to_string()),
            ..Default::default()
        })
        .unwrap();

        let token = signer
            .generate_token(&user(), AuthenticationMethod::Password)
            .unwrap();
        let err = verifier.decode_token(&token).await.unwrap_err();
        assert!(err.is_verification());
    }

    #[tokio::test]
    async fn test_algorithm_mismatch_is_verification_failure() {
        let hs_token = hs_provider()
            .generate_token(&user(), AuthenticationMethod::Password)
            .unwrap();
        let err = es_provider().decode_token(&hs_token).await.unwrap_err();
        assert!(err.is_verification());
    }

    #[tokio::test]
    async fn test_malformed_and_expired_tokens() {
        let provider = hs_provider();
        assert!(
            provider
                .decode_token("not.a.valid.token")
                .await
                .unwrap_err()
                .is_verification()
        );

        let expired = encode(
            &Header::new(Algorithm::HS256),
            &json!({"sub": "u1", "iat": 1, "exp": now_epoch_seconds() - 3600}),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(
            provider
                .decode_token(&expired)
                .await
                .unwrap_err()
                .is_verification()
        );

        let malformed_payload = encode(
            &Header::new(Algorithm::HS256),
            &json!({"sub": 42, "iat": 1, "exp": now_epoch_seconds() + 3600}),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(
            provider
                .decode_token(&malformed_payload)
                .await
                .unwrap_err()
                .is_verification()
        );
    }

    #[tokio::test]
    async fn test_issuer_is_enforced() {
        let provider = TokenProvider::new(TokenConfig {
            algorithm: Algorithm::HS256,
            hs_secret: Some(SECRET.to_string()),
            issuer: Some("https://auth.example.com".to_string()),
            ..Default::default()
        })
        .unwrap();

        let token = encode(
            &Header::new(Algorithm::HS256),
            &json!({
                "sub": "u1",
                "iat": 1,
                "exp": now_epoch_seconds() + 3600,
                "iss": "https://evil.example.com"
            }),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(provider.decode_token(&token).await.unwrap_err().is_verification());
    }

    #[test]
    fn test_verify_only_provider_cannot_sign() {
        let provider = TokenProvider::new(TokenConfig {
            algorithm: Algorithm::ES256,
            public_key_pem: Some(PUBLIC_PEM.to_string()),
            ..Default::default()
        })
        .unwrap();

        let err = provider
            .generate_token(&user(), AuthenticationMethod::Password)
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_invalid_pem_is_config_error() {
        let err = TokenProvider::new(TokenConfig {
            algorithm: Algorithm::ES256,
            public_key_pem: Some("not a pem".to_string()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_static_keys_start_no_refresh_task() {
        assert!(
            es_provider()
                .spawn_jwks_refresh(CancellationToken::new())
                .is_none()
        );
    }

    #[cfg(feature = "jwks")]
    #[tokio::test]
    async fn test_jwks_refresh_task_runs_until_shutdown() {
        let provider = TokenProvider::new(TokenConfig {
            algorithm: Algorithm::RS256,
            jwks_uri: Some(url::Url::parse("https://auth.example.com/jwks.json").unwrap()),
            jwks_refresh_interval: Duration::from_secs(60),
            ..Default::default()
        })
        .unwrap();
        assert!(provider.jwks_cache().is_some());

        let shutdown = CancellationToken::new();
        let handle = provider.spawn_jwks_refresh(shutdown.clone()).unwrap();
        assert!(!handle.is_finished());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_step_up_ttl_applied() {
        let provider = TokenProvider::new(TokenConfig {
            algorithm: Algorithm::HS256,
            hs_secret: Some(SECRET.to_string()),
            step_up_expires_in: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(provider.config().step_up_expires_in, Duration::from_secs(5));
        assert_eq!(ttl_secs(Duration::from_secs(5)), 5);
    }
}
