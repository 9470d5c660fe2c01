//! Configuration builder

use std::time::Duration;

use jsonwebtoken::Algorithm;
use url::Url;

use crate::error::{Error, Result};

/// Administrator role used when none is configured
pub const DEFAULT_ADMIN_ROLE: &str = "ADMINISTRATOR";

const DEFAULT_TOKEN_EXPIRES_IN: Duration = Duration::from_secs(8 * 60 * 60);
const DEFAULT_STEP_UP_EXPIRES_IN: Duration = Duration::from_secs(30 * 60);

/// Engine configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub admin_role: String,
    pub token: TokenConfig,
    pub telemetry: TelemetryConfig,
    admin_role_defaulted: bool,
}

impl AuthConfig {
    #[must_use]
    pub const fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    #[must_use]
    pub fn admin_role(&self) -> &str {
        &self.admin_role
    }

    #[must_use]
    pub const fn token(&self) -> &TokenConfig {
        &self.token
    }

    /// Whether no administrator role was configured and the built-in name is used
    #[must_use]
    pub const fn admin_role_defaulted(&self) -> bool {
        self.admin_role_defaulted
    }

    /// Log settings that silently fell back to defaults.
    ///
    /// Call once the tracing subscriber is installed.
    pub fn warn_on_defaults(&self) {
        if self.admin_role_defaulted {
            tracing::warn!(
                admin_role = %self.admin_role,
                "No administrator role configured, falling back to the built-in name"
            );
        }
    }
}

/// Token signing and verification settings
#[derive(Clone)]
pub struct TokenConfig {
    pub algorithm: Algorithm,
    /// PEM private key for asymmetric signing
    pub private_key_pem: Option<String>,
    /// PEM public key for asymmetric verification
    pub public_key_pem: Option<String>,
    /// HS256/384/512 secret (testing/dev only)
    pub hs_secret: Option<String>,
    /// Remote key set used when no static public key is configured
    pub jwks_uri: Option<Url>,
    pub issuer: Option<String>,
    pub expires_in: Duration,
    pub step_up_expires_in: Duration,
    pub clock_skew: Duration,
    pub jwks_cache_ttl: Duration,
    pub jwks_refresh_interval: Duration,
}

// Key material never shows up in debug output
impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("algorithm", &self.algorithm)
            .field("has_private_key", &self.private_key_pem.is_some())
            .field("has_public_key", &self.public_key_pem.is_some())
            .field("jwks_uri", &self.jwks_uri)
            .field("issuer", &self.issuer)
            .field("expires_in", &self.expires_in)
            .field("step_up_expires_in", &self.step_up_expires_in)
            .field("clock_skew", &self.clock_skew)
            .finish_non_exhaustive()
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::ES256,
            private_key_pem: None,
            public_key_pem: None,
            hs_secret: None,
            jwks_uri: None,
            issuer: None,
            expires_in: DEFAULT_TOKEN_EXPIRES_IN,
            step_up_expires_in: DEFAULT_STEP_UP_EXPIRES_IN,
            clock_skew: Duration::from_secs(60),
            jwks_cache_ttl: Duration::from_secs(3600),
            jwks_refresh_interval: Duration::from_secs(300),
        }
    }
}

impl TokenConfig {
    #[must_use]
    pub const fn is_symmetric(&self) -> bool {
        matches!(
            self.algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        )
    }

    #[must_use]
    pub const fn can_verify(&self) -> bool {
        if self.is_symmetric() {
            self.hs_secret.is_some()
        } else {
            self.public_key_pem.is_some() || self.jwks_uri.is_some()
        }
    }

    #[must_use]
    pub const fn can_sign(&self) -> bool {
        if self.is_symmetric() {
            self.hs_secret.is_some()
        } else {
            self.private_key_pem.is_some()
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub json_logs: bool,
}

/// Configuration builder with fluent API
#[derive(Debug)]
pub struct ConfigBuilder {
    admin_role: Option<String>,
    token: TokenConfig,
    telemetry: TelemetryConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            admin_role: None,
            token: TokenConfig {
                algorithm: Algorithm::ES256,
                private_key_pem: None,
                public_key_pem: None,
                hs_secret: None,
                jwks_uri: None,
                issuer: None,
                expires_in: DEFAULT_TOKEN_EXPIRES_IN,
                step_up_expires_in: DEFAULT_STEP_UP_EXPIRES_IN,
                clock_skew: Duration::from_secs(60),
                jwks_cache_ttl: Duration::from_secs(3600),
                jwks_refresh_interval: Duration::from_secs(300),
            },
            telemetry: TelemetryConfig {
                log_level: String::new(),
                json_logs: false,
            },
        }
    }

    #[must_use]
    pub fn admin_role(mut self, role: impl Into<String>) -> Self {
        self.admin_role = Some(role.into());
        self
    }

    #[must_use]
    pub const fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.token.algorithm = algorithm;
        self
    }

    #[must_use]
    pub fn private_key_pem(mut self, pem: impl Into<String>) -> Self {
        self.token.private_key_pem = Some(pem.into());
        self
    }

    #[must_use]
    pub fn public_key_pem(mut self, pem: impl Into<String>) -> Self {
        self.token.public_key_pem = Some(pem.into());
        self
    }

    #[must_use]
    pub fn hs_secret(mut self, secret: impl Into<String>) -> Self {
        self.token.hs_secret = Some(secret.into());
        self
    }

    #[must_use]
    pub fn jwks_uri(mut self, uri: Url) -> Self {
        self.token.jwks_uri = Some(uri);
        self
    }

    #[must_use]
    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.token.issuer = Some(issuer.into());
        self
    }

    #[must_use]
    pub const fn token_expires_in(mut self, ttl: Duration) -> Self {
        self.token.expires_in = ttl;
        self
    }

    #[must_use]
    pub const fn step_up_expires_in(mut self, ttl: Duration) -> Self {
        self.token.step_up_expires_in = ttl;
        self
    }

    #[must_use]
    pub const fn clock_skew(mut self, skew: Duration) -> Self {
        self.token.clock_skew = skew;
        self
    }

    #[must_use]
    pub const fn jwks_cache_ttl(mut self, ttl: Duration) -> Self {
        self.token.jwks_cache_ttl = ttl;
        self
    }

    /// Period of the background JWKS refresh task
    #[must_use]
    pub const fn jwks_refresh_interval(mut self, interval: Duration) -> Self {
        self.token.jwks_refresh_interval = interval;
        self
    }

    #[must_use]
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.telemetry.log_level = level.into();
        self
    }

    #[must_use]
    pub const fn json_logs(mut self, enabled: bool) -> Self {
        self.telemetry.json_logs = enabled;
        self
    }

    pub fn build(self) -> Result<AuthConfig> {
        if !self.token.can_verify() {
            return Err(Error::Config(format!(
                "no verification key configured for {:?}: set a public key, JWKS URI or HS secret",
                self.token.algorithm
            )));
        }

        if self.token.jwks_uri.is_some() && !cfg!(feature = "jwks") {
            return Err(Error::Config(
                "JWKS URI configured but the `jwks` feature is disabled".into(),
            ));
        }

        let (admin_role, admin_role_defaulted) = match self.admin_role {
            Some(role) if !role.trim().is_empty() => (role, false),
            _ => (DEFAULT_ADMIN_ROLE.to_string(), true),
        };

        let log_level = if self.telemetry.log_level.is_empty() {
            "info".to_string()
        } else {
            self.telemetry.log_level
        };

        Ok(AuthConfig {
            admin_role,
            admin_role_defaulted,
            token: self.token,
            telemetry: TelemetryConfig {
                log_level,
                json_logs: self.telemetry.json_logs,
            },
        })
    }
}
