//! Environment variable loading for configuration

use std::env;
use std::path::Path;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use url::Url;

use super::builder::ConfigBuilder;
use crate::error::{Error, Result};

/// Environment variable names
mod vars {
    pub const ADMIN_ROLE: &str = "ROWGUARD_ADMIN_ROLE";
    pub const JWT_ALGORITHM: &str = "ROWGUARD_JWT_ALGORITHM";
    pub const PRIVATE_KEY_PATH: &str = "ROWGUARD_PRIVATE_KEY_PATH";
    pub const PUBLIC_KEY_PATH: &str = "ROWGUARD_PUBLIC_KEY_PATH";
    pub const HS_SECRET: &str = "ROWGUARD_HS_SECRET";
    pub const JWKS_URI: &str = "ROWGUARD_JWKS_URI";
    pub const ISSUER: &str = "ROWGUARD_ISSUER";
    pub const TOKEN_EXPIRES_IN_SECS: &str = "ROWGUARD_TOKEN_EXPIRES_IN_SECS";
    pub const STEP_UP_EXPIRES_IN_SECS: &str = "ROWGUARD_STEP_UP_EXPIRES_IN_SECS";
    pub const JWKS_REFRESH_INTERVAL_SECS: &str = "ROWGUARD_JWKS_REFRESH_INTERVAL_SECS";
    pub const RUST_LOG: &str = "RUST_LOG";
    pub const JSON_LOGS: &str = "ROWGUARD_JSON_LOGS";
}

/// Load configuration from environment variables
pub fn load_from_env(mut builder: ConfigBuilder) -> Result<ConfigBuilder> {
    if let Ok(role) = env::var(vars::ADMIN_ROLE) {
        builder = builder.admin_role(role);
    }

    if let Ok(alg) = env::var(vars::JWT_ALGORITHM) {
        builder = builder.algorithm(parse_algorithm(&alg)?);
    }

    if let Ok(path) = env::var(vars::PRIVATE_KEY_PATH) {
        builder = builder.private_key_pem(read_pem(Path::new(&path))?);
    }

    if let Ok(path) = env::var(vars::PUBLIC_KEY_PATH) {
        builder = builder.public_key_pem(read_pem(Path::new(&path))?);
    }

    if let Ok(secret) = env::var(vars::HS_SECRET) {
        builder = builder.hs_secret(secret);
    }

    if let Ok(uri) = env::var(vars::JWKS_URI) {
        let uri = Url::parse(&uri)
            .map_err(|e| Error::Config(format!("Invalid {}: {}", vars::JWKS_URI, e)))?;
        builder = builder.jwks_uri(uri);
    }

    if let Ok(issuer) = env::var(vars::ISSUER) {
        builder = builder.issuer(issuer);
    }

    if let Ok(secs) = env::var(vars::TOKEN_EXPIRES_IN_SECS)
        && let Ok(secs) = secs.parse::<u64>()
    {
        builder = builder.token_expires_in(Duration::from_secs(secs));
    }

    if let Ok(secs) = env::var(vars::STEP_UP_EXPIRES_IN_SECS)
        && let Ok(secs) = secs.parse::<u64>()
    {
        builder = builder.step_up_expires_in(Duration::from_secs(secs));
    }

    if let Ok(secs) = env::var(vars::JWKS_REFRESH_INTERVAL_SECS)
        && let Ok(secs) = secs.parse::<u64>()
    {
        builder = builder.jwks_refresh_interval(Duration::from_secs(secs));
    }

    if let Ok(level) = env::var(vars::RUST_LOG) {
        builder = builder.log_level(level);
    }

    if let Ok(val) = env::var(vars::JSON_LOGS) {
        builder = builder.json_logs(parse_bool(&val));
    }

    Ok(builder)
}

pub(super) fn parse_algorithm(s: &str) -> Result<Algorithm> {
    let trimmed = s.trim();
    trimmed
        .parse::<Algorithm>()
        .or_else(|_| trimmed.to_uppercase().parse::<Algorithm>())
        .map_err(|_| Error::Config(format!("Unsupported JWT algorithm: {s}")))
}

pub(super) fn read_pem(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read key file {}: {}", path.display(), e))
    })
}

fn parse_bool(s: &str) -> bool {
    matches!(s.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Mutex;

    use super::*;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        vars::ADMIN_ROLE,
        vars::JWT_ALGORITHM,
        vars::PRIVATE_KEY_PATH,
        vars::PUBLIC_KEY_PATH,
        vars::HS_SECRET,
        vars::JWKS_URI,
        vars::ISSUER,
        vars::TOKEN_EXPIRES_IN_SECS,
        vars::STEP_UP_EXPIRES_IN_SECS,
        vars::JWKS_REFRESH_INTERVAL_SECS,
        vars::JSON_LOGS,
    ];

    fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = ENV_MUTEX.lock().unwrap();

        let old_values: Vec<_> = ALL_VARS.iter().map(|k| (*k, env::var(k).ok())).collect();

        for key in ALL_VARS {
            // SAFETY: We hold a mutex lock to ensure no concurrent modifications
            unsafe { env::remove_var(key) };
        }
        for (key, value) in vars {
            // SAFETY: We hold a mutex lock to ensure no concurrent modifications
            unsafe { env::set_var(key, value) };
        }

        let result = f();

        for (key, old_value) in old_values {
            match old_value {
                // SAFETY: We hold a mutex lock to ensure no concurrent modifications
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        result
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("1"));
        assert!(parse_bool("yes"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!(parse_algorithm("es256").unwrap(), Algorithm::ES256);
        assert_eq!(parse_algorithm(" RS256 ").unwrap(), Algorithm::RS256);
        assert!(parse_algorithm("none").unwrap_err().is_config());
    }

    #[test]
    fn test_load_from_env_values() {
        with_env_vars(
            &[
                (vars::ADMIN_ROLE, "ROOT"),
                (vars::JWT_ALGORITHM, "HS256"),
                (vars::HS_SECRET, "secret"),
                (vars::ISSUER, "https://issuer.example.com"),
                (vars::TOKEN_EXPIRES_IN_SECS, "120"),
                (vars::STEP_UP_EXPIRES_IN_SECS, "45"),
                (vars::JWKS_REFRESH_INTERVAL_SECS, "90"),
                (vars::JSON_LOGS, "yes"),
            ],
            || {
                let config = load_from_env(ConfigBuilder::new()).unwrap().build().unwrap();
                assert_eq!(config.admin_role(), "ROOT");
                assert_eq!(config.token.algorithm, Algorithm::HS256);
                assert_eq!(config.token.expires_in, Duration::from_secs(120));
                assert_eq!(config.token.step_up_expires_in, Duration::from_secs(45));
                assert_eq!(config.token.jwks_refresh_interval, Duration::from_secs(90));
                assert!(config.telemetry.json_logs);
            },
        );
    }

    #[test]
    fn test_load_key_paths() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "-----BEGIN PUBLIC KEY-----").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        with_env_vars(&[(vars::PUBLIC_KEY_PATH, &path)], || {
            let config = load_from_env(ConfigBuilder::new()).unwrap().build().unwrap();
            assert_eq!(
                config.token.public_key_pem.as_deref(),
                Some("-----BEGIN PUBLIC KEY-----")
            );
        });
    }

    #[test]
    fn test_missing_key_file_is_config_error() {
        with_env_vars(&[(vars::PRIVATE_KEY_PATH, "/nonexistent/key.pem")], || {
            let err = load_from_env(ConfigBuilder::new()).unwrap_err();
            assert!(err.is_config());
        });
    }

    #[test]
    fn test_invalid_jwks_uri() {
        with_env_vars(&[(vars::JWKS_URI, "not a url")], || {
            assert!(load_from_env(ConfigBuilder::new()).is_err());
        });
    }
}
