//! TOML configuration file loading

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use super::builder::ConfigBuilder;
use super::env::{parse_algorithm, read_pem};
use crate::error::{Error, Result};

/// Configuration file locations checked in order
const CONFIG_PATHS: &[&str] = &[
    "./rowguard.toml",
    "~/.config/rowguard/config.toml",
    "/etc/rowguard/config.toml",
];

/// Find the first existing configuration file
pub fn find_config_file() -> Option<PathBuf> {
    for path_str in CONFIG_PATHS {
        let path = if path_str.starts_with('~') {
            if let Ok(home) = std::env::var("HOME") {
                PathBuf::from(path_str.replacen('~', &home, 1))
            } else {
                continue;
            }
        } else {
            PathBuf::from(path_str)
        };

        if path.exists() {
            return Some(path);
        }
    }
    None
}

/// Load configuration from a TOML file
pub fn load_from_file(path: &Path, builder: ConfigBuilder) -> Result<ConfigBuilder> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let file_config: FileConfig = toml::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    apply_file_config(builder, file_config, base_dir)
}

fn apply_file_config(
    mut builder: ConfigBuilder,
    config: FileConfig,
    base_dir: &Path,
) -> Result<ConfigBuilder> {
    if let Some(role) = config.admin_role {
        builder = builder.admin_role(role);
    }

    if let Some(token) = config.token {
        if let Some(alg) = token.algorithm {
            builder = builder.algorithm(parse_algorithm(&alg)?);
        }

        if let Some(path) = token.private_key_path {
            builder = builder.private_key_pem(read_pem(&base_dir.join(path))?);
        }

        if let Some(path) = token.public_key_path {
            builder = builder.public_key_pem(read_pem(&base_dir.join(path))?);
        }

        if let Some(uri) = token.jwks_uri {
            let uri = Url::parse(&uri)
                .map_err(|e| Error::Config(format!("Invalid JWKS URI: {e}")))?;
            builder = builder.jwks_uri(uri);
        }

        if let Some(issuer) = token.issuer {
            builder = builder.issuer(issuer);
        }

        if let Some(secs) = token.expires_in_secs {
            builder = builder.token_expires_in(Duration::from_secs(secs));
        }

        if let Some(secs) = token.step_up_expires_in_secs {
            builder = builder.step_up_expires_in(Duration::from_secs(secs));
        }

        if let Some(secs) = token.clock_skew_secs {
            builder = builder.clock_skew(Duration::from_secs(secs));
        }

        if let Some(secs) = token.jwks_cache_ttl_secs {
            builder = builder.jwks_cache_ttl(Duration::from_secs(secs));
        }

        if let Some(secs) = token.jwks_refresh_interval_secs {
            builder = builder.jwks_refresh_interval(Duration::from_secs(secs));
        }
    }

    if let Some(logging) = config.logging {
        if let Some(level) = logging.level {
            builder = builder.log_level(level);
        }
        if let Some(json) = logging.json {
            builder = builder.json_logs(json);
        }
    }

    Ok(builder)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    admin_role: Option<String>,
    token: Option<TokenSection>,
    logging: Option<LoggingSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TokenSection {
    algorithm: Option<String>,
    private_key_path: Option<PathBuf>,
    public_key_path: Option<PathBuf>,
    jwks_uri: Option<String>,
    issuer: Option<String>,
    expires_in_secs: Option<u64>,
    step_up_expires_in_secs: Option<u64>,
    clock_skew_secs: Option<u64>,
    jwks_cache_ttl_secs: Option<u64>,
    jwks_refresh_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoggingSection {
    level: Option<String>,
    json: Option<bool>,
}
