//! Remote JWKS resolution for token verification

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum spacing between refetches triggered by an unknown `kid`
pub const DEFAULT_REFETCH_COOLDOWN: Duration = Duration::from_secs(30);

/// JSON Web Key
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    #[serde(default)]
    pub kid: Option<String>,
    pub kty: String,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default)]
    pub r#use: Option<String>,
    // RSA
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
    // EC / OKP
    #[serde(default)]
    pub crv: Option<String>,
    #[serde(default)]
    pub x: Option<String>,
    #[serde(default)]
    pub y: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

#[derive(Clone)]
struct ResolvedKey {
    key: DecodingKey,
    algorithm: Algorithm,
}

#[derive(Default)]
struct KeyTable {
    by_kid: HashMap<String, ResolvedKey>,
    unnamed: Vec<ResolvedKey>,
    refreshed_at: Option<Instant>,
}

/// Thread-safe JWKS cache; refreshed lazily after `ttl`.
///
/// A token whose `kid` is unknown triggers at most one refetch per
/// `refetch_cooldown`, so forged headers cannot turn every request into an
/// outbound fetch.
pub struct JwksCache {
    table: RwLock<KeyTable>,
    last_fetch: Mutex<Option<Instant>>,
    jwks_uri: Url,
    client: reqwest::Client,
    ttl: Duration,
    refetch_cooldown: Duration,
}

impl std::fmt::Debug for JwksCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.read();
        f.debug_struct("JwksCache")
            .field("jwks_uri", &self.jwks_uri)
            .field("ttl", &self.ttl)
            .field("refetch_cooldown", &self.refetch_cooldown)
            .field("keys_count", &(table.by_kid.len() + table.unnamed.len()))
            .finish_non_exhaustive()
    }
}

impl JwksCache {
    pub fn new(jwks_uri: Url, ttl: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| Error::Jwks(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            table: RwLock::new(KeyTable::default()),
            last_fetch: Mutex::new(None),
            jwks_uri,
            client,
            ttl,
            refetch_cooldown: DEFAULT_REFETCH_COOLDOWN,
        })
    }

    #[must_use]
    pub const fn with_refetch_cooldown(mut self, cooldown: Duration) -> Self {
        self.refetch_cooldown = cooldown;
        self
    }

    /// Resolve the verification key for a token header
    pub async fn get_key(&self, kid: Option<&str>, alg: Algorithm) -> Result<DecodingKey> {
        if self.needs_refresh() {
            self.refresh().await?;
        }

        if let Some(found) = self.lookup(kid, alg) {
            return Ok(found);
        }

        // Unknown kid may mean the issuer rotated keys since the last fetch
        if kid.is_some() && self.claim_refetch() {
            self.fetch().await?;
            if let Some(found) = self.lookup(kid, alg) {
                return Ok(found);
            }
        }

        tracing::warn!(kid = ?kid, alg = ?alg, "No JWKS key matches token header");
        Err(Error::Verification)
    }

    fn lookup(&self, kid: Option<&str>, alg: Algorithm) -> Option<DecodingKey> {
        let table = self.table.read();
        match kid {
            Some(kid) => table
                .by_kid
                .get(kid)
                .filter(|entry| entry.algorithm == alg)
                .map(|entry| entry.key.clone()),
            None => table
                .unnamed
                .iter()
                .chain(table.by_kid.values())
                .find(|entry| entry.algorithm == alg)
                .map(|entry| entry.key.clone()),
        }
    }

    /// Fetch the key set from the remote endpoint
    pub async fn refresh(&self) -> Result<()> {
        *self.last_fetch.lock() = Some(Instant::now());
        self.fetch().await
    }

    /// Reserve a refetch slot if the cooldown since the last fetch has passed
    fn claim_refetch(&self) -> bool {
        let mut last_fetch = self.last_fetch.lock();
        if last_fetch.is_some_and(|t| t.elapsed() < self.refetch_cooldown) {
            tracing::debug!(jwks_uri = %self.jwks_uri, "JWKS refetch suppressed by cooldown");
            return false;
        }
        *last_fetch = Some(Instant::now());
        true
    }

    async fn fetch(&self) -> Result<()> {
        tracing::debug!(jwks_uri = %self.jwks_uri, "Refreshing JWKS");

        let response = self
            .client
            .get(self.jwks_uri.clone())
            .send()
            .await
            .map_err(|e| Error::Jwks(format!("fetch failed: {e}")))?;

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| Error::Jwks(format!("parse failed: {e}")))?;

        self.install(jwks)
    }

    fn install(&self, jwks: JwkSet) -> Result<()> {
        let mut table = KeyTable {
            refreshed_at: Some(Instant::now()),
            ..KeyTable::default()
        };

        for jwk in jwks.keys {
            if jwk.r#use.as_deref().is_some_and(|u| u != "sig") {
                continue;
            }
            if let Some((key, algorithm)) = decode_jwk(&jwk)? {
                let entry = ResolvedKey { key, algorithm };
                match jwk.kid {
                    Some(kid) => {
                        table.by_kid.insert(kid, entry);
                    }
                    None => table.unnamed.push(entry),
                }
            }
        }

        let count = table.by_kid.len() + table.unnamed.len();
        *self.table.write() = table;
        tracing::info!(keys_count = count, "JWKS refreshed");
        Ok(())
    }

    fn needs_refresh(&self) -> bool {
        self.table
            .read()
            .refreshed_at
            .is_none_or(|t| t.elapsed() > self.ttl)
    }
}

fn decode_jwk(jwk: &Jwk) -> Result<Option<(DecodingKey, Algorithm)>> {
    let alg = match jwk.alg.as_deref() {
        Some("RS256") => Algorithm::RS256,
        Some("RS384") => Algorithm::RS384,
        Some("RS512") => Algorithm::RS512,
        Some("PS256") => Algorithm::PS256,
        Some("ES256") => Algorithm::ES256,
        Some("ES384") => Algorithm::ES384,
        Some("EdDSA") => Algorithm::EdDSA,
        None => match (jwk.kty.as_str(), jwk.crv.as_deref()) {
            ("RSA", _) => Algorithm::RS256,
            ("EC", Some("P-256")) => Algorithm::ES256,
            ("EC", Some("P-384")) => Algorithm::ES384,
            ("OKP", Some("Ed25519")) => Algorithm::EdDSA,
            _ => return Ok(None),
        },
        Some(other) => {
            tracing::debug!(alg = other, "Skipping JWK with unsupported algorithm");
            return Ok(None);
        }
    };

    let key = match jwk.kty.as_str() {
        "RSA" => DecodingKey::from_rsa_components(
            component(jwk, jwk.n.as_deref(), "n")?,
            component(jwk, jwk.e.as_deref(), "e")?,
        ),
        "EC" => DecodingKey::from_ec_components(
            component(jwk, jwk.x.as_deref(), "x")?,
            component(jwk, jwk.y.as_deref(), "y")?,
        ),
        "OKP" => DecodingKey::from_ed_components(component(jwk, jwk.x.as_deref(), "x")?),
        other => {
            tracing::debug!(kty = other, "Skipping unsupported key type");
            return Ok(None);
        }
    }
    .map_err(|e| Error::Jwks(format!("invalid {} components: {e}", jwk.kty)))?;

    Ok(Some((key, alg)))
}

fn component<'a>(jwk: &Jwk, value: Option<&'a str>, name: &str) -> Result<&'a str> {
    value.ok_or_else(|| Error::Jwks(format!("missing '{name}' in {} key", jwk.kty)))
}

/// Background JWKS refresh task builder
pub struct JwksRefreshTask {
    cache: Arc<JwksCache>,
    interval: Duration,
}

impl std::fmt::Debug for JwksRefreshTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksRefreshTask")
            .field("cache", &self.cache)
            .field("interval", &self.interval)
            .finish()
    }
}

impl JwksRefreshTask {
    #[must_use]
    pub const fn new(cache: Arc<JwksCache>, interval: Duration) -> Self {
        Self { cache, interval }
    }

    /// Refresh every `interval` until `shutdown` fires; the first refresh
    /// waits one interval since verification loads keys on demand
    pub fn spawn(
        self,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.cache.refresh().await {
                            tracing::warn!(error = %e, "Background JWKS refresh failed");
                        }
                    }
                    () = shutdown.cancelled() => {
                        tracing::debug!("JWKS refresh task shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> JwksCache {
        JwksCache::new(
            Url::parse("https://example.com/.well-known/jwks.json").unwrap(),
            Duration::from_secs(3600),
        )
        .unwrap()
    }

    #[test]
    fn test_jwk_set_deserialize() {
        let json = r#"{
            "keys": [
                {"kid": "key1", "kty": "RSA", "alg": "RS256", "n": "test_n", "e": "AQAB"},
                {"kty": "EC", "crv": "P-256", "x": "test_x", "y": "test_y"}
            ]
        }"#;
        let jwks: JwkSet = serde_json::from_str(json).unwrap();
        assert_eq!(jwks.keys.len(), 2);
        assert_eq!(jwks.keys[0].kid.as_deref(), Some("key1"));
        assert_eq!(jwks.keys[1].crv.as_deref(), Some("P-256"));
    }

    #[test]
    fn test_needs_refresh_initially() {
        assert!(cache().needs_refresh());
    }

    #[test]
    fn test_install_skips_encryption_and_unknown_keys() {
        let cache = cache();
        let jwks: JwkSet = serde_json::from_str(
            r#"{"keys": [
                {"kid": "enc", "kty": "RSA", "use": "enc", "n": "AQAB", "e": "AQAB"},
                {"kid": "oct", "kty": "oct", "alg": "HS256"},
                {"kid": "sig", "kty": "RSA", "alg": "RS256", "n": "AQAB", "e": "AQAB"}
            ]}"#,
        )
        .unwrap();

        cache.install(jwks).unwrap();
        assert!(!cache.needs_refresh());
        assert!(cache.lookup(Some("sig"), Algorithm::RS256).is_some());
        assert!(cache.lookup(Some("sig"), Algorithm::ES256).is_none());
        assert!(cache.lookup(Some("enc"), Algorithm::RS256).is_none());
        assert!(cache.lookup(None, Algorithm::RS256).is_some());
    }

    fn signing_keys() -> JwkSet {
        serde_json::from_str(
            r#"{"keys": [{"kid": "sig", "kty": "RSA", "alg": "RS256", "n": "AQAB", "e": "AQAB"}]}"#,
        )
        .unwrap()
    }

    /// Cache whose endpoint refuses connections, so any fetch fails fast
    fn unreachable_cache(cooldown: Duration) -> JwksCache {
        JwksCache::new(
            Url::parse("http://127.0.0.1:9/jwks.json").unwrap(),
            Duration::from_secs(3600),
        )
        .unwrap()
        .with_refetch_cooldown(cooldown)
    }

    #[tokio::test]
    async fn test_unknown_kid_refetch_respects_cooldown() {
        let cache = unreachable_cache(Duration::from_secs(3600));
        cache.install(signing_keys()).unwrap();

        // First unknown kid goes to the network
        let err = cache.get_key(Some("rotated"), Algorithm::RS256).await;
        assert!(matches!(err, Err(Error::Jwks(_))));

        // Second one inside the cooldown is answered from the table
        let err = cache.get_key(Some("rotated"), Algorithm::RS256).await;
        assert!(matches!(err, Err(Error::Verification)));

        assert!(cache.get_key(Some("sig"), Algorithm::RS256).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_kid_refetches_after_cooldown() {
        let cache = unreachable_cache(Duration::ZERO);
        cache.install(signing_keys()).unwrap();

        for _ in 0..2 {
            let err = cache.get_key(Some("rotated"), Algorithm::RS256).await;
            assert!(matches!(err, Err(Error::Jwks(_))));
        }
    }

    #[tokio::test]
    async fn test_refresh_task_stops_on_shutdown() {
        let cache = Arc::new(unreachable_cache(DEFAULT_REFETCH_COOLDOWN));
        let shutdown = tokio_util::sync::CancellationToken::new();
        let handle = JwksRefreshTask::new(cache, Duration::from_secs(60)).spawn(shutdown.clone());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_missing_rsa_component_is_error() {
        let jwk = Jwk {
            kid: None,
            kty: "RSA".to_string(),
            alg: Some("RS256".to_string()),
            r#use: None,
            n: None,
            e: Some("AQAB".to_string()),
            crv: None,
            x: None,
            y: None,
        };
        assert!(matches!(decode_jwk(&jwk), Err(Error::Jwks(_))));
    }
}
