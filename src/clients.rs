//! Client configuration lookup.
//!
//! Every API consumer is described by a [`ClientConfig`]: its gateway key,
//! rate limit, model allowlist, target provider, and upstream credential.
//! Configs come from one of three backends behind the same [`ClientStore`]
//! contract:
//!
//! - a static JSON document on disk (reloaded when its mtime changes)
//! - the legacy comma-separated key list (synthesizes a default config)
//! - a remote key-indexed HTTP table with a short-lived positive cache
//!
//! Key comparison is constant-time on the compare path: stores iterate every
//! known key without early exit so an attacker cannot learn key prefixes
//! from response timing.

use anyhow::{Context, Result};
use async_trait::async_trait;
use moka::sync::Cache;
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::config::{Settings, StoreBackend};
use crate::gateway::providers::ProviderKind;

/// How long the remote table backend caches positive lookups.
const REMOTE_CACHE_TTL: Duration = Duration::from_secs(300);

/// Resolved per-client policy, immutable for the lifetime of a request.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: String,
    pub api_key: String,
    pub provider: ProviderKind,
    pub rate_limit_rpm: u32,
    /// Empty means any model is allowed.
    pub allowed_models: Vec<String>,
    /// Per-client upstream credential; empty falls back to the global one.
    pub upstream_credential: SecretString,
    /// Provider-specific model identifier (Bedrock only).
    pub bedrock_model_id: Option<String>,
    pub status: ClientStatus,
}

impl ClientConfig {
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    #[default]
    Active,
    Suspended,
}

/// One client entry as it appears in a config document. Field aliases keep
/// older documents loading unchanged.
#[derive(Debug, Deserialize)]
pub struct ClientRecord {
    pub client_id: String,
    pub api_key: String,
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
    #[serde(default, alias = "model_allowlist")]
    pub allowed_models: Vec<String>,
    #[serde(default, alias = "upstream_api_key")]
    pub upstream_credential: String,
    #[serde(default)]
    pub bedrock_model_id: Option<String>,
    #[serde(default)]
    pub status: ClientStatus,
}

impl ClientRecord {
    /// Resolve the record against global defaults. This is the single place
    /// where "per-client value if present, else global default" happens.
    fn resolve(self, defaults: &StoreDefaults) -> ClientConfig {
        ClientConfig {
            client_id: self.client_id,
            api_key: self.api_key,
            provider: self.provider,
            rate_limit_rpm: self.rate_limit_rpm.unwrap_or(defaults.rate_limit_rpm),
            allowed_models: self.allowed_models,
            upstream_credential: SecretString::new(self.upstream_credential.into()),
            bedrock_model_id: self.bedrock_model_id,
            status: self.status,
        }
    }
}

/// Global defaults applied when a client document omits a field.
#[derive(Debug, Clone)]
pub struct StoreDefaults {
    pub rate_limit_rpm: u32,
}

/// Constant-time equality for API keys.
///
/// Mismatched lengths return false immediately; `subtle` guarantees the
/// content comparison itself does not short-circuit.
pub fn keys_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Lookup contract shared by every backend.
#[async_trait]
pub trait ClientStore: Send + Sync {
    /// Find the client owning `api_key`. `Ok(None)` means unknown key;
    /// `Err` means the backend itself failed and the request cannot be
    /// authenticated at all.
    async fn lookup(&self, api_key: &str) -> Result<Option<ClientConfig>>;
}

// ============================================================================
// JSON file backend
// ============================================================================

/// File-backed store. Reloads the document when its mtime changes.
pub struct JsonClientStore {
    path: PathBuf,
    inner: Mutex<JsonStoreInner>,
    defaults: StoreDefaults,
}

struct JsonStoreInner {
    mtime: Option<SystemTime>,
    clients: Vec<ClientConfig>,
}

#[derive(Deserialize)]
struct ClientDocument {
    #[serde(default)]
    clients: Vec<ClientRecord>,
}

impl JsonClientStore {
    pub fn load(path: &Path, defaults: StoreDefaults) -> Result<Self> {
        let (mtime, clients) = Self::read_document(path, &defaults)?;
        info!(path = %path.display(), clients = clients.len(), "loaded client config");
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(JsonStoreInner {
                mtime: Some(mtime),
                clients,
            }),
            defaults,
        })
    }

    fn read_document(path: &Path, defaults: &StoreDefaults) -> Result<(SystemTime, Vec<ClientConfig>)> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read client config: {}", path.display()))?;
        let mtime = std::fs::metadata(path)?.modified()?;
        let document: ClientDocument = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse client config: {}", path.display()))?;
        let clients = document
            .clients
            .into_iter()
            .map(|record| record.resolve(defaults))
            .collect();
        Ok((mtime, clients))
    }

    /// Re-read the document if the file changed. A failed reload keeps the
    /// cached config so a half-written file cannot lock every client out.
    fn refresh(&self) {
        let current_mtime = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "client config unreadable, keeping cached");
                return;
            }
        };

        let mut inner = self.inner.lock().unwrap();
        if inner.mtime == Some(current_mtime) {
            return;
        }
        match Self::read_document(&self.path, &self.defaults) {
            Ok((mtime, clients)) => {
                debug!(clients = clients.len(), "reloaded client config");
                inner.mtime = Some(mtime);
                inner.clients = clients;
            }
            Err(e) => {
                warn!(error = %e, "client config reload failed, keeping cached");
            }
        }
    }
}

#[async_trait]
impl ClientStore for JsonClientStore {
    async fn lookup(&self, api_key: &str) -> Result<Option<ClientConfig>> {
        self.refresh();

        let inner = self.inner.lock().unwrap();
        // Compare against every key so lookup time is independent of which
        // (if any) entry matches.
        let mut found: Option<ClientConfig> = None;
        for client in &inner.clients {
            if keys_match(api_key, &client.api_key) {
                found = Some(client.clone());
            }
        }
        Ok(found)
    }
}

// ============================================================================
// Legacy key-list backend
// ============================================================================

/// Fallback store for the comma-separated `GATEWAY_API_KEYS` list. A match
/// synthesizes a default OpenAI client with the global rate limit.
pub struct LegacyKeyStore {
    keys: Vec<String>,
    defaults: StoreDefaults,
}

impl LegacyKeyStore {
    pub fn new(raw_keys: &str, defaults: StoreDefaults) -> Self {
        let keys = raw_keys
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        Self { keys, defaults }
    }
}

#[async_trait]
impl ClientStore for LegacyKeyStore {
    async fn lookup(&self, api_key: &str) -> Result<Option<ClientConfig>> {
        let mut found: Option<&str> = None;
        for key in &self.keys {
            if keys_match(api_key, key) {
                found = Some(key);
            }
        }
        Ok(found.map(|key| {
            let prefix: String = key.chars().take(8).collect();
            ClientConfig {
                client_id: format!("legacy-{prefix}"),
                api_key: key.to_string(),
                provider: ProviderKind::Openai,
                rate_limit_rpm: self.defaults.rate_limit_rpm,
                allowed_models: Vec::new(),
                upstream_credential: SecretString::new("".into()),
                bedrock_model_id: None,
                status: ClientStatus::Active,
            }
        }))
    }
}

// ============================================================================
// Remote HTTP table backend
// ============================================================================

/// Remote key-indexed table queried per request, with a positive-only TTL
/// cache. Misses are never cached so a freshly provisioned client is usable
/// immediately.
pub struct HttpClientStore {
    client: reqwest::Client,
    base_url: String,
    cache: Cache<String, ClientConfig>,
    defaults: StoreDefaults,
}

impl HttpClientStore {
    pub fn new(base_url: &str, defaults: StoreDefaults) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("failed to build client store HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: Cache::builder()
                .time_to_live(REMOTE_CACHE_TTL)
                .max_capacity(10_000)
                .build(),
            defaults,
        })
    }
}

#[async_trait]
impl ClientStore for HttpClientStore {
    async fn lookup(&self, api_key: &str) -> Result<Option<ClientConfig>> {
        if let Some(cached) = self.cache.get(api_key) {
            return Ok(Some(cached));
        }

        let url = format!("{}/clients/{}", self.base_url, api_key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("client store request failed")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            anyhow::bail!("client store returned {}", response.status());
        }

        let record: ClientRecord = response
            .json()
            .await
            .context("client store returned an invalid record")?;
        let config = record.resolve(&self.defaults);
        self.cache.insert(api_key.to_string(), config.clone());
        Ok(Some(config))
    }
}

// ============================================================================
// Directory: configured backend + legacy fallback
// ============================================================================

/// The lookup path the orchestrator uses: configured backend first, legacy
/// key list as fallback.
pub struct ClientDirectory {
    primary: Option<Box<dyn ClientStore>>,
    legacy: LegacyKeyStore,
}

impl ClientDirectory {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let defaults = StoreDefaults {
            rate_limit_rpm: settings.rate_limit_rpm,
        };

        let primary: Option<Box<dyn ClientStore>> = match settings.client_store_backend {
            StoreBackend::Json => {
                if settings.client_config_path.is_file() {
                    Some(Box::new(JsonClientStore::load(
                        &settings.client_config_path,
                        defaults.clone(),
                    )?))
                } else {
                    // No document on disk: legacy-only mode.
                    info!(
                        path = %settings.client_config_path.display(),
                        "no client config found, using legacy keys only"
                    );
                    None
                }
            }
            StoreBackend::Http => {
                let base_url = settings
                    .client_store_url
                    .as_deref()
                    .context("CLIENT_STORE_URL is required for the http store backend")?;
                Some(Box::new(HttpClientStore::new(base_url, defaults.clone())?))
            }
        };

        Ok(Self {
            primary,
            legacy: LegacyKeyStore::new(&settings.gateway_api_keys, defaults),
        })
    }

    /// Build a directory with an explicit primary store (tests).
    pub fn with_store(primary: Option<Box<dyn ClientStore>>, legacy: LegacyKeyStore) -> Self {
        Self { primary, legacy }
    }

    /// Resolve an API key to a client. Backend failures are fatal for the
    /// request; a miss everywhere is simply `None`.
    pub async fn authenticate(&self, api_key: &str) -> Result<Option<ClientConfig>> {
        if let Some(store) = &self.primary {
            if let Some(client) = store.lookup(api_key).await? {
                return Ok(Some(client));
            }
        }
        self.legacy.lookup(api_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;

    fn defaults() -> StoreDefaults {
        StoreDefaults { rate_limit_rpm: 60 }
    }

    fn write_clients_json(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn json_store_lookup_and_defaults() {
        let file = write_clients_json(
            r#"{"clients": [
                {"client_id": "client-a", "api_key": "key-aaa-111",
                 "rate_limit_rpm": 30, "allowed_models": ["gpt-4o"],
                 "upstream_credential": "sk-upstream-a"},
                {"client_id": "client-b", "api_key": "key-bbb-222",
                 "status": "suspended"}
            ]}"#,
        );
        let store = JsonClientStore::load(file.path(), defaults()).unwrap();

        let a = store.lookup("key-aaa-111").await.unwrap().unwrap();
        assert_eq!(a.client_id, "client-a");
        assert_eq!(a.rate_limit_rpm, 30);
        assert_eq!(a.allowed_models, vec!["gpt-4o"]);
        assert_eq!(a.upstream_credential.expose_secret(), "sk-upstream-a");
        assert_eq!(a.status, ClientStatus::Active);

        // Omitted fields fall back to global defaults
        let b = store.lookup("key-bbb-222").await.unwrap().unwrap();
        assert_eq!(b.rate_limit_rpm, 60);
        assert_eq!(b.provider, ProviderKind::Openai);
        assert_eq!(b.status, ClientStatus::Suspended);

        assert!(store.lookup("key-unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn json_store_accepts_legacy_field_names() {
        let file = write_clients_json(
            r#"{"clients": [
                {"client_id": "old", "api_key": "k",
                 "model_allowlist": ["gpt-4o"], "upstream_api_key": "sk-x"}
            ]}"#,
        );
        let store = JsonClientStore::load(file.path(), defaults()).unwrap();
        let client = store.lookup("k").await.unwrap().unwrap();
        assert_eq!(client.allowed_models, vec!["gpt-4o"]);
        assert_eq!(client.upstream_credential.expose_secret(), "sk-x");
    }

    #[tokio::test]
    async fn legacy_store_synthesizes_default_client() {
        let store = LegacyKeyStore::new("dev-key-1, other-key-2", defaults());

        let client = store.lookup("dev-key-1").await.unwrap().unwrap();
        assert_eq!(client.client_id, "legacy-dev-key-");
        assert_eq!(client.provider, ProviderKind::Openai);
        assert_eq!(client.rate_limit_rpm, 60);
        assert!(client.allowed_models.is_empty());

        assert!(store.lookup("other-key-2").await.unwrap().is_some());
        assert!(store.lookup("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn directory_falls_back_to_legacy_keys() {
        let file = write_clients_json(
            r#"{"clients": [{"client_id": "a", "api_key": "store-key"}]}"#,
        );
        let store = JsonClientStore::load(file.path(), defaults()).unwrap();
        let directory = ClientDirectory::with_store(
            Some(Box::new(store)),
            LegacyKeyStore::new("legacy-key", defaults()),
        );

        assert_eq!(
            directory.authenticate("store-key").await.unwrap().unwrap().client_id,
            "a"
        );
        assert_eq!(
            directory.authenticate("legacy-key").await.unwrap().unwrap().client_id,
            "legacy-legacy-k"
        );
        assert!(directory.authenticate("missing").await.unwrap().is_none());
    }

    #[test]
    fn keys_match_basic() {
        assert!(keys_match("secret-key", "secret-key"));
        assert!(!keys_match("secret-key", "secret-kez"));
        assert!(!keys_match("short", "longer-key"));
        assert!(keys_match("", ""));
    }

    /// The compare primitive should take indistinguishable time for a match
    /// and a same-length mismatch. A loose bound keeps this robust against
    /// scheduler noise while still catching an early-exit comparison.
    #[test]
    fn keys_match_timing_is_flat() {
        use std::hint::black_box;
        use std::time::Instant;

        let valid = "k".repeat(64);
        let near_miss = format!("{}x", "k".repeat(63)); // differs in last byte
        let early_miss = format!("x{}", "k".repeat(63)); // differs in first byte

        let time = |candidate: &str| {
            let mut best = u128::MAX;
            // Take the minimum over several batches: the floor is the actual
            // work, everything above it is noise.
            for _ in 0..20 {
                let start = Instant::now();
                for _ in 0..5_000 {
                    black_box(keys_match(black_box(candidate), black_box(&valid)));
                }
                best = best.min(start.elapsed().as_nanos());
            }
            best as f64
        };

        let t_match = time(&valid);
        let t_early = time(&early_miss);
        let t_late = time(&near_miss);

        // Early and late mismatches should cost about the same as a match.
        for t in [t_early, t_late] {
            let ratio = t / t_match;
            assert!(
                (0.2..5.0).contains(&ratio),
                "timing ratio {ratio:.2} suggests a short-circuit compare"
            );
        }
    }
}
