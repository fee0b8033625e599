use std::{collections::HashSet, time::Duration};

use base64::{
    Engine as _, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use tokio::{sync::RwLock, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    descriptor::Descriptor,
    domain::Server,
    state::{JsonSnapshotStore, StoreError},
};

pub const MAX_SUBSCRIPTION_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_FETCH_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_STEP: Duration = Duration::from_secs(1);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const VLESS_PREFIX: &str = "vless://";

const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

#[derive(Debug)]
pub enum LoaderError {
    ClientBuild(reqwest::Error),
    FetchFailed {
        attempts: u32,
        last_error: String,
    },
    DecodeFailed {
        reason: String,
    },
    NoValidEntries {
        candidates: usize,
    },
    SnapshotUnavailable {
        fetch: Box<LoaderError>,
        snapshot: String,
    },
    Cancelled,
}

impl std::fmt::Display for LoaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientBuild(e) => write!(f, "build http client: {e}"),
            Self::FetchFailed {
                attempts,
                last_error,
            } => write!(
                f,
                "fetch subscription failed after {attempts} attempts: {last_error}"
            ),
            Self::DecodeFailed { reason } => write!(f, "decode subscription: {reason}"),
            Self::NoValidEntries { candidates } => write!(
                f,
                "no valid servers in subscription ({candidates} vless entries rejected)"
            ),
            Self::SnapshotUnavailable { fetch, snapshot } => {
                write!(f, "{fetch}; snapshot fallback failed: {snapshot}")
            }
            Self::Cancelled => write!(f, "subscription load cancelled"),
        }
    }
}

impl std::error::Error for LoaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ClientBuild(e) => Some(e),
            Self::SnapshotUnavailable { fetch, .. } => Some(fetch.as_ref()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub url: String,
    /// Zero disables the in-memory cache.
    pub cache_ttl: Duration,
    pub request_timeout: Duration,
    pub attempts: u32,
    /// Sleep after failed attempt `i` is `i * retry_step`.
    pub retry_step: Duration,
}

impl LoaderOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.subscription_url.trim().to_string(),
            cache_ttl: config.cache_ttl(),
            request_timeout: config.ping_timeout(),
            attempts: DEFAULT_FETCH_ATTEMPTS,
            retry_step: DEFAULT_RETRY_STEP,
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    servers: Vec<Server>,
    last_update: Option<Instant>,
}

impl CacheState {
    fn is_valid(&self, ttl: Duration) -> bool {
        !self.servers.is_empty()
            && self
                .last_update
                .is_some_and(|at| at.elapsed() < ttl)
    }
}

pub struct SubscriptionLoader {
    opts: LoaderOptions,
    client: reqwest::Client,
    store: JsonSnapshotStore,
    cache: RwLock<CacheState>,
}

impl SubscriptionLoader {
    pub fn new(opts: LoaderOptions, store: JsonSnapshotStore) -> Result<Self, LoaderError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(opts.request_timeout)
            .build()
            .map_err(LoaderError::ClientBuild)?;
        Ok(Self {
            opts,
            client,
            store,
            cache: RwLock::new(CacheState::default()),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, LoaderError> {
        Self::new(
            LoaderOptions::from_config(config),
            JsonSnapshotStore::in_dir(&config.cache_dir),
        )
    }

    pub fn store(&self) -> &JsonSnapshotStore {
        &self.store
    }

    /// Returns the candidate list, from memory while the TTL holds, otherwise from the
    /// subscription URL. When the fetch or decode fails the last saved snapshot is served
    /// instead, without refreshing the TTL.
    pub async fn load(&self, cancel: &CancellationToken) -> Result<Vec<Server>, LoaderError> {
        let mut cache = self.cache.write().await;
        if cache.is_valid(self.opts.cache_ttl) {
            debug!(servers = cache.servers.len(), "subscription cache hit");
            return Ok(cache.servers.clone());
        }

        let fetched = match self.fetch_with_retries(cancel).await {
            Ok(body) => decode_and_parse(&body),
            Err(err) => Err(err),
        };

        let servers = match fetched {
            Ok(servers) => servers,
            Err(LoaderError::Cancelled) => return Err(LoaderError::Cancelled),
            Err(err) => {
                let servers = self.fallback_to_snapshot(err)?;
                cache.servers = servers.clone();
                return Ok(servers);
            }
        };

        if let Err(err) = self.store.save(&servers) {
            warn!(path = %self.store.path().display(), error = %err, "persist subscription snapshot failed");
        }

        info!(servers = servers.len(), "subscription loaded");
        cache.servers = servers.clone();
        cache.last_update = Some(Instant::now());
        Ok(servers)
    }

    pub async fn invalidate_cache(&self) {
        let mut cache = self.cache.write().await;
        cache.servers.clear();
        cache.last_update = None;
    }

    /// Copy of whatever is cached in memory, valid or not.
    pub async fn cached(&self) -> Vec<Server> {
        self.cache.read().await.servers.clone()
    }

    fn fallback_to_snapshot(&self, err: LoaderError) -> Result<Vec<Server>, LoaderError> {
        warn!(error = %err, path = %self.store.path().display(), "subscription unavailable, falling back to snapshot");
        let snapshot = match self.store.load() {
            Ok(Some(servers)) if !servers.is_empty() => return Ok(servers),
            Ok(Some(_)) => "snapshot is empty".to_string(),
            Ok(None) => "no snapshot on disk".to_string(),
            Err(StoreError::Io(e)) => format!("read snapshot: {e}"),
            Err(StoreError::SerdeJson(e)) => format!("parse snapshot: {e}"),
        };
        Err(LoaderError::SnapshotUnavailable {
            fetch: Box::new(err),
            snapshot,
        })
    }

    async fn fetch_with_retries(&self, cancel: &CancellationToken) -> Result<Vec<u8>, LoaderError> {
        let attempts = self.opts.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LoaderError::Cancelled),
                result = self.fetch_once() => result,
            };
            match result {
                Ok(body) => {
                    debug!(attempt, bytes = body.len(), "subscription fetched");
                    return Ok(body);
                }
                Err(err) => {
                    warn!(attempt, attempts, error = %err, "subscription fetch attempt failed");
                    last_error = err;
                }
            }

            if attempt < attempts {
                let backoff = self.opts.retry_step * attempt;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(LoaderError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        Err(LoaderError::FetchFailed {
            attempts,
            last_error,
        })
    }

    async fn fetch_once(&self) -> Result<Vec<u8>, String> {
        let mut response = self
            .client
            .get(&self.opts.url)
            .send()
            .await
            .map_err(|e| format!("request: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("unexpected status {status}"));
        }
        if response
            .content_length()
            .is_some_and(|len| len > MAX_SUBSCRIPTION_BYTES as u64)
        {
            return Err(format!("body larger than {MAX_SUBSCRIPTION_BYTES} bytes"));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| format!("read body: {e}"))?
        {
            if body.len() + chunk.len() > MAX_SUBSCRIPTION_BYTES {
                return Err(format!("body larger than {MAX_SUBSCRIPTION_BYTES} bytes"));
            }
            body.extend_from_slice(&chunk);
        }
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err("empty body".to_string());
        }
        Ok(body)
    }
}

/// Decodes a base64 subscription blob (standard or URL-safe alphabet, padding optional) and
/// parses every `vless://` line in it. Lines that fail to parse are logged and skipped;
/// later entries with an already-seen server ID are dropped.
pub fn decode_and_parse(blob: &[u8]) -> Result<Vec<Server>, LoaderError> {
    let compact: Vec<u8> = blob
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if compact.is_empty() {
        return Err(LoaderError::DecodeFailed {
            reason: "empty payload".to_string(),
        });
    }

    let decoded = STANDARD_LENIENT
        .decode(&compact)
        .or_else(|_| URL_SAFE_LENIENT.decode(&compact))
        .map_err(|e| LoaderError::DecodeFailed {
            reason: format!("base64: {e}"),
        })?;
    let text = String::from_utf8(decoded).map_err(|e| LoaderError::DecodeFailed {
        reason: format!("utf-8: {e}"),
    })?;

    let mut servers = Vec::new();
    let mut seen = HashSet::new();
    let mut candidates = 0_usize;
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if !line.starts_with(VLESS_PREFIX) {
            continue;
        }
        candidates += 1;

        let server = match Descriptor::parse(line) {
            Ok(descriptor) => descriptor.to_server(line),
            Err(err) => {
                warn!(line = line_no + 1, error = %err, "skip invalid subscription entry");
                continue;
            }
        };
        if !seen.insert(server.id.clone()) {
            warn!(line = line_no + 1, server_id = %server.id, "skip duplicate subscription entry");
            continue;
        }
        servers.push(server);
    }

    if servers.is_empty() {
        return Err(LoaderError::NoValidEntries { candidates });
    }
    Ok(servers)
}
