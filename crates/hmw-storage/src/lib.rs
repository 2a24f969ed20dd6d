//! Cooldown-gated market store with atomic persistence, scan sessions and HTTP fetch utilities.

use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use hmw_core::{
    CooldownKey, EntryRef, MarketDocument, MarketObservation, PowerplayObservation, RecipientKey,
    ScanCycle, Timestamp,
};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hmw-storage";

/// Default pruning horizon: anything older than this counts as expired.
pub const DEFAULT_PRUNE_TTL: Duration = Duration::from_millis(50);

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// Settable clock for simulating the passage of time.
#[derive(Debug)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.bits.store(now.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let _ = self
            .bits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                Some((f64::from_bits(bits) + by.as_secs_f64()).to_bits())
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing market document: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("market document {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("persist rejected by backend: {0}")]
    Rejected(String),
    #[error("market store lock poisoned")]
    LockPoisoned,
}

/// Load/persist contract behind [`MarketStore`]. Locking is the store's job.
pub trait StoreBackend: Send + Sync {
    fn load(&self) -> Result<MarketDocument, StoreError>;
    fn persist(&self, document: &MarketDocument) -> Result<(), StoreError>;
    fn describe(&self) -> String;
}

impl<B: StoreBackend + ?Sized> StoreBackend for Arc<B> {
    fn load(&self) -> Result<MarketDocument, StoreError> {
        (**self).load()
    }

    fn persist(&self, document: &MarketDocument) -> Result<(), StoreError> {
        (**self).persist(document)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Single JSON document on disk, replaced by temp-file write + atomic rename.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StoreBackend for JsonFileBackend {
    fn load(&self) -> Result<MarketDocument, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(MarketDocument::default()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(MarketDocument::default());
        }
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn persist(&self, document: &MarketDocument) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(document).map_err(StoreError::Serialize)?;
        write_atomic(&self.path, &bytes)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Replaces `path` with `bytes` via a uniquely named sibling temp file, fsync
/// and rename. On failure the temp file is removed and `path` is untouched.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| StoreError::Io {
        path: parent.to_path_buf(),
        source,
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let result = write_then_rename(&temp_path, path, bytes).and_then(|()| sync_dir(parent));
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn write_then_rename(temp_path: &Path, target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| StoreError::Io { path, source }
    };

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .map_err(io_err(temp_path))?;
    file.write_all(bytes).map_err(io_err(temp_path))?;
    file.sync_all().map_err(io_err(temp_path))?;
    drop(file);

    fs::rename(temp_path, target).map_err(io_err(target))
}

/// Flushes the directory entry so the rename itself survives a crash.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    fs::File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}

/// In-process backend. Counts successful persists and can be told to fail them.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    bytes: Mutex<Option<Vec<u8>>>,
    persists: AtomicUsize,
    fail_persists: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persist_count(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }

    pub fn fail_persists(&self, fail: bool) {
        self.fail_persists.store(fail, Ordering::SeqCst);
    }
}

impl StoreBackend for MemoryBackend {
    fn load(&self) -> Result<MarketDocument, StoreError> {
        let bytes = self.bytes.lock().map_err(|_| StoreError::LockPoisoned)?;
        match bytes.as_deref() {
            None => Ok(MarketDocument::default()),
            Some(raw) => serde_json::from_slice(raw).map_err(|source| StoreError::Corrupt {
                path: PathBuf::from("<memory>"),
                source,
            }),
        }
    }

    fn persist(&self, document: &MarketDocument) -> Result<(), StoreError> {
        if self.fail_persists.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("injected persist failure".to_string()));
        }
        let encoded = serde_json::to_vec(document).map_err(StoreError::Serialize)?;
        *self.bytes.lock().map_err(|_| StoreError::LockPoisoned)? = Some(encoded);
        self.persists.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "<memory>".to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub pruned: Vec<String>,
    pub retained: Vec<String>,
}

/// Sole owner of persisted market state.
///
/// Every public operation is one critical section: load the full document,
/// mutate it, persist it. Nothing is cached between operations.
pub struct MarketStore {
    backend: Box<dyn StoreBackend>,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for MarketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketStore")
            .field("backend", &self.backend.describe())
            .finish()
    }
}

impl MarketStore {
    pub fn new(backend: impl StoreBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            clock: Arc::new(SystemClock),
            lock: Mutex::new(()),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(JsonFileBackend::new(path))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn describe(&self) -> String {
        self.backend.describe()
    }

    fn read<R>(&self, f: impl FnOnce(&MarketDocument, Timestamp) -> R) -> Result<R, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::LockPoisoned)?;
        let document = self.backend.load()?;
        Ok(f(&document, self.clock.now()))
    }

    /// `f` returns its result plus whether the document changed; unchanged
    /// documents are not persisted.
    fn transact<R>(
        &self,
        f: impl FnOnce(&mut MarketDocument, Timestamp) -> (R, bool),
    ) -> Result<R, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut document = self.backend.load()?;
        let (value, changed) = f(&mut document, self.clock.now());
        if changed {
            self.backend.persist(&document)?;
        }
        Ok(value)
    }

    pub fn write_market_entry(&self, entry: &MarketObservation) -> Result<(), StoreError> {
        self.transact(|document, _| {
            let system = document.systems.entry(entry.system.clone()).or_default();
            system.system_address = entry.system_address.clone();
            let station = system.stations.entry(entry.station.clone()).or_default();
            station.station_type = entry.station_type.clone();
            station.url = entry.url.clone();
            let listing = station.metals.entry(entry.metal.clone()).or_default();
            listing.stock = entry.stock;
            ((), true)
        })
    }

    pub fn write_powerplay_entry(&self, entry: &PowerplayObservation) -> Result<(), StoreError> {
        self.transact(|document, _| {
            let system = document.systems.entry(entry.system.clone()).or_default();
            system.system_address = entry.system_address.clone();
            let block = system.powerplay.get_or_insert_with(Default::default);
            block.power = entry.power.clone();
            block.status = entry.status.clone();
            block.progress = entry.progress.clone();
            block.commodity_urls = entry.commodity_urls.clone();
            ((), true)
        })
    }

    pub fn read_all_entries(&self) -> Result<MarketDocument, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::LockPoisoned)?;
        self.backend.load()
    }

    /// True when `recipient` may be notified about `entry` now.
    pub fn check_entry_cooldown(
        &self,
        entry: &EntryRef,
        recipient: &RecipientKey,
        window: Duration,
    ) -> Result<bool, StoreError> {
        self.read(|document, now| cooldown_elapsed(document, entry, recipient, window, now))
    }

    pub fn check_cooldown(
        &self,
        system: &str,
        station: &str,
        metal: &str,
        recipient: &RecipientKey,
        window: Duration,
    ) -> Result<bool, StoreError> {
        self.check_entry_cooldown(&EntryRef::market(system, station, metal), recipient, window)
    }

    pub fn check_powerplay_cooldown(
        &self,
        system: &str,
        recipient: &RecipientKey,
        window: Duration,
    ) -> Result<bool, StoreError> {
        self.check_entry_cooldown(&EntryRef::powerplay(system), recipient, window)
    }

    /// Returns false when the entry no longer exists; that is not an error.
    pub fn mark_sent(
        &self,
        system: &str,
        station: &str,
        metal: &str,
        recipient: &RecipientKey,
    ) -> Result<bool, StoreError> {
        let key = CooldownKey::market(system, station, metal, recipient.clone());
        Ok(self.mark_sent_batch(std::slice::from_ref(&key))? == 1)
    }

    /// Records every key with one load and at most one persist. Returns how
    /// many keys landed on an existing entry.
    pub fn mark_sent_batch(&self, keys: &[CooldownKey]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.transact(|document, now| {
            let mut recorded = 0usize;
            for key in keys {
                match document.cooldowns_mut(&key.entry) {
                    Some(cooldowns) => {
                        cooldowns.record(&key.recipient, now);
                        recorded += 1;
                    }
                    None => debug!(
                        entry = ?key.entry,
                        recipient = %key.recipient,
                        "cooldown target vanished before mark; skipping"
                    ),
                }
            }
            (recorded, recorded > 0)
        })
    }

    pub fn mark_powerplay_sent_batch(
        &self,
        keys: &[(String, RecipientKey)],
    ) -> Result<usize, StoreError> {
        let keys = keys
            .iter()
            .map(|(system, recipient)| CooldownKey::powerplay(system.clone(), recipient.clone()))
            .collect::<Vec<_>>();
        self.mark_sent_batch(&keys)
    }

    /// Drops systems that are absent from `current_systems` and whose every
    /// cooldown is at least `ttl` old.
    pub fn prune_stale(
        &self,
        current_systems: &HashSet<String>,
        ttl: Duration,
    ) -> Result<PruneReport, StoreError> {
        let report = self.transact(|document, now| {
            let horizon = ttl.as_secs_f64();
            let mut report = PruneReport::default();
            document.systems.retain(|name, system| {
                if current_systems.contains(name) {
                    return true;
                }
                let live = system.cooldown_timestamps().any(|ts| now - ts < horizon);
                if live {
                    report.retained.push(name.clone());
                } else {
                    report.pruned.push(name.clone());
                }
                live
            });
            let changed = !report.pruned.is_empty();
            (report, changed)
        })?;
        if !report.pruned.is_empty() {
            info!(pruned = ?report.pruned, "pruned stale systems");
        }
        if !report.retained.is_empty() {
            debug!(retained = ?report.retained, "unseen systems kept for live cooldowns");
        }
        Ok(report)
    }
}

fn cooldown_elapsed(
    document: &MarketDocument,
    entry: &EntryRef,
    recipient: &RecipientKey,
    window: Duration,
    now: Timestamp,
) -> bool {
    match document
        .cooldowns(entry)
        .and_then(|cooldowns| cooldowns.last_sent(recipient))
    {
        None => true,
        Some(last) => now - last >= window.as_secs_f64(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning(ScanCycle),
}

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub cycle: Option<ScanCycle>,
    pub scanned: usize,
    pub prune: PruneReport,
}

/// Brackets crawl cycles and reconciles the store when one ends.
#[derive(Debug)]
pub struct ScanSession {
    store: Arc<MarketStore>,
    prune_ttl: Duration,
    state: Mutex<ScanState>,
    cycles: AtomicU64,
}

impl ScanSession {
    pub fn new(store: Arc<MarketStore>) -> Self {
        Self {
            store,
            prune_ttl: DEFAULT_PRUNE_TTL,
            state: Mutex::new(ScanState::Idle),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn with_prune_ttl(mut self, ttl: Duration) -> Self {
        self.prune_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<MarketStore> {
        &self.store
    }

    pub fn state(&self) -> ScanState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advisory: writes are never blocked while a scan is in flight.
    pub fn begin_scan(&self) -> ScanCycle {
        let cycle = ScanCycle::new(self.cycles.fetch_add(1, Ordering::SeqCst) + 1);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let ScanState::Scanning(open) = *state {
            warn!(open = open.number, "begin_scan while a cycle is still open; superseding it");
        }
        *state = ScanState::Scanning(cycle);
        info!(cycle = cycle.number, cycle_id = %cycle.id, "scan cycle started");
        cycle
    }

    pub fn end_scan(&self, scanned_systems: &HashSet<String>) -> Result<ScanOutcome, StoreError> {
        let previous = std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            ScanState::Idle,
        );
        let cycle = match previous {
            ScanState::Scanning(cycle) => Some(cycle),
            ScanState::Idle => {
                warn!("end_scan without begin_scan; pruning anyway");
                None
            }
        };

        let prune = self.store.prune_stale(scanned_systems, self.prune_ttl)?;
        info!(
            cycle = cycle.map(|c| c.number),
            scanned = scanned_systems.len(),
            pruned = prune.pruned.len(),
            retained = prune.retained.len(),
            "scan cycle finished"
        );
        Ok(ScanOutcome {
            cycle,
            scanned: scanned_systems.len(),
            prune,
        })
    }

    /// Closes the open cycle without pruning. A partial scanned set would
    /// otherwise evict systems the crawl simply never reached.
    pub fn abandon_scan(&self) -> Option<ScanCycle> {
        let previous = std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            ScanState::Idle,
        );
        match previous {
            ScanState::Scanning(cycle) => {
                warn!(cycle = cycle.number, "scan cycle abandoned; skipping prune");
                Some(cycle)
            }
            ScanState::Idle => None,
        }
    }
}

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (inaragold/1.0)";

/// Body marker inara serves with a 200 once it has blocked the caller's IP.
pub const BLOCKED_MARKER: &str = "Access Temporarily Restricted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Seconds form of `Retry-After`; HTTP-date values are ignored.
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub min_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            min_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Enforces a minimum spacing between any two outbound requests.
#[derive(Debug)]
pub struct RequestThrottle {
    min_interval: Duration,
    last: tokio::sync::Mutex<Option<Instant>>,
}

impl RequestThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            let now = Instant::now();
            if ready_at > now {
                debug!(wait_ms = (ready_at - now).as_millis() as u64, "throttling request");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("rate limited by {url} after {attempts} attempts")]
    RateLimited { url: String, attempts: usize },
    #[error("access blocked by {host}")]
    Blocked { host: String },
    #[error("retries exhausted for {url}")]
    RetriesExhausted { url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    throttle: RequestThrottle,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            throttle: RequestThrottle::new(config.min_interval),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut last_error: Option<FetchError> = None;

        for attempt in 0..=self.backoff.max_retries {
            self.throttle.wait_turn().await;
            let can_retry = attempt < self.backoff.max_retries;

            let resp = match self.client.get(url).send().await {
                Ok(resp) => resp,
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        warn!(attempt, error = %err, "request failed; retrying");
                        last_error = Some(FetchError::Request(err));
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            };

            let status = resp.status();
            let final_url = resp.url().to_string();

            if status == StatusCode::TOO_MANY_REQUESTS {
                if !can_retry {
                    return Err(FetchError::RateLimited {
                        url: final_url,
                        attempts: attempt + 1,
                    });
                }
                let delay = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after)
                    .unwrap_or_else(|| self.backoff.delay_for_attempt(attempt))
                    .min(self.backoff.max_delay);
                warn!(attempt, delay_secs = delay.as_secs_f64(), "rate limited; backing off");
                last_error = Some(FetchError::RateLimited {
                    url: final_url,
                    attempts: attempt + 1,
                });
                tokio::time::sleep(delay).await;
                continue;
            }

            if status.is_success() {
                let body = resp.text().await?;
                if body.contains(BLOCKED_MARKER) {
                    return Err(FetchError::Blocked {
                        host: host_of(&final_url),
                    });
                }
                return Ok(FetchedResponse {
                    status,
                    final_url,
                    body,
                });
            }

            if classify_status(status) == RetryDisposition::Retryable && can_retry {
                last_error = Some(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                continue;
            }

            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        Err(last_error.unwrap_or_else(|| FetchError::RetriesExhausted {
            url: url.to_string(),
        }))
    }
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}
