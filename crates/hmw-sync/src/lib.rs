//! Runtime orchestration: configuration, crawl worker, delivery scheduler and cron wiring.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hmw_adapters::{CrawlOutput, InaraCrawler, MarketCrawler, WatchList};
use hmw_core::{RecipientKind, ScanCycle};
use hmw_notify::{
    DispatchConfig, DispatchReport, Dispatcher, DiscordTransport, JsonSubscriptionDirectory,
    DEFAULT_ALERT_CHANNEL, DEFAULT_ROLE_NAME,
};
use hmw_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, MarketStore, ScanOutcome, ScanSession,
    DEFAULT_USER_AGENT,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "hmw-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub market_db_path: PathBuf,
    pub guild_prefs_path: PathBuf,
    pub dm_subscribers_path: PathBuf,
    pub guild_optout_path: PathBuf,
    pub watchlist_path: PathBuf,
    pub discord_token: Option<String>,
    pub cooldown: Duration,
    pub prune_ttl: Duration,
    pub scan_interval: Duration,
    /// Six-field cron expression (seconds first). Replaces the interval when set.
    pub scan_cron: Option<String>,
    pub http_min_interval: Duration,
    pub http_timeout: Duration,
    pub http_max_backoff: Duration,
    pub alert_queue_capacity: usize,
    pub debug_guild: Option<String>,
    pub debug_user: Option<String>,
    /// Channel looked up by name in guilds that never stored a channel.
    pub alert_channel_name: String,
    /// Role mentioned in guilds that never stored a role.
    pub alert_role_name: String,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let path = |key: &str, default: &str| PathBuf::from(text(key).unwrap_or_else(|| default.to_string()));
        let flag = |key: &str| {
            text(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(false)
        };

        let cooldown = duration_setting(lookup, "COOLDOWN_HOURS", HOUR, Duration::from_secs(48 * 3600));
        Self {
            market_db_path: path("MARKET_DB_PATH", "./data/market_database.json"),
            guild_prefs_path: path("GUILD_PREFS_PATH", "./guild_prefs.json"),
            dm_subscribers_path: path("DM_SUBSCRIBERS_PATH", "./dm_subscribers.json"),
            guild_optout_path: path("GUILD_OPTOUT_PATH", "./guild_optout.json"),
            watchlist_path: path("WATCHLIST_PATH", "./watchlist.yaml"),
            discord_token: text("DISCORD_TOKEN"),
            cooldown,
            prune_ttl: duration_setting(lookup, "PRUNE_TTL_HOURS", HOUR, cooldown),
            scan_interval: duration_setting(
                lookup,
                "GOLD_MONITOR_INTERVAL_SECONDS",
                SECOND,
                Duration::from_secs(1800),
            ),
            scan_cron: text("SCAN_CRON"),
            http_min_interval: duration_setting(lookup, "GOLD_HTTP_COOLDOWN", SECOND, Duration::from_secs(1)),
            http_timeout: duration_setting(lookup, "GOLD_HTTP_TIMEOUT", SECOND, Duration::from_secs(15)),
            http_max_backoff: duration_setting(
                lookup,
                "GOLD_HTTP_MAX_BACKOFF",
                SECOND,
                Duration::from_secs(60),
            ),
            alert_queue_capacity: text("ALERT_QUEUE_CAPACITY")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(100),
            debug_guild: if flag("DEBUG_MODE") { text("DEBUG_SERVER_ID") } else { None },
            debug_user: if flag("DEBUG_MODE_DMS") { text("DEBUG_USER_ID") } else { None },
            alert_channel_name: text("ALERT_CHANNEL_NAME")
                .unwrap_or_else(|| DEFAULT_ALERT_CHANNEL.to_string()),
            alert_role_name: text("ROLE_NAME").unwrap_or_else(|| DEFAULT_ROLE_NAME.to_string()),
            user_agent: text("HMW_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            cooldown: self.cooldown,
            debug_guild: self.debug_guild.clone(),
            debug_user: self.debug_user.clone(),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
            min_interval: self.http_min_interval,
            backoff: BackoffPolicy {
                max_delay: self.http_max_backoff,
                ..BackoffPolicy::default()
            },
        }
    }

    pub fn subscription_directory(&self) -> JsonSubscriptionDirectory {
        JsonSubscriptionDirectory::new(
            &self.guild_prefs_path,
            &self.dm_subscribers_path,
            &self.guild_optout_path,
        )
        .with_default_names(&self.alert_channel_name, &self.alert_role_name)
    }
}

const SECOND: Duration = Duration::from_secs(1);
const HOUR: Duration = Duration::from_secs(3600);

fn duration_setting(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    unit: Duration,
    default: Duration,
) -> Duration {
    let Some(raw) = lookup(key).filter(|v| !v.trim().is_empty()) else {
        return default;
    };
    let parsed = raw
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .and_then(|v| Duration::try_from_secs_f64(unit.as_secs_f64() * v).ok());
    match parsed {
        Some(duration) => duration,
        None => {
            warn!(key, value = %raw, "unparseable duration setting; using default");
            default
        }
    }
}

pub fn load_watch_list(path: &Path) -> Result<WatchList> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let watch: WatchList =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if watch.search_urls.is_empty() {
        warn!(path = %path.display(), "watch list has no search urls; crawls will find nothing");
    }
    Ok(watch)
}

/// Sent by the crawl worker once a cycle's writes are durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleComplete {
    pub cycle: ScanCycle,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub cycle: ScanCycle,
    pub finished_at: DateTime<Utc>,
    pub markets_written: usize,
    pub powerplay_written: usize,
    pub scanned_systems: usize,
    pub stations_checked: usize,
    pub failed_pages: usize,
    pub pruned: Vec<String>,
}

/// Delay before restarting a failed crawl.
#[derive(Debug, Clone, Copy)]
pub struct RestartBackoff {
    pub base: Duration,
    pub max: Duration,
    pub warn_after: u32,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(3600),
            warn_after: 5,
        }
    }
}

impl RestartBackoff {
    pub fn delay_after(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// What wakes the crawl worker between cycles.
pub enum ScanTrigger {
    Interval(Duration),
    Signals(mpsc::Receiver<()>),
}

impl ScanTrigger {
    /// False once no further trigger can arrive.
    async fn wait(&mut self) -> bool {
        match self {
            Self::Interval(every) => {
                tokio::time::sleep(*every).await;
                true
            }
            Self::Signals(rx) => rx.recv().await.is_some(),
        }
    }
}

pub struct CrawlWorker {
    session: Arc<ScanSession>,
    crawler: Arc<dyn MarketCrawler>,
    alerts: mpsc::Sender<CycleComplete>,
    backoff: RestartBackoff,
}

impl CrawlWorker {
    pub fn new(
        session: Arc<ScanSession>,
        crawler: Arc<dyn MarketCrawler>,
        alerts: mpsc::Sender<CycleComplete>,
    ) -> Self {
        Self {
            session,
            crawler,
            alerts,
            backoff: RestartBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: RestartBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// One complete cycle. A failed crawl closes the cycle without pruning
    /// and sends no signal.
    pub async fn run_cycle(&self) -> Result<ScanReport> {
        let cycle = self.session.begin_scan();
        match self.crawl_and_record(cycle).await {
            Ok(report) => {
                self.announce(CycleComplete { cycle });
                Ok(report)
            }
            Err(err) => {
                self.session.abandon_scan();
                Err(err)
            }
        }
    }

    async fn crawl_and_record(&self, cycle: ScanCycle) -> Result<ScanReport> {
        let output = self.crawler.crawl(&cycle).await.with_context(|| {
            format!("crawling {} for cycle {}", self.crawler.source_id(), cycle.number)
        })?;

        let mut report = ScanReport {
            cycle,
            finished_at: Utc::now(),
            markets_written: output.markets.len(),
            powerplay_written: output.powerplay.len(),
            scanned_systems: output.scanned_systems.len(),
            stations_checked: output.stations_checked,
            failed_pages: output.failed_pages,
            pruned: Vec::new(),
        };

        let session = Arc::clone(&self.session);
        let outcome = tokio::task::spawn_blocking(move || record_output(&session, &output))
            .await
            .context("crawl writer task failed")??;
        report.finished_at = Utc::now();
        report.pruned = outcome.prune.pruned;
        Ok(report)
    }

    fn announce(&self, signal: CycleComplete) {
        match self.alerts.try_send(signal) {
            Ok(()) => debug!(cycle = signal.cycle.number, "cycle signal queued"),
            Err(TrySendError::Full(dropped)) => {
                warn!(cycle = dropped.cycle.number, "alert queue full; dropping cycle signal")
            }
            Err(TrySendError::Closed(dropped)) => {
                warn!(cycle = dropped.cycle.number, "delivery scheduler gone; dropping cycle signal")
            }
        }
    }

    /// Crawls until `shutdown` flips. Failures restart the crawl after an
    /// exponential backoff instead of waiting for the next trigger.
    pub async fn run(self, mut trigger: ScanTrigger, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_cycle().await {
                Ok(report) => {
                    failures = 0;
                    info!(
                        cycle = report.cycle.number,
                        markets = report.markets_written,
                        powerplay = report.powerplay_written,
                        scanned = report.scanned_systems,
                        failed_pages = report.failed_pages,
                        "crawl cycle complete"
                    );
                }
                Err(err) => {
                    failures += 1;
                    let delay = self.backoff.delay_after(failures);
                    error!(error = ?err, failures, retry_in = ?delay, "crawl cycle failed");
                    if failures >= self.backoff.warn_after {
                        warn!(failures, "crawler keeps failing; check connectivity or an IP block");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            }

            tokio::select! {
                more = trigger.wait() => {
                    if !more {
                        warn!("scan trigger closed; stopping crawl worker");
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("crawl worker stopped");
    }
}

/// Writes a crawl's observations and closes the cycle. Blocking file I/O.
fn record_output(session: &ScanSession, output: &CrawlOutput) -> Result<ScanOutcome> {
    let store = session.store();
    for market in &output.markets {
        store.write_market_entry(market).with_context(|| {
            format!("recording {} at {} in {}", market.metal, market.station, market.system)
        })?;
    }
    for block in &output.powerplay {
        store
            .write_powerplay_entry(block)
            .with_context(|| format!("recording powerplay for {}", block.system))?;
    }
    session
        .end_scan(&output.scanned_systems)
        .context("closing scan cycle")
}

/// Runs a dispatch pass per completed cycle and drops DM subscribers
/// that can no longer be reached.
pub struct DeliveryScheduler {
    dispatcher: Arc<Dispatcher>,
    subscribers: Arc<JsonSubscriptionDirectory>,
}

impl DeliveryScheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, subscribers: Arc<JsonSubscriptionDirectory>) -> Self {
        Self {
            dispatcher,
            subscribers,
        }
    }

    pub async fn deliver(&self, cycle: &ScanCycle) -> Result<DispatchReport> {
        let report = self.dispatcher.dispatch(cycle).await?;
        for recipient in &report.unreachable {
            if recipient.kind != RecipientKind::User {
                warn!(recipient = %recipient, "guild channel unreachable; check bot permissions");
                continue;
            }
            let subscribers = Arc::clone(&self.subscribers);
            let user_id = recipient.id.clone();
            let discarded = tokio::task::spawn_blocking(move || subscribers.discard_subscriber(&user_id))
                .await
                .context("unsubscribe task failed")
                .and_then(|result| result);
            match discarded {
                Ok(true) => info!(recipient = %recipient, "unsubscribed unreachable user"),
                Ok(false) => debug!(recipient = %recipient, "unreachable user already unsubscribed"),
                Err(err) => error!(recipient = %recipient, error = ?err, "could not unsubscribe user"),
            }
        }
        Ok(report)
    }

    /// Returns once every sender is gone and the queue is drained.
    pub async fn run(self, mut signals: mpsc::Receiver<CycleComplete>) {
        while let Some(signal) = signals.recv().await {
            if let Err(err) = self.deliver(&signal.cycle).await {
                error!(cycle = signal.cycle.number, error = ?err, "dispatch pass failed");
            }
        }
        info!("delivery scheduler stopped");
    }
}

pub async fn maybe_build_scan_scheduler(
    cron: Option<&str>,
    trigger: mpsc::Sender<()>,
) -> Result<Option<JobScheduler>> {
    let Some(cron) = cron else {
        return Ok(None);
    };

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let trigger = trigger.clone();
        Box::pin(async move {
            if trigger.try_send(()).is_err() {
                warn!("scan already pending; cron tick skipped");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub fn open_store(config: &SyncConfig) -> Arc<MarketStore> {
    Arc::new(MarketStore::open(&config.market_db_path))
}

pub fn build_crawler(config: &SyncConfig) -> Result<Arc<dyn MarketCrawler>> {
    let watch = load_watch_list(&config.watchlist_path)?;
    let fetcher = HttpFetcher::new(config.http_config()).context("building inara http client")?;
    Ok(Arc::new(InaraCrawler::new(Arc::new(fetcher), watch)))
}

pub fn build_dispatcher(
    config: &SyncConfig,
    store: Arc<MarketStore>,
    directory: Arc<JsonSubscriptionDirectory>,
) -> Result<Dispatcher> {
    let token = config
        .discord_token
        .clone()
        .context("DISCORD_TOKEN is not set")?;
    let transport = Arc::new(DiscordTransport::new(token, config.http_timeout)?);
    Ok(Dispatcher::new(
        store,
        transport.clone(),
        directory,
        config.dispatch_config(),
    )
    .with_roster(transport))
}

fn scan_session(config: &SyncConfig, store: Arc<MarketStore>) -> Arc<ScanSession> {
    Arc::new(ScanSession::new(store).with_prune_ttl(config.prune_ttl))
}

pub async fn run_scan_once_from_env() -> Result<ScanReport> {
    let config = SyncConfig::from_env();
    let store = open_store(&config);
    let crawler = build_crawler(&config)?;
    let (alerts, _ignored) = mpsc::channel(1);
    let worker = CrawlWorker::new(scan_session(&config, store), crawler, alerts);
    worker.run_cycle().await
}

pub async fn run_dispatch_once_from_env() -> Result<DispatchReport> {
    let config = SyncConfig::from_env();
    let store = open_store(&config);
    let directory = Arc::new(config.subscription_directory());
    let dispatcher = build_dispatcher(&config, store, Arc::clone(&directory))?;
    DeliveryScheduler::new(Arc::new(dispatcher), directory)
        .deliver(&ScanCycle::new(0))
        .await
}

/// Runs the crawl worker and delivery scheduler until `shutdown` flips.
pub async fn run_service(config: SyncConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let store = open_store(&config);
    let directory = Arc::new(config.subscription_directory());
    let dispatcher = Arc::new(build_dispatcher(&config, Arc::clone(&store), Arc::clone(&directory))?);
    let crawler = build_crawler(&config)?;

    let (alerts_tx, alerts_rx) = mpsc::channel(config.alert_queue_capacity);
    let worker = CrawlWorker::new(scan_session(&config, Arc::clone(&store)), crawler, alerts_tx);
    let delivery = DeliveryScheduler::new(dispatcher, directory);

    let (trigger_tx, trigger_rx) = mpsc::channel(1);
    let mut scheduler = maybe_build_scan_scheduler(config.scan_cron.as_deref(), trigger_tx).await?;
    let trigger = match &scheduler {
        Some(sched) => {
            sched.start().await.context("starting scan scheduler")?;
            ScanTrigger::Signals(trigger_rx)
        }
        None => ScanTrigger::Interval(config.scan_interval),
    };

    info!(
        store = %store.describe(),
        cooldown_hours = config.cooldown.as_secs_f64() / 3600.0,
        cron = ?config.scan_cron,
        interval_secs = config.scan_interval.as_secs(),
        "hidden market watch starting"
    );

    let delivery_task = tokio::spawn(delivery.run(alerts_rx));
    worker.run(trigger, shutdown).await;
    delivery_task.await.context("delivery scheduler task failed")?;

    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping scan scheduler")?;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemSummary {
    pub system: String,
    pub system_address: String,
    pub stations: usize,
    pub listings: usize,
    pub powerplay: Option<String>,
    pub active_cooldowns: usize,
    pub last_alert: Option<DateTime<Utc>>,
}

/// Per-system overview of the store. A cooldown counts as active while
/// younger than `cooldown`.
pub fn summarize_store(store: &MarketStore, cooldown: Duration) -> Result<Vec<SystemSummary>> {
    let document = store.read_all_entries().context("reading market store")?;
    let now = store.now();
    let window = cooldown.as_secs_f64();

    Ok(document
        .systems
        .iter()
        .map(|(name, system)| {
            let newest = system.newest_cooldown();
            SystemSummary {
                system: name.clone(),
                system_address: system.system_address.clone(),
                stations: system.stations.len(),
                listings: system.stations.values().map(|s| s.metals.len()).sum(),
                powerplay: system
                    .powerplay
                    .as_ref()
                    .map(|pp| format!("{} ({})", pp.power, pp.status)),
                active_cooldowns: system
                    .cooldown_timestamps()
                    .filter(|ts| now - ts < window)
                    .count(),
                last_alert: newest.and_then(timestamp_to_utc),
            }
        })
        .collect())
}

fn timestamp_to_utc(ts: f64) -> Option<DateTime<Utc>> {
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1e9) as u32;
    DateTime::from_timestamp(secs as i64, nanos)
}
