//! inara.cz crawler: station listings, station markets, station types and powerplay state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use hmw_core::{MarketObservation, PowerplayObservation, PowerplayStatus, ScanCycle};
use hmw_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "hmw-adapters";

pub const INARA_BASE_URL: &str = "https://inara.cz";
pub const COMMODITY_SEARCH_URL: &str = "https://inara.cz/elite/commodities/";
pub const DEFAULT_PRICE_THRESHOLD: i64 = 28_000;
pub const DEFAULT_STOCK_THRESHOLD: i64 = 15_000;
pub const GOLD_COMMODITY_ID: u32 = 42;
pub const PALLADIUM_COMMODITY_ID: u32 = 45;
pub const UNKNOWN_STATION_TYPE: &str = "Unknown";

const NO_COMMODITIES_MARKER: &str = "No commodities were found.";
const STATION_TYPE_CACHE_LIMIT: usize = 512;

/// What to crawl and which listings count as opportunities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchList {
    #[serde(default)]
    pub search_urls: Vec<String>,
    #[serde(default = "default_metals")]
    pub metals: Vec<String>,
    #[serde(default = "default_price_threshold")]
    pub price_threshold: i64,
    #[serde(default = "default_stock_threshold")]
    pub stock_threshold: i64,
}

fn default_metals() -> Vec<String> {
    vec!["Gold".to_string(), "Palladium".to_string()]
}

fn default_price_threshold() -> i64 {
    DEFAULT_PRICE_THRESHOLD
}

fn default_stock_threshold() -> i64 {
    DEFAULT_STOCK_THRESHOLD
}

impl Default for WatchList {
    fn default() -> Self {
        Self {
            search_urls: Vec::new(),
            metals: default_metals(),
            price_threshold: DEFAULT_PRICE_THRESHOLD,
            stock_threshold: DEFAULT_STOCK_THRESHOLD,
        }
    }
}

impl WatchList {
    pub fn is_opportunity(&self, buy_price: i64, stock: i64) -> bool {
        buy_price > self.price_threshold && stock > self.stock_threshold
    }
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("access blocked by {host}")]
    Blocked { host: String },
    #[error("rate limited fetching {url}")]
    RateLimited { url: String },
    #[error("http status {status} for {url}")]
    Http { status: u16, url: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl CrawlError {
    /// A blocked IP poisons every remaining request of the cycle.
    pub fn aborts_cycle(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

impl From<FetchError> for CrawlError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Blocked { host } => Self::Blocked { host },
            FetchError::RateLimited { url, .. } => Self::RateLimited { url },
            FetchError::HttpStatus { status, url } => Self::Http { status, url },
            FetchError::Request(err) => Self::Network(err.to_string()),
            FetchError::RetriesExhausted { url } => {
                Self::Network(format!("retries exhausted for {url}"))
            }
        }
    }
}

/// Where page bodies come from. [`HttpFetcher`] in production.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<String, CrawlError>;
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, CrawlError> {
        Ok(self.fetch_text(url).await?.body)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CrawlOutput {
    pub markets: Vec<MarketObservation>,
    pub powerplay: Vec<PowerplayObservation>,
    /// Names of every system whose market page parsed, opportunity or not.
    pub scanned_systems: HashSet<String>,
    pub stations_checked: usize,
    pub failed_pages: usize,
}

#[async_trait]
pub trait MarketCrawler: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn crawl(&self, cycle: &ScanCycle) -> Result<CrawlOutput, CrawlError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetalListingRow {
    pub metal: String,
    pub buy_price: i64,
    pub stock: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketPage {
    pub station: String,
    pub system: String,
    pub system_address: String,
    pub listings: Vec<MetalListingRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PowerplaySection {
    pub system: Option<String>,
    pub power: Option<String>,
    pub role: Option<String>,
    pub status: Option<String>,
    pub progress: Option<String>,
}

impl PowerplaySection {
    fn is_empty(&self) -> bool {
        self.power.is_none() && self.role.is_none() && self.status.is_none() && self.progress.is_none()
    }
}

pub struct InaraCrawler {
    pages: Arc<dyn PageSource>,
    watch: WatchList,
    station_types: Mutex<HashMap<String, String>>,
}

impl InaraCrawler {
    pub fn new(pages: Arc<dyn PageSource>, watch: WatchList) -> Self {
        Self {
            pages,
            watch,
            station_types: Mutex::new(HashMap::new()),
        }
    }

    fn station_type_cache(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.station_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn crawl_pages(&self) -> Result<CrawlOutput, CrawlError> {
        let mut output = CrawlOutput::default();
        let market_urls = self.collect_market_urls(&mut output).await?;
        info!(count = market_urls.len(), "found station market urls");

        // system address -> (system name, metals with an opportunity)
        let mut hits: BTreeMap<String, (String, Vec<String>)> = BTreeMap::new();

        for url in &market_urls {
            let body = match self.pages.fetch_page(url).await {
                Ok(body) => body,
                Err(err) => {
                    tolerate(url, err, &mut output)?;
                    continue;
                }
            };
            let Some(page) = parse_market_page(&body, &self.watch.metals)? else {
                warn!(url = %url, "station market page has no usable header; skipping");
                continue;
            };
            output.stations_checked += 1;
            output.scanned_systems.insert(page.system.clone());

            for row in &page.listings {
                debug!(
                    metal = %row.metal,
                    station = %page.station,
                    price = row.buy_price,
                    stock = row.stock,
                    "market row"
                );
                if !self.watch.is_opportunity(row.buy_price, row.stock) {
                    continue;
                }
                let Some(station_id) = station_id_from_url(url) else {
                    warn!(url = %url, "could not extract station id; skipping entry");
                    continue;
                };
                let station_type = self.station_type(station_id).await?;
                info!(
                    metal = %row.metal,
                    station = %page.station,
                    system = %page.system,
                    price = row.buy_price,
                    stock = row.stock,
                    "found opportunity"
                );

                let hit = hits
                    .entry(page.system_address.clone())
                    .or_insert_with(|| (page.system.clone(), Vec::new()));
                if !hit.1.contains(&row.metal) {
                    hit.1.push(row.metal.clone());
                }

                output.markets.push(MarketObservation {
                    system: page.system.clone(),
                    system_address: page.system_address.clone(),
                    station: page.station.clone(),
                    station_type,
                    url: url.clone(),
                    metal: row.metal.clone(),
                    stock: row.stock,
                });
            }
        }
        info!(stations = output.stations_checked, "market scan complete");

        for (address, (system, metals)) in &hits {
            match self.powerplay_for(address, system, metals).await {
                Ok(Some(observation)) => output.powerplay.push(observation),
                Ok(None) => {}
                Err(err) => tolerate(address, err, &mut output)?,
            }
        }

        Ok(output)
    }

    async fn collect_market_urls(&self, output: &mut CrawlOutput) -> Result<Vec<String>, CrawlError> {
        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        for search_url in &self.watch.search_urls {
            let body = match self.pages.fetch_page(search_url).await {
                Ok(body) => body,
                Err(err) => {
                    tolerate(search_url, err, output)?;
                    continue;
                }
            };
            for url in parse_station_market_urls(&body)? {
                if seen.insert(url.clone()) {
                    urls.push(url);
                }
            }
        }
        Ok(urls)
    }

    async fn station_type(&self, station_id: &str) -> Result<String, CrawlError> {
        let cached = self.station_type_cache().get(station_id).cloned();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let url = format!("{INARA_BASE_URL}/elite/station/{station_id}/");
        let station_type = match self.pages.fetch_page(&url).await {
            Ok(body) => parse_station_type(&body),
            Err(err) if err.aborts_cycle() => return Err(err),
            Err(err) => {
                warn!(url = %url, error = %err, "station type lookup failed");
                return Ok(UNKNOWN_STATION_TYPE.to_string());
            }
        };

        let mut cache = self.station_type_cache();
        if cache.len() >= STATION_TYPE_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(station_id.to_string(), station_type.clone());
        Ok(station_type)
    }

    async fn powerplay_for(
        &self,
        system_url: &str,
        system: &str,
        metals: &[String],
    ) -> Result<Option<PowerplayObservation>, CrawlError> {
        let body = self.pages.fetch_page(system_url).await?;
        let Some(section) = parse_powerplay_section(&body)? else {
            info!(system, "no powerplay section");
            return Ok(None);
        };
        info!(
            system,
            power = ?section.power,
            role = ?section.role,
            status = ?section.status,
            progress = ?section.progress,
            "powerplay info"
        );

        let status = PowerplayStatus::from(section.status.as_deref().unwrap_or_default());
        let Some(distance) = acquisition_distance(&status) else {
            debug!(system, %status, "no merit opportunity for status");
            return Ok(None);
        };

        let mut live = Vec::new();
        for url in commodity_search_urls(&commodity_ids(metals), system, distance)? {
            match self.pages.fetch_page(&url).await {
                Ok(body) if body.contains(NO_COMMODITIES_MARKER) => {}
                Ok(_) => live.push(url),
                Err(err) if err.aborts_cycle() => return Err(err),
                Err(err) => {
                    warn!(url = %url, error = %err, "commodity link check failed; keeping link");
                    live.push(url);
                }
            }
        }
        if live.is_empty() {
            debug!(system, %status, "no acquisition systems nearby");
            return Ok(None);
        }

        Ok(Some(PowerplayObservation {
            system: system.to_string(),
            system_address: system_url.to_string(),
            power: section.power.unwrap_or_default(),
            status,
            progress: section.progress.unwrap_or_default(),
            commodity_urls: mask_commodity_links(&live),
        }))
    }
}

#[async_trait]
impl MarketCrawler for InaraCrawler {
    fn source_id(&self) -> &'static str {
        "inara"
    }

    async fn crawl(&self, cycle: &ScanCycle) -> Result<CrawlOutput, CrawlError> {
        self.crawl_pages()
            .instrument(info_span!("crawl", cycle = cycle.number, cycle_id = %cycle.id))
            .await
    }
}

fn tolerate(url: &str, err: CrawlError, output: &mut CrawlOutput) -> Result<(), CrawlError> {
    if err.aborts_cycle() {
        return Err(err);
    }
    warn!(url, error = %err, "page failed; skipping");
    output.failed_pages += 1;
    Ok(())
}

fn selector(css: &str) -> Result<Selector, CrawlError> {
    Selector::parse(css).map_err(|e| CrawlError::Parse(format!("selector {css}: {e}")))
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Strips private-use glyphs and variation selectors inara decorates names with.
pub fn clean_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(*c as u32, 0xE000..=0xF8FF | 0xFE00..=0xFE0F))
        .collect::<String>()
        .trim()
        .to_string()
}

fn absolute_url(href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("{INARA_BASE_URL}{href}")
    }
}

/// Station market URLs linked from a nearest-stations page, deduplicated in page order.
pub fn parse_station_market_urls(html: &str) -> Result<Vec<String>, CrawlError> {
    let document = Html::parse_document(html);
    let links = selector("a[href]")?;
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for link in document.select(&links) {
        let Some(id) = link
            .value()
            .attr("href")
            .and_then(|href| href.strip_prefix("/elite/station/"))
            .and_then(|rest| rest.strip_suffix('/'))
        else {
            continue;
        };
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let url = format!("{INARA_BASE_URL}/elite/station-market/{id}/");
        if seen.insert(url.clone()) {
            urls.push(url);
        }
    }
    Ok(urls)
}

/// `None` when the page lacks the `<h2>` station/system header.
pub fn parse_market_page(html: &str, metals: &[String]) -> Result<Option<MarketPage>, CrawlError> {
    let document = Html::parse_document(html);
    let header_sel = selector("h2")?;
    let link_sel = selector("a[href]")?;
    let anchor_sel = selector("a")?;
    let cell_sel = selector("td")?;

    let Some(header) = document.select(&header_sel).next() else {
        return Ok(None);
    };
    let links = header.select(&link_sel).collect::<Vec<_>>();
    let [station_link, system_link, ..] = links.as_slice() else {
        return Ok(None);
    };
    let station = element_text(*station_link);
    let system = clean_name(&element_text(*system_link));
    let system_address = absolute_url(system_link.value().attr("href").unwrap_or_default());

    let mut listings = Vec::new();
    for metal in metals {
        let Some(link) = document
            .select(&anchor_sel)
            .find(|a| element_text(*a) == *metal)
        else {
            continue;
        };
        let Some(row) = link
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|e| e.value().name() == "tr")
        else {
            warn!(metal = %metal, station = %station, "no table row for metal; skipping entry");
            continue;
        };
        let cells = row.select(&cell_sel).collect::<Vec<_>>();
        let (Some(buy_price), Some(stock)) = (
            cells.get(3).and_then(data_order),
            cells.get(4).and_then(data_order),
        ) else {
            warn!(metal = %metal, station = %station, "non-numeric price or stock; skipping entry");
            continue;
        };
        listings.push(MetalListingRow {
            metal: metal.clone(),
            buy_price,
            stock,
        });
    }

    Ok(Some(MarketPage {
        station,
        system,
        system_address,
        listings,
    }))
}

fn data_order(cell: &ElementRef<'_>) -> Option<i64> {
    let raw = cell.value().attr("data-order").unwrap_or_default().trim();
    if raw.is_empty() {
        return Some(0);
    }
    raw.parse().ok()
}

pub fn station_id_from_url(url: &str) -> Option<&str> {
    url.strip_suffix('/')?
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
}

/// First station type mentioned on a station page, e.g. `Outpost (Civilian)`.
pub fn parse_station_type(html: &str) -> String {
    let document = Html::parse_document(html);
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        if locate_station_type(text).is_none() {
            continue;
        }
        let Some(parent) = node.parent().and_then(ElementRef::wrap) else {
            continue;
        };
        if matches!(parent.value().name(), "script" | "style") {
            continue;
        }
        if let Some(found) = station_type_in(&element_text(parent)) {
            return found;
        }
    }
    UNKNOWN_STATION_TYPE.to_string()
}

pub fn station_type_in(text: &str) -> Option<String> {
    locate_station_type(text).map(|(base, suffix)| match suffix {
        Some(suffix) => format!("{base} ({suffix})"),
        None => base.to_string(),
    })
}

fn locate_station_type(text: &str) -> Option<(&'static str, Option<String>)> {
    const BASES: [(&str, &str); 3] = [
        ("starport", "Starport"),
        ("outpost", "Outpost"),
        ("surface port", "Surface Port"),
    ];

    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let lower = normalized.to_ascii_lowercase();

    let mut best: Option<(usize, &'static str, usize)> = None;
    for (needle, canonical) in BASES {
        let mut from = 0;
        while let Some(pos) = lower[from..].find(needle) {
            let start = from + pos;
            let end = start + needle.len();
            if is_word_boundary(&lower, start, end) {
                if best.map_or(true, |(s, _, _)| start < s) {
                    best = Some((start, canonical, end));
                }
                break;
            }
            from = start + 1;
        }
    }

    let (_, canonical, end) = best?;
    let suffix = normalized[end..]
        .trim_start()
        .strip_prefix('(')
        .and_then(|rest| rest.find(')').map(|close| rest[..close].trim().to_string()))
        .filter(|s| !s.is_empty());
    Some((canonical, suffix))
}

fn is_word_boundary(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    before.map_or(true, |c| !c.is_alphanumeric()) && after.map_or(true, |c| !c.is_alphanumeric())
}

/// The powerplay panel of a star system page, if the page has one.
pub fn parse_powerplay_section(html: &str) -> Result<Option<PowerplaySection>, CrawlError> {
    let document = Html::parse_document(html);
    let system = document
        .select(&selector("h2")?)
        .next()
        .map(|h2| clean_name(&element_text(h2)))
        .and_then(non_empty);

    let Some(label) = document
        .select(&selector("span")?)
        .find(|span| element_text(*span).to_lowercase().contains("powerplay"))
    else {
        return Ok(None);
    };
    let Some(block) = label
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "div")
    else {
        return Ok(None);
    };

    let section = PowerplaySection {
        system,
        power: block
            .select(&selector("a[href]")?)
            .find(|a| is_power_href(a.value().attr("href").unwrap_or_default()))
            .map(element_text)
            .and_then(non_empty),
        role: block
            .select(&selector("small")?)
            .next()
            .map(|small| {
                element_text(small)
                    .trim_matches(|c| c == '(' || c == ')')
                    .to_string()
            })
            .and_then(non_empty),
        status: block
            .select(&selector("span.bigger")?)
            .next()
            .map(element_text)
            .and_then(non_empty),
        progress: block
            .select(&selector("span.negative")?)
            .next()
            .map(element_text)
            .and_then(|raw| percent_text(&raw)),
    };

    if section.is_empty() {
        return Ok(None);
    }
    Ok(Some(section))
}

fn is_power_href(href: &str) -> bool {
    href.split("/elite/power/")
        .nth(1)
        .and_then(|rest| rest.chars().next())
        .is_some_and(|c| c.is_ascii_digit())
}

fn percent_text(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    for (idx, _) in raw.match_indices('%') {
        let digits_start = raw[..idx]
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit() || *c == '.' || *c == ',')
            .last()
            .map(|(i, _)| i);
        if let Some(start) = digits_start {
            let number = raw[start..idx].trim_start_matches(['.', ',']);
            if number.bytes().any(|b| b.is_ascii_digit()) {
                return Some(format!("{number}%"));
            }
        }
    }
    Some(raw.to_string())
}

/// Search radius (ly) for acquisition systems; only controlled systems have one.
pub fn acquisition_distance(status: &PowerplayStatus) -> Option<u32> {
    match status {
        PowerplayStatus::Fortified => Some(20),
        PowerplayStatus::Stronghold => Some(30),
        _ => None,
    }
}

pub fn commodity_ids(metals: &[String]) -> Vec<u32> {
    metals
        .iter()
        .filter_map(|metal| match metal.as_str() {
            "Gold" => Some(GOLD_COMMODITY_ID),
            "Palladium" => Some(PALLADIUM_COMMODITY_ID),
            _ => None,
        })
        .collect()
}

/// One commodity search URL per id, or a single unfiltered one when `ids` is empty.
pub fn commodity_search_urls(
    ids: &[u32],
    system: &str,
    distance: u32,
) -> Result<Vec<String>, CrawlError> {
    let distance = distance.to_string();
    let tail: [(&str, &str); 13] = [
        ("ps1", system),
        ("pi10", "3"),
        ("pi11", &distance),
        ("pi3", "1"),
        ("pi9", "0"),
        ("pi4", "0"),
        ("pi8", "0"),
        ("pi13", "0"),
        ("pi5", "720"),
        ("pi12", "0"),
        ("pi7", "0"),
        ("pi14", "-1"),
        ("ps3", ""),
    ];
    let build = |id: Option<u32>| -> Result<String, CrawlError> {
        let id = id.map(|id| id.to_string());
        let mut params: Vec<(&str, &str)> = vec![("formbrief", "1"), ("pi1", "2")];
        if let Some(id) = &id {
            params.push(("pa1[]", id.as_str()));
        }
        params.extend(tail);
        Url::parse_with_params(COMMODITY_SEARCH_URL, &params)
            .map(|url| url.to_string())
            .map_err(|e| CrawlError::Parse(format!("commodity url for {system}: {e}")))
    };

    if ids.is_empty() {
        return Ok(vec![build(None)?]);
    }
    ids.iter().map(|id| build(Some(*id))).collect()
}

/// Markdown links labelled by commodity, space separated.
pub fn mask_commodity_links(urls: &[String]) -> String {
    urls.iter()
        .map(|url| {
            let label = if url.contains(&format!("pa1%5B%5D={GOLD_COMMODITY_ID}")) {
                "Sell gold here"
            } else if url.contains(&format!("pa1%5B%5D={PALLADIUM_COMMODITY_ID}")) {
                "Sell Palladium here"
            } else {
                "Sell here"
            };
            format!("[{label}]({url})")
        })
        .collect::<Vec<_>>()
        .join(" ")
}
