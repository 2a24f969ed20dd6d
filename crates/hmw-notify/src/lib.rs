//! Fan-out dispatch: preference filtering, cooldown gating, batched delivery and cycle pings.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmw_core::{
    CooldownKey, EntryRef, MarketDocument, PowerplayStatus, PreferenceSet, RecipientKey,
    RecipientKind, ScanCycle,
};
use hmw_storage::{write_atomic, MarketStore, StoreError};
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hmw-notify";

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(48 * 3600);
pub const DEFAULT_ALERT_CHANNEL: &str = "market-watch";
pub const DEFAULT_ROLE_NAME: &str = "Market Alert";

/// Discord error code for "Cannot send messages to this user".
const DISCORD_CANNOT_MESSAGE_USER: u64 = 50007;
const DISCORD_GUILD_PAGE: usize = 200;
const GUILD_TEXT: u8 = 0;
const GUILD_ANNOUNCEMENT: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeliveryTarget {
    Channel(String),
    /// A guild channel known only by name until it is looked up.
    NamedChannel { guild_id: String, name: String },
    DirectMessage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub content: String,
    pub mention_role: Option<String>,
}

impl OutboundMessage {
    pub fn new(body: String, mention_role: Option<String>) -> Self {
        let content = match &mention_role {
            Some(role) => format!("{}{body}", mention_prefix(role)),
            None => body,
        };
        Self {
            content,
            mention_role,
        }
    }
}

fn mention_prefix(role: &str) -> String {
    format!("<@&{role}>\n")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("recipient unreachable: {0}")]
    Unreachable(String),
    #[error("delivery rejected with status {status}")]
    Rejected { status: u16 },
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("rate limited by transport")]
    RateLimited,
    #[error("cannot resolve delivery target: {0}")]
    Unresolved(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, target: &DeliveryTarget, message: &OutboundMessage) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GuildChannel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: u8,
    #[serde(default)]
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GuildRole {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Guild membership and the name lookups needed for guilds that never
/// stored a channel or role id.
#[async_trait]
pub trait GuildRoster: Send + Sync {
    async fn joined_guilds(&self) -> Result<Vec<String>, DeliveryError>;
    async fn channels(&self, guild_id: &str) -> Result<Vec<GuildChannel>, DeliveryError>;
    async fn roles(&self, guild_id: &str) -> Result<Vec<GuildRole>, DeliveryError>;
}

/// First text channel called `name` (any case), in sidebar order.
pub fn find_text_channel<'a>(channels: &'a [GuildChannel], name: &str) -> Option<&'a GuildChannel> {
    let name = name.to_lowercase();
    channels
        .iter()
        .filter(|c| matches!(c.kind, GUILD_TEXT | GUILD_ANNOUNCEMENT) && c.name.to_lowercase() == name)
        .min_by_key(|c| (c.position, c.id.parse::<u64>().unwrap_or(u64::MAX)))
}

pub fn find_role<'a>(roles: &'a [GuildRole], name: &str) -> Option<&'a GuildRole> {
    let name = name.to_lowercase();
    roles.iter().find(|r| r.name.to_lowercase() == name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientProfile {
    pub key: RecipientKey,
    pub target: DeliveryTarget,
    pub preferences: PreferenceSet,
    pub opted_out: bool,
    pub role_id: Option<String>,
    /// Looked up through the roster when `role_id` is unset.
    pub role_name: Option<String>,
    pub pings_enabled: bool,
}

impl RecipientProfile {
    pub fn guild(id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            key: RecipientKey::guild(id),
            target: DeliveryTarget::Channel(channel_id.into()),
            preferences: PreferenceSet::default(),
            opted_out: false,
            role_id: None,
            role_name: None,
            pings_enabled: true,
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            key: RecipientKey::user(id.clone()),
            target: DeliveryTarget::DirectMessage(id),
            preferences: PreferenceSet::default(),
            opted_out: false,
            role_id: None,
            role_name: None,
            pings_enabled: false,
        }
    }

    pub fn with_preferences(mut self, preferences: PreferenceSet) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn with_role(mut self, role_id: impl Into<String>) -> Self {
        self.role_id = Some(role_id.into());
        self
    }
}

pub trait SubscriptionDirectory: Send + Sync {
    /// `joined_guilds` is every guild the bot sits in, when known. Without it
    /// only guilds with stored preferences are returned.
    fn recipients(&self, joined_guilds: Option<&[String]>) -> Result<Vec<RecipientProfile>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum Snowflake {
    Number(u64),
    Text(String),
}

impl Snowflake {
    fn as_string(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(text) => text.trim().to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct GuildEntry {
    #[serde(default)]
    channel_id: Option<Snowflake>,
    #[serde(default)]
    channel_name: Option<String>,
    #[serde(default)]
    role_id: Option<Snowflake>,
    #[serde(default)]
    role_name: Option<String>,
    #[serde(default)]
    pings_enabled: Option<bool>,
    #[serde(default, deserialize_with = "loose_preferences")]
    preferences: PreferenceSet,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LoosePreferences {
    Set(PreferenceSet),
    Other(IgnoredAny),
}

fn loose_preferences<'de, D>(deserializer: D) -> Result<PreferenceSet, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match LoosePreferences::deserialize(deserializer)? {
        LoosePreferences::Set(set) => set,
        LoosePreferences::Other(_) => PreferenceSet::default(),
    })
}

/// Parsed `guild_prefs.json`. Malformed entries are skipped one by one so a
/// single bad record never hides every other recipient.
#[derive(Debug, Default)]
struct GuildPrefs {
    guilds: BTreeMap<String, GuildEntry>,
    users: BTreeMap<String, PreferenceSet>,
}

impl GuildPrefs {
    fn load(path: &Path) -> Result<Self> {
        let raw: Value = read_json_or_default(path)?;
        let (guilds, users) = match raw {
            Value::Object(mut map) if map.contains_key("guilds") || map.contains_key("users") => {
                (map.remove("guilds"), map.remove("users"))
            }
            // Older files are a flat map of guild ids.
            Value::Object(map) => (Some(Value::Object(map)), None),
            Value::Null => (None, None),
            _ => {
                warn!(path = %path.display(), "guild preferences are not a JSON object; ignoring");
                (None, None)
            }
        };
        Ok(Self {
            guilds: parse_block(guilds, path, "guild"),
            users: parse_block(users, path, "user"),
        })
    }
}

fn parse_block<T: DeserializeOwned>(block: Option<Value>, path: &Path, kind: &str) -> BTreeMap<String, T> {
    let map = match block {
        None | Some(Value::Null) => return BTreeMap::new(),
        Some(Value::Object(map)) => map,
        Some(_) => {
            warn!(path = %path.display(), kind, "preference block is not an object; ignoring");
            return BTreeMap::new();
        }
    };
    map.into_iter()
        .filter_map(|(id, value)| match serde_json::from_value::<T>(value) {
            Ok(entry) => Some((id.trim().to_string(), entry)),
            Err(err) => {
                warn!(path = %path.display(), kind, id = %id, error = %err, "skipping malformed preference entry");
                None
            }
        })
        .collect()
}

fn sanitize_name(raw: Option<&str>, sigil: char) -> Option<String> {
    raw.map(|name| name.trim().trim_start_matches(sigil).trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Reads `guild_prefs.json`, `dm_subscribers.json` and `guild_optout.json`.
#[derive(Debug)]
pub struct JsonSubscriptionDirectory {
    guild_prefs: PathBuf,
    dm_subscribers: PathBuf,
    guild_optout: PathBuf,
    default_channel: String,
    default_role: String,
    write_lock: Mutex<()>,
}

impl JsonSubscriptionDirectory {
    pub fn new(
        guild_prefs: impl Into<PathBuf>,
        dm_subscribers: impl Into<PathBuf>,
        guild_optout: impl Into<PathBuf>,
    ) -> Self {
        Self {
            guild_prefs: guild_prefs.into(),
            dm_subscribers: dm_subscribers.into(),
            guild_optout: guild_optout.into(),
            default_channel: DEFAULT_ALERT_CHANNEL.to_string(),
            default_role: DEFAULT_ROLE_NAME.to_string(),
            write_lock: Mutex::new(()),
        }
    }

    /// Channel and role names used for guilds that stored neither an id nor a name.
    pub fn with_default_names(mut self, channel: &str, role: &str) -> Self {
        if let Some(channel) = sanitize_name(Some(channel), '#') {
            self.default_channel = channel;
        }
        if let Some(role) = sanitize_name(Some(role), '@') {
            self.default_role = role;
        }
        self
    }

    /// Drops a DM subscriber. Returns whether the user was subscribed.
    pub fn discard_subscriber(&self, user_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current: Vec<Snowflake> = read_json_or_default(&self.dm_subscribers)?;
        let before = current.len();
        let remaining = current
            .into_iter()
            .filter(|id| id.as_string() != user_id)
            .collect::<Vec<_>>();
        if remaining.len() == before {
            return Ok(false);
        }

        let bytes = serde_json::to_vec_pretty(&remaining).context("serializing dm subscribers")?;
        write_atomic(&self.dm_subscribers, &bytes)
            .with_context(|| format!("writing {}", self.dm_subscribers.display()))?;
        info!(user = user_id, "removed unreachable DM subscriber");
        Ok(true)
    }

    fn guild_profile(
        &self,
        guild_id: &str,
        entry: Option<&GuildEntry>,
        opted_out: &HashSet<String>,
    ) -> RecipientProfile {
        let fallback = GuildEntry::default();
        let entry = entry.unwrap_or(&fallback);
        let target = match &entry.channel_id {
            Some(channel_id) => DeliveryTarget::Channel(channel_id.as_string()),
            None => DeliveryTarget::NamedChannel {
                guild_id: guild_id.to_string(),
                name: sanitize_name(entry.channel_name.as_deref(), '#')
                    .unwrap_or_else(|| self.default_channel.clone()),
            },
        };
        RecipientProfile {
            key: RecipientKey::guild(guild_id),
            target,
            preferences: entry.preferences.normalized(),
            opted_out: opted_out.contains(guild_id),
            role_id: entry.role_id.as_ref().map(Snowflake::as_string),
            role_name: Some(
                sanitize_name(entry.role_name.as_deref(), '@')
                    .unwrap_or_else(|| self.default_role.clone()),
            ),
            pings_enabled: entry.pings_enabled.unwrap_or(true),
        }
    }
}

impl SubscriptionDirectory for JsonSubscriptionDirectory {
    fn recipients(&self, joined_guilds: Option<&[String]>) -> Result<Vec<RecipientProfile>> {
        let prefs = GuildPrefs::load(&self.guild_prefs)?;
        let opted_out = read_json_or_default::<Vec<Snowflake>>(&self.guild_optout)?
            .iter()
            .map(Snowflake::as_string)
            .collect::<HashSet<_>>();
        let subscribers: Vec<Snowflake> = read_json_or_default(&self.dm_subscribers)?;

        let guild_ids = match joined_guilds {
            Some(joined) => joined.to_vec(),
            None => prefs.guilds.keys().cloned().collect(),
        };

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for guild_id in guild_ids {
            if seen.insert(guild_id.clone()) {
                out.push(self.guild_profile(&guild_id, prefs.guilds.get(&guild_id), &opted_out));
            }
        }

        let mut seen = HashSet::new();
        for subscriber in &subscribers {
            let user_id = subscriber.as_string();
            if !seen.insert(user_id.clone()) {
                continue;
            }
            let preferences = prefs
                .users
                .get(&user_id)
                .map(PreferenceSet::normalized)
                .unwrap_or_default();
            out.push(RecipientProfile::user(user_id).with_preferences(preferences));
        }

        Ok(out)
    }
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match fs::read_to_string(path) {
        Ok(data) if data.trim().is_empty() => Ok(T::default()),
        Ok(data) => {
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Remembers which recipients had their role mentioned in the current cycle.
#[derive(Debug, Default)]
pub struct CyclePingLedger {
    state: Mutex<PingState>,
}

#[derive(Debug, Default)]
struct PingState {
    cycle: Option<Uuid>,
    pinged: HashSet<RecipientKey>,
}

impl CyclePingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time `recipient` is claimed within `cycle`.
    pub fn claim(&self, cycle: Uuid, recipient: &RecipientKey) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.cycle != Some(cycle) {
            state.cycle = Some(cycle);
            state.pinged.clear();
        }
        state.pinged.insert(recipient.clone())
    }

    /// Undoes a claim whose message never arrived.
    pub fn release(&self, cycle: Uuid, recipient: &RecipientKey) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.cycle == Some(cycle) {
            state.pinged.remove(recipient);
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub cooldown: Duration,
    /// When set, only this guild is notified.
    pub debug_guild: Option<String>,
    /// When set, only this user is notified.
    pub debug_user: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            debug_guild: None,
            debug_user: None,
        }
    }
}

impl DispatchConfig {
    fn admits(&self, profile: &RecipientProfile) -> bool {
        let only = match profile.key.kind {
            RecipientKind::Guild => {
                if profile.opted_out {
                    debug!(recipient = %profile.key, "guild opted out");
                    return false;
                }
                self.debug_guild.as_deref()
            }
            RecipientKind::User => self.debug_user.as_deref(),
        };
        match only {
            Some(only) if only != profile.key.id => {
                debug!(recipient = %profile.key, "outside debug allow-list");
                false
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketCandidate {
    pub system: String,
    pub system_address: String,
    pub station: String,
    pub station_type: String,
    pub url: String,
    pub metal: String,
    pub stock: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PowerplayCandidate {
    pub system: String,
    pub system_address: String,
    pub power: String,
    pub status: PowerplayStatus,
    pub commodity_urls: String,
}

/// An entry that passed a recipient's preference filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    Market(MarketCandidate),
    Powerplay(PowerplayCandidate),
}

impl Candidate {
    pub fn system(&self) -> &str {
        match self {
            Self::Market(m) => &m.system,
            Self::Powerplay(p) => &p.system,
        }
    }

    pub fn entry(&self) -> EntryRef {
        match self {
            Self::Market(m) => EntryRef::market(&m.system, &m.station, &m.metal),
            Self::Powerplay(p) => EntryRef::powerplay(&p.system),
        }
    }
}

/// Every entry in `document` that `preferences` admits. Powerplay blocks only
/// qualify for controlled systems.
pub fn collect_candidates(document: &MarketDocument, preferences: &PreferenceSet) -> Vec<Candidate> {
    let mut out = Vec::new();
    for (system_name, system) in &document.systems {
        for (station_name, station) in &system.stations {
            for (metal, listing) in &station.metals {
                if !preferences.accepts_market(&station.station_type, metal) {
                    continue;
                }
                out.push(Candidate::Market(MarketCandidate {
                    system: system_name.clone(),
                    system_address: system.system_address.clone(),
                    station: station_name.clone(),
                    station_type: station.station_type.clone(),
                    url: station.url.clone(),
                    metal: metal.clone(),
                    stock: listing.stock,
                }));
            }
        }
        if let Some(block) = &system.powerplay {
            if block.status.is_opportunity() && preferences.accepts_powerplay(&block.power) {
                out.push(Candidate::Powerplay(PowerplayCandidate {
                    system: system_name.clone(),
                    system_address: system.system_address.clone(),
                    power: block.power.clone(),
                    status: block.status.clone(),
                    commodity_urls: block.commodity_urls.clone(),
                }));
            }
        }
    }
    out
}

#[derive(Default)]
struct SystemSection<'a> {
    name: &'a str,
    address: &'a str,
    stations: Vec<StationLine<'a>>,
    powerplay: Vec<&'a PowerplayCandidate>,
}

struct StationLine<'a> {
    name: &'a str,
    station_type: &'a str,
    url: &'a str,
    metals: Vec<(&'a str, i64)>,
}

/// Candidates grouped by system, in first-seen order.
fn group_by_system(candidates: &[Candidate]) -> Vec<(&str, Vec<&Candidate>)> {
    let mut groups: Vec<(&str, Vec<&Candidate>)> = Vec::new();
    for candidate in candidates {
        match groups.iter_mut().find(|(name, _)| *name == candidate.system()) {
            Some((_, members)) => members.push(candidate),
            None => groups.push((candidate.system(), vec![candidate])),
        }
    }
    groups
}

fn render_system<'a>(name: &'a str, members: &[&'a Candidate]) -> String {
    let mut section = SystemSection {
        name,
        ..SystemSection::default()
    };
    for &candidate in members {
        match candidate {
            Candidate::Market(m) => {
                section.address = m.system_address.as_str();
                let station_idx = match section.stations.iter().position(|s| s.name == m.station) {
                    Some(idx) => idx,
                    None => {
                        section.stations.push(StationLine {
                            name: &m.station,
                            station_type: &m.station_type,
                            url: &m.url,
                            metals: Vec::new(),
                        });
                        section.stations.len() - 1
                    }
                };
                section.stations[station_idx]
                    .metals
                    .push((m.metal.as_str(), m.stock));
            }
            Candidate::Powerplay(p) => {
                if section.address.is_empty() {
                    section.address = p.system_address.as_str();
                }
                section.powerplay.push(p);
            }
        }
    }
    render_section(&section)
}

fn render_section(section: &SystemSection<'_>) -> String {
    let mut lines = Vec::new();
    if !section.stations.is_empty() {
        let address = if section.address.is_empty() {
            "Unknown address".to_string()
        } else {
            format!("<{}>", section.address)
        };
        lines.push(format!("Hidden markets detected in {} ({address}):", section.name));
        for station in &section.stations {
            let metals = station
                .metals
                .iter()
                .map(|(metal, stock)| format!("{metal} stock: {stock}"))
                .collect::<Vec<_>>()
                .join("; ");
            lines.push(format!(
                "- {} ({}), <{}> - {metals}",
                station.name, station.station_type, station.url
            ));
        }
    }
    for pp in &section.powerplay {
        let mut line = format!("{} is a {} {} system.", pp.system, pp.power, pp.status);
        if !pp.commodity_urls.is_empty() {
            line.push_str(
                "\nYou can earn merits by trading for a large profit in these acquisition systems: ",
            );
            line.push_str(&pp.commodity_urls);
        }
        lines.push(line);
    }
    lines.join("\n")
}

/// Renders one message body: a block per system, one line per station.
pub fn build_message(candidates: &[Candidate]) -> String {
    group_by_system(candidates)
        .iter()
        .map(|(name, members)| render_system(name, members))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// One message worth of whole system sections, plus the entries it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePart {
    pub body: String,
    pub entries: Vec<EntryRef>,
}

/// Packs system sections into bodies of at most `limit` characters, holding
/// `first_reserve` back on the first part for the role mention. A section
/// longer than `limit` on its own travels alone.
pub fn plan_message_parts(candidates: &[Candidate], limit: usize, first_reserve: usize) -> Vec<MessagePart> {
    let mut parts = Vec::new();
    let mut body = String::new();
    let mut body_len = 0usize;
    let mut entries = Vec::new();

    for (name, members) in group_by_system(candidates) {
        let text = render_system(name, &members);
        let text_len = text.chars().count();
        let budget = if parts.is_empty() {
            limit.saturating_sub(first_reserve)
        } else {
            limit
        };
        if !body.is_empty() && body_len + 2 + text_len > budget {
            parts.push(MessagePart {
                body: std::mem::take(&mut body),
                entries: std::mem::take(&mut entries),
            });
            body_len = 0;
        }
        if !body.is_empty() {
            body.push_str("\n\n");
            body_len += 2;
        }
        body.push_str(&text);
        body_len += text_len;
        entries.extend(members.iter().map(|candidate| candidate.entry()));
    }
    if !body.is_empty() {
        parts.push(MessagePart { body, entries });
    }
    parts
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientOutcome {
    Sent {
        recipient: RecipientKey,
        entries: usize,
        /// Entries left due because a later part failed.
        undelivered: usize,
        /// `None` when the cooldown write failed after delivery.
        marked: Option<usize>,
        pinged: bool,
    },
    Empty {
        recipient: RecipientKey,
    },
    Failed {
        recipient: RecipientKey,
        error: String,
    },
    Unreachable {
        recipient: RecipientKey,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub cycle: u64,
    pub considered: usize,
    pub sent: usize,
    /// Recipients that got some parts of their message but not all.
    pub partial: usize,
    pub skipped_empty: usize,
    pub failed: usize,
    pub unreachable: Vec<RecipientKey>,
    pub pings: usize,
    pub marked: usize,
    pub mark_failures: usize,
}

impl DispatchReport {
    fn new(cycle: u64) -> Self {
        Self {
            cycle,
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: RecipientOutcome) {
        match outcome {
            RecipientOutcome::Sent {
                undelivered,
                marked,
                pinged,
                ..
            } => {
                self.sent += 1;
                if undelivered > 0 {
                    self.partial += 1;
                }
                match marked {
                    Some(n) => self.marked += n,
                    None => self.mark_failures += 1,
                }
                if pinged {
                    self.pings += 1;
                }
            }
            RecipientOutcome::Empty { .. } => self.skipped_empty += 1,
            RecipientOutcome::Failed { .. } => self.failed += 1,
            RecipientOutcome::Unreachable { recipient } => self.unreachable.push(recipient),
        }
    }
}

pub struct Dispatcher {
    store: Arc<MarketStore>,
    transport: Arc<dyn Transport>,
    directory: Arc<dyn SubscriptionDirectory>,
    roster: Option<Arc<dyn GuildRoster>>,
    pings: Arc<CyclePingLedger>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<MarketStore>,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn SubscriptionDirectory>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            transport,
            directory,
            roster: None,
            pings: Arc::new(CyclePingLedger::new()),
            config,
        }
    }

    /// Enables delivery to every joined guild and name-based channel and role lookup.
    pub fn with_roster(mut self, roster: Arc<dyn GuildRoster>) -> Self {
        self.roster = Some(roster);
        self
    }

    /// One notification pass over a fresh store snapshot. Recipients are served
    /// concurrently and a failure for one never affects another.
    pub async fn dispatch(&self, cycle: &ScanCycle) -> Result<DispatchReport> {
        self.run_pass(*cycle)
            .instrument(info_span!("dispatch", cycle = cycle.number, cycle_id = %cycle.id))
            .await
    }

    async fn joined_guilds(&self) -> Option<Vec<String>> {
        let roster = self.roster.as_ref()?;
        match roster.joined_guilds().await {
            Ok(guilds) => Some(guilds),
            Err(err) => {
                warn!(error = %err, "could not list joined guilds; using stored guild preferences");
                None
            }
        }
    }

    async fn run_pass(&self, cycle: ScanCycle) -> Result<DispatchReport> {
        let store = Arc::clone(&self.store);
        let snapshot = task::spawn_blocking(move || store.read_all_entries())
            .await
            .context("market snapshot task failed")?
            .context("reading market snapshot")?;
        let snapshot = Arc::new(snapshot);

        let joined = self.joined_guilds().await;
        let directory = Arc::clone(&self.directory);
        let recipients = task::spawn_blocking(move || directory.recipients(joined.as_deref()))
            .await
            .context("recipient loading task failed")?
            .context("loading recipients")?;
        info!(
            systems = snapshot.len(),
            recipients = recipients.len(),
            "dispatch pass starting"
        );

        let mut report = DispatchReport::new(cycle.number);
        let mut tasks = JoinSet::new();
        for profile in recipients {
            if !self.config.admits(&profile) {
                continue;
            }
            report.considered += 1;
            let job = RecipientJob {
                store: Arc::clone(&self.store),
                transport: Arc::clone(&self.transport),
                roster: self.roster.clone(),
                pings: Arc::clone(&self.pings),
                cooldown: self.config.cooldown,
                cycle,
                snapshot: Arc::clone(&snapshot),
            };
            let span = info_span!("recipient", recipient = %profile.key);
            tasks.spawn(job.serve(profile).instrument(span));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    error!(error = %err, "recipient task aborted");
                    report.failed += 1;
                }
            }
        }

        info!(
            considered = report.considered,
            sent = report.sent,
            partial = report.partial,
            skipped = report.skipped_empty,
            failed = report.failed,
            unreachable = report.unreachable.len(),
            pings = report.pings,
            marked = report.marked,
            "dispatch pass finished"
        );
        Ok(report)
    }
}

struct RecipientJob {
    store: Arc<MarketStore>,
    transport: Arc<dyn Transport>,
    roster: Option<Arc<dyn GuildRoster>>,
    pings: Arc<CyclePingLedger>,
    cooldown: Duration,
    cycle: ScanCycle,
    snapshot: Arc<MarketDocument>,
}

impl RecipientJob {
    async fn serve(self, profile: RecipientProfile) -> RecipientOutcome {
        let recipient = profile.key.clone();

        let due = match self.due_candidates(&profile).await {
            Ok(due) => due,
            Err(err) => {
                error!(error = ?err, "cooldown check failed");
                return RecipientOutcome::Failed {
                    recipient,
                    error: format!("{err:#}"),
                };
            }
        };
        if due.is_empty() {
            debug!("nothing new for recipient");
            return RecipientOutcome::Empty { recipient };
        }

        let target = match self.resolve_target(&profile.target).await {
            Ok(target) => target,
            Err(err) => return undelivered_outcome(recipient, err),
        };
        let mention = match self.resolve_role(&profile).await {
            Some(role) if self.pings.claim(self.cycle.id, &recipient) => Some(role),
            _ => None,
        };
        let pinged = mention.is_some();
        let reserve = mention
            .as_deref()
            .map(|role| mention_prefix(role).chars().count())
            .unwrap_or(0);
        let parts = plan_message_parts(&due, DISCORD_MESSAGE_LIMIT, reserve);
        let part_count = parts.len();

        let mut delivered = Vec::new();
        let mut failure = None;
        for (index, part) in parts.into_iter().enumerate() {
            let role = if index == 0 { mention.clone() } else { None };
            let message = OutboundMessage::new(part.body, role);
            match self.transport.send(&target, &message).await {
                Ok(()) => delivered.extend(part.entries),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let undelivered = due.len().saturating_sub(delivered.len());
        match failure {
            Some(err) if delivered.is_empty() => {
                if pinged {
                    self.pings.release(self.cycle.id, &recipient);
                }
                return undelivered_outcome(recipient, err);
            }
            Some(err) => warn!(
                error = %err,
                delivered = delivered.len(),
                undelivered,
                "partial delivery; remaining entries stay due"
            ),
            None => {}
        }

        let entries = delivered.len();
        let keys = delivered
            .into_iter()
            .map(|entry| CooldownKey::new(entry, recipient.clone()))
            .collect::<Vec<_>>();
        let marked = self.mark(keys).await;
        info!(entries, parts = part_count, pinged, "notification delivered");

        RecipientOutcome::Sent {
            recipient,
            entries,
            undelivered,
            marked,
            pinged,
        }
    }

    async fn due_candidates(&self, profile: &RecipientProfile) -> Result<Vec<Candidate>> {
        let candidates = collect_candidates(&self.snapshot, &profile.preferences);
        let store = Arc::clone(&self.store);
        let recipient = profile.key.clone();
        let cooldown = self.cooldown;
        task::spawn_blocking(move || {
            let mut due = Vec::new();
            for candidate in candidates {
                if store.check_entry_cooldown(&candidate.entry(), &recipient, cooldown)? {
                    due.push(candidate);
                }
            }
            Ok::<_, StoreError>(due)
        })
        .await
        .context("cooldown check task failed")?
        .context("checking cooldowns")
    }

    async fn mark(&self, keys: Vec<CooldownKey>) -> Option<usize> {
        let store = Arc::clone(&self.store);
        match task::spawn_blocking(move || store.mark_sent_batch(&keys)).await {
            Ok(Ok(count)) => Some(count),
            Ok(Err(err)) => {
                error!(error = %err, "recording cooldowns failed after delivery");
                None
            }
            Err(err) => {
                error!(error = %err, "cooldown write task failed");
                None
            }
        }
    }

    async fn resolve_target(&self, target: &DeliveryTarget) -> Result<DeliveryTarget, DeliveryError> {
        let DeliveryTarget::NamedChannel { guild_id, name } = target else {
            return Ok(target.clone());
        };
        let Some(roster) = &self.roster else {
            return Err(DeliveryError::Unresolved(format!("no roster to look up #{name}")));
        };
        let channels = roster.channels(guild_id).await?;
        match find_text_channel(&channels, name) {
            Some(channel) => {
                debug!(channel = %name, channel_id = %channel.id, "resolved channel by name");
                Ok(DeliveryTarget::Channel(channel.id.clone()))
            }
            None => Err(DeliveryError::Unreachable(format!("no text channel named #{name}"))),
        }
    }

    /// The role to mention, if the guild wants pings and the role exists.
    async fn resolve_role(&self, profile: &RecipientProfile) -> Option<String> {
        if profile.key.kind != RecipientKind::Guild || !profile.pings_enabled {
            return None;
        }
        if let Some(role_id) = &profile.role_id {
            return Some(role_id.clone());
        }
        let name = profile.role_name.as_deref()?;
        let roster = self.roster.as_ref()?;
        match roster.roles(&profile.key.id).await {
            Ok(roles) => {
                let found = find_role(&roles, name).map(|role| role.id.clone());
                if found.is_none() {
                    debug!(role = name, "no role with that name; sending without a mention");
                }
                found
            }
            Err(err) => {
                warn!(role = name, error = %err, "role lookup failed; sending without a mention");
                None
            }
        }
    }
}

fn undelivered_outcome(recipient: RecipientKey, err: DeliveryError) -> RecipientOutcome {
    match err {
        DeliveryError::Unreachable(reason) => {
            warn!(reason = %reason, "recipient unreachable");
            RecipientOutcome::Unreachable { recipient }
        }
        other => {
            warn!(error = %other, "delivery failed; cooldowns untouched");
            RecipientOutcome::Failed {
                recipient,
                error: other.to_string(),
            }
        }
    }
}

/// Splits on line boundaries so every chunk fits `limit` characters. Lines
/// longer than `limit` are cut hard.
pub fn split_message(content: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in content.split('\n') {
        let line_len = line.chars().count();
        let needed = if current.is_empty() {
            line_len
        } else {
            current_len + 1 + line_len
        };
        if needed <= limit {
            if !current.is_empty() {
                current.push('\n');
                current_len += 1;
            }
            current.push_str(line);
            current_len += line_len;
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len <= limit {
            current.push_str(line);
            current_len = line_len;
            continue;
        }
        let chars = line.chars().collect::<Vec<_>>();
        for piece in chars.chunks(limit) {
            chunks.push(piece.iter().collect());
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[derive(Debug, Deserialize)]
struct DiscordErrorBody {
    #[serde(default)]
    code: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DmChannel {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PartialGuild {
    id: String,
}

pub fn classify_response(status: StatusCode, body: &str) -> DeliveryError {
    let code = serde_json::from_str::<DiscordErrorBody>(body)
        .ok()
        .and_then(|b| b.code);
    match status {
        StatusCode::NOT_FOUND => DeliveryError::Unreachable("unknown channel or user".to_string()),
        StatusCode::FORBIDDEN if code == Some(DISCORD_CANNOT_MESSAGE_USER) => {
            DeliveryError::Unreachable("cannot send messages to this user".to_string())
        }
        StatusCode::TOO_MANY_REQUESTS => DeliveryError::RateLimited,
        s if s.is_server_error() => DeliveryError::Transient(format!("discord returned {s}")),
        s => DeliveryError::Rejected { status: s.as_u16() },
    }
}

/// Discord REST delivery to guild channels and DMs.
pub struct DiscordTransport {
    client: reqwest::Client,
    api_base: String,
    token: String,
    dm_channels: tokio::sync::Mutex<HashMap<String, String>>,
}

impl DiscordTransport {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(
                "DiscordBot (hidden-market-watch, ",
                env!("CARGO_PKG_VERSION"),
                ")"
            ))
            .build()
            .context("building discord http client")?;
        Ok(Self {
            client,
            api_base: DISCORD_API_BASE.to_string(),
            token: token.into(),
            dm_channels: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn authorization(&self) -> String {
        format!("Bot {}", self.token)
    }

    async fn channel_for(&self, target: &DeliveryTarget) -> Result<String, DeliveryError> {
        match target {
            DeliveryTarget::Channel(id) => Ok(id.clone()),
            DeliveryTarget::NamedChannel { guild_id, name } => {
                let channels = self.channels(guild_id).await?;
                find_text_channel(&channels, name)
                    .map(|channel| channel.id.clone())
                    .ok_or_else(|| DeliveryError::Unreachable(format!("no text channel named #{name}")))
            }
            DeliveryTarget::DirectMessage(user_id) => self.open_dm(user_id).await,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, DeliveryError> {
        let resp = self
            .client
            .get(format!("{}{path}", self.api_base))
            .header(AUTHORIZATION, self.authorization())
            .send()
            .await
            .map_err(network_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_response(status, &body));
        }
        resp.json()
            .await
            .map_err(|e| DeliveryError::Transient(format!("decoding {path}: {e}")))
    }

    async fn open_dm(&self, user_id: &str) -> Result<String, DeliveryError> {
        let cached = self.dm_channels.lock().await.get(user_id).cloned();
        if let Some(channel_id) = cached {
            return Ok(channel_id);
        }

        let resp = self
            .client
            .post(format!("{}/users/@me/channels", self.api_base))
            .header(AUTHORIZATION, self.authorization())
            .json(&json!({ "recipient_id": user_id }))
            .send()
            .await
            .map_err(network_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_response(status, &body));
        }
        let channel: DmChannel = resp
            .json()
            .await
            .map_err(|e| DeliveryError::Transient(format!("decoding dm channel: {e}")))?;

        self.dm_channels
            .lock()
            .await
            .insert(user_id.to_string(), channel.id.clone());
        Ok(channel.id)
    }

    async fn post_chunk(
        &self,
        channel_id: &str,
        content: &str,
        mention_role: Option<&str>,
    ) -> Result<(), DeliveryError> {
        let allowed_mentions = match mention_role {
            Some(role) => json!({ "parse": [], "roles": [role] }),
            None => json!({ "parse": [] }),
        };
        let resp = self
            .client
            .post(format!("{}/channels/{channel_id}/messages", self.api_base))
            .header(AUTHORIZATION, self.authorization())
            .json(&json!({ "content": content, "allowed_mentions": allowed_mentions }))
            .send()
            .await
            .map_err(network_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_response(status, &body))
    }
}

#[async_trait]
impl Transport for DiscordTransport {
    async fn send(&self, target: &DeliveryTarget, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let channel_id = self.channel_for(target).await?;
        for chunk in split_message(&message.content, DISCORD_MESSAGE_LIMIT) {
            self.post_chunk(&channel_id, &chunk, message.mention_role.as_deref())
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl GuildRoster for DiscordTransport {
    async fn joined_guilds(&self) -> Result<Vec<String>, DeliveryError> {
        let mut guilds = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let path = match &after {
                Some(after) => format!("/users/@me/guilds?limit={DISCORD_GUILD_PAGE}&after={after}"),
                None => format!("/users/@me/guilds?limit={DISCORD_GUILD_PAGE}"),
            };
            let page: Vec<PartialGuild> = self.get_json(&path).await?;
            let more = page.len() == DISCORD_GUILD_PAGE;
            after = page.last().map(|guild| guild.id.clone());
            guilds.extend(page.into_iter().map(|guild| guild.id));
            if !more {
                break;
            }
        }
        debug!(guilds = guilds.len(), "listed joined guilds");
        Ok(guilds)
    }

    async fn channels(&self, guild_id: &str) -> Result<Vec<GuildChannel>, DeliveryError> {
        self.get_json(&format!("/guilds/{guild_id}/channels")).await
    }

    async fn roles(&self, guild_id: &str) -> Result<Vec<GuildRole>, DeliveryError> {
        self.get_json(&format!("/guilds/{guild_id}/roles")).await
    }
}

fn network_error(err: reqwest::Error) -> DeliveryError {
    DeliveryError::Transient(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmw_core::{MarketObservation, PowerplayObservation};
    use hmw_storage::{ManualClock, MemoryBackend, StoreBackend};
    use std::thread::ThreadId;
    use tempfile::tempdir;

    const T0: f64 = 1_700_000_000.0;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(DeliveryTarget, OutboundMessage)>>,
        /// Sends still allowed before the target starts failing.
        failures: Mutex<HashMap<DeliveryTarget, (usize, DeliveryError)>>,
    }

    impl RecordingTransport {
        fn fail(&self, target: DeliveryTarget, err: DeliveryError) {
            self.fail_after(target, 0, err);
        }

        fn fail_after(&self, target: DeliveryTarget, successes: usize, err: DeliveryError) {
            self.failures.lock().expect("lock").insert(target, (successes, err));
        }

        fn sent(&self) -> Vec<(DeliveryTarget, OutboundMessage)> {
            self.sent.lock().expect("lock").clone()
        }

        fn sent_to(&self, target: &DeliveryTarget) -> Vec<OutboundMessage> {
            self.sent()
                .into_iter()
                .filter(|(t, _)| t == target)
                .map(|(_, m)| m)
                .collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(
            &self,
            target: &DeliveryTarget,
            message: &OutboundMessage,
        ) -> Result<(), DeliveryError> {
            if let Some((remaining, err)) = self.failures.lock().expect("lock").get_mut(target) {
                if *remaining == 0 {
                    return Err(err.clone());
                }
                *remaining -= 1;
            }
            self.sent
                .lock()
                .expect("lock")
                .push((target.clone(), message.clone()));
            Ok(())
        }
    }

    struct StaticDirectory(Vec<RecipientProfile>);

    impl SubscriptionDirectory for StaticDirectory {
        fn recipients(&self, _joined: Option<&[String]>) -> Result<Vec<RecipientProfile>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct FakeRoster {
        guilds: Vec<String>,
        channels: HashMap<String, Vec<GuildChannel>>,
        roles: HashMap<String, Vec<GuildRole>>,
    }

    #[async_trait]
    impl GuildRoster for FakeRoster {
        async fn joined_guilds(&self) -> Result<Vec<String>, DeliveryError> {
            Ok(self.guilds.clone())
        }

        async fn channels(&self, guild_id: &str) -> Result<Vec<GuildChannel>, DeliveryError> {
            Ok(self.channels.get(guild_id).cloned().unwrap_or_default())
        }

        async fn roles(&self, guild_id: &str) -> Result<Vec<GuildRole>, DeliveryError> {
            Ok(self.roles.get(guild_id).cloned().unwrap_or_default())
        }
    }

    fn text_channel(id: &str, name: &str, position: i64) -> GuildChannel {
        GuildChannel {
            id: id.to_string(),
            name: name.to_string(),
            kind: 0,
            position,
        }
    }

    /// Notes which thread every load and persist runs on.
    #[derive(Default)]
    struct ThreadTrackingBackend {
        inner: MemoryBackend,
        threads: Mutex<Vec<ThreadId>>,
    }

    impl ThreadTrackingBackend {
        fn note(&self) {
            self.threads.lock().expect("lock").push(std::thread::current().id());
        }
    }

    impl StoreBackend for ThreadTrackingBackend {
        fn load(&self) -> Result<MarketDocument, StoreError> {
            self.note();
            self.inner.load()
        }

        fn persist(&self, document: &MarketDocument) -> Result<(), StoreError> {
            self.note();
            self.inner.persist(document)
        }

        fn describe(&self) -> String {
            self.inner.describe()
        }
    }

    struct Harness {
        store: Arc<MarketStore>,
        backend: Arc<MemoryBackend>,
        clock: Arc<ManualClock>,
        transport: Arc<RecordingTransport>,
        dispatcher: Dispatcher,
    }

    fn harness_with(recipients: Vec<RecipientProfile>, config: DispatchConfig) -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MarketStore::new(backend.clone()).with_clock(clock.clone()));
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            transport.clone(),
            Arc::new(StaticDirectory(recipients)),
            config,
        );
        Harness {
            store,
            backend,
            clock,
            transport,
            dispatcher,
        }
    }

    fn harness(recipients: Vec<RecipientProfile>) -> Harness {
        harness_with(recipients, DispatchConfig::default())
    }

    fn listing(system: &str, station: &str, station_type: &str, metal: &str, stock: i64) -> MarketObservation {
        MarketObservation {
            system: system.to_string(),
            system_address: format!("https://inara.cz/elite/starsystem/{}/", system.len()),
            station: station.to_string(),
            station_type: station_type.to_string(),
            url: format!("https://inara.cz/elite/station-market/{}/", station.len()),
            metal: metal.to_string(),
            stock,
        }
    }

    fn powerplay(system: &str, power: &str, status: &str, urls: &str) -> PowerplayObservation {
        PowerplayObservation {
            system: system.to_string(),
            system_address: format!("https://inara.cz/elite/starsystem/{}/", system.len()),
            power: power.to_string(),
            status: PowerplayStatus::from(status),
            progress: "0%".to_string(),
            commodity_urls: urls.to_string(),
        }
    }

    fn prefs(station_type: &[&str], commodity: &[&str], powerplay: &[&str]) -> PreferenceSet {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        PreferenceSet {
            station_type: owned(station_type),
            commodity: owned(commodity),
            powerplay: owned(powerplay),
        }
    }

    #[tokio::test]
    async fn sol_listing_is_sent_once_per_cooldown_window() {
        let h = harness(vec![RecipientProfile::guild("g1", "c1").with_role("r1")]);
        let c1 = DeliveryTarget::Channel("c1".to_string());
        h.store
            .write_market_entry(&listing("Sol", "Abraham Lincoln", "Starport", "Gold", 25_000))
            .expect("write");

        let first = h.dispatcher.dispatch(&ScanCycle::new(1)).await.expect("dispatch");
        assert_eq!(first.sent, 1);
        assert_eq!(first.marked, 1);
        assert_eq!(first.pings, 1);
        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, c1);
        assert_eq!(
            sent[0].1.content,
            "<@&r1>\n\
             Hidden markets detected in Sol (<https://inara.cz/elite/starsystem/3/>):\n\
             - Abraham Lincoln (Starport), <https://inara.cz/elite/station-market/15/> - Gold stock: 25000"
        );

        h.clock.set(T0 + 3600.0);
        let second = h.dispatcher.dispatch(&ScanCycle::new(2)).await.expect("dispatch");
        assert_eq!(second.sent, 0);
        assert_eq!(second.skipped_empty, 1);
        assert_eq!(second.pings, 0, "no role ping when every entry is cooling down");
        assert_eq!(h.transport.sent_to(&c1).len(), 1);

        h.clock.set(T0 + DEFAULT_COOLDOWN.as_secs_f64());
        let third = h.dispatcher.dispatch(&ScanCycle::new(3)).await.expect("dispatch");
        assert_eq!(third.sent, 1);
        assert_eq!(third.pings, 1);
        assert_eq!(h.transport.sent_to(&c1).len(), 2);
    }

    #[tokio::test]
    async fn palladium_subscriber_never_hears_about_gold() {
        let h = harness(vec![
            RecipientProfile::user("u1").with_preferences(prefs(&[], &["Palladium"], &[]))
        ]);
        h.store
            .write_market_entry(&listing("Sol", "Abraham Lincoln", "Starport", "Gold", 25_000))
            .expect("write");

        let report = h.dispatcher.dispatch(&ScanCycle::new(1)).await.expect("dispatch");
        assert_eq!(report.skipped_empty, 1);
        assert!(h.transport.sent().is_empty());
        assert!(h
            .store
            .check_cooldown("Sol", "Abraham Lincoln", "Gold", &RecipientKey::user("u1"), DEFAULT_COOLDOWN)
            .expect("check"));

        h.store
            .write_market_entry(&listing("Sol", "Abraham Lincoln", "Starport", "Palladium", 16_000))
            .expect("write");
        let report = h.dispatcher.dispatch(&ScanCycle::new(2)).await.expect("dispatch");
        assert_eq!(report.sent, 1);
        let content = &h.transport.sent()[0].1.content;
        assert!(content.contains("Palladium stock: 16000"));
        assert!(!content.contains("Gold"));
    }

    #[test]
    fn message_groups_by_system_then_station() {
        let backend = Arc::new(MemoryBackend::new());
        let store = MarketStore::new(backend);
        store.write_market_entry(&listing("Sol", "A", "Starport", "Gold", 20_000)).expect("write");
        store.write_market_entry(&listing("Sol", "A", "Starport", "Palladium", 16_000)).expect("write");
        store.write_market_entry(&listing("Sol", "B", "Outpost", "Gold", 30_000)).expect("write");
        store
            .write_powerplay_entry(&powerplay("Sol", "Jerome Archer", "Fortified", "[Sell gold here](x)"))
            .expect("pp");
        store
            .write_powerplay_entry(&powerplay("Achenar", "Zemina Torval", "Stronghold", ""))
            .expect("pp");
        store
            .write_powerplay_entry(&powerplay("Lave", "Yuri Grom", "Exploited", "[Sell here](y)"))
            .expect("pp");

        let document = store.read_all_entries().expect("read");
        let candidates = collect_candidates(&document, &PreferenceSet::default());
        assert_eq!(candidates.len(), 5, "exploited systems are not candidates");

        assert_eq!(
            build_message(&candidates),
            "Achenar is a Zemina Torval Stronghold system.\n\
             \n\
             Hidden markets detected in Sol (<https://inara.cz/elite/starsystem/3/>):\n\
             - A (Starport), <https://inara.cz/elite/station-market/1/> - Gold stock: 20000; Palladium stock: 16000\n\
             - B (Outpost), <https://inara.cz/elite/station-market/1/> - Gold stock: 30000\n\
             Sol is a Jerome Archer Fortified system.\n\
             You can earn merits by trading for a large profit in these acquisition systems: [Sell gold here](x)"
        );
    }

    #[test]
    fn missing_address_renders_placeholder() {
        let candidates = vec![Candidate::Market(MarketCandidate {
            system: "Lave".to_string(),
            system_address: String::new(),
            station: "Lave Station".to_string(),
            station_type: "Starport".to_string(),
            url: "u".to_string(),
            metal: "Gold".to_string(),
            stock: 1,
        })];
        assert!(build_message(&candidates).starts_with("Hidden markets detected in Lave (Unknown address):"));
    }

    #[test]
    fn powerplay_preference_binds_only_powerplay_entries() {
        let store = MarketStore::new(MemoryBackend::new());
        store.write_market_entry(&listing("Sol", "A", "Starport", "Gold", 20_000)).expect("write");
        store
            .write_powerplay_entry(&powerplay("Sol", "Jerome Archer", "Fortified", ""))
            .expect("pp");
        store
            .write_powerplay_entry(&powerplay("Lave", "Yuri Grom", "Stronghold", ""))
            .expect("pp");

        let document = store.read_all_entries().expect("read");
        let candidates = collect_candidates(&document, &prefs(&[], &[], &["Archer"]));
        let systems = candidates
            .iter()
            .map(|c| (c.system().to_string(), matches!(c, Candidate::Powerplay(_))))
            .collect::<Vec<_>>();
        assert_eq!(
            systems,
            vec![("Sol".to_string(), false), ("Sol".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn role_is_pinged_at_most_once_per_cycle() {
        let mut quiet = RecipientProfile::guild("g2", "c2").with_role("r2");
        quiet.pings_enabled = false;
        let h = harness(vec![RecipientProfile::guild("g1", "c1").with_role("r9"), quiet]);
        let loud = DeliveryTarget::Channel("c1".to_string());

        let cycle = ScanCycle::new(1);
        h.store.write_market_entry(&listing("Sol", "A", "Starport", "Gold", 20_000)).expect("write");
        let report = h.dispatcher.dispatch(&cycle).await.expect("dispatch");
        assert_eq!(report.pings, 1);

        h.store.write_market_entry(&listing("Sol", "B", "Starport", "Gold", 20_000)).expect("write");
        let report = h.dispatcher.dispatch(&cycle).await.expect("dispatch");
        assert_eq!(report.sent, 2);
        assert_eq!(report.pings, 0);

        h.store.write_market_entry(&listing("Lave", "C", "Starport", "Gold", 20_000)).expect("write");
        let report = h.dispatcher.dispatch(&ScanCycle::new(2)).await.expect("dispatch");
        assert_eq!(report.pings, 1);

        let to_loud = h.transport.sent_to(&loud);
        assert_eq!(to_loud.len(), 3);
        assert!(to_loud[0].content.starts_with("<@&r9>\nHidden markets detected in Sol"));
        assert_eq!(to_loud[0].mention_role.as_deref(), Some("r9"));
        assert!(to_loud[1].mention_role.is_none());
        assert!(to_loud[2].content.starts_with("<@&r9>\n"));

        let to_quiet = h.transport.sent_to(&DeliveryTarget::Channel("c2".to_string()));
        assert_eq!(to_quiet.len(), 3);
        assert!(to_quiet.iter().all(|m| m.mention_role.is_none()));
    }

    #[tokio::test]
    async fn empty_recipients_are_never_pinged() {
        let h = harness(vec![RecipientProfile::guild("g1", "c1").with_role("r9")]);
        let cycle = ScanCycle::new(1);
        let report = h.dispatcher.dispatch(&cycle).await.expect("dispatch");
        assert_eq!(report.pings, 0);
        assert_eq!(report.skipped_empty, 1);

        h.store.write_market_entry(&listing("Sol", "A", "Starport", "Gold", 20_000)).expect("write");
        let report = h.dispatcher.dispatch(&cycle).await.expect("dispatch");
        assert_eq!(report.pings, 1);
    }

    #[tokio::test]
    async fn failed_delivery_is_isolated_and_leaves_cooldowns_alone() {
        let h = harness(vec![
            RecipientProfile::guild("g1", "c1").with_role("r1"),
            RecipientProfile::guild("g2", "c2"),
        ]);
        h.transport.fail(
            DeliveryTarget::Channel("c1".to_string()),
            DeliveryError::Transient("boom".to_string()),
        );
        h.store.write_market_entry(&listing("Sol", "A", "Starport", "Gold", 20_000)).expect("write");

        let cycle = ScanCycle::new(1);
        let report = h.dispatcher.dispatch(&cycle).await.expect("dispatch");
        assert_eq!(report.considered, 2);
        assert_eq!(report.sent, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.pings, 0);
        assert!(h
            .store
            .check_cooldown("Sol", "A", "Gold", &RecipientKey::guild("g1"), DEFAULT_COOLDOWN)
            .expect("check"));
        assert!(!h
            .store
            .check_cooldown("Sol", "A", "Gold", &RecipientKey::guild("g2"), DEFAULT_COOLDOWN)
            .expect("check"));

        h.transport.failures.lock().expect("lock").clear();
        let retry = h.dispatcher.dispatch(&cycle).await.expect("dispatch");
        assert_eq!(retry.sent, 1);
        assert_eq!(retry.pings, 1, "a failed send does not consume the cycle ping");
    }

    #[tokio::test]
    async fn unreachable_users_are_reported_not_marked() {
        let h = harness(vec![RecipientProfile::user("u1"), RecipientProfile::user("u2")]);
        h.transport.fail(
            DeliveryTarget::DirectMessage("u1".to_string()),
            DeliveryError::Unreachable("gone".to_string()),
        );
        h.store.write_market_entry(&listing("Sol", "A", "Starport", "Gold", 20_000)).expect("write");

        let report = h.dispatcher.dispatch(&ScanCycle::new(1)).await.expect("dispatch");
        assert_eq!(report.unreachable, vec![RecipientKey::user("u1")]);
        assert_eq!(report.sent, 1);
        assert_eq!(report.failed, 0);
        assert!(h
            .store
            .check_cooldown("Sol", "A", "Gold", &RecipientKey::user("u1"), DEFAULT_COOLDOWN)
            .expect("check"));
    }

    #[tokio::test]
    async fn opt_outs_and_debug_allow_lists_narrow_recipients() {
        let mut opted_out = RecipientProfile::guild("g1", "c1");
        opted_out.opted_out = true;
        let recipients = vec![
            opted_out,
            RecipientProfile::guild("g2", "c2"),
            RecipientProfile::guild("g3", "c3"),
            RecipientProfile::user("u1"),
            RecipientProfile::user("u2"),
        ];

        let h = harness(recipients.clone());
        h.store.write_market_entry(&listing("Sol", "A", "Starport", "Gold", 20_000)).expect("write");
        let report = h.dispatcher.dispatch(&ScanCycle::new(1)).await.expect("dispatch");
        assert_eq!(report.considered, 4);

        let debug = DispatchConfig {
            debug_guild: Some("g3".to_string()),
            debug_user: Some("u2".to_string()),
            ..DispatchConfig::default()
        };
        let h = harness_with(recipients, debug);
        h.store.write_market_entry(&listing("Sol", "A", "Starport", "Gold", 20_000)).expect("write");
        let report = h.dispatcher.dispatch(&ScanCycle::new(1)).await.expect("dispatch");
        assert_eq!(report.considered, 2);
        let targets = h
            .transport
            .sent()
            .into_iter()
            .map(|(t, _)| t)
            .collect::<HashSet<_>>();
        assert_eq!(
            targets,
            HashSet::from([
                DeliveryTarget::Channel("c3".to_string()),
                DeliveryTarget::DirectMessage("u2".to_string()),
            ])
        );
    }

    #[tokio::test]
    async fn powerplay_entries_get_their_own_cooldown() {
        let h = harness(vec![RecipientProfile::user("u1")]);
        h.store
            .write_powerplay_entry(&powerplay("Sol", "Jerome Archer", "Stronghold", "[Sell gold here](x)"))
            .expect("pp");

        let report = h.dispatcher.dispatch(&ScanCycle::new(1)).await.expect("dispatch");
        assert_eq!(report.sent, 1);
        assert_eq!(
            h.transport.sent()[0].1.content,
            "Sol is a Jerome Archer Stronghold system.\n\
             You can earn merits by trading for a large profit in these acquisition systems: [Sell gold here](x)"
        );
        assert!(!h
            .store
            .check_powerplay_cooldown("Sol", &RecipientKey::user("u1"), DEFAULT_COOLDOWN)
            .expect("check"));
    }

    #[tokio::test]
    async fn mark_failure_after_delivery_is_counted() {
        let h = harness(vec![RecipientProfile::guild("g1", "c1")]);
        h.store.write_market_entry(&listing("Sol", "A", "Starport", "Gold", 20_000)).expect("write");
        h.backend.fail_persists(true);

        let report = h.dispatcher.dispatch(&ScanCycle::new(1)).await.expect("dispatch");
        assert_eq!(report.sent, 1);
        assert_eq!(report.mark_failures, 1);
        assert_eq!(report.marked, 0);
    }

    #[test]
    fn long_messages_split_on_line_boundaries() {
        let line = "x".repeat(30);
        let content = vec![line.as_str(); 5].join("\n");
        let chunks = split_message(&content, 70);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 70));
        assert_eq!(chunks.join("\n"), content);

        let oversized = "y".repeat(150);
        let chunks = split_message(&oversized, 70);
        assert_eq!(
            chunks.iter().map(|c| c.len()).collect::<Vec<_>>(),
            vec![70, 70, 10]
        );

        assert_eq!(split_message("short", DISCORD_MESSAGE_LIMIT), vec!["short".to_string()]);
    }

    #[test]
    fn discord_status_classification() {
        assert!(matches!(
            classify_response(StatusCode::NOT_FOUND, ""),
            DeliveryError::Unreachable(_)
        ));
        assert!(matches!(
            classify_response(
                StatusCode::FORBIDDEN,
                r#"{"message": "Cannot send messages to this user", "code": 50007}"#
            ),
            DeliveryError::Unreachable(_)
        ));
        assert_eq!(
            classify_response(StatusCode::FORBIDDEN, r#"{"code": 50013}"#),
            DeliveryError::Rejected { status: 403 }
        );
        assert_eq!(
            classify_response(StatusCode::TOO_MANY_REQUESTS, "{}"),
            DeliveryError::RateLimited
        );
        assert!(matches!(
            classify_response(StatusCode::BAD_GATEWAY, ""),
            DeliveryError::Transient(_)
        ));
        assert_eq!(
            classify_response(StatusCode::BAD_REQUEST, "not json"),
            DeliveryError::Rejected { status: 400 }
        );
    }

    #[test]
    fn json_directory_reads_subscription_files() {
        let dir = tempdir().expect("tempdir");
        let prefs_path = dir.path().join("guild_prefs.json");
        let subs_path = dir.path().join("dm_subscribers.json");
        let optout_path = dir.path().join("guild_optout.json");
        fs::write(
            &prefs_path,
            r#"{
              "guilds": {
                "111": {"channel_id": 501, "channel_name": "gold-alerts", "role_id": 901,
                        "role_name": "Gold Alerts", "pings_enabled": false,
                        "preferences": {"station_type": ["starport", "Megaship"]}},
                "222": {"channel_name": "gold-alerts"},
                "333": {"channel_id": "503", "role_id": null}
              },
              "users": {"7": {"commodity": ["palladium"]}}
            }"#,
        )
        .expect("prefs");
        fs::write(&subs_path, "[7, 8, 7]").expect("subs");
        fs::write(&optout_path, "[333]").expect("optout");

        let directory = JsonSubscriptionDirectory::new(&prefs_path, &subs_path, &optout_path);
        let recipients = directory.recipients(None).expect("recipients");
        assert_eq!(recipients.len(), 5);

        let g111 = &recipients[0];
        assert_eq!(g111.key, RecipientKey::guild("111"));
        assert_eq!(g111.target, DeliveryTarget::Channel("501".to_string()));
        assert_eq!(g111.role_id.as_deref(), Some("901"));
        assert_eq!(g111.role_name.as_deref(), Some("Gold Alerts"));
        assert!(!g111.pings_enabled);
        assert_eq!(g111.preferences.station_type, vec!["Starport".to_string()]);

        let g222 = &recipients[1];
        assert_eq!(
            g222.target,
            DeliveryTarget::NamedChannel {
                guild_id: "222".to_string(),
                name: "gold-alerts".to_string(),
            }
        );
        assert_eq!(g222.role_name.as_deref(), Some(DEFAULT_ROLE_NAME));

        let g333 = &recipients[2];
        assert!(g333.opted_out);
        assert!(g333.pings_enabled);
        assert_eq!(g333.role_id, None);

        assert_eq!(recipients[3].key, RecipientKey::user("7"));
        assert_eq!(recipients[3].preferences.commodity, vec!["Palladium".to_string()]);
        assert_eq!(recipients[4].target, DeliveryTarget::DirectMessage("8".to_string()));

        assert!(directory.discard_subscriber("7").expect("discard"));
        assert!(!directory.discard_subscriber("7").expect("discard again"));
        let raw: Vec<u64> =
            serde_json::from_str(&fs::read_to_string(&subs_path).expect("read")).expect("json");
        assert_eq!(raw, vec![8]);
    }

    #[test]
    fn missing_subscription_files_mean_no_recipients() {
        let dir = tempdir().expect("tempdir");
        let directory = JsonSubscriptionDirectory::new(
            dir.path().join("a.json"),
            dir.path().join("b.json"),
            dir.path().join("c.json"),
        );
        assert!(directory.recipients(None).expect("recipients").is_empty());
    }

    #[test]
    fn single_string_preferences_and_bad_entries_do_not_sink_the_file() {
        let dir = tempdir().expect("tempdir");
        let prefs_path = dir.path().join("guild_prefs.json");
        let subs_path = dir.path().join("dm_subscribers.json");
        fs::write(
            &prefs_path,
            r#"{
              "guilds": {"111": {"channel_id": 501, "preferences": {"commodity": "Gold"}},
                         "222": {"channel_id": 502, "pings_enabled": "sometimes"}},
              "users": {"7": {"commodity": "Gold"},
                        "8": {"commodity": ["palladium", 5, null]},
                        "9": "nonsense"}
            }"#,
        )
        .expect("prefs");
        fs::write(&subs_path, "[7, 8, 9]").expect("subs");

        let directory =
            JsonSubscriptionDirectory::new(&prefs_path, &subs_path, dir.path().join("optout.json"));
        let recipients = directory.recipients(None).expect("recipients");
        let keys = recipients.iter().map(|r| r.key.clone()).collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec![
                RecipientKey::guild("111"),
                RecipientKey::user("7"),
                RecipientKey::user("8"),
                RecipientKey::user("9"),
            ],
            "the malformed guild 222 is skipped on its own"
        );
        assert_eq!(recipients[0].preferences.commodity, vec!["Gold".to_string()]);
        assert_eq!(recipients[1].preferences.commodity, vec!["Gold".to_string()]);
        assert_eq!(recipients[2].preferences.commodity, vec!["Palladium".to_string()]);
        assert!(recipients[3].preferences.is_unrestricted());
    }

    #[test]
    fn legacy_flat_guild_map_is_still_read() {
        let dir = tempdir().expect("tempdir");
        let prefs_path = dir.path().join("guild_prefs.json");
        fs::write(
            &prefs_path,
            r##"{
              "111": {"channel_id": 501, "role_id": "901", "preferences": {"commodity": "palladium"}},
              "222": {"channel_name": "#alerts", "role_name": "@Traders"}
            }"##,
        )
        .expect("prefs");

        let directory = JsonSubscriptionDirectory::new(
            &prefs_path,
            dir.path().join("subs.json"),
            dir.path().join("optout.json"),
        );
        let recipients = directory.recipients(None).expect("recipients");
        assert_eq!(recipients.len(), 2);
        assert_eq!(recipients[0].target, DeliveryTarget::Channel("501".to_string()));
        assert_eq!(recipients[0].role_id.as_deref(), Some("901"));
        assert_eq!(recipients[0].preferences.commodity, vec!["Palladium".to_string()]);
        assert_eq!(
            recipients[1].target,
            DeliveryTarget::NamedChannel {
                guild_id: "222".to_string(),
                name: "alerts".to_string(),
            }
        );
        assert_eq!(recipients[1].role_name.as_deref(), Some("Traders"));
    }

    #[test]
    fn joined_guilds_without_preferences_use_default_names() {
        let dir = tempdir().expect("tempdir");
        let prefs_path = dir.path().join("guild_prefs.json");
        fs::write(&prefs_path, r#"{"guilds": {"111": {"channel_id": 501}, "999": {"channel_id": 599}}}"#)
            .expect("prefs");
        let directory = JsonSubscriptionDirectory::new(
            &prefs_path,
            dir.path().join("subs.json"),
            dir.path().join("optout.json"),
        )
        .with_default_names("#gold-alerts", "@Gold Watch");

        let joined = vec!["111".to_string(), "222".to_string()];
        let recipients = directory.recipients(Some(&joined)).expect("recipients");
        assert_eq!(recipients.len(), 2, "guild 999 is no longer joined");
        assert_eq!(recipients[0].target, DeliveryTarget::Channel("501".to_string()));
        assert_eq!(
            recipients[1].target,
            DeliveryTarget::NamedChannel {
                guild_id: "222".to_string(),
                name: "gold-alerts".to_string(),
            }
        );
        assert_eq!(recipients[1].role_name.as_deref(), Some("Gold Watch"));
        assert!(recipients[1].pings_enabled);
    }

    #[tokio::test]
    async fn roster_resolves_channels_and_roles_by_name() {
        let dir = tempdir().expect("tempdir");
        let prefs_path = dir.path().join("guild_prefs.json");
        fs::write(
            &prefs_path,
            r#"{"guilds": {"111": {"channel_id": 501, "role_id": 901}, "999": {"channel_id": 599}}}"#,
        )
        .expect("prefs");
        let directory = Arc::new(JsonSubscriptionDirectory::new(
            &prefs_path,
            dir.path().join("subs.json"),
            dir.path().join("optout.json"),
        ));

        let roster = FakeRoster {
            guilds: vec!["111".to_string(), "222".to_string(), "333".to_string()],
            channels: HashMap::from([(
                "222".to_string(),
                vec![
                    GuildChannel {
                        kind: 2,
                        ..text_channel("70", "market-watch", 0)
                    },
                    text_channel("71", "Market-Watch", 3),
                    text_channel("72", "market-watch", 1),
                ],
            )]),
            roles: HashMap::from([(
                "222".to_string(),
                vec![GuildRole {
                    id: "80".to_string(),
                    name: "market alert".to_string(),
                }],
            )]),
        };

        let store = Arc::new(MarketStore::new(MemoryBackend::new()));
        store.write_market_entry(&listing("Sol", "A", "Starport", "Gold", 20_000)).expect("write");
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(store, transport.clone(), directory, DispatchConfig::default())
            .with_roster(Arc::new(roster));

        let report = dispatcher.dispatch(&ScanCycle::new(1)).await.expect("dispatch");
        assert_eq!(report.considered, 3);
        assert_eq!(report.sent, 2);
        assert_eq!(report.pings, 2);
        assert_eq!(report.unreachable, vec![RecipientKey::guild("333")]);

        let named = transport.sent_to(&DeliveryTarget::Channel("72".to_string()));
        assert_eq!(named.len(), 1);
        assert!(named[0].content.starts_with("<@&80>\nHidden markets detected in Sol"));
        assert_eq!(transport.sent_to(&DeliveryTarget::Channel("501".to_string())).len(), 1);
        assert!(transport
            .sent_to(&DeliveryTarget::Channel("599".to_string()))
            .is_empty());
    }

    #[tokio::test]
    async fn store_access_runs_off_the_async_runtime() {
        let backend = Arc::new(ThreadTrackingBackend::default());
        let store = Arc::new(MarketStore::new(backend.clone()));
        store.write_market_entry(&listing("Sol", "A", "Starport", "Gold", 20_000)).expect("write");
        backend.threads.lock().expect("lock").clear();

        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(
            store,
            transport.clone(),
            Arc::new(StaticDirectory(vec![
                RecipientProfile::guild("g1", "c1"),
                RecipientProfile::user("u1"),
            ])),
            DispatchConfig::default(),
        );
        let report = dispatcher.dispatch(&ScanCycle::new(1)).await.expect("dispatch");
        assert_eq!(report.sent, 2);
        assert_eq!(report.marked, 2);

        let runtime_thread = std::thread::current().id();
        let threads = backend.threads.lock().expect("lock").clone();
        assert!(threads.len() >= 5, "snapshot, two checks and two marks");
        assert!(threads.iter().all(|id| *id != runtime_thread));
    }

    #[tokio::test]
    async fn failed_second_part_keeps_only_its_entries_due() {
        let h = harness(vec![RecipientProfile::guild("g1", "c1").with_role("r1")]);
        let c1 = DeliveryTarget::Channel("c1".to_string());
        let systems = (0..30).map(|i| format!("System {i:02}")).collect::<Vec<_>>();
        for system in &systems {
            h.store
                .write_market_entry(&listing(system, "Orbital Trading Post", "Starport", "Gold", 20_000))
                .expect("write");
        }
        h.transport
            .fail_after(c1.clone(), 1, DeliveryError::Transient("502".to_string()));

        let first = h.dispatcher.dispatch(&ScanCycle::new(1)).await.expect("dispatch");
        assert_eq!(first.sent, 1);
        assert_eq!(first.partial, 1);
        assert_eq!(first.pings, 1);
        assert!(first.marked > 0 && first.marked < systems.len());

        let delivered = h.transport.sent_to(&c1);
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].content.starts_with("<@&r1>\n"));
        assert!(delivered[0].content.chars().count() <= DISCORD_MESSAGE_LIMIT);

        h.transport.failures.lock().expect("lock").clear();
        let second = h.dispatcher.dispatch(&ScanCycle::new(2)).await.expect("dispatch");
        assert_eq!(second.sent, 1);
        assert_eq!(second.partial, 0);
        assert_eq!(first.marked + second.marked, systems.len());

        let messages = h.transport.sent_to(&c1);
        let mentions = |content: &str| {
            systems
                .iter()
                .filter(|s| content.contains(&format!("detected in {s} ")))
                .count()
        };
        let resent = messages[1..].iter().map(|m| mentions(&m.content)).sum::<usize>();
        assert_eq!(mentions(&messages[0].content), first.marked);
        assert_eq!(resent, systems.len() - first.marked, "nothing from the first part is repeated");
    }

    #[test]
    fn message_parts_keep_system_sections_whole() {
        let candidates = (0..3)
            .map(|i| {
                Candidate::Market(MarketCandidate {
                    system: format!("S{i}"),
                    system_address: String::new(),
                    station: "Port".to_string(),
                    station_type: "Starport".to_string(),
                    url: "u".to_string(),
                    metal: "Gold".to_string(),
                    stock: 1,
                })
            })
            .collect::<Vec<_>>();
        let section = build_message(&candidates[..1]).chars().count();

        let parts = plan_message_parts(&candidates, 2 * section + 2, 0);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].entries.len(), 2);
        assert_eq!(parts[1].entries, vec![EntryRef::market("S2", "Port", "Gold")]);
        assert_eq!(
            parts.iter().map(|p| p.body.as_str()).collect::<Vec<_>>().join("\n\n"),
            build_message(&candidates)
        );

        let parts = plan_message_parts(&candidates, 2 * section + 2, 5);
        assert_eq!(
            parts.iter().map(|p| p.entries.len()).collect::<Vec<_>>(),
            vec![1, 2],
            "the mention reserve shrinks only the first part"
        );
    }

    #[test]
    fn text_channels_match_by_name_in_sidebar_order() {
        let channels = vec![
            GuildChannel {
                kind: 2,
                ..text_channel("1", "alerts", 0)
            },
            text_channel("3", "Alerts", 4),
            text_channel("2", "alerts", 4),
            text_channel("4", "general", 0),
        ];
        assert_eq!(find_text_channel(&channels, "ALERTS").map(|c| c.id.as_str()), Some("2"));
        assert!(find_text_channel(&channels, "missing").is_none());

        let roles = vec![GuildRole {
            id: "9".to_string(),
            name: "Market Alert".to_string(),
        }];
        assert_eq!(find_role(&roles, "market alert").map(|r| r.id.as_str()), Some("9"));
    }
}
