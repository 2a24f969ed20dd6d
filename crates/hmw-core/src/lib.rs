//! Market opportunity model, typed cooldown keys and recipient preference matching.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hmw-core";

/// Seconds since the UNIX epoch, as persisted inside cooldown maps.
pub type Timestamp = f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientKind {
    Guild,
    User,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Guild => "guild",
            Self::User => "user",
        }
    }
}

impl fmt::Display for RecipientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a notification target. Only ever stored as a cooldown map key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecipientKey {
    pub kind: RecipientKind,
    pub id: String,
}

impl RecipientKey {
    pub fn new(kind: RecipientKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn guild(id: impl Into<String>) -> Self {
        Self::new(RecipientKind::Guild, id)
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(RecipientKind::User, id)
    }
}

impl fmt::Display for RecipientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// `recipient_type -> recipient_id -> last notification timestamp`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cooldowns(BTreeMap<RecipientKind, BTreeMap<String, Timestamp>>);

impl Cooldowns {
    pub fn last_sent(&self, recipient: &RecipientKey) -> Option<Timestamp> {
        self.0
            .get(&recipient.kind)
            .and_then(|ids| ids.get(&recipient.id))
            .copied()
    }

    /// Records a notification at `now`. Timestamps never move backwards.
    pub fn record(&mut self, recipient: &RecipientKey, now: Timestamp) {
        let slot = self
            .0
            .entry(recipient.kind)
            .or_default()
            .entry(recipient.id.clone())
            .or_insert(now);
        if now > *slot {
            *slot = now;
        }
    }

    pub fn timestamps(&self) -> impl Iterator<Item = Timestamp> + '_ {
        self.0.values().flat_map(|ids| ids.values().copied())
    }

    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetalListing {
    #[serde(default)]
    pub stock: i64,
    #[serde(default)]
    pub cooldowns: Cooldowns,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Station {
    #[serde(default)]
    pub station_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub metals: BTreeMap<String, MetalListing>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PowerplayStatus {
    Unoccupied,
    Exploited,
    Fortified,
    Stronghold,
    Contested,
    Other(String),
    #[default]
    Unknown,
}

impl PowerplayStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unoccupied => "Unoccupied",
            Self::Exploited => "Exploited",
            Self::Fortified => "Fortified",
            Self::Stronghold => "Stronghold",
            Self::Contested => "Contested",
            Self::Other(text) => text,
            Self::Unknown => "",
        }
    }

    /// Only controlled systems advertise merit trading routes.
    pub fn is_opportunity(&self) -> bool {
        matches!(self, Self::Fortified | Self::Stronghold)
    }
}

impl From<&str> for PowerplayStatus {
    fn from(raw: &str) -> Self {
        match raw.trim() {
            "" => Self::Unknown,
            "Unoccupied" => Self::Unoccupied,
            "Exploited" => Self::Exploited,
            "Fortified" => Self::Fortified,
            "Stronghold" => Self::Stronghold,
            "Contested" => Self::Contested,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for PowerplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PowerplayStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PowerplayStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw.as_deref().map(PowerplayStatus::from).unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PowerplayBlock {
    pub power: String,
    pub status: PowerplayStatus,
    pub progress: String,
    pub commodity_urls: String,
    pub cooldowns: Cooldowns,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketSystem {
    #[serde(default)]
    pub system_address: String,
    #[serde(
        default,
        deserialize_with = "deserialize_powerplay",
        skip_serializing_if = "Option::is_none"
    )]
    pub powerplay: Option<PowerplayBlock>,
    #[serde(default)]
    pub stations: BTreeMap<String, Station>,
}

impl MarketSystem {
    /// Every cooldown timestamp reachable under this system, powerplay included.
    pub fn cooldown_timestamps(&self) -> impl Iterator<Item = Timestamp> + '_ {
        let market = self
            .stations
            .values()
            .flat_map(|station| station.metals.values())
            .flat_map(|listing| listing.cooldowns.timestamps());
        let powerplay = self
            .powerplay
            .iter()
            .flat_map(|block| block.cooldowns.timestamps());
        market.chain(powerplay)
    }

    pub fn newest_cooldown(&self) -> Option<Timestamp> {
        self.cooldown_timestamps().reduce(f64::max)
    }
}

/// The whole persisted document: system name -> system record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarketDocument {
    pub systems: BTreeMap<String, MarketSystem>,
}

impl MarketDocument {
    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    pub fn cooldowns(&self, entry: &EntryRef) -> Option<&Cooldowns> {
        let system = self.systems.get(entry.system())?;
        match entry {
            EntryRef::Market(key) => system
                .stations
                .get(&key.station)?
                .metals
                .get(&key.metal)
                .map(|listing| &listing.cooldowns),
            EntryRef::Powerplay { .. } => system.powerplay.as_ref().map(|pp| &pp.cooldowns),
        }
    }

    pub fn cooldowns_mut(&mut self, entry: &EntryRef) -> Option<&mut Cooldowns> {
        let system = self.systems.get_mut(entry.system())?;
        match entry {
            EntryRef::Market(key) => system
                .stations
                .get_mut(&key.station)?
                .metals
                .get_mut(&key.metal)
                .map(|listing| &mut listing.cooldowns),
            EntryRef::Powerplay { .. } => {
                system.powerplay.as_mut().map(|pp| &mut pp.cooldowns)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MarketEntryRef {
    pub system: String,
    pub station: String,
    pub metal: String,
}

/// Which cooldown clock a key addresses: one per metal per station, or one per
/// system for powerplay.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntryRef {
    Market(MarketEntryRef),
    Powerplay { system: String },
}

impl EntryRef {
    pub fn market(
        system: impl Into<String>,
        station: impl Into<String>,
        metal: impl Into<String>,
    ) -> Self {
        Self::Market(MarketEntryRef {
            system: system.into(),
            station: station.into(),
            metal: metal.into(),
        })
    }

    pub fn powerplay(system: impl Into<String>) -> Self {
        Self::Powerplay {
            system: system.into(),
        }
    }

    pub fn system(&self) -> &str {
        match self {
            Self::Market(key) => &key.system,
            Self::Powerplay { system } => system,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CooldownKey {
    pub entry: EntryRef,
    pub recipient: RecipientKey,
}

impl CooldownKey {
    pub fn new(entry: EntryRef, recipient: RecipientKey) -> Self {
        Self { entry, recipient }
    }

    pub fn market(
        system: impl Into<String>,
        station: impl Into<String>,
        metal: impl Into<String>,
        recipient: RecipientKey,
    ) -> Self {
        Self::new(EntryRef::market(system, station, metal), recipient)
    }

    pub fn powerplay(system: impl Into<String>, recipient: RecipientKey) -> Self {
        Self::new(EntryRef::powerplay(system), recipient)
    }
}

/// Parsed handoff from the crawler: one metal listing at one station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketObservation {
    pub system: String,
    pub system_address: String,
    pub station: String,
    pub station_type: String,
    pub url: String,
    pub metal: String,
    pub stock: i64,
}

/// Parsed handoff from the crawler: the powerplay state of one system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerplayObservation {
    pub system: String,
    pub system_address: String,
    pub power: String,
    pub status: PowerplayStatus,
    pub progress: String,
    pub commodity_urls: String,
}

/// One crawl cycle, opened by `begin_scan` and closed by `end_scan`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanCycle {
    pub number: u64,
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl ScanCycle {
    pub fn new(number: u64) -> Self {
        Self {
            number,
            id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

pub const STATION_TYPE_OPTIONS: &[&str] = &["Starport", "Outpost", "Surface Port"];
pub const COMMODITY_OPTIONS: &[&str] = &["Gold", "Palladium"];
pub const POWERPLAY_OPTIONS: &[&str] = &[
    "Aisling Duval",
    "Archon Delaine",
    "Arissa Lavigny-Duval",
    "Denton Patreus",
    "Edmund Mahon",
    "Felicia Winters",
    "Jerome Archer",
    "Li Yong-Rui",
    "Nakato Kaine",
    "Pranav Antal",
    "Yuri Grom",
    "Zemina Torval",
];

/// Per-recipient interest filter. An empty category imposes no restriction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PreferenceSet {
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub station_type: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub commodity: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub powerplay: Vec<String>,
}

impl PreferenceSet {
    pub fn is_unrestricted(&self) -> bool {
        self.station_type.is_empty() && self.commodity.is_empty() && self.powerplay.is_empty()
    }

    /// Drops unknown values, restores canonical spelling and removes duplicates.
    pub fn normalized(&self) -> Self {
        Self {
            station_type: normalize_values(&self.station_type, STATION_TYPE_OPTIONS),
            commodity: normalize_values(&self.commodity, COMMODITY_OPTIONS),
            powerplay: normalize_values(&self.powerplay, POWERPLAY_OPTIONS),
        }
    }

    pub fn accepts_station_type(&self, station_type: &str) -> bool {
        self.station_type.is_empty()
            || self
                .station_type
                .iter()
                .any(|pref| station_type_matches(pref, station_type))
    }

    pub fn accepts_commodity(&self, metal: &str) -> bool {
        let metal = metal.to_lowercase();
        self.commodity.is_empty() || self.commodity.iter().any(|c| c.to_lowercase() == metal)
    }

    pub fn accepts_power(&self, power: &str) -> bool {
        if self.powerplay.is_empty() {
            return true;
        }
        let power = power.to_lowercase();
        self.powerplay.iter().any(|pref| {
            let pref = pref.to_lowercase();
            power.contains(&pref) || pref.contains(&power)
        })
    }

    /// Market entries are bound by the station type and commodity categories.
    pub fn accepts_market(&self, station_type: &str, metal: &str) -> bool {
        self.accepts_station_type(station_type) && self.accepts_commodity(metal)
    }

    /// Powerplay entries are bound by the powerplay category only.
    pub fn accepts_powerplay(&self, power: &str) -> bool {
        self.accepts_power(power)
    }
}

/// Case-insensitive station type match that tolerates compound labels such as
/// "Outpost (Civilian)".
pub fn station_type_matches(preference: &str, station_type: &str) -> bool {
    let pref = preference.trim().to_lowercase();
    if pref.is_empty() {
        return false;
    }
    let actual = station_type.trim().to_lowercase();
    actual == pref
        || actual.starts_with(&format!("{pref} "))
        || actual.starts_with(&format!("{pref}("))
        || format!(" {actual} ").contains(&format!(" {pref} "))
}

fn normalize_values(values: &[String], allowed: &[&str]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for value in values {
        let key = value.trim().to_lowercase();
        let Some(canonical) = allowed.iter().find(|opt| opt.to_lowercase() == key) else {
            continue;
        };
        if seen.insert(*canonical) {
            out.push((*canonical).to_string());
        }
    }
    out
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LooseItem {
    Text(String),
    Other(IgnoredAny),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<LooseItem>),
    Other(IgnoredAny),
}

// Hand-edited preference files hold bare strings, lists with stray numbers or nulls.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(items) => items
            .into_iter()
            .filter_map(|item| match item {
                LooseItem::Text(text) => Some(text),
                LooseItem::Other(_) => None,
            })
            .collect(),
        OneOrMany::Other(_) => Vec::new(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LooseText {
    Text(String),
    Number(f64),
}

impl LooseText {
    fn into_percent_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Number(n) if n.fract() == 0.0 => format!("{}%", n as i64),
            Self::Number(n) => format!("{n}%"),
        }
    }
}

#[derive(Deserialize)]
struct StoredPowerplay {
    #[serde(default)]
    power: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    progress: Option<LooseText>,
    #[serde(default)]
    commodity_urls: Option<String>,
    #[serde(default)]
    cooldowns: Cooldowns,
}

// Older documents carry `"powerplay": {}` for systems without powerplay data and
// integer progress values.
fn deserialize_powerplay<'de, D>(deserializer: D) -> Result<Option<PowerplayBlock>, D::Error>
where
    D: Deserializer<'de>,
{
    let stored: Option<StoredPowerplay> = Option::deserialize(deserializer)?;
    Ok(stored.and_then(|raw| {
        if raw.power.is_none() && raw.status.is_none() && raw.cooldowns.is_empty() {
            return None;
        }
        Some(PowerplayBlock {
            power: raw.power.unwrap_or_default(),
            status: raw
                .status
                .as_deref()
                .map(PowerplayStatus::from)
                .unwrap_or_default(),
            progress: raw
                .progress
                .map(LooseText::into_percent_text)
                .unwrap_or_default(),
            commodity_urls: raw.commodity_urls.unwrap_or_default(),
            cooldowns: raw.cooldowns,
        })
    }))
}
