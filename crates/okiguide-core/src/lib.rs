//! Core guide model, ingestion normalization and the filter predicate evaluator.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "okiguide-core";

pub const PAGE_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuideStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionPolicy {
    Ok,
    Ask,
    No,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guide {
    pub id: String,
    pub name: String,
    pub location: String,
    pub languages: Vec<String>,
    pub specialties: Vec<String>,
    pub introduction: String,
    pub session_rate: u32,
    pub extension_policy: ExtensionPolicy,
    pub late_night_policy: bool,
    pub status: GuideStatus,
    pub registered_at: Option<DateTime<Utc>>,
}

impl Guide {
    pub fn is_published(&self) -> bool {
        !self.name.trim().is_empty() && self.session_rate > 0
    }

    pub fn is_displayable(&self) -> bool {
        self.status == GuideStatus::Approved && self.is_published()
    }
}

/// Fold one loosely-typed upstream record into a [`Guide`]. Records without an id are dropped.
pub fn normalize_guide(raw: &JsonValue) -> Option<Guide> {
    let id = first_present(raw, &["id", "guideId", "_id"]).and_then(json_to_trimmed_string)?;

    Some(Guide {
        id,
        name: string_field(raw, &["name", "guideName"]),
        location: string_field(raw, &["location", "area", "region"]),
        languages: list_field(raw, &["languages", "language"]),
        specialties: list_field(raw, &["specialties", "specialty", "specialities"]),
        introduction: string_field(raw, &["introduction", "intro", "description", "profile"]),
        session_rate: first_present(raw, &["sessionRate", "price", "basePrice"])
            .map(parse_session_rate)
            .unwrap_or(0),
        extension_policy: first_present(raw, &["extensionPolicy", "extension"])
            .map(parse_extension_policy)
            .unwrap_or(ExtensionPolicy::Ask),
        late_night_policy: first_present(raw, &["lateNightPolicy", "lateNight"])
            .map(parse_bool_like)
            .unwrap_or(false),
        status: first_present(raw, &["status"])
            .and_then(JsonValue::as_str)
            .map(parse_status)
            .unwrap_or(GuideStatus::Pending),
        registered_at: first_present(raw, &["registeredAt", "createdAt", "registrationDate"])
            .and_then(parse_timestamp),
    })
}

/// Parse a session rate. Anything unparseable or negative becomes 0.
pub fn parse_session_rate(value: &JsonValue) -> u32 {
    match value {
        JsonValue::Number(n) => {
            if let Some(v) = n.as_u64() {
                v.min(u64::from(u32::MAX)) as u32
            } else {
                n.as_f64().map(rate_from_f64).unwrap_or(0)
            }
        }
        JsonValue::String(s) => {
            let cleaned = s
                .trim()
                .trim_start_matches("JPY")
                .chars()
                .filter(|c| !matches!(c, '¥' | '￥' | ',' | '円' | ' '))
                .collect::<String>();
            if let Ok(v) = cleaned.parse::<u64>() {
                v.min(u64::from(u32::MAX)) as u32
            } else {
                cleaned.parse::<f64>().map(rate_from_f64).unwrap_or(0)
            }
        }
        _ => 0,
    }
}

fn rate_from_f64(v: f64) -> u32 {
    if v.is_finite() && v > 0.0 {
        v.round().min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}

fn parse_extension_policy(value: &JsonValue) -> ExtensionPolicy {
    match value {
        JsonValue::Bool(true) => ExtensionPolicy::Ok,
        JsonValue::Bool(false) => ExtensionPolicy::No,
        JsonValue::String(s) => match s.trim().to_lowercase().as_str() {
            "ok" | "yes" | "allowed" | "available" | "可能" | "可" => ExtensionPolicy::Ok,
            "no" | "none" | "not_allowed" | "不可" | "不可能" => ExtensionPolicy::No,
            _ => ExtensionPolicy::Ask,
        },
        _ => ExtensionPolicy::Ask,
    }
}

fn parse_bool_like(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        JsonValue::String(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "true" | "yes" | "1" | "ok" | "on" | "可能" | "対応可"
        ),
        _ => false,
    }
}

fn parse_status(raw: &str) -> GuideStatus {
    match raw.trim().to_lowercase().as_str() {
        "approved" | "active" | "承認済み" => GuideStatus::Approved,
        "rejected" | "却下" => GuideStatus::Rejected,
        _ => GuideStatus::Pending,
    }
}

fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        }
        JsonValue::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

fn first_present<'a>(raw: &'a JsonValue, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .filter_map(|k| raw.get(*k))
        .find(|v| !v.is_null())
}

fn json_to_trimmed_string(value: &JsonValue) -> Option<String> {
    let s = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn string_field(raw: &JsonValue, keys: &[&str]) -> String {
    first_present(raw, keys)
        .and_then(JsonValue::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn list_field(raw: &JsonValue, keys: &[&str]) -> Vec<String> {
    match first_present(raw, keys) {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(JsonValue::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(JsonValue::String(s)) => s
            .split([',', '、', '/', '・'])
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

pub fn sort_newest_first(guides: &mut [Guide]) {
    guides.sort_by(|a, b| b.registered_at.cmp(&a.registered_at));
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuideSnapshot {
    guides: Vec<Guide>,
    fingerprint: String,
}

impl GuideSnapshot {
    pub fn ingest(guides: Vec<Guide>) -> Self {
        let mut guides = guides
            .into_iter()
            .filter(Guide::is_displayable)
            .collect::<Vec<_>>();
        sort_newest_first(&mut guides);
        let fingerprint = fingerprint_guides(&guides);
        Self { guides, fingerprint }
    }

    pub fn from_json_records(records: &[JsonValue]) -> Self {
        Self::ingest(records.iter().filter_map(normalize_guide).collect())
    }

    pub fn empty() -> Self {
        Self::ingest(Vec::new())
    }

    pub fn guides(&self) -> &[Guide] {
        &self.guides
    }

    pub fn into_guides(self) -> Vec<Guide> {
        self.guides
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.guides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guides.is_empty()
    }
}

/// SHA-256 over every field that can change what a card shows.
pub fn fingerprint_guides(guides: &[Guide]) -> String {
    let mut hasher = Sha256::new();
    for g in guides {
        for part in [
            g.id.as_str(),
            g.name.as_str(),
            g.location.as_str(),
            g.introduction.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f_u8]);
        }
        hasher.update(g.languages.join("\u{1e}").as_bytes());
        hasher.update([0x1f_u8]);
        hasher.update(g.specialties.join("\u{1e}").as_bytes());
        hasher.update([0x1f_u8]);
        hasher.update(g.session_rate.to_be_bytes());
        hasher.update([g.extension_policy as u8, u8::from(g.late_night_policy), g.status as u8]);
        if let Some(ts) = g.registered_at {
            hasher.update(ts.timestamp_millis().to_be_bytes());
        }
        hasher.update([0x1d_u8]);
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceBand {
    Budget,
    Premium,
    Luxury,
}

impl PriceBand {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "budget" => Some(Self::Budget),
            "premium" => Some(Self::Premium),
            "luxury" => Some(Self::Luxury),
            _ => None,
        }
    }

    pub fn bounds(self) -> (u32, Option<u32>) {
        match self {
            Self::Budget => (6_000, Some(10_000)),
            Self::Premium => (10_001, Some(20_000)),
            Self::Luxury => (20_001, None),
        }
    }

    pub fn contains(self, rate: u32) -> bool {
        let (min, max) = self.bounds();
        rate >= min && max.map_or(true, |max| rate <= max)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Budget => "budget",
            Self::Premium => "premium",
            Self::Luxury => "luxury",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterInputs {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub keyword: Option<String>,
}

pub trait FilterInputReader {
    fn read_filter_inputs(&self) -> FilterInputs;
}

impl FilterInputReader for FilterInputs {
    fn read_filter_inputs(&self) -> FilterInputs {
        self.clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub location: Option<String>,
    pub language: Option<String>,
    pub price: Option<PriceBand>,
    pub keyword: Option<String>,
}

impl FilterSpec {
    /// Blank fields become `None`. An unrecognised price band is dropped rather than
    /// matching nothing.
    pub fn from_inputs(inputs: &FilterInputs) -> Self {
        Self {
            location: non_blank(inputs.location.as_deref()),
            language: non_blank(inputs.language.as_deref()),
            price: inputs.price.as_deref().and_then(PriceBand::parse),
            keyword: non_blank(inputs.keyword.as_deref()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.location.is_none()
            && self.language.is_none()
            && self.price.is_none()
            && self.keyword.is_none()
    }

    pub fn compile(&self) -> GuideFilter {
        GuideFilter::compile(self)
    }
}

fn non_blank(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

const LANGUAGE_ALIASES: &[(&str, &[&str])] = &[
    ("english", &["english", "en", "英語", "eng"]),
    ("japanese", &["japanese", "ja", "jp", "日本語", "jpn"]),
    ("chinese", &["chinese", "zh", "中国語", "中文", "mandarin"]),
    ("korean", &["korean", "ko", "韓国語", "한국어"]),
    ("spanish", &["spanish", "español", "スペイン語"]),
    ("french", &["french", "français", "フランス語"]),
];

pub fn language_aliases(raw: &str) -> Vec<String> {
    let needle = raw.trim().to_lowercase();
    LANGUAGE_ALIASES
        .iter()
        .find(|(canonical, aliases)| *canonical == needle || aliases.contains(&needle.as_str()))
        .map(|(_, aliases)| aliases.iter().map(|a| a.to_string()).collect())
        .unwrap_or_else(|| vec![needle])
}

const REGION_ALIASES: &[(&str, &[&str])] = &[
    ("naha", &["naha", "那覇", "なは"]),
    (
        "north",
        &["north", "northern", "yanbaru", "nago", "motobu", "北部", "やんばる", "名護", "本部"],
    ),
    (
        "central",
        &[
            "central", "chatan", "okinawa city", "ginowan", "yomitan", "onna", "中部", "北谷",
            "沖縄市", "宜野湾", "読谷", "恩納",
        ],
    ),
    (
        "south",
        &["south", "southern", "itoman", "nanjo", "tomigusuku", "南部", "糸満", "南城", "豊見城"],
    ),
    ("miyako", &["miyako", "miyakojima", "宮古"]),
    (
        "yaeyama",
        &["yaeyama", "ishigaki", "iriomote", "taketomi", "八重山", "石垣", "西表", "竹富"],
    ),
    ("kerama", &["kerama", "zamami", "tokashiki", "慶良間", "座間味", "渡嘉敷"]),
];

pub fn normalize_location(raw: &str) -> Option<&'static str> {
    let needle = raw.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    if let Some((code, _)) = REGION_ALIASES.iter().find(|(code, _)| *code == needle) {
        return Some(*code);
    }
    REGION_ALIASES
        .iter()
        .find(|(_, aliases)| aliases.iter().any(|a| needle.contains(a)))
        .map(|(code, _)| *code)
}

#[derive(Debug, Clone)]
struct LocationMatcher {
    raw: String,
    lowered: String,
    code: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct GuideFilter {
    location: Option<LocationMatcher>,
    language_aliases: Option<Vec<String>>,
    price: Option<PriceBand>,
    keyword: Option<String>,
}

impl GuideFilter {
    pub fn compile(spec: &FilterSpec) -> Self {
        Self {
            location: spec.location.as_ref().map(|raw| LocationMatcher {
                raw: raw.clone(),
                lowered: raw.to_lowercase(),
                code: normalize_location(raw),
            }),
            language_aliases: spec.language.as_deref().map(language_aliases),
            price: spec.price,
            keyword: spec.keyword.as_ref().map(|k| k.to_lowercase()),
        }
    }

    pub fn matches(&self, guide: &Guide) -> bool {
        self.location_matches(guide)
            && self.language_matches(guide)
            && self.price_matches(guide)
            && self.keyword_matches(guide)
    }

    fn location_matches(&self, guide: &Guide) -> bool {
        let Some(filter) = &self.location else {
            return true;
        };
        let location = guide.location.trim();
        if location.is_empty() {
            return false;
        }
        if filter.code.is_some() && normalize_location(location) == filter.code {
            return true;
        }
        if location == filter.raw {
            return true;
        }
        let lowered = location.to_lowercase();
        lowered.contains(&filter.lowered) || filter.lowered.contains(&lowered)
    }

    fn language_matches(&self, guide: &Guide) -> bool {
        let Some(aliases) = &self.language_aliases else {
            return true;
        };
        guide
            .languages
            .iter()
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .any(|lang| {
                aliases
                    .iter()
                    .any(|alias| lang.contains(alias.as_str()) || alias.contains(lang.as_str()))
            })
    }

    fn price_matches(&self, guide: &Guide) -> bool {
        self.price.map_or(true, |band| band.contains(guide.session_rate))
    }

    fn keyword_matches(&self, guide: &Guide) -> bool {
        let Some(keyword) = &self.keyword else {
            return true;
        };
        let haystack = format!("{} {} {}", guide.name, guide.introduction, guide.location);
        haystack.to_lowercase().contains(keyword.as_str())
    }
}

pub fn filter_guides(guides: &[Guide], spec: &FilterSpec) -> Vec<Guide> {
    let filter = spec.compile();
    guides.iter().filter(|g| filter.matches(g)).cloned().collect()
}
