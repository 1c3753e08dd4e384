//! Typed views over Radarr/Sonarr API records.
//!
//! The services return loosely shaped JSON. Each record is deserialized into a
//! private raw struct with every field optional, then validated into the public
//! type: `id` and `monitored` are required, everything else stays an `Option`.
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Radarr,
    Sonarr,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Radarr => "radarr",
            Service::Sonarr => "sonarr",
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Movie,
    Episode,
}

/// Common surface of the leaf items the matcher runs against.
pub trait MediaItem {
    fn kind(&self) -> MediaKind;
    fn id(&self) -> u64;
    fn file_path(&self) -> Option<&str>;
    fn is_monitored(&self) -> bool;
    fn last_updated(&self) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Movie {
    pub id: u64,
    pub title: String,
    pub monitored: bool,
    pub file_path: Option<String>,
    pub added: Option<DateTime<Utc>>,
    pub file_added: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    pub id: u64,
    pub series_id: u64,
    pub season_number: i32,
    pub episode_number: i32,
    pub title: String,
    pub monitored: bool,
    pub has_file: bool,
    pub file_path: Option<String>,
    pub file_added: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeasonInfo {
    pub season_number: i32,
    pub monitored: bool,
    pub episode_file_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub id: u64,
    pub title: String,
    pub monitored: bool,
    pub seasons: Vec<SeasonInfo>,
    /// Sonarr's `monitorNewItems` policy; `"all"` keeps future seasons monitored.
    pub monitor_new_items: Option<String>,
    pub added: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMediaFile {
    path: Option<String>,
    relative_path: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    date_added: Option<DateTime<Utc>>,
}

impl RawMediaFile {
    fn best_path(self) -> (Option<String>, Option<DateTime<Utc>>) {
        let path = self
            .path
            .filter(|p| !p.trim().is_empty())
            .or(self.relative_path.filter(|p| !p.trim().is_empty()));
        (path, self.date_added)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMovie {
    id: Option<u64>,
    title: Option<String>,
    monitored: Option<bool>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    added: Option<DateTime<Utc>>,
    movie_file: Option<RawMediaFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEpisode {
    id: Option<u64>,
    series_id: Option<u64>,
    season_number: Option<i32>,
    episode_number: Option<i32>,
    title: Option<String>,
    monitored: Option<bool>,
    #[serde(default)]
    has_file: bool,
    episode_file: Option<RawMediaFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSeason {
    season_number: Option<i32>,
    #[serde(default)]
    monitored: bool,
    statistics: Option<RawSeasonStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSeasonStatistics {
    episode_file_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSeries {
    id: Option<u64>,
    title: Option<String>,
    monitored: Option<bool>,
    #[serde(default)]
    seasons: Vec<RawSeason>,
    monitor_new_items: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    added: Option<DateTime<Utc>>,
}

impl Movie {
    pub fn from_json(value: Value) -> Result<Self> {
        let raw: RawMovie = serde_json::from_value(value)?;
        let id = raw.id.ok_or_else(|| anyhow!("movie record without id"))?;
        let monitored = raw
            .monitored
            .ok_or_else(|| anyhow!("movie {} has no monitored flag", id))?;
        let (file_path, file_added) = raw
            .movie_file
            .map(RawMediaFile::best_path)
            .unwrap_or((None, None));
        Ok(Self {
            id,
            title: raw.title.unwrap_or_else(|| format!("movie {}", id)),
            monitored,
            file_path,
            added: raw.added,
            file_added,
        })
    }
}

impl Episode {
    pub fn from_json(value: Value) -> Result<Self> {
        let raw: RawEpisode = serde_json::from_value(value)?;
        let id = raw.id.ok_or_else(|| anyhow!("episode record without id"))?;
        let monitored = raw
            .monitored
            .ok_or_else(|| anyhow!("episode {} has no monitored flag", id))?;
        let series_id = raw
            .series_id
            .ok_or_else(|| anyhow!("episode {} has no series id", id))?;
        let (file_path, file_added) = raw
            .episode_file
            .map(RawMediaFile::best_path)
            .unwrap_or((None, None));
        Ok(Self {
            id,
            series_id,
            season_number: raw.season_number.unwrap_or(0),
            episode_number: raw.episode_number.unwrap_or(0),
            title: raw.title.unwrap_or_default(),
            monitored,
            has_file: raw.has_file && file_path.is_some(),
            file_path,
            file_added,
        })
    }

    /// `S01E02`-style label for log lines.
    pub fn label(&self) -> String {
        format!("S{:02}E{:02}", self.season_number, self.episode_number)
    }
}

impl Series {
    pub fn from_json(value: Value) -> Result<Self> {
        let raw: RawSeries = serde_json::from_value(value)?;
        let id = raw.id.ok_or_else(|| anyhow!("series record without id"))?;
        let monitored = raw
            .monitored
            .ok_or_else(|| anyhow!("series {} has no monitored flag", id))?;
        let seasons = raw
            .seasons
            .into_iter()
            .filter_map(|s| {
                Some(SeasonInfo {
                    season_number: s.season_number?,
                    monitored: s.monitored,
                    episode_file_count: s.statistics.and_then(|st| st.episode_file_count),
                })
            })
            .collect();
        Ok(Self {
            id,
            title: raw.title.unwrap_or_else(|| format!("series {}", id)),
            monitored,
            seasons,
            monitor_new_items: raw.monitor_new_items,
            added: raw.added,
        })
    }

    /// Seasons the service reports as holding at least one file, ascending.
    /// `None` when the listing carried no statistics to judge from.
    pub fn seasons_with_files(&self) -> Option<Vec<i32>> {
        let mut out = Vec::new();
        for season in &self.seasons {
            match season.episode_file_count {
                Some(0) => {}
                Some(_) => out.push(season.season_number),
                None => return None,
            }
        }
        out.sort_unstable();
        out.dedup();
        Some(out)
    }

    pub fn monitors_future_seasons(&self) -> bool {
        self.monitor_new_items
            .as_deref()
            .map(|v| v.eq_ignore_ascii_case("all"))
            .unwrap_or(true)
    }
}

impl MediaItem for Movie {
    fn kind(&self) -> MediaKind {
        MediaKind::Movie
    }
    fn id(&self) -> u64 {
        self.id
    }
    fn file_path(&self) -> Option<&str> {
        self.file_path.as_deref()
    }
    fn is_monitored(&self) -> bool {
        self.monitored
    }
    fn last_updated(&self) -> Option<DateTime<Utc>> {
        match (self.added, self.file_added) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

impl MediaItem for Episode {
    fn kind(&self) -> MediaKind {
        MediaKind::Episode
    }
    fn id(&self) -> u64 {
        self.id
    }
    fn file_path(&self) -> Option<&str> {
        self.file_path.as_deref()
    }
    fn is_monitored(&self) -> bool {
        self.monitored
    }
    fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.file_added
    }
}

/// Parses an ISO-8601 timestamp, treating a missing offset as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    const NAIVE_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
    ];

    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub(crate) fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}
