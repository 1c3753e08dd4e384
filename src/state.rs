//! Persisted incremental-scan state.
//!
//! One [`ScanState`] per service lives in a single JSON file. Loading never
//! fails: a missing or unreadable file yields empty state. Saving writes a
//! sibling temp file and renames it over the old one.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::models::{lenient_timestamp, MediaItem, MediaKind, Service};

pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanState {
    pub unmonitored_movie_ids: BTreeSet<u64>,
    pub unmonitored_episode_ids: BTreeSet<u64>,
    pub unmonitored_seasons: BTreeMap<u64, BTreeSet<i32>>,
    pub unmonitored_series_ids: BTreeSet<u64>,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub last_scan_timestamp: Option<DateTime<Utc>>,
}

/// What one scan pass changed, handed to [`ScanState::merge`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanOutcome {
    pub unmonitored_movie_ids: BTreeSet<u64>,
    pub unmonitored_episode_ids: BTreeSet<u64>,
    pub completed_seasons: BTreeMap<u64, BTreeSet<i32>>,
    pub completed_series_ids: BTreeSet<u64>,
    /// Recorded episodes whose replacement file no longer matches.
    pub demoted_episode_ids: BTreeSet<u64>,
    /// Seasons that gained a file which is not unmonitored.
    pub demoted_seasons: BTreeMap<u64, BTreeSet<i32>>,
    pub demoted_series_ids: BTreeSet<u64>,
}

impl ScanOutcome {
    /// Folds another outcome into this one.
    pub fn absorb(&mut self, other: ScanOutcome) {
        self.unmonitored_movie_ids.extend(other.unmonitored_movie_ids);
        self.unmonitored_episode_ids.extend(other.unmonitored_episode_ids);
        for (series, seasons) in other.completed_seasons {
            self.completed_seasons.entry(series).or_default().extend(seasons);
        }
        self.completed_series_ids.extend(other.completed_series_ids);
        self.demoted_episode_ids.extend(other.demoted_episode_ids);
        for (series, seasons) in other.demoted_seasons {
            self.demoted_seasons.entry(series).or_default().extend(seasons);
        }
        self.demoted_series_ids.extend(other.demoted_series_ids);
    }
}

impl ScanState {
    /// Union of the outcome into the recorded sets. Demotions are applied first
    /// and are the only way anything leaves a set.
    pub fn merge(&mut self, outcome: &ScanOutcome) {
        for id in &outcome.demoted_episode_ids {
            self.unmonitored_episode_ids.remove(id);
        }
        for (series, seasons) in &outcome.demoted_seasons {
            if let Some(recorded) = self.unmonitored_seasons.get_mut(series) {
                for season in seasons {
                    recorded.remove(season);
                }
                if recorded.is_empty() {
                    self.unmonitored_seasons.remove(series);
                }
            }
        }
        for series in &outcome.demoted_series_ids {
            self.unmonitored_series_ids.remove(series);
        }

        self.unmonitored_movie_ids
            .extend(outcome.unmonitored_movie_ids.iter().copied());
        self.unmonitored_episode_ids
            .extend(outcome.unmonitored_episode_ids.iter().copied());
        for (series, seasons) in &outcome.completed_seasons {
            if seasons.is_empty() {
                continue;
            }
            self.unmonitored_seasons
                .entry(*series)
                .or_default()
                .extend(seasons.iter().copied());
        }
        self.unmonitored_series_ids
            .extend(outcome.completed_series_ids.iter().copied());
    }

    pub fn is_recorded(&self, kind: MediaKind, id: u64) -> bool {
        match kind {
            MediaKind::Movie => self.unmonitored_movie_ids.contains(&id),
            MediaKind::Episode => self.unmonitored_episode_ids.contains(&id),
        }
    }

    /// Skip only items already recorded whose upstream timestamp is not newer
    /// than `last_scan`. Anything unrecorded is always processed.
    pub fn should_process<T: MediaItem + ?Sized>(
        &self,
        item: &T,
        last_scan: Option<DateTime<Utc>>,
    ) -> bool {
        if !self.is_recorded(item.kind(), item.id()) {
            return true;
        }
        match (item.last_updated(), last_scan) {
            (Some(updated), Some(last)) => updated > last,
            _ => false,
        }
    }

    pub fn season_recorded(&self, series_id: u64, season: i32) -> bool {
        self.unmonitored_seasons
            .get(&series_id)
            .is_some_and(|s| s.contains(&season))
    }

    pub fn recorded_seasons(&self, series_id: u64) -> BTreeSet<i32> {
        self.unmonitored_seasons
            .get(&series_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn series_recorded(&self, series_id: u64) -> bool {
        self.unmonitored_series_ids.contains(&series_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub radarr: ScanState,
    pub sonarr: ScanState,
}

impl PersistedState {
    pub fn service(&self, service: Service) -> &ScanState {
        match service {
            Service::Radarr => &self.radarr,
            Service::Sonarr => &self.sonarr,
        }
    }

    pub fn service_mut(&mut self, service: Service) -> &mut ScanState {
        match service {
            Service::Radarr => &mut self.radarr,
            Service::Sonarr => &mut self.sonarr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Standard,
    Monitoring,
}

#[derive(Debug, Serialize)]
struct StateMetadata {
    schema_version: u32,
    version: &'static str,
    last_saved: DateTime<Utc>,
    scanning_mode: ScanMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceSummary {
    pub movies: usize,
    pub episodes: usize,
    pub seasons: usize,
    pub series: usize,
}

impl From<&ScanState> for ServiceSummary {
    fn from(state: &ScanState) -> Self {
        Self {
            movies: state.unmonitored_movie_ids.len(),
            episodes: state.unmonitored_episode_ids.len(),
            seasons: state.unmonitored_seasons.values().map(BTreeSet::len).sum(),
            series: state.unmonitored_series_ids.len(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StateEnvelope<'a> {
    radarr: &'a ScanState,
    sonarr: &'a ScanState,
    metadata: StateMetadata,
    summary: BTreeMap<&'static str, ServiceSummary>,
}

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: PersistedState,
}

impl StateStore {
    /// Reads the state file, falling back to empty state on any problem.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) => parse_state(&content).unwrap_or_else(|e| {
                warn!("State file {} is unreadable, starting fresh: {:#}", path.display(), e);
                PersistedState::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {}, starting fresh", path.display());
                PersistedState::default()
            }
            Err(e) => {
                warn!("Failed to read state file {}: {}", path.display(), e);
                PersistedState::default()
            }
        };
        Self { path, state }
    }

    pub fn with_state(path: impl Into<PathBuf>, state: PersistedState) -> Self {
        Self {
            path: path.into(),
            state,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn service(&self, service: Service) -> &ScanState {
        self.state.service(service)
    }

    pub fn merge(&mut self, service: Service, outcome: &ScanOutcome) {
        self.state.service_mut(service).merge(outcome);
    }

    pub fn mark_scan_completed(&mut self, service: Service, at: DateTime<Utc>) {
        self.state.service_mut(service).last_scan_timestamp = Some(at);
    }

    /// Writes the state atomically, keeping the previous file as `<path>.bak`.
    pub async fn save(&self, mode: ScanMode) -> Result<()> {
        let summary = BTreeMap::from([
            (Service::Radarr.as_str(), ServiceSummary::from(&self.state.radarr)),
            (Service::Sonarr.as_str(), ServiceSummary::from(&self.state.sonarr)),
        ]);
        let envelope = StateEnvelope {
            radarr: &self.state.radarr,
            sonarr: &self.state.sonarr,
            metadata: StateMetadata {
                schema_version: SCHEMA_VERSION,
                version: env!("CARGO_PKG_VERSION"),
                last_saved: Utc::now(),
                scanning_mode: mode,
            },
            summary,
        };
        let body = serde_json::to_string_pretty(&envelope).context("Failed to serialize state")?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create state directory {}", parent.display()))?;
        }

        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            let backup = sibling(&self.path, "bak");
            if let Err(e) = tokio::fs::copy(&self.path, &backup).await {
                warn!("Failed to back up state to {}: {}", backup.display(), e);
            }
        }

        let tmp = sibling(&self.path, "tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("Failed to write state temp file {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path).await.with_context(|| {
            format!("Failed to move state into place at {}", self.path.display())
        })?;

        for (service, s) in &envelope.summary {
            info!(
                "State {}: {} movies, {} episodes, {} seasons, {} series recorded unmonitored",
                service, s.movies, s.episodes, s.seasons, s.series
            );
        }
        debug!("Saved state to {}", self.path.display());
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "unmonitarr_state.json".into());
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn parse_state(content: &str) -> Result<PersistedState> {
    let value: Value = serde_json::from_str(content).context("state is not valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("state root is not an object");
    }
    let value = upgrade_legacy(value);
    serde_json::from_value(value).context("state does not match the expected layout")
}

/// Files written before schema 2 used `unmonitored_ids` per service and a
/// top-level `last_scan`. Their season and series records were not rollup
/// complete, so only the leaf skip-lists survive the upgrade.
fn upgrade_legacy(mut value: Value) -> Value {
    let schema = value
        .pointer("/metadata/schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(1);
    if schema >= u64::from(SCHEMA_VERSION) {
        return value;
    }

    let last_scan = value
        .get("last_scan")
        .or_else(|| value.pointer("/metadata/last_scan"))
        .and_then(Value::as_str)
        .map(str::to_string);
    debug!("Upgrading schema {} state file", schema);

    if let Some(radarr) = value.get_mut("radarr").and_then(Value::as_object_mut) {
        if let Some(ids) = radarr.remove("unmonitored_ids") {
            radarr.entry("unmonitored_movie_ids").or_insert(ids);
        }
        if let Some(ts) = &last_scan {
            radarr
                .entry("last_scan_timestamp")
                .or_insert_with(|| Value::String(ts.clone()));
        }
    }
    if let Some(sonarr) = value.get_mut("sonarr").and_then(Value::as_object_mut) {
        sonarr.remove("unmonitored_ids");
        sonarr.remove("unmonitored_seasons");
        if let Some(ts) = &last_scan {
            sonarr
                .entry("last_scan_timestamp")
                .or_insert_with(|| Value::String(ts.clone()));
        }
    }
    value
}
