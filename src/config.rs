//! Configuration file loading and validation.
//!
//! The JSON file is read into [`RawConfig`] (everything optional), then
//! [`validate`] turns it into an immutable [`Config`] or the full list of
//! problems found. Validation is pure so it can be tested without a file.
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::Service;

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const MAX_CONCURRENCY: usize = 64;
pub const DEFAULT_INTERVAL_SECS: u64 = 3600;
pub const MIN_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_STATE_FILE: &str = "/config/unmonitarr_state.json";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub general: RawGeneral,
    pub services: RawServices,
    pub notifications: RawNotifications,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawGeneral {
    pub release_groups: ReleaseGroupsInput,
    pub dry_run: bool,
    pub debug: bool,
    pub concurrent: Option<i64>,
    pub monitoring: RawMonitoring,
}

/// Accepts both `["A", "B"]` and `"A, B"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReleaseGroupsInput {
    List(Vec<String>),
    Csv(String),
}

impl Default for ReleaseGroupsInput {
    fn default() -> Self {
        ReleaseGroupsInput::List(Vec::new())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawMonitoring {
    pub interval: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawServices {
    pub radarr: Option<RawService>,
    pub sonarr: Option<RawService>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawService {
    pub enabled: bool,
    pub host: Option<String>,
    pub port: Option<i64>,
    pub apikey: Option<String>,
    pub url: Option<String>,
    pub season_filter: Option<i32>,
    pub sample_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawNotifications {
    pub discord: RawDiscord,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawDiscord {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub throttle_limit: ThrottleLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ThrottleLimits {
    pub movies: usize,
    pub episodes: usize,
    pub seasons: usize,
    pub series: usize,
}

impl Default for ThrottleLimits {
    fn default() -> Self {
        Self {
            movies: 10,
            episodes: 25,
            seasons: 5,
            series: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub release_groups: Vec<String>,
    pub dry_run: bool,
    pub debug: bool,
    pub concurrency: usize,
    pub monitor_interval: Duration,
    pub radarr: Option<ServiceConfig>,
    pub sonarr: Option<ServiceConfig>,
    pub discord: Option<DiscordConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub base_url: String,
    pub api_key: String,
    pub season_filter: Option<i32>,
    pub sample_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscordConfig {
    pub webhook_url: String,
    pub throttle: ThrottleLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigIssue {
    #[error("no services enabled; enable radarr and/or sonarr")]
    NoServicesEnabled,
    #[error("{0}: missing apikey")]
    MissingApiKey(Service),
    #[error("{0}: missing host (or url)")]
    MissingHost(Service),
    #[error("{service}: invalid port {port}")]
    InvalidPort { service: Service, port: i64 },
    #[error("{service}: url '{url}' must start with http:// or https://")]
    InvalidUrl { service: Service, url: String },
    #[error("{service}: season_filter must be >= 0, got {value}")]
    InvalidSeasonFilter { service: Service, value: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigNotice {
    #[error("split comma-separated release groups {original:?} into {fixed:?}")]
    SplitReleaseGroups {
        original: Vec<String>,
        fixed: Vec<String>,
    },
    #[error("no release groups configured; nothing will be unmonitored")]
    NoReleaseGroups,
    #[error("concurrent={requested} is out of range, using {used}")]
    ConcurrencyClamped { requested: i64, used: usize },
    #[error("monitoring interval {requested}s is too short, using {used}s")]
    IntervalRaised { requested: u64, used: u64 },
    #[error("season_filter has no effect on {0}")]
    SeasonFilterIgnored(Service),
    #[error("discord notifications enabled without a webhook url; disabling")]
    DiscordWithoutWebhook,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedConfig {
    pub config: Config,
    pub notices: Vec<ConfigNotice>,
}

/// Validation-and-defaulting pass. Collects every issue instead of stopping
/// at the first one.
pub fn validate(raw: RawConfig) -> Result<ValidatedConfig, Vec<ConfigIssue>> {
    let mut issues = Vec::new();
    let mut notices = Vec::new();

    let release_groups = normalize_release_groups(raw.general.release_groups, &mut notices);
    if release_groups.is_empty() {
        notices.push(ConfigNotice::NoReleaseGroups);
    }

    let concurrency = match raw.general.concurrent {
        None => DEFAULT_CONCURRENCY,
        Some(n) => {
            let used = n.clamp(1, MAX_CONCURRENCY as i64) as usize;
            if used as i64 != n {
                notices.push(ConfigNotice::ConcurrencyClamped { requested: n, used });
            }
            used
        }
    };

    let interval = match raw.general.monitoring.interval {
        None => DEFAULT_INTERVAL_SECS,
        Some(secs) if secs < MIN_INTERVAL_SECS => {
            notices.push(ConfigNotice::IntervalRaised {
                requested: secs,
                used: MIN_INTERVAL_SECS,
            });
            MIN_INTERVAL_SECS
        }
        Some(secs) => secs,
    };

    let radarr = validate_service(Service::Radarr, raw.services.radarr, &mut issues, &mut notices);
    let sonarr = validate_service(Service::Sonarr, raw.services.sonarr, &mut issues, &mut notices);
    if radarr.is_none() && sonarr.is_none() && issues.is_empty() {
        issues.push(ConfigIssue::NoServicesEnabled);
    }

    let discord = if raw.notifications.discord.enabled {
        match raw
            .notifications
            .discord
            .webhook_url
            .filter(|u| !u.trim().is_empty())
        {
            Some(url) => Some(DiscordConfig {
                webhook_url: url.trim().to_string(),
                throttle: raw.notifications.discord.throttle_limit,
            }),
            None => {
                notices.push(ConfigNotice::DiscordWithoutWebhook);
                None
            }
        }
    } else {
        None
    };

    if !issues.is_empty() {
        return Err(issues);
    }

    Ok(ValidatedConfig {
        config: Config {
            release_groups,
            dry_run: raw.general.dry_run,
            debug: raw.general.debug,
            concurrency,
            monitor_interval: Duration::from_secs(interval),
            radarr,
            sonarr,
            discord,
        },
        notices,
    })
}

fn normalize_release_groups(
    input: ReleaseGroupsInput,
    notices: &mut Vec<ConfigNotice>,
) -> Vec<String> {
    let original = match input {
        ReleaseGroupsInput::List(list) => list,
        ReleaseGroupsInput::Csv(s) => vec![s],
    };

    let mut split_any = false;
    let mut out: Vec<String> = Vec::new();
    for entry in &original {
        if entry.contains(',') {
            split_any = true;
        }
        for part in entry.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if out.iter().any(|g| g.eq_ignore_ascii_case(part)) {
                continue;
            }
            out.push(part.to_string());
        }
    }
    if split_any {
        notices.push(ConfigNotice::SplitReleaseGroups {
            original,
            fixed: out.clone(),
        });
    }
    out
}

fn validate_service(
    service: Service,
    raw: Option<RawService>,
    issues: &mut Vec<ConfigIssue>,
    notices: &mut Vec<ConfigNotice>,
) -> Option<ServiceConfig> {
    let raw = raw.filter(|r| r.enabled)?;
    let before = issues.len();

    let api_key = raw.apikey.unwrap_or_default().trim().to_string();
    if api_key.is_empty() {
        issues.push(ConfigIssue::MissingApiKey(service));
    }

    let base_url = match raw.url.filter(|u| !u.trim().is_empty()) {
        Some(url) => {
            let url = url.trim().trim_end_matches('/').to_string();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                issues.push(ConfigIssue::InvalidUrl { service, url: url.clone() });
            }
            if url.ends_with("/api/v3") {
                url
            } else {
                format!("{}/api/v3", url)
            }
        }
        None => {
            let host = raw.host.unwrap_or_default().trim().to_string();
            if host.is_empty() {
                issues.push(ConfigIssue::MissingHost(service));
            }
            let port = raw.port.unwrap_or(default_port(service));
            if !(1..=65535).contains(&port) {
                issues.push(ConfigIssue::InvalidPort { service, port });
            }
            format!("http://{}:{}/api/v3", host, port)
        }
    };

    let season_filter = match (service, raw.season_filter) {
        (_, None) => None,
        (Service::Radarr, Some(_)) => {
            notices.push(ConfigNotice::SeasonFilterIgnored(service));
            None
        }
        (Service::Sonarr, Some(value)) if value < 0 => {
            issues.push(ConfigIssue::InvalidSeasonFilter { service, value });
            None
        }
        (Service::Sonarr, Some(value)) => Some(value),
    };

    if issues.len() > before {
        return None;
    }
    Some(ServiceConfig {
        base_url,
        api_key,
        season_filter,
        sample_size: raw.sample_size.filter(|n| *n > 0),
    })
}

fn default_port(service: Service) -> i64 {
    match service {
        Service::Radarr => 7878,
        Service::Sonarr => 8989,
    }
}

/// Applies environment overrides before validation. `lookup` is usually
/// `std::env::var(..).ok()`.
pub fn apply_env_overrides<F>(raw: &mut RawConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(secs) = lookup("MONITOR_INTERVAL").and_then(|v| v.trim().parse::<u64>().ok()) {
        raw.general.monitoring.interval = Some(secs);
    }
    if let Some(url) = lookup("DISCORD_WEBHOOK_URL").filter(|v| !v.trim().is_empty()) {
        raw.notifications.discord.webhook_url = Some(url);
    }
}

pub fn parse_config(content: &str) -> Result<RawConfig> {
    serde_json::from_str(content).context("config is not valid JSON for the expected layout")
}

/// Reads only `general.debug`, so logging can be set up before the full
/// load. Any problem reads as `false`; [`load_config`] reports it properly.
pub fn peek_debug(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|c| parse_config(&c).ok())
        .is_some_and(|raw| raw.general.debug)
}

/// Reads, overrides and validates the config file, logging every notice.
pub async fn load_config(path: &Path) -> Result<Config> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let mut raw = parse_config(&content)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    apply_env_overrides(&mut raw, |key| std::env::var(key).ok());

    let ValidatedConfig { config, notices } = validate(raw).map_err(|issues| {
        let list = issues
            .iter()
            .map(|i| format!("  - {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        anyhow!("Invalid configuration in {}:\n{}", path.display(), list)
    })?;
    for notice in &notices {
        warn!("Config: {}", notice);
    }

    info!("Configuration loaded from {}", path.display());
    if let Some(radarr) = &config.radarr {
        info!("Radarr enabled at {}", radarr.base_url);
    }
    if let Some(sonarr) = &config.sonarr {
        info!("Sonarr enabled at {}", sonarr.base_url);
    }
    let groups = config
        .release_groups
        .iter()
        .map(|g| format!("\"{}\"", g))
        .collect::<Vec<_>>()
        .join(", ");
    info!("Targeting release groups: [{}]", groups);
    info!("Using {} concurrent workers", config.concurrency);
    Ok(config)
}
