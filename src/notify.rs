//! Run-summary notifications.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{DiscordConfig, ThrottleLimits};
use crate::scan::{EntityKind, RunSummary, UnmonitoredEntry};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, summary: &RunSummary) -> Result<()>;
}

const FOOTER: &str = "Unmonitarr: Media Library Management";
// Discord rejects field values over 1024 characters.
const MAX_FIELD_CHARS: usize = 1000;

#[derive(Debug, Clone)]
pub struct DiscordNotifier {
    client: Client,
    webhook_url: String,
    throttle: ThrottleLimits,
}

impl DiscordNotifier {
    pub fn new(config: &DiscordConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .user_agent(format!("unmonitarr/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            webhook_url: config.webhook_url.clone(),
            throttle: config.throttle,
        })
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify(&self, summary: &RunSummary) -> Result<()> {
        let Some(payload) = build_payload(summary, &self.throttle) else {
            debug!("Nothing to report to Discord");
            return Ok(());
        };
        let res = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("request failed")?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!("Discord webhook -> {} {}", status, text));
        }
        info!("Discord notification sent");
        Ok(())
    }
}

struct EmbedStyle {
    title: &'static str,
    noun: &'static str,
    color: u32,
}

fn style(kind: EntityKind) -> EmbedStyle {
    match kind {
        EntityKind::Movie => EmbedStyle {
            title: "🎬 Unmonitarr: Movie Cleanup",
            noun: "movies",
            color: 0xFF6B6B,
        },
        EntityKind::Episode => EmbedStyle {
            title: "📺 Unmonitarr: TV Episode Cleanup",
            noun: "episodes",
            color: 0x4ECDC4,
        },
        EntityKind::Season => EmbedStyle {
            title: "📺 Unmonitarr: Completed Seasons",
            noun: "seasons",
            color: 0x45B7D1,
        },
        EntityKind::Series => EmbedStyle {
            title: "📺 Unmonitarr: Completed Series",
            noun: "series",
            color: 0x96CEB4,
        },
    }
}

fn limit(throttle: &ThrottleLimits, kind: EntityKind) -> usize {
    match kind {
        EntityKind::Movie => throttle.movies,
        EntityKind::Episode => throttle.episodes,
        EntityKind::Season => throttle.seasons,
        EntityKind::Series => throttle.series,
    }
}

/// One embed per entity kind with something to report, items grouped by
/// release group. `None` when the run changed nothing.
pub fn build_payload(summary: &RunSummary, throttle: &ThrottleLimits) -> Option<Value> {
    let mut by_kind: BTreeMap<EntityKind, Vec<&UnmonitoredEntry>> = BTreeMap::new();
    for entry in summary.reports.iter().flat_map(|r| &r.entries) {
        by_kind.entry(entry.kind).or_default().push(entry);
    }
    if by_kind.is_empty() {
        return None;
    }

    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let embeds: Vec<Value> = by_kind
        .into_iter()
        .map(|(kind, entries)| {
            let style = style(kind);
            let max = limit(throttle, kind);
            let mut description = format!("Unmonitored {} {}", entries.len(), style.noun);
            if summary.dry_run {
                description.push_str(" (dry run)");
            }
            if entries.len() > max {
                description.push_str(&format!(", showing {}", max));
            }

            let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
            for entry in entries.iter().take(max) {
                let group = entry.release_group.as_deref().unwrap_or("Unknown");
                groups.entry(group).or_default().push(&entry.title);
            }
            let fields: Vec<Value> = groups
                .into_iter()
                .map(|(group, titles)| {
                    json!({
                        "name": format!("📦 Release Group: {}", group),
                        "value": code_block(&titles),
                        "inline": false,
                    })
                })
                .collect();

            json!({
                "title": style.title,
                "description": description,
                "color": style.color,
                "fields": fields,
                "timestamp": timestamp,
                "footer": { "text": FOOTER },
            })
        })
        .collect();

    Some(json!({ "embeds": embeds }))
}

fn code_block(titles: &[&str]) -> String {
    let mut body = String::new();
    for title in titles {
        if body.len() + title.len() + 1 > MAX_FIELD_CHARS {
            body.push_str("...\n");
            break;
        }
        body.push_str(title);
        body.push('\n');
    }
    format!("```\n{}```", body)
}
