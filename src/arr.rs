//! Radarr / Sonarr v3 API clients.
//!
//! Both services share the same auth (`X-Api-Key`) and error handling, so one
//! [`ArrClient`] backs both traits. The scan code only sees the traits.
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ServiceConfig;
use crate::models::{Episode, Movie, Series, Service};

/// Something whose monitored flag can be changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorTarget {
    Movie(u64),
    Episode(u64),
    Season { series_id: u64, season_number: i32 },
    Series(u64),
}

impl std::fmt::Display for MonitorTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorTarget::Movie(id) => write!(f, "movie {}", id),
            MonitorTarget::Episode(id) => write!(f, "episode {}", id),
            MonitorTarget::Season {
                series_id,
                season_number,
            } => write!(f, "series {} season {}", series_id, season_number),
            MonitorTarget::Series(id) => write!(f, "series {}", id),
        }
    }
}

#[async_trait]
pub trait MonitorApi: Send + Sync {
    /// Sets the monitored flag. For a series only the series-level flag is
    /// touched; its future-season policy stays as it is.
    async fn set_monitored(&self, target: MonitorTarget, monitored: bool) -> Result<()>;
}

#[async_trait]
pub trait RadarrApi: MonitorApi {
    async fn fetch_movies(&self) -> Result<Vec<Movie>>;
}

#[async_trait]
pub trait SonarrApi: MonitorApi {
    async fn fetch_series(&self) -> Result<Vec<Series>>;
    async fn fetch_episodes(&self, series_id: u64) -> Result<Vec<Episode>>;
}

#[derive(Debug, Clone)]
pub struct ArrClient {
    client: Client,
    service: Service,
    base_url: String,
    api_key: String,
}

impl ArrClient {
    pub fn new(service: Service, config: &ServiceConfig) -> Result<Self> {
        let user_agent = format!("unmonitarr/{}", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .user_agent(user_agent)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            service,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    async fn send(&self, method: Method, endpoint: &str, body: Option<&Value>) -> Result<String> {
        let url = self.url(endpoint);
        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("X-Api-Key", &self.api_key);
        if let Some(body) = body {
            req = req.json(body);
        }
        let res = req.send().await.context("request failed")?;
        let status = res.status();
        let text = res.text().await.context("reading body failed")?;
        if !status.is_success() {
            return Err(anyhow!("{} {} -> {} {}", method, url, status, text));
        }
        Ok(text)
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let text = self.send(Method::GET, endpoint, None).await?;
        serde_json::from_str(&text).context("JSON parse failed")
    }

    async fn put_json(&self, endpoint: &str, body: &Value) -> Result<()> {
        self.send(Method::PUT, endpoint, Some(body)).await?;
        Ok(())
    }

    /// Fetches a JSON array and converts each element, dropping the ones that
    /// are missing required fields.
    async fn fetch_records<T>(
        &self,
        endpoint: &str,
        convert: fn(Value) -> Result<T>,
    ) -> Result<Vec<T>> {
        let values: Vec<Value> = self
            .get_json(endpoint)
            .await
            .with_context(|| format!("{}: fetching {} failed", self.service, endpoint))?;
        let total = values.len();
        let records: Vec<T> = values
            .into_iter()
            .filter_map(|v| match convert(v) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("{}: skipping invalid {} record: {:#}", self.service, endpoint, e);
                    None
                }
            })
            .collect();
        debug!("{}: {} of {} {} records usable", self.service, records.len(), total, endpoint);
        Ok(records)
    }

    async fn set_season_monitored(
        &self,
        series_id: u64,
        season_number: i32,
        monitored: bool,
    ) -> Result<()> {
        let endpoint = format!("series/{}", series_id);
        let mut series: Value = self.get_json(&endpoint).await?;
        let season = series
            .get_mut("seasons")
            .and_then(Value::as_array_mut)
            .and_then(|seasons| {
                seasons.iter_mut().find(|s| {
                    s.get("seasonNumber").and_then(Value::as_i64) == Some(i64::from(season_number))
                })
            })
            .ok_or_else(|| anyhow!("series {} has no season {}", series_id, season_number))?;
        season["monitored"] = Value::Bool(monitored);
        self.put_json(&endpoint, &series).await
    }

    async fn set_series_monitored(&self, series_id: u64, monitored: bool) -> Result<()> {
        let endpoint = format!("series/{}", series_id);
        let mut series: Value = self.get_json(&endpoint).await?;
        let obj = series
            .as_object_mut()
            .ok_or_else(|| anyhow!("series {} is not an object", series_id))?;
        obj.insert("monitored".into(), Value::Bool(monitored));
        self.put_json(&endpoint, &series).await
    }
}

#[async_trait]
impl MonitorApi for ArrClient {
    async fn set_monitored(&self, target: MonitorTarget, monitored: bool) -> Result<()> {
        let result = match (self.service, target) {
            (Service::Radarr, MonitorTarget::Movie(id)) => {
                let body = json!({ "movieIds": [id], "monitored": monitored });
                self.put_json("movie/editor", &body).await
            }
            (Service::Sonarr, MonitorTarget::Episode(id)) => {
                let body = json!({ "episodeIds": [id], "monitored": monitored });
                self.put_json("episode/monitor", &body).await
            }
            (
                Service::Sonarr,
                MonitorTarget::Season {
                    series_id,
                    season_number,
                },
            ) => self.set_season_monitored(series_id, season_number, monitored).await,
            (Service::Sonarr, MonitorTarget::Series(id)) => {
                self.set_series_monitored(id, monitored).await
            }
            (service, target) => {
                bail!("{} cannot change the monitored flag of {}", service, target)
            }
        };
        result.with_context(|| {
            format!("{}: setting monitored={} on {} failed", self.service, monitored, target)
        })
    }
}

#[async_trait]
impl RadarrApi for ArrClient {
    async fn fetch_movies(&self) -> Result<Vec<Movie>> {
        self.fetch_records("movie", Movie::from_json).await
    }
}

#[async_trait]
impl SonarrApi for ArrClient {
    async fn fetch_series(&self) -> Result<Vec<Series>> {
        self.fetch_records("series", Series::from_json).await
    }

    async fn fetch_episodes(&self, series_id: u64) -> Result<Vec<Episode>> {
        let endpoint = format!("episode?seriesId={}&includeEpisodeFile=true", series_id);
        self.fetch_records(&endpoint, Episode::from_json).await
    }
}
