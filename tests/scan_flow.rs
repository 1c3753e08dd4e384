use anyhow::{anyhow, bail};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use unmonitarr::app::App;
use unmonitarr::arr::{MonitorApi, MonitorTarget, RadarrApi, SonarrApi};
use unmonitarr::config::{Config, ServiceConfig};
use unmonitarr::models::{parse_timestamp, Episode, Movie, SeasonInfo, Series, Service};
use unmonitarr::notify::Notifier;
use unmonitarr::scan::{RunSummary, ScanOptions, ScanOrchestrator};
use unmonitarr::state::{ScanMode, StateStore};

#[derive(Default)]
struct FakeSonarr {
    series: Mutex<Vec<Series>>,
    episodes: Mutex<HashMap<u64, Vec<Episode>>>,
    calls: Mutex<Vec<MonitorTarget>>,
    failing: Mutex<Vec<MonitorTarget>>,
    // Trips the token once the given target has been applied.
    cancel_after: Mutex<Option<(MonitorTarget, CancellationToken)>>,
    fail_fetch: bool,
}

impl FakeSonarr {
    fn with(series: Series, episodes: Vec<Episode>) -> Self {
        let fake = FakeSonarr::default();
        fake.episodes.lock().unwrap().insert(series.id, episodes);
        fake.series.lock().unwrap().push(series);
        fake
    }

    fn cancel_after(&self, target: MonitorTarget, cancel: &CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((target, cancel.clone()));
    }

    fn calls(&self) -> Vec<MonitorTarget> {
        self.calls.lock().unwrap().clone()
    }

    fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn add_episode(&self, series_id: u64, episode: Episode) {
        self.episodes
            .lock()
            .unwrap()
            .entry(series_id)
            .or_default()
            .push(episode);
    }

    fn replace_file(&self, episode_id: u64, path: &str, added: DateTime<Utc>) {
        let mut episodes = self.episodes.lock().unwrap();
        for ep in episodes.values_mut().flatten() {
            if ep.id == episode_id {
                ep.file_path = Some(path.to_string());
                ep.file_added = Some(added);
            }
        }
    }
}

#[async_trait::async_trait]
impl MonitorApi for FakeSonarr {
    async fn set_monitored(&self, target: MonitorTarget, monitored: bool) -> anyhow::Result<()> {
        if self.failing.lock().unwrap().contains(&target) {
            bail!("sonarr refused {}", target);
        }
        self.calls.lock().unwrap().push(target);
        match target {
            MonitorTarget::Episode(id) => {
                for ep in self.episodes.lock().unwrap().values_mut().flatten() {
                    if ep.id == id {
                        ep.monitored = monitored;
                    }
                }
            }
            MonitorTarget::Season {
                series_id,
                season_number,
            } => {
                let mut series = self.series.lock().unwrap();
                for s in series.iter_mut().filter(|s| s.id == series_id) {
                    for season in s
                        .seasons
                        .iter_mut()
                        .filter(|n| n.season_number == season_number)
                    {
                        season.monitored = monitored;
                    }
                }
            }
            MonitorTarget::Series(id) => {
                for s in self.series.lock().unwrap().iter_mut().filter(|s| s.id == id) {
                    s.monitored = monitored;
                }
            }
            MonitorTarget::Movie(_) => bail!("sonarr has no movies"),
        }
        if let Some((after, cancel)) = &*self.cancel_after.lock().unwrap() {
            if *after == target {
                cancel.cancel();
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SonarrApi for FakeSonarr {
    async fn fetch_series(&self) -> anyhow::Result<Vec<Series>> {
        if self.fail_fetch {
            return Err(anyhow!("connection refused"));
        }
        Ok(self.series.lock().unwrap().clone())
    }

    async fn fetch_episodes(&self, series_id: u64) -> anyhow::Result<Vec<Episode>> {
        Ok(self
            .episodes
            .lock()
            .unwrap()
            .get(&series_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct FakeRadarr {
    movies: Mutex<Vec<Movie>>,
    calls: Mutex<Vec<MonitorTarget>>,
    fail_fetch: bool,
}

#[async_trait::async_trait]
impl MonitorApi for FakeRadarr {
    async fn set_monitored(&self, target: MonitorTarget, _monitored: bool) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(target);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RadarrApi for FakeRadarr {
    async fn fetch_movies(&self) -> anyhow::Result<Vec<Movie>> {
        if self.fail_fetch {
            return Err(anyhow!("connection refused"));
        }
        Ok(self.movies.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct FakeNotifier {
    sent: Mutex<Vec<RunSummary>>,
}

#[async_trait::async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, summary: &RunSummary) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(summary.clone());
        Ok(())
    }
}

fn service_config(season_filter: Option<i32>) -> ServiceConfig {
    ServiceConfig {
        base_url: "http://localhost/api/v3".into(),
        api_key: "key".into(),
        season_filter,
        sample_size: None,
    }
}

fn config(groups: &[&str]) -> Config {
    Config {
        release_groups: groups.iter().map(|g| g.to_string()).collect(),
        dry_run: false,
        debug: false,
        concurrency: 3,
        monitor_interval: Duration::from_secs(3600),
        radarr: Some(service_config(None)),
        sonarr: Some(service_config(None)),
        discord: None,
    }
}

fn series(id: u64, title: &str, seasons: &[i32]) -> Series {
    Series {
        id,
        title: title.into(),
        monitored: true,
        seasons: seasons
            .iter()
            .map(|&n| SeasonInfo {
                season_number: n,
                monitored: true,
                episode_file_count: None,
            })
            .collect(),
        monitor_new_items: Some("all".into()),
        added: parse_timestamp("2024-01-01T00:00:00Z"),
    }
}

fn episode(id: u64, series_id: u64, season: i32, number: i32, path: Option<&str>) -> Episode {
    Episode {
        id,
        series_id,
        season_number: season,
        episode_number: number,
        title: format!("Episode {}", number),
        monitored: true,
        has_file: path.is_some(),
        file_path: path.map(str::to_string),
        file_added: parse_timestamp("2024-01-02T00:00:00"),
    }
}

fn band_of_brothers() -> (Series, Vec<Episode>) {
    let episodes = (1..=10)
        .map(|n| {
            let path = format!(
                "/tv/Band of Brothers/Season 1/Band.of.Brothers.S01E{:02}.1080p.BluRay.x264-D-Z0N3.mkv",
                n
            );
            episode(100 + n as u64, 1, 1, n, Some(&path))
        })
        .collect();
    (series(1, "Band of Brothers", &[1]), episodes)
}

fn orchestrator(
    cfg: &Config,
    radarr: Option<Arc<FakeRadarr>>,
    sonarr: Option<Arc<FakeSonarr>>,
    cancel: CancellationToken,
) -> ScanOrchestrator {
    ScanOrchestrator::new(
        cfg,
        radarr.map(|r| r as Arc<dyn RadarrApi>),
        sonarr.map(|s| s as Arc<dyn SonarrApi>),
        cancel,
    )
}

fn store(dir: &tempfile::TempDir) -> StateStore {
    StateStore::with_state(dir.path().join("state.json"), Default::default())
}

#[tokio::test]
async fn band_of_brothers_rolls_up_and_keeps_future_seasons() {
    let (s, eps) = band_of_brothers();
    let sonarr = Arc::new(FakeSonarr::with(s, eps));
    let cfg = config(&["D-Z0N3"]);
    let dir = tempfile::tempdir().unwrap();
    let mut store = store(&dir);

    let summary = orchestrator(&cfg, None, Some(sonarr.clone()), CancellationToken::new())
        .run(&mut store, ScanOptions::default())
        .await;

    let counts = summary.report(Service::Sonarr).unwrap().counts;
    assert_eq!((counts.episodes, counts.seasons, counts.series), (10, 1, 1));
    assert_eq!(counts.failures, 0);

    let calls = sonarr.calls();
    assert_eq!(calls.len(), 12);
    assert!(calls[..10].iter().all(|c| matches!(c, MonitorTarget::Episode(_))));
    assert_eq!(
        calls[10],
        MonitorTarget::Season {
            series_id: 1,
            season_number: 1
        }
    );
    assert_eq!(calls[11], MonitorTarget::Series(1));

    let upstream = sonarr.series.lock().unwrap()[0].clone();
    assert!(!upstream.monitored);
    assert!(upstream.monitors_future_seasons());

    let state = store.service(Service::Sonarr);
    assert_eq!(state.unmonitored_episode_ids.len(), 10);
    assert!(state.season_recorded(1, 1));
    assert!(state.series_recorded(1));
    assert!(state.last_scan_timestamp.is_some());
}

#[tokio::test]
async fn second_run_on_unchanged_inventory_changes_nothing() {
    let (s, eps) = band_of_brothers();
    let sonarr = Arc::new(FakeSonarr::with(s, eps));
    let cfg = config(&["D-Z0N3"]);
    let dir = tempfile::tempdir().unwrap();
    let mut store = store(&dir);
    let orch = orchestrator(&cfg, None, Some(sonarr.clone()), CancellationToken::new());

    orch.run(&mut store, ScanOptions::default()).await;
    let after_first = store.state().clone();
    sonarr.clear_calls();

    let summary = orch.run(&mut store, ScanOptions::default()).await;
    assert!(sonarr.calls().is_empty());
    assert_eq!(summary.total_mutations(), 0);
    assert_eq!(summary.report(Service::Sonarr).unwrap().counts.skipped, 10);
    assert_eq!(store.state().sonarr.unmonitored_seasons, after_first.sonarr.unmonitored_seasons);
    assert_eq!(
        store.state().sonarr.unmonitored_series_ids,
        after_first.sonarr.unmonitored_series_ids
    );
}

#[tokio::test]
async fn partial_season_blocks_series_until_it_completes() {
    let s = series(7, "Two Seasons", &[1, 2]);
    let eps = vec![
        episode(1, 7, 1, 1, Some("Show.S01E01.720p-GRP.mkv")),
        episode(2, 7, 1, 2, Some("Show.S01E02.720p-GRP.mkv")),
        episode(3, 7, 2, 1, Some("Show.S02E01.720p-GRP.mkv")),
        episode(4, 7, 2, 2, Some("Show.S02E02.720p-OTHER.mkv")),
    ];
    let sonarr = Arc::new(FakeSonarr::with(s, eps));
    let cfg = config(&["grp"]);
    let dir = tempfile::tempdir().unwrap();
    let mut store = store(&dir);
    let orch = orchestrator(&cfg, None, Some(sonarr.clone()), CancellationToken::new());

    let summary = orch.run(&mut store, ScanOptions::default()).await;
    let counts = summary.report(Service::Sonarr).unwrap().counts;
    assert_eq!((counts.episodes, counts.seasons, counts.series), (3, 1, 0));
    let state = store.service(Service::Sonarr);
    assert_eq!(state.recorded_seasons(7), BTreeSet::from([1]));
    assert!(!state.series_recorded(7));

    // The odd file is replaced by a matching one.
    sonarr.clear_calls();
    sonarr.replace_file(4, "Show.S02E02.1080p-GRP.mkv", Utc::now() + ChronoDuration::hours(1));
    orch.run(&mut store, ScanOptions::default()).await;

    assert_eq!(
        sonarr.calls(),
        vec![
            MonitorTarget::Episode(4),
            MonitorTarget::Season {
                series_id: 7,
                season_number: 2
            },
            MonitorTarget::Series(7),
        ]
    );
    let state = store.service(Service::Sonarr);
    assert_eq!(state.recorded_seasons(7), BTreeSet::from([1, 2]));
    assert!(state.series_recorded(7));
    assert!(sonarr.series.lock().unwrap()[0].monitors_future_seasons());
}

#[tokio::test]
async fn new_unmatched_file_demotes_season_and_series_without_remote_calls() {
    let (s, eps) = band_of_brothers();
    let sonarr = Arc::new(FakeSonarr::with(s, eps));
    let cfg = config(&["D-Z0N3"]);
    let dir = tempfile::tempdir().unwrap();
    let mut store = store(&dir);
    let orch = orchestrator(&cfg, None, Some(sonarr.clone()), CancellationToken::new());
    orch.run(&mut store, ScanOptions::default()).await;
    sonarr.clear_calls();

    let mut extra = episode(111, 1, 1, 11, Some("Band.of.Brothers.S01E11.Bonus.720p-OTHER.mkv"));
    extra.file_added = Some(Utc::now() + ChronoDuration::hours(1));
    sonarr.add_episode(1, extra);
    orch.run(&mut store, ScanOptions::default()).await;

    assert!(sonarr.calls().is_empty());
    let state = store.service(Service::Sonarr);
    assert!(!state.season_recorded(1, 1));
    assert!(!state.series_recorded(1));
    assert_eq!(state.unmonitored_episode_ids.len(), 10);
}

#[tokio::test]
async fn season_filter_never_unmonitors_the_series() {
    let (s, eps) = band_of_brothers();
    let sonarr = Arc::new(FakeSonarr::with(s, eps));
    let mut cfg = config(&["D-Z0N3"]);
    cfg.sonarr = Some(service_config(Some(1)));
    let dir = tempfile::tempdir().unwrap();
    let mut store = store(&dir);

    let summary = orchestrator(&cfg, None, Some(sonarr.clone()), CancellationToken::new())
        .run(&mut store, ScanOptions::default())
        .await;

    let counts = summary.report(Service::Sonarr).unwrap().counts;
    assert_eq!((counts.episodes, counts.seasons, counts.series), (10, 1, 0));
    assert!(!sonarr.calls().contains(&MonitorTarget::Series(1)));
    assert!(!store.service(Service::Sonarr).series_recorded(1));
    assert!(sonarr.series.lock().unwrap()[0].monitored);
}

#[tokio::test]
async fn failed_mutation_is_retried_on_the_next_scan() {
    let (s, eps) = band_of_brothers();
    let sonarr = Arc::new(FakeSonarr::with(s, eps));
    sonarr.failing.lock().unwrap().push(MonitorTarget::Episode(103));
    let cfg = config(&["D-Z0N3"]);
    let dir = tempfile::tempdir().unwrap();
    let mut store = store(&dir);
    let orch = orchestrator(&cfg, None, Some(sonarr.clone()), CancellationToken::new());

    let summary = orch.run(&mut store, ScanOptions::default()).await;
    let counts = summary.report(Service::Sonarr).unwrap().counts;
    assert_eq!((counts.episodes, counts.seasons, counts.series), (9, 0, 0));
    assert_eq!(counts.failures, 1);
    assert!(!store.service(Service::Sonarr).unmonitored_episode_ids.contains(&103));

    sonarr.failing.lock().unwrap().clear();
    sonarr.clear_calls();
    orch.run(&mut store, ScanOptions::default()).await;
    assert_eq!(
        sonarr.calls(),
        vec![
            MonitorTarget::Episode(103),
            MonitorTarget::Season {
                series_id: 1,
                season_number: 1
            },
            MonitorTarget::Series(1),
        ]
    );
}

#[tokio::test]
async fn movies_are_unmonitored_or_adopted() {
    let movie = |id: u64, path: &str, monitored: bool| Movie {
        id,
        title: format!("Movie {}", id),
        monitored,
        file_path: Some(path.into()),
        added: parse_timestamp("2024-01-01T00:00:00Z"),
        file_added: parse_timestamp("2024-01-01T00:00:00Z"),
    };
    let radarr = Arc::new(FakeRadarr::default());
    radarr.movies.lock().unwrap().extend([
        movie(1, "Movie.2023.1080p.WEB-DL.DDP5.1.H.264-FGT.mkv", true),
        movie(2, "Movie.2023.1080p.BluRay.x264-OTHER.mkv", true),
        movie(3, "Movie (2021) [FGT].mkv", false),
    ]);
    let cfg = config(&["fgt"]);
    let dir = tempfile::tempdir().unwrap();
    let mut store = store(&dir);

    let summary = orchestrator(&cfg, Some(radarr.clone()), None, CancellationToken::new())
        .run(&mut store, ScanOptions::default())
        .await;

    let counts = summary.report(Service::Radarr).unwrap().counts;
    assert_eq!((counts.movies, counts.adopted), (1, 1));
    assert_eq!(*radarr.calls.lock().unwrap(), vec![MonitorTarget::Movie(1)]);
    assert_eq!(
        store.service(Service::Radarr).unmonitored_movie_ids,
        BTreeSet::from([1, 3])
    );
}

#[tokio::test]
async fn one_service_failing_to_fetch_leaves_the_other_intact() {
    let radarr = Arc::new(FakeRadarr {
        fail_fetch: true,
        ..Default::default()
    });
    let (s, eps) = band_of_brothers();
    let sonarr = Arc::new(FakeSonarr::with(s, eps));
    let cfg = config(&["D-Z0N3"]);
    let dir = tempfile::tempdir().unwrap();
    let mut store = store(&dir);

    let summary = orchestrator(&cfg, Some(radarr), Some(sonarr), CancellationToken::new())
        .run(&mut store, ScanOptions::default())
        .await;

    assert!(summary.report(Service::Radarr).unwrap().fetch_error.is_some());
    assert_eq!(summary.report(Service::Sonarr).unwrap().counts.series, 1);
    assert!(store.service(Service::Radarr).last_scan_timestamp.is_none());
    assert!(store.service(Service::Sonarr).last_scan_timestamp.is_some());
}

#[tokio::test]
async fn cancelled_scan_records_nothing_and_keeps_last_scan() {
    let (s, eps) = band_of_brothers();
    let sonarr = Arc::new(FakeSonarr::with(s, eps));
    let cfg = config(&["D-Z0N3"]);
    let dir = tempfile::tempdir().unwrap();
    let mut store = store(&dir);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = orchestrator(&cfg, None, Some(sonarr.clone()), cancel)
        .run(&mut store, ScanOptions::default())
        .await;

    assert!(summary.interrupted());
    assert!(sonarr.calls().is_empty());
    assert!(store.service(Service::Sonarr).last_scan_timestamp.is_none());
}

#[tokio::test]
async fn cancellation_during_the_last_episode_skips_rollups() {
    let (s, eps) = band_of_brothers();
    let sonarr = Arc::new(FakeSonarr::with(s, eps));
    let cfg = config(&["D-Z0N3"]);
    let dir = tempfile::tempdir().unwrap();
    let mut store = store(&dir);
    let cancel = CancellationToken::new();
    sonarr.cancel_after(MonitorTarget::Episode(110), &cancel);

    let summary = orchestrator(&cfg, None, Some(sonarr.clone()), cancel)
        .run(&mut store, ScanOptions::default())
        .await;

    assert!(summary.interrupted());
    let calls = sonarr.calls();
    assert_eq!(calls.len(), 10);
    assert!(calls.iter().all(|c| matches!(c, MonitorTarget::Episode(_))));

    let state = store.service(Service::Sonarr);
    assert_eq!(state.unmonitored_episode_ids.len(), 10);
    assert!(!state.season_recorded(1, 1));
    assert!(!state.series_recorded(1));
    assert!(state.last_scan_timestamp.is_none());
    assert!(sonarr.series.lock().unwrap()[0].monitored);
}

#[tokio::test]
async fn cancellation_between_seasons_keeps_finished_seasons_only() {
    let s = series(2, "The Pacific", &[1, 2]);
    let eps = vec![
        episode(201, 2, 1, 1, Some("The.Pacific.S01E01.1080p.BluRay.x264-D-Z0N3.mkv")),
        episode(202, 2, 1, 2, Some("The.Pacific.S01E02.1080p.BluRay.x264-D-Z0N3.mkv")),
        episode(203, 2, 2, 1, Some("The.Pacific.S02E01.1080p.BluRay.x264-D-Z0N3.mkv")),
    ];
    let sonarr = Arc::new(FakeSonarr::with(s, eps));
    let cfg = config(&["D-Z0N3"]);
    let dir = tempfile::tempdir().unwrap();
    let mut store = store(&dir);
    let cancel = CancellationToken::new();
    let first_season = MonitorTarget::Season {
        series_id: 2,
        season_number: 1,
    };
    sonarr.cancel_after(first_season, &cancel);

    let summary = orchestrator(&cfg, None, Some(sonarr.clone()), cancel)
        .run(&mut store, ScanOptions::default())
        .await;

    assert!(summary.interrupted());
    let calls = sonarr.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[3], first_season);

    let state = store.service(Service::Sonarr);
    assert_eq!(state.unmonitored_episode_ids.len(), 3);
    assert!(state.season_recorded(2, 1));
    assert!(!state.season_recorded(2, 2));
    assert!(!state.series_recorded(2));
    assert!(state.last_scan_timestamp.is_none());
}

#[tokio::test]
async fn dry_run_reports_counts_without_mutating_or_saving() {
    let (s, eps) = band_of_brothers();
    let sonarr = Arc::new(FakeSonarr::with(s, eps));
    let notifier = Arc::new(FakeNotifier::default());
    let mut cfg = config(&["D-Z0N3"]);
    cfg.dry_run = true;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let mut app = App::new(
        &cfg,
        StateStore::with_state(&path, Default::default()),
        None,
        Some(sonarr.clone() as Arc<dyn SonarrApi>),
        Some(notifier.clone() as Arc<dyn Notifier>),
        CancellationToken::new(),
    );

    let summary = app.run_cycle(false, ScanMode::Standard).await.unwrap();
    let counts = summary.report(Service::Sonarr).unwrap().counts;
    assert_eq!((counts.episodes, counts.seasons, counts.series), (10, 1, 1));
    assert!(sonarr.calls().is_empty());
    assert!(!path.exists());
    assert!(app.store().service(Service::Sonarr).unmonitored_episode_ids.is_empty());
    assert!(notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cycle_saves_state_and_notifies() {
    let (s, eps) = band_of_brothers();
    let sonarr = Arc::new(FakeSonarr::with(s, eps));
    let notifier = Arc::new(FakeNotifier::default());
    let cfg = config(&["D-Z0N3"]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let mut app = App::new(
        &cfg,
        StateStore::with_state(&path, Default::default()),
        None,
        Some(sonarr as Arc<dyn SonarrApi>),
        Some(notifier.clone() as Arc<dyn Notifier>),
        CancellationToken::new(),
    );

    app.run_cycle(false, ScanMode::Monitoring).await.unwrap();

    let reloaded = StateStore::load(&path).await;
    assert_eq!(reloaded.state(), app.store().state());
    let sent = notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].total_mutations(), 12);
}

#[tokio::test]
async fn cycle_fails_when_every_service_fails_to_fetch() {
    let sonarr = Arc::new(FakeSonarr {
        fail_fetch: true,
        ..Default::default()
    });
    let mut cfg = config(&["D-Z0N3"]);
    cfg.radarr = None;
    let dir = tempfile::tempdir().unwrap();
    let mut app = App::new(
        &cfg,
        store(&dir),
        None,
        Some(sonarr as Arc<dyn SonarrApi>),
        None,
        CancellationToken::new(),
    );
    assert!(app.run_cycle(false, ScanMode::Standard).await.is_err());
}
