//! One scan pass over the enabled services.
//!
//! Movies are fanned out through the [`WorkerPool`] as one list. Series are
//! walked one at a time: episodes go through the pool, then the season and
//! series rollups run on the collected results.
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::{plan_seasons, plan_series, EpisodeStatus, SeriesDecision};
use crate::arr::{MonitorTarget, RadarrApi, SonarrApi};
use crate::config::{Config, ServiceConfig};
use crate::matcher::{candidates, ReleaseGroupMatch, ReleaseGroupMatcher};
use crate::models::{Episode, MediaItem, MediaKind, Movie, Series, Service};
use crate::pool::{ItemOutcome, WorkerPool};
use crate::state::{ScanOutcome, ScanState, StateStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Ignore the skip-lists and look at every item.
    pub force_full: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntityKind {
    Movie,
    Episode,
    Season,
    Series,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmonitoredEntry {
    pub kind: EntityKind,
    pub title: String,
    pub release_group: Option<String>,
}

/// Mutations performed (or, in a dry run, that would have been performed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceCounts {
    pub movies: usize,
    pub episodes: usize,
    pub seasons: usize,
    pub series: usize,
    /// Matching items already unmonitored upstream, recorded without a call.
    pub adopted: usize,
    /// Items left alone because the skip-list says they are settled.
    pub skipped: usize,
    pub failures: usize,
}

impl ServiceCounts {
    pub fn mutations(&self) -> usize {
        self.movies + self.episodes + self.seasons + self.series
    }
}

#[derive(Debug, Clone)]
pub struct ServiceReport {
    pub service: Service,
    pub counts: ServiceCounts,
    pub entries: Vec<UnmonitoredEntry>,
    pub fetch_error: Option<String>,
    pub interrupted: bool,
}

impl ServiceReport {
    fn new(service: Service) -> Self {
        Self {
            service,
            counts: ServiceCounts::default(),
            entries: Vec::new(),
            fetch_error: None,
            interrupted: false,
        }
    }

    /// Whether the whole inventory was walked.
    pub fn completed(&self) -> bool {
        self.fetch_error.is_none() && !self.interrupted
    }

    fn push(&mut self, kind: EntityKind, title: String, release_group: Option<String>) {
        self.entries.push(UnmonitoredEntry {
            kind,
            title,
            release_group,
        });
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub dry_run: bool,
    pub reports: Vec<ServiceReport>,
}

impl RunSummary {
    pub fn report(&self, service: Service) -> Option<&ServiceReport> {
        self.reports.iter().find(|r| r.service == service)
    }

    pub fn total_mutations(&self) -> usize {
        self.reports.iter().map(|r| r.counts.mutations()).sum()
    }

    pub fn interrupted(&self) -> bool {
        self.reports.iter().any(|r| r.interrupted)
    }

    pub fn log(&self) {
        let prefix = if self.dry_run { "[dry run] " } else { "" };
        let secs = (self.finished - self.started).num_milliseconds() as f64 / 1000.0;
        info!("{}Scan finished in {:.1}s", prefix, secs);
        for report in &self.reports {
            let c = &report.counts;
            if let Some(err) = &report.fetch_error {
                error!("{}: scan aborted: {}", report.service, err);
                continue;
            }
            info!(
                "{}{}: unmonitored movies={} episodes={} seasons={} series={} \
                 (adopted={}, skipped={}, failures={})",
                prefix,
                report.service,
                c.movies,
                c.episodes,
                c.seasons,
                c.series,
                c.adopted,
                c.skipped,
                c.failures
            );
            if report.interrupted {
                warn!("{}: scan was interrupted before finishing", report.service);
            }
        }
    }
}

/// What the worker decided for one movie or episode.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ItemDecision {
    NoFile,
    NoMatch,
    /// Matched, but upstream already has it unmonitored.
    Adopted(ReleaseGroupMatch),
    /// Matched and unmonitored (or would be, in a dry run).
    Unmonitored(ReleaseGroupMatch),
}

impl ItemDecision {
    fn is_unmonitored(&self) -> bool {
        matches!(self, ItemDecision::Adopted(_) | ItemDecision::Unmonitored(_))
    }
}

fn classify<T: MediaItem>(item: &T, matcher: &ReleaseGroupMatcher) -> ItemDecision {
    let Some(path) = item.file_path() else {
        return ItemDecision::NoFile;
    };
    match matcher.find(path) {
        Some(m) if !item.is_monitored() => ItemDecision::Adopted(m),
        Some(m) => ItemDecision::Unmonitored(m),
        None => {
            debug!("No configured group in '{}', candidates: {:?}", path, candidates(path));
            ItemDecision::NoMatch
        }
    }
}

pub struct ScanOrchestrator {
    matcher: Arc<ReleaseGroupMatcher>,
    pool: WorkerPool,
    cancel: CancellationToken,
    radarr: Option<(Arc<dyn RadarrApi>, ServiceConfig)>,
    sonarr: Option<(Arc<dyn SonarrApi>, ServiceConfig)>,
}

impl ScanOrchestrator {
    /// Services without both a client and a config section are left out.
    pub fn new(
        config: &Config,
        radarr: Option<Arc<dyn RadarrApi>>,
        sonarr: Option<Arc<dyn SonarrApi>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            matcher: Arc::new(ReleaseGroupMatcher::new(&config.release_groups)),
            pool: WorkerPool::new(config.concurrency, cancel.clone()),
            cancel,
            radarr: radarr.zip(config.radarr.clone()),
            sonarr: sonarr.zip(config.sonarr.clone()),
        }
    }

    /// Scans every configured service and folds the results into `store`.
    /// A dry run leaves `store` untouched.
    pub async fn run(&self, store: &mut StateStore, opts: ScanOptions) -> RunSummary {
        let started = Utc::now();
        let mut reports = Vec::new();
        if self.matcher.is_empty() {
            warn!("No release groups configured; nothing will match");
        }

        if let Some((api, cfg)) = &self.radarr {
            let state = store.service(Service::Radarr).clone();
            let (report, outcome) = self.scan_movies(api.clone(), cfg, &state, opts).await;
            self.commit(store, &report, &outcome, started, opts);
            reports.push(report);
        }
        if let Some((api, cfg)) = &self.sonarr {
            let state = store.service(Service::Sonarr).clone();
            let (report, outcome) = self.scan_series(api.clone(), cfg, &state, opts).await;
            self.commit(store, &report, &outcome, started, opts);
            reports.push(report);
        }

        RunSummary {
            started,
            finished: Utc::now(),
            dry_run: opts.dry_run,
            reports,
        }
    }

    fn commit(
        &self,
        store: &mut StateStore,
        report: &ServiceReport,
        outcome: &ScanOutcome,
        started: DateTime<Utc>,
        opts: ScanOptions,
    ) {
        if opts.dry_run {
            return;
        }
        store.merge(report.service, outcome);
        if report.completed() {
            store.mark_scan_completed(report.service, started);
        }
    }

    async fn scan_movies(
        &self,
        api: Arc<dyn RadarrApi>,
        cfg: &ServiceConfig,
        state: &ScanState,
        opts: ScanOptions,
    ) -> (ServiceReport, ScanOutcome) {
        let mut report = ServiceReport::new(Service::Radarr);
        let mut outcome = ScanOutcome::default();

        let mut movies = match api.fetch_movies().await {
            Ok(movies) => movies,
            Err(e) => {
                error!("radarr: failed to fetch movies: {:#}", e);
                report.fetch_error = Some(format!("{:#}", e));
                return (report, outcome);
            }
        };
        if let Some(n) = cfg.sample_size {
            movies.truncate(n);
        }

        let last_scan = state.last_scan_timestamp;
        let total = movies.len();
        let todo: Vec<Movie> = movies
            .into_iter()
            .filter(|m| opts.force_full || state.should_process(m, last_scan))
            .collect();
        report.counts.skipped = total - todo.len();
        info!("radarr: {} movies, {} to check", total, todo.len());

        let matcher = self.matcher.clone();
        let dry_run = opts.dry_run;
        let worker_api = api.clone();
        let results = self
            .pool
            .run(todo.clone(), move |movie: Movie| {
                let (api, matcher) = (worker_api.clone(), matcher.clone());
                async move {
                    let decision = classify(&movie, &matcher);
                    if let ItemDecision::Unmonitored(m) = &decision {
                        if dry_run {
                            info!(
                                "[dry run] Would unmonitor movie '{}' ({})",
                                movie.title, m.group
                            );
                        } else {
                            api.set_monitored(MonitorTarget::Movie(movie.id), false).await?;
                            info!("Unmonitored movie '{}' ({})", movie.title, m.group);
                        }
                    }
                    Ok(decision)
                }
            })
            .await;

        for (movie, result) in todo.into_iter().zip(results) {
            match result {
                ItemOutcome::Completed(Ok(decision)) => match decision {
                    ItemDecision::Unmonitored(m) => {
                        report.counts.movies += 1;
                        report.push(EntityKind::Movie, movie.title, Some(m.group));
                        outcome.unmonitored_movie_ids.insert(movie.id);
                    }
                    ItemDecision::Adopted(_) => {
                        report.counts.adopted += 1;
                        outcome.unmonitored_movie_ids.insert(movie.id);
                    }
                    ItemDecision::NoFile | ItemDecision::NoMatch => {}
                },
                ItemOutcome::Completed(Err(e)) => {
                    report.counts.failures += 1;
                    warn!("radarr: movie '{}' failed: {:#}", movie.title, e);
                }
                ItemOutcome::Cancelled => report.interrupted = true,
            }
        }
        (report, outcome)
    }

    async fn scan_series(
        &self,
        api: Arc<dyn SonarrApi>,
        cfg: &ServiceConfig,
        state: &ScanState,
        opts: ScanOptions,
    ) -> (ServiceReport, ScanOutcome) {
        let mut report = ServiceReport::new(Service::Sonarr);
        let mut outcome = ScanOutcome::default();

        let mut series_list = match api.fetch_series().await {
            Ok(list) => list,
            Err(e) => {
                error!("sonarr: failed to fetch series: {:#}", e);
                report.fetch_error = Some(format!("{:#}", e));
                return (report, outcome);
            }
        };
        if let Some(n) = cfg.sample_size {
            series_list.truncate(n);
        }
        info!("sonarr: {} series", series_list.len());
        if let Some(season) = cfg.season_filter {
            info!("sonarr: only season {} is evaluated; series rollups are off", season);
        }

        for series in &series_list {
            if self.cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            if series.seasons_with_files().is_some_and(|s| s.is_empty())
                && state.recorded_seasons(series.id).is_empty()
            {
                debug!("sonarr: '{}' has no files, skipping", series.title);
                continue;
            }
            let episodes = match api.fetch_episodes(series.id).await {
                Ok(eps) => eps,
                Err(e) => {
                    report.counts.failures += 1;
                    warn!("sonarr: failed to fetch episodes of '{}': {:#}", series.title, e);
                    continue;
                }
            };
            let series_outcome = self
                .scan_one_series(
                    &api,
                    series,
                    episodes,
                    cfg.season_filter,
                    state,
                    opts,
                    &mut report,
                )
                .await;
            outcome.absorb(series_outcome);
        }
        (report, outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn scan_one_series(
        &self,
        api: &Arc<dyn SonarrApi>,
        series: &Series,
        episodes: Vec<Episode>,
        season_filter: Option<i32>,
        state: &ScanState,
        opts: ScanOptions,
        report: &mut ServiceReport,
    ) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        let last_scan = state.last_scan_timestamp;

        let in_scope: Vec<Episode> = episodes
            .into_iter()
            .filter(|e| season_filter.map_or(true, |f| e.season_number == f))
            .collect();
        let todo: Vec<Episode> = in_scope
            .iter()
            .filter(|e| e.has_file && (opts.force_full || state.should_process(*e, last_scan)))
            .cloned()
            .collect();
        report.counts.skipped += in_scope.iter().filter(|e| e.has_file).count() - todo.len();
        debug!(
            "sonarr: '{}' {} episodes in scope, {} to check",
            series.title,
            in_scope.len(),
            todo.len()
        );

        let matcher = self.matcher.clone();
        let dry_run = opts.dry_run;
        let worker_api = api.clone();
        let title = series.title.clone();
        let results = self
            .pool
            .run(todo.clone(), move |ep: Episode| {
                let (api, matcher, title) = (worker_api.clone(), matcher.clone(), title.clone());
                async move {
                    let decision = classify(&ep, &matcher);
                    if let ItemDecision::Unmonitored(m) = &decision {
                        if dry_run {
                            info!(
                                "[dry run] Would unmonitor '{}' {} ({})",
                                title,
                                ep.label(),
                                m.group
                            );
                        } else {
                            api.set_monitored(MonitorTarget::Episode(ep.id), false).await?;
                            info!("Unmonitored '{}' {} ({})", title, ep.label(), m.group);
                        }
                    }
                    Ok(decision)
                }
            })
            .await;

        // Unprocessed episodes keep whatever the skip-list says.
        let mut now_unmonitored: BTreeSet<u64> = in_scope
            .iter()
            .filter(|e| state.is_recorded(MediaKind::Episode, e.id))
            .map(|e| e.id)
            .collect();
        let mut interrupted = false;
        for (ep, result) in todo.iter().zip(results) {
            match result {
                ItemOutcome::Completed(Ok(decision)) => {
                    if decision.is_unmonitored() {
                        now_unmonitored.insert(ep.id);
                        outcome.unmonitored_episode_ids.insert(ep.id);
                    } else if state.is_recorded(MediaKind::Episode, ep.id) {
                        debug!("sonarr: '{}' {} no longer matches", series.title, ep.label());
                        now_unmonitored.remove(&ep.id);
                        outcome.demoted_episode_ids.insert(ep.id);
                    }
                    match decision {
                        ItemDecision::Unmonitored(m) => {
                            report.counts.episodes += 1;
                            report.push(
                                EntityKind::Episode,
                                format!("{} - {}", series.title, ep.label()),
                                Some(m.group),
                            );
                        }
                        ItemDecision::Adopted(_) => report.counts.adopted += 1,
                        ItemDecision::NoFile | ItemDecision::NoMatch => {}
                    }
                }
                ItemOutcome::Completed(Err(e)) => {
                    report.counts.failures += 1;
                    warn!("sonarr: '{}' {} failed: {:#}", series.title, ep.label(), e);
                }
                ItemOutcome::Cancelled => interrupted = true,
            }
        }
        // A token tripped during the last episode leaves no Cancelled slot.
        if interrupted || self.cancel.is_cancelled() {
            report.interrupted = true;
            debug!("sonarr: '{}' interrupted, skipping rollups", series.title);
            return outcome;
        }

        let statuses: Vec<EpisodeStatus> = in_scope
            .iter()
            .map(|e| EpisodeStatus {
                season_number: e.season_number,
                has_file: e.has_file,
                unmonitored: now_unmonitored.contains(&e.id),
            })
            .collect();

        let plan = plan_seasons(series, &statuses, state, season_filter);
        if !plan.demoted.is_empty() {
            info!(
                "sonarr: '{}' seasons {:?} gained new files, no longer recorded as unmonitored",
                series.title, plan.demoted
            );
            outcome
                .demoted_seasons
                .insert(series.id, plan.demoted.clone());
            if state.series_recorded(series.id) {
                outcome.demoted_series_ids.insert(series.id);
            }
        }

        let mut complete = plan.settled.clone();
        for &season in &plan.to_adopt {
            complete.insert(season);
            report.counts.adopted += 1;
        }
        for &season in &plan.to_unmonitor {
            if self.cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            let target = MonitorTarget::Season {
                series_id: series.id,
                season_number: season,
            };
            if !opts.dry_run {
                if let Err(e) = api.set_monitored(target, false).await {
                    report.counts.failures += 1;
                    warn!("sonarr: '{}' season {} failed: {:#}", series.title, season, e);
                    continue;
                }
            }
            info!(
                "{}Unmonitored '{}' season {}",
                if opts.dry_run { "[dry run] " } else { "" },
                series.title,
                season
            );
            complete.insert(season);
            report.counts.seasons += 1;
            report.push(
                EntityKind::Season,
                format!("{} - Season {}", series.title, season),
                None,
            );
        }
        let newly_complete: BTreeSet<i32> = complete.difference(&plan.settled).copied().collect();
        if !newly_complete.is_empty() {
            outcome.completed_seasons.insert(series.id, newly_complete);
        }
        if interrupted || self.cancel.is_cancelled() {
            report.interrupted = true;
            debug!("sonarr: '{}' interrupted, skipping series rollup", series.title);
            return outcome;
        }

        match plan_series(series, &plan.seasons_with_files(), &complete, state, season_filter) {
            SeriesDecision::Unmonitor => {
                let ok = if opts.dry_run {
                    true
                } else {
                    match api.set_monitored(MonitorTarget::Series(series.id), false).await {
                        Ok(()) => true,
                        Err(e) => {
                            report.counts.failures += 1;
                            warn!("sonarr: series '{}' failed: {:#}", series.title, e);
                            false
                        }
                    }
                };
                if ok {
                    info!(
                        "{}Unmonitored series '{}' (future seasons still {})",
                        if opts.dry_run { "[dry run] " } else { "" },
                        series.title,
                        if series.monitors_future_seasons() { "monitored" } else { "unmonitored" }
                    );
                    report.counts.series += 1;
                    report.push(EntityKind::Series, series.title.clone(), None);
                    outcome.completed_series_ids.insert(series.id);
                }
            }
            SeriesDecision::Adopt => {
                report.counts.adopted += 1;
                outcome.completed_series_ids.insert(series.id);
            }
            SeriesDecision::Demote { pending } => {
                info!(
                    "sonarr: series '{}' has incomplete seasons {:?}, \
                     no longer recorded as unmonitored",
                    series.title, pending
                );
                outcome.demoted_series_ids.insert(series.id);
            }
            SeriesDecision::Incomplete { pending } => {
                debug!("sonarr: '{}' waiting on seasons {:?}", series.title, pending);
            }
            SeriesDecision::Skip(reason) => {
                debug!("sonarr: '{}' series rollup skipped: {:?}", series.title, reason);
            }
            SeriesDecision::AlreadyRecorded => {}
        }
        outcome
    }
}
