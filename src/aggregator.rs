//! Episode → season → series rollup decisions.
//!
//! Everything here is pure: the scan applies the remote mutations these plans
//! call for and reports back which ones succeeded.
use std::collections::{BTreeMap, BTreeSet};

use crate::models::Series;
use crate::state::ScanState;

/// Where one episode stands after the episode pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpisodeStatus {
    pub season_number: i32,
    pub has_file: bool,
    /// Recorded earlier and still valid, or unmonitored during this pass.
    pub unmonitored: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeasonTally {
    pub season_number: i32,
    pub episodes_with_files: usize,
    pub episodes_unmonitored_with_files: usize,
}

impl SeasonTally {
    /// Seasons without files are never complete.
    pub fn is_complete(&self) -> bool {
        self.episodes_with_files > 0
            && self.episodes_with_files == self.episodes_unmonitored_with_files
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeasonPlan {
    pub tallies: Vec<SeasonTally>,
    /// Complete, not yet recorded, still monitored upstream.
    pub to_unmonitor: Vec<i32>,
    /// Complete and already unmonitored upstream: record without a mutation.
    pub to_adopt: Vec<i32>,
    /// Complete and already recorded.
    pub settled: BTreeSet<i32>,
    /// Recorded, but a file arrived that is not unmonitored.
    pub demoted: BTreeSet<i32>,
}

impl SeasonPlan {
    pub fn seasons_with_files(&self) -> BTreeSet<i32> {
        self.tallies
            .iter()
            .filter(|t| t.episodes_with_files > 0)
            .map(|t| t.season_number)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SeasonFilter,
    NoSeasonsWithFiles,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeriesDecision {
    Skip(SkipReason),
    /// Some season with files is not complete.
    Incomplete { pending: Vec<i32> },
    Unmonitor,
    Adopt,
    AlreadyRecorded,
    /// Recorded, but a season with files is no longer complete.
    Demote { pending: Vec<i32> },
}

/// Tallies each season and decides which to unmonitor, adopt or demote.
/// With a `season_filter` only that season is looked at.
pub fn plan_seasons(
    series: &Series,
    episodes: &[EpisodeStatus],
    state: &ScanState,
    season_filter: Option<i32>,
) -> SeasonPlan {
    let mut by_season: BTreeMap<i32, SeasonTally> = BTreeMap::new();
    for ep in episodes {
        if season_filter.is_some_and(|f| f != ep.season_number) {
            continue;
        }
        let tally = by_season.entry(ep.season_number).or_insert(SeasonTally {
            season_number: ep.season_number,
            episodes_with_files: 0,
            episodes_unmonitored_with_files: 0,
        });
        if ep.has_file {
            tally.episodes_with_files += 1;
            if ep.unmonitored {
                tally.episodes_unmonitored_with_files += 1;
            }
        }
    }

    let mut plan = SeasonPlan::default();
    for tally in by_season.into_values() {
        let season = tally.season_number;
        let recorded = state.season_recorded(series.id, season);
        if tally.is_complete() {
            if recorded {
                plan.settled.insert(season);
            } else if upstream_season_monitored(series, season) {
                plan.to_unmonitor.push(season);
            } else {
                plan.to_adopt.push(season);
            }
        } else if recorded && tally.episodes_with_files > 0 {
            plan.demoted.insert(season);
        }
        plan.tallies.push(tally);
    }
    plan
}

fn upstream_season_monitored(series: &Series, season: i32) -> bool {
    series
        .seasons
        .iter()
        .find(|s| s.season_number == season)
        .map(|s| s.monitored)
        .unwrap_or(true)
}

/// Series rollup. `complete` holds every season that is unmonitored after
/// the season pass: settled ones plus those unmonitored or adopted just now.
pub fn plan_series(
    series: &Series,
    seasons_with_files: &BTreeSet<i32>,
    complete: &BTreeSet<i32>,
    state: &ScanState,
    season_filter: Option<i32>,
) -> SeriesDecision {
    if season_filter.is_some() {
        return SeriesDecision::Skip(SkipReason::SeasonFilter);
    }
    if seasons_with_files.is_empty() {
        return SeriesDecision::Skip(SkipReason::NoSeasonsWithFiles);
    }

    let pending: Vec<i32> = seasons_with_files.difference(complete).copied().collect();
    let recorded = state.series_recorded(series.id);
    match (pending.is_empty(), recorded) {
        (true, true) => SeriesDecision::AlreadyRecorded,
        (true, false) if series.monitored => SeriesDecision::Unmonitor,
        (true, false) => SeriesDecision::Adopt,
        (false, true) => SeriesDecision::Demote { pending },
        (false, false) => SeriesDecision::Incomplete { pending },
    }
}
