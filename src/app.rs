use crate::arr::{ArrClient, RadarrApi, SonarrApi};
use crate::config::{load_config, Config};
use crate::models::Service;
use crate::notify::{DiscordNotifier, Notifier};
use crate::scan::{RunSummary, ScanOptions, ScanOrchestrator};
use crate::state::{ScanMode, StateStore};
use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(60);
const MIN_SLEEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub monitor: bool,
    pub force_full_scan: bool,
    /// Forces a dry run even when the config says otherwise.
    pub dry_run: bool,
}

pub struct App {
    orchestrator: ScanOrchestrator,
    store: StateStore,
    notifier: Option<Arc<dyn Notifier>>,
    interval: Duration,
    dry_run: bool,
    cancel: CancellationToken,
}

impl App {
    pub fn new(
        config: &Config,
        store: StateStore,
        radarr: Option<Arc<dyn RadarrApi>>,
        sonarr: Option<Arc<dyn SonarrApi>>,
        notifier: Option<Arc<dyn Notifier>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            orchestrator: ScanOrchestrator::new(config, radarr, sonarr, cancel.clone()),
            store,
            notifier,
            interval: config.monitor_interval,
            dry_run: config.dry_run,
            cancel,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// One scan, then persist and notify. Errors only when the state could not
    /// be written or no service could be scanned at all.
    pub async fn run_cycle(&mut self, force_full: bool, mode: ScanMode) -> Result<RunSummary> {
        let opts = ScanOptions {
            force_full,
            dry_run: self.dry_run,
        };
        if force_full {
            info!("Full scan requested, ignoring recorded state for this pass");
        }
        let summary = self.orchestrator.run(&mut self.store, opts).await;
        summary.log();

        if self.dry_run {
            info!("Dry run: state not saved, nothing changed remotely");
        } else {
            self.store.save(mode).await?;
            if let Some(notifier) = &self.notifier {
                if let Err(e) = notifier.notify(&summary).await {
                    warn!("Notification failed: {:#}", e);
                }
            }
        }

        if !summary.reports.is_empty() && summary.reports.iter().all(|r| r.fetch_error.is_some()) {
            return Err(anyhow!("every enabled service failed to scan"));
        }
        Ok(summary)
    }

    /// Scans until cancelled, sleeping out the rest of the interval between
    /// cycles. `force_full` only applies to the first cycle.
    pub async fn monitor(&mut self, force_full: bool) -> Result<()> {
        info!(
            "Monitoring mode: scanning every {}s",
            self.interval.as_secs()
        );
        let mut force = force_full;
        while !self.cancel.is_cancelled() {
            let started = Instant::now();
            let wait = match self.run_cycle(force, ScanMode::Monitoring).await {
                Ok(_) => self.interval.saturating_sub(started.elapsed()).max(MIN_SLEEP),
                Err(e) => {
                    error!("Scan cycle failed: {:#}", e);
                    RETRY_DELAY
                }
            };
            force = false;
            if self.cancel.is_cancelled() {
                break;
            }
            info!("Next scan in {}s", wait.as_secs());
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("Monitoring stopped");
        Ok(())
    }
}

pub async fn run(opts: RunOptions) -> Result<()> {
    let mut config = load_config(&opts.config_path).await?;
    if opts.dry_run {
        config.dry_run = true;
    }
    if config.dry_run {
        info!("Dry run enabled: no changes will be made");
    }

    let radarr = config
        .radarr
        .as_ref()
        .map(|c| ArrClient::new(Service::Radarr, c))
        .transpose()?
        .map(|c| Arc::new(c) as Arc<dyn RadarrApi>);
    let sonarr = config
        .sonarr
        .as_ref()
        .map(|c| ArrClient::new(Service::Sonarr, c))
        .transpose()?
        .map(|c| Arc::new(c) as Arc<dyn SonarrApi>);
    let notifier = config
        .discord
        .as_ref()
        .map(DiscordNotifier::new)
        .transpose()?
        .map(|n| Arc::new(n) as Arc<dyn Notifier>);

    let store = StateStore::load(&opts.state_path).await;
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone()));

    let mut app = App::new(&config, store, radarr, sonarr, notifier, cancel);
    if opts.monitor {
        app.monitor(opts.force_full_scan).await
    } else {
        let summary = app.run_cycle(opts.force_full_scan, ScanMode::Standard).await?;
        if summary.interrupted() {
            warn!("Scan interrupted; progress so far was saved");
        }
        Ok(())
    }
}

/// Trips `cancel` on Ctrl+C or SIGTERM. A handler that cannot be installed
/// is logged and never fires.
async fn cancel_on_shutdown(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let signal = tokio::select! {
        _ = ctrl_c => "Ctrl+C",
        _ = terminate => "SIGTERM",
        _ = cancel.cancelled() => return,
    };
    info!(
        "{} received: stopping after in-flight items, no further mutations",
        signal
    );
    cancel.cancel();
}
