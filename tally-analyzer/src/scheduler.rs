//! The report scheduler.
//!
//! One background task loops forever: sleep for a while, wake up, and walk
//! every registered report config deciding which day windows are due. A
//! window is due when it has no in-flight report and either it is not yet
//! *finalized* (so it is re-run to absorb late-arriving observations) or it
//! is finalized but never completed successfully (finalized windows are
//! generated exactly once). `report_finalization_days` in the report
//! config controls when a window finalizes; the makeup window bounds how
//! far back the scheduler looks for missed runs.
//!
//! Starting a report goes through the narrow [`ReportStarter`] capability
//! so the scheduler does not depend on the service that implements it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::async_trait;
use tally_wire::registry::ProjectRegistry;
use tally_wire::report::{ReportConfig, ReportId};
use tally_wire::time::{day_index_from_utc, DayIndex, EpochType};
use tally_wire::ConfigId;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::error::ReportError;
use crate::history::ReportHistoryCache;
use crate::store::ReportStore;

/// How long the scheduler sleeps between passes over the registered
/// report configs.
pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_secs(60 * 17);

/// How many days in the past the scheduler looks for report instances that
/// should have been executed but were not.
pub const DEFAULT_MAKEUP_DAYS: u32 = 30;

/// Starts the asynchronous generation of one report. Implemented by the
/// report service; injected so the scheduler is mockable and free of a
/// dependency cycle with the service.
#[async_trait]
pub trait ReportStarter: Send + Sync + 'static {
    /// On success returns the id whose terminal state marks the whole
    /// report run as finished.
    async fn start_report(
        &self,
        config_id: ConfigId,
        report_config: &ReportConfig,
        first_day_index: DayIndex,
        last_day_index: DayIndex,
        export_name: &str,
    ) -> Result<ReportId, ReportError>;
}

#[derive(Clone, Debug)]
pub struct SchedulerSettings {
    pub sleep_interval: Duration,
    pub makeup_days: u32,
    /// Lower bound for the day indices the scheduler will ever consider;
    /// bounds the history cache's bulk scan.
    pub day_index_lower_bound: DayIndex,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            sleep_interval: DEFAULT_SLEEP_INTERVAL,
            makeup_days: DEFAULT_MAKEUP_DAYS,
            day_index_lower_bound: 0,
        }
    }
}

pub struct ReportScheduler {
    registry: Arc<ProjectRegistry>,
    report_starter: Arc<dyn ReportStarter>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    report_history: ReportHistoryCache,
    shutdown: Arc<Shutdown>,
}

#[derive(Default)]
struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

/// Handle to a spawned scheduler; dropping it does not stop the task, call
/// [`shutdown`] for that.
///
/// [`shutdown`]: SchedulerHandle::shutdown
pub struct SchedulerHandle {
    shutdown: Arc<Shutdown>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Wakes the scheduler out of its sleep and waits for the task to
    /// exit. An in-flight pass finishes its current config iteration
    /// first.
    pub async fn shutdown(self) {
        self.shutdown.requested.store(true, Ordering::SeqCst);
        self.shutdown.notify.notify_one();
        let _ = self.task.await;
    }
}

impl ReportScheduler {
    pub fn new(
        registry: Arc<ProjectRegistry>,
        report_store: Arc<ReportStore>,
        report_starter: Arc<dyn ReportStarter>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        let report_history =
            ReportHistoryCache::new(settings.day_index_lower_bound, report_store);
        Self {
            registry,
            report_starter,
            clock,
            settings,
            report_history,
            shutdown: Arc::new(Shutdown::default()),
        }
    }

    /// Starts the scheduler task, consuming the scheduler.
    pub fn spawn(mut self) -> SchedulerHandle {
        let shutdown = Arc::clone(&self.shutdown);
        let task = tokio::spawn(async move {
            info!("report scheduler started");
            loop {
                self.sleep().await;
                if self.shutdown.requested.load(Ordering::SeqCst) {
                    info!("report scheduler shutting down");
                    return;
                }
                self.process_reports().await;
            }
        });
        SchedulerHandle { shutdown, task }
    }

    /// Sleeps for the configured interval, waking early at shutdown.
    async fn sleep(&self) {
        tokio::select! {
            () = tokio::time::sleep(self.settings.sleep_interval) => {}
            () = self.shutdown.notify.notified() => {}
        }
    }

    /// One pass over all registered report configs. Public so tests can
    /// drive the policy without the timer.
    pub async fn process_reports(&mut self) {
        let current_day_index = day_index_from_utc(self.clock.now());
        debug!(current_day_index, "scheduler pass");
        // Collect ids first so the registry borrow does not span awaits.
        let config_ids: Vec<ConfigId> = self
            .registry
            .report_configs()
            .map(|(config_id, _)| *config_id)
            .collect();
        for config_id in config_ids {
            if self.shutdown.requested.load(Ordering::SeqCst) {
                return;
            }
            self.process_one_report(config_id, current_day_index).await;
        }
    }

    async fn process_one_report(&mut self, config_id: ConfigId, current_day_index: DayIndex) {
        let registry = Arc::clone(&self.registry);
        let Some(report_config) =
            registry.report_config(config_id.customer_id, config_id.project_id, config_id.id)
        else {
            return;
        };
        match report_config.aggregation_epoch_type {
            EpochType::Day => {
                self.process_daily_report(config_id, report_config, current_day_index)
                    .await
            }
            EpochType::Week | EpochType::Month => {
                // Weekly and monthly schedules are not implemented yet.
                trace!(%config_id, "skipping non-daily report config");
            }
        }
    }

    async fn process_daily_report(
        &mut self,
        config_id: ConfigId,
        report_config: &ReportConfig,
        current_day_index: DayIndex,
    ) {
        let first = current_day_index
            .saturating_sub(self.settings.makeup_days)
            .max(self.settings.day_index_lower_bound);
        for day_index in first..=current_day_index {
            if self
                .should_start_daily_report_now(config_id, report_config, day_index, current_day_index)
                .await
            {
                self.start_report_now(config_id, report_config, day_index, day_index)
                    .await;
            }
        }
    }

    /// The finalization policy. A day is finalized once
    /// `report_finalization_days` have elapsed after it.
    async fn should_start_daily_report_now(
        &mut self,
        config_id: ConfigId,
        report_config: &ReportConfig,
        day_index: DayIndex,
        current_day_index: DayIndex,
    ) -> bool {
        let finalized = day_index.saturating_add(report_config.report_finalization_days)
            <= current_day_index;
        if finalized {
            // Finalized reports are generated exactly once.
            !self
                .report_history
                .completed_successfully_or_in_progress(
                    config_id.customer_id,
                    config_id.project_id,
                    config_id.id,
                    day_index,
                    day_index,
                )
                .await
        } else {
            // Not yet finalized: re-run to absorb late observations, but
            // keep at most one report in flight per window.
            !self
                .report_history
                .in_progress(
                    config_id.customer_id,
                    config_id.project_id,
                    config_id.id,
                    day_index,
                    day_index,
                )
                .await
        }
    }

    async fn start_report_now(
        &mut self,
        config_id: ConfigId,
        report_config: &ReportConfig,
        first_day_index: DayIndex,
        last_day_index: DayIndex,
    ) {
        let export_name = report_export_name(config_id, first_day_index, last_day_index);
        match self
            .report_starter
            .start_report(
                config_id,
                report_config,
                first_day_index,
                last_day_index,
                &export_name,
            )
            .await
        {
            Ok(report_id) => {
                debug!(%config_id, first_day_index, last_day_index, %report_id, "started report");
                self.report_history.record_start(
                    config_id.customer_id,
                    config_id.project_id,
                    config_id.id,
                    first_day_index,
                    last_day_index,
                    report_id,
                );
            }
            Err(err) => {
                // The window stays eligible; a later pass retries it.
                warn!(%config_id, first_day_index, last_day_index, "failed to start report: {err}");
            }
        }
    }
}

/// The name under which a finished report would be exported.
fn report_export_name(config_id: ConfigId, first_day_index: u32, last_day_index: u32) -> String {
    format!(
        "report_{}_{}_{}_{}_{}",
        config_id.customer_id, config_id.project_id, config_id.id, first_day_index, last_day_index
    )
}
