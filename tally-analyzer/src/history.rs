//! The report history cache used by the scheduler.
//!
//! The scheduler's unit of work is the triple `(report config, first day,
//! last day)`. For each triple it needs to know two things: has a report
//! ever completed successfully, and is one currently in flight. "In
//! flight" deliberately means *started during this process lifetime*: a
//! report left `IN_PROGRESS` by a crashed predecessor is treated as
//! abandoned, and the scheduler is free to start a fresh one.
//!
//! Answers come from an in-memory cache backed by the report store. The
//! first question about a given report config triggers exactly one bulk
//! scan of its metadata to discover previously completed reports; after
//! that only point lookups are issued.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tally_wire::report::{ReportId, ReportState};
use tally_wire::time::{day_index_to_unix_seconds, DayIndex};
use tracing::{error, warn};

use crate::store::{ReportStore, StoreError};

/// Page size for the one-time bulk scan.
const QUERY_BATCH_SIZE: usize = 100;

pub struct ReportHistoryCache {
    /// Creation-time lower bound of the bulk scan, derived from the lowest
    /// day index the scheduler will ever ask about.
    query_interval_start_time_seconds: i64,
    report_store: Arc<ReportStore>,
    history: HashMap<HistoryKey, ReportHistory>,
    /// Report config ids whose bulk scan has been performed.
    query_performed: HashSet<(u32, u32, u32)>,
}

type HistoryKey = (u32, u32, u32, DayIndex, DayIndex);

#[derive(Debug, Default)]
struct ReportHistory {
    completed_successfully: bool,
    in_progress_report_id: Option<ReportId>,
}

impl ReportHistoryCache {
    /// All day indices later passed to this instance must be at least
    /// `day_index_lower_bound`.
    pub fn new(day_index_lower_bound: DayIndex, report_store: Arc<ReportStore>) -> Self {
        Self {
            query_interval_start_time_seconds: day_index_to_unix_seconds(day_index_lower_bound),
            report_store,
            history: HashMap::new(),
            query_performed: HashSet::new(),
        }
    }

    /// Whether a report execution recorded via [`record_start`] is still
    /// ongoing for the triple.
    ///
    /// [`record_start`]: ReportHistoryCache::record_start
    pub async fn in_progress(
        &mut self,
        customer_id: u32,
        project_id: u32,
        report_config_id: u32,
        first_day_index: DayIndex,
        last_day_index: DayIndex,
    ) -> bool {
        self.refresh(
            customer_id,
            project_id,
            report_config_id,
            first_day_index,
            last_day_index,
        )
        .await;
        self.entry(
            customer_id,
            project_id,
            report_config_id,
            first_day_index,
            last_day_index,
        )
        .in_progress_report_id
        .is_some()
    }

    /// Whether the triple either has an ongoing execution or at least one
    /// successfully completed report.
    pub async fn completed_successfully_or_in_progress(
        &mut self,
        customer_id: u32,
        project_id: u32,
        report_config_id: u32,
        first_day_index: DayIndex,
        last_day_index: DayIndex,
    ) -> bool {
        self.refresh(
            customer_id,
            project_id,
            report_config_id,
            first_day_index,
            last_day_index,
        )
        .await;
        let history = self.entry(
            customer_id,
            project_id,
            report_config_id,
            first_day_index,
            last_day_index,
        );
        history.completed_successfully || history.in_progress_report_id.is_some()
    }

    /// Informs the cache that a new report execution has started for the
    /// triple.
    pub fn record_start(
        &mut self,
        customer_id: u32,
        project_id: u32,
        report_config_id: u32,
        first_day_index: DayIndex,
        last_day_index: DayIndex,
        report_id: ReportId,
    ) {
        self.entry(
            customer_id,
            project_id,
            report_config_id,
            first_day_index,
            last_day_index,
        )
        .in_progress_report_id = Some(report_id);
    }

    fn entry(
        &mut self,
        customer_id: u32,
        project_id: u32,
        report_config_id: u32,
        first_day_index: DayIndex,
        last_day_index: DayIndex,
    ) -> &mut ReportHistory {
        self.history
            .entry((
                customer_id,
                project_id,
                report_config_id,
                first_day_index,
                last_day_index,
            ))
            .or_default()
    }

    /// Brings the cache entry for the triple up to date: performs the
    /// one-time bulk scan for the report config, then re-checks any
    /// recorded in-flight report against the store.
    async fn refresh(
        &mut self,
        customer_id: u32,
        project_id: u32,
        report_config_id: u32,
        first_day_index: DayIndex,
        last_day_index: DayIndex,
    ) {
        if self
            .query_performed
            .insert((customer_id, project_id, report_config_id))
        {
            self.query_completed_reports(customer_id, project_id, report_config_id)
                .await;
        }

        let key = (
            customer_id,
            project_id,
            report_config_id,
            first_day_index,
            last_day_index,
        );
        let Some(history) = self.history.get_mut(&key) else {
            return;
        };
        let Some(report_id) = history.in_progress_report_id else {
            return;
        };
        match self.report_store.get_metadata(&report_id).await {
            Ok(metadata) => {
                if metadata.state.is_terminal() {
                    history.in_progress_report_id = None;
                    if metadata.state == ReportState::CompletedSuccessfully {
                        history.completed_successfully = true;
                    }
                }
            }
            Err(StoreError::NotFound) => {
                // The metadata vanished (config purge); nothing in flight.
                history.in_progress_report_id = None;
            }
            Err(err) => {
                // Leave the entry alone; claiming the report finished on a
                // store hiccup could start a duplicate.
                warn!(%report_id, "could not refresh in-flight report: {err}");
            }
        }
    }

    /// The one-time scan: walks all metadata for the report config created
    /// since the day-index lower bound, recording completed windows.
    async fn query_completed_reports(
        &mut self,
        customer_id: u32,
        project_id: u32,
        report_config_id: u32,
    ) {
        let mut pagination_token = String::new();
        loop {
            let page = match self
                .report_store
                .query_reports(
                    customer_id,
                    project_id,
                    report_config_id,
                    self.query_interval_start_time_seconds,
                    i64::MAX,
                    QUERY_BATCH_SIZE,
                    &pagination_token,
                )
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    // An incomplete scan only means a finalized report may
                    // be generated a second time.
                    error!(report_config_id, "history scan failed: {err}");
                    return;
                }
            };

            for record in page.results {
                if record.report_metadata.state == ReportState::CompletedSuccessfully {
                    self.entry(
                        customer_id,
                        project_id,
                        report_config_id,
                        record.report_metadata.first_day_index,
                        record.report_metadata.last_day_index,
                    )
                    .completed_successfully = true;
                }
            }

            if page.pagination_token.is_empty() {
                return;
            }
            pagination_token = page.pagination_token;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::MemoryStore;
    use tally_wire::report::ReportType;

    fn fresh_id() -> ReportId {
        ReportId {
            customer_id: 1,
            project_id: 1,
            report_config_id: 1,
            ..Default::default()
        }
    }

    async fn setup() -> (Arc<ReportStore>, ReportHistoryCache) {
        let store = Arc::new(ReportStore::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
        ));
        let cache = ReportHistoryCache::new(0, Arc::clone(&store));
        (store, cache)
    }

    #[tokio::test]
    async fn unknown_windows_are_neither_complete_nor_in_progress() {
        let (_, mut cache) = setup().await;
        assert!(!cache.in_progress(1, 1, 1, 10, 10).await);
        assert!(!cache.completed_successfully_or_in_progress(1, 1, 1, 10, 10).await);
    }

    #[tokio::test]
    async fn recorded_starts_are_in_progress_until_terminal() {
        let (store, mut cache) = setup().await;
        let mut id = fresh_id();
        store
            .start_new_report(10, 10, false, ReportType::Histogram, vec![0], &mut id)
            .await
            .unwrap();
        cache.record_start(1, 1, 1, 10, 10, id);
        assert!(cache.in_progress(1, 1, 1, 10, 10).await);

        store.end_report(&id, true, String::new()).await.unwrap();
        assert!(!cache.in_progress(1, 1, 1, 10, 10).await);
        // The terminal success was remembered.
        assert!(cache.completed_successfully_or_in_progress(1, 1, 1, 10, 10).await);
    }

    #[tokio::test]
    async fn terminated_reports_do_not_count_as_completed() {
        let (store, mut cache) = setup().await;
        let mut id = fresh_id();
        store
            .start_new_report(10, 10, false, ReportType::Histogram, vec![0], &mut id)
            .await
            .unwrap();
        cache.record_start(1, 1, 1, 10, 10, id);
        store.end_report(&id, false, "boom".to_string()).await.unwrap();

        assert!(!cache.in_progress(1, 1, 1, 10, 10).await);
        assert!(!cache.completed_successfully_or_in_progress(1, 1, 1, 10, 10).await);
    }

    #[tokio::test]
    async fn bulk_scan_discovers_prior_completions() {
        let (store, mut cache) = setup().await;
        // A report completed by some previous process lifetime.
        let mut id = fresh_id();
        store
            .start_new_report(7, 7, false, ReportType::Histogram, vec![0], &mut id)
            .await
            .unwrap();
        store.end_report(&id, true, String::new()).await.unwrap();

        assert!(cache.completed_successfully_or_in_progress(1, 1, 1, 7, 7).await);
        assert!(!cache.in_progress(1, 1, 1, 7, 7).await);
    }

    #[tokio::test]
    async fn crashed_in_progress_reports_are_not_in_flight() {
        let (store, mut cache) = setup().await;
        // IN_PROGRESS in the store, but record_start was never invoked in
        // this lifetime.
        let mut id = fresh_id();
        store
            .start_new_report(5, 5, false, ReportType::Histogram, vec![0], &mut id)
            .await
            .unwrap();

        assert!(!cache.in_progress(1, 1, 1, 5, 5).await);
        assert!(!cache.completed_successfully_or_in_progress(1, 1, 1, 5, 5).await);
    }
}
