//! Generation of a single report instance.

use std::sync::Arc;

use tally_wire::metric::Metric;
use tally_wire::registry::ProjectRegistry;
use tally_wire::report::{ReportConfig, ReportId, ReportMetadata, ReportType};
use tally_wire::time::DayIndex;
use tracing::{debug, error};

use crate::analysis::HistogramAnalysisEngine;
use crate::error::ReportError;
use crate::raw_dump::RawDumpRowIterator;
use crate::store::{ObservationStore, ReportStore, StoreError};

/// Observations are scanned in pages of this size.
const QUERY_PAGE_SIZE: usize = 1_000;

/// Raw-dump rows are flushed to the store in batches of this size.
const RAW_DUMP_WRITE_BATCH: usize = 500;

/// Turns the observations for one report window into report rows.
///
/// A generator is stateless across reports; the executor calls
/// [`generate_report`] once per report id.
///
/// [`generate_report`]: ReportGenerator::generate_report
pub struct ReportGenerator {
    registry: Arc<ProjectRegistry>,
    observation_store: Arc<ObservationStore>,
    report_store: Arc<ReportStore>,
}

/// One variable under analysis, resolved to the metric part it names.
struct Variable {
    name: String,
}

impl ReportGenerator {
    pub fn new(
        registry: Arc<ProjectRegistry>,
        observation_store: Arc<ObservationStore>,
        report_store: Arc<ReportStore>,
    ) -> Self {
        Self {
            registry,
            observation_store,
            report_store,
        }
    }

    /// Generates the report with the given id, writing its rows to the
    /// report store. The report must exist and be `IN_PROGRESS`; ending it
    /// afterwards is the caller's job.
    pub async fn generate_report(&self, report_id: &ReportId) -> Result<(), ReportError> {
        let metadata = match self.report_store.get_metadata(report_id).await {
            Ok(metadata) => metadata,
            Err(StoreError::NotFound) => {
                let message = format!("no report found with id={report_id}");
                error!("{message}");
                return Err(ReportError::NotFound(message));
            }
            Err(err) => {
                let message = format!("get_metadata failed for report_id={report_id}: {err}");
                error!("{message}");
                return Err(ReportError::Aborted(message));
            }
        };

        if metadata.state != tally_wire::report::ReportState::InProgress {
            let message = format!("report is not IN_PROGRESS: {report_id}");
            error!("{message}");
            return Err(ReportError::FailedPrecondition(message));
        }

        let report_config = self
            .registry
            .report_config(
                report_id.customer_id,
                report_id.project_id,
                report_id.report_config_id,
            )
            .ok_or_else(|| {
                let message = format!(
                    "no report config with id=({},{},{})",
                    report_id.customer_id, report_id.project_id, report_id.report_config_id
                );
                error!("{message}");
                ReportError::NotFound(message)
            })?;

        if report_config.variables.is_empty() || report_config.variables.len() > 2 {
            let message = format!(
                "invalid report config: {} variables, report configs may have one or two, \
                 report_id={report_id}",
                report_config.variables.len()
            );
            error!("{message}");
            return Err(ReportError::InvalidArgument(message));
        }

        let metric = self
            .registry
            .metric(
                report_id.customer_id,
                report_id.project_id,
                report_config.metric_id,
            )
            .ok_or_else(|| {
                let message = format!(
                    "no metric with id=({},{},{})",
                    report_id.customer_id, report_id.project_id, report_config.metric_id
                );
                error!("{message}");
                ReportError::NotFound(message)
            })?;

        let variables = build_variable_list(report_config, report_id, &metadata)?;

        // Every variable must name a declared part of the metric.
        for variable in &variables {
            if !metric.parts.contains_key(&variable.name) {
                let message = format!(
                    "invalid report config: variable name {:?} is not a part of metric {}, \
                     report_id={report_id}",
                    variable.name, report_config.metric_id
                );
                error!("{message}");
                return Err(ReportError::InvalidArgument(message));
            }
        }

        match metadata.report_type {
            ReportType::Histogram => {
                self.generate_histogram_report(
                    report_id,
                    report_config,
                    variables,
                    metadata.first_day_index,
                    metadata.last_day_index,
                )
                .await
            }
            ReportType::Joint => {
                let message = format!("report type JOINT is not yet implemented, report_id={report_id}");
                error!("{message}");
                Err(ReportError::Unimplemented(message))
            }
            ReportType::RawDump => {
                self.generate_raw_dump_report(
                    report_id,
                    report_config,
                    metric,
                    variables,
                    metadata.first_day_index,
                    metadata.last_day_index,
                )
                .await
            }
        }
    }

    async fn generate_histogram_report(
        &self,
        report_id: &ReportId,
        report_config: &ReportConfig,
        variables: Vec<Variable>,
        start_day_index: DayIndex,
        end_day_index: DayIndex,
    ) -> Result<(), ReportError> {
        if start_day_index > end_day_index {
            let message = format!(
                "invalid day range [{start_day_index}, {end_day_index}] for report_id={report_id}"
            );
            error!("{message}");
            return Err(ReportError::InvalidArgument(message));
        }
        if variables.len() != 1 {
            let message = format!(
                "a HISTOGRAM report analyzes exactly one variable, got {}, report_id={report_id}",
                variables.len()
            );
            error!("{message}");
            return Err(ReportError::InvalidArgument(message));
        }
        let part_name = &variables[0].name;

        let mut engine = HistogramAnalysisEngine::new(
            *report_id,
            report_config.aggregation_epoch_type,
            Arc::clone(&self.registry),
        );

        let parts = vec![part_name.clone()];
        let mut pagination_token = String::new();
        loop {
            let page = self
                .observation_store
                .query_observations(
                    report_id.customer_id,
                    report_id.project_id,
                    report_config.metric_id,
                    start_day_index,
                    end_day_index,
                    &parts,
                    QUERY_PAGE_SIZE,
                    &pagination_token,
                )
                .await
                .map_err(|err| {
                    let message = format!(
                        "query_observations failed for report_id={report_id} part={part_name}: {err}"
                    );
                    error!("{message}");
                    ReportError::Aborted(message)
                })?;

            debug!(results = page.results.len(), "processing observation page");
            for result in &page.results {
                let Some(part) = result.observation.parts.get(part_name) else {
                    // The projection should guarantee the part; a row
                    // without it is malformed and must not abort the report.
                    continue;
                };
                // A false return means the part was malformed; the adapter
                // keeps the count.
                engine.process_observation_part(
                    result.day_index,
                    part,
                    result.observation.system_profile.as_ref(),
                );
            }

            if page.pagination_token.is_empty() {
                break;
            }
            pagination_token = page.pagination_token;
        }

        let rows = engine.perform_analysis()?;
        debug!(rows = rows.len(), %report_id, "generated histogram report");

        self.write_rows(report_id, &rows).await
    }

    async fn generate_raw_dump_report(
        &self,
        report_id: &ReportId,
        report_config: &ReportConfig,
        metric: &Metric,
        variables: Vec<Variable>,
        start_day_index: DayIndex,
        end_day_index: DayIndex,
    ) -> Result<(), ReportError> {
        let parts: Vec<String> = variables.into_iter().map(|variable| variable.name).collect();
        let mut iterator = RawDumpRowIterator::new(
            report_id.customer_id,
            report_id.project_id,
            report_config.metric_id,
            start_day_index,
            end_day_index,
            parts,
            report_config.system_profile_fields.clone(),
            report_id.to_string(),
            Arc::clone(&self.observation_store),
            metric,
        )?;

        let mut batch = Vec::new();
        while let Some(row) = iterator.next_row().await? {
            batch.push(row);
            if batch.len() >= RAW_DUMP_WRITE_BATCH {
                self.write_rows(report_id, &batch).await?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.write_rows(report_id, &batch).await?;
        }
        Ok(())
    }

    async fn write_rows(
        &self,
        report_id: &ReportId,
        rows: &[tally_wire::report::ReportRow],
    ) -> Result<(), ReportError> {
        match self.report_store.add_report_rows(report_id, rows).await {
            Ok(()) => Ok(()),
            Err(StoreError::InvalidArguments(detail)) => {
                let message = format!(
                    "internal error, report store rejected rows for report_id={report_id}: {detail}"
                );
                error!("{message}");
                Err(ReportError::Internal(message))
            }
            Err(err) => {
                let message =
                    format!("add_report_rows failed for report_id={report_id}: {err}");
                error!("{message}");
                Err(ReportError::Aborted(message))
            }
        }
    }
}

/// Resolves the metadata's variable indices against the report config.
fn build_variable_list(
    report_config: &ReportConfig,
    report_id: &ReportId,
    metadata: &ReportMetadata,
) -> Result<Vec<Variable>, ReportError> {
    let mut variables = Vec::with_capacity(metadata.variable_indices.len());
    for &index in &metadata.variable_indices {
        let Some(variable) = report_config.variables.get(index as usize) else {
            let message = format!(
                "metadata names variable index {index} but the report config has only {} \
                 variables, report_id={report_id}",
                report_config.variables.len()
            );
            error!("{message}");
            return Err(ReportError::InvalidArgument(message));
        };
        variables.push(Variable {
            name: variable.metric_part.clone(),
        });
    }
    Ok(variables)
}
