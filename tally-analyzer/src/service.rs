//! The report service: the core of the public API and the production
//! implementation of [`ReportStarter`].

use std::sync::Arc;

use axum::async_trait;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tally_wire::registry::ProjectRegistry;
use tally_wire::report::{
    InfoMessage, ReportConfig, ReportId, ReportMetadata, ReportRow, ReportState, ReportType,
    VariableSlice,
};
use tally_wire::time::DayIndex;
use tally_wire::ConfigId;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};
use validator::Validate;

use crate::error::ReportError;
use crate::executor::ReportExecutor;
use crate::scheduler::ReportStarter;
use crate::store::ReportStore;

/// Metadata records per streamed query batch.
const QUERY_BATCH_SIZE: usize = 100;

pub struct ReportService {
    registry: Arc<ProjectRegistry>,
    report_store: Arc<ReportStore>,
    report_executor: Arc<ReportExecutor>,
}

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct StartReportRequest {
    #[validate(range(min = 1))]
    pub customer_id: u32,
    #[validate(range(min = 1))]
    pub project_id: u32,
    #[validate(range(min = 1))]
    pub report_config_id: u32,
    pub first_day_index: DayIndex,
    pub last_day_index: DayIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartReportResponse {
    /// Opaque and round-trippable. For a two-variable config this is the
    /// joint report's id; the marginal ids are discoverable through
    /// `GetReport`.
    pub report_id: String,
}

/// The externally visible form of a report's metadata.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportMetadataView {
    pub report_id: String,
    pub customer_id: u32,
    pub project_id: u32,
    pub report_config_id: u32,
    pub state: ReportState,
    pub creation_time_seconds: i64,
    pub start_time_seconds: Option<i64>,
    pub finish_time_seconds: Option<i64>,
    pub first_day_index: DayIndex,
    pub last_day_index: DayIndex,
    /// The metric parts this report analyzes, depending on its variable
    /// slice.
    pub metric_parts: Vec<String>,
    /// For a joint report, the ids of the two marginal reports.
    pub associated_report_ids: Vec<String>,
    pub one_off: bool,
    pub info_messages: Vec<InfoMessage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetReportResponse {
    pub metadata: ReportMetadataView,
    /// Present only when the report completed successfully.
    pub rows: Vec<ReportRow>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryReportsBatch {
    pub reports: Vec<ReportMetadataView>,
}

impl ReportService {
    pub fn new(
        registry: Arc<ProjectRegistry>,
        report_store: Arc<ReportStore>,
        report_executor: Arc<ReportExecutor>,
    ) -> Self {
        Self {
            registry,
            report_store,
            report_executor,
        }
    }

    /// Allocates the report ids for one run of the config, enqueues the
    /// dependency chain and returns the primary id string.
    pub async fn start_report(
        &self,
        request: &StartReportRequest,
    ) -> Result<StartReportResponse, ReportError> {
        if request.first_day_index > request.last_day_index {
            return Err(ReportError::InvalidArgument(format!(
                "first_day_index {} exceeds last_day_index {}",
                request.first_day_index, request.last_day_index
            )));
        }
        let report_id = self
            .start_report_run(
                ConfigId::new(
                    request.customer_id,
                    request.project_id,
                    request.report_config_id,
                ),
                request.first_day_index,
                request.last_day_index,
                true,
            )
            .await?;
        Ok(StartReportResponse {
            report_id: report_id.to_id_string(),
        })
    }

    /// Loads one report by its opaque id string. Rows are returned only
    /// for successfully completed reports.
    pub async fn get_report(&self, report_id_string: &str) -> Result<GetReportResponse, ReportError> {
        let report_id = ReportId::from_id_string(report_id_string)
            .map_err(|err| ReportError::InvalidArgument(format!("bad report id: {err}")))?;

        let metadata = self
            .report_store
            .get_metadata(&report_id)
            .await
            .map_err(|err| ReportError::from_store(err, "report metadata"))?;

        let report_config = self.get_and_validate_report_config(
            report_id.customer_id,
            report_id.project_id,
            report_id.report_config_id,
        )?;

        let view = make_metadata_view(
            report_id_string.to_string(),
            &report_id,
            report_config,
            &metadata,
        )?;

        let rows = if metadata.state == ReportState::CompletedSuccessfully {
            let (_, rows) = self
                .report_store
                .get_report(&report_id)
                .await
                .map_err(|err| ReportError::from_store(err, "report rows"))?;
            rows
        } else {
            Vec::new()
        };

        Ok(GetReportResponse {
            metadata: view,
            rows,
        })
    }

    /// Streams the metadata of all reports for one config whose creation
    /// time falls in `[first_timestamp_seconds, limit_timestamp_seconds)`,
    /// in batches of at most [`QUERY_BATCH_SIZE`]. A store error
    /// short-circuits the stream.
    pub fn query_reports(
        &self,
        customer_id: u32,
        project_id: u32,
        report_config_id: u32,
        first_timestamp_seconds: i64,
        limit_timestamp_seconds: i64,
    ) -> Result<ReceiverStream<Result<QueryReportsBatch, ReportError>>, ReportError> {
        if limit_timestamp_seconds <= first_timestamp_seconds {
            return Err(ReportError::InvalidArgument(
                "empty or inverted creation-time interval".to_string(),
            ));
        }
        let report_config = self
            .get_and_validate_report_config(customer_id, project_id, report_config_id)?
            .clone();
        let report_store = Arc::clone(&self.report_store);
        let (sender, receiver) = mpsc::channel(4);

        tokio::spawn(async move {
            let mut pagination_token = String::new();
            loop {
                let page = match report_store
                    .query_reports(
                        customer_id,
                        project_id,
                        report_config_id,
                        first_timestamp_seconds,
                        limit_timestamp_seconds,
                        QUERY_BATCH_SIZE,
                        &pagination_token,
                    )
                    .await
                {
                    Ok(page) => page,
                    Err(err) => {
                        error!("read failed during query_reports: {err}");
                        let _ = sender
                            .send(Err(ReportError::Aborted("read failed".to_string())))
                            .await;
                        return;
                    }
                };

                let mut reports = Vec::with_capacity(page.results.len());
                for record in &page.results {
                    let view = make_metadata_view(
                        record.report_id.to_id_string(),
                        &record.report_id,
                        &report_config,
                        &record.report_metadata,
                    );
                    match view {
                        Ok(view) => reports.push(view),
                        Err(err) => {
                            let _ = sender.send(Err(err)).await;
                            return;
                        }
                    }
                }

                if sender.send(Ok(QueryReportsBatch { reports })).await.is_err() {
                    // The client went away.
                    return;
                }
                if page.pagination_token.is_empty() {
                    return;
                }
                pagination_token = page.pagination_token;
            }
        });

        Ok(ReceiverStream::new(receiver))
    }

    /// Blocks until the executor has drained. Used by graceful shutdown.
    pub async fn wait_until_idle(&self) {
        self.report_executor.wait_until_idle().await;
    }

    /// Registers one report run: a single report for one-variable configs
    /// and raw dumps, a chain of three (both marginals, then the joint)
    /// for two-variable configs. Returns the id of the chain's tail, whose
    /// terminal state marks the whole run finished.
    async fn start_report_run(
        &self,
        config_id: ConfigId,
        first_day_index: DayIndex,
        last_day_index: DayIndex,
        one_off: bool,
    ) -> Result<ReportId, ReportError> {
        let report_config = self.get_and_validate_report_config(
            config_id.customer_id,
            config_id.project_id,
            config_id.id,
        )?;

        let mut report_id = ReportId {
            customer_id: config_id.customer_id,
            project_id: config_id.project_id,
            report_config_id: config_id.id,
            variable_slice: VariableSlice::Variable1,
            ..Default::default()
        };

        // Raw dumps project every variable into one report; everything
        // else starts from the first marginal histogram.
        let (head_type, head_indices) = match report_config.report_type {
            ReportType::RawDump => (
                ReportType::RawDump,
                (0..report_config.variables.len() as u32).collect(),
            ),
            _ => (ReportType::Histogram, vec![0]),
        };

        self.report_store
            .start_new_report(
                first_day_index,
                last_day_index,
                one_off,
                head_type,
                head_indices,
                &mut report_id,
            )
            .await
            .map_err(|err| {
                let message = format!("start_new_report failed for report_id={report_id}: {err}");
                error!("{message}");
                ReportError::Aborted(message)
            })?;

        let mut report_chain = vec![report_id];

        // Two-variable (non raw-dump) configs run three reports per
        // window: the second marginal and the joint are registered up
        // front so the chain is visible in the store before generation
        // begins.
        if report_config.variables.len() == 2 && report_config.report_type != ReportType::RawDump {
            report_id.variable_slice = VariableSlice::Variable2;
            self.create_dependent_report(1, ReportType::Histogram, vec![1], &mut report_id)
                .await?;
            report_chain.push(report_id);

            report_id.variable_slice = VariableSlice::Joint;
            self.create_dependent_report(2, ReportType::Joint, vec![0, 1], &mut report_id)
                .await?;
            report_chain.push(report_id);
        }

        info!(
            report_id = %report_id,
            reports = report_chain.len(),
            "registered report run"
        );
        self.report_executor.enqueue(report_chain)?;
        Ok(report_id)
    }

    async fn create_dependent_report(
        &self,
        sequence_num: u32,
        report_type: ReportType,
        variable_indices: Vec<u32>,
        report_id: &mut ReportId,
    ) -> Result<(), ReportError> {
        self.report_store
            .create_dependent_report(sequence_num, report_type, variable_indices, report_id)
            .await
            .map_err(|err| {
                let message =
                    format!("create_dependent_report failed for report_id={report_id}: {err}");
                error!("{message}");
                ReportError::Aborted(message)
            })
    }

    fn get_and_validate_report_config(
        &self,
        customer_id: u32,
        project_id: u32,
        report_config_id: u32,
    ) -> Result<&ReportConfig, ReportError> {
        let report_config = self
            .registry
            .report_config(customer_id, project_id, report_config_id)
            .ok_or_else(|| {
                let message = format!(
                    "no report config found with id=({customer_id}, {project_id}, {report_config_id})"
                );
                error!("{message}");
                ReportError::NotFound(message)
            })?;
        let num_variables = report_config.variables.len();
        if num_variables == 0 || num_variables > 2 {
            let message = format!(
                "the report config with id=({customer_id}, {project_id}, {report_config_id}) \
                 is invalid: {num_variables} variables; report configs may have one or two"
            );
            error!("{message}");
            return Err(ReportError::FailedPrecondition(message));
        }
        Ok(report_config)
    }
}

#[async_trait]
impl ReportStarter for ReportService {
    async fn start_report(
        &self,
        config_id: ConfigId,
        _report_config: &ReportConfig,
        first_day_index: DayIndex,
        last_day_index: DayIndex,
        export_name: &str,
    ) -> Result<ReportId, ReportError> {
        info!(%config_id, export_name, "scheduler starting report");
        self.start_report_run(config_id, first_day_index, last_day_index, false)
            .await
    }
}

/// Builds the external metadata view, deriving the slice-dependent metric
/// parts and, for joint reports, the associated marginal ids.
fn make_metadata_view(
    report_id_string: String,
    report_id: &ReportId,
    report_config: &ReportConfig,
    metadata: &ReportMetadata,
) -> Result<ReportMetadataView, ReportError> {
    let (start_time_seconds, finish_time_seconds) = match metadata.state {
        ReportState::WaitingToStart => (None, None),
        ReportState::InProgress => (Some(metadata.start_time_seconds), None),
        ReportState::CompletedSuccessfully | ReportState::Terminated => (
            Some(metadata.start_time_seconds),
            Some(metadata.finish_time_seconds),
        ),
    };

    let metric_parts = match report_id.variable_slice {
        VariableSlice::Variable1 => {
            if metadata.report_type == ReportType::RawDump {
                // A raw dump covers every variable.
                report_config
                    .variables
                    .iter()
                    .map(|variable| variable.metric_part.clone())
                    .collect()
            } else {
                vec![variable_part(report_config, report_id, 0)?]
            }
        }
        VariableSlice::Variable2 => vec![variable_part(report_config, report_id, 1)?],
        VariableSlice::Joint => vec![
            variable_part(report_config, report_id, 0)?,
            variable_part(report_config, report_id, 1)?,
        ],
    };

    let associated_report_ids = if report_id.variable_slice == VariableSlice::Joint {
        let mut marginal = *report_id;
        marginal.variable_slice = VariableSlice::Variable1;
        marginal.sequence_num = 0;
        let first = marginal.to_id_string();
        marginal.variable_slice = VariableSlice::Variable2;
        marginal.sequence_num = 1;
        vec![first, marginal.to_id_string()]
    } else {
        Vec::new()
    };

    Ok(ReportMetadataView {
        report_id: report_id_string,
        customer_id: report_id.customer_id,
        project_id: report_id.project_id,
        report_config_id: report_id.report_config_id,
        state: metadata.state,
        creation_time_seconds: report_id.creation_time_seconds,
        start_time_seconds,
        finish_time_seconds,
        first_day_index: metadata.first_day_index,
        last_day_index: metadata.last_day_index,
        metric_parts,
        associated_report_ids,
        one_off: metadata.one_off,
        info_messages: metadata.info_messages.clone(),
    })
}

fn variable_part(
    report_config: &ReportConfig,
    report_id: &ReportId,
    index: usize,
) -> Result<String, ReportError> {
    report_config
        .variables
        .get(index)
        .map(|variable| variable.metric_part.clone())
        .ok_or_else(|| {
            let message = format!(
                "bad report_id={report_id}: the report config does not have {} variables",
                index + 1
            );
            error!("{message}");
            ReportError::FailedPrecondition(message)
        })
}
