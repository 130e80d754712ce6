//! Typed view of the two report tables.
//!
//! The metadata table holds one row per report id under the canonical
//! 69-byte key (see [`ReportId`]'s `Display` impl), so scans by
//! `(customer, project, report_config)` over a creation-time window are
//! contiguous. The rows table holds the output rows of a report under the
//! metadata key extended with a random 10-digit suffix.

use std::sync::Arc;

use rand::Rng;
use tally_wire::report::{
    InfoMessage, ReportId, ReportMetadata, ReportRow, ReportState, ReportType,
};
use tally_wire::time::DayIndex;
use tracing::error;

use super::{DataStore, Row, StoreError, Table};
use crate::clock::Clock;

/// Reports are assumed to fit in memory; `get_report` refuses anything
/// larger than this.
const MAX_REPORT_ROWS: usize = 5_000;

/// The name of the data column in the metadata table.
const METADATA_COLUMN: &str = "metadata";

/// The name of the data column in the rows table.
const REPORT_ROW_COLUMN: &str = "report_row";

pub struct ReportStore {
    store: Arc<dyn DataStore>,
    clock: Arc<dyn Clock>,
}

/// One result of [`ReportStore::query_reports`]: metadata only, the report
/// data stays in the rows table.
#[derive(Clone, Debug, PartialEq)]
pub struct ReportRecord {
    pub report_id: ReportId,
    pub report_metadata: ReportMetadata,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReportPage {
    pub results: Vec<ReportRecord>,
    /// Non-empty when more results may be available.
    pub pagination_token: String,
}

impl ReportStore {
    pub fn new(store: Arc<dyn DataStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Completes `report_id` by allocating its creation time and a random
    /// instance id, then records the report as `InProgress`.
    ///
    /// On input every field of `report_id` other than the allocated two
    /// should already be set. Invoke this before adding rows.
    pub async fn start_new_report(
        &self,
        first_day_index: DayIndex,
        last_day_index: DayIndex,
        one_off: bool,
        report_type: ReportType,
        variable_indices: Vec<u32>,
        report_id: &mut ReportId,
    ) -> Result<(), StoreError> {
        report_id.creation_time_seconds = self.clock.now_seconds();
        report_id.instance_id = random_nonzero_u32();

        let metadata = ReportMetadata {
            state: ReportState::InProgress,
            first_day_index,
            last_day_index,
            report_type,
            variable_indices,
            one_off,
            // The report is not just created but also started now.
            start_time_seconds: report_id.creation_time_seconds,
            finish_time_seconds: 0,
            info_messages: Vec::new(),
        };
        self.write_metadata(report_id, &metadata).await
    }

    /// Derives a new id from an existing one by replacing its sequence
    /// number, and records the derived report as `WaitingToStart`.
    ///
    /// On input `report_id` must be a complete id returned from
    /// [`start_new_report`] or this method; on output its sequence number
    /// is `sequence_num`. The day range and one-off flag are copied from
    /// the existing report. Fails with `AlreadyExists` if the derived id
    /// already has metadata.
    ///
    /// [`start_new_report`]: ReportStore::start_new_report
    pub async fn create_dependent_report(
        &self,
        sequence_num: u32,
        report_type: ReportType,
        variable_indices: Vec<u32>,
        report_id: &mut ReportId,
    ) -> Result<(), StoreError> {
        let existing = self.get_metadata(report_id).await?;

        report_id.sequence_num = sequence_num;
        match self.get_metadata(report_id).await {
            Err(StoreError::NotFound) => {}
            Ok(_) => return Err(StoreError::AlreadyExists),
            Err(err) => return Err(err),
        }

        let metadata = ReportMetadata {
            state: ReportState::WaitingToStart,
            first_day_index: existing.first_day_index,
            last_day_index: existing.last_day_index,
            report_type,
            variable_indices,
            one_off: existing.one_off,
            // Created but not started.
            start_time_seconds: 0,
            finish_time_seconds: 0,
            info_messages: Vec::new(),
        };
        self.write_metadata(report_id, &metadata).await
    }

    /// Moves a `WaitingToStart` report into `InProgress`. Fails with
    /// `PreconditionFailed` in any other state.
    pub async fn start_dependent_report(&self, report_id: &ReportId) -> Result<(), StoreError> {
        let mut metadata = self.get_metadata(report_id).await?;
        if metadata.state != ReportState::WaitingToStart {
            return Err(StoreError::PreconditionFailed(format!(
                "report {report_id} is in state {:?}, not WAITING_TO_START",
                metadata.state
            )));
        }
        metadata.state = ReportState::InProgress;
        metadata.start_time_seconds = self.clock.now_seconds();
        self.write_metadata(report_id, &metadata).await
    }

    /// Moves a report into its terminal state and stamps the finish time.
    /// A non-empty `message` is appended to the info-message log.
    pub async fn end_report(
        &self,
        report_id: &ReportId,
        success: bool,
        message: String,
    ) -> Result<(), StoreError> {
        let mut metadata = self.get_metadata(report_id).await?;
        metadata.finish_time_seconds = self.clock.now_seconds();
        metadata.state = if success {
            ReportState::CompletedSuccessfully
        } else {
            ReportState::Terminated
        };
        if !message.is_empty() {
            metadata.info_messages.push(InfoMessage {
                timestamp_seconds: metadata.finish_time_seconds,
                message,
            });
        }
        self.write_metadata(report_id, &metadata).await
    }

    /// Appends output rows to an `InProgress` report. Each row's payload
    /// tag must match the report's type.
    pub async fn add_report_rows(
        &self,
        report_id: &ReportId,
        report_rows: &[ReportRow],
    ) -> Result<(), StoreError> {
        if !report_id.is_complete() {
            error!(%report_id, "attempt to add rows for an incomplete report id");
            return Err(StoreError::InvalidArguments(format!(
                "incomplete report id {report_id}"
            )));
        }

        let metadata = self.get_metadata(report_id).await?;
        if metadata.state != ReportState::InProgress {
            error!(%report_id, state = ?metadata.state, "report is not IN_PROGRESS");
            return Err(StoreError::PreconditionFailed(format!(
                "report {report_id} is in state {:?}",
                metadata.state
            )));
        }

        let mut rows = Vec::with_capacity(report_rows.len());
        for report_row in report_rows {
            if report_row.report_type() != metadata.report_type {
                error!(
                    %report_id,
                    row_type = ?report_row.report_type(),
                    report_type = ?metadata.report_type,
                    "report row type does not match the report"
                );
                return Err(StoreError::InvalidArguments(format!(
                    "row of type {:?} for a {:?} report",
                    report_row.report_type(),
                    metadata.report_type
                )));
            }
            let serialized = serde_json::to_vec(report_row)
                .map_err(|err| StoreError::OperationFailed(format!("serializing row: {err}")))?;
            let mut row = Row {
                key: generate_report_row_key(report_id),
                ..Default::default()
            };
            row.column_values
                .insert(REPORT_ROW_COLUMN.to_string(), serialized);
            rows.push(row);
        }

        self.store.write_rows(Table::ReportRows, rows).await
    }

    /// Fetches the metadata for one report id. Returns `NotFound` without
    /// logging, since callers use this to probe for absence.
    pub async fn get_metadata(&self, report_id: &ReportId) -> Result<ReportMetadata, StoreError> {
        let row = self
            .store
            .read_row(Table::ReportMetadata, &metadata_row_key(report_id), &[])
            .await?;
        parse_single_column(report_id, &row, METADATA_COLUMN)
    }

    /// Fetches the metadata and all rows of one report. Reports larger
    /// than [`MAX_REPORT_ROWS`] are refused.
    pub async fn get_report(
        &self,
        report_id: &ReportId,
    ) -> Result<(ReportMetadata, Vec<ReportRow>), StoreError> {
        let metadata = self.get_metadata(report_id).await?;

        let response = self
            .store
            .read_rows(
                Table::ReportRows,
                &report_row_start_key(report_id),
                true,
                &report_row_limit_key(report_id),
                &[],
                MAX_REPORT_ROWS,
            )
            .await?;
        if response.more_available {
            error!(%report_id, "report contains too many rows to return");
            return Err(StoreError::PreconditionFailed(format!(
                "report {report_id} exceeds {MAX_REPORT_ROWS} rows"
            )));
        }

        let mut rows = Vec::with_capacity(response.rows.len());
        for row in &response.rows {
            rows.push(parse_single_column(report_id, row, REPORT_ROW_COLUMN)?);
        }
        Ok((metadata, rows))
    }

    /// Scans metadata for the given report config over a half-open
    /// creation-time interval `[start, end)` in seconds. Paginated like the
    /// observation store; the token is the row key of the last returned
    /// record and must not precede the interval's start key.
    pub async fn query_reports(
        &self,
        customer_id: u32,
        project_id: u32,
        report_config_id: u32,
        interval_start_time_seconds: i64,
        interval_end_time_seconds: i64,
        max_results: usize,
        pagination_token: &str,
    ) -> Result<ReportPage, StoreError> {
        let range_start = metadata_range_start_key(
            customer_id,
            project_id,
            report_config_id,
            interval_start_time_seconds,
        );
        let limit = metadata_range_start_key(
            customer_id,
            project_id,
            report_config_id,
            interval_end_time_seconds,
        );

        let (start, inclusive) = if pagination_token.is_empty() {
            (range_start, true)
        } else {
            if pagination_token < range_start.as_str() {
                return Err(StoreError::InvalidArguments(
                    "pagination_token precedes the query interval".to_string(),
                ));
            }
            (pagination_token.to_string(), false)
        };

        if limit.as_str() <= start.as_str() {
            return Err(StoreError::InvalidArguments(
                "empty or inverted creation-time interval".to_string(),
            ));
        }

        let response = self
            .store
            .read_rows(
                Table::ReportMetadata,
                &start,
                inclusive,
                &limit,
                &[],
                max_results,
            )
            .await?;

        let mut page = ReportPage::default();
        for row in &response.rows {
            let report_id = ReportId::from_row_key(&row.key).map_err(|err| {
                StoreError::OperationFailed(format!("bad metadata row key {:?}: {err}", row.key))
            })?;
            let report_metadata = parse_single_column(&report_id, row, METADATA_COLUMN)?;
            page.results.push(ReportRecord {
                report_id,
                report_metadata,
            });
        }

        if response.more_available {
            match response.rows.last() {
                Some(last) => page.pagination_token = last.key.clone(),
                // The read claimed more rows but returned none; treat the
                // pathological response as a failure.
                None => {
                    return Err(StoreError::OperationFailed(
                        "store reported more rows but returned none".to_string(),
                    ))
                }
            }
        }

        Ok(page)
    }

    /// Permanently deletes all metadata and rows for one report config.
    pub async fn delete_all_for_report_config(
        &self,
        customer_id: u32,
        project_id: u32,
        report_config_id: u32,
    ) -> Result<(), StoreError> {
        let prefix = format!("{customer_id:010}:{project_id:010}:{report_config_id:010}:");
        self.store
            .delete_rows_with_prefix(Table::ReportMetadata, &prefix)
            .await?;
        self.store
            .delete_rows_with_prefix(Table::ReportRows, &prefix)
            .await
    }

    async fn write_metadata(
        &self,
        report_id: &ReportId,
        metadata: &ReportMetadata,
    ) -> Result<(), StoreError> {
        let serialized = serde_json::to_vec(metadata)
            .map_err(|err| StoreError::OperationFailed(format!("serializing metadata: {err}")))?;
        let mut row = Row {
            key: metadata_row_key(report_id),
            ..Default::default()
        };
        row.column_values
            .insert(METADATA_COLUMN.to_string(), serialized);
        self.store.write_row(Table::ReportMetadata, row).await
    }
}

fn random_nonzero_u32() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

fn metadata_row_key(report_id: &ReportId) -> String {
    report_id.to_string()
}

/// The first possible metadata row key for the given config and creation
/// time.
fn metadata_range_start_key(
    customer_id: u32,
    project_id: u32,
    report_config_id: u32,
    creation_time_seconds: i64,
) -> String {
    let report_id = ReportId {
        customer_id,
        project_id,
        report_config_id,
        creation_time_seconds,
        ..Default::default()
    };
    metadata_row_key(&report_id)
}

fn report_row_start_key(report_id: &ReportId) -> String {
    format!("{report_id}:")
}

/// Exclusive upper bound for one report's rows. Row suffixes are ten-digit
/// renderings of a `u32`, so they never reach this sentinel.
fn report_row_limit_key(report_id: &ReportId) -> String {
    format!("{report_id}:9999999999")
}

fn generate_report_row_key(report_id: &ReportId) -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("{report_id}:{suffix:010}")
}

fn parse_single_column<T: serde::de::DeserializeOwned>(
    report_id: &ReportId,
    row: &Row,
    column_name: &str,
) -> Result<T, StoreError> {
    if row.column_values.len() != 1 {
        error!(
            %report_id,
            columns = row.column_values.len(),
            "expected exactly one column"
        );
        return Err(StoreError::OperationFailed(format!(
            "expected one column, got {}",
            row.column_values.len()
        )));
    }
    let value = row.column_values.get(column_name).ok_or_else(|| {
        error!(%report_id, column_name, "column not found");
        StoreError::OperationFailed(format!("column {column_name} not found"))
    })?;
    serde_json::from_slice(value).map_err(|err| {
        error!(%report_id, column_name, "unable to parse column: {err}");
        StoreError::OperationFailed(format!("unable to parse column {column_name}: {err}"))
    })
}
