//! Typed view of observation rows.
//!
//! Row key layout: `CC:PP:MM:DD:AA`, five fixed-width zero-padded decimal
//! fields (customer, project, metric, day index, arrival id), ten digits
//! each. Scanning the `CC:PP:MM` prefix therefore returns exactly one
//! metric's data, in day-index order. Each observation part occupies one
//! column named after the part; the system profile rides in a reserved
//! column that can never collide with a metric part name.

use std::sync::Arc;

use rand::Rng;
use tally_wire::observation::{Observation, ObservationMetadata, ObservationPart};
use tally_wire::time::DayIndex;
use tracing::warn;

use super::{DataStore, Row, StoreError, Table};

/// Column holding the serialized system profile. Metric part names are
/// plain identifiers, so the `@` prefix is reserved.
const PROFILE_COLUMN: &str = "@system_profile";

pub struct ObservationStore {
    store: Arc<dyn DataStore>,
}

/// One result of [`ObservationStore::query_observations`].
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    /// Between the start and end day indices of the query.
    pub day_index: DayIndex,
    /// Contains only the parts requested by the query.
    pub observation: Observation,
}

/// A page of query results.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservationPage {
    pub results: Vec<QueryResult>,
    /// Non-empty when more results may be available; pass it to the next
    /// invocation to continue the scan. Opaque to callers.
    pub pagination_token: String,
}

impl ObservationStore {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// Adds one observation and its metadata to the store.
    pub async fn add_observation(
        &self,
        metadata: &ObservationMetadata,
        observation: &Observation,
    ) -> Result<(), StoreError> {
        let row = make_row(metadata, observation)?;
        self.store.write_row(Table::Observations, row).await
    }

    /// Adds a batch of observations sharing one set of metadata.
    pub async fn add_observation_batch(
        &self,
        metadata: &ObservationMetadata,
        observations: &[Observation],
    ) -> Result<(), StoreError> {
        let rows = observations
            .iter()
            .map(|observation| make_row(metadata, observation))
            .collect::<Result<Vec<_>, _>>()?;
        self.store.write_rows(Table::Observations, rows).await
    }

    /// Queries a range of observations for one metric.
    ///
    /// The day-index range is inclusive on both ends; day zero and
    /// `u32::MAX` act as the infinite past and future. If `parts` is
    /// non-empty only the named parts are returned. `max_results` bounds
    /// the page size and must be positive. A non-empty `pagination_token`
    /// must have come from a previous response with the same arguments.
    pub async fn query_observations(
        &self,
        customer_id: u32,
        project_id: u32,
        metric_id: u32,
        start_day_index: DayIndex,
        end_day_index: DayIndex,
        parts: &[String],
        max_results: usize,
        pagination_token: &str,
    ) -> Result<ObservationPage, StoreError> {
        if start_day_index > end_day_index {
            return Err(StoreError::InvalidArguments(format!(
                "start_day_index {start_day_index} exceeds end_day_index {end_day_index}"
            )));
        }
        let range_start = row_key(customer_id, project_id, metric_id, start_day_index, 0);
        // ';' is the byte after ':', so this bounds every arrival id of the
        // last day, inclusive.
        let limit = format!(
            "{customer_id:010}:{project_id:010}:{metric_id:010}:{end_day_index:010};"
        );

        let (start, inclusive) = if pagination_token.is_empty() {
            (range_start, true)
        } else {
            if pagination_token < range_start.as_str() || pagination_token >= limit.as_str() {
                return Err(StoreError::InvalidArguments(
                    "pagination_token is not consistent with the query range".to_string(),
                ));
            }
            (pagination_token.to_string(), false)
        };

        let column_names: Vec<String> = if parts.is_empty() {
            Vec::new()
        } else {
            parts
                .iter()
                .cloned()
                .chain(std::iter::once(PROFILE_COLUMN.to_string()))
                .collect()
        };

        let response = self
            .store
            .read_rows(
                Table::Observations,
                &start,
                inclusive,
                &limit,
                &column_names,
                max_results,
            )
            .await?;

        let pagination_token = if response.more_available {
            response
                .rows
                .last()
                .map(|row| row.key.clone())
                .unwrap_or_default()
        } else {
            String::new()
        };

        let mut results = Vec::with_capacity(response.rows.len());
        for row in response.rows {
            match parse_row(row) {
                Ok(result) => results.push(result),
                Err(err) => {
                    // A row we cannot parse is data corruption, not a reason
                    // to fail the whole scan.
                    warn!("skipping undecodable observation row: {err}");
                }
            }
        }

        Ok(ObservationPage {
            results,
            pagination_token,
        })
    }

    /// Permanently deletes all observations for the given metric.
    pub async fn delete_all_for_metric(
        &self,
        customer_id: u32,
        project_id: u32,
        metric_id: u32,
    ) -> Result<(), StoreError> {
        let prefix = format!("{customer_id:010}:{project_id:010}:{metric_id:010}:");
        self.store
            .delete_rows_with_prefix(Table::Observations, &prefix)
            .await
    }
}

fn row_key(
    customer_id: u32,
    project_id: u32,
    metric_id: u32,
    day_index: DayIndex,
    arrival_id: u32,
) -> String {
    format!("{customer_id:010}:{project_id:010}:{metric_id:010}:{day_index:010}:{arrival_id:010}")
}

fn make_row(metadata: &ObservationMetadata, observation: &Observation) -> Result<Row, StoreError> {
    // Random arrival ids spread concurrent writers across the key space.
    let arrival_id: u32 = rand::thread_rng().gen();
    let mut row = Row {
        key: row_key(
            metadata.customer_id,
            metadata.project_id,
            metadata.metric_id,
            metadata.day_index,
            arrival_id,
        ),
        ..Default::default()
    };
    for (name, part) in &observation.parts {
        let serialized = serde_json::to_vec(part)
            .map_err(|err| StoreError::OperationFailed(format!("serializing part {name}: {err}")))?;
        row.column_values.insert(name.clone(), serialized);
    }
    if let Some(profile) = &observation.system_profile {
        let serialized = serde_json::to_vec(profile)
            .map_err(|err| StoreError::OperationFailed(format!("serializing profile: {err}")))?;
        row.column_values
            .insert(PROFILE_COLUMN.to_string(), serialized);
    }
    Ok(row)
}

fn parse_row(row: Row) -> Result<QueryResult, StoreError> {
    let day_index = row
        .key
        .get(33..43)
        .and_then(|field| field.parse::<u32>().ok())
        .ok_or_else(|| StoreError::OperationFailed(format!("malformed row key {:?}", row.key)))?;

    let mut observation = Observation::default();
    for (name, value) in row.column_values {
        if name == PROFILE_COLUMN {
            observation.system_profile = serde_json::from_slice(&value)
                .map_err(|err| StoreError::OperationFailed(format!("bad profile column: {err}")))?;
            continue;
        }
        let part: ObservationPart = serde_json::from_slice(&value)
            .map_err(|err| StoreError::OperationFailed(format!("bad part column {name}: {err}")))?;
        observation.parts.insert(name, part);
    }
    Ok(QueryResult {
        day_index,
        observation,
    })
}
