//! The raw-dump report row iterator.
//!
//! A raw-dump report is a projection of raw, unencoded observations: each
//! yielded row is a copy of the selected system-profile fields plus the
//! declared parts of one observation. The iterator wraps an observation
//! store query and refills its page lazily, carrying the pagination token
//! forward. A malformed input observation is logged and skipped, never
//! aborting the stream.

use std::sync::Arc;

use tally_wire::metric::{DataType, Metric};
use tally_wire::observation::{ObservationValue, SystemProfileField};
use tally_wire::report::{RawDumpRow, ReportRow};
use tally_wire::time::DayIndex;
use tracing::{error, warn};

use crate::error::ReportError;
use crate::store::observations::QueryResult;
use crate::store::ObservationStore;

/// Page size for the wrapped observation query.
const PAGE_SIZE: usize = 1_000;

pub struct RawDumpRowIterator {
    customer_id: u32,
    project_id: u32,
    metric_id: u32,
    start_day_index: DayIndex,
    end_day_index: DayIndex,
    parts: Vec<String>,
    /// Data types from the metric config, in `parts` order. Each dumped
    /// value must carry the declared type.
    expected_types: Vec<DataType>,
    profile_fields: Vec<SystemProfileField>,
    /// Identifies the owning report in log messages.
    report_id_string: String,
    observation_store: Arc<ObservationStore>,

    page: Vec<QueryResult>,
    index: usize,
    pagination_token: String,
    started: bool,
    eof: bool,
    next: Option<ReportRow>,
}

impl RawDumpRowIterator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        customer_id: u32,
        project_id: u32,
        metric_id: u32,
        start_day_index: DayIndex,
        end_day_index: DayIndex,
        parts: Vec<String>,
        profile_fields: Vec<SystemProfileField>,
        report_id_string: String,
        observation_store: Arc<ObservationStore>,
        metric: &Metric,
    ) -> Result<Self, ReportError> {
        if parts.is_empty() {
            return Err(ReportError::InvalidArgument(format!(
                "a raw dump needs at least one part, report_id={report_id_string}"
            )));
        }
        let mut expected_types = Vec::with_capacity(parts.len());
        for part in &parts {
            let Some(metric_part) = metric.parts.get(part) else {
                return Err(ReportError::InvalidArgument(format!(
                    "part {part:?} is not declared by the metric, report_id={report_id_string}"
                )));
            };
            expected_types.push(metric_part.data_type);
        }
        Ok(Self {
            customer_id,
            project_id,
            metric_id,
            start_day_index,
            end_day_index,
            parts,
            expected_types,
            profile_fields,
            report_id_string,
            observation_store,
            page: Vec::new(),
            index: 0,
            pagination_token: String::new(),
            started: false,
            eof: false,
            next: None,
        })
    }

    /// Rewinds the iterator to the start of the query.
    pub fn reset(&mut self) {
        self.page.clear();
        self.index = 0;
        self.pagination_token.clear();
        self.started = false;
        self.eof = false;
        self.next = None;
    }

    /// Whether another row is available. After EOF this stays false until
    /// [`reset`].
    ///
    /// [`reset`]: RawDumpRowIterator::reset
    pub async fn has_more_rows(&mut self) -> Result<bool, ReportError> {
        self.ensure_next().await?;
        Ok(self.next.is_some())
    }

    /// Yields the next well-formed row, or `None` at EOF.
    pub async fn next_row(&mut self) -> Result<Option<ReportRow>, ReportError> {
        self.ensure_next().await?;
        Ok(self.next.take())
    }

    /// Advances through input observations until a row was built, a query
    /// error occurred, or EOF.
    async fn ensure_next(&mut self) -> Result<(), ReportError> {
        while self.next.is_none() && !self.eof {
            if self.index >= self.page.len() {
                if self.started && self.pagination_token.is_empty() {
                    self.eof = true;
                    return Ok(());
                }
                self.refill_page().await?;
                continue;
            }
            let result = &self.page[self.index];
            self.index += 1;
            self.next = self.try_build_row(result);
        }
        Ok(())
    }

    async fn refill_page(&mut self) -> Result<(), ReportError> {
        let page = self
            .observation_store
            .query_observations(
                self.customer_id,
                self.project_id,
                self.metric_id,
                self.start_day_index,
                self.end_day_index,
                &self.parts,
                PAGE_SIZE,
                &self.pagination_token,
            )
            .await
            .map_err(|err| {
                let message = format!(
                    "query_observations failed for report_id={}: {err}",
                    self.report_id_string
                );
                error!("{message}");
                ReportError::Aborted(message)
            })?;
        self.started = true;
        self.pagination_token = page.pagination_token;
        self.page = page.results;
        self.index = 0;
        if self.page.is_empty() && self.pagination_token.is_empty() {
            self.eof = true;
        }
        Ok(())
    }

    /// Projects one observation into a raw-dump row, or `None` if the
    /// observation cannot be dumped: a declared part is missing, a part
    /// was privacy-encoded, or a value has the wrong data type.
    fn try_build_row(&self, result: &QueryResult) -> Option<ReportRow> {
        let observation = &result.observation;
        let mut values = Vec::with_capacity(self.parts.len());
        for (part_name, expected) in self.parts.iter().zip(&self.expected_types) {
            let Some(part) = observation.parts.get(part_name) else {
                warn!(
                    report_id = %self.report_id_string,
                    part = %part_name,
                    "skipping observation missing a declared part"
                );
                return None;
            };
            let ObservationValue::Unencoded(value) = &part.value else {
                warn!(
                    report_id = %self.report_id_string,
                    part = %part_name,
                    "skipping observation whose part is not unencoded"
                );
                return None;
            };
            if value.data_type() != *expected {
                warn!(
                    report_id = %self.report_id_string,
                    part = %part_name,
                    expected = ?expected,
                    actual = ?value.data_type(),
                    "skipping observation with a mistyped part"
                );
                return None;
            }
            values.push(value.clone());
        }

        let profile_values = self
            .profile_fields
            .iter()
            .map(|&field| {
                observation
                    .system_profile
                    .as_ref()
                    .map(|profile| profile.field_value(field))
                    .unwrap_or_default()
            })
            .collect();

        Some(ReportRow::RawDump(RawDumpRow {
            profile_values,
            values,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tally_wire::metric::MetricPart;
    use tally_wire::observation::{
        Observation, ObservationMetadata, ObservationPart, SystemProfile, ThresholdObservation,
        ValuePart,
    };

    fn metric() -> Metric {
        let mut metric = Metric {
            name: "city".to_string(),
            ..Default::default()
        };
        metric.parts.insert(
            "name".to_string(),
            MetricPart {
                description: None,
                data_type: DataType::String,
            },
        );
        metric
    }

    fn unencoded_observation(name: &str, board: &str) -> Observation {
        let mut observation = Observation {
            system_profile: Some(SystemProfile {
                board_name: board.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        observation.parts.insert(
            "name".to_string(),
            ObservationPart {
                encoding_config_id: 1,
                value: ObservationValue::Unencoded(ValuePart::String(name.to_string())),
            },
        );
        observation
    }

    async fn seeded_store(observations: &[Observation]) -> Arc<ObservationStore> {
        let store = Arc::new(ObservationStore::new(Arc::new(MemoryStore::new())));
        let metadata = ObservationMetadata {
            customer_id: 1,
            project_id: 1,
            metric_id: 1,
            day_index: 10,
        };
        for observation in observations {
            store.add_observation(&metadata, observation).await.unwrap();
        }
        store
    }

    fn iterator(store: Arc<ObservationStore>) -> RawDumpRowIterator {
        RawDumpRowIterator::new(
            1,
            1,
            1,
            0,
            u32::MAX,
            vec!["name".to_string()],
            vec![SystemProfileField::BoardName],
            "test-report".to_string(),
            store,
            &metric(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn dumps_every_well_formed_observation() {
        let store = seeded_store(&[
            unencoded_observation("amsterdam", "board-a"),
            unencoded_observation("utrecht", "board-b"),
        ])
        .await;
        let mut iterator = iterator(store);

        let mut names = Vec::new();
        while let Some(row) = iterator.next_row().await.unwrap() {
            match row {
                ReportRow::RawDump(row) => {
                    assert_eq!(row.profile_values.len(), 1);
                    match &row.values[0] {
                        ValuePart::String(name) => names.push(name.clone()),
                        other => panic!("unexpected value {other:?}"),
                    }
                }
                other => panic!("expected raw dump row, got {other:?}"),
            }
        }
        names.sort();
        assert_eq!(names, vec!["amsterdam", "utrecht"]);

        // EOF is sticky.
        assert!(!iterator.has_more_rows().await.unwrap());
        assert!(iterator.next_row().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_observations_are_skipped_not_fatal() {
        let mut encoded = Observation::default();
        encoded.parts.insert(
            "name".to_string(),
            ObservationPart {
                encoding_config_id: 1,
                value: ObservationValue::Threshold(ThresholdObservation {
                    ciphertext: vec![],
                    point_x: 0,
                    point_y: vec![],
                }),
            },
        );
        let mut mistyped = Observation::default();
        mistyped.parts.insert(
            "name".to_string(),
            ObservationPart {
                encoding_config_id: 1,
                value: ObservationValue::Unencoded(ValuePart::Int(7)),
            },
        );
        let store = seeded_store(&[
            encoded,
            unencoded_observation("delft", "b"),
            mistyped,
            Observation::default(),
        ])
        .await;
        let mut iterator = iterator(store);

        let mut rows = 0;
        while iterator.next_row().await.unwrap().is_some() {
            rows += 1;
        }
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn reset_rewinds_to_the_start() {
        let store = seeded_store(&[unencoded_observation("leiden", "b")]).await;
        let mut iterator = iterator(store);
        assert!(iterator.next_row().await.unwrap().is_some());
        assert!(iterator.next_row().await.unwrap().is_none());

        iterator.reset();
        assert!(iterator.has_more_rows().await.unwrap());
        assert!(iterator.next_row().await.unwrap().is_some());
    }

    #[test]
    fn undeclared_parts_are_rejected_up_front() {
        let store = Arc::new(ObservationStore::new(Arc::new(MemoryStore::new())));
        let err = RawDumpRowIterator::new(
            1,
            1,
            1,
            0,
            u32::MAX,
            vec!["unknown".to_string()],
            Vec::new(),
            "test-report".to_string(),
            store,
            &metric(),
        )
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, ReportError::InvalidArgument(_)));
    }
}
