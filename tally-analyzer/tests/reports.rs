//! End-to-end report generation over the in-memory store.

mod common;

use common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tally_analyzer::service::StartReportRequest;
use tally_wire::observation::ValuePart;
use tally_wire::report::{ReportRow, ReportState};

const DAY: u32 = 20_000;

fn start_request(report_config_id: u32, first_day: u32, last_day: u32) -> StartReportRequest {
    StartReportRequest {
        customer_id: CUSTOMER,
        project_id: PROJECT,
        report_config_id,
        first_day_index: first_day,
        last_day_index: last_day,
    }
}

#[tokio::test]
async fn threshold_histogram_drops_values_below_threshold() {
    let harness = harness_at_day(DAY, true);
    let metadata = metadata_for_day(DAY);

    // "apple" three times from two distinct clients, "banana" once.
    for (value, client) in [("apple", 1), ("apple", 2), ("apple", 1), ("banana", 3)] {
        harness
            .observation_store
            .add_observation(&metadata, &threshold_observation(THRESHOLD_ENCODING, value, client))
            .await
            .unwrap();
    }

    let response = harness
        .service
        .start_report(&start_request(HISTOGRAM_CONFIG, DAY, DAY))
        .await
        .unwrap();
    harness.executor.wait_until_idle().await;

    let report = harness.service.get_report(&response.report_id).await.unwrap();
    assert_eq!(report.metadata.state, ReportState::CompletedSuccessfully);
    assert_eq!(report.metadata.metric_parts, vec!["fruit".to_string()]);
    assert_eq!(report.rows.len(), 1);
    match &report.rows[0] {
        ReportRow::Histogram(row) => {
            assert_eq!(row.value, ValuePart::String("apple".to_string()));
            assert_eq!(row.count_estimate, 3.0);
        }
        other => panic!("expected a histogram row, got {other:?}"),
    }
}

#[tokio::test]
async fn randomized_response_estimates_recover_the_distribution() {
    let harness = harness_at_day(DAY, true);
    let metadata = metadata_for_day(DAY);

    // 10,000 encoded observations with true distribution (0.5, 0.3, 0.2).
    let truth = [0.5f64, 0.3, 0.2];
    let total = 10_000usize;
    let mut rng = StdRng::seed_from_u64(1837);
    let mut batch = Vec::with_capacity(total);
    for _ in 0..total {
        let sample: f64 = rng.gen();
        let category = if sample < truth[0] {
            0
        } else if sample < truth[0] + truth[1] {
            1
        } else {
            2
        };
        let mut data = vec![0u8; 1];
        for bit in 0..RR_CATEGORIES {
            let probability = if bit == category {
                RR_PROB_1_STAYS_1
            } else {
                RR_PROB_0_BECOMES_1
            };
            if rng.gen::<f64>() < probability {
                data[0] |= 1 << bit;
            }
        }
        batch.push(basic_rr_observation(data));
    }
    harness
        .observation_store
        .add_observation_batch(&metadata, &batch)
        .await
        .unwrap();

    let response = harness
        .service
        .start_report(&start_request(BASIC_RR_HISTOGRAM_CONFIG, DAY, DAY))
        .await
        .unwrap();
    harness.executor.wait_until_idle().await;

    let report = harness.service.get_report(&response.report_id).await.unwrap();
    assert_eq!(report.metadata.state, ReportState::CompletedSuccessfully);
    assert_eq!(report.rows.len(), RR_CATEGORIES);

    let n = total as f64;
    for row in &report.rows {
        let ReportRow::Histogram(row) = row else {
            panic!("expected histogram rows");
        };
        let ValuePart::Index(category) = row.value else {
            panic!("expected index values");
        };
        let expected = truth[category as usize];
        let estimate = row.count_estimate / n;
        let tolerance = 3.0 * row.std_error / n;
        assert!(
            (estimate - expected).abs() <= tolerance,
            "category {category}: estimate {estimate} outside {expected} +- {tolerance}"
        );
    }
}

#[tokio::test]
async fn heterogeneous_encodings_terminate_the_report() {
    let harness = harness_at_day(DAY, true);
    let metadata = metadata_for_day(DAY);

    for (encoding, client) in [(THRESHOLD_ENCODING, 1), (SECOND_THRESHOLD_ENCODING, 2)] {
        harness
            .observation_store
            .add_observation(&metadata, &threshold_observation(encoding, "apple", client))
            .await
            .unwrap();
    }

    let response = harness
        .service
        .start_report(&start_request(HISTOGRAM_CONFIG, DAY, DAY))
        .await
        .unwrap();
    harness.executor.wait_until_idle().await;

    let report = harness.service.get_report(&response.report_id).await.unwrap();
    assert_eq!(report.metadata.state, ReportState::Terminated);
    assert!(report.rows.is_empty());

    let message = report
        .metadata
        .info_messages
        .iter()
        .map(|info| info.message.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    assert!(message.contains(&THRESHOLD_ENCODING.to_string()));
    assert!(message.contains(&SECOND_THRESHOLD_ENCODING.to_string()));
}

#[tokio::test]
async fn malformed_observations_reduce_counts_without_aborting() {
    let harness = harness_at_day(DAY, true);
    let metadata = metadata_for_day(DAY);

    for (value, client) in [("apple", 1), ("apple", 2)] {
        harness
            .observation_store
            .add_observation(&metadata, &threshold_observation(THRESHOLD_ENCODING, value, client))
            .await
            .unwrap();
    }
    // A conflicting share for a different value is malformed input; it must
    // not abort the report.
    let mut corrupt = threshold_observation(THRESHOLD_ENCODING, "banana", 1);
    if let Some(part) = corrupt.parts.get_mut("fruit") {
        if let tally_wire::observation::ObservationValue::Threshold(observation) = &mut part.value {
            observation.point_y = vec![200];
        }
    }
    harness
        .observation_store
        .add_observation(&metadata, &threshold_observation(THRESHOLD_ENCODING, "banana", 1))
        .await
        .unwrap();
    harness
        .observation_store
        .add_observation(&metadata, &corrupt)
        .await
        .unwrap();

    let response = harness
        .service
        .start_report(&start_request(HISTOGRAM_CONFIG, DAY, DAY))
        .await
        .unwrap();
    harness.executor.wait_until_idle().await;

    let report = harness.service.get_report(&response.report_id).await.unwrap();
    assert_eq!(report.metadata.state, ReportState::CompletedSuccessfully);
    assert_eq!(report.rows.len(), 1);
    match &report.rows[0] {
        ReportRow::Histogram(row) => {
            assert_eq!(row.value, ValuePart::String("apple".to_string()));
            assert_eq!(row.count_estimate, 2.0);
        }
        other => panic!("expected a histogram row, got {other:?}"),
    }
}

#[tokio::test]
async fn raw_dump_projects_unencoded_observations() {
    let harness = harness_at_day(DAY, true);
    let metadata = metadata_for_day(DAY);

    for (city, board) in [("utrecht", "board-a"), ("delft", "board-b")] {
        harness
            .observation_store
            .add_observation(&metadata, &city_observation(city, board))
            .await
            .unwrap();
    }
    // A privacy-encoded observation cannot be dumped and is skipped.
    harness
        .observation_store
        .add_observation(&metadata, &threshold_observation(THRESHOLD_ENCODING, "x", 1))
        .await
        .unwrap();

    let response = harness
        .service
        .start_report(&start_request(RAW_DUMP_CONFIG, DAY, DAY))
        .await
        .unwrap();
    harness.executor.wait_until_idle().await;

    let report = harness.service.get_report(&response.report_id).await.unwrap();
    assert_eq!(report.metadata.state, ReportState::CompletedSuccessfully);
    assert_eq!(report.metadata.metric_parts, vec!["city".to_string()]);
    assert_eq!(report.rows.len(), 2);

    let mut cities = Vec::new();
    for row in &report.rows {
        let ReportRow::RawDump(row) = row else {
            panic!("expected raw dump rows");
        };
        assert_eq!(row.profile_values.len(), 1);
        let ValuePart::String(city) = &row.values[0] else {
            panic!("expected string values");
        };
        cities.push(city.clone());
    }
    cities.sort();
    assert_eq!(cities, vec!["delft", "utrecht"]);
}

#[tokio::test]
async fn observation_pages_concatenate_to_the_full_scan() {
    let harness = harness_at_day(DAY, false);

    // 2,500 observations across three day indices.
    for chunk in 0..25 {
        let day = DAY + chunk % 3;
        let batch: Vec<_> = (0..100)
            .map(|i| {
                let mut observation = city_observation("city", "board");
                observation.parts.insert(
                    "fruit".to_string(),
                    tally_wire::observation::ObservationPart {
                        encoding_config_id: NOOP_ENCODING,
                        value: tally_wire::observation::ObservationValue::Unencoded(
                            ValuePart::Int(i64::from(chunk * 100 + i)),
                        ),
                    },
                );
                observation
            })
            .collect();
        harness
            .observation_store
            .add_observation_batch(&metadata_for_day(day), &batch)
            .await
            .unwrap();
    }

    // One full scan in a single page.
    let full = harness
        .observation_store
        .query_observations(CUSTOMER, PROJECT, METRIC, 0, u32::MAX, &[], 5_000, "")
        .await
        .unwrap();
    assert_eq!(full.results.len(), 2_500);
    assert!(full.pagination_token.is_empty());

    // Page sizes of 1000 yield pages of 1000, 1000 and 500.
    let mut token = String::new();
    let mut sizes = Vec::new();
    loop {
        let page = harness
            .observation_store
            .query_observations(CUSTOMER, PROJECT, METRIC, 0, u32::MAX, &[], 1_000, &token)
            .await
            .unwrap();
        sizes.push(page.results.len());
        if page.pagination_token.is_empty() {
            break;
        }
        token = page.pagination_token;
    }
    assert_eq!(sizes, vec![1_000, 1_000, 500]);

    // Any page size yields the same multiset of observations.
    let mut expected: Vec<String> = full
        .results
        .iter()
        .map(|result| format!("{:?}|{:?}", result.day_index, result.observation.parts))
        .collect();
    expected.sort();
    for page_size in [1usize, 7, 333, 999, 2_500] {
        let mut collected = Vec::new();
        let mut token = String::new();
        loop {
            let page = harness
                .observation_store
                .query_observations(
                    CUSTOMER, PROJECT, METRIC, 0, u32::MAX, &[], page_size, &token,
                )
                .await
                .unwrap();
            collected.extend(
                page.results
                    .iter()
                    .map(|result| format!("{:?}|{:?}", result.day_index, result.observation.parts)),
            );
            if page.pagination_token.is_empty() {
                break;
            }
            token = page.pagination_token;
        }
        collected.sort();
        assert_eq!(collected, expected, "page size {page_size}");
    }
}

#[tokio::test]
async fn query_reports_streams_the_metadata() {
    use tokio_stream::StreamExt;

    let harness = harness_at_day(DAY, true);
    let metadata = metadata_for_day(DAY);
    for client in [1, 2] {
        harness
            .observation_store
            .add_observation(&metadata, &threshold_observation(THRESHOLD_ENCODING, "apple", client))
            .await
            .unwrap();
    }

    let response = harness
        .service
        .start_report(&start_request(HISTOGRAM_CONFIG, DAY, DAY))
        .await
        .unwrap();
    harness.executor.wait_until_idle().await;

    let mut stream = harness
        .service
        .query_reports(CUSTOMER, PROJECT, HISTOGRAM_CONFIG, 0, i64::MAX)
        .unwrap();
    let mut reports = Vec::new();
    while let Some(batch) = stream.next().await {
        reports.extend(batch.unwrap().reports);
    }
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].report_id, response.report_id);
    assert_eq!(reports[0].state, ReportState::CompletedSuccessfully);
}

#[tokio::test]
async fn unknown_config_is_not_found() {
    let harness = harness_at_day(DAY, true);
    let err = harness
        .service
        .start_report(&start_request(999, DAY, DAY))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        tally_analyzer::error::ReportError::NotFound(_)
    ));
}
