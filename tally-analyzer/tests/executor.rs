//! Executor behavior: chain ordering, failure propagation, queue bounds
//! and the idle signal.

mod common;

use common::*;
use tally_analyzer::error::ReportError;
use tally_wire::report::{ReportId, ReportState, VariableSlice};

const DAY: u32 = 20_000;

fn complete_dummy_id(sequence: u32) -> ReportId {
    ReportId {
        customer_id: CUSTOMER,
        project_id: PROJECT,
        report_config_id: HISTOGRAM_CONFIG,
        creation_time_seconds: 1,
        instance_id: 1,
        variable_slice: VariableSlice::Variable1,
        sequence_num: sequence,
    }
}

#[tokio::test]
async fn empty_chains_are_invalid() {
    let harness = harness_at_day(DAY, true);
    let err = harness.executor.enqueue(Vec::new()).unwrap_err();
    assert!(matches!(err, ReportError::InvalidArgument(_)));
}

#[tokio::test]
async fn incomplete_ids_are_invalid() {
    let harness = harness_at_day(DAY, true);
    let mut id = complete_dummy_id(0);
    id.instance_id = 0;
    let err = harness.executor.enqueue(vec![id]).unwrap_err();
    assert!(matches!(err, ReportError::InvalidArgument(_)));
}

#[tokio::test]
async fn chain_failure_terminates_the_remaining_reports() {
    // Two-variable joint report: observations exist for the first variable
    // only, so the chain is [completed, terminated, terminated].
    let harness = harness_at_day(DAY, true);
    let metadata = metadata_for_day(DAY);
    for client in [1, 2] {
        harness
            .observation_store
            .add_observation(&metadata, &threshold_observation(THRESHOLD_ENCODING, "apple", client))
            .await
            .unwrap();
    }

    let request = tally_analyzer::service::StartReportRequest {
        customer_id: CUSTOMER,
        project_id: PROJECT,
        report_config_id: TWO_VAR_CONFIG,
        first_day_index: DAY,
        last_day_index: DAY,
    };
    let response = harness.service.start_report(&request).await.unwrap();
    harness.executor.wait_until_idle().await;

    let joint = harness.service.get_report(&response.report_id).await.unwrap();
    assert_eq!(joint.metadata.state, ReportState::Terminated);
    assert_eq!(joint.metadata.associated_report_ids.len(), 2);
    // The diagnostic names the upstream failure.
    assert!(joint
        .metadata
        .info_messages
        .iter()
        .any(|info| info.message.contains("earlier report in its dependency chain failed")));

    let var1 = harness
        .service
        .get_report(&joint.metadata.associated_report_ids[0])
        .await
        .unwrap();
    assert_eq!(var1.metadata.state, ReportState::CompletedSuccessfully);
    assert_eq!(var1.rows.len(), 1);

    // The second marginal had no valid observations.
    let var2 = harness
        .service
        .get_report(&joint.metadata.associated_report_ids[1])
        .await
        .unwrap();
    assert_eq!(var2.metadata.state, ReportState::Terminated);
    assert!(var2.rows.is_empty());
}

#[tokio::test]
async fn reports_within_a_chain_run_in_order() {
    let harness = harness_at_day(DAY, true);
    let metadata = metadata_for_day(DAY);
    for part in ["fruit", "color"] {
        for client in [1u32, 2] {
            let mut observation = threshold_observation(THRESHOLD_ENCODING, "apple", client);
            if part == "color" {
                let inner = observation.parts.remove("fruit").unwrap();
                observation.parts.insert("color".to_string(), inner);
            }
            harness
                .observation_store
                .add_observation(&metadata, &observation)
                .await
                .unwrap();
        }
    }

    let request = tally_analyzer::service::StartReportRequest {
        customer_id: CUSTOMER,
        project_id: PROJECT,
        report_config_id: TWO_VAR_CONFIG,
        first_day_index: DAY,
        last_day_index: DAY,
    };
    let response = harness.service.start_report(&request).await.unwrap();
    harness.executor.wait_until_idle().await;

    // Both marginals complete; the joint terminates because joint analysis
    // is not implemented.
    let joint = harness.service.get_report(&response.report_id).await.unwrap();
    assert_eq!(joint.metadata.state, ReportState::Terminated);
    assert!(joint
        .metadata
        .info_messages
        .iter()
        .any(|info| info.message.contains("JOINT")));

    for marginal_id in &joint.metadata.associated_report_ids {
        let marginal = harness.service.get_report(marginal_id).await.unwrap();
        assert_eq!(marginal.metadata.state, ReportState::CompletedSuccessfully);
    }

    // The marginals finished before the joint was ended.
    let var1 = harness
        .service
        .get_report(&joint.metadata.associated_report_ids[0])
        .await
        .unwrap();
    assert!(
        var1.metadata.finish_time_seconds.unwrap()
            <= joint.metadata.finish_time_seconds.unwrap()
    );
}

#[tokio::test]
async fn queue_overflow_is_aborted_until_the_worker_drains() {
    // Worker not started: the queue only fills.
    let harness = harness_at_day(DAY, false);

    for sequence in 0..50_000u32 {
        harness
            .executor
            .enqueue(vec![complete_dummy_id(sequence % 4)])
            .unwrap();
    }
    let err = harness
        .executor
        .enqueue(vec![complete_dummy_id(0)])
        .unwrap_err();
    assert!(matches!(err, ReportError::Aborted(_)));

    // Once the worker drains the queue, enqueues are accepted again. The
    // dummy ids do not exist in the store, so every chain fails fast.
    harness.executor.start();
    harness.executor.wait_until_idle().await;
    harness
        .executor
        .enqueue(vec![complete_dummy_id(0)])
        .unwrap();
}

#[tokio::test]
async fn wait_until_idle_observes_a_drained_queue() {
    let harness = harness_at_day(DAY, true);
    let metadata = metadata_for_day(DAY);
    for client in [1, 2] {
        harness
            .observation_store
            .add_observation(&metadata, &threshold_observation(THRESHOLD_ENCODING, "apple", client))
            .await
            .unwrap();
    }

    let request = tally_analyzer::service::StartReportRequest {
        customer_id: CUSTOMER,
        project_id: PROJECT,
        report_config_id: HISTOGRAM_CONFIG,
        first_day_index: DAY,
        last_day_index: DAY,
    };
    let response = harness.service.start_report(&request).await.unwrap();
    harness.executor.wait_until_idle().await;

    // Idle means the enqueued report reached a terminal state.
    let report = harness.service.get_report(&response.report_id).await.unwrap();
    assert!(report.metadata.state == ReportState::CompletedSuccessfully);
}

#[tokio::test]
async fn enqueue_after_shutdown_is_aborted() {
    let harness = harness_at_day(DAY, true);
    harness.executor.shutdown().await;
    let err = harness
        .executor
        .enqueue(vec![complete_dummy_id(0)])
        .unwrap_err();
    assert!(matches!(err, ReportError::Aborted(_)));
}
