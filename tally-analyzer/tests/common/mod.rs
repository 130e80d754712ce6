//! Shared fixtures for the integration tests: a fully wired analyzer over
//! the in-memory store, a fake clock, and observation builders.

// Each integration test binary uses a different slice of these fixtures.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use tally_analyzer::clock::Clock;
use tally_analyzer::executor::ReportExecutor;
use tally_analyzer::generator::ReportGenerator;
use tally_analyzer::service::ReportService;
use tally_analyzer::store::{MemoryStore, ObservationStore, ReportStore};
use tally_wire::encoding::{BasicRrConfig, Encoding, ThresholdConfig};
use tally_wire::metric::{DataType, Metric, MetricPart};
use tally_wire::observation::{
    BasicRrObservation, Observation, ObservationMetadata, ObservationPart, ObservationValue,
    SystemProfile, SystemProfileField, ThresholdObservation, ValuePart,
};
use tally_wire::registry::ProjectRegistry;
use tally_wire::report::{ReportConfig, ReportType, ReportVariable};
use tally_wire::time::EpochType;
use tally_wire::ConfigId;

pub const CUSTOMER: u32 = 1;
pub const PROJECT: u32 = 1;
pub const METRIC: u32 = 1;

pub const THRESHOLD_ENCODING: u32 = 10;
pub const BASIC_RR_ENCODING: u32 = 11;
pub const SECOND_THRESHOLD_ENCODING: u32 = 12;
pub const NOOP_ENCODING: u32 = 13;

pub const HISTOGRAM_CONFIG: u32 = 20;
pub const TWO_VAR_CONFIG: u32 = 21;
pub const RAW_DUMP_CONFIG: u32 = 22;
pub const BASIC_RR_HISTOGRAM_CONFIG: u32 = 23;

pub const RR_PROB_0_BECOMES_1: f64 = 0.25;
pub const RR_PROB_1_STAYS_1: f64 = 0.75;
pub const RR_CATEGORIES: usize = 3;

/// A settable clock so tests control "today".
pub struct TestClock {
    seconds: Mutex<i64>,
}

impl TestClock {
    pub fn at_day(day_index: u32) -> Arc<Self> {
        Arc::new(Self {
            seconds: Mutex::new(i64::from(day_index) * 86_400 + 3_600),
        })
    }

    pub fn set_day(&self, day_index: u32) {
        *self.seconds.lock().unwrap() = i64::from(day_index) * 86_400 + 3_600;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(*self.seconds.lock().unwrap(), 0).unwrap()
    }
}

pub struct Harness {
    pub registry: Arc<ProjectRegistry>,
    pub observation_store: Arc<ObservationStore>,
    pub report_store: Arc<ReportStore>,
    pub executor: Arc<ReportExecutor>,
    pub service: Arc<ReportService>,
    pub clock: Arc<TestClock>,
}

pub fn registry() -> ProjectRegistry {
    let mut registry = ProjectRegistry::default();

    let mut metric = Metric {
        name: "daily_fruit".to_string(),
        ..Default::default()
    };
    for part in ["fruit", "color", "city"] {
        metric.parts.insert(
            part.to_string(),
            MetricPart {
                description: None,
                data_type: DataType::String,
            },
        );
    }
    registry.add_metric(ConfigId::new(CUSTOMER, PROJECT, METRIC), metric);

    for encoding_id in [THRESHOLD_ENCODING, SECOND_THRESHOLD_ENCODING] {
        registry.add_encoding(
            ConfigId::new(CUSTOMER, PROJECT, encoding_id),
            Encoding::Threshold(ThresholdConfig {
                threshold: 2,
                epoch_type: EpochType::Day,
            }),
        );
    }
    registry.add_encoding(
        ConfigId::new(CUSTOMER, PROJECT, BASIC_RR_ENCODING),
        Encoding::BasicRr(BasicRrConfig {
            prob_0_becomes_1: RR_PROB_0_BECOMES_1,
            prob_1_stays_1: RR_PROB_1_STAYS_1,
            categories: (0..RR_CATEGORIES)
                .map(|index| ValuePart::Index(index as u32))
                .collect(),
        }),
    );
    registry.add_encoding(ConfigId::new(CUSTOMER, PROJECT, NOOP_ENCODING), Encoding::None);

    registry.add_report_config(
        ConfigId::new(CUSTOMER, PROJECT, HISTOGRAM_CONFIG),
        ReportConfig {
            name: Some("fruit_histogram".to_string()),
            metric_id: METRIC,
            report_type: ReportType::Histogram,
            variables: vec![ReportVariable {
                metric_part: "fruit".to_string(),
                candidates: None,
            }],
            aggregation_epoch_type: EpochType::Day,
            report_finalization_days: 3,
            system_profile_fields: Vec::new(),
        },
    );
    registry.add_report_config(
        ConfigId::new(CUSTOMER, PROJECT, BASIC_RR_HISTOGRAM_CONFIG),
        ReportConfig {
            name: Some("fruit_rr_histogram".to_string()),
            metric_id: METRIC,
            report_type: ReportType::Histogram,
            variables: vec![ReportVariable {
                metric_part: "fruit".to_string(),
                candidates: None,
            }],
            aggregation_epoch_type: EpochType::Day,
            report_finalization_days: 3,
            system_profile_fields: Vec::new(),
        },
    );
    registry.add_report_config(
        ConfigId::new(CUSTOMER, PROJECT, TWO_VAR_CONFIG),
        ReportConfig {
            name: Some("fruit_by_color".to_string()),
            metric_id: METRIC,
            report_type: ReportType::Histogram,
            variables: vec![
                ReportVariable {
                    metric_part: "fruit".to_string(),
                    candidates: None,
                },
                ReportVariable {
                    metric_part: "color".to_string(),
                    candidates: None,
                },
            ],
            aggregation_epoch_type: EpochType::Day,
            report_finalization_days: 3,
            system_profile_fields: Vec::new(),
        },
    );
    registry.add_report_config(
        ConfigId::new(CUSTOMER, PROJECT, RAW_DUMP_CONFIG),
        ReportConfig {
            name: Some("city_dump".to_string()),
            metric_id: METRIC,
            report_type: ReportType::RawDump,
            variables: vec![ReportVariable {
                metric_part: "city".to_string(),
                candidates: None,
            }],
            aggregation_epoch_type: EpochType::Day,
            report_finalization_days: 3,
            system_profile_fields: vec![SystemProfileField::BoardName],
        },
    );

    registry
}

/// Wires the whole analyzer over a fresh in-memory store. The executor
/// worker is started only when `start_executor` is set, so tests can keep
/// reports pinned in flight.
pub fn harness_at_day(day_index: u32, start_executor: bool) -> Harness {
    let registry = Arc::new(registry());
    let clock = TestClock::at_day(day_index);
    let data_store = Arc::new(MemoryStore::new());
    let observation_store = Arc::new(ObservationStore::new(data_store.clone()));
    let report_store = Arc::new(ReportStore::new(data_store, clock.clone()));

    let generator = ReportGenerator::new(
        Arc::clone(&registry),
        Arc::clone(&observation_store),
        Arc::clone(&report_store),
    );
    let executor = Arc::new(ReportExecutor::new(Arc::clone(&report_store), generator));
    if start_executor {
        executor.start();
    }

    let service = Arc::new(ReportService::new(
        Arc::clone(&registry),
        Arc::clone(&report_store),
        Arc::clone(&executor),
    ));

    Harness {
        registry,
        observation_store,
        report_store,
        executor,
        service,
        clock,
    }
}

pub fn metadata_for_day(day_index: u32) -> ObservationMetadata {
    ObservationMetadata {
        customer_id: CUSTOMER,
        project_id: PROJECT,
        metric_id: METRIC,
        day_index,
    }
}

/// A threshold observation for the "fruit" part. Clients encrypting the
/// same value produce the same ciphertext; the share point identifies the
/// client.
pub fn threshold_observation(encoding_config_id: u32, value: &str, client: u32) -> Observation {
    let ciphertext = serde_json::to_vec(&ValuePart::String(value.to_string())).unwrap();
    let mut observation = Observation::default();
    observation.parts.insert(
        "fruit".to_string(),
        ObservationPart {
            encoding_config_id,
            value: ObservationValue::Threshold(ThresholdObservation {
                ciphertext,
                point_x: client,
                point_y: vec![client as u8],
            }),
        },
    );
    observation
}

/// A basic randomized-response bit vector for the "fruit" part.
pub fn basic_rr_observation(data: Vec<u8>) -> Observation {
    let mut observation = Observation::default();
    observation.parts.insert(
        "fruit".to_string(),
        ObservationPart {
            encoding_config_id: BASIC_RR_ENCODING,
            value: ObservationValue::BasicRr(BasicRrObservation { data }),
        },
    );
    observation
}

/// An unencoded observation for the "city" part, as consumed by raw-dump
/// reports.
pub fn city_observation(city: &str, board: &str) -> Observation {
    let mut observation = Observation {
        system_profile: Some(SystemProfile {
            board_name: board.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };
    observation.parts.insert(
        "city".to_string(),
        ObservationPart {
            encoding_config_id: NOOP_ENCODING,
            value: ObservationValue::Unencoded(ValuePart::String(city.to_string())),
        },
    );
    observation
}
