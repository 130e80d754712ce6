//! Data model for the tally analyzer.
//!
//! The types in this crate describe what flows through the analyzer half of
//! the pipeline: privacy-encoded observations arriving from the shuffler,
//! the configuration objects that tell us how to decode them, and the
//! reports that come out the other end. All of them are plain values; the
//! storage and scheduling machinery lives in `tally-analyzer`.

use serde::{Deserialize, Serialize};

pub use metric::{DataType, Metric, MetricPart};
pub use observation::{Observation, ObservationMetadata, ObservationPart, ValuePart};
pub use report::{ReportConfig, ReportId, ReportMetadata, ReportRow};

pub mod encoding;
pub mod metric;
pub mod observation;
pub mod registry;
pub mod report;
pub mod time;

/// Addresses one configured object (metric, encoding config or report
/// config) within the multi-tenant registry.
///
/// The triple is the unit of tenancy: store row keys embed it as a prefix so
/// that deleting by prefix purges exactly one config's data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigId {
    pub customer_id: u32,
    pub project_id: u32,
    pub id: u32,
}

impl ConfigId {
    pub fn new(customer_id: u32, project_id: u32, id: u32) -> Self {
        Self {
            customer_id,
            project_id,
            id,
        }
    }
}

impl std::fmt::Display for ConfigId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{},{})", self.customer_id, self.project_id, self.id)
    }
}
