//! Encoding configs: the parameters of the privacy-preserving algorithm a
//! client used to encode an observation part.

use serde::{Deserialize, Serialize};

use crate::observation::{ObservationValue, ValuePart};
use crate::time::EpochType;

/// One registered decoding algorithm and its parameters. Observation parts
/// reference an encoding config by id; the discriminant of the part's value
/// must match the config's algorithm.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Threshold(ThresholdConfig),
    BasicRr(BasicRrConfig),
    StringRr(StringRrConfig),
    /// The identity encoding. Parts encoded this way carry their value in
    /// the clear and are only consumed by raw-dump reports.
    None,
}

impl Encoding {
    /// Whether an observation value claims to have been produced by this
    /// encoding. The analysis engine refuses mismatched parts.
    pub fn matches_value(&self, value: &ObservationValue) -> bool {
        matches!(
            (self, value),
            (Encoding::Threshold(_), ObservationValue::Threshold(_))
                | (Encoding::BasicRr(_), ObservationValue::BasicRr(_))
                | (Encoding::StringRr(_), ObservationValue::StringRr(_))
                | (Encoding::None, ObservationValue::Unencoded(_))
        )
    }
}

/// Threshold secret sharing: a value is recoverable only once a threshold
/// number of distinct clients contributed it within one epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub threshold: u32,
    /// Epoch over which contributions are pooled before decryption. The
    /// report window may span several epochs.
    #[serde(default)]
    pub epoch_type: EpochType,
}

/// Basic categorical randomized response over a fixed category list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BasicRrConfig {
    /// Probability that a zero bit is reported as one.
    pub prob_0_becomes_1: f64,
    /// Probability that a one bit is reported as one.
    pub prob_1_stays_1: f64,
    pub categories: Vec<ValuePart>,
}

/// String randomized response (bloom-filter based). Analysis is not yet
/// implemented; the config is registered so that mixed workloads can be
/// recognized and refused cleanly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StringRrConfig {
    pub num_bloom_bits: u32,
    pub num_hashes: u32,
    pub num_cohorts: u32,
    pub prob_0_becomes_1: f64,
    pub prob_1_stays_1: f64,
}
