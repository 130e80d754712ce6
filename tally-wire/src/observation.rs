//! Observations as they arrive from the shuffler.
//!
//! An observation is one privacy-encoded record from one client for one
//! metric on one day. It carries a bag of named *parts*, each encoded under
//! an encoding config referenced by id. Observations are immutable once
//! persisted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::metric::DataType;
use crate::time::DayIndex;

/// The addressing metadata common to a batch of observations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationMetadata {
    pub customer_id: u32,
    pub project_id: u32,
    pub metric_id: u32,
    pub day_index: DayIndex,
}

/// One encoded record. The keys of `parts` are metric part names.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub parts: BTreeMap<String, ObservationPart>,
    /// Describes the client system the observation was taken on. Optional
    /// because old clients do not send one.
    pub system_profile: Option<SystemProfile>,
}

/// One named slot of an observation, encoded under one encoding config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservationPart {
    pub encoding_config_id: u32,
    pub value: ObservationValue,
}

/// The encoded payload of an observation part. The discriminant must match
/// the algorithm of the referenced encoding config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationValue {
    Threshold(ThresholdObservation),
    BasicRr(BasicRrObservation),
    StringRr(StringRrObservation),
    /// A value that was not privacy-encoded at all. Only raw-dump reports
    /// consume these.
    Unencoded(ValuePart),
}

/// One contribution to a threshold-decryption group.
///
/// Clients encrypting the same value in the same epoch produce the same
/// `ciphertext`; each client contributes a distinct share point. The
/// decrypter can recover the plaintext once it holds a threshold number of
/// distinct points.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdObservation {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    pub point_x: u32,
    #[serde(with = "base64_bytes")]
    pub point_y: Vec<u8>,
}

/// A randomized-response bit vector, one bit per category, least
/// significant bit first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicRrObservation {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// A string randomized-response bloom filter. Analysis of these is not yet
/// implemented.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringRrObservation {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub cohort: u32,
}

/// A single typed value, used both for unencoded observation parts and for
/// the values of report rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValuePart {
    String(String),
    Int(i64),
    Double(f64),
    Blob(#[serde(with = "base64_bytes")] Vec<u8>),
    /// An index into a category list declared by the report config.
    Index(u32),
}

impl ValuePart {
    pub fn data_type(&self) -> DataType {
        match self {
            ValuePart::String(_) => DataType::String,
            ValuePart::Int(_) => DataType::Int,
            ValuePart::Double(_) => DataType::Double,
            ValuePart::Blob(_) => DataType::Blob,
            ValuePart::Index(_) => DataType::Index,
        }
    }
}

/// Describes the client system an observation was taken on. Observations
/// are grouped by profile during analysis so that reports can be broken
/// down per system.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemProfile {
    pub os: OperatingSystem,
    pub arch: CpuArch,
    pub board_name: String,
    pub product_name: String,
}

impl SystemProfile {
    /// A stable string form used to group observations by profile.
    pub fn fingerprint(&self) -> String {
        format!(
            "{:?}|{:?}|{}|{}",
            self.os, self.arch, self.board_name, self.product_name
        )
    }

    /// The value of one profile field, as dumped into raw-dump report rows.
    pub fn field_value(&self, field: SystemProfileField) -> String {
        match field {
            SystemProfileField::Os => format!("{:?}", self.os),
            SystemProfileField::Arch => format!("{:?}", self.arch),
            SystemProfileField::BoardName => self.board_name.clone(),
            SystemProfileField::ProductName => self.product_name.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingSystem {
    #[default]
    Unknown,
    Linux,
    MacOs,
    Windows,
    Embedded,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CpuArch {
    #[default]
    Unknown,
    X86_64,
    Arm64,
}

/// The profile fields a report config may select for inclusion in raw-dump
/// rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemProfileField {
    Os,
    Arch,
    BoardName,
    ProductName,
}

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_part_round_trips_through_json() {
        let part = ObservationPart {
            encoding_config_id: 7,
            value: ObservationValue::Threshold(ThresholdObservation {
                ciphertext: b"opaque".to_vec(),
                point_x: 3,
                point_y: vec![1, 2, 3],
            }),
        };
        let json = serde_json::to_vec(&part).unwrap();
        assert_eq!(serde_json::from_slice::<ObservationPart>(&json).unwrap(), part);
    }

    #[test]
    fn fingerprint_distinguishes_profiles() {
        let a = SystemProfile {
            os: OperatingSystem::Linux,
            board_name: "a".into(),
            ..Default::default()
        };
        let b = SystemProfile {
            os: OperatingSystem::Linux,
            board_name: "b".into(),
            ..Default::default()
        };
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
    }

    #[test]
    fn value_part_reports_its_data_type() {
        assert_eq!(ValuePart::String("x".into()).data_type(), DataType::String);
        assert_eq!(ValuePart::Index(4).data_type(), DataType::Index);
        assert_eq!(ValuePart::Blob(vec![0]).data_type(), DataType::Blob);
    }
}
