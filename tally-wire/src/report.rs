//! Report configuration, report identifiers and report contents.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::observation::{SystemProfile, SystemProfileField, ValuePart};
use crate::time::{DayIndex, EpochType};

/// Declares one report to be generated on a schedule: which metric parts to
/// analyze, how to aggregate them over time and how long to keep absorbing
/// late observations.
#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    pub name: Option<String>,
    pub metric_id: u32,
    pub report_type: ReportType,
    /// One or two variables. Two-variable configs produce three reports per
    /// window: both marginals and the joint distribution.
    pub variables: Vec<ReportVariable>,
    #[serde(default)]
    pub aggregation_epoch_type: EpochType,
    /// Days after a report's window during which the scheduler keeps
    /// re-running the report to absorb late-arriving observations.
    #[serde(default)]
    pub report_finalization_days: u32,
    /// Profile fields projected into raw-dump rows.
    #[serde(default)]
    pub system_profile_fields: Vec<SystemProfileField>,
}

/// Points one report variable at a metric part, optionally with
/// per-encoding auxiliary data such as a candidate list.
#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportVariable {
    pub metric_part: String,
    pub candidates: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportType {
    #[default]
    Histogram,
    Joint,
    RawDump,
}

/// Which projection of a multi-variable report an instance covers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VariableSlice {
    #[default]
    Variable1,
    Variable2,
    Joint,
}

/// The full identity of one report instance.
///
/// `creation_time_seconds` and `instance_id` are allocated by the report
/// store when the report is born; until then an id is *incomplete* and the
/// executor refuses it. `sequence_num` distinguishes the members of a
/// dependency chain derived from one allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportId {
    pub customer_id: u32,
    pub project_id: u32,
    pub report_config_id: u32,
    pub creation_time_seconds: i64,
    pub instance_id: u32,
    pub variable_slice: VariableSlice,
    pub sequence_num: u32,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ReportIdError {
    #[error("report id string is not valid base64")]
    Base64,
    #[error("serialized report id has unexpected length {0}")]
    InvalidLength(usize),
    #[error("unknown variable slice tag {0}")]
    InvalidSlice(u8),
    #[error("malformed report row key")]
    MalformedRowKey,
}

impl ReportId {
    /// Length of the fixed-width binary serialization.
    pub const ENCODED_LEN: usize = 29;

    /// Length of the canonical row-key form produced by [`Display`].
    pub const ROW_KEY_LEN: usize = 69;

    /// An id is complete once the report store has allocated its creation
    /// time and instance id.
    pub fn is_complete(&self) -> bool {
        self.creation_time_seconds != 0 && self.instance_id != 0
    }

    /// The fixed-width binary serialization underlying the public string
    /// form: all numeric fields big-endian, one tag byte for the slice.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.customer_id.to_be_bytes());
        out[4..8].copy_from_slice(&self.project_id.to_be_bytes());
        out[8..12].copy_from_slice(&self.report_config_id.to_be_bytes());
        out[12..20].copy_from_slice(&self.creation_time_seconds.to_be_bytes());
        out[20..24].copy_from_slice(&self.instance_id.to_be_bytes());
        out[24] = match self.variable_slice {
            VariableSlice::Variable1 => 0,
            VariableSlice::Variable2 => 1,
            VariableSlice::Joint => 2,
        };
        out[25..29].copy_from_slice(&self.sequence_num.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReportIdError> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(ReportIdError::InvalidLength(bytes.len()));
        }
        let u32_at = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            u32::from_be_bytes(buf)
        };
        let mut seconds = [0u8; 8];
        seconds.copy_from_slice(&bytes[12..20]);
        let variable_slice = match bytes[24] {
            0 => VariableSlice::Variable1,
            1 => VariableSlice::Variable2,
            2 => VariableSlice::Joint,
            tag => return Err(ReportIdError::InvalidSlice(tag)),
        };
        Ok(ReportId {
            customer_id: u32_at(0),
            project_id: u32_at(4),
            report_config_id: u32_at(8),
            creation_time_seconds: i64::from_be_bytes(seconds),
            instance_id: u32_at(20),
            variable_slice,
            sequence_num: u32_at(25),
        })
    }

    /// The opaque string form handed to API clients. Round-trippable via
    /// [`ReportId::from_id_string`].
    pub fn to_id_string(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_bytes())
    }

    pub fn from_id_string(id_string: &str) -> Result<Self, ReportIdError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(id_string.as_bytes())
            .map_err(|_| ReportIdError::Base64)?;
        Self::from_bytes(&bytes)
    }

    /// Parses an id back out of a metadata row key. The row key does not
    /// carry the variable slice, so it is reconstructed from the sequence
    /// number by the chain-building convention (0, 1, 2).
    pub fn from_row_key(key: &str) -> Result<Self, ReportIdError> {
        if key.len() < Self::ROW_KEY_LEN {
            return Err(ReportIdError::MalformedRowKey);
        }
        let field = |range: std::ops::Range<usize>| {
            key.get(range)
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or(ReportIdError::MalformedRowKey)
        };
        let sequence_num = field(65..69)? as u32;
        Ok(ReportId {
            customer_id: field(0..10)? as u32,
            project_id: field(11..21)? as u32,
            report_config_id: field(22..32)? as u32,
            creation_time_seconds: field(33..53)? as i64,
            instance_id: field(54..64)? as u32,
            variable_slice: match sequence_num {
                1 => VariableSlice::Variable2,
                2 => VariableSlice::Joint,
                _ => VariableSlice::Variable1,
            },
            sequence_num,
        })
    }
}

/// The canonical 69-byte row-key form: five fixed-width zero-padded decimal
/// fields separated by colons. Also the form used in log messages.
impl std::fmt::Display for ReportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:010}:{:010}:{:010}:{:020}:{:010}:{:04}",
            self.customer_id,
            self.project_id,
            self.report_config_id,
            self.creation_time_seconds,
            self.instance_id,
            self.sequence_num
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportState {
    #[default]
    WaitingToStart,
    InProgress,
    CompletedSuccessfully,
    Terminated,
}

impl ReportState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReportState::CompletedSuccessfully | ReportState::Terminated
        )
    }
}

/// The per-report record kept in the metadata table. Created when the id is
/// allocated, mutated only by the executor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub state: ReportState,
    pub first_day_index: DayIndex,
    pub last_day_index: DayIndex,
    pub report_type: ReportType,
    /// Indices into the report config's variable list that this instance
    /// analyzes.
    pub variable_indices: Vec<u32>,
    /// True when the report was requested through the API rather than
    /// started by the scheduler.
    pub one_off: bool,
    pub start_time_seconds: i64,
    pub finish_time_seconds: i64,
    /// Append-only log of human-readable diagnostics.
    pub info_messages: Vec<InfoMessage>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoMessage {
    pub timestamp_seconds: i64,
    pub message: String,
}

/// One output row of a finished report, tagged by the report type it
/// belongs to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportRow {
    Histogram(HistogramRow),
    Joint(JointRow),
    RawDump(RawDumpRow),
}

impl ReportRow {
    /// The report type this row's payload belongs to. The report store
    /// refuses rows whose tag disagrees with the report's metadata.
    pub fn report_type(&self) -> ReportType {
        match self {
            ReportRow::Histogram(_) => ReportType::Histogram,
            ReportRow::Joint(_) => ReportType::Joint,
            ReportRow::RawDump(_) => ReportType::RawDump,
        }
    }
}

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramRow {
    pub value: ValuePart,
    pub count_estimate: f64,
    #[serde(default)]
    pub std_error: f64,
    pub system_profile: Option<SystemProfile>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JointRow {
    pub value: ValuePart,
    pub value2: ValuePart,
    pub count_estimate: f64,
    #[serde(default)]
    pub std_error: f64,
    pub system_profile: Option<SystemProfile>,
}

/// A projection of one unencoded observation: the selected system-profile
/// fields followed by the declared parts, in config order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDumpRow {
    pub profile_values: Vec<String>,
    pub values: Vec<ValuePart>,
}
