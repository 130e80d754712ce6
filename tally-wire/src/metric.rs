//! Metric definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Declares the shape of the observations collected for one metric: a set
/// of named parts, each with a declared data type. An observation whose
/// parts do not match the declaration is malformed.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub description: Option<String>,
    pub parts: BTreeMap<String, MetricPart>,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricPart {
    pub description: Option<String>,
    #[serde(default)]
    pub data_type: DataType,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    #[default]
    String,
    Int,
    Double,
    Blob,
    Index,
}
