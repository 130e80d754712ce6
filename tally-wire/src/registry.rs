//! The immutable configuration snapshot handed to analyzer components.
//!
//! Registries are loaded once by the external config loader and shared
//! read-only; components never observe a config change mid-report.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::warn;

use crate::encoding::Encoding;
use crate::metric::Metric;
use crate::report::ReportConfig;
use crate::ConfigId;

/// A read-only snapshot of every registered metric, encoding config and
/// report config, addressable by id triple.
#[derive(Debug, Default)]
pub struct ProjectRegistry {
    metrics: HashMap<ConfigId, Metric>,
    encodings: HashMap<ConfigId, Encoding>,
    report_configs: HashMap<ConfigId, ReportConfig>,
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("failed to parse registry: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct RegistryFile {
    #[serde(default)]
    metrics: Vec<Registered<Metric>>,
    #[serde(default)]
    encodings: Vec<Registered<Encoding>>,
    #[serde(default)]
    report_configs: Vec<Registered<ReportConfig>>,
}

#[derive(Deserialize)]
struct Registered<T> {
    customer_id: u32,
    project_id: u32,
    id: u32,
    config: T,
}

impl ProjectRegistry {
    /// Parses a registry from its JSON file form. Later entries win over
    /// duplicated id triples, with a warning.
    pub fn from_json_str(input: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = serde_json::from_str(input)?;
        let mut registry = ProjectRegistry::default();
        for entry in file.metrics {
            let id = ConfigId::new(entry.customer_id, entry.project_id, entry.id);
            if registry.metrics.insert(id, entry.config).is_some() {
                warn!(%id, "duplicate metric registration, keeping the later entry");
            }
        }
        for entry in file.encodings {
            let id = ConfigId::new(entry.customer_id, entry.project_id, entry.id);
            if registry.encodings.insert(id, entry.config).is_some() {
                warn!(%id, "duplicate encoding registration, keeping the later entry");
            }
        }
        for entry in file.report_configs {
            let id = ConfigId::new(entry.customer_id, entry.project_id, entry.id);
            if registry.report_configs.insert(id, entry.config).is_some() {
                warn!(%id, "duplicate report config registration, keeping the later entry");
            }
        }
        Ok(registry)
    }

    pub fn add_metric(&mut self, id: ConfigId, metric: Metric) {
        self.metrics.insert(id, metric);
    }

    pub fn add_encoding(&mut self, id: ConfigId, encoding: Encoding) {
        self.encodings.insert(id, encoding);
    }

    pub fn add_report_config(&mut self, id: ConfigId, config: ReportConfig) {
        self.report_configs.insert(id, config);
    }

    pub fn metric(&self, customer_id: u32, project_id: u32, id: u32) -> Option<&Metric> {
        self.metrics.get(&ConfigId::new(customer_id, project_id, id))
    }

    pub fn encoding(&self, customer_id: u32, project_id: u32, id: u32) -> Option<&Encoding> {
        self.encodings
            .get(&ConfigId::new(customer_id, project_id, id))
    }

    pub fn report_config(&self, customer_id: u32, project_id: u32, id: u32) -> Option<&ReportConfig> {
        self.report_configs
            .get(&ConfigId::new(customer_id, project_id, id))
    }

    /// All registered report configs, in no particular order. The scheduler
    /// walks this on every tick.
    pub fn report_configs(&self) -> impl Iterator<Item = (&ConfigId, &ReportConfig)> {
        self.report_configs.iter()
    }
}
