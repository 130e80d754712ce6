//! The per-report decoder multiplexer.
//!
//! Observations are allowed to be heterogeneous with respect to their
//! encoding. The engine groups them by system profile and encoding config,
//! applies the right decoder to each group, and combines the results into
//! one histogram. An instance is used exactly once, for one report.

use std::collections::BTreeMap;
use std::sync::Arc;

use tally_wire::encoding::Encoding;
use tally_wire::observation::{ObservationPart, ObservationValue, SystemProfile, ValuePart};
use tally_wire::registry::ProjectRegistry;
use tally_wire::report::{HistogramRow, ReportId, ReportRow};
use tally_wire::time::EpochType;
use tracing::{debug, error, warn};

use super::{BasicRrAnalyzer, ThresholdAnalyzer};
use crate::error::ReportError;

/// Uniform interface over the per-algorithm analyzers. A sum type rather
/// than a trait object: the set of algorithms is closed and each variant
/// carries its own accumulation state.
pub enum DecoderAdapter {
    Threshold(ThresholdAnalyzer),
    BasicRr(BasicRrAnalyzer),
    /// String randomized response is not yet implemented.
    StringRr,
}

impl DecoderAdapter {
    /// Feeds one part to the underlying analyzer. Returns whether the
    /// input was well-formed and accepted.
    pub fn process_observation_part(&mut self, day_index: u32, part: &ObservationPart) -> bool {
        match (self, &part.value) {
            (DecoderAdapter::Threshold(analyzer), ObservationValue::Threshold(observation)) => {
                analyzer.add_observation(day_index, observation)
            }
            (DecoderAdapter::BasicRr(analyzer), ObservationValue::BasicRr(observation)) => {
                analyzer.add_observation(observation)
            }
            (DecoderAdapter::StringRr, _) => false,
            _ => false,
        }
    }

    /// Finalizes and returns the aggregated histogram rows.
    pub fn perform_analysis(&mut self) -> Result<Vec<ReportRow>, ReportError> {
        match self {
            DecoderAdapter::Threshold(analyzer) => {
                let errors = analyzer.observation_errors();
                if errors > 0 {
                    warn!(errors, "threshold analysis discarded malformed observations");
                }
                let rows = analyzer
                    .take_results()
                    .into_iter()
                    .filter_map(|(plaintext, info)| {
                        let value: ValuePart = match serde_json::from_slice(&plaintext) {
                            Ok(value) => value,
                            Err(err) => {
                                error!("recovered plaintext is not a value part: {err}");
                                return None;
                            }
                        };
                        debug!(num_epochs = info.num_epochs, "recovered threshold value");
                        Some(ReportRow::Histogram(HistogramRow {
                            value,
                            count_estimate: info.total_count as f64,
                            std_error: 0.0,
                            system_profile: None,
                        }))
                    })
                    .collect();
                Ok(rows)
            }
            DecoderAdapter::BasicRr(analyzer) => {
                let errors = analyzer.observation_errors();
                if errors > 0 {
                    warn!(errors, "randomized-response analysis discarded malformed observations");
                }
                Ok(analyzer
                    .analyze()
                    .into_iter()
                    .map(|result| {
                        ReportRow::Histogram(HistogramRow {
                            value: result.category,
                            count_estimate: result.count_estimate,
                            std_error: result.std_error,
                            system_profile: None,
                        })
                    })
                    .collect())
            }
            DecoderAdapter::StringRr => Err(ReportError::Unimplemented(
                "string randomized-response analysis is not yet implemented".to_string(),
            )),
        }
    }
}

/// Observations sharing a system profile analyze together; their rows are
/// attributed to that profile.
struct DecoderGroup {
    profile: Option<SystemProfile>,
    /// Keyed by encoding-config id.
    decoders: BTreeMap<u32, DecoderAdapter>,
}

pub struct HistogramAnalysisEngine {
    report_id: ReportId,
    epoch_type: EpochType,
    registry: Arc<ProjectRegistry>,
    /// Keyed by profile fingerprint.
    groups: BTreeMap<String, DecoderGroup>,
}

impl HistogramAnalysisEngine {
    /// Constructs the engine for one histogram report. `epoch_type` is the
    /// report config's aggregation epoch, used to pool threshold
    /// contributions.
    pub fn new(report_id: ReportId, epoch_type: EpochType, registry: Arc<ProjectRegistry>) -> Self {
        Self {
            report_id,
            epoch_type,
            registry,
            groups: BTreeMap::new(),
        }
    }

    /// Processes one (day index, part, profile) triple. Returns true if
    /// the part was accepted by its decoder.
    pub fn process_observation_part(
        &mut self,
        day_index: u32,
        part: &ObservationPart,
        profile: Option<&SystemProfile>,
    ) -> bool {
        let Some(encoding) = self.registry.encoding(
            self.report_id.customer_id,
            self.report_id.project_id,
            part.encoding_config_id,
        ) else {
            error!(
                report_id = %self.report_id,
                encoding_config_id = part.encoding_config_id,
                "observation part references an unknown encoding config"
            );
            return false;
        };

        // The engine never conflates encodings: a part claiming one
        // algorithm but referencing a config for another is rejected.
        if !encoding.matches_value(&part.value) {
            error!(
                report_id = %self.report_id,
                encoding_config_id = part.encoding_config_id,
                "observation part value does not match its encoding config"
            );
            return false;
        }

        let fingerprint = profile.map(SystemProfile::fingerprint).unwrap_or_default();
        let group = self
            .groups
            .entry(fingerprint)
            .or_insert_with(|| DecoderGroup {
                profile: profile.cloned(),
                decoders: BTreeMap::new(),
            });

        let decoder = match group.decoders.entry(part.encoding_config_id) {
            std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::btree_map::Entry::Vacant(entry) => {
                match new_decoder(encoding, self.epoch_type) {
                    Some(decoder) => entry.insert(decoder),
                    None => {
                        error!(
                            report_id = %self.report_id,
                            encoding_config_id = part.encoding_config_id,
                            "no histogram decoder for this encoding config"
                        );
                        return false;
                    }
                }
            }
        };

        decoder.process_observation_part(day_index, part)
    }

    /// Performs the analyses and combines the rows.
    ///
    /// Heterogeneous groups are not supported yet: if more than one
    /// encoding-config id was observed within a profile group the whole
    /// report fails with `Unimplemented`, naming the conflicting ids.
    /// Having seen no valid observation at all is `FailedPrecondition`.
    pub fn perform_analysis(&mut self) -> Result<Vec<ReportRow>, ReportError> {
        if self.groups.values().all(|group| group.decoders.is_empty()) {
            let message = format!(
                "analysis failed, no valid observations were added, report_id={}",
                self.report_id
            );
            error!("{message}");
            return Err(ReportError::FailedPrecondition(message));
        }

        let mut rows = Vec::new();
        for group in self.groups.values_mut() {
            if group.decoders.len() > 1 {
                let ids = group
                    .decoders
                    .keys()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                let message = format!(
                    "analysis aborted because more than one encoding_config_id was found \
                     among the observations: {ids}; heterogeneous reports are not supported, \
                     report_id={}",
                    self.report_id
                );
                error!("{message}");
                return Err(ReportError::Unimplemented(message));
            }
            for decoder in group.decoders.values_mut() {
                let mut group_rows = decoder.perform_analysis()?;
                if let Some(profile) = &group.profile {
                    for row in &mut group_rows {
                        match row {
                            ReportRow::Histogram(row) => {
                                row.system_profile = Some(profile.clone())
                            }
                            ReportRow::Joint(row) => row.system_profile = Some(profile.clone()),
                            ReportRow::RawDump(_) => {}
                        }
                    }
                }
                rows.append(&mut group_rows);
            }
        }
        Ok(rows)
    }
}

fn new_decoder(encoding: &Encoding, epoch_type: EpochType) -> Option<DecoderAdapter> {
    match encoding {
        Encoding::Threshold(config) => Some(DecoderAdapter::Threshold(ThresholdAnalyzer::new(
            config.threshold,
            epoch_type,
        ))),
        Encoding::BasicRr(config) => match BasicRrAnalyzer::new(config.clone()) {
            Ok(analyzer) => Some(DecoderAdapter::BasicRr(analyzer)),
            Err(err) => {
                error!("rejecting invalid randomized-response config: {err}");
                None
            }
        },
        Encoding::StringRr(_) => Some(DecoderAdapter::StringRr),
        // Unencoded parts carry no histogram signal.
        Encoding::None => None,
    }
}
