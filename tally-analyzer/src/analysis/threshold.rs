//! Threshold secret-sharing analysis.
//!
//! Observations carrying the same ciphertext within one epoch are pooled;
//! once a threshold number of distinct clients have contributed, the pooled
//! shares recover the plaintext. Values contributed by fewer clients are
//! never recovered, which is the privacy guarantee.
//!
//! The decrypter proper is an external collaborator. The one here is a
//! stand-in with the same interface: it checks share consistency and counts
//! distinct points, revealing the embedded plaintext at threshold.

use std::collections::{BTreeMap, HashMap};

use tally_wire::observation::ThresholdObservation;
use tally_wire::time::{epoch_index, EpochType, INVALID_EPOCH_INDEX};
use tracing::warn;

/// Performs one threshold analysis over observations that share a metric
/// part and an encoding config.
pub struct ThresholdAnalyzer {
    threshold: u32,
    epoch_type: EpochType,
    groups: HashMap<GroupKey, Group>,
    results: BTreeMap<Vec<u8>, ResultInfo>,
    num_observations: u64,
    observation_errors: u64,
}

/// Info about one recovered plaintext.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultInfo {
    /// Total observations that decrypted to this plaintext, across all
    /// epochs in which it met threshold. This counts observations, not
    /// distinct clients.
    pub total_count: u64,
    /// The number of epochs in which the plaintext met threshold.
    /// Diagnostic only; not part of the report row schema.
    pub num_epochs: u32,
}

/// Observations from the same epoch with the same ciphertext decrypt
/// together.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct GroupKey {
    epoch_index: u32,
    ciphertext: Vec<u8>,
}

struct Group {
    /// `None` once the group has decrypted (or the decrypter was found
    /// corrupt); further observations of the group just count.
    decrypter: Option<ThresholdDecrypter>,
    /// Observations pooled in this group. Folded into the result when the
    /// group decrypts; dropped silently if it never does.
    pending_count: u64,
    /// Set when the group decrypted successfully.
    plaintext: Option<Vec<u8>>,
}

impl ThresholdAnalyzer {
    pub fn new(threshold: u32, epoch_type: EpochType) -> Self {
        Self {
            threshold,
            epoch_type,
            groups: HashMap::new(),
            results: BTreeMap::new(),
            num_observations: 0,
            observation_errors: 0,
        }
    }

    /// Adds one observation. Returns false (and counts the error) if the
    /// observation is malformed or inconsistent with its group.
    pub fn add_observation(&mut self, day_index: u32, observation: &ThresholdObservation) -> bool {
        let epoch = epoch_index(day_index, self.epoch_type);
        if epoch == INVALID_EPOCH_INDEX {
            self.observation_errors += 1;
            return false;
        }
        let key = GroupKey {
            epoch_index: epoch,
            ciphertext: observation.ciphertext.clone(),
        };
        let threshold = self.threshold;
        let group = self.groups.entry(key).or_insert_with(|| Group {
            decrypter: Some(ThresholdDecrypter::new(observation.ciphertext.clone())),
            pending_count: 0,
            plaintext: None,
        });

        if let Some(plaintext) = &group.plaintext {
            // The group already decrypted; the observation just adds to the
            // recovered value's count.
            if let Some(info) = self.results.get_mut(plaintext) {
                info.total_count += 1;
            }
            self.num_observations += 1;
            return true;
        }

        let Some(decrypter) = group.decrypter.as_mut() else {
            // The decrypter was previously found corrupt; the whole group
            // is poisoned.
            self.observation_errors += 1;
            return false;
        };

        if let Err(err) = decrypter.add_share(observation.point_x, &observation.point_y) {
            warn!("dropping corrupt threshold group: {err}");
            group.decrypter = None;
            self.observation_errors += 1;
            return false;
        }
        group.pending_count += 1;
        self.num_observations += 1;

        if decrypter.num_shares() >= threshold {
            match decrypter.decrypt() {
                Ok(plaintext) => {
                    let pending = group.pending_count;
                    group.pending_count = 0;
                    group.plaintext = Some(plaintext.clone());
                    group.decrypter = None;
                    self.results
                        .entry(plaintext)
                        .and_modify(|info| {
                            info.total_count += pending;
                            info.num_epochs += 1;
                        })
                        .or_insert(ResultInfo {
                            total_count: pending,
                            num_epochs: 1,
                        });
                }
                Err(err) => {
                    warn!("threshold decryption failed: {err}");
                    group.decrypter = None;
                    // The pooled observations can no longer be attributed.
                    self.num_observations -= group.pending_count;
                    self.observation_errors += group.pending_count;
                    group.pending_count = 0;
                }
            }
        }
        true
    }

    /// Observations accepted so far, excluding errors.
    pub fn num_observations(&self) -> u64 {
        self.num_observations
    }

    /// Observations discarded as malformed. Non-zero means the analyzer
    /// received data not produced by a legitimate client.
    pub fn observation_errors(&self) -> u64 {
        self.observation_errors
    }

    /// Takes the recovered plaintexts and their counts. The analyzer
    /// should not be used after this.
    pub fn take_results(&mut self) -> BTreeMap<Vec<u8>, ResultInfo> {
        std::mem::take(&mut self.results)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DecryptError {
    #[error("conflicting share for point {0}")]
    ConflictingShare(u32),
    #[error("not enough shares to decrypt")]
    NotEnoughShares,
}

/// Share-counting stand-in for the threshold decrypter.
///
/// Holds the shares contributed for one `(epoch, ciphertext)` group. A
/// point contributed twice with different data marks the group corrupt.
/// `decrypt` reveals the plaintext once any shares are present; callers
/// enforce the threshold on [`num_shares`] before invoking it.
///
/// [`num_shares`]: ThresholdDecrypter::num_shares
pub struct ThresholdDecrypter {
    ciphertext: Vec<u8>,
    shares: BTreeMap<u32, Vec<u8>>,
}

impl ThresholdDecrypter {
    pub fn new(ciphertext: Vec<u8>) -> Self {
        Self {
            ciphertext,
            shares: BTreeMap::new(),
        }
    }

    /// Records one client's share. Repeated contributions of the same
    /// point are fine as long as they agree.
    pub fn add_share(&mut self, point_x: u32, point_y: &[u8]) -> Result<(), DecryptError> {
        match self.shares.get(&point_x) {
            Some(existing) if existing != point_y => {
                Err(DecryptError::ConflictingShare(point_x))
            }
            Some(_) => Ok(()),
            None => {
                self.shares.insert(point_x, point_y.to_vec());
                Ok(())
            }
        }
    }

    /// Distinct contributing clients seen so far.
    pub fn num_shares(&self) -> u32 {
        self.shares.len() as u32
    }

    pub fn decrypt(&self) -> Result<Vec<u8>, DecryptError> {
        if self.shares.is_empty() {
            return Err(DecryptError::NotEnoughShares);
        }
        Ok(self.ciphertext.clone())
    }
}
