//! Basic categorical randomized-response analysis.
//!
//! Each observation is a bit vector with one bit per category, where every
//! bit was flipped by the client with known probabilities. Accumulating the
//! noisy bits and inverting the flip probabilities yields an unbiased
//! per-category count estimate.

use tally_wire::encoding::BasicRrConfig;
use tally_wire::observation::{BasicRrObservation, ValuePart};

#[derive(Debug)]
pub struct BasicRrAnalyzer {
    config: BasicRrConfig,
    /// Raw (noisy) count of set bits per category.
    counts: Vec<u64>,
    num_observations: u64,
    observation_errors: u64,
}

/// One category's decoded estimate.
#[derive(Clone, Debug, PartialEq)]
pub struct CategoryResult {
    pub category: ValuePart,
    pub count_estimate: f64,
    pub std_error: f64,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum BasicRrConfigError {
    #[error("a randomized-response config needs at least two categories")]
    TooFewCategories,
    #[error("flip probabilities must satisfy 0 <= p < q <= 1, got p={p} q={q}")]
    InvalidProbabilities { p: f64, q: f64 },
}

impl BasicRrAnalyzer {
    pub fn new(config: BasicRrConfig) -> Result<Self, BasicRrConfigError> {
        if config.categories.len() < 2 {
            return Err(BasicRrConfigError::TooFewCategories);
        }
        let (p, q) = (config.prob_0_becomes_1, config.prob_1_stays_1);
        if !(0.0..1.0).contains(&p) || !(p..=1.0).contains(&q) || p >= q {
            return Err(BasicRrConfigError::InvalidProbabilities { p, q });
        }
        let counts = vec![0; config.categories.len()];
        Ok(Self {
            config,
            counts,
            num_observations: 0,
            observation_errors: 0,
        })
    }

    /// Adds one noisy bit vector. Returns false (and counts the error) if
    /// the vector's length does not cover the category list.
    pub fn add_observation(&mut self, observation: &BasicRrObservation) -> bool {
        let needed_bytes = (self.counts.len() + 7) / 8;
        if observation.data.len() != needed_bytes {
            self.observation_errors += 1;
            return false;
        }
        for (index, count) in self.counts.iter_mut().enumerate() {
            if observation.data[index / 8] >> (index % 8) & 1 == 1 {
                *count += 1;
            }
        }
        self.num_observations += 1;
        true
    }

    pub fn num_observations(&self) -> u64 {
        self.num_observations
    }

    pub fn observation_errors(&self) -> u64 {
        self.observation_errors
    }

    /// Inverts the randomization. With flip probabilities p (zero reported
    /// as one) and q (one reported as one), a raw count c over n
    /// observations estimates the true count as `(c - p*n) / (q - p)`; the
    /// standard error is the binomial deviation of c scaled the same way.
    pub fn analyze(&self) -> Vec<CategoryResult> {
        let n = self.num_observations as f64;
        let p = self.config.prob_0_becomes_1;
        let q = self.config.prob_1_stays_1;
        let denominator = q - p;
        self.config
            .categories
            .iter()
            .zip(&self.counts)
            .map(|(category, &raw)| {
                let raw = raw as f64;
                let (count_estimate, std_error) = if n == 0.0 {
                    (0.0, 0.0)
                } else {
                    let rate = raw / n;
                    (
                        (raw - p * n) / denominator,
                        (n * rate * (1.0 - rate)).sqrt() / denominator,
                    )
                };
                CategoryResult {
                    category: category.clone(),
                    count_estimate,
                    std_error,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(p: f64, q: f64, categories: usize) -> BasicRrConfig {
        BasicRrConfig {
            prob_0_becomes_1: p,
            prob_1_stays_1: q,
            categories: (0..categories)
                .map(|i| ValuePart::Index(i as u32))
                .collect(),
        }
    }

    /// A one-hot bit vector, without noise.
    fn one_hot(category: usize, num_categories: usize) -> BasicRrObservation {
        let mut data = vec![0u8; (num_categories + 7) / 8];
        data[category / 8] |= 1 << (category % 8);
        BasicRrObservation { data }
    }

    #[test]
    fn rejects_degenerate_configs() {
        assert_eq!(
            BasicRrAnalyzer::new(config(0.2, 0.8, 1)).unwrap_err(),
            BasicRrConfigError::TooFewCategories
        );
        assert!(matches!(
            BasicRrAnalyzer::new(config(0.8, 0.2, 3)).unwrap_err(),
            BasicRrConfigError::InvalidProbabilities { .. }
        ));
    }

    #[test]
    fn noiseless_estimates_are_exact() {
        // p = 0, q = 1 means the client applied no randomization.
        let mut analyzer = BasicRrAnalyzer::new(config(0.0, 1.0, 3)).unwrap();
        for _ in 0..5 {
            assert!(analyzer.add_observation(&one_hot(0, 3)));
        }
        for _ in 0..3 {
            assert!(analyzer.add_observation(&one_hot(2, 3)));
        }
        let results = analyzer.analyze();
        assert_eq!(results.len(), 3);
        assert!((results[0].count_estimate - 5.0).abs() < 1e-9);
        assert!((results[1].count_estimate - 0.0).abs() < 1e-9);
        assert!((results[2].count_estimate - 3.0).abs() < 1e-9);
    }

    #[test]
    fn estimator_inverts_the_flip_probabilities() {
        // All 100 clients report bit 0 set. With p=0.25, q=0.75 the raw
        // count 100 estimates (100 - 25) / 0.5 = 150.
        let mut analyzer = BasicRrAnalyzer::new(config(0.25, 0.75, 2)).unwrap();
        for _ in 0..100 {
            analyzer.add_observation(&one_hot(0, 2));
        }
        let results = analyzer.analyze();
        assert!((results[0].count_estimate - 150.0).abs() < 1e-9);
        // Bit 1 was never reported: estimate (0 - 25) / 0.5 = -50.
        assert!((results[1].count_estimate + 50.0).abs() < 1e-9);
        // Raw rate 1.0 has no binomial spread.
        assert!(results[0].std_error.abs() < 1e-9);
    }

    #[test]
    fn wrong_length_vectors_are_counted_as_errors() {
        let mut analyzer = BasicRrAnalyzer::new(config(0.1, 0.9, 3)).unwrap();
        assert!(!analyzer.add_observation(&BasicRrObservation { data: vec![0, 0] }));
        assert_eq!(analyzer.observation_errors(), 1);
        assert_eq!(analyzer.num_observations(), 0);
    }

    #[test]
    fn empty_input_yields_zero_estimates() {
        let analyzer = BasicRrAnalyzer::new(config(0.1, 0.9, 2)).unwrap();
        let results = analyzer.analyze();
        assert_eq!(results[0].count_estimate, 0.0);
        assert_eq!(results[0].std_error, 0.0);
    }
}
