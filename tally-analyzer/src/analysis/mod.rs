//! The histogram analysis engine and the decoder adapters it multiplexes
//! over.

mod basic_rr;
mod engine;
mod threshold;

pub use basic_rr::{BasicRrAnalyzer, BasicRrConfigError, CategoryResult};
pub use engine::{DecoderAdapter, HistogramAnalysisEngine};
pub use threshold::{DecryptError, ResultInfo, ThresholdAnalyzer, ThresholdDecrypter};
