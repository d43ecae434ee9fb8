//! Runtime wiring for the decision core: baseline caching and anomaly
//! detection on ingest, budgeted causal analysis, the decision memory index
//! and confidence calibration, plus a bounded analysis worker pool.

pub mod analyzer;
pub mod calibrator;
pub mod detector;
pub mod engine;
pub mod memory_index;
pub mod pool;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use analyzer::CausalAnalyzer;
pub use calibrator::ConfidenceCalibrator;
pub use detector::{AnomalyDetector, BaselineCache};
pub use engine::{
    AnalysisTrigger, DecisionEngine, EngineStores, FeedbackReceipt, IngestReport, IngestStatus,
    Recommendation, RECOMMENDATION_CONTRACT_VERSION,
};
pub use memory_index::{DecisionMemoryIndex, NewDecision};
pub use pool::{AnalysisPool, DispatchError};
pub use telemetry::{EngineTelemetry, EngineTelemetrySnapshot};
