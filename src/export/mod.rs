//! Run metrics export: Prometheus registry, HTTP endpoint and textfile.

pub mod health;

pub use health::PipelineMetrics;
