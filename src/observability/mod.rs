// Observability: metric names and phase recorders

pub mod metrics;

pub use metrics::{init, render, MetricName};
