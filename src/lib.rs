pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod observability;
pub mod pipeline;

// Layered boundaries for application and infrastructure
pub mod app;
pub mod infra;

pub use error::{IntegrityFault, ReconcileError, Result};
pub use pipeline::processing::normalize::{normalize, Candidate, NormalizationStage};
pub use pipeline::processing::registry::{LookupOutcome, Registry, RegistryConfig, SharedRegistry};
