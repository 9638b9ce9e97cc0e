pub mod ports;
pub mod reconcile_use_case;
pub mod stats;

pub use reconcile_use_case::{
    CancellationFlag, Checkpoint, CompletedRun, PartialRun, ReconcileInput, ReconcileSettings,
    ReconciliationUseCase, RunOutcome,
};
pub use stats::ReconciliationStats;
