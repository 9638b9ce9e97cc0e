// Reconciliation core: identifier normalization, entity deduplication,
// registry construction and relationship resolution

pub mod conflation;
pub mod normalize;
pub mod registry;
pub mod resolve;
