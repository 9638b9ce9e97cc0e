pub mod alias_adapter;
pub mod run_output_adapter;

pub use alias_adapter::StaticAliases;
pub use run_output_adapter::RunOutputAdapter;
