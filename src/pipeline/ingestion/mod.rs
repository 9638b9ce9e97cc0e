// Pipeline ingestion: schema-validated NDJSON batches from source extractors

pub mod batch_reader;

pub use batch_reader::{read_entities, read_relationships, BatchReader, RecordKind, Violation};
