use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{fs, path::PathBuf};

use biokg_reconcile::pipeline::ingestion::{BatchReader, RecordKind};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    Entity,
    Relationship,
}

/// Validate an NDJSON extraction batch against the entity or relationship v1 schema.
#[derive(Parser, Debug)]
#[command(name = "validate-batch", version, about = "Validate NDJSON batches against schema")]
struct Cli {
    /// Record kind carried by the batch
    #[arg(long, value_enum)]
    kind: Kind,

    /// Batch files to validate
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let reader = BatchReader::new(match args.kind {
        Kind::Entity => RecordKind::Entity,
        Kind::Relationship => RecordKind::Relationship,
    });

    let mut invalid = 0;
    for path in &args.paths {
        let data = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let violations = reader.violations(&data);
        if violations.is_empty() {
            println!("{}: valid", path.display());
            continue;
        }
        invalid += violations.len();
        eprintln!("{}: invalid", path.display());
        for violation in violations {
            for message in violation.messages {
                eprintln!("- line {}: {}", violation.line, message);
            }
        }
    }

    if invalid > 0 {
        std::process::exit(1)
    }
    Ok(())
}
