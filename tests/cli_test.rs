use anyhow::Result;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

fn write_config(dir: &Path) -> Result<std::path::PathBuf> {
    let path = dir.join("config.toml");
    std::fs::write(
        &path,
        format!(
            "[output]\ndir = {:?}\n\n[logging]\ndir = {:?}\n",
            dir.join("output"),
            dir.join("logs")
        ),
    )?;
    Ok(path)
}

fn read_logs(dir: &Path) -> Result<String> {
    let mut content = String::new();
    for entry in std::fs::read_dir(dir)? {
        content.push_str(&std::fs::read_to_string(entry?.path())?);
    }
    Ok(content)
}

#[test]
fn test_integrity_fault_exits_2_with_logs_flushed() -> Result<()> {
    let temp_dir = tempdir()?;
    let config = write_config(temp_dir.path())?;
    let entities = temp_dir.path().join("entities.ndjson");
    std::fs::write(
        &entities,
        concat!(
            r#"{"canonical_id":"Compound-1","entity_type":"compound","source_ids":{"chembl":"CHEMBL25"}}"#,
            "\n",
            r#"{"canonical_id":"Compound-2","entity_type":"compound","source_ids":{"chembl":"CHEMBL25"}}"#,
            "\n",
        ),
    )?;
    let relationships = temp_dir.path().join("relationships.ndjson");
    std::fs::write(
        &relationships,
        r#"{"from_ref":"CHEMBL25","to_ref":"CHEMBL221","relation_type":"inhibits","source_name":"chembl"}"#,
    )?;

    let output = Command::new(env!("CARGO_BIN_EXE_biokg-reconcile"))
        .current_dir(temp_dir.path())
        .env_remove("RUST_LOG")
        .env_remove("BIOKG_CONFIG")
        .env_remove("BIOKG_OUTPUT_DIR")
        .arg("--config")
        .arg(&config)
        .arg("reconcile")
        .arg("--entities")
        .arg(&entities)
        .arg("--relationships")
        .arg(&relationships)
        .output()?;

    assert_eq!(output.status.code(), Some(2));
    let logs = read_logs(&temp_dir.path().join("logs"))?;
    assert!(logs.contains("Integrity fault"), "log file was not flushed: {logs:?}");
    Ok(())
}
