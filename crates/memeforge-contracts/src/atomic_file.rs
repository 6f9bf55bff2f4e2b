use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde_json::Value;

/// Writes `bytes` to a temp file next to `path` and renames it into place,
/// so readers see either the old file or the complete new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed creating {}", parent.display()))?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed creating temp file in {}", parent.display()))?;
    temp.write_all(bytes)?;
    temp.flush()?;
    temp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed persisting {}", path.display()))?;
    Ok(())
}

pub fn write_json_atomic(path: &Path, payload: &Value) -> anyhow::Result<()> {
    write_atomic(path, serde_json::to_string_pretty(payload)?.as_bytes())
}

pub fn read_json_value(path: &Path) -> Option<Value> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn write_atomic_replaces_existing_content() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("deep").join("blob.bin");
        write_atomic(&path, b"first")?;
        write_atomic(&path, b"second")?;
        assert_eq!(std::fs::read(&path)?, b"second");

        let leftovers = std::fs::read_dir(path.parent().unwrap_or(temp.path()))?.count();
        assert_eq!(leftovers, 1);
        Ok(())
    }

    #[test]
    fn json_round_trips_through_disk() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("payload.json");
        write_json_atomic(&path, &json!({"queries": ["cat"]}))?;
        assert_eq!(read_json_value(&path), Some(json!({"queries": ["cat"]})));
        assert_eq!(read_json_value(&temp.path().join("missing.json")), None);
        Ok(())
    }
}
