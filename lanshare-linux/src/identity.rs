//! Stable device id, generated once and kept in the state directory.

use std::path::Path;

use anyhow::Context;
use uuid::Uuid;

const DEVICE_ID_FILE: &str = "device_id";

/// Read the device id from `dir`, creating it on first run.
pub fn load_or_create(dir: &Path) -> anyhow::Result<String> {
    let path = dir.join(DEVICE_ID_FILE);
    if let Ok(s) = std::fs::read_to_string(&path) {
        let id = s.trim();
        if !id.is_empty() {
            return Ok(id.to_string());
        }
    }
    let id = Uuid::new_v4().to_string();
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    std::fs::write(&path, &id).with_context(|| format!("writing {}", path.display()))?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("lanshare");
        let first = load_or_create(&state).unwrap();
        let second = load_or_create(&state).unwrap();
        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
    }
}
