use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Load a JSON configuration from disk, creating it with the provided initializer if missing.
pub fn load_or_init<T, F>(path: &Path, initializer: F) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> T,
{
    if path.exists() {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let value = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        log::info!("loaded config from {}", path.display());
        Ok(value)
    } else {
        let value = initializer();
        save(path, &value)?;
        log::info!("wrote default config to {}", path.display());
        Ok(value)
    }
}

/// Write a value as pretty JSON, creating parent directories as needed.
pub fn save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let serialized = serde_json::to_string_pretty(value)?;
    fs::write(path, serialized)
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Settings {
        seed: u64,
        epochs: usize,
    }

    #[test]
    fn missing_config_is_initialized_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");

        let created: Settings = load_or_init(&path, || Settings { seed: 7, epochs: 5 }).unwrap();
        assert_eq!(created, Settings { seed: 7, epochs: 5 });
        assert!(path.exists());

        let reloaded: Settings =
            load_or_init(&path, || panic!("initializer must not run twice")).unwrap();
        assert_eq!(reloaded, created);
    }

    #[test]
    fn malformed_config_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let err = load_or_init::<Settings, _>(&path, || Settings { seed: 0, epochs: 0 })
            .unwrap_err();
        assert!(format!("{err}").contains("failed to parse config"));
    }
}
