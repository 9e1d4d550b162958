use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Daemon configuration. Directory names are relative to `base_directory`
/// and back the virtual `0:/` tree used on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub base_directory: PathBuf,
    pub gcodes_directory: String,
    pub system_directory: String,
    pub macros_directory: String,
    pub filaments_directory: String,
    pub web_directory: String,
    pub scans_directory: String,
    pub config_file: String,
    pub configuration_override_file: String,
    pub event_log_file: String,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            base_directory: PathBuf::from("/opt/printerd/sd"),
            gcodes_directory: "gcodes".to_string(),
            system_directory: "sys".to_string(),
            macros_directory: "macros".to_string(),
            filaments_directory: "filaments".to_string(),
            web_directory: "www".to_string(),
            scans_directory: "scans".to_string(),
            config_file: "config.g".to_string(),
            configuration_override_file: "config-override.g".to_string(),
            event_log_file: "eventlog.txt".to_string(),
        }
    }
}

impl Settings {
    /// Loads settings from a JSON file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Settings> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read settings file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("cannot parse settings file {}", path.display()))
    }

    /// Settings rooted at a throwaway directory, for tests.
    pub fn with_base(base: impl Into<PathBuf>) -> Settings {
        Settings {
            base_directory: base.into(),
            ..Settings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_accepts_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"baseDirectory": "/data/sd"}"#).unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.base_directory, PathBuf::from("/data/sd"));
        assert_eq!(settings.gcodes_directory, "gcodes");
    }
}
