use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::util::paths::{config_path, records_dir};

/// Application settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Default log filter directive, used when `RUST_LOG` is unset
    pub log_level: String,
    /// Where `step` keeps turn records given by name
    pub records_dir: PathBuf,
    /// Default entry arguments, overridden by `--arg`
    pub entry_args: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            records_dir: records_dir(),
            entry_args: Map::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TomlSettings {
    log: Option<TomlLogSettings>,
    records_dir: Option<PathBuf>,
    entry: Option<toml::Table>,
}

#[derive(Debug, Default, Deserialize)]
struct TomlLogSettings {
    level: Option<String>,
}

impl Settings {
    /// Load settings from the data directory, merging with defaults
    pub fn load() -> Self {
        Self::load_from(&config_path())
    }

    /// Load settings from `path`. A missing file yields defaults; an
    /// unreadable or malformed one is logged and also yields defaults.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Failed to read config");
                return Self::default();
            }
        };
        match Self::parse(&contents) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Failed to parse config");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        let toml_settings: TomlSettings = toml::from_str(contents)?;
        let mut settings = Self::default();

        if let Some(level) = toml_settings.log.and_then(|log| log.level) {
            settings.log_level = level;
        }
        if let Some(dir) = toml_settings.records_dir {
            settings.records_dir = dir;
        }
        if let Some(entry) = toml_settings.entry {
            for (name, value) in entry {
                match serde_json::to_value(&value) {
                    Ok(value) => {
                        settings.entry_args.insert(name, value);
                    }
                    Err(err) => {
                        tracing::warn!(arg = %name, error = %err, "Skipping entry default");
                    }
                }
            }
        }

        Ok(settings)
    }
}
