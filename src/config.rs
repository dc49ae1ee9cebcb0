use crate::error::AppError;
use crate::sources::SourceRegistry;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DB_PATH_ENV: &str = "EPISODE_MERGE_DB";
pub const LOG_LEVEL_ENV: &str = "EPISODE_MERGE_LOG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: PathBuf,
    pub log_level: String,
    /// Source ids whose entries carry their own metadata.
    pub metadata_sources: Vec<i64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_data_dir().join("library.db"),
            log_level: "info".to_string(),
            metadata_sources: Vec::new(),
        }
    }
}

impl Config {
    /// Load from a YAML file; a missing file yields the defaults. Environment
    /// overrides are applied last.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_yaml::from_str::<Config>(&content)?
        } else {
            log::info!("No config at {}, using defaults", path.display());
            Config::default()
        };

        if let Ok(db) = std::env::var(DB_PATH_ENV) {
            if !db.trim().is_empty() {
                config.database_path = PathBuf::from(db.trim());
            }
        }
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            if !level.trim().is_empty() {
                config.log_level = level.trim().to_string();
            }
        }

        Ok(config)
    }

    pub fn source_registry(&self) -> SourceRegistry {
        SourceRegistry::new(self.metadata_sources.iter().copied())
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("episode-merge")
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("episode-merge")
        .join("config.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config::load(&temp.path().join("absent.yaml")).unwrap();
        assert!(config.metadata_sources.is_empty());
        assert!(config.database_path.ends_with("library.db"));
    }

    #[test]
    fn test_yaml_fields_parsed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(
            &path,
            "database_path: /tmp/merge-test.db\nmetadata_sources: [1, 2]\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.metadata_sources, vec![1, 2]);
        assert!(config.source_registry().is_metadata_source(2));
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, "metadata_sources: [not, numbers").unwrap();

        assert!(matches!(Config::load(&path), Err(AppError::Config(_))));
    }
}
