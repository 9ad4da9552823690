//! Configuration loader for YAML files

use crate::config::types::SandboxConfig;
use crate::errors::JudgeError;
use std::path::Path;
use tokio::fs;

/// Configuration loader with validation
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<SandboxConfig, JudgeError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            JudgeError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a file if it exists, otherwise use defaults
    pub async fn from_file_or_default<P: AsRef<Path>>(
        path: P,
    ) -> Result<SandboxConfig, JudgeError> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::from_file(path).await
        } else {
            log::info!("No config file at {}, using defaults", path.display());
            Ok(SandboxConfig::default())
        }
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<SandboxConfig, JudgeError> {
        // serde_yaml maps an empty document to unit, not to an empty mapping
        let config: SandboxConfig = if content.trim().is_empty() {
            SandboxConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| {
                JudgeError::ConfigError(format!("Failed to parse YAML config: {}", e))
            })?
        };

        config.validate()?;

        Ok(config)
    }
}
