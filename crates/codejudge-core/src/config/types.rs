//! Configuration types for the execution sandbox
//!
//! Every field has a default so an empty document, or no document at all, yields a
//! working configuration.

use crate::errors::JudgeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level sandbox configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SandboxConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub isolation: IsolationConfig,
    /// Per-language overrides keyed by language id (`python`, `java`, ...)
    #[serde(default)]
    pub languages: BTreeMap<String, LanguageOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
    #[serde(default = "default_sweep_on_startup")]
    pub sweep_on_startup: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            sweep_on_startup: default_sweep_on_startup(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Maximum accepted source length, in characters
    #[serde(default = "default_max_code_chars")]
    pub max_code_chars: usize,
    /// Per-stream cap on captured stdout/stderr, in bytes
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_compile_timeout_ms")]
    pub compile_timeout_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_code_chars: default_max_code_chars(),
            max_output_bytes: default_max_output_bytes(),
            compile_timeout_ms: default_compile_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IsolationConfig {
    /// When false the container runtime is never probed and every language runs natively
    #[serde(default = "default_isolation_enabled")]
    pub enabled: bool,
    #[serde(default = "default_scratch_size_mb")]
    pub scratch_size_mb: u64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    /// Upper bound on any single Docker daemon call
    #[serde(default = "default_api_timeout_ms")]
    pub api_timeout_ms: u64,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            enabled: default_isolation_enabled(),
            scratch_size_mb: default_scratch_size_mb(),
            pids_limit: default_pids_limit(),
            api_timeout_ms: default_api_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LanguageOverride {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub cpu_share: Option<f64>,
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("codejudge")
}

fn default_sweep_on_startup() -> bool {
    true
}

fn default_max_code_chars() -> usize {
    50_000
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_compile_timeout_ms() -> u64 {
    30_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_isolation_enabled() -> bool {
    true
}

fn default_scratch_size_mb() -> u64 {
    64
}

fn default_pids_limit() -> i64 {
    64
}

fn default_api_timeout_ms() -> u64 {
    10_000
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<(), JudgeError> {
        let invalid = |message: String| Err(JudgeError::ConfigError(message));

        if self.workspace.root.as_os_str().is_empty() {
            return invalid("workspace.root cannot be empty".to_string());
        }

        if self.limits.max_code_chars == 0 {
            return invalid("limits.max_code_chars must be greater than 0".to_string());
        }
        if self.limits.max_output_bytes == 0 {
            return invalid("limits.max_output_bytes must be greater than 0".to_string());
        }
        if self.limits.compile_timeout_ms == 0 || self.limits.probe_timeout_ms == 0 {
            return invalid("limits timeouts must be greater than 0".to_string());
        }

        if self.isolation.scratch_size_mb == 0 {
            return invalid("isolation.scratch_size_mb must be greater than 0".to_string());
        }
        if self.isolation.pids_limit <= 0 {
            return invalid("isolation.pids_limit must be greater than 0".to_string());
        }
        if self.isolation.api_timeout_ms == 0 {
            return invalid("isolation.api_timeout_ms must be greater than 0".to_string());
        }

        for (id, language) in &self.languages {
            if id.parse::<crate::languages::Language>().is_err() {
                return Err(JudgeError::UnsupportedLanguage(id.clone()));
            }
            if let Some(image) = &language.image {
                if image.trim().is_empty() {
                    return invalid(format!("languages.{}.image cannot be empty", id));
                }
            }
            if language.timeout_ms == Some(0) {
                return invalid(format!("languages.{}.timeout_ms must be greater than 0", id));
            }
            if language.memory_mb == Some(0) {
                return invalid(format!("languages.{}.memory_mb must be greater than 0", id));
            }
            if let Some(share) = language.cpu_share {
                if !(share > 0.0 && share <= 64.0) {
                    return invalid(format!(
                        "languages.{}.cpu_share must be in (0, 64], got {}",
                        id, share
                    ));
                }
            }
        }

        Ok(())
    }
}
