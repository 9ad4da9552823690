//! Supported languages and their execution profiles.
//!
//! The set of languages is closed: adding one means adding a `Language` variant and a
//! builtin profile, and the compiler then points at every match that needs a new arm.
//! Profiles are plain data; the executors interpret them.

pub mod java;

use crate::config::SandboxConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Java,
    Cpp,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Python,
        Language::JavaScript,
        Language::Java,
        Language::Cpp,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Java => "java",
            Language::Cpp => "cpp",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Ok(Language::JavaScript),
            "java" => Ok(Language::Java),
            "cpp" | "c++" => Ok(Language::Cpp),
            other => Err(format!("Unsupported language: {}", other)),
        }
    }
}

/// How to compile and run one language, both natively and inside its container image.
///
/// Commands are argv vectors executed with the workspace (or the container scratch
/// directory) as working directory, so they refer to `source_file` by its bare name.
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageProfile {
    pub language: Language,
    pub image: String,
    pub source_file: &'static str,
    pub compile: Option<&'static [&'static str]>,
    pub run: &'static [&'static str],
    /// Commands that must all succeed for the native toolchain to count as installed
    pub native_probes: &'static [&'static [&'static str]],
    pub timeout: Duration,
    pub memory_mb: u64,
    pub cpu_share: f64,
}

impl LanguageProfile {
    pub fn builtin(language: Language) -> Self {
        match language {
            Language::Python => LanguageProfile {
                language,
                image: "python:3.11-slim".to_string(),
                source_file: "main.py",
                compile: None,
                run: &["python3", "-u", "main.py"],
                native_probes: &[&["python3", "--version"]],
                timeout: Duration::from_millis(10_000),
                memory_mb: 128,
                cpu_share: 0.5,
            },
            Language::JavaScript => LanguageProfile {
                language,
                image: "node:18-slim".to_string(),
                source_file: "main.js",
                compile: None,
                run: &["node", "main.js"],
                native_probes: &[&["node", "--version"]],
                timeout: Duration::from_millis(10_000),
                memory_mb: 128,
                cpu_share: 0.5,
            },
            Language::Java => LanguageProfile {
                language,
                image: "eclipse-temurin:17-jdk".to_string(),
                source_file: "Main.java",
                compile: Some(&["javac", "-encoding", "UTF-8", "Main.java"]),
                run: &["java", "-Xss64m", "-XX:+UseSerialGC", "-cp", ".", java::ENTRY_CLASS],
                native_probes: &[&["javac", "-version"], &["java", "-version"]],
                timeout: Duration::from_millis(15_000),
                memory_mb: 256,
                cpu_share: 1.0,
            },
            Language::Cpp => LanguageProfile {
                language,
                image: "gcc:13".to_string(),
                source_file: "main.cpp",
                compile: Some(&["g++", "-O2", "-std=c++17", "-o", "main", "main.cpp"]),
                run: &["./main"],
                native_probes: &[&["g++", "--version"]],
                timeout: Duration::from_millis(10_000),
                // cc1plus needs headroom: compile and run share the unit's ceiling
                memory_mb: 256,
                cpu_share: 0.5,
            },
        }
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_share * 1_000_000_000.0) as i64
    }

    pub fn has_compile_step(&self) -> bool {
        self.compile.is_some()
    }

    /// Source text as it must be written to disk for this language
    pub fn prepare_source(&self, code: &str) -> String {
        match self.language {
            Language::Java => java::rewrite_entry_class(code),
            Language::Python | Language::JavaScript | Language::Cpp => code.to_string(),
        }
    }
}

/// Immutable table of profiles, one per supported language
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: BTreeMap<Language, LanguageProfile>,
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self {
            profiles: Language::ALL
                .iter()
                .map(|language| (*language, LanguageProfile::builtin(*language)))
                .collect(),
        }
    }
}

impl LanguageRegistry {
    /// Builtin profiles with the configured overrides applied.
    ///
    /// Expects a validated config; override keys that do not name a language are ignored.
    pub fn from_config(config: &SandboxConfig) -> Self {
        let mut registry = Self::default();
        for (id, overrides) in &config.languages {
            let Ok(language) = id.parse::<Language>() else {
                log::warn!("Ignoring override for unsupported language '{}'", id);
                continue;
            };
            if let Some(profile) = registry.profiles.get_mut(&language) {
                if let Some(image) = &overrides.image {
                    profile.image = image.clone();
                }
                if let Some(timeout_ms) = overrides.timeout_ms {
                    profile.timeout = Duration::from_millis(timeout_ms);
                }
                if let Some(memory_mb) = overrides.memory_mb {
                    profile.memory_mb = memory_mb;
                }
                if let Some(cpu_share) = overrides.cpu_share {
                    profile.cpu_share = cpu_share;
                }
            }
        }
        registry
    }

    pub fn get(&self, language: Language) -> Option<&LanguageProfile> {
        self.profiles.get(&language)
    }

    /// Resolve a request-supplied language name to its profile
    pub fn resolve(&self, name: &str) -> Option<&LanguageProfile> {
        name.parse::<Language>().ok().and_then(|language| self.get(language))
    }

    pub fn languages(&self) -> impl Iterator<Item = Language> + '_ {
        self.profiles.keys().copied()
    }

    pub fn profiles(&self) -> impl Iterator<Item = &LanguageProfile> {
        self.profiles.values()
    }

    /// Longest run timeout across all profiles
    pub fn longest_timeout(&self) -> Duration {
        self.profiles()
            .map(|profile| profile.timeout)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}
