//! Error types for the execution sandbox
//!
//! Failures are split by who is expected to react to them. `IsolationError` is the
//! infrastructure class raised by the container executor; it is the only signal the
//! dispatcher treats as "fall back to native". Program outcomes such as compile
//! errors, non-zero exits and timeouts are not errors at all: they travel as values
//! inside `RawExecution`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum JudgeError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Could not prepare workspace root {path}: {source}")]
    Root {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not create workspace directory: {0}")]
    Create(#[source] std::io::Error),
    #[error("Could not write source file: {0}")]
    WriteSource(#[source] std::io::Error),
    #[error("Workspace path is not valid UTF-8: {0}")]
    InvalidPath(String),
}

// Infrastructure failures of the container executor
#[derive(Error, Debug)]
pub enum IsolationError {
    #[error("Container runtime is not available")]
    Unavailable,
    #[error("Bollard (Docker client) error: {0}")]
    BollardError(#[from] bollard::errors::Error),
    #[error("Image '{0}' is not present on this host")]
    ImageMissing(String),
    #[error("Failed to create isolation unit: {0}")]
    CreateUnit(String),
    #[error("Failed to stage workspace into isolation unit: {0}")]
    Stage(String),
    #[error("Image '{image}' has no '{tool}' on its PATH")]
    ToolchainMissing { image: String, tool: String },
    #[error("Docker daemon did not answer {operation} within {limit_ms} ms")]
    DaemonTimeout { operation: &'static str, limit_ms: u64 },
    #[error("Exec session ended without reporting an exit code")]
    MissingExitCode,
    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}
