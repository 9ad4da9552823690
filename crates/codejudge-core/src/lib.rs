//! Multi-language code execution sandbox for an online judge.
//!
//! This crate takes untrusted source code in one of a closed set of languages,
//! compiles and runs it under resource limits, and returns a uniform result.
//!
//! # Architecture Overview
//!
//! - **Capability probing**: detects at startup whether Docker and each language image
//!   are ready, and which native toolchains are installed
//! - **Workspaces**: one UUID-named directory per request, removed on every exit path
//! - **Executors**: a container executor (network-less, capped, read-only mounted) and a
//!   host-process fallback with hard timeouts
//! - **Dispatch**: strategy selection, with isolated to native fallback only on
//!   infrastructure failure
//! - **Configuration**: YAML file with defaults for every field

pub mod capabilities;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod executors;
pub mod languages;
pub mod probe;
pub mod result;
pub mod service;
pub mod workspace;

pub use capabilities::{CapabilityMatrix, HealthReport};
pub use config::*;
pub use dispatcher::Dispatcher;
pub use errors::{IsolationError, JudgeError, WorkspaceError};
pub use languages::{Language, LanguageProfile, LanguageRegistry};
pub use result::{ExecutionResult, FailureKind, Strategy};
pub use service::{stale_workspace_age, ExecuteRequest, ExecutionService};
