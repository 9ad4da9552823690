//! Code execution strategies.
//!
//! Two executors share one vocabulary. The container executor returns a
//! `RawExecution` or raises an `IsolationError` when the isolation infrastructure
//! itself failed. The native executor is the last resort and never raises: anything
//! that goes wrong ends up inside the `ExecutionResult` it returns.

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::IsolationError;
use crate::languages::LanguageProfile;
use crate::result::ExecutionResult;
use crate::workspace::Workspace;

pub mod docker;
pub mod native;
pub mod output;

/// Which step of the pipeline produced a `RawExecution`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Compile,
    Run,
}

/// How a compile or run step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i64),
    /// Killed by a signal that was not ours (segfault, OOM killer, ...)
    Signaled(Option<i32>),
    /// Killed by the executor after `limit` elapsed
    TimedOut { limit: Duration },
}

/// Unnormalized outcome of the last step that ran.
///
/// A failed compile step stops the pipeline, so `phase == Compile` means the program
/// never ran.
#[derive(Debug, Clone, PartialEq)]
pub struct RawExecution {
    pub phase: Phase,
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub memory_used_kb: Option<u64>,
}

impl RawExecution {
    pub fn succeeded(&self) -> bool {
        self.phase == Phase::Run && self.termination == Termination::Exited(0)
    }
}

#[async_trait]
pub trait IsolatedExecutor: Send + Sync {
    async fn run(
        &self,
        profile: &LanguageProfile,
        workspace: &Workspace,
        stdin: Option<&str>,
    ) -> Result<RawExecution, IsolationError>;
}

#[async_trait]
pub trait NativeExecutor: Send + Sync {
    async fn run(
        &self,
        profile: &LanguageProfile,
        workspace: &Workspace,
        stdin: Option<&str>,
    ) -> ExecutionResult;
}

pub use docker::DockerExecutor;
pub use native::ProcessExecutor;
