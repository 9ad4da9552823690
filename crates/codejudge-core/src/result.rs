//! Uniform result shape handed back to callers.

use crate::executors::{Phase, RawExecution, Termination};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Mechanism that produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Isolated,
    Native,
    /// No strategy could run the language on this host
    Unavailable,
    /// Nothing ran: the request was rejected, or isolation broke with no native fallback
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Unavailable,
    CompileError,
    RuntimeError,
    Timeout,
    Infrastructure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: String,
    pub execution_time_ms: u64,
    /// Approximate memory use in KiB, 0 when unknown
    pub memory_used_approx: u64,
    pub strategy: Strategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Set whenever an isolated attempt failed, including when native fallback succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_error: Option<String>,
}

impl ExecutionResult {
    /// A result for a request that never reached an executor
    pub fn rejected(strategy: Strategy, failure: FailureKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
            execution_time_ms: 0,
            memory_used_approx: 0,
            strategy,
            failure: Some(failure),
            isolation_error: None,
        }
    }

    pub fn with_isolation_error(mut self, error: impl Into<String>) -> Self {
        self.isolation_error = Some(error.into());
        self
    }

    pub fn timed_out(&self) -> bool {
        self.failure == Some(FailureKind::Timeout)
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Package a raw step outcome.
///
/// Captured streams are trimmed so callers can compare output directly.
pub fn normalize(raw: RawExecution, strategy: Strategy) -> ExecutionResult {
    let success = raw.succeeded();
    let stdout = raw.stdout.trim().to_string();
    let stderr = raw.stderr.trim().to_string();

    let failure = if success {
        None
    } else {
        Some(match (raw.termination, raw.phase) {
            (Termination::TimedOut { .. }, _) => FailureKind::Timeout,
            (_, Phase::Compile) => FailureKind::CompileError,
            (_, Phase::Run) => FailureKind::RuntimeError,
        })
    };

    let error = if success {
        String::new()
    } else {
        describe_failure(&raw, &stdout, stderr)
    };

    ExecutionResult {
        success,
        output: stdout,
        error,
        execution_time_ms: millis(raw.elapsed),
        memory_used_approx: raw.memory_used_kb.unwrap_or(0),
        strategy,
        failure,
        isolation_error: None,
    }
}

fn describe_failure(raw: &RawExecution, stdout: &str, stderr: String) -> String {
    let step = match raw.phase {
        Phase::Compile => "Compilation",
        Phase::Run => "Execution",
    };
    match raw.termination {
        Termination::TimedOut { limit } => {
            let mut message = format!("{} timed out after {} ms", step, millis(limit));
            if !stderr.is_empty() {
                message.push('\n');
                message.push_str(&stderr);
            }
            message
        }
        _ if !stderr.is_empty() => stderr,
        // some compilers report diagnostics on stdout
        _ if raw.phase == Phase::Compile && !stdout.is_empty() => stdout.to_string(),
        Termination::Exited(code) => format!("{} failed with exit code {}", step, code),
        Termination::Signaled(Some(signal)) => format!("{} terminated by signal {}", step, signal),
        Termination::Signaled(None) => format!("{} terminated abnormally", step),
    }
}
