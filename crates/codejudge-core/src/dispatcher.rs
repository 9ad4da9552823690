//! Request dispatch: validate, pick a strategy, run, clean up.
//!
//! The only escalation is isolated to native, and only on an `IsolationError`. A
//! program that fails inside the container is a result, not a reason to retry, and a
//! native failure is terminal.

use std::sync::Arc;

use crate::capabilities::{CapabilityMatrix, StrategyPlan};
use crate::errors::IsolationError;
use crate::executors::{IsolatedExecutor, NativeExecutor};
use crate::languages::{LanguageProfile, LanguageRegistry};
use crate::result::{normalize, ExecutionResult, FailureKind, Strategy};
use crate::workspace::{Workspace, WorkspaceManager};

/// Cheap to clone; every field is shared and read-only.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<LanguageRegistry>,
    capabilities: Arc<CapabilityMatrix>,
    workspaces: WorkspaceManager,
    isolated: Option<Arc<dyn IsolatedExecutor>>,
    native: Arc<dyn NativeExecutor>,
    max_code_chars: usize,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        capabilities: Arc<CapabilityMatrix>,
        workspaces: WorkspaceManager,
        isolated: Option<Arc<dyn IsolatedExecutor>>,
        native: Arc<dyn NativeExecutor>,
        max_code_chars: usize,
    ) -> Self {
        Self {
            registry,
            capabilities,
            workspaces,
            isolated,
            native,
            max_code_chars,
        }
    }

    /// Same executors, different capability snapshot
    pub fn with_capabilities(&self, capabilities: Arc<CapabilityMatrix>) -> Self {
        Self {
            capabilities,
            ..self.clone()
        }
    }

    pub fn capabilities(&self) -> &Arc<CapabilityMatrix> {
        &self.capabilities
    }

    pub async fn execute(
        &self,
        language: &str,
        code: &str,
        stdin: Option<&str>,
    ) -> ExecutionResult {
        let profile = match self.validate(language, code) {
            Ok(profile) => profile,
            Err(rejection) => return rejection,
        };

        let plan = self.capabilities.plan(profile.language);
        // checked before allocating so an unrunnable language costs no workspace
        if plan == StrategyPlan::Unavailable {
            return unavailable(profile);
        }

        let workspace = match self.workspaces.create().await {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("Workspace allocation failed: {}", e);
                return ExecutionResult::rejected(
                    Strategy::Failed,
                    FailureKind::Infrastructure,
                    e.to_string(),
                );
            }
        };

        let result = match self.workspaces.write_source(&workspace, profile, code).await {
            Ok(_) => self.run_plan(plan, profile, &workspace, stdin).await,
            Err(e) => {
                log::error!(
                    "Writing source into {} failed: {}",
                    workspace.path().display(),
                    e
                );
                ExecutionResult::rejected(
                    Strategy::Failed,
                    FailureKind::Infrastructure,
                    e.to_string(),
                )
            }
        };

        self.workspaces.destroy(workspace).await;
        result
    }

    fn validate(&self, language: &str, code: &str) -> Result<&LanguageProfile, ExecutionResult> {
        let reject = |message: String| {
            ExecutionResult::rejected(Strategy::Failed, FailureKind::Validation, message)
        };

        if code.trim().is_empty() {
            return Err(reject("Code cannot be empty".to_string()));
        }
        if code.contains('\0') {
            return Err(reject("Code must be text".to_string()));
        }
        if code.chars().count() > self.max_code_chars {
            return Err(reject(format!(
                "Code exceeds maximum length of {} characters",
                self.max_code_chars
            )));
        }
        self.registry
            .resolve(language)
            .ok_or_else(|| reject(format!("Unsupported language: {}", language.trim())))
    }

    async fn run_plan(
        &self,
        plan: StrategyPlan,
        profile: &LanguageProfile,
        workspace: &Workspace,
        stdin: Option<&str>,
    ) -> ExecutionResult {
        let native_fallback = match plan {
            StrategyPlan::Isolated { native_fallback } => native_fallback,
            StrategyPlan::Native => return self.native.run(profile, workspace, stdin).await,
            StrategyPlan::Unavailable => return unavailable(profile),
        };

        let isolation_error = match self.run_isolated(profile, workspace, stdin).await {
            Ok(result) => return result,
            Err(e) => e,
        };

        if native_fallback {
            log::warn!(
                "Isolated execution of {} failed, falling back to native: {}",
                profile.language,
                isolation_error
            );
            self.native
                .run(profile, workspace, stdin)
                .await
                .with_isolation_error(isolation_error.to_string())
        } else {
            log::error!(
                "Isolated execution of {} failed with no native fallback: {}",
                profile.language,
                isolation_error
            );
            ExecutionResult::rejected(
                Strategy::Failed,
                FailureKind::Infrastructure,
                format!(
                    "Isolated execution failed: {}; \
                     no native {} toolchain is available to fall back to",
                    isolation_error, profile.language
                ),
            )
            .with_isolation_error(isolation_error.to_string())
        }
    }

    async fn run_isolated(
        &self,
        profile: &LanguageProfile,
        workspace: &Workspace,
        stdin: Option<&str>,
    ) -> Result<ExecutionResult, IsolationError> {
        let executor = self.isolated.as_ref().ok_or(IsolationError::Unavailable)?;
        let raw = executor.run(profile, workspace, stdin).await?;
        Ok(normalize(raw, Strategy::Isolated))
    }
}

fn unavailable(profile: &LanguageProfile) -> ExecutionResult {
    ExecutionResult::rejected(
        Strategy::Unavailable,
        FailureKind::Unavailable,
        format!(
            "No execution strategy available for {}: \
             container isolation is not ready and no native toolchain is installed",
            profile.language
        ),
    )
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
