//! Entry point for collaborators: build once at startup, then execute, report
//! health and re-probe.

use bollard::Docker;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::capabilities::{CapabilityMatrix, HealthReport};
use crate::config::SandboxConfig;
use crate::dispatcher::Dispatcher;
use crate::errors::JudgeError;
use crate::executors::{DockerExecutor, IsolatedExecutor, NativeExecutor, ProcessExecutor};
use crate::languages::LanguageRegistry;
use crate::probe::CapabilityProber;
use crate::result::ExecutionResult;
use crate::workspace::WorkspaceManager;

/// Execute request as received from the HTTP layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub code: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

/// Grace on top of the longest possible execution before a workspace counts as abandoned
const STALE_GRACE: Duration = Duration::from_secs(60);

/// Age after which a workspace cannot belong to a running execution
pub fn stale_workspace_age(config: &SandboxConfig, registry: &LanguageRegistry) -> Duration {
    Duration::from_millis(config.limits.compile_timeout_ms)
        + registry.longest_timeout()
        + STALE_GRACE
}

pub struct ExecutionService {
    registry: Arc<LanguageRegistry>,
    workspaces: WorkspaceManager,
    prober: CapabilityProber,
    dispatcher: RwLock<Dispatcher>,
}

impl ExecutionService {
    pub async fn initialize(config: SandboxConfig) -> Result<Self, JudgeError> {
        config.validate()?;

        let registry = Arc::new(LanguageRegistry::from_config(&config));
        let workspaces = WorkspaceManager::new(&config.workspace.root).await?;
        if config.workspace.sweep_on_startup {
            workspaces
                .sweep_stale(stale_workspace_age(&config, &registry))
                .await;
        }

        let docker = if config.isolation.enabled {
            match Docker::connect_with_local_defaults() {
                Ok(docker) => Some(docker),
                Err(e) => {
                    log::warn!("Could not build Docker client: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let prober = CapabilityProber::new(
            docker.clone(),
            Duration::from_millis(config.limits.probe_timeout_ms),
        );
        let capabilities = Arc::new(prober.probe(&registry).await);

        let isolated = docker.map(|docker| {
            Arc::new(DockerExecutor::new(docker, &config)) as Arc<dyn IsolatedExecutor>
        });
        let native: Arc<dyn NativeExecutor> = Arc::new(ProcessExecutor::new(
            Duration::from_millis(config.limits.compile_timeout_ms),
            config.limits.max_output_bytes,
        ));

        let dispatcher = Dispatcher::new(
            registry.clone(),
            capabilities,
            workspaces.clone(),
            isolated,
            native,
            config.limits.max_code_chars,
        );
        log::info!(
            "Execution service ready, workspaces under {}",
            workspaces.root().display()
        );

        Ok(Self {
            registry,
            workspaces,
            prober,
            dispatcher: RwLock::new(dispatcher),
        })
    }

    /// Always yields a result; failures of every kind are inside it
    pub async fn execute(&self, request: &ExecuteRequest) -> ExecutionResult {
        let dispatcher = self.dispatcher.read().await.clone();
        let result = dispatcher
            .execute(&request.language, &request.code, request.stdin.as_deref())
            .await;
        log::info!(
            "Executed {} submission: success={} strategy={:?} time={}ms",
            request.language,
            result.success,
            result.strategy,
            result.execution_time_ms
        );
        result
    }

    pub async fn capabilities(&self) -> Arc<CapabilityMatrix> {
        self.dispatcher.read().await.capabilities().clone()
    }

    pub async fn health(&self) -> HealthReport {
        self.capabilities().await.health()
    }

    /// Probe again and install the new matrix. Requests already running keep the
    /// snapshot they started with.
    pub async fn reprobe(&self) -> Arc<CapabilityMatrix> {
        let capabilities = Arc::new(self.prober.probe(&self.registry).await);
        let mut dispatcher = self.dispatcher.write().await;
        *dispatcher = dispatcher.with_capabilities(capabilities.clone());
        capabilities
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }
}
