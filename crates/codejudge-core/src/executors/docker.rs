// src/executors/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput;
#[allow(deprecated)]
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, ContainerStatsResponse, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    KillContainerOptions as BollardKillContainerOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    StatsOptions as BollardStatsOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::fs;

use super::output::BoundedBuffer;
use super::{IsolatedExecutor, Phase, RawExecution, Termination};
use crate::config::SandboxConfig;
use crate::errors::{IsolationError, WorkspaceError};
use crate::languages::LanguageProfile;
use crate::workspace::Workspace;

const WORKSPACE_MOUNT: &str = "/workspace";
const SCRATCH_DIR: &str = "/sandbox";
const STDIN_FILE: &str = ".stdin";
// Upper bound for staging and toolchain checks, which run no user code
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of one exec session inside the unit
#[derive(Debug)]
struct ExecOutcome {
    termination: Termination,
    stdout: String,
    stderr: String,
    elapsed: Duration,
}

impl ExecOutcome {
    fn into_raw(self, phase: Phase, memory_used_kb: Option<u64>) -> RawExecution {
        RawExecution {
            phase,
            termination: self.termination,
            stdout: self.stdout,
            stderr: self.stderr,
            elapsed: self.elapsed,
            memory_used_kb,
        }
    }
}

/// Await a daemon call for at most `limit`.
///
/// Expiry is an infrastructure failure like any other daemon error.
async fn with_deadline<T, E, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, IsolationError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<IsolationError>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(IsolationError::DaemonTimeout {
            operation,
            limit_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Tools the image must provide before any submitted code runs.
///
/// A run command starting with `./` is the compile step's output, not a tool.
fn required_tools(profile: &LanguageProfile) -> Vec<&'static str> {
    let compile = profile.compile.and_then(|argv| argv.first().copied());
    let run = profile
        .run
        .first()
        .copied()
        .filter(|program| !program.starts_with("./"));
    compile.into_iter().chain(run).collect()
}

/// Peak memory in KiB from one stats sample. The kernel's high-water mark wins
/// where it is reported (cgroup v1); otherwise the current usage.
fn sample_kb(stats: &ContainerStatsResponse) -> Option<u64> {
    let memory = stats.memory_stats.as_ref()?;
    memory.max_usage.or(memory.usage).map(|bytes| bytes / 1024)
}

/// Runs each submission in its own throwaway container.
///
/// The unit idles on `sleep infinity` while the pipeline runs as exec sessions:
/// stage the read-only workspace into the writable scratch tmpfs, check the image
/// toolchain, compile, run. Every daemon call is bounded by `api_timeout`.
pub struct DockerExecutor {
    docker: Docker,
    compile_timeout: Duration,
    api_timeout: Duration,
    max_output_bytes: usize,
    scratch_size_mb: u64,
    pids_limit: i64,
}

impl DockerExecutor {
    pub fn new(docker: Docker, config: &SandboxConfig) -> Self {
        Self {
            docker,
            compile_timeout: Duration::from_millis(config.limits.compile_timeout_ms),
            api_timeout: Duration::from_millis(config.isolation.api_timeout_ms),
            max_output_bytes: config.limits.max_output_bytes,
            scratch_size_mb: config.isolation.scratch_size_mb,
            pids_limit: config.isolation.pids_limit,
        }
    }

    fn unit_config(&self, profile: &LanguageProfile, host_workspace: &str) -> ContainerCreateBody {
        let tmpfs = HashMap::from([
            (
                SCRATCH_DIR.to_string(),
                format!("rw,exec,nosuid,size={}m,mode=1777", self.scratch_size_mb),
            ),
            ("/tmp".to_string(), "rw,nosuid,size=16m,mode=1777".to_string()),
        ]);

        ContainerCreateBody {
            image: Some(profile.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(SCRATCH_DIR.to_string()),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}:ro", host_workspace, WORKSPACE_MOUNT)]),
                tmpfs: Some(tmpfs),
                readonly_rootfs: Some(true),
                network_mode: Some("none".to_string()),
                memory: Some(profile.memory_bytes()),
                memory_swap: Some(profile.memory_bytes()),
                nano_cpus: Some(profile.nano_cpus()),
                pids_limit: Some(self.pids_limit),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn create_unit(
        &self,
        profile: &LanguageProfile,
        workspace: &Workspace,
    ) -> Result<String, IsolationError> {
        let host_workspace = workspace
            .path()
            .to_str()
            .ok_or_else(|| WorkspaceError::InvalidPath(workspace.path().display().to_string()))?;

        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(format!("codejudge-{}", workspace.id())),
            ..Default::default()
        });

        let create = async {
            self.docker
                .create_container(options, self.unit_config(profile, host_workspace))
                .await
                .map_err(|e| match e {
                    bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                        IsolationError::ImageMissing(profile.image.clone())
                    }
                    other => IsolationError::CreateUnit(other.to_string()),
                })
        };
        let container = with_deadline("create container", self.api_timeout, create).await?;
        Ok(container.id)
    }

    /// Run `argv` inside the unit. On timeout the whole unit is SIGKILLed, so a
    /// timed-out step is always the last one.
    async fn exec_step(
        &self,
        container_id: &str,
        argv: Vec<String>,
        limit: Duration,
    ) -> Result<ExecOutcome, IsolationError> {
        #[allow(deprecated)]
        let options = CreateExecOptions::<String> {
            cmd: Some(argv),
            working_dir: Some(SCRATCH_DIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = with_deadline(
            "create exec",
            self.api_timeout,
            self.docker.create_exec(container_id, options),
        )
        .await?;

        let started = Instant::now();
        #[allow(deprecated)]
        let attached = with_deadline(
            "start exec",
            self.api_timeout,
            self.docker.start_exec(&exec.id, None::<StartExecOptions>),
        )
        .await?;
        #[allow(deprecated)]
        let StartExecResults::Attached { mut output, .. } = attached else {
            return Err(IsolationError::CreateUnit("exec session started detached".to_string()));
        };

        let mut stdout = BoundedBuffer::new(self.max_output_bytes);
        let mut stderr = BoundedBuffer::new(self.max_output_bytes);
        let drained = tokio::time::timeout(limit, async {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } => stdout.push(&message),
                    LogOutput::StdErr { message } => stderr.push(&message),
                    _ => {}
                }
            }
            Ok::<(), bollard::errors::Error>(())
        })
        .await;

        let termination = match drained {
            Ok(result) => {
                result?;
                Termination::Exited(self.exit_code(&exec.id).await?)
            }
            Err(_) => {
                log::warn!("Execution timed out for container {}", container_id);
                self.kill_unit(container_id).await;
                Termination::TimedOut { limit }
            }
        };

        Ok(ExecOutcome {
            termination,
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            elapsed: started.elapsed(),
        })
    }

    async fn exit_code(&self, exec_id: &str) -> Result<i64, IsolationError> {
        // the output stream can close a moment before the daemon records the exit
        for _ in 0..20 {
            let inspect =
                with_deadline("inspect exec", self.api_timeout, self.docker.inspect_exec(exec_id))
                    .await?;
            if let Some(code) = inspect.exit_code {
                if inspect.running != Some(true) {
                    return Ok(code);
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        Err(IsolationError::MissingExitCode)
    }

    async fn kill_unit(&self, container_id: &str) {
        let options = Some(BollardKillContainerOptionsQuery {
            signal: "SIGKILL".to_string(),
        });
        let kill = self.docker.kill_container(container_id, options);
        if let Err(e) = with_deadline("kill container", self.api_timeout, kill).await {
            log::warn!("Failed to kill container {}: {}", container_id, e);
        }
    }

    async fn remove_unit(&self, container_id: &str) {
        let options = Some(BollardRemoveContainerOptionsQuery {
            force: true,
            v: true,
            ..Default::default()
        });
        let remove = self.docker.remove_container(container_id, options);
        match with_deadline("remove container", self.api_timeout, remove).await {
            Ok(()) => log::debug!("Removed container {}", container_id),
            Err(e) => log::error!("Failed to remove container {}: {}", container_id, e),
        }
    }

    async fn memory_sample_kb(&self, container_id: &str) -> Option<u64> {
        let mut stats = self.docker.stats(
            container_id,
            Some(BollardStatsOptionsQuery {
                stream: false,
                one_shot: true,
            }),
        );
        let sample = async { stats.next().await.transpose() };
        let limit = MEMORY_SAMPLE_INTERVAL.max(self.api_timeout / 10);
        match with_deadline("stats", limit, sample).await {
            Ok(Some(stats)) => sample_kb(&stats),
            Ok(None) => None,
            Err(e) => {
                log::debug!("Could not read memory stats for {}: {}", container_id, e);
                None
            }
        }
    }

    /// Run the program while sampling the unit's memory, keeping the peak
    async fn run_sampled(
        &self,
        container_id: &str,
        argv: Vec<String>,
        limit: Duration,
    ) -> Result<(ExecOutcome, Option<u64>), IsolationError> {
        let run = self.exec_step(container_id, argv, limit);
        tokio::pin!(run);
        let mut ticker = tokio::time::interval(MEMORY_SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut peak: Option<u64> = None;

        loop {
            tokio::select! {
                outcome = &mut run => return Ok((outcome?, peak)),
                _ = ticker.tick() => {
                    if let Some(kb) = self.memory_sample_kb(container_id).await {
                        peak = Some(peak.map_or(kb, |seen| seen.max(kb)));
                    }
                }
            }
        }
    }

    /// Fails with `ToolchainMissing` if the image lacks any tool the profile needs
    async fn check_toolchain(
        &self,
        container_id: &str,
        profile: &LanguageProfile,
    ) -> Result<(), IsolationError> {
        for tool in required_tools(profile) {
            let argv = ["sh", "-c", "command -v \"$1\" >/dev/null 2>&1", "sh", tool]
                .iter()
                .map(|arg| arg.to_string())
                .collect();
            let checked = self.exec_step(container_id, argv, SETUP_TIMEOUT).await?;
            if checked.termination != Termination::Exited(0) {
                return Err(IsolationError::ToolchainMissing {
                    image: profile.image.clone(),
                    tool: tool.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn run_pipeline(
        &self,
        container_id: &str,
        profile: &LanguageProfile,
        has_stdin: bool,
    ) -> Result<RawExecution, IsolationError> {
        let start = self
            .docker
            .start_container(container_id, None::<BollardStartContainerOptionsQuery>);
        with_deadline("start container", self.api_timeout, start)
            .await
            .map_err(|e| IsolationError::CreateUnit(e.to_string()))?;

        let staged = self
            .exec_step(
                container_id,
                vec![
                    "cp".to_string(),
                    "-R".to_string(),
                    format!("{}/.", WORKSPACE_MOUNT),
                    format!("{}/", SCRATCH_DIR),
                ],
                SETUP_TIMEOUT,
            )
            .await?;
        if staged.termination != Termination::Exited(0) {
            return Err(IsolationError::Stage(format!(
                "{:?}: {}",
                staged.termination,
                staged.stderr.trim()
            )));
        }

        self.check_toolchain(container_id, profile).await?;

        // From here on every exit status belongs to the submission
        if let Some(compile) = profile.compile {
            let argv = compile.iter().map(|arg| arg.to_string()).collect();
            let compiled = self.exec_step(container_id, argv, self.compile_timeout).await?;
            if compiled.termination != Termination::Exited(0) {
                return Ok(compiled.into_raw(Phase::Compile, None));
            }
        }

        let (ran, peak_kb) = self
            .run_sampled(container_id, run_argv(profile, has_stdin), profile.timeout)
            .await?;
        Ok(ran.into_raw(Phase::Run, peak_kb))
    }
}

/// The run command, redirected from the staged stdin file when there is input
fn run_argv(profile: &LanguageProfile, has_stdin: bool) -> Vec<String> {
    let mut argv: Vec<String> = Vec::new();
    if has_stdin {
        argv.push("sh".to_string());
        argv.push("-c".to_string());
        argv.push(format!("exec \"$@\" < {}/{}", WORKSPACE_MOUNT, STDIN_FILE));
        argv.push("sh".to_string());
    }
    argv.extend(profile.run.iter().map(|arg| arg.to_string()));
    argv
}

#[async_trait]
impl IsolatedExecutor for DockerExecutor {
    async fn run(
        &self,
        profile: &LanguageProfile,
        workspace: &Workspace,
        stdin: Option<&str>,
    ) -> Result<RawExecution, IsolationError> {
        if let Some(input) = stdin {
            fs::write(workspace.path().join(STDIN_FILE), input)
                .await
                .map_err(WorkspaceError::WriteSource)?;
        }

        let container_id = self.create_unit(profile, workspace).await?;
        log::debug!(
            "Created container {} for {} in {}",
            container_id,
            profile.language,
            workspace.path().display()
        );

        let outcome = self.run_pipeline(&container_id, profile, stdin.is_some()).await;
        self.remove_unit(&container_id).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::Language;
    use crate::result::{normalize, FailureKind, Strategy};
    use crate::workspace::WorkspaceManager;
    use bollard::models::ContainerMemoryStats;
    use tempfile::tempdir;

    #[test]
    fn test_run_argv_wraps_stdin_redirect() {
        let profile = LanguageProfile::builtin(Language::Python);
        assert_eq!(run_argv(&profile, false), vec!["python3", "-u", "main.py"]);
        assert_eq!(
            run_argv(&profile, true),
            vec!["sh", "-c", "exec \"$@\" < /workspace/.stdin", "sh", "python3", "-u", "main.py"]
        );
    }

    #[test]
    fn test_required_tools_skip_compiled_binary() {
        let tools = |language| required_tools(&LanguageProfile::builtin(language));
        assert_eq!(tools(Language::Python), vec!["python3"]);
        assert_eq!(tools(Language::JavaScript), vec!["node"]);
        assert_eq!(tools(Language::Java), vec!["javac", "java"]);
        assert_eq!(tools(Language::Cpp), vec!["g++"]);
    }

    #[test]
    fn test_exit_127_from_program_is_a_runtime_error() {
        // a submission can print anything and exit with any status
        let outcome = ExecOutcome {
            termination: Termination::Exited(127),
            stdout: String::new(),
            stderr: "config.txt not found\n".to_string(),
            elapsed: Duration::from_millis(4),
        };
        let result = normalize(outcome.into_raw(Phase::Run, None), Strategy::Isolated);
        assert_eq!(result.strategy, Strategy::Isolated);
        assert_eq!(result.failure, Some(FailureKind::RuntimeError));
        assert_eq!(result.error, "config.txt not found");
    }

    #[test]
    fn test_memory_sample_prefers_high_water_mark() {
        let stats = |usage, max_usage| ContainerStatsResponse {
            memory_stats: Some(ContainerMemoryStats {
                usage,
                max_usage,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(sample_kb(&stats(Some(4096), Some(65536))), Some(64));
        assert_eq!(sample_kb(&stats(Some(4096), None)), Some(4));
        assert_eq!(sample_kb(&stats(None, None)), None);
        assert_eq!(sample_kb(&ContainerStatsResponse::default()), None);
    }

    #[tokio::test]
    async fn test_deadline_bounds_a_hung_call() {
        let hung = std::future::pending::<Result<(), IsolationError>>();
        let started = Instant::now();
        let err = with_deadline("create container", Duration::from_millis(50), hung)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IsolationError::DaemonTimeout { operation: "create container", limit_ms: 50 }
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_unreachable_daemon_fails_within_deadline() {
        // 10.255.255.1 is unroutable: connects either hang or fail fast
        let docker = match Docker::connect_with_http(
            "http://10.255.255.1:2375",
            120,
            bollard::API_DEFAULT_VERSION,
        ) {
            Ok(docker) => docker,
            Err(_) => return,
        };
        let mut config = SandboxConfig::default();
        config.isolation.api_timeout_ms = 300;
        let executor = DockerExecutor::new(docker, &config);

        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).await.unwrap();
        let workspace = manager.create().await.unwrap();
        let profile = LanguageProfile::builtin(Language::Python);

        let started = Instant::now();
        let outcome = executor.run(&profile, &workspace, None).await;
        assert!(outcome.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
        manager.destroy(workspace).await;
    }

    #[tokio::test]
    async fn test_unit_is_locked_down() {
        let docker = match Docker::connect_with_local_defaults() {
            Ok(docker) => docker,
            Err(_) => return,
        };
        let executor = DockerExecutor::new(docker, &SandboxConfig::default());
        let profile = LanguageProfile::builtin(Language::Cpp);
        let body = executor.unit_config(&profile, "/tmp/ws");
        let host = body.host_config.unwrap();

        assert_eq!(body.network_disabled, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.binds, Some(vec!["/tmp/ws:/workspace:ro".to_string()]));
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.pids_limit, Some(64));
        assert!(host.tmpfs.unwrap().contains_key("/sandbox"));
    }

    #[tokio::test]
    #[ignore] // Requires a Docker daemon and the python:3.11-slim image
    async fn test_python_in_container() {
        let docker = Docker::connect_with_local_defaults().unwrap();
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).await.unwrap();
        let workspace = manager.create().await.unwrap();
        let profile = LanguageProfile::builtin(Language::Python);
        manager
            .write_source(&workspace, &profile, "print(input()[::-1])")
            .await
            .unwrap();

        let executor = DockerExecutor::new(docker, &SandboxConfig::default());
        let raw = executor.run(&profile, &workspace, Some("abc\n")).await.unwrap();
        assert!(raw.succeeded(), "{:?}", raw);
        assert_eq!(raw.stdout.trim(), "cba");
        manager.destroy(workspace).await;
    }

    #[tokio::test]
    #[ignore] // Requires a Docker daemon and the python:3.11-slim image
    async fn test_program_cannot_fake_a_missing_toolchain() {
        let docker = Docker::connect_with_local_defaults().unwrap();
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).await.unwrap();
        let workspace = manager.create().await.unwrap();
        let profile = LanguageProfile::builtin(Language::Python);
        let code = "import sys\nsys.stderr.write('python3: not found\\n')\nsys.exit(127)\n";
        manager.write_source(&workspace, &profile, code).await.unwrap();

        let executor = DockerExecutor::new(docker, &SandboxConfig::default());
        let raw = executor.run(&profile, &workspace, None).await.unwrap();
        assert_eq!(raw.phase, Phase::Run);
        assert_eq!(raw.termination, Termination::Exited(127));
        manager.destroy(workspace).await;
    }

    #[tokio::test]
    #[ignore] // Requires a Docker daemon and the python:3.11-slim image
    async fn test_image_without_compiler_is_an_isolation_error() {
        let docker = Docker::connect_with_local_defaults().unwrap();
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).await.unwrap();
        let workspace = manager.create().await.unwrap();
        let mut profile = LanguageProfile::builtin(Language::Cpp);
        profile.image = "python:3.11-slim".to_string();
        manager
            .write_source(&workspace, &profile, "int main() { return 0; }")
            .await
            .unwrap();

        let executor = DockerExecutor::new(docker, &SandboxConfig::default());
        let err = executor.run(&profile, &workspace, None).await.unwrap_err();
        assert!(matches!(err, IsolationError::ToolchainMissing { ref tool, .. } if tool == "g++"));
        manager.destroy(workspace).await;
    }

    #[tokio::test]
    #[ignore] // Requires a Docker daemon and the python:3.11-slim image
    async fn test_container_timeout_is_hard_kill() {
        let docker = Docker::connect_with_local_defaults().unwrap();
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).await.unwrap();
        let workspace = manager.create().await.unwrap();
        let mut profile = LanguageProfile::builtin(Language::Python);
        profile.timeout = Duration::from_millis(1_000);
        manager
            .write_source(&workspace, &profile, "while True:\n    pass\n")
            .await
            .unwrap();

        let executor = DockerExecutor::new(docker.clone(), &SandboxConfig::default());
        let started = Instant::now();
        let raw = executor.run(&profile, &workspace, None).await.unwrap();
        assert!(matches!(raw.termination, Termination::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(15));

        let name = format!("codejudge-{}", workspace.id());
        let inspect = docker
            .inspect_container(&name, None::<bollard::query_parameters::InspectContainerOptions>)
            .await;
        assert!(inspect.is_err());
        manager.destroy(workspace).await;
    }
}
