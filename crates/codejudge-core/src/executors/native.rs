//! Host-process execution, the lower-security fallback.
//!
//! Steps run as ordinary subprocesses inside the workspace directory. There is no
//! network, memory or CPU confinement here; the only guarantees are the timeout and
//! the kill. Each step gets its own process group so the kill also reaches anything
//! the submission forked.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::output::{collect_bounded, BoundedBuffer};
use super::{NativeExecutor, Phase, RawExecution, Termination};
use crate::languages::LanguageProfile;
use crate::result::{normalize, ExecutionResult, FailureKind, Strategy};
use crate::workspace::Workspace;

// How long to keep reading pipes after the process is gone
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Outcome of one subprocess
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl StepOutcome {
    pub fn exited_cleanly(&self) -> bool {
        self.termination == Termination::Exited(0)
    }

    fn into_raw(self, phase: Phase) -> RawExecution {
        RawExecution {
            phase,
            termination: self.termination,
            stdout: self.stdout,
            stderr: self.stderr,
            elapsed: self.elapsed,
            memory_used_kb: None,
        }
    }
}

/// Run `argv` in `cwd`, feeding `stdin`, and SIGKILL it if it outlives `timeout`.
///
/// Errors only when the process cannot be started at all.
pub async fn run_step(
    argv: &[&str],
    cwd: &Path,
    stdin: Option<&str>,
    timeout: Duration,
    max_output_bytes: usize,
) -> io::Result<StepOutcome> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

    // "./main" must resolve against the workspace, not our own cwd
    let program = if program.starts_with("./") {
        cwd.join(program)
    } else {
        PathBuf::from(program)
    };

    let mut cmd = Command::new(&program);
    cmd.args(args)
        .current_dir(cwd)
        .env_clear()
        .env("PATH", std::env::var_os("PATH").unwrap_or_default())
        .env("HOME", cwd)
        .env("LANG", "C.UTF-8")
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let started = Instant::now();
    let mut child = cmd.spawn()?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let input = input.to_owned();
        tokio::spawn(async move {
            // the program may exit without reading its input; EPIPE is expected then
            let _ = pipe.write_all(input.as_bytes()).await;
            let _ = pipe.shutdown().await;
        });
    }

    let stdout_task = spawn_collector(child.stdout.take(), max_output_bytes);
    let stderr_task = spawn_collector(child.stderr.take(), max_output_bytes);

    let termination = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => termination_of(status?),
        Err(_) => {
            log::warn!(
                "{} exceeded {} ms, killing process group",
                program.display(),
                timeout.as_millis()
            );
            kill_tree(&mut child).await;
            Termination::TimedOut { limit: timeout }
        }
    };
    let elapsed = started.elapsed();

    let stdout = finish_collector(stdout_task).await;
    let stderr = finish_collector(stderr_task).await;

    Ok(StepOutcome {
        termination,
        stdout,
        stderr,
        elapsed,
    })
}

fn spawn_collector<R>(
    pipe: Option<R>,
    limit: usize,
) -> Option<JoinHandle<io::Result<BoundedBuffer>>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|pipe| tokio::spawn(collect_bounded(pipe, limit)))
}

async fn finish_collector(task: Option<JoinHandle<io::Result<BoundedBuffer>>>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_GRACE, &mut task).await {
        Ok(Ok(Ok(buffer))) => buffer.into_string(),
        Ok(Ok(Err(e))) => {
            log::debug!("Output pipe read failed: {}", e);
            String::new()
        }
        Ok(Err(e)) => {
            log::debug!("Output collector panicked: {}", e);
            String::new()
        }
        Err(_) => {
            // a descendant escaped the process group and still holds the pipe
            task.abort();
            String::new()
        }
    }
}

async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: signalling our own process group; a stale pgid only yields ESRCH
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
    let _ = child.kill().await;
}

fn termination_of(status: ExitStatus) -> Termination {
    match status.code() {
        Some(code) => Termination::Exited(i64::from(code)),
        None => Termination::Signaled(signal_of(&status)),
    }
}

#[cfg(unix)]
fn signal_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Runs compile and run steps as host subprocesses
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    compile_timeout: Duration,
    max_output_bytes: usize,
}

impl ProcessExecutor {
    pub fn new(compile_timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            compile_timeout,
            max_output_bytes,
        }
    }

    fn spawn_failure(
        &self,
        profile: &LanguageProfile,
        phase: Phase,
        err: io::Error,
    ) -> ExecutionResult {
        let step = match phase {
            Phase::Compile => "compiler",
            Phase::Run => "program",
        };
        log::error!("Could not start native {} for {}: {}", step, profile.language, err);
        ExecutionResult::rejected(
            Strategy::Native,
            FailureKind::Infrastructure,
            format!("Failed to start native {} for {}: {}", step, profile.language, err),
        )
    }
}

#[async_trait]
impl NativeExecutor for ProcessExecutor {
    async fn run(
        &self,
        profile: &LanguageProfile,
        workspace: &Workspace,
        stdin: Option<&str>,
    ) -> ExecutionResult {
        if let Some(compile) = profile.compile {
            log::debug!(
                "Compiling {} natively in {}",
                profile.language,
                workspace.path().display()
            );
            let compiled = run_step(
                compile,
                workspace.path(),
                None,
                self.compile_timeout,
                self.max_output_bytes,
            )
            .await;
            match compiled {
                Ok(outcome) if outcome.exited_cleanly() => {}
                Ok(outcome) => {
                    return normalize(outcome.into_raw(Phase::Compile), Strategy::Native)
                }
                Err(e) => return self.spawn_failure(profile, Phase::Compile, e),
            }
        }

        log::debug!(
            "Running {} natively in {}",
            profile.language,
            workspace.path().display()
        );
        let ran = run_step(
            profile.run,
            workspace.path(),
            stdin,
            profile.timeout,
            self.max_output_bytes,
        )
        .await;
        match ran {
            Ok(outcome) => normalize(outcome.into_raw(Phase::Run), Strategy::Native),
            Err(e) => self.spawn_failure(profile, Phase::Run, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::Language;
    use crate::workspace::WorkspaceManager;
    use tempfile::tempdir;

    const CAP: usize = 64 * 1024;

    fn toolchain_present(tool: &str) -> bool {
        let present = which::which(tool).is_ok();
        if !present {
            eprintln!("skipping: {} not installed", tool);
        }
        present
    }

    // zombies awaiting a reaper count as dead
    fn process_alive(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_captures_streams_and_exit_code() {
        let dir = tempdir().unwrap();
        let outcome = run_step(
            &["sh", "-c", "echo out; echo err >&2; exit 3"],
            dir.path(),
            None,
            Duration::from_secs(5),
            CAP,
        )
        .await
        .unwrap();
        assert_eq!(outcome.termination, Termination::Exited(3));
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_feeds_stdin() {
        let dir = tempdir().unwrap();
        let stdin = Some("line one\nline two");
        let outcome = run_step(&["cat"], dir.path(), stdin, Duration::from_secs(5), CAP)
            .await
            .unwrap();
        assert!(outcome.exited_cleanly());
        assert_eq!(outcome.stdout, "line one\nline two");
    }

    #[tokio::test]
    async fn test_runs_inside_working_directory() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let argv = ["cat", "marker.txt"];
        let outcome = run_step(&argv, dir.path(), None, Duration::from_secs(5), CAP)
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "here");
    }

    #[tokio::test]
    async fn test_timeout_kills_within_grace_period() {
        let dir = tempdir().unwrap();
        let started = Instant::now();
        let argv = ["sh", "-c", "sleep 30"];
        let outcome = run_step(&argv, dir.path(), None, Duration::from_millis(300), CAP)
            .await
            .unwrap();
        assert_eq!(
            outcome.termination,
            Termination::TimedOut { limit: Duration::from_millis(300) }
        );
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_timeout_reaches_forked_children() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let argv = ["sh", "-c", script.as_str()];
        let outcome = run_step(&argv, dir.path(), None, Duration::from_millis(300), CAP)
            .await
            .unwrap();
        assert!(matches!(outcome.termination, Termination::TimedOut { .. }));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!process_alive(pid.trim()), "background child {} survived the kill", pid.trim());
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let dir = tempdir().unwrap();
        let argv = ["sh", "-c", "yes | head -c 100000"];
        let outcome = run_step(&argv, dir.path(), None, Duration::from_secs(5), 1000)
            .await
            .unwrap();
        assert!(outcome.exited_cleanly());
        assert!(outcome.stdout.ends_with(crate::executors::output::TRUNCATION_MARKER));
        assert!(outcome.stdout.len() < 2000);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempdir().unwrap();
        let limit = Duration::from_secs(1);
        let argv = ["definitely-not-a-real-binary-1234"];
        assert!(run_step(&argv, dir.path(), None, limit, CAP).await.is_err());
        assert!(run_step(&[], dir.path(), None, limit, CAP).await.is_err());
    }

    #[tokio::test]
    async fn test_python_program_runs_natively() {
        if !toolchain_present("python3") {
            return;
        }
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).await.unwrap();
        let workspace = manager.create().await.unwrap();
        let profile = LanguageProfile::builtin(Language::Python);
        manager
            .write_source(&workspace, &profile, "import sys\nprint(sys.stdin.read().upper())")
            .await
            .unwrap();

        let executor = ProcessExecutor::new(Duration::from_secs(30), CAP);
        let result = executor.run(&profile, &workspace, Some("abc")).await;
        assert!(result.success, "{:?}", result);
        assert_eq!(result.output, "ABC");
        assert_eq!(result.strategy, Strategy::Native);
        manager.destroy(workspace).await;
    }

    #[tokio::test]
    async fn test_cpp_compile_error_reports_diagnostics() {
        if !toolchain_present("g++") {
            return;
        }
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).await.unwrap();
        let workspace = manager.create().await.unwrap();
        let profile = LanguageProfile::builtin(Language::Cpp);
        manager
            .write_source(&workspace, &profile, "int main() { return 0 }")
            .await
            .unwrap();

        let executor = ProcessExecutor::new(Duration::from_secs(30), CAP);
        let result = executor.run(&profile, &workspace, None).await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::CompileError));
        assert!(result.error.contains("error"), "{}", result.error);
        manager.destroy(workspace).await;
    }

    #[tokio::test]
    async fn test_cpp_program_compiles_and_runs() {
        if !toolchain_present("g++") {
            return;
        }
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).await.unwrap();
        let workspace = manager.create().await.unwrap();
        let profile = LanguageProfile::builtin(Language::Cpp);
        manager
            .write_source(
                &workspace,
                &profile,
                "#include <iostream>\nint main() { std::cout << \"X\" << std::endl; }",
            )
            .await
            .unwrap();

        let executor = ProcessExecutor::new(Duration::from_secs(60), CAP);
        let result = executor.run(&profile, &workspace, None).await;
        assert!(result.success, "{:?}", result);
        assert_eq!(result.output, "X");
        manager.destroy(workspace).await;
    }

    #[tokio::test]
    async fn test_missing_interpreter_becomes_infrastructure_failure() {
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).await.unwrap();
        let workspace = manager.create().await.unwrap();
        let mut profile = LanguageProfile::builtin(Language::Python);
        profile.run = &["definitely-not-python-1234", "main.py"];

        let executor = ProcessExecutor::new(Duration::from_secs(5), CAP);
        let result = executor.run(&profile, &workspace, None).await;
        assert!(!result.success);
        assert_eq!(result.strategy, Strategy::Native);
        assert_eq!(result.failure, Some(FailureKind::Infrastructure));
        assert!(
            result.error.contains("definitely-not-python-1234")
                || result.error.contains("Failed to start")
        );
        manager.destroy(workspace).await;
    }
}
