//! Safe command execution with timeout and guaranteed process kill.
//!
//! Every host mutation in vpnforge goes through this module. The two load-
//! bearing rules:
//!
//! - Arguments are passed to the OS as a discrete vector. Nothing here ever
//!   concatenates argv into a shell string, so validated values cannot be
//!   reinterpreted as syntax.
//! - Secret material (private keys) travels over the child's stdin, never
//!   through argv where other users' process listings could read it. An
//!   argv guard refuses to launch if a secret-shaped value slips in anyway.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;

use crate::domain::error::{CommandError, SystemCommandError};
use crate::domain::validate::is_wireguard_key;

/// Default timeout for short host commands (sysctl, systemctl, wg show).
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for package-manager operations, which can download.
pub const PKG_TIMEOUT: Duration = Duration::from_secs(600);

/// Grace period between SIGTERM and SIGKILL when cancelling a child.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// One command invocation: a literal argument vector plus execution policy.
/// Never persisted; constructed fresh per call from validated values.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    /// Exit codes treated as success besides 0. Declared by the caller per
    /// command family (e.g. `dnf check-update` exits 100 when updates
    /// exist) instead of the executor hard-coding zero-only.
    acceptable_codes: Vec<i32>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin: None,
            timeout: DEFAULT_CMD_TIMEOUT,
            acceptable_codes: Vec::new(),
        }
    }

    /// Set an environment variable for the child (e.g.
    /// `DEBIAN_FRONTEND=noninteractive`).
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Pipe `payload` to the child's stdin after spawn. Used exclusively for
    /// secret material so it never appears in the argument vector.
    #[must_use]
    pub fn secret_stdin(mut self, payload: Vec<u8>) -> Self {
        self.stdin = Some(payload);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Declare additional exit codes that mean success for this command.
    #[must_use]
    pub fn accept_codes(mut self, codes: &[i32]) -> Self {
        self.acceptable_codes.extend_from_slice(codes);
        self
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.args
    }

    fn succeeded(&self, exit_code: i32) -> bool {
        exit_code == 0 || self.acceptable_codes.contains(&exit_code)
    }

    /// Defense-in-depth check run before every spawn. Validators upstream
    /// should already have rejected these; the executor refuses
    /// independently rather than trusting its callers.
    fn guard_argv(&self) -> Result<(), CommandError> {
        for element in std::iter::once(&self.program).chain(&self.args) {
            if element.contains('\0') || element.contains('\n') {
                return Err(CommandError::Security {
                    program: self.program.clone(),
                    reason: "argv element contains NUL or newline".to_string(),
                });
            }
            if is_wireguard_key(element) {
                return Err(CommandError::Security {
                    program: self.program.clone(),
                    reason: "argv element looks like key material; pass secrets via stdin"
                        .to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Captured outcome of one command. Consumed immediately by the calling
/// phase; never persisted.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// True when the exit code is 0 or in the spec's acceptable set.
    pub succeeded: bool,
}

impl CommandResult {
    /// Convert a failed result into a `SystemCommandError`.
    ///
    /// # Errors
    ///
    /// Returns `SystemCommandError` when the command did not succeed.
    pub fn ensure_success(self, program: &str) -> Result<Self, SystemCommandError> {
        if self.succeeded {
            Ok(self)
        } else {
            Err(SystemCommandError {
                program: program.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Generic command execution seam. The production implementation spawns
/// real processes via tokio; engine tests substitute a recorder that
/// returns canned results.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Run the command to completion, enforcing the spec's timeout.
    ///
    /// # Errors
    ///
    /// `CommandError::Launch` if the executable cannot be spawned,
    /// `CommandError::Timeout` if it does not exit in time,
    /// `CommandError::Security` if the argv guard rejects the spec.
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandResult, CommandError>;

    /// Send a termination signal to every child currently executing under
    /// this runner, giving it a chance to exit cleanly before its pending
    /// `execute` future is dropped (which hard-kills survivors). Runners
    /// that do not manage real processes keep the default no-op.
    fn terminate_running(&self) {}
}

/// Production `CommandRunner` — tokio process execution with guaranteed
/// timeout and kill.
///
/// `tokio::time::timeout` around `.output().await` does not kill the child
/// when the timeout fires — the future is dropped but the OS process keeps
/// running. This implementation uses `tokio::select!` with an explicit
/// `child.kill()` so the process is always reclaimed.
pub struct TokioCommandRunner {
    /// PIDs of children spawned by `execute` that have not yet been
    /// reaped. `terminate_running` signals these on operator interrupt.
    running: std::sync::Mutex<std::collections::HashSet<u32>>,
}

impl Default for TokioCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioCommandRunner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            running: std::sync::Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Record a spawned child; the returned guard deregisters it when the
    /// surrounding `execute` future completes or is dropped.
    fn track(&self, pid: Option<u32>) -> RunningChild<'_> {
        if let Some(pid) = pid
            && let Ok(mut set) = self.running.lock()
        {
            set.insert(pid);
        }
        RunningChild { runner: self, pid }
    }

    /// Spawn the command and return a cancellable handle. No timeout — the
    /// caller manages the child's lifetime. `kill_on_drop(true)` is set as
    /// a safety net.
    ///
    /// # Errors
    ///
    /// `CommandError::Launch` if the process fails to spawn,
    /// `CommandError::Security` if the argv guard rejects the spec.
    pub fn spawn(&self, spec: &CommandSpec) -> Result<CommandHandle, CommandError> {
        spec.guard_argv()?;
        let child = tokio::process::Command::new(spec.program())
            .args(spec.argv())
            .envs(spec.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Launch {
                program: spec.program().to_string(),
                source,
            })?;
        Ok(CommandHandle {
            program: spec.program().to_string(),
            acceptable_codes: spec.acceptable_codes.clone(),
            child,
        })
    }
}

impl CommandRunner for TokioCommandRunner {
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandResult, CommandError> {
        spec.guard_argv()?;

        let mut child = tokio::process::Command::new(spec.program())
            .args(spec.argv())
            .envs(spec.envs.iter().map(|(k, v)| (k, v)))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Launch {
                program: spec.program().to_string(),
                source,
            })?;
        let _running = self.track(child.id());

        // Write stdin in a spawned task to avoid deadlock with the
        // stdout/stderr reads below.
        let stdin_task = child.stdin.take().map(|mut stdin| {
            let payload = spec.stdin.clone().unwrap_or_default();
            tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                let _ = stdin.write_all(&payload).await;
                let _ = stdin.shutdown().await;
            })
        });

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        // Read stdout/stderr CONCURRENTLY with wait() to avoid pipe deadlock.
        // If the child writes more than the OS pipe buffer (64KB on Linux)
        // it blocks on write; waiting first would never resolve.
        tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    drain(&mut stdout_handle),
                    drain(&mut stderr_handle),
                );
                if let Some(task) = stdin_task {
                    let _ = task.await;
                }
                let status = status.map_err(|source| CommandError::Launch {
                    program: spec.program().to_string(),
                    source,
                })?;
                let exit_code = status.code().unwrap_or(-1);
                Ok(CommandResult {
                    exit_code,
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    succeeded: spec.succeeded(exit_code),
                })
            } => result,
            () = tokio::time::sleep(spec.timeout) => {
                let _ = child.kill().await;
                Err(CommandError::Timeout {
                    program: spec.program().to_string(),
                    timeout_secs: spec.timeout.as_secs(),
                })
            }
        }
    }

    fn terminate_running(&self) {
        #[cfg(unix)]
        if let Ok(set) = self.running.lock() {
            for pid in set.iter() {
                #[allow(clippy::cast_possible_wrap)]
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(*pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
        }
    }
}

/// Deregisters a tracked child PID on drop, whether its `execute` future
/// completed or was cancelled.
struct RunningChild<'a> {
    runner: &'a TokioCommandRunner,
    pid: Option<u32>,
}

impl Drop for RunningChild<'_> {
    fn drop(&mut self) {
        if let Some(pid) = self.pid
            && let Ok(mut set) = self.runner.running.lock()
        {
            set.remove(&pid);
        }
    }
}

/// A running child process that can be awaited or cancelled.
///
/// Cancellation sends SIGTERM, waits `CANCEL_GRACE`, then SIGKILLs. The
/// child is reclaimed on every path — no leaked zombies.
pub struct CommandHandle {
    program: String,
    acceptable_codes: Vec<i32>,
    child: tokio::process::Child,
}

impl CommandHandle {
    /// Wait for the child to exit and collect its output.
    ///
    /// # Errors
    ///
    /// `CommandError::Launch` if waiting on the child fails at the OS level.
    pub async fn wait(mut self) -> Result<CommandResult, CommandError> {
        let mut stdout_handle = self.child.stdout.take();
        let mut stderr_handle = self.child.stderr.take();
        let (status, stdout, stderr) = tokio::join!(
            self.child.wait(),
            drain(&mut stdout_handle),
            drain(&mut stderr_handle),
        );
        let status = status.map_err(|source| CommandError::Launch {
            program: self.program.clone(),
            source,
        })?;
        let exit_code = status.code().unwrap_or(-1);
        Ok(CommandResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            succeeded: exit_code == 0 || self.acceptable_codes.contains(&exit_code),
        })
    }

    /// Cancel the child: SIGTERM, grace period, then forced kill.
    pub async fn cancel(mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            #[allow(clippy::cast_possible_wrap)]
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
            if tokio::time::timeout(CANCEL_GRACE, self.child.wait())
                .await
                .is_ok()
            {
                return;
            }
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

async fn drain(handle: &mut Option<impl AsyncReadExt + Unpin>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.read_to_end(&mut buf).await;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_captures_stdout_and_exit_code() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("echo").arg("hello");
        let result = runner.execute(&spec).await.expect("echo runs");
        assert!(result.succeeded);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_execute_missing_binary_is_launch_error() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("vpnforge-definitely-not-a-binary");
        let err = runner.execute(&spec).await.expect_err("must fail");
        assert!(matches!(err, CommandError::Launch { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_execute_timeout_kills_child() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("sleep")
            .arg("30")
            .timeout(Duration::from_millis(100));
        let err = runner.execute(&spec).await.expect_err("must time out");
        assert!(matches!(err, CommandError::Timeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_execute_pipes_secret_via_stdin() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("cat").secret_stdin(b"top-secret\n".to_vec());
        let result = runner.execute(&spec).await.expect("cat runs");
        assert_eq!(result.stdout, "top-secret\n");
    }

    #[tokio::test]
    async fn test_acceptable_exit_codes_count_as_success() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("sh")
            .args(["-c", "exit 100"])
            .accept_codes(&[100]);
        let result = runner.execute(&spec).await.expect("sh runs");
        assert_eq!(result.exit_code, 100);
        assert!(result.succeeded);
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_mapping_is_failure() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("sh").args(["-c", "exit 1"]);
        let result = runner.execute(&spec).await.expect("sh runs");
        assert!(!result.succeeded);
        assert!(result.ensure_success("sh").is_err());
    }

    #[tokio::test]
    async fn test_argv_guard_rejects_newline() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("echo").arg("a\nb");
        let err = runner.execute(&spec).await.expect_err("must refuse");
        assert!(matches!(err, CommandError::Security { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_argv_guard_rejects_secret_shaped_argument() {
        let runner = TokioCommandRunner::new();
        let fake_key = format!("{}=", "A".repeat(43));
        let spec = CommandSpec::new("echo").arg(fake_key);
        let err = runner.execute(&spec).await.expect_err("must refuse");
        assert!(matches!(err, CommandError::Security { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_argv_is_not_shell_interpreted() {
        // The metacharacter string is passed as one literal token; if a
        // shell ever interpreted it, echo would not print it verbatim.
        let runner = TokioCommandRunner::new();
        let payload = "eth0;id";
        let spec = CommandSpec::new("echo").arg(payload);
        let result = runner.execute(&spec).await.expect("echo runs");
        assert_eq!(result.stdout.trim(), payload);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_running_signals_in_flight_children() {
        use std::sync::Arc;
        let runner = Arc::new(TokioCommandRunner::new());
        let background = Arc::clone(&runner);
        let task = tokio::spawn(async move {
            background
                .execute(&CommandSpec::new("sleep").arg("30"))
                .await
        });
        // Let the child spawn and register before signalling.
        tokio::time::sleep(Duration::from_millis(200)).await;
        runner.terminate_running();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("child must exit promptly after SIGTERM")
            .expect("task join")
            .expect("execute returns a result");
        assert!(!result.succeeded, "signalled child must not count as success");
    }

    #[tokio::test]
    async fn test_terminate_running_with_no_children_is_noop() {
        let runner = TokioCommandRunner::new();
        runner.terminate_running();
        let result = runner
            .execute(&CommandSpec::new("echo").arg("still-works"))
            .await
            .expect("echo runs");
        assert!(result.succeeded);
    }

    #[tokio::test]
    async fn test_spawn_then_cancel_reclaims_child() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("sleep").arg("30");
        let handle = runner.spawn(&spec).expect("spawn");
        handle.cancel().await;
    }

    #[tokio::test]
    async fn test_spawn_then_wait_collects_output() {
        let runner = TokioCommandRunner::new();
        let spec = CommandSpec::new("echo").arg("bg");
        let handle = runner.spawn(&spec).expect("spawn");
        let result = handle.wait().await.expect("wait");
        assert!(result.succeeded);
        assert_eq!(result.stdout.trim(), "bg");
    }
}
