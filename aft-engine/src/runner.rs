//! Bounded execution of external commands.
//!
//! Everything that shells out (cutter relays, flashing helpers, test
//! cases) goes through [`CommandRunner`], which enforces a wall-clock
//! deadline and always hands back a tagged outcome instead of raising.

use std::{ffi::OsStr, process::Stdio, time::Duration};

use tokio::process::Command;

use crate::error::{Error, Result};

/// Uniform result of a completed external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdResult {
    pub return_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.return_code == 0
    }

    /// Stdout as lossy UTF-8, for pattern matching and reports.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Outcome of one bounded run.
///
/// A spawn-level OS error (executable vanished, permission denied) is not
/// a separate arm: it is folded into [`CmdOutcome::Completed`] with the
/// OS error code and message, so callers see exactly one shape for
/// "the command produced a result".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdOutcome {
    Completed(CmdResult),
    /// Still running at the deadline; the child was forcibly terminated
    /// and no partial result is synthesized.
    TimedOut,
}

impl CmdOutcome {
    pub fn completed(&self) -> Option<&CmdResult> {
        match self {
            Self::Completed(res) => Some(res),
            Self::TimedOut => None,
        }
    }
}

/// Wrapper around one external command with a default timeout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    command: String,
    timeout: Duration,
    exit_on_error: bool,
}

impl CommandRunner {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Self::DEFAULT_TIMEOUT,
            exit_on_error: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Treat a missing command as fatal in [`CommandRunner::probe`].
    pub fn exit_on_error(mut self, fatal: bool) -> Self {
        self.exit_on_error = fatal;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Check that the wrapped command exists on the host, via `which`.
    ///
    /// Returns `Ok(false)` on absence, unless the runner was built with
    /// `exit_on_error`, in which case absence is [`Error::CommandNotFound`]
    /// and the caller decides whether that terminates the process.
    pub async fn probe(&self) -> Result<bool> {
        tracing::info!("Testing for presence of {:?} command", self.command);
        let outcome = run(["which", self.command.as_str()], Self::DEFAULT_TIMEOUT, false).await;
        let found = matches!(outcome.completed(), Some(res) if res.success());
        if found {
            tracing::info!("Command {:?} found", self.command);
        } else if self.exit_on_error {
            return Err(Error::CommandNotFound(self.command.clone()));
        } else {
            tracing::error!("Cannot locate {:?} command", self.command);
        }
        Ok(found)
    }

    /// Run the wrapped command with extra arguments, bounded by
    /// `timeout` if given, else by the runner default.
    pub async fn run<I, S>(&self, args: I, timeout: Option<Duration>, verbose: bool) -> CmdOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let argv: Vec<std::ffi::OsString> = std::iter::once(OsStr::new(&self.command).to_owned())
            .chain(args.into_iter().map(|a| a.as_ref().to_owned()))
            .collect();
        run(argv, timeout.unwrap_or(self.timeout), verbose).await
    }
}

/// Spawn `argv` as an isolated child and wait up to `timeout`.
///
/// The child is killed on deadline expiry; completion (including non-zero
/// exit) always yields the full [`CmdResult`]: pass/fail semantics
/// belong to the caller.
pub async fn run<I, S>(argv: I, timeout: Duration, verbose: bool) -> CmdOutcome
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_in(argv, timeout, verbose, None).await
}

/// Like [`run`], with an explicit working directory for the child.
pub async fn run_in<I, S>(
    argv: I,
    timeout: Duration,
    verbose: bool,
    current_dir: Option<&std::path::Path>,
) -> CmdOutcome
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut argv = argv.into_iter();
    let Some(program) = argv.next() else {
        return CmdOutcome::Completed(CmdResult {
            return_code: nix::errno::Errno::ENOENT as i32,
            stdout: Vec::new(),
            stderr: b"empty command line".to_vec(),
        });
    };
    let program = program.as_ref().to_owned();

    let mut cmd = Command::new(&program);
    cmd.args(argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = current_dir {
        cmd.current_dir(dir);
    }
    if verbose {
        tracing::debug!("Running {:?}", cmd.as_std());
    }

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::debug!("Failed to spawn {:?}: {e}", program);
            return CmdOutcome::Completed(CmdResult {
                return_code: e.raw_os_error().unwrap_or(-1),
                stdout: Vec::new(),
                stderr: e.to_string().into_bytes(),
            });
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let result = CmdResult {
                // Death by signal has no exit code; report it as -1.
                return_code: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr: output.stderr,
            };
            if !result.success() {
                tracing::debug!(
                    "Error running {:?}: returncode {}, stderr: {}",
                    program,
                    result.return_code,
                    result.stderr_lossy()
                );
            }
            CmdOutcome::Completed(result)
        }
        Ok(Err(e)) => CmdOutcome::Completed(CmdResult {
            return_code: e.raw_os_error().unwrap_or(-1),
            stdout: Vec::new(),
            stderr: e.to_string().into_bytes(),
        }),
        Err(_) => {
            // Dropping the wait future drops the child handle, and
            // kill_on_drop reaps it.
            tracing::warn!("Command {:?} timed out after {:?}", program, timeout);
            CmdOutcome::TimedOut
        }
    }
}
