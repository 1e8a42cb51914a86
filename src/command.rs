//! Command execution
//!
//! [`CommandSpec`] describes one external invocation; [`CommandRunner`] is the
//! seam every component runs commands through. The production runner,
//! [`SystemRunner`], spawns each command as a [`GuardedChild`] so an interrupt
//! stops it and nothing outlives the installer.

use crate::error::{InstallerError, Result};
use crate::process_guard::{GuardedChild, InterruptFlag, WaitOutcome, DEFAULT_GRACE_PERIOD};
use std::fmt;
use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// A fully described external command: program, arguments and extra environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Set on the child only, never on this process
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Returns true if any argument equals `needle`
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Exit information for a command that ran to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    /// Exit code (None if terminated by signal)
    pub code: Option<i32>,
    pub success: bool,
}

impl CommandStatus {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            success: code == 0,
        }
    }
}

impl From<ExitStatus> for CommandStatus {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// Captured output from a command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: CommandStatus,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success
    }
}

/// Runs external commands to completion, one at a time.
///
/// Both methods block until the command exits. An interrupt raised while the
/// command runs terminates it and yields [`InstallerError::Interrupted`].
pub trait CommandRunner {
    /// Run with stdout/stderr captured
    fn capture(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run with stdout/stderr inherited, for long installs the user should watch
    fn stream(&self, spec: &CommandSpec) -> Result<CommandStatus>;
}

/// Runner backed by real child processes
#[derive(Debug, Clone)]
pub struct SystemRunner {
    interrupt: InterruptFlag,
    grace: Duration,
}

impl SystemRunner {
    pub fn new(interrupt: InterruptFlag) -> Self {
        Self {
            interrupt,
            grace: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Override the SIGTERM-to-SIGKILL grace period
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn spawn(&self, spec: &CommandSpec, cmd: &mut Command) -> Result<GuardedChild> {
        debug!("spawn: {} env={:?}", spec, spec.env);
        GuardedChild::spawn(cmd, self.grace).map_err(|e| InstallerError::spawn(&spec.program, e))
    }

    fn wait(&self, child: &mut GuardedChild) -> Result<CommandStatus> {
        match child.wait_interruptible(&self.interrupt)? {
            WaitOutcome::Exited(status) => Ok(status.into()),
            WaitOutcome::Interrupted => Err(InstallerError::Interrupted),
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).trim_end().to_string())
        .unwrap_or_default()
}

impl CommandRunner for SystemRunner {
    fn capture(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = self.spawn(spec, &mut cmd)?;
        // Readers run alongside the wait so a chatty child never blocks on a full pipe
        let stdout = drain(child.take_stdout());
        let stderr = drain(child.take_stderr());

        let status = self.wait(&mut child)?;
        Ok(CommandOutput {
            stdout: collect(stdout),
            stderr: collect(stderr),
            status,
        })
    }

    fn stream(&self, spec: &CommandSpec) -> Result<CommandStatus> {
        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null());

        let mut child = self.spawn(spec, &mut cmd)?;
        let status = self.wait(&mut child)?;
        info!("{} finished with {}", spec.program, status);
        Ok(status)
    }
}
