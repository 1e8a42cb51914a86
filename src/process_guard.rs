//! Process lifecycle management for child processes
//!
//! Every external command the installer runs (pip, nvcc, the interpreter) is a
//! child of this process. This module makes sure none of them outlive it.
//!
//! # Mechanism
//! - Children are spawned in their own process group with a parent death signal
//! - Running children are tracked in a global registry
//! - A signal thread raises the shared [`InterruptFlag`]; if nothing is running
//!   it exits immediately, otherwise the owner of the child stops it
//! - [`GuardedChild`] owns one child for its whole lifetime: SIGTERM to the
//!   group, a grace period, then SIGKILL, on interrupt or on drop

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Global registry of child process IDs
static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// How often a waiting [`GuardedChild`] checks for exit or interrupt
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default time a child gets between SIGTERM and SIGKILL
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Registry tracking all spawned child processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    /// Set of child PIDs currently running
    pids: HashSet<u32>,
    /// Whether cleanup has already been initiated (prevent double-cleanup)
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Register a new child process
    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!("Registered child process PID {}", pid);
    }

    /// Unregister a child process (called when it has been reaped)
    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!("Unregistered child process PID {}", pid);
    }

    /// Get count of tracked children
    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate all tracked child processes
    /// Sends SIGTERM first, waits up to `grace_period`, then SIGKILL
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            debug!("Cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            debug!("No child processes to terminate");
            return;
        }

        info!("Terminating {} child process(es)...", self.pids.len());

        let pids_to_kill: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids_to_kill {
            signal_tree(pid, Signal::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids_to_kill.iter().all(|&pid| !is_process_alive(pid)) {
                info!("All child processes terminated gracefully");
                self.pids.clear();
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }

        for &pid in &pids_to_kill {
            if is_process_alive(pid) {
                warn!("Process group {} did not terminate, sending SIGKILL", pid);
                signal_tree(pid, Signal::SIGKILL);
            }
        }

        self.pids.clear();
        info!("Child process cleanup complete");
    }
}

/// Run `f` against the global registry, tolerating a poisoned lock
fn with_registry<T>(f: impl FnOnce(&mut ChildRegistry) -> T) -> Option<T> {
    match ChildRegistry::global().lock() {
        Ok(mut registry) => Some(f(&mut registry)),
        Err(e) => {
            warn!("Child registry lock poisoned: {}", e);
            None
        }
    }
}

/// Send a signal to a process
fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Send a signal to an entire process group
/// Uses negative PID so that grandchildren (compilers spawned by pip) are reached too
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Signal the process group led by `pid`, falling back to the process itself
fn signal_tree(pid: u32, signal: Signal) {
    if let Err(e) = send_signal_to_group(pid, signal) {
        debug!("Failed to send {:?} to process group {}: {}", signal, pid, e);
        if let Err(e2) = send_signal(pid, signal) {
            debug!("Failed to send {:?} to PID {}: {}", signal, pid, e2);
        }
    } else {
        debug!("Sent {:?} to process group {}", signal, pid);
    }
}

/// Check if a process is still alive (not dead or zombie)
pub fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/pid/stat is the state; Z and X are not running
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }

    true
}

/// Shared flag raised by the signal thread when an interrupt arrives
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    /// Create a flag that has not been raised
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the run as interrupted
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once an interrupt has been received
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// RAII guard that terminates all remaining children on drop
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    /// Create a new process guard attached to the global registry
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        debug!("ProcessGuard dropped, initiating cleanup");
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(DEFAULT_GRACE_PERIOD);
        }
    }
}

/// Install signal handlers for SIGINT (Ctrl+C), SIGTERM and SIGHUP
///
/// Each signal raises `flag`. When no child is registered there is nothing
/// to stop, so the process exits with `128 + signal` straight away.
/// Call this once at program start.
pub fn init_signal_handlers(flag: InterruptFlag) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::spawn(move || {
        for sig in signals.forever() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };

            flag.raise();
            let running = with_registry(|r| r.count()).unwrap_or(0);
            if running == 0 {
                info!("Received {} with no running command, exiting", signal_name);
                std::process::exit(128 + sig);
            }
            info!(
                "Received {}, stopping {} running command(s)",
                signal_name, running
            );
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Configure the command to run in its own process group
    /// This allows us to kill the entire process tree with a single signal
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe setpgid and prctl
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                // Child dies if the installer dies, so a build never runs orphaned
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}

/// How a guarded wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The child exited on its own
    Exited(ExitStatus),
    /// The interrupt flag was raised and the child was terminated
    Interrupted,
}

/// A child process owned for exactly as long as this value lives
///
/// The child is registered globally on spawn and unregistered once reaped.
/// Dropping an unreaped `GuardedChild` terminates its process group.
#[derive(Debug)]
pub struct GuardedChild {
    child: Child,
    pid: u32,
    grace: Duration,
    reaped: bool,
}

impl GuardedChild {
    /// Spawn `cmd` in a new process group and register it
    pub fn spawn(cmd: &mut Command, grace: Duration) -> std::io::Result<Self> {
        let child = cmd.in_new_process_group().spawn()?;
        let pid = child.id();
        with_registry(|r| r.register(pid));
        Ok(Self {
            child,
            pid,
            grace,
            reaped: false,
        })
    }

    /// PID of the child (also its process group ID)
    pub fn id(&self) -> u32 {
        self.pid
    }

    /// Take the piped stdout handle, if any
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the piped stderr handle, if any
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the child, terminating it if `interrupt` is raised first
    ///
    /// There is no timeout; a source build can legitimately run for hours.
    pub fn wait_interruptible(&mut self, interrupt: &InterruptFlag) -> std::io::Result<WaitOutcome> {
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.mark_reaped();
                return Ok(WaitOutcome::Exited(status));
            }
            if interrupt.is_raised() {
                warn!("Interrupt received, terminating PID {}", self.pid);
                self.terminate();
                return Ok(WaitOutcome::Interrupted);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// SIGTERM the group, wait out the grace period, then SIGKILL and reap
    fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        signal_tree(self.pid, Signal::SIGTERM);

        let start = Instant::now();
        while start.elapsed() < self.grace {
            match self.child.try_wait() {
                Ok(Some(_)) => {
                    self.mark_reaped();
                    return;
                }
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(e) => {
                    warn!("Failed to poll PID {}: {}", self.pid, e);
                    break;
                }
            }
        }

        warn!("PID {} did not terminate, sending SIGKILL", self.pid);
        signal_tree(self.pid, Signal::SIGKILL);
        if let Err(e) = self.child.wait() {
            warn!("Failed to reap PID {}: {}", self.pid, e);
        }
        self.mark_reaped();
    }

    fn mark_reaped(&mut self) {
        self.reaped = true;
        let pid = self.pid;
        with_registry(|r| r.unregister(pid));
    }
}

impl Drop for GuardedChild {
    fn drop(&mut self) {
        if !self.reaped {
            debug!("GuardedChild {} dropped while running", self.pid);
            self.terminate();
        }
    }
}
