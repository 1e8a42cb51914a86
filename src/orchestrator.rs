//! Install orchestration
//!
//! Sequences probing, verification, cleanup and the two install tiers into a
//! strictly linear fallback chain with a single user decision point.
//!
//! # Stage Flow
//!
//! ```text
//! CheckEnv ──(runtime missing)──▶ Done: PreconditionFailed
//!     ↓
//! VerifyExisting ──(functional)──▶ Done: AlreadyInstalled
//!     ↓
//! CleanCache
//!     ↓
//! TryPrecompiled ──(installed)──▶ VerifyPrecompiled ──(functional)──▶ Done: Installed
//!     ↓                                   ↓
//! UninstallFailed ◀───────────────────────┘
//!     ↓
//! CleanAfterFailure
//!     ↓
//! PromptUser ──(declined)──▶ Done: Declined
//!     ↓
//! TrySource ──(built)──▶ VerifySource ──(functional)──▶ Done: Installed
//!     ↓                       ↓
//! Done: Failed ◀──────────────┘
//!
//! (An interrupt in any running command ends in Done: Interrupted)
//! ```
//!
//! No stage is retried and no stage is visited twice.

use crate::cleaner::CacheCleaner;
use crate::command::CommandRunner;
use crate::config::InstallerConfig;
use crate::error::{InstallerError, Result};
use crate::pip::{pip_command, PipUninstallArgs};
use crate::precompiled::PrecompiledInstaller;
use crate::probe::EnvironmentProbe;
use crate::prompt::Confirm;
use crate::report::Reporter;
use crate::source_build::{BuildOutcome, SourceInstaller};
use crate::verify::{LibraryVerifier, Verification};
use std::fmt;
use std::path::PathBuf;
use strum::Display;
use tracing::debug;

/// Suggestions printed whenever the run ends without a working library
pub const REMEDIATION: &[&str] = &[
    "Check that the CUDA toolkit is installed correctly",
    "Make sure there is enough free disk space and memory",
    "The project can run without this library (it falls back to PyTorch native attention)",
];

/// Orchestration stages, in the order they can be visited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Stage {
    CheckEnv,
    VerifyExisting,
    CleanCache,
    TryPrecompiled,
    VerifyPrecompiled,
    UninstallFailed,
    CleanAfterFailure,
    PromptUser,
    TrySource,
    VerifySource,
    Done,
}

/// Which tier produced a working installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallPath {
    Precompiled { label: String },
    Source,
}

impl fmt::Display for InstallPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Precompiled { label } => write!(f, "precompiled ({})", label),
            Self::Source => write!(f, "source build"),
        }
    }
}

/// Terminal result of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    AlreadyInstalled { version: String },
    Installed { path: InstallPath, version: String },
    PreconditionFailed(String),
    /// The user said no to the source build
    Declined,
    Failed,
    Interrupted,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::AlreadyInstalled { .. } | Self::Installed { .. })
    }

    /// Process exit code: 0 when a working installation exists, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }
}

/// Run-time switches from the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Skip both cache-cleaning stages
    pub skip_clean: bool,
}

pub struct Orchestrator<'a, R: CommandRunner> {
    runner: &'a R,
    config: &'a InstallerConfig,
    probe: &'a dyn EnvironmentProbe,
    verifier: &'a dyn LibraryVerifier,
    options: Options,
    cache_dirs: Vec<PathBuf>,
    stages: Vec<Stage>,
}

impl<'a, R: CommandRunner> Orchestrator<'a, R> {
    pub fn new(
        runner: &'a R,
        config: &'a InstallerConfig,
        probe: &'a dyn EnvironmentProbe,
        verifier: &'a dyn LibraryVerifier,
    ) -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        Self {
            runner,
            config,
            probe,
            verifier,
            options: Options::default(),
            cache_dirs: config.resolved_cache_dirs(home.as_deref()),
            stages: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Stages visited by the last run, in order
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    fn enter(&mut self, stage: Stage) {
        debug!("Entering stage {}", stage);
        self.stages.push(stage);
    }

    /// Full install run
    pub fn install(&mut self, prompt: &mut dyn Confirm, reporter: &mut Reporter) -> Outcome {
        self.stages.clear();
        let outcome = match self.run_install(prompt, reporter) {
            Ok(outcome) => outcome,
            Err(e) => self.abort(e, reporter),
        };
        self.enter(Stage::Done);
        outcome
    }

    /// Probe and verify only, never installing anything
    pub fn check(&mut self, reporter: &mut Reporter) -> Outcome {
        self.stages.clear();
        let outcome = match self.run_check(reporter) {
            Ok(Verification::Functional { version }) => Outcome::AlreadyInstalled { version },
            Ok(_) => Outcome::Failed,
            Err(e) => self.abort(e, reporter),
        };
        self.enter(Stage::Done);
        outcome
    }

    fn abort(&self, err: InstallerError, reporter: &mut Reporter) -> Outcome {
        match err {
            InstallerError::Interrupted => {
                reporter.error("Installation interrupted");
                Outcome::Interrupted
            }
            InstallerError::RuntimeMissing(reason) => {
                reporter.error(&reason);
                reporter.error("Environment check failed, aborting");
                Outcome::PreconditionFailed(reason)
            }
            other => {
                reporter.error(other);
                Outcome::Failed
            }
        }
    }

    /// CheckEnv then VerifyExisting
    fn run_check(&mut self, reporter: &mut Reporter) -> Result<Verification> {
        self.enter(Stage::CheckEnv);
        let snapshot = self.probe.probe(reporter)?;
        debug!("Environment snapshot: {:?}", snapshot);

        self.enter(Stage::VerifyExisting);
        self.verifier.verify(reporter)
    }

    fn run_install(&mut self, prompt: &mut dyn Confirm, reporter: &mut Reporter) -> Result<Outcome> {
        if let Verification::Functional { version } = self.run_check(reporter)? {
            reporter.success(format!(
                "{} is already installed and functional",
                self.config.package.module
            ));
            return Ok(Outcome::AlreadyInstalled { version });
        }

        self.clean(Stage::CleanCache, reporter)?;

        self.enter(Stage::TryPrecompiled);
        let installer =
            PrecompiledInstaller::from_config(self.runner, &self.config.python, &self.config.strategies);
        if let Some(strategy) = installer.install(reporter)? {
            let label = strategy.label.clone();
            self.enter(Stage::VerifyPrecompiled);
            match self.verifier.verify(reporter)? {
                Verification::Functional { version } => {
                    reporter.success("Precompiled installation succeeded!");
                    return Ok(Outcome::Installed {
                        path: InstallPath::Precompiled { label },
                        version,
                    });
                }
                _ => reporter.warning("Precompiled installation finished but the test failed"),
            }
        }

        self.enter(Stage::UninstallFailed);
        self.uninstall_failed()?;
        self.clean(Stage::CleanAfterFailure, reporter)?;

        self.enter(Stage::PromptUser);
        reporter.plain("");
        reporter.plain("Precompiled installation failed. Try building from source?");
        reporter.plain("Warning: a source build can take 1-3 hours");
        if !prompt.confirm("Continue with source build?") {
            reporter.warning("Source build declined");
            self.report_failure(reporter);
            return Ok(Outcome::Declined);
        }

        self.enter(Stage::TrySource);
        let installer = SourceInstaller::new(self.runner, &self.config.python, &self.config.source_build);
        match installer.install(reporter) {
            BuildOutcome::Succeeded => {
                self.enter(Stage::VerifySource);
                if let Verification::Functional { version } = self.verifier.verify(reporter)? {
                    reporter.success("Source build succeeded!");
                    return Ok(Outcome::Installed {
                        path: InstallPath::Source,
                        version,
                    });
                }
            }
            BuildOutcome::Interrupted => return Err(InstallerError::Interrupted),
            BuildOutcome::Failed { .. } | BuildOutcome::SpawnFailed { .. } => {}
        }

        self.report_failure(reporter);
        Ok(Outcome::Failed)
    }

    fn clean(&mut self, stage: Stage, reporter: &mut Reporter) -> Result<()> {
        if self.options.skip_clean {
            debug!("Skipping {} (--skip-clean)", stage);
            return Ok(());
        }
        self.enter(stage);
        CacheCleaner::new(self.runner, &self.config.python, self.cache_dirs.clone())
            .clean(reporter)
            .map(|_| ())
    }

    /// Quietly remove whatever a failed precompiled attempt left behind
    fn uninstall_failed(&self) -> Result<()> {
        let args = PipUninstallArgs {
            packages: self.config.package.distributions.clone(),
        };
        match self.runner.capture(&pip_command(&self.config.python, &args)) {
            Ok(output) => debug!("pip uninstall finished with {}", output.status),
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e) => debug!("pip uninstall could not run: {}", e),
        }
        Ok(())
    }

    fn report_failure(&self, reporter: &mut Reporter) {
        reporter.error("All installation methods failed");
        reporter.remediation(REMEDIATION);
    }
}
