//! Precompiled installation: the ordered fallback chain.
//!
//! Strategies are tried strictly in declared order and the first success
//! stops the chain. The ordering is policy (most optimized build first, most
//! generic last) and lives in the configuration, not here.

use crate::command::{CommandRunner, CommandSpec, CommandStatus};
use crate::config::StrategyConfig;
use crate::error::{InstallerError, Result};
use crate::pip::pip_command;
use crate::report::Reporter;

/// Default success check: the installer exited with code zero
pub fn exited_zero(status: &CommandStatus) -> bool {
    status.success
}

/// One precompiled attempt: a label, the pip invocation it runs, and how to
/// tell whether it worked
#[derive(Debug, Clone)]
pub struct Strategy {
    pub label: String,
    pub command: CommandSpec,
    pub succeeded: fn(&CommandStatus) -> bool,
}

impl Strategy {
    pub fn new(label: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            label: label.into(),
            command,
            succeeded: exited_zero,
        }
    }

    pub fn from_config(python: &str, config: &StrategyConfig) -> Self {
        Self::new(&config.label, pip_command(python, &config.install_args()))
    }

    /// Replace the exit-zero check
    pub fn with_check(mut self, succeeded: fn(&CommandStatus) -> bool) -> Self {
        self.succeeded = succeeded;
        self
    }
}

/// Try `attempt` on each item in order and return the index of the first success.
///
/// `attempt` is never called again after one returns `Ok(true)`. An `Err`
/// stops the chain and is returned as is.
pub fn first_success<T, F>(items: &[T], mut attempt: F) -> Result<Option<usize>>
where
    F: FnMut(&T) -> Result<bool>,
{
    for (index, item) in items.iter().enumerate() {
        if attempt(item)? {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

pub struct PrecompiledInstaller<'a, R: CommandRunner> {
    runner: &'a R,
    strategies: Vec<Strategy>,
}

impl<'a, R: CommandRunner> PrecompiledInstaller<'a, R> {
    pub fn new(runner: &'a R, strategies: Vec<Strategy>) -> Self {
        Self { runner, strategies }
    }

    pub fn from_config(runner: &'a R, python: &str, strategies: &[StrategyConfig]) -> Self {
        let strategies = strategies
            .iter()
            .map(|s| Strategy::from_config(python, s))
            .collect();
        Self::new(runner, strategies)
    }

    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    /// Run the chain. Returns the winning strategy, or None when all failed.
    ///
    /// A strategy that cannot even be spawned counts as failed. Only an
    /// interrupt aborts the chain.
    pub fn install(&self, reporter: &mut Reporter) -> Result<Option<&Strategy>> {
        reporter.info("Starting precompiled installation...");

        let winner = first_success(&self.strategies, |strategy| {
            reporter.info(format!("Trying: {}", strategy.label));
            match self.runner.stream(&strategy.command) {
                Ok(status) if (strategy.succeeded)(&status) => {
                    reporter.success(format!("{} installed", strategy.label));
                    Ok(true)
                }
                Ok(status) => {
                    reporter.error(format!("{} failed: {}", strategy.label, status));
                    Ok(false)
                }
                Err(InstallerError::Interrupted) => Err(InstallerError::Interrupted),
                Err(e) => {
                    reporter.error(format!("{} failed: {}", strategy.label, e));
                    Ok(false)
                }
            }
        })?;

        Ok(winner.map(|index| &self.strategies[index]))
    }
}
