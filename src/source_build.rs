//! From-source build fallback.
//!
//! Runs a no-isolation pip install with the build environment set on the
//! child only. The wait is unbounded; an interrupt is the only way to stop it
//! early, and it terminates the build's whole process group.

use crate::command::{CommandRunner, CommandSpec};
use crate::config::SourceBuildConfig;
use crate::error::InstallerError;
use crate::pip::pip_command;
use crate::report::Reporter;

/// How the build ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Succeeded,
    /// Completed with a non-zero code (None if killed by a signal)
    Failed { code: Option<i32> },
    /// Could not be started
    SpawnFailed { reason: String },
    /// Stopped by an interrupt; the child has been terminated
    Interrupted,
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

pub struct SourceInstaller<'a, R: CommandRunner> {
    runner: &'a R,
    command: CommandSpec,
}

impl<'a, R: CommandRunner> SourceInstaller<'a, R> {
    pub fn new(runner: &'a R, python: &str, config: &SourceBuildConfig) -> Self {
        Self {
            runner,
            command: pip_command(python, &config.build_args()),
        }
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    pub fn install(&self, reporter: &mut Reporter) -> BuildOutcome {
        reporter.info("Starting source build...");
        reporter.warning("This can take 1-3 hours, please be patient...");

        reporter.info("Build environment:");
        for (key, value) in &self.command.env {
            reporter.info(format!("{}={}", key, value));
        }

        match self.runner.stream(&self.command) {
            Ok(status) if status.success => {
                reporter.success("Source build installed successfully");
                BuildOutcome::Succeeded
            }
            Ok(status) => {
                reporter.error(format!("Source build failed: {}", status));
                BuildOutcome::Failed { code: status.code }
            }
            Err(InstallerError::Interrupted) => {
                reporter.warning("Build interrupted by user");
                BuildOutcome::Interrupted
            }
            Err(e) => {
                reporter.error(format!("Source build could not start: {}", e));
                BuildOutcome::SpawnFailed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, CommandStatus, SystemRunner};
    use crate::error::Result;
    use crate::process_guard::{is_process_alive, InterruptFlag};
    use crate::report::tests::capturing;
    use std::cell::RefCell;
    use std::thread;
    use std::time::{Duration, Instant};

    struct StubRunner {
        result: RefCell<Option<Result<CommandStatus>>>,
        seen: RefCell<Option<CommandSpec>>,
    }

    impl StubRunner {
        fn new(result: Result<CommandStatus>) -> Self {
            Self {
                result: RefCell::new(Some(result)),
                seen: RefCell::new(None),
            }
        }
    }

    impl CommandRunner for StubRunner {
        fn capture(&self, _spec: &CommandSpec) -> Result<CommandOutput> {
            unreachable!("source builds stream their output")
        }

        fn stream(&self, spec: &CommandSpec) -> Result<CommandStatus> {
            *self.seen.borrow_mut() = Some(spec.clone());
            self.result.borrow_mut().take().expect("called once")
        }
    }

    #[test]
    fn test_success_and_logged_env() {
        let runner = StubRunner::new(Ok(CommandStatus::from_code(0)));
        let (mut reporter, buffer) = capturing();

        let installer = SourceInstaller::new(&runner, "python3", &SourceBuildConfig::default());
        let outcome = installer.install(&mut reporter);

        assert_eq!(outcome, BuildOutcome::Succeeded);
        let out = buffer.contents();
        assert!(out.contains("TORCH_CUDA_ARCH_LIST=7.0;7.5;8.0;8.6;8.9;9.0"));
        assert!(out.contains("FLASH_ATTENTION_FORCE_BUILD=TRUE"));
        assert!(out.contains("MAX_JOBS=4"));
        let seen = runner.seen.borrow();
        let spec = seen.as_ref().expect("stream called");
        assert_eq!(spec, installer.command());
        assert!(spec.has_arg("--no-build-isolation"));
        assert!(spec.has_arg("flash-attn==2.7.4.post1"));
    }

    #[test]
    fn test_nonzero_exit_is_failure() {
        let runner = StubRunner::new(Ok(CommandStatus::from_code(1)));
        let outcome = SourceInstaller::new(&runner, "python3", &SourceBuildConfig::default())
            .install(&mut Reporter::quiet());
        assert_eq!(outcome, BuildOutcome::Failed { code: Some(1) });
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_interrupt_maps_to_interrupted() {
        let runner = StubRunner::new(Err(InstallerError::Interrupted));
        let outcome = SourceInstaller::new(&runner, "python3", &SourceBuildConfig::default())
            .install(&mut Reporter::quiet());
        assert_eq!(outcome, BuildOutcome::Interrupted);
    }

    #[test]
    fn test_real_build_child_is_terminated_on_interrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("pid");
        // Stands in for the interpreter: records its PID, then runs "forever"
        let fake_python = dir.path().join("python");
        std::fs::write(
            &fake_python,
            format!("#!/bin/sh\necho $$ > '{}'\nexec sleep 60\n", pid_file.display()),
        )
        .expect("write script");
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake_python, std::fs::Permissions::from_mode(0o755))
                .expect("chmod");
        }

        let flag = InterruptFlag::new();
        let runner = SystemRunner::new(flag.clone()).with_grace_period(Duration::from_secs(2));
        let raiser = flag.clone();
        let watched = pid_file.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            while !watched.exists() && start.elapsed() < Duration::from_secs(5) {
                thread::sleep(Duration::from_millis(20));
            }
            thread::sleep(Duration::from_millis(100));
            raiser.raise();
        });

        let python = fake_python.to_string_lossy().to_string();
        let outcome = SourceInstaller::new(&runner, &python, &SourceBuildConfig::default())
            .install(&mut Reporter::quiet());
        handle.join().expect("raiser");

        assert_eq!(outcome, BuildOutcome::Interrupted);
        let pid: u32 = std::fs::read_to_string(&pid_file)
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid");
        assert!(!is_process_alive(pid), "build child must not outlive the interrupt");
    }
}
