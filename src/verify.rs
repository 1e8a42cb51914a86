//! Functional verification of the installed library
//!
//! Three checks run in order inside the target interpreter: import the module
//! and read its version, resolve the entry point, import the auxiliary module.
//! A failing first check means the library is absent; a later failure means
//! it is installed but not usable.

use crate::command::{CommandRunner, CommandSpec};
use crate::config::TargetPackage;
use crate::error::Result;
use crate::report::Reporter;
use std::fmt::Write as _;

/// Exit code the check script uses when the import itself fails
const EXIT_ABSENT: i32 = 10;
/// Exit code for a failure in either of the later checks
const EXIT_PARTIAL: i32 = 11;

/// Outcome of a verification pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Every check passed
    Functional { version: String },
    /// The module imports but part of its API is broken
    Partial { version: String, reason: String },
    /// The module could not be imported
    Absent { reason: String },
}

impl Verification {
    pub fn is_functional(&self) -> bool {
        matches!(self, Self::Functional { .. })
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            Self::Functional { version } | Self::Partial { version, .. } => Some(version),
            Self::Absent { .. } => None,
        }
    }
}

/// Capability to check whether the library is usable
pub trait LibraryVerifier {
    fn verify(&self, reporter: &mut Reporter) -> Result<Verification>;
}

/// Verifier that runs the checks in the target interpreter
pub struct PythonVerifier<'a, R: CommandRunner> {
    runner: &'a R,
    python: String,
    package: TargetPackage,
}

impl<'a, R: CommandRunner> PythonVerifier<'a, R> {
    pub fn new(runner: &'a R, python: &str, package: &TargetPackage) -> Self {
        Self {
            runner,
            python: python.to_string(),
            package: package.clone(),
        }
    }
}

/// Build the check script. Names were validated as identifiers by the config.
pub fn check_script(package: &TargetPackage) -> String {
    let mut script = String::new();
    let _ = writeln!(script, "import sys");
    let _ = writeln!(script, "try:");
    let _ = writeln!(script, "    import {}", package.module);
    let _ = writeln!(
        script,
        "    print('version=' + str(getattr({}, '__version__', 'unknown')))",
        package.module
    );
    let _ = writeln!(script, "except Exception as e:");
    let _ = writeln!(script, "    print('error=%s: %s' % (type(e).__name__, e))");
    let _ = writeln!(script, "    sys.exit({})", EXIT_ABSENT);
    let _ = writeln!(script, "try:");
    let _ = writeln!(script, "    from {} import {}", package.module, package.entry_point);
    let _ = writeln!(script, "    print('entry=ok')");
    if package.aux_symbols.is_empty() {
        let _ = writeln!(script, "    import {}", package.aux_module);
    } else {
        let _ = writeln!(
            script,
            "    from {} import {}",
            package.aux_module,
            package.aux_symbols.join(", ")
        );
    }
    let _ = writeln!(script, "    print('aux=ok')");
    let _ = writeln!(script, "except Exception as e:");
    let _ = writeln!(script, "    print('error=%s: %s' % (type(e).__name__, e))");
    let _ = writeln!(script, "    sys.exit({})", EXIT_PARTIAL);
    script
}

/// Lines the check script printed, keyed by their `key=` prefix
#[derive(Debug, Default)]
struct CheckLines {
    version: Option<String>,
    entry_ok: bool,
    aux_ok: bool,
    error: Option<String>,
}

fn parse_check_output(stdout: &str) -> CheckLines {
    let mut lines = CheckLines::default();
    for line in stdout.lines() {
        if let Some(v) = line.strip_prefix("version=") {
            lines.version = Some(v.trim().to_string());
        } else if line == "entry=ok" {
            lines.entry_ok = true;
        } else if line == "aux=ok" {
            lines.aux_ok = true;
        } else if let Some(e) = line.strip_prefix("error=") {
            lines.error = Some(e.trim().to_string());
        }
    }
    lines
}

impl<R: CommandRunner> LibraryVerifier for PythonVerifier<'_, R> {
    fn verify(&self, reporter: &mut Reporter) -> Result<Verification> {
        let name = &self.package.module;
        reporter.info(format!("Testing {} installation...", name));

        let spec = CommandSpec::new(&self.python)
            .arg("-c")
            .arg(check_script(&self.package));
        let output = match self.runner.capture(&spec) {
            Ok(output) => output,
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e) => {
                let reason = e.to_string();
                reporter.error(format!("{} import failed: {}", name, reason));
                return Ok(Verification::Absent { reason });
            }
        };

        let lines = parse_check_output(&output.stdout);
        let reason = || {
            lines
                .error
                .clone()
                .or_else(|| (!output.stderr.is_empty()).then(|| output.stderr.clone()))
                .unwrap_or_else(|| format!("check script ended with {}", output.status))
        };

        let Some(version) = lines.version.clone() else {
            let reason = reason();
            reporter.error(format!("{} import failed: {}", name, reason));
            return Ok(Verification::Absent { reason });
        };
        reporter.success(format!("{} imported, version {}", name, version));

        if lines.entry_ok {
            reporter.success(format!("{} is available", self.package.entry_point));
        }
        if lines.aux_ok {
            reporter.success(format!("{} module is available", self.package.aux_module));
        }

        if output.success() && lines.entry_ok && lines.aux_ok {
            reporter.success(format!("{} is fully functional", name));
            Ok(Verification::Functional { version })
        } else {
            let reason = reason();
            reporter.warning(format!("{} is only partially functional: {}", name, reason));
            Ok(Verification::Partial { version, reason })
        }
    }
}
