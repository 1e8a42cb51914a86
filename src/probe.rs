//! Environment probing
//!
//! Gathers the facts the installer logs and gates on: interpreter version,
//! torch and its CUDA toolkit version, the first CUDA device, `nvcc`, and free
//! disk space.
//!
//! # Rules
//!
//! - Every probe is best-effort and degrades into a warning
//! - Except one: if torch cannot be imported the run is aborted
//! - Low disk space warns, it never aborts

use crate::command::{CommandRunner, CommandSpec};
use crate::error::{InstallerError, Result};
use crate::report::Reporter;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use tracing::debug;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Prints one JSON object describing the interpreter and torch
const PROBE_SCRIPT: &str = r#"import json, sys
info = {"python": "%d.%d.%d" % tuple(sys.version_info[:3])}
try:
    import torch
except Exception as e:
    info["torch_error"] = str(e)
else:
    info["torch"] = torch.__version__
    info["cuda"] = torch.version.cuda
    try:
        if torch.cuda.is_available():
            info["device"] = torch.cuda.get_device_name(0)
    except Exception as e:
        info["device_error"] = str(e)
print(json.dumps(info))
"#;

#[derive(Debug, Deserialize)]
struct RawProbe {
    python: String,
    torch: Option<String>,
    cuda: Option<String>,
    device: Option<String>,
    torch_error: Option<String>,
    device_error: Option<String>,
}

/// torch as seen from the target interpreter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub torch_version: String,
    /// CUDA toolkit torch was built against; None for CPU-only builds
    pub cuda_version: Option<String>,
    /// Name of device 0 when CUDA is available
    pub device: Option<String>,
}

/// Read-only facts gathered once per run
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentSnapshot {
    pub python_version: String,
    pub runtime: RuntimeInfo,
    /// `nvcc` release, e.g. "12.1"
    pub nvcc_release: Option<String>,
    pub free_space_bytes: Option<u64>,
}

/// Free space in GiB, for display and threshold checks
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Gib(pub f64);

impl Gib {
    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes as f64 / BYTES_PER_GIB)
    }
}

impl fmt::Display for Gib {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}GB", self.0)
    }
}

impl EnvironmentSnapshot {
    pub fn free_space(&self) -> Option<Gib> {
        self.free_space_bytes.map(Gib::from_bytes)
    }

    /// True when free space is known and below `threshold_gb`
    pub fn is_low_on_space(&self, threshold_gb: f64) -> bool {
        self.free_space().is_some_and(|gib| gib.0 < threshold_gb)
    }

    pub fn has_device(&self) -> bool {
        self.runtime.device.is_some()
    }
}

/// Capability to inspect the host environment
pub trait EnvironmentProbe {
    /// Gather a snapshot, logging each fact.
    ///
    /// Returns [`InstallerError::RuntimeMissing`] when torch is unusable.
    fn probe(&self, reporter: &mut Reporter) -> Result<EnvironmentSnapshot>;
}

/// Probe that asks the real interpreter, `nvcc` and the filesystem
pub struct SystemProbe<'a, R: CommandRunner> {
    runner: &'a R,
    python: String,
    disk_path: &'a Path,
    min_free_space_gb: f64,
}

impl<'a, R: CommandRunner> SystemProbe<'a, R> {
    pub fn new(runner: &'a R, python: &str, disk_path: &'a Path, min_free_space_gb: f64) -> Self {
        Self {
            runner,
            python: python.to_string(),
            disk_path,
            min_free_space_gb,
        }
    }

    fn probe_runtime(&self, reporter: &mut Reporter) -> Result<(String, RuntimeInfo)> {
        let spec = CommandSpec::new(&self.python).arg("-c").arg(PROBE_SCRIPT);
        let output = match self.runner.capture(&spec) {
            Ok(output) => output,
            Err(e @ InstallerError::Interrupted) => return Err(e),
            Err(e) => {
                return Err(InstallerError::runtime_missing(format!(
                    "cannot run {}: {}",
                    self.python, e
                )));
            }
        };
        if !output.success() {
            return Err(InstallerError::runtime_missing(format!(
                "{} failed ({}): {}",
                self.python, output.status, output.stderr
            )));
        }

        let raw = parse_probe_output(&output.stdout).map_err(|e| {
            InstallerError::runtime_missing(format!(
                "{} did not report its environment: {}",
                self.python, e
            ))
        })?;
        if let Some(err) = &raw.device_error {
            reporter.warning(format!("CUDA device query failed: {}", err));
        }
        let torch_version = match raw.torch {
            Some(version) => version,
            None => {
                let reason = raw.torch_error.unwrap_or_else(|| "not importable".to_string());
                return Err(InstallerError::runtime_missing(format!(
                    "PyTorch is not installed: {}",
                    reason
                )));
            }
        };

        Ok((
            raw.python,
            RuntimeInfo {
                torch_version,
                cuda_version: raw.cuda,
                device: raw.device,
            },
        ))
    }

    fn probe_nvcc(&self) -> Option<String> {
        let spec = CommandSpec::new("nvcc").arg("--version");
        match self.runner.capture(&spec) {
            Ok(output) if output.success() => parse_nvcc_release(&output.stdout),
            Ok(output) => {
                debug!("nvcc --version failed: {}", output.status);
                None
            }
            Err(e) => {
                debug!("nvcc unavailable: {}", e);
                None
            }
        }
    }
}

impl<R: CommandRunner> EnvironmentProbe for SystemProbe<'_, R> {
    fn probe(&self, reporter: &mut Reporter) -> Result<EnvironmentSnapshot> {
        reporter.info("Checking system environment...");

        let (python_version, runtime) = self.probe_runtime(reporter)?;
        reporter.info(format!("Python version: {}", python_version));
        reporter.info(format!("PyTorch version: {}", runtime.torch_version));
        match &runtime.cuda_version {
            Some(cuda) => reporter.info(format!("Torch CUDA version: {}", cuda)),
            None => reporter.warning("PyTorch was built without CUDA"),
        }
        match &runtime.device {
            Some(name) => reporter.info(format!("GPU: {}", name)),
            None => reporter.warning("No CUDA GPU detected"),
        }

        let nvcc_release = self.probe_nvcc();
        match &nvcc_release {
            Some(release) => reporter.info(format!("NVCC: {}", release)),
            None => reporter.warning("NVCC compiler not found"),
        }

        let free_space_bytes = free_space_bytes(self.disk_path);
        let snapshot = EnvironmentSnapshot {
            python_version,
            runtime,
            nvcc_release,
            free_space_bytes,
        };

        match snapshot.free_space() {
            Some(gib) => {
                reporter.info(format!("Free disk space: {}", gib));
                if snapshot.is_low_on_space(self.min_free_space_gb) {
                    reporter.warning(format!(
                        "Less than {}GB of free disk space, a source build may fail",
                        self.min_free_space_gb
                    ));
                }
            }
            None => reporter.warning(format!(
                "Could not determine free space on {}",
                self.disk_path.display()
            )),
        }

        Ok(snapshot)
    }
}

fn parse_probe_output(stdout: &str) -> Result<RawProbe> {
    // The JSON object is the last line; site hooks may print before it
    let line = stdout
        .lines()
        .rev()
        .find(|l| l.trim_start().starts_with('{'))
        .ok_or_else(|| InstallerError::general("environment probe printed no JSON"))?;
    Ok(serde_json::from_str(line)?)
}

/// Extract "12.1" from `Cuda compilation tools, release 12.1, V12.1.105`
pub fn parse_nvcc_release(output: &str) -> Option<String> {
    let (_, after) = output.split_once("release")?;
    let release = after.split(',').next()?.trim();
    if release.is_empty() {
        None
    } else {
        Some(release.to_string())
    }
}

/// Bytes available to unprivileged users on the filesystem holding `path`
pub fn free_space_bytes(path: &Path) -> Option<u64> {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => Some(stat.blocks_available() as u64 * stat.fragment_size() as u64),
        Err(e) => {
            debug!("statvfs({}) failed: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::command::{CommandOutput, CommandStatus};
    use crate::report::tests::capturing;

    /// Runner answering the probe script and `nvcc` with canned output
    pub(crate) struct CannedRunner {
        pub(crate) probe_stdout: String,
        pub(crate) probe_code: i32,
        pub(crate) nvcc_stdout: Option<String>,
    }

    impl CommandRunner for CannedRunner {
        fn capture(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            let (stdout, code) = if spec.program == "nvcc" {
                match &self.nvcc_stdout {
                    Some(out) => (out.clone(), 0),
                    None => {
                        return Err(InstallerError::spawn(
                            "nvcc",
                            std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                        ));
                    }
                }
            } else {
                (self.probe_stdout.clone(), self.probe_code)
            };
            Ok(CommandOutput {
                stdout,
                stderr: String::new(),
                status: CommandStatus::from_code(code),
            })
        }

        fn stream(&self, _spec: &CommandSpec) -> Result<CommandStatus> {
            Ok(CommandStatus::from_code(0))
        }
    }

    const NVCC_OUTPUT: &str = "nvcc: NVIDIA (R) Cuda compiler driver\n\
        Copyright (c) 2005-2023 NVIDIA Corporation\n\
        Cuda compilation tools, release 12.1, V12.1.105\n\
        Build cuda_12.1.r12.1/compiler.32688072_0";

    #[test]
    fn test_parse_nvcc_release() {
        assert_eq!(parse_nvcc_release(NVCC_OUTPUT), Some("12.1".to_string()));
        assert_eq!(parse_nvcc_release("garbage"), None);
        assert_eq!(parse_nvcc_release("release , "), None);
    }

    #[test]
    fn test_parse_probe_output_skips_noise() {
        let out = "some warning\n{\"python\": \"3.10.12\", \"torch\": \"2.6.0\", \"cuda\": \"12.4\"}";
        let raw = parse_probe_output(out).expect("parse");
        assert_eq!(raw.python, "3.10.12");
        assert_eq!(raw.torch.as_deref(), Some("2.6.0"));
        assert!(raw.device.is_none());
    }

    #[test]
    fn test_probe_full_environment() {
        let runner = CannedRunner {
            probe_stdout: r#"{"python": "3.10.12", "torch": "2.6.0", "cuda": "12.4", "device": "NVIDIA A100"}"#
                .to_string(),
            probe_code: 0,
            nvcc_stdout: Some(NVCC_OUTPUT.to_string()),
        };
        let (mut reporter, buffer) = capturing();

        let snapshot = SystemProbe::new(&runner, "python3", Path::new("/"), 0.0)
            .probe(&mut reporter)
            .expect("probe");

        assert_eq!(snapshot.runtime.torch_version, "2.6.0");
        assert_eq!(snapshot.runtime.cuda_version.as_deref(), Some("12.4"));
        assert!(snapshot.has_device());
        assert_eq!(snapshot.nvcc_release.as_deref(), Some("12.1"));
        let out = buffer.contents();
        assert!(out.contains("[INFO] GPU: NVIDIA A100"));
        assert!(!out.contains("[WARNING]"));
    }

    #[test]
    fn test_missing_device_and_nvcc_only_warn() {
        let runner = CannedRunner {
            probe_stdout: r#"{"python": "3.11.4", "torch": "2.6.0+cpu", "cuda": null}"#.to_string(),
            probe_code: 0,
            nvcc_stdout: None,
        };
        let (mut reporter, buffer) = capturing();

        let snapshot = SystemProbe::new(&runner, "python3", Path::new("/"), 0.0)
            .probe(&mut reporter)
            .expect("probe should not abort");

        assert!(!snapshot.has_device());
        assert!(snapshot.nvcc_release.is_none());
        let out = buffer.contents();
        assert!(out.contains("[WARNING] No CUDA GPU detected"));
        assert!(out.contains("[WARNING] NVCC compiler not found"));
    }

    #[test]
    fn test_missing_torch_is_hard_failure() {
        let runner = CannedRunner {
            probe_stdout: r#"{"python": "3.11.4", "torch_error": "No module named 'torch'"}"#.to_string(),
            probe_code: 0,
            nvcc_stdout: Some(NVCC_OUTPUT.to_string()),
        };

        let err = SystemProbe::new(&runner, "python3", Path::new("/"), 5.0)
            .probe(&mut Reporter::quiet())
            .expect_err("torch missing must abort");

        assert!(matches!(err, InstallerError::RuntimeMissing(_)));
        assert!(err.to_string().contains("No module named 'torch'"));
    }

    #[test]
    fn test_interpreter_failure_is_hard_failure() {
        let runner = CannedRunner {
            probe_stdout: String::new(),
            probe_code: 127,
            nvcc_stdout: None,
        };
        let err = SystemProbe::new(&runner, "python3", Path::new("/"), 5.0)
            .probe(&mut Reporter::quiet())
            .expect_err("must abort");
        assert!(matches!(err, InstallerError::RuntimeMissing(_)));
    }

    #[test]
    fn test_unreadable_report_is_hard_failure() {
        let runner = CannedRunner {
            probe_stdout: "sitecustomize loaded\n".to_string(),
            probe_code: 0,
            nvcc_stdout: None,
        };
        let err = SystemProbe::new(&runner, "python3", Path::new("/"), 5.0)
            .probe(&mut Reporter::quiet())
            .expect_err("must abort");
        assert!(matches!(err, InstallerError::RuntimeMissing(_)));
        assert!(err.to_string().contains("printed no JSON"));
    }

    #[test]
    fn test_low_space_threshold() {
        let snapshot = EnvironmentSnapshot {
            python_version: "3.10.0".to_string(),
            runtime: RuntimeInfo {
                torch_version: "2.6.0".to_string(),
                cuda_version: None,
                device: None,
            },
            nvcc_release: None,
            free_space_bytes: Some(4 * 1024 * 1024 * 1024),
        };
        assert!(snapshot.is_low_on_space(5.0));
        assert!(!snapshot.is_low_on_space(4.0));
        assert_eq!(snapshot.free_space().expect("known").to_string(), "4.0GB");
    }

    #[test]
    fn test_free_space_of_root_is_known() {
        assert!(free_space_bytes(Path::new("/")).is_some());
        assert!(free_space_bytes(Path::new("/nonexistent/path/for/statvfs")).is_none());
    }
}
