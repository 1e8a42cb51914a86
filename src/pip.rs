//! Type-safe pip invocation contracts.
//!
//! Every package-manager call is a struct implementing [`PipArgs`]. The struct
//! defines the exact arguments and child-only environment, and
//! [`pip_command`] turns it into a [`CommandSpec`] for the configured
//! interpreter (`<python> -m pip ...`).

use crate::command::CommandSpec;

/// Trait for typed pip arguments.
///
/// # Contract
///
/// - `to_cli_args()`: arguments after `-m pip`, e.g. `["install", "flash-attn==2.7.4.post1"]`
/// - `get_env_vars()`: environment for the pip child only; empty by default
pub trait PipArgs {
    fn to_cli_args(&self) -> Vec<String>;

    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Build the command that runs `args` through `python -m pip`
pub fn pip_command<T: PipArgs + ?Sized>(python: &str, args: &T) -> CommandSpec {
    let mut spec = CommandSpec::new(python).args(["-m", "pip"]).args(args.to_cli_args());
    for (key, value) in args.get_env_vars() {
        spec = spec.env(key, value);
    }
    spec
}

/// `pip install` of one or more requirement specifiers, names or wheel URLs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipInstallArgs {
    pub requirements: Vec<String>,
    /// `--no-cache-dir`
    pub no_cache: bool,
    /// `--no-build-isolation`, needed to build against the installed torch
    pub no_build_isolation: bool,
    /// `--find-links <url>`
    pub find_links: Option<String>,
    /// Passed through verbatim after everything else
    pub extra_args: Vec<String>,
}

impl PipArgs for PipInstallArgs {
    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["install".to_string()];
        if self.no_cache {
            args.push("--no-cache-dir".to_string());
        }
        if self.no_build_isolation {
            args.push("--no-build-isolation".to_string());
        }
        args.extend(self.requirements.iter().cloned());
        if let Some(url) = &self.find_links {
            args.push("--find-links".to_string());
            args.push(url.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// `pip uninstall -y <packages>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipUninstallArgs {
    pub packages: Vec<String>,
}

impl PipArgs for PipUninstallArgs {
    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["uninstall".to_string(), "-y".to_string()];
        args.extend(self.packages.iter().cloned());
        args
    }
}

/// `pip cache purge`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipCachePurgeArgs;

impl PipArgs for PipCachePurgeArgs {
    fn to_cli_args(&self) -> Vec<String> {
        vec!["cache".to_string(), "purge".to_string()]
    }
}

/// Source build: a no-cache, no-isolation install plus the build environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBuildArgs {
    pub requirement: String,
    /// `TORCH_CUDA_ARCH_LIST`, joined with `;`
    pub cuda_arch_list: Vec<String>,
    /// `FLASH_ATTENTION_FORCE_BUILD=TRUE` when set
    pub force_build: bool,
    /// `MAX_JOBS`
    pub max_jobs: u32,
}

impl PipArgs for SourceBuildArgs {
    fn to_cli_args(&self) -> Vec<String> {
        PipInstallArgs {
            requirements: vec![self.requirement.clone()],
            no_cache: true,
            no_build_isolation: true,
            ..Default::default()
        }
        .to_cli_args()
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        vec![
            ("TORCH_CUDA_ARCH_LIST".to_string(), self.cuda_arch_list.join(";")),
            (
                "FLASH_ATTENTION_FORCE_BUILD".to_string(),
                if self.force_build { "TRUE" } else { "FALSE" }.to_string(),
            ),
            ("MAX_JOBS".to_string(), self.max_jobs.to_string()),
        ]
    }
}
