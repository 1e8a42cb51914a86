//! Installer configuration: what to install, from where, and how to build it.
//!
//! The built-in defaults encode the preferred install policy. A JSON file
//! passed with `--config` may override any part of it; missing fields keep
//! their defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::pip::{PipInstallArgs, SourceBuildArgs};

/// Top-level configuration for one installer run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Interpreter whose environment receives the library; pip runs as `<python> -m pip`
    pub python: String,
    pub package: TargetPackage,
    /// Precompiled strategies, most preferred first
    pub strategies: Vec<StrategyConfig>,
    pub source_build: SourceBuildConfig,
    /// Directories removed and recreated by the cache cleaner (`~` expands to `$HOME`)
    pub cache_dirs: Vec<String>,
    /// Free space on `disk_path` below this many GiB triggers a warning
    pub min_free_space_gb: f64,
    pub disk_path: PathBuf,
}

/// The library being installed and the API surface used to verify it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetPackage {
    /// Distribution names removed after a failed precompiled install
    pub distributions: Vec<String>,
    /// Import name of the library
    pub module: String,
    /// Primary computation entry point, imported from `module`
    pub entry_point: String,
    /// Auxiliary module that must also import
    pub aux_module: String,
    pub aux_symbols: Vec<String>,
}

/// One precompiled install strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub label: String,
    /// Requirement specifiers or wheel URLs
    pub packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub find_links: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl StrategyConfig {
    fn new(label: &str, package: &str) -> Self {
        Self {
            label: label.to_string(),
            packages: vec![package.to_string()],
            find_links: None,
            extra_args: Vec::new(),
        }
    }

    /// The pip install this strategy performs
    pub fn install_args(&self) -> PipInstallArgs {
        PipInstallArgs {
            requirements: self.packages.clone(),
            no_cache: true,
            no_build_isolation: false,
            find_links: self.find_links.clone(),
            extra_args: self.extra_args.clone(),
        }
    }
}

/// Build settings for the from-source fallback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceBuildConfig {
    pub package: String,
    pub cuda_arch_list: Vec<String>,
    pub force_build: bool,
    pub max_jobs: u32,
}

impl SourceBuildConfig {
    pub fn build_args(&self) -> SourceBuildArgs {
        SourceBuildArgs {
            requirement: self.package.clone(),
            cuda_arch_list: self.cuda_arch_list.clone(),
            force_build: self.force_build,
            max_jobs: self.max_jobs,
        }
    }
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            package: TargetPackage::default(),
            strategies: default_strategies(),
            source_build: SourceBuildConfig::default(),
            cache_dirs: vec![
                "/tmp".to_string(),
                "/var/tmp".to_string(),
                "~/.cache".to_string(),
            ],
            min_free_space_gb: 5.0,
            disk_path: PathBuf::from("/"),
        }
    }
}

impl Default for TargetPackage {
    fn default() -> Self {
        Self {
            distributions: vec!["flash-attn".to_string(), "vllm-flash-attn".to_string()],
            module: "flash_attn".to_string(),
            entry_point: "flash_attn_func".to_string(),
            aux_module: "flash_attn.bert_padding".to_string(),
            aux_symbols: vec![
                "index_first_axis".to_string(),
                "pad_input".to_string(),
                "unpad_input".to_string(),
            ],
        }
    }
}

impl Default for SourceBuildConfig {
    fn default() -> Self {
        Self {
            package: "flash-attn==2.7.4.post1".to_string(),
            cuda_arch_list: ["7.0", "7.5", "8.0", "8.6", "8.9", "9.0"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            force_build: true,
            max_jobs: 4,
        }
    }
}

fn default_strategies() -> Vec<StrategyConfig> {
    vec![
        StrategyConfig::new("vllm-flash-attn (vLLM optimized build)", "vllm-flash-attn==2.6.2"),
        StrategyConfig {
            find_links: Some("https://download.pytorch.org/whl/torch_stable.html".to_string()),
            ..StrategyConfig::new("official prebuilt release", "flash-attn==2.6.3")
        },
        StrategyConfig::new(
            "CUDA 11.8 wheel",
            "https://github.com/jllllll/flash-attention/releases/download/v2.7.4.post1/flash_attn-2.7.4.post1%2Bcu118torch2.6cxx11abiFALSE-cp310-cp310-linux_x86_64.whl",
        ),
        StrategyConfig::new("latest stable release", "flash-attn==2.7.4.post1"),
    ]
}

impl InstallerConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Serialize to pretty JSON (the format `load_from_file` reads)
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize configuration to JSON")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.python.trim().is_empty() {
            anyhow::bail!("Python interpreter must be specified");
        }

        if self.strategies.is_empty() {
            anyhow::bail!("At least one precompiled strategy is required");
        }
        for (index, strategy) in self.strategies.iter().enumerate() {
            if strategy.label.trim().is_empty() {
                anyhow::bail!("Strategy #{} has an empty label", index + 1);
            }
            if strategy.packages.iter().all(|p| p.trim().is_empty()) {
                anyhow::bail!("Strategy '{}' installs no packages", strategy.label);
            }
        }

        if self.source_build.package.trim().is_empty() {
            anyhow::bail!("Source build package must be specified");
        }
        if self.source_build.cuda_arch_list.is_empty() {
            anyhow::bail!("Source build needs at least one CUDA architecture");
        }
        if self.source_build.max_jobs == 0 {
            anyhow::bail!("Source build max_jobs must be at least 1");
        }

        if !is_module_path(&self.package.module) {
            anyhow::bail!("Invalid module name: '{}'", self.package.module);
        }
        if !is_module_path(&self.package.aux_module) {
            anyhow::bail!("Invalid auxiliary module name: '{}'", self.package.aux_module);
        }
        let symbols = std::iter::once(&self.package.entry_point).chain(&self.package.aux_symbols);
        for symbol in symbols {
            if !is_identifier(symbol) {
                anyhow::bail!("Invalid symbol name: '{}'", symbol);
            }
        }

        if !self.min_free_space_gb.is_finite() || self.min_free_space_gb < 0.0 {
            anyhow::bail!("min_free_space_gb must be a non-negative number");
        }

        Ok(())
    }

    /// Cache directories with a leading `~` expanded against `home`
    pub fn resolved_cache_dirs(&self, home: Option<&Path>) -> Vec<PathBuf> {
        self.cache_dirs
            .iter()
            .filter_map(|dir| expand_home(dir, home))
            .collect()
    }
}

/// Expand `~` or `~/...`; entries needing a home that is unknown are dropped
fn expand_home(dir: &str, home: Option<&Path>) -> Option<PathBuf> {
    if dir == "~" {
        return home.map(Path::to_path_buf);
    }
    match dir.strip_prefix("~/") {
        Some(rest) => home.map(|h| h.join(rest)),
        None => Some(PathBuf::from(dir)),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_module_path(s: &str) -> bool {
    !s.is_empty() && s.split('.').all(is_identifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = InstallerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.strategies.len(), 4);
        assert_eq!(config.strategies[0].packages, vec!["vllm-flash-attn==2.6.2"]);
        assert_eq!(config.strategies[3].packages, vec!["flash-attn==2.7.4.post1"]);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: InstallerConfig =
            serde_json::from_str(r#"{ "python": "/opt/venv/bin/python" }"#).expect("parse");
        assert_eq!(config.python, "/opt/venv/bin/python");
        assert_eq!(config.source_build.max_jobs, 4);
        assert_eq!(config.package.module, "flash_attn");
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let mut config = InstallerConfig::default();
        config.source_build.max_jobs = 16;

        fs::write(&path, config.to_json().expect("json")).expect("write");
        let loaded = InstallerConfig::load_from_file(&path).expect("load");

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = InstallerConfig::load_from_file("/nonexistent/attn-install.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_empty_strategy_list() {
        let config = InstallerConfig {
            strategies: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_jobs() {
        let mut config = InstallerConfig::default();
        config.source_build.max_jobs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_symbols() {
        let mut config = InstallerConfig::default();
        config.package.entry_point = "flash attn".to_string();
        assert!(config.validate().is_err());

        let mut config = InstallerConfig::default();
        config.package.aux_module = "flash_attn..bert".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolved_cache_dirs_expands_home() {
        let config = InstallerConfig::default();
        let dirs = config.resolved_cache_dirs(Some(Path::new("/home/builder")));
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/tmp"),
                PathBuf::from("/var/tmp"),
                PathBuf::from("/home/builder/.cache"),
            ]
        );

        let without_home = config.resolved_cache_dirs(None);
        assert_eq!(without_home.len(), 2);
    }

    #[test]
    fn test_strategy_install_args_disable_cache() {
        let config = InstallerConfig::default();
        let args = config.strategies[1].install_args();
        assert!(args.no_cache);
        assert!(!args.no_build_isolation);
        assert!(args.find_links.is_some());
    }
}
