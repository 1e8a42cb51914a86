use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// attn-install - install and verify flash-attn in a Python/CUDA environment
#[derive(Parser, Debug)]
#[command(name = "attn-install")]
#[command(about = "Installs a GPU attention library, falling back from prebuilt wheels to a source build")]
#[command(version)]
pub struct Cli {
    /// JSON configuration file overriding the built-in install policy
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Python interpreter of the target environment (overrides the config file)
    #[arg(long, global = true)]
    pub python: Option<String>,

    /// Disable coloured level tags
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the full install: verify, precompiled strategies, then optional source build
    Install(InstallArgs),
    /// Probe the environment and verify the library without installing anything
    Check,
    /// Purge the pip cache and recreate the temporary directories
    Clean,
    /// Print the effective configuration as JSON
    ShowConfig,
}

#[derive(clap::Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallArgs {
    /// Build from source without asking if precompiled installation fails
    #[arg(short, long, conflicts_with = "no_source_build")]
    pub yes: bool,

    /// Never build from source and never ask
    #[arg(long)]
    pub no_source_build: bool,

    /// Do not purge caches or temporary directories
    #[arg(long)]
    pub skip_clean: bool,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// The command to run; a bare invocation means `install` with default flags
    pub fn resolved_command(&self) -> Commands {
        self.command
            .clone()
            .unwrap_or_else(|| Commands::Install(InstallArgs::default()))
    }
}
