//! attn-install - Main entry point
//!
//! Parses the command line, loads configuration, wires the real runner,
//! probe and verifier into the orchestrator, and maps the outcome to an exit code.

use anyhow::Context;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use attn_install::cleaner::CacheCleaner;
use attn_install::cli::{Cli, Commands, InstallArgs};
use attn_install::orchestrator::{Options, Orchestrator, Outcome};
use attn_install::process_guard::{self, InterruptFlag, ProcessGuard};
use attn_install::prompt::{Confirm, LinePrompt, Preset};
use attn_install::report::{color_enabled, Reporter};
use attn_install::{InstallerConfig, PythonVerifier, SystemProbe, SystemRunner};

/// Initialize diagnostics on stderr; `RUST_LOG` overrides the default `warn`
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_logger();
    info!("attn-install starting up");

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed: {:?}", cli);

    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("✗ {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<InstallerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {:?}", path);
            InstallerConfig::load_from_file(path)?
        }
        None => InstallerConfig::default(),
    };
    if let Some(python) = &cli.python {
        config.python = python.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn run(cli: &Cli) -> anyhow::Result<u8> {
    let config = load_config(cli)?;

    let interrupt = InterruptFlag::new();
    if let Err(e) = process_guard::init_signal_handlers(interrupt.clone()) {
        // Children still die with us through the parent death signal
        warn!("Failed to initialize signal handlers: {}", e);
    }
    let _guard = ProcessGuard::new();

    let runner = SystemRunner::new(interrupt);
    let mut reporter = Reporter::stdout(color_enabled(cli.no_color));

    let code = match cli.resolved_command() {
        Commands::ShowConfig => {
            println!("{}", config.to_json()?);
            0
        }
        Commands::Clean => {
            let home = std::env::var_os("HOME").map(PathBuf::from);
            CacheCleaner::new(&runner, &config.python, config.resolved_cache_dirs(home.as_deref()))
                .clean(&mut reporter)?;
            0
        }
        Commands::Check => {
            let probe = system_probe(&runner, &config);
            let verifier = PythonVerifier::new(&runner, &config.python, &config.package);
            let outcome = Orchestrator::new(&runner, &config, &probe, &verifier).check(&mut reporter);
            exit_code(&outcome)
        }
        Commands::Install(args) => {
            reporter.banner(&format!("attn-install: {} installer", config.package.module));
            let probe = system_probe(&runner, &config);
            let verifier = PythonVerifier::new(&runner, &config.python, &config.package);
            let mut prompt = prompt_for(&args);
            let options = Options {
                skip_clean: args.skip_clean,
            };

            let mut orchestrator =
                Orchestrator::new(&runner, &config, &probe, &verifier).with_options(options);
            let outcome = orchestrator.install(prompt.as_mut(), &mut reporter);
            debug!("Visited stages: {:?}", orchestrator.stages());

            if let Outcome::Installed { path, version } = &outcome {
                reporter.success(format!(
                    "{} {} installed via {}",
                    config.package.module, version, path
                ));
            }
            exit_code(&outcome)
        }
    };

    Ok(code)
}

fn system_probe<'a>(runner: &'a SystemRunner, config: &'a InstallerConfig) -> SystemProbe<'a, SystemRunner> {
    SystemProbe::new(runner, &config.python, &config.disk_path, config.min_free_space_gb)
}

fn prompt_for(args: &InstallArgs) -> Box<dyn Confirm> {
    if args.yes {
        Box::new(Preset(true))
    } else if args.no_source_build {
        Box::new(Preset(false))
    } else {
        Box::new(LinePrompt::stdio())
    }
}

fn exit_code(outcome: &Outcome) -> u8 {
    info!("Run finished: {:?}", outcome);
    outcome.exit_code() as u8
}
