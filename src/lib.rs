//! attn-install library
//!
//! Installs flash-attn (or any similarly packaged attention library) into a
//! Python/CUDA environment: probe, verify, try precompiled builds in order,
//! and fall back to a source build after confirmation.

pub mod cleaner;
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pip;
pub mod precompiled;
pub mod probe;
pub mod process_guard;
pub mod prompt;
pub mod report;
pub mod source_build;
pub mod verify;

// Re-export main types for convenience
pub use command::{CommandOutput, CommandRunner, CommandSpec, CommandStatus, SystemRunner};
pub use config::InstallerConfig;
pub use error::InstallerError;
pub use orchestrator::{InstallPath, Options, Orchestrator, Outcome, Stage};
pub use precompiled::{first_success, PrecompiledInstaller, Strategy};
pub use probe::{EnvironmentProbe, EnvironmentSnapshot, SystemProbe};
pub use process_guard::{ChildRegistry, CommandProcessGroup, GuardedChild, InterruptFlag, ProcessGuard};
pub use prompt::{Confirm, LinePrompt, Preset};
pub use report::{Level, Reporter};
pub use source_build::{BuildOutcome, SourceInstaller};
pub use verify::{LibraryVerifier, PythonVerifier, Verification};
