//! Console reporting
//!
//! The user-facing log: one `[LEVEL] message` line per event, with the level
//! tag coloured. Diagnostics for developers go through `tracing` instead.

use crossterm::style::Stylize;
use std::fmt::Display;
use std::io::{self, IsTerminal, Write};
use strum::{Display as StrumDisplay, EnumIter};

/// Severity of a console line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, EnumIter)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

impl Level {
    fn tag(self, color: bool) -> String {
        let tag = format!("[{}]", self);
        if !color {
            return tag;
        }
        match self {
            Self::Info => tag.blue().to_string(),
            Self::Success => tag.green().to_string(),
            Self::Warning => tag.yellow().bold().to_string(),
            Self::Error => tag.red().to_string(),
        }
    }
}

/// Decide whether to colour output: not disabled by flag, `NO_COLOR` unset, stdout a terminal
pub fn color_enabled(no_color_flag: bool) -> bool {
    let no_color_env = std::env::var_os("NO_COLOR").is_some_and(|v| !v.is_empty());
    !no_color_flag && !no_color_env && io::stdout().is_terminal()
}

/// Writes the console log
pub struct Reporter {
    out: Box<dyn Write + Send>,
    color: bool,
}

impl Reporter {
    pub fn new(out: Box<dyn Write + Send>, color: bool) -> Self {
        Self { out, color }
    }

    pub fn stdout(color: bool) -> Self {
        Self::new(Box::new(io::stdout()), color)
    }

    /// A reporter that discards everything
    pub fn quiet() -> Self {
        Self::new(Box::new(io::sink()), false)
    }

    pub fn log(&mut self, level: Level, message: impl Display) {
        tracing::debug!(%level, "{}", message);
        let _ = writeln!(self.out, "{} {}", level.tag(self.color), message);
        let _ = self.out.flush();
    }

    pub fn info(&mut self, message: impl Display) {
        self.log(Level::Info, message);
    }

    pub fn success(&mut self, message: impl Display) {
        self.log(Level::Success, message);
    }

    pub fn warning(&mut self, message: impl Display) {
        self.log(Level::Warning, message);
    }

    pub fn error(&mut self, message: impl Display) {
        self.log(Level::Error, message);
    }

    /// Untagged line
    pub fn plain(&mut self, message: impl Display) {
        let _ = writeln!(self.out, "{}", message);
        let _ = self.out.flush();
    }

    pub fn banner(&mut self, title: &str) {
        self.plain(title);
        self.plain("=".repeat(40));
    }

    /// Numbered suggestions printed after a failed run
    pub fn remediation(&mut self, suggestions: &[&str]) {
        self.plain("");
        self.plain("Suggestions:");
        for (i, suggestion) in suggestions.iter().enumerate() {
            self.plain(format!("{}. {}", i + 1, suggestion));
        }
    }
}
