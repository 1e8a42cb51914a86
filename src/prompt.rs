//! Yes/no confirmation capability.
//!
//! The orchestrator only sees [`Confirm`]; the binary picks an implementation
//! from the command line (`--yes`, `--no-source-build`, or ask on stdin).

use std::io::{self, BufRead, Write};

pub trait Confirm {
    /// Ask `question`; anything other than an affirmative answer is "no"
    fn confirm(&mut self, question: &str) -> bool;
}

/// Returns true for `y` / `yes`, ignoring case and surrounding whitespace
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Asks on a reader/writer pair, stdin/stdout in production
pub struct LinePrompt<R: BufRead, W: Write> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> LinePrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl LinePrompt<io::StdinLock<'static>, io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> Confirm for LinePrompt<R, W> {
    fn confirm(&mut self, question: &str) -> bool {
        let _ = write!(self.output, "{} (y/N): ", question);
        let _ = self.output.flush();

        let mut answer = String::new();
        match self.input.read_line(&mut answer) {
            // EOF: nobody is there to say yes
            Ok(0) => false,
            Ok(_) => is_affirmative(&answer),
            Err(e) => {
                tracing::warn!("Failed to read confirmation: {}", e);
                false
            }
        }
    }
}

/// Fixed answer without asking (`--yes` / `--no-source-build`)
#[derive(Debug, Clone, Copy)]
pub struct Preset(pub bool);

impl Confirm for Preset {
    fn confirm(&mut self, question: &str) -> bool {
        tracing::debug!("{} -> {}", question, if self.0 { "yes" } else { "no" });
        self.0
    }
}
