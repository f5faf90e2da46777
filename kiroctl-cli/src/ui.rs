//! Terminal output helpers and the interactive prompt.

use std::io::{self, BufRead, Write};

use colored::Colorize;

use kiroctl_reconcile::Confirm;

pub fn step(text: &str) {
    println!("{} {}", "==>".blue().bold(), text.bold());
}

pub fn ok(text: &str) {
    println!("{} {text}", "✓".green().bold());
}

pub fn warn(text: &str) {
    println!("{} {text}", "!".yellow().bold());
}

pub fn fail(text: &str) {
    println!("{} {text}", "✗".red().bold());
}

/// Reads one line from stdin. Enter or `y` continues; `n` or end of input
/// aborts.
pub struct TerminalPrompt;

impl Confirm for TerminalPrompt {
    fn confirm(&self, message: &str) -> bool {
        let mut stderr = io::stderr();
        let _ = write!(
            stderr,
            "{} {message} [Enter to continue, n to abort] ",
            "?".cyan().bold()
        );
        let _ = stderr.flush();

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => false,
            Ok(_) => answer_continues(&line),
        }
    }
}

fn answer_continues(line: &str) -> bool {
    !matches!(line.trim().to_ascii_lowercase().as_str(), "n" | "no")
}
