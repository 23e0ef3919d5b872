//! Console output for the provisioning CLI.

use std::collections::HashMap;
use std::fmt::Display;

use colored::{ColoredString, Colorize};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use provisioner::pipeline::ProgressEvent;

const RULE_WIDTH: usize = 64;

/// How a status line is marked and colored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tone {
    Step,
    Success,
    Warning,
    Error,
    Info,
}

impl Tone {
    fn mark(self) -> ColoredString {
        match self {
            Self::Step => "▶".cyan(),
            Self::Success => "✓".green().bold(),
            Self::Warning => "!".yellow().bold(),
            Self::Error => "✗".red().bold(),
            Self::Info => "·".blue().bold(),
        }
    }

    fn paint(self, message: &str) -> ColoredString {
        match self {
            Self::Step => message.bold(),
            Self::Success => message.green(),
            Self::Warning => message.yellow(),
            Self::Error => message.red(),
            Self::Info => message.normal(),
        }
    }
}

fn render(tone: Tone, message: &str) -> String {
    format!("{} {}", tone.mark(), tone.paint(message))
}

/// Warnings and errors go to stderr so piped output stays clean.
fn say(tone: Tone, message: &str) {
    let line = render(tone, message);
    match tone {
        Tone::Warning | Tone::Error => eprintln!("{line}"),
        Tone::Step | Tone::Success | Tone::Info => println!("{line}"),
    }
}

/// Heading for a command's output.
pub fn print_section(title: &str) {
    let rule = "─".repeat(RULE_WIDTH);
    println!();
    println!("{}", rule.bright_black());
    println!(" {}", title.cyan().bold());
    println!("{}", rule.bright_black());
}

pub fn print_step(message: &str) {
    say(Tone::Step, message);
}

pub fn print_success(message: &str) {
    say(Tone::Success, message);
}

pub fn print_warning(message: &str) {
    say(Tone::Warning, message);
}

pub fn print_error(message: &str) {
    say(Tone::Error, message);
}

pub fn print_info(message: &str) {
    say(Tone::Info, message);
}

/// Indented `key  value` line with keys padded to a common column.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key:<20}").bright_black(), value);
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:>14.bold} [{bar:30.cyan/bright_black}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░")
}

/// One progress bar per host.
pub struct HostBars {
    _multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
}

impl HostBars {
    /// Create bars for `hosts`, in order.
    pub fn new<'a>(hosts: impl IntoIterator<Item = &'a str>) -> Self {
        let multi = MultiProgress::new();
        let bars = hosts
            .into_iter()
            .map(|host| {
                let bar = multi.add(ProgressBar::new(100));
                bar.set_style(bar_style());
                bar.set_prefix(host.to_string());
                (host.to_string(), bar)
            })
            .collect();
        Self {
            _multi: multi,
            bars,
        }
    }

    /// Move a host's bar.
    pub fn update(&self, host: &str, percent: u64, message: impl Into<String>) {
        if let Some(bar) = self.bars.get(host) {
            bar.set_position(percent.min(100));
            bar.set_message(message.into());
        }
    }

    /// Render a pipeline event.
    pub fn apply<S: Display>(&self, event: &ProgressEvent<S>) {
        match event {
            ProgressEvent::Running {
                host,
                from,
                started_step,
                ..
            } => self.update(host, u64::from(*from), started_step.to_string()),
            ProgressEvent::Failed { host, step, .. } => {
                if let Some(bar) = self.bars.get(host.as_str()) {
                    bar.abandon_with_message(format!("{} {step}", "failed at".red()));
                }
            }
            ProgressEvent::Finished { host, .. } => {
                if let Some(bar) = self.bars.get(host.as_str()) {
                    bar.set_position(100);
                    bar.finish_with_message("done".green().to_string());
                }
            }
        }
    }

    /// Stop drawing, leaving the final state on screen.
    pub fn finish(&self) {
        for bar in self.bars.values() {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    }
}

/// Host outcome for the summary table.
pub struct HostOutcome {
    pub host: String,
    pub error: Option<String>,
    /// Step or stage to resume from.
    pub resume_step: Option<String>,
}

/// Print per-host results with resume hints. Returns the failure count.
pub fn print_summary(command: &str, resume_flag: &str, outcomes: &[HostOutcome]) -> usize {
    print_section("Summary");
    let mut failures = 0;
    for outcome in outcomes {
        match &outcome.error {
            None => println!("  {} {}", "✓".green(), outcome.host),
            Some(error) => {
                failures += 1;
                println!("  {} {} - {}", "✗".red(), outcome.host, error.red());
                if let Some(step) = &outcome.resume_step {
                    println!(
                        "    {} provision {command} --host {} {resume_flag} {step}",
                        "resume:".bright_black(),
                        outcome.host
                    );
                }
            }
        }
    }
    println!();
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_marks_each_tone() {
        colored::control::set_override(false);
        assert_eq!(render(Tone::Success, "host up"), "✓ host up");
        assert_eq!(render(Tone::Warning, "slow"), "! slow");
        assert_eq!(render(Tone::Error, "boom"), "✗ boom");
        assert_eq!(render(Tone::Info, "note"), "· note");
        colored::control::unset_override();
    }
}
