use clap::Args;
use colored::Colorize;
use serde::Serialize;

use provisioner::deploy::OsStep;

/// Print the OS install step table
#[derive(Args)]
pub struct StepsCommand {
    /// Print JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct StepRow {
    step: &'static str,
    target_progress: u8,
    description: &'static str,
}

fn rows() -> Vec<StepRow> {
    OsStep::ALL
        .iter()
        .map(|&step| StepRow {
            step: step.as_str(),
            target_progress: step.target_progress(),
            description: step.description(),
        })
        .collect()
}

impl StepsCommand {
    pub fn run(&self) {
        let rows = rows();
        if self.json {
            match serde_json::to_string_pretty(&rows) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("{e}"),
            }
            return;
        }

        println!("{:<20} {:>6}  {}", "STEP".bold(), "TARGET".bold(), "DESCRIPTION".bold());
        for row in rows {
            println!(
                "{:<20} {:>5}%  {}",
                row.step.cyan(),
                row.target_progress,
                row.description.bright_black()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_end_at_100() {
        let rows = rows();
        assert_eq!(rows.first().map(|r| r.step), Some("preinstall"));
        assert_eq!(rows.last().map(|r| r.target_progress), Some(100));
    }
}
