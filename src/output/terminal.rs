// Colored terminal output

use std::io::IsTerminal;

use colored::*;

use super::summary::{RunSummary, TaskRecord, TaskStatus};

/// Terminal output manager
pub struct TerminalOutput {
    verbose: bool,
    quiet: bool,
}

impl TerminalOutput {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        // Respect NO_COLOR (https://no-color.org/) and plain pipes
        if std::env::var("NO_COLOR").is_ok() || !std::io::stdout().is_terminal() {
            colored::control::set_override(false);
        }

        TerminalOutput { verbose, quiet }
    }

    pub fn print_run_header(&self, playbook: &str, hosts: &[String]) {
        if self.quiet {
            return;
        }

        println!();
        println!(
            "{} {} ({} hosts)",
            "RUN".green().bold(),
            playbook.cyan(),
            hosts.len()
        );
        println!("{}", "─".repeat(60).dimmed());
    }

    pub fn print_phase_header(&self, phase: &str, group: &str, hosts: &[String]) {
        if self.quiet {
            return;
        }

        println!();
        println!(
            "{} {} {}",
            "PHASE".yellow().bold(),
            phase,
            format!("[{}: {} hosts]", group, hosts.len()).dimmed()
        );
    }

    /// One line per task per host
    pub fn print_task_result(&self, host: &str, record: &TaskRecord) {
        let failed = record.status == TaskStatus::Failed;
        if self.quiet && !failed {
            return;
        }

        println!("{}", format_task_line(host, record));

        if failed || self.verbose {
            if let Some(ref error) = record.error {
                for line in error.lines() {
                    println!("      {}", line.red());
                }
            }
            if let Some(ref msg) = record.message {
                if self.verbose && !msg.is_empty() {
                    println!("      {}", msg.dimmed());
                }
            }
        }

        if let Some(ref diff) = record.diff {
            if !diff.is_empty() {
                self.print_diff(diff);
            }
        }
    }

    /// Print a colorized diff
    pub fn print_diff(&self, diff: &str) {
        println!();
        for line in diff.lines() {
            if line.starts_with("---") || line.starts_with("+++") {
                println!("      {}", line.bold());
            } else if line.starts_with("@@") {
                println!("      {}", line.cyan());
            } else if line.starts_with('+') {
                println!("      {}", line.green());
            } else if line.starts_with('-') {
                println!("      {}", line.red());
            } else {
                println!("      {}", line);
            }
        }
        println!();
    }

    pub fn print_recap(&self, summary: &RunSummary) {
        println!();
        println!("{}", "RECAP".green().bold());
        println!("{}", "─".repeat(60).dimmed());

        for (host, totals) in summary.host_totals() {
            let ok = format!("ok={}", totals.ok).green();
            let changed = if totals.changed > 0 {
                format!("changed={}", totals.changed).yellow()
            } else {
                format!("changed={}", totals.changed).normal()
            };
            let failed = if totals.failed > 0 {
                format!("failed={}", totals.failed).red().bold()
            } else {
                format!("failed={}", totals.failed).normal()
            };
            let skipped = format!("skipped={}", totals.skipped).cyan();
            let ignored = format!("ignored={}", totals.ignored).normal();
            let outcome = if totals.outcome == "success" {
                totals.outcome.green()
            } else {
                totals.outcome.red().bold()
            };

            println!(
                "{:<30} : {}  {}  {}  {}  {}  {}",
                host.white().bold(),
                ok,
                changed,
                failed,
                skipped,
                ignored,
                outcome
            );
        }

        println!();
        if summary.aborted {
            println!("{}", "Run aborted (strict mode)".red().bold());
        }
        if summary.check_mode {
            println!("{}", "Check mode: no changes were made".dimmed());
        }
        println!("Total time: {:.2}s", summary.duration_ms as f64 / 1000.0);
    }
}

fn format_task_line(host: &str, record: &TaskRecord) -> String {
    let status = match record.status {
        TaskStatus::Failed => "failed".red().bold(),
        TaskStatus::Changed => "changed".yellow(),
        TaskStatus::Skipped => "skipped".cyan(),
        TaskStatus::Ok => "ok".green(),
    };
    let kind = if record.handler { "HANDLER" } else { "TASK" };

    let mut line = format!(
        "  {} {} {} {} {}",
        format!("{:>7}", status),
        "=>".dimmed(),
        host.white().bold(),
        format!("{} {}:", kind, record.task_number).dimmed(),
        record.name
    );
    if record.attempts > 1 {
        line.push_str(&format!(" {}", format!("(attempts: {})", record.attempts).dimmed()));
    }
    if record.ignored {
        line.push_str(&format!(" {}", "...ignoring".dimmed()));
    }
    line
}
