// JSON output for machine consumption

use super::events::RunEvent;
use super::summary::{RunSummary, TaskRecord};

/// Writes one NDJSON event per line to stdout
pub struct JsonOutput {
    quiet: bool,
}

impl JsonOutput {
    pub fn new(quiet: bool) -> Self {
        JsonOutput { quiet }
    }

    pub fn print_run_header(&self, playbook: &str, hosts: &[String]) {
        if self.quiet {
            return;
        }
        self.emit(&RunEvent::RunStart { playbook, hosts });
    }

    pub fn print_phase_header(&self, phase: &str, group: &str, hosts: &[String]) {
        if self.quiet {
            return;
        }
        self.emit(&RunEvent::PhaseStart { phase, group, hosts });
    }

    pub fn print_task_result(&self, host: &str, record: &TaskRecord) {
        if self.quiet && record.error.is_none() {
            return;
        }
        self.emit(&RunEvent::task(host, record));
    }

    /// The final event is printed even in quiet mode
    pub fn print_recap(&self, summary: &RunSummary) {
        self.emit(&RunEvent::complete(summary));
    }

    fn emit(&self, event: &RunEvent) {
        println!("{}", event.to_line());
    }
}
