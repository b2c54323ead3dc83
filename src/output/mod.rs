// Output module for converge

pub mod diff;
pub mod errors;
pub mod events;
pub mod json_output;
pub mod summary;
pub mod terminal;

pub use diff::*;
pub use errors::*;
pub use events::RunEvent;
pub use json_output::*;
pub use summary::*;
pub use terminal::*;

/// Output format for converge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text output with colors
    #[default]
    Text,
    /// Machine-readable JSON output (NDJSON format)
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown output format '{}' (use text or json)", other)),
        }
    }
}

/// Unified output writer supporting both text and JSON formats
pub enum OutputWriter {
    Text(TerminalOutput),
    Json(JsonOutput),
    /// Suppresses all output (tests, embedding)
    Silent,
}

impl OutputWriter {
    pub fn new(format: OutputFormat, verbose: bool, quiet: bool) -> Self {
        match format {
            OutputFormat::Text => OutputWriter::Text(TerminalOutput::new(verbose, quiet)),
            OutputFormat::Json => OutputWriter::Json(JsonOutput::new(quiet)),
        }
    }

    pub fn silent() -> Self {
        OutputWriter::Silent
    }

    pub fn print_run_header(&self, playbook: &str, hosts: &[String]) {
        match self {
            OutputWriter::Text(output) => output.print_run_header(playbook, hosts),
            OutputWriter::Json(output) => output.print_run_header(playbook, hosts),
            OutputWriter::Silent => {}
        }
    }

    pub fn print_phase_header(&self, phase: &str, group: &str, hosts: &[String]) {
        match self {
            OutputWriter::Text(output) => output.print_phase_header(phase, group, hosts),
            OutputWriter::Json(output) => output.print_phase_header(phase, group, hosts),
            OutputWriter::Silent => {}
        }
    }

    pub fn print_task_result(&self, host: &str, record: &TaskRecord) {
        match self {
            OutputWriter::Text(output) => output.print_task_result(host, record),
            OutputWriter::Json(output) => output.print_task_result(host, record),
            OutputWriter::Silent => {}
        }
    }

    pub fn print_recap(&self, summary: &RunSummary) {
        match self {
            OutputWriter::Text(output) => output.print_recap(summary),
            OutputWriter::Json(output) => output.print_recap(summary),
            OutputWriter::Silent => {}
        }
    }
}
