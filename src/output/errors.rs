// Human-readable error messages for converge

use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;

use colored::*;

/// Color only when stderr is a terminal and NO_COLOR is unset
fn should_use_colors() -> bool {
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    std::io::stderr().is_terminal()
}

/// All error types in converge
#[derive(Debug)]
pub enum ConvergeError {
    /// Declaration parse errors (YAML, expressions)
    Parse(Box<ParseError>),

    Io {
        message: String,
        path: Option<PathBuf>,
    },

    Ssh {
        host: String,
        message: String,
        suggestion: Option<String>,
    },

    /// A resource operation failed on the target
    Module(Box<ModuleError>),

    /// Guard or predicate evaluation errors
    Condition {
        expression: String,
        message: String,
        suggestion: Option<String>,
    },

    /// A reference into the run fact store matched nothing
    UnresolvedReference {
        reference: String,
        searched: Vec<String>,
    },

    Inventory {
        message: String,
        suggestion: Option<String>,
    },

    Config {
        message: String,
        path: Option<PathBuf>,
    },

    Runtime {
        message: String,
        suggestion: Option<String>,
    },

    /// Task failure (fail_when triggered)
    TaskFailed {
        task_name: String,
        host: String,
        condition: String,
    },

    Timeout {
        operation: String,
        duration_secs: u64,
    },
}

#[derive(Debug)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub suggestion: Option<String>,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        ParseError {
            kind,
            message: message.into(),
            file: None,
            line: None,
            column: None,
            suggestion: None,
        }
    }

    pub fn in_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

#[derive(Debug)]
pub struct ModuleError {
    pub module: String,
    pub task_name: String,
    pub host: String,
    pub message: String,
    pub stderr: Option<String>,
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    InvalidYaml,
    InvalidExpression,
    UnknownModule,
    MissingField,
    InvalidValue,
}

impl ConvergeError {
    /// Shorthand for a module failure on a host
    pub fn module(
        module: &str,
        host: &str,
        message: impl Into<String>,
        stderr: Option<String>,
    ) -> Self {
        let message = message.into();
        let mut err = ModuleError {
            module: module.to_string(),
            task_name: String::new(),
            host: host.to_string(),
            message,
            stderr,
            suggestion: None,
        };
        err.suggestion = suggest_module_fix(&err);
        ConvergeError::Module(Box::new(err))
    }

    pub fn parse(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        ConvergeError::Parse(Box::new(ParseError::new(kind, message)))
    }

    /// Attach the task name to module errors raised below the executor
    pub fn with_task(mut self, task_name: &str) -> Self {
        if let ConvergeError::Module(ref mut err) = self {
            if err.task_name.is_empty() {
                err.task_name = task_name.to_string();
            }
        }
        self
    }

    /// Whether re-running the same action can plausibly succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConvergeError::Parse(_)
                | ConvergeError::UnresolvedReference { .. }
                | ConvergeError::Condition { .. }
                | ConvergeError::Config { .. }
                | ConvergeError::Inventory { .. }
        )
    }

    /// Stable label used in summaries and JSON events
    pub fn kind(&self) -> &'static str {
        match self {
            ConvergeError::Parse(_) => "parse",
            ConvergeError::Io { .. } => "io",
            ConvergeError::Ssh { .. } => "ssh",
            ConvergeError::Module(_) => "module",
            ConvergeError::Condition { .. } => "condition",
            ConvergeError::UnresolvedReference { .. } => "unresolved-reference",
            ConvergeError::Inventory { .. } => "inventory",
            ConvergeError::Config { .. } => "config",
            ConvergeError::Runtime { .. } => "runtime",
            ConvergeError::TaskFailed { .. } => "task-failed",
            ConvergeError::Timeout { .. } => "timeout",
        }
    }

    /// One-line plain description, used in reports and logs
    pub fn summary(&self) -> String {
        match self {
            ConvergeError::Parse(err) => err.message.clone(),
            ConvergeError::Io { message, .. } => message.clone(),
            ConvergeError::Ssh { host, message, .. } => format!("{}: {}", host, message),
            ConvergeError::Module(err) => match err.stderr.as_deref().map(str::trim) {
                Some(stderr) if !stderr.is_empty() => {
                    format!("{}: {}", err.message, stderr.lines().next().unwrap_or(""))
                }
                _ => err.message.clone(),
            },
            ConvergeError::Condition {
                expression,
                message,
                ..
            } => format!("{} ({})", message, expression),
            ConvergeError::UnresolvedReference { reference, .. } => {
                format!("unresolved reference '{}'", reference)
            }
            ConvergeError::Inventory { message, .. } => message.clone(),
            ConvergeError::Config { message, .. } => message.clone(),
            ConvergeError::Runtime { message, .. } => message.clone(),
            ConvergeError::TaskFailed { condition, .. } => {
                format!("failure condition met: {}", condition)
            }
            ConvergeError::Timeout {
                operation,
                duration_secs,
            } => format!("{} timed out after {}s", operation, duration_secs),
        }
    }
}

impl std::error::Error for ConvergeError {}

impl fmt::Display for ConvergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !should_use_colors() {
            colored::control::set_override(false);
        }

        match self {
            ConvergeError::Parse(err) => {
                writeln!(f, "{}: {}", "ERROR".red().bold(), err.message)?;

                if let Some(ref file) = err.file {
                    write!(f, "  {} ", "-->".blue())?;
                    write!(f, "{}", file.cyan())?;
                    if let Some(line) = err.line {
                        write!(f, ":{}", line)?;
                        if let Some(col) = err.column {
                            write!(f, ":{}", col)?;
                        }
                    }
                    writeln!(f)?;
                }

                write_hint(f, err.suggestion.as_deref())
            }

            ConvergeError::Io { message, path } => {
                writeln!(f, "{}: {}", "I/O ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            ConvergeError::Ssh {
                host,
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "SSH ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Host:".dimmed(), host)?;
                write_hint(f, suggestion.as_deref())
            }

            ConvergeError::Module(err) => {
                writeln!(f, "{}: {}", "MODULE ERROR".red().bold(), err.message)?;
                writeln!(f, "  {} {}", "Module:".dimmed(), err.module)?;
                if !err.task_name.is_empty() {
                    writeln!(f, "  {} {}", "Task:".dimmed(), err.task_name)?;
                }
                writeln!(f, "  {} {}", "Host:".dimmed(), err.host)?;

                if let Some(ref stderr) = err.stderr {
                    if !stderr.is_empty() {
                        writeln!(f, "  {}:", "stderr".dimmed())?;
                        for line in stderr.lines().take(10) {
                            writeln!(f, "    {}", line)?;
                        }
                    }
                }

                write_hint(f, err.suggestion.as_deref())
            }

            ConvergeError::Condition {
                expression,
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "CONDITION ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Expression:".dimmed(), expression)?;
                write_hint(f, suggestion.as_deref())
            }

            ConvergeError::UnresolvedReference {
                reference,
                searched,
            } => {
                writeln!(
                    f,
                    "{}: '{}' was never captured",
                    "UNRESOLVED REFERENCE".red().bold(),
                    reference
                )?;
                if searched.is_empty() {
                    writeln!(f, "  {} no earlier phase", "Searched:".dimmed())?;
                } else {
                    writeln!(f, "  {} {}", "Searched:".dimmed(), searched.join(", "))?;
                }
                write_hint(
                    f,
                    Some("Capture the value in an earlier phase with 'publish: true'"),
                )
            }

            ConvergeError::Inventory {
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "INVENTORY ERROR".red().bold(), message)?;
                write_hint(f, suggestion.as_deref())
            }

            ConvergeError::Config { message, path } => {
                writeln!(f, "{}: {}", "CONFIG ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            ConvergeError::Runtime {
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "RUNTIME ERROR".red().bold(), message)?;
                write_hint(f, suggestion.as_deref())
            }

            ConvergeError::TaskFailed {
                task_name,
                host,
                condition,
            } => {
                writeln!(f, "{}: Task failed condition", "TASK FAILED".red().bold())?;
                writeln!(f, "  {} {}", "Task:".dimmed(), task_name)?;
                writeln!(f, "  {} {}", "Host:".dimmed(), host)?;
                writeln!(f, "  {} {}", "Condition:".dimmed(), condition)?;
                Ok(())
            }

            ConvergeError::Timeout {
                operation,
                duration_secs,
            } => {
                writeln!(
                    f,
                    "{}: {} timed out after {}s",
                    "TIMEOUT".red().bold(),
                    operation,
                    duration_secs
                )
            }
        }
    }
}

fn write_hint(f: &mut fmt::Formatter<'_>, suggestion: Option<&str>) -> fmt::Result {
    if let Some(suggestion) = suggestion {
        writeln!(f)?;
        writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
    }
    Ok(())
}

/// Suggest common fixes for module failures
fn suggest_module_fix(err: &ModuleError) -> Option<String> {
    let haystack = format!(
        "{} {}",
        err.message.to_lowercase(),
        err.stderr.as_deref().unwrap_or("").to_lowercase()
    );

    if haystack.contains("could not get lock") || haystack.contains("lock") {
        Some("Another process holds the package manager lock; add 'retry' to this task".to_string())
    } else if haystack.contains("permission denied") {
        Some("Try running with elevated privileges (sudo: true)".to_string())
    } else if haystack.contains("not found") {
        Some("Check that the package or service name is correct".to_string())
    } else {
        None
    }
}
