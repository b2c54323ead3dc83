// Command module - run commands, plain or through the shell

use super::shell_quote;
use crate::executor::{Connection, ExecutionContext, TaskOutput};
use crate::output::errors::ConvergeError;

#[derive(Debug, Clone, PartialEq)]
pub struct CommandParams {
    pub cmd: String,
    pub chdir: Option<String>,
    pub creates: Option<String>,
    pub removes: Option<String>,
    /// Pass the command to the shell as written
    pub shell: bool,
}

#[derive(Default)]
pub struct CommandModule;

impl CommandModule {
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        conn: &dyn Connection,
        params: &CommandParams,
    ) -> Result<TaskOutput, ConvergeError> {
        let module = if params.shell { "shell" } else { "command" };

        if let Some(ref creates) = params.creates {
            if path_exists(conn, creates).await? {
                return Ok(TaskOutput::success()
                    .with_message(format!("Skipped - {} already exists", creates)));
            }
        }
        if let Some(ref removes) = params.removes {
            if !path_exists(conn, removes).await? {
                return Ok(TaskOutput::success()
                    .with_message(format!("Skipped - {} does not exist", removes)));
            }
        }

        let mut command = if params.shell {
            params.cmd.clone()
        } else {
            let words = split_words(&params.cmd)?;
            if words.is_empty() {
                return Err(ConvergeError::module(module, conn.host_name(), "Empty command", None));
            }
            words.iter().map(|w| quote_word(w)).collect::<Vec<_>>().join(" ")
        };
        if let Some(ref dir) = params.chdir {
            command = format!("cd {} && {}", shell_quote(dir), command);
        }

        if ctx.check_mode {
            return Ok(TaskOutput::changed().with_message(format!("Would run: {}", command)));
        }

        let result = conn.exec(&ctx.wrap_command(&command)).await?;

        if result.success() {
            Ok(TaskOutput::changed()
                .with_stdout(result.stdout)
                .with_stderr(result.stderr))
        } else {
            Ok(TaskOutput::failed(format!("Command exited with code {}", result.exit_code))
                .with_stdout(result.stdout)
                .with_stderr(result.stderr)
                .with_exit_code(result.exit_code))
        }
    }
}

async fn path_exists(conn: &dyn Connection, path: &str) -> Result<bool, ConvergeError> {
    Ok(conn
        .exec(&format!("test -e {}", shell_quote(path)))
        .await?
        .success())
}

/// Quote a word only when the shell would otherwise interpret it
fn quote_word(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if plain {
        word.to_string()
    } else {
        shell_quote(word)
    }
}

/// Split a command line into words the way a POSIX shell would, without
/// expansion: single quotes are literal, double quotes honour backslash
/// escapes, and adjacent quoted pieces join into one word.
pub fn split_words(input: &str) -> Result<Vec<String>, ConvergeError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated(input, '\'')),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => current.push(ch),
                            Some('\n') => {}
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(unterminated(input, '"')),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated(input, '"')),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some('\n') | None => {}
                    Some(ch) => current.push(ch),
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn unterminated(input: &str, quote: char) -> ConvergeError {
    ConvergeError::Runtime {
        message: format!("Unterminated {} quote in command: {}", quote, input),
        suggestion: Some("Close the quote or use the shell module".to_string()),
    }
}
