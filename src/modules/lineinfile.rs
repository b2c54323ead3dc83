// Line-in-file module - ensure a single line is present or absent

use regex::Regex;

use super::file::{path_test, read_remote, write_remote};
use super::{apply_attrs, ResolvedAttrs};
use crate::executor::{Connection, ExecutionContext, TaskOutput};
use crate::output::diff::render_content_diff;
use crate::output::errors::ConvergeError;
use crate::parser::ast::{LineState, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct LineInFileParams {
    pub path: String,
    pub line: Option<String>,
    pub regexp: Option<String>,
    pub insert_after: Option<String>,
    pub state: LineState,
    pub create: bool,
    pub attrs: ResolvedAttrs,
}

/// Compute the new content of a file.
///
/// Present: the last line matching `regexp` is replaced by `line`; with no
/// match and no identical line already there, `line` goes after the last
/// `insert_after` match, or at the end. Absent: every line matching `regexp`
/// (or equal to `line`) is dropped.
pub fn apply_line(content: &str, params: &LineInFileParams) -> Result<String, regex::Error> {
    let regexp = params.regexp.as_deref().map(Regex::new).transpose()?;
    let insert_after = match params.insert_after.as_deref() {
        None | Some("EOF") => None,
        Some(pattern) => Some(Regex::new(pattern)?),
    };

    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    match params.state {
        LineState::Present => {
            let Some(ref line) = params.line else {
                return Ok(content.to_string());
            };

            let matched = regexp
                .as_ref()
                .and_then(|re| lines.iter().rposition(|l| re.is_match(l)));

            match matched {
                Some(idx) => lines[idx] = line.clone(),
                None if lines.iter().any(|l| l == line) => {}
                None => {
                    let anchor = insert_after
                        .as_ref()
                        .and_then(|re| lines.iter().rposition(|l| re.is_match(l)));
                    match anchor {
                        Some(idx) => lines.insert(idx + 1, line.clone()),
                        None => lines.push(line.clone()),
                    }
                }
            }
        }
        LineState::Absent => match (&regexp, &params.line) {
            (Some(re), _) => lines.retain(|l| !re.is_match(l)),
            (None, Some(line)) => lines.retain(|l| l != line),
            (None, None) => {}
        },
    }

    let mut result = lines.join("\n");
    if !lines.is_empty() {
        result.push('\n');
    }
    // Leave an untouched file byte-identical, trailing newline or not
    if result.trim_end_matches('\n') == content.trim_end_matches('\n')
        && lines.len() == content.lines().count()
    {
        return Ok(content.to_string());
    }
    Ok(result)
}

#[derive(Default)]
pub struct LineInFileModule;

impl LineInFileModule {
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        conn: &dyn Connection,
        params: &LineInFileParams,
    ) -> Result<TaskOutput, ConvergeError> {
        let path = params.path.as_str();

        if params.state == LineState::Present && params.line.is_none() {
            return Err(ConvergeError::module(
                "lineinfile",
                conn.host_name(),
                "'line' is required when state is present",
                None,
            ));
        }
        if params.state == LineState::Absent && params.line.is_none() && params.regexp.is_none() {
            return Err(ConvergeError::module(
                "lineinfile",
                conn.host_name(),
                "One of 'line' or 'regexp' is required when state is absent",
                None,
            ));
        }

        let exists = path_test(conn, "-f", path).await?;
        let current = if exists {
            Some(read_remote(ctx, conn, path).await?)
        } else if params.state == LineState::Absent {
            return Ok(TaskOutput::success()
                .with_message(format!("{} does not exist", path))
                .with_data("path", Value::from(path)));
        } else if params.create {
            None
        } else {
            return Err(ConvergeError::module(
                "lineinfile",
                conn.host_name(),
                format!("{} does not exist", path),
                None,
            ));
        };

        let old = current.as_deref().unwrap_or("");
        let new = apply_line(old, params).map_err(|e| {
            ConvergeError::module(
                "lineinfile",
                conn.host_name(),
                format!("Invalid regular expression: {}", e),
                None,
            )
        })?;

        let mut changes = Vec::new();
        let mut output = TaskOutput::success();

        if current.is_none() || new != old {
            if ctx.diff_mode {
                output = output.with_diff(render_content_diff(path, current.as_deref(), &new));
            }
            if !ctx.check_mode {
                write_remote("lineinfile", ctx, conn, path, &new).await?;
            }
            changes.push(if exists { "line updated" } else { "created" }.to_string());
        }

        if !(ctx.check_mode && !exists) {
            changes.extend(apply_attrs("lineinfile", ctx, conn, path, &params.attrs).await?);
        }

        let message = if changes.is_empty() {
            format!("{} is in the desired state", path)
        } else if ctx.check_mode {
            format!("Would change {}: {}", path, changes.join(", "))
        } else {
            format!("{}: {}", path, changes.join(", "))
        };

        Ok(output
            .with_changed(!changes.is_empty())
            .with_message(message)
            .with_data("path", Value::from(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::SimulatedHost;
    use crate::inventory::Host;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn params(line: Option<&str>, regexp: Option<&str>) -> LineInFileParams {
        LineInFileParams {
            path: "/etc/ssh/sshd_config".to_string(),
            line: line.map(str::to_string),
            regexp: regexp.map(str::to_string),
            insert_after: None,
            state: LineState::Present,
            create: false,
            attrs: ResolvedAttrs::default(),
        }
    }

    #[test]
    fn test_replaces_last_match() {
        let content = "#PermitRootLogin yes\nPort 22\nPermitRootLogin yes\n";
        let p = params(Some("PermitRootLogin no"), Some("^#?PermitRootLogin"));

        assert_eq!(
            apply_line(content, &p).unwrap(),
            "#PermitRootLogin yes\nPort 22\nPermitRootLogin no\n"
        );
    }

    #[test]
    fn test_appends_when_unmatched() {
        let p = params(Some("UseDNS no"), Some("^UseDNS"));
        assert_eq!(apply_line("Port 22\n", &p).unwrap(), "Port 22\nUseDNS no\n");
        assert_eq!(apply_line("", &p).unwrap(), "UseDNS no\n");
    }

    #[test]
    fn test_existing_line_is_left_alone() {
        let content = "Port 22\nUseDNS no";
        let p = params(Some("UseDNS no"), None);
        assert_eq!(apply_line(content, &p).unwrap(), content);
    }

    #[test]
    fn test_insert_after() {
        let mut p = params(Some("extension=mysqli"), None);
        p.insert_after = Some("^\\[PHP\\]".to_string());

        assert_eq!(
            apply_line("[PHP]\nmemory_limit=128M\n", &p).unwrap(),
            "[PHP]\nextension=mysqli\nmemory_limit=128M\n"
        );
    }

    #[test]
    fn test_absent_removes_every_match() {
        let mut p = params(None, Some("^Listen "));
        p.state = LineState::Absent;

        assert_eq!(
            apply_line("Listen 80\nServerName x\nListen 443\n", &p).unwrap(),
            "ServerName x\n"
        );
    }

    #[test]
    fn test_invalid_regex() {
        assert!(apply_line("", &params(Some("x"), Some("("))).is_err());
    }

    #[tokio::test]
    async fn test_module_is_idempotent() {
        let host = SimulatedHost::new("web1").with_file("/etc/ssh/sshd_config", "PermitRootLogin yes\n");
        let ctx = ExecutionContext::new(Arc::new(Host::new("web1")), HashMap::new());
        let p = params(Some("PermitRootLogin no"), Some("^PermitRootLogin"));

        assert!(LineInFileModule.execute(&ctx, &host, &p).await.unwrap().changed);
        assert_eq!(host.file("/etc/ssh/sshd_config").unwrap().content, "PermitRootLogin no\n");
        assert!(!LineInFileModule.execute(&ctx, &host, &p).await.unwrap().changed);
    }

    #[tokio::test]
    async fn test_missing_file_needs_create() {
        let host = SimulatedHost::new("web1");
        let ctx = ExecutionContext::new(Arc::new(Host::new("web1")), HashMap::new());
        let mut p = params(Some("DB_HOST=db1"), None);
        p.path = "/etc/app.env".to_string();

        assert!(LineInFileModule.execute(&ctx, &host, &p).await.is_err());

        p.create = true;
        assert!(LineInFileModule.execute(&ctx, &host, &p).await.unwrap().changed);
        assert_eq!(host.file("/etc/app.env").unwrap().content, "DB_HOST=db1\n");
    }

    #[tokio::test]
    async fn test_diff_mode_labels_created_file() {
        let host = SimulatedHost::new("web1");
        let ctx = ExecutionContext::new(Arc::new(Host::new("web1")), HashMap::new()).with_diff_mode(true);
        let mut p = params(Some("DB_HOST=db1"), None);
        p.path = "/etc/app.env".to_string();
        p.create = true;

        let diff = LineInFileModule.execute(&ctx, &host, &p).await.unwrap().diff.unwrap();
        assert!(diff.starts_with("--- /dev/null\n+++ /etc/app.env (new)\n"));
        assert!(diff.ends_with("+DB_HOST=db1\n"));
    }
}
