// File module - manage files, directories and their attributes

use std::path::Path;

use base64::Engine;

use super::{apply_attrs, run_action, shell_quote, ResolvedAttrs};
use crate::executor::{Connection, ExecutionContext, TaskOutput};
use crate::output::diff::render_content_diff;
use crate::output::errors::ConvergeError;
use crate::parser::ast::{FileState, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct FileParams {
    pub path: String,
    pub state: FileState,
    pub content: Option<String>,
    pub attrs: ResolvedAttrs,
}

#[derive(Default)]
pub struct FileModule;

impl FileModule {
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        conn: &dyn Connection,
        params: &FileParams,
    ) -> Result<TaskOutput, ConvergeError> {
        let path = params.path.as_str();
        if path.is_empty() {
            return Err(ConvergeError::module("file", conn.host_name(), "Empty path", None));
        }

        match params.state {
            FileState::File => self.ensure_file(ctx, conn, params).await,
            FileState::Directory => self.ensure_directory(ctx, conn, params).await,
            FileState::Absent => self.ensure_absent(ctx, conn, path).await,
            FileState::Touch => self.touch(ctx, conn, params).await,
        }
    }

    async fn ensure_file(
        &self,
        ctx: &ExecutionContext,
        conn: &dyn Connection,
        params: &FileParams,
    ) -> Result<TaskOutput, ConvergeError> {
        let path = params.path.as_str();
        let exists = path_test(conn, "-f", path).await?;
        let mut changes = Vec::new();
        let mut diff = None;

        match params.content {
            Some(ref content) => {
                let current = if exists {
                    Some(read_remote(ctx, conn, path).await?)
                } else {
                    None
                };

                if current.as_deref() != Some(content.as_str()) {
                    if ctx.diff_mode {
                        diff = Some(render_content_diff(path, current.as_deref(), content));
                    }
                    if !ctx.check_mode {
                        write_remote("file", ctx, conn, path, content).await?;
                    }
                    changes.push(if exists { "content updated" } else { "created" }.to_string());
                }
            }
            None if !exists => {
                return Err(ConvergeError::module(
                    "file",
                    conn.host_name(),
                    format!("{} does not exist", path),
                    None,
                ));
            }
            None => {}
        }

        // A file that check mode would have created has no attributes to inspect
        if !(ctx.check_mode && !exists) {
            changes.extend(apply_attrs("file", ctx, conn, path, &params.attrs).await?);
        }

        Ok(finish(ctx, path, changes, diff))
    }

    async fn ensure_directory(
        &self,
        ctx: &ExecutionContext,
        conn: &dyn Connection,
        params: &FileParams,
    ) -> Result<TaskOutput, ConvergeError> {
        let path = params.path.as_str();
        let exists = path_test(conn, "-d", path).await?;
        let mut changes = Vec::new();

        if !exists {
            if !ctx.check_mode {
                run_action(
                    "file",
                    ctx,
                    conn,
                    &format!("mkdir -p {}", shell_quote(path)),
                    || format!("Failed to create directory {}", path),
                )
                .await?;
            }
            changes.push("created".to_string());
        }

        if !(ctx.check_mode && !exists) {
            changes.extend(apply_attrs("file", ctx, conn, path, &params.attrs).await?);
        }

        Ok(finish(ctx, path, changes, None))
    }

    async fn ensure_absent(
        &self,
        ctx: &ExecutionContext,
        conn: &dyn Connection,
        path: &str,
    ) -> Result<TaskOutput, ConvergeError> {
        if !path_test(conn, "-e", path).await? {
            return Ok(finish(ctx, path, Vec::new(), None));
        }

        if !ctx.check_mode {
            run_action(
                "file",
                ctx,
                conn,
                &format!("rm -rf {}", shell_quote(path)),
                || format!("Failed to remove {}", path),
            )
            .await?;
        }
        Ok(finish(ctx, path, vec!["removed".to_string()], None))
    }

    /// Creating a missing file or fixing attributes is a change; touching an
    /// existing one only updates its timestamp and is not
    async fn touch(
        &self,
        ctx: &ExecutionContext,
        conn: &dyn Connection,
        params: &FileParams,
    ) -> Result<TaskOutput, ConvergeError> {
        let path = params.path.as_str();
        let exists = path_test(conn, "-e", path).await?;
        let mut changes = Vec::new();

        if !ctx.check_mode {
            run_action("file", ctx, conn, &format!("touch {}", shell_quote(path)), || {
                format!("Failed to touch {}", path)
            })
            .await?;
        }
        if !exists {
            changes.push("created".to_string());
        }

        if !(ctx.check_mode && !exists) {
            changes.extend(apply_attrs("file", ctx, conn, path, &params.attrs).await?);
        }

        Ok(finish(ctx, path, changes, None))
    }
}

fn finish(ctx: &ExecutionContext, path: &str, changes: Vec<String>, diff: Option<String>) -> TaskOutput {
    let mut output = if changes.is_empty() {
        TaskOutput::success().with_message(format!("{} is in the desired state", path))
    } else if ctx.check_mode {
        TaskOutput::changed().with_message(format!("Would change {}: {}", path, changes.join(", ")))
    } else {
        TaskOutput::changed().with_message(format!("{}: {}", path, changes.join(", ")))
    };
    output = output.with_data("path", Value::from(path));
    if let Some(diff) = diff {
        output = output.with_diff(diff);
    }
    output
}

pub(crate) async fn path_test(conn: &dyn Connection, flag: &str, path: &str) -> Result<bool, ConvergeError> {
    Ok(conn
        .exec(&format!("test {} {}", flag, shell_quote(path)))
        .await?
        .success())
}

/// Read a file, going through sudo when the direct read is refused
pub(crate) async fn read_remote(
    ctx: &ExecutionContext,
    conn: &dyn Connection,
    path: &str,
) -> Result<String, ConvergeError> {
    match conn.read_file(path).await {
        Ok(content) => Ok(content),
        Err(e) if !ctx.sudo => Err(e),
        Err(_) => run_action("file", ctx, conn, &format!("cat {}", shell_quote(path)), || {
            format!("Failed to read {}", path)
        })
        .await,
    }
}

/// Write a file in full. SFTP cannot escalate, so with sudo the content is
/// shipped base64-encoded into a temp file and moved into place.
pub(crate) async fn write_remote(
    module: &str,
    ctx: &ExecutionContext,
    conn: &dyn Connection,
    path: &str,
    content: &str,
) -> Result<(), ConvergeError> {
    if let Some(parent) = Path::new(path).parent().and_then(|p| p.to_str()) {
        if !parent.is_empty() && parent != "/" && !path_test(conn, "-d", parent).await? {
            run_action(module, ctx, conn, &format!("mkdir -p {}", shell_quote(parent)), || {
                format!("Failed to create parent directory {}", parent)
            })
            .await?;
        }
    }

    if !ctx.sudo {
        return conn.write_file(path, content).await;
    }

    let encoded = base64::engine::general_purpose::STANDARD.encode(content.as_bytes());
    let temp_path = format!("{}.converge-tmp-{}", path, std::process::id());
    let cmd = format!(
        "echo {} | base64 -d > {} && mv {} {}",
        encoded,
        shell_quote(&temp_path),
        shell_quote(&temp_path),
        shell_quote(path)
    );
    let result = conn.exec(&ctx.wrap_command(&cmd)).await?;
    if !result.success() {
        let _ = conn
            .exec(&ctx.wrap_command(&format!("rm -f {}", shell_quote(&temp_path))))
            .await;
        return Err(ConvergeError::module(
            module,
            conn.host_name(),
            format!("Failed to write file {}", path),
            Some(result.stderr),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::SimulatedHost;
    use crate::inventory::Host;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Arc::new(Host::new("web1")), HashMap::new())
    }

    fn params(path: &str, state: FileState, content: Option<&str>) -> FileParams {
        FileParams {
            path: path.to_string(),
            state,
            content: content.map(str::to_string),
            attrs: ResolvedAttrs::default(),
        }
    }

    #[tokio::test]
    async fn test_content_is_idempotent() {
        let host = SimulatedHost::new("web1");
        let mut p = params("/etc/motd", FileState::File, Some("welcome\n"));
        p.attrs.mode = Some("0600".to_string());

        let first = FileModule.execute(&ctx(), &host, &p).await.unwrap();
        assert!(first.changed);
        let file = host.file("/etc/motd").unwrap();
        assert_eq!((file.content.as_str(), file.mode.as_str()), ("welcome\n", "600"));

        let second = FileModule.execute(&ctx(), &host, &p).await.unwrap();
        assert!(!second.changed);
    }

    #[tokio::test]
    async fn test_sudo_write_goes_through_base64() {
        let host = SimulatedHost::new("web1");
        let ctx = ctx().with_sudo(true, None);
        let p = params("/etc/app/app.env", FileState::File, Some("PORT=80\n"));

        assert!(FileModule.execute(&ctx, &host, &p).await.unwrap().changed);
        assert_eq!(host.file("/etc/app/app.env").unwrap().content, "PORT=80\n");
        assert_eq!(host.count("mkdir -p '/etc/app'"), 1);
        assert_eq!(host.count("base64 -d"), 1);
    }

    #[tokio::test]
    async fn test_diff_mode_renders_changes() {
        let host = SimulatedHost::new("web1").with_file("/etc/motd", "old\n");
        let ctx = ctx().with_diff_mode(true);

        let out = FileModule
            .execute(&ctx, &host, &params("/etc/motd", FileState::File, Some("new\n")))
            .await
            .unwrap();
        let diff = out.diff.unwrap();
        assert!(diff.starts_with("--- /etc/motd (before)\n"));
        assert!(diff.contains("-old"));
        assert!(diff.contains("+new"));

        let created = FileModule
            .execute(&ctx, &host, &params("/etc/issue", FileState::File, Some("hello\n")))
            .await
            .unwrap();
        assert!(created.diff.unwrap().starts_with("--- /dev/null\n+++ /etc/issue (new)\n"));
    }

    #[tokio::test]
    async fn test_directory_and_absent() {
        let host = SimulatedHost::new("web1");
        let dir = params("/var/www/html", FileState::Directory, None);

        assert!(FileModule.execute(&ctx(), &host, &dir).await.unwrap().changed);
        assert!(!FileModule.execute(&ctx(), &host, &dir).await.unwrap().changed);

        let absent = params("/var/www", FileState::Absent, None);
        assert!(FileModule.execute(&ctx(), &host, &absent).await.unwrap().changed);
        assert!(!host.state().dirs.contains_key("/var/www/html"));
        assert!(!FileModule.execute(&ctx(), &host, &absent).await.unwrap().changed);
    }

    #[tokio::test]
    async fn test_touch_changes_only_on_create() {
        let host = SimulatedHost::new("web1");
        let p = params("/var/log/app.log", FileState::Touch, None);

        assert!(FileModule.execute(&ctx(), &host, &p).await.unwrap().changed);
        assert!(!FileModule.execute(&ctx(), &host, &p).await.unwrap().changed);
    }

    #[tokio::test]
    async fn test_missing_file_without_content_fails() {
        let host = SimulatedHost::new("web1");
        let result = FileModule
            .execute(&ctx(), &host, &params("/etc/nope", FileState::File, None))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_check_mode_leaves_host_alone() {
        let host = SimulatedHost::new("web1");
        let ctx = ctx().with_check_mode(true);

        let out = FileModule
            .execute(&ctx, &host, &params("/etc/motd", FileState::File, Some("hi\n")))
            .await
            .unwrap();
        assert!(out.changed);
        assert!(host.file("/etc/motd").is_none());
    }
}
