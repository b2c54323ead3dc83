// Command execution on the control machine

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

use super::{CommandResult, Connection};
use crate::output::errors::ConvergeError;

pub struct LocalConnection {
    host_name: String,
    command_timeout: Option<Duration>,
}

impl LocalConnection {
    pub fn new(host_name: impl Into<String>) -> Self {
        LocalConnection {
            host_name: host_name.into(),
            command_timeout: None,
        }
    }

    /// Kill commands that run longer than `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, ConvergeError> {
        trace!(host = %self.host_name, cmd, "local exec");

        let child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .kill_on_drop(true)
            .output();

        let output = match self.command_timeout {
            Some(limit) => tokio::time::timeout(limit, child)
                .await
                .map_err(|_| ConvergeError::Timeout {
                    operation: format!("command on {}: {}", self.host_name, cmd),
                    duration_secs: limit.as_secs(),
                })?,
            None => child.await,
        }
        .map_err(|e| ConvergeError::Runtime {
            message: format!("Failed to execute local command: {}", e),
            suggestion: Some("Check that 'sh' is available on the system".to_string()),
        })?;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn read_file(&self, path: &str) -> Result<String, ConvergeError> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConvergeError::Io {
                message: format!("Failed to read file: {}", e),
                path: Some(PathBuf::from(path)),
            })
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), ConvergeError> {
        tokio::fs::write(path, content)
            .await
            .map_err(|e| ConvergeError::Io {
                message: format!("Failed to write file: {}", e),
                path: Some(PathBuf::from(path)),
            })
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_exec() {
        let conn = LocalConnection::new("localhost");
        let result = conn.exec("echo 'hello world'; echo oops >&2").await.unwrap();

        assert!(result.success());
        assert_eq!(result.stdout, "hello world\n");
        assert_eq!(result.stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_local_exec_failure() {
        let conn = LocalConnection::new("localhost");
        let result = conn.exec("exit 3").await.unwrap();

        assert!(!result.success());
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let conn = LocalConnection::new("localhost").with_timeout(Some(Duration::from_millis(50)));
        let err = conn.exec("sleep 5").await.unwrap_err();

        assert!(matches!(err, ConvergeError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_file_operations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motd");
        let path = path.to_str().unwrap();

        let conn = LocalConnection::new("localhost");
        conn.write_file(path, "welcome\n").await.unwrap();
        assert_eq!(conn.read_file(path).await.unwrap(), "welcome\n");

        let missing = conn.read_file("/nonexistent/converge/file").await;
        assert!(matches!(missing, Err(ConvergeError::Io { .. })));
    }
}
