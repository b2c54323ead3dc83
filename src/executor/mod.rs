// Executor: connections, per-host task runner and the multi-host dispatcher

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::inventory::Host;
use crate::output::errors::ConvergeError;

pub mod context;
pub mod facts;
pub mod handlers;
pub mod local;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod ssh;

#[cfg(test)]
pub mod mock;

pub use context::{ExecutionContext, TaskOutput};
pub use facts::{FactError, FactStore};
pub use handlers::HandlerRegistry;
pub use local::LocalConnection;
pub use retry::{retry, RetryOutcome, RetryPolicy, Verdict};
pub use runner::{HostRunner, RunnerOptions};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use ssh::{ConnectionPool, SshConnection, SshSettings};

/// Exec-and-capture access to one target host
#[async_trait]
pub trait Connection: Send + Sync {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, ConvergeError>;

    async fn read_file(&self, path: &str) -> Result<String, ConvergeError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), ConvergeError>;

    fn host_name(&self) -> &str;
}

/// Result of executing a command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Opens the connection a host's worker will use for the whole run
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>, ConvergeError>;
}

/// Local execution for localhost-like hosts, pooled SSH for everything else
pub struct HostConnector {
    pool: ConnectionPool,
    command_timeout: Option<Duration>,
}

impl HostConnector {
    pub fn new(settings: SshSettings) -> Self {
        HostConnector {
            command_timeout: settings.command_timeout,
            pool: ConnectionPool::new(settings),
        }
    }
}

#[async_trait]
impl Connector for HostConnector {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>, ConvergeError> {
        if host.is_local() {
            return Ok(Arc::new(
                LocalConnection::new(&host.name).with_timeout(self.command_timeout),
            ));
        }
        Ok(Arc::new(self.pool.get(host).await?))
    }
}
