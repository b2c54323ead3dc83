// Service module - manage systemd services

use super::{run_action, shell_quote};
use crate::executor::{Connection, ExecutionContext, TaskOutput};
use crate::output::errors::ConvergeError;
use crate::parser::ast::ServiceState;

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceParams {
    pub name: String,
    pub state: Option<ServiceState>,
    pub enabled: Option<bool>,
}

#[derive(Default)]
pub struct ServiceModule;

struct ServiceStatus {
    running: bool,
    enabled: bool,
}

impl ServiceModule {
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        conn: &dyn Connection,
        params: &ServiceParams,
    ) -> Result<TaskOutput, ConvergeError> {
        let name = params.name.as_str();
        let unit = shell_quote(name);
        let current = service_status(conn, &unit).await?;

        // (command, fallback, description)
        let mut actions: Vec<(String, Option<String>, String)> = Vec::new();

        match params.state {
            Some(ServiceState::Started) if !current.running => actions.push((
                format!("systemctl start {}", unit),
                None,
                format!("started {}", name),
            )),
            Some(ServiceState::Stopped) if current.running => actions.push((
                format!("systemctl stop {}", unit),
                None,
                format!("stopped {}", name),
            )),
            Some(ServiceState::Restarted) => actions.push((
                format!("systemctl restart {}", unit),
                None,
                format!("restarted {}", name),
            )),
            Some(ServiceState::Reloaded) => actions.push((
                format!("systemctl reload {}", unit),
                Some(format!("systemctl reload-or-restart {}", unit)),
                format!("reloaded {}", name),
            )),
            _ => {}
        }

        match params.enabled {
            Some(true) if !current.enabled => actions.push((
                format!("systemctl enable {}", unit),
                None,
                format!("enabled {}", name),
            )),
            Some(false) if current.enabled => actions.push((
                format!("systemctl disable {}", unit),
                None,
                format!("disabled {}", name),
            )),
            _ => {}
        }

        if actions.is_empty() {
            return Ok(TaskOutput::success().with_stdout(format!(
                "Service {} is {}{}",
                name,
                if current.running { "running" } else { "stopped" },
                if current.enabled { " and enabled" } else { "" },
            )));
        }

        let mut done = Vec::new();
        for (cmd, fallback, description) in actions {
            if !ctx.check_mode {
                let result = conn.exec(&ctx.wrap_command(&cmd)).await?;
                if !result.success() {
                    match fallback {
                        Some(fallback) => {
                            run_action("service", ctx, conn, &fallback, || {
                                format!("Failed to reload service {}", name)
                            })
                            .await?;
                        }
                        None => {
                            return Err(ConvergeError::module(
                                "service",
                                conn.host_name(),
                                format!("Failed to run '{}'", cmd),
                                Some(result.stderr),
                            ));
                        }
                    }
                }
            }
            done.push(description);
        }

        let message = done.join(", ");
        Ok(TaskOutput::changed().with_message(if ctx.check_mode {
            format!("Would have {}", message)
        } else {
            message
        }))
    }
}

async fn service_status(conn: &dyn Connection, unit: &str) -> Result<ServiceStatus, ConvergeError> {
    let active = conn
        .exec(&format!("systemctl is-active {} 2>/dev/null || true", unit))
        .await?;
    let enabled = conn
        .exec(&format!("systemctl is-enabled {} 2>/dev/null || true", unit))
        .await?;

    Ok(ServiceStatus {
        running: active.stdout.trim() == "active",
        enabled: enabled.stdout.trim() == "enabled",
    })
}
