// Package module - install/remove/upgrade packages

use dashmap::DashMap;
use tracing::debug;

use super::{detect_package_manager, run_action, shell_quote, PackageManager};
use crate::executor::{Connection, ExecutionContext, TaskOutput};
use crate::output::errors::ConvergeError;
use crate::parser::ast::{PackageState, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct PackageParams {
    pub names: Vec<String>,
    pub state: PackageState,
}

/// Detected package manager per host, so mixed fleets are handled
#[derive(Default)]
pub struct PackageModule {
    managers: DashMap<String, PackageManager>,
}

impl PackageModule {
    pub fn new() -> Self {
        PackageModule::default()
    }

    async fn manager(&self, conn: &dyn Connection) -> Result<PackageManager, ConvergeError> {
        if let Some(m) = self.managers.get(conn.host_name()) {
            return Ok(*m);
        }
        let m = detect_package_manager(conn).await?;
        debug!(host = conn.host_name(), manager = ?m, "detected package manager");
        self.managers.insert(conn.host_name().to_string(), m);
        Ok(m)
    }

    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        conn: &dyn Connection,
        params: &PackageParams,
    ) -> Result<TaskOutput, ConvergeError> {
        if params.names.is_empty() {
            return Err(ConvergeError::module(
                "package",
                conn.host_name(),
                "No package names given",
                None,
            ));
        }

        let manager = self.manager(conn).await?;

        let mut installed = Vec::new();
        let mut missing = Vec::new();
        for name in &params.names {
            if conn.exec(&manager.check_installed_cmd(name)).await?.success() {
                installed.push(name.clone());
            } else {
                missing.push(name.clone());
            }
        }

        let (to_install, to_upgrade, to_remove) = match params.state {
            PackageState::Present => (missing, Vec::new(), Vec::new()),
            PackageState::Absent => (Vec::new(), Vec::new(), installed),
            PackageState::Latest => {
                let mut outdated = Vec::new();
                for name in &installed {
                    if conn.exec(&manager.check_upgradable_cmd(name)).await?.success() {
                        outdated.push(name.clone());
                    }
                }
                (missing, outdated, Vec::new())
            }
        };

        if to_install.is_empty() && to_upgrade.is_empty() && to_remove.is_empty() {
            let what = match params.state {
                PackageState::Present => "installed",
                PackageState::Latest => "at the latest version",
                PackageState::Absent => "absent",
            };
            return Ok(TaskOutput::success()
                .with_stdout(format!("{} already {}", params.names.join(", "), what)));
        }

        let mut summary = Vec::new();
        let mut stdout = String::new();
        let steps = [
            ("install", &to_install),
            ("upgrade", &to_upgrade),
            ("remove", &to_remove),
        ];

        for (verb, names) in steps {
            if names.is_empty() {
                continue;
            }
            summary.push(format!("{} {}", verb, names.join(", ")));
            if ctx.check_mode {
                continue;
            }

            let quoted = names.iter().map(|n| shell_quote(n)).collect::<Vec<_>>().join(" ");
            let cmd = match verb {
                "install" => manager.install_cmd(&quoted),
                "upgrade" => manager.upgrade_cmd(&quoted),
                _ => manager.remove_cmd(&quoted),
            };
            let out = run_action("package", ctx, conn, &cmd, || {
                format!("Failed to {} {}", verb, names.join(", "))
            })
            .await?;
            stdout.push_str(&out);
        }

        let message = if ctx.check_mode {
            format!("Would {}", summary.join("; "))
        } else {
            summary.join("; ")
        };

        let list = |names: &Vec<String>| Value::List(names.iter().map(|n| Value::from(n.as_str())).collect());
        Ok(TaskOutput::changed()
            .with_stdout(stdout)
            .with_message(message)
            .with_data("installed", list(&to_install))
            .with_data("upgraded", list(&to_upgrade))
            .with_data("removed", list(&to_remove)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::SimulatedHost;
    use crate::inventory::Host;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Arc::new(Host::new("web1")), HashMap::new())
    }

    fn params(names: &[&str], state: PackageState) -> PackageParams {
        PackageParams {
            names: names.iter().map(|s| s.to_string()).collect(),
            state,
        }
    }

    #[tokio::test]
    async fn test_present_installs_only_missing() {
        let host = SimulatedHost::new("web1").with_package("apache2");
        let module = PackageModule::new();
        let p = params(&["apache2", "php"], PackageState::Present);

        let first = module.execute(&ctx(), &host, &p).await.unwrap();
        assert!(first.changed);
        assert_eq!(host.state().install_log, vec!["php"]);

        let second = module.execute(&ctx(), &host, &p).await.unwrap();
        assert!(!second.changed);
        assert_eq!(host.count("apt-get install"), 1);
    }

    #[tokio::test]
    async fn test_absent_removes_installed() {
        let host = SimulatedHost::new("web1").with_package("telnet");
        let module = PackageModule::new();
        let p = params(&["telnet", "rsh"], PackageState::Absent);

        assert!(module.execute(&ctx(), &host, &p).await.unwrap().changed);
        assert!(!host.state().packages.contains("telnet"));
        assert!(!module.execute(&ctx(), &host, &p).await.unwrap().changed);
    }

    #[tokio::test]
    async fn test_latest_upgrades_outdated() {
        let host = SimulatedHost::new("web1").with_package("openssl");
        host.state().upgradable.insert("openssl".to_string());
        let module = PackageModule::new();
        let p = params(&["openssl"], PackageState::Latest);

        let first = module.execute(&ctx(), &host, &p).await.unwrap();
        assert!(first.changed);
        assert_eq!(host.count("--only-upgrade"), 1);

        assert!(!module.execute(&ctx(), &host, &p).await.unwrap().changed);
    }

    #[tokio::test]
    async fn test_check_mode_does_not_act() {
        let host = SimulatedHost::new("web1");
        let module = PackageModule::new();
        let ctx = ctx().with_check_mode(true);

        let out = module
            .execute(&ctx, &host, &params(&["nginx"], PackageState::Present))
            .await
            .unwrap();
        assert!(out.changed);
        assert_eq!(out.message.as_deref(), Some("Would install nginx"));
        assert!(host.state().packages.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_package_is_module_error() {
        let host = SimulatedHost::new("web1").with_available(&["nginx"]);
        let module = PackageModule::new();

        let err = module
            .execute(&ctx(), &host, &params(&["no-such-pkg"], PackageState::Present))
            .await
            .unwrap_err();
        match err {
            ConvergeError::Module(e) => {
                assert_eq!(e.module, "package");
                assert!(e.stderr.unwrap_or_default().contains("Unable to locate"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
