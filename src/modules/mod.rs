// Built-in modules: one resource kind each, inspect first and act on difference

pub mod command;
mod debug;
mod file;
mod firewall;
mod lineinfile;
mod package;
mod pause;
mod service;
mod set_fact;

pub use command::{CommandModule, CommandParams};
pub use debug::DebugModule;
pub use file::{FileModule, FileParams};
pub use firewall::{FirewallModule, FirewallParams, FirewallRule};
pub use lineinfile::{apply_line, LineInFileModule, LineInFileParams};
pub use package::{PackageModule, PackageParams};
pub use pause::PauseModule;
pub use service::{ServiceModule, ServiceParams};
pub use set_fact::SetFactModule;

use std::time::Duration;

use crate::executor::{Connection, ExecutionContext, TaskOutput};
use crate::output::errors::ConvergeError;
use crate::parser::ast::{FileAttrs, FirewallCall, ModuleCall, Value};
use crate::runtime::{evaluate_expression, evaluate_optional_string, evaluate_string};

/// A module call with every expression evaluated for one host
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedCall {
    Package(PackageParams),
    File(FileParams),
    LineInFile(LineInFileParams),
    Service(ServiceParams),
    Firewall(FirewallParams),
    Command(CommandParams),
    SetFact(Vec<(String, Value)>),
    Pause(Duration),
    Debug(String),
}

impl ResolvedCall {
    /// Evaluate a call's parameters. Unresolved references surface here,
    /// before the module runs.
    pub fn resolve(call: &ModuleCall, ctx: &ExecutionContext) -> Result<Self, ConvergeError> {
        Ok(match call {
            ModuleCall::Package { names, state } => {
                let mut resolved = Vec::new();
                for name in names {
                    match evaluate_expression(name, ctx)? {
                        Value::List(items) => resolved.extend(items.iter().map(|v| v.to_string())),
                        other => resolved.push(other.to_string()),
                    }
                }
                ResolvedCall::Package(PackageParams {
                    names: resolved,
                    state: *state,
                })
            }

            ModuleCall::File {
                path,
                state,
                content,
                attrs,
            } => ResolvedCall::File(FileParams {
                path: evaluate_string(path, ctx)?,
                state: *state,
                content: evaluate_optional_string(content.as_ref(), ctx)?,
                attrs: ResolvedAttrs::resolve(attrs, ctx)?,
            }),

            ModuleCall::LineInFile {
                path,
                line,
                regexp,
                insert_after,
                state,
                create,
                attrs,
            } => ResolvedCall::LineInFile(LineInFileParams {
                path: evaluate_string(path, ctx)?,
                line: evaluate_optional_string(line.as_ref(), ctx)?,
                regexp: evaluate_optional_string(regexp.as_ref(), ctx)?,
                insert_after: evaluate_optional_string(insert_after.as_ref(), ctx)?,
                state: *state,
                create: *create,
                attrs: ResolvedAttrs::resolve(attrs, ctx)?,
            }),

            ModuleCall::Service {
                name,
                state,
                enabled,
            } => ResolvedCall::Service(ServiceParams {
                name: evaluate_string(name, ctx)?,
                state: *state,
                enabled: *enabled,
            }),

            ModuleCall::Firewall(FirewallCall::Rule {
                chain,
                protocol,
                port,
                source,
                in_interface,
                ctstate,
                action,
                state,
            }) => ResolvedCall::Firewall(FirewallParams::Rule {
                rule: FirewallRule {
                    chain: evaluate_string(chain, ctx)?,
                    protocol: evaluate_optional_string(protocol.as_ref(), ctx)?,
                    port: evaluate_optional_string(port.as_ref(), ctx)?,
                    source: evaluate_optional_string(source.as_ref(), ctx)?,
                    in_interface: evaluate_optional_string(in_interface.as_ref(), ctx)?,
                    ctstate: evaluate_optional_string(ctstate.as_ref(), ctx)?,
                    action: evaluate_string(action, ctx)?,
                },
                state: *state,
            }),

            ModuleCall::Firewall(FirewallCall::Policy { chain, policy }) => {
                ResolvedCall::Firewall(FirewallParams::Policy {
                    chain: evaluate_string(chain, ctx)?,
                    policy: evaluate_string(policy, ctx)?,
                })
            }

            ModuleCall::Command {
                cmd,
                chdir,
                creates,
                removes,
                shell,
            } => ResolvedCall::Command(CommandParams {
                cmd: evaluate_string(cmd, ctx)?,
                chdir: evaluate_optional_string(chdir.as_ref(), ctx)?,
                creates: evaluate_optional_string(creates.as_ref(), ctx)?,
                removes: evaluate_optional_string(removes.as_ref(), ctx)?,
                shell: *shell,
            }),

            ModuleCall::SetFact { facts } => {
                let mut resolved = Vec::with_capacity(facts.len());
                for (key, expr) in facts {
                    resolved.push((key.clone(), evaluate_expression(expr, ctx)?));
                }
                ResolvedCall::SetFact(resolved)
            }

            ModuleCall::Pause { duration } => ResolvedCall::Pause(*duration),

            ModuleCall::Debug { msg, var } => {
                let text = match (msg, var) {
                    (Some(msg), _) => evaluate_string(msg, ctx)?,
                    (None, Some(var)) => {
                        let value = evaluate_expression(var, ctx)?;
                        format!("{} = {}", DebugModule::label(var), value)
                    }
                    (None, None) => "Hello world!".to_string(),
                };
                ResolvedCall::Debug(text)
            }
        })
    }
}

/// Ownership and mode after evaluation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedAttrs {
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<String>,
}

impl ResolvedAttrs {
    fn resolve(attrs: &FileAttrs, ctx: &ExecutionContext) -> Result<Self, ConvergeError> {
        Ok(ResolvedAttrs {
            owner: evaluate_optional_string(attrs.owner.as_ref(), ctx)?,
            group: evaluate_optional_string(attrs.group.as_ref(), ctx)?,
            mode: evaluate_optional_string(attrs.mode.as_ref(), ctx)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.owner.is_none() && self.group.is_none() && self.mode.is_none()
    }
}

/// Dispatches resolved calls to their module
#[derive(Default)]
pub struct ModuleExecutor {
    package: PackageModule,
    service: ServiceModule,
    file: FileModule,
    lineinfile: LineInFileModule,
    firewall: FirewallModule,
    command: CommandModule,
    set_fact: SetFactModule,
    pause: PauseModule,
    debug: DebugModule,
}

impl ModuleExecutor {
    pub fn new() -> Self {
        ModuleExecutor::default()
    }

    pub async fn execute(
        &self,
        call: &ResolvedCall,
        ctx: &ExecutionContext,
        conn: &dyn Connection,
    ) -> Result<TaskOutput, ConvergeError> {
        match call {
            ResolvedCall::Package(params) => self.package.execute(ctx, conn, params).await,
            ResolvedCall::File(params) => self.file.execute(ctx, conn, params).await,
            ResolvedCall::LineInFile(params) => self.lineinfile.execute(ctx, conn, params).await,
            ResolvedCall::Service(params) => self.service.execute(ctx, conn, params).await,
            ResolvedCall::Firewall(params) => self.firewall.execute(ctx, conn, params).await,
            ResolvedCall::Command(params) => self.command.execute(ctx, conn, params).await,
            ResolvedCall::SetFact(facts) => self.set_fact.execute(ctx, facts),
            ResolvedCall::Pause(duration) => self.pause.execute(ctx, *duration).await,
            ResolvedCall::Debug(msg) => Ok(self.debug.execute(msg)),
        }
    }
}

/// Shell-quote a string for safe use in commands
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Run an action command, wrapped for sudo, and turn a non-zero exit into a
/// module error
pub(crate) async fn run_action(
    module: &str,
    ctx: &ExecutionContext,
    conn: &dyn Connection,
    cmd: &str,
    failure: impl FnOnce() -> String,
) -> Result<String, ConvergeError> {
    let result = conn.exec(&ctx.wrap_command(cmd)).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(ConvergeError::module(
            module,
            conn.host_name(),
            failure(),
            Some(result.stderr),
        ))
    }
}

/// Octal permission bits; `0644` and `644` name the same mode. Symbolic modes
/// are rejected since they cannot be compared with what `stat` reports
pub(crate) fn parse_mode(mode: &str, module: &str, host: &str) -> Result<u32, ConvergeError> {
    let trimmed = mode.trim();
    match u32::from_str_radix(trimmed, 8) {
        Ok(bits) if bits <= 0o7777 && !trimmed.starts_with('+') => Ok(bits),
        _ => Err(ConvergeError::Module(Box::new(crate::output::errors::ModuleError {
            module: module.to_string(),
            task_name: String::new(),
            host: host.to_string(),
            message: format!("Invalid mode '{}'", mode),
            stderr: None,
            suggestion: Some("Use an octal mode such as '0644' (quoted in YAML)".to_string()),
        }))),
    }
}

/// Bring owner, group and mode of an existing path in line; returns the
/// changes made (or that would be made in check mode)
pub(crate) async fn apply_attrs(
    module: &str,
    ctx: &ExecutionContext,
    conn: &dyn Connection,
    path: &str,
    attrs: &ResolvedAttrs,
) -> Result<Vec<String>, ConvergeError> {
    let mut changes = Vec::new();
    let quoted = shell_quote(path);

    if let Some(ref mode) = attrs.mode {
        let wanted = parse_mode(mode, module, conn.host_name())?;
        let current = conn
            .exec(&format!("stat -c '%a' {} 2>/dev/null", quoted))
            .await?;
        // stat drops leading zeros, so a mode of 0000 reads back as "0"
        let current = if current.success() {
            u32::from_str_radix(current.stdout.trim(), 8).ok()
        } else {
            None
        };

        if current != Some(wanted) {
            if !ctx.check_mode {
                run_action(module, ctx, conn, &format!("chmod {:o} {}", wanted, quoted), || {
                    format!("Failed to set mode on {}", path)
                })
                .await?;
            }
            changes.push(format!("mode {:o}", wanted));
        }
    }

    if attrs.owner.is_some() || attrs.group.is_some() {
        let current = conn
            .exec(&format!(
                "stat -c '%U:%G' {} 2>/dev/null || stat -f '%Su:%Sg' {}",
                quoted, quoted
            ))
            .await?;
        let (cur_owner, cur_group) = if current.success() {
            let text = current.stdout.trim().to_string();
            let (o, g) = text.split_once(':').unwrap_or((text.as_str(), ""));
            (o.to_string(), g.to_string())
        } else {
            (String::new(), String::new())
        };

        let owner_differs = attrs.owner.as_deref().is_some_and(|o| o != cur_owner);
        let group_differs = attrs.group.as_deref().is_some_and(|g| g != cur_group);

        if owner_differs || group_differs {
            let ownership = match (&attrs.owner, &attrs.group) {
                (Some(o), Some(g)) => format!("{}:{}", o, g),
                (Some(o), None) => o.clone(),
                (None, Some(g)) => format!(":{}", g),
                (None, None) => String::new(),
            };
            if !ctx.check_mode {
                run_action(
                    module,
                    ctx,
                    conn,
                    &format!("chown {} {}", ownership, quoted),
                    || format!("Failed to set ownership on {}", path),
                )
                .await?;
            }
            changes.push(format!("owner {}", ownership));
        }
    }

    Ok(changes)
}

/// Detect the package manager on a host
pub async fn detect_package_manager(conn: &dyn Connection) -> Result<PackageManager, ConvergeError> {
    let checks = [
        ("which dnf 2>/dev/null", PackageManager::Dnf),
        ("which yum 2>/dev/null", PackageManager::Yum),
        ("which apt-get 2>/dev/null", PackageManager::Apt),
        ("which zypper 2>/dev/null", PackageManager::Zypper),
        ("which pacman 2>/dev/null", PackageManager::Pacman),
        ("which apk 2>/dev/null", PackageManager::Apk),
    ];

    for (cmd, manager) in checks {
        let result = conn.exec(cmd).await?;
        if result.success() && !result.stdout.trim().is_empty() {
            return Ok(manager);
        }
    }

    Err(ConvergeError::Module(Box::new(crate::output::errors::ModuleError {
        module: "package".to_string(),
        task_name: String::new(),
        host: conn.host_name().to_string(),
        message: "Could not detect package manager".to_string(),
        stderr: None,
        suggestion: Some(
            "Supported package managers: apt, dnf, yum, zypper, pacman, apk".to_string(),
        ),
    })))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Zypper,
    Pacman,
    Apk,
}

impl PackageManager {
    pub fn install_cmd(&self, packages: &str) -> String {
        match self {
            PackageManager::Apt => format!(
                "DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
                packages
            ),
            PackageManager::Dnf => format!("dnf install -y {}", packages),
            PackageManager::Yum => format!("yum install -y {}", packages),
            PackageManager::Zypper => format!("zypper --non-interactive install {}", packages),
            PackageManager::Pacman => format!("pacman -S --noconfirm --needed {}", packages),
            PackageManager::Apk => format!("apk add {}", packages),
        }
    }

    pub fn remove_cmd(&self, packages: &str) -> String {
        match self {
            PackageManager::Apt => format!(
                "DEBIAN_FRONTEND=noninteractive apt-get remove -y {}",
                packages
            ),
            PackageManager::Dnf => format!("dnf remove -y {}", packages),
            PackageManager::Yum => format!("yum remove -y {}", packages),
            PackageManager::Zypper => format!("zypper --non-interactive remove {}", packages),
            PackageManager::Pacman => format!("pacman -R --noconfirm {}", packages),
            PackageManager::Apk => format!("apk del {}", packages),
        }
    }

    pub fn upgrade_cmd(&self, packages: &str) -> String {
        match self {
            PackageManager::Apt => format!(
                "DEBIAN_FRONTEND=noninteractive apt-get install --only-upgrade -y {}",
                packages
            ),
            PackageManager::Dnf => format!("dnf upgrade -y {}", packages),
            PackageManager::Yum => format!("yum update -y {}", packages),
            PackageManager::Zypper => format!("zypper --non-interactive update {}", packages),
            PackageManager::Pacman => format!("pacman -S --noconfirm {}", packages),
            PackageManager::Apk => format!("apk upgrade {}", packages),
        }
    }

    /// Exits zero iff the package is installed
    pub fn check_installed_cmd(&self, package: &str) -> String {
        let quoted = shell_quote(package);
        match self {
            PackageManager::Apt => format!("dpkg -l {} 2>/dev/null | grep -q '^ii'", quoted),
            PackageManager::Dnf | PackageManager::Yum | PackageManager::Zypper => {
                format!("rpm -q {} >/dev/null 2>&1", quoted)
            }
            PackageManager::Pacman => format!("pacman -Q {} >/dev/null 2>&1", quoted),
            PackageManager::Apk => format!("apk info -e {} >/dev/null 2>&1", quoted),
        }
    }

    /// Exits zero iff a newer version of an installed package is available
    pub fn check_upgradable_cmd(&self, package: &str) -> String {
        match self {
            PackageManager::Apt => format!(
                "apt list --upgradable 2>/dev/null | grep -q {}",
                shell_quote(&format!("^{}/", package))
            ),
            PackageManager::Dnf | PackageManager::Yum => {
                let tool = if *self == PackageManager::Dnf { "dnf" } else { "yum" };
                format!(
                    "{} -q check-update {} >/dev/null 2>&1; test $? -eq 100",
                    tool,
                    shell_quote(package)
                )
            }
            PackageManager::Zypper => format!(
                "zypper --non-interactive list-updates 2>/dev/null | grep -q {}",
                shell_quote(&format!("| {} ", package))
            ),
            PackageManager::Pacman => format!("pacman -Qu {} >/dev/null 2>&1", shell_quote(package)),
            PackageManager::Apk => format!(
                "apk version {} 2>/dev/null | grep -q '<'",
                shell_quote(package)
            ),
        }
    }
}
