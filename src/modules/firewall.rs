// Firewall module - iptables rules and chain policies

use super::run_action;
use crate::executor::{Connection, ExecutionContext, TaskOutput};
use crate::output::errors::ConvergeError;
use crate::parser::ast::{RuleState, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum FirewallParams {
    Rule { rule: FirewallRule, state: RuleState },
    Policy { chain: String, policy: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FirewallRule {
    pub chain: String,
    pub protocol: Option<String>,
    pub port: Option<String>,
    pub source: Option<String>,
    pub in_interface: Option<String>,
    pub ctstate: Option<String>,
    pub action: String,
}

impl FirewallRule {
    /// Rule specification in a fixed criteria order, so the same declaration
    /// always yields the same key
    pub fn rule_args(&self) -> Result<String, String> {
        let mut parts: Vec<String> = Vec::new();

        let protocol = non_empty(&self.protocol).map(str::to_lowercase);
        if let Some(ref p) = protocol {
            parts.push(format!("-p {}", p));
        }
        if let Some(s) = non_empty(&self.source) {
            parts.push(format!("-s {}", s));
        }
        if let Some(i) = non_empty(&self.in_interface) {
            parts.push(format!("-i {}", i));
        }
        if let Some(port) = non_empty(&self.port) {
            if protocol.is_none() {
                return Err(format!("port {} requires a protocol", port));
            }
            let valid = port
                .split(':')
                .all(|p| p.parse::<u16>().is_ok_and(|n| n > 0));
            if !valid {
                return Err(format!("invalid port '{}'", port));
            }
            parts.push(format!("--dport {}", port));
        }
        if let Some(states) = non_empty(&self.ctstate) {
            let mut states: Vec<String> = states
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            states.sort();
            states.dedup();
            parts.push(format!("-m conntrack --ctstate {}", states.join(",")));
        }

        let action = self.action.trim().to_uppercase();
        if action.is_empty() {
            return Err("a rule needs an action".to_string());
        }
        parts.push(format!("-j {}", action));

        Ok(parts.join(" "))
    }

    /// Chain plus criteria plus action
    pub fn key(&self) -> Result<String, String> {
        Ok(format!("{} {}", self.chain.trim(), self.rule_args()?))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Default)]
pub struct FirewallModule;

impl FirewallModule {
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        conn: &dyn Connection,
        params: &FirewallParams,
    ) -> Result<TaskOutput, ConvergeError> {
        match params {
            FirewallParams::Rule { rule, state } => self.ensure_rule(ctx, conn, rule, *state).await,
            FirewallParams::Policy { chain, policy } => {
                self.ensure_policy(ctx, conn, chain.trim(), policy).await
            }
        }
    }

    async fn ensure_rule(
        &self,
        ctx: &ExecutionContext,
        conn: &dyn Connection,
        rule: &FirewallRule,
        state: RuleState,
    ) -> Result<TaskOutput, ConvergeError> {
        let chain = rule.chain.trim();
        let spec = rule
            .rule_args()
            .map_err(|e| ConvergeError::module("firewall", conn.host_name(), e, None))?;
        let key = format!("{} {}", chain, spec);

        let present = conn
            .exec(&ctx.wrap_command(&format!("iptables -C {} {}", chain, spec)))
            .await?
            .success();

        let action = match (state, present) {
            (RuleState::Present, false) => Some(("-A", "appended")),
            (RuleState::Absent, true) => Some(("-D", "deleted")),
            _ => None,
        };

        let Some((flag, verb)) = action else {
            return Ok(TaskOutput::success()
                .with_message(format!("rule already {}: {}", if present { "present" } else { "absent" }, key))
                .with_data("rule", Value::from(key)));
        };

        if !ctx.check_mode {
            run_action(
                "firewall",
                ctx,
                conn,
                &format!("iptables {} {} {}", flag, chain, spec),
                || format!("Failed to update rule {}", key),
            )
            .await?;
        }

        let message = if ctx.check_mode {
            format!("would have {} rule: {}", verb, key)
        } else {
            format!("{} rule: {}", verb, key)
        };
        Ok(TaskOutput::changed()
            .with_message(message)
            .with_data("rule", Value::from(key)))
    }

    async fn ensure_policy(
        &self,
        ctx: &ExecutionContext,
        conn: &dyn Connection,
        chain: &str,
        policy: &str,
    ) -> Result<TaskOutput, ConvergeError> {
        let policy = policy.trim().to_uppercase();
        if !matches!(chain, "INPUT" | "FORWARD" | "OUTPUT") {
            return Err(ConvergeError::module(
                "firewall",
                conn.host_name(),
                format!("Only built-in chains have a policy, not '{}'", chain),
                None,
            ));
        }
        if !matches!(policy.as_str(), "ACCEPT" | "DROP") {
            return Err(ConvergeError::module(
                "firewall",
                conn.host_name(),
                format!("Invalid policy '{}'", policy),
                None,
            ));
        }

        let listing = run_action(
            "firewall",
            ctx,
            conn,
            &format!("iptables -S {}", chain),
            || format!("Failed to list chain {}", chain),
        )
        .await?;
        let current = current_policy(&listing, chain);

        if current.as_deref() == Some(policy.as_str()) {
            return Ok(TaskOutput::success()
                .with_message(format!("{} policy already {}", chain, policy)));
        }

        if !ctx.check_mode {
            run_action(
                "firewall",
                ctx,
                conn,
                &format!("iptables -P {} {}", chain, policy),
                || format!("Failed to set {} policy", chain),
            )
            .await?;
        }

        Ok(TaskOutput::changed().with_message(format!(
            "{}{} policy {} -> {}",
            if ctx.check_mode { "would change " } else { "" },
            chain,
            current.unwrap_or_else(|| "-".to_string()),
            policy
        )))
    }
}

/// Policy from an `iptables -S CHAIN` listing (`-P INPUT ACCEPT`)
fn current_policy(listing: &str, chain: &str) -> Option<String> {
    listing.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("-P"), Some(c), Some(p)) if c == chain => Some(p.to_string()),
            _ => None,
        }
    })
}
