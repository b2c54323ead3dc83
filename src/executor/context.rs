// Execution context for tasks on one host

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::facts::FactStore;
use crate::inventory::Host;
use crate::parser::ast::Value;

/// Everything a task on a specific host can see
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub host: Arc<Host>,
    /// Phase variables overlaid with host variables
    vars: Arc<HashMap<String, Value>>,
    /// Host fact store: registered outputs and set_fact values, never shrinks
    facts: Arc<RwLock<HashMap<String, Value>>>,
    /// Short-lived bindings such as `result` while a predicate is evaluated
    locals: HashMap<String, Value>,
    /// Cross-phase facts published by earlier phases
    run_facts: Arc<FactStore>,
    /// Group key of the phase being run, used when publishing
    pub group: String,
    pub check_mode: bool,
    pub diff_mode: bool,
    pub sudo: bool,
    pub sudo_user: Option<String>,
}

impl ExecutionContext {
    pub fn new(host: Arc<Host>, phase_vars: HashMap<String, Value>) -> Self {
        let run_facts = Arc::new(FactStore::new());
        let facts = Arc::new(RwLock::new(HashMap::new()));
        ExecutionContext::build(host, phase_vars, facts, run_facts, String::from("all"))
    }

    fn build(
        host: Arc<Host>,
        phase_vars: HashMap<String, Value>,
        facts: Arc<RwLock<HashMap<String, Value>>>,
        run_facts: Arc<FactStore>,
        group: String,
    ) -> Self {
        let mut vars = phase_vars;
        for (k, v) in &host.vars {
            vars.insert(k.clone(), v.clone());
        }
        vars.insert("host".to_string(), host_to_value(&host));
        vars.insert(
            "inventory_hostname".to_string(),
            Value::String(host.name.clone()),
        );

        ExecutionContext {
            host,
            vars: Arc::new(vars),
            facts,
            locals: HashMap::new(),
            run_facts,
            group,
            check_mode: false,
            diff_mode: false,
            sudo: false,
            sudo_user: None,
        }
    }

    /// Context for the next phase on the same host: host facts carry over,
    /// phase variables are replaced
    pub fn for_phase(&self, group: &str, phase_vars: HashMap<String, Value>) -> Self {
        let mut ctx = ExecutionContext::build(
            self.host.clone(),
            phase_vars,
            self.facts.clone(),
            self.run_facts.clone(),
            group.to_string(),
        );
        ctx.check_mode = self.check_mode;
        ctx.diff_mode = self.diff_mode;
        ctx.sudo = self.sudo;
        ctx.sudo_user = self.sudo_user.clone();
        ctx
    }

    pub fn with_run_facts(mut self, run_facts: Arc<FactStore>) -> Self {
        self.run_facts = run_facts;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_sudo(mut self, sudo: bool, sudo_user: Option<String>) -> Self {
        self.sudo = sudo;
        self.sudo_user = sudo_user;
        self
    }

    pub fn with_check_mode(mut self, check: bool) -> Self {
        self.check_mode = check;
        self
    }

    pub fn with_diff_mode(mut self, diff: bool) -> Self {
        self.diff_mode = diff;
        self
    }

    /// Temporary binding visible only through the returned context
    pub fn with_local(&self, name: impl Into<String>, value: Value) -> Self {
        let mut ctx = self.clone();
        ctx.locals.insert(name.into(), value);
        ctx
    }

    pub fn run_facts(&self) -> &FactStore {
        &self.run_facts
    }

    /// Look up a top-level name: locals, then host facts, then variables
    pub fn get_var(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.locals.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.facts.read().get(name) {
            return Some(v.clone());
        }
        self.vars.get(name).cloned()
    }

    /// Look up a dotted path such as `web.stdout` or `vars.port`
    pub fn get_nested_var(&self, path: &[String]) -> Option<Value> {
        let (first, rest) = path.split_first()?;

        if first == "vars" && !rest.is_empty() {
            return self.get_nested_var(rest);
        }

        let base = self.get_var(first)?;
        base.lookup_path(rest).cloned()
    }

    /// Add or update a host fact
    pub fn set_fact(&self, name: impl Into<String>, value: Value) {
        self.facts.write().insert(name.into(), value);
    }

    /// Register task output as a host fact
    pub fn register(&self, name: impl Into<String>, output: &TaskOutput) {
        self.set_fact(name, output.to_value());
    }

    pub fn get_fact(&self, name: &str) -> Option<Value> {
        self.facts.read().get(name).cloned()
    }

    /// Wrap a command with sudo if needed
    pub fn wrap_command(&self, cmd: &str) -> String {
        if self.sudo {
            if let Some(ref user) = self.sudo_user {
                format!("sudo -n -u {} -- sh -c {}", user, shell_escape(cmd))
            } else {
                format!("sudo -n -- sh -c {}", shell_escape(cmd))
            }
        } else {
            cmd.to_string()
        }
    }
}

/// Escape a command for use in sh -c
fn shell_escape(cmd: &str) -> String {
    format!("'{}'", cmd.replace('\'', "'\"'\"'"))
}

/// Output from a task execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub changed: bool,
    pub failed: bool,
    pub skipped: bool,
    pub message: Option<String>,
    pub data: HashMap<String, Value>,
    /// Unified diff of file changes (diff mode)
    pub diff: Option<String>,
}

impl TaskOutput {
    pub fn success() -> Self {
        TaskOutput::default()
    }

    pub fn changed() -> Self {
        TaskOutput {
            changed: true,
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        TaskOutput {
            exit_code: 1,
            failed: true,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn skipped() -> Self {
        TaskOutput {
            skipped: true,
            ..Default::default()
        }
    }

    pub fn with_changed(mut self, changed: bool) -> Self {
        self.changed = changed;
        self
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_diff(mut self, diff: impl Into<String>) -> Self {
        self.diff = Some(diff.into());
        self
    }

    /// Convert to a Value for use in expressions
    pub fn to_value(&self) -> Value {
        let mut map = HashMap::new();

        map.insert("stdout".to_string(), Value::String(self.stdout.clone()));
        map.insert("stderr".to_string(), Value::String(self.stderr.clone()));
        map.insert("rc".to_string(), Value::Int(self.exit_code as i64));
        map.insert("changed".to_string(), Value::Bool(self.changed));
        map.insert("failed".to_string(), Value::Bool(self.failed));
        map.insert("skipped".to_string(), Value::Bool(self.skipped));

        if let Some(ref msg) = self.message {
            map.insert("msg".to_string(), Value::String(msg.clone()));
        }

        let lines: Vec<Value> = self
            .stdout
            .lines()
            .map(|l| Value::String(l.to_string()))
            .collect();
        map.insert("stdout_lines".to_string(), Value::List(lines));

        for (k, v) in &self.data {
            map.insert(k.clone(), v.clone());
        }

        Value::Dict(map)
    }
}

fn host_to_value(host: &Host) -> Value {
    let mut map = HashMap::new();

    map.insert("name".to_string(), Value::String(host.name.clone()));
    map.insert("address".to_string(), Value::String(host.address.clone()));
    map.insert("port".to_string(), Value::Int(host.port as i64));
    map.insert("user".to_string(), Value::String(host.user.clone()));

    let mut groups: Vec<&String> = host.groups.iter().collect();
    groups.sort();
    map.insert(
        "groups".to_string(),
        Value::List(groups.into_iter().map(|g| Value::String(g.clone())).collect()),
    );

    for (k, v) in &host.vars {
        map.insert(k.clone(), v.clone());
    }

    Value::Dict(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_context() -> ExecutionContext {
        let host = Host::new("web1")
            .with_address("192.168.1.10")
            .with_var("env", Value::String("prod".to_string()));

        let mut vars = HashMap::new();
        vars.insert("webserver".to_string(), Value::String("nginx".to_string()));
        vars.insert("env".to_string(), Value::String("dev".to_string()));

        ExecutionContext::new(Arc::new(host), vars)
    }

    #[test]
    fn test_host_vars_override_phase_vars() {
        let ctx = create_test_context();

        assert_eq!(ctx.get_var("webserver"), Some(Value::from("nginx")));
        assert_eq!(ctx.get_var("env"), Some(Value::from("prod")));
        assert!(ctx.get_var("nonexistent").is_none());
    }

    #[test]
    fn test_nested_var() {
        let ctx = create_test_context();

        let host_name = ctx.get_nested_var(&["host".to_string(), "name".to_string()]);
        assert_eq!(host_name, Some(Value::from("web1")));
        assert_eq!(
            ctx.get_nested_var(&["vars".to_string(), "webserver".to_string()]),
            Some(Value::from("nginx"))
        );
    }

    #[test]
    fn test_register_and_facts_carry_across_phases() {
        let ctx = create_test_context();
        ctx.register("result", &TaskOutput::changed().with_stdout("hello\nworld"));
        ctx.set_fact("release", Value::from("1.2"));

        let next = ctx.for_phase("webservers", HashMap::new());
        assert_eq!(next.group, "webservers");
        assert_eq!(
            next.get_nested_var(&["result".to_string(), "stdout_lines".to_string(), "1".to_string()]),
            Some(Value::from("world"))
        );
        assert_eq!(next.get_var("release"), Some(Value::from("1.2")));
        assert!(next.get_var("webserver").is_none());
        assert_eq!(next.get_fact("release"), Some(Value::from("1.2")));
        assert!(next.get_fact("result").is_some());
    }

    #[test]
    fn test_locals_shadow_without_leaking() {
        let ctx = create_test_context();
        let scoped = ctx.with_local("result", Value::Int(3));

        assert_eq!(scoped.get_var("result"), Some(Value::Int(3)));
        assert!(ctx.get_var("result").is_none());
    }

    #[test]
    fn test_wrap_command() {
        let ctx = create_test_context();
        assert_eq!(ctx.wrap_command("id -u"), "id -u");

        let sudo = ctx.with_sudo(true, None);
        assert_eq!(sudo.wrap_command("echo 'hi'"), "sudo -n -- sh -c 'echo '\"'\"'hi'\"'\"''");
    }
}
