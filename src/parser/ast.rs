// Abstract Syntax Tree types for converge run declarations

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Source location for error reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// A complete run declaration: phases executed in order behind a barrier
#[derive(Debug, Clone, Default)]
pub struct Playbook {
    pub source_file: String,
    pub phases: Vec<Phase>,
}

impl Playbook {
    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }

    pub fn handler_count(&self) -> usize {
        self.phases.iter().map(|p| p.handlers.len()).sum()
    }
}

/// One (host group, task list) pair of a run
#[derive(Debug, Clone)]
pub struct Phase {
    pub name: String,
    pub hosts: HostPattern,
    pub vars: HashMap<String, Value>,
    pub tasks: Vec<Task>,
    pub handlers: Vec<Handler>,
    /// Default privilege escalation for every task in the phase
    pub sudo: bool,
}

impl Phase {
    /// Group key under which published facts of this phase are captured
    pub fn group_key(&self) -> String {
        self.hosts.to_string()
    }
}

/// Host targeting pattern
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HostPattern {
    #[default]
    All,
    /// A group name or a single host name
    Group(String),
    /// Comma-separated union of groups and hosts
    Union(Vec<String>),
}

impl HostPattern {
    pub fn parse(raw: &str) -> Self {
        let parts: Vec<String> = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        match parts.as_slice() {
            [] => HostPattern::All,
            [single] if single == "all" || single == "*" => HostPattern::All,
            [single] => HostPattern::Group(single.clone()),
            _ => HostPattern::Union(parts),
        }
    }
}

impl std::fmt::Display for HostPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostPattern::All => write!(f, "all"),
            HostPattern::Group(name) => write!(f, "{}", name),
            HostPattern::Union(parts) => write!(f, "{}", parts.join(",")),
        }
    }
}

/// A single declared desired-state assertion
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub module: ModuleCall,
    pub when: Option<Expression>,
    pub register: Option<String>,
    /// Capture registered output and set facts into the run fact store
    pub publish: bool,
    pub fail_when: Option<Expression>,
    pub changed_when: Option<Expression>,
    pub notify: Vec<String>,
    pub failure: FailurePolicy,
    pub sudo: Option<bool>,
    pub location: Option<SourceLocation>,
}

impl Task {
    pub fn new(name: impl Into<String>, module: ModuleCall) -> Self {
        Task {
            name: name.into(),
            module,
            when: None,
            register: None,
            publish: false,
            fail_when: None,
            changed_when: None,
            notify: Vec::new(),
            failure: FailurePolicy::FailFast,
            sudo: None,
            location: None,
        }
    }
}

/// What happens to the rest of a host's tasks when a task fails
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FailurePolicy {
    #[default]
    FailFast,
    Ignore,
    /// Re-run before giving up; `then` applies once attempts are exhausted
    Retry {
        retry: RetryConfig,
        then: OnExhausted,
    },
}

impl FailurePolicy {
    /// Whether a final failure under this policy aborts the host
    pub fn aborts_host(&self) -> bool {
        match self {
            FailurePolicy::FailFast => true,
            FailurePolicy::Ignore => false,
            FailurePolicy::Retry { then, .. } => *then == OnExhausted::FailFast,
        }
    }

    pub fn retry_config(&self) -> Option<&RetryConfig> {
        match self {
            FailurePolicy::Retry { retry, .. } => Some(retry),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnExhausted {
    #[default]
    FailFast,
    Ignore,
}

/// Bounded retry with a fixed delay between attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub attempts: u32,
    pub delay: Duration,
    /// Success predicate evaluated against the attempt's output
    pub until: Option<Expression>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            attempts: 3,
            delay: Duration::from_secs(1),
            until: None,
        }
    }
}

/// Module invocations, one variant per resource kind
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleCall {
    Package {
        names: Vec<Expression>,
        state: PackageState,
    },
    File {
        path: Expression,
        state: FileState,
        content: Option<Expression>,
        attrs: FileAttrs,
    },
    LineInFile {
        path: Expression,
        line: Option<Expression>,
        regexp: Option<Expression>,
        insert_after: Option<Expression>,
        state: LineState,
        create: bool,
        attrs: FileAttrs,
    },
    Service {
        name: Expression,
        state: Option<ServiceState>,
        enabled: Option<bool>,
    },
    Firewall(FirewallCall),
    Command {
        cmd: Expression,
        chdir: Option<Expression>,
        /// Skip when this path already exists
        creates: Option<Expression>,
        /// Skip unless this path exists
        removes: Option<Expression>,
        /// Run through `sh -c` rather than as a plain argument vector
        shell: bool,
    },
    SetFact {
        facts: Vec<(String, Expression)>,
    },
    Pause {
        duration: Duration,
    },
    Debug {
        msg: Option<Expression>,
        var: Option<Expression>,
    },
}

impl ModuleCall {
    pub fn module_name(&self) -> &'static str {
        match self {
            ModuleCall::Package { .. } => "package",
            ModuleCall::File { .. } => "file",
            ModuleCall::LineInFile { .. } => "lineinfile",
            ModuleCall::Service { .. } => "service",
            ModuleCall::Firewall(_) => "firewall",
            ModuleCall::Command { shell: false, .. } => "command",
            ModuleCall::Command { shell: true, .. } => "shell",
            ModuleCall::SetFact { .. } => "set_fact",
            ModuleCall::Pause { .. } => "pause",
            ModuleCall::Debug { .. } => "debug",
        }
    }
}

/// Ownership and permission attributes shared by file-like modules
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FileAttrs {
    pub owner: Option<Expression>,
    pub group: Option<Expression>,
    pub mode: Option<Expression>,
}

impl FileAttrs {
    pub fn is_empty(&self) -> bool {
        self.owner.is_none() && self.group.is_none() && self.mode.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FirewallCall {
    Rule {
        chain: Expression,
        protocol: Option<Expression>,
        port: Option<Expression>,
        source: Option<Expression>,
        in_interface: Option<Expression>,
        ctstate: Option<Expression>,
        action: Expression,
        state: RuleState,
    },
    Policy {
        chain: Expression,
        policy: Expression,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackageState {
    #[default]
    Present,
    Latest,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Started,
    Stopped,
    Restarted,
    Reloaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileState {
    #[default]
    File,
    Directory,
    Absent,
    Touch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineState {
    #[default]
    Present,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleState {
    #[default]
    Present,
    Absent,
}

/// Deferred action run once per host after the regular tasks
#[derive(Debug, Clone)]
pub struct Handler {
    pub name: String,
    pub task: Task,
}

/// Expressions embedded in `${...}` substitutions and conditions
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Null,
    /// Host fact, registered output or phase variable: `web.stdout`
    Variable(Vec<String>),
    /// Value captured by an earlier phase: `facts.key` or `groups.db.key`
    FactRef(FactRef),
    /// String with interpolation: "Hello ${name}"
    InterpolatedString(Vec<StringPart>),
    BinaryOp {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    UnaryOp {
        op: UnaryOperator,
        operand: Box<Expression>,
    },
    /// Index access: list[0], dict["key"]
    Index {
        object: Box<Expression>,
        index: Box<Expression>,
    },
    List(Vec<Expression>),
}

impl Expression {
    pub fn string(s: impl Into<String>) -> Self {
        Expression::String(s.into())
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expression::Variable(vec![name.into()])
    }
}

/// Typed reference into the run fact store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactRef {
    /// Restrict the lookup to one group; `None` searches every earlier phase
    pub group: Option<String>,
    pub key: String,
    /// Field path into the captured value
    pub path: Vec<String>,
}

impl std::fmt::Display for FactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.group {
            Some(group) => write!(f, "groups.{}.{}", group, self.key)?,
            None => write!(f, "facts.{}", self.key)?,
        }
        for segment in &self.path {
            write!(f, ".{}", segment)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StringPart {
    Literal(String),
    Expression(Expression),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    In,
    NotIn,
}

impl std::fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Sub => "-",
            BinaryOperator::Eq => "==",
            BinaryOperator::Ne => "!=",
            BinaryOperator::Lt => "<",
            BinaryOperator::Le => "<=",
            BinaryOperator::Gt => ">",
            BinaryOperator::Ge => ">=",
            BinaryOperator::And => "and",
            BinaryOperator::Or => "or",
            BinaryOperator::In => "in",
            BinaryOperator::NotIn => "not in",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Neg,
}

/// Runtime value type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Dict(HashMap<String, Value>),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Dict(d) => !d.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Walk a dotted field path through nested dicts and lists
    pub fn lookup_path(&self, path: &[String]) -> Option<&Value> {
        let mut current = self;
        for segment in path {
            current = match current {
                Value::Dict(map) => map.get(segment)?,
                Value::List(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::String(s) => write!(f, "{}", s),
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Dict(d) => {
                let mut keys: Vec<&String> = d.keys().collect();
                keys.sort();
                write!(f, "{{")?;
                for (i, k) in keys.into_iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, d[k])?;
                }
                write!(f, "}}")
            }
        }
    }
}
