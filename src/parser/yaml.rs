// YAML run declaration parser

use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use super::ast::*;
use super::expressions::{has_interpolation, parse_condition, parse_interpolated_string};
use crate::output::errors::{ConvergeError, ParseError, ParseErrorKind};

const MODULES: &[&str] = &[
    "package",
    "file",
    "lineinfile",
    "service",
    "firewall",
    "command",
    "shell",
    "set_fact",
    "pause",
    "debug",
];

/// Raw YAML phase structure (before AST conversion)
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPhase {
    name: Option<String>,
    hosts: Option<String>,
    vars: Option<HashMap<String, YamlValue>>,
    tasks: Option<Vec<RawTask>>,
    handlers: Option<Vec<RawTask>>,
    /// Enable sudo for all tasks by default
    sudo: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    name: Option<String>,
    #[serde(rename = "when")]
    when_condition: Option<RawCondition>,
    register: Option<String>,
    publish: Option<bool>,
    fail_when: Option<RawCondition>,
    changed_when: Option<RawCondition>,
    notify: Option<NotifyValue>,
    ignore_errors: Option<bool>,
    /// Override sudo for this task
    sudo: Option<bool>,
    retry: Option<RawRetryConfig>,
    /// Flat retry fields (alternative to a `retry` block)
    until: Option<RawCondition>,
    retries: Option<u32>,
    delay: Option<RawDuration>,
    #[serde(flatten)]
    module: BTreeMap<String, YamlValue>,
}

/// Conditions are usually strings, but `when: false` is valid YAML too
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCondition {
    Bool(bool),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRetryConfig {
    attempts: Option<u32>,
    delay: Option<RawDuration>,
    until: Option<RawCondition>,
}

/// Integer seconds or a suffixed string: `500ms`, `3s`, `2m`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NotifyValue {
    Single(String),
    Multiple(Vec<String>),
}

/// Parse a run declaration from a file
pub fn parse_playbook_file(path: &Path) -> Result<Playbook, ConvergeError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConvergeError::Io {
        message: format!("Failed to read playbook file: {}", e),
        path: Some(path.to_path_buf()),
    })?;

    parse_playbook(&content, &path.to_string_lossy())
}

/// Parse a run declaration from a string
pub fn parse_playbook(content: &str, source_file: &str) -> Result<Playbook, ConvergeError> {
    let raw: Vec<RawPhase> = serde_yaml::from_str(content).map_err(|e| {
        let (line, column) = extract_yaml_error_location(&e);
        ConvergeError::Parse(Box::new(ParseError {
            kind: ParseErrorKind::InvalidYaml,
            message: format!("Invalid YAML: {}", e),
            file: Some(source_file.to_string()),
            line,
            column,
            suggestion: Some(
                "A run file is a list of phases, each with 'hosts' and 'tasks'".to_string(),
            ),
        }))
    })?;

    let locator = TaskLocator::new(content);
    let phases = raw
        .into_iter()
        .enumerate()
        .map(|(i, p)| convert_phase(p, i, source_file, &locator))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Playbook {
        source_file: source_file.to_string(),
        phases,
    })
}

pub(crate) fn extract_yaml_error_location(e: &serde_yaml::Error) -> (Option<usize>, Option<usize>) {
    if let Some(loc) = e.location() {
        (Some(loc.line()), Some(loc.column()))
    } else {
        (None, None)
    }
}

/// Best-effort line numbers for named tasks, used in error messages
struct TaskLocator {
    lines: HashMap<String, usize>,
}

impl TaskLocator {
    fn new(content: &str) -> Self {
        let mut lines = HashMap::new();
        for (i, line) in content.lines().enumerate() {
            let trimmed = line.trim_start().trim_start_matches("- ");
            if let Some(name) = trimmed.strip_prefix("name:") {
                let name = name.trim().trim_matches(|c| c == '"' || c == '\'');
                lines.entry(name.to_string()).or_insert(i + 1);
            }
        }
        TaskLocator { lines }
    }

    fn locate(&self, file: &str, name: &str) -> Option<SourceLocation> {
        self.lines.get(name).map(|&line| SourceLocation {
            file: file.to_string(),
            line,
            column: 1,
        })
    }
}

/// Context threaded through the conversion of one task, for error reporting
struct Origin<'a> {
    file: &'a str,
    task: String,
    location: Option<SourceLocation>,
}

impl Origin<'_> {
    fn error(&self, kind: ParseErrorKind, message: impl Into<String>) -> ParseError {
        ParseError {
            kind,
            message: format!("{} (task '{}')", message.into(), self.task),
            file: Some(self.file.to_string()),
            line: self.location.as_ref().map(|l| l.line),
            column: None,
            suggestion: None,
        }
    }

    fn fail(&self, kind: ParseErrorKind, message: impl Into<String>) -> ConvergeError {
        ConvergeError::Parse(Box::new(self.error(kind, message)))
    }

    fn fail_with(
        &self,
        kind: ParseErrorKind,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> ConvergeError {
        ConvergeError::Parse(Box::new(self.error(kind, message).with_suggestion(suggestion)))
    }

    /// Attach file and line to errors raised by the expression parser
    fn locate(&self, err: ConvergeError) -> ConvergeError {
        match err {
            ConvergeError::Parse(mut e) => {
                if e.file.is_none() {
                    e.file = Some(self.file.to_string());
                    e.line = self.location.as_ref().map(|l| l.line);
                    e.message = format!("{} (task '{}')", e.message, self.task);
                }
                ConvergeError::Parse(e)
            }
            other => other,
        }
    }
}

fn convert_phase(
    raw: RawPhase,
    index: usize,
    source_file: &str,
    locator: &TaskLocator,
) -> Result<Phase, ConvergeError> {
    let hosts = raw
        .hosts
        .as_deref()
        .map(HostPattern::parse)
        .unwrap_or_default();
    let name = raw
        .name
        .unwrap_or_else(|| format!("Phase {} ({})", index + 1, hosts));

    let vars = raw
        .vars
        .map(convert_vars)
        .transpose()?
        .unwrap_or_default();

    let tasks = raw
        .tasks
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, t)| convert_task(t, i, source_file, locator))
        .collect::<Result<Vec<_>, _>>()?;

    let handlers = raw
        .handlers
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, h)| convert_handler(h, i, source_file, locator))
        .collect::<Result<Vec<_>, _>>()?;

    validate_notifications(&name, &tasks, &handlers, source_file)?;

    Ok(Phase {
        name,
        hosts,
        vars,
        tasks,
        handlers,
        sudo: raw.sudo.unwrap_or(false),
    })
}

/// Every `notify` must name a handler of the same phase; handler names are unique
fn validate_notifications(
    phase: &str,
    tasks: &[Task],
    handlers: &[Handler],
    source_file: &str,
) -> Result<(), ConvergeError> {
    let mut known = HashSet::new();
    for handler in handlers {
        if !known.insert(handler.name.as_str()) {
            return Err(ConvergeError::Parse(Box::new(
                ParseError::new(
                    ParseErrorKind::InvalidValue,
                    format!("Duplicate handler '{}' in phase '{}'", handler.name, phase),
                )
                .in_file(source_file),
            )));
        }
    }

    for task in tasks {
        for target in &task.notify {
            if known.contains(target.as_str()) {
                continue;
            }
            let mut err = ParseError::new(
                ParseErrorKind::InvalidValue,
                format!(
                    "Task '{}' notifies unknown handler '{}' in phase '{}'",
                    task.name, target, phase
                ),
            )
            .in_file(source_file);
            err.line = task.location.as_ref().map(|l| l.line);
            if let Some(close) = closest(target, known.iter().copied()) {
                err = err.with_suggestion(format!("Did you mean '{}'?", close));
            } else {
                err = err.with_suggestion("Declare the handler under 'handlers:' in the same phase");
            }
            return Err(ConvergeError::Parse(Box::new(err)));
        }
    }
    Ok(())
}

fn convert_vars(raw: HashMap<String, YamlValue>) -> Result<HashMap<String, Value>, ConvergeError> {
    raw.into_iter()
        .map(|(k, v)| Ok((k, yaml_to_value(v)?)))
        .collect()
}

fn yaml_to_value(yaml: YamlValue) -> Result<Value, ConvergeError> {
    match yaml {
        YamlValue::Null => Ok(Value::Null),
        YamlValue::Bool(b) => Ok(Value::Bool(b)),
        YamlValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Ok(Value::Int(0))
            }
        }
        YamlValue::String(s) => Ok(Value::String(s)),
        YamlValue::Sequence(seq) => {
            let items: Result<Vec<_>, _> = seq.into_iter().map(yaml_to_value).collect();
            Ok(Value::List(items?))
        }
        YamlValue::Mapping(map) => {
            let items: Result<HashMap<_, _>, ConvergeError> = map
                .into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        YamlValue::String(s) => s,
                        other => yaml_scalar(&other).unwrap_or_default(),
                    };
                    Ok((key, yaml_to_value(v)?))
                })
                .collect();
            Ok(Value::Dict(items?))
        }
        YamlValue::Tagged(tagged) => yaml_to_value(tagged.value),
    }
}

fn yaml_scalar(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn convert_handler(
    raw: RawTask,
    index: usize,
    source_file: &str,
    locator: &TaskLocator,
) -> Result<Handler, ConvergeError> {
    let name = raw.name.clone().ok_or_else(|| {
        ConvergeError::Parse(Box::new(ParseError {
            kind: ParseErrorKind::MissingField,
            message: format!("Handler {} is missing a 'name' field", index + 1),
            file: Some(source_file.to_string()),
            line: None,
            column: None,
            suggestion: Some("Add a 'name:' field; tasks notify handlers by name".to_string()),
        }))
    })?;

    let task = convert_task(raw, index, source_file, locator)?;
    Ok(Handler { name, task })
}

fn convert_task(
    raw: RawTask,
    index: usize,
    source_file: &str,
    locator: &TaskLocator,
) -> Result<Task, ConvergeError> {
    let module_name = find_module(&raw.module);
    let name = raw.name.clone().unwrap_or_else(|| match module_name {
        Ok(m) => format!("{} #{}", m, index + 1),
        Err(_) => format!("Task {}", index + 1),
    });
    let origin = Origin {
        file: source_file,
        location: raw.name.as_deref().and_then(|n| locator.locate(source_file, n)),
        task: name.clone(),
    };

    let module_name = module_name.map_err(|unknown| unknown_module(&origin, unknown))?;
    let module = parse_module_call(module_name, &raw.module, &origin)?;

    let condition = |raw: Option<RawCondition>| -> Result<Option<Expression>, ConvergeError> {
        match raw {
            None => Ok(None),
            Some(RawCondition::Bool(b)) => Ok(Some(Expression::Boolean(b))),
            Some(RawCondition::Text(s)) => parse_condition(&s).map(Some).map_err(|e| origin.locate(e)),
        }
    };

    let when = condition(raw.when_condition)?;
    let fail_when = condition(raw.fail_when)?;
    let changed_when = condition(raw.changed_when)?;

    let notify = match raw.notify {
        Some(NotifyValue::Single(s)) => vec![s],
        Some(NotifyValue::Multiple(v)) => v,
        None => vec![],
    };

    // Full retry block or flat task-level fields (retries, delay, until)
    let retry = if let Some(block) = raw.retry {
        if raw.retries.is_some() || raw.until.is_some() || raw.delay.is_some() {
            return Err(origin.fail_with(
                ParseErrorKind::InvalidValue,
                "Both a 'retry' block and flat retries/delay/until fields",
                "Use one form",
            ));
        }
        Some(RetryConfig {
            attempts: block.attempts.unwrap_or(RetryConfig::default().attempts),
            delay: convert_delay(block.delay, &origin)?,
            until: condition(block.until)?,
        })
    } else if raw.until.is_some() || raw.retries.is_some() || raw.delay.is_some() {
        Some(RetryConfig {
            attempts: raw.retries.unwrap_or(RetryConfig::default().attempts),
            delay: convert_delay(raw.delay, &origin)?,
            until: condition(raw.until)?,
        })
    } else {
        None
    };

    if let Some(ref r) = retry {
        if r.attempts == 0 {
            return Err(origin.fail(ParseErrorKind::InvalidValue, "Retry attempts must be at least 1"));
        }
    }

    let ignore = raw.ignore_errors.unwrap_or(false);
    let failure = match retry {
        Some(retry) => FailurePolicy::Retry {
            retry,
            then: if ignore {
                OnExhausted::Ignore
            } else {
                OnExhausted::FailFast
            },
        },
        None if ignore => FailurePolicy::Ignore,
        None => FailurePolicy::FailFast,
    };

    let publish = raw.publish.unwrap_or(false);
    if publish && raw.register.is_none() && !matches!(module, ModuleCall::SetFact { .. }) {
        return Err(origin.fail_with(
            ParseErrorKind::MissingField,
            "'publish' needs something to publish",
            "Add 'register: NAME' or use set_fact",
        ));
    }

    Ok(Task {
        name,
        module,
        when,
        register: raw.register,
        publish,
        fail_when,
        changed_when,
        notify,
        failure,
        sudo: raw.sudo,
        location: origin.location,
    })
}

fn convert_delay(raw: Option<RawDuration>, origin: &Origin) -> Result<Duration, ConvergeError> {
    match raw {
        None => Ok(RetryConfig::default().delay),
        Some(d) => duration(d, origin),
    }
}

fn duration(raw: RawDuration, origin: &Origin) -> Result<Duration, ConvergeError> {
    match raw {
        RawDuration::Seconds(s) => Ok(Duration::from_secs(s)),
        RawDuration::Text(s) => parse_duration(&s).ok_or_else(|| {
            origin.fail_with(
                ParseErrorKind::InvalidValue,
                format!("Invalid duration '{}'", s),
                "Use seconds (5) or a suffix: 500ms, 3s, 2m",
            )
        }),
    }
}

/// `500ms`, `3s`, `2m`, or bare seconds
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, "s"),
    };
    let n: u64 = digits.parse().ok()?;
    match unit.trim() {
        "ms" => Some(Duration::from_millis(n)),
        "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n.checked_mul(60)?)),
        _ => None,
    }
}

/// The single module key of a task. `Err` carries the offending key.
fn find_module(keys: &BTreeMap<String, YamlValue>) -> Result<&'static str, Option<String>> {
    let found: Vec<&'static str> = MODULES
        .iter()
        .copied()
        .filter(|m| keys.contains_key(*m))
        .collect();

    match found.as_slice() {
        [single] => Ok(single),
        [] => Err(keys.keys().next().cloned()),
        _ => Err(Some(found.join(", "))),
    }
}

fn unknown_module(origin: &Origin, key: Option<String>) -> ConvergeError {
    match key {
        None => origin.fail_with(
            ParseErrorKind::UnknownModule,
            "No module specified in task",
            format!("Add one of: {}", MODULES.join(", ")),
        ),
        Some(key) if key.contains(", ") => origin.fail_with(
            ParseErrorKind::UnknownModule,
            format!("Task declares more than one module: {}", key),
            "Split it into one task per module",
        ),
        Some(key) => {
            let suggestion = match closest(&key, MODULES.iter().copied()) {
                Some(m) => format!("Did you mean '{}'?", m),
                None => format!("Available modules: {}", MODULES.join(", ")),
            };
            origin.fail_with(
                ParseErrorKind::UnknownModule,
                format!("Unknown module '{}'", key),
                suggestion,
            )
        }
    }
}

/// Closest candidate within a small edit distance
fn closest<'a>(name: &str, candidates: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    candidates
        .map(|c| (strsim::levenshtein(&name.to_lowercase(), c), c))
        .filter(|(d, c)| *d <= 2.max(c.len() / 3))
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c)
}

/// Module parameters, from the module's mapping plus flat sibling keys
struct Params<'a> {
    module: &'static str,
    /// The module's value when it is a scalar or list (`command: echo hi`)
    free: Option<&'a YamlValue>,
    keys: BTreeMap<String, &'a YamlValue>,
    origin: &'a Origin<'a>,
}

impl<'a> Params<'a> {
    fn new(
        module: &'static str,
        raw: &'a BTreeMap<String, YamlValue>,
        origin: &'a Origin<'a>,
        allowed: &[&str],
    ) -> Result<Self, ConvergeError> {
        let mut keys = BTreeMap::new();
        let mut free = None;

        match raw.get(module) {
            Some(YamlValue::Mapping(map)) => {
                for (k, v) in map {
                    let key = yaml_scalar(k).unwrap_or_default();
                    keys.insert(key, v);
                }
            }
            Some(YamlValue::Null) | None => {}
            Some(other) => free = Some(other),
        }
        for (k, v) in raw {
            if k != module {
                keys.insert(k.clone(), v);
            }
        }

        for key in keys.keys() {
            if !allowed.contains(&key.as_str()) {
                let suggestion = match closest(key, allowed.iter().copied()) {
                    Some(c) => format!("Did you mean '{}'?", c),
                    None => format!("Parameters of {}: {}", module, allowed.join(", ")),
                };
                return Err(origin.fail_with(
                    ParseErrorKind::InvalidValue,
                    format!("Unknown parameter '{}' for module {}", key, module),
                    suggestion,
                ));
            }
        }

        Ok(Params {
            module,
            free,
            keys,
            origin,
        })
    }

    fn get(&self, key: &str) -> Option<&'a YamlValue> {
        self.keys.get(key).copied()
    }

    fn expr(&self, key: &str) -> Result<Option<Expression>, ConvergeError> {
        self.get(key).map(|v| self.to_expression(v)).transpose()
    }

    /// A required parameter that may also be given as the module's free value
    fn primary(&self, key: &str) -> Result<Expression, ConvergeError> {
        match self.get(key).or(self.free) {
            Some(v) => self.to_expression(v),
            None => Err(self.origin.fail(
                ParseErrorKind::MissingField,
                format!("{} requires '{}'", self.module, key),
            )),
        }
    }

    fn required(&self, key: &str) -> Result<Expression, ConvergeError> {
        self.expr(key)?.ok_or_else(|| {
            self.origin.fail(
                ParseErrorKind::MissingField,
                format!("{} requires '{}'", self.module, key),
            )
        })
    }

    fn bool(&self, key: &str) -> Result<Option<bool>, ConvergeError> {
        match self.get(key) {
            None => Ok(None),
            Some(YamlValue::Bool(b)) => Ok(Some(*b)),
            Some(YamlValue::String(s)) if matches!(s.as_str(), "yes" | "true") => Ok(Some(true)),
            Some(YamlValue::String(s)) if matches!(s.as_str(), "no" | "false") => Ok(Some(false)),
            Some(_) => Err(self.origin.fail(
                ParseErrorKind::InvalidValue,
                format!("'{}' must be true or false", key),
            )),
        }
    }

    /// Parse a `state` keyword through `choose`, defaulting when absent
    fn state<T>(
        &self,
        default: T,
        choices: &str,
        choose: impl Fn(&str) -> Option<T>,
    ) -> Result<T, ConvergeError> {
        match self.get("state") {
            None => Ok(default),
            Some(v) => yaml_scalar(v).as_deref().and_then(&choose).ok_or_else(|| {
                self.origin.fail_with(
                    ParseErrorKind::InvalidValue,
                    format!("Invalid state '{}' for {}", yaml_scalar(v).unwrap_or_default(), self.module),
                    format!("Use one of: {}", choices),
                )
            }),
        }
    }

    fn attrs(&self) -> Result<FileAttrs, ConvergeError> {
        Ok(FileAttrs {
            owner: self.expr("owner")?,
            group: self.expr("group")?,
            mode: self.expr("mode")?,
        })
    }

    fn to_expression(&self, value: &YamlValue) -> Result<Expression, ConvergeError> {
        yaml_to_expression(value).map_err(|e| self.origin.locate(e))
    }
}

fn parse_module_call(
    module: &'static str,
    raw: &BTreeMap<String, YamlValue>,
    origin: &Origin,
) -> Result<ModuleCall, ConvergeError> {
    match module {
        "package" => parse_package_module(raw, origin),
        "file" => parse_file_module(raw, origin),
        "lineinfile" => parse_lineinfile_module(raw, origin),
        "service" => parse_service_module(raw, origin),
        "firewall" => parse_firewall_module(raw, origin),
        "command" | "shell" => parse_command_module(module, raw, origin),
        "set_fact" => parse_set_fact_module(raw, origin),
        "pause" => parse_pause_module(raw, origin),
        _ => parse_debug_module(raw, origin),
    }
}

fn parse_package_module(
    raw: &BTreeMap<String, YamlValue>,
    origin: &Origin,
) -> Result<ModuleCall, ConvergeError> {
    let p = Params::new("package", raw, origin, &["name", "names", "state"])?;

    let value = p
        .get("name")
        .or(p.get("names"))
        .or(p.free)
        .ok_or_else(|| origin.fail(ParseErrorKind::MissingField, "package requires 'name'"))?;
    let names = match value {
        YamlValue::Sequence(items) => items
            .iter()
            .map(|v| p.to_expression(v))
            .collect::<Result<Vec<_>, _>>()?,
        other => vec![p.to_expression(other)?],
    };
    if names.is_empty() {
        return Err(origin.fail(ParseErrorKind::InvalidValue, "package 'name' list is empty"));
    }

    let state = p.state(PackageState::Present, "present, latest, absent", |s| match s {
        "present" | "installed" => Some(PackageState::Present),
        "latest" => Some(PackageState::Latest),
        "absent" | "removed" => Some(PackageState::Absent),
        _ => None,
    })?;

    Ok(ModuleCall::Package { names, state })
}

fn parse_file_module(
    raw: &BTreeMap<String, YamlValue>,
    origin: &Origin,
) -> Result<ModuleCall, ConvergeError> {
    let p = Params::new(
        "file",
        raw,
        origin,
        &["path", "dest", "state", "content", "owner", "group", "mode"],
    )?;

    let path = match p.get("dest") {
        Some(dest) => p.to_expression(dest)?,
        None => p.primary("path")?,
    };
    let state = p.state(FileState::File, "file, directory, absent, touch", |s| match s {
        "file" => Some(FileState::File),
        "directory" => Some(FileState::Directory),
        "absent" => Some(FileState::Absent),
        "touch" => Some(FileState::Touch),
        _ => None,
    })?;
    let content = p.expr("content")?;
    if content.is_some() && state != FileState::File {
        return Err(origin.fail(
            ParseErrorKind::InvalidValue,
            "'content' is only valid with state: file",
        ));
    }

    Ok(ModuleCall::File {
        path,
        state,
        content,
        attrs: p.attrs()?,
    })
}

fn parse_lineinfile_module(
    raw: &BTreeMap<String, YamlValue>,
    origin: &Origin,
) -> Result<ModuleCall, ConvergeError> {
    let p = Params::new(
        "lineinfile",
        raw,
        origin,
        &[
            "path", "dest", "line", "regexp", "insertafter", "insert_after", "state", "create",
            "owner", "group", "mode",
        ],
    )?;

    let path = match p.get("dest") {
        Some(dest) => p.to_expression(dest)?,
        None => p.primary("path")?,
    };
    let state = p.state(LineState::Present, "present, absent", |s| match s {
        "present" => Some(LineState::Present),
        "absent" => Some(LineState::Absent),
        _ => None,
    })?;
    let line = p.expr("line")?;
    let regexp = p.expr("regexp")?;
    let insert_after = match p.expr("insertafter")? {
        Some(e) => Some(e),
        None => p.expr("insert_after")?,
    };

    match state {
        LineState::Present if line.is_none() => {
            return Err(origin.fail(ParseErrorKind::MissingField, "lineinfile requires 'line'"));
        }
        LineState::Absent if line.is_none() && regexp.is_none() => {
            return Err(origin.fail(
                ParseErrorKind::MissingField,
                "lineinfile with state: absent requires 'line' or 'regexp'",
            ));
        }
        _ => {}
    }

    // Literal patterns are checked now rather than on the first host
    for pattern in [&regexp, &insert_after].into_iter().flatten() {
        if let Expression::String(s) = pattern {
            if s != "EOF" {
                regex::Regex::new(s).map_err(|e| {
                    origin.fail(ParseErrorKind::InvalidValue, format!("Invalid regexp '{}': {}", s, e))
                })?;
            }
        }
    }

    Ok(ModuleCall::LineInFile {
        path,
        line,
        regexp,
        insert_after,
        state,
        create: p.bool("create")?.unwrap_or(false),
        attrs: p.attrs()?,
    })
}

fn parse_service_module(
    raw: &BTreeMap<String, YamlValue>,
    origin: &Origin,
) -> Result<ModuleCall, ConvergeError> {
    let p = Params::new("service", raw, origin, &["name", "state", "enabled"])?;

    let name = p.primary("name")?;
    let state = match p.get("state") {
        None => None,
        Some(_) => Some(p.state(
            ServiceState::Started,
            "started, stopped, restarted, reloaded",
            |s| match s {
                "started" | "running" => Some(ServiceState::Started),
                "stopped" => Some(ServiceState::Stopped),
                "restarted" => Some(ServiceState::Restarted),
                "reloaded" => Some(ServiceState::Reloaded),
                _ => None,
            },
        )?),
    };
    let enabled = p.bool("enabled")?;

    if state.is_none() && enabled.is_none() {
        return Err(origin.fail_with(
            ParseErrorKind::MissingField,
            "service needs 'state' or 'enabled'",
            "For example: state: started, enabled: true",
        ));
    }

    Ok(ModuleCall::Service {
        name,
        state,
        enabled,
    })
}

fn parse_firewall_module(
    raw: &BTreeMap<String, YamlValue>,
    origin: &Origin,
) -> Result<ModuleCall, ConvergeError> {
    let p = Params::new(
        "firewall",
        raw,
        origin,
        &[
            "chain", "protocol", "port", "source", "in_interface", "ctstate", "action", "jump",
            "state", "policy",
        ],
    )?;

    let chain = p.expr("chain")?.unwrap_or_else(|| Expression::string("INPUT"));

    if let Some(policy) = p.expr("policy")? {
        if p.get("action").or(p.get("jump")).is_some() {
            return Err(origin.fail_with(
                ParseErrorKind::InvalidValue,
                "firewall declares both a rule and a policy",
                "Set the chain policy in its own task, after the allow rules",
            ));
        }
        return Ok(ModuleCall::Firewall(FirewallCall::Policy { chain, policy }));
    }

    let action = match p.expr("action")? {
        Some(a) => a,
        None => p.required("jump")?,
    };
    let state = p.state(RuleState::Present, "present, absent", |s| match s {
        "present" => Some(RuleState::Present),
        "absent" => Some(RuleState::Absent),
        _ => None,
    })?;

    Ok(ModuleCall::Firewall(FirewallCall::Rule {
        chain,
        protocol: p.expr("protocol")?,
        port: p.expr("port")?,
        source: p.expr("source")?,
        in_interface: p.expr("in_interface")?,
        ctstate: p.expr("ctstate")?,
        action,
        state,
    }))
}

fn parse_command_module(
    module: &'static str,
    raw: &BTreeMap<String, YamlValue>,
    origin: &Origin,
) -> Result<ModuleCall, ConvergeError> {
    let p = Params::new(module, raw, origin, &["cmd", "chdir", "creates", "removes"])?;

    Ok(ModuleCall::Command {
        cmd: p.primary("cmd")?,
        chdir: p.expr("chdir")?,
        creates: p.expr("creates")?,
        removes: p.expr("removes")?,
        shell: module == "shell",
    })
}

fn parse_set_fact_module(
    raw: &BTreeMap<String, YamlValue>,
    origin: &Origin,
) -> Result<ModuleCall, ConvergeError> {
    let Some(YamlValue::Mapping(map)) = raw.get("set_fact") else {
        return Err(origin.fail_with(
            ParseErrorKind::InvalidValue,
            "set_fact expects a mapping of names to values",
            "For example: set_fact: { role: web }",
        ));
    };

    let mut facts = Vec::with_capacity(map.len());
    for (k, v) in map {
        let key = yaml_scalar(k).unwrap_or_default();
        if key.is_empty() {
            return Err(origin.fail(ParseErrorKind::InvalidValue, "set_fact key must be a string"));
        }
        if matches!(v, YamlValue::Mapping(_)) {
            return Err(origin.fail(
                ParseErrorKind::InvalidValue,
                format!("set_fact '{}': nested mappings are not supported", key),
            ));
        }
        facts.push((key, yaml_to_expression(v).map_err(|e| origin.locate(e))?));
    }

    Ok(ModuleCall::SetFact { facts })
}

fn parse_pause_module(
    raw: &BTreeMap<String, YamlValue>,
    origin: &Origin,
) -> Result<ModuleCall, ConvergeError> {
    let p = Params::new("pause", raw, origin, &["seconds", "milliseconds", "minutes"])?;

    let number = |key: &str| -> Result<Option<u64>, ConvergeError> {
        match p.get(key) {
            None => Ok(None),
            Some(v) => v.as_u64().map(Some).ok_or_else(|| {
                origin.fail(
                    ParseErrorKind::InvalidValue,
                    format!("pause '{}' must be a non-negative integer", key),
                )
            }),
        }
    };

    let duration = if let Some(ms) = number("milliseconds")? {
        Duration::from_millis(ms)
    } else if let Some(s) = number("seconds")? {
        Duration::from_secs(s)
    } else if let Some(m) = number("minutes")? {
        Duration::from_secs(m.saturating_mul(60))
    } else {
        match p.free {
            Some(YamlValue::Number(n)) => n
                .as_u64()
                .map(Duration::from_secs)
                .ok_or_else(|| origin.fail(ParseErrorKind::InvalidValue, "Invalid pause duration"))?,
            Some(YamlValue::String(s)) => duration(RawDuration::Text(s.clone()), origin)?,
            _ => {
                return Err(origin.fail_with(
                    ParseErrorKind::MissingField,
                    "pause requires a duration",
                    "Use pause: { seconds: 5 } or pause: 500ms",
                ))
            }
        }
    };

    Ok(ModuleCall::Pause { duration })
}

fn parse_debug_module(
    raw: &BTreeMap<String, YamlValue>,
    origin: &Origin,
) -> Result<ModuleCall, ConvergeError> {
    let p = Params::new("debug", raw, origin, &["msg", "var"])?;

    let msg = match p.expr("msg")? {
        Some(m) => Some(m),
        None => p.free.map(|v| p.to_expression(v)).transpose()?,
    };
    let var = match p.get("var") {
        None => None,
        Some(v) => {
            let text = yaml_scalar(v).unwrap_or_default();
            Some(parse_condition(&text).map_err(|e| origin.locate(e))?)
        }
    };

    Ok(ModuleCall::Debug { msg, var })
}

pub(crate) fn yaml_to_expression(value: &YamlValue) -> Result<Expression, ConvergeError> {
    match value {
        YamlValue::String(s) => {
            if has_interpolation(s) {
                parse_interpolated_string(s)
            } else {
                Ok(Expression::String(s.replace("\\$", "$")))
            }
        }
        YamlValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Expression::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Expression::Float(f))
            } else {
                Ok(Expression::Integer(0))
            }
        }
        YamlValue::Bool(b) => Ok(Expression::Boolean(*b)),
        YamlValue::Null => Ok(Expression::Null),
        YamlValue::Sequence(seq) => {
            let items: Result<Vec<_>, _> = seq.iter().map(yaml_to_expression).collect();
            Ok(Expression::List(items?))
        }
        YamlValue::Mapping(_) => Err(ConvergeError::parse(
            ParseErrorKind::InvalidValue,
            "Expected a scalar or list, found a mapping",
        )),
        YamlValue::Tagged(tagged) => yaml_to_expression(&tagged.value),
    }
}
