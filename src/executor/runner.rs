// Per-host task runner
//
// Runs a phase's tasks on one host strictly in order, applies failure
// policies, then flushes notified handlers once each.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::retry::{retry, RetryOutcome, RetryPolicy, Verdict};
use super::{Connection, ExecutionContext, HandlerRegistry, TaskOutput};
use crate::modules::{ModuleExecutor, ResolvedCall};
use crate::output::errors::ConvergeError;
use crate::output::summary::{HostOutcome, HostResult, TaskRecord, TaskStatus};
use crate::output::OutputWriter;
use crate::parser::ast::{Expression, ModuleCall, Phase, Task};
use crate::plugins::CallbackManager;
use crate::runtime::evaluate_condition;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunnerOptions {
    /// The first hard failure on any host stops the whole run
    pub strict: bool,
}

/// What happened to one task, before it is turned into a record
struct Execution {
    status: TaskStatus,
    output: Option<TaskOutput>,
    error: Option<ConvergeError>,
    attempts: u32,
    duration_ms: u64,
}

impl Execution {
    fn skipped() -> Self {
        Execution {
            status: TaskStatus::Skipped,
            output: None,
            error: None,
            attempts: 0,
            duration_ms: 0,
        }
    }

    fn error(err: ConvergeError, attempts: u32) -> Self {
        Execution {
            status: TaskStatus::Failed,
            output: None,
            error: Some(err),
            attempts,
            duration_ms: 0,
        }
    }

    fn error_text(&self) -> String {
        match (&self.error, &self.output) {
            (Some(e), _) => e.summary(),
            (None, Some(out)) => out
                .message
                .clone()
                .unwrap_or_else(|| format!("exit code {}", out.exit_code)),
            (None, None) => "task failed".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct HostRunner {
    modules: Arc<ModuleExecutor>,
    output: Arc<Mutex<OutputWriter>>,
    callbacks: Arc<CallbackManager>,
    abort: Arc<AtomicBool>,
    options: RunnerOptions,
}

impl HostRunner {
    pub fn new(
        modules: Arc<ModuleExecutor>,
        output: Arc<Mutex<OutputWriter>>,
        callbacks: Arc<CallbackManager>,
        abort: Arc<AtomicBool>,
        options: RunnerOptions,
    ) -> Self {
        HostRunner {
            modules,
            output,
            callbacks,
            abort,
            options,
        }
    }

    fn aborted(&self) -> bool {
        self.options.strict && self.abort.load(Ordering::SeqCst)
    }

    /// Run every task of `phase` on one host, then its notified handlers
    #[instrument(skip_all, fields(host = %ctx.host.name, phase = %phase.name))]
    pub async fn run(
        &self,
        phase: &Phase,
        ctx: &ExecutionContext,
        conn: &dyn Connection,
        handlers: &HandlerRegistry,
    ) -> HostResult {
        let host = ctx.host.name.clone();
        let mut result = HostResult::new(&host);

        for (index, task) in phase.tasks.iter().enumerate() {
            if self.aborted() {
                info!("run aborted, host cancelled");
                result.outcome = HostOutcome::Cancelled;
                handlers.discard_host(&host);
                return result;
            }

            let task_number = index + 1;
            let task_ctx = self.task_context(phase, task, ctx);
            let execution = self.execute_task(task, &task_ctx, conn).await;

            if execution.status == TaskStatus::Changed {
                for name in &task.notify {
                    if handlers.notify(name, &host) {
                        debug!(handler = %name, "handler notified");
                    }
                }
            }

            let aborts = execution.status == TaskStatus::Failed && task.failure.aborts_host();
            let record = self.record(task_number, task, &execution, false);
            self.report(&host, &record, false).await;
            result.tasks.push(record);

            if aborts {
                let error = execution.error_text();
                warn!(task = %task.name, task_number, %error, "task failed, aborting host");
                self.fail_host(&mut result, task_number, &task.name, error);
                handlers.discard_host(&host);
                return result;
            }
        }

        let pending = handlers.pending_for(&host);
        for (offset, name) in pending.iter().enumerate() {
            if self.aborted() {
                result.outcome = HostOutcome::Cancelled;
                handlers.discard_host(&host);
                return result;
            }
            let Some(handler) = phase.handlers.iter().find(|h| &h.name == name) else {
                continue;
            };

            let task_number = phase.tasks.len() + offset + 1;
            info!(handler = %name, "running handler");
            let task_ctx = self.task_context(phase, &handler.task, ctx);
            let execution = self.execute_task(&handler.task, &task_ctx, conn).await;
            handlers.mark_flushed(name, &host);

            let aborts = execution.status == TaskStatus::Failed && handler.task.failure.aborts_host();
            let record = self.record(task_number, &handler.task, &execution, true);
            self.report(&host, &record, true).await;
            result.tasks.push(record);

            if aborts {
                let error = execution.error_text();
                warn!(handler = %name, %error, "handler failed");
                self.fail_host(&mut result, task_number, name, error);
                handlers.discard_host(&host);
                return result;
            }
        }

        result
    }

    fn fail_host(&self, result: &mut HostResult, task_number: usize, task_name: &str, error: String) {
        result.outcome = HostOutcome::Failed {
            task_number,
            task_name: task_name.to_string(),
            error,
        };
        if self.options.strict && !self.abort.swap(true, Ordering::SeqCst) {
            warn!(host = %result.host, "strict run: aborting remaining work");
        }
    }

    fn task_context(&self, phase: &Phase, task: &Task, ctx: &ExecutionContext) -> ExecutionContext {
        let sudo = task.sudo.unwrap_or(phase.sudo || ctx.sudo);
        ctx.clone().with_sudo(sudo, ctx.sudo_user.clone())
    }

    async fn report(&self, host: &str, record: &TaskRecord, handler: bool) {
        self.output.lock().print_task_result(host, record);
        if handler {
            self.callbacks.on_handler_complete(host, record).await;
        } else {
            self.callbacks.on_task_complete(host, record).await;
        }
    }

    fn record(&self, task_number: usize, task: &Task, execution: &Execution, handler: bool) -> TaskRecord {
        let failed = execution.status == TaskStatus::Failed;
        TaskRecord {
            task_number,
            name: task.name.clone(),
            module: task.module.module_name().to_string(),
            status: execution.status,
            ignored: failed && !task.failure.aborts_host(),
            handler,
            attempts: execution.attempts,
            message: execution.output.as_ref().and_then(|o| o.message.clone()),
            error: failed.then(|| execution.error_text()),
            diff: execution.output.as_ref().and_then(|o| o.diff.clone()),
            duration_ms: execution.duration_ms,
        }
    }

    /// Guard, resolve, dispatch with retry, then register and publish
    async fn execute_task(&self, task: &Task, ctx: &ExecutionContext, conn: &dyn Connection) -> Execution {
        let started = Instant::now();
        let mut execution = self.execute_task_inner(task, ctx, conn).await;
        execution.duration_ms = started.elapsed().as_millis() as u64;

        if let Some(ref err) = execution.error {
            debug!(task = %task.name, error = %err.summary(), "task error");
        }
        execution
    }

    async fn execute_task_inner(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        conn: &dyn Connection,
    ) -> Execution {
        if let Some(ref when) = task.when {
            match evaluate_condition(when, ctx) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(task = %task.name, "guard false, skipping");
                    if let Some(ref name) = task.register {
                        ctx.register(name, &TaskOutput::skipped());
                    }
                    return Execution::skipped();
                }
                Err(e) => return Execution::error(condition_error("when", e), 0),
            }
        }

        // Unresolved references fail here, before any attempt is made
        let call = match ResolvedCall::resolve(&task.module, ctx) {
            Ok(call) => call,
            Err(e) => return Execution::error(e.with_task(&task.name), 0),
        };

        let policy = match task.failure.retry_config() {
            Some(cfg) => RetryPolicy::new(cfg.attempts, cfg.delay),
            None => RetryPolicy::once(),
        };
        let until = task.failure.retry_config().and_then(|cfg| cfg.until.as_ref());

        let outcome = retry(
            &policy,
            |attempt| {
                let call = &call;
                async move {
                    if attempt > 1 {
                        info!(task = %task.name, attempt, "retrying task");
                    }
                    self.attempt(task, call, until, ctx, conn).await
                }
            },
            |result| match result {
                Ok((out, satisfied)) if !out.failed && *satisfied => Verdict::Accept,
                Ok(_) => Verdict::Retry,
                Err(e) if e.is_retryable() => Verdict::Retry,
                Err(_) => Verdict::GiveUp,
            },
        )
        .await;

        let attempts = outcome.attempts();
        let exhausted = matches!(outcome, RetryOutcome::Exhausted { .. });
        let (mut output, succeeded) = match outcome.into_last() {
            Ok((out, satisfied)) => {
                let ok = !out.failed && satisfied;
                (out, ok)
            }
            Err(e) => {
                if exhausted && attempts > 1 {
                    warn!(task = %task.name, attempts, "retries exhausted");
                }
                return Execution::error(e.with_task(&task.name), attempts);
            }
        };

        if !succeeded && !output.failed {
            output.failed = true;
            output.message = Some(format!("'until' condition not met after {} attempts", attempts));
        }

        if let Some(ref name) = task.register {
            ctx.register(name, &output);
        }

        if succeeded && task.publish && ctx.check_mode {
            // Check mode output is synthesized; later readers must see it as unresolved
            debug!(task = %task.name, host = %ctx.host.name, "check mode, not publishing");
        } else if succeeded && task.publish {
            if let Err(e) = publish(task, ctx, &output) {
                return Execution {
                    status: TaskStatus::Failed,
                    output: Some(output),
                    error: Some(e),
                    attempts,
                    duration_ms: 0,
                };
            }
        }

        let status = if !succeeded {
            TaskStatus::Failed
        } else if output.changed {
            TaskStatus::Changed
        } else {
            TaskStatus::Ok
        };

        Execution {
            status,
            output: Some(output),
            error: None,
            attempts,
            duration_ms: 0,
        }
    }

    /// One attempt: run the module, apply overrides, check `until`
    async fn attempt(
        &self,
        task: &Task,
        call: &ResolvedCall,
        until: Option<&Expression>,
        ctx: &ExecutionContext,
        conn: &dyn Connection,
    ) -> Result<(TaskOutput, bool), ConvergeError> {
        let mut output = self.modules.execute(call, ctx, conn).await?;

        let scoped = bind_result(task, ctx, &output);
        if let Some(ref expr) = task.changed_when {
            output.changed = evaluate_condition(expr, &scoped).map_err(|e| condition_error("changed_when", e))?;
        }
        if let Some(ref expr) = task.fail_when {
            let failed = evaluate_condition(expr, &scoped).map_err(|e| condition_error("fail_when", e))?;
            output.failed = failed;
            if failed {
                output.message = Some("fail_when condition met".to_string());
            }
        }

        let satisfied = match until {
            Some(expr) => {
                let scoped = bind_result(task, ctx, &output);
                evaluate_condition(expr, &scoped).map_err(|e| condition_error("until", e))?
            }
            None => true,
        };

        Ok((output, satisfied))
    }
}

/// Context where the attempt's output is visible as `result` and under the
/// task's register name
fn bind_result(task: &Task, ctx: &ExecutionContext, output: &TaskOutput) -> ExecutionContext {
    let value = output.to_value();
    let scoped = ctx.with_local("result", value.clone());
    match task.register {
        Some(ref name) => scoped.with_local(name.clone(), value),
        None => scoped,
    }
}

fn condition_error(label: &str, err: ConvergeError) -> ConvergeError {
    match err {
        unresolved @ ConvergeError::UnresolvedReference { .. } => unresolved,
        condition @ ConvergeError::Condition { .. } => condition,
        other => ConvergeError::Condition {
            expression: label.to_string(),
            message: other.summary(),
            suggestion: None,
        },
    }
}

/// Capture the registered output and any set facts into the run store
fn publish(task: &Task, ctx: &ExecutionContext, output: &TaskOutput) -> Result<(), ConvergeError> {
    let store = ctx.run_facts();
    let host = &ctx.host.name;

    if let Some(ref name) = task.register {
        store.capture(&ctx.group, host, name, output.to_value())?;
    }
    if let ModuleCall::SetFact { ref facts } = task.module {
        for (key, _) in facts {
            if let Some(value) = ctx.get_fact(key) {
                store.capture(&ctx.group, host, key, value)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::SimulatedHost;
    use crate::executor::{FactError, FactStore};
    use crate::inventory::Host;
    use crate::parser::ast::{
        FactRef, FailurePolicy, Handler, HostPattern, OnExhausted, PackageState, RetryConfig,
        ServiceState, Value,
    };
    use crate::parser::parse_condition;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::time::Duration;

    fn runner(strict: bool) -> (HostRunner, Arc<AtomicBool>) {
        let abort = Arc::new(AtomicBool::new(false));
        let runner = HostRunner::new(
            Arc::new(ModuleExecutor::new()),
            Arc::new(Mutex::new(OutputWriter::silent())),
            Arc::new(CallbackManager::new()),
            abort.clone(),
            RunnerOptions { strict },
        );
        (runner, abort)
    }

    fn ctx(name: &str) -> ExecutionContext {
        ExecutionContext::new(Arc::new(Host::new(name)), HashMap::new())
    }

    fn phase(tasks: Vec<Task>, handlers: Vec<Handler>) -> Phase {
        Phase {
            name: "web".to_string(),
            hosts: HostPattern::Group("webservers".to_string()),
            vars: HashMap::new(),
            tasks,
            handlers,
            sudo: false,
        }
    }

    fn command(name: &str, cmd: &str) -> Task {
        Task::new(
            name,
            ModuleCall::Command {
                cmd: Expression::string(cmd),
                chdir: None,
                creates: None,
                removes: None,
                shell: false,
            },
        )
    }

    fn install(name: &str, package: &str) -> Task {
        Task::new(
            name,
            ModuleCall::Package {
                names: vec![Expression::string(package)],
                state: PackageState::Present,
            },
        )
    }

    fn restart_handler(name: &str) -> Handler {
        Handler {
            name: name.to_string(),
            task: Task::new(
                name,
                ModuleCall::Service {
                    name: Expression::string("apache2"),
                    state: Some(ServiceState::Restarted),
                    enabled: None,
                },
            ),
        }
    }

    #[tokio::test]
    async fn test_handler_runs_once_for_two_notifications() {
        let host = SimulatedHost::new("web1").with_service("apache2", true, true);
        let mut first = install("Install apache", "apache2");
        first.notify = vec!["restart apache".to_string()];
        let mut second = install("Install php", "libapache2-mod-php");
        second.notify = vec!["restart apache".to_string()];

        let phase = phase(vec![first, second], vec![restart_handler("restart apache")]);
        let handlers = HandlerRegistry::from_handlers(&phase.handlers);
        let (runner, _) = runner(false);

        let result = runner.run(&phase, &ctx("web1"), &host, &handlers).await;

        assert_eq!(result.outcome, HostOutcome::Succeeded);
        assert_eq!(host.count("systemctl restart"), 1);
        let handler = result.tasks.last().unwrap();
        assert!(handler.handler);
        assert_eq!(handler.task_number, 3);
    }

    #[tokio::test]
    async fn test_unchanged_tasks_do_not_notify() {
        let host = SimulatedHost::new("web1")
            .with_package("apache2")
            .with_service("apache2", true, true);
        let mut task = install("Install apache", "apache2");
        task.notify = vec!["restart apache".to_string()];

        let phase = phase(vec![task], vec![restart_handler("restart apache")]);
        let handlers = HandlerRegistry::from_handlers(&phase.handlers);
        let (runner, _) = runner(false);

        let result = runner.run(&phase, &ctx("web1"), &host, &handlers).await;
        assert_eq!(result.tasks.len(), 1);
        assert_eq!(host.count("systemctl restart"), 0);
    }

    #[tokio::test]
    async fn test_fail_fast_aborts_and_skips_handlers() {
        let host = SimulatedHost::new("web1").with_service("apache2", true, true);
        let mut first = install("Install apache", "apache2");
        first.notify = vec!["restart apache".to_string()];
        let phase = phase(
            vec![first, command("Broken", "false"), command("Never", "true")],
            vec![restart_handler("restart apache")],
        );
        let handlers = HandlerRegistry::from_handlers(&phase.handlers);
        let (runner, _) = runner(false);

        let result = runner.run(&phase, &ctx("web1"), &host, &handlers).await;

        match result.outcome {
            HostOutcome::Failed {
                task_number,
                ref task_name,
                ..
            } => {
                assert_eq!(task_number, 2);
                assert_eq!(task_name, "Broken");
            }
            ref other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(result.tasks.len(), 2);
        assert_eq!(host.count("systemctl restart"), 0);
    }

    #[tokio::test]
    async fn test_ignored_failure_continues() {
        let host = SimulatedHost::new("web1");
        let mut broken = command("Broken", "false");
        broken.failure = FailurePolicy::Ignore;
        let phase = phase(vec![broken, command("Next", "true")], vec![]);
        let (runner, _) = runner(false);

        let result = runner
            .run(&phase, &ctx("web1"), &host, &HandlerRegistry::new())
            .await;

        assert_eq!(result.outcome, HostOutcome::Succeeded);
        assert!(result.tasks[0].ignored);
        assert_eq!(result.tasks[1].status, TaskStatus::Changed);
    }

    #[tokio::test]
    async fn test_retry_runs_exactly_max_attempts() {
        let host = SimulatedHost::new("db1").fail_times("apt-get install", 10, "E: Could not get lock");
        let mut task = install("Install mariadb", "mariadb-server");
        task.failure = FailurePolicy::Retry {
            retry: RetryConfig {
                attempts: 3,
                delay: Duration::ZERO,
                until: None,
            },
            then: OnExhausted::FailFast,
        };
        let phase = phase(vec![task], vec![]);
        let (runner, _) = runner(false);

        let result = runner
            .run(&phase, &ctx("db1"), &host, &HandlerRegistry::new())
            .await;

        assert!(matches!(result.outcome, HostOutcome::Failed { task_number: 1, .. }));
        assert_eq!(result.tasks[0].attempts, 3);
        assert_eq!(host.count("apt-get install"), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_at_first_success() {
        let host = SimulatedHost::new("db1").fail_times("apt-get install", 1, "E: Could not get lock");
        let mut task = install("Install mariadb", "mariadb-server");
        task.failure = FailurePolicy::Retry {
            retry: RetryConfig {
                attempts: 5,
                delay: Duration::ZERO,
                until: None,
            },
            then: OnExhausted::FailFast,
        };
        let phase = phase(vec![task], vec![]);
        let (runner, _) = runner(false);

        let result = runner
            .run(&phase, &ctx("db1"), &host, &HandlerRegistry::new())
            .await;

        assert_eq!(result.outcome, HostOutcome::Succeeded);
        assert_eq!(result.tasks[0].attempts, 2);
        assert_eq!(host.count("apt-get install"), 2);
    }

    #[tokio::test]
    async fn test_until_and_exhaustion_under_ignore() {
        let host = SimulatedHost::new("app1").respond("curl -sf http://localhost/health", "starting\n", 0);
        let mut task = command("Wait for app", "curl -sf http://localhost/health");
        task.register = Some("health".to_string());
        task.failure = FailurePolicy::Retry {
            retry: RetryConfig {
                attempts: 2,
                delay: Duration::ZERO,
                until: Some(Expression::BinaryOp {
                    left: Box::new(Expression::Variable(vec![
                        "result".to_string(),
                        "stdout".to_string(),
                    ])),
                    op: crate::parser::ast::BinaryOperator::Eq,
                    right: Box::new(Expression::string("ok\n")),
                }),
            },
            then: OnExhausted::Ignore,
        };
        let phase = phase(vec![task, command("Next", "true")], vec![]);
        let (runner, _) = runner(false);
        let ctx = ctx("app1");

        let result = runner.run(&phase, &ctx, &host, &HandlerRegistry::new()).await;

        assert_eq!(result.outcome, HostOutcome::Succeeded);
        assert_eq!(result.tasks[0].status, TaskStatus::Failed);
        assert!(result.tasks[0].ignored);
        assert_eq!(result.tasks[0].attempts, 2);
        assert_eq!(
            ctx.get_nested_var(&["health".to_string(), "stdout".to_string()]),
            Some(Value::from("starting\n"))
        );
    }

    #[tokio::test]
    async fn test_unresolved_reference_is_not_retried() {
        let host = SimulatedHost::new("web1");
        let mut task = Task::new(
            "Use db password",
            ModuleCall::Command {
                cmd: Expression::FactRef(FactRef {
                    group: None,
                    key: "db_password".to_string(),
                    path: vec!["stdout".to_string()],
                }),
                chdir: None,
                creates: None,
                removes: None,
                shell: false,
            },
        );
        task.failure = FailurePolicy::Retry {
            retry: RetryConfig {
                attempts: 5,
                delay: Duration::ZERO,
                until: None,
            },
            then: OnExhausted::FailFast,
        };
        let phase = phase(vec![task], vec![]);
        let (runner, _) = runner(false);

        let result = runner
            .run(&phase, &ctx("web1"), &host, &HandlerRegistry::new())
            .await;

        assert!(host.commands().is_empty());
        assert_eq!(result.tasks[0].attempts, 0);
        match result.outcome {
            HostOutcome::Failed { ref error, .. } => {
                assert!(error.contains("unresolved reference 'facts.db_password.stdout'"))
            }
            ref other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_when_false_skips_and_fail_when_overrides() {
        let host = SimulatedHost::new("web1");
        let mut skipped = command("Skipped", "false");
        skipped.when = Some(Expression::Boolean(false));
        let mut tolerated = command("Tolerated", "exit 1");
        tolerated.fail_when = Some(Expression::BinaryOp {
            left: Box::new(Expression::Variable(vec!["result".to_string(), "rc".to_string()])),
            op: crate::parser::ast::BinaryOperator::Gt,
            right: Box::new(Expression::Integer(1)),
        });
        tolerated.changed_when = Some(Expression::Boolean(false));
        let phase = phase(vec![skipped, tolerated], vec![]);
        let (runner, _) = runner(false);

        let result = runner
            .run(&phase, &ctx("web1"), &host, &HandlerRegistry::new())
            .await;

        assert_eq!(result.outcome, HostOutcome::Succeeded);
        assert_eq!(result.tasks[0].status, TaskStatus::Skipped);
        assert_eq!(result.tasks[1].status, TaskStatus::Ok);
        assert_eq!(host.commands(), vec!["exit 1"]);
    }

    #[tokio::test]
    async fn test_publish_captures_registered_output() {
        let host = SimulatedHost::new("db1").respond("openssl rand -hex 16", "s3cret\n", 0);
        let mut task = command("Generate password", "openssl rand -hex 16");
        task.register = Some("db_password".to_string());
        task.publish = true;
        let phase = phase(vec![task], vec![]);
        let (runner, _) = runner(false);

        let store = Arc::new(FactStore::new());
        let ctx = ctx("db1").with_run_facts(store.clone()).with_group("dbservers");
        runner.run(&phase, &ctx, &host, &HandlerRegistry::new()).await;
        store.seal_phase("dbservers");

        let value = store
            .resolve(&FactRef {
                group: Some("dbservers".to_string()),
                key: "db_password".to_string(),
                path: vec!["stdout".to_string()],
            })
            .unwrap();
        assert_eq!(value, Value::from("s3cret\n"));
    }

    #[tokio::test]
    async fn test_check_mode_does_not_publish() {
        let host = SimulatedHost::new("db1").respond("openssl rand -hex 16", "s3cret\n", 0);
        let mut task = command("Generate password", "openssl rand -hex 16");
        task.register = Some("db_password".to_string());
        task.publish = true;
        let phase = phase(vec![task], vec![]);
        let (runner, _) = runner(false);

        let store = Arc::new(FactStore::new());
        let ctx = ctx("db1")
            .with_run_facts(store.clone())
            .with_group("dbservers")
            .with_check_mode(true);
        let result = runner.run(&phase, &ctx, &host, &HandlerRegistry::new()).await;
        store.seal_phase("dbservers");

        assert_eq!(result.outcome, HostOutcome::Succeeded);
        assert!(host.commands().is_empty());
        assert!(store.is_empty());
        let err = store
            .resolve(&FactRef {
                group: Some("dbservers".to_string()),
                key: "db_password".to_string(),
                path: vec!["stdout".to_string()],
            })
            .unwrap_err();
        assert!(matches!(err, FactError::Unresolved { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_when_with_keyword_operators() {
        let host = SimulatedHost::new("web1");
        let mut vars = HashMap::new();
        vars.insert("tier".to_string(), Value::from("web"));
        vars.insert("maintenance".to_string(), Value::Bool(false));
        let ctx = ExecutionContext::new(Arc::new(Host::new("web1")), vars);

        let mut runs = command("Runs", "echo web");
        runs.when = Some(parse_condition("tier == 'web' and not maintenance").unwrap());
        let mut skips = command("Skips", "echo db");
        skips.when = Some(parse_condition("tier == 'db' or maintenance").unwrap());
        let phase = phase(vec![runs, skips], vec![]);
        let (runner, _) = runner(false);

        let result = runner.run(&phase, &ctx, &host, &HandlerRegistry::new()).await;

        assert_eq!(result.outcome, HostOutcome::Succeeded);
        assert_eq!(result.tasks[0].status, TaskStatus::Changed);
        assert_eq!(result.tasks[1].status, TaskStatus::Skipped);
        assert_eq!(host.commands(), vec!["echo web"]);
    }

    #[tokio::test]
    async fn test_strict_abort_cancels_before_next_task() {
        let host = SimulatedHost::new("web2");
        let phase = phase(vec![command("First", "true"), command("Second", "true")], vec![]);
        let (runner, abort) = runner(true);
        abort.store(true, Ordering::SeqCst);

        let result = runner
            .run(&phase, &ctx("web2"), &host, &HandlerRegistry::new())
            .await;

        assert_eq!(result.outcome, HostOutcome::Cancelled);
        assert!(result.tasks.is_empty());
    }
}
