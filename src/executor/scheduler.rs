// Multi-host dispatcher
//
// Phases run in declared order behind a barrier. Within a phase every host
// gets its own worker, bounded by a semaphore of `forks` permits.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::runner::{HostRunner, RunnerOptions};
use super::{Connection, Connector, ExecutionContext, FactStore, HandlerRegistry};
use crate::inventory::{Host, Inventory};
use crate::modules::ModuleExecutor;
use crate::output::errors::ConvergeError;
use crate::output::summary::{HostOutcome, HostResult, PhaseSummary, RunSummary};
use crate::output::OutputWriter;
use crate::parser::ast::{Phase, Playbook};
use crate::plugins::CallbackManager;

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum concurrent hosts
    pub forks: usize,
    /// Stop everything at the first hard failure
    pub strict: bool,
    /// Check mode (dry run)
    pub check_mode: bool,
    /// Diff mode (show file differences)
    pub diff_mode: bool,
    /// Enable sudo for all tasks
    pub sudo: bool,
    pub sudo_user: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            forks: 10,
            strict: false,
            check_mode: false,
            diff_mode: false,
            sudo: false,
            sudo_user: None,
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    connector: Arc<dyn Connector>,
    modules: Arc<ModuleExecutor>,
    output: Arc<Mutex<OutputWriter>>,
    callbacks: Arc<CallbackManager>,
    /// Values published by earlier phases
    facts: Arc<FactStore>,
    /// Per-host contexts; host facts persist from one phase to the next
    host_contexts: DashMap<String, ExecutionContext>,
    /// One connection per host for the whole run
    connections: DashMap<String, Arc<dyn Connection>>,
    abort: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        connector: Arc<dyn Connector>,
        output: Arc<Mutex<OutputWriter>>,
    ) -> Self {
        Self::with_callbacks(config, connector, output, Arc::new(CallbackManager::new()))
    }

    pub fn with_callbacks(
        config: SchedulerConfig,
        connector: Arc<dyn Connector>,
        output: Arc<Mutex<OutputWriter>>,
        callbacks: Arc<CallbackManager>,
    ) -> Self {
        Scheduler {
            config,
            connector,
            modules: Arc::new(ModuleExecutor::new()),
            output,
            callbacks,
            facts: Arc::new(FactStore::new()),
            host_contexts: DashMap::new(),
            connections: DashMap::new(),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    fn aborted(&self) -> bool {
        self.config.strict && self.abort.load(Ordering::SeqCst)
    }

    /// Run every phase in order and return the run summary
    pub async fn execute_playbook(&self, playbook: &Playbook, inventory: &Inventory) -> RunSummary {
        let mut summary = RunSummary::new(self.config.check_mode);

        let mut all_hosts: Vec<String> = playbook
            .phases
            .iter()
            .flat_map(|p| inventory.get_hosts(&p.hosts))
            .map(|h| h.name.clone())
            .collect();
        all_hosts.sort();
        all_hosts.dedup();

        info!(
            playbook = %playbook.source_file,
            phases = playbook.phases.len(),
            hosts = all_hosts.len(),
            "starting run"
        );
        self.output
            .lock()
            .print_run_header(&playbook.source_file, &all_hosts);
        self.callbacks
            .on_run_start(&playbook.source_file, &all_hosts)
            .await;

        for phase in &playbook.phases {
            if self.aborted() {
                info!(phase = %phase.name, "run aborted, phase not started");
                break;
            }

            let hosts: Vec<Host> = inventory
                .get_hosts(&phase.hosts)
                .into_iter()
                .map(|h| inventory.resolved_host(h))
                .collect();
            let host_names: Vec<String> = hosts.iter().map(|h| h.name.clone()).collect();
            let group = phase.group_key();

            self.output
                .lock()
                .print_phase_header(&phase.name, &group, &host_names);
            self.callbacks
                .on_phase_start(&phase.name, &group, &host_names)
                .await;

            if hosts.is_empty() {
                warn!(phase = %phase.name, pattern = %phase.hosts, "no hosts matched");
            }

            let results = self.dispatch(phase, &hosts).await;

            // Barrier: everything this phase published becomes readable
            self.facts.seal_phase(&group);

            summary.push_phase(PhaseSummary {
                name: phase.name.clone(),
                group,
                hosts: results,
            });
        }

        summary.aborted = self.aborted();
        summary.finish();

        info!(success = summary.success, aborted = summary.aborted, "run complete");
        self.output.lock().print_recap(&summary);
        self.callbacks.on_run_complete(&summary).await;

        summary
    }

    /// Run one phase on every host, at most `forks` at a time
    pub async fn dispatch(&self, phase: &Phase, hosts: &[Host]) -> BTreeMap<String, HostResult> {
        let group = phase.group_key();
        let handlers = Arc::new(HandlerRegistry::from_handlers(&phase.handlers));
        let semaphore = Arc::new(Semaphore::new(self.config.forks.max(1)));
        let runner = HostRunner::new(
            self.modules.clone(),
            self.output.clone(),
            self.callbacks.clone(),
            self.abort.clone(),
            RunnerOptions {
                strict: self.config.strict,
            },
        );

        let futures: Vec<_> = hosts
            .iter()
            .map(|host| {
                let sem = semaphore.clone();
                let handlers = handlers.clone();
                let runner = runner.clone();
                let group = group.clone();

                async move {
                    let Ok(_permit) = sem.acquire().await else {
                        let mut result = HostResult::new(&host.name);
                        result.outcome = HostOutcome::Cancelled;
                        return result;
                    };

                    if self.aborted() {
                        let mut result = HostResult::new(&host.name);
                        result.outcome = HostOutcome::Cancelled;
                        return result;
                    }

                    let conn = match self.connection(host).await {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(host = %host.name, error = %e.summary(), "connection failed");
                            let mut result = HostResult::new(&host.name);
                            result.outcome = HostOutcome::Failed {
                                task_number: 0,
                                task_name: "connect".to_string(),
                                error: e.summary(),
                            };
                            if self.config.strict {
                                self.abort.store(true, Ordering::SeqCst);
                            }
                            return result;
                        }
                    };

                    let ctx = self.context_for(host, &group, phase);
                    runner.run(phase, &ctx, conn.as_ref(), &handlers).await
                }
            })
            .collect();

        join_all(futures)
            .await
            .into_iter()
            .map(|result| (result.host.clone(), result))
            .collect()
    }

    async fn connection(&self, host: &Host) -> Result<Arc<dyn Connection>, ConvergeError> {
        if let Some(conn) = self.connections.get(&host.name) {
            return Ok(conn.clone());
        }
        debug!(host = %host.name, "opening connection");
        let conn = self.connector.connect(host).await?;
        self.connections.insert(host.name.clone(), conn.clone());
        Ok(conn)
    }

    /// Context for a host in this phase, continuing its earlier facts
    fn context_for(&self, host: &Host, group: &str, phase: &Phase) -> ExecutionContext {
        let ctx = match self.host_contexts.get(&host.name) {
            Some(existing) => existing.for_phase(group, phase.vars.clone()),
            None => ExecutionContext::new(Arc::new(host.clone()), phase.vars.clone())
                .with_run_facts(self.facts.clone())
                .with_group(group)
                .with_check_mode(self.config.check_mode)
                .with_diff_mode(self.config.diff_mode)
                .with_sudo(self.config.sudo, self.config.sudo_user.clone()),
        };
        self.host_contexts.insert(host.name.clone(), ctx.clone());
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::SimulatedHost;
    use crate::output::summary::TaskStatus;
    use crate::parser::parse_playbook;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    struct SimConnector {
        hosts: HashMap<String, Arc<SimulatedHost>>,
    }

    impl SimConnector {
        fn new(hosts: Vec<SimulatedHost>) -> Self {
            SimConnector {
                hosts: hosts
                    .into_iter()
                    .map(|h| (h.host_name().to_string(), Arc::new(h)))
                    .collect(),
            }
        }

        fn host(&self, name: &str) -> Arc<SimulatedHost> {
            self.hosts[name].clone()
        }
    }

    #[async_trait]
    impl Connector for SimConnector {
        async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>, ConvergeError> {
            match self.hosts.get(&host.name) {
                Some(h) => Ok(h.clone() as Arc<dyn Connection>),
                None => Err(ConvergeError::Ssh {
                    host: host.name.clone(),
                    message: "Connection refused".to_string(),
                    suggestion: None,
                }),
            }
        }
    }

    fn scheduler(connector: Arc<SimConnector>, config: SchedulerConfig) -> Scheduler {
        Scheduler::new(config, connector, Arc::new(Mutex::new(OutputWriter::silent())))
    }

    const INVENTORY: &str = r#"
groups:
  dbservers:
    hosts: [db1]
  webservers:
    hosts: [web1, web2, web3]
"#;

    #[tokio::test]
    async fn test_failure_isolation() {
        let connector = Arc::new(SimConnector::new(vec![
            SimulatedHost::new("web1").with_file("/etc/ready", ""),
            SimulatedHost::new("web2"),
            SimulatedHost::new("web3").with_file("/etc/ready", ""),
        ]));
        let playbook = parse_playbook(
            r#"
- name: Web tier
  hosts: webservers
  tasks:
    - name: Say hello
      command: echo hello
    - name: Check ready marker
      command: test -f /etc/ready
    - name: Finish
      command: echo done
"#,
            "site.yml",
        )
        .unwrap();
        let inventory = INVENTORY.parse::<Inventory>().unwrap();

        let summary = scheduler(connector.clone(), SchedulerConfig::default())
            .execute_playbook(&playbook, &inventory)
            .await;

        let hosts = &summary.phases[0].hosts;
        assert_eq!(hosts["web1"].outcome, HostOutcome::Succeeded);
        assert_eq!(hosts["web3"].outcome, HostOutcome::Succeeded);
        match &hosts["web2"].outcome {
            HostOutcome::Failed {
                task_number,
                task_name,
                ..
            } => {
                assert_eq!(*task_number, 2);
                assert_eq!(task_name, "Check ready marker");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(connector.host("web1").count("echo done"), 1);
        assert_eq!(connector.host("web2").count("echo done"), 0);
        assert_eq!(connector.host("web3").count("echo done"), 1);
        assert!(!summary.success);
        assert_eq!(summary.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_strict_run_cancels_remaining_hosts_and_phases() {
        let connector = Arc::new(SimConnector::new(vec![
            SimulatedHost::new("db1"),
            SimulatedHost::new("web1").with_file("/etc/ready", ""),
            SimulatedHost::new("web2"),
            SimulatedHost::new("web3").with_file("/etc/ready", ""),
        ]));
        let playbook = parse_playbook(
            r#"
- name: Web tier
  hosts: webservers
  tasks:
    - name: Check ready marker
      command: test -f /etc/ready
    - name: Finish
      command: echo done
- name: Database tier
  hosts: dbservers
  tasks:
    - name: Never runs
      command: echo db
"#,
            "site.yml",
        )
        .unwrap();
        let inventory = INVENTORY.parse::<Inventory>().unwrap();
        let config = SchedulerConfig {
            forks: 1,
            strict: true,
            ..Default::default()
        };

        let summary = scheduler(connector.clone(), config)
            .execute_playbook(&playbook, &inventory)
            .await;

        let hosts = &summary.phases[0].hosts;
        assert_eq!(hosts["web1"].outcome, HostOutcome::Succeeded);
        assert!(matches!(hosts["web2"].outcome, HostOutcome::Failed { task_number: 1, .. }));
        assert_eq!(hosts["web3"].outcome, HostOutcome::Cancelled);
        assert!(summary.aborted);
        assert_eq!(summary.phases.len(), 1);
        assert!(connector.host("db1").commands().is_empty());
    }

    #[tokio::test]
    async fn test_cross_phase_fact_resolves() {
        let connector = Arc::new(SimConnector::new(vec![
            SimulatedHost::new("db1").respond("openssl rand -hex 16", "9f86d081\n", 0),
            SimulatedHost::new("web1").with_file("/etc/app.env", "DB_HOST=db1\n"),
        ]));
        let playbook = parse_playbook(
            r#"
- name: Database tier
  hosts: dbservers
  tasks:
    - name: Generate password
      command: openssl rand -hex 16
      register: db_password
      publish: true
- name: Web tier
  hosts: web1
  tasks:
    - name: Point the app at the database
      lineinfile:
        path: /etc/app.env
        regexp: '^DB_PASSWORD='
        line: "DB_PASSWORD=${groups.dbservers.db_password.stdout_lines[0]}"
"#,
            "site.yml",
        )
        .unwrap();
        let inventory = INVENTORY.parse::<Inventory>().unwrap();

        let summary = scheduler(connector.clone(), SchedulerConfig::default())
            .execute_playbook(&playbook, &inventory)
            .await;

        assert!(summary.success);
        assert_eq!(
            connector.host("web1").file("/etc/app.env").unwrap().content,
            "DB_HOST=db1\nDB_PASSWORD=9f86d081\n"
        );
    }

    #[tokio::test]
    async fn test_unresolved_cross_phase_reference_fails_without_writing() {
        let connector = Arc::new(SimConnector::new(vec![
            SimulatedHost::new("db1"),
            SimulatedHost::new("web1").with_file("/etc/app.env", "DB_HOST=db1\n"),
        ]));
        let playbook = parse_playbook(
            r#"
- name: Database tier
  hosts: dbservers
  tasks:
    - name: Nothing published
      command: echo hi
      register: greeting
- name: Web tier
  hosts: web1
  tasks:
    - name: Point the app at the database
      lineinfile:
        path: /etc/app.env
        line: "DB_PASSWORD=${facts.db_password.stdout}"
"#,
            "site.yml",
        )
        .unwrap();
        let inventory = INVENTORY.parse::<Inventory>().unwrap();

        let summary = scheduler(connector.clone(), SchedulerConfig::default())
            .execute_playbook(&playbook, &inventory)
            .await;

        match &summary.phases[1].hosts["web1"].outcome {
            HostOutcome::Failed { error, .. } => {
                assert!(error.contains("unresolved reference 'facts.db_password.stdout'"))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            connector.host("web1").file("/etc/app.env").unwrap().content,
            "DB_HOST=db1\n"
        );
    }

    #[tokio::test]
    async fn test_second_run_changes_nothing() {
        let connector = Arc::new(SimConnector::new(vec![SimulatedHost::new("web1")
            .with_service("apache2", false, false)
            .with_file("/etc/ssh/sshd_config", "PermitRootLogin yes\n")]));
        let playbook = parse_playbook(
            r#"
- name: Web tier
  hosts: web1
  tasks:
    - name: Install packages
      package: { name: [apache2, php], state: present }
      notify: restart apache
    - name: Docroot
      file: { path: /var/www/html, state: directory, mode: "0755" }
    - name: Index page
      file: { path: /var/www/html/index.html, content: "<h1>ok</h1>\n", owner: www-data }
    - name: Harden ssh
      lineinfile:
        path: /etc/ssh/sshd_config
        regexp: '^PermitRootLogin'
        line: PermitRootLogin no
    - name: Apache running
      service: { name: apache2, state: started, enabled: true }
    - name: Allow ssh
      firewall: { chain: INPUT, protocol: tcp, port: 22, action: ACCEPT }
    - name: Allow http
      firewall: { chain: INPUT, protocol: tcp, port: 80, action: ACCEPT }
    - name: Default deny
      firewall: { chain: INPUT, policy: DROP }
    - name: Remember role
      set_fact: { role: web }
  handlers:
    - name: restart apache
      service: { name: apache2, state: restarted }
"#,
            "site.yml",
        )
        .unwrap();
        let inventory = "hosts: [web1]".parse::<Inventory>().unwrap();

        let first = scheduler(connector.clone(), SchedulerConfig::default())
            .execute_playbook(&playbook, &inventory)
            .await;
        assert!(first.success);
        assert!(first.phases[0].hosts["web1"].changed());

        let second = scheduler(connector.clone(), SchedulerConfig::default())
            .execute_playbook(&playbook, &inventory)
            .await;
        let statuses: Vec<TaskStatus> = second.phases[0].hosts["web1"]
            .tasks
            .iter()
            .map(|t| t.status)
            .collect();
        assert_eq!(statuses, vec![TaskStatus::Ok; 9]);

        let snapshot = &connector.host("web1").policy_snapshots()[0];
        assert_eq!(
            snapshot.rules,
            vec!["-p tcp --dport 22 -j ACCEPT", "-p tcp --dport 80 -j ACCEPT"]
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_alone() {
        let connector = Arc::new(SimConnector::new(vec![SimulatedHost::new("web1")]));
        let playbook = parse_playbook(
            "- hosts: webservers\n  tasks:\n    - command: echo hi\n",
            "site.yml",
        )
        .unwrap();
        let inventory = "groups:\n  webservers:\n    hosts: [web1, web9]\n".parse::<Inventory>().unwrap();

        let summary = scheduler(connector, SchedulerConfig::default())
            .execute_playbook(&playbook, &inventory)
            .await;

        let hosts = &summary.phases[0].hosts;
        assert_eq!(hosts["web1"].outcome, HostOutcome::Succeeded);
        assert!(matches!(
            hosts["web9"].outcome,
            HostOutcome::Failed { task_number: 0, .. }
        ));
    }
}
