// Per-task, per-host and per-run results

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Ok,
    Changed,
    Failed,
    Skipped,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Ok => "ok",
            TaskStatus::Changed => "changed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one task (or handler) on one host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    /// 1-based position in the phase's task list; handlers continue the count
    pub task_number: usize,
    pub name: String,
    pub module: String,
    pub status: TaskStatus,
    /// Failed, but the failure policy let the host continue
    pub ignored: bool,
    pub handler: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    pub duration_ms: u64,
}

/// How a host's run in one phase ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HostOutcome {
    /// Every task succeeded or had its failure ignored
    Succeeded,
    /// Aborted at `task_number`
    Failed {
        task_number: usize,
        task_name: String,
        error: String,
    },
    /// Stopped by a strict run abort
    Cancelled,
}

impl HostOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HostOutcome::Succeeded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostResult {
    pub host: String,
    #[serde(flatten)]
    pub outcome: HostOutcome,
    pub tasks: Vec<TaskRecord>,
}

impl HostResult {
    pub fn new(host: impl Into<String>) -> Self {
        HostResult {
            host: host.into(),
            outcome: HostOutcome::Succeeded,
            tasks: Vec::new(),
        }
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn ignored(&self) -> usize {
        self.tasks.iter().filter(|t| t.ignored).count()
    }

    pub fn changed(&self) -> bool {
        self.count(TaskStatus::Changed) > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummary {
    pub name: String,
    pub group: String,
    pub hosts: BTreeMap<String, HostResult>,
}

impl PhaseSummary {
    pub fn success(&self) -> bool {
        self.hosts.values().all(|h| h.outcome.is_success())
    }
}

/// Recap line for one host across every phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostTotals {
    pub ok: usize,
    pub changed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub ignored: usize,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub phases: Vec<PhaseSummary>,
    pub success: bool,
    /// A strict run stopped early
    pub aborted: bool,
    pub check_mode: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn new(check_mode: bool) -> Self {
        RunSummary {
            phases: Vec::new(),
            success: true,
            aborted: false,
            check_mode,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn push_phase(&mut self, phase: PhaseSummary) {
        self.success &= phase.success();
        self.phases.push(phase);
    }

    pub fn finish(&mut self) {
        let elapsed = Utc::now() - self.started_at;
        self.duration_ms = elapsed.num_milliseconds().max(0) as u64;
    }

    /// Final outcome of a host: the first phase where it did not succeed
    pub fn host_outcome(&self, host: &str) -> Option<&HostOutcome> {
        let mut seen = None;
        for phase in &self.phases {
            if let Some(result) = phase.hosts.get(host) {
                if !result.outcome.is_success() {
                    return Some(&result.outcome);
                }
                seen = Some(&result.outcome);
            }
        }
        seen
    }

    pub fn host_totals(&self) -> BTreeMap<String, HostTotals> {
        let mut totals: BTreeMap<String, HostTotals> = BTreeMap::new();
        for phase in &self.phases {
            for (name, result) in &phase.hosts {
                let entry = totals.entry(name.clone()).or_default();
                entry.ok += result.count(TaskStatus::Ok);
                entry.changed += result.count(TaskStatus::Changed);
                entry.failed += result.count(TaskStatus::Failed) - result.ignored();
                entry.skipped += result.count(TaskStatus::Skipped);
                entry.ignored += result.ignored();
            }
        }
        for (name, entry) in totals.iter_mut() {
            entry.outcome = match self.host_outcome(name) {
                Some(HostOutcome::Failed { task_number, .. }) => {
                    format!("failed at task {}", task_number)
                }
                Some(HostOutcome::Cancelled) => "cancelled".to_string(),
                _ => "success".to_string(),
            };
        }
        totals
    }

    /// 0 when every host completed under its failure policy, 2 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.success {
            0
        } else {
            2
        }
    }
}
