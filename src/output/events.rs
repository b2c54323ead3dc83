// Run lifecycle events, serialized one per line (NDJSON)

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::summary::{HostTotals, RunSummary, TaskRecord};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent<'a> {
    RunStart {
        playbook: &'a str,
        hosts: &'a [String],
    },
    PhaseStart {
        phase: &'a str,
        group: &'a str,
        hosts: &'a [String],
    },
    TaskResult {
        host: &'a str,
        #[serde(flatten)]
        record: &'a TaskRecord,
    },
    HandlerResult {
        host: &'a str,
        #[serde(flatten)]
        record: &'a TaskRecord,
    },
    RunComplete {
        success: bool,
        aborted: bool,
        check_mode: bool,
        duration_ms: u64,
        hosts: BTreeMap<String, HostTotals>,
    },
}

impl<'a> RunEvent<'a> {
    pub fn task(host: &'a str, record: &'a TaskRecord) -> Self {
        if record.handler {
            RunEvent::HandlerResult { host, record }
        } else {
            RunEvent::TaskResult { host, record }
        }
    }

    pub fn complete(summary: &RunSummary) -> Self {
        RunEvent::RunComplete {
            success: summary.success,
            aborted: summary.aborted,
            check_mode: summary.check_mode,
            duration_ms: summary.duration_ms,
            hosts: summary.host_totals(),
        }
    }

    /// One NDJSON line, stamped with the current time
    pub fn to_line(&self) -> String {
        self.to_line_at(Utc::now())
    }

    pub fn to_line_at(&self, timestamp: DateTime<Utc>) -> String {
        #[derive(Serialize)]
        struct Stamped<'e, 'a> {
            timestamp: String,
            #[serde(flatten)]
            event: &'e RunEvent<'a>,
        }

        serde_json::to_string(&Stamped {
            timestamp: timestamp.to_rfc3339(),
            event: self,
        })
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::summary::TaskStatus;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn record(handler: bool) -> TaskRecord {
        TaskRecord {
            task_number: 4,
            name: "restart nginx".to_string(),
            module: "service".to_string(),
            status: TaskStatus::Changed,
            ignored: false,
            handler,
            attempts: 1,
            message: Some("restarted nginx".to_string()),
            error: None,
            diff: None,
            duration_ms: 12,
        }
    }

    #[test]
    fn test_task_event_line() {
        let record = record(false);
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let line = RunEvent::task("web1", &record).to_line_at(at);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["event"], "task_result");
        assert_eq!(value["timestamp"], "2026-01-02T03:04:05+00:00");
        assert_eq!(value["host"], "web1");
        assert_eq!(value["status"], "changed");
        assert_eq!(value["task_number"], 4);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_handler_event() {
        let record = record(true);
        let line = RunEvent::task("web1", &record).to_line();
        assert!(line.contains("\"event\":\"handler_result\""));
    }

    #[test]
    fn test_run_complete_event() {
        let summary = RunSummary::new(true);
        let line = RunEvent::complete(&summary).to_line();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["event"], "run_complete");
        assert_eq!(value["success"], true);
        assert_eq!(value["check_mode"], true);
    }
}
