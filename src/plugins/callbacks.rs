// Callback plugin system for converge

use std::fs::{File, OpenOptions};
use std::io::Write as IoWrite;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};

use crate::output::{RunEvent, RunSummary, TaskRecord};

/// Hooks into the run lifecycle. Every hook defaults to a no-op.
#[async_trait]
pub trait CallbackPlugin: Send + Sync {
    /// Get the name of this plugin
    fn name(&self) -> &str;

    async fn on_run_start(&self, _playbook: &str, _hosts: &[String]) {}
    async fn on_phase_start(&self, _phase: &str, _group: &str, _hosts: &[String]) {}
    async fn on_task_complete(&self, _host: &str, _record: &TaskRecord) {}
    async fn on_handler_complete(&self, _host: &str, _record: &TaskRecord) {}
    async fn on_run_complete(&self, _summary: &RunSummary) {}
}

/// Manager for callback plugins
pub struct CallbackManager {
    plugins: Vec<Box<dyn CallbackPlugin>>,
}

impl CallbackManager {
    pub fn new() -> Self {
        CallbackManager {
            plugins: Vec::new(),
        }
    }

    pub fn add(&mut self, plugin: Box<dyn CallbackPlugin>) {
        debug!(plugin = plugin.name(), "registered callback");
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub async fn on_run_start(&self, playbook: &str, hosts: &[String]) {
        for plugin in &self.plugins {
            plugin.on_run_start(playbook, hosts).await;
        }
    }

    pub async fn on_phase_start(&self, phase: &str, group: &str, hosts: &[String]) {
        for plugin in &self.plugins {
            plugin.on_phase_start(phase, group, hosts).await;
        }
    }

    pub async fn on_task_complete(&self, host: &str, record: &TaskRecord) {
        for plugin in &self.plugins {
            plugin.on_task_complete(host, record).await;
        }
    }

    pub async fn on_handler_complete(&self, host: &str, record: &TaskRecord) {
        for plugin in &self.plugins {
            plugin.on_handler_complete(host, record).await;
        }
    }

    pub async fn on_run_complete(&self, summary: &RunSummary) {
        for plugin in &self.plugins {
            plugin.on_run_complete(summary).await;
        }
    }
}

impl Default for CallbackManager {
    fn default() -> Self {
        Self::new()
    }
}

// ========== Built-in Plugins ==========

/// JSON log callback - appends NDJSON events to a file
pub struct JsonLogCallback {
    file: Mutex<File>,
}

impl JsonLogCallback {
    pub fn new(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.into())?;

        Ok(JsonLogCallback {
            file: Mutex::new(file),
        })
    }

    fn write_event(&self, event: &RunEvent) {
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{}", event.to_line()).and_then(|_| file.flush()) {
            warn!(error = %e, "failed to write json_log event");
        }
    }
}

#[async_trait]
impl CallbackPlugin for JsonLogCallback {
    fn name(&self) -> &str {
        "json_log"
    }

    async fn on_run_start(&self, playbook: &str, hosts: &[String]) {
        self.write_event(&RunEvent::RunStart { playbook, hosts });
    }

    async fn on_phase_start(&self, phase: &str, group: &str, hosts: &[String]) {
        self.write_event(&RunEvent::PhaseStart { phase, group, hosts });
    }

    async fn on_task_complete(&self, host: &str, record: &TaskRecord) {
        self.write_event(&RunEvent::task(host, record));
    }

    async fn on_handler_complete(&self, host: &str, record: &TaskRecord) {
        self.write_event(&RunEvent::task(host, record));
    }

    async fn on_run_complete(&self, summary: &RunSummary) {
        self.write_event(&RunEvent::complete(summary));
    }
}

/// Webhook callback - POSTs the run summary to a URL when the run ends.
/// Delivery is best-effort: failures are logged and never change the run result.
pub struct WebhookCallback {
    url: String,
    client: reqwest::Client,
}

impl WebhookCallback {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        WebhookCallback {
            url: url.into(),
            client,
        }
    }

    pub fn payload(summary: &RunSummary) -> serde_json::Value {
        json!({
            "event": "run_complete",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "success": summary.success,
            "aborted": summary.aborted,
            "check_mode": summary.check_mode,
            "duration_ms": summary.duration_ms,
            "hosts": summary.host_totals(),
            "phases": summary.phases,
        })
    }
}

#[async_trait]
impl CallbackPlugin for WebhookCallback {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn on_run_complete(&self, summary: &RunSummary) {
        let result = self
            .client
            .post(&self.url)
            .json(&Self::payload(summary))
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match result {
            Ok(response) => {
                debug!(url = %self.url, status = %response.status(), "run summary delivered")
            }
            Err(e) => warn!(url = %self.url, error = %e, "failed to deliver run summary"),
        }
    }
}

/// Parse callback plugin specification from CLI
/// Format: "plugin_name:args" or just "plugin_name"
pub fn parse_callback_spec(spec: &str) -> (&str, Option<&str>) {
    match spec.split_once(':') {
        Some((name, args)) => (name, Some(args)),
        None => (spec, None),
    }
}

/// Create a callback plugin from a specification string
pub fn create_callback_plugin(spec: &str) -> Result<Box<dyn CallbackPlugin>, String> {
    let (name, args) = parse_callback_spec(spec);

    match name {
        "json_log" => {
            let path = args.filter(|a| !a.is_empty()).ok_or_else(|| {
                "json_log callback requires a file path (e.g., json_log:/tmp/converge.ndjson)"
                    .to_string()
            })?;

            JsonLogCallback::new(path)
                .map(|p| Box::new(p) as Box<dyn CallbackPlugin>)
                .map_err(|e| format!("Failed to create json_log callback: {}", e))
        }

        "webhook" => {
            let url = args.filter(|a| !a.is_empty()).ok_or_else(|| {
                "webhook callback requires a URL (e.g., webhook:https://example.com/events)"
                    .to_string()
            })?;

            Ok(Box::new(WebhookCallback::new(url)))
        }

        _ => Err(format!(
            "Unknown callback plugin: {} (available: json_log, webhook)",
            name
        )),
    }
}
