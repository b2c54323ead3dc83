// Engine configuration: an optional YAML file underneath the CLI flags

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::executor::{SchedulerConfig, SshSettings};
use crate::output::errors::ConvergeError;

/// Looked up in the working directory when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "converge.yml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Hosts worked on concurrently within a phase
    pub forks: usize,
    /// First hard failure cancels the rest of the run
    pub strict: bool,
    pub check: bool,
    pub diff: bool,
    pub sudo: bool,
    pub sudo_user: Option<String>,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: Option<u64>,
    pub ssh: SshConfig,
    /// Receives the JSON run summary when the run ends
    pub webhook: Option<String>,
    /// Extra callback plugins, as `name:argument`
    pub callbacks: Vec<String>,
}

fn default_forks() -> usize {
    10
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            forks: default_forks(),
            strict: false,
            check: false,
            diff: false,
            sudo: false,
            sudo_user: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: None,
            ssh: SshConfig::default(),
            webhook: None,
            callbacks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub user: Option<String>,
    pub private_key: Option<PathBuf>,
    pub password: Option<String>,
}

impl EngineConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConvergeError> {
        let config: EngineConfig = serde_yaml::from_str(content).map_err(|e| ConvergeError::Config {
            message: format!("invalid configuration: {}", e),
            path: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConvergeError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConvergeError::Config {
            message: format!("cannot read configuration: {}", e),
            path: Some(path.to_path_buf()),
        })?;

        Self::from_yaml_str(&content).map_err(|e| match e {
            ConvergeError::Config { message, .. } => ConvergeError::Config {
                message,
                path: Some(path.to_path_buf()),
            },
            other => other,
        })
    }

    /// The explicit file if given, else `converge.yml` in `dir` when it
    /// exists, else defaults
    pub fn discover(explicit: Option<&Path>, dir: &Path) -> Result<Self, ConvergeError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let implicit = dir.join(DEFAULT_CONFIG_FILE);
        if implicit.is_file() {
            Self::load(&implicit)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<(), ConvergeError> {
        if self.forks == 0 {
            return Err(ConvergeError::Config {
                message: "forks must be at least 1".to_string(),
                path: None,
            });
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConvergeError::Config {
                message: "connect_timeout_secs must be at least 1".to_string(),
                path: None,
            });
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            forks: self.forks.max(1),
            strict: self.strict,
            check_mode: self.check,
            diff_mode: self.diff,
            sudo: self.sudo,
            sudo_user: self.sudo_user.clone(),
        }
    }

    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            default_user: self.ssh.user.clone(),
            private_key_path: self.ssh.private_key.clone(),
            password: self.ssh.password.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            command_timeout: self.command_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Callback plugin specs, with the webhook folded in
    pub fn callback_specs(&self) -> Vec<String> {
        let mut specs = self.callbacks.clone();
        if let Some(ref url) = self.webhook {
            let spec = format!("webhook:{}", url);
            if !specs.contains(&spec) {
                specs.push(spec);
            }
        }
        specs
    }
}
