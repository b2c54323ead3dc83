// Run-scoped fact store shared across phases
//
// Values published by one phase are keyed by (group, key). Writes land in a
// pending area that only the current phase can fill; at the phase barrier the
// pending area is sealed and becomes readable by later phases.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, trace};

use crate::output::errors::ConvergeError;
use crate::parser::ast::{FactRef, Value};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FactError {
    #[error("unresolved reference '{reference}'")]
    Unresolved {
        reference: String,
        searched: Vec<String>,
    },

    #[error("fact '{key}' was already captured for group '{group}' by {first_host} with a different value")]
    Conflict {
        group: String,
        key: String,
        first_host: String,
    },
}

impl From<FactError> for ConvergeError {
    fn from(err: FactError) -> Self {
        match err {
            FactError::Unresolved {
                reference,
                searched,
            } => ConvergeError::UnresolvedReference {
                reference,
                searched,
            },
            conflict @ FactError::Conflict { .. } => ConvergeError::Runtime {
                message: conflict.to_string(),
                suggestion: Some(
                    "Publish host-specific values under distinct keys".to_string(),
                ),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct Captured {
    host: String,
    value: Value,
}

/// Facts sealed at the end of one phase
#[derive(Debug, Clone)]
struct PhaseFacts {
    group: String,
    facts: HashMap<String, Value>,
}

#[derive(Debug, Default)]
pub struct FactStore {
    sealed: RwLock<Vec<PhaseFacts>>,
    pending: RwLock<HashMap<(String, String), Captured>>,
}

impl FactStore {
    pub fn new() -> Self {
        FactStore::default()
    }

    /// Capture a value for the phase currently running
    ///
    /// A key is write-once per group within a phase: rewriting the same value
    /// is accepted, a different value is a conflict.
    pub fn capture(
        &self,
        group: &str,
        host: &str,
        key: &str,
        value: Value,
    ) -> Result<(), FactError> {
        let mut pending = self.pending.write();
        let slot = (group.to_string(), key.to_string());

        if let Some(existing) = pending.get(&slot) {
            if existing.value == value {
                trace!(group, key, host, "fact re-captured with identical value");
                return Ok(());
            }
            return Err(FactError::Conflict {
                group: group.to_string(),
                key: key.to_string(),
                first_host: existing.host.clone(),
            });
        }

        debug!(group, key, host, "captured fact");
        pending.insert(
            slot,
            Captured {
                host: host.to_string(),
                value,
            },
        );
        Ok(())
    }

    /// Close the current phase: pending captures become visible to later phases
    pub fn seal_phase(&self, group: &str) {
        let mut pending = self.pending.write();
        let mut facts = HashMap::new();

        let keys: Vec<(String, String)> = pending
            .keys()
            .filter(|(g, _)| g == group)
            .cloned()
            .collect();
        for slot in keys {
            if let Some(captured) = pending.remove(&slot) {
                facts.insert(slot.1, captured.value);
            }
        }

        debug!(group, count = facts.len(), "sealed phase facts");
        self.sealed.write().push(PhaseFacts {
            group: group.to_string(),
            facts,
        });
    }

    /// Resolve a reference against sealed phases, latest first
    pub fn resolve(&self, reference: &FactRef) -> Result<Value, FactError> {
        let sealed = self.sealed.read();
        let mut searched = Vec::new();

        for phase in sealed.iter().rev() {
            if let Some(ref group) = reference.group {
                if &phase.group != group {
                    continue;
                }
            }
            if !searched.contains(&phase.group) {
                searched.push(phase.group.clone());
            }

            if let Some(value) = phase.facts.get(&reference.key) {
                return value
                    .lookup_path(&reference.path)
                    .cloned()
                    .ok_or_else(|| FactError::Unresolved {
                        reference: reference.to_string(),
                        searched: vec![phase.group.clone()],
                    });
            }
        }

        Err(FactError::Unresolved {
            reference: reference.to_string(),
            searched,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.sealed.read().iter().all(|p| p.facts.is_empty()) && self.pending.read().is_empty()
    }
}
