// Handler notification queue
//
// Handlers are notified per host by changed tasks and flushed once per host,
// in declaration order, after the host's regular tasks.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::parser::ast::Handler;

/// Pending handler notifications for one phase
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    /// handler name -> hosts that notified it and have not flushed it yet
    notifications: RwLock<HashMap<String, HashSet<String>>>,
    /// Declaration order of the phase's handlers
    execution_order: Vec<String>,
    /// (handler, host) pairs already run
    flushed: RwLock<HashSet<(String, String)>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    pub fn from_handlers(handlers: &[Handler]) -> Self {
        HandlerRegistry {
            execution_order: handlers.iter().map(|h| h.name.clone()).collect(),
            ..Default::default()
        }
    }

    /// Notify a handler for a host; returns false if it was already pending
    /// or has already run for that host
    pub fn notify(&self, handler_name: &str, host: &str) -> bool {
        if self
            .flushed
            .read()
            .contains(&(handler_name.to_string(), host.to_string()))
        {
            return false;
        }
        self.notifications
            .write()
            .entry(handler_name.to_string())
            .or_default()
            .insert(host.to_string())
    }

    /// Handlers pending for a host, in declaration order
    pub fn pending_for(&self, host: &str) -> Vec<String> {
        let notifications = self.notifications.read();
        self.execution_order
            .iter()
            .filter(|name| {
                notifications
                    .get(*name)
                    .map(|hosts| hosts.contains(host))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Record that a handler ran for a host so later notifications are ignored
    pub fn mark_flushed(&self, handler_name: &str, host: &str) {
        if let Some(hosts) = self.notifications.write().get_mut(handler_name) {
            hosts.remove(host);
        }
        self.flushed
            .write()
            .insert((handler_name.to_string(), host.to_string()));
    }

    /// Drop a host's pending notifications without running them
    pub fn discard_host(&self, host: &str) {
        for hosts in self.notifications.write().values_mut() {
            hosts.remove(host);
        }
    }
}
