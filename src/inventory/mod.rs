// Inventory: target hosts and the groups they belong to

mod static_inv;

pub use static_inv::*;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use crate::output::errors::ConvergeError;
use crate::parser::ast::{HostPattern, Value};

/// A single target machine
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub vars: HashMap<String, Value>,
    pub groups: Vec<String>,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Host {
            address: name.clone(),
            name,
            port: 22,
            user: String::new(),
            vars: HashMap::new(),
            groups: Vec::new(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: Value) -> Self {
        self.vars.insert(key.into(), value);
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        let group = group.into();
        if !self.groups.contains(&group) {
            self.groups.push(group);
        }
        self
    }

    /// `user@address:port`, or `address:port` without a user
    pub fn ssh_target(&self) -> String {
        if self.user.is_empty() {
            format!("{}:{}", self.address, self.port)
        } else {
            format!("{}@{}:{}", self.user, self.address, self.port)
        }
    }

    /// Whether commands for this host run on the control machine
    pub fn is_local(&self) -> bool {
        if let Some(conn) = self.vars.get("connection").and_then(Value::as_str) {
            return conn == "local";
        }

        matches!(self.name.as_str(), "localhost" | "127.0.0.1" | "::1")
            || matches!(self.address.as_str(), "localhost" | "127.0.0.1" | "::1")
    }

    pub fn localhost() -> Self {
        Host::new("localhost")
            .with_address("127.0.0.1")
            .with_var("connection", Value::from("local"))
    }

    /// Fold a later definition of the same host into this one
    fn merge(&mut self, other: Host) {
        if other.address != other.name {
            self.address = other.address;
        }
        if other.port != 22 {
            self.port = other.port;
        }
        if !other.user.is_empty() {
            self.user = other.user;
        }
        self.vars.extend(other.vars);
        for group in other.groups {
            if !self.groups.contains(&group) {
                self.groups.push(group);
            }
        }
    }
}

/// A named set of hosts; children contribute their hosts too
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostGroup {
    pub name: String,
    pub hosts: Vec<String>,
    pub children: Vec<String>,
    pub vars: HashMap<String, Value>,
}

impl HostGroup {
    pub fn new(name: impl Into<String>) -> Self {
        HostGroup {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub hosts: HashMap<String, Host>,
    pub groups: HashMap<String, HostGroup>,
    pub default_user: Option<String>,
}

impl Inventory {
    pub fn new() -> Self {
        let mut inv = Inventory::default();
        inv.groups.insert("all".to_string(), HostGroup::new("all"));
        inv
    }

    pub fn from_file(path: &Path) -> Result<Self, ConvergeError> {
        parse_inventory_file(path)
    }

    /// Ad-hoc inventory from a comma-separated host list such as
    /// `web1.example.com,10.0.0.5:2222`
    pub fn from_cli_hosts(hosts_str: &str, default_user: Option<&str>) -> Self {
        let mut inv = Inventory::new();
        inv.default_user = default_user.map(str::to_string);

        for entry in hosts_str.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (name, port) = match entry.rsplit_once(':') {
                Some((name, port)) if !name.contains(':') => match port.parse::<u16>() {
                    Ok(port) => (name, port),
                    Err(_) => (entry, 22),
                },
                _ => (entry, 22),
            };

            let mut host = Host::new(name).with_port(port).with_group("ungrouped");
            if let Some(user) = default_user {
                host = host.with_user(user);
            }
            inv.add_host(host);
        }

        inv
    }

    /// Add a host, merging with an existing definition of the same name
    pub fn add_host(&mut self, host: Host) {
        let name = host.name.clone();

        let mut memberships = host.groups.clone();
        memberships.push("all".to_string());

        for group_name in memberships {
            let group = self
                .groups
                .entry(group_name.clone())
                .or_insert_with(|| HostGroup::new(group_name));
            if !group.hosts.contains(&name) {
                group.hosts.push(name.clone());
            }
        }

        match self.hosts.get_mut(&name) {
            Some(existing) => existing.merge(host),
            None => {
                self.hosts.insert(name, host);
            }
        }
    }

    /// Add a group, merging members and vars with an existing one
    pub fn add_group(&mut self, group: HostGroup) {
        let entry = self
            .groups
            .entry(group.name.clone())
            .or_insert_with(|| HostGroup::new(group.name.clone()));
        for host in group.hosts {
            if !entry.hosts.contains(&host) {
                entry.hosts.push(host);
            }
        }
        for child in group.children {
            if !entry.children.contains(&child) {
                entry.children.push(child);
            }
        }
        entry.vars.extend(group.vars);
    }

    pub fn get_host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    /// Hosts matching a pattern, sorted by name and without duplicates
    pub fn get_hosts(&self, pattern: &HostPattern) -> Vec<&Host> {
        let names: Vec<&str> = match pattern {
            HostPattern::All => return self.sorted(self.hosts.values().collect()),
            HostPattern::Group(name) => vec![name.as_str()],
            HostPattern::Union(parts) => parts.iter().map(String::as_str).collect(),
        };

        let mut hosts = Vec::new();
        for name in names {
            if name == "all" {
                hosts.extend(self.hosts.values());
            } else if let Some(group) = self.groups.get(name) {
                hosts.extend(self.expand_group(group, &mut HashSet::new()));
            } else if let Some(host) = self.hosts.get(name) {
                hosts.push(host);
            }
        }

        self.sorted(hosts)
    }

    fn sorted<'a>(&self, hosts: Vec<&'a Host>) -> Vec<&'a Host> {
        let unique: BTreeMap<&str, &'a Host> =
            hosts.into_iter().map(|h| (h.name.as_str(), h)).collect();
        unique.into_values().collect()
    }

    fn expand_group<'a>(&'a self, group: &'a HostGroup, seen: &mut HashSet<String>) -> Vec<&'a Host> {
        if !seen.insert(group.name.clone()) {
            return Vec::new();
        }

        let mut hosts: Vec<&Host> = group
            .hosts
            .iter()
            .filter_map(|name| self.hosts.get(name))
            .collect();

        for child in &group.children {
            if let Some(child_group) = self.groups.get(child) {
                hosts.extend(self.expand_group(child_group, seen));
            }
        }

        hosts
    }

    /// Host variables with group vars underneath: host vars win, and a
    /// group's vars win over `all`
    pub fn get_host_vars(&self, host: &Host) -> HashMap<String, Value> {
        let mut vars = HashMap::new();

        if let Some(all) = self.groups.get("all") {
            vars.extend(all.vars.clone());
        }
        for group_name in &host.groups {
            if let Some(group) = self.groups.get(group_name) {
                vars.extend(group.vars.clone());
            }
        }
        vars.extend(host.vars.clone());

        vars
    }

    /// Host with group vars folded in and the default user applied
    pub fn resolved_host(&self, host: &Host) -> Host {
        let mut resolved = host.clone();
        resolved.vars = self.get_host_vars(host);
        if resolved.user.is_empty() {
            if let Some(ref user) = self.default_user {
                resolved.user = user.clone();
            }
        }
        resolved
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

impl std::str::FromStr for Inventory {
    type Err = ConvergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_inventory(s)
    }
}
