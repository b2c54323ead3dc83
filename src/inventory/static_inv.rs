// Static YAML inventory parser
//
// hosts:
//   web1: { address: 10.0.0.10, user: deploy }
// groups:
//   webservers:
//     hosts: [web1]
//     children: [frontend]
//     vars: { http_port: 80 }
// defaults:
//   user: ops

use std::collections::HashMap;
use std::path::Path;

use serde_yaml::Value as YamlValue;

use super::{Host, HostGroup, Inventory};
use crate::output::errors::ConvergeError;
use crate::parser::ast::Value;

pub fn parse_inventory_file(path: &Path) -> Result<Inventory, ConvergeError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConvergeError::Io {
        message: format!("Failed to read inventory file: {}", e),
        path: Some(path.to_path_buf()),
    })?;

    parse_inventory(&content)
}

pub fn parse_inventory(content: &str) -> Result<Inventory, ConvergeError> {
    let yaml: YamlValue = serde_yaml::from_str(content).map_err(|e| ConvergeError::Inventory {
        message: format!("Invalid inventory YAML: {}", e),
        suggestion: Some("Check inventory file syntax".to_string()),
    })?;

    let map = yaml.as_mapping().ok_or_else(|| ConvergeError::Inventory {
        message: "Inventory must be a YAML mapping".to_string(),
        suggestion: Some("Start with 'hosts:' or 'groups:'".to_string()),
    })?;

    let mut inventory = Inventory::new();

    for (key, value) in map {
        match key.as_str() {
            Some("hosts") => {
                parse_hosts_section(value, None, &mut inventory)?;
            }
            Some("groups") => {
                let groups = value.as_mapping().ok_or_else(|| ConvergeError::Inventory {
                    message: "'groups' must be a mapping of group name to group".to_string(),
                    suggestion: None,
                })?;
                for (name, group) in groups {
                    let name = yaml_key(name)?;
                    parse_group_section(&name, group, &mut inventory)?;
                }
            }
            Some("defaults") => {
                if let Some(user) = value.get("user").and_then(|u| u.as_str()) {
                    inventory.default_user = Some(user.to_string());
                }
                if let Some(vars) = value.get("vars").and_then(|v| v.as_mapping()) {
                    let all = inventory
                        .groups
                        .entry("all".to_string())
                        .or_insert_with(|| HostGroup::new("all"));
                    all.vars.extend(mapping_to_vars(vars));
                }
            }
            other => {
                return Err(ConvergeError::Inventory {
                    message: format!(
                        "Unknown inventory section '{}'",
                        other.unwrap_or("<non-string>")
                    ),
                    suggestion: Some("Valid sections are hosts, groups and defaults".to_string()),
                })
            }
        }
    }

    Ok(inventory)
}

/// Hosts as a list of names, a list of `{name, ...}` maps, or a
/// name-to-attributes mapping; returns the host names in file order
fn parse_hosts_section(
    value: &YamlValue,
    group_name: Option<&str>,
    inventory: &mut Inventory,
) -> Result<Vec<String>, ConvergeError> {
    let mut names = Vec::new();

    let mut add = |mut host: Host, inventory: &mut Inventory| {
        if let Some(group) = group_name {
            host = host.with_group(group);
        }
        names.push(host.name.clone());
        inventory.add_host(host);
    };

    match value {
        YamlValue::Null => {}
        YamlValue::Sequence(hosts) => {
            for entry in hosts {
                match entry {
                    YamlValue::String(name) => add(Host::new(name), inventory),
                    YamlValue::Mapping(map) => {
                        let name = map.get("name").and_then(|v| v.as_str()).ok_or_else(|| {
                            ConvergeError::Inventory {
                                message: "Host entry is missing 'name'".to_string(),
                                suggestion: Some("Use '- name: web1'".to_string()),
                            }
                        })?;
                        let host = parse_host(Host::new(name), map)?;
                        add(host, inventory);
                    }
                    other => {
                        return Err(ConvergeError::Inventory {
                            message: format!("Invalid host entry: {:?}", other),
                            suggestion: None,
                        })
                    }
                }
            }
        }
        YamlValue::Mapping(hosts) => {
            for (name, attrs) in hosts {
                let name = yaml_key(name)?;
                let host = match attrs.as_mapping() {
                    Some(map) => parse_host(Host::new(name), map)?,
                    None => Host::new(name),
                };
                add(host, inventory);
            }
        }
        _ => {
            return Err(ConvergeError::Inventory {
                message: "'hosts' must be a list or a mapping".to_string(),
                suggestion: None,
            })
        }
    }

    Ok(names)
}

fn parse_group_section(
    name: &str,
    value: &YamlValue,
    inventory: &mut Inventory,
) -> Result<(), ConvergeError> {
    let mut group = HostGroup::new(name);

    if let Some(map) = value.as_mapping() {
        if let Some(hosts) = map.get("hosts") {
            group.hosts = parse_hosts_section(hosts, Some(name), inventory)?;
        }

        if let Some(children) = map.get("children").and_then(|c| c.as_sequence()) {
            group.children = children
                .iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect();
        }

        if let Some(vars) = map.get("vars").and_then(|v| v.as_mapping()) {
            group.vars = mapping_to_vars(vars);
        }
    }

    inventory.add_group(group);
    Ok(())
}

fn parse_host(mut host: Host, map: &serde_yaml::Mapping) -> Result<Host, ConvergeError> {
    for (k, v) in map {
        let key = yaml_key(k)?;
        match key.as_str() {
            "name" => {}
            "address" | "host" => {
                if let Some(addr) = v.as_str() {
                    host.address = addr.to_string();
                }
            }
            "port" => {
                host.port = v
                    .as_u64()
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| ConvergeError::Inventory {
                        message: format!("Invalid port for host '{}': {:?}", host.name, v),
                        suggestion: Some("Ports are integers between 1 and 65535".to_string()),
                    })?;
            }
            "user" => {
                if let Some(u) = v.as_str() {
                    host.user = u.to_string();
                }
            }
            "groups" => {
                for g in v.as_sequence().into_iter().flatten() {
                    if let Some(group) = g.as_str() {
                        host = host.with_group(group);
                    }
                }
            }
            "vars" => {
                if let Some(vars) = v.as_mapping() {
                    host.vars.extend(mapping_to_vars(vars));
                }
            }
            // Anything else is a host variable, e.g. `connection: local`
            _ => {
                host.vars.insert(key, yaml_to_value(v));
            }
        }
    }

    Ok(host)
}

fn yaml_key(key: &YamlValue) -> Result<String, ConvergeError> {
    match key {
        YamlValue::String(s) => Ok(s.clone()),
        YamlValue::Number(n) => Ok(n.to_string()),
        other => Err(ConvergeError::Inventory {
            message: format!("Inventory keys must be strings, found {:?}", other),
            suggestion: None,
        }),
    }
}

fn mapping_to_vars(map: &serde_yaml::Mapping) -> HashMap<String, Value> {
    map.iter()
        .filter_map(|(k, v)| k.as_str().map(|key| (key.to_string(), yaml_to_value(v))))
        .collect()
}

/// Convert a YAML node into a runtime value
pub fn yaml_to_value(yaml: &YamlValue) -> Value {
    match yaml {
        YamlValue::Null => Value::Null,
        YamlValue::Bool(b) => Value::Bool(*b),
        YamlValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                Value::Int(0)
            }
        }
        YamlValue::String(s) => Value::String(s.clone()),
        YamlValue::Sequence(seq) => Value::List(seq.iter().map(yaml_to_value).collect()),
        YamlValue::Mapping(map) => Value::Dict(mapping_to_vars(map)),
        YamlValue::Tagged(tagged) => yaml_to_value(&tagged.value),
    }
}
