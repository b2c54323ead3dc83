// In-memory host that interprets the inspect and act commands modules emit
//
// Package state follows dpkg/apt, services follow systemctl, the firewall
// follows iptables. Every policy change records the chain's rules at that
// moment so rule ordering can be asserted.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use parking_lot::{Mutex, MutexGuard};

use super::{CommandResult, Connection};
use crate::modules::command::split_words;
use crate::output::errors::ConvergeError;

#[derive(Debug, Clone, PartialEq)]
pub struct SimFile {
    pub content: String,
    pub owner: String,
    pub group: String,
    pub mode: String,
}

impl SimFile {
    fn new(content: impl Into<String>, mode: &str) -> Self {
        SimFile {
            content: content.into(),
            owner: "root".to_string(),
            group: "root".to_string(),
            mode: mode.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SimService {
    pub active: bool,
    pub enabled: bool,
}

/// Rules of a chain at the moment its policy was set
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySnapshot {
    pub chain: String,
    pub policy: String,
    pub rules: Vec<String>,
}

#[derive(Debug)]
struct ScriptedFailure {
    pattern: String,
    remaining: u32,
    result: CommandResult,
}

#[derive(Debug, Default)]
pub struct HostState {
    pub packages: BTreeSet<String>,
    /// Installable packages; `None` means anything installs
    pub available: Option<BTreeSet<String>>,
    pub upgradable: BTreeSet<String>,
    pub services: BTreeMap<String, SimService>,
    pub files: BTreeMap<String, SimFile>,
    pub dirs: BTreeMap<String, SimFile>,
    /// (chain, canonical rule spec) in insertion order
    pub rules: Vec<(String, String)>,
    pub policies: BTreeMap<String, String>,
    pub policy_snapshots: Vec<PolicySnapshot>,
    /// Every command received, after sudo unwrapping
    pub commands: Vec<String>,
    /// Every package installed by a command
    pub install_log: Vec<String>,
    /// Exact-command responses for commands outside the vocabulary
    pub responses: BTreeMap<String, CommandResult>,
    scripted: Vec<ScriptedFailure>,
}

pub struct SimulatedHost {
    name: String,
    state: Mutex<HostState>,
}

impl SimulatedHost {
    pub fn new(name: impl Into<String>) -> Self {
        let mut state = HostState::default();
        for chain in ["INPUT", "FORWARD", "OUTPUT"] {
            state.policies.insert(chain.to_string(), "ACCEPT".to_string());
        }
        SimulatedHost {
            name: name.into(),
            state: Mutex::new(state),
        }
    }

    pub fn with_package(self, name: &str) -> Self {
        self.state.lock().packages.insert(name.to_string());
        self
    }

    pub fn with_available(self, names: &[&str]) -> Self {
        self.state.lock().available = Some(names.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_service(self, name: &str, active: bool, enabled: bool) -> Self {
        self.state
            .lock()
            .services
            .insert(name.to_string(), SimService { active, enabled });
        self
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.state
            .lock()
            .files
            .insert(path.to_string(), SimFile::new(content, "644"));
        self
    }

    /// Answer an exact command with a fixed result
    pub fn respond(self, cmd: &str, stdout: &str, exit_code: i32) -> Self {
        self.state.lock().responses.insert(
            cmd.to_string(),
            CommandResult {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code,
            },
        );
        self
    }

    /// Fail the next `times` commands containing `pattern`
    pub fn fail_times(self, pattern: &str, times: u32, stderr: &str) -> Self {
        self.state.lock().scripted.push(ScriptedFailure {
            pattern: pattern.to_string(),
            remaining: times,
            result: CommandResult {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code: 100,
            },
        });
        self
    }

    pub fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// How many received commands contain `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    pub fn file(&self, path: &str) -> Option<SimFile> {
        self.state.lock().files.get(path).cloned()
    }

    pub fn rules(&self, chain: &str) -> Vec<String> {
        self.state
            .lock()
            .rules
            .iter()
            .filter(|(c, _)| c == chain)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn policy_snapshots(&self) -> Vec<PolicySnapshot> {
        self.state.lock().policy_snapshots.clone()
    }

    fn run(&self, cmd: &str) -> CommandResult {
        let words = match split_words(cmd) {
            Ok(words) => words,
            Err(e) => return fail(2, &e.to_string()),
        };

        // sudo -n [-u user] -- sh -c 'inner'
        if words.first().map(String::as_str) == Some("sudo") {
            if let Some(pos) = words.iter().position(|w| w == "-c") {
                if let Some(inner) = words.get(pos + 1) {
                    return self.run(inner);
                }
            }
            return fail(1, "sudo: malformed command");
        }
        // sh -c 'inner' from the shell module
        if words.len() == 3 && words[0] == "sh" && words[1] == "-c" {
            return self.run(&words[2]);
        }

        let mut state = self.state.lock();
        state.commands.push(cmd.to_string());

        let scripted = state
            .scripted
            .iter_mut()
            .find(|s| s.remaining > 0 && cmd.contains(&s.pattern));
        if let Some(script) = scripted {
            script.remaining -= 1;
            return script.result.clone();
        }

        if let Some(result) = state.responses.get(cmd) {
            return result.clone();
        }

        // `cd DIR && rest`
        if words.len() > 3 && words[0] == "cd" && words[2] == "&&" {
            if !state.dirs.contains_key(&words[1]) {
                return fail(1, &format!("cd: {}: No such file or directory", words[1]));
            }
            drop(state);
            let rest = words[3..].iter().map(|w| quote(w)).collect::<Vec<_>>().join(" ");
            return self.run(&rest);
        }

        if words.first().map(String::as_str) == Some("echo") && words.iter().any(|w| w == "base64") {
            return write_base64(&mut state, &words);
        }

        let args = leading_words(&words);
        let or_true = words.windows(2).any(|w| w[0] == "||" && w[1] == "true");
        let mut result = match args.first().map(String::as_str) {
            Some("which") => match args.get(1).map(String::as_str) {
                Some(tool @ ("apt-get" | "iptables" | "systemctl")) => ok(&format!("/usr/bin/{}\n", tool)),
                _ => fail(1, ""),
            },
            Some("dpkg") => dpkg(&state, &args),
            Some("apt") => {
                // apt list --upgradable | grep -q '^NAME/'
                let wanted = words
                    .last()
                    .map(|w| w.trim_start_matches('^').trim_end_matches('/').to_string())
                    .unwrap_or_default();
                if state.upgradable.contains(&wanted) {
                    ok(&format!("{}/stable 2.0 amd64 [upgradable from: 1.0]\n", wanted))
                } else {
                    fail(1, "")
                }
            }
            Some("apt-get") => apt_get(&mut state, &args),
            Some("systemctl") => systemctl(&mut state, &args),
            Some("iptables") => iptables(&mut state, &args),
            Some("test") => {
                let path = args.get(2).cloned().unwrap_or_default();
                let exists = match args.get(1).map(String::as_str) {
                    Some("-f") => state.files.contains_key(&path),
                    Some("-d") => state.dirs.contains_key(&path),
                    _ => state.files.contains_key(&path) || state.dirs.contains_key(&path),
                };
                if exists {
                    ok("")
                } else {
                    fail(1, "")
                }
            }
            Some("stat") => {
                let path = args.get(3).cloned().unwrap_or_default();
                let entry = state.files.get(&path).or_else(|| state.dirs.get(&path));
                match (entry, args.get(2).map(String::as_str)) {
                    (Some(f), Some("%a")) => ok(&format!("{}\n", f.mode)),
                    (Some(f), Some("%U:%G")) => ok(&format!("{}:{}\n", f.owner, f.group)),
                    _ => fail(1, "stat: cannot statx: No such file or directory"),
                }
            }
            Some("chmod") => {
                let (mode, path) = (args[1].clone(), args[2].clone());
                // stat -c %a prints the bits without leading zeros
                let mode = u32::from_str_radix(&mode, 8).map_or(mode, |bits| format!("{:o}", bits));
                match entry_mut(&mut state, &path) {
                    Some(f) => {
                        f.mode = mode;
                        ok("")
                    }
                    None => fail(1, "chmod: No such file or directory"),
                }
            }
            Some("chown") => {
                let (spec, path) = (args[1].clone(), args[2].clone());
                match entry_mut(&mut state, &path) {
                    Some(f) => {
                        let (owner, group) = spec.split_once(':').unwrap_or((spec.as_str(), ""));
                        if !owner.is_empty() {
                            f.owner = owner.to_string();
                        }
                        if !group.is_empty() {
                            f.group = group.to_string();
                        }
                        ok("")
                    }
                    None => fail(1, "chown: No such file or directory"),
                }
            }
            Some("mkdir") => {
                let path = args.last().cloned().unwrap_or_default();
                let mut current = String::new();
                for part in path.split('/').filter(|p| !p.is_empty()) {
                    current.push('/');
                    current.push_str(part);
                    state
                        .dirs
                        .entry(current.clone())
                        .or_insert_with(|| SimFile::new("", "755"));
                }
                ok("")
            }
            Some("touch") => {
                let path = args[1].clone();
                state
                    .files
                    .entry(path)
                    .or_insert_with(|| SimFile::new("", "644"));
                ok("")
            }
            Some("rm") => {
                let path = args.last().cloned().unwrap_or_default();
                state.files.remove(&path);
                let prefix = format!("{}/", path);
                state.files.retain(|p, _| !p.starts_with(&prefix));
                state.dirs.retain(|p, _| p != &path && !p.starts_with(&prefix));
                ok("")
            }
            Some("echo") => ok(&format!("{}\n", args[1..].join(" "))),
            Some("true") => ok(""),
            Some("false") => fail(1, ""),
            Some("exit") => {
                let code = args.get(1).and_then(|c| c.parse().ok()).unwrap_or(1);
                CommandResult {
                    exit_code: code,
                    ..Default::default()
                }
            }
            _ => fail(127, &format!("sh: {}: command not found", cmd)),
        };

        if or_true {
            result.exit_code = 0;
        }
        result
    }
}

/// Words before the first pipe, list operator or redirection
fn leading_words(words: &[String]) -> Vec<String> {
    words
        .iter()
        .take_while(|w| {
            !matches!(w.as_str(), "|" | "||" | "&&" | ";" | ">" | "2>&1")
                && !w.starts_with("2>")
                && !w.starts_with(">")
        })
        // DEBIAN_FRONTEND=noninteractive and similar assignments
        .skip_while(|w| w.contains('=') && !w.starts_with('-'))
        .cloned()
        .collect()
}

fn quote(word: &str) -> String {
    if matches!(word, "|" | "||" | "&&" | ";") || word.starts_with("2>") {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

fn ok(stdout: &str) -> CommandResult {
    CommandResult {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

fn fail(code: i32, stderr: &str) -> CommandResult {
    CommandResult {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: code,
    }
}

fn entry_mut<'a>(state: &'a mut HostState, path: &str) -> Option<&'a mut SimFile> {
    if state.files.contains_key(path) {
        state.files.get_mut(path)
    } else {
        state.dirs.get_mut(path)
    }
}

fn parent_exists(state: &HostState, path: &str) -> bool {
    match Path::new(path).parent().and_then(|p| p.to_str()) {
        None | Some("") | Some("/") => true,
        Some(parent) => state.dirs.contains_key(parent),
    }
}

/// `echo B64 | base64 -d > TMP && mv TMP PATH`
fn write_base64(state: &mut HostState, words: &[String]) -> CommandResult {
    let decoded = words
        .get(1)
        .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok());
    let (Some(content), Some(path)) = (decoded, words.last()) else {
        return fail(1, "base64: invalid input");
    };
    if !parent_exists(state, path) {
        return fail(1, "No such file or directory");
    }
    state
        .files
        .entry(path.clone())
        .or_insert_with(|| SimFile::new("", "644"))
        .content = content;
    ok("")
}

fn dpkg(state: &HostState, args: &[String]) -> CommandResult {
    // dpkg -l NAME
    match args.get(2) {
        Some(name) if state.packages.contains(name) => ok(&format!("ii  {}  1.0  amd64\n", name)),
        _ => fail(1, "dpkg-query: no packages found"),
    }
}

fn apt_get(state: &mut HostState, args: &[String]) -> CommandResult {
    let names: Vec<String> = args
        .iter()
        .skip(2)
        .filter(|a| !a.starts_with('-'))
        .cloned()
        .collect();

    match args.get(1).map(String::as_str) {
        Some("install") | Some("upgrade") => {
            if let Some(ref available) = state.available {
                if let Some(missing) = names.iter().find(|n| !available.contains(*n)) {
                    return fail(100, &format!("E: Unable to locate package {}", missing));
                }
            }
            for name in names {
                state.upgradable.remove(&name);
                state.install_log.push(name.clone());
                state.packages.insert(name);
            }
            ok("")
        }
        Some("remove") => {
            for name in names {
                state.packages.remove(&name);
            }
            ok("")
        }
        _ => fail(100, "E: Invalid operation"),
    }
}

fn systemctl(state: &mut HostState, args: &[String]) -> CommandResult {
    let verb = args.get(1).map(String::as_str).unwrap_or_default();
    let name = args.get(2).cloned().unwrap_or_default();

    match verb {
        "is-active" => match state.services.get(&name) {
            Some(s) if s.active => ok("active\n"),
            _ => CommandResult {
                stdout: "inactive\n".to_string(),
                stderr: String::new(),
                exit_code: 3,
            },
        },
        "is-enabled" => match state.services.get(&name) {
            Some(s) if s.enabled => ok("enabled\n"),
            Some(_) => CommandResult {
                stdout: "disabled\n".to_string(),
                stderr: String::new(),
                exit_code: 1,
            },
            None => fail(1, &format!("Failed to get unit file state for {}.service", name)),
        },
        _ => {
            let Some(service) = state.services.get_mut(&name) else {
                return fail(5, &format!("Failed to {} {}.service: Unit {}.service not found.", verb, name, name));
            };
            match verb {
                "start" | "restart" | "reload" | "reload-or-restart" => service.active = true,
                "stop" => service.active = false,
                "enable" => service.enabled = true,
                "disable" => service.enabled = false,
                _ => return fail(1, &format!("Unknown command verb {}", verb)),
            }
            ok("")
        }
    }
}

fn iptables(state: &mut HostState, args: &[String]) -> CommandResult {
    let flag = args.get(1).map(String::as_str).unwrap_or_default();
    let chain = args.get(2).cloned().unwrap_or_default();
    let spec = args.get(3..).map(|s| s.join(" ")).unwrap_or_default();
    let entry = (chain.clone(), spec.clone());

    match flag {
        "-C" => {
            if state.rules.contains(&entry) {
                ok("")
            } else {
                fail(1, "iptables: Bad rule (does a matching rule exist in that chain?).")
            }
        }
        "-A" => {
            state.rules.push(entry);
            ok("")
        }
        "-D" => match state.rules.iter().position(|r| r == &entry) {
            Some(pos) => {
                state.rules.remove(pos);
                ok("")
            }
            None => fail(1, "iptables: Bad rule (does a matching rule exist in that chain?)."),
        },
        "-S" => {
            let policy = state.policies.get(&chain).cloned().unwrap_or_else(|| "-".to_string());
            let mut out = format!("-P {} {}\n", chain, policy);
            for (c, rule) in &state.rules {
                if c == &chain {
                    out.push_str(&format!("-A {} {}\n", c, rule));
                }
            }
            ok(&out)
        }
        "-P" => {
            let policy = args.get(3).cloned().unwrap_or_default();
            let rules = state
                .rules
                .iter()
                .filter(|(c, _)| c == &chain)
                .map(|(_, r)| r.clone())
                .collect();
            state.policy_snapshots.push(PolicySnapshot {
                chain: chain.clone(),
                policy: policy.clone(),
                rules,
            });
            state.policies.insert(chain, policy);
            ok("")
        }
        _ => fail(2, &format!("iptables: unknown option {}", flag)),
    }
}

#[async_trait]
impl Connection for SimulatedHost {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, ConvergeError> {
        Ok(self.run(cmd))
    }

    async fn read_file(&self, path: &str) -> Result<String, ConvergeError> {
        self.state
            .lock()
            .files
            .get(path)
            .map(|f| f.content.clone())
            .ok_or_else(|| ConvergeError::Io {
                message: "No such file or directory".to_string(),
                path: Some(path.into()),
            })
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), ConvergeError> {
        let mut state = self.state.lock();
        if !parent_exists(&state, path) {
            return Err(ConvergeError::Io {
                message: "No such file or directory".to_string(),
                path: Some(path.into()),
            });
        }
        state
            .files
            .entry(path.to_string())
            .or_insert_with(|| SimFile::new("", "644"))
            .content = content.to_string();
        Ok(())
    }

    fn host_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sudo_wrapped_commands_are_unwrapped() {
        let host = SimulatedHost::new("web1").with_service("nginx", false, false);
        let result = host
            .exec("sudo -n -- sh -c 'systemctl start '\"'\"'nginx'\"'\"''")
            .await
            .unwrap();

        assert!(result.success());
        assert!(host.state().services["nginx"].active);
        assert_eq!(host.commands(), vec!["systemctl start 'nginx'"]);
    }

    #[tokio::test]
    async fn test_policy_snapshot_records_rules() {
        let host = SimulatedHost::new("fw");
        host.exec("iptables -A INPUT -p tcp --dport 22 -j ACCEPT").await.unwrap();
        host.exec("iptables -P INPUT DROP").await.unwrap();

        assert_eq!(
            host.policy_snapshots(),
            vec![PolicySnapshot {
                chain: "INPUT".to_string(),
                policy: "DROP".to_string(),
                rules: vec!["-p tcp --dport 22 -j ACCEPT".to_string()],
            }]
        );
        let listing = host.exec("iptables -S INPUT").await.unwrap();
        assert_eq!(listing.stdout, "-P INPUT DROP\n-A INPUT -p tcp --dport 22 -j ACCEPT\n");
    }

    #[tokio::test]
    async fn test_scripted_failures_run_out() {
        let host = SimulatedHost::new("db1").fail_times("apt-get install", 1, "E: Could not get lock");

        let first = host.exec("apt-get install -y mariadb-server").await.unwrap();
        assert_eq!(first.exit_code, 100);
        let second = host.exec("apt-get install -y mariadb-server").await.unwrap();
        assert!(second.success());
        assert!(host.state().packages.contains("mariadb-server"));
    }
}
