// SSH connections with session pooling
//
// libssh2 is blocking; every session call runs on the blocking thread pool.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use ssh2::{KeyboardInteractivePrompt, Session};
use tracing::{debug, warn};

use super::{CommandResult, Connection};
use crate::inventory::Host;
use crate::output::errors::ConvergeError;

/// Credentials and limits shared by every SSH session of a run
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub default_user: Option<String>,
    pub private_key_path: Option<PathBuf>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub command_timeout: Option<Duration>,
}

impl Default for SshSettings {
    fn default() -> Self {
        SshSettings {
            default_user: None,
            private_key_path: None,
            password: None,
            connect_timeout: Duration::from_secs(30),
            command_timeout: None,
        }
    }
}

/// Authenticated sessions keyed by `user@address:port`
#[derive(Default)]
pub struct ConnectionPool {
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    settings: SshSettings,
}

impl ConnectionPool {
    pub fn new(settings: SshSettings) -> Self {
        ConnectionPool {
            sessions: DashMap::new(),
            settings,
        }
    }

    /// Reuse a live session to the host or open a new one
    pub async fn get(&self, host: &Host) -> Result<SshConnection, ConvergeError> {
        let user = self.user_for(host);
        let key = format!("{}@{}:{}", user, host.address, host.port);

        if let Some(session) = self.sessions.get(&key) {
            if session.lock().authenticated() {
                debug!(host = %host.name, "reusing pooled SSH session");
                return Ok(SshConnection::new(&host.name, session.clone()));
            }
        }

        let settings = self.settings.clone();
        let target = host.clone();
        let session = tokio::task::spawn_blocking(move || connect(&target, &user, &settings))
            .await
            .map_err(|e| ConvergeError::Ssh {
                host: host.name.clone(),
                message: format!("Connection task failed: {}", e),
                suggestion: None,
            })??;

        let session = Arc::new(Mutex::new(session));
        self.sessions.insert(key, session.clone());
        Ok(SshConnection::new(&host.name, session))
    }

    fn user_for(&self, host: &Host) -> String {
        if !host.user.is_empty() {
            return host.user.clone();
        }
        self.settings
            .default_user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn ssh_error(host: &Host, message: String, suggestion: Option<&str>) -> ConvergeError {
    ConvergeError::Ssh {
        host: host.name.clone(),
        message,
        suggestion: suggestion.map(str::to_string),
    }
}

fn resolve_address(host: &Host) -> Result<SocketAddr, ConvergeError> {
    (host.address.as_str(), host.port)
        .to_socket_addrs()
        .map_err(|e| {
            ssh_error(
                host,
                format!("Cannot resolve {}: {}", host.address, e),
                Some("Check the host address in the inventory"),
            )
        })?
        .next()
        .ok_or_else(|| ssh_error(host, format!("No address for {}", host.address), None))
}

fn connect(host: &Host, user: &str, settings: &SshSettings) -> Result<Session, ConvergeError> {
    let address = resolve_address(host)?;

    let tcp = TcpStream::connect_timeout(&address, settings.connect_timeout).map_err(|e| {
        ConvergeError::Ssh {
            host: host.name.clone(),
            message: format!("Connection failed: {}", e),
            suggestion: ssh_connection_suggestion(&e),
        }
    })?;

    let mut session =
        Session::new().map_err(|e| ssh_error(host, format!("Failed to create SSH session: {}", e), None))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(settings.connect_timeout.as_millis() as u32);

    session.handshake().map_err(|e| {
        ssh_error(
            host,
            format!("SSH handshake failed: {}", e),
            Some("Check SSH service is running on the target"),
        )
    })?;

    if !authenticate(&session, user, settings) {
        return Err(ssh_error(
            host,
            format!("Authentication failed for user '{}'", user),
            Some("Add a key to the SSH agent, pass --private-key, or use -k for password auth"),
        ));
    }

    // Command timeout; zero means no limit in libssh2
    let command_ms = settings
        .command_timeout
        .map(|t| t.as_millis() as u32)
        .unwrap_or(0);
    session.set_timeout(command_ms);

    debug!(host = %host.name, user, "SSH session established");
    Ok(session)
}

/// Agent identities first, then key files, then password and
/// keyboard-interactive
fn authenticate(session: &Session, user: &str, settings: &SshSettings) -> bool {
    if let Ok(mut agent) = session.agent() {
        if agent.connect().is_ok() && agent.list_identities().is_ok() {
            for identity in agent.identities().unwrap_or_default() {
                if agent.userauth(user, &identity).is_ok() {
                    return true;
                }
            }
        }
    }

    let home = std::env::var("HOME").ok().map(PathBuf::from);
    let key_paths = settings.private_key_path.iter().cloned().chain(
        ["id_ed25519", "id_ecdsa", "id_rsa"]
            .iter()
            .filter_map(|name| home.as_ref().map(|h| h.join(".ssh").join(name))),
    );
    for key_path in key_paths {
        if key_path.exists() && session.userauth_pubkey_file(user, None, &key_path, None).is_ok() {
            return true;
        }
    }

    if let Some(ref password) = settings.password {
        if session.userauth_password(user, password).is_ok() {
            return true;
        }
        // Some PAM setups only offer keyboard-interactive
        let mut prompter = PasswordPrompter(password.clone());
        if session.userauth_keyboard_interactive(user, &mut prompter).is_ok() {
            return true;
        }
    }

    session.authenticated()
}

fn ssh_connection_suggestion(e: &std::io::Error) -> Option<String> {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Some("Ensure SSH service is running on the target host".to_string())
        }
        std::io::ErrorKind::TimedOut => {
            Some("Check network connectivity and firewall rules".to_string())
        }
        std::io::ErrorKind::PermissionDenied => {
            Some("Check SSH key permissions and authentication".to_string())
        }
        _ => None,
    }
}

struct PasswordPrompter(String);

impl KeyboardInteractivePrompt for PasswordPrompter {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.0.clone()).collect()
    }
}

/// One host's handle onto a pooled session
#[derive(Clone)]
pub struct SshConnection {
    host_name: String,
    session: Arc<Mutex<Session>>,
}

impl SshConnection {
    fn new(host_name: &str, session: Arc<Mutex<Session>>) -> Self {
        SshConnection {
            host_name: host_name.to_string(),
            session,
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, ConvergeError>
    where
        T: Send + 'static,
        F: FnOnce(&Session, &str) -> Result<T, ConvergeError> + Send + 'static,
    {
        let session = self.session.clone();
        let host = self.host_name.clone();
        let task_host = host.clone();

        tokio::task::spawn_blocking(move || {
            let guard = session.lock();
            op(&guard, &task_host)
        })
        .await
        .map_err(|e| ConvergeError::Ssh {
            host,
            message: format!("SSH task failed: {}", e),
            suggestion: None,
        })?
    }
}

fn channel_error(host: &str, what: &str, e: impl std::fmt::Display) -> ConvergeError {
    let message = e.to_string();
    let timed_out = message.to_lowercase().contains("timed out") || message.contains("timeout");
    ConvergeError::Ssh {
        host: host.to_string(),
        message: format!("{}: {}", what, message),
        suggestion: timed_out.then(|| "Raise command_timeout or check the remote command".to_string()),
    }
}

#[async_trait]
impl Connection for SshConnection {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, ConvergeError> {
        let cmd = cmd.to_string();
        self.blocking(move |session, host| {
            let mut channel = session
                .channel_session()
                .map_err(|e| channel_error(host, "Failed to open channel", e))?;
            channel
                .exec(&cmd)
                .map_err(|e| channel_error(host, "Failed to execute command", e))?;

            let mut stdout = String::new();
            let mut stderr = String::new();
            channel
                .read_to_string(&mut stdout)
                .map_err(|e| channel_error(host, "Failed to read stdout", e))?;
            if let Err(e) = channel.stderr().read_to_string(&mut stderr) {
                warn!(host, error = %e, "failed to read stderr");
            }

            channel
                .wait_close()
                .map_err(|e| channel_error(host, "Failed to close channel", e))?;
            let exit_code = channel.exit_status().unwrap_or(-1);

            Ok(CommandResult {
                stdout,
                stderr,
                exit_code,
            })
        })
        .await
    }

    async fn read_file(&self, path: &str) -> Result<String, ConvergeError> {
        let path = path.to_string();
        self.blocking(move |session, host| {
            let sftp = session
                .sftp()
                .map_err(|e| channel_error(host, "Failed to open SFTP", e))?;
            let mut file = sftp.open(Path::new(&path)).map_err(|e| ConvergeError::Io {
                message: format!("Failed to open remote file: {}", e),
                path: Some(PathBuf::from(&path)),
            })?;

            let mut content = Vec::new();
            file.read_to_end(&mut content)
                .map_err(|e| channel_error(host, "Failed to read remote file", e))?;

            String::from_utf8(content).map_err(|e| ConvergeError::Io {
                message: format!("File is not valid UTF-8: {}", e),
                path: Some(PathBuf::from(&path)),
            })
        })
        .await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), ConvergeError> {
        let path = path.to_string();
        let content = content.as_bytes().to_vec();
        self.blocking(move |session, host| {
            let sftp = session
                .sftp()
                .map_err(|e| channel_error(host, "Failed to open SFTP", e))?;
            let mut file = sftp.create(Path::new(&path)).map_err(|e| ConvergeError::Io {
                message: format!("Failed to create remote file: {}", e),
                path: Some(PathBuf::from(&path)),
            })?;
            file.write_all(&content)
                .map_err(|e| channel_error(host, "Failed to write remote file", e))
        })
        .await
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }
}
