//! Command channel implementation over an SSH session (libssh2).

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ssh2::{CheckResult, KnownHostFileKind, Session};

use super::{Channel, CommandError, ExecOutput};
use crate::error::ToolError;

/// How the session treats the remote host key.
///
/// Recovery mode presents a different host key for the same MAC, so the
/// driver must explicitly opt out of pinning when reconnecting after a
/// mode-switching reboot; trusting stale keys there would give a false
/// assurance of identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Trust-on-first-use against `~/.ssh/known_hosts`; a changed key for a
    /// known host is a hard failure.
    Pinned,
    /// Do not consult or record known host keys.
    IgnoreKnownHosts,
}

/// Login material for the target device. The username is fixed by the
/// firmware; the password list comes from the operator, with a small
/// default-guess list for unconfigured devices.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub passwords: Vec<String>,
    /// Passwords bound to a single host, tried before the general list but
    /// only against that host.
    pub scoped: Vec<(String, String)>,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            passwords: vec![String::new(), "admin".to_string(), "123".to_string()],
            scoped: Vec::new(),
        }
    }
}

impl Credentials {
    /// Default credentials with extra passwords tried first.
    pub fn with_passwords(passwords: &[String]) -> Self {
        let mut creds = Self::default();
        let mut all = passwords.to_vec();
        all.append(&mut creds.passwords);
        creds.passwords = all;
        creds
    }

    /// Load an operator-supplied password list, one `[host:]password` per
    /// line, prepended to the default guesses. A `host:` prefix restricts
    /// that entry to the named host.
    pub fn from_password_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut general = Vec::new();
        let mut scoped = Vec::new();
        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match line.split_once(':') {
                Some((host, password)) => {
                    scoped.push((host.to_string(), password.to_string()));
                }
                None => general.push(line.to_string()),
            }
        }
        let mut creds = Self::with_passwords(&general);
        creds.scoped = scoped;
        Ok(creds)
    }

    /// The passwords to try against `host`, scoped entries first.
    pub fn passwords_for(&self, host: &str) -> Vec<&str> {
        self.scoped
            .iter()
            .filter(|(scope, _)| scope == host)
            .map(|(_, password)| password.as_str())
            .chain(self.passwords.iter().map(String::as_str))
            .collect()
    }
}

/// An authenticated SSH session to one device.
pub struct SshSession {
    session: Session,
    host: String,
}

impl SshSession {
    /// Connect, verify the host key per `policy`, and authenticate.
    ///
    /// `connect_timeout` bounds the TCP connect only; pass it for scanning
    /// use where an unreachable host must not stall the caller.
    pub fn connect(
        host: &str,
        port: u16,
        creds: &Credentials,
        policy: HostKeyPolicy,
        connect_timeout: Option<Duration>,
    ) -> Result<Self> {
        let stream = tcp_connect(host, port, connect_timeout)?;

        let mut session = Session::new().map_err(|e| connection_error(host, &e))?;
        session.set_tcp_stream(stream);
        session
            .handshake()
            .map_err(|e| connection_error(host, &e))?;

        if policy == HostKeyPolicy::Pinned {
            check_host_key(&session, host, port)?;
        }

        let mut authenticated = false;
        for password in creds.passwords_for(host) {
            if session
                .userauth_password(&creds.username, password)
                .is_ok()
            {
                authenticated = true;
                break;
            }
        }
        if !authenticated {
            return Err(ToolError::Connection(format!(
                "{host}: authentication failed for user '{}'",
                creds.username
            ))
            .into());
        }

        Ok(Self {
            session,
            host: host.to_string(),
        })
    }

    /// Bound every blocking libssh2 operation. Zero disables the bound.
    pub fn set_command_timeout(&self, timeout: Duration) {
        self.session.set_timeout(timeout.as_millis() as u32);
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn channel(&mut self, argv: &[&str]) -> Result<(ssh2::Channel, String)> {
        let command = shell_join(argv);
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| connection_error(&self.host, &e))?;
        channel
            .exec(&command)
            .map_err(|e| connection_error(&self.host, &e))?;
        Ok((channel, command))
    }
}

impl Channel for SshSession {
    fn exec(&mut self, argv: &[&str]) -> Result<ExecOutput> {
        let (mut channel, _) = self.channel(argv)?;

        let mut stdout = Vec::new();
        channel.read_to_end(&mut stdout)?;
        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr)?;

        channel.wait_close()?;
        let status = channel.exit_status()?;
        Ok(ExecOutput {
            status,
            stdout,
            stderr,
        })
    }

    fn read_from(&mut self, argv: &[&str], sink: &mut dyn Write) -> Result<u64> {
        let (mut channel, command) = self.channel(argv)?;

        let copied = io::copy(&mut channel, sink)?;
        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr)?;

        channel.wait_close()?;
        let status = channel.exit_status()?;
        if status != 0 {
            return Err(CommandError {
                command,
                status,
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            }
            .into());
        }
        Ok(copied)
    }

    fn write_to(&mut self, argv: &[&str], source: &mut dyn Read) -> Result<u64> {
        let (mut channel, command) = self.channel(argv)?;

        let copied = io::copy(source, &mut channel)?;
        channel.send_eof()?;
        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr)?;

        channel.wait_close()?;
        let status = channel.exit_status()?;
        if status != 0 {
            return Err(CommandError {
                command,
                status,
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            }
            .into());
        }
        Ok(copied)
    }

    fn put(&mut self, local: &Path, remote: &str) -> Result<()> {
        let mut file = std::fs::File::open(local)
            .with_context(|| format!("opening {}", local.display()))?;
        let size = file.metadata()?.len();
        let mut channel = self
            .session
            .scp_send(Path::new(remote), 0o644, size, None)
            .map_err(|e| connection_error(&self.host, &e))?;
        io::copy(&mut file, &mut channel)?;
        channel.send_eof()?;
        channel.wait_eof()?;
        channel.wait_close()?;
        Ok(())
    }
}

fn tcp_connect(host: &str, port: u16, timeout: Option<Duration>) -> Result<TcpStream> {
    match timeout {
        None => TcpStream::connect((host, port))
            .map_err(|e| connection_error(host, &e).into()),
        Some(timeout) => {
            let addr = (host, port)
                .to_socket_addrs()
                .map_err(|e| connection_error(host, &e))?
                .next()
                .ok_or_else(|| {
                    ToolError::Connection(format!("{host}: no address resolved"))
                })?;
            TcpStream::connect_timeout(&addr, timeout)
                .map_err(|e| connection_error(host, &e).into())
        }
    }
}

/// Trust-on-first-use verification against `~/.ssh/known_hosts`.
fn check_host_key(session: &Session, host: &str, port: u16) -> Result<()> {
    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| connection_error(host, &e))?;

    let file = known_hosts_file();
    if let Some(file) = &file {
        if file.is_file() {
            known_hosts.read_file(file, KnownHostFileKind::OpenSSH)?;
        }
    }

    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| ToolError::Connection(format!("{host}: no host key presented")))?;

    match known_hosts.check_port(host, port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(ToolError::Connection(format!(
            "{host}: host key changed; not proceeding with pinned keys"
        ))
        .into()),
        CheckResult::NotFound | CheckResult::Failure => {
            known_hosts.add(host, key, "", key_type.into())?;
            if let Some(file) = &file {
                if let Some(parent) = file.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                known_hosts.write_file(file, KnownHostFileKind::OpenSSH)?;
            }
            Ok(())
        }
    }
}

fn known_hosts_file() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ssh").join("known_hosts"))
}

fn connection_error(host: &str, error: &dyn std::fmt::Display) -> ToolError {
    ToolError::Connection(format!("{host}: {error}"))
}

/// Join an argv into one shell command line, single-quoting anything the
/// remote shell would otherwise interpret (mtdparts descriptors contain
/// parentheses).
fn shell_join(argv: &[&str]) -> String {
    argv.iter()
        .map(|arg| {
            let safe = !arg.is_empty()
                && arg
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b"_-./:=+,@!".contains(&b));
            if safe {
                (*arg).to_string()
            } else {
                format!("'{}'", arg.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[test]
fn test_password_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("passwords");
    std::fs::write(&path, "hunter2\n10.33.0.7:per-host-secret\n\n").unwrap();
    let creds = Credentials::from_password_file(&path).unwrap();
    assert_eq!(creds.username, "root");
    assert_eq!(creds.passwords, vec!["hunter2", "", "admin", "123"]);
    assert_eq!(
        creds.scoped,
        vec![("10.33.0.7".to_string(), "per-host-secret".to_string())]
    );
}

#[test]
fn test_host_scoped_passwords() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("passwords");
    std::fs::write(&path, "hunter2\n10.33.0.7:per-host-secret\n").unwrap();
    let creds = Credentials::from_password_file(&path).unwrap();

    // The scoped entry is tried first on its own host, never elsewhere
    assert_eq!(
        creds.passwords_for("10.33.0.7"),
        vec!["per-host-secret", "hunter2", "", "admin", "123"]
    );
    assert_eq!(
        creds.passwords_for("10.33.0.8"),
        vec!["hunter2", "", "admin", "123"]
    );
}

#[test]
fn test_shell_join() {
    assert_eq!(shell_join(&["cat", "/proc/mtd"]), "cat /proc/mtd");
    assert_eq!(
        shell_join(&["fw_setenv", "recovery_mtdparts", "mtdparts=pl35x-nand:32m(boot)"]),
        "fw_setenv recovery_mtdparts 'mtdparts=pl35x-nand:32m(boot)'"
    );
    assert_eq!(shell_join(&["echo", "it's"]), r"echo 'it'\''s'");
    assert_eq!(shell_join(&["echo", ""]), "echo ''");
}
