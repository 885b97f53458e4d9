//! Abstraction over the remote command channel.
//!
//! Everything the pipeline does to a device goes through [`Channel`]: running
//! a command, streaming bytes to or from a remote process, and uploading
//! files. The real implementation is an SSH session ([`ssh::SshSession`]);
//! [`SimChannel`] is a scripted stand-in for testing the pipeline without a
//! device.

use std::io::{Read, Write};
use std::path::Path;

use anyhow::Result;
use thiserror::Error;

use crate::error::ToolError;

pub mod ssh;

/// A remote command failed with a nonzero exit status.
#[derive(Error, Debug)]
#[error("remote command '{command}' failed with status {status}: {stderr}")]
pub struct CommandError {
    pub command: String,
    pub status: i32,
    pub stderr: String,
}

/// Captured output of a finished remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// First line of stdout, trimmed.
    pub fn first_line(&self) -> Option<String> {
        self.stdout_text()
            .lines()
            .next()
            .map(|line| line.trim().to_string())
    }
}

/// One in-flight command at a time over one authenticated session; the
/// pipeline is strictly sequential, so no interior locking is needed.
pub trait Channel {
    /// Run a command and capture its output. A nonzero exit status is *not*
    /// an error here; only transport failures are.
    fn exec(&mut self, argv: &[&str]) -> Result<ExecOutput>;

    /// Run a command, streaming its stdout into `sink`. Returns the number of
    /// bytes copied; a nonzero exit status is an error.
    fn read_from(&mut self, argv: &[&str], sink: &mut dyn Write) -> Result<u64>;

    /// Run a command, streaming `source` into its stdin. Returns the number
    /// of bytes copied; a nonzero exit status is an error.
    fn write_to(&mut self, argv: &[&str], source: &mut dyn Read) -> Result<u64>;

    /// Upload a local file to the remote path.
    fn put(&mut self, local: &Path, remote: &str) -> Result<()>;

    /// Run a command and fail with [`CommandError`] on nonzero exit.
    fn run(&mut self, argv: &[&str]) -> Result<ExecOutput> {
        let output = self.exec(argv)?;
        if !output.success() {
            return Err(CommandError {
                command: argv.join(" "),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }
        Ok(output)
    }
}

/// A scripted fake channel.
///
/// Commands are matched by their joined argv; anything unscripted succeeds
/// with empty output, so tests only script the commands they care about.
/// Every invocation is appended to `history`, and bytes streamed via
/// [`Channel::write_to`] are captured in `writes`.
#[derive(Debug, Default)]
pub struct SimChannel {
    responses: Vec<(String, ExecOutput)>,
    /// When set, every operation fails as unreachable.
    pub unreachable: bool,
    pub history: Vec<String>,
    pub writes: Vec<(String, Vec<u8>)>,
    pub uploads: Vec<(String, String)>,
}

impl SimChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a successful command with the given stdout.
    pub fn on(&mut self, command: &str, stdout: &str) -> &mut Self {
        self.responses.push((
            command.to_string(),
            ExecOutput {
                status: 0,
                stdout: stdout.as_bytes().to_vec(),
                stderr: Vec::new(),
            },
        ));
        self
    }

    /// Script a failing command.
    pub fn on_fail(&mut self, command: &str, status: i32, stderr: &str) -> &mut Self {
        self.responses.push((
            command.to_string(),
            ExecOutput {
                status,
                stdout: Vec::new(),
                stderr: stderr.as_bytes().to_vec(),
            },
        ));
        self
    }

    /// How many times a command was invoked (by exact joined argv).
    pub fn count(&self, command: &str) -> usize {
        self.history.iter().filter(|c| c.as_str() == command).count()
    }

    fn lookup(&mut self, argv: &[&str]) -> Result<ExecOutput> {
        if self.unreachable {
            return Err(ToolError::Connection("host unreachable".into()).into());
        }
        let command = argv.join(" ");
        self.history.push(command.clone());
        let output = self
            .responses
            .iter()
            .find(|(c, _)| *c == command)
            .map(|(_, o)| o.clone())
            .unwrap_or_default();
        Ok(output)
    }
}

impl Channel for SimChannel {
    fn exec(&mut self, argv: &[&str]) -> Result<ExecOutput> {
        self.lookup(argv)
    }

    fn read_from(&mut self, argv: &[&str], sink: &mut dyn Write) -> Result<u64> {
        let output = self.lookup(argv)?;
        if !output.success() {
            return Err(CommandError {
                command: argv.join(" "),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }
        sink.write_all(&output.stdout)?;
        Ok(output.stdout.len() as u64)
    }

    fn write_to(&mut self, argv: &[&str], source: &mut dyn Read) -> Result<u64> {
        let output = self.lookup(argv)?;
        let mut data = Vec::new();
        source.read_to_end(&mut data)?;
        let len = data.len() as u64;
        self.writes.push((argv.join(" "), data));
        if !output.success() {
            return Err(CommandError {
                command: argv.join(" "),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }
        Ok(len)
    }

    fn put(&mut self, local: &Path, remote: &str) -> Result<()> {
        if self.unreachable {
            return Err(ToolError::Connection("host unreachable".into()).into());
        }
        self.uploads
            .push((local.display().to_string(), remote.to_string()));
        Ok(())
    }
}

#[test]
fn test_sim_scripted_and_default() {
    let mut sim = SimChannel::new();
    sim.on("cat /etc/bos_mode", "nand\n");
    sim.on_fail("test ! -e /lib/x", 1, "");

    let out = sim.exec(&["cat", "/etc/bos_mode"]).unwrap();
    assert_eq!(out.first_line().as_deref(), Some("nand"));

    assert!(!sim.exec(&["test", "!", "-e", "/lib/x"]).unwrap().success());

    // Unscripted commands succeed with empty output
    assert!(sim.exec(&["sync"]).unwrap().success());
    assert_eq!(sim.count("sync"), 1);
}

#[test]
fn test_sim_run_raises_command_error() {
    let mut sim = SimChannel::new();
    sim.on_fail("mtd erase boot", 1, "permission denied");
    let err = sim.run(&["mtd", "erase", "boot"]).unwrap_err();
    assert!(err.downcast_ref::<CommandError>().is_some());
}

#[test]
fn test_sim_unreachable() {
    let mut sim = SimChannel::new();
    sim.unreachable = true;
    let err = sim.exec(&["true"]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ToolError>(),
        Some(ToolError::Connection(_))
    ));
}

#[test]
fn test_sim_captures_writes() {
    let mut sim = SimChannel::new();
    sim.write_to(&["mtd", "write", "-", "rootfs"], &mut &b"imagedata"[..])
        .unwrap();
    assert_eq!(sim.writes.len(), 1);
    assert_eq!(sim.writes[0].1, b"imagedata");
}
