//! Scan a set of hosts or subnets for supported devices.
//!
//! Absence of a response is the common case when sweeping a subnet, so
//! per-host failures are swallowed without a word; every probe is bounded by
//! short timeouts so one dead host cannot stall the pool.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use bos_restore::channel::ssh::{Credentials, HostKeyPolicy, SshSession};
use bos_restore::channel::Channel;
use bos_restore::recovery::MANAGEMENT_PORT;
use bos_restore::{mode, platform, snapshot};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Hostnames or IPv4 subnets (a.b.c.d/len) to scan
    #[clap(required = true)]
    hosts: Vec<String>,

    /// File with passwords to try, one per line
    #[clap(long)]
    passwords: Option<PathBuf>,

    /// Number of concurrent scan jobs
    #[clap(short, long, default_value_t = 50)]
    jobs: usize,
}

/// Expand subnet arguments into individual addresses; anything that does not
/// parse as `a.b.c.d/len` is taken as a literal hostname.
fn expand_hosts(args: &[String]) -> Vec<String> {
    let mut hosts = Vec::new();
    for arg in args {
        match parse_cidr(arg) {
            Some((network, prefix_len)) => {
                let base = u32::from(network);
                let span = 1u64 << (32 - prefix_len);
                // Skip the network and broadcast addresses of real subnets
                let (first, last) = if prefix_len >= 31 {
                    (0, span)
                } else {
                    (1, span - 1)
                };
                for offset in first..last {
                    hosts.push(Ipv4Addr::from(base + offset as u32).to_string());
                }
            }
            None => hosts.push(arg.clone()),
        }
    }
    hosts
}

fn parse_cidr(arg: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, len) = arg.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let len: u8 = len.parse().ok()?;
    if len > 32 {
        return None;
    }
    // Normalize to the network address
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    Some((Ipv4Addr::from(u32::from(addr) & mask), len))
}

/// Probe one host; `None` for anything that is not a reachable, supported
/// device.
fn probe(host: &str, creds: &Credentials) -> Option<String> {
    let mut session = SshSession::connect(
        host,
        MANAGEMENT_PORT,
        creds,
        HostKeyPolicy::IgnoreKnownHosts,
        Some(CONNECT_TIMEOUT),
    )
    .ok()?;
    session.set_command_timeout(COMMAND_TIMEOUT);

    let board = platform::detect_board(&mut session).ok()??;
    let mac = snapshot::read_mac(&mut session).ok()?;
    let boot_mode = mode::detect(&mut session).ok()?;
    let version = session
        .exec(&["cat", "/etc/bos_version"])
        .ok()
        .and_then(|out| out.first_line())
        .filter(|line| !line.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    Some(format!("{mac} ({host}) | {board} {version} [{boot_mode}]"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let creds = match &cli.passwords {
        Some(path) => Credentials::from_password_file(path)?,
        None => Credentials::default(),
    };

    let hosts = expand_hosts(&cli.hosts);
    let queue = Arc::new(Mutex::new(hosts.into_iter()));

    let workers: Vec<_> = (0..cli.jobs.max(1))
        .map(|_| {
            let queue = Arc::clone(&queue);
            let creds = creds.clone();
            thread::spawn(move || loop {
                let host = match queue.lock().unwrap().next() {
                    Some(host) => host,
                    None => break,
                };
                if let Some(line) = probe(&host, &creds) {
                    println!("{line}");
                }
            })
        })
        .collect();

    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

#[test]
fn test_expand_hosts() {
    let hosts = expand_hosts(&["10.0.0.0/30".to_string(), "miner-7".to_string()]);
    assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2", "miner-7"]);

    // /31 and /32 have no network/broadcast to skip
    assert_eq!(expand_hosts(&["10.0.0.4/31".to_string()]).len(), 2);
    assert_eq!(expand_hosts(&["10.0.0.4/32".to_string()]), vec!["10.0.0.4"]);
}

#[test]
fn test_parse_cidr_normalizes() {
    assert_eq!(
        parse_cidr("192.168.1.77/24"),
        Some((Ipv4Addr::new(192, 168, 1, 0), 24))
    );
    assert_eq!(parse_cidr("not-a-subnet"), None);
    assert_eq!(parse_cidr("10.0.0.1/33"), None);
}
