//! Restore a device's NAND firmware from a local snapshot and/or a factory
//! image, driving it through a recovery-mode reboot when necessary.

use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use retry::{delay::Fixed, retry};

use bos_restore::channel::ssh::{Credentials, HostKeyPolicy, SshSession};
use bos_restore::channel::Channel;
use bos_restore::error::exit_code_for;
use bos_restore::platform::{self, am1};
use bos_restore::recovery::{self, RebootWait, MANAGEMENT_PORT};
use bos_restore::snapshot::{self, Snapshot};
use bos_restore::mode;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Path to a snapshot directory, or 'none' to restore without a backup
    /// (the newest local backup for the device is used when it exists)
    backup: String,

    /// Hostname of the device to restore
    hostname: String,

    /// Local filesystem path to an original vendor firmware image to flash
    /// instead of the NAND dumps (must be on the platform's whitelist; URLs
    /// are not fetched)
    #[clap(long)]
    factory_image: Option<PathBuf>,

    /// Directory where backups are kept
    #[clap(long, default_value = "backup")]
    backup_root: PathBuf,

    /// Override the detected board identifier
    #[clap(long)]
    board: Option<String>,

    /// File with passwords to try, one per line
    #[clap(long)]
    passwords: Option<PathBuf>,

    /// Seconds to wait after requesting the recovery reboot before polling
    #[clap(long, default_value_t = 3)]
    pre_delay: u64,

    /// Seconds to wait after the device becomes reachable again
    #[clap(long, default_value_t = 8)]
    post_delay: u64,

    /// Give up after this many reachability polls (default: poll until
    /// interrupted; aborting a migration mid-way can leave the device
    /// unbootable, so only set this when you know the hardware's timing)
    #[clap(long)]
    max_polls: Option<u32>,
}

fn load_credentials(path: Option<&Path>) -> Result<Credentials> {
    match path {
        Some(path) => Credentials::from_password_file(path),
        None => Ok(Credentials::default()),
    }
}

fn reconnect(host: &str, creds: &Credentials, policy: HostKeyPolicy) -> Result<SshSession> {
    retry(Fixed::from_millis(2000).take(5), || {
        SshSession::connect(host, MANAGEMENT_PORT, creds, policy, None)
    })
    .map_err(|e| e.error)
}

fn run(cli: &Cli) -> Result<()> {
    let creds = load_credentials(cli.passwords.as_deref())?;

    println!("Connecting to remote host...");
    let mut session = SshSession::connect(
        &cli.hostname,
        MANAGEMENT_PORT,
        &creds,
        HostKeyPolicy::Pinned,
        None,
    )?;

    let board = match &cli.board {
        Some(board) => board.clone(),
        None => platform::detect_board(&mut session)?.unwrap_or_else(|| {
            println!("Could not determine board name; assuming {}", am1::BOARD_AM1_S9);
            am1::BOARD_AM1_S9.to_string()
        }),
    };
    let policy = platform::for_board(&board);
    println!("Detected platform: {}", policy.name());

    let initial_mode = mode::detect(&mut session)?;
    println!("Detected mode: {initial_mode}");

    let snapshot = locate_snapshot(cli, &mut session)?;
    let table = match &snapshot {
        Some(snapshot) => snapshot.table.clone(),
        None => {
            anyhow::ensure!(
                cli.factory_image.is_some(),
                "no backup found for this device and no factory image given"
            );
            policy.factory_mtdparts()?
        }
    };
    println!("Target partition table: {table}");

    // Hard stop on an unknown image before the device is disturbed at all
    if let Some(image) = &cli.factory_image {
        let digest = policy.check_factory_image(image)?;
        println!("Factory image accepted ({digest})");
    }

    let wait = RebootWait {
        pre_delay: Duration::from_secs(cli.pre_delay),
        post_delay: Duration::from_secs(cli.post_delay),
        max_polls: cli.max_polls,
        ..RebootWait::default()
    };
    let host = cli.hostname.clone();
    let (mut session, current_mode) = recovery::enter_recovery(
        session,
        initial_mode,
        &table,
        || {
            println!("Rebooting...");
            recovery::wait_for_port(&host, MANAGEMENT_PORT, &wait)
        },
        |key_policy| reconnect(&cli.hostname, &creds, key_policy),
    )?;

    policy.restore_firmware(
        &mut session,
        current_mode,
        snapshot.as_ref(),
        cli.factory_image.as_deref(),
    )?;

    recovery::finalize(&mut session, initial_mode)?;
    println!("Restore was successful!");
    Ok(())
}

/// Resolve the snapshot to restore from: an explicit directory, the newest
/// local backup for the device's MAC, or nothing at all.
fn locate_snapshot(cli: &Cli, session: &mut dyn Channel) -> Result<Option<Snapshot>> {
    if cli.backup != "none" {
        return Ok(Some(Snapshot::open(Path::new(&cli.backup))?));
    }
    let mac = snapshot::read_mac(session)?;
    match snapshot::find_latest(&cli.backup_root, &mac)? {
        Some(dir) => {
            println!("Found backup: {}", dir.display());
            Ok(Some(Snapshot::open(&dir)?))
        }
        None => Ok(None),
    }
}

fn main() {
    let cli = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let code = match run(&cli) {
        Ok(()) => 0,
        Err(error) => {
            howudoin::disable();
            eprintln!("Restore failed: {error:#}");
            exit_code_for(&error)
        }
    };
    howudoin::disable();
    process::exit(code);
}
