//! Capture a NAND snapshot of a device into the local backup store.

use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::Parser;

use bos_restore::channel::ssh::{Credentials, HostKeyPolicy, SshSession};
use bos_restore::error::exit_code_for;
use bos_restore::recovery::MANAGEMENT_PORT;
use bos_restore::{mode, platform, snapshot};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Hostname of the device to back up
    hostname: String,

    /// Directory where backups are kept
    #[clap(long, default_value = "backup")]
    output: PathBuf,

    /// Record only the partition table, skipping the raw dumps
    #[clap(long)]
    no_dumps: bool,

    /// Override the detected board identifier
    #[clap(long)]
    board: Option<String>,

    /// File with passwords to try, one per line
    #[clap(long)]
    passwords: Option<PathBuf>,

    /// Local directory with the utility binaries to stage onto the device
    /// before dumping (required on vendor firmwares that lack them)
    #[clap(long)]
    system_dir: Option<PathBuf>,
}

fn run(cli: &Cli) -> Result<()> {
    let creds = match &cli.passwords {
        Some(path) => Credentials::from_password_file(path)?,
        None => Credentials::default(),
    };

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
            println!(
                "Could not determine board name; assuming {}",
                platform::am1::BOARD_AM1_S9
            );
            platform::am1::BOARD_AM1_S9.to_string()
        }),
    };
    let policy = platform::for_board(&board);
    println!("Detected platform: {}", policy.name());
    println!("Detected mode: {}", mode::detect(&mut session)?);

    if let Some(system_dir) = &cli.system_dir {
        anyhow::ensure!(
            policy.prepare_system(&mut session, system_dir)?,
            "remote system preparation refused; not proceeding"
        );
    }

    let mac = snapshot::read_mac(&mut session)?;
    let dir = cli.output.join(snapshot::snapshot_dir_name(&mac));
    println!("Processing backup into {}...", dir.display());

    let snapshot = policy.backup_firmware(&mut session, &dir, !cli.no_dumps)?;
    println!("Backup stored in {}", snapshot.dir.display());
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let code = match run(&cli) {
        Ok(()) => 0,
        Err(error) => {
            howudoin::disable();
            eprintln!("Backup failed: {error:#}");
            exit_code_for(&error)
        }
    };
    howudoin::disable();
    process::exit(code);
}
