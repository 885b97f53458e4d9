//! Local snapshot store for NAND backups.
//!
//! A snapshot is a directory named `<colon-free-mac>-<YYYY-MM-DD>` holding an
//! optional raw dump per partition (`mtdN.bin`) and the mandatory environment
//! descriptor `uEnv.txt`. The descriptor is the sole authoritative contract
//! read back by restore; it is written only after every per-partition
//! operation has completed, so its absence is a strict signal of a partial or
//! failed backup.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::channel::Channel;
use crate::error::ToolError;
use crate::mode::BootMode;
use crate::mtdparts::{PartitionTable, NAND_CONTROLLER};
use crate::uenv::{self, UEnv};

const NANDDUMP: &str = "/usr/sbin/nanddump";
const MAC_PATH: &str = "/sys/class/net/eth0/address";

/// A captured (or loaded) snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub dir: PathBuf,
    pub mac: Option<String>,
    pub table: PartitionTable,
}

impl Snapshot {
    /// Load a snapshot directory, rejecting it when the environment
    /// descriptor is missing or lacks the partition table.
    pub fn open(dir: &Path) -> Result<Self> {
        let env = UEnv::read_dir(dir)?;
        let descriptor = env.get(uenv::KEY_RECOVERY_MTDPARTS).ok_or_else(|| {
            ToolError::Format(format!(
                "snapshot '{}' has no {} entry",
                dir.display(),
                uenv::KEY_RECOVERY_MTDPARTS
            ))
        })?;
        let table = PartitionTable::parse(descriptor)?;
        let mac = env.get(uenv::KEY_ETHADDR).map(str::to_string);
        Ok(Self {
            dir: dir.to_path_buf(),
            mac,
            table,
        })
    }

    /// Path of the raw dump for one partition, if it was captured.
    pub fn dump_path(&self, device_id: &str) -> Option<PathBuf> {
        let path = self.dir.join(format!("{device_id}.bin"));
        path.is_file().then_some(path)
    }
}

/// Read the device MAC address over the channel.
pub fn read_mac(session: &mut dyn Channel) -> Result<String> {
    let output = session.run(&["cat", MAC_PATH])?;
    output
        .first_line()
        .filter(|line| !line.is_empty())
        .map(|line| line.to_lowercase())
        .context("device reported no MAC address")
}

/// Directory name for a new snapshot of the given MAC, stamped with today's
/// date.
pub fn snapshot_dir_name(mac: &str) -> String {
    format!(
        "{}-{}",
        mac.replace(':', "").to_lowercase(),
        chrono::Local::now().format("%Y-%m-%d")
    )
}

/// Find the most recent snapshot directory for a MAC under `root`.
pub fn find_latest(root: &Path, mac: &str) -> Result<Option<PathBuf>> {
    let prefix = format!("{}-", mac.replace(':', "").to_lowercase());
    if !root.is_dir() {
        return Ok(None);
    }
    let mut candidates: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_dir()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with(&prefix))
        })
        .collect();
    // Date-stamped names sort chronologically
    candidates.sort();
    Ok(candidates.pop())
}

/// Parse the kernel's MTD registry listing (`/proc/mtd`): one header line,
/// then `mtdN: <size-hex> <erasesize-hex> "<label>"` per partition.
pub fn parse_proc_mtd(text: &str) -> Result<Vec<(String, u64, String)>> {
    let mut entries = Vec::new();
    for line in text.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        anyhow::ensure!(fields.len() == 4, "unexpected /proc/mtd line: '{line}'");
        let device_id = fields[0].trim_end_matches(':').to_string();
        let size = u64::from_str_radix(fields[1], 16)
            .with_context(|| format!("bad size in /proc/mtd line: '{line}'"))?;
        let label = fields[3].trim_matches('"').to_string();
        entries.push((device_id, size, label));
    }
    Ok(entries)
}

/// Capture a snapshot of the device into `dir` (created if missing).
///
/// The live partition list comes from `/proc/mtd`; active partitions can be
/// read-dumped without erasing, so this works in any boot mode. Raw dumps are
/// optional evidence; the descriptor is mandatory and written strictly last.
pub fn capture(
    session: &mut dyn Channel,
    dir: &Path,
    include_dumps: bool,
) -> Result<Snapshot> {
    let mac = read_mac(session)?;
    let dir = dir.to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let listing = session.run(&["cat", "/proc/mtd"])?;
    let partitions = parse_proc_mtd(&listing.stdout_text())?;

    let rpt = howudoin::new()
        .label("Backing up NAND partitions")
        .set_len(u64::try_from(partitions.len()).ok());

    let mut table = PartitionTable::new(NAND_CONTROLLER);
    for (device_id, size, label) in &partitions {
        rpt.desc(format!("{device_id} ({label})"));
        rpt.inc();
        if include_dumps {
            println!("Backup {device_id} ({label})");
            let dump_path = dir.join(format!("{device_id}.bin"));
            let mut dump = File::create(&dump_path)
                .with_context(|| format!("creating {}", dump_path.display()))?;
            let device = format!("/dev/{device_id}");
            session.read_from(&[NANDDUMP, &device], &mut dump)?;
            // Dumps must hit stable storage before the descriptor exists
            dump.sync_all()?;
        }
        table.push(*size, label);
    }
    rpt.finish();

    let mut env = UEnv::new();
    env.set(uenv::KEY_RECOVERY, "yes");
    env.set(uenv::KEY_RECOVERY_MTDPARTS, &table.to_string());
    env.set(uenv::KEY_ETHADDR, &mac);
    env.write_dir(&dir)?;

    Ok(Snapshot {
        dir,
        mac: Some(mac),
        table,
    })
}

/// Erase one NAND partition by label.
pub fn mtd_erase(session: &mut dyn Channel, label: &str) -> Result<()> {
    println!("Erasing NAND partition '{label}'...");
    session
        .run(&["mtd", "erase", label])
        .map_err(|e| write_error(label, &e))?;
    Ok(())
}

/// Erase-and-write one partition from a local dump file.
pub fn mtd_write(session: &mut dyn Channel, label: &str, dump: &Path) -> Result<()> {
    println!("Writing {} to NAND partition '{label}'...", dump.display());
    let mut file =
        File::open(dump).with_context(|| format!("opening {}", dump.display()))?;
    session
        .write_to(&["mtd", "-e", label, "write", "-", label], &mut file)
        .map_err(|e| write_error(label, &e))?;
    Ok(())
}

/// Replay a snapshot's dumps onto the device, in table order.
///
/// Entries without a local dump are skipped with a warning (factory-image
/// restores supply only some partitions). Any failed write aborts the whole
/// restore; there is no per-partition rollback.
pub fn restore(
    session: &mut dyn Channel,
    snapshot: &Snapshot,
    mode: BootMode,
) -> Result<()> {
    // The safety invariant of the whole subsystem: never write partitions
    // while the device runs from NAND.
    if mode == BootMode::Nand {
        return Err(ToolError::ModeTransition.into());
    }

    let rpt = howudoin::new()
        .label("Restoring NAND partitions")
        .set_len(u64::try_from(snapshot.table.entries.len()).ok());

    for entry in &snapshot.table.entries {
        rpt.desc(entry.label.clone());
        rpt.inc();
        match snapshot.dump_path(&entry.device_id) {
            Some(dump) => mtd_write(session, &entry.label, &dump)?,
            None => eprintln!(
                "Skipping '{}' ({}): no dump in backup",
                entry.label, entry.device_id
            ),
        }
    }
    rpt.finish();

    session.run(&["sync"])?;
    Ok(())
}

fn write_error(label: &str, error: &anyhow::Error) -> anyhow::Error {
    ToolError::Write {
        label: label.to_string(),
        reason: error.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SimChannel;

    const PROC_MTD: &str = "dev:    size   erasesize  name\n\
                            mtd0: 02000000 00020000 \"BOOT.bin-env-dts-kernel\"\n\
                            mtd1: 09000000 00020000 \"rootfs\"\n\
                            mtd2: 05000000 00020000 \"upgrade\"\n";

    fn scripted_device() -> SimChannel {
        let mut sim = SimChannel::new();
        sim.on("cat /sys/class/net/eth0/address", "00:1A:2B:3C:4D:5E\n");
        sim.on("cat /proc/mtd", PROC_MTD);
        sim.on("/usr/sbin/nanddump /dev/mtd0", "boot-data");
        sim.on("/usr/sbin/nanddump /dev/mtd1", "rootfs-data");
        sim.on("/usr/sbin/nanddump /dev/mtd2", "upgrade-data");
        sim
    }

    #[test]
    fn parse_proc_mtd_skips_header() {
        let entries = parse_proc_mtd(PROC_MTD).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0],
            ("mtd0".to_string(), 0x2000000, "BOOT.bin-env-dts-kernel".to_string())
        );
        assert_eq!(entries[2].2, "upgrade");
    }

    #[test]
    fn capture_writes_dumps_and_descriptor() {
        let root = tempfile::tempdir().unwrap();
        let mut sim = scripted_device();

        let snapshot = capture(&mut sim, root.path(), true).unwrap();
        assert_eq!(snapshot.mac.as_deref(), Some("00:1a:2b:3c:4d:5e"));
        assert!(snapshot.dir.join("uEnv.txt").is_file());
        for n in 0..3 {
            assert!(snapshot.dir.join(format!("mtd{n}.bin")).is_file());
        }
        assert_eq!(
            fs::read(snapshot.dir.join("mtd1.bin")).unwrap(),
            b"rootfs-data"
        );

        // The reloaded snapshot equals the captured one
        let reopened = Snapshot::open(&snapshot.dir).unwrap();
        assert_eq!(reopened.table, snapshot.table);
        assert_eq!(
            snapshot.table.to_string(),
            "mtdparts=pl35x-nand:32m(BOOT.bin-env-dts-kernel),144m(rootfs),80m(upgrade)"
        );
    }

    #[test]
    fn capture_without_dumps_writes_only_descriptor() {
        let root = tempfile::tempdir().unwrap();
        let mut sim = scripted_device();

        let snapshot = capture(&mut sim, root.path(), false).unwrap();
        let files: Vec<_> = fs::read_dir(&snapshot.dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files, vec!["uEnv.txt"]);
    }

    #[test]
    fn failed_dump_leaves_no_descriptor() {
        let root = tempfile::tempdir().unwrap();
        let mut sim = SimChannel::new();
        sim.on("cat /sys/class/net/eth0/address", "00:1a:2b:3c:4d:5e\n");
        sim.on("cat /proc/mtd", PROC_MTD);
        sim.on("/usr/sbin/nanddump /dev/mtd0", "boot-data");
        sim.on_fail("/usr/sbin/nanddump /dev/mtd1", 1, "I/O error");

        assert!(capture(&mut sim, root.path(), true).is_err());
        assert!(!root.path().join("uEnv.txt").exists());
        assert!(Snapshot::open(root.path()).is_err());
    }

    #[test]
    fn open_rejects_missing_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        // Raw dumps alone do not make a snapshot
        fs::write(dir.path().join("mtd0.bin"), b"x").unwrap();
        let err = Snapshot::open(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ToolError>(),
            Some(ToolError::Format(_))
        ));
    }

    #[test]
    fn restore_refuses_nand_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = UEnv::new();
        env.set(uenv::KEY_RECOVERY, "yes");
        env.set(
            uenv::KEY_RECOVERY_MTDPARTS,
            "mtdparts=pl35x-nand:32m(boot)",
        );
        env.write_dir(dir.path()).unwrap();
        fs::write(dir.path().join("mtd0.bin"), b"x").unwrap();
        let snapshot = Snapshot::open(dir.path()).unwrap();

        let mut sim = SimChannel::new();
        let err = restore(&mut sim, &snapshot, BootMode::Nand).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ToolError>(),
            Some(ToolError::ModeTransition)
        ));
        assert!(sim.writes.is_empty());
    }

    #[test]
    fn restore_writes_in_order_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = UEnv::new();
        env.set(
            uenv::KEY_RECOVERY_MTDPARTS,
            "mtdparts=pl35x-nand:32m(boot),144m(rootfs),80m(upgrade)",
        );
        env.write_dir(dir.path()).unwrap();
        fs::write(dir.path().join("mtd0.bin"), b"bootdata").unwrap();
        fs::write(dir.path().join("mtd2.bin"), b"upgradedata").unwrap();
        let snapshot = Snapshot::open(dir.path()).unwrap();

        let mut sim = SimChannel::new();
        restore(&mut sim, &snapshot, BootMode::Recovery).unwrap();

        let commands: Vec<&str> = sim.writes.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(
            commands,
            vec![
                "mtd -e boot write - boot",
                "mtd -e upgrade write - upgrade",
            ]
        );
        assert_eq!(sim.writes[0].1, b"bootdata");
    }

    #[test]
    fn restore_write_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = UEnv::new();
        env.set(
            uenv::KEY_RECOVERY_MTDPARTS,
            "mtdparts=pl35x-nand:32m(boot),144m(rootfs)",
        );
        env.write_dir(dir.path()).unwrap();
        fs::write(dir.path().join("mtd0.bin"), b"bootdata").unwrap();
        fs::write(dir.path().join("mtd1.bin"), b"rootfsdata").unwrap();
        let snapshot = Snapshot::open(dir.path()).unwrap();

        let mut sim = SimChannel::new();
        sim.on_fail("mtd -e boot write - boot", 1, "erase failed");
        let err = restore(&mut sim, &snapshot, BootMode::Sd).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ToolError>(),
            Some(ToolError::Write { .. })
        ));
        // The failed partition is the only one attempted
        assert_eq!(sim.writes.len(), 1);
    }

    #[test]
    fn find_latest_picks_newest() {
        let root = tempfile::tempdir().unwrap();
        for name in [
            "001a2b3c4d5e-2024-01-02",
            "001a2b3c4d5e-2024-03-15",
            "ffffffffffff-2024-12-31",
        ] {
            fs::create_dir(root.path().join(name)).unwrap();
        }
        let latest = find_latest(root.path(), "00:1A:2B:3C:4D:5E").unwrap();
        assert_eq!(
            latest.unwrap().file_name().unwrap(),
            "001a2b3c4d5e-2024-03-15"
        );
        assert!(find_latest(root.path(), "aa:bb:cc:dd:ee:ff")
            .unwrap()
            .is_none());
    }
}
