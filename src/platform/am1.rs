//! Policy for the AM1 family (AntMiner S9 class controllers).
//!
//! These boards run a vendor firmware that keeps `/tmp` on the NAND overlay
//! and lacks the utilities the partition operations need, so both backup and
//! preparation have extra steps the other families skip.

use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use super::PlatformPolicy;
use crate::channel::Channel;
use crate::error::ToolError;
use crate::mode::BootMode;
use crate::mtdparts::PartitionTable;
use crate::snapshot::{self, Snapshot};

pub const BOARD_AM1_S9: &str = "am1-s9";

/// Factory NAND layout of the S9 control board.
const FACTORY_MTDPARTS: &str =
    "mtdparts=pl35x-nand:32m(BOOT.bin-env-dts-kernel),144m(rootfs),80m(upgrade)";

/// MD5 digests of the original vendor images known to be safe to flash.
const SUPPORTED_IMAGES: &[&str] = &[
    "9974dd88b70cdaaa89a4dd55c25d5bc1",
    "5b07bd845685d81c092a3b0465f24ef1",
];

/// Utilities missing from the vendor firmware, and where they belong.
const STAGED_BINARIES: &[(&str, &str)] = &[
    ("ld-musl-armhf.so.1", "/lib"),
    ("sftp-server", "/usr/lib/openssh"),
    ("fw_printenv", "/usr/sbin"),
];

const TARGET_DIR: &str = "/tmp/bitmain_fw";
const CONFIG_TAR: &str = "config.tar.gz";
const RESTORE_SCRIPT: &str = "restore.sh";

/// Partitions wiped after a factory restore so no stale firmware survives.
const ERASED_AFTER_FACTORY: &[&str] =
    &["fpga1", "fpga2", "uboot_env", "firmware1", "firmware2"];

pub struct Am1;

impl Am1 {
    /// Flash an original vendor image: upload, unpack on the device, run the
    /// image's own restore script, then wipe the leftover partitions.
    fn restore_factory(
        &self,
        session: &mut dyn Channel,
        mode: BootMode,
        backup_dir: Option<&Path>,
        image: &Path,
    ) -> Result<()> {
        // Whitelist gate comes before anything touches the device
        let digest = self.check_factory_image(image)?;
        println!("Detected factory image with MD5 digest: {digest}");

        if mode == BootMode::Nand {
            return Err(ToolError::ModeTransition.into());
        }

        session.run(&["rm", "-fr", TARGET_DIR])?;
        session.run(&["mkdir", "-p", TARGET_DIR])?;

        println!("Uploading factory image...");
        let remote_image = format!("{TARGET_DIR}/factory.tar.gz");
        session.put(image, &remote_image)?;
        session.run(&["tar", "-xzf", &remote_image, "-C", TARGET_DIR])?;

        // Give the restore script the saved miner configuration, if we have it
        if let Some(dir) = backup_dir {
            let config = dir.join(CONFIG_TAR);
            if config.is_file() {
                println!("Uploading miner configuration...");
                session.put(&config, &format!("{TARGET_DIR}/{CONFIG_TAR}"))?;
            }
        }

        println!("Restoring factory firmware...");
        let script = format!("cd {TARGET_DIR} && /bin/sh {RESTORE_SCRIPT}");
        session.run(&["sh", "-c", &script])?;

        for &label in ERASED_AFTER_FACTORY {
            snapshot::mtd_erase(session, label)?;
        }
        session.run(&["sync"])?;
        Ok(())
    }
}

impl PlatformPolicy for Am1 {
    fn name(&self) -> &str {
        BOARD_AM1_S9
    }

    fn factory_image_whitelist(&self) -> &'static [&'static str] {
        SUPPORTED_IMAGES
    }

    fn factory_mtdparts(&self) -> Result<PartitionTable> {
        PartitionTable::parse(FACTORY_MTDPARTS)
    }

    fn prepare_system(&self, session: &mut dyn Channel, system_dir: &Path) -> Result<bool> {
        println!("Preparing remote system...");

        // Fail closed: never overwrite a file we did not stage ourselves
        for &(file_name, remote_dir) in STAGED_BINARIES {
            let remote_path = format!("{remote_dir}/{file_name}");
            if !session.exec(&["test", "!", "-e", &remote_path])?.success() {
                eprintln!("File '{remote_path}' exists on remote target already!");
                return Ok(false);
            }
        }

        for &(file_name, remote_dir) in STAGED_BINARIES {
            let remote_path = format!("{remote_dir}/{file_name}");
            let local_path = system_dir.join(file_name);
            println!("Copy {file_name} to {remote_path}");
            session.run(&["mkdir", "-p", remote_dir])?;
            session
                .put(&local_path, &remote_path)
                .with_context(|| format!("staging {}", local_path.display()))?;
            session.run(&["chmod", "+x", &remote_path])?;
        }

        session.run(&["ln", "-fs", "/usr/sbin/fw_printenv", "/usr/sbin/fw_setenv"])?;
        Ok(true)
    }

    fn backup_firmware(
        &self,
        session: &mut dyn Channel,
        dir: &Path,
        include_dumps: bool,
    ) -> Result<Snapshot> {
        println!("Preparing system for backup...");
        // /tmp sits on the UBIFS overlay here; move it to RAM and stop the
        // daemon that logs into it, so nothing modifies NAND under the dump
        session.run(&["mount", "-t", "tmpfs", "tmpfs", "/tmp/"])?;
        session.run(&["/etc/init.d/bmminer.sh", "stop"])?;
        thread::sleep(Duration::from_secs(1));
        session.run(&["sync"])?;

        println!("Backing up configuration files...");
        std::fs::create_dir_all(dir)?;
        let config_path = dir.join(CONFIG_TAR);
        let mut config = std::fs::File::create(&config_path)
            .with_context(|| format!("creating {}", config_path.display()))?;
        session.read_from(&["tar", "czf", "-", "/config"], &mut config)?;
        config.sync_all()?;

        snapshot::capture(session, dir, include_dumps)
    }

    fn restore_firmware(
        &self,
        session: &mut dyn Channel,
        mode: BootMode,
        snapshot: Option<&Snapshot>,
        factory_image: Option<&Path>,
    ) -> Result<()> {
        match factory_image {
            Some(image) => {
                self.restore_factory(session, mode, snapshot.map(|s| s.dir.as_path()), image)
            }
            None => {
                let snapshot = snapshot.ok_or_else(|| {
                    ToolError::Format("no snapshot to restore from".into())
                })?;
                snapshot::restore(session, snapshot, mode)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SimChannel;

    #[test]
    fn factory_mtdparts_parses() {
        let table = Am1.factory_mtdparts().unwrap();
        assert_eq!(table.entries.len(), 3);
        assert_eq!(table.to_string(), FACTORY_MTDPARTS);
    }

    #[test]
    fn prepare_fails_closed_on_existing_file() {
        let system = tempfile::tempdir().unwrap();
        let mut sim = SimChannel::new();
        // `test ! -e` fails when the path exists
        sim.on_fail("test ! -e /usr/lib/openssh/sftp-server", 1, "");

        assert!(!Am1.prepare_system(&mut sim, system.path()).unwrap());
        // Nothing was uploaded
        assert!(sim.uploads.is_empty());
    }

    #[test]
    fn prepare_stages_all_binaries() {
        let system = tempfile::tempdir().unwrap();
        for (name, _) in STAGED_BINARIES {
            std::fs::write(system.path().join(name), b"elf").unwrap();
        }
        let mut sim = SimChannel::new();

        assert!(Am1.prepare_system(&mut sim, system.path()).unwrap());
        assert_eq!(sim.uploads.len(), STAGED_BINARIES.len());
        assert!(sim
            .history
            .contains(&"ln -fs /usr/sbin/fw_printenv /usr/sbin/fw_setenv".to_string()));
    }

    #[test]
    fn backup_quiesces_before_dumping() {
        let dir = tempfile::tempdir().unwrap();
        let mut sim = SimChannel::new();
        sim.on("cat /sys/class/net/eth0/address", "00:1a:2b:3c:4d:5e\n");
        sim.on(
            "cat /proc/mtd",
            "dev: size erasesize name\nmtd0: 02000000 00020000 \"boot\"\n",
        );
        sim.on("tar czf - /config", "config-bytes");

        let snapshot = Am1
            .backup_firmware(&mut sim, dir.path(), false)
            .unwrap();
        assert!(snapshot.dir.join(CONFIG_TAR).is_file());

        let tmpfs = sim
            .history
            .iter()
            .position(|c| c == "mount -t tmpfs tmpfs /tmp/")
            .unwrap();
        let listing = sim
            .history
            .iter()
            .position(|c| c == "cat /proc/mtd")
            .unwrap();
        assert!(tmpfs < listing);
    }

    #[test]
    fn factory_restore_rejects_unknown_image_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("factory.tar.gz");
        std::fs::write(&image, b"definitely not a vendor image").unwrap();

        let mut sim = SimChannel::new();
        let err = Am1
            .restore_firmware(&mut sim, BootMode::Recovery, None, Some(&image))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ToolError>(),
            Some(ToolError::Policy { .. })
        ));
        // Zero remote activity: the device was never touched
        assert!(sim.history.is_empty());
        assert!(sim.writes.is_empty());
    }
}
