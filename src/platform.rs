//! Per-hardware-family variation, expressed as a capability-set trait.
//!
//! Each supported family gets one concrete policy, selected by the board
//! identifier string the device reports. Everything the families have in
//! common lives in the default methods; a family only overrides the hooks
//! where its hardware actually differs.

use std::path::Path;

use anyhow::Result;

use crate::channel::Channel;
use crate::error::ToolError;
use crate::hash;
use crate::mode::BootMode;
use crate::mtdparts::PartitionTable;
use crate::snapshot::{self, Snapshot};

pub mod am1;
pub mod bos;
pub mod dm1;

const BOARD_NAME_PATH: &str = "/tmp/sysinfo/board_name";

/// Capability set for one hardware family.
pub trait PlatformPolicy {
    /// The board identifier this policy serves.
    fn name(&self) -> &str;

    /// MD5 digests of factory images this family may flash. Empty means no
    /// factory image is ever acceptable.
    fn factory_image_whitelist(&self) -> &'static [&'static str] {
        &[]
    }

    /// Partition layout used when restoring a device with no prior backup.
    fn factory_mtdparts(&self) -> Result<PartitionTable> {
        anyhow::bail!(
            "no factory partition layout known for '{}'; a backup is required",
            self.name()
        )
    }

    /// Stage utility binaries the partition operations need, idempotently.
    ///
    /// Returns `Ok(false)` — preparation refused — when a target path already
    /// exists, rather than silently overwriting a foreign file.
    fn prepare_system(&self, session: &mut dyn Channel, system_dir: &Path) -> Result<bool> {
        let _ = (session, system_dir);
        Ok(true)
    }

    /// Capture a snapshot of the device into `dir`.
    fn backup_firmware(
        &self,
        session: &mut dyn Channel,
        dir: &Path,
        include_dumps: bool,
    ) -> Result<Snapshot> {
        snapshot::capture(session, dir, include_dumps)
    }

    /// Write the device's partitions back, from a snapshot and/or a factory
    /// image. `mode` is the verified current boot mode.
    fn restore_firmware(
        &self,
        session: &mut dyn Channel,
        mode: BootMode,
        snapshot: Option<&Snapshot>,
        factory_image: Option<&Path>,
    ) -> Result<()> {
        if factory_image.is_some() {
            anyhow::bail!("factory image restore is not supported for '{}'", self.name());
        }
        let snapshot = snapshot
            .ok_or_else(|| ToolError::Format("no snapshot to restore from".into()))?;
        snapshot::restore(session, snapshot, mode)
    }

    /// Verify a factory image against the whitelist. An unrecognized hash is
    /// a hard stop; flashing the wrong factory image can permanently damage
    /// the boot chain.
    fn check_factory_image(&self, image: &Path) -> Result<String> {
        let digest = hash::md5_file(image)?;
        if !self.factory_image_whitelist().contains(&digest.as_str()) {
            return Err(ToolError::Policy { digest }.into());
        }
        Ok(digest)
    }
}

/// Select the policy for a board identifier.
pub fn for_board(board: &str) -> Box<dyn PlatformPolicy> {
    match board {
        am1::BOARD_AM1_S9 => Box::new(am1::Am1),
        b if b.starts_with("dm1-") => Box::new(dm1::Dm1::new(b)),
        other => Box::new(bos::BosNative::new(other)),
    }
}

/// Read the board identifier from the running firmware, if it reports one.
pub fn detect_board(session: &mut dyn Channel) -> Result<Option<String>> {
    let output = session.exec(&["cat", BOARD_NAME_PATH])?;
    if !output.success() {
        return Ok(None);
    }
    Ok(output.first_line().filter(|line| !line.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SimChannel;

    #[test]
    fn board_selection() {
        assert_eq!(for_board("am1-s9").name(), "am1-s9");
        assert_eq!(for_board("dm1-g9").name(), "dm1-g9");
        assert_eq!(for_board("dm1-g19").name(), "dm1-g19");
        assert_eq!(for_board("braiins-xyz").name(), "braiins-xyz");
    }

    #[test]
    fn detect_board_reads_sysinfo() {
        let mut sim = SimChannel::new();
        sim.on("cat /tmp/sysinfo/board_name", "am1-s9\n");
        assert_eq!(detect_board(&mut sim).unwrap().as_deref(), Some("am1-s9"));

        let mut sim = SimChannel::new();
        sim.on_fail("cat /tmp/sysinfo/board_name", 1, "No such file");
        assert_eq!(detect_board(&mut sim).unwrap(), None);
    }

    struct TestPolicy;
    impl PlatformPolicy for TestPolicy {
        fn name(&self) -> &str {
            "test"
        }
        fn factory_image_whitelist(&self) -> &'static [&'static str] {
            // MD5 of "abc"
            &["900150983cd24fb0d6963f7d28e17f72"]
        }
    }

    #[test]
    fn whitelist_accepts_known_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("factory.tar.gz");
        std::fs::write(&image, b"abc").unwrap();
        assert_eq!(
            TestPolicy.check_factory_image(&image).unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn whitelist_rejects_unknown_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("factory.tar.gz");
        std::fs::write(&image, b"not the real image").unwrap();
        let err = TestPolicy.check_factory_image(&image).unwrap_err();
        match err.downcast_ref::<ToolError>() {
            Some(ToolError::Policy { digest }) => assert_eq!(digest.len(), 32),
            other => panic!("expected PolicyError, got {other:?}"),
        }
    }

    #[test]
    fn empty_whitelist_rejects_everything() {
        struct NoFactory;
        impl PlatformPolicy for NoFactory {
            fn name(&self) -> &str {
                "bare"
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("factory.tar.gz");
        std::fs::write(&image, b"abc").unwrap();
        assert!(NoFactory.check_factory_image(&image).is_err());
    }
}
