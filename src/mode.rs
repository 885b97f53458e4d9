//! Boot mode detection.
//!
//! The marker file `/etc/bos_mode` is authoritative when present. Early
//! firmware releases predate the marker, so a mount-table heuristic exists as
//! a compatibility fallback only: a NAND overlay block device mounted at
//! `/overlay` means NAND mode, an SD-card block device means SD mode, and
//! neither means the minimal Recovery environment.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;

use crate::channel::Channel;

const MODE_MARKER: &str = "/etc/bos_mode";
const NAND_OVERLAY: &str = "/dev/ubi0_2 on /overlay";
const SD_OVERLAY: &str = "/dev/mmcblk0p2 on /overlay";

/// Which boot environment the device is currently running from.
///
/// NAND is the only mode in which the active firmware partition cannot be
/// erased; SD and Recovery may erase all partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    Sd,
    Nand,
    Recovery,
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BootMode::Sd => "sd",
            BootMode::Nand => "nand",
            BootMode::Recovery => "recovery",
        })
    }
}

impl FromStr for BootMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sd" => Ok(BootMode::Sd),
            "nand" => Ok(BootMode::Nand),
            "recovery" => Ok(BootMode::Recovery),
            other => anyhow::bail!("unknown boot mode '{other}'"),
        }
    }
}

/// Determine the device's current boot mode.
///
/// Transport failures propagate as `ToolError::Connection`, and a marker with
/// an unrecognized token is an error. In the fallback, a device that matches
/// neither overlay line is reported as Recovery, which is safe because NAND
/// has been ruled out by then.
pub fn detect(session: &mut dyn Channel) -> Result<BootMode> {
    let marker = session.exec(&["cat", MODE_MARKER])?;
    if marker.success() {
        // A present marker is terminal: an unknown token is an error, never a
        // reason to guess from the mount table.
        if let Some(line) = marker.first_line().filter(|line| !line.is_empty()) {
            return line.parse();
        }
    }

    // Marker absent (old firmware): classify by what is mounted at /overlay.
    let mounts = session.run(&["mount"])?;
    let mounts = mounts.stdout_text();
    if mounts.lines().any(|line| line.starts_with(NAND_OVERLAY)) {
        Ok(BootMode::Nand)
    } else if mounts.lines().any(|line| line.starts_with(SD_OVERLAY)) {
        Ok(BootMode::Sd)
    } else {
        Ok(BootMode::Recovery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SimChannel;
    use crate::error::ToolError;

    #[test]
    fn marker_is_authoritative() {
        let mut sim = SimChannel::new();
        sim.on("cat /etc/bos_mode", "nand\n");
        sim.on("mount", "/dev/mmcblk0p2 on /overlay type ext4 (rw)\n");

        assert_eq!(detect(&mut sim).unwrap(), BootMode::Nand);
        // Mount table must not be consulted when the marker is present
        assert_eq!(sim.count("mount"), 0);
    }

    #[test]
    fn unknown_marker_fails_without_mount_fallback() {
        let mut sim = SimChannel::new();
        sim.on("cat /etc/bos_mode", "nand-v2\n");
        sim.on("mount", "tmpfs on /tmp type tmpfs (rw)\n");

        assert!(detect(&mut sim).is_err());
        // An unrecognized marker must not fall through to the heuristic
        assert_eq!(sim.count("mount"), 0);
    }

    #[test]
    fn detection_is_deterministic() {
        let mut sim = SimChannel::new();
        sim.on("cat /etc/bos_mode", "sd\n");
        for _ in 0..3 {
            assert_eq!(detect(&mut sim).unwrap(), BootMode::Sd);
        }
        assert_eq!(sim.count("mount"), 0);
    }

    #[test]
    fn fallback_consults_mount_table() {
        let mut sim = SimChannel::new();
        sim.on_fail("cat /etc/bos_mode", 1, "No such file or directory");
        sim.on(
            "mount",
            "rootfs on / type rootfs (rw)\n\
             /dev/ubi0_2 on /overlay type ubifs (rw,noatime)\n",
        );

        assert_eq!(detect(&mut sim).unwrap(), BootMode::Nand);
        assert_eq!(sim.count("mount"), 1);
    }

    #[test]
    fn fallback_sd_and_recovery() {
        let mut sim = SimChannel::new();
        sim.on_fail("cat /etc/bos_mode", 1, "");
        sim.on("mount", "/dev/mmcblk0p2 on /overlay type ext4 (rw)\n");
        assert_eq!(detect(&mut sim).unwrap(), BootMode::Sd);

        let mut sim = SimChannel::new();
        sim.on_fail("cat /etc/bos_mode", 1, "");
        sim.on("mount", "tmpfs on /tmp type tmpfs (rw)\n");
        assert_eq!(detect(&mut sim).unwrap(), BootMode::Recovery);
    }

    #[test]
    fn unreachable_is_connection_error() {
        let mut sim = SimChannel::new();
        sim.unreachable = true;
        let err = detect(&mut sim).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ToolError>(),
            Some(ToolError::Connection(_))
        ));
    }
}
