//! Boot-mode-aware NAND backup/restore tooling for embedded mining controllers.
//!
//! The device under repair reboots between three boot modes (SD, NAND,
//! Recovery) over the course of a migration, and each mode changes which
//! partitions may be erased. The modules here cover the whole pipeline:
//! detecting the current mode, snapshotting the NAND partition table, driving
//! the device into Recovery across a reboot, and replaying partition writes
//! once it comes back up.

pub mod channel;
pub mod error;
pub mod hash;
pub mod mode;
pub mod mtdparts;
pub mod platform;
pub mod recovery;
pub mod snapshot;
pub mod uenv;
