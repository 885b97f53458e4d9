//! Codec for the textual NAND partition-table descriptor (`mtdparts=...`).
//!
//! The descriptor is the persistent contract between this tool and the
//! device's bootloader: it is captured during backup, stored in the snapshot's
//! `uEnv.txt`, and written back into the device environment before a
//! recovery-mode reboot. Both directions are pure functions with no I/O.

use std::fmt;

use anyhow::{Context, Result};

use crate::error::ToolError;

/// The NAND controller name used by the AM1 hardware family.
pub const NAND_CONTROLLER: &str = "pl35x-nand";

const MTDPARTS_PREFIX: &str = "mtdparts=";

/// One partition of the NAND, in table order.
///
/// `device_id` is assigned ordinally (`mtd0`, `mtd1`, ...) and is stable for
/// a given descriptor string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub device_id: String,
    pub size: u64,
    pub label: String,
}

impl PartitionEntry {
    pub fn new(index: usize, size: u64, label: &str) -> Self {
        Self {
            device_id: format!("mtd{index}"),
            size,
            label: label.to_string(),
        }
    }
}

/// Ordered partition list plus the controller it belongs to.
///
/// Round-trip invariant: `parse(&t.to_string()) == t` for any table this
/// tool produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub controller: String,
    pub entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    pub fn new(controller: &str) -> Self {
        Self {
            controller: controller.to_string(),
            entries: Vec::new(),
        }
    }

    /// Append a partition, assigning the next ordinal device id.
    pub fn push(&mut self, size: u64, label: &str) {
        self.entries
            .push(PartitionEntry::new(self.entries.len(), size, label));
    }

    /// Parse a descriptor of the form
    /// `mtdparts=<controller>:<size1>(<label1>),<size2>(<label2>),...`.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let body = descriptor
            .strip_prefix(MTDPARTS_PREFIX)
            .ok_or_else(|| format_error(descriptor, "missing 'mtdparts=' prefix"))?;
        let (controller, parts) = body
            .split_once(':')
            .ok_or_else(|| format_error(descriptor, "missing controller separator ':'"))?;

        let mut table = Self::new(controller);
        for part in parts.split(',') {
            let (size, rest) = part
                .split_once('(')
                .ok_or_else(|| format_error(part, "missing '(' before label"))?;
            let label = rest
                .strip_suffix(')')
                .ok_or_else(|| format_error(part, "missing ')' after label"))?;
            let size = parse_size(size).with_context(|| format_error(part, "bad size"))?;
            table.push(size, label);
        }

        Ok(table)
    }
}

impl fmt::Display for PartitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:", MTDPARTS_PREFIX, self.controller)?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}({})", format_size(entry.size), entry.label)?;
        }
        Ok(())
    }
}

fn format_error(token: &str, reason: &str) -> ToolError {
    ToolError::Format(format!("'{token}': {reason}"))
}

/// Decode a size token: bare number = bytes, `k`/`m`/`g` suffixes scale by
/// powers of 1024. Any other suffix is an error.
fn parse_size(token: &str) -> Result<u64> {
    let (digits, scale) = match token.as_bytes().last() {
        Some(b'k') => (&token[..token.len() - 1], 1024),
        Some(b'm') => (&token[..token.len() - 1], 1024 * 1024),
        Some(b'g') => (&token[..token.len() - 1], 1024 * 1024 * 1024),
        Some(c) if c.is_ascii_digit() => (token, 1),
        _ => anyhow::bail!("unknown size suffix in '{token}'"),
    };
    let value: u64 = digits.parse().context("not a number")?;
    anyhow::ensure!(value > 0, "partition size must be positive");
    Ok(value * scale)
}

/// Encode a size with the largest unit that divides it exactly.
fn format_size(size: u64) -> String {
    let mut value = size;
    let mut chosen = "";
    for unit in ["", "k", "m"] {
        chosen = unit;
        if value % 1024 != 0 {
            break;
        }
        value /= 1024;
        chosen = "g";
    }
    format!("{value}{chosen}")
}

#[cfg(test)]
const SCENARIO: &str = "mtdparts=pl35x-nand:32m(BOOT.bin-env-dts-kernel),144m(rootfs),80m(upgrade)";

#[test]
fn test_parse_scenario() {
    let table = PartitionTable::parse(SCENARIO).unwrap();
    assert_eq!(table.controller, NAND_CONTROLLER);
    assert_eq!(
        table.entries,
        vec![
            PartitionEntry::new(0, 33554432, "BOOT.bin-env-dts-kernel"),
            PartitionEntry::new(1, 150994944, "rootfs"),
            PartitionEntry::new(2, 83886080, "upgrade"),
        ]
    );
    assert_eq!(table.to_string(), SCENARIO);
}

#[test]
fn test_parse_units() {
    let table = PartitionTable::parse("mtdparts=pl35x-nand:512(a),2k(b),3m(c),1g(d)").unwrap();
    let sizes: Vec<u64> = table.entries.iter().map(|e| e.size).collect();
    assert_eq!(sizes, vec![512, 2048, 3 << 20, 1 << 30]);
}

#[test]
fn test_parse_rejects_malformed() {
    assert!(PartitionTable::parse("pl35x-nand:32m(a)").is_err());
    assert!(PartitionTable::parse("mtdparts=pl35x-nand").is_err());
    assert!(PartitionTable::parse("mtdparts=pl35x-nand:32m(a").is_err());
    assert!(PartitionTable::parse("mtdparts=pl35x-nand:32ma)").is_err());
    assert!(PartitionTable::parse("mtdparts=pl35x-nand:32x(a)").is_err());
    assert!(PartitionTable::parse("mtdparts=pl35x-nand:0(a)").is_err());
}

#[test]
fn test_size_reduction_uses_largest_unit() {
    assert_eq!(format_size(1024), "1k");
    assert_eq!(format_size(1536), "1536");
    assert_eq!(format_size(33554432), "32m");
    assert_eq!(format_size(1 << 30), "1g");
    assert_eq!(format_size(3 << 30), "3g");
}

#[test]
fn test_round_trip() {
    let mut table = PartitionTable::new(NAND_CONTROLLER);
    table.push(0x2000000, "BOOT.bin-env-dts-kernel");
    table.push(0x9000000, "rootfs");
    table.push(0x5000000, "upgrade");
    let reparsed = PartitionTable::parse(&table.to_string()).unwrap();
    assert_eq!(reparsed, table);
}

#[test]
fn test_ordinal_device_ids() {
    let table = PartitionTable::parse(SCENARIO).unwrap();
    for (i, entry) in table.entries.iter().enumerate() {
        assert_eq!(entry.device_id, format!("mtd{i}"));
    }
}
