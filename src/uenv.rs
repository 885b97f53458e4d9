//! Reader/writer for `uEnv.txt`, the plain `key=value` environment descriptor.
//!
//! The same format serves two purposes: the device's persistent bootloader
//! environment, and (locally) the authoritative manifest of a snapshot
//! directory. Line order is preserved so that a file written by this tool is
//! byte-stable.

use std::fs::{self, File};
use std::path::Path;

use anyhow::{Context, Result};

use crate::error::ToolError;

/// Key marking a backup/recovery environment.
pub const KEY_RECOVERY: &str = "recovery";
/// Key holding the serialized partition table.
pub const KEY_RECOVERY_MTDPARTS: &str = "recovery_mtdparts";
/// Key holding the device MAC address.
pub const KEY_ETHADDR: &str = "ethaddr";

/// The environment descriptor file name inside a snapshot directory.
pub const UENV_FILE: &str = "uEnv.txt";

/// An ordered `key=value` environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UEnv {
    lines: Vec<(String, String)>,
}

impl UEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(line) = self.lines.iter_mut().find(|(k, _)| k == key) {
            line.1 = value.to_string();
        } else {
            self.lines.push((key.to_string(), value.to_string()));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parse descriptor text. Lines without `=` are ignored; everything after
    /// the first `=` belongs to the value (mtdparts values contain `=`).
    pub fn parse(text: &str) -> Self {
        let mut env = Self::new();
        for line in text.lines() {
            if let Some((key, value)) = line.split_once('=') {
                env.set(key.trim(), value.trim());
            }
        }
        env
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.lines {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    /// Read `<dir>/uEnv.txt`. A missing descriptor is a `ToolError::Format`:
    /// it is the strict signal of a partial or failed backup.
    pub fn read_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(UENV_FILE);
        if !path.is_file() {
            return Err(ToolError::Format(format!(
                "snapshot '{}' has no {UENV_FILE}",
                dir.display()
            ))
            .into());
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    /// Write `<dir>/uEnv.txt` and flush it to stable storage.
    pub fn write_dir(&self, dir: &Path) -> Result<()> {
        let path = dir.join(UENV_FILE);
        fs::write(&path, self.to_text())
            .with_context(|| format!("writing {}", path.display()))?;
        File::open(&path)?.sync_all()?;
        Ok(())
    }
}

#[test]
fn test_parse_keeps_full_value() {
    let env = UEnv::parse(
        "recovery=yes\n\
         recovery_mtdparts=mtdparts=pl35x-nand:32m(boot)\n\
         ethaddr=00:11:22:33:44:55\n\
         # a stray comment line\n",
    );
    assert_eq!(env.get(KEY_RECOVERY), Some("yes"));
    assert_eq!(
        env.get(KEY_RECOVERY_MTDPARTS),
        Some("mtdparts=pl35x-nand:32m(boot)")
    );
    assert_eq!(env.get(KEY_ETHADDR), Some("00:11:22:33:44:55"));
    assert_eq!(env.get("missing"), None);
}

#[test]
fn test_text_round_trip() {
    let mut env = UEnv::new();
    env.set(KEY_RECOVERY, "yes");
    env.set(KEY_ETHADDR, "00:11:22:33:44:55");
    assert_eq!(UEnv::parse(&env.to_text()), env);
}

#[test]
fn test_missing_descriptor_is_format_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = UEnv::read_dir(dir.path()).unwrap_err();
    assert!(err.downcast_ref::<ToolError>().is_some());
}
