//! The operator-facing error taxonomy.
//!
//! Library code raises these through `anyhow` so that context can be attached
//! along the way; the binaries walk the chain back down to a `ToolError` to
//! decide the process exit code.

use thiserror::Error;

/// Classified failures of the backup/restore pipeline.
#[derive(Error, Debug)]
pub enum ToolError {
    /// The remote channel is unreachable or authentication failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A malformed partition-table descriptor, or a snapshot directory
    /// missing its environment descriptor.
    #[error("invalid format: {0}")]
    Format(String),

    /// The device did not leave NAND mode after a recovery-boot request.
    /// Never retried automatically; a device in an unknown boot state must
    /// not receive further partition writes.
    #[error("could not reboot to recovery mode")]
    ModeTransition,

    /// A single partition erase/write failed. Fatal for the whole restore;
    /// a partial set of partitions can leave the boot chain inconsistent.
    #[error("write to NAND partition '{label}' failed: {reason}")]
    Write { label: String, reason: String },

    /// A factory image whose content hash is not on the platform whitelist.
    #[error("unsupported factory image with MD5 digest: {digest}")]
    Policy { digest: String },
}

impl ToolError {
    /// Map the error class to the documented process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            ToolError::Connection(_) => 1,
            ToolError::Format(_) => 2,
            ToolError::ModeTransition => 2,
            ToolError::Write { .. } => 2,
            ToolError::Policy { .. } => 3,
        }
    }
}

/// Pick the exit code for a failed run by finding the innermost classified
/// error; unclassified errors count as restore failures.
pub fn exit_code_for(error: &anyhow::Error) -> i32 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<ToolError>())
        .map_or(2, ToolError::exit_code)
}

#[test]
fn test_exit_codes() {
    assert_eq!(ToolError::Connection("x".into()).exit_code(), 1);
    assert_eq!(ToolError::ModeTransition.exit_code(), 2);
    assert_eq!(ToolError::Policy { digest: "d".into() }.exit_code(), 3);
}

#[test]
fn test_exit_code_through_chain() {
    let err = anyhow::Error::new(ToolError::ModeTransition).context("restoring firmware");
    assert_eq!(exit_code_for(&err), 2);

    let err = anyhow::anyhow!("something else entirely");
    assert_eq!(exit_code_for(&err), 2);

    let err = anyhow::Error::new(ToolError::Connection("refused".into())).context("probing");
    assert_eq!(exit_code_for(&err), 1);
}
