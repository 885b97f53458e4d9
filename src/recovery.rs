//! The recovery transition state machine.
//!
//! From NAND mode, the active firmware partition cannot be erased while the
//! device runs from it, so a restore must first push the device through a
//! reboot into the Recovery environment: stash the target partition table in
//! the persistent environment, request the recovery boot, wait out the
//! reboot, then reconnect and re-verify the mode. SD and Recovery modes can
//! already erase all partitions and skip straight through.

use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use anyhow::Result;

use crate::channel::ssh::HostKeyPolicy;
use crate::channel::Channel;
use crate::error::ToolError;
use crate::mode::{self, BootMode};
use crate::mtdparts::PartitionTable;
use crate::uenv;

/// The device's management (SSH) port.
pub const MANAGEMENT_PORT: u16 = 22;

/// Timing of the post-reboot reachability wait.
///
/// The pre-delay avoids false-positive reachability during the reboot's brief
/// window where the port is still open from the old session; the post-delay
/// lets the new mode's services finish starting. Neither is load-bearing for
/// correctness, only for robustness against flaky timing.
#[derive(Debug, Clone)]
pub struct RebootWait {
    pub pre_delay: Duration,
    pub post_delay: Duration,
    pub poll_interval: Duration,
    /// Upper bound on reachability polls. `None` (the default) polls until
    /// the operator interrupts; timing out mid-migration can leave the
    /// device unbootable, so a cap must be an explicit operator choice.
    pub max_polls: Option<u32>,
}

impl Default for RebootWait {
    fn default() -> Self {
        Self {
            pre_delay: Duration::from_secs(3),
            post_delay: Duration::from_secs(8),
            poll_interval: Duration::from_secs(1),
            max_polls: None,
        }
    }
}

/// Block until TCP `host:port` accepts a connection, with fixed-interval
/// polling; deliberately not exponential backoff (see [`RebootWait`]).
pub fn wait_for_port(host: &str, port: u16, wait: &RebootWait) -> Result<()> {
    thread::sleep(wait.pre_delay);

    let mut polls: u32 = 0;
    loop {
        let reachable = (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map_or(false, |addr| {
                TcpStream::connect_timeout(&addr, Duration::from_secs(1)).is_ok()
            });
        if reachable {
            break;
        }
        polls += 1;
        if let Some(max) = wait.max_polls {
            if polls >= max {
                return Err(ToolError::Connection(format!(
                    "{host}:{port} did not become reachable within {max} polls"
                ))
                .into());
            }
        }
        thread::sleep(wait.poll_interval);
    }

    thread::sleep(wait.post_delay);
    Ok(())
}

/// Drive the device into a mode that may erase all partitions.
///
/// Returns the (possibly new) session and the verified mode. `wait_ready`
/// performs the reboot wait ([`wait_for_port`] in production); `reconnect`
/// opens the replacement session and receives the trust policy to use —
/// always [`HostKeyPolicy::IgnoreKnownHosts`], because Recovery presents a
/// different host key for the same MAC.
///
/// A device still in NAND mode after the reboot did not actually switch;
/// that is fatal and never retried, since blindly re-requesting a boot-mode
/// switch against a device in an unknown state risks bricking it.
pub fn enter_recovery<C, W, F>(
    session: C,
    current_mode: BootMode,
    table: &PartitionTable,
    wait_ready: W,
    reconnect: F,
) -> Result<(C, BootMode)>
where
    C: Channel,
    W: FnOnce() -> Result<()>,
    F: FnOnce(HostKeyPolicy) -> Result<C>,
{
    if current_mode != BootMode::Nand {
        return Ok((session, current_mode));
    }

    let mut session = session;
    let descriptor = table.to_string();
    session.run(&["fw_setenv", uenv::KEY_RECOVERY_MTDPARTS, &descriptor])?;
    println!("Restarting to recovery mode...");
    session.run(&["miner", "run_recovery"])?;

    // The old channel must be gone before polling reachability, or the
    // not-yet-rebooted sshd answers for the new mode.
    drop(session);
    wait_ready()?;

    println!("Connecting to remote host...");
    let mut session = reconnect(HostKeyPolicy::IgnoreKnownHosts)?;
    let mode = mode::detect(&mut session)?;
    println!("Detected mode: {mode}");
    if mode == BootMode::Nand {
        return Err(ToolError::ModeTransition.into());
    }

    Ok((session, mode))
}

/// Boot the restored firmware.
///
/// A device that was running from SD cannot simply reboot into NAND; the
/// operator has to move the boot jumper first, so it is halted instead. The
/// command drops the connection mid-flight on some firmwares, which is not a
/// failure.
pub fn finalize(session: &mut dyn Channel, initial_mode: BootMode) -> Result<()> {
    if initial_mode == BootMode::Sd {
        println!("Halting system...");
        println!("Please turn off the device and change the jumper to boot it from NAND!");
        let _ = session.exec(&["halt"]);
    } else {
        println!("Rebooting to restored firmware...");
        let _ = session.exec(&["reboot"]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SimChannel;
    use crate::mtdparts::NAND_CONTROLLER;
    use std::cell::Cell;

    fn table() -> PartitionTable {
        let mut table = PartitionTable::new(NAND_CONTROLLER);
        table.push(32 << 20, "boot");
        table.push(144 << 20, "rootfs");
        table
    }

    #[test]
    fn non_nand_modes_pass_through() {
        for mode in [BootMode::Sd, BootMode::Recovery] {
            let sim = SimChannel::new();
            let (sim, out) = enter_recovery(
                sim,
                mode,
                &table(),
                || panic!("must not wait"),
                |_| panic!("must not reconnect"),
            )
            .unwrap();
            assert_eq!(out, mode);
            assert!(sim.history.is_empty());
        }
    }

    #[test]
    fn nand_requests_recovery_and_reconnects_untrusted() {
        let sim = SimChannel::new();
        let policy_seen = Cell::new(None);

        let (_, mode) = enter_recovery(
            sim,
            BootMode::Nand,
            &table(),
            || Ok(()),
            |policy| {
                policy_seen.set(Some(policy));
                let mut fresh = SimChannel::new();
                fresh.on("cat /etc/bos_mode", "recovery\n");
                Ok(fresh)
            },
        )
        .unwrap();

        assert_eq!(mode, BootMode::Recovery);
        assert_eq!(policy_seen.get(), Some(HostKeyPolicy::IgnoreKnownHosts));
    }

    #[test]
    fn descriptor_write_precedes_recovery_request() {
        // Failing the fw_setenv step must abort before the recovery boot is
        // ever requested; this also pins the exact descriptor argument.
        let mut sim = SimChannel::new();
        sim.on_fail(
            "fw_setenv recovery_mtdparts mtdparts=pl35x-nand:32m(boot),144m(rootfs)",
            1,
            "read-only environment",
        );
        let result = enter_recovery(
            sim,
            BootMode::Nand,
            &table(),
            || panic!("must not wait"),
            |_| panic!("must not reconnect"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn still_nand_after_reboot_is_fatal() {
        let sim = SimChannel::new();
        let err = enter_recovery(
            sim,
            BootMode::Nand,
            &table(),
            || Ok(()),
            |_| {
                let mut fresh = SimChannel::new();
                fresh.on("cat /etc/bos_mode", "nand\n");
                Ok(fresh)
            },
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ToolError>(),
            Some(ToolError::ModeTransition)
        ));
    }

    #[test]
    fn failed_recovery_command_aborts_before_wait() {
        let mut sim = SimChannel::new();
        sim.on_fail("miner run_recovery", 1, "not supported");
        let result = enter_recovery(
            sim,
            BootMode::Nand,
            &table(),
            || panic!("must not wait after failed request"),
            |_| panic!("must not reconnect"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn finalize_halts_sd_reboots_others() {
        let mut sim = SimChannel::new();
        finalize(&mut sim, BootMode::Sd).unwrap();
        assert_eq!(sim.history, vec!["halt"]);

        let mut sim = SimChannel::new();
        finalize(&mut sim, BootMode::Recovery).unwrap();
        assert_eq!(sim.history, vec!["reboot"]);
    }

    #[test]
    fn wait_for_port_bounded_failure() {
        let wait = RebootWait {
            pre_delay: Duration::ZERO,
            post_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(1),
            max_polls: Some(2),
        };
        // Port 1 on localhost is refused immediately
        let err = wait_for_port("127.0.0.1", 1, &wait).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ToolError>(),
            Some(ToolError::Connection(_))
        ));
    }

    #[test]
    fn wait_for_port_sees_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let wait = RebootWait {
            pre_delay: Duration::ZERO,
            post_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(1),
            max_polls: Some(5),
        };
        wait_for_port("127.0.0.1", port, &wait).unwrap();
    }
}
