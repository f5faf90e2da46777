//! Port reclamation: free a TCP port by force-killing whatever listens on it.
//!
//! Everything here is best-effort. A missing `lsof`, a PID that vanished
//! before it could be signalled, or a refused signal is logged and the
//! caller carries on; reclamation never aborts an operation.

use std::collections::BTreeSet;
use std::io;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;

use kiroctl_core::{Host, Port};

/// Outcome of [`reclaim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimResult {
    /// Nothing was listening (or the listener could not be enumerated).
    NoneHeld,
    /// This many holders were sent `SIGKILL`.
    Reclaimed(usize),
}

/// PIDs with a listening TCP socket on `port`. `None` when enumeration
/// itself failed.
fn listening_pids(host: &dyn Host, port: u16) -> Option<BTreeSet<u32>> {
    let spec = format!("-iTCP:{port}");
    let output = match host.run("lsof", &["-t", spec.as_str(), "-sTCP:LISTEN"]) {
        Ok(output) => output,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::warn!(port, "lsof is not installed; cannot reclaim port");
            return None;
        }
        Err(err) => {
            tracing::warn!(port, error = %err, "lsof failed; cannot reclaim port");
            return None;
        }
    };

    // lsof exits 1 with no output when nothing matches.
    if !output.success() {
        if output.code == Some(1) && output.stdout.trim().is_empty() {
            return Some(BTreeSet::new());
        }
        tracing::warn!(port, code = ?output.code, stderr = %output.stderr.trim(), "lsof failed");
        return None;
    }

    Some(
        output
            .stdout
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect(),
    )
}

/// Kill every process listening on `port`, then wait `grace` for the kernel
/// to release the socket.
///
/// The orchestrator's own PID is never signalled.
pub fn reclaim(host: &dyn Host, port: &Port, grace: Duration) -> ReclaimResult {
    let Some(pids) = listening_pids(host, port.number) else {
        return ReclaimResult::NoneHeld;
    };
    let own = host.own_pid();

    let mut killed = 0;
    for pid in pids.into_iter().filter(|pid| *pid != own) {
        match host.signal(pid, Signal::SIGKILL) {
            Ok(()) => {
                tracing::info!(port = port.number, label = %port.label, pid, "killed port holder");
                killed += 1;
            }
            Err(Errno::ESRCH) => {
                tracing::debug!(port = port.number, pid, "holder already exited");
            }
            Err(errno) => {
                tracing::warn!(port = port.number, pid, error = %errno, "could not signal port holder");
            }
        }
    }

    if killed == 0 {
        tracing::debug!(port = port.number, label = %port.label, "port free");
        return ReclaimResult::NoneHeld;
    }
    std::thread::sleep(grace);
    ReclaimResult::Reclaimed(killed)
}

/// `pkill -f <pattern>` for strays this process never owned.
///
/// Returns whether anything matched. "No match" is not a failure.
pub fn kill_matching(host: &dyn Host, pattern: &str, label: &str) -> bool {
    match host.run("pkill", &["-f", pattern]) {
        Ok(output) if output.success() => {
            tracing::info!(label, pattern, "killed stray processes");
            true
        }
        Ok(output) if output.code == Some(1) => {
            tracing::debug!(label, pattern, "no stray processes");
            false
        }
        Ok(output) => {
            tracing::warn!(label, code = ?output.code, stderr = %output.stderr.trim(), "pkill failed");
            false
        }
        Err(err) => {
            tracing::warn!(label, error = %err, "pkill unavailable");
            false
        }
    }
}
