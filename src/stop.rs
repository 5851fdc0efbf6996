//! Escalating termination: graceful signal, bounded death watch, SIGKILL.
//!
//! A process that is already gone counts as successfully stopped, and the
//! death watch has a hard upper bound: once the window elapses the stop
//! sequence proceeds to finalization no matter what the OS reports.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{DEFAULT_DEATH_WATCH_INTERVAL_MS, DEFAULT_DEATH_WATCH_SECS};

/// Bounds for the forced-stop wait loop.
#[derive(Debug, Clone, Copy)]
pub struct DeathWatch {
    pub window: Duration,
    pub interval: Duration,
}

impl Default for DeathWatch {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(DEFAULT_DEATH_WATCH_SECS),
            interval: Duration::from_millis(DEFAULT_DEATH_WATCH_INTERVAL_MS),
        }
    }
}

/// Sends SIGTERM; a missing process is a success condition, not an error.
#[cfg(unix)]
pub fn terminate(pid: u32) {
    send_signal(pid, libc::SIGTERM);
}

/// Sends SIGKILL unconditionally.
#[cfg(unix)]
pub fn kill(pid: u32) {
    send_signal(pid, libc::SIGKILL);
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) {
    let result = unsafe { libc::kill(pid as i32, signal) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => debug!(pid, "process already gone"),
            Some(libc::EPERM) => debug!(pid, "permission to signal process denied"),
            _ => warn!(pid, error = %err, "failed to signal process"),
        }
    }
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) {
    warn!(pid, "process signalling is not supported on this platform");
}

#[cfg(not(unix))]
pub fn kill(pid: u32) {
    warn!(pid, "process signalling is not supported on this platform");
}

/// Polls `survivors` until it reports an empty set or the window elapses.
/// Returns whatever is still alive at the end; an empty result means
/// everything died on its own.
pub async fn death_watch<F>(config: DeathWatch, survivors: F) -> HashSet<u32>
where
    F: Fn() -> HashSet<u32>,
{
    let interval = config.interval.max(Duration::from_millis(10));
    let polls = (config.window.as_millis() / interval.as_millis()).max(1);
    for _ in 0..polls {
        tokio::time::sleep(interval).await;
        if survivors().is_empty() {
            return HashSet::new();
        }
    }
    survivors()
}

/// SIGKILLs every survivor, logging per-pid failures without aborting the
/// loop.
pub fn kill_survivors(pids: &HashSet<u32>) {
    for pid in pids {
        debug!(pid, "killing surviving process");
        kill(*pid);
    }
}
