//! Resource monitor
//!
//! Every five seconds, sample resident memory plus swap for each live
//! child and for MCP itself. Children over their kill threshold are
//! crashed with SIGABRT (breadcrumbs for the dump) and stopped;
//! warnings repeat at most once per five minutes per daemon. MCP over
//! its own kill threshold shuts everything down.

use crate::mcp::supervisor::{DaemonTable, Intent};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Sampling cadence
const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum gap between warnings for one daemon
const WARN_INTERVAL: Duration = Duration::from_secs(300);

/// Resident set plus swap, in megabytes
pub fn memory_mb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    let mut kb: u64 = 0;
    let mut seen = false;
    for line in status.lines() {
        if line.starts_with("VmRSS:") || line.starts_with("VmSwap:") {
            if let Some(value) = line.split_whitespace().nth(1) {
                if let Ok(value) = value.parse::<u64>() {
                    kb += value;
                    seen = true;
                }
            }
        }
    }
    seen.then_some(kb / 1024)
}

/// Run the monitor loop; returns only when `self_kill` fires
///
/// `self_kill_mb` bounds MCP's own footprint; exceeding it sends one
/// message on `shutdown_tx` and stops sampling.
pub async fn run(
    table: DaemonTable,
    self_kill_mb: Option<u64>,
    shutdown_tx: mpsc::UnboundedSender<String>,
) {
    let mut last_warn: HashMap<String, Instant> = HashMap::new();
    let self_pid = std::process::id();

    loop {
        tokio::time::sleep(SAMPLE_INTERVAL).await;

        let daemons: Vec<_> = {
            let table = table.read().await;
            table.values().cloned().collect()
        };

        for shared in daemons {
            let (name, pid) = {
                let runtime = shared.runtime.lock().unwrap();
                let def = shared.def.lock().unwrap();
                (def.name.clone(), runtime.pid)
            };
            let Some(pid) = pid else { continue };
            let Some(used_mb) = memory_mb(pid) else {
                debug!("No memory sample for {} (pid {})", name, pid);
                continue;
            };

            let (warn_mb, kill_mb) = {
                let def = shared.def.lock().unwrap();
                (def.mem_warn_mb, def.mem_kill_mb)
            };

            if let Some(kill_mb) = kill_mb {
                if used_mb > kill_mb {
                    error!(
                        "{} using {} MB (kill threshold {} MB); crashing it",
                        name, used_mb, kill_mb
                    );
                    shared.send_intent(Intent::MemKill);
                    continue;
                }
            }
            if let Some(warn_mb) = warn_mb {
                if used_mb > warn_mb {
                    let due = last_warn
                        .get(&name)
                        .map(|t| t.elapsed() >= WARN_INTERVAL)
                        .unwrap_or(true);
                    if due {
                        warn!("{} using {} MB (warn threshold {} MB)", name, used_mb, warn_mb);
                        last_warn.insert(name.clone(), Instant::now());
                    }
                }
            }
        }

        if let Some(kill_mb) = self_kill_mb {
            if let Some(self_mb) = memory_mb(self_pid) {
                if self_mb > kill_mb {
                    error!(
                        "MCP itself using {} MB (kill threshold {} MB); shutting down",
                        self_mb, kill_mb
                    );
                    let _ = shutdown_tx.send(format!("self memory {} MB", self_mb));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_of_self() {
        // Any live process has a nonzero RSS
        let mb = memory_mb(std::process::id());
        assert!(mb.is_some());
    }

    #[test]
    fn test_memory_of_dead_pid() {
        // PID 0 has no /proc entry
        assert!(memory_mb(0).is_none());
    }
}
