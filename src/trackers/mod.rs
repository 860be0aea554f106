pub mod disk;
pub mod iface;
pub mod ring;
pub mod socket;

use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::Config;
use disk::{DiskReport, DiskTracker, ProcDiskSource};
use iface::{IfaceReport, IfaceTracker, ProcIfaceSource};
use socket::{ProcSocketTables, SockKey, SocketReport, SocketTarget, SocketTracker};

/// Counter trackers refresh at most once per second even when the control
/// loop wakes more often (accept bursts, signals).
const COUNTER_INTERVAL: Duration = Duration::from_secs(1);

/// Read-only, point-in-time copy of all tracker state handed to a session
/// when it is spawned. Sessions never touch the live tables.
#[derive(Debug, Clone, Default)]
pub struct TrackerSnapshot {
    pub sockets: Vec<SocketReport>,
    pub ifaces: Vec<IfaceReport>,
    pub disks: Vec<DiskReport>,
}

/// The three sliding-window engines, owned and mutated only by the control
/// loop.
pub struct Trackers {
    sockets: SocketTracker<ProcSocketTables>,
    ifaces: IfaceTracker<ProcIfaceSource>,
    disks: DiskTracker<ProcDiskSource>,
    socket_interval: Duration,
    disks_enabled: bool,
    last_counter_refresh: Option<Instant>,
    last_socket_refresh: Option<Instant>,
}

impl Trackers {
    pub fn new(cfg: &Config) -> Self {
        let mut trackers = Self {
            sockets: SocketTracker::new(ProcSocketTables),
            ifaces: IfaceTracker::new(ProcIfaceSource),
            disks: DiskTracker::new(ProcDiskSource),
            socket_interval: cfg.socket_poll_interval,
            disks_enabled: !cfg.disable_disk_load,
            last_counter_refresh: None,
            last_socket_refresh: None,
        };
        trackers.apply_config(cfg);
        trackers
    }

    /// Apply (or re-apply, after a reload) config-driven settings.
    pub fn apply_config(&mut self, cfg: &Config) {
        self.socket_interval = cfg.socket_poll_interval;
        self.disks_enabled = !cfg.disable_disk_load;
        self.ifaces.set_skip_p2p(cfg.skip_p2p_interfaces);

        let mut targets = Vec::with_capacity(cfg.sockets.len());
        for t in &cfg.sockets {
            match SockKey::parse(&t.addr) {
                Ok(key) => targets.push(SocketTarget {
                    name: t.name.clone(),
                    key,
                }),
                Err(e) => warn!(socket = %t.name, error = %e, "skipping unparsable socket target"),
            }
        }
        self.sockets.set_targets(targets);
    }

    /// Called on every control-loop wakeup; each engine rate-limits itself
    /// so ring-slot timing stays at its nominal cadence.
    pub fn refresh(&mut self, now: Instant) {
        if due(self.last_counter_refresh, COUNTER_INTERVAL, now) {
            self.last_counter_refresh = Some(now);
            self.ifaces.refresh();
            if self.disks_enabled {
                self.disks.refresh();
            }
        }

        if due(self.last_socket_refresh, self.socket_interval, now) {
            self.last_socket_refresh = Some(now);
            self.sockets.refresh();
        }
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            sockets: self.sockets.report(),
            ifaces: self.ifaces.report(),
            disks: if self.disks_enabled {
                self.disks.report()
            } else {
                Vec::new()
            },
        }
    }
}

fn due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    match last {
        None => true,
        Some(t) => now.duration_since(t) >= interval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_gates_by_interval() {
        let now = Instant::now();
        assert!(due(None, COUNTER_INTERVAL, now));
        assert!(!due(Some(now), COUNTER_INTERVAL, now));
        assert!(due(
            Some(now - Duration::from_secs(2)),
            COUNTER_INTERVAL,
            now
        ));
    }
}
