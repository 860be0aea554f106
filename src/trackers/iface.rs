use anyhow::Result;
use tracing::warn;

/// Per-interface traffic counters. Raw readings may be narrow and wrap;
/// accumulated values are always wide and monotonically non-decreasing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IfaceCounters {
    pub ipackets: u64,
    pub ibytes: u64,
    pub ierrors: u64,
    pub opackets: u64,
    pub obytes: u64,
    pub oerrors: u64,
    pub collisions: u64,
}

impl IfaceCounters {
    /// Add the forward difference `new - old` modulo the counter width.
    /// Wraparound yields the correct positive delta, never a negative one.
    fn add_delta(&mut self, old: &IfaceCounters, new: &IfaceCounters, mask: u64) {
        self.ipackets += new.ipackets.wrapping_sub(old.ipackets) & mask;
        self.ibytes += new.ibytes.wrapping_sub(old.ibytes) & mask;
        self.ierrors += new.ierrors.wrapping_sub(old.ierrors) & mask;
        self.opackets += new.opackets.wrapping_sub(old.opackets) & mask;
        self.obytes += new.obytes.wrapping_sub(old.obytes) & mask;
        self.oerrors += new.oerrors.wrapping_sub(old.oerrors) & mask;
        self.collisions += new.collisions.wrapping_sub(old.collisions) & mask;
    }
}

/// One interface as seen in a single enumeration pass.
#[derive(Debug, Clone)]
pub struct IfaceSample {
    pub name: String,
    pub up: bool,
    pub loopback: bool,
    pub point_to_point: bool,
    pub counters: IfaceCounters,
}

/// Source of interface counter readings.
pub trait IfaceSource {
    fn enumerate(&mut self) -> Result<Vec<IfaceSample>>;

    /// Modulus mask of the raw counters (`u32::MAX` for 32-bit sources).
    fn counter_mask(&self) -> u64 {
        u64::MAX
    }
}

/// Point-in-time view of one interface's accumulated counters.
#[derive(Debug, Clone)]
pub struct IfaceReport {
    pub name: String,
    pub counters: IfaceCounters,
}

#[derive(Debug)]
struct Entry {
    last_raw: IfaceCounters,
    wide: IfaceCounters,
}

/// Cumulative counter tracker for up, non-loopback interfaces.
///
/// Each tick accumulates the wrap-safe delta since the previous reading into
/// wide counters. Interfaces absent from a tick are packed out immediately;
/// a re-appearing interface starts from zero again.
pub struct IfaceTracker<S: IfaceSource> {
    source: S,
    skip_p2p: bool,
    entries: Vec<(String, Entry)>,
}

impl<S: IfaceSource> IfaceTracker<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            skip_p2p: false,
            entries: Vec::new(),
        }
    }

    pub fn set_skip_p2p(&mut self, skip: bool) {
        self.skip_p2p = skip;
    }

    pub fn refresh(&mut self) {
        let samples = match self.source.enumerate() {
            Ok(samples) => samples,
            Err(e) => {
                warn!(error = %e, "interface enumeration failed");
                return;
            }
        };
        let mask = self.source.counter_mask();

        let mut seen: Vec<&str> = Vec::with_capacity(samples.len());
        for sample in &samples {
            if !sample.up || sample.loopback || (self.skip_p2p && sample.point_to_point) {
                continue;
            }
            seen.push(&sample.name);
            match self.entries.iter_mut().find(|(n, _)| *n == sample.name) {
                Some((_, entry)) => {
                    entry.wide.add_delta(&entry.last_raw, &sample.counters, mask);
                    entry.last_raw = sample.counters;
                }
                None => {
                    // First sight is the baseline; counting starts next tick.
                    self.entries.push((
                        sample.name.clone(),
                        Entry {
                            last_raw: sample.counters,
                            wide: IfaceCounters::default(),
                        },
                    ));
                }
            }
        }

        self.entries.retain(|(name, _)| seen.contains(&name.as_str()));
    }

    pub fn report(&self) -> Vec<IfaceReport> {
        self.entries
            .iter()
            .map(|(name, entry)| IfaceReport {
                name: name.clone(),
                counters: entry.wide,
            })
            .collect()
    }
}

/// Reads interface counters from `/proc/net/dev` and admin flags from
/// `/sys/class/net/<name>/flags`.
pub struct ProcIfaceSource;

#[cfg(target_os = "linux")]
const IFF_UP: u64 = 0x1;
#[cfg(target_os = "linux")]
const IFF_LOOPBACK: u64 = 0x8;
#[cfg(target_os = "linux")]
const IFF_POINTOPOINT: u64 = 0x10;

impl IfaceSource for ProcIfaceSource {
    #[cfg(target_os = "linux")]
    fn enumerate(&mut self) -> Result<Vec<IfaceSample>> {
        use anyhow::Context;

        let data = std::fs::read_to_string("/proc/net/dev")
            .context("reading /proc/net/dev")?;

        let mut samples = Vec::new();
        for (name, counters) in parse_net_dev(&data) {
            let flags_path = format!("/sys/class/net/{name}/flags");
            let flags = std::fs::read_to_string(&flags_path)
                .ok()
                .and_then(|s| u64::from_str_radix(s.trim().trim_start_matches("0x"), 16).ok())
                .unwrap_or(0);
            samples.push(IfaceSample {
                name,
                up: flags & IFF_UP != 0,
                loopback: flags & IFF_LOOPBACK != 0,
                point_to_point: flags & IFF_POINTOPOINT != 0,
                counters,
            });
        }
        Ok(samples)
    }

    #[cfg(not(target_os = "linux"))]
    fn enumerate(&mut self) -> Result<Vec<IfaceSample>> {
        anyhow::bail!("interface enumeration is only supported on Linux")
    }
}

/// Parse `/proc/net/dev` into per-interface counters.
fn parse_net_dev(data: &str) -> Vec<(String, IfaceCounters)> {
    let mut out = Vec::new();
    for line in data.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<u64> = rest
            .split_whitespace()
            .filter_map(|f| f.parse().ok())
            .collect();
        if fields.len() < 16 {
            continue;
        }
        out.push((
            name.trim().to_string(),
            IfaceCounters {
                ibytes: fields[0],
                ipackets: fields[1],
                ierrors: fields[2],
                obytes: fields[8],
                opackets: fields[9],
                oerrors: fields[10],
                collisions: fields[13],
            },
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource {
        samples: Vec<IfaceSample>,
        mask: u64,
    }

    impl IfaceSource for FakeSource {
        fn enumerate(&mut self) -> Result<Vec<IfaceSample>> {
            Ok(self.samples.clone())
        }

        fn counter_mask(&self) -> u64 {
            self.mask
        }
    }

    fn sample(name: &str, ibytes: u64) -> IfaceSample {
        IfaceSample {
            name: name.to_string(),
            up: true,
            loopback: false,
            point_to_point: false,
            counters: IfaceCounters {
                ibytes,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_first_sight_is_baseline_only() {
        let mut tracker = IfaceTracker::new(FakeSource {
            samples: vec![sample("eth0", 1000)],
            mask: u64::MAX,
        });
        tracker.refresh();
        let reports = tracker.report();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].counters.ibytes, 0);
    }

    #[test]
    fn test_deltas_accumulate_into_wide_counters() {
        let mut tracker = IfaceTracker::new(FakeSource {
            samples: vec![sample("eth0", 1000)],
            mask: u64::MAX,
        });
        tracker.refresh();
        tracker.source.samples = vec![sample("eth0", 1500)];
        tracker.refresh();
        tracker.source.samples = vec![sample("eth0", 1600)];
        tracker.refresh();
        assert_eq!(tracker.report()[0].counters.ibytes, 600);
    }

    #[test]
    fn test_wraparound_adds_forward_difference() {
        // 32-bit counters: a=MAX-10, b=5 means (M - a) + b = 16 new bytes.
        let a = u64::from(u32::MAX) - 10;
        let mut tracker = IfaceTracker::new(FakeSource {
            samples: vec![sample("eth0", a)],
            mask: u64::from(u32::MAX),
        });
        tracker.refresh();
        tracker.source.samples = vec![sample("eth0", 5)];
        tracker.refresh();
        assert_eq!(tracker.report()[0].counters.ibytes, 16);
    }

    #[test]
    fn test_unseen_interface_packed_out_and_restarts() {
        let mut tracker = IfaceTracker::new(FakeSource {
            samples: vec![sample("eth0", 1000), sample("eth1", 50)],
            mask: u64::MAX,
        });
        tracker.refresh();
        tracker.source.samples = vec![
            sample("eth0", 2000),
            sample("eth1", 60),
        ];
        tracker.refresh();

        tracker.source.samples = vec![sample("eth0", 3000)];
        tracker.refresh();
        let reports = tracker.report();
        let names: Vec<&str> = reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["eth0"]);

        // eth1 re-appears: fresh baseline, no retroactive counting.
        tracker.source.samples = vec![sample("eth0", 3100), sample("eth1", 90)];
        tracker.refresh();
        let reports = tracker.report();
        assert_eq!(reports[1].name, "eth1");
        assert_eq!(reports[1].counters.ibytes, 0);
    }

    #[test]
    fn test_down_loopback_and_p2p_filtering() {
        let mut down = sample("eth0", 1);
        down.up = false;
        let mut lo = sample("lo", 2);
        lo.loopback = true;
        let mut tun = sample("tun0", 3);
        tun.point_to_point = true;

        let mut tracker = IfaceTracker::new(FakeSource {
            samples: vec![down, lo, tun.clone(), sample("eth1", 4)],
            mask: u64::MAX,
        });
        tracker.set_skip_p2p(true);
        tracker.refresh();
        let names: Vec<String> = tracker.report().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["eth1"]);

        // With p2p watching enabled the tunnel is tracked too.
        tracker.set_skip_p2p(false);
        tracker.source.samples = vec![tun, sample("eth1", 8)];
        tracker.refresh();
        let names: Vec<String> = tracker.report().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["eth1", "tun0"]);
    }

    #[test]
    fn test_parse_net_dev() {
        let data = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 1234567   9876    0    0    0     0          0         0  1234567    9876    0    0    0     0       0          0
  eth0: 500000     400    2    0    0     0          0         0   600000     300    1    0    0     7       0          0
";
        let parsed = parse_net_dev(data);
        assert_eq!(parsed.len(), 2);
        let (name, c) = &parsed[1];
        assert_eq!(name, "eth0");
        assert_eq!(c.ibytes, 500000);
        assert_eq!(c.ipackets, 400);
        assert_eq!(c.ierrors, 2);
        assert_eq!(c.obytes, 600000);
        assert_eq!(c.opackets, 300);
        assert_eq!(c.oerrors, 1);
        assert_eq!(c.collisions, 7);
    }
}
