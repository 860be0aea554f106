use anyhow::Result;
use tracing::{debug, warn};

use super::ring::DeltaRing;

/// Full window: ~15 minutes of per-second deltas.
pub const DISK_WINDOW: usize = 900;
/// Short window: ~5 minutes.
pub const DISK_WINDOW_SHORT: usize = 300;

/// One block device's cumulative busy counter (milliseconds spent doing I/O).
#[derive(Debug, Clone)]
pub struct DiskSample {
    pub name: String,
    pub busy: u64,
}

/// Source of block device busy counters.
pub trait DiskSource {
    fn enumerate(&mut self) -> Result<Vec<DiskSample>>;
}

/// Point-in-time view of one device's load, as busy-time fraction per window.
#[derive(Debug, Clone)]
pub struct DiskReport {
    pub name: String,
    pub load5: f64,
    pub load15: f64,
}

#[derive(Debug)]
struct Entry {
    last_raw: u64,
    ring: DeltaRing,
    misses: usize,
}

/// Rolling disk load tracker.
///
/// Each tick pushes the busy-counter delta into a 900-slot ring carrying
/// rolling 5- and 15-minute sums; the exposed loads are `sum / window`.
/// A device absent this tick gets a zero delta and a miss mark; it is
/// evicted once absent for more than half the full window, so transient
/// enumeration hiccups do not drop its history.
pub struct DiskTracker<S: DiskSource> {
    source: S,
    entries: Vec<(String, Entry)>,
}

impl<S: DiskSource> DiskTracker<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            entries: Vec::new(),
        }
    }

    pub fn refresh(&mut self) {
        let samples = match self.source.enumerate() {
            Ok(samples) => samples,
            Err(e) => {
                warn!(error = %e, "disk enumeration failed");
                return;
            }
        };

        for sample in &samples {
            match self.entries.iter_mut().find(|(n, _)| *n == sample.name) {
                Some((_, entry)) => {
                    let delta = sample.busy.saturating_sub(entry.last_raw);
                    entry.ring.push(delta);
                    entry.last_raw = sample.busy;
                    entry.misses = 0;
                }
                None => {
                    // Baseline tick; deltas start next refresh.
                    self.entries.push((
                        sample.name.clone(),
                        Entry {
                            last_raw: sample.busy,
                            ring: DeltaRing::new(DISK_WINDOW, DISK_WINDOW_SHORT),
                            misses: 0,
                        },
                    ));
                }
            }
        }

        for (name, entry) in &mut self.entries {
            if !samples.iter().any(|s| s.name == *name) {
                entry.ring.push(0);
                entry.misses += 1;
            }
        }

        let half = DISK_WINDOW / 2;
        self.entries.retain(|(name, entry)| {
            if entry.misses > half {
                debug!(device = %name, "device unseen for half a window, dropping");
                false
            } else {
                true
            }
        });
    }

    pub fn report(&self) -> Vec<DiskReport> {
        self.entries
            .iter()
            .map(|(name, entry)| DiskReport {
                name: name.clone(),
                load5: entry.ring.load_short(),
                load15: entry.ring.load_full(),
            })
            .collect()
    }
}

/// Reads busy counters from `/proc/diskstats`, restricted to whole devices
/// listed under `/sys/block` (partitions are skipped).
pub struct ProcDiskSource;

impl DiskSource for ProcDiskSource {
    #[cfg(target_os = "linux")]
    fn enumerate(&mut self) -> Result<Vec<DiskSample>> {
        use std::collections::HashSet;

        use anyhow::Context;

        let devices: HashSet<String> = std::fs::read_dir("/sys/block")
            .context("listing /sys/block")?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();

        let data = std::fs::read_to_string("/proc/diskstats")
            .context("reading /proc/diskstats")?;

        Ok(parse_diskstats(&data)
            .into_iter()
            .filter(|s| devices.contains(&s.name))
            .collect())
    }

    #[cfg(not(target_os = "linux"))]
    fn enumerate(&mut self) -> Result<Vec<DiskSample>> {
        anyhow::bail!("disk enumeration is only supported on Linux")
    }
}

/// Parse `/proc/diskstats`; field 13 is cumulative milliseconds doing I/O.
fn parse_diskstats(data: &str) -> Vec<DiskSample> {
    let mut out = Vec::new();
    for line in data.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 13 {
            continue;
        }
        let Ok(busy) = fields[12].parse::<u64>() else {
            continue;
        };
        out.push(DiskSample {
            name: fields[2].to_string(),
            busy,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource {
        samples: Vec<DiskSample>,
    }

    impl DiskSource for FakeSource {
        fn enumerate(&mut self) -> Result<Vec<DiskSample>> {
            Ok(self.samples.clone())
        }
    }

    fn sample(name: &str, busy: u64) -> DiskSample {
        DiskSample {
            name: name.to_string(),
            busy,
        }
    }

    #[test]
    fn test_constant_delta_yields_constant_load() {
        let mut tracker = DiskTracker::new(FakeSource {
            samples: vec![sample("sda", 0)],
        });
        tracker.refresh();

        // 300 ticks of delta 40 each.
        let mut busy = 0u64;
        for _ in 0..DISK_WINDOW_SHORT {
            busy += 40;
            tracker.source.samples = vec![sample("sda", busy)];
            tracker.refresh();
        }
        let r = &tracker.report()[0];
        assert!((r.load5 - 40.0).abs() < 1e-9, "load5={}", r.load5);

        // Continue to 900 total ticks: 15-minute load converges too.
        for _ in 0..(DISK_WINDOW - DISK_WINDOW_SHORT) {
            busy += 40;
            tracker.source.samples = vec![sample("sda", busy)];
            tracker.refresh();
        }
        let r = &tracker.report()[0];
        assert!((r.load15 - 40.0).abs() < 1e-9, "load15={}", r.load15);
    }

    #[test]
    fn test_counter_going_backwards_clamps_to_zero() {
        let mut tracker = DiskTracker::new(FakeSource {
            samples: vec![sample("sda", 500)],
        });
        tracker.refresh();
        tracker.source.samples = vec![sample("sda", 100)];
        tracker.refresh();
        let r = &tracker.report()[0];
        assert_eq!(r.load5, 0.0);
        assert_eq!(r.load15, 0.0);
    }

    #[test]
    fn test_missing_device_decays_then_evicts() {
        let mut tracker = DiskTracker::new(FakeSource {
            samples: vec![sample("sda", 0)],
        });
        tracker.refresh();
        tracker.source.samples = vec![sample("sda", 100)];
        tracker.refresh();
        assert!(tracker.report()[0].load5 > 0.0);

        // Device disappears: zero deltas decay the load, entry survives
        // up to half the window.
        tracker.source.samples = vec![];
        for _ in 0..(DISK_WINDOW / 2) {
            tracker.refresh();
        }
        assert_eq!(tracker.report().len(), 1);

        tracker.refresh();
        assert!(tracker.report().is_empty());
    }

    #[test]
    fn test_reappearing_device_resets_miss_count() {
        let mut tracker = DiskTracker::new(FakeSource {
            samples: vec![sample("sda", 0)],
        });
        tracker.refresh();
        tracker.source.samples = vec![];
        for _ in 0..10 {
            tracker.refresh();
        }
        tracker.source.samples = vec![sample("sda", 50)];
        tracker.refresh();
        assert_eq!(tracker.entries[0].1.misses, 0);
        assert_eq!(tracker.report().len(), 1);
    }

    #[test]
    fn test_parse_diskstats() {
        let data = "\
   8       0 sda 148279 10230 6164126 21211 117437 24727 8279154 47963 0 41274 71286 0 0 0 0
   8       1 sda1 661 0 12794 61 1 0 1 0 0 85 61 0 0 0 0
 259       0 nvme0n1 97654 0 4321987 11111 5555 0 99999 2222 0 31337 13333 0 0 0 0
";
        let parsed = parse_diskstats(data);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].name, "sda");
        assert_eq!(parsed[0].busy, 41274);
        assert_eq!(parsed[2].name, "nvme0n1");
        assert_eq!(parsed[2].busy, 31337);
    }
}
