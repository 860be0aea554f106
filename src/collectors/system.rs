//! Collectors answered from local kernel state: `/proc`, `/sys` and the
//! `sysinfo` views, plus reports straight out of the tracker snapshot.

use std::fs;
use std::path::Path;

use sysinfo::{Components, Disks, Networks, System};
use tracing::{debug, warn};

use super::Ctx;

/// `time` and `timediff`: the session reference clock and how far the local
/// clock is ahead of it.
pub async fn time(ctx: &Ctx) {
    let now = ctx.clock.now();
    ctx.out.metric(now, "time", now).await;
    ctx.out.metric(now, "timediff", ctx.clock.skew()).await;
}

/// `version`: the daemon version packed as major*10000 + minor*100 + patch.
pub async fn version(ctx: &Ctx) {
    ctx.out
        .metric(ctx.clock.now(), "version", version_number())
        .await;
}

pub fn version_number() -> u64 {
    let field = |s: &str| s.parse::<u64>().unwrap_or(0);
    field(env!("CARGO_PKG_VERSION_MAJOR")) * 10_000
        + field(env!("CARGO_PKG_VERSION_MINOR")) * 100
        + field(env!("CARGO_PKG_VERSION_PATCH"))
}

/// `uname_*`: kernel identification.
pub async fn uname(ctx: &Ctx) {
    let now = ctx.clock.now();
    for (name, path) in [
        ("uname_sysname", "/proc/sys/kernel/ostype"),
        ("uname_release", "/proc/sys/kernel/osrelease"),
        ("uname_version", "/proc/sys/kernel/version"),
    ] {
        match fs::read_to_string(path) {
            Ok(v) => ctx.out.metric(now, name, v.trim()).await,
            Err(e) => debug!(path, error = %e, "uname source unreadable"),
        }
    }
    ctx.out
        .metric(now, "uname_machine", std::env::consts::ARCH)
        .await;
}

/// `uptime` plus the three load averages.
pub async fn uptime(ctx: &Ctx) {
    let now = ctx.clock.now();

    match fs::read_to_string("/proc/uptime") {
        Ok(data) => {
            if let Some(secs) = parse_uptime(&data) {
                ctx.out.metric(now, "uptime", secs).await;
            }
        }
        Err(e) => debug!(error = %e, "can't read /proc/uptime"),
    }

    match fs::read_to_string("/proc/loadavg") {
        Ok(data) => {
            if let Some([l1, l5, l15]) = parse_loadavg(&data) {
                ctx.out.metric(now, "load_average1", l1).await;
                ctx.out.metric(now, "load_average5", l5).await;
                ctx.out.metric(now, "load_average15", l15).await;
            }
        }
        Err(e) => debug!(error = %e, "can't read /proc/loadavg"),
    }
}

/// `cp_*`: cumulative CPU time counters in jiffies.
pub async fn vmstat(ctx: &Ctx) {
    let data = match fs::read_to_string("/proc/stat") {
        Ok(d) => d,
        Err(e) => {
            debug!(error = %e, "can't read /proc/stat");
            return;
        }
    };
    let Some(cpu) = parse_proc_stat_cpu(&data) else {
        warn!("no aggregate cpu line in /proc/stat");
        return;
    };

    let now = ctx.clock.now();
    ctx.out.metric(now, "cp_user", cpu.user).await;
    ctx.out.metric(now, "cp_nice", cpu.nice).await;
    ctx.out.metric(now, "cp_sys", cpu.sys).await;
    ctx.out.metric(now, "cp_intr", cpu.intr).await;
    ctx.out.metric(now, "cp_idle", cpu.idle).await;
    ctx.out.metric(now, "cp_total", cpu.total()).await;
}

/// `sysctl_<var>`: requested kernel parameters resolved via `/proc/sys`.
/// Unresolvable variables are logged and produce no output line.
pub async fn sysctl(ctx: &Ctx, vars: &[String]) {
    let now = ctx.clock.now();
    for var in vars {
        let path = format!("/proc/sys/{}", var.replace('.', "/"));
        match fs::read_to_string(&path) {
            Ok(v) => {
                let value = v.trim().replace(['\t', '\n'], " ");
                ctx.out.metric(now, &format!("sysctl_{var}"), value).await;
            }
            Err(e) => {
                if ctx.debug >= 1 {
                    debug!(var, error = %e, "sysctl variable unresolvable");
                }
            }
        }
    }
}

/// `swap_total` / `swap_used` in bytes.
pub async fn swap(ctx: &Ctx) {
    let mut sys = System::new();
    sys.refresh_memory();

    let now = ctx.clock.now();
    ctx.out.metric(now, "swap_total", sys.total_swap()).await;
    ctx.out.metric(now, "swap_used", sys.used_swap()).await;
}

/// `acpi_tz_temperature:<zone>` from `/sys/class/thermal`, degrees Celsius.
pub async fn acpi_temperature(ctx: &Ctx) {
    acpi_temperature_from(ctx, Path::new("/sys/class/thermal")).await;
}

async fn acpi_temperature_from(ctx: &Ctx, root: &Path) {
    let entries = match fs::read_dir(root) {
        Ok(e) => e,
        Err(e) => {
            debug!(error = %e, "no thermal zone directory");
            return;
        }
    };

    let now = ctx.clock.now();
    for entry in entries.flatten() {
        let dir_name = entry.file_name();
        let Some(dir_name) = dir_name.to_str() else {
            continue;
        };
        if !dir_name.starts_with("thermal_zone") {
            continue;
        }

        let raw = match fs::read_to_string(entry.path().join("temp")) {
            Ok(v) => v,
            Err(e) => {
                debug!(zone = dir_name, error = %e, "thermal zone without readable temp");
                continue;
            }
        };
        let Ok(millis) = raw.trim().parse::<i64>() else {
            continue;
        };

        let zone = fs::read_to_string(entry.path().join("type"))
            .map(|t| instance_name(t.trim()))
            .unwrap_or_else(|_| dir_name.to_string());

        ctx.out
            .metric_inst(
                now,
                "acpi_tz_temperature",
                &zone,
                format!("{:.1}", millis as f64 / 1000.0),
            )
            .await;
    }
}

/// `cpu_temperature:<label>` from hardware monitoring sensors. Sensors
/// without a current reading are skipped.
pub async fn cputemp(ctx: &Ctx) {
    let components = Components::new_with_refreshed_list();
    let now = ctx.clock.now();
    for c in &components {
        let Some((inst, value)) = temperature_line(c.label(), c.temperature()) else {
            continue;
        };
        ctx.out
            .metric_inst(now, "cpu_temperature", &inst, value)
            .await;
    }
}

/// Instance and rendered value for one sensor reading; `None` when the
/// sensor has nothing to report right now.
fn temperature_line(label: &str, temperature: Option<f32>) -> Option<(String, String)> {
    let t = temperature?;
    Some((instance_name(label), format!("{t:.1}")))
}

/// `df_size` / `df_used` / `df_avail` per mounted filesystem, in KiB.
pub async fn df(ctx: &Ctx) {
    let disks = Disks::new_with_refreshed_list();
    let now = ctx.clock.now();
    for d in &disks {
        let mount = d.mount_point().to_string_lossy();
        let size_kib = d.total_space() / 1024;
        let avail_kib = d.available_space() / 1024;
        let used_kib = size_kib.saturating_sub(avail_kib);
        ctx.out.metric_inst(now, "df_size", &mount, size_kib).await;
        ctx.out.metric_inst(now, "df_used", &mount, used_kib).await;
        ctx.out.metric_inst(now, "df_avail", &mount, avail_kib).await;
    }
}

/// `interface_address:<if>` per configured interface address.
pub async fn ifaddrs(ctx: &Ctx) {
    let networks = Networks::new_with_refreshed_list();
    let now = ctx.clock.now();
    for (name, data) in &networks {
        for net in data.ip_networks() {
            ctx.out
                .metric_inst(now, "interface_address", name, net.addr)
                .await;
        }
    }
}

/// `interface_*:<if>`: the accumulated wraparound-safe counters from the
/// interface tracker snapshot.
pub async fn netstat(ctx: &Ctx) {
    let now = ctx.clock.now();
    for iface in &ctx.snapshot.ifaces {
        let c = &iface.counters;
        for (name, value) in [
            ("interface_ipackets", c.ipackets),
            ("interface_ibytes", c.ibytes),
            ("interface_ierrors", c.ierrors),
            ("interface_opackets", c.opackets),
            ("interface_obytes", c.obytes),
            ("interface_oerrors", c.oerrors),
            ("interface_collisions", c.collisions),
        ] {
            ctx.out.metric_inst(now, name, &iface.name, value).await;
        }
    }
}

/// `socket_*:<name>`: queue statistics per monitored socket.
pub async fn socket_report(ctx: &Ctx) {
    let now = ctx.clock.now();
    for s in &ctx.snapshot.sockets {
        let n = &s.name;
        ctx.out
            .metric_inst(now, "socket_exist", n, u8::from(s.exists))
            .await;
        ctx.out
            .metric_inst(now, "socket_queue_receive_limit", n, s.queue_limit)
            .await;
        ctx.out
            .metric_inst(now, "socket_queue_receive_length", n, s.queue_len)
            .await;
        ctx.out
            .metric_inst(
                now,
                "socket_queue_receive_load_average",
                n,
                format!("{:.2}", s.load_average),
            )
            .await;
        ctx.out
            .metric_inst(now, "socket_queue_receive_peak_max", n, s.peak)
            .await;
    }
}

/// `hdd_load5` / `hdd_load15` per tracked block device.
pub async fn hdd_load(ctx: &Ctx) {
    let now = ctx.clock.now();
    for d in &ctx.snapshot.disks {
        ctx.out
            .metric_inst(now, "hdd_load5", &d.name, format!("{:.2}", d.load5))
            .await;
        ctx.out
            .metric_inst(now, "hdd_load15", &d.name, format!("{:.2}", d.load15))
            .await;
    }
}

/// Sensor labels and zone types become metric instances; whitespace is not
/// representable there.
fn instance_name(label: &str) -> String {
    label.replace(char::is_whitespace, "_")
}

#[derive(Debug, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub sys: u64,
    pub intr: u64,
    pub idle: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user + self.nice + self.sys + self.intr + self.idle
    }
}

/// Aggregate `cpu ` line of `/proc/stat`. Interrupt time folds irq and
/// softirq together; idle folds in iowait.
pub fn parse_proc_stat_cpu(data: &str) -> Option<CpuTimes> {
    let line = data
        .lines()
        .find(|l| l.starts_with("cpu ") || *l == "cpu")?;
    let mut fields = line.split_whitespace().skip(1);
    let mut next = || fields.next().and_then(|f| f.parse::<u64>().ok());

    let user = next()?;
    let nice = next()?;
    let system = next()?;
    let idle = next()?;
    let iowait = next().unwrap_or(0);
    let irq = next().unwrap_or(0);
    let softirq = next().unwrap_or(0);

    Some(CpuTimes {
        user,
        nice,
        sys: system,
        intr: irq + softirq,
        idle: idle + iowait,
    })
}

/// First field of `/proc/uptime`, truncated to whole seconds.
pub fn parse_uptime(data: &str) -> Option<u64> {
    let first = data.split_whitespace().next()?;
    let secs: f64 = first.parse().ok()?;
    Some(secs as u64)
}

/// First three fields of `/proc/loadavg`, kept verbatim.
pub fn parse_loadavg(data: &str) -> Option<[String; 3]> {
    let mut fields = data.split_whitespace();
    let l1 = fields.next()?.to_string();
    let l5 = fields.next()?.to_string();
    let l15 = fields.next()?.to_string();
    Some([l1, l5, l15])
}
