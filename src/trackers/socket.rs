use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::ring::SampleWindow;

/// Samples kept per monitored socket (~5 minutes at one tick per second).
pub const SOCKET_WINDOW: usize = 300;

/// Kernel socket table kinds a tracker entry can be found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SockTable {
    Tcp,
    Tcp6,
    Udp,
    Udp6,
    Unix,
}

/// A monitored socket's bound identity, as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockKey {
    Inet(SocketAddr),
    Unix(String),
}

impl SockKey {
    /// Parse a configured address: `ip:port` for inet sockets, an absolute
    /// path for unix-domain sockets.
    pub fn parse(s: &str) -> Result<Self> {
        if s.starts_with('/') {
            return Ok(Self::Unix(s.to_string()));
        }
        let addr: SocketAddr = s
            .parse()
            .with_context(|| format!("invalid socket address '{s}'"))?;
        Ok(Self::Inet(addr))
    }

    fn candidate_tables(&self) -> &'static [SockTable] {
        match self {
            Self::Inet(a) if a.is_ipv4() => &[SockTable::Tcp, SockTable::Udp],
            Self::Inet(_) => &[SockTable::Tcp6, SockTable::Udp6],
            Self::Unix(_) => &[SockTable::Unix],
        }
    }
}

/// One live kernel socket as seen in a table scan.
#[derive(Debug, Clone, PartialEq)]
pub struct SockRow {
    pub key: SockKey,
    pub inode: u64,
    pub queue_len: u64,
    pub queue_limit: u64,
}

/// Source of kernel socket table contents.
///
/// The tracker only ever calls `scan`; keeping the OS read behind this trait
/// lets tests drive the tracker with fabricated tables.
pub trait SocketTables {
    fn scan(&mut self, table: SockTable) -> Result<Vec<SockRow>>;
}

/// A configured socket to monitor.
#[derive(Debug, Clone)]
pub struct SocketTarget {
    pub name: String,
    pub key: SockKey,
}

/// Point-in-time view of one monitored socket, handed to sessions.
#[derive(Debug, Clone)]
pub struct SocketReport {
    pub name: String,
    pub exists: bool,
    pub queue_limit: u64,
    pub queue_len: u64,
    pub load_average: f64,
    pub peak: u64,
}

#[derive(Debug)]
struct Entry {
    name: String,
    window: SampleWindow,
    queue_limit: u64,
    last_len: u64,
    /// Table + inode of the last match, tried before address matching.
    cached: Option<(SockTable, u64)>,
}

impl Entry {
    fn new(name: String) -> Self {
        Self {
            name,
            window: SampleWindow::new(SOCKET_WINDOW),
            queue_limit: 0,
            last_len: 0,
            cached: None,
        }
    }
}

/// Sliding-window accept/receive queue tracker for configured sockets.
///
/// Refreshed once per tick by the control loop. Each configured socket that
/// has been seen at least once owns a 300-slot window; ticks where the socket
/// cannot be matched push a gap sample so the average reflects true
/// unavailability. Entries unseen across more than half their window are
/// compacted out in order-preserving fashion and recreated on the next match.
pub struct SocketTracker<T: SocketTables> {
    tables: T,
    targets: Vec<SocketTarget>,
    entries: Vec<Entry>,
}

impl<T: SocketTables> SocketTracker<T> {
    pub fn new(tables: T) -> Self {
        Self {
            tables,
            targets: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Replace the monitored target list (initial load and SIGHUP reload).
    /// Entries for targets no longer configured are dropped.
    pub fn set_targets(&mut self, targets: Vec<SocketTarget>) {
        self.entries
            .retain(|e| targets.iter().any(|t| t.name == e.name));
        self.targets = targets;
    }

    /// Refresh every monitored socket from the kernel tables.
    pub fn refresh(&mut self) {
        let tables = &mut self.tables;
        let targets = &self.targets;
        let entries = &mut self.entries;

        // Each table is scanned at most once per tick.
        let mut scans: HashMap<SockTable, Vec<SockRow>> = HashMap::new();

        for target in targets {
            let idx = entries.iter().position(|e| e.name == target.name);

            let mut hit: Option<(SockTable, SockRow)> = None;

            // Cheap direct re-check by cached inode first. A miss or an
            // address mismatch invalidates the cache immediately.
            if let Some(i) = idx {
                if let Some((table, inode)) = entries[i].cached {
                    let rows = scan_memo(&mut scans, tables, table);
                    match rows.iter().find(|r| r.inode == inode) {
                        Some(row) if row.key == target.key => {
                            hit = Some((table, row.clone()));
                        }
                        _ => entries[i].cached = None,
                    }
                }
            }

            // Full address match across the tables this key can live in.
            if hit.is_none() {
                for &table in target.key.candidate_tables() {
                    let rows = scan_memo(&mut scans, tables, table);
                    if let Some(row) = rows.iter().find(|r| r.key == target.key) {
                        hit = Some((table, row.clone()));
                        break;
                    }
                }
            }

            match hit {
                Some((table, row)) => {
                    let i = match idx {
                        Some(i) => i,
                        None => {
                            entries.push(Entry::new(target.name.clone()));
                            entries.len() - 1
                        }
                    };
                    let e = &mut entries[i];
                    e.window.push(Some(row.queue_len));
                    e.queue_limit = row.queue_limit;
                    e.last_len = row.queue_len;
                    e.cached = Some((table, row.inode));
                }
                None => {
                    if let Some(i) = idx {
                        entries[i].window.push(None);
                        entries[i].cached = None;
                    }
                }
            }
        }

        // Compact out entries absent across more than half their window.
        let half = SOCKET_WINDOW / 2;
        entries.retain(|e| {
            let gone = e.window.gap_count() > half && e.window.trailing_gap_run() > half;
            if gone {
                debug!(socket = %e.name, "socket unseen for half a window, dropping");
            }
            !gone
        });
    }

    /// Reports in configured order, one per target.
    pub fn report(&self) -> Vec<SocketReport> {
        self.targets
            .iter()
            .map(|t| {
                let entry = self.entries.iter().find(|e| e.name == t.name);
                match entry {
                    Some(e) => {
                        let exists = matches!(e.window.last(), Some(Some(_)));
                        SocketReport {
                            name: t.name.clone(),
                            exists,
                            queue_limit: e.queue_limit,
                            queue_len: if exists { e.last_len } else { 0 },
                            load_average: e.window.average().unwrap_or(0.0),
                            // Peak over the current window, not all time.
                            peak: e.window.real_max().unwrap_or(0),
                        }
                    }
                    None => SocketReport {
                        name: t.name.clone(),
                        exists: false,
                        queue_limit: 0,
                        queue_len: 0,
                        load_average: 0.0,
                        peak: 0,
                    },
                }
            })
            .collect()
    }

    #[cfg(test)]
    fn entry_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }
}

fn scan_memo<'a, T: SocketTables>(
    scans: &'a mut HashMap<SockTable, Vec<SockRow>>,
    tables: &mut T,
    table: SockTable,
) -> &'a [SockRow] {
    scans.entry(table).or_insert_with(|| match tables.scan(table) {
        Ok(rows) => rows,
        Err(e) => {
            warn!(table = ?table, error = %e, "socket table scan failed");
            Vec::new()
        }
    })
}

/// Reads kernel socket tables from `/proc/net`.
pub struct ProcSocketTables;

impl SocketTables for ProcSocketTables {
    #[cfg(target_os = "linux")]
    fn scan(&mut self, table: SockTable) -> Result<Vec<SockRow>> {
        let (path, v6) = match table {
            SockTable::Tcp => ("/proc/net/tcp", false),
            SockTable::Tcp6 => ("/proc/net/tcp6", true),
            SockTable::Udp => ("/proc/net/udp", false),
            SockTable::Udp6 => ("/proc/net/udp6", true),
            SockTable::Unix => {
                let data = std::fs::read_to_string("/proc/net/unix")
                    .context("reading /proc/net/unix")?;
                return Ok(parse_unix_table(&data));
            }
        };
        let data =
            std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        let listen_only = matches!(table, SockTable::Tcp | SockTable::Tcp6);
        Ok(parse_inet_table(&data, v6)
            .into_iter()
            .filter(|(state, _)| !listen_only || *state == TCP_LISTEN)
            .map(|(_, row)| row)
            .collect())
    }

    #[cfg(not(target_os = "linux"))]
    fn scan(&mut self, _table: SockTable) -> Result<Vec<SockRow>> {
        anyhow::bail!("socket table scanning is only supported on Linux")
    }
}

const TCP_LISTEN: u8 = 0x0a;

/// Parse a `/proc/net/tcp`-style table into (state, row) pairs.
fn parse_inet_table(data: &str, v6: bool) -> Vec<(u8, SockRow)> {
    let mut rows = Vec::new();
    for line in data.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let Some(addr) = parse_hex_sockaddr(fields[1], v6) else {
            continue;
        };
        let Ok(state) = u8::from_str_radix(fields[3], 16) else {
            continue;
        };
        // tx_queue:rx_queue; the receive side is the queue being watched.
        let Some((tx, rx)) = fields[4].split_once(':') else {
            continue;
        };
        let (Ok(limit), Ok(len)) = (
            u64::from_str_radix(tx, 16),
            u64::from_str_radix(rx, 16),
        ) else {
            continue;
        };
        let Ok(inode) = fields[9].parse::<u64>() else {
            continue;
        };
        rows.push((
            state,
            SockRow {
                key: SockKey::Inet(addr),
                inode,
                queue_len: len,
                queue_limit: limit,
            },
        ));
    }
    rows
}

/// Parse `/proc/net/unix`; only named sockets are of interest. The kernel
/// does not expose a queue length here, so matched entries sample as zero.
fn parse_unix_table(data: &str) -> Vec<SockRow> {
    let mut rows = Vec::new();
    for line in data.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let Ok(inode) = fields[6].parse::<u64>() else {
            continue;
        };
        let path = fields[7];
        if !path.starts_with('/') {
            continue;
        }
        rows.push(SockRow {
            key: SockKey::Unix(path.to_string()),
            inode,
            queue_len: 0,
            queue_limit: 0,
        });
    }
    rows
}

/// Parse the kernel's hex address:port encoding (`0100007F:0CEA`).
fn parse_hex_sockaddr(s: &str, v6: bool) -> Option<SocketAddr> {
    let (addr_hex, port_hex) = s.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let ip: IpAddr = if v6 {
        if addr_hex.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for i in 0..4 {
            let word = u32::from_str_radix(&addr_hex[i * 8..(i + 1) * 8], 16).ok()?;
            bytes[i * 4..(i + 1) * 4].copy_from_slice(&word.swap_bytes().to_be_bytes());
        }
        IpAddr::V6(Ipv6Addr::from(bytes))
    } else {
        let raw = u32::from_str_radix(addr_hex, 16).ok()?;
        IpAddr::V4(Ipv4Addr::from(raw.swap_bytes()))
    };
    Some(SocketAddr::new(ip, port))
}
