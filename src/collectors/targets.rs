//! Sub-target workers: one task per configured target, spawned into the
//! session's `JoinSet` and bounded by the per-target timeout. A slow or dead
//! target costs its own worker, never the rest of the session.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{CacheTargetConfig, HttpTargetConfig};
use crate::session::registry::valid_var_name;
use crate::trackers::socket::SockKey;

use super::Ctx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpKind {
    Apache,
    Nginx,
}

impl HttpKind {
    fn label(self) -> &'static str {
        match self {
            HttpKind::Apache => "apache",
            HttpKind::Nginx => "nginx",
        }
    }
}

/// Spawn one worker per configured apache/nginx status page.
pub fn spawn_http(subs: &mut JoinSet<()>, ctx: &Ctx, kind: HttpKind) {
    let targets = match kind {
        HttpKind::Apache => ctx.cfg.apache.clone(),
        HttpKind::Nginx => ctx.cfg.nginx.clone(),
    };
    for target in targets {
        let ctx = ctx.clone();
        let budget = ctx.cfg.limits.target_timeout;
        subs.spawn(async move {
            bounded(budget, kind.label(), &target.name, http_target(&ctx, kind, &target)).await;
        });
    }
}

/// Spawn one worker per configured memcache server.
pub fn spawn_memcache(subs: &mut JoinSet<()>, ctx: &Ctx) {
    for target in ctx.cfg.memcache.clone() {
        let ctx = ctx.clone();
        let budget = ctx.cfg.limits.target_timeout;
        subs.spawn(async move {
            bounded(budget, "memcache", &target.name, memcache_target(&ctx, &target)).await;
        });
    }
}

/// Spawn one worker per configured exec command. Exec workers handle their
/// own timeout so the spawned process group can be killed, not just dropped.
pub fn spawn_exec(subs: &mut JoinSet<()>, ctx: &Ctx) {
    for (i, target) in ctx.cfg.exec.clone().into_iter().enumerate() {
        let ctx = ctx.clone();
        let budget = ctx.cfg.limits.target_timeout;
        subs.spawn(async move {
            exec_target(&ctx, &target.command, i, budget).await;
        });
    }
}

/// Run a worker under the target budget, logging timeouts and failures.
async fn bounded(
    budget: Duration,
    kind: &str,
    name: &str,
    work: impl std::future::Future<Output = Result<()>>,
) {
    match timeout(budget, work).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(kind, target = name, error = %e, "target failed"),
        Err(_) => warn!(kind, target = name, "target timed out"),
    }
}

async fn http_target(ctx: &Ctx, kind: HttpKind, target: &HttpTargetConfig) -> Result<()> {
    let body = reqwest::get(&target.url)
        .await
        .with_context(|| format!("fetching {}", target.url))?
        .error_for_status()
        .context("status page returned an error")?
        .text()
        .await
        .context("reading status page body")?;

    let now = ctx.clock.now();
    match kind {
        HttpKind::Apache => {
            for (var, value) in parse_apache_status(&body) {
                ctx.out
                    .metric_inst(now, &format!("apache_{var}"), &target.name, value)
                    .await;
            }
        }
        HttpKind::Nginx => {
            let status =
                parse_nginx_status(&body).context("unrecognized stub_status body")?;
            for (var, value) in [
                ("nginx_accepts", status.accepts),
                ("nginx_handled", status.handled),
                ("nginx_requests", status.requests),
                ("nginx_active", status.active),
                ("nginx_reading", status.reading),
                ("nginx_writing", status.writing),
                ("nginx_waiting", status.waiting),
            ] {
                ctx.out.metric_inst(now, var, &target.name, value).await;
            }
        }
    }
    Ok(())
}

async fn memcache_target(ctx: &Ctx, target: &CacheTargetConfig) -> Result<()> {
    let key = SockKey::parse(&target.addr)?;
    let stats = match key {
        SockKey::Inet(addr) => {
            let mut stream = tokio::net::TcpStream::connect(addr)
                .await
                .with_context(|| format!("connecting to {addr}"))?;
            read_memcache_stats(&mut stream).await?
        }
        SockKey::Unix(path) => {
            #[cfg(unix)]
            {
                let mut stream = tokio::net::UnixStream::connect(&path)
                    .await
                    .with_context(|| format!("connecting to {path}"))?;
                read_memcache_stats(&mut stream).await?
            }
            #[cfg(not(unix))]
            {
                anyhow::bail!("unix socket target {path} unsupported on this platform");
            }
        }
    };

    let now = ctx.clock.now();
    for (var, value) in stats {
        if !valid_var_name(&var) {
            debug!(target = %target.name, var, "skipping stat with unusable name");
            continue;
        }
        ctx.out
            .metric_inst(now, &format!("memcache_{var}"), &target.name, value)
            .await;
    }
    Ok(())
}

/// Issue `stats` and collect `STAT <name> <value>` rows until `END`.
async fn read_memcache_stats<S>(stream: &mut S) -> Result<Vec<(String, String)>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(b"stats\r\n").await?;
    stream.flush().await?;

    let mut stats = Vec::new();
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end_matches('\r');
        if line == "END" {
            break;
        }
        if let Some((name, value)) = parse_stat_line(line) {
            stats.push((name.to_string(), value.to_string()));
        }
    }
    Ok(stats)
}

fn parse_stat_line(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix("STAT ")?;
    let (name, value) = rest.split_once(' ')?;
    Some((name, value.trim()))
}

/// Run a shell command and emit `exec_<var>` for each well-formed
/// `var value` stdout line. On timeout the command's whole process group is
/// killed so shell children cannot linger.
async fn exec_target(ctx: &Ctx, command: &str, index: usize, budget: Duration) {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!(index, error = %e, "can't spawn exec target");
            return;
        }
    };
    let pid = child.id();

    if timeout(budget, drive_exec(ctx, &mut child)).await.is_err() {
        warn!(index, "exec target timed out");
        kill_group(pid);
        let _ = child.wait().await;
    }
}

async fn drive_exec(ctx: &Ctx, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some((var, value)) = parse_exec_line(&line) {
                        ctx.out
                            .metric(ctx.clock.now(), &format!("exec_{var}"), value)
                            .await;
                    } else if !line.trim().is_empty() {
                        debug!(line, "ignoring malformed exec output line");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "exec stdout read failed");
                    break;
                }
            }
        }
    }

    match child.wait().await {
        Ok(status) if !status.success() => debug!(%status, "exec target exited nonzero"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "waiting for exec target"),
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // The child is its own process group leader (process_group(0)).
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

/// `var value`: exactly two tokens, metric name then value. Lines with
/// trailing tokens or an invalid name are dropped.
fn parse_exec_line(line: &str) -> Option<(&str, &str)> {
    let mut fields = line.split_whitespace();
    let var = fields.next()?;
    let value = fields.next()?;
    if fields.next().is_some() || !valid_var_name(var) {
        return None;
    }
    Some((var, value))
}

/// Key/value pairs of a mod_status `?auto` page, keys normalized to metric
/// names. Multi-token values (the scoreboard) are dropped.
pub fn parse_apache_status(body: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() || value.contains(char::is_whitespace) {
            continue;
        }
        let var: String = key
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        if valid_var_name(&var) {
            out.push((var, value.to_string()));
        }
    }
    out
}

#[derive(Debug, PartialEq, Eq)]
pub struct NginxStatus {
    pub active: u64,
    pub accepts: u64,
    pub handled: u64,
    pub requests: u64,
    pub reading: u64,
    pub writing: u64,
    pub waiting: u64,
}

/// The three-line nginx stub_status body.
pub fn parse_nginx_status(body: &str) -> Option<NginxStatus> {
    let mut active = None;
    let mut counters = None;
    let mut reading = None;
    let mut writing = None;
    let mut waiting = None;

    let mut lines = body.lines().peekable();
    while let Some(line) = lines.next() {
        if let Some(rest) = line.strip_prefix("Active connections:") {
            active = rest.trim().parse::<u64>().ok();
        } else if line.trim() == "server accepts handled requests" {
            let nums = lines.next()?;
            let mut fields = nums.split_whitespace();
            let a = fields.next()?.parse::<u64>().ok()?;
            let h = fields.next()?.parse::<u64>().ok()?;
            let r = fields.next()?.parse::<u64>().ok()?;
            counters = Some((a, h, r));
        } else if line.starts_with("Reading:") {
            let mut fields = line.split_whitespace();
            while let Some(field) = fields.next() {
                let slot = match field {
                    "Reading:" => &mut reading,
                    "Writing:" => &mut writing,
                    "Waiting:" => &mut waiting,
                    _ => continue,
                };
                *slot = fields.next()?.parse::<u64>().ok();
            }
        }
    }

    let (accepts, handled, requests) = counters?;
    Some(NginxStatus {
        active: active?,
        accepts,
        handled,
        requests,
        reading: reading?,
        writing: writing?,
        waiting: waiting?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_parse_apache_status_auto_page() {
        let body = "Total Accesses: 845\n\
                    Total kBytes: 1069\n\
                    CPULoad: .0125891\n\
                    Uptime: 1590\n\
                    ReqPerSec: .531447\n\
                    BusyWorkers: 1\n\
                    IdleWorkers: 4\n\
                    Scoreboard: _W___.............\n";
        let stats = parse_apache_status(body);
        assert!(stats.contains(&("total_accesses".to_string(), "845".to_string())));
        assert!(stats.contains(&("cpuload".to_string(), ".0125891".to_string())));
        assert!(stats.contains(&("busyworkers".to_string(), "1".to_string())));
        // The scoreboard survives too; it is a single token.
        assert!(stats.iter().any(|(k, _)| k == "scoreboard"));
    }

    #[test]
    fn test_parse_apache_status_skips_junk() {
        let body = "no colon here\nEmpty:\nSpaced: a b c\n";
        assert!(parse_apache_status(body).is_empty());
    }

    #[test]
    fn test_parse_nginx_status() {
        let body = "Active connections: 291 \n\
                    server accepts handled requests\n \
                    16630948 16630948 31070465 \n\
                    Reading: 6 Writing: 179 Waiting: 106 \n";
        let s = parse_nginx_status(body).expect("status");
        assert_eq!(
            s,
            NginxStatus {
                active: 291,
                accepts: 16_630_948,
                handled: 16_630_948,
                requests: 31_070_465,
                reading: 6,
                writing: 179,
                waiting: 106,
            }
        );
    }

    #[test]
    fn test_parse_nginx_status_rejects_truncated_body() {
        assert!(parse_nginx_status("Active connections: 291\n").is_none());
        assert!(parse_nginx_status("").is_none());
    }

    #[test]
    fn test_parse_stat_line() {
        assert_eq!(
            parse_stat_line("STAT curr_connections 11"),
            Some(("curr_connections", "11"))
        );
        assert_eq!(parse_stat_line("VALUE foo 0 3"), None);
        assert_eq!(parse_stat_line("END"), None);
    }

    #[test]
    fn test_parse_exec_line() {
        assert_eq!(
            parse_exec_line("queue_depth 4"),
            Some(("queue_depth", "4"))
        );
        assert_eq!(
            parse_exec_line("  padded\t42  "),
            Some(("padded", "42"))
        );
        assert_eq!(parse_exec_line("bare_var"), None);
        assert_eq!(parse_exec_line("var value extra"), None);
        assert_eq!(parse_exec_line("bad! 3"), None);
        assert_eq!(parse_exec_line(""), None);
    }

    #[tokio::test]
    async fn test_read_memcache_stats_until_end() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = server.read(&mut buf).await.expect("read");
            assert_eq!(&buf[..n], b"stats\r\n");
            server
                .write_all(
                    b"STAT pid 1234\r\nSTAT curr_connections 11\r\nEND\r\nSTAT after 1\r\n",
                )
                .await
                .expect("write");
        });

        let stats = read_memcache_stats(&mut client).await.expect("stats");
        server_task.await.expect("server");
        assert_eq!(
            stats,
            vec![
                ("pid".to_string(), "1234".to_string()),
                ("curr_connections".to_string(), "11".to_string()),
            ]
        );
    }
}
