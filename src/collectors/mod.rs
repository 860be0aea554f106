pub mod smart;
pub mod system;
pub mod targets;

use std::fmt::Display;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::debug;

use crate::clock::RemoteClock;
use crate::config::Config;
use crate::session::registry::{Collector, EXECUTION_ORDER};
use crate::session::Request;
use crate::trackers::TrackerSnapshot;
use smart::SmartProvider;

/// Everything a collector needs: the session clock, the config snapshot,
/// the tracker snapshot taken when the session was accepted, and the shared
/// output writer. Cloned into each sub-target worker.
#[derive(Clone)]
pub struct Ctx {
    pub clock: RemoteClock,
    pub cfg: Arc<Config>,
    pub snapshot: Arc<TrackerSnapshot>,
    pub out: MetricWriter,
    pub debug: u8,
    pub smart: Arc<dyn SmartProvider + Send + Sync>,
}

/// Serialized writer for `<epoch> <name>[:<instance>] <value>` lines.
///
/// Concurrent sub-workers share one writer; the mutex keeps lines whole.
/// Write errors mean the controller went away, so they are logged at debug
/// and otherwise swallowed; the session winds down on its own.
#[derive(Clone)]
pub struct MetricWriter {
    inner: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl MetricWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub async fn metric<V: Display>(&self, ts: u64, name: &str, value: V) {
        self.write(format!("{ts} {name} {value}\n")).await;
    }

    pub async fn metric_inst<V: Display>(&self, ts: u64, name: &str, instance: &str, value: V) {
        self.write(format!("{ts} {name}:{instance} {value}\n")).await;
    }

    pub async fn raw(&self, text: &str) {
        self.write(text.to_string()).await;
    }

    async fn write(&self, line: String) {
        let mut w = self.inner.lock().await;
        if let Err(e) = w.write_all(line.as_bytes()).await {
            debug!(error = %e, "client write failed");
        }
    }

    /// Flush and shut the stream down; the client sees EOF.
    pub async fn finish(&self) {
        let mut w = self.inner.lock().await;
        let _ = w.flush().await;
        let _ = w.shutdown().await;
    }
}

/// Run every enabled collector in the fixed order. Multi-target collectors
/// spawn one worker per target into the session's `JoinSet` and return
/// immediately; the set is drained before this function returns, so all
/// output lands before the session closes.
pub async fn run_all(req: &Request, ctx: &Ctx) {
    let mut subs: JoinSet<()> = JoinSet::new();

    for c in EXECUTION_ORDER {
        if !req.enabled(c) {
            continue;
        }
        match c {
            Collector::Time => system::time(ctx).await,
            Collector::Uname => system::uname(ctx).await,
            Collector::Version => system::version(ctx).await,
            Collector::Uptime => system::uptime(ctx).await,
            Collector::Netstat => system::netstat(ctx).await,
            Collector::Ifaddrs => system::ifaddrs(ctx).await,
            Collector::Vmstat => system::vmstat(ctx).await,
            Collector::Sysctl => system::sysctl(ctx, &req.sysctl_vars).await,
            Collector::Swap => system::swap(ctx).await,
            Collector::AcpiTemperature => system::acpi_temperature(ctx).await,
            Collector::Apache => targets::spawn_http(&mut subs, ctx, targets::HttpKind::Apache),
            Collector::Nginx => targets::spawn_http(&mut subs, ctx, targets::HttpKind::Nginx),
            Collector::Memcache => targets::spawn_memcache(&mut subs, ctx),
            Collector::Socket => system::socket_report(ctx).await,
            Collector::Exec => targets::spawn_exec(&mut subs, ctx),
            Collector::Cputemp => system::cputemp(ctx).await,
            Collector::HddLoad => system::hdd_load(ctx).await,
            Collector::Smart => smart::report(ctx, req).await,
            Collector::Df => system::df(ctx).await,
        }
    }

    while subs.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_metric_writer_formats_lines() {
        let (w, mut r) = tokio::io::duplex(1024);
        let out = MetricWriter::new(w);

        out.metric(100, "uptime", 4242u64).await;
        out.metric_inst(100, "hdd_load5", "sda", "0.25").await;
        out.finish().await;

        let mut text = String::new();
        r.read_to_string(&mut text).await.expect("read");
        assert_eq!(text, "100 uptime 4242\n100 hdd_load5:sda 0.25\n");
    }

    #[tokio::test]
    async fn test_metric_writer_clones_share_stream() {
        let (w, mut r) = tokio::io::duplex(1024);
        let out = MetricWriter::new(w);
        let out2 = out.clone();

        out.metric(1, "a", 1u64).await;
        out2.metric(2, "b", 2u64).await;
        out.finish().await;

        let mut text = String::new();
        r.read_to_string(&mut text).await.expect("read");
        assert_eq!(text, "1 a 1\n2 b 2\n");
    }
}
