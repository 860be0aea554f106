//! The always-on control loop: accept sessions, refresh the trackers once
//! per second, reload configuration on SIGHUP, reap finished sessions.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::access::AccessList;
use crate::collectors::smart::{SmartProvider, SmartctlProvider};
use crate::config::Config;
use crate::session;
use crate::trackers::Trackers;

pub struct Server {
    listener: TcpListener,
    cfg: Arc<Config>,
    config_path: Option<PathBuf>,
    access: AccessList,
    trackers: Trackers,
    smart: Arc<dyn SmartProvider + Send + Sync>,
}

enum Wake {
    Shutdown,
    Tick,
    Reload,
    Conn(std::io::Result<(TcpStream, SocketAddr)>),
    Reaped(Result<(), JoinError>),
}

impl Server {
    pub async fn bind(cfg: Config, config_path: Option<PathBuf>) -> Result<Self> {
        let access = AccessList::parse(cfg.access.enabled, &cfg.access.allow, &cfg.access.deny)
            .context("invalid access configuration")?;
        let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))
            .await
            .with_context(|| format!("binding tcp port {}", cfg.listen_port))?;
        let trackers = Trackers::new(&cfg);
        let smart: Arc<dyn SmartProvider + Send + Sync> = Arc::new(SmartctlProvider {
            enable_first: cfg.enable_smart,
        });

        Ok(Self {
            listener,
            cfg: Arc::new(cfg),
            config_path,
            access,
            trackers,
            smart,
        })
    }

    /// The bound address; ports chosen by the kernel show up here.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Swap the SMART provider. Tests install canned providers here.
    pub fn set_smart_provider(&mut self, provider: Arc<dyn SmartProvider + Send + Sync>) {
        self.smart = provider;
    }

    /// Run until the token is cancelled. Every wakeup refreshes the
    /// trackers first, so a session spawned by this iteration sees state
    /// no older than one tick.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let (reload_tx, mut reload_rx) = mpsc::channel::<()>(1);
        spawn_sighup_listener(reload_tx, cancel.clone());

        let mut sessions: JoinSet<()> = JoinSet::new();

        info!(addr = %self.local_addr()?, "listening");

        loop {
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Shutdown,
                _ = tick.tick() => Wake::Tick,
                Some(_) = reload_rx.recv() => Wake::Reload,
                conn = self.listener.accept() => Wake::Conn(conn),
                Some(res) = sessions.join_next() => Wake::Reaped(res),
            };

            self.trackers.refresh(Instant::now());

            match wake {
                Wake::Shutdown => break,
                Wake::Tick => {}
                Wake::Reload => self.reload(),
                Wake::Conn(Ok((stream, peer))) => {
                    self.start_session(&mut sessions, stream, peer)
                }
                Wake::Conn(Err(e)) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Wake::Reaped(Err(e)) if e.is_panic() => {
                    warn!(error = %e, "session task panicked");
                }
                Wake::Reaped(_) => {}
            }
        }

        sessions.shutdown().await;
        info!("stopped");
        Ok(())
    }

    fn start_session(&self, sessions: &mut JoinSet<()>, stream: TcpStream, peer: SocketAddr) {
        if !self.access.permits(peer.ip()) {
            warn!(%peer, "rejected by access list");
            return;
        }

        let cfg = self.cfg.clone();
        let snapshot = Arc::new(self.trackers.snapshot());
        let smart = self.smart.clone();
        let budget = cfg.limits.session_timeout;

        debug!(%peer, "session started");
        sessions.spawn(async move {
            match timeout(budget, session::serve(stream, peer, cfg, snapshot, smart)).await {
                Ok(Ok(())) => debug!(%peer, "session finished"),
                Ok(Err(e)) => warn!(%peer, error = %e, "session failed"),
                Err(_) => warn!(%peer, "session timed out"),
            }
        });
    }

    /// Re-read the config file and swap the snapshot between sessions.
    /// Failure keeps the previous configuration running.
    fn reload(&mut self) {
        let Some(path) = self.config_path.clone() else {
            warn!("reload requested but no config file was given");
            return;
        };

        let cfg = match Config::load(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(error = %e, "reload failed, keeping previous configuration");
                return;
            }
        };

        if cfg.listen_port != self.cfg.listen_port {
            warn!(
                old = self.cfg.listen_port,
                new = cfg.listen_port,
                "listen_port change requires a restart"
            );
        }

        match AccessList::parse(cfg.access.enabled, &cfg.access.allow, &cfg.access.deny) {
            Ok(access) => self.access = access,
            Err(e) => warn!(error = %e, "keeping previous access lists"),
        }

        self.trackers.apply_config(&cfg);
        self.cfg = Arc::new(cfg);
        info!(path = %path.display(), "configuration reloaded");
    }
}

/// Forward SIGHUP into a channel the control loop selects on. On platforms
/// without SIGHUP the sender is dropped and the channel stays silent.
fn spawn_sighup_listener(tx: mpsc::Sender<()>, cancel: CancellationToken) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "can't install SIGHUP handler");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = hup.recv() => {
                    if received.is_none() || tx.send(()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    #[cfg(not(unix))]
    {
        drop(tx);
        drop(cancel);
    }
}
