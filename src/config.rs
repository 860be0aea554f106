use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::access::AccessList;
use crate::session::registry::valid_var_name;
use crate::trackers::socket::SockKey;

/// Top-level daemon configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// TCP port to accept controller connections on. Default: 1957.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// File the daemon's process ID is written to. Default:
    /// "/var/run/sysstatd.pid".
    #[serde(default = "default_pidfile")]
    pub pidfile: PathBuf,

    /// Working directory after startup. Default: "/var/tmp".
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    /// User name or numeric ID to switch to at startup. Empty: keep current.
    #[serde(default)]
    pub user: String,

    /// Group name or numeric ID to switch to at startup. Empty: keep current.
    #[serde(default)]
    pub group: String,

    /// Peer allow/deny filtering at accept time.
    #[serde(default)]
    pub access: AccessConfig,

    /// Issue a SMART-enable to drives before reading attributes.
    #[serde(default)]
    pub enable_smart: bool,

    /// Skip the disk load tracker entirely.
    #[serde(default)]
    pub disable_disk_load: bool,

    /// Exclude point-to-point interfaces from the interface tracker.
    #[serde(default)]
    pub skip_p2p_interfaces: bool,

    /// How often the socket queue tracker samples. Default: 1s.
    #[serde(default = "default_socket_poll_interval", with = "humantime_serde")]
    pub socket_poll_interval: Duration,

    /// Per-session and per-request resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Apache status endpoints (mod_status `?auto` pages).
    #[serde(default)]
    pub apache: Vec<HttpTargetConfig>,

    /// Nginx stub_status endpoints.
    #[serde(default)]
    pub nginx: Vec<HttpTargetConfig>,

    /// Memcached-protocol endpoints queried with `stats`.
    #[serde(default)]
    pub memcache: Vec<CacheTargetConfig>,

    /// Shell commands whose stdout lines become metrics.
    #[serde(default)]
    pub exec: Vec<ExecTargetConfig>,

    /// Local sockets whose receive/accept queues are monitored.
    #[serde(default)]
    pub sockets: Vec<SocketTargetConfig>,

    /// Block devices SMART data is read from.
    #[serde(default)]
    pub smart_devices: Vec<String>,
}

/// Peer filtering configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct AccessConfig {
    /// Enable filtering. Default: false (accept from anywhere).
    #[serde(default)]
    pub enabled: bool,

    /// CIDR entries admitted. Empty admits everything not denied.
    #[serde(default)]
    pub allow: Vec<String>,

    /// CIDR entries rejected; deny wins over allow.
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Resource limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum SYSCTL variables accepted per session. Default: 128.
    #[serde(default = "default_max_sysctl_vars")]
    pub max_sysctl_vars: usize,

    /// Maximum monitored sockets. Default: 64.
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,

    /// Maximum protocol input line length in bytes. Default: 1024.
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Hard wall-clock budget for a whole session. Default: 20s.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Hard budget for each sub-target worker. Default: 15s.
    #[serde(default = "default_target_timeout", with = "humantime_serde")]
    pub target_timeout: Duration,
}

/// An HTTP status endpoint to scrape.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpTargetConfig {
    /// Instance name used in emitted metric lines.
    pub name: String,
    /// Full status page URL.
    pub url: String,
}

/// A cache server to query over the memcached text protocol.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheTargetConfig {
    /// Instance name used in emitted metric lines.
    pub name: String,
    /// `ip:port`, or an absolute unix socket path.
    pub addr: String,
}

/// A shell command whose `var value` stdout lines become metrics.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecTargetConfig {
    pub command: String,
}

/// A local socket to monitor.
#[derive(Debug, Clone, Deserialize)]
pub struct SocketTargetConfig {
    /// Instance name used in emitted metric lines.
    pub name: String,
    /// `ip:port`, or an absolute unix socket path.
    pub addr: String,
}

// --- Default value functions ---

fn default_listen_port() -> u16 {
    1957
}

fn default_pidfile() -> PathBuf {
    PathBuf::from("/var/run/sysstatd.pid")
}

fn default_workdir() -> PathBuf {
    PathBuf::from("/var/tmp")
}

fn default_socket_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_sysctl_vars() -> usize {
    128
}

fn default_max_sockets() -> usize {
    64
}

fn default_max_line_length() -> usize {
    1024
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_target_timeout() -> Duration {
    Duration::from_secs(15)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            pidfile: default_pidfile(),
            workdir: default_workdir(),
            user: String::new(),
            group: String::new(),
            access: AccessConfig::default(),
            enable_smart: false,
            disable_disk_load: false,
            skip_p2p_interfaces: false,
            socket_poll_interval: default_socket_poll_interval(),
            limits: LimitsConfig::default(),
            apache: Vec::new(),
            nginx: Vec::new(),
            memcache: Vec::new(),
            exec: Vec::new(),
            sockets: Vec::new(),
            smart_devices: Vec::new(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sysctl_vars: default_max_sysctl_vars(),
            max_sockets: default_max_sockets(),
            max_line_length: default_max_line_length(),
            session_timeout: default_session_timeout(),
            target_timeout: default_target_timeout(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_line_length == 0 {
            bail!("limits.max_line_length must be positive");
        }
        if self.limits.session_timeout.is_zero() {
            bail!("limits.session_timeout must be positive");
        }
        if self.limits.target_timeout >= self.limits.session_timeout {
            bail!("limits.target_timeout must be shorter than limits.session_timeout");
        }
        if self.socket_poll_interval.is_zero() {
            bail!("socket_poll_interval must be positive");
        }

        AccessList::parse(self.access.enabled, &self.access.allow, &self.access.deny)
            .context("invalid access configuration")?;

        if self.sockets.len() > self.limits.max_sockets {
            bail!(
                "{} monitored sockets configured, limit is {}",
                self.sockets.len(),
                self.limits.max_sockets
            );
        }

        for t in &self.sockets {
            check_name(&t.name, "sockets")?;
            SockKey::parse(&t.addr)
                .with_context(|| format!("monitored socket '{}'", t.name))?;
        }
        for t in &self.memcache {
            check_name(&t.name, "memcache")?;
            SockKey::parse(&t.addr)
                .with_context(|| format!("memcache target '{}'", t.name))?;
        }
        for t in self.apache.iter().chain(&self.nginx) {
            check_name(&t.name, "http")?;
            if !t.url.starts_with("http://") && !t.url.starts_with("https://") {
                bail!("target '{}': url must start with http:// or https://", t.name);
            }
        }
        for t in &self.exec {
            if t.command.trim().is_empty() {
                bail!("exec target with empty command");
            }
        }

        Ok(())
    }
}

fn check_name(name: &str, kind: &str) -> Result<()> {
    if !valid_var_name(name) {
        bail!("{kind} target name '{name}' is not a valid metric name");
    }
    Ok(())
}
