use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use sysstatd::config::Config;
use sysstatd::pidfile::PidFile;
use sysstatd::server::Server;

/// Remote system statistics daemon.
#[derive(Parser)]
#[command(name = "sysstatd", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Stay in the foreground instead of daemonizing.
    #[arg(short, long)]
    foreground: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Version identity for the `version` subcommand and the startup log line.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Short commit hash baked in by build.rs when built from a checkout.
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("sysstatd {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for the daemon run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting sysstatd",
    );

    // Detach (or just chdir in the foreground) before the runtime exists;
    // forking after worker threads start is not an option.
    if cli.foreground {
        enter_workdir(&cfg.workdir);
    } else {
        daemonize::Daemonize::new()
            .working_directory(&cfg.workdir)
            .start()
            .context("daemonizing")?;
    }

    // Pid file while still privileged; removed on graceful shutdown.
    let _pidfile = match PidFile::create(&cfg.pidfile) {
        Ok(guard) => Some(guard),
        Err(e) => {
            tracing::warn!(error = %e, "running without a pid file");
            None
        }
    };

    drop_privileges(&cfg.user, &cfg.group)?;

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg, config_path).await })
}

async fn run(cfg: Config, config_path: PathBuf) -> Result<()> {
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        });
    }

    let server = Server::bind(cfg, Some(config_path)).await?;
    server.run(cancel).await?;

    tracing::info!("sysstatd stopped");

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "can't install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received SIGINT, shutting down");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Change into the configured working directory, falling back to /var/tmp.
fn enter_workdir(workdir: &Path) {
    if let Err(e) = std::env::set_current_dir(workdir) {
        tracing::warn!(
            workdir = %workdir.display(),
            error = %e,
            "can't enter working directory, using /var/tmp"
        );
        if let Err(e) = std::env::set_current_dir("/var/tmp") {
            tracing::warn!(error = %e, "can't enter /var/tmp either");
        }
    }
}

/// Switch to the configured group and user, in that order. A configured
/// identity that cannot be assumed is fatal; running with unintended
/// privileges is worse than not running.
#[cfg(unix)]
fn drop_privileges(user: &str, group: &str) -> Result<()> {
    if !group.is_empty() {
        let gid = resolve_group(group)?;
        if unsafe { libc::setgid(gid) } != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("setgid({gid})"));
        }
        tracing::debug!(group, gid, "switched group");
    }
    if !user.is_empty() {
        let uid = resolve_user(user)?;
        if unsafe { libc::setuid(uid) } != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("setuid({uid})"));
        }
        tracing::debug!(user, uid, "switched user");
    }
    Ok(())
}

#[cfg(not(unix))]
fn drop_privileges(user: &str, group: &str) -> Result<()> {
    if !user.is_empty() || !group.is_empty() {
        bail!("user/group switching is not supported on this platform");
    }
    Ok(())
}

#[cfg(unix)]
fn resolve_user(name: &str) -> Result<libc::uid_t> {
    if let Ok(uid) = name.parse() {
        return Ok(uid);
    }
    let cname = std::ffi::CString::new(name).context("user name contains a NUL byte")?;
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        bail!("unknown user '{name}'");
    }
    Ok(unsafe { (*pw).pw_uid })
}

#[cfg(unix)]
fn resolve_group(name: &str) -> Result<libc::gid_t> {
    if let Ok(gid) = name.parse() {
        return Ok(gid);
    }
    let cname = std::ffi::CString::new(name).context("group name contains a NUL byte")?;
    let gr = unsafe { libc::getgrnam(cname.as_ptr()) };
    if gr.is_null() {
        bail!("unknown group '{name}'");
    }
    Ok(unsafe { (*gr).gr_gid })
}
