pub mod registry;

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::clock::RemoteClock;
use crate::collectors::smart::SmartProvider;
use crate::collectors::{self, Ctx, MetricWriter};
use crate::config::{Config, LimitsConfig};
use crate::trackers::TrackerSnapshot;
use registry::{lookup, valid_var_name, Collector, DirectiveKind, COLLECTOR_COUNT};

/// Errors that end a session before execution.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("incomplete request: no GO before end of input")]
    Incomplete,

    #[error("input line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-directive parse errors. Logged; the session continues.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("unknown directive")]
    Unknown,

    #[error("unexpected argument")]
    UnexpectedArgument,

    #[error("missing argument")]
    MissingArgument,

    #[error("invalid argument '{0}'")]
    InvalidArgument(String),

    #[error("too many sysctl variables (limit {0})")]
    TooManyVars(usize),
}

/// The request a session builds from its directives.
#[derive(Debug)]
pub struct Request {
    enabled: [bool; COLLECTOR_COUNT],
    pub sysctl_vars: Vec<String>,
    pub smart_all: bool,
    pub smart_attrs: BTreeSet<u8>,
    pub debug: u8,
    pub clock: RemoteClock,
}

impl Request {
    pub fn new() -> Self {
        Self {
            enabled: [false; COLLECTOR_COUNT],
            sysctl_vars: Vec::new(),
            smart_all: false,
            smart_attrs: BTreeSet::new(),
            debug: 0,
            clock: RemoteClock::local(),
        }
    }

    pub fn enable(&mut self, c: Collector) {
        self.enabled[c.index()] = true;
    }

    pub fn enabled(&self, c: Collector) -> bool {
        self.enabled[c.index()]
    }

    /// Whether a SMART attribute id was requested.
    pub fn wants_attr(&self, id: u8) -> bool {
        self.smart_all || self.smart_attrs.contains(&id)
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Parsed {
    Continue,
    Go,
    Quit,
    Help,
}

/// Serve one accepted connection: read directives until GO or QUIT, then
/// run the enabled collectors and close. The caller bounds the whole call
/// with the session timeout.
pub async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    cfg: Arc<Config>,
    snapshot: Arc<TrackerSnapshot>,
    smart: Arc<dyn SmartProvider + Send + Sync>,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let out = MetricWriter::new(write_half);
    let mut reader = BufReader::new(read_half);

    let mut req = Request::new();
    if let Parsed::Quit = collect(&mut reader, &out, &mut req, &cfg.limits, peer).await? {
        return Ok(());
    }

    let ctx = Ctx {
        clock: req.clock,
        cfg,
        snapshot,
        out,
        debug: req.debug,
        smart,
    };
    collectors::run_all(&req, &ctx).await;
    ctx.out.finish().await;

    Ok(())
}

/// Read directive lines until GO (returns `Parsed::Go`) or QUIT. End of
/// input or an overlong line before GO is an ordered failure.
async fn collect<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &MetricWriter,
    req: &mut Request,
    limits: &LimitsConfig,
    peer: SocketAddr,
) -> Result<Parsed, SessionError> {
    loop {
        let Some(line) = read_line_capped(reader, limits.max_line_length).await? else {
            return Err(SessionError::Incomplete);
        };
        let line = line.trim_end_matches('\r');

        match parse_line(line, req, limits) {
            Ok(Parsed::Continue) => {
                if req.debug >= 2 {
                    debug!(%peer, line, "directive accepted");
                }
            }
            Ok(Parsed::Go) => return Ok(Parsed::Go),
            Ok(Parsed::Quit) => return Ok(Parsed::Quit),
            Ok(Parsed::Help) => out.raw(&registry::help_text()).await,
            Err(e) => warn!(%peer, line, error = %e, "ignoring directive"),
        }
    }
}

/// Parse one directive line against the registry, updating the request.
fn parse_line(
    line: &str,
    req: &mut Request,
    limits: &LimitsConfig,
) -> Result<Parsed, DirectiveError> {
    let mut parts = line.split_whitespace();
    let keyword = parts.next().ok_or(DirectiveError::Unknown)?;
    let spec = lookup(keyword).ok_or(DirectiveError::Unknown)?;
    let arg = parts.next();
    if parts.next().is_some() {
        return Err(DirectiveError::UnexpectedArgument);
    }

    let no_arg = |arg: Option<&str>| match arg {
        Some(_) => Err(DirectiveError::UnexpectedArgument),
        None => Ok(()),
    };

    match spec.kind {
        DirectiveKind::Toggle(c) => {
            no_arg(arg)?;
            req.enable(c);
            Ok(Parsed::Continue)
        }
        DirectiveKind::Time => {
            let arg = arg.ok_or(DirectiveError::MissingArgument)?;
            let secs: u64 = arg
                .parse()
                .map_err(|_| DirectiveError::InvalidArgument(arg.to_string()))?;
            req.clock.rebase(secs);
            req.enable(Collector::Time);
            Ok(Parsed::Continue)
        }
        DirectiveKind::Debug => {
            let arg = arg.ok_or(DirectiveError::MissingArgument)?;
            let level: u8 = arg
                .parse()
                .ok()
                .filter(|l| *l <= 2)
                .ok_or_else(|| DirectiveError::InvalidArgument(arg.to_string()))?;
            req.debug = level;
            Ok(Parsed::Continue)
        }
        DirectiveKind::Sysctl => {
            let arg = arg.ok_or(DirectiveError::MissingArgument)?;
            if !valid_var_name(arg) {
                return Err(DirectiveError::InvalidArgument(arg.to_string()));
            }
            if req.sysctl_vars.len() >= limits.max_sysctl_vars {
                return Err(DirectiveError::TooManyVars(limits.max_sysctl_vars));
            }
            if !req.sysctl_vars.iter().any(|v| v == arg) {
                req.sysctl_vars.push(arg.to_string());
            }
            req.enable(Collector::Sysctl);
            Ok(Parsed::Continue)
        }
        DirectiveKind::Smart => {
            let arg = arg.ok_or(DirectiveError::MissingArgument)?;
            if arg == "ALL" {
                req.smart_all = true;
            } else {
                let id: u8 = arg
                    .parse()
                    .ok()
                    .filter(|id| *id > 0)
                    .ok_or_else(|| DirectiveError::InvalidArgument(arg.to_string()))?;
                req.smart_attrs.insert(id);
            }
            req.enable(Collector::Smart);
            Ok(Parsed::Continue)
        }
        DirectiveKind::Go => {
            no_arg(arg)?;
            Ok(Parsed::Go)
        }
        DirectiveKind::Quit => {
            no_arg(arg)?;
            Ok(Parsed::Quit)
        }
        DirectiveKind::Help => {
            no_arg(arg)?;
            Ok(Parsed::Help)
        }
    }
}

/// Read one newline-terminated line, enforcing the length cap. Returns
/// `None` on clean end of input; a final unterminated line is still
/// delivered.
async fn read_line_capped<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max: usize,
) -> Result<Option<String>, SessionError> {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let (segment, saw_newline) = {
            let chunk = reader.fill_buf().await?;
            if chunk.is_empty() {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
            }
            match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => (chunk[..pos].to_vec(), true),
                None => (chunk.to_vec(), false),
            }
        };
        let consumed = segment.len() + usize::from(saw_newline);
        buf.extend_from_slice(&segment);
        reader.consume(consumed);
        if buf.len() > max {
            return Err(SessionError::LineTooLong(max));
        }
        if saw_newline {
            return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
        }
    }
}
