pub mod access;
pub mod clock;
pub mod collectors;
pub mod config;
pub mod pidfile;
pub mod server;
pub mod session;
pub mod trackers;
