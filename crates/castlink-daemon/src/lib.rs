//! Castlink Daemon - registry, supervisor, and Unix socket server
//!
//! Library target so integration tests can run the server in-process; the
//! `castlinkd` binary is a thin wrapper around these modules.

pub mod config;
pub mod router;
pub mod server;
pub mod state;
pub mod supervisor;
