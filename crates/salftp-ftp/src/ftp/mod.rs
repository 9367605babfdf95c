//! # salftp FTP core
//!
//! Control-connection state machine, data connections, listing cache and
//! the listing parser engine of an FTP client.
//! - **RFC 959** command/reply pipeline with reconnect and a shared retry budget
//! - **RFC 2228 / 4217** AUTH TLS, PBSZ, PROT (explicit and implicit FTPS)
//! - **MODE Z** compressed data connections
//! - SOCKS4/4A/5, HTTP CONNECT and FTP-level proxies with login scripts
//!
//! Architecture:
//! - `types` — data structures, enums, connection config
//! - `error` — FTP-specific error type and error classes
//! - `protocol` — reply grammar, PASV/PORT/257 payloads
//! - `paths` — server path types (Unix, Windows, VMS, MVS, …)
//! - `proxy` — proxy servers, login scripts, SOCKS/HTTP tunnels
//! - `socket` — event socket, dispatcher, timers, wait-with-cancel
//! - `tls` — rustls client configuration
//! - `connection` — TCP (+ proxy) (+ TLS) stream setup
//! - `datacon` — data connection (passive/active, TLS, MODE Z, flush)
//! - `keepalive` — keep-alive sub-machine
//! - `ctrlcon` — control connection (login, commands, listing)
//! - `cache` — listing cache with path-aware invalidation
//! - `parser` — listing parser DSL, built-in server types, autodetect
//! - `queue` — operation/worker queue
//! - `operations` — downstream file-system facade
//! - `config` — persisted global config, bookmarks, proxies
//! - `log_book` — per-connection command/reply log
//! - `context` — shared services handed to every connection

pub mod types;
pub mod error;
pub mod protocol;
pub mod paths;
pub mod proxy;
pub mod socket;
pub mod tls;
pub mod connection;
pub mod datacon;
pub mod keepalive;
pub mod ctrlcon;
pub mod cache;
pub mod parser;
pub mod queue;
pub mod operations;
pub mod config;
pub mod log_book;
pub mod context;
#[cfg(test)]
pub(crate) mod testing;

// Re-exports for lib.rs consumers
pub use types::*;
pub use error::{ErrorClass, FtpError, FtpErrorKind, FtpResult};
pub use context::FtpContext;
pub use ctrlcon::ControlConnection;
pub use operations::FtpFileSystem;
