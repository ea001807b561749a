//! Mount a remote FTP server as a local filesystem.
//!
//! The kernel delivers filesystem operations through FUSE; this crate
//! translates each of them into FTP commands on persistent connections.
//! The interesting part is bridging the two I/O models: POSIX expects
//! random-access reads and stateful open handles, while FTP offers only
//! restartable sequential downloads and one-shot uploads. Reads are served
//! from a per-handle sliding window over a single in-flight download
//! ([`read_window`]); writes become one long-lived streaming upload fed by a
//! dedicated thread ([`write_stream`]); everything else is a synchronous
//! command round-trip on one shared, mutex-guarded control connection
//! ([`connection`], [`command`]).

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::config::Config;
pub use crate::config::ConfigError;
pub use crate::connection::SharedConnection;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::fs::FtpFs;

pub mod buffer;
pub mod cache;
pub mod charset;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod fs;
pub mod handle;
pub mod path;
pub mod read_window;
pub mod stat;
pub mod write_stream;
