//! Serialized metadata round-trips on the shared connection.
//!
//! Every mutation the filesystem performs — chmod, chown, rename, mkdir,
//! rmdir, unlink, raw site verbs — goes through [`exec`]: take the shared
//! lock, pre-empt any in-flight download, run the commands synchronously,
//! release. Failures are deliberately compressed into the `Permission` error
//! class; FTP reply codes do not distinguish causes reliably enough to map
//! them further, and reporting success on a failed command is the one thing
//! this layer must never do.

use log::debug;
use log::warn;
use suppaftp::FtpError;
use suppaftp::Status;

use crate::connection::SharedConnection;
use crate::error::Error;
use crate::error::Result;

/// One server-side operation, named by the command(s) it sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FtpOp {
    /// `SITE <args>`.
    Site(String),
    /// `RNFR`/`RNTO` pair.
    Rename {
        /// Current remote path.
        from: String,
        /// New remote path.
        to: String,
    },
    /// `MKD`.
    Mkdir(String),
    /// `RMD`.
    Rmdir(String),
    /// `DELE`.
    Delete(String),
    /// A raw verb, for server-specific extensions.
    Raw(String),
}

/// Run a command sequence under the shared lock.
///
/// A failure at the transport layer additionally re-establishes the control
/// channel so the next operation does not inherit a wedged connection.
pub fn exec(conn: &SharedConnection, ops: &[FtpOp]) -> Result<()> {
    let mut state = conn.lock();
    conn.abort_download(&mut state);
    for op in ops {
        debug!("command: {op:?}");
        let result = match op {
            FtpOp::Site(args) => state.ftp.site(args).map(|_| ()),
            FtpOp::Rename { from, to } => state.ftp.rename(from, to).map(|_| ()),
            FtpOp::Mkdir(path) => state.ftp.mkdir(path).map(|_| ()),
            FtpOp::Rmdir(path) => state.ftp.rmdir(path).map(|_| ()),
            FtpOp::Delete(path) => state.ftp.rm(path).map(|_| ()),
            FtpOp::Raw(verb) => state
                .ftp
                .custom_command(verb, &[Status::CommandOk])
                .map(|_| ()),
        };
        if let Err(err) = result {
            warn!("command {op:?} failed: {err}");
            if matches!(err, FtpError::ConnectionError(_)) {
                conn.reconnect(&mut state);
            }
            return Err(Error::Permission);
        }
    }
    Ok(())
}

/// Fetch the raw listing lines of a directory under the shared lock.
pub fn fetch_listing(conn: &SharedConnection, remote_dir: &str) -> Result<Vec<String>> {
    let mut state = conn.lock();
    conn.abort_download(&mut state);
    match state.ftp.list(Some(remote_dir)) {
        Ok(lines) => Ok(lines),
        Err(err) => {
            warn!("LIST {remote_dir} failed: {err}");
            if matches!(err, FtpError::ConnectionError(_)) {
                conn.reconnect(&mut state);
            }
            Err(Error::io(err))
        }
    }
}

/// Store a zero-length file at `remote_path` (creation and truncate-to-zero).
pub fn create_empty_file(conn: &SharedConnection, remote_path: &str) -> Result<()> {
    let mut state = conn.lock();
    conn.abort_download(&mut state);
    let mut empty = std::io::empty();
    match state.ftp.put_file(remote_path, &mut empty) {
        Ok(_) => Ok(()),
        Err(err) => {
            warn!("creating empty {remote_path} failed: {err}");
            if matches!(err, FtpError::ConnectionError(_)) {
                conn.reconnect(&mut state);
            }
            Err(Error::Permission)
        }
    }
}
