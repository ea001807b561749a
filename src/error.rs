//! The failure taxonomy and its errno mapping.

use fuser::Errno;
use thiserror::Error;

/// Failure classes surfaced to the VFS.
///
/// Every remote failure is folded into one of these before it crosses the
/// filesystem boundary, where it becomes a negative errno. Command round-trip
/// failures are deliberately compressed into [`Error::Permission`]: the FTP
/// reply codes do not distinguish failure causes reliably enough to map them
/// further.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The path is not present in the parent listing.
    #[error("no such file or directory")]
    NotFound,
    /// An open or open-time probe failed, or an `O_EXCL` target exists.
    #[error("access denied")]
    Access,
    /// A command round-trip failed, or the operation is a rejected no-op
    /// (such as a truncate to a length other than the remote size).
    #[error("operation not permitted")]
    Permission,
    /// The operation cannot be expressed over FTP (`O_APPEND`, plain `O_RDWR`).
    #[error("operation not supported")]
    NotSupported,
    /// A transfer failed, stalled out, or violated the sequential-write rule.
    #[error("remote I/O error: {0}")]
    Io(String),
    /// Buffer growth failed while accepting write data.
    #[error("out of memory")]
    OutOfMemory,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The errno reported to the kernel for this failure.
    pub fn errno(&self) -> Errno {
        match self {
            Error::NotFound => Errno::ENOENT,
            Error::Access => Errno::EACCES,
            Error::Permission => Errno::EPERM,
            Error::NotSupported => Errno::ENOTSUP,
            Error::Io(_) => Errno::EIO,
            Error::OutOfMemory => Errno::ENOMEM,
        }
    }

    /// Fold any displayable failure into the I/O class.
    pub fn io(err: impl std::fmt::Display) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::NotFound.errno(), Errno::ENOENT);
        assert_eq!(Error::Access.errno(), Errno::EACCES);
        assert_eq!(Error::Permission.errno(), Errno::EPERM);
        assert_eq!(Error::NotSupported.errno(), Errno::ENOTSUP);
        assert_eq!(Error::io("broken pipe").errno(), Errno::EIO);
        assert_eq!(Error::OutOfMemory.errno(), Errno::ENOMEM);
    }

    #[test]
    fn io_preserves_cause() {
        let err = Error::io("426 connection closed");
        assert_eq!(err.to_string(), "remote I/O error: 426 connection closed");
    }
}
