//! Open handles and the open-mode state machine.
//!
//! A handle drives at most one of the two transfer engines: the read window
//! or the write pipeline. Which one is decided by the open flags and locked
//! in by the first operation; once a byte has been accepted for upload the
//! handle never reads again.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::error::Error;
use crate::error::Result;
use crate::write_stream::FailureLatch;
use crate::write_stream::Upload;

/// State of one open file.
#[derive(Debug)]
pub struct OpenFile {
    /// Path as the VFS sees it.
    pub path: String,
    /// Remote path used in commands.
    pub remote_path: String,
    /// Flags from open.
    pub flags: i32,
    /// Read window over the remote file.
    pub window: Buffer,
    /// Absolute offset one past the last byte returned to the kernel.
    pub last_offset: u64,
    /// Whether the window may slide (read-only opens).
    pub can_shrink: bool,
    /// Remote size observed at open time; reads at or past it return 0.
    pub known_size: u64,
    /// Running upload, if any. Non-`None` iff the upload thread is live.
    pub upload: Option<Upload>,
    /// Bytes accepted by successful writes since the upload (re)started.
    pub pos: u64,
    /// True once a write may begin (creation, truncation, or verified-empty).
    pub write_may_start: bool,
    /// True once a write has been attempted on this handle.
    pub dirty: bool,
    /// Failure latched by the upload thread.
    pub write_fail: FailureLatch,
}

impl OpenFile {
    /// A fresh handle with both engines idle.
    pub fn new(path: &str, remote_path: &str, flags: i32) -> Self {
        OpenFile {
            path: path.to_string(),
            remote_path: remote_path.to_string(),
            flags,
            window: Buffer::new(),
            last_offset: 0,
            can_shrink: false,
            known_size: 0,
            upload: None,
            pos: 0,
            write_may_start: false,
            dirty: false,
            write_fail: Arc::new(Mutex::new(None)),
        }
    }

    /// True once the handle is committed to the write pipeline.
    pub fn is_writing(&self) -> bool {
        self.upload.is_some() || self.pos > 0
    }
}

/// How an open request will use its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenKind {
    /// Read-only: warm the window with a probe.
    Read,
    /// Write-only (or shimmed `O_RDWR`).
    Write {
        /// `O_EXCL`: the target must not exist.
        excl: bool,
        /// `O_TRUNC`: the upload may start immediately.
        trunc: bool,
        /// `O_CREAT`: the target will be created.
        creat: bool,
    },
}

/// Validate open flags against what FTP can express.
pub fn classify_open(flags: i32, rdwr_shim: bool) -> Result<OpenKind> {
    let accmode = flags & libc::O_ACCMODE;
    if accmode == libc::O_RDONLY {
        return Ok(OpenKind::Read);
    }
    if accmode == libc::O_RDWR && !rdwr_shim {
        return Err(Error::NotSupported);
    }
    if accmode != libc::O_WRONLY && accmode != libc::O_RDWR {
        return Err(Error::io("unrecognized access mode"));
    }
    if flags & libc::O_APPEND != 0 {
        // server-side append exists, but the offsets the kernel sends with
        // O_APPEND cannot be reconciled with a streaming upload
        return Err(Error::NotSupported);
    }
    Ok(OpenKind::Write {
        excl: flags & libc::O_EXCL != 0,
        trunc: flags & libc::O_TRUNC != 0,
        creat: flags & libc::O_CREAT != 0,
    })
}

/// What a truncate against an open handle resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncateAction {
    /// Replace the remote file with an empty one and allow writes to start.
    CreateEmpty,
    /// Length already matches the remote size: accept silently.
    Noop,
    /// Anything else cannot be expressed over FTP.
    Reject,
}

/// Decide a truncate-to-`len` on a handle whose remote size is `remote_size`.
pub fn classify_ftruncate(file: &OpenFile, len: u64, remote_size: u64) -> TruncateAction {
    if len == 0 && file.pos == 0 && file.upload.is_none() {
        TruncateAction::CreateEmpty
    } else if len == remote_size {
        TruncateAction::Noop
    } else {
        TruncateAction::Reject
    }
}

/// Live handles, keyed by the fh given to the kernel.
#[derive(Debug)]
pub struct HandleTable {
    map: DashMap<u64, Arc<Mutex<OpenFile>>>,
    next: AtomicU64,
}

impl HandleTable {
    /// An empty table.
    pub fn new() -> Self {
        HandleTable {
            map: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    /// Register a handle, returning its fh.
    pub fn insert(&self, file: OpenFile) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.map.insert(fh, Arc::new(Mutex::new(file)));
        fh
    }

    /// Look a handle up.
    pub fn get(&self, fh: u64) -> Option<Arc<Mutex<OpenFile>>> {
        self.map.get(&fh).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a handle, returning it for teardown.
    pub fn remove(&self, fh: u64) -> Option<Arc<Mutex<OpenFile>>> {
        self.map.remove(&fh).map(|(_, file)| file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_opens_classify_as_read() {
        assert_eq!(classify_open(libc::O_RDONLY, false).unwrap(), OpenKind::Read);
        assert_eq!(
            classify_open(libc::O_RDONLY | libc::O_CREAT, false).unwrap(),
            OpenKind::Read
        );
    }

    #[test]
    fn write_only_classifies_flags() {
        let kind = classify_open(libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, false).unwrap();
        assert_eq!(
            kind,
            OpenKind::Write {
                excl: false,
                trunc: true,
                creat: true
            }
        );
        let kind = classify_open(libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL, false).unwrap();
        assert_eq!(
            kind,
            OpenKind::Write {
                excl: true,
                trunc: false,
                creat: true
            }
        );
    }

    #[test]
    fn append_is_not_supported() {
        let err = classify_open(libc::O_WRONLY | libc::O_APPEND, false).unwrap_err();
        assert_eq!(err, Error::NotSupported);
    }

    #[test]
    fn rdwr_needs_the_shim() {
        assert_eq!(
            classify_open(libc::O_RDWR, false).unwrap_err(),
            Error::NotSupported
        );
        assert!(matches!(
            classify_open(libc::O_RDWR, true).unwrap(),
            OpenKind::Write { .. }
        ));
    }

    #[test]
    fn ftruncate_zero_on_fresh_handle_creates() {
        let file = OpenFile::new("/f", "/f", libc::O_WRONLY);
        assert_eq!(
            classify_ftruncate(&file, 0, 100),
            TruncateAction::CreateEmpty
        );
    }

    #[test]
    fn ftruncate_matching_size_is_noop() {
        let mut file = OpenFile::new("/f", "/f", libc::O_WRONLY);
        file.pos = 100;
        assert_eq!(classify_ftruncate(&file, 100, 100), TruncateAction::Noop);
    }

    #[test]
    fn ftruncate_other_lengths_reject() {
        let mut file = OpenFile::new("/f", "/f", libc::O_WRONLY);
        file.pos = 100;
        assert_eq!(classify_ftruncate(&file, 50, 100), TruncateAction::Reject);
        assert_eq!(classify_ftruncate(&file, 0, 100), TruncateAction::Reject);
    }

    #[test]
    fn handle_table_allocates_distinct_fhs() {
        let table = HandleTable::new();
        let a = table.insert(OpenFile::new("/a", "/a", libc::O_RDONLY));
        let b = table.insert(OpenFile::new("/b", "/b", libc::O_RDONLY));
        assert_ne!(a, b);
        assert!(table.get(a).is_some());
        assert!(table.remove(a).is_some());
        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());
    }

    #[test]
    fn fresh_handle_is_not_writing() {
        let mut file = OpenFile::new("/f", "/f", libc::O_WRONLY);
        assert!(!file.is_writing());
        file.pos = 1;
        assert!(file.is_writing());
    }
}
