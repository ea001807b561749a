//! The FUSE operation surface.
//!
//! `FtpFs` implements [`fuser::Filesystem`], translating inode-addressed
//! kernel requests into path-addressed remote operations. Metadata goes
//! through the command executor and the listing cache; file I/O goes through
//! the per-handle read window and write pipeline, gated by the handle state
//! machine. Every failure is logged with the operation name and surfaces as
//! a negative errno.

use std::ffi::OsStr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;

use dashmap::DashMap;
use fuser::AccessFlags;
use fuser::BsdFileFlags;
use fuser::Errno;
use fuser::FileAttr;
use fuser::FileHandle;
use fuser::FileType;
use fuser::Filesystem;
use fuser::FopenFlags;
use fuser::Generation;
use fuser::INodeNo;
use fuser::LockOwner;
use fuser::OpenFlags;
use fuser::ReadFlags;
use fuser::RenameFlags;
use fuser::ReplyAttr;
use fuser::ReplyCreate;
use fuser::ReplyData;
use fuser::ReplyDirectory;
use fuser::ReplyEmpty;
use fuser::ReplyEntry;
use fuser::ReplyOpen;
use fuser::ReplyStatfs;
use fuser::ReplyWrite;
use fuser::Request;
use fuser::TimeOrNow;
use fuser::WriteFlags;
use log::debug;
use log::info;
use log::warn;

use crate::cache::DirCache;
use crate::cache::DirListing;
use crate::charset::CodepageConv;
use crate::command;
use crate::command::FtpOp;
use crate::config::Config;
use crate::connection::SharedConnection;
use crate::error::Error;
use crate::error::Result;
use crate::handle::HandleTable;
use crate::handle::OpenFile;
use crate::handle::OpenKind;
use crate::handle::TruncateAction;
use crate::handle::classify_ftruncate;
use crate::handle::classify_open;
use crate::path::join_child;
use crate::path::join_remote;
use crate::path::split_parent;
use crate::read_window;
use crate::stat::RemoteStat;
use crate::write_stream;

/// Kernel attribute cache TTL.
const TTL: Duration = Duration::from_secs(1);

/// Root inode fixed by the FUSE protocol.
const ROOT_INO: u64 = 1;

/// Bidirectional inode ↔ VFS path table.
///
/// Inodes are allocated on first sight of a path and live for the mount;
/// rename moves a subtree's mappings so open handles keep their inodes.
#[derive(Debug)]
struct InodeTable {
    to_path: DashMap<u64, String>,
    to_ino: DashMap<String, u64>,
    next: AtomicU64,
}

impl InodeTable {
    fn new() -> Self {
        let table = InodeTable {
            to_path: DashMap::new(),
            to_ino: DashMap::new(),
            next: AtomicU64::new(ROOT_INO + 1),
        };
        table.to_path.insert(ROOT_INO, "/".to_string());
        table.to_ino.insert("/".to_string(), ROOT_INO);
        table
    }

    fn get_or_assign(&self, path: &str) -> u64 {
        let ino = *self
            .to_ino
            .entry(path.to_string())
            .or_insert_with(|| self.next.fetch_add(1, Ordering::Relaxed));
        self.to_path.insert(ino, path.to_string());
        ino
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.to_path.get(&ino).map(|entry| entry.clone())
    }

    fn forget_path(&self, path: &str) {
        if let Some((_, ino)) = self.to_ino.remove(path) {
            self.to_path.remove(&ino);
        }
    }

    fn rename(&self, old: &str, new: &str) {
        let prefix = format!("{old}/");
        let moved: Vec<(String, u64)> = self
            .to_ino
            .iter()
            .filter(|entry| entry.key() == old || entry.key().starts_with(&prefix))
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        for (path, ino) in moved {
            self.to_ino.remove(&path);
            let renamed = format!("{new}{}", &path[old.len()..]);
            self.to_path.insert(ino, renamed.clone());
            self.to_ino.insert(renamed, ino);
        }
    }
}

/// The mounted filesystem.
pub struct FtpFs {
    conn: Arc<SharedConnection>,
    config: Arc<Config>,
    cache: DirCache,
    handles: HandleTable,
    inodes: InodeTable,
    conv: Option<CodepageConv>,
}

impl std::fmt::Debug for FtpFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpFs")
            .field("host", &self.config.host.host)
            .finish_non_exhaustive()
    }
}

fn logged(op: &str, err: Error) -> Errno {
    debug!("{op}: {err}");
    err.errno()
}

impl FtpFs {
    /// Assemble the filesystem over an established connection.
    pub fn new(conn: Arc<SharedConnection>, config: Arc<Config>) -> Self {
        let conv = config.codepage.as_deref().and_then(|codepage| {
            let conv = CodepageConv::new(codepage, &config.iocharset);
            if conv.is_none() {
                warn!(
                    "unknown codepage {codepage:?} / iocharset {:?}, conversion disabled",
                    config.iocharset
                );
            }
            conv
        });
        FtpFs {
            cache: DirCache::new(config.cache, config.cache_timeout),
            handles: HandleTable::new(),
            inodes: InodeTable::new(),
            conv,
            conn,
            config,
        }
    }

    fn remote_of(&self, vfs_path: &str) -> String {
        join_remote(&self.config.host.base_dir, vfs_path)
    }

    fn wire_path(&self, remote_path: &str) -> String {
        match &self.conv {
            Some(conv) => conv.to_remote(remote_path).into_owned(),
            None => remote_path.to_string(),
        }
    }

    fn resolve(&self, parent: INodeNo, name: &OsStr) -> Result<String> {
        let parent_path = self.inodes.path_of(parent.0).ok_or(Error::NotFound)?;
        let name = name.to_str().ok_or_else(|| Error::io("non-UTF-8 name"))?;
        Ok(join_child(&parent_path, name))
    }

    fn listing(&self, dir: &str, use_cache: bool) -> Result<DirListing> {
        if use_cache {
            if let Some(hit) = self.cache.get(dir) {
                return Ok(hit);
            }
        }
        let lines = command::fetch_listing(&self.conn, &self.remote_of(dir))?;
        let entries: Vec<RemoteStat> = lines
            .iter()
            .filter_map(|line| RemoteStat::from_listing_line(line, self.conv.as_ref()))
            .collect();
        let listing: DirListing = Arc::new(entries);
        self.cache.insert(dir, Arc::clone(&listing));
        Ok(listing)
    }

    fn stat_path(&self, vfs_path: &str, use_cache: bool) -> Result<RemoteStat> {
        if vfs_path == "/" {
            return Ok(RemoteStat::directory_placeholder("/"));
        }
        let (parent, name) = split_parent(vfs_path);
        let listing = self.listing(parent, use_cache)?;
        listing
            .iter()
            .find(|entry| entry.name == name)
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn attr_of(&self, req: &Request, vfs_path: &str, stat: &RemoteStat) -> FileAttr {
        let ino = self.inodes.get_or_assign(vfs_path);
        stat.to_attr(INodeNo(ino), self.config.blksize, req.uid(), req.gid())
    }

    fn invalidate_parent(&self, vfs_path: &str) {
        let (parent, _) = split_parent(vfs_path);
        self.cache.invalidate(parent);
    }

    fn remote_size(&self, vfs_path: &str) -> Result<u64> {
        match self.stat_path(vfs_path, false) {
            Ok(stat) => Ok(stat.size),
            // a path we are about to create may not exist yet
            Err(Error::NotFound) => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Drain an upload if one is running and verify the remote file ended up
    /// with exactly the bytes the kernel handed us.
    fn finish_and_verify(&self, file: &mut OpenFile) -> Result<()> {
        if file.upload.is_some() {
            write_stream::finish(file)?;
            self.invalidate_parent(&file.path);
            let stat = self.stat_path(&file.path, false)?;
            if stat.size != file.pos {
                let err = Error::io(format!(
                    "upload of {} incomplete: sent {} bytes, server kept {}",
                    file.path, file.pos, stat.size
                ));
                *file.write_fail.lock() = Some(err.clone());
                return Err(err);
            }
            file.known_size = stat.size;
            file.dirty = false;
        } else if file.dirty {
            if let Some(err) = file.write_fail.lock().clone() {
                return Err(err);
            }
            return Err(Error::io("pending data with no active upload"));
        }
        Ok(())
    }

    fn start_upload(&self, file: &mut OpenFile, append: bool) -> Result<()> {
        file.upload = Some(write_stream::Upload::start(
            Arc::clone(&self.config),
            file.remote_path.clone(),
            append,
            Arc::clone(&file.write_fail),
        )?);
        Ok(())
    }

    fn chmod_op(&self, vfs_path: &str, mode: u32) -> Result<()> {
        let wire = self.wire_path(&self.remote_of(vfs_path));
        command::exec(
            &self.conn,
            &[FtpOp::Site(format!("CHMOD {:o} {wire}", mode & 0o7777))],
        )?;
        self.invalidate_parent(vfs_path);
        Ok(())
    }

    fn chown_op(&self, vfs_path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let wire = self.wire_path(&self.remote_of(vfs_path));
        let mut ops = Vec::new();
        if let Some(uid) = uid {
            ops.push(FtpOp::Site(format!("CHUID {uid} {wire}")));
        }
        if let Some(gid) = gid {
            ops.push(FtpOp::Site(format!("CHGID {gid} {wire}")));
        }
        command::exec(&self.conn, &ops)?;
        self.invalidate_parent(vfs_path);
        Ok(())
    }

    /// Truncate by path (no handle): only emptying and size-matching no-ops
    /// are expressible.
    fn truncate_path(&self, vfs_path: &str, len: u64) -> Result<()> {
        if len == 0 {
            command::create_empty_file(&self.conn, &self.remote_of(vfs_path))?;
            self.invalidate_parent(vfs_path);
            return Ok(());
        }
        let stat = self.stat_path(vfs_path, true)?;
        if stat.size == len {
            Ok(())
        } else {
            Err(Error::Permission)
        }
    }

    /// Truncate against an open handle, per the state machine.
    fn truncate_handle(&self, fh: u64, len: u64) -> Result<()> {
        let handle = self.handles.get(fh).ok_or_else(|| Error::io("stale fh"))?;
        let mut file = handle.lock();
        let remote_size = self
            .stat_path(&file.path, true)
            .map(|stat| stat.size)
            .unwrap_or(0);
        match classify_ftruncate(&file, len, remote_size) {
            TruncateAction::CreateEmpty => {
                command::create_empty_file(&self.conn, &file.remote_path)?;
                self.invalidate_parent(&file.path);
                file.write_may_start = true;
                file.known_size = 0;
                Ok(())
            }
            TruncateAction::Noop => Ok(()),
            TruncateAction::Reject => Err(Error::Permission),
        }
    }

    fn setattr_impl(
        &self,
        req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        fh: Option<FileHandle>,
    ) -> Result<FileAttr> {
        let path = self.inodes.path_of(ino.0).ok_or(Error::NotFound)?;
        if let Some(mode) = mode {
            self.chmod_op(&path, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            self.chown_op(&path, uid, gid)?;
        }
        if let Some(len) = size {
            match fh {
                Some(fh) => self.truncate_handle(fh.0, len)?,
                None => self.truncate_path(&path, len)?,
            }
        }
        // utimens and friends are silent no-ops: FTP has no portable mtime-set
        let mutated = mode.is_some() || uid.is_some() || gid.is_some() || size.is_some();
        let stat = self.stat_path(&path, !mutated)?;
        Ok(self.attr_of(req, &path, &stat))
    }

    fn open_impl(&self, ino: INodeNo, flags: i32) -> Result<u64> {
        let path = self.inodes.path_of(ino.0).ok_or(Error::NotFound)?;
        let remote = self.remote_of(&path);
        match classify_open(flags, self.config.rdwr_shim)? {
            OpenKind::Read => {
                let stat = self.stat_path(&path, true).map_err(|_| Error::Access)?;
                let mut file = OpenFile::new(&path, &remote, flags);
                file.can_shrink = true;
                file.known_size = stat.size;
                let fh = self.handles.insert(file);
                if stat.size > 0 {
                    let handle = self.handles.get(fh).expect("just inserted");
                    let mut file = handle.lock();
                    let probed =
                        read_window::read_chunk(&self.conn, &mut file, fh, 0, 1, None, false);
                    if !matches!(probed, Ok(1)) {
                        drop(file);
                        self.handles.remove(fh);
                        return Err(Error::Access);
                    }
                }
                Ok(fh)
            }
            OpenKind::Write { excl, trunc, creat } => {
                if excl && self.stat_path(&path, false).is_ok() {
                    return Err(Error::Access);
                }
                let mut file = OpenFile::new(&path, &remote, flags);
                file.known_size = self
                    .stat_path(&path, true)
                    .map(|stat| stat.size)
                    .unwrap_or(0);
                if trunc || creat {
                    command::create_empty_file(&self.conn, &remote)?;
                    self.invalidate_parent(&path);
                    file.known_size = 0;
                    file.write_may_start = true;
                    self.start_upload(&mut file, false)?;
                }
                Ok(self.handles.insert(file))
            }
        }
    }

    fn create_impl(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> Result<(FileAttr, u64)> {
        let path = self.resolve(parent, name)?;
        let remote = self.remote_of(&path);
        let kind = classify_open(flags, self.config.rdwr_shim)?;
        if let OpenKind::Write { excl: true, .. } = kind {
            match self.stat_path(&path, false) {
                Ok(_) => return Err(Error::Access),
                Err(Error::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        command::create_empty_file(&self.conn, &remote)?;
        self.invalidate_parent(&path);
        let perm = mode & 0o7777 & !umask;
        if perm != 0o644 {
            // best effort; servers without SITE CHMOD still get the file
            if self.chmod_op(&path, perm).is_err() {
                debug!("create: SITE CHMOD {perm:o} {path} not honored");
            }
        }
        let mut file = OpenFile::new(&path, &remote, flags);
        let fh = match kind {
            OpenKind::Read => {
                file.can_shrink = true;
                self.handles.insert(file)
            }
            OpenKind::Write { .. } => {
                file.write_may_start = true;
                self.start_upload(&mut file, false)?;
                self.handles.insert(file)
            }
        };
        let mut stat = RemoteStat::directory_placeholder(&path);
        stat.kind = FileType::RegularFile;
        stat.perm = perm as u16;
        Ok((self.attr_of(req, &path, &stat), fh))
    }
}

#[allow(clippy::too_many_arguments)]
impl Filesystem for FtpFs {
    fn destroy(&mut self) {
        info!("unmounting {}", self.config.host.host);
        let mut state = self.conn.lock();
        self.conn.abort_download(&mut state);
        let _ = state.ftp.quit();
    }

    fn lookup(&self, req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let looked_up = self.resolve(parent, name).and_then(|path| {
            let stat = self.stat_path(&path, true)?;
            Ok(self.attr_of(req, &path, &stat))
        });
        match looked_up {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(err) => reply.error(logged("lookup", err)),
        }
    }

    fn getattr(&self, req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        let stat = self
            .inodes
            .path_of(ino.0)
            .ok_or(Error::NotFound)
            .and_then(|path| {
                let stat = self.stat_path(&path, true)?;
                Ok(self.attr_of(req, &path, &stat))
            });
        match stat {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(logged("getattr", err)),
        }
    }

    fn setattr(
        &self,
        req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        match self.setattr_impl(req, ino, mode, uid, gid, size, fh) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(logged("setattr", err)),
        }
    }

    fn readlink(&self, _req: &Request, ino: INodeNo, reply: ReplyData) {
        let target = self
            .inodes
            .path_of(ino.0)
            .ok_or(Error::NotFound)
            .and_then(|path| self.stat_path(&path, true));
        match target {
            Ok(stat) => match stat.link_target {
                Some(target) => reply.data(target.as_bytes()),
                None => reply.error(Errno::EINVAL),
            },
            Err(err) => reply.error(logged("readlink", err)),
        }
    }

    fn mknod(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        #[allow(clippy::unnecessary_cast)] // libc::S_* are u16 on some platforms
        let (ifmt, ifreg) = (libc::S_IFMT as u32, libc::S_IFREG as u32);
        if mode & ifmt != 0 && mode & ifmt != ifreg {
            reply.error(Errno::EPERM);
            return;
        }
        let made = self.resolve(parent, name).and_then(|path| {
            command::create_empty_file(&self.conn, &self.remote_of(&path))?;
            self.invalidate_parent(&path);
            let mut stat = RemoteStat::directory_placeholder(&path);
            stat.kind = FileType::RegularFile;
            stat.perm = (mode & 0o7777) as u16;
            stat.size = 0;
            Ok(self.attr_of(req, &path, &stat))
        });
        match made {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(err) => reply.error(logged("mknod", err)),
        }
    }

    fn mkdir(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let made = self.resolve(parent, name).and_then(|path| {
            let wire = self.wire_path(&self.remote_of(&path));
            command::exec(&self.conn, &[FtpOp::Mkdir(wire)])?;
            self.invalidate_parent(&path);
            let stat = self.stat_path(&path, false).unwrap_or_else(|_| {
                let mut stat = RemoteStat::directory_placeholder(&path);
                stat.perm = (mode & 0o7777) as u16;
                stat
            });
            Ok(self.attr_of(req, &path, &stat))
        });
        match made {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(err) => reply.error(logged("mkdir", err)),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let removed = self.resolve(parent, name).and_then(|path| {
            let wire = self.wire_path(&self.remote_of(&path));
            command::exec(&self.conn, &[FtpOp::Delete(wire)])?;
            self.invalidate_parent(&path);
            self.inodes.forget_path(&path);
            Ok(())
        });
        match removed {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(logged("unlink", err)),
        }
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let removed = self.resolve(parent, name).and_then(|path| {
            let wire = self.wire_path(&self.remote_of(&path));
            command::exec(&self.conn, &[FtpOp::Rmdir(wire)])?;
            self.invalidate_parent(&path);
            self.cache.invalidate(&path);
            self.inodes.forget_path(&path);
            Ok(())
        });
        match removed {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(logged("rmdir", err)),
        }
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        let renamed = self.resolve(parent, name).and_then(|from| {
            let to = self.resolve(newparent, newname)?;
            command::exec(
                &self.conn,
                &[FtpOp::Rename {
                    from: self.wire_path(&self.remote_of(&from)),
                    to: self.wire_path(&self.remote_of(&to)),
                }],
            )?;
            self.invalidate_parent(&from);
            self.invalidate_parent(&to);
            self.cache.invalidate(&from);
            self.cache.invalidate(&to);
            self.inodes.forget_path(&to);
            self.inodes.rename(&from, &to);
            Ok(())
        });
        match renamed {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(logged("rename", err)),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        match self.open_impl(ino, flags.0) {
            Ok(fh) => reply.opened(FileHandle(fh), FopenFlags::empty()),
            Err(err) => reply.error(logged("open", err)),
        }
    }

    fn create(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        match self.create_impl(req, parent, name, mode, umask, flags) {
            Ok((attr, fh)) => reply.created(&TTL, &attr, Generation(0), FileHandle(fh), 0),
            Err(err) => reply.error(logged("create", err)),
        }
    }

    fn read(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _read_flags: ReadFlags,
        _flags: u32,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.handles.get(fh.0) else {
            reply.error(Errno::EBADF);
            return;
        };
        let mut file = handle.lock();
        if file.is_writing() {
            reply.error(logged("read", Error::io("handle is committed to writing")));
            return;
        }
        let mut out = Vec::with_capacity(size as usize);
        match read_window::read_chunk(
            &self.conn,
            &mut file,
            fh.0,
            offset,
            size as usize,
            Some(&mut out),
            true,
        ) {
            Ok(_) => reply.data(&out),
            Err(err) => reply.error(logged("read", err)),
        }
    }

    fn write(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: i64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let Some(handle) = self.handles.get(fh.0) else {
            reply.error(Errno::EBADF);
            return;
        };
        if offset < 0 {
            reply.error(Errno::EINVAL);
            return;
        }
        let mut file = handle.lock();
        let path = file.path.clone();
        let written = write_stream::write(&mut file, &self.config, data, offset as u64, || {
            self.remote_size(&path)
        });
        match written {
            Ok(n) => reply.written(n as u32),
            Err(err) => reply.error(logged("write", err)),
        }
    }

    fn flush(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _lock_owner: LockOwner,
        reply: ReplyEmpty,
    ) {
        let Some(handle) = self.handles.get(fh.0) else {
            reply.error(Errno::EBADF);
            return;
        };
        let mut file = handle.lock();
        match self.finish_and_verify(&mut file) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(logged("flush", err)),
        }
    }

    fn fsync(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        let Some(handle) = self.handles.get(fh.0) else {
            reply.error(Errno::EBADF);
            return;
        };
        let mut file = handle.lock();
        match self.finish_and_verify(&mut file) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(logged("fsync", err)),
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(handle) = self.handles.remove(fh.0) {
            let mut file = handle.lock();
            if let Err(err) = self.finish_and_verify(&mut file) {
                debug!("release of {}: {err}", file.path);
            }
            let mut state = self.conn.lock();
            if state.current_fh == Some(fh.0) {
                self.conn.abort_download(&mut state);
                state.current_fh = None;
            }
        }
        reply.ok();
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inodes.path_of(ino.0) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let listing = match self.listing(&path, true) {
            Ok(listing) => listing,
            Err(err) => {
                reply.error(logged("readdir", err));
                return;
            }
        };
        let (parent_path, _) = split_parent(&path);
        let parent_ino = self.inodes.get_or_assign(parent_path);
        let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(listing.len() + 2);
        entries.push((ino.0, FileType::Directory, ".".to_string()));
        entries.push((parent_ino, FileType::Directory, "..".to_string()));
        for stat in listing.iter() {
            let child = join_child(&path, &stat.name);
            entries.push((self.inodes.get_or_assign(&child), stat.kind, stat.name.clone()));
        }
        for (index, (child_ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(INodeNo(child_ino), index as u64 + 1, kind, OsStr::new(&name)) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: ReplyStatfs) {
        // synthetic: FTP has no statvfs, so advertise plenty of space
        let bsize = self.config.blksize;
        reply.statfs(
            999_999_999,
            999_999_999,
            999_999_999,
            999_999_999,
            999_999_999,
            bsize,
            255,
            bsize,
        );
    }

    fn access(&self, _req: &Request, _ino: INodeNo, _mask: AccessFlags, reply: ReplyEmpty) {
        // permission bits in listings are advisory; the server is the judge
        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_table_is_stable() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO).as_deref(), Some("/"));
        let a = table.get_or_assign("/a");
        assert_eq!(table.get_or_assign("/a"), a);
        assert_ne!(table.get_or_assign("/b"), a);
        assert_eq!(table.path_of(a).as_deref(), Some("/a"));
    }

    #[test]
    fn inode_table_forgets() {
        let table = InodeTable::new();
        let a = table.get_or_assign("/gone");
        table.forget_path("/gone");
        assert!(table.path_of(a).is_none());
        // a fresh assignment gets a fresh inode
        assert_ne!(table.get_or_assign("/gone"), a);
    }

    #[test]
    fn inode_rename_moves_subtree() {
        let table = InodeTable::new();
        let dir = table.get_or_assign("/old");
        let child = table.get_or_assign("/old/file");
        let other = table.get_or_assign("/older");
        table.rename("/old", "/new");
        assert_eq!(table.path_of(dir).as_deref(), Some("/new"));
        assert_eq!(table.path_of(child).as_deref(), Some("/new/file"));
        assert_eq!(table.get_or_assign("/new/file"), child);
        // prefix match must not catch sibling names
        assert_eq!(table.path_of(other).as_deref(), Some("/older"));
    }
}
