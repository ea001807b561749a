//! Conversion from directory-listing entries to kernel attributes.
//!
//! Listing lines are handed to the `suppaftp` listing parser; the parsed
//! entries are reduced to [`RemoteStat`], the crate's cached metadata shape,
//! which converts to a [`FileAttr`] at reply time.

use std::time::SystemTime;

use fuser::FileAttr;
use fuser::FileType;
use fuser::INodeNo;
use log::debug;
use suppaftp::list::File;
use suppaftp::list::PosixPex;

use crate::charset::CodepageConv;

/// Metadata for one remote directory entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStat {
    /// Entry name in the local charset.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// File kind.
    pub kind: FileType,
    /// Permission bits.
    pub perm: u16,
    /// Owner uid when the listing carried a numeric one.
    pub uid: Option<u32>,
    /// Owner gid when the listing carried a numeric one.
    pub gid: Option<u32>,
    /// Modification time.
    pub mtime: SystemTime,
    /// Symlink target, for link entries.
    pub link_target: Option<String>,
}

fn pex_bits(pex: PosixPex) -> u16 {
    let mut bits = 0;
    if pex.can_read() {
        bits |= 0o4;
    }
    if pex.can_write() {
        bits |= 0o2;
    }
    if pex.can_execute() {
        bits |= 0o1;
    }
    bits
}

impl RemoteStat {
    /// Parse one listing line. Unparsable lines and the `.`/`..` entries
    /// yield `None`.
    pub fn from_listing_line(line: &str, conv: Option<&CodepageConv>) -> Option<RemoteStat> {
        let file = match File::try_from(line) {
            Ok(file) => file,
            Err(err) => {
                debug!("unparsable listing line {line:?}: {err}");
                return None;
            }
        };
        if file.name() == "." || file.name() == ".." {
            return None;
        }
        let name = match conv {
            Some(conv) => conv.to_local(file.name().as_bytes()),
            None => file.name().to_string(),
        };
        let kind = if file.is_directory() {
            FileType::Directory
        } else if file.is_symlink() {
            FileType::Symlink
        } else {
            FileType::RegularFile
        };
        let (user, group, other) = file.posix_pex();
        let perm = (pex_bits(user) << 6) | (pex_bits(group) << 3) | pex_bits(other);
        Some(RemoteStat {
            name,
            size: file.size() as u64,
            kind,
            perm,
            uid: file.uid(),
            gid: file.gid(),
            mtime: file.modified(),
            link_target: file
                .symlink()
                .map(|target| target.to_string_lossy().into_owned()),
        })
    }

    /// Synthetic attributes for a directory the server will not list for us
    /// (the mount root, or a directory we just created).
    pub fn directory_placeholder(name: &str) -> RemoteStat {
        RemoteStat {
            name: name.to_string(),
            size: 0,
            kind: FileType::Directory,
            perm: 0o755,
            uid: None,
            gid: None,
            mtime: SystemTime::now(),
            link_target: None,
        }
    }

    /// Kernel-facing attributes for this entry.
    pub fn to_attr(&self, ino: INodeNo, blksize: u32, uid: u32, gid: u32) -> FileAttr {
        FileAttr {
            ino,
            size: self.size,
            blocks: self.size.div_ceil(512),
            atime: self.mtime,
            mtime: self.mtime,
            ctime: self.mtime,
            crtime: self.mtime,
            kind: self.kind,
            perm: self.perm,
            nlink: if self.kind == FileType::Directory { 2 } else { 1 },
            uid: self.uid.unwrap_or(uid),
            gid: self.gid.unwrap_or(gid),
            rdev: 0,
            blksize,
            flags: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_regular_file() {
        let stat =
            RemoteStat::from_listing_line("-rw-r--r-- 1 1000 1000 1234 Feb 3 21:15 notes.txt", None)
                .unwrap();
        assert_eq!(stat.name, "notes.txt");
        assert_eq!(stat.size, 1234);
        assert_eq!(stat.kind, FileType::RegularFile);
        assert_eq!(stat.perm, 0o644);
        assert_eq!(stat.uid, Some(1000));
        assert_eq!(stat.gid, Some(1000));
        assert!(stat.link_target.is_none());
    }

    #[test]
    fn parses_directory() {
        let stat =
            RemoteStat::from_listing_line("drwxr-xr-x 2 ftp ftp 4096 Jan 5 10:00 docs", None)
                .unwrap();
        assert_eq!(stat.kind, FileType::Directory);
        assert_eq!(stat.perm, 0o755);
        assert_eq!(stat.uid, None);
    }

    #[test]
    fn parses_symlink_target() {
        let stat = RemoteStat::from_listing_line(
            "lrwxrwxrwx 1 ftp ftp 7 Mar 1 12:00 current -> release",
            None,
        )
        .unwrap();
        assert_eq!(stat.kind, FileType::Symlink);
        assert_eq!(stat.name, "current");
        assert_eq!(stat.link_target.as_deref(), Some("release"));
    }

    #[test]
    fn skips_dot_entries_and_noise() {
        assert!(RemoteStat::from_listing_line("drwxr-xr-x 2 ftp ftp 4096 Jan 5 10:00 .", None)
            .is_none());
        assert!(RemoteStat::from_listing_line("total 128", None).is_none());
    }

    #[test]
    fn attr_fills_defaults() {
        let stat =
            RemoteStat::from_listing_line("-rw------- 1 ftp ftp 512 Feb 3 21:15 secret", None)
                .unwrap();
        let attr = stat.to_attr(INodeNo(7), 4096, 1000, 1000);
        assert_eq!(attr.ino, INodeNo(7));
        assert_eq!(attr.size, 512);
        assert_eq!(attr.blocks, 1);
        assert_eq!(attr.perm, 0o600);
        assert_eq!(attr.uid, 1000);
        assert_eq!(attr.blksize, 4096);
        assert_eq!(attr.nlink, 1);
    }

    #[test]
    fn directory_placeholder_is_searchable() {
        let stat = RemoteStat::directory_placeholder("/");
        let attr = stat.to_attr(INodeNo(1), 4096, 0, 0);
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, 0o755);
        assert_eq!(attr.nlink, 2);
    }
}
