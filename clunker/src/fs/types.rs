use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

impl FileKind {
    /// The `S_IFMT` bits this kind occupies in a mode word.
    pub fn type_bits(self) -> u32 {
        match self {
            FileKind::Regular => libc::S_IFREG,
            FileKind::Directory => libc::S_IFDIR,
            FileKind::Symlink => libc::S_IFLNK,
        }
    }
}

impl From<FileKind> for fuser::FileType {
    fn from(kind: FileKind) -> Self {
        match kind {
            FileKind::Regular => fuser::FileType::RegularFile,
            FileKind::Directory => fuser::FileType::Directory,
            FileKind::Symlink => fuser::FileType::Symlink,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: now.as_secs(),
            nanoseconds: now.subsec_nanos(),
        }
    }
}

impl From<Timestamp> for SystemTime {
    fn from(ts: Timestamp) -> Self {
        UNIX_EPOCH + Duration::new(ts.seconds, ts.nanoseconds)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            seconds: since_epoch.as_secs(),
            nanoseconds: since_epoch.subsec_nanos(),
        }
    }
}

/// Stat metadata as the engine reports it. `mode` carries the full mode
/// word including the `S_IFMT` field, which always agrees with `kind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub kind: FileKind,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub fileid: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
}

impl From<&FileAttributes> for fuser::FileAttr {
    fn from(attrs: &FileAttributes) -> Self {
        fuser::FileAttr {
            ino: attrs.fileid,
            size: attrs.size,
            blocks: attrs.size.div_ceil(512),
            atime: attrs.atime.into(),
            mtime: attrs.mtime.into(),
            ctime: attrs.ctime.into(),
            crtime: attrs.ctime.into(),
            kind: attrs.kind.into(),
            perm: (attrs.mode & 0o7777) as u16,
            nlink: attrs.nlink,
            uid: attrs.uid,
            gid: attrs.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

/// How `utimens` should set one time field.
#[derive(Debug, Clone, Copy)]
pub enum SetTime {
    SetToClientTime(Timestamp),
    SetToServerTime,
    NoChange,
}

/// One directory entry yielded by `readdir`. The cookie is the opaque
/// resume offset the kernel hands back; cookies increase monotonically
/// within a listing.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub fileid: u64,
    pub name: String,
    pub kind: FileKind,
    pub cookie: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_bits_match_kind() {
        assert_eq!(FileKind::Regular.type_bits(), libc::S_IFREG);
        assert_eq!(FileKind::Directory.type_bits(), libc::S_IFDIR);
        assert_eq!(FileKind::Symlink.type_bits(), libc::S_IFLNK);
    }

    #[test]
    fn test_timestamp_systemtime_round_trip() {
        let ts = Timestamp {
            seconds: 1234567890,
            nanoseconds: 123456789,
        };
        let system: SystemTime = ts.into();
        let back: Timestamp = system.into();
        assert_eq!(back, ts);
    }

    #[test]
    fn test_attributes_to_fuse_attr() {
        let attrs = FileAttributes {
            kind: FileKind::Regular,
            mode: libc::S_IFREG | 0o644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            size: 1024,
            fileid: 42,
            atime: Timestamp {
                seconds: 10,
                nanoseconds: 0,
            },
            mtime: Timestamp {
                seconds: 20,
                nanoseconds: 0,
            },
            ctime: Timestamp {
                seconds: 30,
                nanoseconds: 0,
            },
        };

        let fuse_attr: fuser::FileAttr = (&attrs).into();
        assert_eq!(fuse_attr.ino, 42);
        assert_eq!(fuse_attr.size, 1024);
        assert_eq!(fuse_attr.perm, 0o644);
        assert_eq!(fuse_attr.uid, 1000);
        assert!(matches!(fuse_attr.kind, fuser::FileType::RegularFile));
    }
}
