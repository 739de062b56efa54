use std::sync::{Arc, Mutex};

use super::types::{FileAttributes, FileKind, Timestamp};

/// Shared-ownership cell for a file object. The path map holds one strong
/// reference per hard link; every open handle holds another. The object is
/// destroyed when the last reference drops, so an unlinked-but-open file
/// keeps working until `release`.
pub type NodeHandle = Arc<Mutex<FileNode>>;

#[derive(Debug, Clone)]
pub enum NodePayload {
    Directory,
    Regular(Vec<u8>),
    Symlink(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct FileNode {
    /// Stable object id, doubles as the FUSE inode number.
    pub id: u64,
    /// Full mode word. The `S_IFMT` field always agrees with the payload
    /// variant; `chmod` only rewrites the low 12 bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub payload: NodePayload,
}

impl FileNode {
    fn new(id: u64, mode: u32, uid: u32, gid: u32, payload: NodePayload) -> Self {
        let kind = match payload {
            NodePayload::Directory => FileKind::Directory,
            NodePayload::Regular(_) => FileKind::Regular,
            NodePayload::Symlink(_) => FileKind::Symlink,
        };
        let now = Timestamp::now();
        Self {
            id,
            mode: kind.type_bits() | (mode & 0o7777),
            uid,
            gid,
            nlink: if kind == FileKind::Directory { 2 } else { 1 },
            atime: now,
            mtime: now,
            ctime: now,
            payload,
        }
    }

    pub fn new_directory(id: u64, mode: u32, uid: u32, gid: u32) -> NodeHandle {
        Arc::new(Mutex::new(Self::new(
            id,
            mode,
            uid,
            gid,
            NodePayload::Directory,
        )))
    }

    pub fn new_regular(id: u64, mode: u32, uid: u32, gid: u32) -> NodeHandle {
        Arc::new(Mutex::new(Self::new(
            id,
            mode,
            uid,
            gid,
            NodePayload::Regular(Vec::new()),
        )))
    }

    pub fn new_symlink(id: u64, target: Vec<u8>, uid: u32, gid: u32) -> NodeHandle {
        Arc::new(Mutex::new(Self::new(
            id,
            0o777,
            uid,
            gid,
            NodePayload::Symlink(target),
        )))
    }

    pub fn kind(&self) -> FileKind {
        match self.payload {
            NodePayload::Directory => FileKind::Directory,
            NodePayload::Regular(_) => FileKind::Regular,
            NodePayload::Symlink(_) => FileKind::Symlink,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.payload, NodePayload::Directory)
    }

    pub fn size(&self) -> u64 {
        match &self.payload {
            NodePayload::Directory => 4096,
            NodePayload::Regular(data) => data.len() as u64,
            NodePayload::Symlink(target) => target.len() as u64,
        }
    }

    pub fn attributes(&self) -> FileAttributes {
        FileAttributes {
            kind: self.kind(),
            mode: self.mode,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            size: self.size(),
            fileid: self.id,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }
}
