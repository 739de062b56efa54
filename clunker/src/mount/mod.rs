use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashSet;
use fuser::{
    FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow, FUSE_ROOT_ID,
};
use tracing::debug;

use crate::fs::permissions::Credentials;
use crate::fs::types::SetTime;
use crate::fs::ClunkerFs;

/// Zero TTL: the kernel must re-ask for every operation, otherwise
/// attribute caching would absorb requests and make the operation budget
/// nondeterministic.
const TTL: Duration = Duration::ZERO;
const GENERATION: u64 = 0;

/// OS thread ids whose requests are self-induced and must be short-
/// circuited. Registration happens before any out-of-band syscall can be
/// issued.
pub struct OobThreads {
    threads: DashSet<u32>,
}

impl OobThreads {
    pub fn new() -> Self {
        Self {
            threads: DashSet::new(),
        }
    }

    pub fn register(&self, tid: u32) {
        self.threads.insert(tid);
    }

    pub fn register_current(&self) {
        self.register(current_thread_id());
    }

    pub fn is_registered(&self, tid: u32) -> bool {
        self.threads.contains(&tid)
    }
}

impl Default for OobThreads {
    fn default() -> Self {
        Self::new()
    }
}

pub fn current_thread_id() -> u32 {
    unsafe { libc::gettid() as u32 }
}

pub fn mount_options() -> Vec<MountOption> {
    vec![MountOption::FSName("clunker".to_string())]
}

/// A neutral attribute for out-of-band replies that must carry one. The
/// root keeps its directory type so self-induced path walks do not trip
/// over it.
fn stub_attr(ino: u64) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind: if ino == FUSE_ROOT_ID {
            FileType::Directory
        } else {
            FileType::RegularFile
        },
        perm: 0o755,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn set_time(time: Option<TimeOrNow>) -> SetTime {
    match time {
        Some(TimeOrNow::SpecificTime(ts)) => SetTime::SetToClientTime(ts.into()),
        Some(TimeOrNow::Now) => SetTime::SetToServerTime,
        None => SetTime::NoChange,
    }
}

/// The kernel-facing adapter: resolves inode-keyed FUSE requests to the
/// path-keyed engine, applying the dispatcher ceremony to every callback.
/// The self-request short circuit runs first, then the engine call, whose
/// single lock and budget gate play OperationBegin/OperationEnd.
pub struct ClunkerMount {
    fs: Arc<ClunkerFs>,
    oob: Arc<OobThreads>,
    paths: HashMap<u64, String>,
    inodes: HashMap<String, u64>,
}

impl ClunkerMount {
    pub fn new(fs: Arc<ClunkerFs>, oob: Arc<OobThreads>) -> Self {
        let mut paths = HashMap::new();
        let mut inodes = HashMap::new();
        paths.insert(FUSE_ROOT_ID, "/".to_string());
        inodes.insert("/".to_string(), FUSE_ROOT_ID);
        Self {
            fs,
            oob,
            paths,
            inodes,
        }
    }

    /// Requests from thread id zero or from a registered out-of-band thread
    /// are self-induced notifications, served without touching the engine
    /// or the budget.
    fn is_oob(&self, req: &Request<'_>) -> bool {
        let tid = req.pid();
        if tid == 0 || self.oob.is_registered(tid) {
            debug!("short-circuiting self request from tid {}", tid);
            return true;
        }
        false
    }

    fn creds(req: &Request<'_>) -> Credentials {
        Credentials {
            uid: req.uid(),
            gid: req.gid(),
        }
    }

    fn path_for(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).cloned()
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent = self.paths.get(&parent)?;
        let name = name.to_str()?;
        Some(if parent == "/" {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        })
    }

    fn remember(&mut self, path: &str, ino: u64) {
        self.paths.insert(ino, path.to_string());
        self.inodes.insert(path.to_string(), ino);
    }

    fn forget_path(&mut self, path: &str) {
        if let Some(ino) = self.inodes.remove(path) {
            self.paths.remove(&ino);
        }
    }

    fn move_path(&mut self, from: &str, to: &str) {
        if let Some(ino) = self.inodes.remove(from) {
            self.paths.insert(ino, to.to_string());
            self.inodes.insert(to.to_string(), ino);
        }
    }
}

impl Filesystem for ClunkerMount {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if self.is_oob(req) {
            // There is no representable "exists, type unknown" success; a
            // self-induced removal that sees ENOENT has already achieved
            // its goal.
            reply.error(libc::ENOENT);
            return;
        }
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        // Path resolution must not consume the budget: with a zero TTL the
        // kernel re-walks every ancestor component on every syscall.
        match self.fs.stat_unbudgeted(&path) {
            Ok(attrs) => {
                self.remember(&path, attrs.fileid);
                reply.entry(&TTL, &(&attrs).into(), GENERATION);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if self.is_oob(req) {
            reply.attr(&TTL, &stub_attr(ino));
            return;
        }
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(attrs) => reply.attr(&TTL, &(&attrs).into()),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if self.is_oob(req) {
            reply.attr(&TTL, &stub_attr(ino));
            return;
        }
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        // One kernel setattr fans out to the individual metadata ops, each
        // a charged engine operation of its own.
        let mut attrs = None;
        if let Some(mode) = mode {
            match self.fs.chmod(&path, mode) {
                Ok(a) => attrs = Some(a),
                Err(err) => {
                    reply.error(err.to_errno());
                    return;
                }
            }
        }
        if uid.is_some() || gid.is_some() {
            match self.fs.chown(&path, uid, gid) {
                Ok(a) => attrs = Some(a),
                Err(err) => {
                    reply.error(err.to_errno());
                    return;
                }
            }
        }
        if let Some(size) = size {
            match self.fs.truncate(&path, size) {
                Ok(a) => attrs = Some(a),
                Err(err) => {
                    reply.error(err.to_errno());
                    return;
                }
            }
        }
        if atime.is_some() || mtime.is_some() {
            match self.fs.utimens(&path, set_time(atime), set_time(mtime)) {
                Ok(a) => attrs = Some(a),
                Err(err) => {
                    reply.error(err.to_errno());
                    return;
                }
            }
        }
        let attrs = match attrs {
            Some(attrs) => Ok(attrs),
            None => self.fs.getattr(&path),
        };
        match attrs {
            Ok(attrs) => reply.attr(&TTL, &(&attrs).into()),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        if self.is_oob(req) {
            reply.data(&[]);
            return;
        }
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.readlink(&path) {
            Ok(target) => reply.data(&target),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        if self.is_oob(req) {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.mkdir(&Self::creds(req), &path, mode) {
            Ok(attrs) => {
                self.remember(&path, attrs.fileid);
                reply.entry(&TTL, &(&attrs).into(), GENERATION);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if self.is_oob(req) {
            reply.ok();
            return;
        }
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.unlink(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if self.is_oob(req) {
            reply.ok();
            return;
        }
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        if self.is_oob(req) {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(path) = self.child_path(parent, link_name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let target = target.to_string_lossy();
        match self.fs.symlink(&Self::creds(req), &target, &path) {
            Ok(attrs) => {
                self.remember(&path, attrs.fileid);
                reply.entry(&TTL, &(&attrs).into(), GENERATION);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        if self.is_oob(req) {
            reply.ok();
            return;
        }
        let (Some(from), Some(to)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.rename(&from, &to) {
            Ok(()) => {
                self.move_path(&from, &to);
                reply.ok();
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        if self.is_oob(req) {
            reply.error(libc::ENOENT);
            return;
        }
        let (Some(from), Some(to)) = (self.path_for(ino), self.child_path(newparent, newname))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.link(&from, &to) {
            Ok(attrs) => {
                self.remember(&to, attrs.fileid);
                reply.entry(&TTL, &(&attrs).into(), GENERATION);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if self.is_oob(req) {
            reply.opened(0, 0);
            return;
        }
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.open(&Self::creds(req), &path, flags) {
            Ok((fh, _)) => reply.opened(fh, 0),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if self.is_oob(req) {
            reply.data(&[]);
            return;
        }
        match self.fs.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if self.is_oob(req) {
            reply.written(data.len() as u32);
            return;
        }
        match self.fs.write(fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if self.is_oob(req) {
            reply.ok();
            return;
        }
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        if self.is_oob(req) {
            reply.opened(0, 0);
            return;
        }
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.opendir(&Self::creds(req), &path) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if self.is_oob(req) {
            reply.ok();
            return;
        }
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let result = self.fs.readdir(&path, offset, &mut |entry| {
            reply.add(entry.fileid, entry.cookie, entry.kind.into(), &entry.name)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn releasedir(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        if self.is_oob(req) {
            reply.ok();
            return;
        }
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        if self.is_oob(req) {
            reply.ok();
            return;
        }
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.access(&Self::creds(req), &path, mask) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        if self.is_oob(req) {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.create(&Self::creds(req), &path, mode) {
            Ok((fh, attrs)) => {
                self.remember(&path, attrs.fileid);
                reply.created(&TTL, &(&attrs).into(), GENERATION, fh, 0);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }
}
