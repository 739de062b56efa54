pub mod budget;
pub mod errors;
pub mod node;
pub mod permissions;
pub mod store;
pub mod types;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use self::budget::OpBudget;
use self::errors::{FsError, FsResult};
use self::node::{FileNode, NodeHandle, NodePayload};
use self::permissions::{check_access, AccessRequest, Credentials};
use self::store::ObjectStore;
use self::types::{DirEntry, FileAttributes, SetTime, Timestamp};

/// Object id of `/`, chosen to coincide with the kernel's root inode
/// number.
pub const ROOT_ID: u64 = 1;

const SYMLINK_HOPS: usize = 16;

fn current_uid_gid() -> (u32, u32) {
    unsafe { (libc::geteuid(), libc::getegid()) }
}

fn lock_node(handle: &NodeHandle) -> MutexGuard<'_, FileNode> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

struct FsState {
    store: ObjectStore,
    handles: HashMap<u64, NodeHandle>,
    next_handle: u64,
    next_id: u64,
    budget: OpBudget,
}

impl FsState {
    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocate_handle(&mut self, node: NodeHandle) -> u64 {
        let fh = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(fh, node);
        fh
    }

    fn handle(&self, fh: u64) -> FsResult<NodeHandle> {
        self.handles.get(&fh).cloned().ok_or(FsError::BadHandle)
    }

    /// Follow symlinks until a non-link object is found. Relative targets
    /// resolve against the link's parent directory.
    fn resolve(&self, path: &str) -> FsResult<(String, NodeHandle)> {
        let mut current = path.to_string();
        for _ in 0..SYMLINK_HOPS {
            let node = self.store.lookup(&current).ok_or(FsError::NotFound)?;
            let target = {
                let guard = lock_node(&node);
                match &guard.payload {
                    NodePayload::Symlink(target) => {
                        Some(String::from_utf8_lossy(target).into_owned())
                    }
                    _ => None,
                }
            };
            let Some(target) = target else {
                return Ok((current, node));
            };
            current = if target.starts_with('/') {
                target
            } else {
                let parent = parent_dir(&current);
                if parent == "/" {
                    format!("/{target}")
                } else {
                    format!("{parent}/{target}")
                }
            };
        }
        Err(FsError::NotFound)
    }
}

/// The in-memory filesystem engine. A single exclusive lock serializes the
/// object store, the open-handle table, and the operation budget; every
/// in-band operation charges the budget on entry. The control surface
/// (`clean` / `set_count` / `get_count`) takes the same lock but never
/// touches the budget.
pub struct ClunkerFs {
    state: Mutex<FsState>,
}

impl ClunkerFs {
    pub fn new() -> Self {
        let (uid, gid) = current_uid_gid();
        let mut store = ObjectStore::new();
        store.insert(
            "/".to_string(),
            FileNode::new_directory(ROOT_ID, 0o1777, uid, gid),
        );
        Self {
            state: Mutex::new(FsState {
                store,
                handles: HashMap::new(),
                next_handle: 1,
                next_id: ROOT_ID + 1,
                budget: OpBudget::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the engine and charge the budget gate; the gate runs before any
    /// validation, so an exhausted budget wins over every other error.
    fn charged(&self) -> FsResult<MutexGuard<'_, FsState>> {
        let mut state = self.state();
        state.budget.charge()?;
        Ok(state)
    }

    pub fn getattr(&self, path: &str) -> FsResult<FileAttributes> {
        debug!("getattr: path={}", path);
        let state = self.charged()?;
        let node = state.store.lookup(path).ok_or(FsError::NotFound)?;
        let attrs = lock_node(&node).attributes();
        Ok(attrs)
    }

    /// Path-to-attributes read for the bridge's `lookup` resolution.
    /// Kernel path walking is bridge plumbing, not a served operation: the
    /// kernel re-issues lookups for every ancestor component, so charging
    /// here would bill one user-level syscall several times over.
    pub fn stat_unbudgeted(&self, path: &str) -> FsResult<FileAttributes> {
        debug!("stat_unbudgeted: path={}", path);
        let state = self.state();
        let node = state.store.lookup(path).ok_or(FsError::NotFound)?;
        let attrs = lock_node(&node).attributes();
        Ok(attrs)
    }

    pub fn access(&self, creds: &Credentials, path: &str, amode: i32) -> FsResult<()> {
        debug!("access: path={}, amode={:#o}", path, amode);
        let state = self.charged()?;
        let node = state.store.lookup(path).ok_or(FsError::NotFound)?;
        if amode == libc::F_OK {
            return Ok(());
        }
        let result = check_access(&lock_node(&node), creds, AccessRequest::from_amode(amode));
        result
    }

    pub fn opendir(&self, creds: &Credentials, path: &str) -> FsResult<u64> {
        debug!("opendir: path={}", path);
        let mut state = self.charged()?;
        let node = state.store.lookup(path).ok_or(FsError::NotFound)?;
        {
            let guard = lock_node(&node);
            if !guard.is_directory() {
                return Err(FsError::NotDirectory);
            }
            check_access(&guard, creds, AccessRequest::read())?;
        }
        Ok(state.allocate_handle(node))
    }

    /// List the immediate children of `path`, charging the budget once per
    /// yielded entry. The filler returns `true` when its buffer is full;
    /// listing then stops without error. A reply to the bridge is
    /// single-shot, so exhaustion after entries were yielded also stops
    /// the listing: those entries must reach the caller, and the failure
    /// surfaces when the listing resumes from the last cookie.
    pub fn readdir(
        &self,
        path: &str,
        offset: i64,
        filler: &mut dyn FnMut(DirEntry) -> bool,
    ) -> FsResult<()> {
        debug!("readdir: path={}, offset={}", path, offset);
        let mut state = self.state();
        if !state.store.contains(path) {
            return Err(FsError::NotFound);
        }
        let FsState { store, budget, .. } = &mut *state;
        let mut cookie = 0i64;
        let mut yielded = false;
        for (name, node) in store.children(path) {
            cookie += 1;
            if cookie <= offset {
                continue;
            }
            if let Err(err) = budget.charge() {
                if yielded {
                    break;
                }
                return Err(err);
            }
            let entry = {
                let guard = lock_node(node);
                DirEntry {
                    fileid: guard.id,
                    name: name.to_string(),
                    kind: guard.kind(),
                    cookie,
                }
            };
            yielded = true;
            if filler(entry) {
                break;
            }
        }
        Ok(())
    }

    pub fn mkdir(&self, creds: &Credentials, path: &str, mode: u32) -> FsResult<FileAttributes> {
        debug!("mkdir: path={}, mode={:#o}", path, mode);
        let mut state = self.charged()?;
        let id = state.allocate_id();
        let node = FileNode::new_directory(id, mode, creds.uid, creds.gid);
        let attrs = lock_node(&node).attributes();
        state.store.insert(path.to_string(), node);
        Ok(attrs)
    }

    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        debug!("rmdir: path={}", path);
        let mut state = self.charged()?;
        let node = state.store.lookup(path).ok_or(FsError::NotFound)?;
        if !lock_node(&node).is_directory() {
            return Err(FsError::NotDirectory);
        }
        if state.store.has_descendants(path) {
            return Err(FsError::NotEmpty);
        }
        state.store.erase(path);
        Ok(())
    }

    pub fn create(
        &self,
        creds: &Credentials,
        path: &str,
        mode: u32,
    ) -> FsResult<(u64, FileAttributes)> {
        debug!("create: path={}, mode={:#o}", path, mode);
        let mut state = self.charged()?;
        let id = state.allocate_id();
        let node = FileNode::new_regular(id, mode, creds.uid, creds.gid);
        let attrs = lock_node(&node).attributes();
        state.store.insert(path.to_string(), node.clone());
        let fh = state.allocate_handle(node);
        Ok((fh, attrs))
    }

    pub fn open(
        &self,
        creds: &Credentials,
        path: &str,
        flags: i32,
    ) -> FsResult<(u64, FileAttributes)> {
        debug!("open: path={}, flags={:#x}", path, flags);
        let mut state = self.charged()?;
        let (_, node) = state.resolve(path)?;
        let attrs = {
            let guard = lock_node(&node);
            if !matches!(guard.payload, NodePayload::Regular(_)) {
                return Err(FsError::OperationNotPermitted);
            }
            check_access(&guard, creds, AccessRequest::from_open_flags(flags))?;
            guard.attributes()
        };
        let fh = state.allocate_handle(node);
        Ok((fh, attrs))
    }

    pub fn release(&self, fh: u64) -> FsResult<()> {
        debug!("release: fh={}", fh);
        let mut state = self.charged()?;
        state.handles.remove(&fh);
        Ok(())
    }

    /// Copy out up to `min(size, len - offset)` bytes. Reads past the end
    /// of the payload yield nothing; the kernel leaves the remainder of the
    /// caller's buffer untouched.
    pub fn read(&self, fh: u64, offset: i64, size: u32) -> FsResult<Vec<u8>> {
        debug!("read: fh={}, offset={}, size={}", fh, offset, size);
        let state = self.charged()?;
        let node = state.handle(fh)?;
        let mut guard = lock_node(&node);
        guard.atime = Timestamp::now();
        let data = match &guard.payload {
            NodePayload::Regular(data) => data,
            _ => return Err(FsError::BadHandle),
        };
        let start = offset.max(0) as usize;
        if start >= data.len() {
            return Ok(Vec::new());
        }
        let good = std::cmp::min(size as usize, data.len() - start);
        Ok(data[start..start + good].to_vec())
    }

    /// Extend the payload to `offset + data.len()`, zero-filling any gap,
    /// and overwrite the region.
    pub fn write(&self, fh: u64, offset: i64, data: &[u8]) -> FsResult<u32> {
        debug!("write: fh={}, offset={}, size={}", fh, offset, data.len());
        let state = self.charged()?;
        let node = state.handle(fh)?;
        let mut guard = lock_node(&node);
        let now = Timestamp::now();
        guard.mtime = now;
        guard.ctime = now;
        let payload = match &mut guard.payload {
            NodePayload::Regular(payload) => payload,
            _ => return Err(FsError::BadHandle),
        };
        let start = offset.max(0) as usize;
        let end = start + data.len();
        if payload.len() < end {
            payload.resize(end, 0);
        }
        payload[start..end].copy_from_slice(data);
        Ok(data.len() as u32)
    }

    pub fn truncate(&self, path: &str, size: u64) -> FsResult<FileAttributes> {
        debug!("truncate: path={}, size={}", path, size);
        let state = self.charged()?;
        let node = state.store.lookup(path).ok_or(FsError::NotFound)?;
        let mut guard = lock_node(&node);
        let payload = match &mut guard.payload {
            NodePayload::Regular(payload) => payload,
            _ => return Err(FsError::OperationNotPermitted),
        };
        payload.resize(size as usize, 0);
        let now = Timestamp::now();
        guard.mtime = now;
        guard.ctime = now;
        Ok(guard.attributes())
    }

    pub fn chmod(&self, path: &str, mode: u32) -> FsResult<FileAttributes> {
        debug!("chmod: path={}, mode={:#o}", path, mode);
        let state = self.charged()?;
        let node = state.store.lookup(path).ok_or(FsError::NotFound)?;
        let mut guard = lock_node(&node);
        guard.mode = (guard.mode & libc::S_IFMT) | (mode & 0o7777);
        guard.ctime = Timestamp::now();
        Ok(guard.attributes())
    }

    pub fn chown(
        &self,
        path: &str,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> FsResult<FileAttributes> {
        debug!("chown: path={}, uid={:?}, gid={:?}", path, uid, gid);
        let state = self.charged()?;
        let node = state.store.lookup(path).ok_or(FsError::NotFound)?;
        let mut guard = lock_node(&node);
        if let Some(uid) = uid {
            guard.uid = uid;
        }
        if let Some(gid) = gid {
            guard.gid = gid;
        }
        guard.ctime = Timestamp::now();
        Ok(guard.attributes())
    }

    pub fn utimens(&self, path: &str, atime: SetTime, mtime: SetTime) -> FsResult<FileAttributes> {
        debug!("utimens: path={}", path);
        let state = self.charged()?;
        let node = state.store.lookup(path).ok_or(FsError::NotFound)?;
        let mut guard = lock_node(&node);
        let now = Timestamp::now();
        match atime {
            SetTime::SetToClientTime(ts) => guard.atime = ts,
            SetTime::SetToServerTime => guard.atime = now,
            SetTime::NoChange => {}
        }
        match mtime {
            SetTime::SetToClientTime(ts) => guard.mtime = ts,
            SetTime::SetToServerTime => guard.mtime = now,
            SetTime::NoChange => {}
        }
        guard.ctime = now;
        Ok(guard.attributes())
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        debug!("unlink: path={}", path);
        let mut state = self.charged()?;
        let node = state.store.lookup(path).ok_or(FsError::NotFound)?;
        {
            let mut guard = lock_node(&node);
            if guard.is_directory() {
                return Err(FsError::OperationNotPermitted);
            }
            guard.nlink = guard.nlink.saturating_sub(1);
            guard.ctime = Timestamp::now();
        }
        state.store.erase(path);
        Ok(())
    }

    /// Move the mapping. The object (and any hard-link aliases) keeps its
    /// identity, so open handles survive the rename.
    pub fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        debug!("rename: from={}, to={}", from, to);
        let mut state = self.charged()?;
        let node = state.store.erase(from).ok_or(FsError::NotFound)?;
        state.store.insert(to.to_string(), node);
        Ok(())
    }

    pub fn link(&self, from: &str, to: &str) -> FsResult<FileAttributes> {
        debug!("link: from={}, to={}", from, to);
        let mut state = self.charged()?;
        let node = state.store.lookup(from).ok_or(FsError::NotFound)?;
        let attrs = {
            let mut guard = lock_node(&node);
            guard.nlink += 1;
            guard.ctime = Timestamp::now();
            guard.attributes()
        };
        state.store.insert(to.to_string(), node);
        Ok(attrs)
    }

    pub fn symlink(
        &self,
        creds: &Credentials,
        target: &str,
        linkpath: &str,
    ) -> FsResult<FileAttributes> {
        debug!("symlink: target={}, linkpath={}", target, linkpath);
        let mut state = self.charged()?;
        let id = state.allocate_id();
        let node = FileNode::new_symlink(id, target.as_bytes().to_vec(), creds.uid, creds.gid);
        let attrs = lock_node(&node).attributes();
        state.store.insert(linkpath.to_string(), node);
        Ok(attrs)
    }

    pub fn readlink(&self, path: &str) -> FsResult<Vec<u8>> {
        debug!("readlink: path={}", path);
        let state = self.charged()?;
        let node = state.store.lookup(path).ok_or(FsError::NotFound)?;
        let guard = lock_node(&node);
        match &guard.payload {
            NodePayload::Symlink(target) => Ok(target.clone()),
            _ => Err(FsError::InvalidArgument),
        }
    }

    /// Wipe every non-root object, telling the host kernel to forget each
    /// path by issuing real removal syscalls against the mounted tree. The
    /// engine lock is held throughout; the re-entrant requests those
    /// syscalls generate take the out-of-band short circuit at the bridge
    /// and never reach here. A removal that fails with `NotFound` counts as
    /// success: the kernel already holds no entry for that path.
    pub fn clean(&self, mount_root: &Path) -> bool {
        debug!("clean: mount_root={}", mount_root.display());
        let mut state = self.state();
        let mut ok = true;
        for (path, node) in state.store.iter_rev() {
            if path == "/" {
                continue;
            }
            let host: PathBuf = mount_root.join(&path[1..]);
            let is_dir = lock_node(node).is_directory();
            let result = if is_dir {
                std::fs::remove_dir(&host)
            } else {
                std::fs::remove_file(&host)
            };
            match result {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!("clean: failed to remove {}: {}", host.display(), err);
                    ok = false;
                }
            }
        }
        let root = state.store.lookup("/");
        state.store.clear();
        if let Some(root) = root {
            state.store.insert("/".to_string(), root);
        }
        ok
    }

    pub fn set_count(&self, count: i64) {
        debug!("set_count: count={}", count);
        self.state().budget.set(count);
    }

    pub fn get_count(&self) -> i64 {
        let count = self.state().budget.get();
        debug!("get_count: count={}", count);
        count
    }
}

impl Default for ClunkerFs {
    fn default() -> Self {
        Self::new()
    }
}
