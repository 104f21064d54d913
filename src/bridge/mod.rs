//! The dispatch core: resolves kernel node ids to paths, calls the
//! pluggable filesystem, and keeps the node table, attribute cache, and
//! lock lists consistent.
//!
//! Handlers run under a two-tier locking discipline. A tree-wide
//! reader/writer lock is held for the whole handler: read mode for
//! operations that only resolve paths, write mode for operations that
//! change the namespace shape (unlink, rmdir, rename, exchange), so a
//! path string resolved at the start of a handler cannot be invalidated
//! mid-flight. The node-table mutex below it covers only short critical
//! sections and is never held across a filesystem call.

pub mod convert;
pub mod dir_handle;
pub mod interrupt;
pub mod locks;
pub mod mount;
pub(crate) mod node_table;
pub(crate) mod types;

use dashmap::DashMap;
use fuser::{FileAttr, FileType, TimeOrNow};
use parking_lot::{Mutex, RwLock};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::MountOptions;
use crate::fs::{LockCmd, OpResult, PathFilesystem, RequestCtx, SetAttrRequest, Statvfs, XTimes};
use convert::empty_attr;
use dir_handle::{DirBuffer, DirHandle};
use interrupt::InterruptCoordinator;
use locks::{LockKind, LockRecord, OFFSET_MAX};
use node_table::NodeManager;
use types::UNKNOWN_INO;

/// Attempts at generating an unused hidden name before the unlink-time
/// hide gives up with a resource error.
const HIDE_NAME_ATTEMPTS: u32 = 10;

/// Successful lookup/create answer: the node identity plus attributes and
/// the cache windows the kernel may trust them for. `id == 0` is a cached
/// negative answer.
#[derive(Debug, Clone)]
pub struct EntryReply {
    pub id: u64,
    pub generation: u64,
    pub attr: FileAttr,
    pub entry_timeout: Duration,
    pub attr_timeout: Duration,
}

impl EntryReply {
    fn negative(timeout: Duration) -> EntryReply {
        EntryReply {
            id: 0,
            generation: 0,
            attr: empty_attr(),
            entry_timeout: timeout,
            attr_timeout: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttrReply {
    pub attr: FileAttr,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct OpenReply {
    pub fh: u64,
    pub direct_io: bool,
    pub keep_cache: bool,
}

#[derive(Debug, Clone)]
pub struct CreateReply {
    pub entry: EntryReply,
    pub open: OpenReply,
}

/// Extended-attribute answer: the kernel either probes for the size or
/// asks for the data.
#[derive(Debug, Clone)]
pub enum XattrReply {
    Size(u32),
    Data(Vec<u8>),
}

/// The re-entrant dispatch core. One instance per mount; safe to call
/// from any number of worker threads.
pub struct PathBridge<F: PathFilesystem> {
    fs: F,
    config: MountOptions,
    nodes: NodeManager,
    tree_lock: RwLock<()>,
    dir_handles: DashMap<u64, Arc<DirHandle>>,
    next_dh: Mutex<u64>,
    interrupts: InterruptCoordinator,
}

impl<F: PathFilesystem> PathBridge<F> {
    pub fn new(fs: F, config: MountOptions) -> Self {
        let interrupts = InterruptCoordinator::new(config.intr);
        PathBridge {
            fs,
            config,
            nodes: NodeManager::new(),
            tree_lock: RwLock::new(()),
            dir_handles: DashMap::new(),
            next_dh: Mutex::new(1),
            interrupts,
        }
    }

    pub fn options(&self) -> &MountOptions {
        &self.config
    }

    pub fn filesystem(&self) -> &F {
        &self.fs
    }

    pub fn init(&self, ctx: &RequestCtx) {
        tracing::info!("pathfuse bridge initialized");
        self.fs.init(ctx);
    }

    pub fn destroy(&self) {
        tracing::info!("pathfuse bridge destroyed");
        self.fs.destroy();
    }

    /// Cancel the in-flight request with the given kernel id, if any.
    pub fn interrupt(&self, unique: u64) {
        self.interrupts.interrupt(unique);
    }

    fn alloc_dir_handle(&self) -> u64 {
        let mut next = self.next_dh.lock();
        let id = *next;
        // Directory handles are ephemeral; wrap-around is not a concern.
        *next = next.wrapping_add(1);
        id
    }

    fn dir_handle(&self, id: u64) -> OpResult<Arc<DirHandle>> {
        self.dir_handles
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(libc::EBADF)
    }

    /// Identity and ownership overrides applied to every attribute block
    /// handed to the kernel.
    fn apply_stat_policy(&self, id: u64, attr: &mut FileAttr) {
        if !self.config.use_ino {
            attr.ino = id;
        }
        if let Some(umask) = self.config.umask {
            attr.perm = 0o777 & !(umask as u16);
        }
        if let Some(uid) = self.config.uid {
            attr.uid = uid;
        }
        if let Some(gid) = self.config.gid {
            attr.gid = gid;
        }
    }

    /// Fetch attributes for `(parent, name)`, bind the node, and build
    /// the entry answer. The common tail of lookup, create, mknod,
    /// mkdir, symlink, and link.
    fn lookup_path(
        &self,
        ctx: &RequestCtx,
        parent: u64,
        name: &OsStr,
        path: &Path,
        fh: Option<u64>,
    ) -> OpResult<EntryReply> {
        let mut attr = match fh {
            Some(fh) => self.fs.fgetattr(ctx, path, fh)?,
            None => self.fs.getattr(ctx, path)?,
        };
        let (id, generation) = self.nodes.find_or_create(parent, name)?;
        if self.config.auto_cache {
            self.nodes.update_stat(id, &attr);
        }
        self.apply_stat_policy(id, &mut attr);
        Ok(EntryReply {
            id,
            generation,
            attr,
            entry_timeout: self.config.entry_timeout,
            attr_timeout: self.config.attr_timeout,
        })
    }

    pub fn lookup(&self, ctx: &RequestCtx, parent: u64, name: &OsStr) -> OpResult<EntryReply> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of_name(parent, name).ok_or(libc::ENOENT)?;
        tracing::debug!("lookup(parent={}, name={:?}) -> {:?}", parent, name, path);
        let _intr = self.interrupts.register(ctx);
        match self.lookup_path(ctx, parent, name, &path, None) {
            Err(e) if e == libc::ENOENT && !self.config.negative_timeout.is_zero() => {
                Ok(EntryReply::negative(self.config.negative_timeout))
            }
            other => other,
        }
    }

    /// Give back kernel references. Never fails and produces no reply.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        tracing::debug!("forget(ino={}, nlookup={})", ino, nlookup);
        self.nodes.forget(ino, nlookup);
    }

    pub fn getattr(&self, ctx: &RequestCtx, ino: u64) -> OpResult<AttrReply> {
        let mut attr = {
            let _tree = self.tree_lock.read();
            let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
            tracing::trace!("getattr(ino={}) -> {:?}", ino, path);
            let _intr = self.interrupts.register(ctx);
            self.fs.getattr(ctx, &path)?
        };
        if self.config.auto_cache {
            self.nodes.update_stat(ino, &attr);
        }
        self.apply_stat_policy(ino, &mut attr);
        Ok(AttrReply {
            attr,
            timeout: self.config.attr_timeout,
        })
    }

    /// Apply the requested attribute changes field by field, each through
    /// its own filesystem call, then re-fetch attributes for the reply.
    /// Optional platform fields (flags, backup/change/creation times)
    /// tolerate a missing capability; the core fields do not.
    pub fn setattr(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        req: &SetAttrRequest,
        fh: Option<u64>,
    ) -> OpResult<AttrReply> {
        let mut attr = {
            let _tree = self.tree_lock.read();
            let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
            tracing::debug!("setattr(ino={}) -> {:?}", ino, path);
            let _intr = self.interrupts.register(ctx);
            if let Some(flags) = req.flags {
                match self.fs.chflags(ctx, &path, flags) {
                    Err(e) if e != libc::ENOSYS => return Err(e),
                    _ => {}
                }
            }
            if let Some(time) = req.bkuptime {
                match self.fs.setbkuptime(ctx, &path, time) {
                    Err(e) if e != libc::ENOSYS => return Err(e),
                    _ => {}
                }
            }
            if let Some(time) = req.chgtime {
                match self.fs.setchgtime(ctx, &path, time) {
                    Err(e) if e != libc::ENOSYS => return Err(e),
                    _ => {}
                }
            }
            if let Some(time) = req.crtime {
                match self.fs.setcrtime(ctx, &path, time) {
                    Err(e) if e != libc::ENOSYS => return Err(e),
                    _ => {}
                }
            }
            if let Some(mode) = req.mode {
                self.fs.chmod(ctx, &path, mode)?;
            }
            if req.uid.is_some() || req.gid.is_some() {
                self.fs.chown(ctx, &path, req.uid, req.gid)?;
            }
            if let Some(size) = req.size {
                match fh {
                    Some(fh) => self.fs.ftruncate(ctx, &path, size, fh)?,
                    None => self.fs.truncate(ctx, &path, size)?,
                }
            }
            if req.atime.is_some() || req.mtime.is_some() {
                let now = SystemTime::now();
                let atime = resolve_time(req.atime, now);
                let mtime = resolve_time(req.mtime, now);
                self.fs.utimens(ctx, &path, atime, mtime)?;
            }
            self.fs.getattr(ctx, &path)?
        };
        if self.config.auto_cache {
            self.nodes.update_stat(ino, &attr);
        }
        self.apply_stat_policy(ino, &mut attr);
        Ok(AttrReply {
            attr,
            timeout: self.config.attr_timeout,
        })
    }

    pub fn access(&self, ctx: &RequestCtx, ino: u64, mask: i32) -> OpResult<()> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
        tracing::debug!("access(ino={}, mask={:#o}) -> {:?}", ino, mask, path);
        let _intr = self.interrupts.register(ctx);
        self.fs.access(ctx, &path, mask)
    }

    pub fn readlink(&self, ctx: &RequestCtx, ino: u64) -> OpResult<PathBuf> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
        let _intr = self.interrupts.register(ctx);
        self.fs.readlink(ctx, &path)
    }

    pub fn mknod(
        &self,
        ctx: &RequestCtx,
        parent: u64,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> OpResult<EntryReply> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of_name(parent, name).ok_or(libc::ENOENT)?;
        tracing::debug!("mknod(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let _intr = self.interrupts.register(ctx);
        // Regular files go through create when the filesystem has it, so
        // filesystems without mknod still work.
        let mut err = libc::ENOSYS;
        if mode & libc::S_IFMT as u32 == libc::S_IFREG as u32 {
            let flags = libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY;
            match self.fs.create(ctx, &path, mode, flags) {
                Ok(fh) => {
                    let entry = self.lookup_path(ctx, parent, name, &path, Some(fh));
                    let _ = self.fs.release(ctx, Some(&path), fh, 0);
                    return entry;
                }
                Err(e) => err = e,
            }
        }
        if err == libc::ENOSYS {
            self.fs.mknod(ctx, &path, mode, rdev)?;
            return self.lookup_path(ctx, parent, name, &path, None);
        }
        Err(err)
    }

    pub fn mkdir(&self, ctx: &RequestCtx, parent: u64, name: &OsStr, mode: u32) -> OpResult<EntryReply> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of_name(parent, name).ok_or(libc::ENOENT)?;
        tracing::debug!("mkdir(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let _intr = self.interrupts.register(ctx);
        self.fs.mkdir(ctx, &path, mode)?;
        self.lookup_path(ctx, parent, name, &path, None)
    }

    pub fn unlink(&self, ctx: &RequestCtx, parent: u64, name: &OsStr) -> OpResult<()> {
        let _tree = self.tree_lock.write();
        let path = self.nodes.path_of_name(parent, name).ok_or(libc::ENOENT)?;
        tracing::debug!("unlink(parent={}, name={:?}) -> {:?}", parent, name, path);
        let _intr = self.interrupts.register(ctx);
        if !self.config.hard_remove && self.nodes.is_open(parent, name) {
            self.hide_node(ctx, &path, parent, name)
        } else {
            self.fs.unlink(ctx, &path)?;
            self.nodes.remove_by_name(parent, name);
            Ok(())
        }
    }

    pub fn rmdir(&self, ctx: &RequestCtx, parent: u64, name: &OsStr) -> OpResult<()> {
        let _tree = self.tree_lock.write();
        let path = self.nodes.path_of_name(parent, name).ok_or(libc::ENOENT)?;
        tracing::debug!("rmdir(parent={}, name={:?}) -> {:?}", parent, name, path);
        let _intr = self.interrupts.register(ctx);
        self.fs.rmdir(ctx, &path)?;
        self.nodes.remove_by_name(parent, name);
        Ok(())
    }

    pub fn symlink(
        &self,
        ctx: &RequestCtx,
        target: &Path,
        parent: u64,
        name: &OsStr,
    ) -> OpResult<EntryReply> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of_name(parent, name).ok_or(libc::ENOENT)?;
        tracing::debug!("symlink({:?} -> {:?})", path, target);
        let _intr = self.interrupts.register(ctx);
        self.fs.symlink(ctx, target, &path)?;
        self.lookup_path(ctx, parent, name, &path, None)
    }

    pub fn rename(
        &self,
        ctx: &RequestCtx,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> OpResult<()> {
        let _tree = self.tree_lock.write();
        let oldpath = self.nodes.path_of_name(parent, name).ok_or(libc::ENOENT)?;
        let newpath = self
            .nodes
            .path_of_name(newparent, newname)
            .ok_or(libc::ENOENT)?;
        tracing::debug!("rename({:?} -> {:?})", oldpath, newpath);
        let _intr = self.interrupts.register(ctx);
        if !self.config.hard_remove && self.nodes.is_open(newparent, newname) {
            self.hide_node(ctx, &newpath, newparent, newname)?;
        }
        self.fs.rename(ctx, &oldpath, &newpath)?;
        self.nodes.rename(parent, name, newparent, newname, false)
    }

    pub fn link(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
    ) -> OpResult<EntryReply> {
        let _tree = self.tree_lock.read();
        let oldpath = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
        let newpath = self
            .nodes
            .path_of_name(newparent, newname)
            .ok_or(libc::ENOENT)?;
        tracing::debug!("link({:?} -> {:?})", oldpath, newpath);
        let _intr = self.interrupts.register(ctx);
        self.fs.link(ctx, &oldpath, &newpath)?;
        self.lookup_path(ctx, newparent, newname, &newpath, None)
    }

    pub fn create(
        &self,
        ctx: &RequestCtx,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: i32,
    ) -> OpResult<CreateReply> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of_name(parent, name).ok_or(libc::ENOENT)?;
        tracing::debug!("create(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let _intr = self.interrupts.register(ctx);
        let fh = self.fs.create(ctx, &path, mode, flags)?;
        let entry = match self.lookup_path(ctx, parent, name, &path, Some(fh)) {
            Ok(entry) => {
                if entry.attr.kind != FileType::RegularFile {
                    let _ = self.fs.release(ctx, Some(&path), fh, flags);
                    self.nodes.forget(entry.id, 1);
                    return Err(libc::EIO);
                }
                entry
            }
            Err(e) => {
                let _ = self.fs.release(ctx, Some(&path), fh, flags);
                return Err(e);
            }
        };
        let open = OpenReply {
            fh,
            direct_io: self.config.direct_io,
            keep_cache: self.config.kernel_cache,
        };
        self.nodes.inc_open(entry.id);
        if ctx.interrupted() {
            // The originating syscall was cancelled; unwind the open and
            // the kernel reference that will never be forgotten.
            self.release_file(ctx, entry.id, Some(&path), fh, flags);
            self.nodes.forget(entry.id, 1);
            return Err(libc::EINTR);
        }
        Ok(CreateReply { entry, open })
    }

    pub fn open(&self, ctx: &RequestCtx, ino: u64, flags: i32) -> OpResult<OpenReply> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
        tracing::debug!("open(ino={}, flags={:#x}) -> {:?}", ino, flags, path);
        let _intr = self.interrupts.register(ctx);
        let fh = self.fs.open(ctx, &path, flags)?;
        let mut reply = OpenReply {
            fh,
            direct_io: self.config.direct_io,
            keep_cache: self.config.kernel_cache,
        };
        if self.config.auto_cache {
            self.open_auto_cache(ctx, ino, &path, fh, &mut reply);
        }
        self.nodes.inc_open(ino);
        if ctx.interrupted() {
            self.release_file(ctx, ino, Some(&path), fh, flags);
            return Err(libc::EINTR);
        }
        Ok(reply)
    }

    /// Open-time cache decision: keep the kernel cache only when the
    /// tracked size/mtime are still valid, re-validating them against the
    /// filesystem once the staleness window has passed.
    fn open_auto_cache(&self, ctx: &RequestCtx, ino: u64, path: &Path, fh: u64, reply: &mut OpenReply) {
        let Some((valid, age)) = self.nodes.cache_probe(ino) else {
            return;
        };
        if valid && age > self.config.effective_ac_attr_timeout() {
            match self.fs.fgetattr(ctx, path, fh) {
                Ok(attr) => self.nodes.update_stat(ino, &attr),
                Err(_) => self.nodes.set_cache_valid(ino, false),
            }
        }
        if let Some((valid, _)) = self.nodes.cache_probe(ino) {
            if valid {
                reply.keep_cache = true;
            }
        }
        self.nodes.set_cache_valid(ino, true);
    }

    pub fn read(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
    ) -> OpResult<Vec<u8>> {
        let mut buf = vec![0u8; size as usize];
        let n = {
            let _tree = self.tree_lock.read();
            let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
            tracing::trace!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
            let _intr = self.interrupts.register(ctx);
            self.fs.read(ctx, &path, fh, &mut buf, offset)?
        };
        if n > buf.len() {
            tracing::warn!("read produced more bytes than requested");
        }
        buf.truncate(n.min(buf.len()));
        Ok(buf)
    }

    pub fn write(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        data: &[u8],
        offset: i64,
    ) -> OpResult<u32> {
        let n = {
            let _tree = self.tree_lock.read();
            let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
            tracing::trace!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());
            let _intr = self.interrupts.register(ctx);
            self.fs.write(ctx, &path, fh, data, offset)?
        };
        if n > data.len() {
            tracing::warn!("write consumed more bytes than given");
        }
        Ok(n.min(data.len()) as u32)
    }

    pub fn flush(&self, ctx: &RequestCtx, ino: u64, fh: u64, owner: u64) -> OpResult<()> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
        tracing::debug!("flush(ino={}, fh={})", ino, fh);
        self.flush_common(ctx, ino, &path, fh, owner)
    }

    /// Flush plus the implicit unlock-everything probe. A filesystem that
    /// supports locking needs the flush round trip even without a flush
    /// operation of its own, and its locks for this owner are dropped
    /// from the node's lock list.
    fn flush_common(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        path: &Path,
        fh: u64,
        owner: u64,
    ) -> OpResult<()> {
        let _intr = self.interrupts.register(ctx);
        let flush_result = self.fs.flush(ctx, path, fh, owner);
        let mut unlock = LockRecord {
            kind: LockKind::Unlock,
            start: 0,
            end: OFFSET_MAX,
            owner,
            pid: 0,
        };
        let lock_result = self.fs.lock(ctx, path, fh, owner, LockCmd::Set, &mut unlock);
        match lock_result {
            Err(e) if e == libc::ENOSYS => flush_result,
            _ => {
                self.nodes.locks_insert(ino, unlock);
                match flush_result {
                    Err(e) if e == libc::ENOSYS => Ok(()),
                    other => other,
                }
            }
        }
    }

    pub fn release(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        flags: i32,
        lock_owner: Option<u64>,
        flush: bool,
    ) -> OpResult<()> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of(ino);
        tracing::debug!("release(ino={}, fh={}, flush={})", ino, fh, flush);
        let mut result = Ok(());
        if flush {
            if let Some(ref path) = path {
                result = match self.flush_common(ctx, ino, path, fh, lock_owner.unwrap_or(0)) {
                    Err(e) if e == libc::ENOSYS => Ok(()),
                    other => other,
                };
            }
        }
        let _intr = self.interrupts.register(ctx);
        self.release_file(ctx, ino, path.as_deref(), fh, flags);
        result
    }

    /// Release the handle and drop the open count; completes a deferred
    /// unlink if this was the last handle on a hidden node.
    fn release_file(&self, ctx: &RequestCtx, ino: u64, path: Option<&Path>, fh: u64, flags: i32) {
        let _ = self.fs.release(ctx, path, fh, flags);
        let unlink_hidden = self.nodes.release_open(ino);
        if unlink_hidden {
            if let Some(path) = path {
                let _ = self.fs.unlink(ctx, path);
            }
        }
    }

    pub fn fsync(&self, ctx: &RequestCtx, ino: u64, fh: u64, datasync: bool) -> OpResult<()> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
        tracing::debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);
        let _intr = self.interrupts.register(ctx);
        self.fs.fsync(ctx, &path, fh, datasync)
    }

    pub fn opendir(&self, ctx: &RequestCtx, ino: u64, flags: i32) -> OpResult<OpenReply> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
        tracing::debug!("opendir(ino={}) -> {:?}", ino, path);
        let _intr = self.interrupts.register(ctx);
        let fs_fh = self.fs.opendir(ctx, &path, flags)?;
        let handle = Arc::new(DirHandle {
            fs_fh,
            node: ino,
            buf: Mutex::new(DirBuffer::default()),
        });
        let id = self.alloc_dir_handle();
        self.dir_handles.insert(id, handle);
        if ctx.interrupted() {
            self.dir_handles.remove(&id);
            let _ = self.fs.releasedir(ctx, Some(&path), fs_fh);
            return Err(libc::EINTR);
        }
        Ok(OpenReply {
            fh: id,
            direct_io: false,
            keep_cache: false,
        })
    }

    /// Serve a window of serialized directory entries. Offset zero
    /// (re)fills the handle buffer from the filesystem; nonzero offsets
    /// slice the existing fill. Decode the result with
    /// [`dir_handle::DirEntryIter`].
    pub fn readdir(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
    ) -> OpResult<Vec<u8>> {
        let handle = self.dir_handle(fh)?;
        let mut buf = handle.buf.lock();
        // Directory contents must be refreshed on rewinddir.
        if offset == 0 {
            buf.filled = false;
        }
        if !buf.filled {
            self.readdir_fill(ctx, ino, &handle, &mut buf, offset, size)?;
        }
        Ok(buf.slice(offset, size as usize).to_vec())
    }

    fn readdir_fill(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        handle: &DirHandle,
        buf: &mut DirBuffer,
        offset: i64,
        size: u32,
    ) -> OpResult<()> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
        tracing::debug!("readdir(ino={}, offset={}) fill -> {:?}", ino, offset, path);
        buf.reset(size as usize);
        let _intr = self.interrupts.register(ctx);
        let use_ino = self.config.use_ino;
        let readdir_ino = self.config.readdir_ino;
        let dir_node = handle.node;
        let nodes = &self.nodes;
        let result = {
            let mut filler = |name: &OsStr, attr: Option<&FileAttr>, fs_offset: i64| -> bool {
                let mut ino_out = attr.map(|a| a.ino).unwrap_or(UNKNOWN_INO);
                let kind = attr.map(|a| a.kind).unwrap_or(FileType::RegularFile);
                if !use_ino {
                    ino_out = UNKNOWN_INO;
                    if readdir_ino {
                        ino_out = nodes.lookup_child(dir_node, name).unwrap_or(UNKNOWN_INO);
                    }
                }
                buf.push_entry(ino_out, fs_offset, kind, name)
            };
            self.fs.readdir(ctx, &path, handle.fs_fh, offset, &mut filler)
        };
        if result.is_err() {
            buf.filled = false;
        }
        result
    }

    pub fn releasedir(&self, ctx: &RequestCtx, ino: u64, fh: u64) -> OpResult<()> {
        let handle = match self.dir_handles.remove(&fh) {
            Some((_, handle)) => handle,
            None => return Err(libc::EBADF),
        };
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of(ino);
        tracing::debug!("releasedir(ino={}, fh={})", ino, fh);
        let _intr = self.interrupts.register(ctx);
        let _ = self.fs.releasedir(ctx, path.as_deref(), handle.fs_fh);
        // Wait out any reader still holding the handle buffer.
        drop(handle.buf.lock());
        Ok(())
    }

    pub fn fsyncdir(&self, ctx: &RequestCtx, ino: u64, fh: u64, datasync: bool) -> OpResult<()> {
        let handle = self.dir_handle(fh)?;
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
        let _intr = self.interrupts.register(ctx);
        self.fs.fsyncdir(ctx, &path, handle.fs_fh, datasync)
    }

    pub fn statfs(&self, ctx: &RequestCtx, ino: u64) -> OpResult<Statvfs> {
        let _tree = self.tree_lock.read();
        let path = if ino == 0 {
            PathBuf::from("/")
        } else {
            self.nodes.path_of(ino).ok_or(libc::ENOENT)?
        };
        let _intr = self.interrupts.register(ctx);
        self.fs.statfs(ctx, &path)
    }

    pub fn setxattr(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
    ) -> OpResult<()> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
        let _intr = self.interrupts.register(ctx);
        self.fs.setxattr(ctx, &path, name, value, flags, position)
    }

    pub fn getxattr(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        name: &OsStr,
        size: u32,
        position: u32,
    ) -> OpResult<XattrReply> {
        let value = {
            let _tree = self.tree_lock.read();
            let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
            let _intr = self.interrupts.register(ctx);
            self.fs.getxattr(ctx, &path, name, position)?
        };
        if size == 0 {
            Ok(XattrReply::Size(value.len() as u32))
        } else if value.len() <= size as usize {
            Ok(XattrReply::Data(value))
        } else {
            Err(libc::ERANGE)
        }
    }

    pub fn listxattr(&self, ctx: &RequestCtx, ino: u64, size: u32) -> OpResult<XattrReply> {
        let names = {
            let _tree = self.tree_lock.read();
            let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
            let _intr = self.interrupts.register(ctx);
            self.fs.listxattr(ctx, &path)?
        };
        let mut data = Vec::new();
        for name in names {
            data.extend_from_slice(name.as_encoded_bytes());
            data.push(0);
        }
        if size == 0 {
            Ok(XattrReply::Size(data.len() as u32))
        } else if data.len() <= size as usize {
            Ok(XattrReply::Data(data))
        } else {
            Err(libc::ERANGE)
        }
    }

    pub fn removexattr(&self, ctx: &RequestCtx, ino: u64, name: &OsStr) -> OpResult<()> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
        let _intr = self.interrupts.register(ctx);
        self.fs.removexattr(ctx, &path, name)
    }

    /// Lock query: answer from the in-memory lock lists when they already
    /// show a conflict, otherwise ask the filesystem.
    pub fn getlk(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        owner: u64,
        probe: LockRecord,
    ) -> OpResult<LockRecord> {
        let mut lock = LockRecord { owner, ..probe };
        tracing::debug!(
            "getlk(ino={}, owner={}, range=[{}, {}])",
            ino,
            owner,
            lock.start,
            lock.end
        );
        if let Some(conflict) = self.nodes.locks_conflict(ino, &lock) {
            return Ok(conflict);
        }
        self.lock_common(ctx, ino, fh, owner, LockCmd::Query, &mut lock)?;
        Ok(lock)
    }

    /// Acquire or release a lock through the filesystem, then mirror the
    /// result into the node's lock list.
    pub fn setlk(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        owner: u64,
        lock: LockRecord,
        sleep: bool,
    ) -> OpResult<()> {
        let mut lock = LockRecord { owner, ..lock };
        tracing::debug!(
            "setlk(ino={}, owner={}, range=[{}, {}], kind={:?})",
            ino,
            owner,
            lock.start,
            lock.end,
            lock.kind
        );
        let cmd = if sleep { LockCmd::SetWait } else { LockCmd::Set };
        self.lock_common(ctx, ino, fh, owner, cmd, &mut lock)?;
        self.nodes.locks_insert(ino, lock);
        Ok(())
    }

    fn lock_common(
        &self,
        ctx: &RequestCtx,
        ino: u64,
        fh: u64,
        owner: u64,
        cmd: LockCmd,
        lock: &mut LockRecord,
    ) -> OpResult<()> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
        let _intr = self.interrupts.register(ctx);
        self.fs.lock(ctx, &path, fh, owner, cmd, lock)
    }

    pub fn bmap(&self, ctx: &RequestCtx, ino: u64, blocksize: u32, idx: u64) -> OpResult<u64> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
        let _intr = self.interrupts.register(ctx);
        self.fs.bmap(ctx, &path, blocksize, idx)
    }

    pub fn setvolname(&self, ctx: &RequestCtx, name: &OsStr) -> OpResult<()> {
        let _tree = self.tree_lock.read();
        tracing::debug!("setvolname({:?})", name);
        let _intr = self.interrupts.register(ctx);
        self.fs.setvolname(ctx, name)
    }

    /// Atomic object exchange between two paths. The nodes keep their
    /// name bindings; only their cached attributes swap.
    pub fn exchange(
        &self,
        ctx: &RequestCtx,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        options: u64,
    ) -> OpResult<()> {
        let _tree = self.tree_lock.write();
        let oldpath = self.nodes.path_of_name(parent, name).ok_or(libc::ENOENT)?;
        let newpath = self
            .nodes
            .path_of_name(newparent, newname)
            .ok_or(libc::ENOENT)?;
        tracing::debug!("exchange({:?} <-> {:?})", oldpath, newpath);
        let _intr = self.interrupts.register(ctx);
        self.fs.exchange(ctx, &oldpath, &newpath, options)?;
        self.nodes.exchange(parent, name, newparent, newname);
        Ok(())
    }

    pub fn getxtimes(&self, ctx: &RequestCtx, ino: u64) -> OpResult<XTimes> {
        let _tree = self.tree_lock.read();
        let path = self.nodes.path_of(ino).ok_or(libc::ENOENT)?;
        let _intr = self.interrupts.register(ctx);
        self.fs.getxtimes(ctx, &path)
    }

    /// Rename the unlinked-but-open node at `(dir, name)` to a synthetic
    /// hidden name; the real unlink happens when the last handle closes.
    fn hide_node(&self, ctx: &RequestCtx, oldpath: &Path, dir: u64, name: &OsStr) -> OpResult<()> {
        let newname = self.hidden_name(ctx, dir, name)?;
        let newpath = self
            .nodes
            .path_of_name(dir, &newname)
            .ok_or(libc::EBUSY)?;
        tracing::debug!("hide {:?} -> {:?}", oldpath, newpath);
        self.fs.rename(ctx, oldpath, &newpath)?;
        self.nodes.rename(dir, name, dir, &newname, true)
    }

    /// Probe for a hidden name free both in the node table and on the
    /// filesystem. Bounded retries; exhaustion is a resource error.
    fn hidden_name(&self, ctx: &RequestCtx, dir: u64, name: &OsStr) -> OpResult<OsString> {
        for _ in 0..HIDE_NAME_ATTEMPTS {
            let candidate = self
                .nodes
                .hidden_candidate(dir, name)
                .ok_or(libc::EBUSY)?;
            let path = self
                .nodes
                .path_of_name(dir, &candidate)
                .ok_or(libc::EBUSY)?;
            match self.fs.getattr(ctx, &path) {
                // Name also taken on the backing filesystem; try the next.
                Ok(_) => continue,
                Err(e) if e == libc::ENOENT => return Ok(candidate),
                Err(_) => return Err(libc::EBUSY),
            }
        }
        tracing::error!("hidden name probing exhausted for {:?} under {}", name, dir);
        Err(libc::ENOMEM)
    }
}

fn resolve_time(time: Option<TimeOrNow>, now: SystemTime) -> SystemTime {
    match time {
        Some(TimeOrNow::SpecificTime(t)) => t,
        Some(TimeOrNow::Now) | None => now,
    }
}
