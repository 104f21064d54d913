//! Kernel transport glue: a `fuser::Filesystem` implementation that
//! forwards every callback to a [`PathBridge`], plus mount helpers.
//!
//! The bridge itself is transport-independent; this module only maps
//! request/reply shapes. Holding the `Arc<PathBridge>` elsewhere (e.g.
//! to call [`PathBridge::interrupt`]) is fine — the driver is just
//! another reference.

use fuser::{
    KernelConfig, ReplyAttr, ReplyBmap, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyLock, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use crate::bridge::dir_handle::DirEntryIter;
use crate::bridge::locks::{LockKind, LockRecord};
use crate::bridge::{OpenReply, PathBridge, XattrReply};
use crate::config::MountOptions;
use crate::error::{PathfuseError, Result};
use crate::fs::{PathFilesystem, RequestCtx, SetAttrRequest};

/// Byte budget requested from the filesystem per readdir fill.
const READDIR_WINDOW: u32 = 64 * 1024;

pub struct FuseDriver<F: PathFilesystem> {
    bridge: Arc<PathBridge<F>>,
}

impl<F: PathFilesystem> FuseDriver<F> {
    pub fn new(bridge: Arc<PathBridge<F>>) -> Self {
        FuseDriver { bridge }
    }

    pub fn bridge(&self) -> &Arc<PathBridge<F>> {
        &self.bridge
    }
}

fn ctx_of(req: &Request) -> RequestCtx {
    RequestCtx::new(req.unique(), req.uid(), req.gid(), req.pid())
}

fn open_flags(reply: &OpenReply) -> u32 {
    let mut flags = 0;
    if reply.direct_io {
        flags |= fuser::consts::FOPEN_DIRECT_IO;
    }
    if reply.keep_cache {
        flags |= fuser::consts::FOPEN_KEEP_CACHE;
    }
    flags
}

impl<F: PathFilesystem> fuser::Filesystem for FuseDriver<F> {
    fn init(
        &mut self,
        req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        self.bridge.init(&ctx_of(req));
        Ok(())
    }

    fn destroy(&mut self) {
        self.bridge.destroy();
    }

    fn lookup(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.bridge.lookup(&ctx_of(req), parent, name) {
            Ok(entry) => reply.entry(&entry.entry_timeout, &entry.attr, entry.generation),
            Err(e) => reply.error(e),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.bridge.forget(ino, nlookup);
    }

    fn getattr(&mut self, req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.bridge.getattr(&ctx_of(req), ino) {
            Ok(attr) => reply.attr(&attr.timeout, &attr.attr),
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        crtime: Option<SystemTime>,
        chgtime: Option<SystemTime>,
        bkuptime: Option<SystemTime>,
        flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttrRequest {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
            crtime,
            chgtime,
            bkuptime,
            flags,
        };
        match self.bridge.setattr(&ctx_of(req), ino, &changes, fh) {
            Ok(attr) => reply.attr(&attr.timeout, &attr.attr),
            Err(e) => reply.error(e),
        }
    }

    fn readlink(&mut self, req: &Request, ino: u64, reply: ReplyData) {
        match self.bridge.readlink(&ctx_of(req), ino) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(e),
        }
    }

    fn mknod(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        match self.bridge.mknod(&ctx_of(req), parent, name, mode, rdev) {
            Ok(entry) => reply.entry(&entry.entry_timeout, &entry.attr, entry.generation),
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        match self.bridge.mkdir(&ctx_of(req), parent, name, mode) {
            Ok(entry) => reply.entry(&entry.entry_timeout, &entry.attr, entry.generation),
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.bridge.unlink(&ctx_of(req), parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.bridge.rmdir(&ctx_of(req), parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        match self.bridge.symlink(&ctx_of(req), link, parent, name) {
            Ok(entry) => reply.entry(&entry.entry_timeout, &entry.attr, entry.generation),
            Err(e) => reply.error(e),
        }
    }

    fn rename(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        match self
            .bridge
            .rename(&ctx_of(req), parent, name, newparent, newname)
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn link(
        &mut self,
        req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        match self.bridge.link(&ctx_of(req), ino, newparent, newname) {
            Ok(entry) => reply.entry(&entry.entry_timeout, &entry.attr, entry.generation),
            Err(e) => reply.error(e),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        match self.bridge.create(&ctx_of(req), parent, name, mode, flags) {
            Ok(created) => reply.created(
                &created.entry.entry_timeout,
                &created.entry.attr,
                created.entry.generation,
                created.open.fh,
                open_flags(&created.open),
            ),
            Err(e) => reply.error(e),
        }
    }

    fn open(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.bridge.open(&ctx_of(req), ino, flags) {
            Ok(opened) => reply.opened(opened.fh, open_flags(&opened)),
            Err(e) => reply.error(e),
        }
    }

    fn read(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.bridge.read(&ctx_of(req), ino, fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn write(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.bridge.write(&ctx_of(req), ino, fh, data, offset) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e),
        }
    }

    fn flush(&mut self, req: &Request, ino: u64, fh: u64, lock_owner: u64, reply: ReplyEmpty) {
        match self.bridge.flush(&ctx_of(req), ino, fh, lock_owner) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn release(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        flags: i32,
        lock_owner: Option<u64>,
        flush: bool,
        reply: ReplyEmpty,
    ) {
        match self
            .bridge
            .release(&ctx_of(req), ino, fh, flags, lock_owner, flush)
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn fsync(&mut self, req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.bridge.fsync(&ctx_of(req), ino, fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn opendir(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.bridge.opendir(&ctx_of(req), ino, flags) {
            Ok(opened) => reply.opened(opened.fh, 0),
            Err(e) => reply.error(e),
        }
    }

    fn readdir(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match self
            .bridge
            .readdir(&ctx_of(req), ino, fh, offset, READDIR_WINDOW)
        {
            Ok(data) => {
                for entry in DirEntryIter::new(&data) {
                    if reply.add(entry.ino, entry.offset, entry.kind, &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(e),
        }
    }

    fn releasedir(&mut self, req: &Request, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.bridge.releasedir(&ctx_of(req), ino, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn fsyncdir(&mut self, req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.bridge.fsyncdir(&ctx_of(req), ino, fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn statfs(&mut self, req: &Request, ino: u64, reply: ReplyStatfs) {
        match self.bridge.statfs(&ctx_of(req), ino) {
            Ok(s) => reply.statfs(
                s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
            ),
            Err(e) => reply.error(e),
        }
    }

    fn setxattr(
        &mut self,
        req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
        reply: ReplyEmpty,
    ) {
        match self
            .bridge
            .setxattr(&ctx_of(req), ino, name, value, flags, position)
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn getxattr(&mut self, req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        match self.bridge.getxattr(&ctx_of(req), ino, name, size, 0) {
            Ok(XattrReply::Size(len)) => reply.size(len),
            Ok(XattrReply::Data(data)) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn listxattr(&mut self, req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        match self.bridge.listxattr(&ctx_of(req), ino, size) {
            Ok(XattrReply::Size(len)) => reply.size(len),
            Ok(XattrReply::Data(data)) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn removexattr(&mut self, req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.bridge.removexattr(&ctx_of(req), ino, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn access(&mut self, req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.bridge.access(&ctx_of(req), ino, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn getlk(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let Some(kind) = LockKind::from_flock_type(typ) else {
            reply.error(libc::EINVAL);
            return;
        };
        let probe = LockRecord {
            kind,
            start,
            end,
            owner: lock_owner,
            pid,
        };
        match self.bridge.getlk(&ctx_of(req), ino, fh, lock_owner, probe) {
            Ok(lock) => reply.locked(lock.start, lock.end, lock.kind.to_flock_type(), lock.pid),
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setlk(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let Some(kind) = LockKind::from_flock_type(typ) else {
            reply.error(libc::EINVAL);
            return;
        };
        let lock = LockRecord {
            kind,
            start,
            end,
            owner: lock_owner,
            pid,
        };
        match self
            .bridge
            .setlk(&ctx_of(req), ino, fh, lock_owner, lock, sleep)
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn bmap(&mut self, req: &Request, ino: u64, blocksize: u32, idx: u64, reply: ReplyBmap) {
        match self.bridge.bmap(&ctx_of(req), ino, blocksize, idx) {
            Ok(block) => reply.bmap(block),
            Err(e) => reply.error(e),
        }
    }

    #[cfg(target_os = "macos")]
    fn setvolname(&mut self, req: &Request, name: &OsStr, reply: ReplyEmpty) {
        match self.bridge.setvolname(&ctx_of(req), name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    #[cfg(target_os = "macos")]
    fn exchange(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        options: u64,
        reply: ReplyEmpty,
    ) {
        match self
            .bridge
            .exchange(&ctx_of(req), parent, name, newparent, newname, options)
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    #[cfg(target_os = "macos")]
    fn getxtimes(&mut self, req: &Request, ino: u64, reply: fuser::ReplyXTimes) {
        match self.bridge.getxtimes(&ctx_of(req), ino) {
            Ok(xtimes) => reply.xtimes(xtimes.bkuptime, xtimes.crtime),
            Err(e) => reply.error(e),
        }
    }
}

fn check_mountpoint(mountpoint: &Path) -> Result<()> {
    if !mountpoint.is_dir() {
        return Err(PathfuseError::NotADirectory(mountpoint.to_path_buf()));
    }
    Ok(())
}

fn fuser_options(fsname: &str) -> Vec<fuser::MountOption> {
    vec![
        fuser::MountOption::FSName(fsname.to_string()),
        fuser::MountOption::AutoUnmount,
    ]
}

/// Mount `fs` at `mountpoint` and serve requests until unmounted.
pub fn mount<F: PathFilesystem>(
    fs: F,
    options: MountOptions,
    mountpoint: &Path,
    fsname: &str,
) -> Result<()> {
    check_mountpoint(mountpoint)?;
    let bridge = Arc::new(PathBridge::new(fs, options));
    tracing::info!("mounting pathfuse filesystem at {}", mountpoint.display());
    fuser::mount2(FuseDriver::new(bridge), mountpoint, &fuser_options(fsname))
        .map_err(|e| PathfuseError::Mount(e.to_string()))
}

/// Mount in a background session. The mount lives until the returned
/// session is dropped; the bridge handle stays available for interrupt
/// delivery and inspection.
pub fn spawn_mount<F: PathFilesystem>(
    fs: F,
    options: MountOptions,
    mountpoint: &Path,
    fsname: &str,
) -> Result<(Arc<PathBridge<F>>, fuser::BackgroundSession)> {
    check_mountpoint(mountpoint)?;
    let bridge = Arc::new(PathBridge::new(fs, options));
    tracing::info!("mounting pathfuse filesystem at {}", mountpoint.display());
    let session = fuser::spawn_mount2(
        FuseDriver::new(Arc::clone(&bridge)),
        mountpoint,
        &fuser_options(fsname),
    )
    .map_err(|e| PathfuseError::Mount(e.to_string()))?;
    Ok((bridge, session))
}
