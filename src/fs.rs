//! The pluggable filesystem interface.
//!
//! A [`PathFilesystem`] supplies the actual filesystem semantics; the
//! bridge resolves kernel node ids to paths and calls these methods. Every
//! operation is optional: the default implementations return `ENOSYS`,
//! which the dispatcher treats as "operation not supported" (with a few
//! documented fallbacks, e.g. `fgetattr` delegating to `getattr`).
//!
//! Errors are plain `libc` errno values, following the FUSE convention of
//! one integer per failure kind. [`crate::bridge::convert::io_error_to_errno`]
//! maps `std::io::Error` for implementations built on real I/O.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fuser::FileAttr;

use crate::bridge::interrupt::CancelToken;
use crate::bridge::locks::LockRecord;

/// Result of one filesystem operation: `Err` carries an errno value.
pub type OpResult<T> = std::result::Result<T, i32>;

/// Per-request caller identity and cancellation state, threaded explicitly
/// into every dispatcher handler and filesystem call.
#[derive(Debug, Clone)]
pub struct RequestCtx {
    /// Kernel-assigned id of the request, used for interrupt delivery.
    pub unique: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    token: CancelToken,
}

impl RequestCtx {
    pub fn new(unique: u64, uid: u32, gid: u32, pid: u32) -> Self {
        RequestCtx {
            unique,
            uid,
            gid,
            pid,
            token: CancelToken::new(),
        }
    }

    /// True once the kernel has cancelled the originating call. Blocking
    /// filesystem implementations should poll this (or sleep via
    /// [`CancelToken::wait_timeout`]) and bail out with `EINTR`.
    pub fn interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

/// Which fields a `setattr` request carries. Absent fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<fuser::TimeOrNow>,
    pub mtime: Option<fuser::TimeOrNow>,
    pub crtime: Option<SystemTime>,
    pub chgtime: Option<SystemTime>,
    pub bkuptime: Option<SystemTime>,
    pub flags: Option<u32>,
}

/// Filesystem statistics, in `statvfs` shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statvfs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Backup and creation timestamps for the extended-times query.
#[derive(Debug, Clone, Copy)]
pub struct XTimes {
    pub bkuptime: SystemTime,
    pub crtime: SystemTime,
}

/// Lock sub-command passed to [`PathFilesystem::lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCmd {
    /// Report a conflicting lock without acquiring anything.
    Query,
    /// Acquire or release without blocking.
    Set,
    /// Acquire, waiting for conflicting locks to clear.
    SetWait,
}

/// Entry sink for [`PathFilesystem::readdir`]. Returns `true` once the
/// reply buffer is full; the implementation should stop streaming then.
pub type DirFiller<'a> = dyn FnMut(&OsStr, Option<&FileAttr>, i64) -> bool + 'a;

/// The capability set a pluggable filesystem provides.
///
/// Handle-based operations receive the `u64` token the implementation
/// returned from `open`, `create`, or `opendir`. `release` and
/// `releasedir` may run after the object's path became unresolvable
/// (unlinked elsewhere), hence the `Option<&Path>`.
#[allow(unused_variables)]
pub trait PathFilesystem: Send + Sync + 'static {
    fn init(&self, ctx: &RequestCtx) {}
    fn destroy(&self) {}

    fn getattr(&self, ctx: &RequestCtx, path: &Path) -> OpResult<FileAttr> {
        Err(libc::ENOSYS)
    }

    /// Attribute fetch for an open file. Defaults to the path variant.
    fn fgetattr(&self, ctx: &RequestCtx, path: &Path, fh: u64) -> OpResult<FileAttr> {
        self.getattr(ctx, path)
    }

    fn readlink(&self, ctx: &RequestCtx, path: &Path) -> OpResult<PathBuf> {
        Err(libc::ENOSYS)
    }

    fn mknod(&self, ctx: &RequestCtx, path: &Path, mode: u32, rdev: u32) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn mkdir(&self, ctx: &RequestCtx, path: &Path, mode: u32) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn unlink(&self, ctx: &RequestCtx, path: &Path) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn rmdir(&self, ctx: &RequestCtx, path: &Path) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    /// Create a symbolic link at `link_path` pointing at `target`.
    fn symlink(&self, ctx: &RequestCtx, target: &Path, link_path: &Path) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn rename(&self, ctx: &RequestCtx, from: &Path, to: &Path) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn link(&self, ctx: &RequestCtx, from: &Path, to: &Path) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn chmod(&self, ctx: &RequestCtx, path: &Path, mode: u32) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn chown(
        &self,
        ctx: &RequestCtx,
        path: &Path,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn truncate(&self, ctx: &RequestCtx, path: &Path, size: u64) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    /// Truncate through an open handle. Defaults to the path variant.
    fn ftruncate(&self, ctx: &RequestCtx, path: &Path, size: u64, fh: u64) -> OpResult<()> {
        self.truncate(ctx, path, size)
    }

    fn utimens(
        &self,
        ctx: &RequestCtx,
        path: &Path,
        atime: SystemTime,
        mtime: SystemTime,
    ) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    /// Open a file, returning an opaque handle token.
    fn open(&self, ctx: &RequestCtx, path: &Path, flags: i32) -> OpResult<u64> {
        Err(libc::ENOSYS)
    }

    /// Create and open a regular file, returning an opaque handle token.
    fn create(&self, ctx: &RequestCtx, path: &Path, mode: u32, flags: i32) -> OpResult<u64> {
        Err(libc::ENOSYS)
    }

    /// Read into `buf`, returning the number of bytes produced.
    fn read(
        &self,
        ctx: &RequestCtx,
        path: &Path,
        fh: u64,
        buf: &mut [u8],
        offset: i64,
    ) -> OpResult<usize> {
        Err(libc::ENOSYS)
    }

    /// Write `data`, returning the number of bytes consumed.
    fn write(
        &self,
        ctx: &RequestCtx,
        path: &Path,
        fh: u64,
        data: &[u8],
        offset: i64,
    ) -> OpResult<usize> {
        Err(libc::ENOSYS)
    }

    fn statfs(&self, ctx: &RequestCtx, path: &Path) -> OpResult<Statvfs> {
        Err(libc::ENOSYS)
    }

    fn flush(&self, ctx: &RequestCtx, path: &Path, fh: u64, owner: u64) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn release(
        &self,
        ctx: &RequestCtx,
        path: Option<&Path>,
        fh: u64,
        flags: i32,
    ) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn fsync(&self, ctx: &RequestCtx, path: &Path, fh: u64, datasync: bool) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    /// Open a directory, returning an opaque handle token.
    fn opendir(&self, ctx: &RequestCtx, path: &Path, flags: i32) -> OpResult<u64> {
        Err(libc::ENOSYS)
    }

    /// Stream directory entries into `filler`. Implementations that track
    /// their own directory offsets pass them as the third argument;
    /// implementations without offsets pass `0` and stream the whole
    /// directory.
    fn readdir(
        &self,
        ctx: &RequestCtx,
        path: &Path,
        fh: u64,
        offset: i64,
        filler: &mut DirFiller<'_>,
    ) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn releasedir(&self, ctx: &RequestCtx, path: Option<&Path>, fh: u64) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn fsyncdir(&self, ctx: &RequestCtx, path: &Path, fh: u64, datasync: bool) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn setxattr(
        &self,
        ctx: &RequestCtx,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
    ) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn getxattr(
        &self,
        ctx: &RequestCtx,
        path: &Path,
        name: &OsStr,
        position: u32,
    ) -> OpResult<Vec<u8>> {
        Err(libc::ENOSYS)
    }

    fn listxattr(&self, ctx: &RequestCtx, path: &Path) -> OpResult<Vec<OsString>> {
        Err(libc::ENOSYS)
    }

    fn removexattr(&self, ctx: &RequestCtx, path: &Path, name: &OsStr) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn access(&self, ctx: &RequestCtx, path: &Path, mask: i32) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    /// Query, set, or clear a byte-range lock. For `Query`, a conflicting
    /// lock (or `Unlock` if the range is free) is written back through
    /// `lock`.
    fn lock(
        &self,
        ctx: &RequestCtx,
        path: &Path,
        fh: u64,
        owner: u64,
        cmd: LockCmd,
        lock: &mut LockRecord,
    ) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn bmap(&self, ctx: &RequestCtx, path: &Path, blocksize: u32, idx: u64) -> OpResult<u64> {
        Err(libc::ENOSYS)
    }

    fn setvolname(&self, ctx: &RequestCtx, name: &OsStr) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    /// Atomically exchange the objects at two paths.
    fn exchange(
        &self,
        ctx: &RequestCtx,
        path1: &Path,
        path2: &Path,
        options: u64,
    ) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn getxtimes(&self, ctx: &RequestCtx, path: &Path) -> OpResult<XTimes> {
        Err(libc::ENOSYS)
    }

    fn setbkuptime(&self, ctx: &RequestCtx, path: &Path, time: SystemTime) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn setchgtime(&self, ctx: &RequestCtx, path: &Path, time: SystemTime) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn setcrtime(&self, ctx: &RequestCtx, path: &Path, time: SystemTime) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    fn chflags(&self, ctx: &RequestCtx, path: &Path, flags: u32) -> OpResult<()> {
        Err(libc::ENOSYS)
    }
}
