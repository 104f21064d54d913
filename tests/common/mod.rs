#![allow(dead_code)]

use fuser::{FileAttr, FileType};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::time::{Duration, SystemTime};

use pathfuse::{
    DirFiller, LockCmd, LockKind, LockRecord, MountOptions, OpResult, PathBridge, PathFilesystem,
    RequestCtx, Statvfs, XTimes,
};

/// Inode number the mock filesystem reports for every entry, distinct
/// from any node-table id so tests can tell which side won.
pub const MOCK_INO: u64 = 7777;

#[derive(Debug, Clone)]
pub struct MockEntry {
    pub kind: FileType,
    pub size: u64,
    pub mtime: SystemTime,
}

/// In-memory filesystem that records every call it receives.
#[derive(Default)]
pub struct MockFs {
    entries: Mutex<HashMap<PathBuf, MockEntry>>,
    xattrs: Mutex<HashMap<PathBuf, HashMap<OsString, Vec<u8>>>>,
    calls: Mutex<Vec<String>>,
    next_fh: Mutex<u64>,
    /// When set, `open` parks on the request token until cancelled (or a
    /// short timeout), emulating a slow blocking filesystem.
    block_in_open: AtomicBool,
    /// When set, `create` reports `ENOSYS` so dispatch falls back to
    /// `mknod`.
    create_unsupported: AtomicBool,
}

impl MockFs {
    pub fn new() -> Self {
        let fs = MockFs::default();
        fs.add_dir("/");
        *fs.next_fh.lock() = 1;
        fs
    }

    pub fn add_dir(&self, path: &str) {
        self.entries.lock().insert(
            PathBuf::from(path),
            MockEntry {
                kind: FileType::Directory,
                size: 0,
                mtime: SystemTime::UNIX_EPOCH,
            },
        );
    }

    pub fn add_file(&self, path: &str, size: u64) {
        self.entries.lock().insert(
            PathBuf::from(path),
            MockEntry {
                kind: FileType::RegularFile,
                size,
                mtime: SystemTime::UNIX_EPOCH,
            },
        );
    }

    pub fn set_mtime(&self, path: &str, mtime: SystemTime) {
        if let Some(entry) = self.entries.lock().get_mut(Path::new(path)) {
            entry.mtime = mtime;
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.lock().contains_key(Path::new(path))
    }

    pub fn remove_entry(&self, path: &str) {
        self.entries.lock().remove(Path::new(path));
    }

    pub fn block_next_open(&self) {
        self.block_in_open.store(true, Ordering::SeqCst);
    }

    pub fn disable_create(&self) {
        self.create_unsupported.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn alloc_fh(&self) -> u64 {
        let mut next = self.next_fh.lock();
        let fh = *next;
        *next += 1;
        fh
    }

    fn attr_of(&self, path: &Path) -> OpResult<FileAttr> {
        let entries = self.entries.lock();
        let entry = entries.get(path).ok_or(libc::ENOENT)?;
        Ok(mock_attr(entry))
    }
}

pub fn mock_attr(entry: &MockEntry) -> FileAttr {
    FileAttr {
        ino: MOCK_INO,
        size: entry.size,
        blocks: entry.size / 512,
        atime: SystemTime::UNIX_EPOCH,
        mtime: entry.mtime,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind: entry.kind,
        perm: 0o644,
        nlink: 1,
        uid: 1000,
        gid: 1000,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

impl PathFilesystem for MockFs {
    fn getattr(&self, _ctx: &RequestCtx, path: &Path) -> OpResult<FileAttr> {
        self.record(format!("getattr {}", path.display()));
        self.attr_of(path)
    }

    fn mknod(&self, _ctx: &RequestCtx, path: &Path, _mode: u32, _rdev: u32) -> OpResult<()> {
        self.record(format!("mknod {}", path.display()));
        self.add_file(path.to_str().unwrap(), 0);
        Ok(())
    }

    fn mkdir(&self, _ctx: &RequestCtx, path: &Path, _mode: u32) -> OpResult<()> {
        self.record(format!("mkdir {}", path.display()));
        self.add_dir(path.to_str().unwrap());
        Ok(())
    }

    fn unlink(&self, _ctx: &RequestCtx, path: &Path) -> OpResult<()> {
        self.record(format!("unlink {}", path.display()));
        self.entries
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or(libc::ENOENT)
    }

    fn rmdir(&self, _ctx: &RequestCtx, path: &Path) -> OpResult<()> {
        self.record(format!("rmdir {}", path.display()));
        self.entries
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or(libc::ENOENT)
    }

    fn symlink(&self, _ctx: &RequestCtx, _target: &Path, link_path: &Path) -> OpResult<()> {
        self.record(format!("symlink {}", link_path.display()));
        self.entries.lock().insert(
            link_path.to_path_buf(),
            MockEntry {
                kind: FileType::Symlink,
                size: 0,
                mtime: SystemTime::UNIX_EPOCH,
            },
        );
        Ok(())
    }

    fn readlink(&self, _ctx: &RequestCtx, path: &Path) -> OpResult<PathBuf> {
        self.record(format!("readlink {}", path.display()));
        Ok(PathBuf::from("/target"))
    }

    fn rename(&self, _ctx: &RequestCtx, from: &Path, to: &Path) -> OpResult<()> {
        self.record(format!("rename {} -> {}", from.display(), to.display()));
        let mut entries = self.entries.lock();
        let entry = entries.remove(from).ok_or(libc::ENOENT)?;
        entries.insert(to.to_path_buf(), entry);
        Ok(())
    }

    fn link(&self, _ctx: &RequestCtx, from: &Path, to: &Path) -> OpResult<()> {
        self.record(format!("link {} -> {}", from.display(), to.display()));
        let mut entries = self.entries.lock();
        let entry = entries.get(from).cloned().ok_or(libc::ENOENT)?;
        entries.insert(to.to_path_buf(), entry);
        Ok(())
    }

    fn chmod(&self, _ctx: &RequestCtx, path: &Path, mode: u32) -> OpResult<()> {
        self.record(format!("chmod {} {:o}", path.display(), mode));
        self.attr_of(path).map(|_| ())
    }

    fn chown(
        &self,
        _ctx: &RequestCtx,
        path: &Path,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> OpResult<()> {
        self.record(format!("chown {} {:?}/{:?}", path.display(), uid, gid));
        self.attr_of(path).map(|_| ())
    }

    fn truncate(&self, _ctx: &RequestCtx, path: &Path, size: u64) -> OpResult<()> {
        self.record(format!("truncate {} {}", path.display(), size));
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(path).ok_or(libc::ENOENT)?;
        entry.size = size;
        Ok(())
    }

    fn utimens(
        &self,
        _ctx: &RequestCtx,
        path: &Path,
        _atime: SystemTime,
        mtime: SystemTime,
    ) -> OpResult<()> {
        self.record(format!("utimens {}", path.display()));
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(path).ok_or(libc::ENOENT)?;
        entry.mtime = mtime;
        Ok(())
    }

    fn open(&self, ctx: &RequestCtx, path: &Path, _flags: i32) -> OpResult<u64> {
        self.record(format!("open {}", path.display()));
        if self.block_in_open.swap(false, Ordering::SeqCst) {
            ctx.token().wait_timeout(Duration::from_secs(2));
        }
        self.attr_of(path)?;
        Ok(self.alloc_fh())
    }

    fn create(&self, _ctx: &RequestCtx, path: &Path, _mode: u32, _flags: i32) -> OpResult<u64> {
        if self.create_unsupported.load(Ordering::SeqCst) {
            return Err(libc::ENOSYS);
        }
        self.record(format!("create {}", path.display()));
        self.add_file(path.to_str().unwrap(), 0);
        Ok(self.alloc_fh())
    }

    fn read(
        &self,
        _ctx: &RequestCtx,
        path: &Path,
        _fh: u64,
        buf: &mut [u8],
        offset: i64,
    ) -> OpResult<usize> {
        self.record(format!("read {} {}+{}", path.display(), offset, buf.len()));
        let entries = self.entries.lock();
        let entry = entries.get(path).ok_or(libc::ENOENT)?;
        let remaining = entry.size.saturating_sub(offset as u64) as usize;
        let n = remaining.min(buf.len());
        buf[..n].fill(b'x');
        Ok(n)
    }

    fn write(
        &self,
        _ctx: &RequestCtx,
        path: &Path,
        _fh: u64,
        data: &[u8],
        offset: i64,
    ) -> OpResult<usize> {
        self.record(format!("write {} {}+{}", path.display(), offset, data.len()));
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(path).ok_or(libc::ENOENT)?;
        entry.size = entry.size.max(offset as u64 + data.len() as u64);
        Ok(data.len())
    }

    fn statfs(&self, _ctx: &RequestCtx, path: &Path) -> OpResult<Statvfs> {
        self.record(format!("statfs {}", path.display()));
        Ok(Statvfs {
            blocks: 1000,
            bfree: 500,
            bavail: 400,
            files: 100,
            ffree: 50,
            bsize: 512,
            namelen: 255,
            frsize: 512,
        })
    }

    fn flush(&self, _ctx: &RequestCtx, path: &Path, _fh: u64, _owner: u64) -> OpResult<()> {
        self.record(format!("flush {}", path.display()));
        Ok(())
    }

    fn release(&self, _ctx: &RequestCtx, path: Option<&Path>, fh: u64, _flags: i32) -> OpResult<()> {
        match path {
            Some(path) => self.record(format!("release {}", path.display())),
            None => self.record(format!("release fh={}", fh)),
        }
        Ok(())
    }

    fn fsync(&self, _ctx: &RequestCtx, path: &Path, _fh: u64, datasync: bool) -> OpResult<()> {
        self.record(format!("fsync {} {}", path.display(), datasync));
        Ok(())
    }

    fn opendir(&self, _ctx: &RequestCtx, path: &Path, _flags: i32) -> OpResult<u64> {
        self.record(format!("opendir {}", path.display()));
        let entries = self.entries.lock();
        let entry = entries.get(path).ok_or(libc::ENOENT)?;
        if entry.kind != FileType::Directory {
            return Err(libc::ENOTDIR);
        }
        drop(entries);
        Ok(self.alloc_fh())
    }

    fn readdir(
        &self,
        _ctx: &RequestCtx,
        path: &Path,
        _fh: u64,
        _offset: i64,
        filler: &mut DirFiller<'_>,
    ) -> OpResult<()> {
        self.record(format!("readdir {}", path.display()));
        let entries = self.entries.lock();
        let mut children: Vec<(OsString, FileAttr)> = entries
            .iter()
            .filter(|(p, _)| p.parent() == Some(path))
            .map(|(p, e)| (p.file_name().unwrap().to_os_string(), mock_attr(e)))
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, attr) in children {
            if filler(&name, Some(&attr), 0) {
                break;
            }
        }
        Ok(())
    }

    fn releasedir(&self, _ctx: &RequestCtx, path: Option<&Path>, fh: u64) -> OpResult<()> {
        match path {
            Some(path) => self.record(format!("releasedir {}", path.display())),
            None => self.record(format!("releasedir fh={}", fh)),
        }
        Ok(())
    }

    fn fsyncdir(&self, _ctx: &RequestCtx, path: &Path, _fh: u64, datasync: bool) -> OpResult<()> {
        self.record(format!("fsyncdir {} {}", path.display(), datasync));
        Ok(())
    }

    fn setxattr(
        &self,
        _ctx: &RequestCtx,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
    ) -> OpResult<()> {
        self.record(format!("setxattr {} {:?}", path.display(), name));
        self.attr_of(path)?;
        self.xattrs
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .insert(name.to_os_string(), value.to_vec());
        Ok(())
    }

    fn getxattr(
        &self,
        _ctx: &RequestCtx,
        path: &Path,
        name: &OsStr,
        _position: u32,
    ) -> OpResult<Vec<u8>> {
        self.record(format!("getxattr {} {:?}", path.display(), name));
        self.xattrs
            .lock()
            .get(path)
            .and_then(|m| m.get(name).cloned())
            .ok_or(libc::ENODATA)
    }

    fn listxattr(&self, _ctx: &RequestCtx, path: &Path) -> OpResult<Vec<OsString>> {
        self.record(format!("listxattr {}", path.display()));
        let mut names: Vec<OsString> = self
            .xattrs
            .lock()
            .get(path)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    fn removexattr(&self, _ctx: &RequestCtx, path: &Path, name: &OsStr) -> OpResult<()> {
        self.record(format!("removexattr {} {:?}", path.display(), name));
        self.xattrs
            .lock()
            .get_mut(path)
            .and_then(|m| m.remove(name))
            .map(|_| ())
            .ok_or(libc::ENODATA)
    }

    fn access(&self, _ctx: &RequestCtx, path: &Path, _mask: i32) -> OpResult<()> {
        self.record(format!("access {}", path.display()));
        self.attr_of(path).map(|_| ())
    }

    fn lock(
        &self,
        _ctx: &RequestCtx,
        path: &Path,
        _fh: u64,
        _owner: u64,
        cmd: LockCmd,
        lock: &mut LockRecord,
    ) -> OpResult<()> {
        self.record(format!("lock {} {:?} {:?}", path.display(), cmd, lock.kind));
        if cmd == LockCmd::Query {
            lock.kind = LockKind::Unlock;
        }
        Ok(())
    }

    fn exchange(
        &self,
        _ctx: &RequestCtx,
        path1: &Path,
        path2: &Path,
        _options: u64,
    ) -> OpResult<()> {
        self.record(format!("exchange {} <-> {}", path1.display(), path2.display()));
        let mut entries = self.entries.lock();
        let a = entries.get(path1).cloned().ok_or(libc::ENOENT)?;
        let b = entries.get(path2).cloned().ok_or(libc::ENOENT)?;
        entries.insert(path1.to_path_buf(), b);
        entries.insert(path2.to_path_buf(), a);
        Ok(())
    }

    fn setvolname(&self, _ctx: &RequestCtx, name: &OsStr) -> OpResult<()> {
        self.record(format!("setvolname {:?}", name));
        Ok(())
    }

    fn getxtimes(&self, _ctx: &RequestCtx, path: &Path) -> OpResult<XTimes> {
        self.record(format!("getxtimes {}", path.display()));
        Ok(XTimes {
            bkuptime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
        })
    }
}

static TRACING: Once = Once::new();

/// Route bridge logs through the test harness; filter with RUST_LOG.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Bridge over a fresh mock filesystem, with `setup` run first to seed
/// the tree.
pub fn bridge_with(
    options: MountOptions,
    setup: impl FnOnce(&MockFs),
) -> PathBridge<MockFs> {
    init_tracing();
    let fs = MockFs::new();
    setup(&fs);
    let bridge = PathBridge::new(fs, options);
    bridge.filesystem().clear_calls();
    bridge
}

pub fn ctx() -> RequestCtx {
    RequestCtx::new(1, 501, 20, 4242)
}

/// Resolve `(parent, name)` and return the node id.
pub fn lookup_id(bridge: &PathBridge<MockFs>, parent: u64, name: &str) -> u64 {
    bridge
        .lookup(&ctx(), parent, OsStr::new(name))
        .unwrap_or_else(|e| panic!("lookup {} failed: {}", name, e))
        .id
}
