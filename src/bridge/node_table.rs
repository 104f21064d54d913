//! Locked access to the node table.
//!
//! All table state lives behind one mutex with short critical sections:
//! hash lookups, refcount arithmetic, cached-stat compares. The mutex is
//! never held across a call into the pluggable filesystem; handlers that
//! need a filesystem round trip in the middle of a table protocol (hidden
//! name probing, open-time cache validation) re-enter through separate
//! calls.

use fuser::FileAttr;
use parking_lot::Mutex;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::locks::{self, LockRecord};
use crate::bridge::types::NodeTable;

pub(crate) struct NodeManager {
    table: Mutex<NodeTable>,
}

impl NodeManager {
    pub fn new() -> Self {
        NodeManager {
            table: Mutex::new(NodeTable::new()),
        }
    }

    /// Resolve `(parent, name)` to `(id, generation)`, creating the node
    /// if needed and counting one kernel reference. Atomic under the
    /// table mutex, so concurrent lookups of the same name converge on
    /// one node.
    pub fn find_or_create(&self, parent: u64, name: &OsStr) -> Result<(u64, u64), i32> {
        self.table.lock().find_or_create(parent, name)
    }

    pub fn forget(&self, id: u64, nlookup: u64) {
        self.table.lock().forget(id, nlookup);
    }

    pub fn remove_by_name(&self, parent: u64, name: &OsStr) {
        self.table.lock().remove_by_name(parent, name);
    }

    pub fn rename(
        &self,
        olddir: u64,
        oldname: &OsStr,
        newdir: u64,
        newname: &OsStr,
        hide: bool,
    ) -> Result<(), i32> {
        self.table.lock().rename(olddir, oldname, newdir, newname, hide)
    }

    pub fn exchange(&self, olddir: u64, oldname: &OsStr, newdir: u64, newname: &OsStr) {
        self.table.lock().exchange(olddir, oldname, newdir, newname);
    }

    pub fn path_of(&self, id: u64) -> Option<PathBuf> {
        self.table.lock().path_of_name(id, None)
    }

    pub fn path_of_name(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.table.lock().path_of_name(parent, Some(name))
    }

    pub fn lookup_child(&self, parent: u64, name: &OsStr) -> Option<u64> {
        self.table.lock().lookup_child(parent, name)
    }

    pub fn is_open(&self, parent: u64, name: &OsStr) -> bool {
        let table = self.table.lock();
        match table.lookup_child(parent, name) {
            Some(id) => table.get(id).open_count > 0,
            None => false,
        }
    }

    pub fn inc_open(&self, id: u64) {
        self.table.lock().get_mut(id).open_count += 1;
    }

    /// Drop one open handle. Returns true when this was the last handle
    /// on a hidden node; the caller then owes the deferred unlink. The
    /// hidden flag is cleared here so exactly one caller sees true.
    pub fn release_open(&self, id: u64) -> bool {
        let mut table = self.table.lock();
        let node = table.get_mut(id);
        assert!(
            node.open_count > 0,
            "pathfuse internal error: open count underflow on node {}",
            id
        );
        node.open_count -= 1;
        if node.is_hidden && node.open_count == 0 {
            node.is_hidden = false;
            true
        } else {
            false
        }
    }

    pub fn update_stat(&self, id: u64, attr: &FileAttr) {
        self.table.lock().update_stat(id, attr);
    }

    /// Cached-attribute state for the open-time cache decision:
    /// `(cache_valid, age of last observation)`. `None` if the node is
    /// gone.
    pub fn cache_probe(&self, id: u64) -> Option<(bool, Duration)> {
        let mut table = self.table.lock();
        table
            .get_opt_mut(id)
            .map(|node| (node.cache_valid, node.stat_updated.elapsed()))
    }

    pub fn set_cache_valid(&self, id: u64, valid: bool) {
        let mut table = self.table.lock();
        if let Some(node) = table.get_opt_mut(id) {
            node.cache_valid = valid;
        }
    }

    pub fn hidden_candidate(&self, dir: u64, oldname: &OsStr) -> Option<OsString> {
        self.table.lock().hidden_candidate(dir, oldname)
    }

    pub fn locks_conflict(&self, id: u64, probe: &LockRecord) -> Option<LockRecord> {
        locks::find_conflict(&self.table.lock().get(id).locks, probe)
    }

    pub fn locks_insert(&self, id: u64, lock: LockRecord) {
        locks::insert(&mut self.table.lock().get_mut(id).locks, lock);
    }
}
